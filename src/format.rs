//! # iperf3-core
//!
//! Orchestrates iperf3 + ping measurements, manages a remote iperf3 peer
//! over SSH, and persists historical results.

// Copyright (c) 2025 Jak Bracegirdle
//
// This file is part of the iperf3-core crate.
//
// Licensed under the Apache License, Version 2.0 <http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Pure human-readable rendering (§4.9), shared between the live-output
//! channel and the TXT persistence block (§4.8). No I/O, no mutable
//! state: identical inputs produce identical output, byte for byte.

use std::fmt::Write as _;

use crate::model::{Direction, Protocol, TestResult};

/// Renders the Summary section used both by the live display and the
/// TXT block writer.
pub fn format_summary(result: &TestResult) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Sent:            {:.2} Mbps", result.sent_mbps());
    let _ = writeln!(out, "Received:        {:.2} Mbps", result.received_mbps());
    let _ = writeln!(out, "Retransmits:     {}", result.fwd_retransmits);

    if result.protocol == Protocol::Udp {
        let _ = writeln!(
            out,
            "Packet Loss:     {}/{} ({:.2}%)",
            result.fwd_lost_packets, result.fwd_packets, result.fwd_lost_percent
        );
        let _ = writeln!(out, "Jitter:          {:.3} ms", result.fwd_jitter_ms);
    }

    if result.direction == Direction::Reverse || result.direction == Direction::Bidirectional {
        let _ = writeln!(out, "Reverse Sent:    {:.2} Mbps", result.rev_sent_bps / 1_000_000.0);
        let _ = writeln!(
            out,
            "Reverse Recv:    {:.2} Mbps",
            result.rev_received_bps / 1_000_000.0
        );
        if result.protocol == Protocol::Udp {
            let _ = writeln!(
                out,
                "Reverse Loss:    {}/{} ({:.2}%)",
                result.rev_lost_packets, result.rev_packets, result.rev_lost_percent
            );
        }
    }

    if !result.error.is_empty() {
        let _ = writeln!(out, "Error:           {}", result.error);
    } else if result.interrupted {
        let _ = writeln!(out, "Status:          Interrupted");
    }

    out
}

/// Renders the Per-Stream Results section (only meaningful when
/// `parallel > 1`, per §4.8, but callers decide whether to include it).
pub fn format_per_stream(result: &TestResult) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{:<6}{:>14}{:>14}{:>14}", "Strm", "Sent Mbps", "Recv Mbps", "Retrans");
    for stream in &result.streams {
        let _ = writeln!(
            out,
            "{:<6}{:>14.2}{:>14.2}{:>14}",
            stream.stream_id,
            stream.sent_bps / 1_000_000.0,
            stream.received_bps / 1_000_000.0,
            stream.retransmits
        );
    }
    out
}

/// Renders the optional Latency Analysis section: baseline, under load,
/// and the computed increase and percentage.
pub fn format_latency_analysis(result: &TestResult) -> Option<String> {
    let baseline = result.baseline_latency.as_ref()?;
    let loaded = result.loaded_latency.as_ref()?;
    let increase_ms = loaded.avg_ms - baseline.avg_ms;
    let increase_pct = if baseline.avg_ms > 0.0 {
        increase_ms / baseline.avg_ms * 100.0
    } else {
        0.0
    };

    let mut out = String::new();
    let _ = writeln!(out, "Latency Analysis:");
    let _ = writeln!(
        out,
        "  Baseline:      min {:.3} ms / avg {:.3} ms / max {:.3} ms",
        baseline.min_ms, baseline.avg_ms, baseline.max_ms
    );
    let _ = writeln!(
        out,
        "  Under Load:    min {:.3} ms / avg {:.3} ms / max {:.3} ms",
        loaded.min_ms, loaded.avg_ms, loaded.max_ms
    );
    let _ = writeln!(out, "  Increase:      {:.3} ms ({:.1}%)", increase_ms, increase_pct);
    Some(out)
}

/// The fixed 90-character divider framing each TXT-block measurement.
pub const DIVIDER: &str =
    "==========================================================================================";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StreamResult;

    #[test]
    fn divider_is_exactly_ninety_chars() {
        assert_eq!(DIVIDER.chars().count(), 90);
    }

    #[test]
    fn format_is_pure_and_deterministic() {
        let mut r = TestResult::default();
        r.fwd_sent_bps = 940_000_000.0;
        r.fwd_received_bps = 940_000_000.0;
        r.fwd_retransmits = 42;
        assert_eq!(format_summary(&r), format_summary(&r));
        assert!(format_summary(&r).contains("Sent:            940.00 Mbps"));
        assert!(format_summary(&r).contains("Retransmits:     42"));
    }

    #[test]
    fn format_udp_includes_packet_loss() {
        let mut r = TestResult::default();
        r.protocol = Protocol::Udp;
        r.fwd_lost_packets = 3;
        r.fwd_packets = 48;
        r.fwd_lost_percent = 6.25;
        assert!(format_summary(&r).contains("Packet Loss:     3/48 (6.25%)"));
    }

    #[test]
    fn per_stream_only_meaningful_with_streams_present() {
        let mut r = TestResult::default();
        r.streams = vec![StreamResult {
            stream_id: 0,
            sent_bps: 235_000_000.0,
            received_bps: 235_000_000.0,
            ..Default::default()
        }];
        assert!(format_per_stream(&r).contains("235.00"));
    }

    #[test]
    fn latency_analysis_absent_without_both_summaries() {
        let r = TestResult::default();
        assert!(format_latency_analysis(&r).is_none());
    }
}
