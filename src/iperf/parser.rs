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

//! The metric-reconciliation pass (§4.2). This is the single place that
//! knows where the external tool hides a given metric depending on
//! direction, protocol, and mode — downstream code (persistence, the
//! formatter) only ever reads the uniform [`TestResult`] fields.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{ErrorKind, MeasurementError, Result};
use crate::model::{Direction, IntervalResult, MeasurementConfig, Protocol, StreamResult, TestResult};

use super::wire::{BatchDocument, StreamEventEnvelope, WireEnd, WireInterval, WireStart, WireSum};

/// Parses a complete batch-mode (`-J`) document into a [`TestResult`].
/// A top-level `error` string does not mask partial data — whatever was
/// parsed alongside it is preserved (§4.2 "Error semantics").
pub fn parse_batch(json: &str, config: &MeasurementConfig) -> Result<TestResult> {
    let doc: BatchDocument = serde_json::from_str(json).map_err(|e| {
        MeasurementError::with_source(ErrorKind::Parse, "parse_batch", "malformed batch JSON", e)
    })?;

    let mut result = base_result(config, &doc.start);
    if let Some(end) = &doc.end {
        apply_end(&mut result, end, config.direction);
    }
    if let Some(err) = doc.error {
        result.error = err;
    }
    Ok(result)
}

fn base_result(config: &MeasurementConfig, start: &WireStart) -> TestResult {
    let mut result = TestResult {
        server: config.server.clone(),
        port: config.port,
        protocol: config.protocol,
        direction: config.direction,
        parallel: config.parallel,
        requested_duration: config.duration_secs,
        block_size: if config.block_size > 0 {
            config.block_size
        } else {
            config.protocol.default_block_size()
        },
        block_size_defaulted: config.block_size == 0,
        congestion: config.congestion.clone(),
        tool_version: start.version.clone(),
        ..Default::default()
    };
    if let Some(connected) = start.connected.first() {
        result.ssh_peer_host = None;
        result.server = if connected.remote_host.is_empty() {
            result.server
        } else {
            connected.remote_host.clone()
        };
    }
    result
}

/// Applies an `end` block (from batch mode, or the final stream-mode
/// `end` event) onto a result-in-progress, implementing reconciliation
/// rules 1-7 of §4.2.
pub fn apply_end(result: &mut TestResult, end: &WireEnd, direction: Direction) {
    // Rule 1: actual duration.
    result.actual_duration = end.sum_sent.seconds.max(end.sum_received.seconds);

    result.fwd_sent_bps = end.sum_sent.bits_per_second;
    result.fwd_bytes_sent = end.sum_sent.bytes as u64;
    result.fwd_retransmits = end.sum_sent.retransmits();

    result.fwd_received_bps = end.sum_received.bits_per_second;
    result.fwd_bytes_received = end.sum_received.bytes as u64;

    if result.protocol == Protocol::Udp {
        // Rule 2: UDP loss source selection.
        let loss_source = if end.sum_sent.packets() > 0.0 {
            &end.sum_sent
        } else {
            &end.sum_received
        };
        result.fwd_jitter_ms = loss_source.jitter_ms.unwrap_or(0.0);
        result.fwd_lost_packets = loss_source.lost_packets() as u32;
        result.fwd_packets = loss_source.packets() as u32;
        result.fwd_lost_percent = salvage_lost_percent(loss_source);
    }

    // Rule 3 / 4: server-measured forward loss overlay.
    overlay_server_forward_loss(result, end, direction);

    if direction == Direction::Reverse || direction == Direction::Bidirectional {
        apply_reverse_summary(result, end);
    }

    result.streams = build_stream_results(end, direction, result.protocol);

    // Rule 6 fallback: recover reverse summary from stream summation when
    // the dedicated reverse sum block is absent.
    if (direction == Direction::Reverse || direction == Direction::Bidirectional)
        && end.sum_sent_bidir_reverse.is_none()
        && end.sum_received_bidir_reverse.is_none()
    {
        recover_reverse_from_streams(result);
    }
}

fn salvage_lost_percent(sum: &WireSum) -> f64 {
    // Rule 7: when the tool reports lost_percent = 0 but lost_packets > 0,
    // recompute from the raw counts.
    let packets = sum.packets();
    let lost = sum.lost_packets();
    let reported = sum.lost_percent();
    if reported == 0.0 && lost > 0.0 && packets > 0.0 {
        lost / packets * 100.0
    } else {
        reported
    }
}

fn apply_reverse_summary(result: &mut TestResult, end: &WireEnd) {
    if let Some(sent) = &end.sum_sent_bidir_reverse {
        result.rev_sent_bps = sent.bits_per_second;
        result.rev_bytes_sent = sent.bytes as u64;
        result.rev_retransmits = sent.retransmits();
    }
    if let Some(received) = &end.sum_received_bidir_reverse {
        result.rev_received_bps = received.bits_per_second;
        result.rev_bytes_received = received.bytes as u64;
    }
    if result.protocol == Protocol::Udp {
        let candidate = end
            .sum_received_bidir_reverse
            .as_ref()
            .filter(|s| s.packets() > 0.0)
            .or(end.sum_sent_bidir_reverse.as_ref());
        if let Some(sum) = candidate {
            result.rev_jitter_ms = sum.jitter_ms.unwrap_or(0.0);
            result.rev_lost_packets = sum.lost_packets() as u32;
            result.rev_packets = sum.packets() as u32;
            result.rev_lost_percent = salvage_lost_percent(sum);
        }
    }
    // Plain (non-bidirectional) Reverse mode: the client is the receiver
    // of the one and only direction, which this system still reports
    // under the "forward" fields per §3 ("Reverse-direction summary
    // present for Reverse and Bidirectional") — Reverse uses sum_sent /
    // sum_received directly (already applied above) and leaves the
    // rev_* fields at zero; only Bidirectional populates both.
}

fn recover_reverse_from_streams(result: &mut TestResult) {
    let reverse_streams: Vec<&StreamResult> = result.streams.iter().filter(|s| !s.sender).collect();
    if reverse_streams.is_empty() {
        return;
    }
    let mut sent_sum = 0.0;
    let mut received_sum = 0.0;
    let mut retransmits_sum = 0;
    for s in &reverse_streams {
        sent_sum += s.sent_bps;
        received_sum += s.received_bps;
        retransmits_sum += s.retransmits;
    }
    // Stream-mode quirk: receivers report sent_bps=0 but received_bps>0;
    // in that case received_bps *is* the reverse throughput.
    result.rev_sent_bps = if sent_sum == 0.0 && received_sum > 0.0 {
        received_sum
    } else {
        sent_sum
    };
    result.rev_received_bps = received_sum;
    result.rev_retransmits = retransmits_sum;
}

fn build_stream_results(end: &WireEnd, direction: Direction, protocol: Protocol) -> Vec<StreamResult> {
    end.streams
        .iter()
        .enumerate()
        .map(|(idx, s)| {
            // Rule 5: a stream is "forward" iff udp.sender is true in
            // bidirectional UDP; otherwise sender-side bookkeeping
            // matches the test's overall direction.
            let sender = match (&s.udp, direction, protocol) {
                (Some(udp), Direction::Bidirectional, Protocol::Udp) => udp.sender,
                _ => s.sender.sender,
            };
            let mut stream = StreamResult {
                stream_id: idx as u32,
                socket_id: s.sender.socket,
                sent_bps: s.sender.bits_per_second,
                received_bps: s.receiver.bits_per_second,
                retransmits: s.sender.retransmits.unwrap_or(0.0) as u32,
                sender,
                ..Default::default()
            };
            if protocol == Protocol::Udp {
                let loss_side = if s.sender.packets.unwrap_or(0.0) > 0.0 {
                    &s.sender
                } else {
                    &s.receiver
                };
                stream.jitter_ms = loss_side.jitter_ms.unwrap_or(0.0);
                stream.packets = loss_side.packets.unwrap_or(0.0) as u32;
                stream.lost_packets = loss_side.lost_packets.unwrap_or(0.0) as u32;
                let reported = loss_side.lost_percent.unwrap_or(0.0);
                stream.lost_percent = if reported == 0.0
                    && stream.lost_packets > 0
                    && stream.packets > 0
                {
                    stream.lost_packets as f64 / stream.packets as f64 * 100.0
                } else {
                    reported
                };
            }
            stream
        })
        .collect()
}

/// Overlays server-measured forward UDP loss (rules 3 and 4).
fn overlay_server_forward_loss(result: &mut TestResult, end: &WireEnd, direction: Direction) {
    if result.protocol != Protocol::Udp || direction == Direction::Reverse {
        return;
    }
    if let Some(server) = &end.server_output_json {
        let sr = &server.end.sum_received;
        if sr.seconds > 0.0 {
            result.fwd_received_bps = sr.bytes * 8.0 / sr.seconds;
            result.fwd_packets = sr.packets() as u32;
            result.fwd_lost_packets = sr.lost_packets() as u32;
            result.fwd_lost_percent = salvage_lost_percent(sr);
        }
        return;
    }
    if let Some(text) = &end.server_output_text {
        if let Some(parsed) = parse_server_output_text(text, direction) {
            result.fwd_received_bps = parsed.bits_per_second;
            result.fwd_packets = parsed.packets;
            result.fwd_lost_packets = parsed.lost_packets;
            result.fwd_lost_percent = parsed.lost_percent;
        }
    }
}

struct TextSummaryLine {
    bits_per_second: f64,
    lost_packets: u32,
    packets: u32,
    lost_percent: f64,
}

// Matches lines like:
//   [SUM]   0.00-10.00  sec  1.25 MBytes  1.05 Mbits/sec  3/48 (6.25%)  receiver
//   [  5][RX-S]   0.00-10.00  sec  1.25 MBytes  1.05 Mbits/sec  3/48 (6.25%)  receiver
static SERVER_TEXT_LINE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?m)^\[\s*(\S+)\](?:\[([A-Z-]+)\])?\s+[\d.]+-[\d.]+\s+sec\s+[\d.]+\s+[KMG]?Bytes\s+([\d.]+)\s+([KMG]?)bits/sec(?:\s+[\d.]+\s+ms)?\s+(\d+)/(\d+)\s+\(([\d.]+)%\)\s+receiver",
    )
    .unwrap()
});

/// Parses the `[SUM]` line (or, for single-stream tests, the per-stream
/// receiver lines) out of `server_output_text` (§4.2 rule 4). In
/// bidirectional mode forward loss comes from `[RX-S]`-tagged lines; in
/// non-bidirectional mode, from lines with no role tag.
fn parse_server_output_text(text: &str, direction: Direction) -> Option<TextSummaryLine> {
    let mut matched_sum: Option<TextSummaryLine> = None;
    let mut stream_lines: Vec<TextSummaryLine> = Vec::new();

    for caps in SERVER_TEXT_LINE_RE.captures_iter(text) {
        let id = &caps[1];
        let role = caps.get(2).map(|m| m.as_str());
        let wanted_role = if direction == Direction::Bidirectional {
            role == Some("RX-S")
        } else {
            role.is_none()
        };
        if !wanted_role {
            continue;
        }
        let rate: f64 = caps[3].parse().unwrap_or(0.0);
        let unit = &caps[4];
        let bits_per_second = scale_unit(rate, unit);
        let lost: u32 = caps[5].parse().unwrap_or(0);
        let total: u32 = caps[6].parse().unwrap_or(0);
        let pct: f64 = caps[7].parse().unwrap_or(0.0);
        let line = TextSummaryLine {
            bits_per_second,
            lost_packets: lost,
            packets: total,
            lost_percent: pct,
        };
        if id.eq_ignore_ascii_case("SUM") {
            matched_sum = Some(line);
        } else {
            stream_lines.push(line);
        }
    }

    if matched_sum.is_some() {
        return matched_sum;
    }
    if stream_lines.len() == 1 {
        return stream_lines.pop_into_single();
    }
    if !stream_lines.is_empty() {
        // Single-stream tests with no [SUM] line: sum the per-stream
        // receiver lines.
        let bits_per_second = stream_lines.iter().map(|l| l.bits_per_second).sum();
        let lost_packets = stream_lines.iter().map(|l| l.lost_packets).sum();
        let packets = stream_lines.iter().map(|l| l.packets).sum();
        let lost_percent = if packets > 0 {
            lost_packets as f64 / packets as f64 * 100.0
        } else {
            0.0
        };
        return Some(TextSummaryLine {
            bits_per_second,
            lost_packets,
            packets,
            lost_percent,
        });
    }
    None
}

fn scale_unit(value: f64, unit: &str) -> f64 {
    match unit {
        "G" => value * 1e9,
        "M" => value * 1e6,
        "K" => value * 1e3,
        _ => value,
    }
}

trait PopIntoSingle {
    fn pop_into_single(self) -> Option<TextSummaryLine>;
}
impl PopIntoSingle for Vec<TextSummaryLine> {
    fn pop_into_single(mut self) -> Option<TextSummaryLine> {
        self.pop()
    }
}

/// Accumulates `--json-stream` events into a [`TestResult`], in arrival
/// order. Interval events are appended immediately so the orchestrator's
/// callback sees them in the order the tool emitted them; the `end`
/// event finalizes summary fields via [`apply_end`].
pub struct StreamAccumulator {
    result: TestResult,
    config_direction: Direction,
}

impl StreamAccumulator {
    pub fn new(config: &MeasurementConfig) -> Self {
        let mut result = TestResult {
            server: config.server.clone(),
            port: config.port,
            protocol: config.protocol,
            direction: config.direction,
            parallel: config.parallel,
            requested_duration: config.duration_secs,
            block_size: if config.block_size > 0 {
                config.block_size
            } else {
                config.protocol.default_block_size()
            },
            block_size_defaulted: config.block_size == 0,
            congestion: config.congestion.clone(),
            ..Default::default()
        };
        result.server = config.server.clone();
        Self {
            result,
            config_direction: config.direction,
        }
    }

    /// Feeds one non-empty line of stdout. Returns the forward interval
    /// (and, for bidirectional data, the simultaneous reverse interval)
    /// appended by this line, for the caller to forward to a live-output
    /// callback.
    pub fn handle_line(
        &mut self,
        line: &str,
    ) -> Result<Option<(IntervalResult, Option<IntervalResult>)>> {
        let envelope: StreamEventEnvelope = serde_json::from_str(line).map_err(|e| {
            MeasurementError::with_source(
                ErrorKind::Parse,
                "handle_line",
                format!("malformed stream event: {line}"),
                e,
            )
        })?;
        match envelope.event.as_str() {
            "start" => {
                if let Ok(start) = serde_json::from_value::<WireStart>(envelope.data) {
                    self.result.tool_version = start.version;
                }
                Ok(None)
            }
            "interval" => {
                let interval: WireInterval = serde_json::from_value(envelope.data).map_err(|e| {
                    MeasurementError::with_source(
                        ErrorKind::Parse,
                        "handle_line",
                        "malformed interval event",
                        e,
                    )
                })?;
                let fwd = interval_result(&interval.sum);
                self.result.intervals.push(fwd.clone());
                let rev = interval.sum_bidir_reverse.as_ref().map(|sum| {
                    let r = interval_result(sum);
                    self.result.reverse_intervals.push(r.clone());
                    r
                });
                Ok(Some((fwd, rev)))
            }
            "end" => {
                let end: WireEnd = serde_json::from_value(envelope.data).map_err(|e| {
                    MeasurementError::with_source(
                        ErrorKind::Parse,
                        "handle_line",
                        "malformed end event",
                        e,
                    )
                })?;
                apply_end(&mut self.result, &end, self.config_direction);
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    /// Consumes the accumulator, returning the assembled result.
    pub fn finish(self) -> TestResult {
        self.result
    }

    /// Non-consuming access for the runner to salvage partial results on
    /// cancellation/stop before the `end` event arrived.
    pub fn partial(&self) -> TestResult {
        self.result.clone()
    }
}

fn interval_result(sum: &WireSum) -> IntervalResult {
    IntervalResult {
        time_start: sum.start,
        time_end: sum.end,
        bytes: sum.bytes as u64,
        bandwidth_bps: sum.bits_per_second,
        retransmits: sum.retransmits(),
        packets: sum.packets() as u32,
        lost_packets: sum.lost_packets() as u32,
        lost_percent: sum.lost_percent(),
        jitter_ms: sum.jitter_ms.unwrap_or(0.0),
        omitted: sum.omitted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tcp_config() -> MeasurementConfig {
        MeasurementConfig {
            server: "192.168.1.1".to_string(),
            protocol: Protocol::Tcp,
            parallel: 4,
            duration_secs: 10,
            ..Default::default()
        }
    }

    // Scenario 1 — TCP forward, 4 streams, 10s.
    #[test]
    fn scenario_1_tcp_forward_four_streams() {
        let json = r#"{
            "start": {"version": "iperf 3.17.1", "test_start": {"protocol": "TCP"}},
            "end": {
                "sum_sent": {"seconds": 10.0, "bytes": 1175000000, "bits_per_second": 940000000.0, "retransmits": 42, "sender": true},
                "sum_received": {"seconds": 10.0, "bytes": 1175000000, "bits_per_second": 940000000.0, "sender": false},
                "streams": [
                    {"sender": {"bits_per_second": 235000000.0, "retransmits": 10, "sender": true}, "receiver": {"bits_per_second": 235000000.0, "sender": false}},
                    {"sender": {"bits_per_second": 235000000.0, "retransmits": 11, "sender": true}, "receiver": {"bits_per_second": 235000000.0, "sender": false}},
                    {"sender": {"bits_per_second": 235000000.0, "retransmits": 10, "sender": true}, "receiver": {"bits_per_second": 235000000.0, "sender": false}},
                    {"sender": {"bits_per_second": 235000000.0, "retransmits": 11, "sender": true}, "receiver": {"bits_per_second": 235000000.0, "sender": false}}
                ]
            }
        }"#;
        let result = parse_batch(json, &tcp_config()).unwrap();
        assert_eq!(result.sent_mbps(), 940.0);
        assert_eq!(result.fwd_retransmits, 42);
        assert_eq!(result.streams.len(), 4);
        assert_eq!(result.verify_stream_totals(), (true, true));
        assert!(result.error.is_empty());
    }

    // Scenario 2 — UDP forward with packet loss.
    #[test]
    fn scenario_2_udp_packet_loss() {
        let mut config = tcp_config();
        config.protocol = Protocol::Udp;
        config.parallel = 1;
        let json = r#"{
            "start": {"version": "iperf 3.17.1"},
            "end": {
                "sum_sent": {"seconds": 3.0, "bytes": 393216, "bits_per_second": 1048576.0, "lost_packets": 3, "packets": 48, "lost_percent": 6.25, "jitter_ms": 0.025, "sender": true},
                "sum_received": {"seconds": 0.0, "bytes": 0, "bits_per_second": 0.0, "sender": false},
                "streams": [
                    {"sender": {"bits_per_second": 1048576.0, "lost_packets": 3, "packets": 48, "lost_percent": 6.25, "jitter_ms": 0.025, "sender": true}, "receiver": {"bits_per_second": 1048576.0, "sender": false}}
                ]
            }
        }"#;
        let result = parse_batch(json, &config).unwrap();
        assert_eq!(result.fwd_jitter_ms, 0.025);
        assert_eq!(result.fwd_lost_packets, 3);
        assert_eq!(result.fwd_packets, 48);
        assert!((result.fwd_lost_percent - 6.25).abs() < 1e-9);
    }

    // Scenario 3 — Reverse TCP.
    #[test]
    fn scenario_3_reverse_tcp() {
        let mut config = tcp_config();
        config.direction = Direction::Reverse;
        let json = r#"{
            "start": {"version": "iperf 3.17.1"},
            "end": {
                "sum_sent": {"seconds": 0.0, "bytes": 0, "bits_per_second": 0.0, "sender": true},
                "sum_received": {"seconds": 10.0, "bytes": 375000000, "bits_per_second": 300000000.0, "sender": false},
                "streams": []
            }
        }"#;
        let result = parse_batch(json, &config).unwrap();
        assert_eq!(result.actual_duration, 10.0);
        assert_eq!(result.received_mbps(), 300.0);
        assert_eq!(result.direction, Direction::Reverse);
    }

    // Scenario 4 — Bidirectional TCP stream mode, partial data.
    #[test]
    fn scenario_4_bidirectional_stream_mode_partial() {
        let mut config = tcp_config();
        config.direction = Direction::Bidirectional;
        let mut acc = StreamAccumulator::new(&config);
        acc.handle_line(r#"{"event":"start","data":{"version":"iperf 3.17.1"}}"#).unwrap();
        for i in 0..3 {
            let start = i as f64;
            let line = format!(
                r#"{{"event":"interval","data":{{"sum":{{"start":{start},"end":{end},"seconds":1.0,"bytes":100,"bits_per_second":800.0,"sender":true}},"sum_bidir_reverse":{{"start":{start},"end":{end},"seconds":1.0,"bytes":90,"bits_per_second":720.0,"sender":false}}}}}}"#,
                start = start,
                end = start + 1.0
            );
            acc.handle_line(&line).unwrap();
        }
        let end_json = r#"{"event":"end","data":{
            "sum_sent": {"seconds": 3.0, "bytes": 300, "bits_per_second": 800.0, "sender": true},
            "sum_received": {"seconds": 3.0, "bytes": 270, "bits_per_second": 720.0, "sender": false},
            "streams": [
                {"sender": {"bits_per_second": 0.0, "sender": false}, "receiver": {"bits_per_second": 240000000.0, "sender": false}},
                {"sender": {"bits_per_second": 0.0, "sender": false}, "receiver": {"bits_per_second": 232000000.0, "sender": false}}
            ]
        }}"#;
        acc.handle_line(end_json).unwrap();
        let result = acc.finish();
        assert_eq!(result.rev_sent_bps, 472_000_000.0);
        assert_eq!(result.intervals.len(), 3);
        assert_eq!(result.reverse_intervals.len(), 3);
    }

    #[test]
    fn udp_lost_percent_salvage() {
        let mut config = tcp_config();
        config.protocol = Protocol::Udp;
        let json = r#"{
            "start": {},
            "end": {
                "sum_sent": {"seconds": 1.0, "bytes": 100, "bits_per_second": 800.0, "lost_packets": 5, "packets": 100, "lost_percent": 0.0, "sender": true},
                "sum_received": {"seconds": 0.0, "bytes": 0, "bits_per_second": 0.0, "sender": false},
                "streams": []
            }
        }"#;
        let result = parse_batch(json, &config).unwrap();
        assert!((result.fwd_lost_percent - 5.0).abs() < 1e-9);
    }

    #[test]
    fn tool_reported_error_preserves_partial_data() {
        let json = r#"{
            "start": {"version": "iperf 3.17.1"},
            "end": {
                "sum_sent": {"seconds": 5.0, "bytes": 100, "bits_per_second": 500.0, "sender": true},
                "sum_received": {"seconds": 5.0, "bytes": 100, "bits_per_second": 500.0, "sender": false},
                "streams": []
            },
            "error": "unable to connect to server"
        }"#;
        let result = parse_batch(json, &tcp_config()).unwrap();
        assert_eq!(result.error, "unable to connect to server");
        assert_eq!(result.actual_duration, 5.0);
    }

    #[test]
    fn server_output_text_fallback_parses_sum_line() {
        let mut config = tcp_config();
        config.protocol = Protocol::Udp;
        let text = "[SUM]   0.00-10.00  sec  1.25 MBytes  1.05 Mbits/sec  3/48 (6.25%)  receiver\n";
        let parsed = parse_server_output_text(text, Direction::Normal).unwrap();
        assert_eq!(parsed.lost_packets, 3);
        assert_eq!(parsed.packets, 48);
        assert!((parsed.lost_percent - 6.25).abs() < 1e-9);
    }
}
