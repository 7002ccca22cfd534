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

//! The result model: an immutable-after-build record of one measurement,
//! plus the configuration that drives it.

use serde::{Deserialize, Serialize};

/// Transport protocol for a measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl Protocol {
    /// External-tool default block size for this protocol (§4.7 of the
    /// spec: 1460 for UDP, 131072 for TCP).
    pub fn default_block_size(self) -> u32 {
        match self {
            Protocol::Tcp => 131072,
            Protocol::Udp => 1460,
        }
    }
}

/// Traffic direction for a measurement. Reverse and Bidirectional are
/// mutually exclusive (enforced by this being a single enum rather than
/// two independent booleans).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Direction {
    #[default]
    Normal,
    Reverse,
    Bidirectional,
}

impl Direction {
    /// Expanded label used in TXT output (§4.8).
    pub fn label(self) -> &'static str {
        match self {
            Direction::Normal => "Normal",
            Direction::Reverse => "Reverse (-R)",
            Direction::Bidirectional => "Bidirectional (--bidir)",
        }
    }

    pub fn short_name(self) -> &'static str {
        match self {
            Direction::Normal => "Normal",
            Direction::Reverse => "Reverse",
            Direction::Bidirectional => "Bidirectional",
        }
    }
}

/// User-supplied parameters for one measurement (§3 of the spec).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementConfig {
    pub server: String,
    pub port: u32,
    pub parallel: u32,
    pub duration_secs: u32,
    pub interval_secs: u32,
    pub protocol: Protocol,
    pub direction: Direction,
    /// 0 means "external default"; see [`Protocol::default_block_size`].
    pub block_size: u32,
    /// Matches `^\d+[KMG]?$` when set.
    pub bandwidth: Option<String>,
    /// Matches `^[a-z][a-z0-9_]*$` when set.
    pub congestion: Option<String>,
    pub run_latency_probes: bool,
    /// Path to the `iperf3` binary; defaults to `"iperf3"`.
    pub iperf3_bin: String,
    /// Path to the `ping` binary; defaults to `"ping"`.
    pub ping_bin: String,
}

impl Default for MeasurementConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            port: 5201,
            parallel: 1,
            duration_secs: 10,
            interval_secs: 1,
            protocol: Protocol::Tcp,
            direction: Direction::Normal,
            block_size: 0,
            bandwidth: None,
            congestion: None,
            run_latency_probes: true,
            iperf3_bin: "iperf3".to_string(),
            ping_bin: "ping".to_string(),
        }
    }
}

/// One sampling window within a measurement (§3: Interval Result).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntervalResult {
    pub time_start: f64,
    pub time_end: f64,
    pub bytes: u64,
    pub bandwidth_bps: f64,
    pub retransmits: u32,
    pub packets: u32,
    pub lost_packets: u32,
    pub lost_percent: f64,
    pub jitter_ms: f64,
    pub omitted: bool,
}

/// One of N parallel streams at final summary (§3: Stream Result).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamResult {
    pub stream_id: u32,
    pub socket_id: i64,
    pub sent_bps: f64,
    pub received_bps: f64,
    pub retransmits: u32,
    pub jitter_ms: f64,
    pub packets: u32,
    pub lost_packets: u32,
    pub lost_percent: f64,
    /// true = forward direction stream, false = reverse direction stream
    /// (relevant only in bidirectional mode).
    pub sender: bool,
}

/// Baseline or loaded latency summary (§3: Latency).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub min_ms: f64,
    pub avg_ms: f64,
    pub max_ms: f64,
    pub packets_sent: u32,
    pub packets_recv: u32,
    pub loss_percent: f64,
}

/// The top-level record of one measurement (§3: Test Result).
///
/// Created empty by the Orchestrator at measurement start, mutated only
/// by the Orchestrator, and immutable thereafter — callers receive
/// `.clone()`s, never mutable references.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    // Identity
    pub timestamp: String,
    pub measurement_id: String,
    pub hostname: String,
    pub local_ip: String,
    pub ssh_peer_host: Option<String>,
    pub mode: String,
    pub tool_version: String,

    // Echoed configuration
    pub server: String,
    pub port: u32,
    pub protocol: Protocol,
    pub direction: Direction,
    pub parallel: u32,
    pub requested_duration: u32,
    pub actual_duration: f64,
    pub block_size: u32,
    /// true when the user left block size at 0 and the protocol default
    /// (§4.7) was substituted — the summary CSV leaves this column empty
    /// in that case rather than printing the substituted value.
    pub block_size_defaulted: bool,
    pub stream_bandwidth: Option<String>,
    pub congestion: Option<String>,

    // Forward-direction summary
    pub fwd_sent_bps: f64,
    pub fwd_received_bps: f64,
    pub fwd_bytes_sent: u64,
    pub fwd_bytes_received: u64,
    pub fwd_retransmits: u32,

    // UDP forward-direction quality
    pub fwd_jitter_ms: f64,
    pub fwd_lost_packets: u32,
    pub fwd_packets: u32,
    pub fwd_lost_percent: f64,

    // Reverse-direction summary (Reverse, Bidirectional)
    pub rev_sent_bps: f64,
    pub rev_received_bps: f64,
    pub rev_bytes_sent: u64,
    pub rev_bytes_received: u64,
    pub rev_retransmits: u32,
    pub rev_jitter_ms: f64,
    pub rev_lost_packets: u32,
    pub rev_packets: u32,
    pub rev_lost_percent: f64,

    pub streams: Vec<StreamResult>,
    pub intervals: Vec<IntervalResult>,
    pub reverse_intervals: Vec<IntervalResult>,

    pub baseline_latency: Option<LatencySummary>,
    pub loaded_latency: Option<LatencySummary>,

    pub error: String,
    pub interrupted: bool,
}

impl TestResult {
    pub fn sent_mbps(&self) -> f64 {
        self.fwd_sent_bps / 1_000_000.0
    }

    pub fn received_mbps(&self) -> f64 {
        self.fwd_received_bps / 1_000_000.0
    }

    /// Compares the sum of per-stream `sent_bps`/`received_bps` against
    /// the top-level summary (§4.2 "Per-stream stream verification").
    /// Returns `(sent_ok, received_ok)`. Skipped checks (UDP, or
    /// forward-only comparisons in bidirectional mode) report `true`.
    pub fn verify_stream_totals(&self) -> (bool, bool) {
        if self.protocol == Protocol::Udp {
            return (true, true);
        }
        const TOLERANCE: f64 = 0.001;

        let forward_streams: Vec<&StreamResult> = if self.direction == Direction::Bidirectional {
            self.streams.iter().filter(|s| s.sender).collect()
        } else {
            self.streams.iter().collect()
        };

        let sum_sent: f64 = forward_streams.iter().map(|s| s.sent_bps).sum();
        let sum_received: f64 = forward_streams.iter().map(|s| s.received_bps).sum();

        let sent_ok = within_relative_tolerance(sum_sent, self.fwd_sent_bps, TOLERANCE);
        let received_ok =
            within_relative_tolerance(sum_received, self.fwd_received_bps, TOLERANCE);
        (sent_ok, received_ok)
    }
}

fn within_relative_tolerance(a: f64, b: f64, tolerance: f64) -> bool {
    if b == 0.0 {
        return a == 0.0;
    }
    ((a - b) / b).abs() <= tolerance
}
