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

//! Wire-format structs for both `iperf3` JSON modes (§6). These mirror
//! the shape of the external tool's output exactly, including its
//! inconsistent per-direction / per-side metric placement; reconciling
//! that mess into a uniform [`crate::model::TestResult`] is
//! [`super::parser`]'s job, not this module's. Optional fields use
//! `#[serde(default)]` throughout because which fields are present
//! depends on protocol, direction, and mode.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireTimestamp {
    #[serde(default)]
    pub time: String,
    #[serde(default)]
    pub timesecs: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireConnected {
    #[serde(default)]
    pub socket: i64,
    #[serde(default)]
    pub remote_host: String,
    #[serde(default)]
    pub remote_port: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireTestStart {
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub num_streams: u32,
    #[serde(default)]
    pub blksize: u64,
    #[serde(default)]
    pub duration: u64,
    #[serde(default)]
    pub reverse: u32,
    #[serde(default)]
    pub bidir: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireStart {
    #[serde(default)]
    pub connected: Vec<WireConnected>,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub timestamp: WireTimestamp,
    #[serde(default)]
    pub test_start: WireTestStart,
}

/// A `sum` / `sum_sent` / `sum_received` / `sum_*_bidir_reverse` block.
/// One struct covers all of them; the spec's metric-reconciliation rules
/// decide which instance feeds which part of the result model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireSum {
    #[serde(default)]
    pub start: f64,
    #[serde(default)]
    pub end: f64,
    #[serde(default)]
    pub seconds: f64,
    #[serde(default)]
    pub bytes: f64,
    #[serde(default)]
    pub bits_per_second: f64,
    #[serde(default)]
    pub retransmits: Option<f64>,
    #[serde(default)]
    pub omitted: bool,
    #[serde(default)]
    pub sender: bool,
    #[serde(default)]
    pub jitter_ms: Option<f64>,
    #[serde(default)]
    pub lost_packets: Option<f64>,
    #[serde(default)]
    pub packets: Option<f64>,
    #[serde(default)]
    pub lost_percent: Option<f64>,
}

impl WireSum {
    pub fn packets(&self) -> f64 {
        self.packets.unwrap_or(0.0)
    }
    pub fn lost_packets(&self) -> f64 {
        self.lost_packets.unwrap_or(0.0)
    }
    pub fn lost_percent(&self) -> f64 {
        self.lost_percent.unwrap_or(0.0)
    }
    pub fn retransmits(&self) -> u32 {
        self.retransmits.unwrap_or(0.0) as u32
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireIntervalStream {
    #[serde(default)]
    pub socket: i64,
    #[serde(default)]
    pub bits_per_second: f64,
    #[serde(default)]
    pub sender: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireInterval {
    #[serde(default)]
    pub streams: Vec<WireIntervalStream>,
    pub sum: WireSum,
    #[serde(default)]
    pub sum_bidir_reverse: Option<WireSum>,
}

/// The `udp` sub-object present on bidirectional-UDP stream entries,
/// used to tag direction positionally (§4.2 rule 5).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireUdpTag {
    #[serde(default)]
    pub sender: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireStreamSide {
    #[serde(default)]
    pub socket: i64,
    #[serde(default)]
    pub seconds: f64,
    #[serde(default)]
    pub bytes: f64,
    #[serde(default)]
    pub bits_per_second: f64,
    #[serde(default)]
    pub retransmits: Option<f64>,
    #[serde(default)]
    pub sender: bool,
    #[serde(default)]
    pub jitter_ms: Option<f64>,
    #[serde(default)]
    pub lost_packets: Option<f64>,
    #[serde(default)]
    pub packets: Option<f64>,
    #[serde(default)]
    pub lost_percent: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireEndStream {
    pub sender: WireStreamSide,
    pub receiver: WireStreamSide,
    #[serde(default)]
    pub udp: Option<WireUdpTag>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireEnd {
    #[serde(default)]
    pub streams: Vec<WireEndStream>,
    pub sum_sent: WireSum,
    pub sum_received: WireSum,
    #[serde(default)]
    pub sum_sent_bidir_reverse: Option<WireSum>,
    #[serde(default)]
    pub sum_received_bidir_reverse: Option<WireSum>,
    #[serde(default)]
    pub server_output_json: Option<Box<ServerOutputJson>>,
    #[serde(default)]
    pub server_output_text: Option<String>,
}

/// The nested document carried in `end.server_output_json` when
/// `--get-server-output` is supplied (invariant for this system, §4.2
/// rule 3).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerOutputJson {
    pub end: WireEnd,
}

/// A complete batch-mode (`-J`) document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchDocument {
    #[serde(default)]
    pub start: WireStart,
    #[serde(default)]
    pub intervals: Vec<WireInterval>,
    pub end: Option<WireEnd>,
    #[serde(default)]
    pub error: Option<String>,
}

/// One line of `--json-stream` output: `{"event": ..., "data": ...}`.
/// `data`'s shape depends on `event`; see [`super::parser`] for how each
/// is decoded.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamEventEnvelope {
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
}
