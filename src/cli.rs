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

//! The thin CLI adapter (§6, §11): flag parsing only. No validation or
//! reconciliation logic lives here — every rule lives in the core.

use std::path::PathBuf;

use clap::Parser;

use crate::model::{Direction, MeasurementConfig, Protocol};

#[derive(Debug, Parser)]
#[command(name = "iperf3-core", about = "Orchestrates iperf3 + ping measurements")]
pub struct Cli {
    /// Server to connect to.
    #[arg(short = 'c', long = "client")]
    pub server: String,

    #[arg(short = 'p', long = "port", default_value_t = 5201)]
    pub port: u32,

    #[arg(short = 'P', long = "parallel", default_value_t = 1)]
    pub parallel: u32,

    #[arg(short = 't', long = "time", default_value_t = 10)]
    pub duration_secs: u32,

    #[arg(short = 'i', long = "interval", default_value_t = 1)]
    pub interval_secs: u32,

    #[arg(short = 'u', long = "udp")]
    pub udp: bool,

    #[arg(short = 'R', long = "reverse")]
    pub reverse: bool,

    #[arg(long = "bidir")]
    pub bidir: bool,

    /// Target bandwidth, e.g. `100M`.
    #[arg(short = 'b', long = "bandwidth")]
    pub bandwidth: Option<String>,

    /// Congestion control algorithm, e.g. `cubic`.
    #[arg(short = 'C', long = "congestion")]
    pub congestion: Option<String>,

    /// Block size in bytes; 0 substitutes the protocol default.
    #[arg(short = 'l', long = "length", default_value_t = 0)]
    pub block_size: u32,

    /// Skip baseline/loaded latency probes.
    #[arg(long = "no-latency")]
    pub no_latency: bool,

    /// Remote peer to manage over SSH before measuring.
    #[arg(long = "ssh")]
    pub ssh_host: Option<String>,

    #[arg(long = "user")]
    pub ssh_user: Option<String>,

    #[arg(long = "key")]
    pub ssh_key: Option<PathBuf>,

    #[arg(long = "password")]
    pub ssh_password: Option<String>,

    #[arg(long = "ssh-port", default_value_t = 22)]
    pub ssh_port: u16,

    /// Install `iperf3` on the remote peer if missing.
    #[arg(long = "install")]
    pub install: bool,

    /// Start the remote `iperf3` server in daemon mode before measuring.
    #[arg(long = "start-server")]
    pub start_server: bool,

    /// Stop the remote `iperf3` server after measuring.
    #[arg(long = "stop-server")]
    pub stop_server: bool,

    /// `<base>` path prefix for persistence artifacts.
    #[arg(short = 'o', long = "output")]
    pub output_base: Option<PathBuf>,

    /// Path to the `iperf3` binary.
    #[arg(long = "iperf3-bin")]
    pub iperf3_bin: Option<String>,

    /// Path to the `ping` binary.
    #[arg(long = "ping-bin")]
    pub ping_bin: Option<String>,
}

impl Cli {
    /// Translates parsed flags into a [`MeasurementConfig`]; performs no
    /// validation of its own (§11 — every rule lives in `crate::config`).
    pub fn to_measurement_config(&self, default_iperf3_bin: &str, default_ping_bin: &str) -> MeasurementConfig {
        let direction = if self.bidir {
            Direction::Bidirectional
        } else if self.reverse {
            Direction::Reverse
        } else {
            Direction::Normal
        };

        MeasurementConfig {
            server: self.server.clone(),
            port: self.port,
            parallel: self.parallel,
            duration_secs: self.duration_secs,
            interval_secs: self.interval_secs,
            protocol: if self.udp { Protocol::Udp } else { Protocol::Tcp },
            direction,
            block_size: self.block_size,
            bandwidth: self.bandwidth.clone(),
            congestion: self.congestion.clone(),
            run_latency_probes: !self.no_latency,
            iperf3_bin: self.iperf3_bin.clone().unwrap_or_else(|| default_iperf3_bin.to_string()),
            ping_bin: self.ping_bin.clone().unwrap_or_else(|| default_ping_bin.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reverse_and_bidir_map_to_direction() {
        let mut cli = Cli::parse_from(["iperf3-core", "-c", "10.0.0.1", "-R"]);
        assert_eq!(cli.to_measurement_config("iperf3", "ping").direction, Direction::Reverse);
        cli.reverse = false;
        cli.bidir = true;
        assert_eq!(cli.to_measurement_config("iperf3", "ping").direction, Direction::Bidirectional);
    }

    #[test]
    fn udp_flag_maps_to_protocol() {
        let cli = Cli::parse_from(["iperf3-core", "-c", "10.0.0.1", "-u"]);
        assert_eq!(cli.to_measurement_config("iperf3", "ping").protocol, Protocol::Udp);
    }

    #[test]
    fn bin_overrides_fall_back_to_defaults() {
        let cli = Cli::parse_from(["iperf3-core", "-c", "10.0.0.1"]);
        let config = cli.to_measurement_config("/usr/bin/iperf3", "/usr/bin/ping");
        assert_eq!(config.iperf3_bin, "/usr/bin/iperf3");
        assert_eq!(config.ping_bin, "/usr/bin/ping");
    }
}
