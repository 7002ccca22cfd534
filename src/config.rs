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

//! Configuration validation (§4.1). Pure: `validate(config)` is a
//! function of `config` alone and never touches the filesystem or spawns
//! a process. Validation always runs before any resource acquisition.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{ErrorKind, MeasurementError, Result};
use crate::model::{Direction, MeasurementConfig, Protocol};

static HOST_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-zA-Z0-9._:-]+$").unwrap());
static BANDWIDTH_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+[KMG]?$").unwrap());
static CONGESTION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_]*$").unwrap());

const MAX_BLOCK_SIZE: u32 = 134_217_728;
const MAX_PARALLEL: u32 = 128;

/// Validates a [`MeasurementConfig`], returning the first rule violated.
pub fn validate(config: &MeasurementConfig) -> Result<()> {
    if config.server.is_empty() || !is_valid_host(&config.server) {
        return Err(MeasurementError::config(
            "server",
            format!("'{}' is not a syntactically valid host", config.server),
        ));
    }
    if config.port == 0 || config.port > 65535 {
        return Err(MeasurementError::config(
            "port",
            format!("port {} out of range 1..65535", config.port),
        ));
    }
    if config.parallel == 0 || config.parallel > MAX_PARALLEL {
        return Err(MeasurementError::config(
            "parallel",
            format!("parallel {} out of range 1..128", config.parallel),
        ));
    }
    if config.duration_secs < 1 {
        return Err(MeasurementError::config("duration", "duration must be >= 1 second"));
    }
    if config.interval_secs < 1 {
        return Err(MeasurementError::config("interval", "interval must be >= 1 second"));
    }
    if config.block_size > MAX_BLOCK_SIZE {
        return Err(MeasurementError::config(
            "block_size",
            format!("block size {} exceeds maximum {}", config.block_size, MAX_BLOCK_SIZE),
        ));
    }
    if let Some(bw) = &config.bandwidth {
        if !bw.is_empty() && !BANDWIDTH_RE.is_match(bw) {
            return Err(MeasurementError::config(
                "bandwidth",
                format!("'{bw}' does not match ^\\d+[KMG]?$"),
            ));
        }
    }
    if let Some(cc) = &config.congestion {
        if !cc.is_empty() && !CONGESTION_RE.is_match(cc) {
            return Err(MeasurementError::config(
                "congestion",
                format!("'{cc}' does not match ^[a-z][a-z0-9_]*$"),
            ));
        }
    }
    if config.iperf3_bin.is_empty() {
        return Err(MeasurementError::config("iperf3_bin", "external tool path must not be empty"));
    }
    Ok(())
}

fn is_valid_host(host: &str) -> bool {
    if host.parse::<std::net::IpAddr>().is_ok() {
        return true;
    }
    HOST_RE.is_match(host)
}

/// Builds the `iperf3` argument vector for `config`, in the deterministic
/// order specified by §4.1. `congestion_supported` reflects whether the
/// probed tool version accepts `-C` on this host (§4.3).
pub fn build_args(config: &MeasurementConfig, congestion_supported: bool) -> Vec<String> {
    let mut args = vec![
        "-c".to_string(),
        config.server.clone(),
        "-p".to_string(),
        config.port.to_string(),
        "-P".to_string(),
        config.parallel.to_string(),
        "-t".to_string(),
        config.duration_secs.to_string(),
        "-i".to_string(),
        config.interval_secs.to_string(),
    ];

    if config.protocol == Protocol::Udp {
        args.push("-u".to_string());
    }
    if config.block_size > 0 {
        args.push("-l".to_string());
        args.push(config.block_size.to_string());
    }
    match config.direction {
        Direction::Reverse => args.push("-R".to_string()),
        Direction::Bidirectional => args.push("--bidir".to_string()),
        Direction::Normal => {}
    }
    if let Some(bandwidth) = &config.bandwidth {
        if !bandwidth.is_empty() {
            let per_stream = per_stream_bandwidth(bandwidth, config.parallel);
            args.push("-b".to_string());
            args.push(format!("{per_stream}"));
        }
    }
    if congestion_supported {
        if let Some(cc) = &config.congestion {
            if !cc.is_empty() {
                args.push("-C".to_string());
                args.push(cc.clone());
            }
        }
    }
    args.push("--get-server-output".to_string());
    args
}

/// Divides a `^\d+[KMG]?$` bandwidth string by the parallel stream count,
/// rounding to the nearest integer bits/sec (§4.1: "the per-stream target
/// equals total_bps / parallel, rounded to integer bits/sec"). The
/// per-stream value, not the total, is what downstream tools display and
/// log — a contract fixed by the spec to avoid ambiguity.
pub fn per_stream_bandwidth(bandwidth: &str, parallel: u32) -> u64 {
    let total_bps = parse_bandwidth_bps(bandwidth);
    let parallel = parallel.max(1) as f64;
    (total_bps as f64 / parallel).round() as u64
}

fn parse_bandwidth_bps(bandwidth: &str) -> u64 {
    let (digits, multiplier) = match bandwidth.chars().last() {
        Some('K') => (&bandwidth[..bandwidth.len() - 1], 1_000u64),
        Some('M') => (&bandwidth[..bandwidth.len() - 1], 1_000_000u64),
        Some('G') => (&bandwidth[..bandwidth.len() - 1], 1_000_000_000u64),
        _ => (bandwidth, 1u64),
    };
    digits.parse::<u64>().unwrap_or(0) * multiplier
}

/// Formats the per-stream bandwidth as a display string for echoing into
/// the result/log, e.g. `"235000000"` bits/sec with no suffix (the
/// reference emits the raw numeric value the tool itself was invoked
/// with).
pub fn per_stream_bandwidth_display(bandwidth: &str, parallel: u32) -> String {
    per_stream_bandwidth(bandwidth, parallel).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> MeasurementConfig {
        MeasurementConfig {
            server: "192.168.1.1".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn accepts_a_well_formed_config() {
        assert!(validate(&base_config()).is_ok());
    }

    #[test]
    fn rejects_port_zero() {
        let mut c = base_config();
        c.port = 0;
        assert_eq!(validate(&c).unwrap_err().kind(), ErrorKind::Config);
    }

    #[test]
    fn rejects_port_above_range() {
        let mut c = base_config();
        c.port = 65536;
        assert!(validate(&c).is_err());
    }

    #[test]
    fn rejects_parallel_zero_and_too_high() {
        let mut c = base_config();
        c.parallel = 0;
        assert!(validate(&c).is_err());
        c.parallel = 129;
        assert!(validate(&c).is_err());
    }

    #[test]
    fn rejects_out_of_range_block_size() {
        let mut c = base_config();
        c.block_size = MAX_BLOCK_SIZE + 1;
        assert!(validate(&c).is_err());
    }

    #[test]
    fn accepts_zero_block_size_as_default() {
        let mut c = base_config();
        c.block_size = 0;
        assert!(validate(&c).is_ok());
    }

    #[test]
    fn rejects_bad_bandwidth() {
        let mut c = base_config();
        c.bandwidth = Some("100X".to_string());
        assert!(validate(&c).is_err());
    }

    #[test]
    fn accepts_good_bandwidth() {
        let mut c = base_config();
        c.bandwidth = Some("100M".to_string());
        assert!(validate(&c).is_ok());
    }

    #[test]
    fn per_stream_bandwidth_divides_and_rounds() {
        assert_eq!(per_stream_bandwidth("100M", 4), 25_000_000);
        assert_eq!(per_stream_bandwidth("10M", 3), 3_333_333);
    }

    #[test]
    fn build_args_is_deterministic_and_ordered() {
        let mut c = base_config();
        c.protocol = Protocol::Udp;
        c.direction = Direction::Reverse;
        c.bandwidth = Some("100M".to_string());
        c.congestion = Some("cubic".to_string());
        let args = build_args(&c, true);
        assert_eq!(
            args,
            vec![
                "-c", "192.168.1.1", "-p", "5201", "-P", "1", "-t", "10", "-i", "1", "-u", "-R",
                "-b", "100000000", "-C", "cubic", "--get-server-output",
            ]
        );
    }

    #[test]
    fn congestion_omitted_when_unsupported() {
        let mut c = base_config();
        c.congestion = Some("cubic".to_string());
        let args = build_args(&c, false);
        assert!(!args.contains(&"-C".to_string()));
    }
}
