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

//! Spawns `ping`, either bounded (count) or open-ended (cancel-on-token),
//! and parses its loss/RTT summary lines (§4.4). Generalizes the same
//! `tokio::process::Command` + piped-stdout pattern used for `iperf3` in
//! [`crate::iperf::runner`].

use std::process::Stdio;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::error::{ErrorKind, MeasurementError, Result};
use crate::model::LatencySummary;

static LOSS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d+)\s+packets?\s+transmitted,\s+(\d+)\s+(?:packets?\s+)?received,\s+([\d.]+)%\s+packet loss")
        .unwrap()
});

static RTT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:round-trip|rtt)\s+min/avg/max/(?:std|m)dev\s*=\s*([\d.]+)/([\d.]+)/([\d.]+)")
        .unwrap()
});

#[async_trait]
pub trait PingRunner: Send + Sync {
    /// Bounded: runs `ping -c <count> <host>`. Tolerates partial-loss
    /// nonzero exit codes provided stdout parsed.
    async fn run(&self, bin: &str, host: &str, count: u32) -> Result<LatencySummary>;

    /// Open-ended: runs until `cancel` fires, then sends SIGINT so the
    /// child prints its summary line before exiting.
    async fn run_until_cancel(
        &self,
        bin: &str,
        host: &str,
        cancel: CancellationToken,
    ) -> Result<LatencySummary>;
}

pub struct RealPingRunner;

#[async_trait]
impl PingRunner for RealPingRunner {
    async fn run(&self, bin: &str, host: &str, count: u32) -> Result<LatencySummary> {
        let mut cmd = Command::new(bin);
        cmd.args(["-c", &count.to_string(), host]);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let output = cmd.output().await.map_err(|e| {
            MeasurementError::with_source(
                ErrorKind::Spawn,
                "ping.run",
                format!("failed to launch '{bin}'"),
                e,
            )
        })?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_summary(&stdout, "ping.run")
    }

    async fn run_until_cancel(
        &self,
        bin: &str,
        host: &str,
        cancel: CancellationToken,
    ) -> Result<LatencySummary> {
        let mut cmd = Command::new(bin);
        cmd.arg(host);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::null());

        let mut child = cmd.spawn().map_err(|e| {
            MeasurementError::with_source(
                ErrorKind::Spawn,
                "ping.run_until_cancel",
                format!("failed to launch '{bin}'"),
                e,
            )
        })?;

        cancel.cancelled().await;
        send_polite_stop(&mut child);

        let output = child.wait_with_output().await.map_err(|e| {
            MeasurementError::with_source(
                ErrorKind::Spawn,
                "ping.run_until_cancel",
                "failed waiting for ping to exit",
                e,
            )
        })?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_summary(&stdout, "ping.run_until_cancel")
    }
}

fn send_polite_stop(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGINT);
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }
}

/// Parses the loss and RTT summary lines (§4.4). Failure to parse the
/// loss line is fatal; failure to parse the RTT line is not — its
/// absence indicates 100% loss, which is acceptable (zero RTT result).
fn parse_summary(stdout: &str, operation: &str) -> Result<LatencySummary> {
    let loss_caps = LOSS_RE.captures(stdout).ok_or_else(|| {
        MeasurementError::new(
            ErrorKind::Parse,
            operation,
            "could not find packet-loss summary line in ping output",
        )
    })?;

    let packets_sent: u32 = loss_caps[1].parse().unwrap_or(0);
    let packets_recv: u32 = loss_caps[2].parse().unwrap_or(0);
    let loss_percent: f64 = loss_caps[3].parse().unwrap_or(0.0);

    let (min_ms, avg_ms, max_ms) = match RTT_RE.captures(stdout) {
        Some(rtt) => (
            rtt[1].parse().unwrap_or(0.0),
            rtt[2].parse().unwrap_or(0.0),
            rtt[3].parse().unwrap_or(0.0),
        ),
        None => (0.0, 0.0, 0.0),
    };

    Ok(LatencySummary {
        min_ms,
        avg_ms,
        max_ms,
        packets_sent,
        packets_recv,
        loss_percent,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINUX_SAMPLE: &str = "PING example.com (93.184.216.34) 56(84) bytes of data.\n\
        64 bytes from 93.184.216.34: icmp_seq=1 ttl=56 time=11.2 ms\n\
        \n\
        --- example.com ping statistics ---\n\
        4 packets transmitted, 4 received, 0% packet loss, time 3005ms\n\
        rtt min/avg/max/mdev = 10.123/11.456/12.789/0.912 ms\n";

    const MACOS_SAMPLE: &str = "PING example.com (93.184.216.34): 56 data bytes\n\
        \n\
        --- example.com ping statistics ---\n\
        4 packets transmitted, 4 packets received, 0.0% packet loss\n\
        round-trip min/avg/max/stddev = 10.123/11.456/12.789/0.912 ms\n";

    const TOTAL_LOSS_SAMPLE: &str = "PING example.com (93.184.216.34) 56(84) bytes of data.\n\
        \n\
        --- example.com ping statistics ---\n\
        4 packets transmitted, 0 received, 100% packet loss, time 3005ms\n";

    #[test]
    fn parses_linux_iputils_output() {
        let summary = parse_summary(LINUX_SAMPLE, "test").unwrap();
        assert_eq!(summary.packets_sent, 4);
        assert_eq!(summary.packets_recv, 4);
        assert_eq!(summary.loss_percent, 0.0);
        assert_eq!(summary.avg_ms, 11.456);
    }

    #[test]
    fn parses_macos_bsd_output() {
        let summary = parse_summary(MACOS_SAMPLE, "test").unwrap();
        assert_eq!(summary.packets_recv, 4);
        assert_eq!(summary.avg_ms, 11.456);
    }

    #[test]
    fn total_loss_yields_zero_rtt_not_an_error() {
        let summary = parse_summary(TOTAL_LOSS_SAMPLE, "test").unwrap();
        assert_eq!(summary.packets_recv, 0);
        assert_eq!(summary.loss_percent, 100.0);
        assert_eq!(summary.avg_ms, 0.0);
    }

    #[test]
    fn missing_loss_line_is_fatal() {
        let err = parse_summary("no useful output here", "test").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Parse);
    }
}
