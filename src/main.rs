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

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use iperf3_core::cli::Cli;
use iperf3_core::format::{format_per_stream, format_summary};
use iperf3_core::iperf::RealToolRunner;
use iperf3_core::orchestrator::{Orchestrator, RemoteControl};
use iperf3_core::persistence::{MeasurementIdAllocator, Persistence};
use iperf3_core::ping::RealPingRunner;
use iperf3_core::ssh::{RemoteLifecycle, SshClient, SshConfig};
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    init_logging();

    let cli = Cli::parse();
    let default_iperf3_bin = std::env::var("IPERF3_BIN").unwrap_or_else(|_| "iperf3".to_string());
    let default_ping_bin = std::env::var("PING_BIN").unwrap_or_else(|_| "ping".to_string());
    let config = cli.to_measurement_config(&default_iperf3_bin, &default_ping_bin);

    let output_base = cli
        .output_base
        .clone()
        .or_else(|| std::env::var("OUTPUT_BASE").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("iperf3"));

    let remote = match build_remote(&cli).await {
        Ok(remote) => remote,
        Err(e) => {
            error!(error = %e, "remote peer setup failed");
            std::process::exit(1);
        }
    };

    let orchestrator = Orchestrator::new(
        Arc::new(RealToolRunner::new()),
        Arc::new(RealPingRunner),
        Arc::new(MeasurementIdAllocator::new()),
        Persistence::new(output_base),
    );

    let cancel = CancellationToken::new();
    let cancel_for_signal = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        cancel_for_signal.cancel();
    });

    let on_interval = Box::new(|fwd, _rev| {
        tracing::info!(
            target: "iperf3_core::iperf",
            bandwidth_mbps = fwd_bandwidth_mbps(&fwd),
            "interval"
        );
    });

    let result = orchestrator.run_measurement(config, cancel, remote.as_ref().map(|r| r.clone() as Arc<dyn RemoteControl>), on_interval).await;

    if let Some(remote) = &remote {
        if cli.stop_server {
            if let Err(e) = remote.stop().await {
                error!(error = %e, "failed to stop remote server");
            }
        }
    }

    match result {
        Ok(test_result) => {
            println!("{}", format_summary(&test_result));
            if test_result.parallel > 1 {
                println!("{}", format_per_stream(&test_result));
            }
            std::process::exit(0);
        }
        Err(e) => {
            eprintln!("{}: {}", e.kind(), e);
            std::process::exit(1);
        }
    }
}

fn fwd_bandwidth_mbps(interval: &iperf3_core::model::IntervalResult) -> f64 {
    interval.bandwidth_bps / 1_000_000.0
}

async fn build_remote(cli: &Cli) -> iperf3_core::Result<Option<Arc<RemoteLifecycle>>> {
    let Some(host) = cli.ssh_host.clone() else {
        return Ok(None);
    };

    let ssh_config = SshConfig {
        host: host.clone(),
        port: cli.ssh_port,
        user: cli.ssh_user.clone().unwrap_or_default(),
        key_path: cli.ssh_key.clone(),
        password: cli.ssh_password.clone(),
    };
    let client = SshClient::connect(&ssh_config).await?;
    let remote = Arc::new(RemoteLifecycle::new(client, host));

    let os = remote.detect_os().await;
    if cli.install && !remote.is_installed(os).await {
        remote.install(os).await?;
    }
    if cli.start_server {
        remote.start(cli.port).await?;
    }
    Ok(Some(remote))
}

fn init_logging() {
    let debug_iperf = std::env::var("IPERF_DEBUG").ok().as_deref() == Some("1");
    let default_directive = if debug_iperf {
        "info,iperf3_core::iperf=debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
