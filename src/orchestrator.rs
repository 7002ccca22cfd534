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

//! The measurement orchestrator (§4.5): drives one measurement's three
//! concurrent activities (baseline ping, `iperf3` subprocess, loaded
//! ping), reconciles a server-busy retry through an optional SSH peer,
//! enriches the result with identity fields, and hands it to
//! persistence. State machine per the spec:
//!
//! ```text
//! Idle → Validating → Probing → Running → Assembling → Persisting → Idle
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{self, per_stream_bandwidth_display};
use crate::error::{ErrorKind, Result};
use crate::iperf::{IntervalCallback, ToolRunner};
use crate::model::{LatencySummary, MeasurementConfig, TestResult};
use crate::persistence::{MeasurementIdAllocator, Persistence};
use crate::ping::PingRunner;

const BASELINE_PING_COUNT: u32 = 4;
const LOADED_PING_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
const SERVER_BUSY_RETRY_DELAY: Duration = Duration::from_secs(1);

/// The orchestrator's view of an optional connected SSH peer: just
/// enough to retry once on a `server-busy` condition (§4.5 step 5). The
/// real implementation lives in [`crate::ssh::remote_lifecycle`].
#[async_trait]
pub trait RemoteControl: Send + Sync {
    async fn connected(&self) -> bool;
    async fn restart_server(&self, port: u32) -> Result<()>;
    /// The peer host, echoed into the Test Result's `ssh_peer_host`.
    fn peer_host(&self) -> String;
}

pub struct Orchestrator<R: ToolRunner, P: PingRunner> {
    tool_runner: Arc<R>,
    ping_runner: Arc<P>,
    id_allocator: Arc<MeasurementIdAllocator>,
    persistence: Persistence,
}

impl<R: ToolRunner, P: PingRunner> Orchestrator<R, P> {
    pub fn new(
        tool_runner: Arc<R>,
        ping_runner: Arc<P>,
        id_allocator: Arc<MeasurementIdAllocator>,
        persistence: Persistence,
    ) -> Self {
        Self {
            tool_runner,
            ping_runner,
            id_allocator,
            persistence,
        }
    }

    /// Runs one measurement to completion (or until `cancel` fires).
    /// `on_interval` is invoked once per arrived interval, synchronously,
    /// for the caller's live display — it must not block longer than an
    /// interval's worth of time (§5).
    pub async fn run_measurement(
        &self,
        config: MeasurementConfig,
        cancel: CancellationToken,
        remote: Option<Arc<dyn RemoteControl>>,
        on_interval: IntervalCallback,
    ) -> Result<TestResult> {
        config::validate(&config)?;

        let baseline_latency = if config.run_latency_probes {
            match self.ping_runner.run(&config.ping_bin, &config.server, BASELINE_PING_COUNT).await {
                Ok(summary) => Some(summary),
                Err(e) => {
                    warn!(error = %e, "baseline ping failed, continuing without it");
                    None
                }
            }
        } else {
            None
        };

        let loaded_ping_cancel = CancellationToken::new();
        let loaded_ping_rx = if config.run_latency_probes {
            Some(self.spawn_loaded_ping(&config, loaded_ping_cancel.clone()))
        } else {
            None
        };

        let mut run_result = self.tool_runner.run(&config, cancel.clone(), on_interval).await;

        // `on_interval` was consumed by the first call; the retry runs
        // without a live-display callback (at most one retry, §4.5 step 5).
        if let (Err(e), Some(peer)) = (&run_result, &remote) {
            if e.kind() == ErrorKind::ServerBusy && peer.connected().await {
                info!("server busy, restarting remote peer and retrying once");
                peer.restart_server(config.port).await?;
                tokio::time::sleep(SERVER_BUSY_RETRY_DELAY).await;
                run_result = self
                    .tool_runner
                    .run(&config, cancel.clone(), Box::new(|_, _| {}))
                    .await;
            }
        }

        loaded_ping_cancel.cancel();
        let loaded_latency = drain_loaded_ping(loaded_ping_rx).await;

        let mut result = run_result?;
        self.enrich(&mut result, &config, baseline_latency, loaded_latency, &remote);

        let (summary_err, interval_err, txt_err) = self.persistence.persist_all(&result);
        summary_err?;
        if let Err(e) = interval_err {
            warn!(error = %e, "interval CSV persistence failed, continuing");
        }
        if let Err(e) = txt_err {
            warn!(error = %e, "TXT persistence failed, continuing");
        }

        Ok(result)
    }

    fn spawn_loaded_ping(
        &self,
        config: &MeasurementConfig,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<Result<LatencySummary>> {
        let (tx, rx) = mpsc::channel(1);
        let runner = self.ping_runner.clone();
        let bin = config.ping_bin.clone();
        let host = config.server.clone();
        tokio::spawn(async move {
            let summary = runner.run_until_cancel(&bin, &host, cancel).await;
            let _ = tx.send(summary).await;
        });
        rx
    }

    fn enrich(
        &self,
        result: &mut TestResult,
        config: &MeasurementConfig,
        baseline_latency: Option<LatencySummary>,
        loaded_latency: Option<LatencySummary>,
        remote: &Option<Arc<dyn RemoteControl>>,
    ) {
        result.timestamp = chrono::Local::now().to_rfc3339();
        result.measurement_id = self.id_allocator.allocate();
        result.hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_default();
        result.local_ip = local_ip_address::local_ip()
            .map(|ip| ip.to_string())
            .unwrap_or_default();
        result.mode = "CLI".to_string();
        result.ssh_peer_host = remote.as_ref().map(|r| r.peer_host());
        result.stream_bandwidth = config
            .bandwidth
            .as_ref()
            .filter(|bw| !bw.is_empty())
            .map(|bw| per_stream_bandwidth_display(bw, config.parallel));
        result.baseline_latency = baseline_latency;
        result.loaded_latency = loaded_latency;
    }
}

async fn drain_loaded_ping(
    rx: Option<mpsc::Receiver<Result<LatencySummary>>>,
) -> Option<LatencySummary> {
    let mut rx = rx?;
    match tokio::time::timeout(LOADED_PING_DRAIN_TIMEOUT, rx.recv()).await {
        Ok(Some(Ok(summary))) => Some(summary),
        Ok(Some(Err(e))) => {
            warn!(error = %e, "loaded ping failed, continuing without it");
            None
        }
        Ok(None) => None,
        Err(_) => {
            warn!("loaded ping result timed out, attaching nil");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iperf::RealToolRunner;
    use crate::model::LatencySummary;
    use crate::ping::PingRunner;
    use tempfile::tempdir;

    struct FakePingRunner;

    #[async_trait]
    impl PingRunner for FakePingRunner {
        async fn run(&self, _bin: &str, _host: &str, _count: u32) -> Result<LatencySummary> {
            Ok(LatencySummary {
                min_ms: 1.0,
                avg_ms: 2.0,
                max_ms: 3.0,
                packets_sent: 4,
                packets_recv: 4,
                loss_percent: 0.0,
            })
        }

        async fn run_until_cancel(
            &self,
            _bin: &str,
            _host: &str,
            cancel: CancellationToken,
        ) -> Result<LatencySummary> {
            cancel.cancelled().await;
            Ok(LatencySummary {
                min_ms: 1.5,
                avg_ms: 2.5,
                max_ms: 3.5,
                packets_sent: 10,
                packets_recv: 10,
                loss_percent: 0.0,
            })
        }
    }

    #[tokio::test]
    async fn enrich_populates_identity_fields() {
        let dir = tempdir().unwrap();
        let persistence = Persistence::new(dir.path().join("iperf3"));
        let orchestrator = Orchestrator::new(
            Arc::new(RealToolRunner::new()),
            Arc::new(FakePingRunner),
            Arc::new(MeasurementIdAllocator::new()),
            persistence,
        );
        let mut result = TestResult::default();
        let config = MeasurementConfig {
            server: "10.0.0.1".to_string(),
            ..Default::default()
        };
        orchestrator.enrich(&mut result, &config, None, None, &None);
        assert!(!result.measurement_id.is_empty());
        assert_eq!(result.mode, "CLI");
        assert!(!result.timestamp.is_empty());
    }

    #[tokio::test]
    async fn rejects_invalid_config_before_spawning_anything() {
        let dir = tempdir().unwrap();
        let persistence = Persistence::new(dir.path().join("iperf3"));
        let orchestrator = Orchestrator::new(
            Arc::new(RealToolRunner::new()),
            Arc::new(FakePingRunner),
            Arc::new(MeasurementIdAllocator::new()),
            persistence,
        );
        let config = MeasurementConfig {
            server: String::new(),
            ..Default::default()
        };
        let err = orchestrator
            .run_measurement(config, CancellationToken::new(), None, Box::new(|_, _| {}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }
}
