//! Integration tests for the six end-to-end scenarios, exercised
//! through the crate's public API rather than module-internal helpers.

use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use iperf3_core::config;
use iperf3_core::error::ErrorKind;
use iperf3_core::iperf::parser::parse_batch;
use iperf3_core::iperf::{IntervalCallback, ToolRunner};
use iperf3_core::model::{Direction, MeasurementConfig, Protocol, TestResult};
use iperf3_core::orchestrator::{Orchestrator, RemoteControl};
use iperf3_core::persistence::{MeasurementIdAllocator, Persistence};
use iperf3_core::ping::PingRunner;
use iperf3_core::Result;
use serial_test::serial;
use tokio_util::sync::CancellationToken;

fn config_with(server: &str, protocol: Protocol, direction: Direction, parallel: u32) -> MeasurementConfig {
    MeasurementConfig {
        server: server.to_string(),
        protocol,
        direction,
        parallel,
        duration_secs: 10,
        ..Default::default()
    }
}

#[test]
fn scenario_1_tcp_forward_four_streams() {
    let config = config_with("192.168.1.1", Protocol::Tcp, Direction::Normal, 4);
    let json = r#"{
        "start": {"version": "iperf 3.17.1", "connected": [{"remote_host": "192.168.1.1", "remote_port": 5201}]},
        "end": {
            "sum_sent": {"bits_per_second": 940000000.0, "retransmits": 42, "seconds": 10.0},
            "sum_received": {"bits_per_second": 940000000.0, "seconds": 10.0},
            "streams": [
                {"sender": {"bits_per_second": 235000000.0, "retransmits": 11}, "receiver": {"bits_per_second": 235000000.0}},
                {"sender": {"bits_per_second": 235000000.0, "retransmits": 11}, "receiver": {"bits_per_second": 235000000.0}},
                {"sender": {"bits_per_second": 235000000.0, "retransmits": 10}, "receiver": {"bits_per_second": 235000000.0}},
                {"sender": {"bits_per_second": 235000000.0, "retransmits": 10}, "receiver": {"bits_per_second": 235000000.0}}
            ]
        }
    }"#;

    let result = parse_batch(json, &config).unwrap();
    assert_eq!(result.sent_mbps(), 940.00);
    assert_eq!(result.fwd_retransmits, 42);
    assert_eq!(result.streams.len(), 4);
    assert_eq!(result.verify_stream_totals(), (true, true));
    assert!(result.error.is_empty());
    assert!(iperf3_core::format::format_summary(&result).contains("Sent:            940.00 Mbps"));
}

#[test]
fn scenario_2_udp_packet_loss() {
    let config = config_with("192.168.1.1", Protocol::Udp, Direction::Normal, 1);
    let json = r#"{
        "start": {"version": "iperf 3.17.1", "connected": []},
        "end": {
            "sum_sent": {"bits_per_second": 1048576.0, "lost_packets": 3, "packets": 48, "lost_percent": 6.25, "jitter_ms": 0.025, "seconds": 3.0},
            "sum_received": {"seconds": 3.0},
            "streams": []
        }
    }"#;

    let result = parse_batch(json, &config).unwrap();
    assert_eq!(result.fwd_jitter_ms, 0.025);
    assert_eq!(result.fwd_lost_packets, 3);
    assert_eq!(result.fwd_packets, 48);
    assert!((result.fwd_lost_percent - 6.25).abs() < 1e-9);
    assert!(iperf3_core::format::format_summary(&result).contains("Packet Loss:     3/48 (6.25%)"));
}

#[test]
fn scenario_3_reverse_tcp() {
    let config = config_with("192.168.1.1", Protocol::Tcp, Direction::Reverse, 1);
    let json = r#"{
        "start": {"version": "iperf 3.17.1", "connected": []},
        "end": {
            "sum_sent": {"seconds": 0.0},
            "sum_received": {"bits_per_second": 300000000.0, "seconds": 10.0},
            "streams": []
        }
    }"#;

    let result = parse_batch(json, &config).unwrap();
    assert_eq!(result.actual_duration, 10.0);
    assert_eq!(result.received_mbps(), 300.00);
    assert_eq!(result.direction, Direction::Reverse);
}

#[test]
#[serial]
fn scenario_5_measurement_id_collision_within_a_second() {
    use chrono::{Local, TimeZone};
    let allocator = MeasurementIdAllocator::new();
    let t1 = Local.with_ymd_and_hms(2026, 2, 18, 14, 32, 7).unwrap();
    let t2 = Local.with_ymd_and_hms(2026, 2, 18, 14, 32, 8).unwrap();
    assert_eq!(allocator.allocate_at(t1), "20260218-143207-01");
    assert_eq!(allocator.allocate_at(t1), "20260218-143207-02");
    assert_eq!(allocator.allocate_at(t2), "20260218-143208-01");
}

struct BusyThenOkRunner {
    attempts: Mutex<u32>,
}

#[async_trait]
impl ToolRunner for BusyThenOkRunner {
    async fn run(
        &self,
        _config: &MeasurementConfig,
        _cancel: CancellationToken,
        _on_interval: IntervalCallback,
    ) -> Result<TestResult> {
        let mut attempts = self.attempts.lock().unwrap();
        *attempts += 1;
        if *attempts == 1 {
            Err(iperf3_core::MeasurementError::new(ErrorKind::ServerBusy, "iperf3.run", "server is busy"))
        } else {
            Ok(TestResult {
                server: "10.0.0.1".to_string(),
                ..Default::default()
            })
        }
    }
}

struct NoopPingRunner;

#[async_trait]
impl PingRunner for NoopPingRunner {
    async fn run(&self, _bin: &str, _host: &str, _count: u32) -> Result<iperf3_core::model::LatencySummary> {
        Ok(iperf3_core::model::LatencySummary::default())
    }

    async fn run_until_cancel(
        &self,
        _bin: &str,
        _host: &str,
        cancel: CancellationToken,
    ) -> Result<iperf3_core::model::LatencySummary> {
        cancel.cancelled().await;
        Ok(iperf3_core::model::LatencySummary::default())
    }
}

struct AlwaysConnectedRemote {
    restarts: Mutex<u32>,
}

#[async_trait]
impl RemoteControl for AlwaysConnectedRemote {
    async fn connected(&self) -> bool {
        true
    }

    async fn restart_server(&self, _port: u32) -> Result<()> {
        *self.restarts.lock().unwrap() += 1;
        Ok(())
    }

    fn peer_host(&self) -> String {
        "peer.example.com".to_string()
    }
}

#[tokio::test]
#[serial]
async fn scenario_6_server_busy_retry_succeeds_once() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = Orchestrator::new(
        Arc::new(BusyThenOkRunner { attempts: Mutex::new(0) }),
        Arc::new(NoopPingRunner),
        Arc::new(MeasurementIdAllocator::new()),
        Persistence::new(dir.path().join("iperf3")),
    );
    let remote = Arc::new(AlwaysConnectedRemote { restarts: Mutex::new(0) });

    let config = MeasurementConfig {
        server: "10.0.0.1".to_string(),
        run_latency_probes: false,
        ..Default::default()
    };
    let result = orchestrator
        .run_measurement(
            config,
            CancellationToken::new(),
            Some(remote.clone() as Arc<dyn RemoteControl>),
            Box::new(|_, _| {}),
        )
        .await
        .unwrap();

    assert!(result.error.is_empty());
    assert_eq!(*remote.restarts.lock().unwrap(), 1);
}

#[test]
fn boundary_port_zero_and_overflow_are_rejected() {
    let mut c = config_with("10.0.0.1", Protocol::Tcp, Direction::Normal, 1);
    c.port = 0;
    assert_eq!(config::validate(&c).unwrap_err().kind(), ErrorKind::Config);
    c.port = 65536;
    assert_eq!(config::validate(&c).unwrap_err().kind(), ErrorKind::Config);
}

#[test]
fn boundary_parallel_zero_and_too_high_are_rejected() {
    let mut c = config_with("10.0.0.1", Protocol::Tcp, Direction::Normal, 0);
    assert!(config::validate(&c).is_err());
    c.parallel = 129;
    assert!(config::validate(&c).is_err());
}

#[test]
fn boundary_block_size_range() {
    let mut c = config_with("10.0.0.1", Protocol::Tcp, Direction::Normal, 1);
    c.block_size = 134_217_729;
    assert!(config::validate(&c).is_err());
    c.block_size = 0;
    assert!(config::validate(&c).is_ok());
}

#[test]
#[serial]
fn csv_append_law_one_at_a_time_matches_all_at_once() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();

    let results: Vec<TestResult> = (0..3)
        .map(|i| TestResult {
            timestamp: format!("2026-02-18T14:32:0{i}+00:00"),
            measurement_id: format!("20260218-14320{i}-01"),
            server: "10.0.0.1".to_string(),
            fwd_sent_bps: 100_000_000.0 * (i + 1) as f64,
            ..Default::default()
        })
        .collect();

    let persistence_a = Persistence::new(dir_a.path().join("iperf3"));
    for r in &results {
        persistence_a.persist_summary(r).unwrap();
    }

    let persistence_b = Persistence::new(dir_b.path().join("iperf3"));
    for r in &results {
        persistence_b.persist_summary(r).unwrap();
    }

    let contents_a = std::fs::read_to_string(dir_a.path().join("iperf3_log.csv")).unwrap();
    let contents_b = std::fs::read_to_string(dir_b.path().join("iperf3_log.csv")).unwrap();
    assert_eq!(contents_a, contents_b);
}
