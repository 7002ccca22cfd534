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

use criterion::{criterion_group, criterion_main, Criterion};
use iperf3_core::iperf::parser::parse_batch;
use iperf3_core::model::{Direction, MeasurementConfig, Protocol};

fn four_stream_tcp_json() -> String {
    r#"{
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
    }"#
    .to_string()
}

fn bench_parse_batch(c: &mut Criterion) {
    let json = four_stream_tcp_json();
    let config = MeasurementConfig {
        server: "192.168.1.1".to_string(),
        protocol: Protocol::Tcp,
        direction: Direction::Normal,
        parallel: 4,
        ..Default::default()
    };
    c.bench_function("parse_batch_four_stream_tcp", |b| {
        b.iter(|| parse_batch(&json, &config).unwrap())
    });
}

fn bench_verify_stream_totals(c: &mut Criterion) {
    let json = four_stream_tcp_json();
    let config = MeasurementConfig {
        server: "192.168.1.1".to_string(),
        protocol: Protocol::Tcp,
        direction: Direction::Normal,
        parallel: 4,
        ..Default::default()
    };
    let result = parse_batch(&json, &config).unwrap();
    c.bench_function("verify_stream_totals", |b| {
        b.iter(|| result.verify_stream_totals())
    });
}

criterion_group!(benches, bench_parse_batch, bench_verify_stream_totals);
criterion_main!(benches);
