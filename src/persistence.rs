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

//! Measurement-ID allocation and the three on-disk artifacts (§4.8):
//! the append-only summary CSV, the per-date-bucket interval CSV, and
//! the human-readable TXT log. All three share one `<base>` path
//! prefix and are written sequentially, after in-memory assembly, by
//! the Orchestrator.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Local};

use crate::error::{ErrorKind, MeasurementError, Result};
use crate::format::{format_latency_analysis, format_per_stream, format_summary, DIVIDER};
use crate::model::{Direction, IntervalResult, Protocol, TestResult};

/// Allocates measurement IDs of the form `YYYYMMDD-HHMMSS-NN` (§3). The
/// counter resets to 1 whenever the second-precision timestamp changes
/// and otherwise increments, guarded by a mutex so concurrent callers
/// never observe a duplicate.
pub struct MeasurementIdAllocator {
    state: Mutex<AllocatorState>,
}

struct AllocatorState {
    last_second: String,
    counter: u32,
}

impl Default for MeasurementIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl MeasurementIdAllocator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(AllocatorState {
                last_second: String::new(),
                counter: 0,
            }),
        }
    }

    /// Allocates an ID stamped with the current local time.
    pub fn allocate(&self) -> String {
        self.allocate_at(Local::now())
    }

    /// Allocates an ID for an explicit timestamp; exposed so tests can
    /// drive the second-rollover behavior (§10 scenario 5) without
    /// racing the clock.
    pub fn allocate_at(&self, now: DateTime<Local>) -> String {
        let second_key = now.format("%Y%m%d-%H%M%S").to_string();
        let mut state = self.state.lock().unwrap();
        if state.last_second == second_key {
            state.counter += 1;
        } else {
            state.last_second = second_key.clone();
            state.counter = 1;
        }
        format!("{second_key}-{:02}", state.counter)
    }
}

/// Writes the three persistence artifacts for one measurement, rooted
/// at a shared `<base>` path prefix.
pub struct Persistence {
    base: PathBuf,
}

impl Persistence {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    fn summary_path(&self) -> PathBuf {
        with_suffix(&self.base, "_log.csv")
    }

    fn interval_path(&self, date_bucket: &str) -> PathBuf {
        with_suffix(&self.base, &format!("_{date_bucket}.csv"))
    }

    fn txt_path(&self, date_bucket: &str) -> PathBuf {
        with_suffix(&self.base, &format!("_{date_bucket}.txt"))
    }

    /// Appends one row to the long-lived summary CSV, writing the
    /// header only when the file does not yet exist. Fatal on failure
    /// (§7: persistence failure of the summary CSV surfaces).
    pub fn persist_summary(&self, result: &TestResult) -> Result<()> {
        let path = self.summary_path();
        append_csv_row(&path, &summary_header(), &summary_row(result), "persistence.summary")
    }

    /// Appends one row per interval to the date-bucketed interval CSV.
    /// Non-fatal on failure per §7; callers log and continue.
    pub fn persist_intervals(&self, result: &TestResult) -> Result<()> {
        let started = parse_start(result)?;
        let path = self.interval_path(&started.format("%d.%m.%Y").to_string());
        let header_needed = !path_has_content(&path);
        let file = open_for_append(&path, "persistence.intervals")?;
        let mut wtr = csv::WriterBuilder::new()
            .delimiter(b';')
            .terminator(csv::Terminator::Any(b'\n'))
            .has_headers(false)
            .from_writer(file);
        if header_needed {
            wtr.write_record(interval_header(result.direction == Direction::Bidirectional))
                .map_err(|e| csv_err("persistence.intervals", &path, e))?;
        }
        for (idx, interval) in result.intervals.iter().enumerate() {
            let reverse = result.reverse_intervals.get(idx);
            let row = interval_row(result, started, interval, reverse);
            wtr.write_record(&row).map_err(|e| csv_err("persistence.intervals", &path, e))?;
        }
        wtr.flush().map_err(|e| io_err("persistence.intervals", &path, e))
    }

    /// Appends a fixed-divider human-readable block to the date-bucketed
    /// TXT log. Non-fatal on failure per §7.
    pub fn persist_txt(&self, result: &TestResult) -> Result<()> {
        let started = parse_start(result)?;
        let path = self.txt_path(&started.format("%d.%m.%Y").to_string());
        let mut file = open_for_append(&path, "persistence.txt")?;
        let block = format_txt_block(result, started);
        write!(file, "{block}").map_err(|e| io_err("persistence.txt", &path, e))
    }

    /// Writes all three artifacts, per §4.8's "written sequentially by
    /// the Orchestrator task" rule. The summary write's error (if any)
    /// is returned; interval/TXT errors are logged by the caller and do
    /// not abort the run, so both are returned for the caller to decide.
    pub fn persist_all(&self, result: &TestResult) -> (Result<()>, Result<()>, Result<()>) {
        (
            self.persist_summary(result),
            self.persist_intervals(result),
            self.persist_txt(result),
        )
    }
}

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut s = base.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

fn path_has_content(path: &Path) -> bool {
    std::fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false)
}

fn open_for_append(path: &Path, operation: &str) -> Result<std::fs::File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| io_err(operation, path, e))
}

fn io_err(operation: &str, path: &Path, e: std::io::Error) -> MeasurementError {
    MeasurementError::with_source(
        ErrorKind::Persistence,
        operation,
        format!("failed writing '{}'", path.display()),
        e,
    )
}

fn csv_err(operation: &str, path: &Path, e: csv::Error) -> MeasurementError {
    MeasurementError::with_source(
        ErrorKind::Persistence,
        operation,
        format!("failed writing csv row to '{}'", path.display()),
        e,
    )
}

/// Appends one row to a `;`-delimited CSV, writing `header` first if the
/// file is new. Uses the `csv` crate's writer so fields containing the
/// delimiter, quotes, or newlines (e.g. `r.error`'s raw iperf3 stderr)
/// are quoted rather than corrupting the row.
fn append_csv_row(path: &Path, header: &[&str], row: &[String], operation: &str) -> Result<()> {
    let header_needed = !path_has_content(path);
    let file = open_for_append(path, operation)?;
    let mut wtr = csv::WriterBuilder::new()
        .delimiter(b';')
        .terminator(csv::Terminator::Any(b'\n'))
        .has_headers(false)
        .from_writer(file);
    if header_needed {
        wtr.write_record(header).map_err(|e| csv_err(operation, path, e))?;
    }
    wtr.write_record(row).map_err(|e| csv_err(operation, path, e))?;
    wtr.flush().map_err(|e| io_err(operation, path, e))
}

fn parse_start(result: &TestResult) -> Result<DateTime<Local>> {
    DateTime::parse_from_rfc3339(&result.timestamp)
        .map(|dt| dt.with_timezone(&Local))
        .map_err(|e| {
            MeasurementError::with_source(
                ErrorKind::Persistence,
                "persistence.parse_timestamp",
                format!("'{}' is not a valid RFC3339 timestamp", result.timestamp),
                e,
            )
        })
}

// ---------------------------------------------------------------------
// Summary CSV (§4.8)
// ---------------------------------------------------------------------

fn summary_header() -> Vec<&'static str> {
    vec![
        "date",
        "time",
        "measurement_id",
        "hostname",
        "local_ip",
        "server",
        "port",
        "test_duration",
        "actual_duration",
        "streams",
        "protocol",
        "direction",
        "block_size",
        "stream_bandwidth",
        "congestion",
        "mode",
        "iperf_version",
        "fwd_mbps",
        "fwd_mb",
        "rev_mbps",
        "rev_mb",
        "fwd_retransmits",
        "rev_retransmits",
        "fwd_jitter_ms",
        "fwd_lost_packets",
        "fwd_lost_percent",
        "fwd_packets",
        "rev_jitter_ms",
        "rev_lost_packets",
        "rev_lost_percent",
        "rev_packets",
        "ping_baseline_min_ms",
        "ping_baseline_avg_ms",
        "ping_baseline_max_ms",
        "ping_loaded_min_ms",
        "ping_loaded_avg_ms",
        "ping_loaded_max_ms",
        "error",
    ]
}

fn summary_row(r: &TestResult) -> Vec<String> {
    let started = parse_start(r).unwrap_or_else(|_| Local::now());
    let (baseline_min, baseline_avg, baseline_max) = r
        .baseline_latency
        .as_ref()
        .map(|l| (l.min_ms, l.avg_ms, l.max_ms))
        .unwrap_or((0.0, 0.0, 0.0));
    let (loaded_min, loaded_avg, loaded_max) = r
        .loaded_latency
        .as_ref()
        .map(|l| (l.min_ms, l.avg_ms, l.max_ms))
        .unwrap_or((0.0, 0.0, 0.0));

    let block_size_field = if r.block_size_defaulted {
        String::new()
    } else {
        r.block_size.to_string()
    };

    let fields: Vec<String> = vec![
        started.format("%d.%m.%Y").to_string(),
        started.format("%H:%M:%S").to_string(),
        r.measurement_id.clone(),
        r.hostname.clone(),
        r.local_ip.clone(),
        r.server.clone(),
        r.port.to_string(),
        r.requested_duration.to_string(),
        format!("{:.2}", actual_duration(r)),
        r.parallel.to_string(),
        protocol_label(r.protocol).to_string(),
        r.direction.short_name().to_string(),
        block_size_field,
        r.stream_bandwidth.clone().unwrap_or_default(),
        r.congestion.clone().unwrap_or_default(),
        r.mode.clone(),
        r.tool_version.clone(),
        fwd_mbps_field(r),
        fwd_mb_field(r),
        rev_mbps_field(r),
        rev_mb_field(r),
        r.fwd_retransmits.to_string(),
        r.rev_retransmits.to_string(),
        format!("{:.3}", r.fwd_jitter_ms),
        r.fwd_lost_packets.to_string(),
        format!("{:.2}", r.fwd_lost_percent),
        r.fwd_packets.to_string(),
        format!("{:.3}", r.rev_jitter_ms),
        r.rev_lost_packets.to_string(),
        format!("{:.2}", r.rev_lost_percent),
        r.rev_packets.to_string(),
        format!("{baseline_min:.3}"),
        format!("{baseline_avg:.3}"),
        format!("{baseline_max:.3}"),
        format!("{loaded_min:.3}"),
        format!("{loaded_avg:.3}"),
        format!("{loaded_max:.3}"),
        error_field(r),
    ];
    fields
}

fn protocol_label(p: Protocol) -> &'static str {
    match p {
        Protocol::Tcp => "TCP",
        Protocol::Udp => "UDP",
    }
}

fn actual_duration(r: &TestResult) -> f64 {
    if r.actual_duration != 0.0 {
        return r.actual_duration;
    }
    r.intervals
        .iter()
        .rev()
        .find(|i| !i.omitted)
        .map(|i| i.time_end)
        .unwrap_or(0.0)
}

fn fwd_mbps_field(r: &TestResult) -> String {
    if r.protocol == Protocol::Udp && r.fwd_received_bps == 0.0 {
        "N/A".to_string()
    } else {
        format!("{:.2}", r.fwd_received_bps / 1_000_000.0)
    }
}

fn fwd_mb_field(r: &TestResult) -> String {
    if r.protocol == Protocol::Udp && r.fwd_bytes_received == 0 {
        "N/A".to_string()
    } else {
        format!("{:.2}", r.fwd_bytes_received as f64 / 1_000_000.0)
    }
}

fn rev_mbps_field(r: &TestResult) -> String {
    match r.direction {
        Direction::Bidirectional => format!("{:.2}", r.rev_received_bps / 1_000_000.0),
        _ if r.protocol == Protocol::Udp => fwd_mbps_field(r),
        _ => String::new(),
    }
}

fn rev_mb_field(r: &TestResult) -> String {
    let bytes = if r.rev_bytes_received > 0 {
        r.rev_bytes_received
    } else {
        r.rev_bytes_sent
    };
    format!("{:.2}", bytes as f64 / 1_000_000.0)
}

fn error_field(r: &TestResult) -> String {
    if !r.error.is_empty() {
        r.error.clone()
    } else if r.interrupted {
        "Interrupted".to_string()
    } else {
        String::new()
    }
}

// ---------------------------------------------------------------------
// Interval CSV (§4.8)
// ---------------------------------------------------------------------

fn interval_header(bidirectional: bool) -> Vec<&'static str> {
    let mut fields = vec![
        "measurement_id",
        "wall_time",
        "protocol",
        "streams",
        "test_direction",
        "block_size",
        "stream_bandwidth",
        "server",
        "port",
        "fwd_bandwidth_mbps",
        "fwd_transfer_mb",
        "fwd_retransmits",
        "fwd_packets",
        "fwd_omitted",
    ];
    if bidirectional {
        fields.extend(["rev_bandwidth_mbps", "rev_transfer_mb", "rev_retransmits", "rev_packets", "rev_omitted"]);
    }
    fields
}

fn interval_row(
    r: &TestResult,
    started: DateTime<Local>,
    interval: &IntervalResult,
    reverse: Option<&IntervalResult>,
) -> Vec<String> {
    let wall_time = started + chrono::Duration::milliseconds((interval.time_start * 1000.0) as i64);
    let mut fields: Vec<String> = vec![
        r.measurement_id.clone(),
        wall_time.format("%Y-%m-%dT%H:%M:%S%:z").to_string(),
        protocol_label(r.protocol).to_string(),
        r.parallel.to_string(),
        r.direction.short_name().to_string(),
        if r.block_size_defaulted { String::new() } else { r.block_size.to_string() },
        r.stream_bandwidth.clone().unwrap_or_default(),
        r.server.clone(),
        r.port.to_string(),
        format!("{:.2}", interval.bandwidth_bps / 1_000_000.0),
        format!("{:.2}", interval.bytes as f64 / 1_000_000.0),
        interval.retransmits.to_string(),
        interval.packets.to_string(),
        if interval.omitted { "1".to_string() } else { "0".to_string() },
    ];

    if r.direction == Direction::Bidirectional {
        match reverse {
            Some(rev) => {
                fields.push(format!("{:.2}", rev.bandwidth_bps / 1_000_000.0));
                fields.push(format!("{:.2}", rev.bytes as f64 / 1_000_000.0));
                fields.push(rev.retransmits.to_string());
                fields.push(rev.packets.to_string());
                fields.push(if rev.omitted { "1".to_string() } else { "0".to_string() });
            }
            None => {
                for _ in 0..5 {
                    fields.push(String::new());
                }
            }
        }
    }
    fields
}

// ---------------------------------------------------------------------
// TXT block (§4.8)
// ---------------------------------------------------------------------

fn format_txt_block(r: &TestResult, started: DateTime<Local>) -> String {
    use std::fmt::Write as _;
    let mut out = String::new();

    let _ = writeln!(out, "{DIVIDER}");
    let _ = writeln!(out, "Date:            {}", started.format("%d.%m.%Y"));
    let _ = writeln!(out, "Time:            {} ({})", started.format("%H:%M:%S"), started.format("%z"));
    let _ = writeln!(out, "RFC3339:         {}", started.to_rfc3339());
    let _ = writeln!(out, "Hostname:        {}", r.hostname);
    let _ = writeln!(out, "OS:              {}", std::env::consts::OS);
    let _ = writeln!(out, "Local IP:        {}", r.local_ip);
    let _ = writeln!(out, "iperf3 Version:  {}", r.tool_version);
    let _ = writeln!(out, "Mode:            {}", r.mode);
    if let Some(peer) = &r.ssh_peer_host {
        let _ = writeln!(out, "SSH Peer:        {peer}");
    }
    let _ = writeln!(out);

    let _ = writeln!(out, "Test Parameters:");
    let _ = writeln!(out, "  Server:        {}", r.server);
    let _ = writeln!(out, "  Protocol:      {}", protocol_label(r.protocol));
    let _ = writeln!(out, "  Direction:     {}", r.direction.label());
    let _ = writeln!(out, "  Parallel:      {}", r.parallel);
    let _ = writeln!(out, "  Duration:      {} s", r.requested_duration);
    if let Some(bw) = &r.stream_bandwidth {
        let _ = writeln!(out, "  Bandwidth:     {bw} bps/stream");
    }
    if let Some(cc) = &r.congestion {
        let _ = writeln!(out, "  Congestion:    {cc}");
    }
    let _ = writeln!(out);

    let _ = writeln!(out, "Results:");
    let _ = writeln!(
        out,
        "{:<12}{:>14}{:>14}{:>8}",
        "Time (s)", "Mbps", "Transfer MB", "Retr"
    );
    for interval in &r.intervals {
        let _ = writeln!(
            out,
            "{:<12.1}{:>14.2}{:>14.2}{:>8}",
            interval.time_start,
            interval.bandwidth_bps / 1_000_000.0,
            interval.bytes as f64 / 1_000_000.0,
            interval.retransmits
        );
    }
    let _ = writeln!(out);

    let _ = writeln!(out, "Summary:");
    out.push_str(&format_summary(r));
    let _ = writeln!(out);

    if r.parallel > 1 {
        let _ = writeln!(out, "Per-Stream Results:");
        out.push_str(&format_per_stream(r));
        let _ = writeln!(out);
    }

    if let Some(analysis) = format_latency_analysis(r) {
        out.push_str(&analysis);
        let _ = writeln!(out);
    }

    let _ = writeln!(out, "{DIVIDER}");
    let _ = writeln!(out, "END OF MEASUREMENT");
    let _ = writeln!(out);
    out
}
