//! Metrics recording.
//!
//! # Metrics
//! - `forkserve_requests_total` (counter): responses written, by method and status
//! - `forkserve_request_duration_seconds` (histogram): dispatch to write latency
//! - `forkserve_active_connections` (gauge): open connections in this worker
//! - `forkserve_protocol_errors_total` (counter): malformed input, by kind
//! - `forkserve_error_handler_failures_total` (counter)
//! - `forkserve_reaped_connections_total` (counter)
//! - `forkserve_drain_connections_total` (counter): by outcome
//! - `forkserve_worker_exits_total` (counter): by outcome
//!
//! # Design Decisions
//! - Thin wrappers so call sites never spell metric names
//! - Labels stay low-cardinality (no paths)

use std::time::Instant;

use metrics::{counter, gauge, histogram};

use crate::lifecycle::DrainReport;

pub fn record_request(method: &str, status: u16, started: Instant) {
    counter!(
        "forkserve_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("forkserve_request_duration_seconds", "method" => method.to_string())
        .record(started.elapsed().as_secs_f64());
}

pub fn connection_opened() {
    gauge!("forkserve_active_connections").increment(1.0);
}

pub fn connection_closed() {
    gauge!("forkserve_active_connections").decrement(1.0);
}

pub fn record_protocol_error(kind: &'static str) {
    counter!("forkserve_protocol_errors_total", "kind" => kind).increment(1);
}

pub fn record_error_handler_failure() {
    counter!("forkserve_error_handler_failures_total").increment(1);
}

pub fn record_reaped(count: usize) {
    counter!("forkserve_reaped_connections_total").increment(count as u64);
}

pub fn record_drain(report: &DrainReport) {
    for (outcome, count) in [
        ("idle", report.idle_closed),
        ("finished", report.finished),
        ("forced", report.forced),
    ] {
        counter!("forkserve_drain_connections_total", "outcome" => outcome).increment(count as u64);
    }
}

pub fn record_worker_exit(outcome: &'static str) {
    counter!("forkserve_worker_exits_total", "outcome" => outcome).increment(1);
}
