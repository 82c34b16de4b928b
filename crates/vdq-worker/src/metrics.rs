//! Prometheus metrics for the worker.

use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::error::{WorkerError, WorkerResult};

/// Metric names as constants for consistency.
pub mod names {
    pub const JOBS_TOTAL: &str = "vdq_jobs_total";
    pub const FETCH_DURATION_SECONDS: &str = "vdq_fetch_duration_seconds";
    pub const UPLOAD_DURATION_SECONDS: &str = "vdq_upload_duration_seconds";
    pub const PROGRESS_EVENTS_TOTAL: &str = "vdq_progress_events_total";
    pub const SWEEP_DELETED_TOTAL: &str = "vdq_sweep_deleted_total";
    pub const SWEEP_FAILED_TOTAL: &str = "vdq_sweep_failed_total";
}

/// Serve metrics on `addr` (host:port).
pub fn init_metrics(addr: &str) -> WorkerResult<()> {
    let addr: std::net::SocketAddr = addr
        .parse()
        .map_err(|e| WorkerError::config_error(format!("METRICS_ADDR {:?}: {}", addr, e)))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| {
            WorkerError::config_error(format!("Failed to install Prometheus exporter: {}", e))
        })
}

/// Record the outcome of one delivery.
pub fn record_job_outcome(outcome: &'static str) {
    counter!(names::JOBS_TOTAL, "outcome" => outcome).increment(1);
}

pub fn record_fetch_duration(duration_secs: f64) {
    histogram!(names::FETCH_DURATION_SECONDS).record(duration_secs);
}

pub fn record_upload_duration(duration_secs: f64) {
    histogram!(names::UPLOAD_DURATION_SECONDS).record(duration_secs);
}

pub fn record_progress_event() {
    counter!(names::PROGRESS_EVENTS_TOTAL).increment(1);
}

pub fn record_sweep(deleted: usize, failed: usize) {
    counter!(names::SWEEP_DELETED_TOTAL).increment(deleted as u64);
    counter!(names::SWEEP_FAILED_TOTAL).increment(failed as u64);
}
