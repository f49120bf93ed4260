//! Metrics collection for overlay jobs
//!
//! Prometheus counters for job outcomes, pair outcomes and batch failures, plus a
//! batch duration histogram. Labels use the operation name (`intersection`,
//! `difference`) so both analysis tools share one registry.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge, Encoder, HistogramVec,
    IntCounterVec, IntGauge, TextEncoder,
};
use std::time::Instant;

lazy_static! {
    /// Jobs reaching a terminal state
    static ref JOBS: IntCounterVec = register_int_counter_vec!(
        "overlay_jobs_total",
        "Total number of overlay jobs by terminal outcome",
        &["operation", "outcome"]
    ).expect("overlay_jobs_total registers once");

    /// Pair outcomes (produced / skipped / invalid)
    static ref PAIRS: IntCounterVec = register_int_counter_vec!(
        "overlay_pairs_total",
        "Total number of evaluated feature pairs by outcome",
        &["operation", "outcome"]
    ).expect("overlay_pairs_total registers once");

    /// Batch failures (retried / permanent / timeout)
    static ref BATCH_FAILURES: IntCounterVec = register_int_counter_vec!(
        "overlay_batch_failures_total",
        "Total number of batch infrastructure failures",
        &["kind"]
    ).expect("overlay_batch_failures_total registers once");

    /// Wall time of one batch on a worker
    static ref BATCH_DURATION: HistogramVec = register_histogram_vec!(
        "overlay_batch_duration_seconds",
        "Batch execution duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]
    ).expect("overlay_batch_duration_seconds registers once");

    /// Jobs currently between Planning and a terminal state
    static ref ACTIVE_JOBS: IntGauge = register_int_gauge!(
        "overlay_active_jobs",
        "Number of overlay jobs currently running"
    ).expect("overlay_active_jobs registers once");
}

/// Metrics recorder scoped to one operation
#[derive(Debug, Clone, Copy)]
pub struct OverlayMetrics {
    operation: &'static str,
}

impl OverlayMetrics {
    /// Recorder for the given operation label
    pub fn new(operation: &'static str) -> Self {
        Self { operation }
    }

    /// A job left Pending
    pub fn record_job_started(&self) {
        ACTIVE_JOBS.inc();
    }

    /// A started job reached a terminal state
    pub fn record_job_finished(&self, outcome: &str) {
        ACTIVE_JOBS.dec();
        self.record_job_outcome(outcome);
    }

    /// Count a terminal outcome without touching the active gauge
    pub fn record_job_outcome(&self, outcome: &str) {
        JOBS.with_label_values(&[self.operation, outcome]).inc();
    }

    /// Pair counts from one merged batch
    pub fn record_pairs(&self, produced: u64, skipped: u64, invalid: u64) {
        PAIRS
            .with_label_values(&[self.operation, "produced"])
            .inc_by(produced);
        PAIRS
            .with_label_values(&[self.operation, "skipped"])
            .inc_by(skipped);
        PAIRS
            .with_label_values(&[self.operation, "invalid"])
            .inc_by(invalid);
    }

    /// Batch failure of the given kind
    pub fn record_batch_failure(&self, kind: &str) {
        BATCH_FAILURES.with_label_values(&[kind]).inc();
    }

    /// Batch duration in seconds
    pub fn record_batch_duration(&self, seconds: f64) {
        BATCH_DURATION
            .with_label_values(&[self.operation])
            .observe(seconds);
    }
}

/// Timer for measuring operation duration
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Start a new timer
    #[inline]
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed time in seconds
    #[inline]
    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

/// Export all registered metrics in Prometheus text format
pub fn gather_text() -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| format!("Failed to encode metrics: {}", e))?;

    String::from_utf8(buffer).map_err(|e| format!("Failed to convert metrics to UTF-8: {}", e).into())
}
