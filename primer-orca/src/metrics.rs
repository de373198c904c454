//! Prometheus metrics for primer-orca.
//!
//! Compiled only with the `metrics` feature.
//!
//! # Metrics
//!
//! ## Counters
//! - `primer_orca_jobs_submitted_total` - Jobs submitted
//! - `primer_orca_attempts_total` - Attempts by outcome
//! - `primer_orca_leases_reclaimed_total` - Leases deleted by the lease sweep
//! - `primer_orca_jobs_resubmitted_total` - Jobs resubmitted by the orphan sweep
//!
//! ## Gauges
//! - `primer_orca_threads_leased` - Threads currently leased across all jobs
//!
//! ## Histograms
//! - `primer_orca_attempt_duration_seconds` - Attempt wall-clock time by outcome
#![cfg(feature = "metrics")]

use prometheus::{Counter, CounterVec, Gauge, HistogramVec, Opts, Registry, exponential_buckets};
use std::sync::LazyLock;

/// Global Prometheus registry for primer-orca metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static JOBS_SUBMITTED_TOTAL: LazyLock<Counter> = LazyLock::new(|| {
    Counter::new("primer_orca_jobs_submitted_total", "Total number of jobs submitted")
        .expect("primer_orca_jobs_submitted_total metric creation failed")
});

/// Labels:
/// - `outcome`: completed, superseded, already_completed, max_runs_reached,
///   process_exit, unexpected
pub static ATTEMPTS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("primer_orca_attempts_total", "Total number of job attempts");
    CounterVec::new(opts, &["outcome"]).expect("primer_orca_attempts_total metric creation failed")
});

pub static LEASES_RECLAIMED_TOTAL: LazyLock<Counter> = LazyLock::new(|| {
    Counter::new(
        "primer_orca_leases_reclaimed_total",
        "Total number of leaked thread leases deleted by the lease sweep",
    )
    .expect("primer_orca_leases_reclaimed_total metric creation failed")
});

pub static JOBS_RESUBMITTED_TOTAL: LazyLock<Counter> = LazyLock::new(|| {
    Counter::new(
        "primer_orca_jobs_resubmitted_total",
        "Total number of orphaned jobs resubmitted by the orphan sweep",
    )
    .expect("primer_orca_jobs_resubmitted_total metric creation failed")
});

pub static THREADS_LEASED: LazyLock<Gauge> = LazyLock::new(|| {
    Gauge::new(
        "primer_orca_threads_leased",
        "Threads currently leased across all jobs",
    )
    .expect("primer_orca_threads_leased metric creation failed")
});

/// Labels:
/// - `outcome`: same values as `primer_orca_attempts_total`
pub static ATTEMPT_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    // Optimizer runs take minutes to hours.
    let buckets = exponential_buckets(1.0, 2.0, 18).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "primer_orca_attempt_duration_seconds",
        "Attempt wall-clock duration in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["outcome"])
        .expect("primer_orca_attempt_duration_seconds metric creation failed")
});

/// Register every collector with [`REGISTRY`]. Safe to call more than once.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(JOBS_SUBMITTED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(ATTEMPTS_TOTAL.clone()),
        Box::new(LEASES_RECLAIMED_TOTAL.clone()),
        Box::new(JOBS_RESUBMITTED_TOTAL.clone()),
        Box::new(THREADS_LEASED.clone()),
        Box::new(ATTEMPT_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            let msg = e.to_string();
            if !msg.contains("Duplicate metrics collector registration attempted") {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_job_submitted() {
    JOBS_SUBMITTED_TOTAL.inc();
}

pub fn record_attempt(outcome: &str, duration_secs: f64) {
    ATTEMPTS_TOTAL.with_label_values(&[outcome]).inc();
    ATTEMPT_DURATION_SECONDS
        .with_label_values(&[outcome])
        .observe(duration_secs);
}

pub fn record_lease_reclaimed() {
    LEASES_RECLAIMED_TOTAL.inc();
}

pub fn record_job_resubmitted() {
    JOBS_RESUBMITTED_TOTAL.inc();
}

pub fn set_threads_leased(total: f64) {
    THREADS_LEASED.set(total);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initialization_is_idempotent() {
        init_metrics().expect("metrics initialization should succeed");
        init_metrics().expect("second initialization should succeed");
    }

    #[test]
    fn test_gather_metrics() {
        init_metrics().expect("metrics initialization should succeed");

        record_job_submitted();
        record_attempt("completed", 120.0);
        record_attempt("process_exit", 3.5);
        record_lease_reclaimed();
        record_job_resubmitted();
        set_threads_leased(6.0);

        let output = gather_metrics().expect("gather should succeed");
        assert!(output.contains("primer_orca_jobs_submitted_total"));
        assert!(output.contains("primer_orca_attempts_total"));
        assert!(output.contains("primer_orca_threads_leased"));
    }
}
