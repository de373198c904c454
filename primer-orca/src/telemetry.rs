//! Tracing and telemetry instrumentation for primer-orca.
//!
//! Span constructors for attempts, allocations and sweeps, plus `record_*`
//! helpers that log the event and, with the `metrics` feature enabled,
//! update the Prometheus collectors in [`crate::metrics`]. Everything here
//! works with the feature off.
//!
//! # Example
//!
//! ```ignore
//! use primer_orca::telemetry::{attempt_span, record_attempt_start, record_attempt_end};
//!
//! let span = attempt_span(job_id, handle);
//! let timer = record_attempt_start(job_id);
//! // ... run the optimizer
//! record_attempt_end(timer, "completed");
//! ```

use std::time::Instant;
use tracing::{Span, info_span};

use crate::job::{JobId, TaskHandle};

/// Span covering one `run_attempt` call.
#[must_use]
pub fn attempt_span(job_id: JobId, handle: TaskHandle) -> Span {
    info_span!(
        "primer_orca.attempt",
        job_id = %job_id,
        task = %handle,
    )
}

/// Span covering one thread allocation.
#[must_use]
pub fn allocate_span(job_id: JobId) -> Span {
    info_span!("primer_orca.allocate", job_id = %job_id)
}

/// Span covering one reconciliation sweep.
///
/// `sweep` is `lease` or `orphan`.
#[must_use]
pub fn sweep_span(sweep: &'static str) -> Span {
    info_span!("primer_orca.sweep", sweep = sweep)
}

/// Record a job submission.
pub fn record_job_submitted(job_id: JobId, handle: TaskHandle) {
    tracing::info!(job_id = %job_id, task = %handle, "job submitted");

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_submitted();
}

/// Update the gauge of threads currently leased across all jobs.
pub fn record_threads_leased(total: u64) {
    tracing::debug!(total, "threads leased");

    #[cfg(feature = "metrics")]
    crate::metrics::set_threads_leased(total as f64);
}

/// Record a lease deleted by the lease sweep.
pub fn record_lease_reclaimed(job_id: JobId, threads: Option<u32>) {
    tracing::warn!(job_id = %job_id, threads = ?threads, "leaked lease reclaimed");

    #[cfg(feature = "metrics")]
    crate::metrics::record_lease_reclaimed();
}

/// Record a job given a fresh attempt by the orphan sweep.
pub fn record_job_resubmitted(job_id: JobId, previous: Option<TaskHandle>, handle: TaskHandle) {
    tracing::warn!(
        job_id = %job_id,
        previous = ?previous.map(|h| h.to_string()),
        task = %handle,
        "orphaned job resubmitted"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_resubmitted();
}

/// Start timing an attempt.
pub fn record_attempt_start(job_id: JobId) -> AttemptTimer {
    AttemptTimer {
        job_id,
        start: Instant::now(),
    }
}

/// Finish timing an attempt and count its outcome.
///
/// `outcome` is `completed`, `superseded` or an
/// [`AttemptError::kind`](crate::error::AttemptError::kind) label.
pub fn record_attempt_end(timer: AttemptTimer, outcome: &str) {
    let duration_secs = timer.elapsed().as_secs_f64();
    tracing::info!(
        job_id = %timer.job_id,
        outcome,
        duration_secs,
        "attempt finished"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_attempt(outcome, duration_secs);
}

/// Opaque handle returned by [`record_attempt_start`].
#[derive(Debug)]
pub struct AttemptTimer {
    job_id: JobId,
    start: Instant,
}

impl AttemptTimer {
    #[must_use]
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    #[must_use]
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_names() {
        let job = JobId::new();
        // Spans are disabled without a subscriber; metadata is still there.
        assert_eq!(
            attempt_span(job, TaskHandle::new()).metadata().map(|m| m.name()),
            Some("primer_orca.attempt")
        );
        assert_eq!(
            allocate_span(job).metadata().map(|m| m.name()),
            Some("primer_orca.allocate")
        );
        assert_eq!(
            sweep_span("lease").metadata().map(|m| m.name()),
            Some("primer_orca.sweep")
        );
    }

    #[test]
    fn test_attempt_timer() {
        let job = JobId::new();
        let timer = record_attempt_start(job);
        assert_eq!(timer.job_id(), job);

        std::thread::sleep(std::time::Duration::from_millis(1));
        assert!(timer.elapsed().as_nanos() > 0);

        record_attempt_end(timer, "completed");
    }
}
