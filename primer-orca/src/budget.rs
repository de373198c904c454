use std::sync::Arc;
use tracing::{Instrument, debug};

use crate::job::Job;
use crate::lease::ResourceLedger;
use crate::run::Run;
use crate::store::JobStore;
use crate::telemetry;

/// Thread ceilings applied to every attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AllocationLimits {
    /// Threads shared by every attempt across all instances.
    pub max_threads: u32,
    /// Threads a single attempt may use on one instance.
    pub max_threads_per_instance: u32,
    /// Restart budget a job gets when it does not ask for one.
    pub default_restarts: Option<i64>,
}

impl AllocationLimits {
    pub fn new(max_threads: u32, max_threads_per_instance: u32) -> Self {
        Self {
            max_threads,
            max_threads_per_instance,
            default_restarts: None,
        }
    }

    pub fn with_default_restarts(mut self, restarts: i64) -> Self {
        self.default_restarts = Some(restarts);
        self
    }
}

/// Everything the sizing decision depends on.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct AllocationInputs {
    pub global_ceiling: u32,
    pub per_instance_ceiling: u32,
    /// Sum of leases held by other jobs.
    pub leased_elsewhere: u64,
    pub desired_runs: i64,
    pub restarts: Option<i64>,
    pub default_restarts: Option<i64>,
    /// Threads held by the previous attempt when it was killed.
    pub crashed_with: Option<u32>,
}

/// Size an attempt.
///
/// The clamps run in a fixed order and each one sees the previous result:
/// free capacity, crash back-off, the job's own run count, the restart
/// penalty, the per-instance ceiling and finally a floor of one thread.
pub fn compute_threads(inputs: &AllocationInputs) -> u32 {
    let leased = i64::try_from(inputs.leased_elsewhere).unwrap_or(i64::MAX);
    let mut remaining = i64::from(inputs.global_ceiling).saturating_sub(leased);

    if let Some(previous) = inputs
        .crashed_with
        .map(i64::from)
        .filter(|previous| *previous <= remaining)
    {
        remaining = previous - 1;
    }

    remaining = remaining.min(inputs.desired_runs);

    if matches!(
        (inputs.restarts, inputs.default_restarts),
        (Some(restarts), Some(default)) if restarts > default
    ) {
        remaining -= 1;
    }

    remaining = remaining.min(i64::from(inputs.per_instance_ceiling));

    // `remaining` is at least 1 and at most the per-instance ceiling here.
    u32::try_from(remaining.max(1)).unwrap_or(1)
}

/// Sizes attempts against the shared [`ResourceLedger`].
///
/// The read-sum-then-write sequence is not atomic. Two instances sizing at
/// the same moment can both see the same free capacity; the lease sweep
/// reclaims what they over-commit once either attempt ends.
#[derive(Clone)]
pub struct ThreadAllocator {
    ledger: ResourceLedger,
    store: Arc<dyn JobStore>,
    limits: AllocationLimits,
}

impl std::fmt::Debug for ThreadAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadAllocator")
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl ThreadAllocator {
    pub fn new(ledger: ResourceLedger, store: Arc<dyn JobStore>, limits: AllocationLimits) -> Self {
        Self {
            ledger,
            store,
            limits,
        }
    }

    pub fn limits(&self) -> AllocationLimits {
        self.limits
    }

    pub fn ledger(&self) -> &ResourceLedger {
        &self.ledger
    }

    /// Compute and lease threads for `current_run` of `job`.
    ///
    /// Any lease the job already holds is dropped first so that attempts
    /// never add up.
    pub async fn allocate(&self, job: &Job, current_run: &Run) -> anyhow::Result<u32> {
        let span = telemetry::allocate_span(job.id);
        async move {
            self.ledger.delete(job.id).await?;
            let leased_elsewhere = self.ledger.total_threads().await?;

            let runs = self.store.list_runs(job.id).await?;
            let crashed_with = runs
                .iter()
                .rev()
                .find(|run| run.id != current_run.id)
                .and_then(Run::crashed_with_threads);

            let inputs = AllocationInputs {
                global_ceiling: self.limits.max_threads,
                per_instance_ceiling: self.limits.max_threads_per_instance,
                leased_elsewhere,
                desired_runs: job.desired_runs(),
                restarts: job.restarts(),
                default_restarts: self.limits.default_restarts,
                crashed_with,
            };
            let threads = compute_threads(&inputs);

            self.ledger.set(job.id, threads).await?;
            debug!(
                job_id = %job.id,
                threads,
                leased_elsewhere,
                crashed_with = ?crashed_with,
                "threads allocated"
            );
            telemetry::record_threads_leased(self.ledger.total_threads().await?);
            Ok(threads)
        }
        .instrument(span)
        .await
    }
}
