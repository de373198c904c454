//! Reconciliation sweeps.
//!
//! Both sweeps are stateless between runs and read the live worker set once
//! per pass, so a whole pass sees one snapshot of it.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use tracing::{Instrument, debug, info, warn};

use crate::events::{JobEvent, JobEventPayload, JobEventPublisher};
use crate::executor::AttemptExecutor;
use crate::job::{JobId, TaskHandle};
use crate::lease::{ResourceLedger, ThreadLease};
use crate::queue::{TaskQueue, TaskState};
use crate::store::JobStore;
use crate::telemetry;

/// Human-readable tally of one sweep pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub sweep: &'static str,
    /// Entries or jobs looked at.
    pub examined: usize,
    /// Entries deleted or jobs resubmitted.
    pub repaired: usize,
    /// Entries or jobs skipped because a store or queue call failed.
    pub errors: usize,
    pub lines: Vec<String>,
}

impl SweepReport {
    fn new(sweep: &'static str) -> Self {
        Self {
            sweep,
            ..Self::default()
        }
    }
}

impl fmt::Display for SweepReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} sweep: {} of {} repaired",
            self.sweep, self.repaired, self.examined
        )?;
        if self.errors > 0 {
            write!(f, ", {} failed", self.errors)?;
        }
        for line in &self.lines {
            write!(f, "\n {line}")?;
        }
        Ok(())
    }
}

/// Deletes leases whose job is gone or whose task no longer runs anywhere.
#[derive(Clone)]
pub struct LeaseSweep {
    ledger: ResourceLedger,
    store: Arc<dyn JobStore>,
    queue: Arc<dyn TaskQueue>,
    events: Arc<dyn JobEventPublisher>,
    worker_pattern: String,
}

impl fmt::Debug for LeaseSweep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseSweep")
            .field("worker_pattern", &self.worker_pattern)
            .finish_non_exhaustive()
    }
}

impl LeaseSweep {
    pub fn new(
        ledger: ResourceLedger,
        store: Arc<dyn JobStore>,
        queue: Arc<dyn TaskQueue>,
        events: Arc<dyn JobEventPublisher>,
        worker_pattern: impl Into<String>,
    ) -> Self {
        Self {
            ledger,
            store,
            queue,
            events,
            worker_pattern: worker_pattern.into(),
        }
    }

    pub fn from_executor(executor: &AttemptExecutor) -> Self {
        Self::new(
            executor.ledger().clone(),
            executor.store(),
            executor.queue(),
            executor.events(),
            executor.config().attempt_worker_pattern.clone(),
        )
    }

    pub async fn run(&self) -> anyhow::Result<SweepReport> {
        self.sweep().instrument(telemetry::sweep_span("lease")).await
    }

    async fn sweep(&self) -> anyhow::Result<SweepReport> {
        let mut report = SweepReport::new("lease");
        let entries = self.ledger.entries().await?;
        if entries.is_empty() {
            debug!("no threads leased");
            return Ok(report);
        }

        let live = self.queue.live_task_ids(&self.worker_pattern).await?;
        for lease in entries {
            report.examined += 1;
            match self.examine(&lease, &live).await {
                Ok((repaired, line)) => {
                    if repaired {
                        report.repaired += 1;
                    }
                    report.lines.push(line);
                }
                Err(err) => {
                    warn!(job_id = %lease.job_id, error = %err, "failed to check lease");
                    report.errors += 1;
                    report
                        .lines
                        .push(format!("job {} error    - {err:#}", lease.job_id));
                }
            }
        }

        telemetry::record_threads_leased(self.ledger.total_threads().await?);
        info!(
            examined = report.examined,
            reclaimed = report.repaired,
            errors = report.errors,
            "lease sweep finished"
        );
        Ok(report)
    }

    /// Reclaim `lease` unless its job's task is live. Returns whether it was
    /// reclaimed and the report line.
    async fn examine(
        &self,
        lease: &ThreadLease,
        live: &BTreeSet<TaskHandle>,
    ) -> anyhow::Result<(bool, String)> {
        let job_id = lease.job_id;
        let Some(job) = self.store.load_job(job_id).await? else {
            self.reclaim(job_id, lease.threads).await?;
            return Ok((
                true,
                format!(
                    "job {job_id} notfound - {:2} threads - job does not exist",
                    lease.threads
                ),
            ));
        };

        let handle = job
            .task_handle
            .map_or_else(|| "-".to_string(), |h| h.to_string());
        if job.task_handle.is_some_and(|h| live.contains(&h)) {
            return Ok((
                false,
                format!(
                    "job {job_id} ok       - {:2} threads - {handle} running",
                    lease.threads
                ),
            ));
        }

        self.reclaim(job_id, lease.threads).await?;
        Ok((
            true,
            format!(
                "job {job_id} cleaned  - {:2} threads - {handle} not running",
                lease.threads
            ),
        ))
    }

    async fn reclaim(&self, job_id: JobId, threads: u32) -> anyhow::Result<()> {
        self.ledger.delete(job_id).await?;
        telemetry::record_lease_reclaimed(job_id, Some(threads));
        let event = JobEvent::new(
            None,
            format!("lease-reclaimed-{job_id}"),
            JobEventPayload::LeaseReclaimed { job_id },
        );
        if let Err(err) = self.events.publish(event).await {
            warn!(error = %err, "failed to publish lease reclaim");
        }
        Ok(())
    }
}

/// Gives a fresh attempt to jobs whose worker died after starting them.
///
/// A candidate has no result, a task the result store reports as started,
/// and either no run or an open one. It is resubmitted when its task runs
/// on no worker at all.
#[derive(Clone)]
pub struct OrphanSweep {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn TaskQueue>,
    events: Arc<dyn JobEventPublisher>,
}

impl fmt::Debug for OrphanSweep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrphanSweep").finish_non_exhaustive()
    }
}

impl OrphanSweep {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn TaskQueue>,
        events: Arc<dyn JobEventPublisher>,
    ) -> Self {
        Self {
            store,
            queue,
            events,
        }
    }

    pub fn from_executor(executor: &AttemptExecutor) -> Self {
        Self::new(executor.store(), executor.queue(), executor.events())
    }

    pub async fn run(&self) -> anyhow::Result<SweepReport> {
        self.sweep().instrument(telemetry::sweep_span("orphan")).await
    }

    async fn sweep(&self) -> anyhow::Result<SweepReport> {
        let mut report = SweepReport::new("orphan");
        let candidates = self.store.orphan_candidates().await?;
        if candidates.is_empty() {
            return Ok(report);
        }

        let live = self.queue.live_task_ids("*").await?;
        for job in candidates {
            let Some(previous) = job.task_handle else {
                continue;
            };
            match self.queue.status(previous).await {
                Ok(Some(TaskState::Started)) => {}
                Ok(_) => continue,
                Err(err) => {
                    warn!(job_id = %job.id, error = %err, "failed to read task status");
                    report.examined += 1;
                    report.errors += 1;
                    report.lines.push(format!("job {} error - {err:#}", job.id));
                    continue;
                }
            }
            report.examined += 1;
            if live.contains(&previous) {
                continue;
            }

            match self.resubmit(job.id, previous).await {
                Ok(handle) => {
                    report.repaired += 1;
                    report
                        .lines
                        .push(format!("job {} resubmitted - new task {handle}", job.id));
                }
                Err(err) => {
                    warn!(job_id = %job.id, error = %err, "failed to resubmit orphaned job");
                    report.errors += 1;
                    report.lines.push(format!("job {} error - {err:#}", job.id));
                }
            }
        }

        info!(
            examined = report.examined,
            resubmitted = report.repaired,
            errors = report.errors,
            "orphan sweep finished"
        );
        Ok(report)
    }

    async fn resubmit(&self, job_id: JobId, previous: TaskHandle) -> anyhow::Result<TaskHandle> {
        let handle = self.queue.enqueue(job_id).await?;
        self.store.update_task_handle(job_id, Some(handle)).await?;
        telemetry::record_job_resubmitted(job_id, Some(previous), handle);

        let event = JobEvent::new(
            Some(handle),
            format!("resubmitted-{handle}"),
            JobEventPayload::Resubmitted {
                job_id,
                previous: Some(previous),
                handle,
            },
        );
        if let Err(err) = self.events.publish(event).await {
            warn!(error = %err, "failed to publish resubmission");
        }
        Ok(handle)
    }
}
