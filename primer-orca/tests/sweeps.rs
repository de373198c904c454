//! Reconciliation sweeps driven through a full executor.

use primer_orca::*;
use primer_orca_testkit::{Harness, JobFixture};

const WORKER: &str = "primer_run-200-w0";

fn lease_sweep(harness: &Harness) -> LeaseSweep {
    LeaseSweep::from_executor(&harness.executor)
}

fn orphan_sweep(harness: &Harness) -> OrphanSweep {
    OrphanSweep::from_executor(&harness.executor)
}

#[tokio::test]
async fn test_lease_sweep_keeps_live_and_reclaims_leaked() {
    let harness = Harness::new();
    let ledger = harness.executor.ledger();

    let running = harness.submit(JobFixture::new()).await;
    harness
        .queue
        .mark_started(running.task_handle.unwrap(), WORKER);
    ledger.set(running.id, 4).await.unwrap();

    let leaked = harness.submit(JobFixture::new()).await;
    harness.queue.mark_started(leaked.task_handle.unwrap(), WORKER);
    harness.queue.abandon(leaked.task_handle.unwrap());
    ledger.set(leaked.id, 3).await.unwrap();

    let deleted = JobId::new();
    ledger.set(deleted, 1).await.unwrap();

    let report = lease_sweep(&harness).run().await.unwrap();
    assert_eq!(report.examined, 3);
    assert_eq!(report.repaired, 2);
    assert_eq!(ledger.get(running.id).await.unwrap(), Some(4));
    assert_eq!(ledger.get(leaked.id).await.unwrap(), None);
    assert_eq!(ledger.get(deleted).await.unwrap(), None);
    assert_eq!(ledger.total_threads().await.unwrap(), 4);

    let text = report.to_string();
    assert!(text.starts_with("lease sweep: 2 of 3 repaired"));
    assert!(text.contains(&format!("job {} ok", running.id)));
    assert!(text.contains(&format!("job {} cleaned", leaked.id)));
    assert!(text.contains(&format!("job {deleted} notfound")));

    assert_eq!(
        harness
            .events
            .count(|p| matches!(p, JobEventPayload::LeaseReclaimed { .. })),
        2
    );
}

#[tokio::test]
async fn test_job_deleted_while_holding_a_lease() {
    let harness = Harness::new();
    let ledger = harness.executor.ledger();
    let job = harness.submit(JobFixture::new()).await;
    harness.queue.mark_started(job.task_handle.unwrap(), WORKER);
    ledger.set(job.id, 6).await.unwrap();

    harness.store.remove_job(job.id);

    let report = lease_sweep(&harness).run().await.unwrap();
    assert_eq!(report.repaired, 1);
    assert_eq!(
        report.lines,
        vec![format!("job {} notfound -  6 threads - job does not exist", job.id)]
    );
    assert_eq!(ledger.get(job.id).await.unwrap(), None);
    assert_eq!(ledger.total_threads().await.unwrap(), 0);
}

#[tokio::test]
async fn test_lease_sweep_is_idempotent() {
    let harness = Harness::new();
    let ledger = harness.executor.ledger();
    ledger.set(JobId::new(), 2).await.unwrap();

    let first = lease_sweep(&harness).run().await.unwrap();
    assert_eq!(first.repaired, 1);

    let second = lease_sweep(&harness).run().await.unwrap();
    assert_eq!(second.examined, 0);
    assert_eq!(second.repaired, 0);
}

#[tokio::test]
async fn test_leaked_lease_frees_capacity_for_next_attempt() {
    let harness = Harness::new();
    let stuck = harness.submit(JobFixture::new()).await;
    harness.executor.ledger().set(stuck.id, 8).await.unwrap();

    let job = harness.submit(JobFixture::new()).await;
    let outcome = harness
        .executor
        .run_attempt(job.id, harness.context(&job, 0))
        .await
        .unwrap();
    assert_eq!(outcome, AttemptOutcome::Completed { threads: 1 });

    lease_sweep(&harness).run().await.unwrap();

    let next = harness.submit(JobFixture::new()).await;
    let outcome = harness
        .executor
        .run_attempt(next.id, harness.context(&next, 0))
        .await
        .unwrap();
    assert_eq!(outcome, AttemptOutcome::Completed { threads: 4 });
}

#[tokio::test]
async fn test_orphaned_job_is_resubmitted_and_completes() {
    let harness = Harness::new();
    let job = harness.submit(JobFixture::new().owner("grace")).await;
    let dead = job.task_handle.unwrap();

    // Worker claims the task, opens a run and dies.
    let delivery = harness.queue.claim(WORKER).await.unwrap().unwrap();
    assert_eq!(delivery.handle, dead);
    harness.store.insert_run(&Run::new(job.id)).await.unwrap();
    harness.queue.abandon(dead);
    assert_eq!(harness.status(&job).await, JobStatus::PendingRetry);

    let report = orphan_sweep(&harness).run().await.unwrap();
    assert_eq!(report.examined, 1);
    assert_eq!(report.repaired, 1);

    let resubmitted = harness.reload(&job).await;
    let fresh = resubmitted.task_handle.unwrap();
    assert_ne!(fresh, dead);
    assert_eq!(
        report.lines,
        vec![format!("job {} resubmitted - new task {fresh}", job.id)]
    );
    assert_eq!(harness.status(&job).await, JobStatus::Pending);

    let again = orphan_sweep(&harness).run().await.unwrap();
    assert_eq!(again.repaired, 0);

    let (delivery, result) = harness.claim_and_run(WORKER).await.unwrap();
    assert_eq!(delivery.handle, fresh);
    assert!(matches!(result, Ok(AttemptOutcome::Completed { .. })));
    assert_eq!(harness.status(&job).await, JobStatus::Completed);
    assert!(orphan_sweep(&harness).run().await.unwrap().examined == 0);
}

#[tokio::test]
async fn test_orphan_sweep_leaves_live_and_finished_jobs_alone() {
    let harness = Harness::new();

    let live = harness.submit(JobFixture::new()).await;
    harness.queue.mark_started(live.task_handle.unwrap(), "other-host-w3");

    let waiting = harness.submit(JobFixture::new()).await;

    let done = harness.submit(JobFixture::new()).await;
    harness
        .executor
        .run_attempt(done.id, harness.context(&done, 0))
        .await
        .unwrap();

    let report = orphan_sweep(&harness).run().await.unwrap();
    assert_eq!(report.examined, 1);
    assert_eq!(report.repaired, 0);
    assert_eq!(harness.reload(&live).await.task_handle, live.task_handle);
    assert_eq!(harness.reload(&waiting).await.task_handle, waiting.task_handle);
    assert_eq!(
        harness
            .events
            .count(|p| matches!(p, JobEventPayload::Resubmitted { .. })),
        0
    );
}
