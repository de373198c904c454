//! Worker pool and housekeeper behavior of the in-process runtime.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use primer_orca::*;
use primer_orca_testkit::{Harness, JobFixture, RecordingEvents, Script, ScriptedProcessRunner};
use tokio::time::{sleep, timeout};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

fn fast_runtime_config() -> OrchestratorRuntimeConfig {
    OrchestratorRuntimeConfig {
        poll_interval_ms: 10,
        backoff_ms: 20,
        shutdown_timeout_secs: 5,
        ..OrchestratorRuntimeConfig::default()
    }
}

fn retry_immediately() -> OrchestratorConfig {
    OrchestratorConfig {
        retry_delay_secs: 0,
        ..OrchestratorConfig::default()
    }
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let waited = timeout(Duration::from_secs(10), async {
        while !check().await {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

#[tokio::test]
async fn test_worker_pool_runs_all_jobs() {
    init_tracing();
    let harness = Harness::new();
    let mut jobs = Vec::new();
    for owner in ["ada", "grace", "edsger"] {
        jobs.push(harness.submit(JobFixture::new().owner(owner)).await);
    }

    let runtime = harness.runtime(fast_runtime_config());
    runtime.spawn_worker_pool(2).await;

    let (harness, jobs) = (&harness, &jobs);
    eventually("all jobs completed", move || async move {
        for job in jobs {
            if harness.status(job).await != JobStatus::Completed {
                return false;
            }
        }
        true
    })
    .await;
    runtime.shutdown().await.unwrap();

    harness.runner.assert_call_count_eq(3);
    assert_eq!(harness.executor.ledger().total_threads().await.unwrap(), 0);
    assert!(harness.tmp_files().is_empty());
    for job in jobs {
        assert_eq!(harness.runs(job).await.len(), 1);
    }
}

#[tokio::test]
async fn test_failed_attempt_is_retried_by_the_pool() {
    init_tracing();
    let runner = ScriptedProcessRunner::new().then(Script::Exit(1));
    let harness = Harness::build(retry_immediately(), runner);
    let job = harness.submit(JobFixture::new()).await;

    let runtime = harness.runtime(fast_runtime_config());
    runtime.spawn_worker_pool(1).await;

    let (harness, job) = (&harness, &job);
    eventually("job completed after a retry", move || async move {
        harness.status(job).await == JobStatus::Completed
    })
    .await;
    runtime.shutdown().await.unwrap();

    harness.runner.assert_call_count_eq(2);
    let runs = harness.runs(job).await;
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].exit_code(), Some(1));
    assert_eq!(runs[1].exit_code(), Some(0));
}

#[tokio::test]
async fn test_job_fails_once_retry_ceiling_is_reached() {
    init_tracing();
    let config = OrchestratorConfig {
        max_runs: 2,
        ..retry_immediately()
    };
    let harness = Harness::build(config, ScriptedProcessRunner::with_default(Script::Exit(1)));
    let job = harness.submit(JobFixture::new()).await;
    let handle = job.task_handle.unwrap();

    let runtime = harness.runtime(fast_runtime_config());
    runtime.spawn_worker_pool(1).await;

    let (harness, job) = (&harness, &job);
    eventually("job failed", move || async move {
        harness.status(job).await == JobStatus::Failed
    })
    .await;
    runtime.shutdown().await.unwrap();

    // Two optimizer failures, then the third attempt is refused.
    harness.runner.assert_call_count_eq(2);
    let runs = harness.runs(job).await;
    assert_eq!(runs.len(), 3);
    assert_eq!(
        runs[2].log["error"],
        serde_json::json!("max runs reached (3 runs, 2 retries)")
    );
    assert_eq!(
        harness.queue.last_error(handle).as_deref(),
        Some("max runs reached (3 runs, 2 retries)")
    );
    assert!(!harness.store.has_result(job.id).await.unwrap());
}

#[tokio::test]
async fn test_housekeeper_reclaims_leaked_lease() {
    init_tracing();
    let config = OrchestratorConfig {
        sweep_interval_secs: 1,
        ..OrchestratorConfig::default()
    };
    let harness = Harness::with_config(config);
    let ledger = harness.executor.ledger().clone();
    let gone = JobId::new();
    ledger.set(gone, 5).await.unwrap();

    let runtime = harness.runtime(fast_runtime_config());
    runtime.spawn_housekeeper().await;

    let ledger = &ledger;
    eventually("lease reclaimed", move || async move {
        ledger.get(gone).await.unwrap().is_none()
    })
    .await;
    runtime.shutdown().await.unwrap();

    assert_eq!(
        harness
            .events
            .count(|p| matches!(p, JobEventPayload::LeaseReclaimed { .. })),
        1
    );
}

#[tokio::test]
async fn test_shutdown_lets_running_attempt_finish() {
    init_tracing();
    let runner = ScriptedProcessRunner::with_default(Script::Slow(Duration::from_millis(300)));
    let harness = Harness::with_runner(runner);
    let job = harness.submit(JobFixture::new()).await;

    let runtime = harness.runtime(fast_runtime_config());
    runtime.spawn_worker_pool(1).await;
    runtime.spawn_housekeeper().await;

    let (harness, job) = (&harness, &job);
    eventually("job running", move || async move {
        harness.status(job).await == JobStatus::Running
    })
    .await;

    let token = runtime.shutdown_token();
    timeout(Duration::from_secs(5), runtime.shutdown())
        .await
        .expect("shutdown finished in time")
        .unwrap();
    assert!(token.is_cancelled());
    assert!(harness.store.has_result(job.id).await.unwrap());

    let late = harness.submit(JobFixture::new()).await;
    sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.status(&late).await, JobStatus::Pending);
}

#[tokio::test]
async fn test_builder_wires_a_working_runtime() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let config = OrchestratorConfig {
        work_dir: dir.path().to_path_buf(),
        ..OrchestratorConfig::default()
    };
    let store = Arc::new(InMemoryJobStore::new());
    let queue = Arc::new(InMemoryTaskQueue::new());
    let runner = ScriptedProcessRunner::new();
    let events = RecordingEvents::new();
    let mut notices = events.subscribe_jobs();

    let runtime = OrchestratorRuntimeBuilder::new(config)
        .with_runtime_config(fast_runtime_config())
        .with_store(store.clone())
        .with_cache(Arc::new(InMemoryCache::new()))
        .with_queue(queue)
        .with_runner(Arc::new(runner.clone()))
        .with_events(Arc::new(events.clone()))
        .build()
        .unwrap();

    let job = runtime
        .executor()
        .submit_job(JobFixture::new().owner("barbara").build())
        .await
        .unwrap();
    runtime.spawn_worker_pool(1).await;

    let owner = timeout(Duration::from_secs(10), async {
        loop {
            match notices.recv().await {
                Ok(event) => {
                    if let JobEventPayload::Completed { owner, job_id, .. } = event.payload {
                        assert_eq!(job_id, job.id);
                        break owner;
                    }
                }
                Err(err) => panic!("event stream closed: {err}"),
            }
        }
    })
    .await
    .expect("completion notice");
    runtime.shutdown().await.unwrap();

    assert_eq!(owner, "barbara");
    assert!(store.has_result(job.id).await.unwrap());
    runner.assert_call_count_eq(1);
}
