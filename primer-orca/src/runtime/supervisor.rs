use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Duration;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};

use crate::error::AttemptError;
use crate::executor::{AttemptContext, AttemptExecutor, AttemptOutcome};
use crate::queue::{TaskBroker, TaskDelivery, TaskOutcome};
use crate::sweep::{LeaseSweep, OrphanSweep, SweepReport};

use super::worker::WorkerConfig;

/// Configuration for the orchestrator runtime.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorRuntimeConfig {
    /// Prefix of worker ids. Must match the configured attempt worker
    /// pattern, or live attempts look dead to the sweeps.
    pub worker_group: String,
    /// Polling interval when no work is available, in milliseconds.
    pub poll_interval_ms: u64,
    /// Empty polls in a row before a worker backs off.
    pub max_poll_attempts: u32,
    /// Worker backoff in milliseconds.
    pub backoff_ms: u64,
    /// How long `shutdown` waits for each task to wind down.
    pub shutdown_timeout_secs: u64,
}

impl Default for OrchestratorRuntimeConfig {
    fn default() -> Self {
        Self {
            worker_group: "primer_run".to_string(),
            poll_interval_ms: 50,
            max_poll_attempts: 10,
            backoff_ms: 500,
            shutdown_timeout_secs: 30,
        }
    }
}

impl OrchestratorRuntimeConfig {
    /// Configuration of the `index`th worker in this process.
    pub fn worker(&self, index: usize) -> WorkerConfig {
        WorkerConfig::new(format!(
            "{}-{}-w{}",
            self.worker_group,
            std::process::id(),
            index
        ))
        .with_poll_interval(self.poll_interval_ms)
        .with_max_poll_attempts(self.max_poll_attempts)
        .with_backoff(self.backoff_ms)
    }
}

/// Token for signaling graceful shutdown to workers.
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    inner: Arc<ShutdownTokenInner>,
}

#[derive(Debug)]
struct ShutdownTokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl ShutdownToken {
    /// Create a new shutdown token.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownTokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Check if cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until cancelled.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// What a worker reports to the broker for a finished attempt.
///
/// Stand-downs and completions both succeed. Retryable faults are retried
/// after `retry_delay` until the task has been retried `max_runs` times;
/// everything else fails the task.
pub fn task_outcome(
    result: &Result<AttemptOutcome, AttemptError>,
    retries: u32,
    max_runs: u32,
    retry_delay: Duration,
) -> TaskOutcome {
    match result {
        Ok(_) => TaskOutcome::Succeeded,
        Err(err) if err.is_retryable() && retries < max_runs => {
            TaskOutcome::Retry { delay: retry_delay }
        }
        Err(err) => TaskOutcome::Failed {
            error: Some(err.to_string()),
        },
    }
}

/// Runs attempt workers and the reconciliation housekeeper in-process.
pub struct OrchestratorRuntime {
    config: OrchestratorRuntimeConfig,
    executor: AttemptExecutor,
    broker: Arc<dyn TaskBroker>,
    lease_sweep: LeaseSweep,
    orphan_sweep: OrphanSweep,
    shutdown_token: ShutdownToken,
    worker_handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl fmt::Debug for OrchestratorRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let worker_count = self
            .worker_handles
            .try_lock()
            .map(|handles| handles.len())
            .unwrap_or_default();

        f.debug_struct("OrchestratorRuntime")
            .field("config", &self.config)
            .field("executor", &self.executor)
            .field("worker_count", &worker_count)
            .field("shutdown_cancelled", &self.shutdown_token.is_cancelled())
            .finish()
    }
}

impl OrchestratorRuntime {
    /// Create a new orchestrator runtime around `executor`.
    pub fn new(
        config: OrchestratorRuntimeConfig,
        executor: AttemptExecutor,
        broker: Arc<dyn TaskBroker>,
    ) -> Self {
        Self {
            lease_sweep: LeaseSweep::from_executor(&executor),
            orphan_sweep: OrphanSweep::from_executor(&executor),
            config,
            executor,
            broker,
            shutdown_token: ShutdownToken::new(),
            worker_handles: Mutex::new(Vec::new()),
        }
    }

    /// Get the runtime configuration.
    pub fn config(&self) -> &OrchestratorRuntimeConfig {
        &self.config
    }

    pub fn executor(&self) -> &AttemptExecutor {
        &self.executor
    }

    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown_token.clone()
    }

    /// Run both reconciliation sweeps once.
    pub async fn sweep_once(&self) -> anyhow::Result<(SweepReport, SweepReport)> {
        let leases = self.lease_sweep.run().await?;
        let orphans = self.orphan_sweep.run().await?;
        Ok((leases, orphans))
    }

    /// Gracefully shut down the runtime and all workers.
    ///
    /// Attempts already running are allowed to finish within the shutdown
    /// timeout; their optimizer process is killed when the task is dropped.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        tracing::info!("Initiating graceful shutdown of orchestrator runtime");

        self.shutdown_token.cancel();

        let handles = {
            let mut guard = self.worker_handles.lock().await;
            std::mem::take(&mut *guard)
        };

        let limit = std::time::Duration::from_secs(self.config.shutdown_timeout_secs);
        for mut handle in handles {
            match tokio::time::timeout(limit, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("Worker task failed: {:?}", e),
                Err(_) => {
                    tracing::warn!("Worker task timed out during shutdown");
                    handle.abort();
                }
            }
        }

        tracing::info!("Orchestrator runtime shutdown complete");
        Ok(())
    }

    /// Spawn `parallelism` attempt workers.
    pub async fn spawn_worker_pool(&self, parallelism: usize) {
        let mut handles = self.worker_handles.lock().await;
        let offset = handles.len();
        for i in 0..parallelism {
            let worker = self.config.worker(offset + i);
            let executor = self.executor.clone();
            let broker = Arc::clone(&self.broker);
            let shutdown = self.shutdown_token.clone();

            handles.push(tokio::spawn(async move {
                Self::worker_loop(worker, executor, broker, shutdown).await;
            }));
        }
    }

    /// Spawn the housekeeper running both sweeps every sweep interval.
    pub async fn spawn_housekeeper(&self) {
        let interval = self.executor.config().sweep_interval();
        let lease_sweep = self.lease_sweep.clone();
        let orphan_sweep = self.orphan_sweep.clone();
        let shutdown = self.shutdown_token.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("Housekeeper shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        match lease_sweep.run().await {
                            Ok(report) => tracing::info!("{report}"),
                            Err(err) => tracing::warn!("housekeeper lease sweep error: {err}"),
                        }
                        match orphan_sweep.run().await {
                            Ok(report) => tracing::info!("{report}"),
                            Err(err) => tracing::warn!("housekeeper orphan sweep error: {err}"),
                        }
                    }
                }
            }
        });
        self.worker_handles.lock().await.push(handle);
    }

    async fn worker_loop(
        worker: WorkerConfig,
        executor: AttemptExecutor,
        broker: Arc<dyn TaskBroker>,
        shutdown: ShutdownToken,
    ) {
        let mut idle_polls = 0u32;
        loop {
            if shutdown.is_cancelled() {
                tracing::info!("Worker {} shutting down", worker.worker_id);
                break;
            }

            let delay = match broker.claim(&worker.worker_id).await {
                Ok(Some(delivery)) => {
                    idle_polls = 0;
                    Self::process(&worker, &executor, broker.as_ref(), delivery).await;
                    continue;
                }
                Ok(None) => {
                    idle_polls = idle_polls.saturating_add(1);
                    worker.idle_delay(idle_polls)
                }
                Err(err) => {
                    tracing::warn!(worker = %worker.worker_id, "claim error: {err}");
                    std::time::Duration::from_millis(worker.backoff_ms)
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn process(
        worker: &WorkerConfig,
        executor: &AttemptExecutor,
        broker: &dyn TaskBroker,
        delivery: TaskDelivery,
    ) {
        tracing::debug!(
            worker = %worker.worker_id,
            job_id = %delivery.job_id,
            task = %delivery.handle,
            retries = delivery.retries,
            "claimed task"
        );

        let result = executor
            .run_attempt(
                delivery.job_id,
                AttemptContext::new(delivery.handle, delivery.retries),
            )
            .await;

        let config = executor.config();
        let outcome = task_outcome(
            &result,
            delivery.retries,
            config.max_runs,
            config.retry_delay(),
        );
        if let TaskOutcome::Failed { error } = &outcome {
            tracing::error!(
                job_id = %delivery.job_id,
                task = %delivery.handle,
                error = ?error,
                "task failed permanently"
            );
        }
        if let Err(err) = broker.finish(delivery.handle, outcome).await {
            tracing::error!("broker finish error: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;
    use tokio::time::timeout;

    #[test]
    fn test_task_outcome_mapping() {
        let delay = Duration::seconds(30);
        let done: Result<AttemptOutcome, AttemptError> =
            Ok(AttemptOutcome::Completed { threads: 2 });
        assert_eq!(task_outcome(&done, 0, 5, delay), TaskOutcome::Succeeded);
        assert_eq!(
            task_outcome(&Ok(AttemptOutcome::Superseded), 3, 5, delay),
            TaskOutcome::Succeeded
        );

        let exit = Err(AttemptError::ProcessExit { code: 1 });
        assert_eq!(task_outcome(&exit, 4, 5, delay), TaskOutcome::Retry { delay });
        assert_eq!(
            task_outcome(&exit, 5, 5, delay),
            TaskOutcome::Failed {
                error: Some("optimizer exited with code 1".into())
            }
        );

        let completed = Err(AttemptError::AlreadyCompleted);
        assert!(matches!(
            task_outcome(&completed, 0, 5, delay),
            TaskOutcome::Failed { .. }
        ));
    }

    #[test]
    fn test_worker_ids_carry_group_and_pid() {
        let config = OrchestratorRuntimeConfig::default();
        let worker = config.worker(3);
        assert_eq!(
            worker.worker_id,
            format!("primer_run-{}-w3", std::process::id())
        );
        assert!(crate::cache::glob_match("*primer_run*", &worker.worker_id));
    }

    #[tokio::test]
    async fn test_shutdown_token_shared_state() {
        let token = ShutdownToken::new();
        let clone1 = token.clone();
        let clone2 = token.clone();

        token.cancel();

        assert!(clone1.is_cancelled());
        assert!(clone2.is_cancelled());

        timeout(StdDuration::from_secs(1), clone1.cancelled())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_token_cancelled_wakes_clones() {
        let token = ShutdownToken::new();
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let clone = token.clone();
                tokio::spawn(async move { clone.cancelled().await })
            })
            .collect();

        tokio::time::sleep(StdDuration::from_millis(50)).await;
        token.cancel();

        let results = timeout(StdDuration::from_secs(5), futures::future::join_all(handles))
            .await
            .expect("workers did not observe cancellation within 5 seconds");

        for r in results {
            r.expect("worker task panicked");
        }
    }

    #[tokio::test]
    async fn test_shutdown_token_default_not_cancelled() {
        let token = ShutdownToken::default();
        assert!(!token.is_cancelled());
    }
}
