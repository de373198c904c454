use primer_orca::*;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

use crate::events::RecordingEvents;
use crate::job::JobFixture;
use crate::mock::ScriptedProcessRunner;

/// In-memory backends, a scripted optimizer and an executor wired together
/// over a temporary work directory.
pub struct Harness {
    pub dir: TempDir,
    pub config: Arc<OrchestratorConfig>,
    pub store: Arc<InMemoryJobStore>,
    pub cache: Arc<InMemoryCache>,
    pub queue: Arc<InMemoryTaskQueue>,
    pub runner: ScriptedProcessRunner,
    pub events: RecordingEvents,
    pub executor: AttemptExecutor,
}

impl std::fmt::Debug for Harness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Harness")
            .field("dir", &self.dir.path())
            .field("runner", &self.runner)
            .finish_non_exhaustive()
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(OrchestratorConfig::default())
    }

    /// `config.work_dir` is replaced by a fresh temporary directory.
    pub fn with_config(config: OrchestratorConfig) -> Self {
        Self::build(config, ScriptedProcessRunner::new())
    }

    pub fn with_runner(runner: ScriptedProcessRunner) -> Self {
        Self::build(OrchestratorConfig::default(), runner)
    }

    pub fn build(mut config: OrchestratorConfig, runner: ScriptedProcessRunner) -> Self {
        let dir = tempfile::tempdir().expect("create work dir");
        config.work_dir = dir.path().to_path_buf();
        let config = Arc::new(config);

        let store = Arc::new(InMemoryJobStore::new());
        let cache = Arc::new(InMemoryCache::new());
        let queue = Arc::new(InMemoryTaskQueue::new());
        let events = RecordingEvents::new();
        let executor = AttemptExecutor::new(
            Arc::clone(&config),
            store.clone(),
            cache.clone(),
            queue.clone(),
            Arc::new(runner.clone()),
            Arc::new(events.clone()),
        );

        Self {
            dir,
            config,
            store,
            cache,
            queue,
            runner,
            events,
            executor,
        }
    }

    /// Submit a job built from `fixture` against the configured registry.
    pub async fn submit(&self, fixture: JobFixture) -> Job {
        self.executor
            .submit_job(fixture.build_with(&self.config.parameters))
            .await
            .expect("submit job")
    }

    /// Context matching the task currently recorded on `job`.
    pub fn context(&self, job: &Job, retries: u32) -> AttemptContext {
        AttemptContext::new(job.task_handle.expect("job has a task handle"), retries)
    }

    /// Claim the next due task as `worker_id` and run its attempt, leaving
    /// the task started so the caller decides how it finishes.
    pub async fn claim_and_run(
        &self,
        worker_id: &str,
    ) -> Option<(TaskDelivery, Result<AttemptOutcome, AttemptError>)> {
        let delivery = self.queue.claim(worker_id).await.expect("claim")?;
        let result = self
            .executor
            .run_attempt(
                delivery.job_id,
                AttemptContext::new(delivery.handle, delivery.retries),
            )
            .await;
        Some((delivery, result))
    }

    /// Reload `job` from the store.
    pub async fn reload(&self, job: &Job) -> Job {
        self.store
            .load_job(job.id)
            .await
            .expect("load job")
            .expect("job exists")
    }

    pub async fn runs(&self, job: &Job) -> Vec<Run> {
        self.store.list_runs(job.id).await.expect("list runs")
    }

    pub async fn status(&self, job: &Job) -> JobStatus {
        let job = self.reload(job).await;
        self.executor
            .status_resolver()
            .status(&job)
            .await
            .expect("resolve status")
    }

    /// Files currently in the temp directory.
    pub fn tmp_files(&self) -> Vec<PathBuf> {
        match std::fs::read_dir(self.config.tmp_dir()) {
            Ok(entries) => entries.filter_map(|e| e.ok().map(|e| e.path())).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Runtime sharing this harness's executor and queue.
    pub fn runtime(&self, config: OrchestratorRuntimeConfig) -> OrchestratorRuntime {
        OrchestratorRuntime::new(config, self.executor.clone(), self.queue.clone())
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}
