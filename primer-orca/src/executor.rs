use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use serde_json::json;
use tracing::{Instrument, debug, error, info, warn};

use crate::budget::ThreadAllocator;
use crate::cache::SharedCache;
use crate::config::OrchestratorConfig;
use crate::error::AttemptError;
use crate::events::{JobEvent, JobEventPayload, JobEventPublisher};
use crate::job::{Job, JobId, TaskHandle};
use crate::lease::ResourceLedger;
use crate::liveness::LivenessProbe;
use crate::process::{CommandLine, ProcessOutput, ProcessRunner};
use crate::queue::TaskQueue;
use crate::run::{OutputPrefixes, Run, RunLedger, RunLog};
use crate::status::StatusResolver;
use crate::store::JobStore;
use crate::telemetry;

/// Run log reason for an attempt that stood down for a newer live one.
pub const SUPERSEDED_REASON: &str = "task handle changed, skipping";

/// Identity of the task invoking an attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttemptContext {
    pub task_handle: TaskHandle,
    /// Times the task queue has already retried this task.
    pub retries: u32,
}

impl AttemptContext {
    pub fn new(task_handle: TaskHandle, retries: u32) -> Self {
        Self {
            task_handle,
            retries,
        }
    }
}

/// How an attempt ended when it did not fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The optimizer succeeded and the job's result exists.
    Completed { threads: u32 },
    /// A newer live attempt owns the job.
    Superseded,
}

impl AttemptOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            AttemptOutcome::Completed { .. } => "completed",
            AttemptOutcome::Superseded => "superseded",
        }
    }
}

/// Temporary files belonging to one job's attempts.
///
/// Names depend only on the job, so a retry overwrites what a crashed
/// attempt left behind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttemptPaths {
    pub primers: PathBuf,
    pub outputs: OutputPrefixes,
}

impl AttemptPaths {
    pub fn for_job(tmp_dir: &Path, job: &Job) -> Self {
        let stem = format!("job_{}", job.id);
        Self {
            primers: tmp_dir.join(format!(
                "{stem}_good_pairs_{}.fasta",
                job.primer_pairs.id
            )),
            outputs: OutputPrefixes {
                init: tmp_dir.join(format!("{stem}_init")),
                out: tmp_dir.join(format!("{stem}_out")),
            },
        }
    }

    pub fn files(&self) -> Vec<PathBuf> {
        std::iter::once(self.primers.clone())
            .chain(self.outputs.files())
            .collect()
    }

    /// Delete every file, ignoring ones that were never written.
    pub async fn cleanup(&self) {
        for path in self.files() {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => warn!(path = %path.display(), error = %err, "failed to remove temp file"),
            }
        }
    }
}

enum Admission {
    Proceed,
    Rejected(AttemptError),
    /// The job belongs to this live task.
    Superseded(TaskHandle),
}

struct Execution {
    threads: u32,
    command: CommandLine,
    output: ProcessOutput,
}

/// Drives single attempts of a job through the run ledger, the thread
/// allocator and the optimizer process.
///
/// `run_attempt` may be invoked any number of times for the same job. Every
/// attempt opens a run, and every failure is written to that run before the
/// error is returned.
#[derive(Clone)]
pub struct AttemptExecutor {
    config: Arc<OrchestratorConfig>,
    store: Arc<dyn JobStore>,
    queue: Arc<dyn TaskQueue>,
    runs: RunLedger,
    allocator: ThreadAllocator,
    probe: LivenessProbe,
    runner: Arc<dyn ProcessRunner>,
    events: Arc<dyn JobEventPublisher>,
}

impl std::fmt::Debug for AttemptExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttemptExecutor")
            .field("binary_path", &self.config.binary_path)
            .field("limits", &self.allocator.limits())
            .finish_non_exhaustive()
    }
}

impl AttemptExecutor {
    pub fn new(
        config: Arc<OrchestratorConfig>,
        store: Arc<dyn JobStore>,
        cache: Arc<dyn SharedCache>,
        queue: Arc<dyn TaskQueue>,
        runner: Arc<dyn ProcessRunner>,
        events: Arc<dyn JobEventPublisher>,
    ) -> Self {
        let ledger = ResourceLedger::with_ttl(Arc::clone(&cache), config.lease_ttl());
        let allocator =
            ThreadAllocator::new(ledger, Arc::clone(&store), config.allocation_limits());
        let probe = LivenessProbe::with_ttl(Arc::clone(&queue), cache, config.liveness_ttl());
        Self {
            runs: RunLedger::new(Arc::clone(&store)),
            config,
            store,
            queue,
            allocator,
            probe,
            runner,
            events,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn JobStore> {
        Arc::clone(&self.store)
    }

    pub fn queue(&self) -> Arc<dyn TaskQueue> {
        Arc::clone(&self.queue)
    }

    pub fn ledger(&self) -> &ResourceLedger {
        self.allocator.ledger()
    }

    pub fn probe(&self) -> &LivenessProbe {
        &self.probe
    }

    pub fn events(&self) -> Arc<dyn JobEventPublisher> {
        Arc::clone(&self.events)
    }

    pub fn status_resolver(&self) -> StatusResolver {
        StatusResolver::new(
            Arc::clone(&self.store),
            Arc::clone(&self.queue),
            self.probe.clone(),
            self.config.attempt_worker_pattern.clone(),
        )
    }

    /// Persist a new job and queue its first attempt.
    ///
    /// Returns the job with its task handle set.
    pub async fn submit_job(&self, mut job: Job) -> anyhow::Result<Job> {
        job.task_handle = None;
        self.store.insert_job(&job).await?;

        let handle = self.queue.enqueue(job.id).await?;
        self.store.update_task_handle(job.id, Some(handle)).await?;
        job.task_handle = Some(handle);

        telemetry::record_job_submitted(job.id, handle);
        self.publish(JobEvent::new(
            Some(handle),
            format!("submitted-{}", job.id),
            JobEventPayload::Submitted {
                job_id: job.id,
                handle,
            },
        ))
        .await;
        Ok(job)
    }

    /// Run one attempt of `job_id` on behalf of the task in `ctx`.
    pub async fn run_attempt(
        &self,
        job_id: JobId,
        ctx: AttemptContext,
    ) -> Result<AttemptOutcome, AttemptError> {
        let span = telemetry::attempt_span(job_id, ctx.task_handle);
        let timer = telemetry::record_attempt_start(job_id);

        let result = self.attempt(job_id, ctx).instrument(span).await;

        let label = match &result {
            Ok(outcome) => outcome.label(),
            Err(err) => err.kind(),
        };
        telemetry::record_attempt_end(timer, label);
        result
    }

    async fn attempt(
        &self,
        job_id: JobId,
        ctx: AttemptContext,
    ) -> Result<AttemptOutcome, AttemptError> {
        info!(retries = ctx.retries, "running job attempt");

        let mut job = self
            .store
            .load_job(job_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("job {job_id} not found"))?;
        let mut run = self.runs.create_run(job_id).await?;

        let admission = match self.admit(&mut job, &run, ctx).await {
            Ok(admission) => admission,
            Err(err) => {
                error!(run_id = %run.id, error = %err, "attempt guards failed");
                self.fail_run(&mut run, &format!("{err:#}"), RunLog::new()).await;
                let err = AttemptError::Unexpected(err);
                self.publish_failure(job_id, &run, ctx, &err).await;
                return Err(err);
            }
        };

        match admission {
            Admission::Proceed => {}
            Admission::Rejected(err) => {
                error!(run_id = %run.id, reason = %err, "attempt rejected");
                self.fail_run(&mut run, &err.to_string(), RunLog::new()).await;
                return Err(err);
            }
            Admission::Superseded(current) => {
                warn!(run_id = %run.id, current = %current, "newer attempt is live, standing down");
                let mut extra = RunLog::new();
                extra.insert("task".into(), json!(current.to_string()));
                self.fail_run(&mut run, SUPERSEDED_REASON, extra).await;
                self.publish(JobEvent::new(
                    Some(ctx.task_handle),
                    format!("superseded-{}", run.id),
                    JobEventPayload::Superseded {
                        job_id,
                        run_id: run.id,
                        current,
                    },
                ))
                .await;
                return Ok(AttemptOutcome::Superseded);
            }
        }

        let paths = AttemptPaths::for_job(&self.config.tmp_dir(), &job);
        let executed = self.execute(&job, &mut run, &paths).await;

        if let Err(err) = self.allocator.ledger().delete(job_id).await {
            warn!(error = %err, "failed to release thread lease");
        }

        let result = match executed {
            Ok(execution) if execution.output.success() => {
                self.complete(&job, &mut run, &paths, execution).await
            }
            Ok(execution) => {
                let code = execution.output.exit_code;
                let err = AttemptError::ProcessExit { code };
                warn!(run_id = %run.id, exit_code = code, "optimizer failed");
                let mut extra = diagnostics(&execution.command, &execution.output);
                extra.insert("stdout".into(), json!(execution.output.stdout));
                self.fail_run(&mut run, &err.to_string(), extra).await;
                Err(err)
            }
            Err(err) => {
                warn!(run_id = %run.id, error = %err, "attempt failed");
                self.fail_run(&mut run, &format!("{err:#}"), RunLog::new()).await;
                Err(AttemptError::Unexpected(err))
            }
        };
        paths.cleanup().await;

        if let Err(err) = &result {
            self.publish_failure(job_id, &run, ctx, err).await;
        }
        result
    }

    /// Completion, ceiling and ownership guards. On `Proceed` the job is owned
    /// by `ctx.task_handle`, adopting it from a dead attempt if needed.
    async fn admit(
        &self,
        job: &mut Job,
        run: &Run,
        ctx: AttemptContext,
    ) -> anyhow::Result<Admission> {
        if self.store.has_result(job.id).await? {
            return Ok(Admission::Rejected(AttemptError::AlreadyCompleted));
        }

        let runs = self.store.count_runs(job.id).await?;
        let max_runs = self.config.max_runs;
        if runs > max_runs as usize || ctx.retries > max_runs {
            return Ok(Admission::Rejected(AttemptError::MaxRunsReached {
                runs,
                retries: ctx.retries,
            }));
        }

        if job.task_handle == Some(ctx.task_handle) {
            return Ok(Admission::Proceed);
        }

        if let Some(current) = job.task_handle {
            let live = self
                .probe
                .is_live(current, &self.config.attempt_worker_pattern)
                .await?;
            if live {
                return Ok(Admission::Superseded(current));
            }

            info!(run_id = %run.id, previous = %current, "revoking dead attempt and adopting job");
            self.queue.revoke(current).await?;
            self.probe.forget(current).await?;
        }
        self.store
            .update_task_handle(job.id, Some(ctx.task_handle))
            .await?;
        job.task_handle = Some(ctx.task_handle);
        Ok(Admission::Proceed)
    }

    async fn execute(
        &self,
        job: &Job,
        run: &mut Run,
        paths: &AttemptPaths,
    ) -> anyhow::Result<Execution> {
        if let Some(dir) = paths.primers.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        tokio::fs::write(&paths.primers, &job.primer_pairs.content)
            .await
            .with_context(|| format!("writing {}", paths.primers.display()))?;

        let threads = self.allocator.allocate(job, run).await?;
        self.runs.set_threads(run, threads).await?;

        let command = CommandLine::new(&self.config.binary_path)
            .arg(job.sequence_set.path.display().to_string())
            .arg(paths.primers.display().to_string())
            .arg(format!("--threads={threads}"))
            .args(job.parameters.command_flags())
            .arg(format!("--outInitFileName={}", paths.outputs.init.display()))
            .arg(format!("--outFileName={}", paths.outputs.out.display()));

        self.publish(JobEvent::new(
            job.task_handle,
            format!("attempt-started-{}", run.id),
            JobEventPayload::AttemptStarted {
                job_id: job.id,
                run_id: run.id,
                threads,
            },
        ))
        .await;
        info!(threads, cmd = %command, "starting optimizer");

        let output = self
            .runner
            .run(&command)
            .await
            .with_context(|| format!("running {command}"))?;
        debug!(exit_code = output.exit_code, "optimizer exited");

        Ok(Execution {
            threads,
            command,
            output,
        })
    }

    async fn complete(
        &self,
        job: &Job,
        run: &mut Run,
        paths: &AttemptPaths,
        execution: Execution,
    ) -> Result<AttemptOutcome, AttemptError> {
        let extra = diagnostics(&execution.command, &execution.output);
        if let Err(err) = self
            .runs
            .set_completed(run, &execution.output.stdout, &paths.outputs, extra.clone())
            .await
        {
            warn!(run_id = %run.id, error = %err, "failed to store result");
            self.fail_run(run, &format!("{err:#}"), extra).await;
            return Err(AttemptError::Unexpected(err));
        }

        info!(run_id = %run.id, threads = execution.threads, "job completed");

        let events = Arc::clone(&self.events);
        let event = JobEvent::new(
            job.task_handle,
            format!("completed-{}", job.id),
            JobEventPayload::Completed {
                job_id: job.id,
                run_id: run.id,
                owner: job.owner.clone(),
            },
        );
        tokio::spawn(async move {
            if let Err(err) = events.publish(event).await {
                warn!(error = %err, "failed to publish completion notice");
            }
        });

        Ok(AttemptOutcome::Completed {
            threads: execution.threads,
        })
    }

    async fn fail_run(&self, run: &mut Run, reason: &str, extra: RunLog) {
        if let Err(err) = self.runs.set_failed(run, reason, extra).await {
            error!(run_id = %run.id, error = %err, "failed to record failed run");
        }
    }

    async fn publish_failure(
        &self,
        job_id: JobId,
        run: &Run,
        ctx: AttemptContext,
        err: &AttemptError,
    ) {
        self.publish(JobEvent::new(
            Some(ctx.task_handle),
            format!("attempt-failed-{}", run.id),
            JobEventPayload::AttemptFailed {
                job_id,
                run_id: run.id,
                retryable: err.is_retryable(),
                reason: err.to_string(),
            },
        ))
        .await;
    }

    async fn publish(&self, event: JobEvent) {
        if let Err(err) = self.events.publish(event).await {
            warn!(error = %err, "failed to publish job event");
        }
    }
}

fn diagnostics(command: &CommandLine, output: &ProcessOutput) -> RunLog {
    let mut log = RunLog::new();
    log.insert("exit_code".into(), json!(output.exit_code));
    log.insert("cmd".into(), json!(command.to_string()));
    log.insert("stderr".into(), json!(output.stderr));
    log
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use crate::events::InProcEventBus;
    use crate::job::{PrimerPairsRef, SequenceSetRef};
    use crate::params::ParameterRegistry;
    use crate::queue::InMemoryTaskQueue;
    use crate::store::InMemoryJobStore;
    use async_trait::async_trait;

    struct ExitWith(i32);

    #[async_trait]
    impl ProcessRunner for ExitWith {
        async fn run(&self, _command: &CommandLine) -> anyhow::Result<ProcessOutput> {
            Ok(ProcessOutput {
                exit_code: self.0,
                stdout: "partial".into(),
                stderr: "out of memory".into(),
            })
        }
    }

    fn job() -> Job {
        let parameters = ParameterRegistry::default()
            .resolve(std::iter::empty::<(&str, &str)>())
            .unwrap();
        Job::new(
            "ada",
            parameters,
            SequenceSetRef {
                id: 1,
                path: PathBuf::from("/data/rep_set.fasta"),
            },
            PrimerPairsRef {
                id: 7,
                content: ">p1\nACGT\n".into(),
            },
        )
    }

    #[test]
    fn test_attempt_paths_are_per_job() {
        let job = job();
        let paths = AttemptPaths::for_job(Path::new("/srv/tmp"), &job);
        assert_eq!(
            paths.primers,
            PathBuf::from(format!("/srv/tmp/job_{}_good_pairs_7.fasta", job.id))
        );
        assert_eq!(
            paths.outputs.init,
            PathBuf::from(format!("/srv/tmp/job_{}_init", job.id))
        );
        assert_eq!(paths.files().len(), 5);
    }

    #[tokio::test]
    async fn test_process_exit_is_recorded_and_retryable() {
        let dir = tempfile::tempdir().unwrap();
        let config = OrchestratorConfig {
            work_dir: dir.path().to_path_buf(),
            ..OrchestratorConfig::default()
        };
        let store = Arc::new(InMemoryJobStore::new());
        let cache = Arc::new(InMemoryCache::new());
        let queue = Arc::new(InMemoryTaskQueue::new());
        let executor = AttemptExecutor::new(
            Arc::new(config),
            store.clone(),
            cache.clone(),
            queue.clone(),
            Arc::new(ExitWith(-9)),
            Arc::new(InProcEventBus::default()),
        );

        let job = executor.submit_job(job()).await.unwrap();
        let handle = job.task_handle.unwrap();

        let err = executor
            .run_attempt(job.id, AttemptContext::new(handle, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, AttemptError::ProcessExit { code: -9 }));
        assert!(err.is_retryable());

        let runs = store.list_runs(job.id).await.unwrap();
        assert_eq!(runs.len(), 1);
        let run = &runs[0];
        assert!(!run.is_open());
        assert_eq!(run.exit_code(), Some(-9));
        assert_eq!(run.threads(), Some(4));
        assert_eq!(run.crashed_with_threads(), Some(4));
        assert_eq!(run.log["stderr"], json!("out of memory"));
        assert!(run.log["cmd"].as_str().unwrap().contains("--threads=4"));

        assert!(cache.is_empty());
        assert!(!AttemptPaths::for_job(&dir.path().join("tmp"), &job).primers.exists());
    }
}
