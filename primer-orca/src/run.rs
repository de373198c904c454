use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::job::{JobId, RunId};
use crate::result::JobResult;
use crate::store::JobStore;

/// Free-form structured log attached to a run.
pub type RunLog = Map<String, Value>;

/// Exit code recorded when the optimizer was killed with SIGKILL, usually
/// by the kernel's OOM killer.
pub const CRASH_EXIT_CODE: i64 = -9;

/// One execution attempt of a job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub job_id: JobId,
    pub log: RunLog,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn new(job_id: JobId) -> Self {
        Self {
            id: RunId::new(),
            job_id,
            log: RunLog::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.finished_at.is_none()
    }

    pub fn merge_log(&mut self, entries: impl IntoIterator<Item = (String, Value)>) {
        self.log.extend(entries);
    }

    /// Stamp the finish time.
    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    /// Threads recorded by [`RunLedger::set_threads`].
    pub fn threads(&self) -> Option<u32> {
        self.log
            .get("threads")?
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
    }

    pub fn exit_code(&self) -> Option<i64> {
        self.log.get("exit_code")?.as_i64()
    }

    /// Threads the run held if it was killed, `None` otherwise.
    pub fn crashed_with_threads(&self) -> Option<u32> {
        if self.exit_code() == Some(CRASH_EXIT_CODE) {
            self.threads()
        } else {
            None
        }
    }
}

/// Output prefixes handed to the optimizer. Each prefix names a
/// `<prefix>.primers` and a `<prefix>.scores` file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputPrefixes {
    pub init: PathBuf,
    pub out: PathBuf,
}

impl OutputPrefixes {
    /// The four files the optimizer writes.
    pub fn files(&self) -> [PathBuf; 4] {
        [
            with_suffix(&self.init, "primers"),
            with_suffix(&self.init, "scores"),
            with_suffix(&self.out, "primers"),
            with_suffix(&self.out, "scores"),
        ]
    }
}

/// Append `.suffix` to a path without touching an existing extension.
pub fn with_suffix(prefix: &Path, suffix: &str) -> PathBuf {
    let mut name = prefix.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

/// Writes run transitions through to the [`JobStore`].
///
/// `set_completed` and `set_failed` are terminal. Calling either twice on the
/// same run is a caller bug and is not detected here.
#[derive(Clone)]
pub struct RunLedger {
    store: Arc<dyn JobStore>,
}

impl std::fmt::Debug for RunLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLedger").finish_non_exhaustive()
    }
}

impl RunLedger {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Open a new run for `job_id`.
    pub async fn create_run(&self, job_id: JobId) -> anyhow::Result<Run> {
        let run = Run::new(job_id);
        self.store.insert_run(&run).await?;
        debug!(job_id = %job_id, run_id = %run.id, "run opened");
        Ok(run)
    }

    pub async fn set_threads(&self, run: &mut Run, threads: u32) -> anyhow::Result<()> {
        run.log.insert("threads".into(), json!(threads));
        self.store.save_run(run).await
    }

    /// Materialize the job's result from the optimizer outputs and close the
    /// run.
    ///
    /// Fails without touching the run if any output file cannot be read or
    /// parsed, or if the job already has a result.
    pub async fn set_completed(
        &self,
        run: &mut Run,
        stdout: &str,
        outputs: &OutputPrefixes,
        extra: RunLog,
    ) -> anyhow::Result<JobResult> {
        let [init_primers, init_scores, out_primers, out_scores] = outputs.files();
        let result = JobResult::from_outputs(
            run.job_id,
            read_output(&init_primers).await?,
            read_output(&init_scores).await?,
            read_output(&out_primers).await?,
            read_output(&out_scores).await?,
        )?;
        self.store.insert_result(&result).await?;

        run.log.insert("stdout".into(), json!(stdout));
        run.log.insert("completed".into(), json!(true));
        run.merge_log(extra);
        run.finish();
        self.store.save_run(run).await?;
        Ok(result)
    }

    /// Close the run as failed. Never creates a result.
    pub async fn set_failed(
        &self,
        run: &mut Run,
        error: &str,
        extra: RunLog,
    ) -> anyhow::Result<()> {
        run.log.insert("error".into(), json!(error));
        run.log.insert("failed".into(), json!(true));
        run.merge_log(extra);
        run.finish();
        self.store.save_run(run).await
    }
}

async fn read_output(path: &Path) -> anyhow::Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|err| anyhow::anyhow!("failed to read {}: {err}", path.display()))
}
