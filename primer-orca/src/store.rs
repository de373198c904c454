use anyhow::anyhow;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::job::{Job, JobId, TaskHandle};
use crate::result::JobResult;
use crate::run::Run;

/// Relational store for jobs, their runs and their result.
///
/// Only single-row atomicity is assumed.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert_job(&self, job: &Job) -> anyhow::Result<()>;

    async fn load_job(&self, job_id: JobId) -> anyhow::Result<Option<Job>>;

    async fn job_exists(&self, job_id: JobId) -> anyhow::Result<bool> {
        Ok(self.load_job(job_id).await?.is_some())
    }

    /// Point the job at the attempt that currently owns it.
    async fn update_task_handle(
        &self,
        job_id: JobId,
        handle: Option<TaskHandle>,
    ) -> anyhow::Result<()>;

    async fn insert_run(&self, run: &Run) -> anyhow::Result<()>;

    /// Persist the log and finish time of an existing run.
    async fn save_run(&self, run: &Run) -> anyhow::Result<()>;

    /// Runs of a job, oldest first.
    async fn list_runs(&self, job_id: JobId) -> anyhow::Result<Vec<Run>>;

    async fn count_runs(&self, job_id: JobId) -> anyhow::Result<usize> {
        Ok(self.list_runs(job_id).await?.len())
    }

    async fn has_result(&self, job_id: JobId) -> anyhow::Result<bool>;

    /// Store a job's result. Fails if one already exists.
    async fn insert_result(&self, result: &JobResult) -> anyhow::Result<()>;

    async fn load_result(&self, job_id: JobId) -> anyhow::Result<Option<JobResult>>;

    /// Jobs without a result that have no run at all or at least one open
    /// run, oldest first.
    async fn orphan_candidates(&self) -> anyhow::Result<Vec<Job>>;
}

#[derive(Default)]
struct StoreState {
    jobs: HashMap<JobId, Job>,
    runs: HashMap<JobId, Vec<Run>>,
    results: HashMap<JobId, JobResult>,
}

/// Process-local [`JobStore`].
#[derive(Clone, Default)]
pub struct InMemoryJobStore {
    state: Arc<Mutex<StoreState>>,
}

impl std::fmt::Debug for InMemoryJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("InMemoryJobStore")
            .field("jobs", &state.jobs.len())
            .field("results", &state.results.len())
            .finish_non_exhaustive()
    }
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop a job and everything it owns.
    pub fn remove_job(&self, job_id: JobId) {
        let mut state = self.state.lock();
        state.jobs.remove(&job_id);
        state.runs.remove(&job_id);
        state.results.remove(&job_id);
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert_job(&self, job: &Job) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        if state.jobs.contains_key(&job.id) {
            return Err(anyhow!("job {} already exists", job.id));
        }
        state.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn load_job(&self, job_id: JobId) -> anyhow::Result<Option<Job>> {
        Ok(self.state.lock().jobs.get(&job_id).cloned())
    }

    async fn update_task_handle(
        &self,
        job_id: JobId,
        handle: Option<TaskHandle>,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| anyhow!("job {job_id} not found"))?;
        job.task_handle = handle;
        Ok(())
    }

    async fn insert_run(&self, run: &Run) -> anyhow::Result<()> {
        self.state
            .lock()
            .runs
            .entry(run.job_id)
            .or_default()
            .push(run.clone());
        Ok(())
    }

    async fn save_run(&self, run: &Run) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        let stored = state
            .runs
            .get_mut(&run.job_id)
            .and_then(|runs| runs.iter_mut().find(|r| r.id == run.id))
            .ok_or_else(|| anyhow!("run {} not found", run.id))?;
        stored.log = run.log.clone();
        stored.finished_at = run.finished_at;
        Ok(())
    }

    async fn list_runs(&self, job_id: JobId) -> anyhow::Result<Vec<Run>> {
        let mut runs = self
            .state
            .lock()
            .runs
            .get(&job_id)
            .cloned()
            .unwrap_or_default();
        runs.sort_by_key(|run| (run.started_at, run.id));
        Ok(runs)
    }

    async fn has_result(&self, job_id: JobId) -> anyhow::Result<bool> {
        Ok(self.state.lock().results.contains_key(&job_id))
    }

    async fn insert_result(&self, result: &JobResult) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        if state.results.contains_key(&result.job_id) {
            return Err(anyhow!("job {} already has a result", result.job_id));
        }
        state.results.insert(result.job_id, result.clone());
        Ok(())
    }

    async fn load_result(&self, job_id: JobId) -> anyhow::Result<Option<JobResult>> {
        Ok(self.state.lock().results.get(&job_id).cloned())
    }

    async fn orphan_candidates(&self) -> anyhow::Result<Vec<Job>> {
        let state = self.state.lock();
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|job| !state.results.contains_key(&job.id))
            .filter(|job| match state.runs.get(&job.id) {
                None => true,
                Some(runs) => runs.is_empty() || runs.iter().any(Run::is_open),
            })
            .cloned()
            .collect();
        jobs.sort_by_key(|job| (job.created_at, job.id));
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{PrimerPairsRef, SequenceSetRef};
    use crate::params::JobParameters;
    use std::path::PathBuf;

    fn job() -> Job {
        Job::new(
            "bob",
            JobParameters::default(),
            SequenceSetRef {
                id: 1,
                path: PathBuf::from("/data/set.fasta"),
            },
            PrimerPairsRef {
                id: 1,
                content: String::new(),
            },
        )
    }

    fn result(job_id: JobId) -> JobResult {
        JobResult::from_outputs(job_id, String::new(), "h".into(), String::new(), "h".into())
            .unwrap()
    }

    #[tokio::test]
    async fn test_result_is_inserted_at_most_once() {
        let store = InMemoryJobStore::new();
        let job = job();
        store.insert_job(&job).await.unwrap();

        store.insert_result(&result(job.id)).await.unwrap();
        assert!(store.insert_result(&result(job.id)).await.is_err());
        assert!(store.has_result(job.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_save_run_updates_in_place() {
        let store = InMemoryJobStore::new();
        let job = job();
        let mut run = Run::new(job.id);
        store.insert_run(&run).await.unwrap();

        run.finish();
        store.save_run(&run).await.unwrap();

        let runs = store.list_runs(job.id).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert!(!runs[0].is_open());
        assert!(store.save_run(&Run::new(job.id)).await.is_err());
    }

    #[tokio::test]
    async fn test_orphan_candidates() {
        let store = InMemoryJobStore::new();

        let never_ran = job();
        let open_run = job();
        let all_closed = job();
        let completed = job();
        for j in [&never_ran, &open_run, &all_closed, &completed] {
            store.insert_job(j).await.unwrap();
        }

        let mut closed = Run::new(open_run.id);
        closed.finish();
        store.insert_run(&closed).await.unwrap();
        store.insert_run(&Run::new(open_run.id)).await.unwrap();

        let mut done = Run::new(all_closed.id);
        done.finish();
        store.insert_run(&done).await.unwrap();

        store.insert_run(&Run::new(completed.id)).await.unwrap();
        store.insert_result(&result(completed.id)).await.unwrap();

        let ids: std::collections::BTreeSet<JobId> = store
            .orphan_candidates()
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(ids, [never_ran.id, open_run.id].into_iter().collect());
    }

    #[tokio::test]
    async fn test_update_task_handle_requires_job() {
        let store = InMemoryJobStore::new();
        let job = job();
        assert!(store.update_task_handle(job.id, None).await.is_err());

        store.insert_job(&job).await.unwrap();
        let handle = TaskHandle::new();
        store.update_task_handle(job.id, Some(handle)).await.unwrap();
        assert_eq!(
            store.load_job(job.id).await.unwrap().unwrap().task_handle,
            Some(handle)
        );
    }
}
