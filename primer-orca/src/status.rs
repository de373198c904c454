use std::collections::BTreeSet;
use std::sync::Arc;

use crate::job::{Job, JobStatus, TaskHandle};
use crate::liveness::LivenessProbe;
use crate::queue::{TaskQueue, TaskState};
use crate::store::JobStore;

/// Everything a job's status is derived from.
#[derive(Clone, Copy, Debug)]
pub struct StatusSources<'a> {
    pub has_result: bool,
    pub handle: Option<TaskHandle>,
    /// Result-store entry for `handle`.
    pub task_state: Option<&'a TaskState>,
    pub pending: &'a BTreeSet<TaskHandle>,
    /// Tasks executing on job-attempt workers.
    pub live: &'a BTreeSet<TaskHandle>,
}

/// Derive the visible status of a job. A result always wins.
pub fn resolve_status(sources: StatusSources<'_>) -> JobStatus {
    if sources.has_result {
        return JobStatus::Completed;
    }

    let is = |set: &BTreeSet<TaskHandle>| sources.handle.is_some_and(|h| set.contains(&h));

    match sources.task_state {
        None if is(sources.pending) => JobStatus::Pending,
        None => JobStatus::Failed,
        Some(TaskState::Started) if is(sources.live) => JobStatus::Running,
        Some(TaskState::Started) | Some(TaskState::Retry) => JobStatus::PendingRetry,
        Some(TaskState::Failure) => JobStatus::Failed,
        Some(other) => JobStatus::Other(other.as_str().to_string()),
    }
}

/// Reads the three status sources for a job and resolves its status.
#[derive(Clone)]
pub struct StatusResolver {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn TaskQueue>,
    probe: LivenessProbe,
    worker_pattern: String,
}

impl std::fmt::Debug for StatusResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusResolver")
            .field("worker_pattern", &self.worker_pattern)
            .finish_non_exhaustive()
    }
}

impl StatusResolver {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn TaskQueue>,
        probe: LivenessProbe,
        worker_pattern: impl Into<String>,
    ) -> Self {
        Self {
            store,
            queue,
            probe,
            worker_pattern: worker_pattern.into(),
        }
    }

    pub async fn status(&self, job: &Job) -> anyhow::Result<JobStatus> {
        let has_result = self.store.has_result(job.id).await?;
        if has_result {
            return Ok(JobStatus::Completed);
        }

        let task_state = match job.task_handle {
            Some(handle) => self.queue.status(handle).await?,
            None => None,
        };

        let pending = if task_state.is_none() {
            self.queue.pending_task_ids().await?
        } else {
            BTreeSet::new()
        };

        let mut live = BTreeSet::new();
        if let (Some(TaskState::Started), Some(handle)) = (&task_state, job.task_handle) {
            if self.probe.is_live(handle, &self.worker_pattern).await? {
                live.insert(handle);
            }
        }

        Ok(resolve_status(StatusSources {
            has_result,
            handle: job.task_handle,
            task_state: task_state.as_ref(),
            pending: &pending,
            live: &live,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use crate::job::{PrimerPairsRef, SequenceSetRef};
    use crate::params::JobParameters;
    use crate::queue::{InMemoryTaskQueue, TaskBroker, TaskOutcome};
    use crate::result::JobResult;
    use crate::store::InMemoryJobStore;
    use std::path::PathBuf;

    fn sources<'a>(
        handle: TaskHandle,
        state: Option<&'a TaskState>,
        pending: &'a BTreeSet<TaskHandle>,
        live: &'a BTreeSet<TaskHandle>,
    ) -> StatusSources<'a> {
        StatusSources {
            has_result: false,
            handle: Some(handle),
            task_state: state,
            pending,
            live,
        }
    }

    #[test]
    fn test_every_combination_resolves_to_one_status() {
        let handle = TaskHandle::new();
        let with = BTreeSet::from([handle]);
        let without = BTreeSet::new();
        let states = [
            None,
            Some(TaskState::Pending),
            Some(TaskState::Started),
            Some(TaskState::Retry),
            Some(TaskState::Failure),
            Some(TaskState::Success),
            Some(TaskState::Other("REVOKED".into())),
        ];

        for state in &states {
            for pending in [&with, &without] {
                for live in [&with, &without] {
                    let completed = resolve_status(StatusSources {
                        has_result: true,
                        ..sources(handle, state.as_ref(), pending, live)
                    });
                    assert_eq!(completed, JobStatus::Completed);

                    let status = resolve_status(sources(handle, state.as_ref(), pending, live));
                    let expected = match state {
                        None if pending.contains(&handle) => JobStatus::Pending,
                        None => JobStatus::Failed,
                        Some(TaskState::Started) if live.contains(&handle) => JobStatus::Running,
                        Some(TaskState::Started) => JobStatus::PendingRetry,
                        Some(TaskState::Retry) => JobStatus::PendingRetry,
                        Some(TaskState::Failure) => JobStatus::Failed,
                        Some(TaskState::Pending) => JobStatus::Other("PENDING".into()),
                        Some(TaskState::Success) => JobStatus::Other("SUCCESS".into()),
                        Some(TaskState::Other(raw)) => JobStatus::Other(raw.clone()),
                    };
                    assert_eq!(status, expected, "state {state:?}");
                }
            }
        }
    }

    #[test]
    fn test_job_without_handle_reads_as_failed() {
        let empty = BTreeSet::new();
        let status = resolve_status(StatusSources {
            has_result: false,
            handle: None,
            task_state: None,
            pending: &empty,
            live: &empty,
        });
        assert_eq!(status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_resolver_follows_task_through_queue() {
        let store = Arc::new(InMemoryJobStore::new());
        let queue = InMemoryTaskQueue::new();
        let resolver = StatusResolver::new(
            store.clone(),
            Arc::new(queue.clone()),
            LivenessProbe::with_ttl(
                Arc::new(queue.clone()),
                Arc::new(InMemoryCache::new()),
                chrono::Duration::zero(),
            ),
            "*primer_run*",
        );

        let mut job = Job::new(
            "carol",
            JobParameters::default(),
            SequenceSetRef {
                id: 1,
                path: PathBuf::from("/data/set.fasta"),
            },
            PrimerPairsRef {
                id: 1,
                content: String::new(),
            },
        );
        let handle = queue.enqueue(job.id).await.unwrap();
        job.task_handle = Some(handle);
        store.insert_job(&job).await.unwrap();

        assert_eq!(resolver.status(&job).await.unwrap(), JobStatus::Pending);

        queue.claim("primer_run-w0").await.unwrap().unwrap();
        assert_eq!(resolver.status(&job).await.unwrap(), JobStatus::Running);

        queue.abandon(handle);
        assert_eq!(resolver.status(&job).await.unwrap(), JobStatus::PendingRetry);

        queue
            .finish(handle, TaskOutcome::Failed { error: None })
            .await
            .unwrap();
        assert_eq!(resolver.status(&job).await.unwrap(), JobStatus::Failed);

        store
            .insert_result(
                &JobResult::from_outputs(job.id, String::new(), "h".into(), String::new(), "h".into())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resolver.status(&job).await.unwrap(), JobStatus::Completed);
    }
}
