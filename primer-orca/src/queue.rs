use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt::Display;
use std::sync::Arc;

use crate::cache::glob_match;
use crate::job::{JobId, TaskHandle};

/// State of a task as reported by the queue's result store.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum TaskState {
    Pending,
    Started,
    Retry,
    Failure,
    Success,
    /// Anything else the backend reports, kept verbatim.
    Other(String),
}

impl TaskState {
    pub fn as_str(&self) -> &str {
        match self {
            TaskState::Pending => "PENDING",
            TaskState::Started => "STARTED",
            TaskState::Retry => "RETRY",
            TaskState::Failure => "FAILURE",
            TaskState::Success => "SUCCESS",
            TaskState::Other(raw) => raw,
        }
    }
}

impl Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status side of the task queue, as seen by the orchestrator.
///
/// Treated as eventually consistent and polled.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Queue a fresh attempt for a job.
    async fn enqueue(&self, job_id: JobId) -> anyhow::Result<TaskHandle>;

    /// Result-store entry for a task. `None` when the task is unknown, not
    /// yet started or expired.
    async fn status(&self, handle: TaskHandle) -> anyhow::Result<Option<TaskState>>;

    /// Cancel a task. Does not interrupt a task that is already executing.
    async fn revoke(&self, handle: TaskHandle) -> anyhow::Result<()>;

    /// Tasks executing right now on workers whose name matches `pattern`.
    async fn live_task_ids(&self, pattern: &str) -> anyhow::Result<BTreeSet<TaskHandle>>;

    /// Tasks waiting in the queue.
    async fn pending_task_ids(&self) -> anyhow::Result<BTreeSet<TaskHandle>>;
}

/// A task handed to a worker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskDelivery {
    pub handle: TaskHandle,
    pub job_id: JobId,
    /// Times this task has already been retried.
    pub retries: u32,
}

/// How a worker reports back on a delivery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskOutcome {
    Succeeded,
    Failed { error: Option<String> },
    Retry { delay: Duration },
}

/// Worker side of the task queue.
#[async_trait]
pub trait TaskBroker: Send + Sync {
    /// Take the next due task, marking it started on `worker_id`.
    async fn claim(&self, worker_id: &str) -> anyhow::Result<Option<TaskDelivery>>;

    async fn finish(&self, handle: TaskHandle, outcome: TaskOutcome) -> anyhow::Result<()>;
}

#[derive(Clone, Debug)]
struct TaskRecord {
    job_id: JobId,
    state: Option<TaskState>,
    retries: u32,
    due_at: DateTime<Utc>,
    revoked: bool,
    worker: Option<String>,
    last_error: Option<String>,
}

#[derive(Default)]
struct QueueState {
    tasks: HashMap<TaskHandle, TaskRecord>,
    waiting: VecDeque<TaskHandle>,
}

/// Process-local [`TaskQueue`] and [`TaskBroker`].
///
/// A task has no result-store entry until a worker starts it, like a
/// result backend with started-tracking enabled. Retries go back to the
/// end of the queue with a due time.
#[derive(Clone, Default)]
pub struct InMemoryTaskQueue {
    state: Arc<Mutex<QueueState>>,
}

impl std::fmt::Debug for InMemoryTaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("InMemoryTaskQueue")
            .field("tasks", &state.tasks.len())
            .field("waiting", &state.waiting.len())
            .finish()
    }
}

impl InMemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tasks still waiting to be claimed.
    pub fn waiting_len(&self) -> usize {
        self.state.lock().waiting.len()
    }

    /// Job a task was queued for.
    pub fn job_of(&self, handle: TaskHandle) -> Option<JobId> {
        self.state.lock().tasks.get(&handle).map(|t| t.job_id)
    }

    pub fn is_revoked(&self, handle: TaskHandle) -> bool {
        self.state
            .lock()
            .tasks
            .get(&handle)
            .is_some_and(|t| t.revoked)
    }

    pub fn last_error(&self, handle: TaskHandle) -> Option<String> {
        self.state
            .lock()
            .tasks
            .get(&handle)
            .and_then(|t| t.last_error.clone())
    }

    /// Forget which worker runs a task while leaving its result-store state
    /// alone, as happens when the worker process dies.
    pub fn abandon(&self, handle: TaskHandle) {
        if let Some(task) = self.state.lock().tasks.get_mut(&handle) {
            task.worker = None;
        }
    }

    /// Overwrite a task's result-store entry.
    pub fn set_state(&self, handle: TaskHandle, state: Option<TaskState>) {
        if let Some(task) = self.state.lock().tasks.get_mut(&handle) {
            task.state = state;
        }
    }

    /// Start a task on a worker without going through [`TaskBroker::claim`].
    pub fn mark_started(&self, handle: TaskHandle, worker_id: &str) {
        let mut state = self.state.lock();
        state.waiting.retain(|h| *h != handle);
        if let Some(task) = state.tasks.get_mut(&handle) {
            task.state = Some(TaskState::Started);
            task.worker = Some(worker_id.to_string());
        }
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn enqueue(&self, job_id: JobId) -> anyhow::Result<TaskHandle> {
        let handle = TaskHandle::new();
        let mut state = self.state.lock();
        state.tasks.insert(
            handle,
            TaskRecord {
                job_id,
                state: None,
                retries: 0,
                due_at: Utc::now(),
                revoked: false,
                worker: None,
                last_error: None,
            },
        );
        state.waiting.push_back(handle);
        Ok(handle)
    }

    async fn status(&self, handle: TaskHandle) -> anyhow::Result<Option<TaskState>> {
        Ok(self
            .state
            .lock()
            .tasks
            .get(&handle)
            .and_then(|t| t.state.clone()))
    }

    async fn revoke(&self, handle: TaskHandle) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        state.waiting.retain(|h| *h != handle);
        if let Some(task) = state.tasks.get_mut(&handle) {
            task.revoked = true;
            task.state = Some(TaskState::Other("REVOKED".into()));
        }
        Ok(())
    }

    async fn live_task_ids(&self, pattern: &str) -> anyhow::Result<BTreeSet<TaskHandle>> {
        Ok(self
            .state
            .lock()
            .tasks
            .iter()
            .filter(|(_, task)| {
                task.worker
                    .as_deref()
                    .is_some_and(|worker| glob_match(pattern, worker))
            })
            .map(|(handle, _)| *handle)
            .collect())
    }

    async fn pending_task_ids(&self) -> anyhow::Result<BTreeSet<TaskHandle>> {
        Ok(self.state.lock().waiting.iter().copied().collect())
    }
}

#[async_trait]
impl TaskBroker for InMemoryTaskQueue {
    async fn claim(&self, worker_id: &str) -> anyhow::Result<Option<TaskDelivery>> {
        let now = Utc::now();
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let Some(position) = state.waiting.iter().position(|handle| {
            state
                .tasks
                .get(handle)
                .is_some_and(|t| !t.revoked && t.due_at <= now)
        }) else {
            return Ok(None);
        };
        let Some(handle) = state.waiting.remove(position) else {
            return Ok(None);
        };
        let Some(task) = state.tasks.get_mut(&handle) else {
            return Ok(None);
        };

        task.state = Some(TaskState::Started);
        task.worker = Some(worker_id.to_string());
        Ok(Some(TaskDelivery {
            handle,
            job_id: task.job_id,
            retries: task.retries,
        }))
    }

    async fn finish(&self, handle: TaskHandle, outcome: TaskOutcome) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        let task = state
            .tasks
            .get_mut(&handle)
            .ok_or_else(|| anyhow::anyhow!("task {handle} not found"))?;
        task.worker = None;

        match outcome {
            TaskOutcome::Succeeded => {
                task.state = Some(TaskState::Success);
            }
            TaskOutcome::Failed { error } => {
                task.state = Some(TaskState::Failure);
                task.last_error = error;
            }
            TaskOutcome::Retry { .. } if task.revoked => {}
            TaskOutcome::Retry { delay } => {
                task.state = Some(TaskState::Retry);
                task.retries += 1;
                task.due_at = Utc::now() + delay;
                state.waiting.push_back(handle);
            }
        }
        Ok(())
    }
}
