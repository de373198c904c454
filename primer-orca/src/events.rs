use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::job::{JobId, RunId, TaskHandle};

/// Metadata envelope attached to every job event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventMeta {
    pub version: u16,
    pub correlation_id: Uuid,
    pub idempotency_key: String,
    pub timestamp: DateTime<Utc>,
}

impl EventMeta {
    pub fn new(correlation_id: Option<Uuid>, idempotency_key: impl Into<String>) -> Self {
        Self {
            version: 1,
            correlation_id: correlation_id.unwrap_or_else(Uuid::now_v7),
            idempotency_key: idempotency_key.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Job event with metadata and payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobEvent {
    pub meta: EventMeta,
    pub payload: JobEventPayload,
}

impl JobEvent {
    /// Wrap a payload, correlating it with the task that produced it.
    pub fn new(handle: Option<TaskHandle>, key: impl Into<String>, payload: JobEventPayload) -> Self {
        Self {
            meta: EventMeta::new(handle.map(|h| h.0), key),
            payload,
        }
    }

    pub fn job_id(&self) -> JobId {
        match &self.payload {
            JobEventPayload::Submitted { job_id, .. }
            | JobEventPayload::AttemptStarted { job_id, .. }
            | JobEventPayload::Completed { job_id, .. }
            | JobEventPayload::AttemptFailed { job_id, .. }
            | JobEventPayload::Superseded { job_id, .. }
            | JobEventPayload::LeaseReclaimed { job_id, .. }
            | JobEventPayload::Resubmitted { job_id, .. } => *job_id,
        }
    }
}

/// Event payload emitted for job lifecycle transitions.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub enum JobEventPayload {
    /// Job was persisted and its first attempt queued.
    Submitted { job_id: JobId, handle: TaskHandle },
    /// An attempt passed its guards and is about to run the optimizer.
    AttemptStarted {
        job_id: JobId,
        run_id: RunId,
        threads: u32,
    },
    /// Job finished and its result exists. This is the completion notice
    /// for the job's owner.
    Completed {
        job_id: JobId,
        run_id: RunId,
        owner: String,
    },
    /// An attempt failed.
    AttemptFailed {
        job_id: JobId,
        run_id: RunId,
        retryable: bool,
        reason: String,
    },
    /// A newer live attempt owns the job; this one stood down.
    Superseded {
        job_id: JobId,
        run_id: RunId,
        current: TaskHandle,
    },
    /// The lease sweep deleted a leaked lease.
    LeaseReclaimed { job_id: JobId },
    /// The orphan sweep gave the job a fresh attempt.
    Resubmitted {
        job_id: JobId,
        previous: Option<TaskHandle>,
        handle: TaskHandle,
    },
}

/// Fire-and-forget sink for job events.
#[async_trait]
pub trait JobEventPublisher: Send + Sync {
    /// Publish an event. Never waits for subscribers.
    async fn publish(&self, event: JobEvent) -> anyhow::Result<()>;

    fn subscribe_jobs(&self) -> broadcast::Receiver<JobEvent>;
}

/// In-process event bus using a tokio broadcast channel.
///
/// Publishing never blocks. A subscriber that falls more than `capacity`
/// events behind receives `RecvError::Lagged`; with no subscribers the
/// event is dropped.
pub struct InProcEventBus {
    sender: broadcast::Sender<JobEvent>,
    capacity: usize,
}

impl std::fmt::Debug for InProcEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl Default for InProcEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl InProcEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn publish_job(&self, event: JobEvent) -> anyhow::Result<()> {
        let _ = self.sender.send(event);
        Ok(())
    }
}

#[async_trait]
impl JobEventPublisher for InProcEventBus {
    async fn publish(&self, event: JobEvent) -> anyhow::Result<()> {
        self.publish_job(event)
    }

    fn subscribe_jobs(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn reclaimed(i: usize) -> JobEvent {
        JobEvent::new(
            None,
            format!("test-{i}"),
            JobEventPayload::LeaseReclaimed {
                job_id: JobId::new(),
            },
        )
    }

    #[tokio::test]
    async fn test_event_bus_broadcast_to_multiple_subscribers() {
        let bus = InProcEventBus::new(100);
        let mut rx1 = bus.subscribe_jobs();
        let mut rx2 = bus.subscribe_jobs();

        for i in 0..5 {
            bus.publish(reclaimed(i)).await.unwrap();
        }

        for i in 0..5 {
            let a = timeout(Duration::from_millis(100), rx1.recv())
                .await
                .unwrap()
                .unwrap();
            let b = timeout(Duration::from_millis(100), rx2.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(a.meta.idempotency_key, format!("test-{i}"));
            assert_eq!(a.job_id(), b.job_id());
        }
    }

    #[tokio::test]
    async fn test_lagged_subscriber_doesnt_block_publisher() {
        let bus = InProcEventBus::new(2);
        let mut rx = bus.subscribe_jobs();

        for i in 0..5 {
            bus.publish(reclaimed(i)).await.unwrap();
        }

        let result = timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(matches!(
            result,
            Ok(Err(broadcast::error::RecvError::Lagged(_)))
        ));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = InProcEventBus::default();
        bus.publish(reclaimed(0)).await.unwrap();
        assert_eq!(bus.subscriber_count(), 0);
        assert!(format!("{bus:?}").contains("capacity: 1024"));
    }

    #[test]
    fn test_correlation_follows_task_handle() {
        let handle = TaskHandle::new();
        let job_id = JobId::new();
        let event = JobEvent::new(
            Some(handle),
            "submit",
            JobEventPayload::Submitted { job_id, handle },
        );
        assert_eq!(event.meta.correlation_id, handle.0);
        assert_eq!(event.job_id(), job_id);
    }
}
