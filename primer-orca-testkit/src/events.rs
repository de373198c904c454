use async_trait::async_trait;
use parking_lot::Mutex;
use primer_orca::*;
use std::sync::Arc;
use tokio::sync::broadcast;

/// [`JobEventPublisher`] that keeps every event and forwards it to an
/// [`InProcEventBus`].
#[derive(Clone, Default)]
pub struct RecordingEvents {
    events: Arc<Mutex<Vec<JobEvent>>>,
    bus: Arc<InProcEventBus>,
}

impl std::fmt::Debug for RecordingEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingEvents")
            .field("recorded", &self.events.lock().len())
            .finish_non_exhaustive()
    }
}

impl RecordingEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<JobEvent> {
        self.events.lock().clone()
    }

    /// Recorded events for `job_id`, oldest first.
    pub fn for_job(&self, job_id: JobId) -> Vec<JobEventPayload> {
        self.events
            .lock()
            .iter()
            .filter(|event| event.job_id() == job_id)
            .map(|event| event.payload.clone())
            .collect()
    }

    pub fn count(&self, predicate: impl Fn(&JobEventPayload) -> bool) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| predicate(&event.payload))
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

#[async_trait]
impl JobEventPublisher for RecordingEvents {
    async fn publish(&self, event: JobEvent) -> anyhow::Result<()> {
        self.events.lock().push(event.clone());
        self.bus.publish_job(event)
    }

    fn subscribe_jobs(&self) -> broadcast::Receiver<JobEvent> {
        self.bus.subscribe_jobs()
    }
}
