use chrono::Duration;
use std::sync::Arc;
use tracing::trace;

use crate::cache::SharedCache;
use crate::job::TaskHandle;
use crate::queue::TaskQueue;

/// Cache key prefix for memoized liveness answers.
pub const LIVENESS_KEY_PREFIX: &str = "task.running:";

/// Default lifetime of a memoized answer, in seconds.
pub const DEFAULT_LIVENESS_TTL_SECS: i64 = 8;

pub fn liveness_key(handle: TaskHandle) -> String {
    format!("{LIVENESS_KEY_PREFIX}{handle}")
}

/// Answers "is this task executing on a live worker right now".
///
/// Each answer is memoized in the shared cache for a few seconds.
#[derive(Clone)]
pub struct LivenessProbe {
    queue: Arc<dyn TaskQueue>,
    cache: Arc<dyn SharedCache>,
    ttl: Duration,
}

impl std::fmt::Debug for LivenessProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LivenessProbe")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl LivenessProbe {
    pub fn new(queue: Arc<dyn TaskQueue>, cache: Arc<dyn SharedCache>) -> Self {
        Self::with_ttl(queue, cache, Duration::seconds(DEFAULT_LIVENESS_TTL_SECS))
    }

    pub fn with_ttl(queue: Arc<dyn TaskQueue>, cache: Arc<dyn SharedCache>, ttl: Duration) -> Self {
        Self { queue, cache, ttl }
    }

    /// Whether `handle` runs on a worker matching `pattern`.
    pub async fn is_live(&self, handle: TaskHandle, pattern: &str) -> anyhow::Result<bool> {
        let key = liveness_key(handle);
        if let Some(memo) = self.cache.get(&key).await? {
            trace!(task = %handle, memo = %memo, "liveness memo hit");
            return Ok(memo == "1");
        }

        let live = self.queue.live_task_ids(pattern).await?.contains(&handle);
        self.cache
            .set(&key, if live { "1" } else { "0" }.to_string(), self.ttl)
            .await?;
        Ok(live)
    }

    /// Drop a memoized answer, e.g. right after revoking or adopting a task.
    pub async fn forget(&self, handle: TaskHandle) -> anyhow::Result<()> {
        self.cache.delete(&liveness_key(handle)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use crate::job::JobId;
    use crate::queue::InMemoryTaskQueue;

    #[tokio::test]
    async fn test_answer_is_memoized_until_forgotten() {
        let queue = InMemoryTaskQueue::new();
        let cache = InMemoryCache::new();
        let probe = LivenessProbe::new(Arc::new(queue.clone()), Arc::new(cache.clone()));

        let handle = queue.enqueue(JobId::new()).await.unwrap();
        queue.mark_started(handle, "primer_run-w0");
        assert!(probe.is_live(handle, "*primer_run*").await.unwrap());

        // The worker dies, the memo still answers.
        queue.abandon(handle);
        assert!(probe.is_live(handle, "*primer_run*").await.unwrap());
        assert!(cache.ttl(&liveness_key(handle)).unwrap() <= Duration::seconds(DEFAULT_LIVENESS_TTL_SECS));

        probe.forget(handle).await.unwrap();
        assert!(!probe.is_live(handle, "*primer_run*").await.unwrap());
    }

    #[tokio::test]
    async fn test_pattern_filters_workers() {
        let queue = InMemoryTaskQueue::new();
        let probe = LivenessProbe::with_ttl(
            Arc::new(queue.clone()),
            Arc::new(InMemoryCache::new()),
            Duration::zero(),
        );
        let handle = queue.enqueue(JobId::new()).await.unwrap();
        queue.mark_started(handle, "thumbnailer-w0");

        assert!(!probe.is_live(handle, "*primer_run*").await.unwrap());
        assert!(probe.is_live(handle, "*").await.unwrap());
    }
}
