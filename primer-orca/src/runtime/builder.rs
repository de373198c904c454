use std::fmt;
use std::sync::Arc;

use crate::cache::SharedCache;
use crate::config::OrchestratorConfig;
use crate::events::{InProcEventBus, JobEventPublisher};
use crate::executor::AttemptExecutor;
use crate::process::{ProcessRunner, TokioProcessRunner};
use crate::queue::{TaskBroker, TaskQueue};
use crate::store::JobStore;

use super::supervisor::{OrchestratorRuntime, OrchestratorRuntimeConfig};

/// Builder for constructing an `OrchestratorRuntime` with explicit dependencies.
///
/// The store, the shared cache and the task queue are required. The process
/// runner defaults to [`TokioProcessRunner`] and the event publisher to a
/// fresh [`InProcEventBus`].
///
/// # Example
///
/// ```ignore
/// use primer_orca::*;
///
/// let runtime = OrchestratorRuntimeBuilder::new(config)
///     .with_store(store)
///     .with_cache(cache)
///     .with_queue(queue)
///     .build()?;
/// runtime.spawn_worker_pool(4).await;
/// runtime.spawn_housekeeper().await;
/// ```
pub struct OrchestratorRuntimeBuilder {
    config: OrchestratorConfig,
    runtime: OrchestratorRuntimeConfig,
    store: Option<Arc<dyn JobStore>>,
    cache: Option<Arc<dyn SharedCache>>,
    queue: Option<Arc<dyn TaskQueue>>,
    broker: Option<Arc<dyn TaskBroker>>,
    runner: Option<Arc<dyn ProcessRunner>>,
    events: Option<Arc<dyn JobEventPublisher>>,
}

impl fmt::Debug for OrchestratorRuntimeBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrchestratorRuntimeBuilder")
            .field("config", &self.config)
            .field("runtime", &self.runtime)
            .field("store_set", &self.store.is_some())
            .field("cache_set", &self.cache.is_some())
            .field("queue_set", &self.queue.is_some())
            .field("runner_set", &self.runner.is_some())
            .field("events_set", &self.events.is_some())
            .finish()
    }
}

impl OrchestratorRuntimeBuilder {
    /// Create a new builder with the given orchestrator configuration.
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            runtime: OrchestratorRuntimeConfig::default(),
            store: None,
            cache: None,
            queue: None,
            broker: None,
            runner: None,
            events: None,
        }
    }

    /// Set the worker and shutdown settings.
    pub fn with_runtime_config(mut self, runtime: OrchestratorRuntimeConfig) -> Self {
        self.runtime = runtime;
        self
    }

    /// Set the job store.
    pub fn with_store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the shared cache holding leases and liveness memos.
    pub fn with_cache(mut self, cache: Arc<dyn SharedCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Set the task queue, used both for status and for delivering tasks.
    pub fn with_queue<Q>(mut self, queue: Arc<Q>) -> Self
    where
        Q: TaskQueue + TaskBroker + 'static,
    {
        self.broker = Some(Arc::clone(&queue) as Arc<dyn TaskBroker>);
        self.queue = Some(queue as Arc<dyn TaskQueue>);
        self
    }

    /// Set the process runner.
    pub fn with_runner(mut self, runner: Arc<dyn ProcessRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Set the event publisher.
    pub fn with_events(mut self, events: Arc<dyn JobEventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the `OrchestratorRuntime` with all configured dependencies.
    ///
    /// # Errors
    ///
    /// Returns an error if a required dependency is missing or the
    /// configuration is invalid.
    pub fn build(self) -> anyhow::Result<OrchestratorRuntime> {
        self.config.validate()?;
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store dependency missing"))?;
        let cache = self
            .cache
            .ok_or_else(|| anyhow::anyhow!("cache dependency missing"))?;
        let queue = self
            .queue
            .ok_or_else(|| anyhow::anyhow!("queue dependency missing"))?;
        let broker = self
            .broker
            .ok_or_else(|| anyhow::anyhow!("queue dependency missing"))?;
        let runner = self
            .runner
            .unwrap_or_else(|| Arc::new(TokioProcessRunner));
        let events = self
            .events
            .unwrap_or_else(|| Arc::new(InProcEventBus::default()));

        let executor = AttemptExecutor::new(
            Arc::new(self.config),
            store,
            cache,
            queue,
            runner,
            events,
        );
        Ok(OrchestratorRuntime::new(self.runtime, executor, broker))
    }
}
