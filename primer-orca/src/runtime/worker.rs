use serde::{Deserialize, Serialize};

/// Configuration for individual workers in the runtime.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Unique identifier for this worker. The task queue matches worker
    /// patterns against it.
    pub worker_id: String,
    /// Polling interval when no work is available, in milliseconds.
    pub poll_interval_ms: u64,
    /// Empty polls in a row before the worker backs off.
    pub max_poll_attempts: u32,
    /// Sleep after `max_poll_attempts` empty polls or a broker error, in
    /// milliseconds.
    pub backoff_ms: u64,
}

impl WorkerConfig {
    /// Create a new worker configuration with the given worker ID.
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Self::default()
        }
    }

    /// Set the polling interval.
    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// Set the maximum poll attempts.
    pub fn with_max_poll_attempts(mut self, attempts: u32) -> Self {
        self.max_poll_attempts = attempts;
        self
    }

    /// Set the backoff duration.
    pub fn with_backoff(mut self, ms: u64) -> Self {
        self.backoff_ms = ms;
        self
    }

    /// How long to sleep after `idle_polls` empty polls in a row.
    pub fn idle_delay(&self, idle_polls: u32) -> std::time::Duration {
        if idle_polls >= self.max_poll_attempts {
            std::time::Duration::from_millis(self.backoff_ms)
        } else {
            std::time::Duration::from_millis(self.poll_interval_ms)
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: "primer_run-w0".to_string(),
            poll_interval_ms: 50,
            max_poll_attempts: 10,
            backoff_ms: 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_idle_delay_backs_off() {
        let config = WorkerConfig::new("primer_run-1-w0")
            .with_poll_interval(10)
            .with_max_poll_attempts(3)
            .with_backoff(200);

        assert_eq!(config.idle_delay(1), Duration::from_millis(10));
        assert_eq!(config.idle_delay(3), Duration::from_millis(200));
        assert_eq!(config.idle_delay(9), Duration::from_millis(200));
    }
}
