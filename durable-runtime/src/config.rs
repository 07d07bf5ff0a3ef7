//! Runtime configuration.
//!
//! ```rust,ignore
//! let config = RuntimeConfig::from_json(r#"{
//!     "queue": { "channel": "billing", "heartbeat_interval_ms": 5000 },
//!     "retry": { "max_elapsed_ms": null }
//! }"#)?;
//! ```

use crate::backoff::{millis, RetryPolicy};
use crate::error::RuntimeError;
use durable_persistence::{ConfigError, QueueConfig, DEFAULT_WAIT_POLL_INTERVAL};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Everything needed to run workers in one process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub queue: QueueConfig,
    /// Default retry policy for workflow jobs that do not set their own.
    pub retry: RetryPolicy,
    /// Poll bound for `wait_for_update` on stores without a local signal.
    pub wait_poll_interval_ms: u64,
    /// Worker loops started by [`Scheduler::spawn_workers`](crate::Scheduler::spawn_workers).
    pub workers: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            retry: RetryPolicy::default(),
            wait_poll_interval_ms: millis(DEFAULT_WAIT_POLL_INTERVAL),
            workers: 1,
        }
    }
}

impl RuntimeConfig {
    /// Parse and validate a JSON document. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, RuntimeError> {
        let config: RuntimeConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), RuntimeError> {
        self.queue.validate()?;
        if self.wait_poll_interval_ms == 0 {
            return Err(ConfigError::Zero("wait poll interval").into());
        }
        if self.workers == 0 {
            return Err(ConfigError::Zero("workers").into());
        }
        Ok(())
    }

    pub fn wait_poll_interval(&self) -> Duration {
        Duration::from_millis(self.wait_poll_interval_ms)
    }

    #[must_use]
    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }
}
