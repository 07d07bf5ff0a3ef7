//! Lease queue configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_CHANNEL: &str = "default";
const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 15_000;

/// Whole milliseconds of `duration`, saturating at `u64::MAX`.
pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Invalid configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error(
        "lease duration ({lease:?}) must be greater than the heartbeat interval ({heartbeat:?})"
    )]
    LeaseTooShort { lease: Duration, heartbeat: Duration },
    #[error("channel name cannot be empty")]
    EmptyChannel,
}

/// Timing and partitioning of a [`LeaseQueue`](crate::LeaseQueue).
///
/// The lease defaults to twice the heartbeat interval plus one poll interval,
/// so a single missed heartbeat never hands the item to another worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub channel: String,
    pub poll_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Overrides the derived lease duration.
    pub lease_duration_ms: Option<u64>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            channel: DEFAULT_CHANNEL.to_string(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            lease_duration_ms: None,
        }
    }
}

impl QueueConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = millis(interval);
        self
    }

    /// Set the heartbeat interval for lease renewal.
    ///
    /// Should be well below the lease duration.
    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval_ms = millis(interval);
        self
    }

    #[must_use]
    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration_ms = Some(millis(lease));
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn lease_duration(&self) -> Duration {
        match self.lease_duration_ms {
            Some(ms) => Duration::from_millis(ms),
            None => self
                .heartbeat_interval()
                .saturating_mul(2)
                .saturating_add(self.poll_interval()),
        }
    }

    /// Check the invariants between the intervals.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channel.is_empty() {
            return Err(ConfigError::EmptyChannel);
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Zero("poll interval"));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Zero("heartbeat interval"));
        }
        let lease = self.lease_duration();
        let heartbeat = self.heartbeat_interval();
        if lease <= heartbeat {
            return Err(ConfigError::LeaseTooShort { lease, heartbeat });
        }
        Ok(())
    }
}
