//! Exponential backoff for retrying workflow scopes.
//!
//! ```text
//! Retry    Interval (defaults)    Randomized (±50%)
//! ─────────────────────────────────────────────────
//!   1          500ms               250ms - 750ms
//!   2          750ms               375ms - 1.1s
//!   3          1.1s                560ms - 1.7s
//!  ...
//!  n           60s (cap)           30s - 90s
//! ```
//!
//! Retrying stops once the total elapsed time would exceed `max_elapsed`, or
//! after `max_retries` when set.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

const DEFAULT_INITIAL_INTERVAL_MS: u64 = 500;
const DEFAULT_MULTIPLIER: f64 = 1.5;
const DEFAULT_RANDOMIZATION_FACTOR: f64 = 0.5;
const DEFAULT_MAX_INTERVAL_MS: u64 = 60_000;
const DEFAULT_MAX_ELAPSED_MS: u64 = 15 * 60_000;

/// Whole milliseconds of `duration`, saturating at `u64::MAX`.
pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn default_initial_interval() -> u64 {
    DEFAULT_INITIAL_INTERVAL_MS
}

fn default_multiplier() -> f64 {
    DEFAULT_MULTIPLIER
}

fn default_randomization_factor() -> f64 {
    DEFAULT_RANDOMIZATION_FACTOR
}

fn default_max_interval() -> u64 {
    DEFAULT_MAX_INTERVAL_MS
}

fn default_max_elapsed() -> Option<u64> {
    Some(DEFAULT_MAX_ELAPSED_MS)
}

/// Retry schedule for a workflow scope.
///
/// Persisted with each workflow job, so changing the policy of a running job
/// means re-enqueueing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    #[serde(default = "default_initial_interval")]
    pub initial_interval_ms: u64,
    /// Growth factor between consecutive intervals.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Each delay is drawn from `interval * (1 ± factor)`.
    #[serde(default = "default_randomization_factor")]
    pub randomization_factor: f64,
    /// Cap on the un-randomized interval.
    #[serde(default = "default_max_interval")]
    pub max_interval_ms: u64,
    /// Total retry budget per scope; `None` retries forever.
    #[serde(default = "default_max_elapsed")]
    pub max_elapsed_ms: Option<u64>,
    /// Optional cap on the number of retries.
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval_ms: DEFAULT_INITIAL_INTERVAL_MS,
            multiplier: DEFAULT_MULTIPLIER,
            randomization_factor: DEFAULT_RANDOMIZATION_FACTOR,
            max_interval_ms: DEFAULT_MAX_INTERVAL_MS,
            max_elapsed_ms: Some(DEFAULT_MAX_ELAPSED_MS),
            max_retries: None,
        }
    }
}

impl RetryPolicy {
    /// Fixed, jitter-free retries. Mostly useful in tests.
    pub fn constant(interval: Duration) -> Self {
        Self {
            initial_interval_ms: millis(interval),
            multiplier: 1.0,
            randomization_factor: 0.0,
            max_interval_ms: millis(interval),
            max_elapsed_ms: None,
            max_retries: None,
        }
    }

    #[must_use]
    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval_ms = millis(interval);
        self
    }

    #[must_use]
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval_ms = millis(interval);
        self
    }

    #[must_use]
    pub fn with_max_elapsed(mut self, max: Option<Duration>) -> Self {
        self.max_elapsed_ms = max.map(millis);
        self
    }

    #[must_use]
    pub fn with_max_retries(mut self, max: Option<u32>) -> Self {
        self.max_retries = max;
        self
    }

    /// Start a fresh schedule.
    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: self.clone(),
            current: Duration::from_millis(self.initial_interval_ms),
            started: Instant::now(),
            retries: 0,
        }
    }
}

impl fmt::Display for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RetryPolicy(initial={}ms, x{}, ±{}%, max={}ms",
            self.initial_interval_ms,
            self.multiplier,
            (self.randomization_factor * 100.0) as u32,
            self.max_interval_ms
        )?;
        match self.max_elapsed_ms {
            Some(ms) => write!(f, ", budget={}ms)", ms),
            None => write!(f, ", budget=unlimited)"),
        }
    }
}

/// A running backoff schedule.
#[derive(Debug)]
pub struct Backoff {
    policy: RetryPolicy,
    current: Duration,
    started: Instant,
    retries: u32,
}

impl Backoff {
    /// Delay before the next retry, or `None` when the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.policy.max_retries {
            if self.retries >= max {
                return None;
            }
        }

        let delay = self.randomized(self.current);
        if let Some(max_elapsed) = self.policy.max_elapsed_ms {
            let spent = self.started.elapsed().saturating_add(delay);
            if spent > Duration::from_millis(max_elapsed) {
                return None;
            }
        }

        let max_interval = Duration::from_millis(self.policy.max_interval_ms);
        self.current = self
            .current
            .mul_f64(self.policy.multiplier.max(1.0))
            .min(max_interval);
        self.retries += 1;
        Some(delay)
    }

    /// Retries handed out so far.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    fn randomized(&self, interval: Duration) -> Duration {
        let factor = self.policy.randomization_factor.clamp(0.0, 1.0);
        if factor == 0.0 {
            return interval;
        }
        let jitter = rand::thread_rng().gen_range(-factor..=factor);
        interval.mul_f64(1.0 + jitter)
    }
}
