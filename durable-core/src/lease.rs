//! Queue-level claim on a job record.
//!
//! A work item is both the queue entry and its lease: while a worker holds it,
//! `runnable_at` is pushed into the future and `attempt_count` identifies the
//! current holder. Acquisition and renewal are compare-and-update operations on
//! `attempt_count`, so a worker whose lease was taken over can detect it.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A scheduled job in a named channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    /// The record id.
    pub job_id: String,
    /// Partition of the queue this item belongs to.
    pub channel: String,
    /// The item may be acquired once this deadline has passed.
    pub runnable_at: DateTime<Utc>,
    /// Incremented on every acquisition.
    pub attempt_count: u32,
}

impl WorkItem {
    /// Create an item that is immediately runnable.
    pub fn new(job_id: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            channel: channel.into(),
            runnable_at: Utc::now(),
            attempt_count: 0,
        }
    }

    /// Check if the item can be acquired at `now`.
    pub fn is_runnable(&self, now: DateTime<Utc>) -> bool {
        self.runnable_at <= now
    }

    /// The item as it looks after a successful acquisition.
    pub fn leased(&self, now: DateTime<Utc>, lease: Duration) -> Self {
        Self {
            runnable_at: now + lease,
            attempt_count: self.attempt_count + 1,
            ..self.clone()
        }
    }

    /// Check if `other` refers to the same acquisition of the same job.
    pub fn same_lease(&self, other: &WorkItem) -> bool {
        self.job_id == other.job_id && self.attempt_count == other.attempt_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_item_is_runnable() {
        let item = WorkItem::new("job-1", "default");
        assert!(item.is_runnable(Utc::now()));
        assert_eq!(item.attempt_count, 0);
    }

    #[test]
    fn test_leased_pushes_deadline() {
        let now = Utc::now();
        let item = WorkItem::new("job-1", "default");
        let leased = item.leased(now, Duration::seconds(30));
        assert_eq!(leased.attempt_count, 1);
        assert!(!leased.is_runnable(now));
        assert!(leased.is_runnable(now + Duration::seconds(31)));
        assert!(!item.same_lease(&leased));
    }
}
