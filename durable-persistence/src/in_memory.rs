//! In-memory implementations of [`Store`] and [`LeaseBackend`].
//!
//! Both keep their data in `HashMap`s behind `RwLock`s and are cheap to clone;
//! clones share state. Useful for tests and as reference implementations of the
//! contracts.

use crate::queue::LeaseBackend;
use crate::store::{Record, Store, DEFAULT_WAIT_POLL_INTERVAL};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use durable_core::{
    encode_runnable, QueueError, Runnable, Snapshot, SnapshotOptions, StoreError, WorkItem,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

fn lock_error(e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(format!("Lock error: {}", e))
}

/// In-memory store.
///
/// # Example
///
/// ```rust,ignore
/// use durable_persistence::{InMemoryStore, Store};
///
/// let store = InMemoryStore::new();
/// let record = store.create(&job, &["nightly"]).await?;
/// ```
#[derive(Clone)]
pub struct InMemoryStore {
    records: Arc<RwLock<HashMap<String, Arc<InMemoryRecord>>>>,
    tags: Arc<RwLock<HashMap<String, HashSet<String>>>>,
    poll_interval: Duration,
}

impl InMemoryStore {
    /// Create a new in-memory store.
    pub fn new() -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            tags: Arc::new(RwLock::new(HashMap::new())),
            poll_interval: DEFAULT_WAIT_POLL_INTERVAL,
        }
    }

    /// Set how often waiters re-check the log when no local signal arrives.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn create(
        &self,
        runnable: &dyn Runnable,
        tags: &[&str],
    ) -> Result<Arc<dyn Record>, StoreError> {
        let state = encode_runnable(runnable)?;
        let job_id = uuid::Uuid::new_v4().to_string();
        let record = Arc::new(InMemoryRecord::new(
            job_id.clone(),
            tags.iter().map(|t| t.to_string()).collect(),
            state,
            self.poll_interval,
        ));

        {
            let mut index = self.tags.write().map_err(lock_error)?;
            for tag in tags {
                index
                    .entry(tag.to_string())
                    .or_default()
                    .insert(job_id.clone());
            }
        }
        self.records
            .write()
            .map_err(lock_error)?
            .insert(job_id.clone(), record.clone());

        tracing::debug!(job_id = %job_id, "Created record");
        Ok(record)
    }

    async fn load(&self, job_id: &str) -> Result<Arc<dyn Record>, StoreError> {
        let records = self.records.read().map_err(lock_error)?;
        records
            .get(job_id)
            .cloned()
            .map(|r| r as Arc<dyn Record>)
            .ok_or_else(|| StoreError::NotFound(job_id.to_string()))
    }

    async fn search_by_tag(&self, tag: &str) -> Result<Vec<String>, StoreError> {
        let index = self.tags.read().map_err(lock_error)?;
        Ok(index
            .get(tag)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete(&self, job_id: &str) -> Result<(), StoreError> {
        let record = self
            .records
            .write()
            .map_err(lock_error)?
            .remove(job_id)
            .ok_or_else(|| StoreError::NotFound(job_id.to_string()))?;

        let mut index = self.tags.write().map_err(lock_error)?;
        for tag in record.tags() {
            if let Some(ids) = index.get_mut(tag) {
                ids.remove(job_id);
                if ids.is_empty() {
                    index.remove(tag);
                }
            }
        }
        Ok(())
    }
}

/// A record held by [`InMemoryStore`].
pub struct InMemoryRecord {
    job_id: String,
    tags: Vec<String>,
    snapshots: RwLock<Vec<Snapshot>>,
    updated: Notify,
    poll_interval: Duration,
}

impl InMemoryRecord {
    fn new(job_id: String, tags: Vec<String>, state: Bytes, poll_interval: Duration) -> Self {
        let first = Snapshot {
            job_id: job_id.clone(),
            index: 0,
            state,
            description: None,
            error: None,
            is_final: false,
            created_at: Utc::now(),
        };
        Self {
            job_id,
            tags,
            snapshots: RwLock::new(vec![first]),
            updated: Notify::new(),
            poll_interval,
        }
    }

    fn is_newer(&self, after: &Snapshot) -> Result<bool, StoreError> {
        let snapshots = self.snapshots.read().map_err(lock_error)?;
        Ok(snapshots.len() as u64 > after.index + 1)
    }
}

#[async_trait]
impl Record for InMemoryRecord {
    fn job_id(&self) -> &str {
        &self.job_id
    }

    fn tags(&self) -> &[String] {
        &self.tags
    }

    async fn add_snapshot(
        &self,
        state: Bytes,
        options: SnapshotOptions,
    ) -> Result<Snapshot, StoreError> {
        let snapshot = {
            let mut snapshots = self.snapshots.write().map_err(lock_error)?;
            let last = snapshots
                .last()
                .ok_or_else(|| StoreError::Backend("record has no snapshots".to_string()))?;
            if last.is_final {
                return Err(StoreError::AlreadyFinal(self.job_id.clone()));
            }

            let mut created_at = Utc::now();
            if created_at <= last.created_at {
                created_at = last.created_at + chrono::Duration::microseconds(1);
            }

            let snapshot = Snapshot {
                job_id: self.job_id.clone(),
                index: snapshots.len() as u64,
                state,
                description: options.description,
                error: options.error,
                is_final: options.is_final,
                created_at,
            };
            snapshots.push(snapshot.clone());
            snapshot
        };

        self.updated.notify_waiters();
        Ok(snapshot)
    }

    async fn last_snapshot(&self) -> Result<Snapshot, StoreError> {
        let snapshots = self.snapshots.read().map_err(lock_error)?;
        snapshots
            .last()
            .cloned()
            .ok_or_else(|| StoreError::Backend("record has no snapshots".to_string()))
    }

    async fn snapshots_since(&self, after: Option<&Snapshot>) -> Result<Vec<Snapshot>, StoreError> {
        let snapshots = self.snapshots.read().map_err(lock_error)?;
        let start = match after {
            None => 0,
            Some(after) if after.job_id != self.job_id => {
                return Err(StoreError::Backend(format!(
                    "snapshot belongs to record {}, not {}",
                    after.job_id, self.job_id
                )));
            }
            Some(after) => (after.index + 1) as usize,
        };
        Ok(snapshots.iter().skip(start).cloned().collect())
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    async fn wait_for_update(
        &self,
        cancel: &CancellationToken,
        after: &Snapshot,
    ) -> Result<(), StoreError> {
        if after.is_final {
            return Err(StoreError::AlreadyFinal(self.job_id.clone()));
        }
        loop {
            // Register before checking so an append in between is not missed.
            let notified = self.updated.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_newer(after)? {
                return Ok(());
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(StoreError::Cancelled),
                _ = &mut notified => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}

/// In-memory lease table.
#[derive(Clone, Default)]
pub struct InMemoryLeaseBackend {
    items: Arc<RwLock<HashMap<String, WorkItem>>>,
}

impl InMemoryLeaseBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of items still queued.
    pub fn len(&self) -> usize {
        self.items.read().map(|items| items.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn queue_lock_error(e: impl std::fmt::Display) -> QueueError {
    QueueError::Backend(format!("Lock error: {}", e))
}

#[async_trait]
impl LeaseBackend for InMemoryLeaseBackend {
    async fn insert(&self, item: WorkItem) -> Result<(), QueueError> {
        let mut items = self.items.write().map_err(queue_lock_error)?;
        if items.contains_key(&item.job_id) {
            return Err(QueueError::Duplicate(item.job_id));
        }
        items.insert(item.job_id.clone(), item);
        Ok(())
    }

    async fn next_runnable(
        &self,
        channel: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<WorkItem>, QueueError> {
        let items = self.items.read().map_err(queue_lock_error)?;
        Ok(items
            .values()
            .filter(|item| item.channel == channel && item.is_runnable(now))
            .min_by_key(|item| item.runnable_at)
            .cloned())
    }

    async fn compare_and_swap(
        &self,
        expected: &WorkItem,
        replacement: WorkItem,
    ) -> Result<bool, QueueError> {
        let mut items = self.items.write().map_err(queue_lock_error)?;
        match items.get_mut(&expected.job_id) {
            Some(item) if item.attempt_count == expected.attempt_count => {
                *item = replacement;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn remove_leased(&self, lease: &WorkItem) -> Result<bool, QueueError> {
        let mut items = self.items.write().map_err(queue_lock_error)?;
        match items.get(&lease.job_id) {
            Some(item) if item.same_lease(lease) => {
                items.remove(&lease.job_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, job_id: &str) -> Result<Option<WorkItem>, QueueError> {
        let items = self.items.read().map_err(queue_lock_error)?;
        Ok(items.get(job_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compat;
    use chrono::Duration as ChronoDuration;

    #[tokio::test]
    async fn test_store_compatibility() {
        let store = InMemoryStore::new().with_poll_interval(Duration::from_millis(20));
        compat::run_store_suite(&store).await;
    }

    #[tokio::test]
    async fn test_wait_for_update_wakes_on_append() {
        // A long poll interval proves the wake-up comes from the local signal.
        let store = InMemoryStore::new().with_poll_interval(Duration::from_secs(60));
        let record = store.create(&compat::Marker::new(0), &[]).await.unwrap();
        let first = record.last_snapshot().await.unwrap();

        let writer = record.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer
                .add_snapshot(Bytes::from_static(b"{}"), SnapshotOptions::new())
                .await
                .unwrap();
        });

        let cancel = CancellationToken::new();
        tokio::time::timeout(
            Duration::from_secs(2),
            record.wait_for_update(&cancel, &first),
        )
        .await
        .expect("wait should return once a snapshot is appended")
        .unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_update_cancelled() {
        let store = InMemoryStore::new();
        let record = store.create(&compat::Marker::new(0), &[]).await.unwrap();
        let first = record.last_snapshot().await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = record.wait_for_update(&cancel, &first).await;
        assert!(matches!(result, Err(StoreError::Cancelled)));
    }

    #[tokio::test]
    async fn test_timestamps_strictly_increase() {
        let store = InMemoryStore::new();
        let record = store.create(&compat::Marker::new(0), &[]).await.unwrap();
        for _ in 0..50 {
            record
                .add_snapshot(Bytes::from_static(b"{}"), SnapshotOptions::new())
                .await
                .unwrap();
        }
        let log = record.snapshots_since(None).await.unwrap();
        assert!(log.windows(2).all(|w| w[0].created_at < w[1].created_at));
    }

    #[tokio::test]
    async fn test_lease_compare_and_swap() {
        let backend = InMemoryLeaseBackend::new();
        let item = WorkItem::new("job-1", "default");
        backend.insert(item.clone()).await.unwrap();

        let now = Utc::now();
        let leased = item.leased(now, ChronoDuration::seconds(30));
        assert!(backend.compare_and_swap(&item, leased.clone()).await.unwrap());

        // A second worker holding the stale view must lose.
        let stale = item.leased(now, ChronoDuration::seconds(30));
        assert!(!backend.compare_and_swap(&item, stale).await.unwrap());

        assert!(backend
            .next_runnable("default", now)
            .await
            .unwrap()
            .is_none());
        assert!(backend
            .next_runnable("default", now + ChronoDuration::seconds(31))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_lease_insert_duplicate() {
        let backend = InMemoryLeaseBackend::new();
        backend.insert(WorkItem::new("job-1", "default")).await.unwrap();
        let err = backend
            .insert(WorkItem::new("job-1", "default"))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Duplicate(id) if id == "job-1"));
    }

    #[tokio::test]
    async fn test_remove_leased_requires_current_lease() {
        let backend = InMemoryLeaseBackend::new();
        let item = WorkItem::new("job-1", "default");
        backend.insert(item.clone()).await.unwrap();
        let first = item.leased(Utc::now(), ChronoDuration::seconds(1));
        backend.compare_and_swap(&item, first.clone()).await.unwrap();
        let second = first.leased(Utc::now(), ChronoDuration::seconds(1));
        backend.compare_and_swap(&first, second.clone()).await.unwrap();

        assert!(!backend.remove_leased(&first).await.unwrap());
        assert!(backend.remove_leased(&second).await.unwrap());
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_next_runnable_orders_by_deadline_and_channel() {
        let backend = InMemoryLeaseBackend::new();
        let now = Utc::now();
        let mut late = WorkItem::new("late", "default");
        late.runnable_at = now - ChronoDuration::seconds(1);
        let mut early = WorkItem::new("early", "default");
        early.runnable_at = now - ChronoDuration::seconds(10);
        let mut other = WorkItem::new("other", "emails");
        other.runnable_at = now - ChronoDuration::seconds(20);
        for item in [late, early, other] {
            backend.insert(item).await.unwrap();
        }

        let next = backend.next_runnable("default", now).await.unwrap().unwrap();
        assert_eq!(next.job_id, "early");
    }
}
