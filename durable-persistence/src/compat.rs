//! Behavioral test suite for [`Store`] implementations.
//!
//! Backends outside this crate can run the same checks the in-memory store
//! passes:
//!
//! ```rust,ignore
//! #[tokio::test]
//! async fn test_postgres_store() {
//!     let store = PostgresStore::connect(&url).await.unwrap();
//!     durable_persistence::compat::run_store_suite(&store).await;
//! }
//! ```
//!
//! The suite panics on the first violated expectation.

use crate::store::Store;
use async_trait::async_trait;
use durable_core::{
    Durable, Job, JobError, JobRuntime, RunnableRegistry, SnapshotOptions, StoreError,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Minimal runnable used by the suite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Marker {
    pub value: u64,
}

impl Marker {
    pub fn new(value: u64) -> Self {
        Self { value }
    }
}

impl Durable for Marker {
    const TYPE_NAME: &'static str = "compat.marker";
}

#[async_trait]
impl Job for Marker {
    async fn run(&mut self, _rt: &dyn JobRuntime) -> Result<(), JobError> {
        self.value += 1;
        Ok(())
    }
}

/// Run every check against `store`.
pub async fn run_store_suite<S: Store>(store: &S) {
    create_and_load(store).await;
    search_and_delete(store).await;
    snapshot_log(store).await;
    final_closes_log(store).await;
    wait_for_update(store).await;
}

async fn create_and_load<S: Store>(store: &S) {
    let record = store.create(&Marker::new(7), &["a"]).await.unwrap();
    assert_eq!(record.tags(), ["a".to_string()]);

    let loaded = store.load(record.job_id()).await.unwrap();
    assert_eq!(loaded.job_id(), record.job_id());

    let first = loaded.last_snapshot().await.unwrap();
    assert!(!first.is_final);
    assert!(first.error.is_none());

    let mut registry = RunnableRegistry::new();
    registry.register::<Marker>();
    let runnable = first.decode_runnable(&registry).unwrap();
    assert_eq!(runnable.type_name(), Marker::TYPE_NAME);

    assert!(matches!(
        store.load("missing").await.err(),
        Some(StoreError::NotFound(_))
    ));
}

async fn search_and_delete<S: Store>(store: &S) {
    let tag = format!("tag-{}", uuid::Uuid::new_v4());
    let one = store.create(&Marker::new(1), &[tag.as_str()]).await.unwrap();
    let two = store.create(&Marker::new(2), &[tag.as_str(), "other"]).await.unwrap();

    let mut found = store.search_by_tag(&tag).await.unwrap();
    found.sort();
    let mut expected = vec![one.job_id().to_string(), two.job_id().to_string()];
    expected.sort();
    assert_eq!(found, expected);

    store.delete(one.job_id()).await.unwrap();
    assert_eq!(
        store.search_by_tag(&tag).await.unwrap(),
        vec![two.job_id().to_string()]
    );
    assert!(matches!(
        store.load(one.job_id()).await.err(),
        Some(StoreError::NotFound(_))
    ));
    assert!(matches!(
        store.delete(one.job_id()).await,
        Err(StoreError::NotFound(_))
    ));
    assert!(store
        .search_by_tag("never-used-tag")
        .await
        .unwrap()
        .is_empty());
}

async fn snapshot_log<S: Store>(store: &S) {
    let record = store.create(&Marker::new(0), &[]).await.unwrap();
    let first = record.last_snapshot().await.unwrap();

    let second = record
        .add_runnable(&Marker::new(1), SnapshotOptions::new().with_description("one"))
        .await
        .unwrap();
    let err = JobError::transient(anyhow::anyhow!("flaky"));
    let third = record
        .add_runnable(&Marker::new(2), SnapshotOptions::new().with_error(Some(&err)))
        .await
        .unwrap();

    assert!(second.is_newer_than(&first));
    assert!(third.created_at > second.created_at);
    assert_eq!(second.description.as_deref(), Some("one"));
    assert_eq!(third.error.as_deref(), Some("flaky"));

    let all = record.snapshots_since(None).await.unwrap();
    assert_eq!(all.len(), 3);
    assert_eq!(all[0], first);

    let since = record.snapshots_since(Some(&second)).await.unwrap();
    assert_eq!(since, vec![third.clone()]);
    assert!(record.snapshots_since(Some(&third)).await.unwrap().is_empty());
    assert_eq!(record.last_snapshot().await.unwrap(), third);
}

async fn final_closes_log<S: Store>(store: &S) {
    let record = store.create(&Marker::new(0), &[]).await.unwrap();
    let last = record
        .add_runnable(&Marker::new(1), SnapshotOptions::new().as_final(true))
        .await
        .unwrap();
    assert!(last.is_final);
    assert!(last.result().is_ok());

    let rejected = record
        .add_runnable(&Marker::new(2), SnapshotOptions::new())
        .await;
    assert!(matches!(rejected, Err(StoreError::AlreadyFinal(_))));

    let cancel = CancellationToken::new();
    assert!(matches!(
        record.wait_for_update(&cancel, &last).await,
        Err(StoreError::AlreadyFinal(_))
    ));
}

async fn wait_for_update<S: Store>(store: &S) {
    let record = store.create(&Marker::new(0), &[]).await.unwrap();
    let first = record.last_snapshot().await.unwrap();
    let cancel = CancellationToken::new();

    // Nothing newer yet: the wait must block until cancelled.
    let blocked = tokio::time::timeout(
        Duration::from_millis(50),
        record.wait_for_update(&cancel, &first),
    )
    .await;
    assert!(blocked.is_err(), "wait returned without a newer snapshot");

    record
        .add_runnable(&Marker::new(1), SnapshotOptions::new())
        .await
        .unwrap();

    // A newer snapshot exists: return immediately.
    tokio::time::timeout(
        Duration::from_secs(1),
        record.wait_for_update(&cancel, &first),
    )
    .await
    .expect("wait blocked although a newer snapshot exists")
    .unwrap();

    let latest = record.last_snapshot().await.unwrap();
    cancel.cancel();
    assert!(matches!(
        record.wait_for_update(&cancel, &latest).await,
        Err(StoreError::Cancelled)
    ));
}
