//! Storage contracts for durable jobs.
//!
//! This crate provides the traits the runtime persists through, plus in-memory
//! reference implementations:
//!
//! - **[`Store`] / [`Record`]**: an append-only log of snapshots per job.
//! - **[`Queue`]**: at-least-once dispatch of job ids to workers.
//! - **[`LeaseQueue`]**: a [`Queue`] built on any [`LeaseBackend`], providing
//!   lease acquisition by compare-and-swap, heartbeat renewal and a local
//!   fast path for same-process workers.
//!
//! # Implementing Custom Backends
//!
//! To back jobs with a database, implement [`Store`] and [`Record`] with
//! append-only writes, and [`LeaseBackend`] with a conditional update on the
//! attempt counter. Then check the store against [`compat::run_store_suite`].
//!
//! ```rust,ignore
//! use durable_persistence::{LeaseBackend, LeaseQueue, QueueConfig};
//!
//! pub struct PostgresLeases { /* pool */ }
//!
//! #[async_trait]
//! impl LeaseBackend for PostgresLeases {
//!     async fn compare_and_swap(
//!         &self,
//!         expected: &WorkItem,
//!         replacement: WorkItem,
//!     ) -> Result<bool, QueueError> {
//!         // UPDATE work_items SET runnable_at = $1, attempt_count = $2
//!         //  WHERE job_id = $3 AND attempt_count = $4
//!     }
//!     // ... implement other methods
//! }
//!
//! let queue = LeaseQueue::new(PostgresLeases::new(pool), QueueConfig::default())?;
//! ```

pub mod compat;
mod config;
mod in_memory;
mod lease_queue;
mod queue;
mod store;

pub use config::{ConfigError, QueueConfig};
pub use in_memory::{InMemoryLeaseBackend, InMemoryRecord, InMemoryStore};
pub use lease_queue::LeaseQueue;
pub use queue::{LeaseBackend, Queue, WorkHandler};
pub use store::{Record, Store, DEFAULT_WAIT_POLL_INTERVAL};
