//! Core contracts for durable, staged jobs.
//!
//! This crate holds the pieces shared by storage backends and the runtime:
//! the payload traits ([`Durable`], [`Runnable`], [`Job`]), the error taxonomy,
//! the codec and type registry used for every persisted blob, snapshots and
//! queue work items.

extern crate self as durable_core;

pub mod codec;
pub mod error;
pub mod lease;
pub mod registry;
pub mod runnable;
pub mod snapshot;

pub use durable_macros::Durable;
pub use error::{CodecError, JobError, QueueError, StoreError};
pub use lease::WorkItem;
pub use registry::{RunnableRegistry, TypeRegistry};
pub use runnable::{encode_runnable, Durable, Job, JobRuntime, Runnable};
pub use snapshot::{Snapshot, SnapshotOptions};
