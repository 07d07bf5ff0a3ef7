//! Job runtime, scheduler and memoizing saga workflow engine.
//!
//! - [`JobRunner`] runs one attempt of a stored job and records the outcome.
//! - [`Scheduler`] enqueues jobs, runs worker loops over a lease queue and
//!   waits for results.
//! - [`workflow`] builds staged, compensating workflows on top of both.
//!
//! # Example
//!
//! ```rust,ignore
//! use durable_runtime::workflow::{RegisterWorkflow, WorkflowJob, WorkflowRegistry};
//!
//! let mut workflows = WorkflowRegistry::new();
//! workflows.register_workflow::<Transfer>();
//! let mut registry = RunnableRegistry::new();
//! WorkflowJob::install(&mut registry, Arc::new(workflows));
//!
//! let scheduler = Scheduler::new(store, queue, registry);
//! scheduler.spawn_workers(config.workers, &cancel);
//! let record = scheduler.enqueue(&WorkflowJob::new(transfer), &["payments"]).await?;
//! scheduler.wait_for_completion(&cancel, record.as_ref()).await?.result()?;
//! ```

pub mod backoff;
pub mod config;
pub mod error;
pub mod runner;
pub mod scheduler;
pub mod testing;
pub mod workflow;

pub use backoff::{Backoff, RetryPolicy};
pub use config::RuntimeConfig;
pub use error::RuntimeError;
pub use runner::JobRunner;
pub use scheduler::Scheduler;
pub use workflow::{
    Failure, RegisterWorkflow, Runtime, StageOptions, StageResult, Workflow, WorkflowJob,
    WorkflowRegistry,
};

pub use durable_core as core;
pub use durable_persistence as persistence;
