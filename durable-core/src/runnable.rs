//! The unit of work executed by the job runtime.
//!
//! A [`Runnable`] is decoded fresh from the latest snapshot on every attempt,
//! run against a [`JobRuntime`] handle bound to its record, and then encoded
//! again into the next snapshot. Plain jobs implement [`Job`]; the blanket
//! impl turns any `Job` into a `Runnable`.
//!
//! # Example
//!
//! ```rust,ignore
//! #[derive(Serialize, Deserialize, Durable)]
//! #[durable(name = "send_email")]
//! struct SendEmail { to: String, sent: bool }
//!
//! #[async_trait]
//! impl Job for SendEmail {
//!     async fn run(&mut self, rt: &dyn JobRuntime) -> Result<(), JobError> {
//!         mailer::send(&self.to).await.map_err(JobError::transient)?;
//!         self.sent = true;
//!         Ok(())
//!     }
//! }
//! ```

use crate::codec::{Encoder, Envelope, JsonCodec};
use crate::error::{CodecError, JobError, StoreError};
use crate::snapshot::SnapshotOptions;
use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// A payload type that can be persisted and decoded by name.
///
/// Usually derived with `#[derive(Durable)]`.
pub trait Durable: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable name used to select the decoder for this type.
    const TYPE_NAME: &'static str;
}

/// Handle passed to a running job, bound to its record.
#[async_trait]
pub trait JobRuntime: Send + Sync {
    /// Id of the record being executed.
    fn id(&self) -> &str;

    /// Cancellation for the current attempt.
    fn cancellation(&self) -> &CancellationToken;

    /// Persist intermediate progress as a new non-final snapshot.
    ///
    /// `state` is the encoded runnable (see [`encode_runnable`]).
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the snapshot cannot be appended.
    async fn update(&self, state: Bytes, options: SnapshotOptions) -> Result<(), StoreError>;
}

/// Serializable root unit of work.
#[async_trait]
pub trait Runnable: Send + Sync + 'static {
    /// Registry name of the concrete type.
    fn type_name(&self) -> &'static str;

    /// Encode the current state (without the envelope).
    fn encode(&self) -> Result<Bytes, CodecError>;

    /// Execute one attempt.
    async fn run(&mut self, rt: &dyn JobRuntime) -> Result<(), JobError>;
}

/// A plain job: a durable payload with an entry point.
#[async_trait]
pub trait Job: Durable {
    async fn run(&mut self, rt: &dyn JobRuntime) -> Result<(), JobError>;
}

#[async_trait]
impl<J: Job> Runnable for J {
    fn type_name(&self) -> &'static str {
        J::TYPE_NAME
    }

    fn encode(&self) -> Result<Bytes, CodecError> {
        JsonCodec.encode(self)
    }

    async fn run(&mut self, rt: &dyn JobRuntime) -> Result<(), JobError> {
        Job::run(self, rt).await
    }
}

/// Encode a runnable into its self-describing envelope.
pub fn encode_runnable(runnable: &dyn Runnable) -> Result<Bytes, CodecError> {
    Envelope::new(runnable.type_name(), runnable.encode()?).to_bytes()
}
