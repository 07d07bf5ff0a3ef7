//! Type registry for polymorphic payloads.
//!
//! Persisted blobs are [`Envelope`]s naming their concrete type. The registry
//! maps those names to decoders so a store can hand back bytes without knowing
//! any concrete types up front.
//!
//! # Registry as Code, Not Data
//!
//! The registry contains closures and cannot be serialized itself. Every
//! process that encodes or decodes jobs must build the same registry from code:
//!
//! ```rust,ignore
//! fn build_registry() -> RunnableRegistry {
//!     let mut registry = RunnableRegistry::new();
//!     registry.register::<SendEmail>().register::<Cleanup>();
//!     registry
//! }
//! ```

use crate::codec::{Decoder, Envelope, JsonCodec};
use crate::error::CodecError;
use crate::runnable::{Durable, Runnable};
use std::collections::HashMap;

/// Name to decoder map for a family of trait objects.
#[allow(clippy::type_complexity)]
pub struct TypeRegistry<T: ?Sized> {
    decoders: HashMap<String, Box<dyn Fn(&[u8]) -> Result<Box<T>, CodecError> + Send + Sync>>,
}

/// Registry of everything the job runtime can execute.
pub type RunnableRegistry = TypeRegistry<dyn Runnable>;

impl<T: ?Sized> Default for TypeRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> TypeRegistry<T> {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Register a decoder under `type_name`, replacing any previous one.
    pub fn register_with<F>(&mut self, type_name: &str, decode: F) -> &mut Self
    where
        F: Fn(&[u8]) -> Result<Box<T>, CodecError> + Send + Sync + 'static,
    {
        self.decoders.insert(type_name.to_string(), Box::new(decode));
        self
    }

    /// Decode an envelope.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::UnknownType` if the envelope names an unregistered type.
    pub fn decode(&self, bytes: &[u8]) -> Result<Box<T>, CodecError> {
        let envelope = Envelope::from_bytes(bytes)?;
        self.decode_payload(&envelope.type_name, &envelope.payload)
    }

    /// Decode a bare payload whose type name is already known.
    pub fn decode_payload(&self, type_name: &str, payload: &[u8]) -> Result<Box<T>, CodecError> {
        let decode = self
            .decoders
            .get(type_name)
            .ok_or_else(|| CodecError::UnknownType(type_name.to_string()))?;
        decode(payload)
    }

    /// Check if a type name is registered.
    pub fn contains(&self, type_name: &str) -> bool {
        self.decoders.contains_key(type_name)
    }

    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }

    /// Registered type names, in no particular order.
    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.decoders.keys().map(String::as_str)
    }
}

impl TypeRegistry<dyn Runnable> {
    /// Register a durable runnable type under its `TYPE_NAME`.
    pub fn register<R>(&mut self) -> &mut Self
    where
        R: Runnable + Durable,
    {
        self.register_with(R::TYPE_NAME, |payload| {
            let runnable: R = JsonCodec.decode(payload)?;
            Ok(Box::new(runnable) as Box<dyn Runnable>)
        })
    }
}
