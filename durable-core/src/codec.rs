use crate::error::CodecError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Sealed helper traits for codec implementations.
/// These traits allow implementations to specify their own type bounds.
///
/// # Implementation Note
///
/// To implement `Encoder` or `Decoder`, you need to:
/// 1. Implement the `Encoder` or `Decoder` trait (empty impl is fine)
/// 2. Implement `sealed::EncodeValue<T>` or `sealed::DecodeValue<T>` with your desired bounds
pub mod sealed {
    use super::*;

    /// Helper trait for encoding with custom bounds.
    pub trait EncodeValue<T: ?Sized>: Send + Sync + 'static {
        fn encode_value(&self, value: &T) -> Result<Bytes, CodecError>;
    }

    /// Helper trait for decoding with custom bounds.
    pub trait DecodeValue<T>: Send + Sync + 'static {
        fn decode_value(&self, bytes: &[u8]) -> Result<T, CodecError>;
    }
}

/// An encoder that can serialize a value into a byte stream.
pub trait Encoder: Send + Sync + 'static {
    fn encode<T: ?Sized>(&self, value: &T) -> Result<Bytes, CodecError>
    where
        Self: sealed::EncodeValue<T>,
    {
        sealed::EncodeValue::encode_value(self, value)
    }
}

/// A decoder that can deserialize a value from a byte stream.
pub trait Decoder: Send + Sync + 'static {
    fn decode<T>(&self, bytes: &[u8]) -> Result<T, CodecError>
    where
        Self: sealed::DecodeValue<T>,
    {
        sealed::DecodeValue::decode_value(self, bytes)
    }
}

/// A codec that can serialize and deserialize a value.
pub trait Codec: Encoder + Decoder {}

/// Blanket impl `Codec` for any type that implements Encoder and Decoder.
impl<U> Codec for U where U: Encoder + Decoder {}

/// JSON codec backed by `serde_json`.
///
/// This is the format every persisted blob uses: snapshot state, workflow
/// payloads and cached stage outputs.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Encoder for JsonCodec {}
impl Decoder for JsonCodec {}

impl<T> sealed::EncodeValue<T> for JsonCodec
where
    T: Serialize + ?Sized,
{
    fn encode_value(&self, value: &T) -> Result<Bytes, CodecError> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| CodecError::Encode(e.to_string()))
    }
}

impl<T> sealed::DecodeValue<T> for JsonCodec
where
    T: for<'de> Deserialize<'de>,
{
    fn decode_value(&self, bytes: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

/// Current envelope format version.
pub const ENVELOPE_VERSION: u32 = 1;

/// Self-describing wrapper around a polymorphic payload.
///
/// The type name selects the decoder in a [`TypeRegistry`](crate::registry::TypeRegistry);
/// the payload itself stays opaque to everything but that decoder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub type_name: String,
    pub version: u32,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn new(type_name: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            type_name: type_name.into(),
            version: ENVELOPE_VERSION,
            payload: payload.into(),
        }
    }

    /// Encode the envelope itself.
    pub fn to_bytes(&self) -> Result<Bytes, CodecError> {
        JsonCodec.encode(self)
    }

    /// Decode an envelope, rejecting unknown format versions.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        let envelope: Envelope = JsonCodec.decode(bytes)?;
        if envelope.version != ENVELOPE_VERSION {
            return Err(CodecError::UnsupportedVersion {
                expected: ENVELOPE_VERSION,
                found: envelope.version,
            });
        }
        Ok(envelope)
    }
}
