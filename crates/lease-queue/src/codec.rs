//! Payload encoding between application values and envelope bytes.

use crate::error::SerializationError;
use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};

/// Encoder used by the front door for application payloads
///
/// Works on `serde_json::Value` so the trait stays object safe; the typed
/// helpers below go through it.
pub trait PayloadCodec: Send + Sync + std::fmt::Debug {
    /// Short codec name for logs
    fn name(&self) -> &'static str;

    fn encode_value(&self, value: &serde_json::Value) -> Result<Bytes, SerializationError>;

    fn decode_value(&self, data: &[u8]) -> Result<serde_json::Value, SerializationError>;
}

/// Default codec: compact JSON
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl PayloadCodec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode_value(&self, value: &serde_json::Value) -> Result<Bytes, SerializationError> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }

    fn decode_value(&self, data: &[u8]) -> Result<serde_json::Value, SerializationError> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Encode any serializable value with a codec
pub fn encode<T: Serialize + ?Sized>(
    codec: &dyn PayloadCodec,
    value: &T,
) -> Result<Bytes, SerializationError> {
    let value = serde_json::to_value(value)?;
    codec.encode_value(&value)
}

/// Decode payload bytes into a typed value with a codec
pub fn decode<T: DeserializeOwned>(
    codec: &dyn PayloadCodec,
    data: &[u8],
) -> Result<T, SerializationError> {
    let value = codec.decode_value(data)?;
    Ok(serde_json::from_value(value)?)
}

#[cfg(test)]
#[path = "codec_tests.rs"]
mod tests;
