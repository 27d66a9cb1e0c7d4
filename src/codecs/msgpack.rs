//! MessagePack codec using `rmp-serde`.

use crate::codecs::ValueCodec;
use crate::config::SerializationFormat;
use crate::error::CacheError;
use crate::key::CacheValue;

/// Compact binary codec; the payload field is written as a raw byte string
/// instead of a JSON array, which matters for large market-data blobs.
#[derive(Debug, Default, Clone)]
pub struct MsgpackCodec;

impl ValueCodec for MsgpackCodec {
    fn encode(&self, value: &CacheValue) -> Result<Vec<u8>, CacheError> {
        rmp_serde::to_vec(value).map_err(|e| CacheError::Serialization(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<CacheValue, CacheError> {
        rmp_serde::from_slice(bytes).map_err(|e| CacheError::Serialization(e.to_string()))
    }

    fn format(&self) -> SerializationFormat {
        SerializationFormat::MessagePack
    }

    fn name(&self) -> &'static str {
        "rmp-serde"
    }
}
