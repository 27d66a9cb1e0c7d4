//! Bincode codec.

use crate::codecs::ValueCodec;
use crate::config::SerializationFormat;
use crate::error::CacheError;
use crate::key::CacheValue;

/// Fastest of the built-in codecs. Not self-describing, so both sides of a
/// shared store must be configured for it explicitly.
#[derive(Debug, Default, Clone)]
pub struct BincodeCodec;

impl ValueCodec for BincodeCodec {
    fn encode(&self, value: &CacheValue) -> Result<Vec<u8>, CacheError> {
        bincode::serialize(value).map_err(|e| CacheError::Serialization(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<CacheValue, CacheError> {
        bincode::deserialize(bytes).map_err(|e| CacheError::Serialization(e.to_string()))
    }

    fn format(&self) -> SerializationFormat {
        SerializationFormat::Bincode
    }

    fn name(&self) -> &'static str {
        "bincode"
    }
}
