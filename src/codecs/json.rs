//! JSON codec using `serde_json`.

use crate::codecs::ValueCodec;
use crate::config::SerializationFormat;
use crate::error::CacheError;
use crate::key::CacheValue;

/// Human-readable default codec. Interoperates with anything that can read
/// JSON off the shared store.
#[derive(Debug, Default, Clone)]
pub struct JsonCodec;

impl ValueCodec for JsonCodec {
    fn encode(&self, value: &CacheValue) -> Result<Vec<u8>, CacheError> {
        serde_json::to_vec(value).map_err(|e| CacheError::Serialization(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<CacheValue, CacheError> {
        serde_json::from_slice(bytes).map_err(|e| CacheError::Serialization(e.to_string()))
    }

    fn format(&self) -> SerializationFormat {
        SerializationFormat::Json
    }

    fn name(&self) -> &'static str {
        "serde_json"
    }
}
