//! Value codecs for tiers that store outside process memory.
//!
//! The remote and disk tiers persist whole [`CacheValue`] records; the
//! encoding is chosen per tier via
//! [`SerializationFormat`](crate::config::SerializationFormat) and must be
//! symmetrical between writers and readers of a shared store.

mod bincode;
mod json;
mod msgpack;

pub use bincode::BincodeCodec;
pub use json::JsonCodec;
pub use msgpack::MsgpackCodec;

use std::fmt::Debug;
use std::sync::Arc;

use crate::config::SerializationFormat;
use crate::error::CacheError;
use crate::key::CacheValue;

/// Encoder/decoder for stored cache values.
///
/// Implementations must be `Send + Sync + Debug` so tiers can share them
/// across async tasks.
pub trait ValueCodec: Send + Sync + Debug {
    /// Encode a value for storage.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Serialization`] when the value cannot be
    /// encoded; the caller treats this as a hard write failure.
    fn encode(&self, value: &CacheValue) -> Result<Vec<u8>, CacheError>;

    /// Decode a stored value.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Serialization`] when the bytes do not parse;
    /// readers treat this as a tier-local miss and evict the entry.
    fn decode(&self, bytes: &[u8]) -> Result<CacheValue, CacheError>;

    /// The format this codec implements (also the disk header tag source).
    fn format(&self) -> SerializationFormat;

    /// Codec name for logs.
    fn name(&self) -> &'static str;
}

/// Build the codec for a configured format.
#[must_use]
pub fn codec_for(format: SerializationFormat) -> Arc<dyn ValueCodec> {
    match format {
        SerializationFormat::Json => Arc::new(JsonCodec),
        SerializationFormat::MessagePack => Arc::new(MsgpackCodec),
        SerializationFormat::Bincode => Arc::new(BincodeCodec),
    }
}
