//! Shared tier configuration.
//!
//! Every tier accepts a [`CacheConfig`] describing the common options
//! (capacity, default TTL, eviction policy, serialization, background
//! maintenance). Backend-specific options live next to the backend that
//! understands them ([`crate::backends::redis::RedisCacheConfig`],
//! [`crate::backends::disk::DiskCacheConfig`]) and embed this struct.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Routing level of a tier. Lower levels are expected to be faster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheLevel {
    Memory,
    Remote,
    Disk,
}

impl std::fmt::Display for CacheLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Memory => "memory",
            Self::Remote => "remote",
            Self::Disk => "disk",
        };
        f.write_str(label)
    }
}

/// Victim-selection policy consulted when a tier is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    Lru,
    Lfu,
    Ttl,
    Fifo,
    Random,
    Adaptive,
}

/// Wire encoding for values stored outside process memory.
///
/// Writers and readers of a shared store must agree on the format; the disk
/// tier additionally records it in each value file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerializationFormat {
    Json,
    #[serde(rename = "msgpack")]
    MessagePack,
    Bincode,
}

impl SerializationFormat {
    /// One-byte tag written into disk value file headers. Readers reject
    /// tags they do not recognize.
    #[must_use]
    pub fn tag(self) -> u8 {
        match self {
            Self::Json => 1,
            Self::MessagePack => 2,
            Self::Bincode => 3,
        }
    }

    /// Inverse of [`SerializationFormat::tag`].
    #[must_use]
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::Json),
            2 => Some(Self::MessagePack),
            3 => Some(Self::Bincode),
            _ => None,
        }
    }
}

/// Options common to every tier.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Tier name used in logs and health reports.
    pub name: String,
    pub level: CacheLevel,
    /// Maximum live entry count before the eviction strategy is consulted.
    pub max_size: usize,
    /// Applied when neither the `set` call nor the value carries an expiry.
    pub default_ttl: Option<Duration>,
    pub eviction_policy: EvictionPolicy,
    pub serialization_format: SerializationFormat,
    pub compression_enabled: bool,
    pub compression_level: u32,
    /// Byte ceiling for the memory tier; exceeding it triggers eviction.
    pub max_memory_mb: Option<u64>,
    pub sync_interval: Duration,
    pub background_cleanup: bool,
    /// Accepted for configuration parity; tiers are always internally
    /// synchronized (see DESIGN.md).
    pub thread_safe: bool,
    pub enable_metrics: bool,
    pub sample_rate: f64,
    /// Opaque backend extension bag.
    pub implementation_config: HashMap<String, serde_json::Value>,
}

impl CacheConfig {
    /// Config for an in-process memory tier with the given name.
    #[must_use]
    pub fn memory(name: impl Into<String>) -> Self {
        Self::new(name, CacheLevel::Memory)
    }

    /// Config for a shared remote-store tier with the given name.
    #[must_use]
    pub fn remote(name: impl Into<String>) -> Self {
        Self::new(name, CacheLevel::Remote)
    }

    /// Config for an on-disk tier with the given name.
    #[must_use]
    pub fn disk(name: impl Into<String>) -> Self {
        Self::new(name, CacheLevel::Disk)
    }

    fn new(name: impl Into<String>, level: CacheLevel) -> Self {
        Self {
            name: name.into(),
            level,
            max_size: 1000,
            default_ttl: None,
            eviction_policy: EvictionPolicy::Lru,
            serialization_format: SerializationFormat::Json,
            compression_enabled: false,
            compression_level: 6,
            max_memory_mb: None,
            sync_interval: Duration::from_secs(60),
            background_cleanup: true,
            thread_safe: true,
            enable_metrics: true,
            sample_rate: 0.1,
            implementation_config: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    #[must_use]
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    #[must_use]
    pub fn with_eviction_policy(mut self, policy: EvictionPolicy) -> Self {
        self.eviction_policy = policy;
        self
    }

    #[must_use]
    pub fn with_serialization(mut self, format: SerializationFormat) -> Self {
        self.serialization_format = format;
        self
    }

    #[must_use]
    pub fn with_background_cleanup(mut self, enabled: bool) -> Self {
        self.background_cleanup = enabled;
        self
    }

    #[must_use]
    pub fn with_max_memory_mb(mut self, mb: u64) -> Self {
        self.max_memory_mb = Some(mb);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_surface() {
        let config = CacheConfig::memory("test");
        assert_eq!(config.level, CacheLevel::Memory);
        assert_eq!(config.max_size, 1000);
        assert!(config.default_ttl.is_none());
        assert_eq!(config.eviction_policy, EvictionPolicy::Lru);
        assert!(config.background_cleanup);
        assert!(config.thread_safe);
    }

    #[test]
    fn format_tags_round_trip_and_reject_unknown() {
        for format in [
            SerializationFormat::Json,
            SerializationFormat::MessagePack,
            SerializationFormat::Bincode,
        ] {
            assert_eq!(SerializationFormat::from_tag(format.tag()), Some(format));
        }
        assert_eq!(SerializationFormat::from_tag(0), None);
        assert_eq!(SerializationFormat::from_tag(99), None);
    }
}
