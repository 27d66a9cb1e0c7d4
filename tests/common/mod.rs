//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Once;
use std::time::Duration;

use async_trait::async_trait;
use cache_fabric::backends::{MemoryCache, MemoryCacheConfig};
use cache_fabric::config::CacheLevel;
use cache_fabric::error::CacheError;
use cache_fabric::key::{CacheKey, CacheValue};
use cache_fabric::stats::CacheStatistics;
use cache_fabric::traits::Cache;

static TRACING: Once = Once::new();

/// Install a test subscriber honoring `RUST_LOG`; safe to call repeatedly.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Memory tier with background maintenance off, for deterministic tests.
pub fn memory_tier(name: &str) -> Arc<MemoryCache> {
    let mut config = MemoryCacheConfig::new(name);
    config.base.background_cleanup = false;
    config.base.max_size = 10_000;
    Arc::new(MemoryCache::new(config))
}

pub fn key(namespace: &str, k: &str) -> CacheKey {
    CacheKey::new(namespace, k).unwrap()
}

pub fn value(data: &[u8]) -> CacheValue {
    CacheValue::new(data.to_vec())
}

/// Tier double that fails every operation while the switch is on,
/// standing in for a shared store with a severed link.
pub struct FlakyCache {
    inner: MemoryCache,
    name: String,
    failing: AtomicBool,
}

impl FlakyCache {
    pub fn new(name: &str) -> Self {
        let mut config = MemoryCacheConfig::new(name);
        config.base.background_cleanup = false;
        Self {
            inner: MemoryCache::new(config),
            name: name.to_string(),
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn gate(&self) -> Result<(), CacheError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(CacheError::Io("connection reset by peer".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Cache for FlakyCache {
    fn name(&self) -> &str {
        &self.name
    }

    fn level(&self) -> CacheLevel {
        CacheLevel::Remote
    }

    fn statistics(&self) -> &CacheStatistics {
        self.inner.statistics()
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<CacheValue>, CacheError> {
        self.gate()?;
        self.inner.get(key).await
    }

    async fn set(
        &self,
        key: &CacheKey,
        value: CacheValue,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        self.gate()?;
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &CacheKey) -> Result<bool, CacheError> {
        self.gate()?;
        self.inner.delete(key).await
    }

    async fn exists(&self, key: &CacheKey) -> Result<bool, CacheError> {
        self.gate()?;
        self.inner.exists(key).await
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.gate()?;
        self.inner.clear().await
    }

    async fn size(&self) -> Result<usize, CacheError> {
        self.gate()?;
        self.inner.size().await
    }

    async fn keys(&self, pattern: Option<&str>) -> Result<Vec<CacheKey>, CacheError> {
        self.gate()?;
        self.inner.keys(pattern).await
    }

    async fn start(&self) -> Result<(), CacheError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), CacheError> {
        Ok(())
    }
}
