//! The cache contract every tier satisfies.
//!
//! The coordinator routes against `Arc<dyn Cache>`, so the trait is object
//! safe: batch helpers and the stampede-protected fill take boxed closures
//! instead of generics. Single-key semantics are authoritative; batch
//! operations are equivalent to the loop but tiers with a wire protocol
//! override them to pipeline.
//!
//! # Example: registering a custom tier
//!
//! ```rust,ignore
//! use cache_fabric::{Cache, async_trait};
//!
//! struct MyTier { /* ... */ }
//!
//! #[async_trait]
//! impl Cache for MyTier {
//!     // get/set/delete/... against your store
//! }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde::Serialize;
use tokio::time::Instant;

use crate::config::CacheLevel;
use crate::error::CacheError;
use crate::key::{CacheKey, CacheValue};
use crate::stats::CacheStatistics;

/// Deferred value producer for [`Cache::get_or_set`].
pub type FillFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<Vec<u8>, CacheError>> + Send>;

/// Result of a tier health probe.
#[derive(Debug, Clone, Serialize)]
pub struct CacheHealthReport {
    pub healthy: bool,
    #[serde(skip)]
    pub latency: Duration,
    pub size: usize,
    pub level: CacheLevel,
    pub error: Option<String>,
}

/// Uniform cache operations over a single tier.
///
/// Failure semantics: transport and disk errors surface as
/// [`CacheError::Io`]/[`CacheError::Timeout`] and feed the coordinator's
/// failover accounting; statistics are never corrupted on failure paths.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Tier name for logs and health reports.
    fn name(&self) -> &str;

    /// Routing level of this tier.
    fn level(&self) -> CacheLevel;

    /// Live operation counters.
    fn statistics(&self) -> &CacheStatistics;

    /// Current non-expired value, recording a hit; absent or expired keys
    /// record a miss (expired entries may be dropped on sight). Access
    /// count and last-access stamp of returned values are updated.
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheValue>, CacheError>;

    /// Install or replace an entry. An explicit `ttl` overrides any
    /// value-embedded expiry; otherwise the value's `expires_at` is
    /// honored; otherwise the tier default applies; otherwise the entry
    /// never expires.
    async fn set(
        &self,
        key: &CacheKey,
        value: CacheValue,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError>;

    /// Remove an entry, reporting whether a live entry existed.
    async fn delete(&self, key: &CacheKey) -> Result<bool, CacheError>;

    /// Whether a live (non-expired) entry exists.
    async fn exists(&self, key: &CacheKey) -> Result<bool, CacheError>;

    /// Remove all entries and reset size accounting.
    async fn clear(&self) -> Result<(), CacheError>;

    /// Live entry count.
    async fn size(&self) -> Result<usize, CacheError>;

    /// All live keys; with a pattern, a glob match over the full key.
    async fn keys(&self, pattern: Option<&str>) -> Result<Vec<CacheKey>, CacheError>;

    /// Begin background maintenance (cleanup, compaction, index sync).
    async fn start(&self) -> Result<(), CacheError>;

    /// Stop background maintenance and release external resources.
    async fn stop(&self) -> Result<(), CacheError>;

    /// Batch get; equivalent to the loop over [`Cache::get`].
    async fn get_many(
        &self,
        keys: &[CacheKey],
    ) -> Result<Vec<(CacheKey, Option<CacheValue>)>, CacheError> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push((key.clone(), self.get(key).await?));
        }
        Ok(out)
    }

    /// Batch set; equivalent to the loop over [`Cache::set`].
    async fn set_many(
        &self,
        items: Vec<(CacheKey, CacheValue)>,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        for (key, value) in items {
            self.set(&key, value, ttl).await?;
        }
        Ok(())
    }

    /// Batch delete; returns how many live entries were removed.
    async fn delete_many(&self, keys: &[CacheKey]) -> Result<usize, CacheError> {
        let mut removed = 0;
        for key in keys {
            if self.delete(key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Add `delta` to a numeric value, initializing to `delta` when absent.
    ///
    /// # Errors
    ///
    /// [`CacheError::TypeMismatch`] when the stored payload is not a
    /// decimal integer.
    async fn increment(&self, key: &CacheKey, delta: i64) -> Result<i64, CacheError> {
        match self.get(key).await? {
            None => {
                let value = CacheValue::new(delta.to_string().into_bytes());
                self.set(key, value, None).await?;
                Ok(delta)
            }
            Some(mut value) => {
                let text = std::str::from_utf8(&value.data).map_err(|_| {
                    CacheError::TypeMismatch(format!("value at '{key}' is not numeric"))
                })?;
                let current: i64 = text.trim().parse().map_err(|_| {
                    CacheError::TypeMismatch(format!("value at '{key}' is not numeric"))
                })?;
                let next = current + delta;
                value.data = next.to_string().into_bytes();
                value.size_bytes = value.data.len();
                let ttl = value.remaining_ttl();
                self.set(key, value, ttl).await?;
                Ok(next)
            }
        }
    }

    /// Subtract `delta` from a numeric value.
    async fn decrement(&self, key: &CacheKey, delta: i64) -> Result<i64, CacheError> {
        self.increment(key, -delta).await
    }

    /// Move the expiry of an existing entry `ttl` from now. Returns `false`
    /// when no live entry exists.
    async fn expire(&self, key: &CacheKey, ttl: Duration) -> Result<bool, CacheError> {
        match self.get(key).await? {
            None => Ok(false),
            Some(mut value) => {
                value.extend_ttl(ttl);
                self.set(key, value, Some(ttl)).await?;
                Ok(true)
            }
        }
    }

    /// Drop the expiry of an existing entry. Returns `false` when no live
    /// entry exists. A tier default TTL still applies on the rewrite.
    async fn persist(&self, key: &CacheKey) -> Result<bool, CacheError> {
        match self.get(key).await? {
            None => Ok(false),
            Some(mut value) => {
                value.expires_at = None;
                self.set(key, value, None).await?;
                Ok(true)
            }
        }
    }

    /// Delete every key matching the glob pattern; returns the count.
    async fn delete_pattern(&self, pattern: &str) -> Result<usize, CacheError> {
        let keys = self.keys(Some(pattern)).await?;
        self.delete_many(&keys).await
    }

    /// Return the live value or run `fill` once and install its payload.
    ///
    /// This tier-level variant does not coalesce concurrent fills; the
    /// coordinator's `get_or_set` adds per-key stampede protection.
    async fn get_or_set(
        &self,
        key: &CacheKey,
        ttl: Option<Duration>,
        fill: FillFn,
    ) -> Result<CacheValue, CacheError> {
        if let Some(value) = self.get(key).await? {
            return Ok(value);
        }
        let data = fill().await?;
        let value = match ttl {
            Some(ttl) => CacheValue::with_ttl(data, ttl),
            None => CacheValue::new(data),
        };
        self.set(key, value.clone(), ttl).await?;
        Ok(value)
    }

    /// Round-trip probe: set, get and delete a reserved-namespace key and
    /// report the observed latency and tier size.
    async fn health_check(&self) -> CacheHealthReport {
        let level = self.level();
        let key = match CacheKey::new("health", format!("check:{}", self.name())) {
            Ok(key) => key,
            Err(err) => {
                return CacheHealthReport {
                    healthy: false,
                    latency: Duration::ZERO,
                    size: 0,
                    level,
                    error: Some(err.to_string()),
                };
            }
        };

        let probe = CacheValue::with_ttl(b"ok".to_vec(), Duration::from_secs(10));
        let started = Instant::now();
        let outcome = async {
            self.set(&key, probe, Some(Duration::from_secs(10))).await?;
            let read = self.get(&key).await?;
            self.delete(&key).await?;
            if read.is_some_and(|v| v.data == b"ok") {
                Ok(())
            } else {
                Err(CacheError::Io("health probe read back a different value".into()))
            }
        }
        .await;
        let latency = started.elapsed();
        let size = self.size().await.unwrap_or(0);

        match outcome {
            Ok(()) => CacheHealthReport {
                healthy: true,
                latency,
                size,
                level,
                error: None,
            },
            Err(err) => CacheHealthReport {
                healthy: false,
                latency,
                size,
                level,
                error: Some(err.to_string()),
            },
        }
    }
}
