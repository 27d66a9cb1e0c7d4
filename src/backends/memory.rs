//! In-process memory tier.
//!
//! A `DashMap` of hash-key to entry plus the configured eviction strategy
//! behind a short-held lock. Lock nesting is always map-shard then
//! strategy, never the reverse.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{CacheConfig, CacheLevel};
use crate::error::CacheError;
use crate::key::{CacheEntry, CacheKey, CacheValue};
use crate::stats::CacheStatistics;
use crate::strategies::{create_strategy, EvictionStrategy};
use crate::traits::Cache;

/// Memory tier options on top of the shared [`CacheConfig`].
#[derive(Debug, Clone)]
pub struct MemoryCacheConfig {
    pub base: CacheConfig,
    /// Cadence of the background expired-entry sweep.
    pub auto_cleanup_interval: Duration,
    pub enable_warmup: bool,
    /// Pre-population blobs keyed by `namespace:key`.
    pub warmup_data: Option<HashMap<String, Vec<u8>>>,
}

impl MemoryCacheConfig {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            base: CacheConfig::memory(name),
            auto_cleanup_interval: Duration::from_secs(60),
            enable_warmup: false,
            warmup_data: None,
        }
    }

    #[must_use]
    pub fn with_base(mut self, base: CacheConfig) -> Self {
        self.base = base;
        self
    }

    #[must_use]
    pub fn with_warmup(mut self, data: HashMap<String, Vec<u8>>) -> Self {
        self.enable_warmup = true;
        self.warmup_data = Some(data);
        self
    }
}

struct MemoryInner {
    config: MemoryCacheConfig,
    entries: DashMap<String, CacheEntry>,
    strategy: Mutex<Box<dyn EvictionStrategy>>,
    memory_bytes: AtomicU64,
    stats: CacheStatistics,
}

impl MemoryInner {
    /// Remove one victim chosen by the strategy. Returns `false` when the
    /// strategy has nothing left to offer.
    fn evict_one(&self) -> bool {
        let candidate = self.strategy.lock().evict_candidate();
        let Some(hash) = candidate else {
            return false;
        };
        self.strategy.lock().on_remove(&hash);
        if let Some((_, entry)) = self.entries.remove(&hash) {
            self.memory_bytes
                .fetch_sub(entry.value.size_bytes as u64, Ordering::Relaxed);
            self.stats.record_eviction();
            debug!(key = %hash, "[memory] evicted entry");
        }
        true
    }

    fn remove_entry(&self, hash: &str) -> Option<CacheEntry> {
        self.strategy.lock().on_remove(hash);
        let removed = self.entries.remove(hash).map(|(_, entry)| entry);
        if let Some(entry) = &removed {
            self.memory_bytes
                .fetch_sub(entry.value.size_bytes as u64, Ordering::Relaxed);
        }
        removed
    }

    fn refresh_gauges(&self) {
        self.stats.set_current_size(self.entries.len() as u64);
        self.stats
            .set_current_memory_bytes(self.memory_bytes.load(Ordering::Relaxed));
    }

    /// Drop every expired entry; returns the number removed.
    fn sweep_expired(&self) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.value().value.is_expired())
            .map(|entry| entry.key().clone())
            .collect();
        for hash in &expired {
            self.remove_entry(hash);
        }
        if !expired.is_empty() {
            self.refresh_gauges();
        }
        expired.len()
    }
}

/// In-process cache tier backed by a concurrent map.
pub struct MemoryCache {
    inner: Arc<MemoryInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

impl MemoryCache {
    #[must_use]
    pub fn new(config: MemoryCacheConfig) -> Self {
        info!(
            name = %config.base.name,
            max_size = config.base.max_size,
            policy = ?config.base.eviction_policy,
            "Initializing memory cache tier"
        );
        let strategy = create_strategy(config.base.eviction_policy);
        Self {
            inner: Arc::new(MemoryInner {
                entries: DashMap::new(),
                strategy: Mutex::new(strategy),
                memory_bytes: AtomicU64::new(0),
                stats: CacheStatistics::default(),
                config,
            }),
            tasks: Mutex::new(Vec::new()),
            shutdown: Mutex::new(None),
        }
    }

    fn apply_ttl(&self, value: &mut CacheValue, ttl: Option<Duration>) {
        if let Some(ttl) = ttl {
            value.expires_at = Some(Utc::now() + ttl);
        } else if value.expires_at.is_none() {
            if let Some(default_ttl) = self.inner.config.base.default_ttl {
                value.expires_at = Some(Utc::now() + default_ttl);
            }
        }
    }

    async fn warm_up(&self) -> Result<(), CacheError> {
        let Some(data) = self.inner.config.warmup_data.clone() else {
            return Ok(());
        };
        let count = data.len();
        for (raw, bytes) in data {
            let (namespace, key) = raw
                .split_once(':')
                .unwrap_or(("warmup", raw.as_str()));
            let key = CacheKey::new(namespace, key)?;
            self.set(&key, CacheValue::new(bytes), None).await?;
        }
        info!(name = %self.inner.config.base.name, count, "[memory] warm-up complete");
        Ok(())
    }
}

#[async_trait]
impl Cache for MemoryCache {
    fn name(&self) -> &str {
        &self.inner.config.base.name
    }

    fn level(&self) -> CacheLevel {
        CacheLevel::Memory
    }

    fn statistics(&self) -> &CacheStatistics {
        &self.inner.stats
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<CacheValue>, CacheError> {
        let started = Instant::now();
        let hash = key.hash_key();

        let hit = if let Some(mut entry) = self.inner.entries.get_mut(&hash) {
            if entry.value.is_expired() {
                None
            } else {
                entry.value.touch();
                self.inner.strategy.lock().on_access(&hash, &entry.value);
                Some(entry.value.clone())
            }
        } else {
            None
        };

        match hit {
            Some(value) => {
                self.inner.stats.record_hit(started.elapsed());
                Ok(Some(value))
            }
            None => {
                // drop an expired entry on sight
                if self
                    .inner
                    .entries
                    .get(&hash)
                    .is_some_and(|e| e.value().value.is_expired())
                {
                    self.inner.remove_entry(&hash);
                    self.inner.refresh_gauges();
                }
                self.inner.stats.record_miss(started.elapsed());
                Ok(None)
            }
        }
    }

    async fn set(
        &self,
        key: &CacheKey,
        mut value: CacheValue,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let started = Instant::now();
        let hash = key.hash_key();
        self.apply_ttl(&mut value, ttl);
        value.size_bytes = value.data.len();

        if !self.inner.entries.contains_key(&hash) {
            let mut attempts = self.inner.config.base.max_size + 1;
            while self.inner.entries.len() >= self.inner.config.base.max_size && attempts > 0 {
                if !self.inner.evict_one() {
                    break;
                }
                attempts -= 1;
            }
        }
        if let Some(cap_mb) = self.inner.config.base.max_memory_mb {
            let cap = cap_mb.saturating_mul(1024 * 1024);
            let incoming = value.size_bytes as u64;
            let mut attempts = self.inner.config.base.max_size + 1;
            while self.inner.memory_bytes.load(Ordering::Relaxed).saturating_add(incoming) > cap
                && attempts > 0
            {
                if !self.inner.evict_one() {
                    break;
                }
                attempts -= 1;
            }
        }

        self.inner.strategy.lock().on_insert(&hash, &value);
        let size = value.size_bytes as u64;
        if let Some(old) = self
            .inner
            .entries
            .insert(hash, CacheEntry::new(key.clone(), value))
        {
            self.inner
                .memory_bytes
                .fetch_sub(old.value.size_bytes as u64, Ordering::Relaxed);
        }
        self.inner.memory_bytes.fetch_add(size, Ordering::Relaxed);
        self.inner.refresh_gauges();
        self.inner.stats.record_set(started.elapsed());
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<bool, CacheError> {
        let hash = key.hash_key();
        let removed = self.inner.remove_entry(&hash);
        self.inner.refresh_gauges();
        let was_live = removed.is_some_and(|entry| !entry.value.is_expired());
        if was_live {
            self.inner.stats.record_delete();
        }
        Ok(was_live)
    }

    async fn exists(&self, key: &CacheKey) -> Result<bool, CacheError> {
        let hash = key.hash_key();
        Ok(self
            .inner
            .entries
            .get(&hash)
            .is_some_and(|entry| !entry.value().value.is_expired()))
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.inner.entries.clear();
        *self.inner.strategy.lock() = create_strategy(self.inner.config.base.eviction_policy);
        self.inner.memory_bytes.store(0, Ordering::Relaxed);
        self.inner.refresh_gauges();
        Ok(())
    }

    async fn size(&self) -> Result<usize, CacheError> {
        Ok(self
            .inner
            .entries
            .iter()
            .filter(|entry| !entry.value().value.is_expired())
            .count())
    }

    async fn keys(&self, pattern: Option<&str>) -> Result<Vec<CacheKey>, CacheError> {
        Ok(self
            .inner
            .entries
            .iter()
            .filter(|entry| !entry.value().value.is_expired())
            .filter(|entry| pattern.is_none_or(|p| entry.value().key.matches_pattern(p)))
            .map(|entry| entry.value().key.clone())
            .collect())
    }

    async fn start(&self) -> Result<(), CacheError> {
        if self.inner.config.enable_warmup {
            self.warm_up().await?;
        }
        if !self.inner.config.base.background_cleanup {
            return Ok(());
        }

        let (tx, mut rx) = watch::channel(false);
        *self.shutdown.lock() = Some(tx);
        let inner = Arc::clone(&self.inner);
        let interval = self.inner.config.auto_cleanup_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = inner.sweep_expired();
                        if removed > 0 {
                            debug!(name = %inner.config.base.name, removed, "[memory] compaction removed expired entries");
                        }
                    }
                    _ = rx.changed() => break,
                }
            }
        });
        self.tasks.lock().push(handle);
        Ok(())
    }

    async fn stop(&self) -> Result<(), CacheError> {
        if let Some(tx) = self.shutdown.lock().take() {
            let _ = tx.send(true);
        }
        let handles: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            if tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .is_err()
            {
                warn!(name = %self.inner.config.base.name, "[memory] compaction task did not stop in time");
            }
        }
        Ok(())
    }
}
