//! On-disk tier.
//!
//! Values live in sharded files under `cache_dir`; an in-memory index maps
//! hash-keys to file locations and is flushed to `cache_index.json` by a
//! background task. Writes go to a temp sibling and are atomically renamed,
//! so a crash never leaves a half-written value file in place.
//!
//! Value file layout: 1 format-tag byte, 1 compression-flag byte, payload.
//! Readers reject unknown tags.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::codecs::{codec_for, ValueCodec};
use crate::config::{CacheConfig, CacheLevel, SerializationFormat};
use crate::error::CacheError;
use crate::key::{CacheKey, CacheValue};
use crate::stats::CacheStatistics;
use crate::strategies::{create_strategy, EvictionStrategy};
use crate::traits::Cache;

const HEADER_LEN: usize = 2;
const COMPRESSED: u8 = 1;
const UNCOMPRESSED: u8 = 0;

/// Disk tier options on top of the shared [`CacheConfig`].
#[derive(Debug, Clone)]
pub struct DiskCacheConfig {
    pub base: CacheConfig,
    pub cache_dir: PathBuf,
    pub create_subdirs: bool,
    /// Levels of 2-hex-char shard subdirectories.
    pub dir_levels: usize,
    pub files_per_dir: usize,
    pub file_extension: String,
    pub temp_extension: String,
    /// Payloads above this size are compressed before write.
    pub compression_threshold: usize,
    pub enable_index: bool,
    pub index_file: String,
    pub index_sync_interval: Duration,
    pub auto_cleanup_interval: Duration,
    pub max_disk_usage_mb: Option<u64>,
    /// When off, file I/O runs synchronously on the calling task.
    pub async_io: bool,
    pub io_chunk_size: usize,
}

impl DiskCacheConfig {
    #[must_use]
    pub fn new(name: impl Into<String>, cache_dir: impl Into<PathBuf>) -> Self {
        let mut base = CacheConfig::disk(name);
        base.compression_enabled = true;
        Self {
            base,
            cache_dir: cache_dir.into(),
            create_subdirs: true,
            dir_levels: 2,
            files_per_dir: 1000,
            file_extension: ".cache".to_string(),
            temp_extension: ".tmp".to_string(),
            compression_threshold: 1024,
            enable_index: true,
            index_file: "cache_index.json".to_string(),
            index_sync_interval: Duration::from_secs(300),
            auto_cleanup_interval: Duration::from_secs(3600),
            max_disk_usage_mb: None,
            async_io: true,
            io_chunk_size: 8192,
        }
    }
}

/// One index record: where a value lives and when it dies.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    key: CacheKey,
    value_file: String,
    created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_at: Option<DateTime<Utc>>,
    size: u64,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

impl IndexEntry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Utc::now() >= at)
    }
}

struct DiskInner {
    config: DiskCacheConfig,
    codec: Arc<dyn ValueCodec>,
    index: DashMap<String, IndexEntry>,
    dirty: AtomicBool,
    strategy: Mutex<Box<dyn EvictionStrategy>>,
    disk_usage: AtomicU64,
    stats: CacheStatistics,
}

impl DiskInner {
    fn index_path(&self) -> PathBuf {
        self.config.cache_dir.join(&self.config.index_file)
    }

    /// Shard-relative file path for a hash-key, e.g. `ab/cd/<md5>.cache`.
    fn value_file(&self, hash_key: &str) -> String {
        let digest = format!("{:x}", md5::compute(hash_key.as_bytes()));
        let mut parts = Vec::with_capacity(self.config.dir_levels + 1);
        for level in 0..self.config.dir_levels {
            let start = level * 2;
            parts.push(digest.get(start..start + 2).unwrap_or("00").to_string());
        }
        parts.push(format!("{digest}{}", self.config.file_extension));
        parts.join("/")
    }

    async fn read_file(&self, path: &Path) -> std::io::Result<Vec<u8>> {
        if self.config.async_io {
            tokio::fs::read(path).await
        } else {
            std::fs::read(path)
        }
    }

    async fn write_file_atomic(&self, relative: &str, bytes: &[u8]) -> std::io::Result<()> {
        let target = self.config.cache_dir.join(relative);
        if self.config.create_subdirs {
            if let Some(parent) = target.parent() {
                if self.config.async_io {
                    tokio::fs::create_dir_all(parent).await?;
                } else {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }
        let mut temp = target.clone();
        temp.as_mut_os_string().push(&self.config.temp_extension);
        if self.config.async_io {
            tokio::fs::write(&temp, bytes).await?;
            tokio::fs::rename(&temp, &target).await
        } else {
            std::fs::write(&temp, bytes)?;
            std::fs::rename(&temp, &target)
        }
    }

    async fn remove_file(&self, relative: &str) {
        let path = self.config.cache_dir.join(relative);
        let result = if self.config.async_io {
            tokio::fs::remove_file(&path).await
        } else {
            std::fs::remove_file(&path)
        };
        if let Err(err) = result {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %err, "[disk] failed to remove value file");
            }
        }
    }

    /// Encode a value into the on-disk frame.
    fn encode_frame(&self, value: &CacheValue) -> Result<Vec<u8>, CacheError> {
        let payload = self.codec.encode(value)?;
        let compress = self.config.base.compression_enabled
            && payload.len() > self.config.compression_threshold;
        let (flag, body) = if compress {
            let mut encoder = DeflateEncoder::new(
                Vec::with_capacity(payload.len() / 2),
                Compression::new(self.config.base.compression_level),
            );
            encoder
                .write_all(&payload)
                .and_then(|()| encoder.finish())
                .map(|compressed| (COMPRESSED, compressed))
                .map_err(|e| CacheError::Io(e.to_string()))?
        } else {
            (UNCOMPRESSED, payload)
        };
        let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
        frame.push(self.codec.format().tag());
        frame.push(flag);
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Decode an on-disk frame, honoring whatever known format wrote it.
    fn decode_frame(&self, frame: &[u8]) -> Result<CacheValue, CacheError> {
        let (header, body) = frame
            .split_at_checked(HEADER_LEN)
            .ok_or_else(|| CacheError::Serialization("value file shorter than header".into()))?;
        let tag = header[0];
        let format = SerializationFormat::from_tag(tag)
            .ok_or_else(|| CacheError::Serialization(format!("unknown format tag {tag}")))?;
        let payload = match header[1] {
            UNCOMPRESSED => body.to_vec(),
            COMPRESSED => {
                let mut decoder = DeflateDecoder::new(body);
                let mut payload = Vec::with_capacity(self.config.io_chunk_size);
                decoder
                    .read_to_end(&mut payload)
                    .map_err(|e| CacheError::Serialization(e.to_string()))?;
                payload
            }
            other => {
                return Err(CacheError::Serialization(format!(
                    "unknown compression flag {other}"
                )));
            }
        };
        codec_for(format).decode(&payload)
    }

    async fn drop_entry(&self, hash_key: &str) -> Option<IndexEntry> {
        self.strategy.lock().on_remove(hash_key);
        let removed = self.index.remove(hash_key).map(|(_, entry)| entry);
        if let Some(entry) = &removed {
            self.disk_usage.fetch_sub(entry.size, Ordering::Relaxed);
            self.remove_file(&entry.value_file).await;
            self.dirty.store(true, Ordering::Relaxed);
        }
        self.refresh_gauges();
        removed
    }

    fn refresh_gauges(&self) {
        self.stats.set_current_size(self.index.len() as u64);
        self.stats
            .set_current_memory_bytes(self.disk_usage.load(Ordering::Relaxed));
    }

    /// Write the index to disk through a temp file when it has changed.
    async fn flush_index(&self, force: bool) -> Result<(), CacheError> {
        if !self.config.enable_index {
            return Ok(());
        }
        if !force && !self.dirty.swap(false, Ordering::Relaxed) {
            return Ok(());
        }
        let snapshot: HashMap<String, IndexEntry> = self
            .index
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        let target = self.index_path();
        let mut temp = target.clone();
        temp.as_mut_os_string().push(&self.config.temp_extension);
        tokio::fs::write(&temp, bytes).await?;
        tokio::fs::rename(&temp, &target).await?;
        self.dirty.store(false, Ordering::Relaxed);
        debug!(path = %target.display(), entries = snapshot.len(), "[disk] index flushed");
        Ok(())
    }

    /// Load the index; malformed files fall back to an empty index and the
    /// orphan scan reconciles whatever data files are on disk.
    async fn load_index(&self) {
        if !self.config.enable_index {
            return;
        }
        let path = self.index_path();
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "[disk] failed to read index, starting empty");
                return;
            }
        };
        let loaded: HashMap<String, IndexEntry> = match serde_json::from_slice(&bytes) {
            Ok(loaded) => loaded,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "[disk] malformed index, starting empty");
                return;
            }
        };

        let mut usage = 0u64;
        let mut strategy = self.strategy.lock();
        for (hash_key, entry) in loaded {
            usage += entry.size;
            let mut skeleton = CacheValue::new(Vec::new());
            skeleton.created_at = entry.created_at;
            skeleton.expires_at = entry.expires_at;
            strategy.on_insert(&hash_key, &skeleton);
            self.index.insert(hash_key, entry);
        }
        drop(strategy);
        self.disk_usage.store(usage, Ordering::Relaxed);
        self.refresh_gauges();
        info!(entries = self.index.len(), "[disk] index loaded");
    }

    /// Remove expired entries and value files the index does not know.
    async fn cleanup(&self) {
        let expired: Vec<String> = self
            .index
            .iter()
            .filter(|entry| entry.value().is_expired())
            .map(|entry| entry.key().clone())
            .collect();
        for hash_key in &expired {
            self.drop_entry(hash_key).await;
        }
        if !expired.is_empty() {
            debug!(removed = expired.len(), "[disk] cleanup removed expired entries");
        }
        self.reconcile_orphans().await;
    }

    /// Walk the shard tree and delete data files with no index entry.
    async fn reconcile_orphans(&self) {
        let known: std::collections::HashSet<PathBuf> = self
            .index
            .iter()
            .map(|entry| self.config.cache_dir.join(&entry.value().value_file))
            .collect();

        let mut pending = vec![self.config.cache_dir.clone()];
        let mut orphans = 0usize;
        while let Some(dir) = pending.pop() {
            let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
                continue;
            };
            while let Ok(Some(item)) = entries.next_entry().await {
                let path = item.path();
                let Ok(file_type) = item.file_type().await else {
                    continue;
                };
                if file_type.is_dir() {
                    pending.push(path);
                } else if path
                    .to_string_lossy()
                    .ends_with(&self.config.file_extension)
                    && !known.contains(&path)
                {
                    if tokio::fs::remove_file(&path).await.is_ok() {
                        orphans += 1;
                    }
                }
            }
        }
        if orphans > 0 {
            debug!(orphans, "[disk] removed orphan value files");
        }
    }

    /// Evict one strategy-chosen victim; used when the disk cap is hit.
    async fn evict_one(&self) -> bool {
        let candidate = self.strategy.lock().evict_candidate();
        let Some(hash_key) = candidate else {
            return false;
        };
        if self.drop_entry(&hash_key).await.is_some() {
            self.stats.record_eviction();
            debug!(key = %hash_key, "[disk] evicted entry");
        }
        true
    }
}

/// Durable cache tier over sharded files with an on-disk index.
pub struct DiskCache {
    inner: Arc<DiskInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

impl DiskCache {
    #[must_use]
    pub fn new(config: DiskCacheConfig) -> Self {
        info!(
            name = %config.base.name,
            dir = %config.cache_dir.display(),
            levels = config.dir_levels,
            "Initializing disk cache tier"
        );
        let codec = codec_for(config.base.serialization_format);
        let strategy = create_strategy(config.base.eviction_policy);
        Self {
            inner: Arc::new(DiskInner {
                codec,
                index: DashMap::new(),
                dirty: AtomicBool::new(false),
                strategy: Mutex::new(strategy),
                disk_usage: AtomicU64::new(0),
                stats: CacheStatistics::default(),
                config,
            }),
            tasks: Mutex::new(Vec::new()),
            shutdown: Mutex::new(None),
        }
    }

    fn disk_cap_bytes(&self) -> Option<u64> {
        self.inner
            .config
            .max_disk_usage_mb
            .map(|mb| mb.saturating_mul(1024 * 1024))
    }
}

#[async_trait]
impl Cache for DiskCache {
    fn name(&self) -> &str {
        &self.inner.config.base.name
    }

    fn level(&self) -> CacheLevel {
        CacheLevel::Disk
    }

    fn statistics(&self) -> &CacheStatistics {
        &self.inner.stats
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<CacheValue>, CacheError> {
        let started = Instant::now();
        let hash_key = key.hash_key();

        let entry = match self.inner.index.get(&hash_key) {
            Some(entry) => entry.value().clone(),
            None => {
                self.inner.stats.record_miss(started.elapsed());
                return Ok(None);
            }
        };
        if entry.is_expired() {
            self.inner.drop_entry(&hash_key).await;
            self.inner.stats.record_miss(started.elapsed());
            return Ok(None);
        }

        let path = self.inner.config.cache_dir.join(&entry.value_file);
        let frame = match self.inner.read_file(&path).await {
            Ok(frame) => frame,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                // index pointed at a file that is gone; heal the index
                self.inner.drop_entry(&hash_key).await;
                self.inner.stats.record_miss(started.elapsed());
                return Ok(None);
            }
            Err(err) => {
                self.inner.stats.record_error();
                return Err(err.into());
            }
        };

        let mut value = match self.inner.decode_frame(&frame) {
            Ok(value) => value,
            Err(err) => {
                warn!(key = %hash_key, error = %err, "[disk] evicting undecodable entry");
                self.inner.drop_entry(&hash_key).await;
                self.inner.stats.record_miss(started.elapsed());
                return Ok(None);
            }
        };

        if value.is_expired() {
            self.inner.drop_entry(&hash_key).await;
            self.inner.stats.record_miss(started.elapsed());
            return Ok(None);
        }

        value.touch();
        self.inner.strategy.lock().on_access(&hash_key, &value);
        self.inner.stats.record_hit(started.elapsed());
        Ok(Some(value))
    }

    async fn set(
        &self,
        key: &CacheKey,
        mut value: CacheValue,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let started = Instant::now();
        let hash_key = key.hash_key();

        if let Some(ttl) = ttl {
            value.expires_at = Some(Utc::now() + ttl);
        } else if value.expires_at.is_none() {
            if let Some(default_ttl) = self.inner.config.base.default_ttl {
                value.expires_at = Some(Utc::now() + default_ttl);
            }
        }
        value.size_bytes = value.data.len();

        let frame = self.inner.encode_frame(&value)?;
        let relative = self.inner.value_file(&hash_key);
        match self.inner.write_file_atomic(&relative, &frame).await {
            Ok(()) => {}
            Err(err) => {
                self.inner.stats.record_error();
                return Err(err.into());
            }
        }

        let entry = IndexEntry {
            key: key.clone(),
            value_file: relative,
            created_at: value.created_at,
            expires_at: value.expires_at,
            size: frame.len() as u64,
            metadata: value.metadata.clone(),
        };
        self.inner.strategy.lock().on_insert(&hash_key, &value);
        if let Some(old) = self.inner.index.insert(hash_key, entry) {
            self.inner.disk_usage.fetch_sub(old.size, Ordering::Relaxed);
        }
        self.inner
            .disk_usage
            .fetch_add(frame.len() as u64, Ordering::Relaxed);
        self.inner.dirty.store(true, Ordering::Relaxed);

        if let Some(cap) = self.disk_cap_bytes() {
            let mut attempts = self.inner.config.base.max_size + 1;
            while self.inner.disk_usage.load(Ordering::Relaxed) > cap && attempts > 0 {
                if !self.inner.evict_one().await {
                    break;
                }
                attempts -= 1;
            }
        }

        self.inner.refresh_gauges();
        self.inner.stats.record_set(started.elapsed());
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<bool, CacheError> {
        let hash_key = key.hash_key();
        let removed = self.inner.drop_entry(&hash_key).await;
        let was_live = removed.is_some_and(|entry| !entry.is_expired());
        if was_live {
            self.inner.stats.record_delete();
        }
        Ok(was_live)
    }

    async fn exists(&self, key: &CacheKey) -> Result<bool, CacheError> {
        let hash_key = key.hash_key();
        Ok(self
            .inner
            .index
            .get(&hash_key)
            .is_some_and(|entry| !entry.value().is_expired()))
    }

    async fn clear(&self) -> Result<(), CacheError> {
        let files: Vec<String> = self
            .inner
            .index
            .iter()
            .map(|entry| entry.value().value_file.clone())
            .collect();
        self.inner.index.clear();
        *self.inner.strategy.lock() =
            create_strategy(self.inner.config.base.eviction_policy);
        for relative in files {
            self.inner.remove_file(&relative).await;
        }
        self.inner.disk_usage.store(0, Ordering::Relaxed);
        self.inner.dirty.store(true, Ordering::Relaxed);
        self.inner.refresh_gauges();
        Ok(())
    }

    async fn size(&self) -> Result<usize, CacheError> {
        Ok(self
            .inner
            .index
            .iter()
            .filter(|entry| !entry.value().is_expired())
            .count())
    }

    async fn keys(&self, pattern: Option<&str>) -> Result<Vec<CacheKey>, CacheError> {
        Ok(self
            .inner
            .index
            .iter()
            .filter(|entry| !entry.value().is_expired())
            .filter(|entry| pattern.is_none_or(|p| entry.value().key.matches_pattern(p)))
            .map(|entry| entry.value().key.clone())
            .collect())
    }

    async fn start(&self) -> Result<(), CacheError> {
        tokio::fs::create_dir_all(&self.inner.config.cache_dir).await?;
        self.inner.load_index().await;

        let (tx, rx) = watch::channel(false);
        *self.shutdown.lock() = Some(tx);
        let mut handles = Vec::new();

        if self.inner.config.enable_index {
            let inner = Arc::clone(&self.inner);
            let mut rx_flush = rx.clone();
            let interval = self.inner.config.index_sync_interval;
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if let Err(err) = inner.flush_index(false).await {
                                warn!(error = %err, "[disk] index flush failed");
                            }
                        }
                        _ = rx_flush.changed() => break,
                    }
                }
            }));
        }

        if self.inner.config.base.background_cleanup {
            let inner = Arc::clone(&self.inner);
            let mut rx_cleanup = rx;
            let interval = self.inner.config.auto_cleanup_interval;
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => inner.cleanup().await,
                        _ = rx_cleanup.changed() => break,
                    }
                }
            }));
        }

        self.tasks.lock().extend(handles);
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
                warn!(name = %self.inner.config.base.name, "[disk] background task did not stop in time");
            }
        }
        self.inner.flush_index(true).await
    }
}
