//! Cache coordinator.
//!
//! Single entry point over an ordered set of tiers. Routes reads and writes
//! per policy, promotes hot data behind a counter gate, excludes failing
//! tiers until a health check readmits them, and reconciles tiers with a
//! periodic sync task.
//!
//! Tier state machine: HEALTHY → (failures exceed `max_failures`) →
//! UNHEALTHY → (health check succeeds) → HEALTHY. Routing reads a snapshot
//! of the sorted tier list; no registry lock is held across tier I/O.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::CacheLevel;
use crate::error::CacheError;
use crate::key::{CacheKey, CacheValue};
use crate::stats::CacheStatsSnapshot;
use crate::traits::{Cache, CacheHealthReport, FillFn};

/// Read routing policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPolicy {
    /// Iterate fastest to slowest, backfilling faster tiers behind the
    /// promotion gate.
    ReadThrough,
    /// Read only the fastest healthy tier; the caller owns fills.
    CacheAside,
}

/// Write routing policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePolicy {
    /// Write every healthy tier; success iff at least one accepted.
    WriteThrough,
    /// Write only the slowest healthy tier, relying on promotion.
    WriteAround,
    /// Write the fastest healthy tier synchronously and propagate to the
    /// rest from a bounded drop-oldest queue.
    WriteBack,
}

/// Cross-tier reconciliation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStrategy {
    None,
    /// Piggyback on writes: every write also lands on the other tiers.
    Immediate,
    /// Background task pushes authoritative entries to faster tiers.
    Periodic,
}

/// Coordinator tuning knobs.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub name: String,
    pub read_policy: ReadPolicy,
    pub write_policy: WritePolicy,
    pub sync_strategy: SyncStrategy,
    pub sync_interval: Duration,
    pub enable_failover: bool,
    pub health_check_interval: Duration,
    /// Consecutive failures beyond this mark a tier unhealthy.
    pub max_failures: u32,
    pub enable_promotion: bool,
    /// Consecutive lower-tier hits required before a backfill fires.
    pub promotion_threshold: u32,
    pub enable_preload: bool,
    pub enable_metrics: bool,
    pub detailed_logging: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            name: "coordinator".to_string(),
            read_policy: ReadPolicy::ReadThrough,
            write_policy: WritePolicy::WriteThrough,
            sync_strategy: SyncStrategy::Periodic,
            sync_interval: Duration::from_secs(300),
            enable_failover: true,
            health_check_interval: Duration::from_secs(30),
            max_failures: 3,
            enable_promotion: true,
            promotion_threshold: 3,
            enable_preload: false,
            enable_metrics: true,
            detailed_logging: false,
        }
    }
}

/// A registered tier: cache implementation plus routing state.
pub struct CacheTier {
    cache: Arc<dyn Cache>,
    priority: i32,
    healthy: AtomicBool,
    consecutive_failures: AtomicU32,
}

impl CacheTier {
    fn new(cache: Arc<dyn Cache>, priority: i32) -> Self {
        Self {
            cache,
            priority,
            healthy: AtomicBool::new(true),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub fn name(&self) -> &str {
        self.cache.name()
    }

    pub fn level(&self) -> CacheLevel {
        self.cache.level()
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    fn note_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    fn note_failure(&self, max_failures: u32, failover_enabled: bool) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failover_enabled
            && failures >= max_failures
            && self.healthy.swap(false, Ordering::Relaxed)
        {
            warn!(
                tier = %self.cache.name(),
                failures,
                "tier exceeded failure budget, excluded from routing"
            );
        }
    }

    fn set_health(&self, healthy: bool) {
        let was = self.healthy.swap(healthy, Ordering::Relaxed);
        if healthy {
            self.consecutive_failures.store(0, Ordering::Relaxed);
            if !was {
                info!(tier = %self.cache.name(), "tier readmitted to routing");
            }
        } else if was {
            warn!(tier = %self.cache.name(), "tier failed health check, excluded from routing");
        }
    }
}

/// Per-tier status in a [`CoordinatorStats`] snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct TierStatus {
    pub name: String,
    pub level: CacheLevel,
    pub priority: i32,
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub stats: CacheStatsSnapshot,
}

/// Aggregate coordinator statistics.
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStats {
    pub total_requests: u64,
    pub promotions: u64,
    pub write_back_depth: usize,
    pub tiers: Vec<TierStatus>,
}

struct WriteBackJob {
    key: CacheKey,
    value: CacheValue,
    ttl: Option<Duration>,
    source_priority: i32,
}

/// Bound on the asynchronous write-back backlog; the oldest job is dropped
/// when a new one would exceed it.
const WRITE_BACK_CAP: usize = 1024;

struct CoordinatorInner {
    config: CoordinatorConfig,
    tiers: RwLock<Vec<Arc<CacheTier>>>,
    promotion_candidates: DashMap<String, u32>,
    in_flight: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    write_back: Mutex<VecDeque<WriteBackJob>>,
    write_back_notify: Notify,
    total_requests: AtomicU64,
    promotions: AtomicU64,
    closed: AtomicBool,
}

impl CoordinatorInner {
    /// Sorted snapshot of every registered tier.
    fn snapshot(&self) -> Vec<Arc<CacheTier>> {
        self.tiers.read().clone()
    }

    /// Sorted snapshot of tiers currently admitted to routing.
    fn healthy_snapshot(&self) -> Vec<Arc<CacheTier>> {
        self.tiers
            .read()
            .iter()
            .filter(|tier| tier.is_healthy())
            .cloned()
            .collect()
    }

    fn ensure_open(&self) -> Result<(), CacheError> {
        if self.closed.load(Ordering::Relaxed) {
            Err(CacheError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    fn clear_promotion(&self, key: &CacheKey) {
        self.promotion_candidates.remove(&key.hash_key());
    }

    fn enqueue_write_back(&self, job: WriteBackJob) {
        let mut queue = self.write_back.lock();
        if queue.len() >= WRITE_BACK_CAP {
            queue.pop_front();
            warn!("write-back backlog full, dropped oldest job");
        }
        queue.push_back(job);
        drop(queue);
        self.write_back_notify.notify_one();
    }

    /// Drain the write-back backlog into slower tiers.
    async fn drain_write_back(&self) {
        loop {
            let job = self.write_back.lock().pop_front();
            let Some(job) = job else { break };
            let tiers = self.healthy_snapshot();
            for tier in tiers
                .iter()
                .filter(|tier| tier.priority > job.source_priority)
            {
                let result = tier.cache.set(&job.key, job.value.clone(), job.ttl).await;
                match result {
                    Ok(()) => tier.note_success(),
                    Err(err) => {
                        tier.note_failure(self.config.max_failures, self.config.enable_failover);
                        debug!(tier = %tier.name(), error = %err, "write-back propagation failed");
                    }
                }
            }
        }
    }

    /// One pass of the periodic sync: the slowest healthy tier is
    /// authoritative; missing or older copies on faster tiers are refreshed.
    /// Newer entries are never overwritten.
    async fn sync_once(&self) {
        let tiers = self.healthy_snapshot();
        if tiers.len() < 2 {
            return;
        }
        let Some(authoritative) = tiers.last() else {
            return;
        };
        let keys = match authoritative.cache.keys(None).await {
            Ok(keys) => keys,
            Err(err) => {
                authoritative.note_failure(self.config.max_failures, self.config.enable_failover);
                debug!(tier = %authoritative.name(), error = %err, "sync key listing failed");
                return;
            }
        };

        let mut pushed = 0usize;
        for key in keys {
            let Ok(Some(value)) = authoritative.cache.get(&key).await else {
                continue;
            };
            let ttl = value.remaining_ttl();
            for tier in &tiers[..tiers.len() - 1] {
                let fresh_enough = match tier.cache.get(&key).await {
                    Ok(Some(existing)) => existing.created_at >= value.created_at,
                    Ok(None) => false,
                    Err(_) => continue,
                };
                if !fresh_enough && tier.cache.set(&key, value.clone(), ttl).await.is_ok() {
                    pushed += 1;
                }
            }
        }
        if pushed > 0 {
            debug!(name = %self.config.name, pushed, "periodic sync refreshed entries");
        }
    }

    /// Exercise every tier and flip health flags from the outcome.
    async fn run_health_checks(&self) -> Vec<(String, CacheHealthReport)> {
        let tiers = self.snapshot();
        let mut reports = Vec::with_capacity(tiers.len());
        for tier in tiers {
            let report = tier.cache.health_check().await;
            tier.set_health(report.healthy);
            reports.push((tier.name().to_string(), report));
        }
        reports
    }
}

/// RAII removal of an in-flight fill slot.
struct InFlightGuard<'a> {
    map: &'a DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    key: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.map.remove(&self.key);
    }
}

/// Layered cache facade implementing the same contract as its tiers.
pub struct CacheCoordinator {
    inner: Arc<CoordinatorInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

impl CacheCoordinator {
    #[must_use]
    pub fn new(config: CoordinatorConfig) -> Self {
        info!(
            name = %config.name,
            read = ?config.read_policy,
            write = ?config.write_policy,
            sync = ?config.sync_strategy,
            "Initializing cache coordinator"
        );
        Self {
            inner: Arc::new(CoordinatorInner {
                config,
                tiers: RwLock::new(Vec::new()),
                promotion_candidates: DashMap::new(),
                in_flight: DashMap::new(),
                write_back: Mutex::new(VecDeque::new()),
                write_back_notify: Notify::new(),
                total_requests: AtomicU64::new(0),
                promotions: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
            tasks: Mutex::new(Vec::new()),
            shutdown: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    /// Register a tier at the given priority (lower = faster). The list is
    /// kept sorted; routing iterates in priority order.
    pub fn add_cache(&self, cache: Arc<dyn Cache>, priority: i32) -> Result<(), CacheError> {
        let mut tiers = self.inner.tiers.write();
        if tiers.iter().any(|tier| tier.name() == cache.name()) {
            return Err(CacheError::Config(format!(
                "tier '{}' is already registered",
                cache.name()
            )));
        }
        info!(tier = %cache.name(), priority, level = %cache.level(), "registered cache tier");
        tiers.push(Arc::new(CacheTier::new(cache, priority)));
        tiers.sort_by_key(|tier| tier.priority);
        Ok(())
    }

    /// Unregister a tier by name.
    pub fn remove_cache(&self, name: &str) -> bool {
        let mut tiers = self.inner.tiers.write();
        let before = tiers.len();
        tiers.retain(|tier| tier.name() != name);
        before != tiers.len()
    }

    /// Registered tiers, fastest first.
    #[must_use]
    pub fn tiers(&self) -> Vec<Arc<CacheTier>> {
        self.inner.snapshot()
    }

    /// Registered tiers at a routing level, fastest first.
    #[must_use]
    pub fn tiers_at_level(&self, level: CacheLevel) -> Vec<Arc<CacheTier>> {
        self.inner
            .snapshot()
            .into_iter()
            .filter(|tier| tier.level() == level)
            .collect()
    }

    fn note(&self, tier: &CacheTier, failed: bool) {
        if failed {
            tier.note_failure(
                self.inner.config.max_failures,
                self.inner.config.enable_failover,
            );
        } else {
            tier.note_success();
        }
    }

    /// Fire-and-forget backfill of `value` into every tier faster than the
    /// one that produced the hit.
    fn spawn_backfill(&self, targets: Vec<Arc<CacheTier>>, key: CacheKey, value: CacheValue) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let ttl = value.remaining_ttl();
            for tier in targets {
                match tier.cache.set(&key, value.clone(), ttl).await {
                    Ok(()) => {
                        tier.note_success();
                        inner.promotions.fetch_add(1, Ordering::Relaxed);
                        debug!(tier = %tier.name(), key = %key, "promoted entry");
                    }
                    Err(err) => {
                        tier.note_failure(inner.config.max_failures, inner.config.enable_failover);
                        warn!(tier = %tier.name(), key = %key, error = %err, "promotion failed");
                    }
                }
            }
        });
    }

    /// Read per the configured policy.
    ///
    /// Read-through walks tiers fastest to slowest and backfills behind the
    /// promotion gate; cache-aside reads only the fastest healthy tier.
    pub async fn get(&self, key: &CacheKey) -> Result<Option<CacheValue>, CacheError> {
        self.inner.ensure_open()?;
        self.inner.total_requests.fetch_add(1, Ordering::Relaxed);

        let tiers = self.inner.healthy_snapshot();
        if tiers.is_empty() {
            return Err(CacheError::NoHealthyTier);
        }

        let limit = match self.inner.config.read_policy {
            ReadPolicy::ReadThrough => tiers.len(),
            ReadPolicy::CacheAside => 1,
        };

        let mut last_err = None;
        let mut any_answered = false;
        for (index, tier) in tiers.iter().take(limit).enumerate() {
            match tier.cache.get(key).await {
                Ok(Some(value)) => {
                    self.note(tier, false);
                    if self.inner.config.detailed_logging {
                        debug!(tier = %tier.name(), key = %key, "read hit");
                    }
                    if index > 0 && self.inner.config.enable_promotion {
                        let hash = key.hash_key();
                        let hits = {
                            let mut counter =
                                self.inner.promotion_candidates.entry(hash.clone()).or_insert(0);
                            *counter += 1;
                            *counter
                        };
                        if hits >= self.inner.config.promotion_threshold {
                            self.inner.promotion_candidates.remove(&hash);
                            let targets: Vec<Arc<CacheTier>> =
                                tiers.iter().take(index).cloned().collect();
                            self.spawn_backfill(targets, key.clone(), value.clone());
                        }
                    }
                    return Ok(Some(value));
                }
                Ok(None) => {
                    self.note(tier, false);
                    any_answered = true;
                }
                Err(err) => {
                    self.note(tier, true);
                    debug!(tier = %tier.name(), key = %key, error = %err, "tier read failed");
                    last_err = Some(err);
                }
            }
        }

        if any_answered {
            Ok(None)
        } else {
            Err(last_err.unwrap_or(CacheError::NoHealthyTier))
        }
    }

    /// Write per the configured policy. Any write clears the key's
    /// promotion counter.
    pub async fn set(
        &self,
        key: &CacheKey,
        value: CacheValue,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        self.inner.ensure_open()?;
        self.inner.clear_promotion(key);

        let tiers = self.inner.healthy_snapshot();
        if tiers.is_empty() {
            return Err(CacheError::NoHealthyTier);
        }

        let result = match self.inner.config.write_policy {
            WritePolicy::WriteThrough => self.write_all(&tiers, key, &value, ttl).await,
            WritePolicy::WriteAround => {
                let slowest = tiers.last().cloned().ok_or(CacheError::NoHealthyTier)?;
                let result = slowest.cache.set(key, value.clone(), ttl).await;
                self.note(&slowest, result.is_err());
                result
            }
            WritePolicy::WriteBack => {
                let fastest = tiers.first().cloned().ok_or(CacheError::NoHealthyTier)?;
                let result = fastest.cache.set(key, value.clone(), ttl).await;
                self.note(&fastest, result.is_err());
                if result.is_ok() && tiers.len() > 1 {
                    self.inner.enqueue_write_back(WriteBackJob {
                        key: key.clone(),
                        value: value.clone(),
                        ttl,
                        source_priority: fastest.priority,
                    });
                }
                result
            }
        };

        // immediate sync piggybacks the write onto the remaining tiers
        if result.is_ok()
            && self.inner.config.sync_strategy == SyncStrategy::Immediate
            && self.inner.config.write_policy != WritePolicy::WriteThrough
        {
            self.write_all(&tiers, key, &value, ttl).await.ok();
        }

        result
    }

    async fn write_all(
        &self,
        tiers: &[Arc<CacheTier>],
        key: &CacheKey,
        value: &CacheValue,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let mut successes = 0;
        let mut last_err = None;
        for tier in tiers {
            match tier.cache.set(key, value.clone(), ttl).await {
                Ok(()) => {
                    self.note(tier, false);
                    successes += 1;
                }
                Err(err) => {
                    self.note(tier, true);
                    warn!(tier = %tier.name(), key = %key, error = %err, "tier write failed");
                    last_err = Some(err);
                }
            }
        }
        if successes > 0 {
            Ok(())
        } else {
            Err(last_err.unwrap_or(CacheError::NoHealthyTier))
        }
    }

    /// Delete from every healthy tier; succeeds when at least one tier
    /// accepted the operation. Clears the promotion counter.
    pub async fn delete(&self, key: &CacheKey) -> Result<bool, CacheError> {
        self.inner.ensure_open()?;
        self.inner.clear_promotion(key);

        let tiers = self.inner.healthy_snapshot();
        if tiers.is_empty() {
            return Err(CacheError::NoHealthyTier);
        }

        let mut removed = false;
        let mut successes = 0;
        let mut last_err = None;
        for tier in &tiers {
            match tier.cache.delete(key).await {
                Ok(was_live) => {
                    self.note(tier, false);
                    removed |= was_live;
                    successes += 1;
                }
                Err(err) => {
                    self.note(tier, true);
                    last_err = Some(err);
                }
            }
        }
        if successes > 0 {
            Ok(removed)
        } else {
            Err(last_err.unwrap_or(CacheError::NoHealthyTier))
        }
    }

    /// True iff any healthy tier reports a live entry.
    pub async fn exists(&self, key: &CacheKey) -> Result<bool, CacheError> {
        self.inner.ensure_open()?;
        let tiers = self.inner.healthy_snapshot();
        if tiers.is_empty() {
            return Err(CacheError::NoHealthyTier);
        }

        let mut any_answered = false;
        let mut last_err = None;
        for tier in &tiers {
            match tier.cache.exists(key).await {
                Ok(true) => {
                    self.note(tier, false);
                    return Ok(true);
                }
                Ok(false) => {
                    self.note(tier, false);
                    any_answered = true;
                }
                Err(err) => {
                    self.note(tier, true);
                    last_err = Some(err);
                }
            }
        }
        if any_answered {
            Ok(false)
        } else {
            Err(last_err.unwrap_or(CacheError::NoHealthyTier))
        }
    }

    /// Clear every healthy tier; succeeds when at least one accepted.
    /// All promotion counters are dropped.
    pub async fn clear(&self) -> Result<(), CacheError> {
        self.inner.ensure_open()?;
        self.inner.promotion_candidates.clear();

        let tiers = self.inner.healthy_snapshot();
        if tiers.is_empty() {
            return Err(CacheError::NoHealthyTier);
        }

        let mut successes = 0;
        let mut last_err = None;
        for tier in &tiers {
            match tier.cache.clear().await {
                Ok(()) => {
                    self.note(tier, false);
                    successes += 1;
                }
                Err(err) => {
                    self.note(tier, true);
                    last_err = Some(err);
                }
            }
        }
        if successes > 0 {
            Ok(())
        } else {
            Err(last_err.unwrap_or(CacheError::NoHealthyTier))
        }
    }

    /// Maximum live entry count reported by any healthy tier, a
    /// conservative upper bound rather than a sum.
    pub async fn size(&self) -> Result<usize, CacheError> {
        self.inner.ensure_open()?;
        let tiers = self.inner.healthy_snapshot();
        let mut max = 0;
        for tier in &tiers {
            match tier.cache.size().await {
                Ok(size) => {
                    self.note(tier, false);
                    max = max.max(size);
                }
                Err(_) => self.note(tier, true),
            }
        }
        Ok(max)
    }

    /// Union of live keys across healthy tiers, deduplicated by hash-key.
    pub async fn keys(&self, pattern: Option<&str>) -> Result<Vec<CacheKey>, CacheError> {
        self.inner.ensure_open()?;
        let tiers = self.inner.healthy_snapshot();
        if tiers.is_empty() {
            return Err(CacheError::NoHealthyTier);
        }

        let mut merged: HashMap<String, CacheKey> = HashMap::new();
        let mut any_answered = false;
        let mut last_err = None;
        for tier in &tiers {
            match tier.cache.keys(pattern).await {
                Ok(keys) => {
                    self.note(tier, false);
                    any_answered = true;
                    for key in keys {
                        merged.entry(key.hash_key()).or_insert(key);
                    }
                }
                Err(err) => {
                    self.note(tier, true);
                    last_err = Some(err);
                }
            }
        }
        if any_answered {
            Ok(merged.into_values().collect())
        } else {
            Err(last_err.unwrap_or(CacheError::NoHealthyTier))
        }
    }

    /// Increment on the slowest (authoritative) healthy tier, invalidating
    /// faster copies so subsequent reads converge through backfill.
    pub async fn increment(&self, key: &CacheKey, delta: i64) -> Result<i64, CacheError> {
        self.inner.ensure_open()?;
        self.inner.clear_promotion(key);

        let tiers = self.inner.healthy_snapshot();
        let authoritative = tiers.last().cloned().ok_or(CacheError::NoHealthyTier)?;
        let result = authoritative.cache.increment(key, delta).await;
        self.note(&authoritative, result.is_err());
        let next = result?;

        for tier in &tiers[..tiers.len() - 1] {
            if let Err(err) = tier.cache.delete(key).await {
                self.note(tier, true);
                debug!(tier = %tier.name(), key = %key, error = %err, "increment invalidation failed");
            } else {
                self.note(tier, false);
            }
        }
        Ok(next)
    }

    /// Move the expiry on every healthy tier holding the key.
    pub async fn expire(&self, key: &CacheKey, ttl: Duration) -> Result<bool, CacheError> {
        self.inner.ensure_open()?;
        let tiers = self.inner.healthy_snapshot();
        if tiers.is_empty() {
            return Err(CacheError::NoHealthyTier);
        }
        let mut applied = false;
        for tier in &tiers {
            match tier.cache.expire(key, ttl).await {
                Ok(ok) => {
                    self.note(tier, false);
                    applied |= ok;
                }
                Err(_) => self.note(tier, true),
            }
        }
        Ok(applied)
    }

    /// Read the key or run `fill` exactly once per key across concurrent
    /// callers, installing the produced payload per the write policy.
    pub async fn get_or_set(
        &self,
        key: &CacheKey,
        ttl: Option<Duration>,
        fill: FillFn,
    ) -> Result<CacheValue, CacheError> {
        self.inner.ensure_open()?;

        if let Some(value) = self.get(key).await? {
            return Ok(value);
        }

        let hash = key.hash_key();
        let slot = self
            .inner
            .in_flight
            .entry(hash.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _permit = slot.lock().await;
        let _cleanup = InFlightGuard {
            map: &self.inner.in_flight,
            key: hash,
        };

        // a concurrent fill may have landed while we waited
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

    /// Exercise every tier now and update health flags.
    pub async fn health_check(&self) -> Vec<(String, CacheHealthReport)> {
        self.inner.run_health_checks().await
    }

    /// Aggregate statistics across the coordinator and its tiers.
    #[must_use]
    pub fn stats(&self) -> CoordinatorStats {
        let tiers = self
            .inner
            .snapshot()
            .iter()
            .map(|tier| TierStatus {
                name: tier.name().to_string(),
                level: tier.level(),
                priority: tier.priority,
                healthy: tier.is_healthy(),
                consecutive_failures: tier.consecutive_failures(),
                stats: tier.cache.statistics().snapshot(),
            })
            .collect();
        CoordinatorStats {
            total_requests: self.inner.total_requests.load(Ordering::Relaxed),
            promotions: self.inner.promotions.load(Ordering::Relaxed),
            write_back_depth: self.inner.write_back.lock().len(),
            tiers,
        }
    }

    /// Start tiers and the background health-check, sync and write-back
    /// tasks.
    pub async fn start(&self) -> Result<(), CacheError> {
        for tier in self.inner.snapshot() {
            tier.cache.start().await?;
        }

        let (tx, rx) = watch::channel(false);
        *self.shutdown.lock() = Some(tx);
        let mut handles = Vec::new();

        {
            let inner = Arc::clone(&self.inner);
            let mut rx_health = rx.clone();
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(inner.config.health_check_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                // the first tick fires immediately; skip it so tiers keep
                // their initial health until the first real interval
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            inner.run_health_checks().await;
                        }
                        _ = rx_health.changed() => break,
                    }
                }
            }));
        }

        if self.inner.config.sync_strategy == SyncStrategy::Periodic {
            let inner = Arc::clone(&self.inner);
            let mut rx_sync = rx.clone();
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(inner.config.sync_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => inner.sync_once().await,
                        _ = rx_sync.changed() => break,
                    }
                }
            }));
        }

        if self.inner.config.write_policy == WritePolicy::WriteBack {
            let inner = Arc::clone(&self.inner);
            let mut rx_wb = rx;
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        () = inner.write_back_notify.notified() => {
                            inner.drain_write_back().await;
                        }
                        _ = rx_wb.changed() => {
                            // best-effort final drain
                            inner.drain_write_back().await;
                            break;
                        }
                    }
                }
            }));
        }

        self.tasks.lock().extend(handles);
        info!(name = %self.inner.config.name, "cache coordinator started");
        Ok(())
    }

    /// Fail fast new operations, drain background tasks with a bounded
    /// timeout and stop the tiers.
    pub async fn stop(&self) -> Result<(), CacheError> {
        self.inner.closed.store(true, Ordering::Relaxed);
        if let Some(tx) = self.shutdown.lock().take() {
            let _ = tx.send(true);
        }
        let handles: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            if tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .is_err()
            {
                warn!(name = %self.inner.config.name, "background task did not stop in time");
            }
        }
        for tier in self.inner.snapshot() {
            tier.cache.stop().await?;
        }
        info!(name = %self.inner.config.name, "cache coordinator stopped");
        Ok(())
    }
}
