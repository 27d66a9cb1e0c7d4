//! Per-tier statistics.
//!
//! Counters are plain atomics updated with relaxed ordering; readers take a
//! [`CacheStatsSnapshot`] and may observe slightly stale values. Failure
//! paths bump `errors` and never corrupt the other counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Atomic operation counters for a single cache tier.
#[derive(Debug)]
pub struct CacheStatistics {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    evictions: AtomicU64,
    errors: AtomicU64,
    current_size: AtomicU64,
    current_memory_bytes: AtomicU64,
    total_get_time_us: AtomicU64,
    total_set_time_us: AtomicU64,
    created_at: DateTime<Utc>,
}

impl Default for CacheStatistics {
    fn default() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            current_size: AtomicU64::new(0),
            current_memory_bytes: AtomicU64::new(0),
            total_get_time_us: AtomicU64::new(0),
            total_set_time_us: AtomicU64::new(0),
            created_at: Utc::now(),
        }
    }
}

impl CacheStatistics {
    pub fn record_hit(&self, elapsed: Duration) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.total_get_time_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_miss(&self, elapsed: Duration) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.total_get_time_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_set(&self, elapsed: Duration) {
        self.sets.fetch_add(1, Ordering::Relaxed);
        self.total_set_time_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_current_size(&self, entries: u64) {
        self.current_size.store(entries, Ordering::Relaxed);
    }

    pub fn set_current_memory_bytes(&self, bytes: u64) {
        self.current_memory_bytes.store(bytes, Ordering::Relaxed);
    }

    pub fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn miss_count(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn eviction_count(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Point-in-time view with derived rates.
    #[must_use]
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let sets = self.sets.load(Ordering::Relaxed);
        let reads = hits + misses;
        let total_get_us = self.total_get_time_us.load(Ordering::Relaxed);
        let total_set_us = self.total_set_time_us.load(Ordering::Relaxed);

        #[allow(clippy::cast_precision_loss)]
        CacheStatsSnapshot {
            hits,
            misses,
            sets,
            deletes: self.deletes.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            current_size: self.current_size.load(Ordering::Relaxed),
            current_memory_bytes: self.current_memory_bytes.load(Ordering::Relaxed),
            hit_rate: if reads > 0 {
                hits as f64 / reads as f64
            } else {
                0.0
            },
            avg_get_time_us: if reads > 0 {
                total_get_us as f64 / reads as f64
            } else {
                0.0
            },
            avg_set_time_us: if sets > 0 {
                total_set_us as f64 / sets as f64
            } else {
                0.0
            },
            uptime: (Utc::now() - self.created_at)
                .to_std()
                .unwrap_or(Duration::ZERO),
        }
    }
}

/// Read-only view of a tier's counters.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub evictions: u64,
    pub errors: u64,
    pub current_size: u64,
    pub current_memory_bytes: u64,
    pub hit_rate: f64,
    pub avg_get_time_us: f64,
    pub avg_set_time_us: f64,
    #[serde(skip)]
    pub uptime: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_rate_is_hits_over_reads() {
        let stats = CacheStatistics::default();
        stats.record_hit(Duration::from_micros(10));
        stats.record_hit(Duration::from_micros(30));
        stats.record_miss(Duration::from_micros(20));

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.hits, 2);
        assert_eq!(snapshot.misses, 1);
        assert!((snapshot.hit_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!((snapshot.avg_get_time_us - 20.0).abs() < 1e-9);
    }

    #[test]
    fn empty_stats_report_zero_rates() {
        let snapshot = CacheStatistics::default().snapshot();
        assert_eq!(snapshot.hit_rate, 0.0);
        assert_eq!(snapshot.avg_get_time_us, 0.0);
        assert_eq!(snapshot.avg_set_time_us, 0.0);
    }
}
