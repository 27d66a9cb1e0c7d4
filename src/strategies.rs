//! Eviction strategies.
//!
//! A strategy observes entry lifecycle events (`on_insert`, `on_access`,
//! `on_remove`) and produces a victim on demand. Tiers consult it whenever
//! an insert would exceed `max_size` or the configured memory ceiling, and
//! keep evicting until the invariant holds again.
//!
//! Strategies track hash-key strings only; the owning tier holds the
//! entries and the lock around the strategy state.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::config::EvictionPolicy;
use crate::key::CacheValue;

/// Victim selection driven by entry lifecycle callbacks.
pub trait EvictionStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn on_insert(&mut self, key: &str, value: &CacheValue);
    fn on_access(&mut self, key: &str, value: &CacheValue);
    fn on_remove(&mut self, key: &str);
    /// The key that should be evicted next, if any entry is tracked.
    fn evict_candidate(&mut self) -> Option<String>;
}

/// Build the strategy for a configured policy.
#[must_use]
pub fn create_strategy(policy: EvictionPolicy) -> Box<dyn EvictionStrategy> {
    match policy {
        EvictionPolicy::Lru => Box::new(LruStrategy::default()),
        EvictionPolicy::Lfu => Box::new(LfuStrategy::default()),
        EvictionPolicy::Ttl => Box::new(TtlStrategy::default()),
        EvictionPolicy::Fifo => Box::new(FifoStrategy::default()),
        EvictionPolicy::Random => Box::new(RandomStrategy::default()),
        EvictionPolicy::Adaptive => Box::new(AdaptiveStrategy::default()),
    }
}

/// Least recently used: victim is the entry with the oldest access stamp.
#[derive(Debug, Default)]
pub struct LruStrategy {
    clock: u64,
    recency: HashMap<String, u64>,
}

impl LruStrategy {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

impl EvictionStrategy for LruStrategy {
    fn name(&self) -> &'static str {
        "lru"
    }

    fn on_insert(&mut self, key: &str, _value: &CacheValue) {
        let stamp = self.tick();
        self.recency.insert(key.to_string(), stamp);
    }

    fn on_access(&mut self, key: &str, _value: &CacheValue) {
        let stamp = self.tick();
        self.recency.insert(key.to_string(), stamp);
    }

    fn on_remove(&mut self, key: &str) {
        self.recency.remove(key);
    }

    fn evict_candidate(&mut self) -> Option<String> {
        self.recency
            .iter()
            .min_by_key(|(_, stamp)| **stamp)
            .map(|(key, _)| key.clone())
    }
}

/// Least frequently used; ties broken by recency (LRU).
#[derive(Debug, Default)]
pub struct LfuStrategy {
    clock: u64,
    entries: HashMap<String, (u64, u64)>,
}

impl EvictionStrategy for LfuStrategy {
    fn name(&self) -> &'static str {
        "lfu"
    }

    fn on_insert(&mut self, key: &str, _value: &CacheValue) {
        self.clock += 1;
        self.entries.insert(key.to_string(), (1, self.clock));
    }

    fn on_access(&mut self, key: &str, _value: &CacheValue) {
        self.clock += 1;
        let clock = self.clock;
        self.entries
            .entry(key.to_string())
            .and_modify(|(freq, last)| {
                *freq += 1;
                *last = clock;
            })
            .or_insert((1, clock));
    }

    fn on_remove(&mut self, key: &str) {
        self.entries.remove(key);
    }

    fn evict_candidate(&mut self) -> Option<String> {
        self.entries
            .iter()
            .min_by_key(|(_, (freq, last))| (*freq, *last))
            .map(|(key, _)| key.clone())
    }
}

/// Expiry-driven: expired entries are always candidates; otherwise the
/// entry nearest to expiry is chosen, with never-expiring entries last.
#[derive(Debug, Default)]
pub struct TtlStrategy {
    expiries: HashMap<String, Option<DateTime<Utc>>>,
}

impl EvictionStrategy for TtlStrategy {
    fn name(&self) -> &'static str {
        "ttl"
    }

    fn on_insert(&mut self, key: &str, value: &CacheValue) {
        self.expiries.insert(key.to_string(), value.expires_at);
    }

    fn on_access(&mut self, key: &str, value: &CacheValue) {
        // expire() may have moved the expiry since insert
        self.expiries.insert(key.to_string(), value.expires_at);
    }

    fn on_remove(&mut self, key: &str) {
        self.expiries.remove(key);
    }

    fn evict_candidate(&mut self) -> Option<String> {
        let now = Utc::now();
        if let Some((key, _)) = self
            .expiries
            .iter()
            .find(|(_, expiry)| expiry.is_some_and(|at| at <= now))
        {
            return Some(key.clone());
        }
        if let Some((key, _)) = self
            .expiries
            .iter()
            .filter_map(|(key, expiry)| expiry.map(|at| (key, at)))
            .min_by_key(|(_, at)| *at)
        {
            return Some(key.clone());
        }
        self.expiries.keys().next().cloned()
    }
}

/// First in, first out: accesses do not refresh position.
#[derive(Debug, Default)]
pub struct FifoStrategy {
    clock: u64,
    inserted: HashMap<String, u64>,
}

impl EvictionStrategy for FifoStrategy {
    fn name(&self) -> &'static str {
        "fifo"
    }

    fn on_insert(&mut self, key: &str, _value: &CacheValue) {
        self.clock += 1;
        self.inserted.insert(key.to_string(), self.clock);
    }

    fn on_access(&mut self, _key: &str, _value: &CacheValue) {}

    fn on_remove(&mut self, key: &str) {
        self.inserted.remove(key);
    }

    fn evict_candidate(&mut self) -> Option<String> {
        self.inserted
            .iter()
            .min_by_key(|(_, stamp)| **stamp)
            .map(|(key, _)| key.clone())
    }
}

/// Uniform random victim.
#[derive(Debug, Default)]
pub struct RandomStrategy {
    keys: Vec<String>,
    positions: HashMap<String, usize>,
}

impl EvictionStrategy for RandomStrategy {
    fn name(&self) -> &'static str {
        "random"
    }

    fn on_insert(&mut self, key: &str, _value: &CacheValue) {
        if !self.positions.contains_key(key) {
            self.positions.insert(key.to_string(), self.keys.len());
            self.keys.push(key.to_string());
        }
    }

    fn on_access(&mut self, _key: &str, _value: &CacheValue) {}

    fn on_remove(&mut self, key: &str) {
        if let Some(pos) = self.positions.remove(key) {
            self.keys.swap_remove(pos);
            if let Some(moved) = self.keys.get(pos) {
                self.positions.insert(moved.clone(), pos);
            }
        }
    }

    fn evict_candidate(&mut self) -> Option<String> {
        if self.keys.is_empty() {
            return None;
        }
        let index = rand::thread_rng().gen_range(0..self.keys.len());
        self.keys.get(index).cloned()
    }
}

/// Cap on remembered evictions per inner policy.
const GHOST_CAPACITY: usize = 64;

/// Recently evicted keys for one inner policy. A re-insert of a remembered
/// key counts as a regret for the policy that evicted it.
#[derive(Debug, Default)]
struct GhostList {
    order: VecDeque<String>,
    members: HashSet<String>,
}

impl GhostList {
    fn remember(&mut self, key: String) {
        if self.members.insert(key.clone()) {
            self.order.push_back(key);
            if self.order.len() > GHOST_CAPACITY {
                if let Some(old) = self.order.pop_front() {
                    self.members.remove(&old);
                }
            }
        }
    }

    fn forget(&mut self, key: &str) -> bool {
        if self.members.remove(key) {
            self.order.retain(|k| k != key);
            true
        } else {
            false
        }
    }
}

/// Maintains LRU and LFU views and evicts with whichever policy has caused
/// fewer regrets: an eviction whose key is requested again soon was a bad
/// call, and the counter biases future picks away from that policy.
#[derive(Debug, Default)]
pub struct AdaptiveStrategy {
    lru: LruStrategy,
    lfu: LfuStrategy,
    lru_ghost: GhostList,
    lfu_ghost: GhostList,
    lru_regrets: u64,
    lfu_regrets: u64,
}

impl EvictionStrategy for AdaptiveStrategy {
    fn name(&self) -> &'static str {
        "adaptive"
    }

    fn on_insert(&mut self, key: &str, value: &CacheValue) {
        if self.lru_ghost.forget(key) {
            self.lru_regrets += 1;
        }
        if self.lfu_ghost.forget(key) {
            self.lfu_regrets += 1;
        }
        self.lru.on_insert(key, value);
        self.lfu.on_insert(key, value);
    }

    fn on_access(&mut self, key: &str, value: &CacheValue) {
        self.lru.on_access(key, value);
        self.lfu.on_access(key, value);
    }

    fn on_remove(&mut self, key: &str) {
        self.lru.on_remove(key);
        self.lfu.on_remove(key);
    }

    fn evict_candidate(&mut self) -> Option<String> {
        let use_lru = self.lru_regrets <= self.lfu_regrets;
        let candidate = if use_lru {
            self.lru.evict_candidate()
        } else {
            self.lfu.evict_candidate()
        };
        if let Some(key) = &candidate {
            if use_lru {
                self.lru_ghost.remember(key.clone());
            } else {
                self.lfu_ghost.remember(key.clone());
            }
        }
        candidate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn value() -> CacheValue {
        CacheValue::new(b"v".to_vec())
    }

    #[test]
    fn lru_evicts_least_recently_touched() {
        let mut lru = LruStrategy::default();
        lru.on_insert("a", &value());
        lru.on_insert("b", &value());
        lru.on_insert("c", &value());
        lru.on_access("a", &value());

        assert_eq!(lru.evict_candidate().as_deref(), Some("b"));
        lru.on_remove("b");
        assert_eq!(lru.evict_candidate().as_deref(), Some("c"));
    }

    #[test]
    fn lfu_breaks_frequency_ties_by_recency() {
        let mut lfu = LfuStrategy::default();
        lfu.on_insert("a", &value());
        lfu.on_insert("b", &value());
        lfu.on_access("a", &value());

        // b has the lower frequency
        assert_eq!(lfu.evict_candidate().as_deref(), Some("b"));

        lfu.on_access("b", &value());
        // both at 2 accesses; a was touched earlier
        assert_eq!(lfu.evict_candidate().as_deref(), Some("a"));
    }

    #[test]
    fn ttl_prefers_expired_then_nearest_expiry() {
        let mut ttl = TtlStrategy::default();
        ttl.on_insert("forever", &value());
        ttl.on_insert(
            "soon",
            &CacheValue::with_ttl(b"v".to_vec(), Duration::from_secs(60)),
        );
        ttl.on_insert(
            "later",
            &CacheValue::with_ttl(b"v".to_vec(), Duration::from_secs(3600)),
        );

        assert_eq!(ttl.evict_candidate().as_deref(), Some("soon"));

        let mut expired = CacheValue::new(b"v".to_vec());
        expired.expires_at = Some(Utc::now() - Duration::from_secs(5));
        ttl.on_insert("dead", &expired);
        assert_eq!(ttl.evict_candidate().as_deref(), Some("dead"));
    }

    #[test]
    fn fifo_ignores_accesses() {
        let mut fifo = FifoStrategy::default();
        fifo.on_insert("a", &value());
        fifo.on_insert("b", &value());
        fifo.on_access("a", &value());
        fifo.on_access("a", &value());

        assert_eq!(fifo.evict_candidate().as_deref(), Some("a"));
    }

    #[test]
    fn random_tracks_membership() {
        let mut random = RandomStrategy::default();
        random.on_insert("a", &value());
        random.on_insert("b", &value());
        random.on_remove("a");

        assert_eq!(random.evict_candidate().as_deref(), Some("b"));
        random.on_remove("b");
        assert!(random.evict_candidate().is_none());
    }

    #[test]
    fn adaptive_shifts_away_from_regretted_policy() {
        let mut adaptive = AdaptiveStrategy::default();
        adaptive.on_insert("a", &value());
        adaptive.on_insert("b", &value());

        // LRU starts as the active view (no regrets yet): evicts "a"
        let first = adaptive.evict_candidate();
        assert_eq!(first.as_deref(), Some("a"));
        adaptive.on_remove("a");

        // "a" comes straight back: that eviction was a regret for LRU
        adaptive.on_insert("a", &value());
        assert_eq!(adaptive.lru_regrets, 1);
        assert_eq!(adaptive.lfu_regrets, 0);

        // with LRU discredited, the LFU view picks the next victim
        adaptive.on_access("b", &value());
        let second = adaptive.evict_candidate();
        assert_eq!(second.as_deref(), Some("a"));
    }
}
