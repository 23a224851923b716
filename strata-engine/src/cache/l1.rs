//! L1 Hot Cache
//!
//! Small in-process TTL + LRU cache for confirmed-hot entries. Victims of
//! capacity pressure are handed back to the caller so they can be demoted
//! into L2 while the L1 lock is still held.

use super::lru::{InsertOutcome, LruTable};
use super::{TierCounters, TierStats};
use crate::config::TierConfig;
use crate::core::{CacheEntry, Tier, Value};
use crate::metrics;
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::Ordering;
use tokio::time::Instant;
use tracing::{debug, error};

pub struct HotCache {
    table: Mutex<LruTable>,
    counters: TierCounters,
}

impl HotCache {
    pub fn new(config: &TierConfig) -> Self {
        Self {
            table: Mutex::new(LruTable::new(config.capacity, config.ttl(), Tier::L1)),
            counters: TierCounters::default(),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.table.lock().contains(key, Instant::now())
    }

    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> TierStats {
        let table = self.table.lock();
        self.counters.snapshot(table.len(), table.capacity())
    }

    /// Purge expired entries and verify the table; a corrupted table is
    /// rebuilt empty. Returns the number of purged entries.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut table = self.table.lock();
        let purged = table.purge_expired(now);
        self.counters.record_expired(purged);
        if let Err(reason) = table.check_integrity() {
            error!("L1 cache corrupted ({}), rebuilding empty", reason);
            table.clear();
            self.counters.rebuilds.fetch_add(1, Ordering::Relaxed);
            metrics::CACHE_REBUILDS_TOTAL
                .with_label_values(&[Tier::L1.as_str()])
                .inc();
        }
        purged
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, LruTable> {
        self.table.lock()
    }

    pub(crate) fn record_lookup(&self, key: &str, hit: bool) {
        if hit {
            self.counters.record_hit();
            debug!("L1 Cache HIT for key: {}", key);
        } else {
            self.counters.record_miss();
        }
        metrics::record_lookup(Tier::L1.as_str(), hit);
    }

    /// Insert or replace a value; returns the live entries evicted to make room
    pub(crate) fn insert_locked(
        &self,
        table: &mut LruTable,
        key: &str,
        value: Value,
    ) -> Vec<CacheEntry> {
        let now = Instant::now();
        let entry = CacheEntry::new(key.to_string(), value, Tier::L1, table.ttl(), now);
        self.insert_entry_locked(table, entry, now)
    }

    pub(crate) fn insert_entry_locked(
        &self,
        table: &mut LruTable,
        entry: CacheEntry,
        now: Instant,
    ) -> Vec<CacheEntry> {
        let outcome: InsertOutcome = table.insert(entry, now);
        self.counters.record_insert(&outcome);
        metrics::record_evictions(Tier::L1.as_str(), outcome.evicted.len());
        for victim in &outcome.evicted {
            debug!("L1 Cache EVICT: {}", victim.key);
        }
        outcome.evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn config(capacity: usize) -> TierConfig {
        TierConfig {
            capacity,
            ttl_ms: 60_000,
        }
    }

    fn put(cache: &HotCache, key: &str, value: Value) -> Vec<CacheEntry> {
        let mut table = cache.lock();
        cache.insert_locked(&mut table, key, value)
    }

    fn get(cache: &HotCache, key: &str) -> Option<Value> {
        let mut table = cache.lock();
        let value = table.get(key, Instant::now()).map(|e| e.value.clone());
        cache.record_lookup(key, value.is_some());
        value
    }

    #[test]
    fn test_put_get() {
        let cache = HotCache::new(&config(10));
        put(&cache, "user:1", json!({"name": "ana"}));

        assert_eq!(get(&cache, "user:1"), Some(json!({"name": "ana"})));
        assert_eq!(get(&cache, "user:2"), None);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_rate, 0.5);
    }

    #[test]
    fn test_capacity_two_evicts_oldest() {
        let cache = HotCache::new(&config(2));
        assert!(put(&cache, "A", json!("a")).is_empty());
        assert!(put(&cache, "B", json!("b")).is_empty());

        let evicted = put(&cache, "C", json!("c"));
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].key, "A");
        assert_eq!(evicted[0].value, json!("a"));

        assert!(!cache.contains("A"));
        assert!(cache.contains("B"));
        assert!(cache.contains("C"));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_sweep_purges_expired() {
        let cache = HotCache::new(&TierConfig {
            capacity: 10,
            ttl_ms: 100,
        });
        put(&cache, "a", json!(1));
        put(&cache, "b", json!(2));

        let purged = cache.sweep(Instant::now() + Duration::from_millis(200));
        assert_eq!(purged, 2);
        assert!(cache.is_empty());
        assert_eq!(cache.stats().expirations, 2);
    }
}
