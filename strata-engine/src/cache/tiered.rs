//! Coordinated L1/L2 access
//!
//! Operations that touch both tiers take the L1 lock first, then the L2 lock.
//! Promotion, demotion, write-through and invalidation are therefore atomic
//! with respect to each other, and a key is never visible in both tiers.

use super::lru::LruTable;
use super::{HotCache, TierStats, WarmCache};
use crate::config::CacheConfig;
use crate::core::{CacheEntry, Tier, Value};
use tokio::time::Instant;
use tracing::debug;

/// Where a lookup was served from
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    L1(Value),
    /// L2 hit, already promoted into L1
    L2(Value),
    Miss,
}

pub struct TieredCache {
    l1: HotCache,
    l2: WarmCache,
}

impl TieredCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            l1: HotCache::new(&config.l1),
            l2: WarmCache::new(&config.l2),
        }
    }

    /// L1 lookup, falling back to L2 with promotion-on-read
    pub fn get(&self, key: &str) -> CacheLookup {
        let now = Instant::now();
        let mut l1 = self.l1.lock();
        if let Some(entry) = l1.get(key, now) {
            let value = entry.value.clone();
            self.l1.record_lookup(key, true);
            return CacheLookup::L1(value);
        }
        self.l1.record_lookup(key, false);

        let mut l2 = self.l2.lock();
        let Some(mut entry) = self.l2.take_locked(&mut l2, key) else {
            return CacheLookup::Miss;
        };
        entry.prefetched = false;
        let value = entry.value.clone();
        let victims = self.l1.insert_entry_locked(&mut l1, entry, now);
        self.demote_locked(&mut l2, victims, now);
        debug!("Promoted {} from L2 to L1", key);
        CacheLookup::L2(value)
    }

    /// Replace whatever is cached for `key` with `value` in L1
    pub fn write_through(&self, key: &str, value: Value) {
        let now = Instant::now();
        let mut l1 = self.l1.lock();
        let mut l2 = self.l2.lock();
        l2.remove(key);
        let entry = CacheEntry::new(key.to_string(), value, Tier::L1, l1.ttl(), now);
        let victims = self.l1.insert_entry_locked(&mut l1, entry, now);
        self.demote_locked(&mut l2, victims, now);
    }

    /// Drop `key` from both tiers; true if any tier held it
    pub fn invalidate(&self, key: &str) -> bool {
        let mut l1 = self.l1.lock();
        let mut l2 = self.l2.lock();
        let in_l1 = l1.remove(key).is_some();
        let in_l2 = l2.remove(key).is_some();
        in_l1 || in_l2
    }

    /// Insert a speculative entry into L2 unless the key is already cached.
    /// Never touches L1.
    pub fn prefetch(&self, key: &str, value: Value) -> bool {
        let now = Instant::now();
        let l1 = self.l1.lock();
        let mut l2 = self.l2.lock();
        if l1.contains(key, now) || l2.contains(key, now) {
            return false;
        }
        let mut entry = CacheEntry::new(key.to_string(), value, Tier::L2, l2.ttl(), now);
        entry.prefetched = true;
        self.l2.insert_locked(&mut l2, entry, now);
        true
    }

    /// Tier currently holding a live entry for `key`
    pub fn locate(&self, key: &str) -> Option<Tier> {
        let now = Instant::now();
        let l1 = self.l1.lock();
        if l1.contains(key, now) {
            return Some(Tier::L1);
        }
        let l2 = self.l2.lock();
        l2.contains(key, now).then_some(Tier::L2)
    }

    /// Proactive expiry sweep of both tiers
    pub fn sweep(&self) -> (usize, usize) {
        let now = Instant::now();
        (self.l1.sweep(now), self.l2.sweep(now))
    }

    pub fn l1(&self) -> &HotCache {
        &self.l1
    }

    pub fn l2(&self) -> &WarmCache {
        &self.l2
    }

    pub fn stats(&self) -> (TierStats, TierStats) {
        (self.l1.stats(), self.l2.stats())
    }

    fn demote_locked(&self, l2: &mut LruTable, victims: Vec<CacheEntry>, now: Instant) {
        for mut victim in victims {
            debug!("Demoting {} from L1 to L2", victim.key);
            victim.prefetched = false;
            self.l2.insert_locked(l2, victim, now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TierConfig;
    use serde_json::json;

    fn tiers(l1: usize, l2: usize) -> TieredCache {
        TieredCache::new(&CacheConfig {
            l1: TierConfig {
                capacity: l1,
                ttl_ms: 60_000,
            },
            l2: TierConfig {
                capacity: l2,
                ttl_ms: 600_000,
            },
            ..CacheConfig::default()
        })
    }

    #[test]
    fn test_l1_victim_demoted_to_l2() {
        let cache = tiers(2, 10);
        cache.write_through("A", json!("a"));
        cache.write_through("B", json!("b"));
        cache.write_through("C", json!("c"));

        assert_eq!(cache.locate("A"), Some(Tier::L2));
        assert_eq!(cache.locate("B"), Some(Tier::L1));
        assert_eq!(cache.locate("C"), Some(Tier::L1));
    }

    #[test]
    fn test_promotion_keeps_single_tier() {
        let cache = tiers(2, 10);
        cache.write_through("A", json!("a"));
        cache.write_through("B", json!("b"));
        cache.write_through("C", json!("c"));

        assert_eq!(cache.get("A"), CacheLookup::L2(json!("a")));
        assert_eq!(cache.locate("A"), Some(Tier::L1));
        // B was the LRU entry of L1 and moved down
        assert_eq!(cache.locate("B"), Some(Tier::L2));
        assert!(!cache.l2().contains("A"));
        assert_eq!(cache.get("A"), CacheLookup::L1(json!("a")));
    }

    #[test]
    fn test_write_through_replaces_l2_copy() {
        let cache = tiers(1, 10);
        cache.write_through("A", json!(1));
        cache.write_through("B", json!(2));
        assert_eq!(cache.locate("A"), Some(Tier::L2));

        cache.write_through("A", json!(3));
        assert_eq!(cache.get("A"), CacheLookup::L1(json!(3)));
        assert_eq!(cache.l2().len(), 1);
        assert!(cache.l2().contains("B"));
    }

    #[test]
    fn test_invalidate_both_tiers() {
        let cache = tiers(1, 10);
        cache.write_through("A", json!(1));
        cache.write_through("B", json!(2));

        assert!(cache.invalidate("A"));
        assert!(cache.invalidate("B"));
        assert!(!cache.invalidate("A"));
        assert_eq!(cache.get("A"), CacheLookup::Miss);
    }

    #[test]
    fn test_prefetch_only_fills_l2() {
        let cache = tiers(2, 10);
        cache.write_through("hot", json!("h"));

        assert!(!cache.prefetch("hot", json!("stale")));
        assert!(cache.prefetch("warm", json!("w")));
        assert_eq!(cache.locate("warm"), Some(Tier::L2));
        assert_eq!(cache.l1().len(), 1);

        assert_eq!(cache.get("warm"), CacheLookup::L2(json!("w")));
        assert_eq!(cache.l2().preload_accuracy(), 1.0);
    }
}
