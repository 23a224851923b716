//! Cache Module
//!
//! Two in-process tiers in front of the store:
//! - L1: small hot cache, TTL + LRU, demotes its victims into L2
//! - L2: larger warm cache with a longer TTL, fed by L1 overflow and by
//!   the preloader; its evictions are terminal
//!
//! `TieredCache` owns both and keeps a key in at most one of them.

pub mod l1;
pub mod l2;
pub mod lru;
pub mod tiered;

pub use l1::HotCache;
pub use l2::WarmCache;
pub use lru::{InsertOutcome, LruTable};
pub use tiered::{CacheLookup, TieredCache};

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-tier counters
#[derive(Debug, Default)]
pub struct TierCounters {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
    pub expirations: AtomicU64,
    pub inserts: AtomicU64,
    pub rebuilds: AtomicU64,
}

impl TierCounters {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_insert(&self, outcome: &InsertOutcome) {
        self.inserts.fetch_add(1, Ordering::Relaxed);
        self.evictions
            .fetch_add(outcome.evicted.len() as u64, Ordering::Relaxed);
        self.expirations
            .fetch_add(outcome.expired as u64, Ordering::Relaxed);
    }

    pub fn record_expired(&self, count: usize) {
        self.expirations.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self, entries: usize, capacity: usize) -> TierStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        TierStats {
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            rebuilds: self.rebuilds.load(Ordering::Relaxed),
            entries,
            capacity,
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
        }
    }
}

/// Tier statistics snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TierStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub inserts: u64,
    pub rebuilds: u64,
    pub entries: usize,
    pub capacity: usize,
    pub hit_rate: f64,
}
