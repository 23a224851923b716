//! L2 Warm Cache
//!
//! Larger, longer-lived tier. Receives entries demoted from L1 and
//! speculative prefetches. Reads take the entry out (promotion to L1 is done
//! by the caller); capacity evictions are terminal.

use super::lru::LruTable;
use super::{TierCounters, TierStats};
use crate::config::TierConfig;
use crate::core::{CacheEntry, Tier};
use crate::metrics;
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::Instant;
use tracing::{debug, error};

pub struct WarmCache {
    table: Mutex<LruTable>,
    counters: TierCounters,
    /// Prefetched entries inserted
    preloaded: AtomicU64,
    /// Prefetched entries later read by a caller
    preload_hits: AtomicU64,
}

impl WarmCache {
    pub fn new(config: &TierConfig) -> Self {
        Self {
            table: Mutex::new(LruTable::new(config.capacity, config.ttl(), Tier::L2)),
            counters: TierCounters::default(),
            preloaded: AtomicU64::new(0),
            preload_hits: AtomicU64::new(0),
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

    /// Fraction of prefetched entries that were read before leaving the cache
    pub fn preload_accuracy(&self) -> f64 {
        let preloaded = self.preloaded.load(Ordering::Relaxed);
        if preloaded == 0 {
            return 0.0;
        }
        self.preload_hits.load(Ordering::Relaxed) as f64 / preloaded as f64
    }

    /// Purge expired entries and verify the table; a corrupted table is
    /// rebuilt empty.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut table = self.table.lock();
        let purged = table.purge_expired(now);
        self.counters.record_expired(purged);
        if let Err(reason) = table.check_integrity() {
            error!("L2 cache corrupted ({}), rebuilding empty", reason);
            table.clear();
            self.counters.rebuilds.fetch_add(1, Ordering::Relaxed);
            metrics::CACHE_REBUILDS_TOTAL
                .with_label_values(&[Tier::L2.as_str()])
                .inc();
        }
        purged
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, LruTable> {
        self.table.lock()
    }

    /// Remove and return a live entry (promotion)
    pub(crate) fn take_locked(&self, table: &mut LruTable, key: &str) -> Option<CacheEntry> {
        let entry = table.take(key, Instant::now());
        self.record_lookup(entry.is_some());
        if let Some(entry) = &entry {
            if entry.prefetched {
                self.preload_hits.fetch_add(1, Ordering::Relaxed);
            }
            debug!("L2 Cache HIT for key: {}", key);
        }
        entry
    }

    /// Insert an entry; evictions are dropped
    pub(crate) fn insert_locked(&self, table: &mut LruTable, entry: CacheEntry, now: Instant) {
        if entry.prefetched {
            self.preloaded.fetch_add(1, Ordering::Relaxed);
        }
        let outcome = table.insert(entry, now);
        self.counters.record_insert(&outcome);
        metrics::record_evictions(Tier::L2.as_str(), outcome.evicted.len());
        for victim in &outcome.evicted {
            debug!("L2 Cache EVICT: {}", victim.key);
        }
    }

    fn record_lookup(&self, hit: bool) {
        if hit {
            self.counters.record_hit();
        } else {
            self.counters.record_miss();
        }
        metrics::record_lookup(Tier::L2.as_str(), hit);
    }
}
