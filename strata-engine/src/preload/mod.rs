//! Intelligent Preloader
//!
//! Background task fed by tracker triggers. For every trigger it asks the
//! tracker for likely-next keys, drops the ones already cached or with a
//! pending write, and loads the rest into L2 with a `read_many` call.
//! Prefetch reads run as their own tasks, bounded by a concurrency limit that
//! halves when the store gets slow and creeps back up when it is fast.

use crate::batch::PendingIndex;
use crate::cache::TieredCache;
use crate::config::PreloaderConfig;
use crate::core::KeyLocks;
use crate::metrics;
use crate::store::StoreAdapter;
use crate::tracker::AccessTracker;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PreloadStats {
    pub triggers: u64,
    pub requested: u64,
    pub loaded: u64,
    /// Loaded from the store but not cached (already present or raced a write)
    pub skipped: u64,
    pub missing: u64,
    pub failed: u64,
    pub concurrency: usize,
}

#[derive(Default)]
struct Counters {
    triggers: AtomicU64,
    requested: AtomicU64,
    loaded: AtomicU64,
    skipped: AtomicU64,
    missing: AtomicU64,
    failed: AtomicU64,
}

/// Everything a prefetch task touches
pub struct PreloadContext {
    pub tracker: Arc<AccessTracker>,
    pub tiers: Arc<TieredCache>,
    pub locks: Arc<KeyLocks>,
    pub pending: Arc<PendingIndex>,
    pub store: Arc<dyn StoreAdapter>,
}

struct Shared {
    ctx: PreloadContext,
    limit: AtomicUsize,
    max_concurrency: usize,
    latency_backoff: Duration,
    read_timeout: Duration,
    counters: Counters,
}

pub struct Preloader {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Preloader {
    pub fn start(
        config: &PreloaderConfig,
        read_timeout: Duration,
        ctx: PreloadContext,
        triggers: mpsc::Receiver<String>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let max_concurrency = config.max_concurrency.max(1);
        metrics::PREFETCH_CONCURRENCY.set(max_concurrency as i64);
        let shared = Arc::new(Shared {
            ctx,
            limit: AtomicUsize::new(max_concurrency),
            max_concurrency,
            latency_backoff: Duration::from_millis(config.latency_backoff_ms),
            read_timeout,
            counters: Counters::default(),
        });

        let worker = tokio::spawn(Self::run(Arc::clone(&shared), triggers, shutdown));
        info!(
            "Preloader started (max concurrency {}, backoff above {}ms)",
            max_concurrency, config.latency_backoff_ms
        );

        Self {
            shared,
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.shared.limit.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> PreloadStats {
        let c = &self.shared.counters;
        PreloadStats {
            triggers: c.triggers.load(Ordering::Relaxed),
            requested: c.requested.load(Ordering::Relaxed),
            loaded: c.loaded.load(Ordering::Relaxed),
            skipped: c.skipped.load(Ordering::Relaxed),
            missing: c.missing.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            concurrency: self.concurrency(),
        }
    }

    /// Wait for the worker (and its aborted prefetches) to finish
    pub async fn join(&self) {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Preloader worker failed: {}", e);
            }
        }
    }

    async fn run(
        shared: Arc<Shared>,
        mut triggers: mpsc::Receiver<String>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut tasks = JoinSet::new();
        loop {
            let has_slot = tasks.len() < shared.limit.load(Ordering::Relaxed);
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
                trigger = triggers.recv(), if has_slot => {
                    let Some(key) = trigger else {
                        break;
                    };
                    shared.counters.triggers.fetch_add(1, Ordering::Relaxed);
                    let candidates = shared.candidates(&key);
                    if !candidates.is_empty() {
                        let shared = Arc::clone(&shared);
                        tasks.spawn(async move { shared.prefetch(candidates).await });
                    }
                }
            }
        }

        // prefetches are speculative: abandon whatever is still in flight
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
        debug!("Preloader worker exited");
    }
}

impl Shared {
    /// Predicted keys worth loading after an access to `key`
    fn candidates(&self, key: &str) -> Vec<String> {
        self.ctx
            .tracker
            .predict(key)
            .into_iter()
            .map(|p| p.key)
            .filter(|k| k != key)
            .filter(|k| self.ctx.tiers.locate(k).is_none() && !self.ctx.pending.is_pending(k))
            .collect()
    }

    async fn prefetch(&self, keys: Vec<String>) {
        let ctx = &self.ctx;
        let generations: Vec<u64> = keys.iter().map(|k| ctx.locks.generation(k)).collect();
        self.counters
            .requested
            .fetch_add(keys.len() as u64, Ordering::Relaxed);

        let read = tokio::time::timeout(self.read_timeout, ctx.store.read_many(&keys)).await;
        let timed = match read {
            Ok(Ok(timed)) => timed,
            Ok(Err(e)) => {
                debug!("Prefetch of {} keys failed: {}", keys.len(), e);
                self.record_failure(keys.len());
                return;
            }
            Err(_) => {
                debug!("Prefetch of {} keys timed out", keys.len());
                self.record_failure(keys.len());
                return;
            }
        };
        self.adjust(timed.latency);

        let mut found = timed.value;
        let (mut loaded, mut skipped, mut missing) = (0usize, 0usize, 0usize);
        for (key, generation) in keys.iter().zip(generations) {
            let Some(value) = found.remove(key) else {
                missing += 1;
                continue;
            };
            let guard = ctx.locks.lock(key);
            // a write landed while the read was in flight
            if guard.generation() != generation || ctx.pending.is_pending(key) {
                skipped += 1;
                continue;
            }
            if ctx.tiers.prefetch(key, value) {
                loaded += 1;
            } else {
                skipped += 1;
            }
        }

        let c = &self.counters;
        c.loaded.fetch_add(loaded as u64, Ordering::Relaxed);
        c.skipped.fetch_add(skipped as u64, Ordering::Relaxed);
        c.missing.fetch_add(missing as u64, Ordering::Relaxed);
        metrics::record_prefetch("loaded", loaded);
        metrics::record_prefetch("skipped", skipped);
        metrics::record_prefetch("missing", missing);
        debug!(
            "Prefetched {} keys into L2 ({} skipped, {} missing) in {:?}",
            loaded, skipped, missing, timed.latency
        );
    }

    fn record_failure(&self, count: usize) {
        self.counters
            .failed
            .fetch_add(count as u64, Ordering::Relaxed);
        metrics::record_prefetch("failed", count);
        // a failing store is treated like a slow one
        self.adjust(self.latency_backoff + Duration::from_millis(1));
    }

    /// Halve the limit on slow reads, grow it by one on fast ones
    fn adjust(&self, latency: Duration) {
        let slow = latency > self.latency_backoff;
        let previous = self
            .limit
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |limit| {
                Some(if slow {
                    (limit / 2).max(1)
                } else {
                    (limit + 1).min(self.max_concurrency)
                })
            })
            .unwrap_or_else(|limit| limit);
        let current = self.limit.load(Ordering::Acquire);
        if current != previous {
            debug!("Prefetch concurrency {} -> {}", previous, current);
        }
        metrics::PREFETCH_CONCURRENCY.set(current as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, TrackerConfig};
    use crate::core::{AccessEvent, Tier};
    use crate::store::MemoryStore;
    use serde_json::json;
    use tokio::time::Instant;

    struct Harness {
        tracker: Arc<AccessTracker>,
        tiers: Arc<TieredCache>,
        locks: Arc<KeyLocks>,
        pending: Arc<PendingIndex>,
        store: Arc<MemoryStore>,
        preloader: Preloader,
        shutdown: watch::Sender<bool>,
    }

    fn harness(config: PreloaderConfig) -> Harness {
        let tracker_config = TrackerConfig {
            min_confidence: 0.0,
            ..TrackerConfig::default()
        };
        let (tracker, triggers) = AccessTracker::new(&tracker_config);
        let tracker = Arc::new(tracker);
        let tiers = Arc::new(TieredCache::new(&CacheConfig::default()));
        let locks = Arc::new(KeyLocks::default());
        let pending = Arc::new(PendingIndex::new());
        let store = Arc::new(MemoryStore::new());
        let (shutdown, rx) = watch::channel(false);
        let preloader = Preloader::start(
            &config,
            Duration::from_secs(1),
            PreloadContext {
                tracker: Arc::clone(&tracker),
                tiers: Arc::clone(&tiers),
                locks: Arc::clone(&locks),
                pending: Arc::clone(&pending),
                store: store.clone(),
            },
            triggers,
            rx,
        );
        Harness {
            tracker,
            tiers,
            locks,
            pending,
            store,
            preloader,
            shutdown,
        }
    }

    fn teach(tracker: &AccessTracker, from: &str, to: &str) {
        tracker.record(AccessEvent::read(from));
        tracker.record(AccessEvent::read(to));
        tracker.ingest();
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        let started = Instant::now();
        while !condition() {
            assert!(started.elapsed() < Duration::from_secs(5));
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test]
    async fn test_predicted_key_lands_in_l2_only() {
        let h = harness(PreloaderConfig::default());
        h.store.insert("profile:1", json!({"bio": "hi"}));

        teach(&h.tracker, "user:1", "profile:1");
        wait_for(|| h.preloader.stats().loaded == 1).await;

        assert_eq!(h.tiers.locate("profile:1"), Some(Tier::L2));
        assert!(h.tiers.l1().is_empty());

        h.shutdown.send(true).unwrap();
        h.preloader.join().await;
    }

    #[tokio::test]
    async fn test_pending_keys_are_not_prefetched() {
        let h = harness(PreloaderConfig::default());
        h.store.insert("profile:1", json!("stale"));
        h.pending.add("profile:1");

        teach(&h.tracker, "user:1", "profile:1");
        wait_for(|| h.preloader.stats().triggers >= 2).await;

        assert_eq!(h.tiers.locate("profile:1"), None);
        assert_eq!(h.preloader.stats().requested, 0);
        h.shutdown.send(true).unwrap();
        h.preloader.join().await;
    }

    #[tokio::test]
    async fn test_slow_store_halves_concurrency() {
        let h = harness(PreloaderConfig {
            enabled: true,
            max_concurrency: 8,
            latency_backoff_ms: 5,
        });
        h.store.insert("b", json!(1));
        h.store.set_read_latency(Duration::from_millis(20));

        teach(&h.tracker, "a", "b");
        wait_for(|| h.preloader.stats().loaded == 1).await;
        assert_eq!(h.preloader.concurrency(), 4);

        h.shutdown.send(true).unwrap();
        h.preloader.join().await;
    }

    #[tokio::test]
    async fn test_unavailable_store_counts_failures() {
        let h = harness(PreloaderConfig::default());
        h.store.set_available(false);

        teach(&h.tracker, "a", "b");
        wait_for(|| h.preloader.stats().failed == 1).await;
        assert_eq!(h.tiers.locate("b"), None);

        h.shutdown.send(true).unwrap();
        h.preloader.join().await;
    }

    #[tokio::test]
    async fn test_delete_during_prefetch_read_is_not_cached() {
        let h = harness(PreloaderConfig::default());
        h.store.insert("profile:1", json!("old"));
        h.store.set_read_latency(Duration::from_millis(200));

        teach(&h.tracker, "user:1", "profile:1");
        wait_for(|| h.preloader.stats().requested == 1).await;
        {
            let guard = h.locks.lock("profile:1");
            h.tiers.invalidate("profile:1");
            guard.bump();
        }

        wait_for(|| h.preloader.stats().skipped == 1).await;
        assert_eq!(h.preloader.stats().loaded, 0);
        assert_eq!(h.tiers.locate("profile:1"), None);

        h.shutdown.send(true).unwrap();
        h.preloader.join().await;
    }

    #[tokio::test]
    async fn test_write_pending_after_prefetch_read_is_not_cached() {
        let h = harness(PreloaderConfig::default());
        h.store.insert("profile:1", json!("old"));
        h.store.set_read_latency(Duration::from_millis(200));

        teach(&h.tracker, "user:1", "profile:1");
        wait_for(|| h.preloader.stats().requested == 1).await;
        // a set that is still buffered and no longer cached
        h.pending.add("profile:1");

        wait_for(|| h.preloader.stats().skipped == 1).await;
        assert_eq!(h.tiers.locate("profile:1"), None);
        assert!(h.tiers.l2().is_empty());

        h.shutdown.send(true).unwrap();
        h.preloader.join().await;
    }
}
