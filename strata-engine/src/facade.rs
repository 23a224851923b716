//! Unified Query Façade
//!
//! [`Strata`] is the only entry point collaborators use. It owns the cache
//! tiers, the tracker, the preloader, the batch scheduler and the TTL sweeper,
//! and serializes mutations of each key through striped key locks.

use crate::batch::{BatchScheduler, ErrorSink, PendingIndex, SchedulerStats, TracingErrorSink};
use crate::cache::{CacheLookup, TierStats, TieredCache};
use crate::config::StrataConfig;
use crate::core::{AccessEvent, FailedWrite, KeyLocks, Result, StrataError, Value, WriteOp};
use crate::metrics;
use crate::preload::{PreloadContext, PreloadStats, Preloader};
use crate::registry::{FieldRegistry, Query};
use crate::store::{LogStore, RetryPolicy, StoreAdapter, StoreError, with_retry};
use crate::tracker::{AccessTracker, TrackerStats};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Engine statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrataStats {
    pub l1_hit_rate: f64,
    pub l2_hit_rate: f64,
    pub avg_flush_latency_ms: f64,
    pub pending_write_count: usize,
    pub preload_accuracy: f64,
    pub store_reads: u64,
    pub store_read_failures: u64,
    pub l1: TierStats,
    pub l2: TierStats,
    pub scheduler: SchedulerStats,
    pub tracker: TrackerStats,
    pub preloader: Option<PreloadStats>,
}

/// Invalidates the cached value of a write that will never reach the store,
/// then forwards the failure.
struct InvalidatingSink {
    tiers: Arc<TieredCache>,
    locks: Arc<KeyLocks>,
    pending: Arc<PendingIndex>,
    inner: Arc<dyn ErrorSink>,
}

impl ErrorSink for InvalidatingSink {
    fn report(&self, failure: &FailedWrite) {
        if !failure.superseded {
            let key = failure.op.key();
            let guard = self.locks.lock(key);
            if !self.pending.is_pending(key) {
                self.tiers.invalidate(key);
                guard.bump();
                debug!("Invalidated {} after failed write", key);
            }
        }
        self.inner.report(failure);
    }
}

pub struct Strata {
    tiers: Arc<TieredCache>,
    locks: Arc<KeyLocks>,
    pending: Arc<PendingIndex>,
    store: Arc<dyn StoreAdapter>,
    registry: FieldRegistry,
    tracker: Arc<AccessTracker>,
    preloader: Option<Preloader>,
    scheduler: BatchScheduler,
    read_policy: RetryPolicy,
    shutdown_tx: watch::Sender<bool>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    store_reads: AtomicU64,
    store_read_failures: AtomicU64,
}

impl Strata {
    /// Engine with an empty field registry that logs write failures
    pub fn new(config: StrataConfig, store: Arc<dyn StoreAdapter>) -> Result<Self> {
        Self::with_parts(
            config,
            store,
            FieldRegistry::new(),
            Arc::new(TracingErrorSink),
        )
    }

    /// Engine backed by the on-disk log store under `store.data_dir`
    pub async fn open(config: StrataConfig, registry: FieldRegistry) -> Result<(Self, Arc<LogStore>)> {
        config.validate()?;
        let store = Arc::new(LogStore::open(&config.store.data_dir, config.store.fsync).await?);
        let engine = Self::with_parts(
            config,
            store.clone(),
            registry,
            Arc::new(TracingErrorSink),
        )?;
        Ok((engine, store))
    }

    /// Build the engine and spawn its background tasks on the current runtime
    pub fn with_parts(
        config: StrataConfig,
        store: Arc<dyn StoreAdapter>,
        registry: FieldRegistry,
        sink: Arc<dyn ErrorSink>,
    ) -> Result<Self> {
        config.validate()?;

        let tiers = Arc::new(TieredCache::new(&config.cache));
        let locks = Arc::new(KeyLocks::new(config.cache.key_stripes));
        let pending = Arc::new(PendingIndex::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let (tracker, triggers) = AccessTracker::start(&config.tracker, shutdown_rx.clone());
        let tracker = Arc::new(tracker);

        let read_timeout = Duration::from_millis(config.store.read_timeout_ms);
        let preloader = if config.preloader.enabled {
            Some(Preloader::start(
                &config.preloader,
                read_timeout,
                PreloadContext {
                    tracker: Arc::clone(&tracker),
                    tiers: Arc::clone(&tiers),
                    locks: Arc::clone(&locks),
                    pending: Arc::clone(&pending),
                    store: Arc::clone(&store),
                },
                triggers,
                shutdown_rx.clone(),
            ))
        } else {
            // closing the receiver turns tracker triggers into no-ops
            drop(triggers);
            None
        };

        let sink = Arc::new(InvalidatingSink {
            tiers: Arc::clone(&tiers),
            locks: Arc::clone(&locks),
            pending: Arc::clone(&pending),
            inner: sink,
        });
        let scheduler = BatchScheduler::start(
            &config.scheduler,
            Arc::clone(&store),
            sink,
            Arc::clone(&pending),
        );

        let sweeper = Self::start_sweeper(
            Arc::clone(&tiers),
            Duration::from_millis(config.cache.sweep_interval_ms),
            shutdown_rx,
        );

        info!(
            "Strata engine started on {} store (L1 {}, L2 {}, preloader {})",
            store.name(),
            config.cache.l1.capacity,
            config.cache.l2.capacity,
            if config.preloader.enabled { "on" } else { "off" }
        );

        Ok(Self {
            tiers,
            locks,
            pending,
            store,
            registry,
            tracker,
            preloader,
            scheduler,
            read_policy: RetryPolicy {
                max_retries: config.store.read_retry_attempts,
                backoff_base: Duration::from_millis(config.store.read_backoff_ms),
                backoff_max: Duration::from_millis(config.store.read_backoff_ms.saturating_mul(16)),
                attempt_timeout: Some(read_timeout),
            },
            shutdown_tx,
            sweeper: Mutex::new(Some(sweeper)),
            closed: AtomicBool::new(false),
            store_reads: AtomicU64::new(0),
            store_read_failures: AtomicU64::new(0),
        })
    }

    /// Periodic expiry sweep and integrity check of both tiers
    fn start_sweeper(
        tiers: Arc<TieredCache>,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let (l1, l2) = tiers.sweep();
                        if l1 + l2 > 0 {
                            debug!("TTL sweep removed {} L1 and {} L2 entries", l1, l2);
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Read a key: L1, then L2 (promoting), then the store.
    /// A key absent everywhere is `Ok(None)`.
    pub async fn get(&self, key: &str) -> Result<Option<Value>> {
        self.check(key)?;
        let value = match self.tiers.get(key) {
            CacheLookup::L1(value) => {
                debug!("L1 Cache HIT for key: {}", key);
                Some(value)
            }
            CacheLookup::L2(value) => Some(value),
            CacheLookup::Miss => self.read_through(key).await?,
        };
        self.tracker.record(AccessEvent::read(key));
        Ok(value)
    }

    /// Write a value: invalidate, write through to L1 and buffer the store
    /// write. Returns before the write reaches the store.
    pub fn set(&self, key: &str, value: Value) -> Result<()> {
        self.check(key)?;
        let guard = self.locks.lock(key);
        self.tiers.invalidate(key);
        self.tiers.write_through(key, value.clone());
        let queued = self.scheduler.enqueue(WriteOp::Upsert {
            key: key.to_string(),
            value,
        });
        if queued.is_err() {
            self.tiers.invalidate(key);
        }
        guard.bump();
        drop(guard);
        self.tracker.record(AccessEvent::write(key));
        queued
    }

    /// `set` that resolves once the write is durably applied or has failed
    pub async fn set_durable(&self, key: &str, value: Value) -> Result<()> {
        self.check(key)?;
        let waiter = {
            let guard = self.locks.lock(key);
            self.tiers.invalidate(key);
            self.tiers.write_through(key, value.clone());
            let queued = self.scheduler.enqueue_durable(WriteOp::Upsert {
                key: key.to_string(),
                value,
            });
            if queued.is_err() {
                self.tiers.invalidate(key);
            }
            guard.bump();
            queued?
        };
        self.tracker.record(AccessEvent::write(key));
        waiter.await.map_err(|_| StrataError::Shutdown)?
    }

    /// Remove a key from both tiers and buffer the store delete
    pub fn delete(&self, key: &str) -> Result<()> {
        self.check(key)?;
        let guard = self.locks.lock(key);
        self.tiers.invalidate(key);
        let queued = self.scheduler.enqueue(WriteOp::Delete {
            key: key.to_string(),
        });
        guard.bump();
        drop(guard);
        self.tracker.record(AccessEvent::delete(key));
        queued
    }

    /// `delete` that resolves once the delete is applied or has failed
    pub async fn delete_durable(&self, key: &str) -> Result<()> {
        self.check(key)?;
        let waiter = {
            let guard = self.locks.lock(key);
            self.tiers.invalidate(key);
            let queued = self.scheduler.enqueue_durable(WriteOp::Delete {
                key: key.to_string(),
            });
            guard.bump();
            queued?
        };
        self.tracker.record(AccessEvent::delete(key));
        waiter.await.map_err(|_| StrataError::Shutdown)?
    }

    /// Flush every buffered write, then read `key` from the store.
    /// Fails with `FlushFailure` if the key's last write could not be applied.
    pub async fn force_consistent_read(&self, key: &str) -> Result<Option<Value>> {
        self.check(key)?;
        self.scheduler.flush().await?;
        if let Some(failure) = self.scheduler.take_failure(key) {
            return Err(StrataError::FlushFailure {
                key: key.to_string(),
                attempts: failure.attempts,
                reason: failure.reason,
            });
        }
        let value = self.load(key).await?;
        self.tracker.record(AccessEvent::read(key));
        Ok(value)
    }

    /// Simple-filter lookup over committed store state
    pub async fn query(&self, query: &Query) -> Result<Vec<(String, Value)>> {
        self.ensure_open()?;
        let filter = self.registry.compile(query)?;
        let timed = with_retry(&self.read_policy, "store query", || {
            self.store.query(&filter)
        })
        .await
        .map_err(read_error)?;
        debug!(
            "Query on {} returned {} rows in {:?}",
            filter.kind(),
            timed.value.len(),
            timed.latency
        );
        Ok(timed.value)
    }

    /// Flush buffered writes; resolves after this and every earlier flush
    pub async fn flush(&self) -> Result<()> {
        self.scheduler.flush().await
    }

    pub fn registry(&self) -> &FieldRegistry {
        &self.registry
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.pending.is_pending(key)
    }

    pub fn stats(&self) -> StrataStats {
        let (l1, l2) = self.tiers.stats();
        let scheduler = self.scheduler.stats();
        StrataStats {
            l1_hit_rate: l1.hit_rate,
            l2_hit_rate: l2.hit_rate,
            avg_flush_latency_ms: scheduler.avg_flush_latency_ms,
            pending_write_count: scheduler.pending,
            preload_accuracy: self.tiers.l2().preload_accuracy(),
            store_reads: self.store_reads.load(Ordering::Relaxed),
            store_read_failures: self.store_read_failures.load(Ordering::Relaxed),
            l1,
            l2,
            scheduler,
            tracker: self.tracker.stats(),
            preloader: self.preloader.as_ref().map(Preloader::stats),
        }
    }

    /// Flush pending writes and stop every background task
    pub async fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("Shutting down Strata engine");
        let flushed = self.scheduler.shutdown().await;
        let _ = self.shutdown_tx.send(true);

        self.tracker.join().await;
        if let Some(preloader) = &self.preloader {
            preloader.join().await;
        }
        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            if let Err(e) = sweeper.await {
                warn!("TTL sweeper failed: {}", e);
            }
        }
        info!("Strata engine stopped");
        flushed
    }

    async fn read_through(&self, key: &str) -> Result<Option<Value>> {
        // a buffered write is newer than anything the store holds
        if let Some(op) = self.scheduler.latest_pending(key) {
            return Ok(match op {
                WriteOp::Upsert { value, .. } => Some(value),
                WriteOp::Delete { .. } => None,
            });
        }
        self.load(key).await
    }

    /// Store read; caches the result in L1 unless a write to the key
    /// happened meanwhile or is still pending.
    async fn load(&self, key: &str) -> Result<Option<Value>> {
        let generation = self.locks.generation(key);
        let started = Instant::now();
        self.store_reads.fetch_add(1, Ordering::Relaxed);

        let timed = with_retry(&self.read_policy, "store read", || self.store.read_one(key))
            .await
            .map_err(|e| {
                self.store_read_failures.fetch_add(1, Ordering::Relaxed);
                read_error(e)
            })?;
        metrics::record_lookup("store", timed.value.is_some());

        if let Some(value) = &timed.value {
            let guard = self.locks.lock(key);
            if guard.generation() == generation && !self.pending.is_pending(key) {
                self.tiers.write_through(key, value.clone());
            } else {
                debug!("Skipped caching {}: written during store read", key);
            }
        }
        debug!(
            "Store read for key: {} ({}) in {:?}",
            key,
            if timed.value.is_some() { "found" } else { "absent" },
            started.elapsed()
        );
        Ok(timed.value)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(StrataError::Shutdown)
        } else {
            Ok(())
        }
    }

    fn check(&self, key: &str) -> Result<()> {
        self.ensure_open()?;
        if key.is_empty() {
            return Err(StrataError::InvalidKey("key must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Exhausted transient failures mean the store is unavailable; anything
/// else is a permanent store error.
fn read_error(e: StoreError) -> StrataError {
    if e.is_retryable() {
        StrataError::StoreUnavailable(e.to_string())
    } else {
        StrataError::Store(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn config() -> StrataConfig {
        let mut config = StrataConfig::default();
        config.preloader.enabled = false;
        config.scheduler.min_batch_size = 1_000;
        config.scheduler.max_batch_size = 1_000;
        config.scheduler.min_flush_delay_ms = 60_000;
        config.scheduler.max_flush_delay_ms = 60_000;
        config.store.read_backoff_ms = 1;
        config
    }

    #[tokio::test]
    async fn test_get_miss_is_none() {
        let engine = Strata::new(config(), Arc::new(MemoryStore::new())).unwrap();
        assert_eq!(engine.get("user:404").await.unwrap(), None);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_read_through_populates_l1() {
        let store = Arc::new(MemoryStore::new());
        store.insert("user:1", json!({"name": "ana"}));
        let engine = Strata::new(config(), store.clone()).unwrap();

        assert_eq!(
            engine.get("user:1").await.unwrap(),
            Some(json!({"name": "ana"}))
        );
        assert_eq!(engine.get("user:1").await.unwrap(), Some(json!({"name": "ana"})));
        assert_eq!(store.read_count(), 1);
        assert!(engine.stats().l1_hit_rate > 0.0);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_hides_value_before_flush() {
        let store = Arc::new(MemoryStore::new());
        store.insert("user:1", json!(1));
        let engine = Strata::new(config(), store.clone()).unwrap();

        engine.delete("user:1").unwrap();
        assert_eq!(engine.get("user:1").await.unwrap(), None);
        assert_eq!(store.peek("user:1"), Some(json!(1)));

        engine.flush().await.unwrap();
        assert_eq!(store.peek("user:1"), None);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unavailable_is_not_a_miss() {
        let store = Arc::new(MemoryStore::new());
        store.set_available(false);
        let engine = Strata::new(config(), store.clone()).unwrap();

        let err = engine.get("user:1").await.unwrap_err();
        assert!(err.is_unavailable());
        // first attempt plus the configured retries
        assert_eq!(store.read_count(), 3);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_operations_after_shutdown_fail() {
        let engine = Strata::new(config(), Arc::new(MemoryStore::new())).unwrap();
        engine.shutdown().await.unwrap();

        assert!(matches!(engine.set("k", json!(1)), Err(StrataError::Shutdown)));
        assert!(matches!(engine.get("k").await, Err(StrataError::Shutdown)));
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_config_is_fatal() {
        let mut config = config();
        config.cache.l1.capacity = 0;
        let result = Strata::new(config, Arc::new(MemoryStore::new()));
        assert!(matches!(result, Err(StrataError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_empty_key_rejected() {
        let engine = Strata::new(config(), Arc::new(MemoryStore::new())).unwrap();
        assert!(matches!(engine.set("", json!(1)), Err(StrataError::InvalidKey(_))));
        engine.shutdown().await.unwrap();
    }
}
