//! Access Pattern Tracker
//!
//! Callers push access events into a bounded ring without waiting; a worker
//! task drains the ring into a [`PatternTable`] and forwards the keys it just
//! learned about to the preloader as prefetch triggers.

pub mod pattern;

pub use pattern::{PatternTable, Prediction};

use crate::config::TrackerConfig;
use crate::core::{AccessEvent, AccessKind};
use crate::metrics;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackerStats {
    pub tracked_keys: usize,
    pub tracked_pairs: usize,
    pub ingested: u64,
    pub dropped: u64,
    pub triggers_dropped: u64,
    pub queued: usize,
}

struct Shared {
    queue: Mutex<VecDeque<AccessEvent>>,
    capacity: usize,
    wake: Notify,
    table: RwLock<PatternTable>,
    triggers: mpsc::Sender<String>,
    ingested: AtomicU64,
    dropped: AtomicU64,
    triggers_dropped: AtomicU64,
    prediction_limit: usize,
    min_confidence: f64,
}

pub struct AccessTracker {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AccessTracker {
    /// Build the tracker without a worker; `ingest` must be driven by hand.
    /// Returns the receiving end of the prefetch trigger channel.
    pub fn new(config: &TrackerConfig) -> (Self, mpsc::Receiver<String>) {
        let (triggers, rx) = mpsc::channel(config.trigger_capacity.max(1));
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::with_capacity(config.queue_capacity.min(1_024))),
            capacity: config.queue_capacity.max(1),
            wake: Notify::new(),
            table: RwLock::new(PatternTable::new(
                Duration::from_millis(config.half_life_ms),
                Duration::from_millis(config.cooccurrence_window_ms),
                config.max_pairs,
                config.max_keys,
            )),
            triggers,
            ingested: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            triggers_dropped: AtomicU64::new(0),
            prediction_limit: config.prediction_limit,
            min_confidence: config.min_confidence,
        });
        (
            Self {
                shared,
                worker: Mutex::new(None),
            },
            rx,
        )
    }

    /// Build the tracker and spawn its worker, which stops on `shutdown`
    pub fn start(
        config: &TrackerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, mpsc::Receiver<String>) {
        let (tracker, rx) = Self::new(config);
        let handle = tokio::spawn(Self::worker_loop(Arc::clone(&tracker.shared), shutdown));
        *tracker.worker.lock() = Some(handle);
        info!(
            "Access tracker started (queue {}, window {}ms)",
            config.queue_capacity, config.cooccurrence_window_ms
        );
        (tracker, rx)
    }

    /// Enqueue an event; drops the oldest queued event when full
    pub fn record(&self, event: AccessEvent) {
        let mut queue = self.shared.queue.lock();
        if queue.len() >= self.shared.capacity {
            queue.pop_front();
            let dropped = self.shared.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            metrics::TRACKER_DROPPED_TOTAL.inc();
            if dropped.is_power_of_two() {
                warn!("Access tracker overloaded, {} events dropped so far", dropped);
            }
        }
        queue.push_back(event);
        drop(queue);
        self.shared.wake.notify_one();
    }

    /// Drain the queue into the pattern table; returns events processed
    pub fn ingest(&self) -> usize {
        self.shared.ingest()
    }

    /// Ranked likely-next keys after an access to `key`
    pub fn predict(&self, key: &str) -> Vec<Prediction> {
        self.shared.table.read().predict(
            key,
            self.shared.prediction_limit,
            self.shared.min_confidence,
            Instant::now(),
        )
    }

    pub fn stats(&self) -> TrackerStats {
        let table = self.shared.table.read();
        TrackerStats {
            tracked_keys: table.key_count(),
            tracked_pairs: table.pair_count(),
            ingested: self.shared.ingested.load(Ordering::Relaxed),
            dropped: self.shared.dropped.load(Ordering::Relaxed),
            triggers_dropped: self.shared.triggers_dropped.load(Ordering::Relaxed),
            queued: self.shared.queue.lock().len(),
        }
    }

    /// Wait for the worker to exit after the shutdown signal
    pub async fn join(&self) {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Access tracker worker failed: {}", e);
            }
        }
    }

    async fn worker_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shared.wake.notified() => {
                    shared.ingest();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Access tracker worker exited");
    }
}

impl Shared {
    fn ingest(&self) -> usize {
        let events = std::mem::take(&mut *self.queue.lock());
        if events.is_empty() {
            return 0;
        }

        let mut read_keys: Vec<String> = Vec::new();
        let mut seen = HashSet::new();
        {
            let mut table = self.table.write();
            for event in &events {
                match event.kind {
                    AccessKind::Read | AccessKind::Write => table.record(&event.key, event.at),
                    AccessKind::Delete => table.forget(&event.key),
                }
                if event.kind == AccessKind::Read && seen.insert(event.key.as_str()) {
                    read_keys.push(event.key.clone());
                }
            }
        }
        self.ingested
            .fetch_add(events.len() as u64, Ordering::Relaxed);

        for key in read_keys {
            match self.triggers.try_send(key) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.triggers_dropped.fetch_add(1, Ordering::Relaxed);
                }
                // no preloader listening
                Err(mpsc::error::TrySendError::Closed(_)) => break,
            }
        }
        events.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(queue_capacity: usize) -> TrackerConfig {
        TrackerConfig {
            queue_capacity,
            min_confidence: 0.0,
            trigger_capacity: 4,
            ..TrackerConfig::default()
        }
    }

    fn event(key: &str, at: Instant, kind: AccessKind) -> AccessEvent {
        AccessEvent {
            key: key.to_string(),
            at,
            kind,
        }
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest() {
        let (tracker, _rx) = AccessTracker::new(&config(3));
        let now = Instant::now();
        for key in ["a", "b", "c", "d", "e"] {
            tracker.record(event(key, now, AccessKind::Read));
        }

        let stats = tracker.stats();
        assert_eq!(stats.dropped, 2);
        assert_eq!(stats.queued, 3);
        assert_eq!(tracker.ingest(), 3);
        assert_eq!(tracker.stats().tracked_keys, 3);
    }

    #[tokio::test]
    async fn test_ingest_learns_and_triggers() {
        let (tracker, mut rx) = AccessTracker::new(&config(100));
        let now = Instant::now();
        tracker.record(event("user:1", now, AccessKind::Read));
        tracker.record(event("profile:1", now, AccessKind::Read));
        tracker.record(event("user:1", now, AccessKind::Read));
        tracker.ingest();

        assert_eq!(rx.try_recv().unwrap(), "user:1");
        assert_eq!(rx.try_recv().unwrap(), "profile:1");
        assert!(rx.try_recv().is_err());

        let predictions = tracker.predict("user:1");
        assert_eq!(predictions[0].key, "profile:1");
    }

    #[tokio::test]
    async fn test_writes_are_tracked_without_triggers() {
        let (tracker, mut rx) = AccessTracker::new(&config(100));
        tracker.record(AccessEvent::write("user:1"));
        tracker.record(AccessEvent::write("profile:1"));
        tracker.ingest();

        assert!(rx.try_recv().is_err());
        assert_eq!(tracker.stats().tracked_keys, 2);
        assert_eq!(tracker.predict("user:1")[0].key, "profile:1");

        tracker.record(AccessEvent::delete("profile:1"));
        tracker.ingest();
        assert_eq!(tracker.stats().tracked_keys, 1);
        assert!(tracker.predict("user:1").is_empty());
    }

    #[tokio::test]
    async fn test_full_trigger_channel_never_blocks() {
        let (tracker, _rx) = AccessTracker::new(&config(100));
        let now = Instant::now();
        for i in 0..10 {
            tracker.record(event(&format!("k{}", i), now, AccessKind::Read));
        }
        assert_eq!(tracker.ingest(), 10);
        assert_eq!(tracker.stats().triggers_dropped, 6);
    }

    #[tokio::test]
    async fn test_worker_drains_and_stops() {
        let (tx, rx) = watch::channel(false);
        let (tracker, _triggers) = AccessTracker::start(&config(100), rx);
        tracker.record(AccessEvent::read("k"));

        let started = Instant::now();
        while tracker.stats().ingested == 0 {
            assert!(started.elapsed() < Duration::from_secs(5));
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        tx.send(true).unwrap();
        tracker.join().await;
    }
}
