//! Adaptive Batch Scheduler
//!
//! Writes are appended to an in-memory buffer and handed to the store in
//! batches. A single worker task owns every flush:
//! - size trigger: buffer reached the adaptive threshold
//! - time trigger: oldest buffered write is older than the adaptive max delay
//! - explicit `flush()`, answered only after every earlier flush finished
//!
//! Same-key writes inside a batch collapse to the last one. Failed writes are
//! retried with bounded exponential backoff and then reported to their waiter
//! and to the error sink.

pub mod pending;
pub mod sink;
pub mod window;

pub use pending::PendingIndex;
pub use sink::{ChannelErrorSink, ErrorSink, TracingErrorSink};
pub use window::{Adjustment, BatchWindow};

use crate::config::SchedulerConfig;
use crate::core::{FailedWrite, PendingWrite, Result, StrataError, WriteOp};
use crate::metrics;
use crate::store::{RetryPolicy, StoreAdapter, StoreError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Failed writes remembered for `take_failure`
const FAILURE_MEMORY: usize = 4_096;

enum Command {
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Scheduler counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub flushes: u64,
    pub applied: u64,
    pub failed: u64,
    pub retries: u64,
    pub coalesced: u64,
    pub avg_flush_latency_ms: f64,
    pub pending: usize,
    pub batch_threshold: usize,
    pub max_delay_ms: u64,
}

#[derive(Default)]
struct Counters {
    flushes: AtomicU64,
    applied: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
    coalesced: AtomicU64,
    latency_us: AtomicU64,
}

/// One key's surviving write after coalescing
struct Survivor {
    op: WriteOp,
    waiters: Vec<oneshot::Sender<Result<()>>>,
    merged: usize,
}

struct Shared {
    buffer: Mutex<Vec<PendingWrite>>,
    closed: AtomicBool,
    window: Mutex<BatchWindow>,
    pending: Arc<PendingIndex>,
    /// Surviving op per key of the flush currently running
    inflight: Mutex<HashMap<String, WriteOp>>,
    failures: Mutex<HashMap<String, FailedWrite>>,
    wake: Notify,
    store: Arc<dyn StoreAdapter>,
    sink: Arc<dyn ErrorSink>,
    retry: RetryPolicy,
    max_batch_size: usize,
    counters: Counters,
}

pub struct BatchScheduler {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BatchScheduler {
    /// Create the scheduler and spawn its worker on the current runtime
    pub fn start(
        config: &SchedulerConfig,
        store: Arc<dyn StoreAdapter>,
        sink: Arc<dyn ErrorSink>,
        pending: Arc<PendingIndex>,
    ) -> Self {
        let window = BatchWindow::new(config);
        metrics::BATCH_THRESHOLD.set(window.size_threshold() as i64);

        let shared = Arc::new(Shared {
            buffer: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            window: Mutex::new(window),
            pending,
            inflight: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            wake: Notify::new(),
            store,
            sink,
            retry: RetryPolicy {
                max_retries: config.max_retry_attempts,
                backoff_base: Duration::from_millis(config.backoff_base_ms),
                backoff_max: Duration::from_millis(config.backoff_max_ms),
                attempt_timeout: None,
            },
            max_batch_size: config.max_batch_size,
            counters: Counters::default(),
        });

        let (commands, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(Self::worker_loop(Arc::clone(&shared), rx));
        info!(
            "Batch scheduler started (batch size {}..{}, delay {}..{}ms)",
            config.min_batch_size,
            config.max_batch_size,
            config.min_flush_delay_ms,
            config.max_flush_delay_ms
        );

        Self {
            shared,
            commands,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Buffer a write and return immediately
    pub fn enqueue(&self, op: WriteOp) -> Result<()> {
        self.push(PendingWrite::new(op))
    }

    /// Buffer a write; the receiver resolves with the write's final outcome
    pub fn enqueue_durable(&self, op: WriteOp) -> Result<oneshot::Receiver<Result<()>>> {
        let (tx, rx) = oneshot::channel();
        self.push(PendingWrite::with_waiter(op, tx))?;
        Ok(rx)
    }

    fn push(&self, write: PendingWrite) -> Result<()> {
        let shared = &self.shared;
        let mut buffer = shared.buffer.lock();
        if shared.closed.load(Ordering::Acquire) {
            return Err(StrataError::Shutdown);
        }
        let key = write.op.key().to_string();
        shared.pending.add(&key);
        shared.failures.lock().remove(&key);
        buffer.push(write);
        let len = buffer.len();
        drop(buffer);

        let threshold = shared.window.lock().size_threshold();
        // first write arms the timer, a full buffer triggers a flush
        if len == 1 || len >= threshold {
            shared.wake.notify_one();
        }
        Ok(())
    }

    /// Flush everything buffered so far. Resolves after this flush and every
    /// earlier one completed; dropping the future does not cancel the flush.
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Flush(tx))
            .map_err(|_| StrataError::Shutdown)?;
        rx.await.map_err(|_| StrataError::Shutdown)
    }

    /// Stop accepting writes, flush the buffer and stop the worker
    pub async fn shutdown(&self) -> Result<()> {
        {
            let _buffer = self.shared.buffer.lock();
            self.shared.closed.store(true, Ordering::Release);
        }
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            worker
                .await
                .map_err(|e| StrataError::Internal(format!("scheduler worker failed: {}", e)))?;
        }
        info!("Batch scheduler stopped");
        Ok(())
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.shared.pending.is_pending(key)
    }

    pub fn pending_count(&self) -> usize {
        self.shared.pending.total()
    }

    /// Newest not-yet-applied write for `key`, buffered or in flight
    pub fn latest_pending(&self, key: &str) -> Option<WriteOp> {
        let buffered = self
            .shared
            .buffer
            .lock()
            .iter()
            .rev()
            .find(|w| w.op.key() == key)
            .map(|w| w.op.clone());
        buffered.or_else(|| self.shared.inflight.lock().get(key).cloned())
    }

    /// Last unresolved failure of a write to `key`, consumed by the call
    pub fn take_failure(&self, key: &str) -> Option<FailedWrite> {
        self.shared.failures.lock().remove(key)
    }

    pub fn stats(&self) -> SchedulerStats {
        let c = &self.shared.counters;
        let flushes = c.flushes.load(Ordering::Relaxed);
        let latency_us = c.latency_us.load(Ordering::Relaxed);
        let window = self.shared.window.lock().clone();
        SchedulerStats {
            flushes,
            applied: c.applied.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            retries: c.retries.load(Ordering::Relaxed),
            coalesced: c.coalesced.load(Ordering::Relaxed),
            avg_flush_latency_ms: if flushes > 0 {
                latency_us as f64 / flushes as f64 / 1000.0
            } else {
                0.0
            },
            pending: self.shared.pending.total(),
            batch_threshold: window.size_threshold(),
            max_delay_ms: window.max_delay().as_millis() as u64,
        }
    }

    async fn worker_loop(shared: Arc<Shared>, mut rx: mpsc::UnboundedReceiver<Command>) {
        loop {
            let deadline = shared.deadline();
            tokio::select! {
                biased;

                cmd = rx.recv() => match cmd {
                    Some(Command::Flush(done)) => {
                        shared.flush_buffer().await;
                        let _ = done.send(());
                    }
                    Some(Command::Shutdown(done)) => {
                        shared.flush_buffer().await;
                        let _ = done.send(());
                        break;
                    }
                    None => {
                        shared.flush_buffer().await;
                        break;
                    }
                },

                _ = shared.wake.notified() => {
                    let full = shared.buffer.lock().len() >= shared.window.lock().size_threshold();
                    if full {
                        shared.flush_buffer().await;
                    }
                }

                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    shared.flush_buffer().await;
                }
            }
        }
        debug!("Batch scheduler worker exited");
    }
}

impl Shared {
    /// When the oldest buffered write reaches the max delay
    fn deadline(&self) -> Option<Instant> {
        let oldest = self.buffer.lock().first().map(|w| w.enqueued_at)?;
        Some(oldest + self.window.lock().max_delay())
    }

    async fn flush_buffer(&self) {
        // inflight is held across the handoff so readers see every write in
        // either the buffer or the inflight map
        let writes = {
            let mut inflight = self.inflight.lock();
            let writes = std::mem::take(&mut *self.buffer.lock());
            for write in &writes {
                inflight.insert(write.op.key().to_string(), write.op.clone());
            }
            writes
        };
        if writes.is_empty() {
            return;
        }
        self.flush_writes(writes).await;
    }

    async fn flush_writes(&self, writes: Vec<PendingWrite>) {
        let batch_id = Uuid::new_v4();
        let started = Instant::now();
        let received = writes.len();
        let survivors = coalesce(writes);
        let coalesced = received - survivors.len();
        self.counters
            .coalesced
            .fetch_add(coalesced as u64, Ordering::Relaxed);

        let mut applied = 0usize;
        let mut failed = 0usize;
        let chunk_size = self.max_batch_size.max(1);
        let mut survivors = survivors.into_iter();
        loop {
            let chunk: Vec<Survivor> = survivors.by_ref().take(chunk_size).collect();
            if chunk.is_empty() {
                break;
            }
            let outcomes = self.write_with_retry(batch_id, &chunk).await;
            for (survivor, outcome) in chunk.into_iter().zip(outcomes) {
                match outcome {
                    Ok(()) => applied += 1,
                    Err(_) => failed += 1,
                }
                self.resolve(batch_id, survivor, outcome);
            }
        }

        let latency = started.elapsed();
        let adjustment = {
            let mut window = self.window.lock();
            let adjustment = window.observe(latency, failed);
            metrics::BATCH_THRESHOLD.set(window.size_threshold() as i64);
            adjustment
        };
        metrics::record_flush(latency.as_secs_f64(), applied, failed);
        self.counters.flushes.fetch_add(1, Ordering::Relaxed);
        self.counters
            .latency_us
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);

        debug!(
            "Batch {} flushed: {} writes ({} coalesced), {} applied, {} failed in {:?}, window {:?}",
            batch_id, received, coalesced, applied, failed, latency, adjustment
        );
    }

    /// Write one chunk, retrying retryable failures. Returns one outcome per
    /// survivor together with the number of attempts it took.
    async fn write_with_retry(
        &self,
        batch_id: Uuid,
        chunk: &[Survivor],
    ) -> Vec<std::result::Result<(), (u32, StoreError)>> {
        let mut outcomes: Vec<Option<std::result::Result<(), (u32, StoreError)>>> =
            (0..chunk.len()).map(|_| None).collect();
        let mut remaining: Vec<usize> = (0..chunk.len()).collect();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let ops: Vec<WriteOp> = remaining.iter().map(|&i| chunk[i].op.clone()).collect();
            let mut retry = Vec::new();
            let mut last_error = None;

            match self.store.write_batch(&ops).await {
                Ok(timed) => {
                    for (&idx, result) in remaining.iter().zip(timed.value) {
                        match result {
                            Ok(()) => outcomes[idx] = Some(Ok(())),
                            Err(e) if e.is_retryable() => {
                                last_error = Some(e);
                                retry.push(idx);
                            }
                            Err(e) => outcomes[idx] = Some(Err((attempt, e))),
                        }
                    }
                }
                Err(e) if e.is_retryable() => {
                    retry = remaining.clone();
                    last_error = Some(e);
                }
                Err(e) => {
                    for &idx in &remaining {
                        outcomes[idx] = Some(Err((attempt, e.clone())));
                    }
                }
            }

            if retry.is_empty() {
                break;
            }
            let error = last_error
                .unwrap_or_else(|| StoreError::Unavailable("unknown failure".to_string()));
            if attempt > self.retry.max_retries {
                for idx in retry {
                    outcomes[idx] = Some(Err((attempt, error.clone())));
                }
                break;
            }

            let delay = self.retry.backoff(attempt - 1);
            warn!(
                "Batch {}: {} write(s) failed (attempt {}/{}): {}, retrying in {:?}",
                batch_id,
                retry.len(),
                attempt,
                self.retry.total_attempts(),
                error,
                delay
            );
            self.counters.retries.fetch_add(1, Ordering::Relaxed);
            tokio::time::sleep(delay).await;
            remaining = retry;
        }

        outcomes
            .into_iter()
            .map(|o| {
                o.unwrap_or_else(|| {
                    Err((
                        attempt,
                        StoreError::Unavailable("write outcome missing".to_string()),
                    ))
                })
            })
            .collect()
    }

    /// Settle a survivor: release its pending slots, answer its waiters and
    /// report a failure.
    fn resolve(
        &self,
        batch_id: Uuid,
        survivor: Survivor,
        outcome: std::result::Result<(), (u32, StoreError)>,
    ) {
        let key = survivor.op.key().to_string();
        self.inflight.lock().remove(&key);
        self.pending.release(&key, survivor.merged);

        match outcome {
            Ok(()) => {
                self.counters.applied.fetch_add(1, Ordering::Relaxed);
                for waiter in survivor.waiters {
                    let _ = waiter.send(Ok(()));
                }
            }
            Err((attempts, error)) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                let failure = FailedWrite {
                    op: survivor.op,
                    attempts,
                    reason: error.to_string(),
                    batch_id,
                    failed_at: chrono::Utc::now(),
                    superseded: self.pending.is_pending(&key),
                };
                for waiter in survivor.waiters {
                    let _ = waiter.send(Err(StrataError::FlushFailure {
                        key: key.clone(),
                        attempts,
                        reason: failure.reason.clone(),
                    }));
                }
                if !failure.superseded {
                    self.remember_failure(&failure);
                }
                self.sink.report(&failure);
            }
        }
    }

    fn remember_failure(&self, failure: &FailedWrite) {
        let mut failures = self.failures.lock();
        if failures.len() >= FAILURE_MEMORY {
            let oldest = failures
                .iter()
                .min_by_key(|(_, f)| f.failed_at)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                failures.remove(&oldest);
            }
        }
        failures.insert(failure.op.key().to_string(), failure.clone());
    }
}

/// Collapse same-key writes to the last one, keeping first-seen key order.
fn coalesce(writes: Vec<PendingWrite>) -> Vec<Survivor> {
    let mut survivors: Vec<Survivor> = Vec::with_capacity(writes.len());
    let mut positions: HashMap<String, usize> = HashMap::with_capacity(writes.len());

    for write in writes {
        let PendingWrite { op, waiter, .. } = write;
        match positions.get(op.key()) {
            Some(&pos) => {
                let survivor = &mut survivors[pos];
                survivor.op = op;
                survivor.merged += 1;
                survivor.waiters.extend(waiter);
            }
            None => {
                positions.insert(op.key().to_string(), survivors.len());
                survivors.push(Survivor {
                    op,
                    waiters: waiter.into_iter().collect(),
                    merged: 1,
                });
            }
        }
    }
    survivors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            min_batch_size: 100,
            max_batch_size: 1_000,
            min_flush_delay_ms: 10_000,
            max_flush_delay_ms: 20_000,
            max_retry_attempts: 2,
            backoff_base_ms: 1,
            backoff_max_ms: 4,
            ..SchedulerConfig::default()
        }
    }

    fn upsert(key: &str, value: serde_json::Value) -> WriteOp {
        WriteOp::Upsert {
            key: key.to_string(),
            value,
        }
    }

    fn scheduler(
        config: &SchedulerConfig,
        store: Arc<MemoryStore>,
    ) -> (BatchScheduler, mpsc::UnboundedReceiver<FailedWrite>) {
        let (sink, rx) = ChannelErrorSink::new();
        let scheduler = BatchScheduler::start(
            config,
            store,
            Arc::new(sink),
            Arc::new(PendingIndex::new()),
        );
        (scheduler, rx)
    }

    #[test]
    fn test_coalesce_last_write_wins() {
        let (tx, _rx) = oneshot::channel();
        let writes = vec![
            PendingWrite::with_waiter(upsert("a", json!(1)), tx),
            PendingWrite::new(upsert("b", json!(1))),
            PendingWrite::new(upsert("a", json!(2))),
            PendingWrite::new(WriteOp::Delete { key: "b".into() }),
        ];

        let survivors = coalesce(writes);
        assert_eq!(survivors.len(), 2);
        assert_eq!(survivors[0].op, upsert("a", json!(2)));
        assert_eq!(survivors[0].merged, 2);
        assert_eq!(survivors[0].waiters.len(), 1);
        assert_eq!(survivors[1].op, WriteOp::Delete { key: "b".into() });
    }

    #[tokio::test]
    async fn test_explicit_flush_applies_last_value() {
        let store = Arc::new(MemoryStore::new());
        let (scheduler, _rx) = scheduler(&config(), Arc::clone(&store));

        for v in 1..=5 {
            scheduler.enqueue(upsert("k", json!(v))).unwrap();
        }
        assert_eq!(scheduler.pending_count(), 5);
        assert!(scheduler.is_pending("k"));

        scheduler.flush().await.unwrap();
        assert_eq!(store.peek("k"), Some(json!(5)));
        assert_eq!(store.batch_sizes(), vec![1]);
        assert_eq!(scheduler.pending_count(), 0);
        assert_eq!(scheduler.stats().coalesced, 4);
    }

    #[tokio::test]
    async fn test_latest_pending_sees_buffered_writes() {
        let store = Arc::new(MemoryStore::new());
        let (scheduler, _rx) = scheduler(&config(), Arc::clone(&store));

        scheduler.enqueue(upsert("k", json!(1))).unwrap();
        scheduler
            .enqueue(WriteOp::Delete { key: "k".into() })
            .unwrap();
        assert_eq!(
            scheduler.latest_pending("k"),
            Some(WriteOp::Delete { key: "k".into() })
        );
        assert_eq!(scheduler.latest_pending("other"), None);

        scheduler.flush().await.unwrap();
        assert_eq!(scheduler.latest_pending("k"), None);
    }

    #[tokio::test]
    async fn test_size_trigger_flushes_without_explicit_call() {
        let store = Arc::new(MemoryStore::new());
        let mut cfg = config();
        cfg.min_batch_size = 3;
        let (scheduler, _rx) = scheduler(&cfg, Arc::clone(&store));

        for i in 0..3 {
            scheduler
                .enqueue(upsert(&format!("k{}", i), json!(i)))
                .unwrap();
        }
        let started = Instant::now();
        while store.len() < 3 {
            assert!(started.elapsed() < Duration::from_secs(5));
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(store.batch_sizes(), vec![3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_trigger_flushes_small_buffer() {
        let store = Arc::new(MemoryStore::new());
        let mut cfg = config();
        cfg.min_flush_delay_ms = 50;
        let (scheduler, _rx) = scheduler(&cfg, Arc::clone(&store));

        scheduler.enqueue(upsert("lonely", json!(true))).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(store.peek("lonely"), None);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.peek("lonely"), Some(json!(true)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_store_reports_every_write() {
        let store = Arc::new(MemoryStore::new());
        let (scheduler, mut failures) = scheduler(&config(), Arc::clone(&store));

        let waiters: Vec<_> = ["a", "b", "c"]
            .iter()
            .map(|k| scheduler.enqueue_durable(upsert(k, json!(k))).unwrap())
            .collect();
        store.set_available(false);
        scheduler.flush().await.unwrap();

        // first attempt plus two retries
        assert_eq!(store.batch_sizes(), vec![3, 3, 3]);
        for waiter in waiters {
            let result = waiter.await.unwrap();
            assert!(matches!(
                result,
                Err(StrataError::FlushFailure { attempts: 3, .. })
            ));
        }
        let mut reported = Vec::new();
        while let Ok(failure) = failures.try_recv() {
            assert!(!failure.superseded);
            reported.push(failure.op.key().to_string());
        }
        reported.sort();
        assert_eq!(reported, vec!["a", "b", "c"]);
        assert_eq!(scheduler.pending_count(), 0);
        assert!(scheduler.take_failure("a").is_some());
        assert!(scheduler.take_failure("a").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_recovers() {
        let store = Arc::new(MemoryStore::new());
        let (scheduler, mut failures) = scheduler(&config(), Arc::clone(&store));

        store.fail_next_writes(1);
        let waiter = scheduler.enqueue_durable(upsert("k", json!(1))).unwrap();
        scheduler.flush().await.unwrap();

        assert!(waiter.await.unwrap().is_ok());
        assert_eq!(store.peek("k"), Some(json!(1)));
        assert!(failures.try_recv().is_err());
        assert_eq!(scheduler.stats().retries, 1);
    }

    #[tokio::test]
    async fn test_rejected_write_is_not_retried() {
        let store = Arc::new(MemoryStore::new());
        store.reject_key("bad");
        let (scheduler, mut failures) = scheduler(&config(), Arc::clone(&store));

        scheduler.enqueue(upsert("bad", json!(1))).unwrap();
        scheduler.enqueue(upsert("good", json!(2))).unwrap();
        scheduler.flush().await.unwrap();

        assert_eq!(store.batch_sizes(), vec![2]);
        assert_eq!(store.peek("good"), Some(json!(2)));
        let failure = failures.try_recv().unwrap();
        assert_eq!(failure.op.key(), "bad");
        assert_eq!(failure.attempts, 1);
    }

    #[tokio::test]
    async fn test_shutdown_flushes_and_rejects_new_writes() {
        let store = Arc::new(MemoryStore::new());
        let (scheduler, _rx) = scheduler(&config(), Arc::clone(&store));

        scheduler.enqueue(upsert("k", json!("v"))).unwrap();
        scheduler.shutdown().await.unwrap();

        assert_eq!(store.peek("k"), Some(json!("v")));
        assert!(matches!(
            scheduler.enqueue(upsert("k", json!("late"))),
            Err(StrataError::Shutdown)
        ));
        assert!(matches!(scheduler.flush().await, Err(StrataError::Shutdown)));
    }
}
