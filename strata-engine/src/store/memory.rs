use super::{BatchResults, StoreAdapter, StoreError, StoreResult, Timed};
use crate::core::{Value, WriteOp};
use crate::registry::CompiledFilter;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// In-memory store with injectable latency and faults
pub struct MemoryStore {
    data: RwLock<HashMap<String, Value>>,
    read_latency: Mutex<Duration>,
    write_latency: Mutex<Duration>,
    available: AtomicBool,
    /// Upcoming write batches that fail as unavailable
    fail_next_writes: AtomicU32,
    /// Keys whose writes are permanently rejected
    rejected: RwLock<HashSet<String>>,
    reads: AtomicU64,
    batches: Mutex<Vec<usize>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
            read_latency: Mutex::new(Duration::ZERO),
            write_latency: Mutex::new(Duration::ZERO),
            available: AtomicBool::new(true),
            fail_next_writes: AtomicU32::new(0),
            rejected: RwLock::new(HashSet::new()),
            reads: AtomicU64::new(0),
            batches: Mutex::new(Vec::new()),
        }
    }

    /// Store pre-populated with `entries`
    pub fn with_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        let store = Self::new();
        store.data.write().extend(entries);
        store
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn set_read_latency(&self, latency: Duration) {
        *self.read_latency.lock() = latency;
    }

    pub fn set_write_latency(&self, latency: Duration) {
        *self.write_latency.lock() = latency;
    }

    /// Make the next `count` write batches fail as unavailable
    pub fn fail_next_writes(&self, count: u32) {
        self.fail_next_writes.store(count, Ordering::SeqCst);
    }

    /// Permanently reject writes to `key`
    pub fn reject_key(&self, key: &str) {
        self.rejected.write().insert(key.to_string());
    }

    /// Direct read, bypassing latency and faults
    pub fn peek(&self, key: &str) -> Option<Value> {
        self.data.read().get(key).cloned()
    }

    /// Direct write, bypassing latency and faults
    pub fn insert(&self, key: &str, value: Value) {
        self.data.write().insert(key.to_string(), value);
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of read calls (one per read_one/read_many/query)
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    /// Sizes of every write batch attempt, in order
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().clone()
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store offline".to_string()))
        }
    }

    async fn pause(latency: Duration) {
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StoreAdapter for MemoryStore {
    async fn read_one(&self, key: &str) -> StoreResult<Timed<Option<Value>>> {
        let started = Instant::now();
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        // served at request time, delivered after the latency
        let value = self.peek(key);
        let latency = *self.read_latency.lock();
        Self::pause(latency).await;
        Ok(Timed::since(started, value))
    }

    async fn read_many(&self, keys: &[String]) -> StoreResult<Timed<HashMap<String, Value>>> {
        let started = Instant::now();
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let found: HashMap<String, Value> = {
            let data = self.data.read();
            keys.iter()
                .filter_map(|key| data.get(key).map(|value| (key.clone(), value.clone())))
                .collect()
        };
        let latency = *self.read_latency.lock();
        Self::pause(latency).await;
        Ok(Timed::since(started, found))
    }

    async fn write_batch(&self, ops: &[WriteOp]) -> StoreResult<Timed<BatchResults>> {
        let started = Instant::now();
        self.batches.lock().push(ops.len());
        self.check_available()?;
        let failing = self
            .fail_next_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::Unavailable(
                "memory store injected write failure".to_string(),
            ));
        }
        let latency = *self.write_latency.lock();
        Self::pause(latency).await;

        let rejected = self.rejected.read().clone();
        let mut data = self.data.write();
        let results = ops
            .iter()
            .map(|op| {
                if rejected.contains(op.key()) {
                    return Err(StoreError::Rejected(format!("writes to {} are rejected", op.key())));
                }
                match op {
                    WriteOp::Upsert { key, value } => {
                        data.insert(key.clone(), value.clone());
                    }
                    WriteOp::Delete { key } => {
                        data.remove(key);
                    }
                }
                Ok(())
            })
            .collect();
        debug!("Memory store applied batch of {} ops", ops.len());
        Ok(Timed::since(started, results))
    }

    async fn query(&self, filter: &CompiledFilter) -> StoreResult<Timed<Vec<(String, Value)>>> {
        let started = Instant::now();
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let latency = *self.read_latency.lock();
        Self::pause(latency).await;

        let data = self.data.read();
        let mut rows: Vec<(String, Value)> = data
            .iter()
            .filter(|(key, value)| filter.matches_key(key) && filter.matches(value))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        if let Some(limit) = filter.limit() {
            rows.truncate(limit);
        }
        Ok(Timed::since(started, rows))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_read_write_roundtrip() {
        let store = MemoryStore::new();
        let ops = vec![
            WriteOp::Upsert {
                key: "user:1".into(),
                value: json!({"n": 1}),
            },
            WriteOp::Upsert {
                key: "user:2".into(),
                value: json!({"n": 2}),
            },
            WriteOp::Delete {
                key: "user:2".into(),
            },
        ];
        let results = store.write_batch(&ops).await.unwrap().value;
        assert!(results.iter().all(|r| r.is_ok()));

        assert_eq!(
            store.read_one("user:1").await.unwrap().value,
            Some(json!({"n": 1}))
        );
        assert_eq!(store.read_one("user:2").await.unwrap().value, None);

        let many = store
            .read_many(&["user:1".to_string(), "user:3".to_string()])
            .await
            .unwrap()
            .value;
        assert_eq!(many.len(), 1);
        assert_eq!(store.batch_sizes(), vec![3]);
    }

    #[tokio::test]
    async fn test_unavailable() {
        let store = MemoryStore::new();
        store.set_available(false);

        assert!(matches!(
            store.read_one("k").await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(matches!(
            store.write_batch(&[]).await,
            Err(StoreError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_fail_next_writes_then_recover() {
        let store = MemoryStore::new();
        store.fail_next_writes(1);
        let ops = vec![WriteOp::Upsert {
            key: "k".into(),
            value: json!(1),
        }];

        assert!(store.write_batch(&ops).await.is_err());
        assert!(store.write_batch(&ops).await.is_ok());
        assert_eq!(store.peek("k"), Some(json!(1)));
    }

    #[tokio::test]
    async fn test_rejected_key_reports_per_op() {
        let store = MemoryStore::new();
        store.reject_key("bad");
        let ops = vec![
            WriteOp::Upsert {
                key: "bad".into(),
                value: json!(1),
            },
            WriteOp::Upsert {
                key: "good".into(),
                value: json!(2),
            },
        ];

        let results = store.write_batch(&ops).await.unwrap().value;
        assert!(matches!(results[0], Err(StoreError::Rejected(_))));
        assert!(results[1].is_ok());
        assert_eq!(store.peek("bad"), None);
    }
}
