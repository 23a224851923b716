use crate::metrics;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Per-key count of writes that are buffered or in flight
#[derive(Debug, Default)]
pub struct PendingIndex {
    keys: Mutex<HashMap<String, usize>>,
    total: AtomicUsize,
}

impl PendingIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, key: &str) {
        *self.keys.lock().entry(key.to_string()).or_insert(0) += 1;
        let total = self.total.fetch_add(1, Ordering::AcqRel) + 1;
        metrics::PENDING_WRITES.set(total as i64);
    }

    /// Release `count` writes of `key` once they are resolved
    pub fn release(&self, key: &str, count: usize) {
        let mut keys = self.keys.lock();
        let Some(remaining) = keys.get_mut(key) else {
            return;
        };
        let released = count.min(*remaining);
        *remaining -= released;
        if *remaining == 0 {
            keys.remove(key);
        }
        drop(keys);
        let total = self.total.fetch_sub(released, Ordering::AcqRel) - released;
        metrics::PENDING_WRITES.set(total as i64);
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.keys.lock().contains_key(key)
    }

    pub fn count(&self, key: &str) -> usize {
        self.keys.lock().get(key).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.total.load(Ordering::Acquire)
    }
}
