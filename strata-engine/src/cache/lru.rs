//! O(1) LRU table with TTL
//!
//! Entries live in a slab threaded on an intrusive recency list: most recently
//! used at the head, LRU victim at the tail. A deadline index ordered by
//! `expires_at` sits beside it. Entries can carry an earlier deadline than the
//! table's TTL (a tier move never extends one), so expiry order is not
//! insertion order. Expired entries are purged from the front of the deadline
//! index before any recency-based eviction runs.

use crate::core::{CacheEntry, Tier};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tokio::time::Instant;

const NIL: usize = usize::MAX;

#[derive(Debug, Clone, Copy)]
struct Links {
    prev: usize,
    next: usize,
}

impl Default for Links {
    fn default() -> Self {
        Self {
            prev: NIL,
            next: NIL,
        }
    }
}

#[derive(Debug)]
struct Slot {
    entry: Option<CacheEntry>,
    links: Links,
}

/// Outcome of an insertion
#[derive(Debug, Default)]
pub struct InsertOutcome {
    /// Live entries pushed out by capacity pressure, LRU first
    pub evicted: Vec<CacheEntry>,
    /// Entries dropped because their TTL had passed
    pub expired: usize,
}

pub struct LruTable {
    index: HashMap<String, usize>,
    slots: Vec<Slot>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
    /// `(expires_at, slot)` for every live slot
    deadlines: BTreeSet<(Instant, usize)>,
    capacity: usize,
    ttl: Duration,
    tier: Tier,
}

impl LruTable {
    pub fn new(capacity: usize, ttl: Duration, tier: Tier) -> Self {
        Self {
            index: HashMap::with_capacity(capacity.min(1 << 16)),
            slots: Vec::new(),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
            deadlines: BTreeSet::new(),
            capacity: capacity.max(1),
            ttl,
            tier,
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Look up a live entry and mark it most recently used.
    /// An expired entry is removed and reported as absent.
    pub fn get(&mut self, key: &str, now: Instant) -> Option<&CacheEntry> {
        let idx = self.live_index(key, now)?;
        self.unlink(idx);
        self.push_front(idx);
        let entry = self.slots[idx].entry.as_mut()?;
        entry.last_access = now;
        Some(&*entry)
    }

    /// Look up without touching recency
    pub fn peek(&self, key: &str, now: Instant) -> Option<&CacheEntry> {
        let idx = *self.index.get(key)?;
        self.slots[idx]
            .entry
            .as_ref()
            .filter(|entry| !entry.is_expired_at(now))
    }

    pub fn contains(&self, key: &str, now: Instant) -> bool {
        self.peek(key, now).is_some()
    }

    /// Remove and return a live entry
    pub fn take(&mut self, key: &str, now: Instant) -> Option<CacheEntry> {
        let idx = self.live_index(key, now)?;
        self.release(idx)
    }

    pub fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let idx = *self.index.get(key)?;
        self.release(idx)
    }

    /// Insert or replace an entry. The entry is re-stamped for this table's
    /// tier; its deadline is capped by this table's TTL but never extended.
    pub fn insert(&mut self, entry: CacheEntry, now: Instant) -> InsertOutcome {
        let entry = entry.retier(self.tier, self.ttl, now);
        let mut outcome = InsertOutcome::default();

        if let Some(&idx) = self.index.get(&entry.key) {
            if let Some(old) = &self.slots[idx].entry {
                self.deadlines.remove(&(old.expires_at, idx));
            }
            self.deadlines.insert((entry.expires_at, idx));
            self.unlink(idx);
            self.slots[idx].entry = Some(entry);
            self.push_front(idx);
            return outcome;
        }

        if self.index.len() >= self.capacity {
            outcome.expired = self.purge_expired(now);
        }
        while self.index.len() >= self.capacity {
            let victim = self.tail;
            if victim == NIL {
                break;
            }
            if let Some(evicted) = self.release(victim) {
                outcome.evicted.push(evicted);
            }
        }

        let key = entry.key.clone();
        let expires_at = entry.expires_at;
        let idx = self.allocate(entry);
        self.index.insert(key, idx);
        self.deadlines.insert((expires_at, idx));
        self.push_front(idx);
        outcome
    }

    /// Drop every expired entry; returns how many were dropped
    pub fn purge_expired(&mut self, now: Instant) -> usize {
        let mut purged = 0;
        while let Some(&(deadline, idx)) = self.deadlines.first() {
            if deadline > now {
                break;
            }
            if self.release(idx).is_none() {
                // stale deadline without a live slot
                self.deadlines.remove(&(deadline, idx));
                continue;
            }
            purged += 1;
        }
        purged
    }

    pub fn clear(&mut self) {
        self.index.clear();
        self.slots.clear();
        self.free.clear();
        self.deadlines.clear();
        self.head = NIL;
        self.tail = NIL;
    }

    /// Keys from most to least recently used
    pub fn keys(&self) -> Vec<String> {
        let mut keys = Vec::with_capacity(self.index.len());
        let mut idx = self.head;
        while idx != NIL && keys.len() <= self.index.len() {
            if let Some(entry) = &self.slots[idx].entry {
                keys.push(entry.key.clone());
            }
            idx = self.slots[idx].links.next;
        }
        keys
    }

    /// Verify that the index, the recency list and the deadline index
    /// describe the same entries
    pub fn check_integrity(&self) -> Result<(), String> {
        for (key, &idx) in &self.index {
            match self.slots.get(idx).and_then(|slot| slot.entry.as_ref()) {
                Some(entry) if &entry.key == key => {
                    if !self.deadlines.contains(&(entry.expires_at, idx)) {
                        return Err(format!("entry {} is missing from the deadline index", key));
                    }
                }
                _ => return Err(format!("index entry {} points to a foreign slot", key)),
            }
        }
        if self.deadlines.len() != self.index.len() {
            return Err(format!(
                "deadline index holds {} entries, index holds {}",
                self.deadlines.len(),
                self.index.len()
            ));
        }
        let walked = self.walk()?;
        if walked != self.index.len() {
            return Err(format!(
                "recency list holds {} entries, index holds {}",
                walked,
                self.index.len()
            ));
        }
        Ok(())
    }

    fn walk(&self) -> Result<usize, String> {
        let mut count = 0;
        let mut prev = NIL;
        let mut idx = self.head;
        while idx != NIL {
            let slot = self
                .slots
                .get(idx)
                .ok_or_else(|| "recency list points past the slab".to_string())?;
            if slot.entry.is_none() {
                return Err("recency list reaches a free slot".to_string());
            }
            if slot.links.prev != prev {
                return Err("recency list has a broken back link".to_string());
            }
            count += 1;
            if count > self.index.len() {
                return Err("recency list is cyclic".to_string());
            }
            prev = idx;
            idx = slot.links.next;
        }
        if prev != self.tail {
            return Err("recency list tail is stale".to_string());
        }
        Ok(count)
    }

    fn live_index(&mut self, key: &str, now: Instant) -> Option<usize> {
        let idx = *self.index.get(key)?;
        let expired = self.slots[idx]
            .entry
            .as_ref()
            .is_none_or(|entry| entry.is_expired_at(now));
        if expired {
            self.release(idx);
            return None;
        }
        Some(idx)
    }

    fn allocate(&mut self, entry: CacheEntry) -> usize {
        let slot = Slot {
            entry: Some(entry),
            links: Links::default(),
        };
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = slot;
                idx
            }
            None => {
                self.slots.push(slot);
                self.slots.len() - 1
            }
        }
    }

    fn release(&mut self, idx: usize) -> Option<CacheEntry> {
        self.unlink(idx);
        let entry = self.slots[idx].entry.take()?;
        self.deadlines.remove(&(entry.expires_at, idx));
        self.index.remove(&entry.key);
        self.free.push(idx);
        Some(entry)
    }

    fn push_front(&mut self, idx: usize) {
        let head = self.head;
        self.slots[idx].links = Links {
            prev: NIL,
            next: head,
        };
        if head != NIL {
            self.slots[head].links.prev = idx;
        }
        self.head = idx;
        if self.tail == NIL {
            self.tail = idx;
        }
    }

    fn unlink(&mut self, idx: usize) {
        let Links { prev, next } = self.slots[idx].links;
        if prev == NIL && next == NIL && self.head != idx {
            // not linked
            return;
        }
        if prev != NIL {
            self.slots[prev].links.next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.slots[next].links.prev = prev;
        } else {
            self.tail = prev;
        }
        self.slots[idx].links = Links::default();
    }
}
