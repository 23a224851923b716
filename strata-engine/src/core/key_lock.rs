//! Striped per-key serialization
//!
//! Keys hash onto a fixed set of stripes. Holding a stripe serializes every
//! mutation of the keys mapped to it, and each stripe carries a generation
//! counter that is bumped on every mutation. Read paths that leave the lock
//! (to wait on the store) capture the generation first and only populate the
//! cache if it is unchanged when they come back.

use parking_lot::{Mutex, MutexGuard};
use std::hash::BuildHasher;
use std::sync::atomic::{AtomicU64, Ordering};

/// Default number of stripes
pub const DEFAULT_STRIPES: usize = 256;

struct Stripe {
    lock: Mutex<()>,
    generation: AtomicU64,
}

/// Striped lock table keyed by string
pub struct KeyLocks {
    stripes: Box<[Stripe]>,
    mask: usize,
    hasher: ahash::RandomState,
}

/// Exclusive hold on the stripe of one key
pub struct KeyGuard<'a> {
    _guard: MutexGuard<'a, ()>,
    generation: &'a AtomicU64,
}

impl KeyGuard<'_> {
    /// Record a mutation; returns the new generation
    pub fn bump(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}

impl KeyLocks {
    /// Create a lock table; the stripe count is rounded up to a power of two
    pub fn new(stripes: usize) -> Self {
        let count = stripes.max(1).next_power_of_two();
        let stripes = (0..count)
            .map(|_| Stripe {
                lock: Mutex::new(()),
                generation: AtomicU64::new(0),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            stripes,
            mask: count - 1,
            hasher: ahash::RandomState::new(),
        }
    }

    fn stripe(&self, key: &str) -> &Stripe {
        let idx = (self.hasher.hash_one(key) as usize) & self.mask;
        &self.stripes[idx]
    }

    pub fn lock(&self, key: &str) -> KeyGuard<'_> {
        let stripe = self.stripe(key);
        KeyGuard {
            _guard: stripe.lock.lock(),
            generation: &stripe.generation,
        }
    }

    /// Non-blocking variant used by best-effort paths
    pub fn try_lock(&self, key: &str) -> Option<KeyGuard<'_>> {
        let stripe = self.stripe(key);
        stripe.lock.try_lock().map(|guard| KeyGuard {
            _guard: guard,
            generation: &stripe.generation,
        })
    }

    /// Current generation of the key's stripe, without locking
    pub fn generation(&self, key: &str) -> u64 {
        self.stripe(key).generation.load(Ordering::Acquire)
    }

    pub fn stripe_count(&self) -> usize {
        self.stripes.len()
    }
}

impl Default for KeyLocks {
    fn default() -> Self {
        Self::new(DEFAULT_STRIPES)
    }
}
