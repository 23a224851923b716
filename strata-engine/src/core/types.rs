use super::error::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Entity document stored under a key
pub type Value = serde_json::Value;

/// Separator between the entity kind and the id inside a key (`user:42`)
pub const KIND_SEPARATOR: char = ':';

/// Entity kind of a key: the part before the first `:`, or the whole key.
pub fn key_kind(key: &str) -> &str {
    key.split_once(KIND_SEPARATOR).map_or(key, |(kind, _)| kind)
}

/// Storage tier that currently owns a cache entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    L1,
    L2,
    Store,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::L1 => "l1",
            Self::L2 => "l2",
            Self::Store => "store",
        }
    }
}

/// Cached value with its lifecycle metadata
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub value: Value,
    pub inserted_at: Instant,
    pub last_access: Instant,
    pub expires_at: Instant,
    pub tier: Tier,
    /// Inserted speculatively by the preloader and not yet read
    pub prefetched: bool,
}

impl CacheEntry {
    pub fn new(key: String, value: Value, tier: Tier, ttl: Duration, now: Instant) -> Self {
        Self {
            key,
            value,
            inserted_at: now,
            last_access: now,
            expires_at: now + ttl,
            tier,
            prefetched: false,
        }
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// Move the entry into another tier. The deadline can only move closer:
    /// the entry keeps whichever comes first of its current deadline and the
    /// new tier's TTL.
    pub fn retier(mut self, tier: Tier, ttl: Duration, now: Instant) -> Self {
        self.tier = tier;
        self.expires_at = self.expires_at.min(now + ttl);
        self.last_access = now;
        self
    }
}

/// Kind of access recorded by the tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessKind {
    Read,
    Write,
    Delete,
}

/// A single key access, consumed by the tracker and then discarded
#[derive(Debug, Clone)]
pub struct AccessEvent {
    pub key: String,
    pub at: Instant,
    pub kind: AccessKind,
}

impl AccessEvent {
    pub fn new(key: impl Into<String>, kind: AccessKind) -> Self {
        Self {
            key: key.into(),
            at: Instant::now(),
            kind,
        }
    }

    pub fn read(key: impl Into<String>) -> Self {
        Self::new(key, AccessKind::Read)
    }

    pub fn write(key: impl Into<String>) -> Self {
        Self::new(key, AccessKind::Write)
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self::new(key, AccessKind::Delete)
    }
}

/// Mutation applied to the store by a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum WriteOp {
    Upsert { key: String, value: Value },
    Delete { key: String },
}

impl WriteOp {
    pub fn key(&self) -> &str {
        match self {
            Self::Upsert { key, .. } | Self::Delete { key } => key,
        }
    }
}

/// Write waiting in the scheduler buffer
#[derive(Debug)]
pub struct PendingWrite {
    pub op: WriteOp,
    pub enqueued_at: Instant,
    /// Present when the caller awaits durability
    pub waiter: Option<oneshot::Sender<Result<()>>>,
}

impl PendingWrite {
    pub fn new(op: WriteOp) -> Self {
        Self {
            op,
            enqueued_at: Instant::now(),
            waiter: None,
        }
    }

    pub fn with_waiter(op: WriteOp, waiter: oneshot::Sender<Result<()>>) -> Self {
        Self {
            op,
            enqueued_at: Instant::now(),
            waiter: Some(waiter),
        }
    }
}

/// Write the scheduler gave up on, handed to the error sink
#[derive(Debug, Clone)]
pub struct FailedWrite {
    pub op: WriteOp,
    pub attempts: u32,
    pub reason: String,
    pub batch_id: uuid::Uuid,
    pub failed_at: chrono::DateTime<chrono::Utc>,
    /// A newer write to the same key is still pending
    pub superseded: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_kind() {
        assert_eq!(key_kind("user:42"), "user");
        assert_eq!(key_kind("user:42:extra"), "user");
        assert_eq!(key_kind("plain"), "plain");
    }

    #[test]
    fn test_entry_expiry() {
        let now = Instant::now();
        let entry = CacheEntry::new(
            "k".to_string(),
            json!(1),
            Tier::L1,
            Duration::from_secs(5),
            now,
        );
        assert!(!entry.is_expired_at(now));
        assert!(entry.is_expired_at(now + Duration::from_secs(5)));

        // a longer TTL in the new tier does not push the deadline out
        let moved = entry.retier(Tier::L2, Duration::from_secs(60), now + Duration::from_secs(1));
        assert_eq!(moved.tier, Tier::L2);
        assert!(moved.is_expired_at(now + Duration::from_secs(5)));

        // a shorter one pulls it in
        let moved = moved.retier(Tier::L1, Duration::from_secs(1), now + Duration::from_secs(2));
        assert_eq!(moved.expires_at, now + Duration::from_secs(3));
    }

    #[test]
    fn test_write_op_serde() {
        let op = WriteOp::Upsert {
            key: "user:1".to_string(),
            value: json!({"name": "ana"}),
        };
        let encoded = serde_json::to_string(&op).unwrap();
        assert!(encoded.contains("\"op\":\"upsert\""));
        let decoded: WriteOp = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, op);
        assert_eq!(decoded.key(), "user:1");
    }
}
