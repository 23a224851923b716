pub mod error;
pub mod key_lock;
pub mod types;

pub use error::{Result, StrataError};
pub use key_lock::{KeyGuard, KeyLocks};
pub use types::{
    AccessEvent, AccessKind, CacheEntry, FailedWrite, PendingWrite, Tier, Value, WriteOp, key_kind,
};
