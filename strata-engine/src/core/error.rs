use crate::registry::RegistryError;
use crate::store::StoreError;
use thiserror::Error;

/// Main error type for Strata operations
///
/// A cache miss is never an error: lookups return `Ok(None)`.
#[derive(Debug, Clone, Error)]
pub enum StrataError {
    /// The store could not serve a read after the local retry budget was spent
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// A buffered write was rejected after the scheduler exhausted its retries
    #[error("Flush failed for key {key} after {attempts} attempt(s): {reason}")]
    FlushFailure {
        key: String,
        attempts: u32,
        reason: String,
    },

    /// Permanent store error (not retried)
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Invalid tuning parameters; fatal at startup
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Query error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// The engine (or one of its workers) has been shut down
    #[error("Engine is shut down")]
    Shutdown,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StrataError {
    /// True when the failure came from the backing store being unreachable,
    /// as opposed to the value being absent or rejected.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }
}

/// Result type alias for Strata operations
pub type Result<T> = std::result::Result<T, StrataError>;
