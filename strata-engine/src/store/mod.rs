//! Persistent store adapters
//!
//! The engine talks to durable storage only through [`StoreAdapter`]. Every
//! call reports how long the backend took so the batch controller and the
//! preloader can react to backend pressure.
//!
//! - [`MemoryStore`]: in-process map with injectable latency and faults
//! - [`LogStore`]: append-only on-disk record log with an in-memory index

pub mod log_store;
pub mod memory;
pub mod retry;

pub use log_store::LogStore;
pub use memory::MemoryStore;
pub use retry::{RetryPolicy, with_retry};

use crate::core::{Value, WriteOp};
use crate::registry::CompiledFilter;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Store adapter errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("write rejected: {0}")]
    Rejected(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("corrupted record: {0}")]
    Corrupted(String),
}

impl StoreError {
    /// Transient failures worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_) | Self::Io(_))
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Store result annotated with the observed backend latency
#[derive(Debug, Clone)]
pub struct Timed<T> {
    pub value: T,
    pub latency: Duration,
}

impl<T> Timed<T> {
    /// Wrap `value`, measuring latency since `started`
    pub fn since(started: Instant, value: T) -> Self {
        Self {
            value,
            latency: started.elapsed(),
        }
    }
}

/// Per-operation results of a batch, in the order of the submitted ops
pub type BatchResults = Vec<StoreResult<()>>;

/// Durable storage consumed by the engine
#[async_trait]
pub trait StoreAdapter: Send + Sync {
    /// Read a single entity
    async fn read_one(&self, key: &str) -> StoreResult<Timed<Option<Value>>>;

    /// Read several entities; absent keys are omitted from the map
    async fn read_many(&self, keys: &[String]) -> StoreResult<Timed<HashMap<String, Value>>>;

    /// Apply a batch of writes. An `Err` means nothing in the batch is known to
    /// be applied; otherwise each op reports its own outcome.
    async fn write_batch(&self, ops: &[WriteOp]) -> StoreResult<Timed<BatchResults>>;

    /// Simple-filter lookup over one entity kind
    async fn query(&self, filter: &CompiledFilter) -> StoreResult<Timed<Vec<(String, Value)>>>;

    /// Adapter name for logs
    fn name(&self) -> &'static str;
}
