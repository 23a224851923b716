pub mod batch;
pub mod cache;
pub mod config;
pub mod core;
pub mod facade;
pub mod metrics;
pub mod preload;
pub mod registry;
pub mod store;
pub mod tracker;

// Re-export commonly used types
pub use batch::{
    BatchScheduler, BatchWindow, ChannelErrorSink, ErrorSink, PendingIndex, SchedulerStats,
    TracingErrorSink,
};
pub use cache::{CacheLookup, HotCache, TierStats, TieredCache, WarmCache};
pub use config::{
    CacheConfig, LoggingConfig, PreloaderConfig, SchedulerConfig, StoreConfig, StrataConfig,
    TierConfig, TrackerConfig,
};
pub use core::{
    AccessEvent, AccessKind, CacheEntry, FailedWrite, Result, StrataError, Tier, Value, WriteOp,
};
pub use facade::{Strata, StrataStats};
pub use preload::{PreloadStats, Preloader};
pub use registry::{EntitySchema, FieldRegistry, FieldType, FilterOp, Query, RegistryError};
pub use store::{LogStore, MemoryStore, StoreAdapter, StoreError, Timed};
pub use tracker::{AccessTracker, Prediction, TrackerStats};
