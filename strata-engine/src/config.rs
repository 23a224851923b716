use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::{Result, StrataError};

/// Main engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StrataConfig {
    pub cache: CacheConfig,
    pub tracker: TrackerConfig,
    pub preloader: PreloaderConfig,
    pub scheduler: SchedulerConfig,
    pub store: StoreConfig,
    pub logging: LoggingConfig,
}

/// Capacity and TTL of one cache tier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    pub capacity: usize,
    pub ttl_ms: u64,
}

impl TierConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub l1: TierConfig,
    pub l2: TierConfig,
    /// Proactive expiry sweep + integrity check interval
    pub sweep_interval_ms: u64,
    /// Number of per-key serialization stripes
    pub key_stripes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1: TierConfig {
                capacity: 1_000,
                ttl_ms: 60_000,
            },
            l2: TierConfig {
                capacity: 10_000,
                ttl_ms: 600_000,
            },
            sweep_interval_ms: 1_000,
            key_stripes: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Access events buffered before the oldest are dropped
    pub queue_capacity: usize,
    /// Half-life of the decaying frequency and pair weights
    pub half_life_ms: u64,
    /// Two accesses closer than this count as co-occurring
    pub cooccurrence_window_ms: u64,
    /// Upper bound on tracked key pairs
    pub max_pairs: usize,
    /// Upper bound on tracked keys
    pub max_keys: usize,
    /// Predictions returned per accessed key
    pub prediction_limit: usize,
    /// Minimum pair weight / source frequency ratio for a prediction
    pub min_confidence: f64,
    /// Prefetch triggers buffered for the preloader
    pub trigger_capacity: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            half_life_ms: 300_000,
            cooccurrence_window_ms: 2_000,
            max_pairs: 50_000,
            max_keys: 100_000,
            prediction_limit: 5,
            min_confidence: 0.2,
            trigger_capacity: 1_024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreloaderConfig {
    pub enabled: bool,
    pub max_concurrency: usize,
    /// Prefetch reads slower than this halve the concurrency limit
    pub latency_backoff_ms: u64,
}

impl Default for PreloaderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrency: 8,
            latency_backoff_ms: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    pub min_flush_delay_ms: u64,
    pub max_flush_delay_ms: u64,
    /// Flushes at or under this latency count as fast
    pub target_flush_latency_ms: u64,
    /// Additive increase of the size threshold after a fast flush
    pub increase_step: usize,
    /// Multiplicative decrease applied after a slow or failing flush
    pub decrease_factor: f64,
    /// Retries after the first failed attempt
    pub max_retry_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            min_batch_size: 8,
            max_batch_size: 512,
            min_flush_delay_ms: 5,
            max_flush_delay_ms: 200,
            target_flush_latency_ms: 20,
            increase_step: 8,
            decrease_factor: 0.5,
            max_retry_attempts: 3,
            backoff_base_ms: 10,
            backoff_max_ms: 1_000,
        }
    }
}

impl SchedulerConfig {
    pub fn min_flush_delay(&self) -> Duration {
        Duration::from_millis(self.min_flush_delay_ms)
    }

    pub fn max_flush_delay(&self) -> Duration {
        Duration::from_millis(self.max_flush_delay_ms)
    }

    pub fn target_flush_latency(&self) -> Duration {
        Duration::from_millis(self.target_flush_latency_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Per-attempt timeout of a store read
    pub read_timeout_ms: u64,
    /// Retries of a failed read before surfacing StoreUnavailable
    pub read_retry_attempts: u32,
    pub read_backoff_ms: u64,
    /// Directory of the on-disk log store
    pub data_dir: PathBuf,
    /// fsync after every batch
    pub fsync: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: 1_000,
            read_retry_attempts: 2,
            read_backoff_ms: 10,
            data_dir: PathBuf::from("./data/strata"),
            fsync: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl StrataConfig {
    /// Load configuration from YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            StrataError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    /// Parse and validate a YAML document
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: StrataConfig = serde_yaml::from_str(content)
            .map_err(|e| StrataError::Configuration(format!("invalid YAML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject tuning parameters the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        let cache = &self.cache;
        ensure(cache.l1.capacity > 0, "cache.l1.capacity must be > 0")?;
        ensure(cache.l2.capacity > 0, "cache.l2.capacity must be > 0")?;
        ensure(cache.l1.ttl_ms > 0, "cache.l1.ttl_ms must be > 0")?;
        ensure(
            cache.l2.ttl_ms >= cache.l1.ttl_ms,
            "cache.l2.ttl_ms must be >= cache.l1.ttl_ms",
        )?;
        ensure(cache.sweep_interval_ms > 0, "cache.sweep_interval_ms must be > 0")?;
        ensure(cache.key_stripes > 0, "cache.key_stripes must be > 0")?;

        let tracker = &self.tracker;
        ensure(tracker.queue_capacity > 0, "tracker.queue_capacity must be > 0")?;
        ensure(tracker.half_life_ms > 0, "tracker.half_life_ms must be > 0")?;
        ensure(tracker.max_pairs > 0, "tracker.max_pairs must be > 0")?;
        ensure(tracker.max_keys > 0, "tracker.max_keys must be > 0")?;
        ensure(
            (0.0..=1.0).contains(&tracker.min_confidence),
            "tracker.min_confidence must be within [0, 1]",
        )?;
        ensure(tracker.trigger_capacity > 0, "tracker.trigger_capacity must be > 0")?;

        ensure(
            self.preloader.max_concurrency > 0,
            "preloader.max_concurrency must be > 0",
        )?;

        let scheduler = &self.scheduler;
        ensure(scheduler.min_batch_size > 0, "scheduler.min_batch_size must be > 0")?;
        ensure(
            scheduler.min_batch_size <= scheduler.max_batch_size,
            "scheduler.min_batch_size must be <= scheduler.max_batch_size",
        )?;
        ensure(
            scheduler.min_flush_delay_ms > 0,
            "scheduler.min_flush_delay_ms must be > 0",
        )?;
        ensure(
            scheduler.min_flush_delay_ms <= scheduler.max_flush_delay_ms,
            "scheduler.min_flush_delay_ms must be <= scheduler.max_flush_delay_ms",
        )?;
        ensure(scheduler.increase_step > 0, "scheduler.increase_step must be > 0")?;
        ensure(
            scheduler.decrease_factor > 0.0 && scheduler.decrease_factor < 1.0,
            "scheduler.decrease_factor must be within (0, 1)",
        )?;
        ensure(
            scheduler.backoff_base_ms <= scheduler.backoff_max_ms,
            "scheduler.backoff_base_ms must be <= scheduler.backoff_max_ms",
        )?;

        ensure(self.store.read_timeout_ms > 0, "store.read_timeout_ms must be > 0")?;
        Ok(())
    }
}

fn ensure(condition: bool, message: &str) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(StrataError::Configuration(message.to_string()))
    }
}
