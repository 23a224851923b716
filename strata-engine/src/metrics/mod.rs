//! Prometheus Metrics for Strata
//!
//! Collectors for every layer of the engine:
//! - Cache lookups per tier
//! - Write batching and flush latency
//! - Preloader activity
//! - Access tracker ingestion

use lazy_static::lazy_static;
use prometheus::{
    Encoder, Histogram, IntCounter, IntCounterVec, IntGauge, TextEncoder, register_histogram,
    register_int_counter, register_int_counter_vec, register_int_gauge,
};

lazy_static! {
    // ============================================================================
    // Cache Metrics
    // ============================================================================

    /// Cache lookups by tier (l1, l2, store) and outcome (hit, miss)
    pub static ref CACHE_LOOKUPS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "strata_cache_lookups_total",
        "Total cache lookups by tier and outcome",
        &["tier", "outcome"]
    ).unwrap();

    /// Entries removed from a tier by capacity pressure
    pub static ref CACHE_EVICTIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "strata_cache_evictions_total",
        "Total cache evictions by tier",
        &["tier"]
    ).unwrap();

    /// Tier instances rebuilt empty after an integrity failure
    pub static ref CACHE_REBUILDS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "strata_cache_rebuilds_total",
        "Total tier rebuilds after integrity check failures",
        &["tier"]
    ).unwrap();

    // ============================================================================
    // Batch Scheduler Metrics
    // ============================================================================

    /// Flush latency in seconds
    pub static ref FLUSH_DURATION: Histogram = register_histogram!(
        "strata_flush_duration_seconds",
        "Batch flush latency in seconds",
        vec![0.0001, 0.001, 0.01, 0.1, 1.0, 10.0]
    ).unwrap();

    /// Writes by final status (applied, failed)
    pub static ref WRITES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "strata_writes_total",
        "Total buffered writes by final status",
        &["status"]
    ).unwrap();

    /// Current adaptive batch size threshold
    pub static ref BATCH_THRESHOLD: IntGauge = register_int_gauge!(
        "strata_batch_size_threshold",
        "Current adaptive batch size threshold"
    ).unwrap();

    /// Writes buffered or in flight
    pub static ref PENDING_WRITES: IntGauge = register_int_gauge!(
        "strata_pending_writes",
        "Writes buffered or in flight"
    ).unwrap();

    // ============================================================================
    // Preloader / Tracker Metrics
    // ============================================================================

    /// Prefetch outcomes (loaded, skipped, missing, failed)
    pub static ref PREFETCH_TOTAL: IntCounterVec = register_int_counter_vec!(
        "strata_prefetch_total",
        "Total prefetch attempts by outcome",
        &["outcome"]
    ).unwrap();

    /// Current prefetch concurrency limit
    pub static ref PREFETCH_CONCURRENCY: IntGauge = register_int_gauge!(
        "strata_prefetch_concurrency",
        "Current prefetch concurrency limit"
    ).unwrap();

    /// Access events dropped by tracker overflow
    pub static ref TRACKER_DROPPED_TOTAL: IntCounter = register_int_counter!(
        "strata_tracker_dropped_events_total",
        "Access events dropped because the tracker queue was full"
    ).unwrap();
}

/// Record a cache lookup
pub fn record_lookup(tier: &str, hit: bool) {
    let outcome = if hit { "hit" } else { "miss" };
    CACHE_LOOKUPS_TOTAL.with_label_values(&[tier, outcome]).inc();
}

/// Record evictions from a tier
pub fn record_evictions(tier: &str, count: usize) {
    if count > 0 {
        CACHE_EVICTIONS_TOTAL
            .with_label_values(&[tier])
            .inc_by(count as u64);
    }
}

/// Record a completed flush
pub fn record_flush(duration_secs: f64, applied: usize, failed: usize) {
    FLUSH_DURATION.observe(duration_secs);
    WRITES_TOTAL
        .with_label_values(&["applied"])
        .inc_by(applied as u64);
    WRITES_TOTAL
        .with_label_values(&["failed"])
        .inc_by(failed as u64);
}

/// Record prefetch outcomes
pub fn record_prefetch(outcome: &str, count: usize) {
    PREFETCH_TOTAL
        .with_label_values(&[outcome])
        .inc_by(count as u64);
}

/// Render every registered collector in the Prometheus text format
pub fn encode_metrics() -> Result<String, String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| format!("Failed to encode metrics: {}", e))?;

    String::from_utf8(buffer).map_err(|e| format!("Failed to convert metrics to string: {}", e))
}
