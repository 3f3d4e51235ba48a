//! Cache Metrics Collection
//!
//! Per-process counters for the tiered cache.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Cache metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    // Hot tier
    hot_hits: AtomicU64,
    hot_misses: AtomicU64,
    hot_errors: AtomicU64,

    // Durable tier
    durable_hits: AtomicU64,
    durable_misses: AtomicU64,

    // Movement
    promotions: AtomicU64,
    writes: AtomicU64,
    bytes_written: AtomicU64,
    evictions: AtomicU64,
}

impl CacheMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hot_hit(&self) {
        self.hot_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_hot_miss(&self) {
        self.hot_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_hot_error(&self) {
        self.hot_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_durable_hit(&self) {
        self.durable_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_durable_miss(&self) {
        self.durable_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_promotion(&self) {
        self.promotions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write(&self, bytes: u64) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_evictions(&self, count: u64) {
        self.evictions.fetch_add(count, Ordering::Relaxed);
    }

    pub fn hot_hits(&self) -> u64 {
        self.hot_hits.load(Ordering::Relaxed)
    }

    pub fn hot_errors(&self) -> u64 {
        self.hot_errors.load(Ordering::Relaxed)
    }

    pub fn durable_hits(&self) -> u64 {
        self.durable_hits.load(Ordering::Relaxed)
    }

    /// Final misses (neither tier had a fresh entry)
    pub fn misses(&self) -> u64 {
        self.durable_misses.load(Ordering::Relaxed)
    }

    /// Get overall cache hit ratio
    pub fn overall_hit_ratio(&self) -> f64 {
        let hits = self.hot_hits() + self.durable_hits();
        let total = hits + self.misses();

        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// Get snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            hot_hits: self.hot_hits(),
            hot_misses: self.hot_misses.load(Ordering::Relaxed),
            hot_errors: self.hot_errors(),
            durable_hits: self.durable_hits(),
            durable_misses: self.misses(),
            promotions: self.promotions.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            overall_hit_ratio: self.overall_hit_ratio(),
        }
    }
}

/// Snapshot of all cache metrics
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub hot_hits: u64,
    pub hot_misses: u64,
    pub hot_errors: u64,
    pub durable_hits: u64,
    pub durable_misses: u64,
    pub promotions: u64,
    pub writes: u64,
    pub bytes_written: u64,
    pub evictions: u64,
    pub overall_hit_ratio: f64,
}
