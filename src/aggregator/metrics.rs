//! Aggregation metrics collection
//!
//! Thread-safe counters for the shard entry map and its entries, using
//! atomic operations for lock-free updates. Snapshots are cheap and used
//! both for reporting and test assertions.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters maintained by a shard's metric map
#[derive(Debug, Default)]
pub struct MapMetrics {
    new_entries: AtomicU64,
    no_rate_limit_warmup: AtomicU64,
    new_metric_rate_limit_exceeded: AtomicU64,
    dropped_new_metrics: AtomicU64,
}

impl MapMetrics {
    /// Record a new entry insertion
    #[inline]
    pub fn record_new_entry(&self) {
        self.new_entries.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a new-metric limit suppressed by the warmup window
    #[inline]
    pub fn record_no_rate_limit_warmup(&self) {
        self.no_rate_limit_warmup.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a denied new-metric insertion
    #[inline]
    pub fn record_new_metric_rate_limit_exceeded(&self) {
        self.new_metric_rate_limit_exceeded
            .fetch_add(1, Ordering::Relaxed);
        self.dropped_new_metrics.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot the counters
    pub fn snapshot(&self) -> MapMetricsSnapshot {
        MapMetricsSnapshot {
            new_entries: self.new_entries.load(Ordering::Relaxed),
            no_rate_limit_warmup: self.no_rate_limit_warmup.load(Ordering::Relaxed),
            new_metric_rate_limit_exceeded: self
                .new_metric_rate_limit_exceeded
                .load(Ordering::Relaxed),
            dropped_new_metrics: self.dropped_new_metrics.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`MapMetrics`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapMetricsSnapshot {
    /// Entries inserted into the map
    pub new_entries: u64,
    /// Inserts admitted during the warmup window despite a configured limit
    pub no_rate_limit_warmup: u64,
    /// Inserts denied by the per-shard new-metric limit
    pub new_metric_rate_limit_exceeded: u64,
    /// New metrics dropped due to the limit
    pub dropped_new_metrics: u64,
}

/// Counters shared by all entries of one shard
#[derive(Debug, Default)]
pub struct EntryMetrics {
    empty_metadatas: AtomicU64,
    no_applicable_metadata: AtomicU64,
    no_pipelines_in_metadata: AtomicU64,
    value_rate_limit_exceeded: AtomicU64,
    dropped_values: AtomicU64,
    stale_metadata: AtomicU64,
    tombstoned_metadata: AtomicU64,
    metadata_updates: AtomicU64,
}

impl EntryMetrics {
    /// Record a write carrying an empty staged metadata list
    #[inline]
    pub fn record_empty_metadatas(&self) {
        self.empty_metadatas.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a write whose metadata has not cut over yet
    #[inline]
    pub fn record_no_applicable_metadata(&self) {
        self.no_applicable_metadata.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a write whose active metadata carries no pipelines
    #[inline]
    pub fn record_no_pipelines_in_metadata(&self) {
        self.no_pipelines_in_metadata.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a write denied by the per-metric value limit
    #[inline]
    pub fn record_value_rate_limit_exceeded(&self, dropped: u64) {
        self.value_rate_limit_exceeded.fetch_add(1, Ordering::Relaxed);
        self.dropped_values.fetch_add(dropped, Ordering::Relaxed);
    }

    /// Record stale metadata ignored in favor of the cached configuration
    #[inline]
    pub fn record_stale_metadata(&self) {
        self.stale_metadata.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a write against a tombstoned metric
    #[inline]
    pub fn record_tombstoned_metadata(&self) {
        self.tombstoned_metadata.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a metadata update
    #[inline]
    pub fn record_metadata_update(&self) {
        self.metadata_updates.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot the counters
    pub fn snapshot(&self) -> EntryMetricsSnapshot {
        EntryMetricsSnapshot {
            empty_metadatas: self.empty_metadatas.load(Ordering::Relaxed),
            no_applicable_metadata: self.no_applicable_metadata.load(Ordering::Relaxed),
            no_pipelines_in_metadata: self.no_pipelines_in_metadata.load(Ordering::Relaxed),
            value_rate_limit_exceeded: self.value_rate_limit_exceeded.load(Ordering::Relaxed),
            dropped_values: self.dropped_values.load(Ordering::Relaxed),
            stale_metadata: self.stale_metadata.load(Ordering::Relaxed),
            tombstoned_metadata: self.tombstoned_metadata.load(Ordering::Relaxed),
            metadata_updates: self.metadata_updates.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`EntryMetrics`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryMetricsSnapshot {
    /// Writes with an empty staged metadata list
    pub empty_metadatas: u64,
    /// Writes with no cut-over metadata
    pub no_applicable_metadata: u64,
    /// Writes whose active metadata had no pipelines
    pub no_pipelines_in_metadata: u64,
    /// Writes denied by the value rate limit
    pub value_rate_limit_exceeded: u64,
    /// Values dropped by the value rate limit
    pub dropped_values: u64,
    /// Stale metadata occurrences
    pub stale_metadata: u64,
    /// Writes against tombstoned metrics
    pub tombstoned_metadata: u64,
    /// Metadata updates applied
    pub metadata_updates: u64,
}
