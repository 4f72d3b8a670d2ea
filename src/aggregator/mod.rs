//! Per-shard metric aggregation: entry map, entries, and element lists
//!
//! This module ingests streaming metric writes for one shard. Each unique
//! metric identity maps to an [`Entry`](entry::Entry) carrying its
//! aggregation metadata and element bindings; the
//! [`MetricMap`](map::MetricMap) owns the identity map, enforces the
//! per-shard new-metric rate limit, and expires idle entries under a soft
//! deadline from a background [`TickWorker`](tick::TickWorker).
//!
//! # Architecture
//!
//! ```text
//! [add_untimed] → [MetricMap] → [Entry] → [elements in MetricLists]
//!                     ↓            ↓
//!                [MapMetrics] [EntryMetrics]
//! ```

pub mod element;
pub mod entry;
pub mod map;
pub mod metric_list;
pub mod metrics;
pub mod tick;

pub use entry::Entry;
pub use map::{EntryKey, MetricMap, TickResult};
pub use metric_list::MetricLists;
pub use metrics::{EntryMetricsSnapshot, MapMetricsSnapshot};
pub use tick::TickWorker;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::clock::{system_clock, ClockFn};
use crate::error::{ConfigError, Result};
use crate::types::StoragePolicy;

/// Process-wide time lock
///
/// Held in shared mode for the duration of every entry write so no write
/// observes a current time that a flush has already passed; the flush side
/// acquires it exclusively to advance.
pub type TimeLock = Arc<RwLock<()>>;

/// Static options of a shard's aggregation map
///
/// These are fixed at construction; see [`RuntimeOptions`] for the
/// parameters that may change while the map is live.
#[derive(Clone)]
pub struct AggregatorOptions {
    /// Clock used for cutover checks, rate limiting, and expiration
    pub clock: ClockFn,
    /// Shared write/flush phase barrier
    pub time_lock: TimeLock,
    /// Idle window before an entry becomes eligible for expiration
    pub entry_ttl: Duration,
    /// Fraction of live entries scanned per sub-batch during a tick
    pub entry_check_batch_percent: f64,
    /// Split timer batches larger than this per write; `0` disables
    pub max_timer_batch_size_per_write: usize,
    /// Storage policies applied when metadata selects the defaults
    pub default_storage_policies: Vec<StoragePolicy>,
    /// Recycled entries kept per shard
    pub entry_pool_capacity: usize,
    /// Recycled aggregation elements kept per metric type
    pub element_pool_capacity: usize,
}

impl Default for AggregatorOptions {
    fn default() -> Self {
        Self {
            clock: system_clock(),
            time_lock: Arc::new(RwLock::new(())),
            entry_ttl: Duration::from_secs(24 * 60 * 60),
            entry_check_batch_percent: 0.01,
            max_timer_batch_size_per_write: 0,
            default_storage_policies: vec![
                StoragePolicy::new(Duration::from_secs(10), Duration::from_secs(2 * 24 * 60 * 60)),
                StoragePolicy::new(Duration::from_secs(60), Duration::from_secs(40 * 24 * 60 * 60)),
            ],
            entry_pool_capacity: 4096,
            element_pool_capacity: 4096,
        }
    }
}

impl AggregatorOptions {
    /// Validate the options
    pub fn validate(&self) -> Result<()> {
        if !(self.entry_check_batch_percent > 0.0 && self.entry_check_batch_percent <= 1.0) {
            return Err(ConfigError::OutOfRange {
                field: "entry_check_batch_percent",
                value: self.entry_check_batch_percent.to_string(),
                requirement: "in (0, 1]",
            }
            .into());
        }
        if self.entry_ttl.is_zero() {
            return Err(ConfigError::OutOfRange {
                field: "entry_ttl",
                value: "0s".to_string(),
                requirement: "non-zero",
            }
            .into());
        }
        if self.default_storage_policies.is_empty() {
            return Err(ConfigError::Missing("default_storage_policies").into());
        }
        Ok(())
    }

    /// Replace the clock (primarily for tests)
    pub fn with_clock(mut self, clock: ClockFn) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the entry TTL
    pub fn with_entry_ttl(mut self, ttl: Duration) -> Self {
        self.entry_ttl = ttl;
        self
    }
}

/// Parameters that may be changed on a live map via
/// [`MetricMap::set_runtime_options`](map::MetricMap::set_runtime_options)
///
/// A limit of zero or below disables the corresponding limiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeOptions {
    /// Per-metric value rate cap (values/second); `<= 0` disables
    pub write_values_per_metric_limit_per_second: i64,
    /// Per-shard new-metric insertion cap (inserts/second); `<= 0` disables
    pub write_new_metric_limit_per_shard_per_second: i64,
    /// Grace period from the shard's first insert during which the
    /// new-metric limit is suppressed
    pub write_new_metric_no_limit_warmup: Duration,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            write_values_per_metric_limit_per_second: 0,
            write_new_metric_limit_per_shard_per_second: 0,
            write_new_metric_no_limit_warmup: Duration::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options_validate() {
        assert!(AggregatorOptions::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_batch_percent_rejected() {
        let opts = AggregatorOptions {
            entry_check_batch_percent: 0.0,
            ..Default::default()
        };
        assert!(opts.validate().is_err());

        let opts = AggregatorOptions {
            entry_check_batch_percent: 1.5,
            ..Default::default()
        };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_empty_default_policies_rejected() {
        let opts = AggregatorOptions {
            default_storage_policies: Vec::new(),
            ..Default::default()
        };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_runtime_options_default_disables_limits() {
        let runtime = RuntimeOptions::default();
        assert!(runtime.write_values_per_metric_limit_per_second <= 0);
        assert!(runtime.write_new_metric_limit_per_shard_per_second <= 0);
    }
}
