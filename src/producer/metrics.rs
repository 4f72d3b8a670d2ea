//! Message writer metrics collection

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters maintained by a replicated-shard message writer
#[derive(Debug, Default)]
pub struct MessageWriterMetrics {
    write_success: AtomicU64,
    one_consumer_write_error: AtomicU64,
    all_consumers_write_error: AtomicU64,
    no_writers_error: AtomicU64,
    write_after_cutoff: AtomicU64,
    write_before_cutover: AtomicU64,
    retry_scans: AtomicU64,
}

impl MessageWriterMetrics {
    /// Record a successful delivery to a consumer
    #[inline]
    pub fn record_write_success(&self) {
        self.write_success.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed delivery to a single consumer
    #[inline]
    pub fn record_one_consumer_write_error(&self) {
        self.one_consumer_write_error.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a delivery that failed on every consumer
    #[inline]
    pub fn record_all_consumers_write_error(&self) {
        self.all_consumers_write_error.fetch_add(1, Ordering::Relaxed);
    }

    /// Record retryable messages seen while no consumers were registered
    #[inline]
    pub fn record_no_writers_error(&self, count: u64) {
        self.no_writers_error.fetch_add(count, Ordering::Relaxed);
    }

    /// Record a write rejected at or after the cutoff
    #[inline]
    pub fn record_write_after_cutoff(&self) {
        self.write_after_cutoff.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a write rejected before the cutover
    #[inline]
    pub fn record_write_before_cutover(&self) {
        self.write_before_cutover.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one retry scan over the queue
    #[inline]
    pub fn record_retry_scan(&self) {
        self.retry_scans.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot the counters
    pub fn snapshot(&self) -> MessageWriterMetricsSnapshot {
        MessageWriterMetricsSnapshot {
            write_success: self.write_success.load(Ordering::Relaxed),
            one_consumer_write_error: self.one_consumer_write_error.load(Ordering::Relaxed),
            all_consumers_write_error: self.all_consumers_write_error.load(Ordering::Relaxed),
            no_writers_error: self.no_writers_error.load(Ordering::Relaxed),
            write_after_cutoff: self.write_after_cutoff.load(Ordering::Relaxed),
            write_before_cutover: self.write_before_cutover.load(Ordering::Relaxed),
            retry_scans: self.retry_scans.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`MessageWriterMetrics`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageWriterMetricsSnapshot {
    /// Successful deliveries
    pub write_success: u64,
    /// Failed deliveries to individual consumers
    pub one_consumer_write_error: u64,
    /// Deliveries that failed on every consumer
    pub all_consumers_write_error: u64,
    /// Retryable messages seen with no consumers registered
    pub no_writers_error: u64,
    /// Writes rejected at or after the cutoff
    pub write_after_cutoff: u64,
    /// Writes rejected before the cutover
    pub write_before_cutover: u64,
    /// Retry scans over the queue
    pub retry_scans: u64,
}
