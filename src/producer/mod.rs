//! Replicated message production
//!
//! The producer side replicates every acknowledged message to the consumer
//! connections of its replicated shard. Each shard owns a
//! [`MessageWriter`](message_writer::MessageWriter): an ordered in-memory
//! queue with monotonic message ids, an acks map, and a background retry
//! loop with jittered exponential backoff.

pub mod consumer;
pub mod message;
pub mod message_writer;
pub mod metrics;

pub use consumer::ConsumerWriter;
pub use message::{MessageMeta, RefCountedMessage};
pub use message_writer::MessageWriter;
pub use metrics::MessageWriterMetricsSnapshot;

use std::time::Duration;

use crate::clock::{system_clock, ClockFn};
use crate::error::{ConfigError, Result};

/// Retry backoff parameters
#[derive(Debug, Clone)]
pub struct RetryOptions {
    /// Backoff before the second delivery attempt
    pub initial_backoff: Duration,
    /// Upper bound on the backoff
    pub max_backoff: Duration,
    /// Multiplier applied per delivery attempt
    pub backoff_factor: f64,
    /// Jitter fraction in `[0, 1]` applied around the computed backoff
    pub jitter: f64,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter: 0.5,
        }
    }
}

impl RetryOptions {
    /// Validate the options
    pub fn validate(&self) -> Result<()> {
        if self.initial_backoff.is_zero() {
            return Err(ConfigError::OutOfRange {
                field: "initial_backoff",
                value: "0s".to_string(),
                requirement: "non-zero",
            }
            .into());
        }
        if self.max_backoff < self.initial_backoff {
            return Err(ConfigError::OutOfRange {
                field: "max_backoff",
                value: format!("{:?}", self.max_backoff),
                requirement: "at least initial_backoff",
            }
            .into());
        }
        if self.backoff_factor < 1.0 {
            return Err(ConfigError::OutOfRange {
                field: "backoff_factor",
                value: self.backoff_factor.to_string(),
                requirement: "at least 1.0",
            }
            .into());
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::OutOfRange {
                field: "jitter",
                value: self.jitter.to_string(),
                requirement: "in [0, 1]",
            }
            .into());
        }
        Ok(())
    }
}

/// Options of a replicated-shard message writer
#[derive(Clone)]
pub struct MessageWriterOptions {
    /// Clock used for cutover/cutoff gating and retry scheduling
    pub clock: ClockFn,
    /// Queue positions visited per lock hold during a retry scan
    pub message_retry_batch_size: usize,
    /// Interval between retry scans
    pub message_queue_scan_interval: Duration,
    /// Poll interval while close waits for the queue to drain
    pub close_check_interval: Duration,
    /// Initial capacity of the acks map
    pub initial_ack_map_capacity: usize,
    /// Recycled messages kept per writer
    pub message_pool_capacity: usize,
    /// Retry backoff parameters
    pub retry: RetryOptions,
}

impl Default for MessageWriterOptions {
    fn default() -> Self {
        Self {
            clock: system_clock(),
            message_retry_batch_size: 128,
            message_queue_scan_interval: Duration::from_secs(1),
            close_check_interval: Duration::from_millis(100),
            initial_ack_map_capacity: 1024,
            message_pool_capacity: 4096,
            retry: RetryOptions::default(),
        }
    }
}

impl MessageWriterOptions {
    /// Validate the options
    pub fn validate(&self) -> Result<()> {
        if self.message_retry_batch_size == 0 {
            return Err(ConfigError::OutOfRange {
                field: "message_retry_batch_size",
                value: "0".to_string(),
                requirement: "greater than zero",
            }
            .into());
        }
        if self.message_queue_scan_interval.is_zero() {
            return Err(ConfigError::OutOfRange {
                field: "message_queue_scan_interval",
                value: "0s".to_string(),
                requirement: "non-zero",
            }
            .into());
        }
        if self.close_check_interval.is_zero() {
            return Err(ConfigError::OutOfRange {
                field: "close_check_interval",
                value: "0s".to_string(),
                requirement: "non-zero",
            }
            .into());
        }
        self.retry.validate()
    }

    /// Replace the clock (primarily for tests)
    pub fn with_clock(mut self, clock: ClockFn) -> Self {
        self.clock = clock;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options_validate() {
        assert!(MessageWriterOptions::default().validate().is_ok());
    }

    #[test]
    fn test_retry_options_validation() {
        let opts = RetryOptions {
            max_backoff: Duration::from_millis(1),
            ..Default::default()
        };
        assert!(opts.validate().is_err());

        let opts = RetryOptions {
            backoff_factor: 0.5,
            ..Default::default()
        };
        assert!(opts.validate().is_err());

        let opts = RetryOptions {
            jitter: 1.5,
            ..Default::default()
        };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_writer_options_validation() {
        let opts = MessageWriterOptions {
            message_retry_batch_size: 0,
            ..Default::default()
        };
        assert!(opts.validate().is_err());
    }
}
