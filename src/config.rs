//! Configuration management
//!
//! TOML configuration with per-field defaults, mapped into the typed
//! option structs the components take at construction.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::aggregator::{AggregatorOptions, RuntimeOptions};
use crate::error::{ConfigError, Result};
use crate::producer::{MessageWriterOptions, RetryOptions};
use crate::types::StoragePolicy;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Shard aggregation configuration
    #[serde(default)]
    pub aggregator: AggregatorConfig,

    /// Replicated message writer configuration
    #[serde(default)]
    pub message_writer: MessageWriterConfig,
}

/// One storage policy in configuration form
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoragePolicyConfig {
    /// Aggregation window in seconds
    pub resolution_secs: u64,
    /// Retention in seconds
    pub retention_secs: u64,
}

/// Shard aggregation configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AggregatorConfig {
    /// Idle seconds before an entry is eligible for expiration
    #[serde(default = "default_entry_ttl_secs")]
    pub entry_ttl_secs: u64,

    /// Fraction of live entries scanned per sub-batch during a tick
    #[serde(default = "default_entry_check_batch_percent")]
    pub entry_check_batch_percent: f64,

    /// Seconds between background ticks
    #[serde(default = "default_entry_check_interval_secs")]
    pub entry_check_interval_secs: u64,

    /// Split timer batches larger than this per write; `0` disables
    #[serde(default)]
    pub max_timer_batch_size_per_write: usize,

    /// Storage policies applied when metadata selects the defaults
    #[serde(default = "default_storage_policies")]
    pub default_storage_policies: Vec<StoragePolicyConfig>,

    /// Per-metric value rate cap (values/second); `<= 0` disables
    #[serde(default)]
    pub write_values_per_metric_limit_per_second: i64,

    /// Per-shard new-metric insertion cap (inserts/second); `<= 0` disables
    #[serde(default)]
    pub write_new_metric_limit_per_shard_per_second: i64,

    /// Seconds from the first insert during which the new-metric limit is
    /// suppressed
    #[serde(default)]
    pub write_new_metric_no_limit_warmup_secs: u64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            entry_ttl_secs: default_entry_ttl_secs(),
            entry_check_batch_percent: default_entry_check_batch_percent(),
            entry_check_interval_secs: default_entry_check_interval_secs(),
            max_timer_batch_size_per_write: 0,
            default_storage_policies: default_storage_policies(),
            write_values_per_metric_limit_per_second: 0,
            write_new_metric_limit_per_shard_per_second: 0,
            write_new_metric_no_limit_warmup_secs: 0,
        }
    }
}

/// Replicated message writer configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MessageWriterConfig {
    /// Queue positions visited per lock hold during a retry scan
    #[serde(default = "default_message_retry_batch_size")]
    pub message_retry_batch_size: usize,

    /// Milliseconds between retry scans
    #[serde(default = "default_message_queue_scan_interval_ms")]
    pub message_queue_scan_interval_ms: u64,

    /// Milliseconds between queue-drain polls while closing
    #[serde(default = "default_close_check_interval_ms")]
    pub close_check_interval_ms: u64,

    /// Backoff milliseconds before the second delivery attempt
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Upper bound on the backoff in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Multiplier applied per delivery attempt
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Jitter fraction in `[0, 1]`
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for MessageWriterConfig {
    fn default() -> Self {
        Self {
            message_retry_batch_size: default_message_retry_batch_size(),
            message_queue_scan_interval_ms: default_message_queue_scan_interval_ms(),
            close_check_interval_ms: default_close_check_interval_ms(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_factor: default_backoff_factor(),
            jitter: default_jitter(),
        }
    }
}

fn default_entry_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_entry_check_batch_percent() -> f64 {
    0.01
}

fn default_entry_check_interval_secs() -> u64 {
    60
}

fn default_storage_policies() -> Vec<StoragePolicyConfig> {
    vec![
        StoragePolicyConfig {
            resolution_secs: 10,
            retention_secs: 2 * 24 * 60 * 60,
        },
        StoragePolicyConfig {
            resolution_secs: 60,
            retention_secs: 40 * 24 * 60 * 60,
        },
    ]
}

fn default_message_retry_batch_size() -> usize {
    128
}

fn default_message_queue_scan_interval_ms() -> u64 {
    1_000
}

fn default_close_check_interval_ms() -> u64 {
    100
}

fn default_initial_backoff_ms() -> u64 {
    1_000
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.5
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(ConfigError::Io)?;
        Self::from_toml(&contents)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.aggregator_options().validate()?;
        self.message_writer_options().validate()?;
        Ok(())
    }

    /// Typed options for the shard aggregation map
    pub fn aggregator_options(&self) -> AggregatorOptions {
        AggregatorOptions {
            entry_ttl: Duration::from_secs(self.aggregator.entry_ttl_secs),
            entry_check_batch_percent: self.aggregator.entry_check_batch_percent,
            max_timer_batch_size_per_write: self.aggregator.max_timer_batch_size_per_write,
            default_storage_policies: self
                .aggregator
                .default_storage_policies
                .iter()
                .map(|p| {
                    StoragePolicy::new(
                        Duration::from_secs(p.resolution_secs),
                        Duration::from_secs(p.retention_secs),
                    )
                })
                .collect(),
            ..Default::default()
        }
    }

    /// Typed runtime options for the shard aggregation map
    pub fn runtime_options(&self) -> RuntimeOptions {
        RuntimeOptions {
            write_values_per_metric_limit_per_second: self
                .aggregator
                .write_values_per_metric_limit_per_second,
            write_new_metric_limit_per_shard_per_second: self
                .aggregator
                .write_new_metric_limit_per_shard_per_second,
            write_new_metric_no_limit_warmup: Duration::from_secs(
                self.aggregator.write_new_metric_no_limit_warmup_secs,
            ),
        }
    }

    /// Interval between background ticks
    pub fn entry_check_interval(&self) -> Duration {
        Duration::from_secs(self.aggregator.entry_check_interval_secs)
    }

    /// Typed options for replicated message writers
    pub fn message_writer_options(&self) -> MessageWriterOptions {
        MessageWriterOptions {
            message_retry_batch_size: self.message_writer.message_retry_batch_size,
            message_queue_scan_interval: Duration::from_millis(
                self.message_writer.message_queue_scan_interval_ms,
            ),
            close_check_interval: Duration::from_millis(
                self.message_writer.close_check_interval_ms,
            ),
            retry: RetryOptions {
                initial_backoff: Duration::from_millis(self.message_writer.initial_backoff_ms),
                max_backoff: Duration::from_millis(self.message_writer.max_backoff_ms),
                backoff_factor: self.message_writer.backoff_factor,
                jitter: self.message_writer.jitter,
            },
            ..Default::default()
        }
    }
}
