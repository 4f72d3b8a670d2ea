//! Error types for the coordination core

use thiserror::Error;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    /// Topology error
    #[error("Topology error: {0}")]
    Topology(#[from] TopologyError),

    /// Aggregation error
    #[error("Aggregation error: {0}")]
    Aggregation(#[from] AggregationError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// General error
    #[error("{0}")]
    General(String),
}

/// Errors raised while loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file could not be read
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration contents could not be parsed
    #[error("Failed to parse config: {0}")]
    Parse(String),

    /// Value is outside its allowed range
    #[error("{field} value {value} is out of range (must be {requirement})")]
    OutOfRange {
        /// Field being validated
        field: &'static str,
        /// The invalid value
        value: String,
        /// The requirement it violates
        requirement: &'static str,
    },

    /// A required value is missing or empty
    #[error("Missing required value: {0}")]
    Missing(&'static str),
}

/// Errors raised while constructing or interpreting a placement snapshot
#[derive(Error, Debug)]
pub enum TopologyError {
    /// Replication factor must be at least one
    #[error("Invalid replication factor: {0}")]
    InvalidReplicaFactor(usize),

    /// Placement must cover at least one shard
    #[error("Invalid shard count: {0}")]
    InvalidShardCount(u32),

    /// A host claims a shard id outside the placement's shard space
    #[error("Shard {shard} assigned to host '{host}' is out of range (total {total})")]
    ShardOutOfRange {
        /// Offending host
        host: String,
        /// Offending shard id
        shard: u32,
        /// Total shard count of the placement
        total: u32,
    },

    /// A host appears more than once in the placement
    #[error("Duplicate host in placement: {0}")]
    DuplicateHost(String),
}

/// Errors raised by the shard entry map and its entries
///
/// Rate-limit, input-validation, and closed-state failures are reported
/// immediately and do not mutate entry state.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationError {
    /// Operation on an entry that has been torn down
    #[error("entry is closed")]
    EntryClosed,

    /// Operation on a shard entry map after shutdown
    #[error("metric map is already closed")]
    MetricMapClosed,

    /// The staged metadata list is empty
    #[error("empty metadata list")]
    EmptyMetadatas,

    /// No staged metadata has cut over yet
    #[error("no applicable metadata")]
    NoApplicableMetadata,

    /// The active staged metadata carries no pipelines
    #[error("no pipelines in metadata")]
    NoPipelinesInMetadata,

    /// Per-metric value rate limit was exceeded
    #[error("write value rate limit is exceeded")]
    ValueRateLimitExceeded,

    /// Per-shard new-metric rate limit was exceeded
    #[error("write new metric rate limit is exceeded")]
    NewMetricRateLimitExceeded,

    /// A sample was routed to an element of a different metric type
    #[error("invalid metric type")]
    InvalidMetricType,
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
