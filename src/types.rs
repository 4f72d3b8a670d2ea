//! Core data types used throughout the coordination layer
//!
//! This module defines the fundamental structures shared by the topology,
//! aggregation, and producer components:
//!
//! # Key Types
//!
//! - **`MetricSample`**: one unaggregated measurement (raw id + value union)
//! - **`MetricType`**: counter | timer | gauge
//! - **`StoragePolicy`**: resolution window + retention for an emission stream
//! - **`Pipeline`**: ordered rollup/transform operations applied to a metric
//! - **`StagedMetadata`**: a time-staged aggregation configuration
//! - **`AggregationKey`**: `(aggregation id, storage policy, pipeline)` —
//!   uniquely identifies one emission stream for a metric
//!
//! # Example
//!
//! ```rust
//! use shardflow::types::{MetricSample, MetricType, StagedMetadata};
//!
//! let sample = MetricSample::counter(b"requests.total".as_ref(), 5);
//! assert_eq!(sample.metric_type(), MetricType::Counter);
//! assert_eq!(sample.value_count(), 1);
//!
//! let metadatas = vec![StagedMetadata::default()];
//! assert!(StagedMetadata::is_default_metadatas(&metadatas));
//! ```

use std::hash::{BuildHasher, Hash, Hasher};
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Metric type of a sample or aggregation element
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    /// Monotonic or delta counter
    Counter,
    /// Batch of timing observations
    Timer,
    /// Last-value gauge
    Gauge,
}

impl std::fmt::Display for MetricType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetricType::Counter => write!(f, "counter"),
            MetricType::Timer => write!(f, "timer"),
            MetricType::Gauge => write!(f, "gauge"),
        }
    }
}

/// Value union carried by a metric sample
#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    /// Counter increment
    Counter(i64),
    /// Batch of timer observations
    Timer(Vec<f64>),
    /// Gauge reading
    Gauge(f64),
}

/// One unaggregated metric sample
///
/// The raw id is refcounted (`Bytes`) because the same id travels through
/// hashing, entry lookup, and element resets without copying.
#[derive(Debug, Clone)]
pub struct MetricSample {
    /// Raw metric identity as transmitted by the client
    pub id: Bytes,
    /// The sample value
    pub value: MetricValue,
}

impl MetricSample {
    /// Create a counter sample
    pub fn counter(id: impl Into<Bytes>, value: i64) -> Self {
        Self {
            id: id.into(),
            value: MetricValue::Counter(value),
        }
    }

    /// Create a timer sample from a batch of observations
    pub fn timer(id: impl Into<Bytes>, values: Vec<f64>) -> Self {
        Self {
            id: id.into(),
            value: MetricValue::Timer(values),
        }
    }

    /// Create a gauge sample
    pub fn gauge(id: impl Into<Bytes>, value: f64) -> Self {
        Self {
            id: id.into(),
            value: MetricValue::Gauge(value),
        }
    }

    /// Metric type of this sample
    pub fn metric_type(&self) -> MetricType {
        match self.value {
            MetricValue::Counter(_) => MetricType::Counter,
            MetricValue::Timer(_) => MetricType::Timer,
            MetricValue::Gauge(_) => MetricType::Gauge,
        }
    }

    /// Number of individual values carried by the sample
    ///
    /// Timers contribute their batch length; counters and gauges count as
    /// one. Used as the cost of the per-metric value rate limit.
    pub fn value_count(&self) -> usize {
        match &self.value {
            MetricValue::Timer(values) => values.len(),
            _ => 1,
        }
    }
}

/// Storage policy: resolution window and retention of an emission stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoragePolicy {
    /// Aggregation window the values are bucketed into
    pub resolution: Duration,
    /// How long the aggregated stream is kept
    pub retention: Duration,
}

impl StoragePolicy {
    /// Create a storage policy
    pub fn new(resolution: Duration, retention: Duration) -> Self {
        Self {
            resolution,
            retention,
        }
    }
}

/// Compressed set of aggregation functions applied to a metric
///
/// The zero value selects the platform defaults for the metric type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct AggregationId(pub u64);

impl AggregationId {
    /// Whether this id selects the default aggregation set
    pub fn is_default(&self) -> bool {
        self.0 == 0
    }
}

/// A single operation in an applied pipeline
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PipelineOp {
    /// Apply a named transformation to the stream
    Transform(String),
    /// Roll the stream up into a new metric id with an aggregation set
    Rollup {
        /// Id of the rollup metric the stream feeds
        id: Bytes,
        /// Aggregations applied at the rollup
        aggregation_id: AggregationId,
    },
}

/// Ordered list of operations applied to a metric under a storage policy
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Pipeline {
    /// Operations in application order
    pub ops: Vec<PipelineOp>,
}

impl Pipeline {
    /// The empty pipeline (plain aggregation, no rollups)
    pub fn empty() -> Self {
        Self::default()
    }

    /// Whether the pipeline has no operations
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// One pipeline along with the aggregation id and storage policies it
/// applies under
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineMetadata {
    /// Aggregation functions for this pipeline
    pub aggregation_id: AggregationId,
    /// Storage policies the pipeline emits under; empty selects the
    /// configured defaults
    pub storage_policies: Vec<StoragePolicy>,
    /// The applied pipeline
    pub pipeline: Pipeline,
}

impl Default for PipelineMetadata {
    fn default() -> Self {
        Self {
            aggregation_id: AggregationId::default(),
            storage_policies: Vec::new(),
            pipeline: Pipeline::empty(),
        }
    }
}

impl PipelineMetadata {
    /// Whether this pipeline metadata is the default configuration
    pub fn is_default(&self) -> bool {
        self.aggregation_id.is_default()
            && self.storage_policies.is_empty()
            && self.pipeline.is_empty()
    }
}

/// A staged aggregation configuration, valid from its cutover time onward
#[derive(Debug, Clone, PartialEq)]
pub struct StagedMetadata {
    /// Time (nanoseconds) at which this configuration takes effect
    pub cutover_nanos: i64,
    /// Whether the metric has been tombstoned by this stage
    pub tombstoned: bool,
    /// Pipelines active from the cutover
    pub pipelines: Vec<PipelineMetadata>,
}

impl Default for StagedMetadata {
    fn default() -> Self {
        Self {
            cutover_nanos: 0,
            tombstoned: false,
            pipelines: vec![PipelineMetadata::default()],
        }
    }
}

impl StagedMetadata {
    /// Whether this stage is the default configuration
    pub fn is_default(&self) -> bool {
        self.cutover_nanos == 0
            && !self.tombstoned
            && self.pipelines.len() == 1
            && self.pipelines[0].is_default()
    }

    /// Whether a staged metadata list is the single default stage
    ///
    /// The common case for metrics with no custom mapping rules; entries
    /// take a fast write path when both the cached and incoming metadata
    /// are default.
    pub fn is_default_metadatas(metadatas: &[StagedMetadata]) -> bool {
        metadatas.len() == 1 && metadatas[0].is_default()
    }
}

/// Uniquely identifies one emission stream for a metric
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationKey {
    /// Aggregation functions
    pub aggregation_id: AggregationId,
    /// Storage policy of the stream
    pub storage_policy: StoragePolicy,
    /// Applied pipeline
    pub pipeline: Pipeline,
}

/// 128-bit hash of a raw metric id
///
/// Two fixed-seed 64-bit hashes are combined so the entry key is wide
/// enough to make cross-metric collisions irrelevant at per-shard
/// cardinalities.
pub fn hash_metric_id(id: &[u8]) -> u128 {
    let lo_state = ahash::RandomState::with_seeds(
        0x243f_6a88_85a3_08d3,
        0x1319_8a2e_0370_7344,
        0xa409_3822_299f_31d0,
        0x082e_fa98_ec4e_6c89,
    );
    let hi_state = ahash::RandomState::with_seeds(
        0x4528_21e6_38d0_1377,
        0xbe54_66cf_34e9_0c6c,
        0xc0ac_29b7_c97c_50dd,
        0x3f84_d5b5_b547_0917,
    );

    let mut lo = lo_state.build_hasher();
    id.hash(&mut lo);
    let mut hi = hi_state.build_hasher();
    id.hash(&mut hi);
    ((hi.finish() as u128) << 64) | (lo.finish() as u128)
}
