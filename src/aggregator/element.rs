//! Aggregation elements
//!
//! An element is one emission stream of one metric: the unique combination
//! of metric identity, aggregation id, storage policy, and applied
//! pipeline. Entries bind samples to elements; the flush side (out of
//! scope here) drains them per resolution window. Elements carry only
//! trivial accumulation state — enough for bindings, tombstoning, and list
//! membership to be observable.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::AggregationError;
use crate::pool::Pool;
use crate::types::{AggregationId, MetricType, MetricValue, Pipeline, StoragePolicy};

/// Element shared between an entry's bindings and its resolution list
pub type SharedElement = Arc<Mutex<Element>>;

/// One emission stream of one metric
#[derive(Debug)]
pub struct Element {
    kind: MetricType,
    id: Bytes,
    aggregation_id: AggregationId,
    storage_policy: StoragePolicy,
    pipeline: Pipeline,
    tombstoned: bool,
    num_values: u64,
    sum: f64,
    last: f64,
}

impl Element {
    /// Create an empty element of a metric type
    pub fn new(kind: MetricType) -> Self {
        Self {
            kind,
            id: Bytes::new(),
            aggregation_id: AggregationId::default(),
            storage_policy: StoragePolicy::new(
                std::time::Duration::from_secs(1),
                std::time::Duration::from_secs(1),
            ),
            pipeline: Pipeline::empty(),
            tombstoned: false,
            num_values: 0,
            sum: 0.0,
            last: 0.0,
        }
    }

    /// Reset the element for a new binding
    ///
    /// Leaves the element open with zeroed accumulation state; the pipeline
    /// is an owned copy because incoming pipelines are not owned by the
    /// entry.
    pub fn reset(
        &mut self,
        id: Bytes,
        aggregation_id: AggregationId,
        storage_policy: StoragePolicy,
        pipeline: Pipeline,
    ) {
        self.id = id;
        self.aggregation_id = aggregation_id;
        self.storage_policy = storage_policy;
        self.pipeline = pipeline;
        self.tombstoned = false;
        self.num_values = 0;
        self.sum = 0.0;
        self.last = 0.0;
    }

    /// Fold one sample value into the element
    ///
    /// The value union must match the element's metric type.
    pub fn add_sample(&mut self, value: &MetricValue) -> Result<(), AggregationError> {
        match (self.kind, value) {
            (MetricType::Counter, MetricValue::Counter(v)) => {
                self.num_values += 1;
                self.sum += *v as f64;
            }
            (MetricType::Timer, MetricValue::Timer(values)) => {
                self.num_values += values.len() as u64;
                self.sum += values.iter().sum::<f64>();
            }
            (MetricType::Gauge, MetricValue::Gauge(v)) => {
                self.num_values += 1;
                self.last = *v;
            }
            _ => return Err(AggregationError::InvalidMetricType),
        }
        Ok(())
    }

    /// Mark the element tombstoned
    ///
    /// A tombstoned element flushes remaining data and is discarded by its
    /// resolution list.
    pub fn mark_tombstoned(&mut self) {
        self.tombstoned = true;
    }

    /// Whether the element is tombstoned
    pub fn is_tombstoned(&self) -> bool {
        self.tombstoned
    }

    /// Metric type of the element
    pub fn kind(&self) -> MetricType {
        self.kind
    }

    /// Raw metric id of the element
    pub fn id(&self) -> Bytes {
        self.id.clone()
    }

    /// Storage policy of the element's stream
    pub fn storage_policy(&self) -> StoragePolicy {
        self.storage_policy
    }

    /// Number of values folded in since the last reset
    pub fn num_values(&self) -> u64 {
        self.num_values
    }
}

/// Type-specific element pools
///
/// Each metric type recycles its own elements so a reset element always
/// has the right kind for the binding that acquires it.
pub struct ElementPools {
    counter: Pool<SharedElement>,
    timer: Pool<SharedElement>,
    gauge: Pool<SharedElement>,
}

impl ElementPools {
    /// Create pools holding at most `capacity` elements per type
    pub fn new(capacity: usize) -> Self {
        Self {
            counter: Pool::new(capacity, || {
                Arc::new(Mutex::new(Element::new(MetricType::Counter)))
            }),
            timer: Pool::new(capacity, || {
                Arc::new(Mutex::new(Element::new(MetricType::Timer)))
            }),
            gauge: Pool::new(capacity, || {
                Arc::new(Mutex::new(Element::new(MetricType::Gauge)))
            }),
        }
    }

    /// Acquire an element of the given type
    pub fn get(&self, kind: MetricType) -> SharedElement {
        match kind {
            MetricType::Counter => self.counter.get(),
            MetricType::Timer => self.timer.get(),
            MetricType::Gauge => self.gauge.get(),
        }
    }

    /// Return an element to its type's pool
    ///
    /// Elements still referenced elsewhere are dropped instead of pooled.
    pub fn put(&self, elem: SharedElement) {
        if Arc::strong_count(&elem) != 1 {
            return;
        }
        let kind = elem.lock().kind();
        match kind {
            MetricType::Counter => self.counter.put(elem),
            MetricType::Timer => self.timer.put(elem),
            MetricType::Gauge => self.gauge.put(elem),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_policy() -> StoragePolicy {
        StoragePolicy::new(Duration::from_secs(10), Duration::from_secs(3600))
    }

    #[test]
    fn test_element_accumulates_matching_values() {
        let mut elem = Element::new(MetricType::Counter);
        elem.reset(
            Bytes::from_static(b"c"),
            AggregationId::default(),
            test_policy(),
            Pipeline::empty(),
        );

        elem.add_sample(&MetricValue::Counter(3)).unwrap();
        elem.add_sample(&MetricValue::Counter(4)).unwrap();
        assert_eq!(elem.num_values(), 2);

        let err = elem.add_sample(&MetricValue::Gauge(1.0)).unwrap_err();
        assert_eq!(err, AggregationError::InvalidMetricType);
    }

    #[test]
    fn test_timer_batch_counts_every_value() {
        let mut elem = Element::new(MetricType::Timer);
        elem.reset(
            Bytes::from_static(b"t"),
            AggregationId::default(),
            test_policy(),
            Pipeline::empty(),
        );
        elem.add_sample(&MetricValue::Timer(vec![1.0, 2.0, 3.0]))
            .unwrap();
        assert_eq!(elem.num_values(), 3);
    }

    #[test]
    fn test_reset_clears_tombstone_and_state() {
        let mut elem = Element::new(MetricType::Gauge);
        elem.reset(
            Bytes::from_static(b"g"),
            AggregationId::default(),
            test_policy(),
            Pipeline::empty(),
        );
        elem.add_sample(&MetricValue::Gauge(5.0)).unwrap();
        elem.mark_tombstoned();
        assert!(elem.is_tombstoned());

        elem.reset(
            Bytes::from_static(b"g2"),
            AggregationId::default(),
            test_policy(),
            Pipeline::empty(),
        );
        assert!(!elem.is_tombstoned());
        assert_eq!(elem.num_values(), 0);
        assert_eq!(elem.id(), Bytes::from_static(b"g2"));
    }

    #[test]
    fn test_pools_recycle_by_type() {
        let pools = ElementPools::new(8);
        let elem = pools.get(MetricType::Timer);
        assert_eq!(elem.lock().kind(), MetricType::Timer);
        pools.put(elem);

        let again = pools.get(MetricType::Timer);
        assert_eq!(again.lock().kind(), MetricType::Timer);
    }

    #[test]
    fn test_pool_put_skips_shared_elements() {
        let pools = ElementPools::new(8);
        let elem = pools.get(MetricType::Counter);
        let _second_ref = Arc::clone(&elem);
        pools.put(elem);
        // Still referenced, so nothing was recycled.
        assert_eq!(pools.counter.len(), 0);
    }
}
