//! Per-resolution element lists
//!
//! Every aggregation element lives in the list of its storage policy's
//! resolution window. The flush side drains these lists per window; here
//! the lists track membership, prune tombstoned elements back to their
//! pools, and report the number of live elements per tick.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::aggregator::element::{ElementPools, SharedElement};
use crate::error::AggregationError;

/// Elements sharing one resolution window
#[derive(Debug)]
pub struct MetricList {
    resolution: Duration,
    elems: Mutex<Vec<SharedElement>>,
}

impl MetricList {
    fn new(resolution: Duration) -> Self {
        Self {
            resolution,
            elems: Mutex::new(Vec::new()),
        }
    }

    /// Resolution window of this list
    pub fn resolution(&self) -> Duration {
        self.resolution
    }

    /// Append an element to the list
    pub fn push(&self, elem: SharedElement) {
        self.elems.lock().push(elem);
    }

    /// Number of elements currently in the list
    pub fn len(&self) -> usize {
        self.elems.lock().len()
    }

    /// Whether the list holds no elements
    pub fn is_empty(&self) -> bool {
        self.elems.lock().is_empty()
    }

    /// Drop tombstoned elements into the pools, returning the live count
    fn prune(&self, pools: &ElementPools) -> usize {
        let mut removed = Vec::new();
        let mut elems = self.elems.lock();
        elems.retain(|elem| {
            if elem.lock().is_tombstoned() {
                removed.push(Arc::clone(elem));
                false
            } else {
                true
            }
        });
        let live = elems.len();
        drop(elems);

        for elem in removed {
            pools.put(elem);
        }
        live
    }
}

/// All resolution lists of one shard
pub struct MetricLists {
    shard: u32,
    lists: DashMap<Duration, Arc<MetricList>>,
    pools: Arc<ElementPools>,
    closed: AtomicBool,
}

impl MetricLists {
    /// Create the lists for a shard
    pub fn new(shard: u32, pools: Arc<ElementPools>) -> Self {
        Self {
            shard,
            lists: DashMap::new(),
            pools,
            closed: AtomicBool::new(false),
        }
    }

    /// Shard these lists belong to
    pub fn shard(&self) -> u32 {
        self.shard
    }

    /// Number of distinct resolution lists
    pub fn num_lists(&self) -> usize {
        self.lists.len()
    }

    /// Find the list for a resolution, creating it on first use
    pub fn find_or_create(
        &self,
        resolution: Duration,
    ) -> Result<Arc<MetricList>, AggregationError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AggregationError::MetricMapClosed);
        }
        let list = self
            .lists
            .entry(resolution)
            .or_insert_with(|| Arc::new(MetricList::new(resolution)))
            .clone();
        Ok(list)
    }

    /// Prune tombstoned elements from every list, returning the total live
    /// element count
    pub fn tick(&self) -> usize {
        let mut active = 0;
        for entry in self.lists.iter() {
            active += entry.value().prune(&self.pools);
        }
        active
    }

    /// Reject further list creation
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
