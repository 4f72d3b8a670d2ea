//! Per-metric aggregation entry
//!
//! An entry tracks one metric identity on one shard: the staged metadata it
//! last applied, the aggregation-key bindings derived from it, and the
//! rate-limit state for its values. Entries are recycled through a pool;
//! the owning map resets them on insert and expires them when idle.
//!
//! # Locking
//!
//! The process-wide time lock is held in shared mode for the duration of
//! every write so no write observes a current time that a flush has already
//! passed. Within the entry, the common path takes the entry lock shared
//! and only upgrades to exclusive when the metadata bindings must change.
//! `writer_count` and `last_access_nanos` are atomics so the map can check
//! expiration eligibility without taking the entry lock.

use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::aggregator::element::{ElementPools, SharedElement};
use crate::aggregator::metric_list::MetricLists;
use crate::aggregator::metrics::EntryMetrics;
use crate::aggregator::{AggregatorOptions, RuntimeOptions};
use crate::error::AggregationError;
use crate::rate::RateLimiter;
use crate::types::{
    AggregationId, AggregationKey, MetricSample, MetricValue, Pipeline, StagedMetadata,
    StoragePolicy,
};

const INITIAL_AGGREGATION_CAPACITY: usize = 2;

/// Cutover sentinel for an entry that has not applied any metadata yet
const UNINITIALIZED_CUTOVER_NANOS: i64 = i64::MIN;

/// One aggregation-key binding: the key and the element it feeds
#[derive(Clone)]
struct AggregationBinding {
    key: AggregationKey,
    elem: SharedElement,
}

struct EntryInner {
    closed: bool,
    has_default_metadatas: bool,
    cutover_nanos: i64,
    aggregations: Vec<AggregationBinding>,
    rate_limiter: Option<RateLimiter>,
    lists: Option<Arc<MetricLists>>,
}

/// Per-metric aggregation state
pub struct Entry {
    opts: Arc<AggregatorOptions>,
    pools: Arc<ElementPools>,
    metrics: Arc<EntryMetrics>,
    inner: RwLock<EntryInner>,
    num_writers: AtomicI32,
    last_access_nanos: AtomicI64,
}

impl Entry {
    /// Create a closed entry; the owning map opens it with [`Entry::reset`]
    pub fn new(
        opts: Arc<AggregatorOptions>,
        pools: Arc<ElementPools>,
        metrics: Arc<EntryMetrics>,
    ) -> Self {
        Self {
            opts,
            pools,
            metrics,
            inner: RwLock::new(EntryInner {
                closed: true,
                has_default_metadatas: false,
                cutover_nanos: UNINITIALIZED_CUTOVER_NANOS,
                aggregations: Vec::with_capacity(INITIAL_AGGREGATION_CAPACITY),
                rate_limiter: None,
                lists: None,
            }),
            num_writers: AtomicI32::new(0),
            last_access_nanos: AtomicI64::new(0),
        }
    }

    /// Reset the entry for reuse and open it
    pub fn reset(&self, lists: Arc<MetricLists>, runtime: &RuntimeOptions) {
        let mut inner = self.inner.write();
        inner.closed = false;
        inner.has_default_metadatas = false;
        inner.cutover_nanos = UNINITIALIZED_CUTOVER_NANOS;
        inner.aggregations.clear();
        inner.lists = Some(lists);
        reset_rate_limiter(&mut inner, runtime, &self.opts);
        drop(inner);

        self.num_writers.store(0, Ordering::Release);
        self.record_last_accessed((self.opts.clock)());
    }

    /// Update the entry's value rate limiter
    pub fn set_runtime_options(&self, runtime: &RuntimeOptions) {
        let mut inner = self.inner.write();
        if inner.closed {
            return;
        }
        reset_rate_limiter(&mut inner, runtime, &self.opts);
    }

    /// Increase the writer count
    pub fn inc_writer(&self) {
        self.num_writers.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrease the writer count
    pub fn dec_writer(&self) {
        self.num_writers.fetch_sub(1, Ordering::AcqRel);
    }

    /// Number of writers currently using the entry
    pub fn writer_count(&self) -> i32 {
        self.num_writers.load(Ordering::Acquire)
    }

    /// Time the entry was last written to, in nanoseconds
    pub fn last_access_nanos(&self) -> i64 {
        self.last_access_nanos.load(Ordering::Acquire)
    }

    /// Number of live aggregation-key bindings
    pub fn num_aggregations(&self) -> usize {
        self.inner.read().aggregations.len()
    }

    /// Ingest one untimed sample with its staged metadatas
    pub fn add_untimed(
        &self,
        sample: &MetricSample,
        metadatas: &[StagedMetadata],
    ) -> Result<(), AggregationError> {
        match &sample.value {
            MetricValue::Timer(values) => {
                self.apply_value_rate_limit(values.len() as i64)?;
                self.write_timer_batches(sample, values, metadatas)
            }
            _ => {
                // Counters and gauges carry a single value.
                self.apply_value_rate_limit(1)?;
                self.add_sample_with_metadatas(sample, metadatas)
            }
        }
    }

    /// Whether the entry is eligible for expiration
    ///
    /// An entry expires only when no writer is using it and it has been
    /// idle past the configured TTL.
    pub fn should_expire(&self, now_nanos: i64) -> bool {
        if self.inner.read().closed {
            return false;
        }
        self.idle_past_ttl(now_nanos)
    }

    /// Try to expire the entry
    ///
    /// On success the entry is closed, all bound elements are tombstoned,
    /// and the caller removes it from the map and recycles it.
    pub fn try_expire(&self, now_nanos: i64) -> bool {
        let mut inner = self.inner.write();
        if inner.closed || !self.idle_past_ttl(now_nanos) {
            return false;
        }
        inner.closed = true;
        for binding in &inner.aggregations {
            binding.elem.lock().mark_tombstoned();
        }
        inner.aggregations.clear();
        inner.lists = None;
        true
    }

    fn idle_past_ttl(&self, now_nanos: i64) -> bool {
        self.writer_count() == 0
            && now_nanos.saturating_sub(self.last_access_nanos())
                > self.opts.entry_ttl.as_nanos() as i64
    }

    fn record_last_accessed(&self, now_nanos: i64) {
        self.last_access_nanos.store(now_nanos, Ordering::Release);
    }

    /// Split large timer batches per the configured maximum
    fn write_timer_batches(
        &self,
        sample: &MetricSample,
        values: &[f64],
        metadatas: &[StagedMetadata],
    ) -> Result<(), AggregationError> {
        let max_batch = self.opts.max_timer_batch_size_per_write;
        if max_batch == 0 {
            return self.add_sample_with_metadatas(sample, metadatas);
        }
        for chunk in values.chunks(max_batch) {
            let split = MetricSample::timer(sample.id.clone(), chunk.to_vec());
            self.add_sample_with_metadatas(&split, metadatas)?;
        }
        Ok(())
    }

    fn add_sample_with_metadatas(
        &self,
        sample: &MetricSample,
        metadatas: &[StagedMetadata],
    ) -> Result<(), AggregationError> {
        // Determining the current time within the time lock guarantees no
        // sample is admitted for a time the flush side has already passed.
        let _time_guard = self.opts.time_lock.read();
        let now_nanos = (self.opts.clock)();
        self.record_last_accessed(now_nanos);

        let has_default = StagedMetadata::is_default_metadatas(metadatas);
        {
            let inner = self.inner.read();
            if inner.closed {
                return Err(AggregationError::EntryClosed);
            }

            // Fast path: default cached metadata and default incoming
            // metadata means the bindings cannot have changed.
            if inner.has_default_metadatas && has_default {
                return self.add_to_bindings(&inner.aggregations, sample);
            }

            let sm = self.active_staged_metadata(now_nanos, metadatas)?;

            // A tombstoned (rollup) metric is not ingested, but the entry's
            // bindings are left alone: a different raw metric may still be
            // feeding this same entry.
            if sm.tombstoned {
                self.metrics.record_tombstoned_metadata();
                return Ok(());
            }
            if sm.pipelines.is_empty() {
                self.metrics.record_no_pipelines_in_metadata();
                return Err(AggregationError::NoPipelinesInMetadata);
            }

            if !self.should_update_metadatas(&inner, sm) {
                return self.add_to_bindings(&inner.aggregations, sample);
            }
        }

        let sm = self.active_staged_metadata(now_nanos, metadatas)?;
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(AggregationError::EntryClosed);
        }
        // Re-check under the exclusive lock: a racing writer may have
        // applied the same metadata while the shared lock was released.
        if self.should_update_metadatas(&inner, sm) {
            self.update_metadatas(&mut inner, sample, has_default, sm)?;
        }
        self.add_to_bindings(&inner.aggregations, sample)
    }

    /// Select the active staged metadata for the current time
    ///
    /// Metadatas are sorted by cutover ascending; the active one is the
    /// last whose cutover is at or before now.
    fn active_staged_metadata<'a>(
        &self,
        now_nanos: i64,
        metadatas: &'a [StagedMetadata],
    ) -> Result<&'a StagedMetadata, AggregationError> {
        if metadatas.is_empty() {
            self.metrics.record_empty_metadatas();
            return Err(AggregationError::EmptyMetadatas);
        }
        for sm in metadatas.iter().rev() {
            if sm.cutover_nanos <= now_nanos {
                return Ok(sm);
            }
        }
        self.metrics.record_no_applicable_metadata();
        Err(AggregationError::NoApplicableMetadata)
    }

    /// Whether the cached bindings must be rebuilt for this metadata
    fn should_update_metadatas(&self, inner: &EntryInner, sm: &StagedMetadata) -> bool {
        if inner.cutover_nanos > sm.cutover_nanos {
            self.metrics.record_stale_metadata();
            return false;
        }
        if inner.cutover_nanos < sm.cutover_nanos {
            return true;
        }

        // Same cutover: update only if the derived key set differs from the
        // cached one. Duplicate keys in the incoming metadata are fine as
        // long as both sets cover each other.
        let mut covered = vec![false; inner.aggregations.len()];
        for pm in &sm.pipelines {
            for policy in self.storage_policies(&pm.storage_policies) {
                match binding_index(
                    &inner.aggregations,
                    pm.aggregation_id,
                    *policy,
                    &pm.pipeline,
                ) {
                    Some(idx) => covered[idx] = true,
                    None => return true,
                }
            }
        }
        !covered.iter().all(|seen| *seen)
    }

    /// Rebuild the binding set from the active staged metadata
    ///
    /// Atomic with respect to failure: the cached bindings are replaced
    /// only after every new element has been allocated and reset; elements
    /// created before a failure are tombstoned so the lists do not leak.
    fn update_metadatas(
        &self,
        inner: &mut EntryInner,
        sample: &MetricSample,
        has_default: bool,
        sm: &StagedMetadata,
    ) -> Result<(), AggregationError> {
        let lists = match inner.lists.as_ref() {
            Some(lists) => Arc::clone(lists),
            None => return Err(AggregationError::EntryClosed),
        };
        let kind = sample.metric_type();
        let mut new_aggregations: Vec<AggregationBinding> =
            Vec::with_capacity(INITIAL_AGGREGATION_CAPACITY);
        let mut created: Vec<SharedElement> = Vec::new();

        let mut build = || -> Result<(), AggregationError> {
            for pm in &sm.pipelines {
                for policy in self.storage_policies(&pm.storage_policies) {
                    if binding_index(&new_aggregations, pm.aggregation_id, *policy, &pm.pipeline)
                        .is_some()
                    {
                        continue;
                    }
                    if let Some(idx) = binding_index(
                        &inner.aggregations,
                        pm.aggregation_id,
                        *policy,
                        &pm.pipeline,
                    ) {
                        new_aggregations.push(inner.aggregations[idx].clone());
                        continue;
                    }

                    let elem = self.pools.get(kind);
                    elem.lock().reset(
                        sample.id.clone(),
                        pm.aggregation_id,
                        *policy,
                        pm.pipeline.clone(),
                    );
                    let list = lists.find_or_create(policy.resolution)?;
                    list.push(Arc::clone(&elem));
                    created.push(Arc::clone(&elem));
                    new_aggregations.push(AggregationBinding {
                        key: AggregationKey {
                            aggregation_id: pm.aggregation_id,
                            storage_policy: *policy,
                            pipeline: pm.pipeline.clone(),
                        },
                        elem,
                    });
                }
            }
            Ok(())
        };

        if let Err(err) = build() {
            for elem in created {
                elem.lock().mark_tombstoned();
            }
            return Err(err);
        }

        // Mark outdated bindings tombstoned so their elements flush and go.
        for binding in &inner.aggregations {
            if binding_index(
                &new_aggregations,
                binding.key.aggregation_id,
                binding.key.storage_policy,
                &binding.key.pipeline,
            )
            .is_none()
            {
                binding.elem.lock().mark_tombstoned();
            }
        }

        inner.aggregations = new_aggregations;
        inner.has_default_metadatas = has_default;
        inner.cutover_nanos = sm.cutover_nanos;
        self.metrics.record_metadata_update();
        Ok(())
    }

    /// Append the sample to every bound element
    ///
    /// Every binding is attempted; the first error is reported.
    fn add_to_bindings(
        &self,
        aggregations: &[AggregationBinding],
        sample: &MetricSample,
    ) -> Result<(), AggregationError> {
        let mut result = Ok(());
        for binding in aggregations {
            if let Err(err) = binding.elem.lock().add_sample(&sample.value) {
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }

    fn storage_policies<'a>(&'a self, policies: &'a [StoragePolicy]) -> &'a [StoragePolicy] {
        if policies.is_empty() {
            &self.opts.default_storage_policies
        } else {
            policies
        }
    }

    fn apply_value_rate_limit(&self, num_values: i64) -> Result<(), AggregationError> {
        let inner = self.inner.read();
        let allowed = match &inner.rate_limiter {
            Some(limiter) => limiter.is_allowed(num_values),
            None => true,
        };
        drop(inner);

        if allowed {
            return Ok(());
        }
        self.metrics
            .record_value_rate_limit_exceeded(num_values.max(0) as u64);
        Err(AggregationError::ValueRateLimitExceeded)
    }
}

fn reset_rate_limiter(
    inner: &mut EntryInner,
    runtime: &RuntimeOptions,
    opts: &AggregatorOptions,
) {
    let new_limit = runtime.write_values_per_metric_limit_per_second;
    if new_limit <= 0 {
        inner.rate_limiter = None;
        return;
    }
    match &inner.rate_limiter {
        Some(limiter) => limiter.reset(new_limit),
        None => inner.rate_limiter = Some(RateLimiter::new(new_limit, opts.clock.clone())),
    }
}

fn binding_index(
    bindings: &[AggregationBinding],
    aggregation_id: AggregationId,
    storage_policy: StoragePolicy,
    pipeline: &Pipeline,
) -> Option<usize> {
    bindings.iter().position(|binding| {
        binding.key.aggregation_id == aggregation_id
            && binding.key.storage_policy == storage_policy
            && binding.key.pipeline == *pipeline
    })
}
