//! Per-shard metric map
//!
//! Maps metric identities to their aggregation entries. Lookups take the
//! map lock shared; inserts re-check under the exclusive lock, apply the
//! per-shard new-metric rate limit (suppressed during warmup), and pull a
//! recycled entry from the pool. A background tick expires idle entries in
//! batches under a soft deadline, releasing the map lock between batches so
//! writes keep flowing.
//!
//! # Locking
//!
//! The entry-list deletion mutex serializes removals from the ordered list
//! and must be acquired before the map lock; `set_runtime_options` holds it
//! while walking the list so no entry it is about to update gets expired
//! under it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::aggregator::element::ElementPools;
use crate::aggregator::entry::Entry;
use crate::aggregator::metric_list::MetricLists;
use crate::aggregator::metrics::{
    EntryMetrics, EntryMetricsSnapshot, MapMetrics, MapMetricsSnapshot,
};
use crate::aggregator::{AggregatorOptions, RuntimeOptions};
use crate::error::AggregationError;
use crate::list::NodeList;
use crate::pool::Pool;
use crate::rate::RateLimiter;
use crate::types::{hash_metric_id, MetricSample, MetricType, StagedMetadata};

const SOFT_DEADLINE_CHECK_EVERY: usize = 128;
const EXPIRE_BATCH_SIZE: usize = 1024;

/// Identity of one metric within a shard's map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryKey {
    /// Metric type of the identity
    pub metric_type: MetricType,
    /// 128-bit hash of the raw metric id
    pub id_hash: u128,
}

#[derive(Clone)]
struct MapEntry {
    key: EntryKey,
    entry: Arc<Entry>,
}

struct MapState {
    closed: bool,
    entries: HashMap<EntryKey, crate::list::NodeRef>,
    entry_list: NodeList<MapEntry>,
    first_insert_nanos: Option<i64>,
    rate_limiter: Option<RateLimiter>,
    runtime_opts: RuntimeOptions,
}

/// Result of one background tick over a shard's map
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickResult {
    /// Entries live after the tick
    pub active_entries: usize,
    /// Entries expired by the tick
    pub expired_entries: usize,
    /// Aggregation elements live across all resolution lists
    pub active_elems: usize,
}

type SleepFn = Box<dyn Fn(Duration) + Send + Sync>;

/// Per-shard concurrent map from metric identity to aggregation entry
pub struct MetricMap {
    shard: u32,
    opts: Arc<AggregatorOptions>,
    state: RwLock<MapState>,
    /// Must be held when deleting elements from the entry list, and before
    /// the map lock
    entry_list_del_lock: Mutex<()>,
    lists: Arc<MetricLists>,
    entry_pool: Pool<Arc<Entry>>,
    metrics: Arc<MapMetrics>,
    entry_metrics: Arc<EntryMetrics>,
    sleep_fn: SleepFn,
}

impl MetricMap {
    /// Create the map for a shard
    pub fn new(shard: u32, opts: AggregatorOptions, runtime: RuntimeOptions) -> Self {
        let opts = Arc::new(opts);
        let pools = Arc::new(ElementPools::new(opts.element_pool_capacity));
        let lists = Arc::new(MetricLists::new(shard, Arc::clone(&pools)));
        let entry_metrics = Arc::new(EntryMetrics::default());

        let entry_pool = {
            let opts = Arc::clone(&opts);
            let pools = Arc::clone(&pools);
            let entry_metrics = Arc::clone(&entry_metrics);
            Pool::new(opts.entry_pool_capacity, move || {
                Arc::new(Entry::new(
                    Arc::clone(&opts),
                    Arc::clone(&pools),
                    Arc::clone(&entry_metrics),
                ))
            })
        };

        let mut state = MapState {
            closed: false,
            entries: HashMap::new(),
            entry_list: NodeList::new(),
            first_insert_nanos: None,
            rate_limiter: None,
            runtime_opts: runtime,
        };
        reset_map_rate_limiter(&mut state, &opts);

        Self {
            shard,
            opts,
            state: RwLock::new(state),
            entry_list_del_lock: Mutex::new(()),
            lists,
            entry_pool,
            metrics: Arc::new(MapMetrics::default()),
            entry_metrics,
            sleep_fn: Box::new(|d| std::thread::sleep(d)),
        }
    }

    /// Replace the pacing sleep (tests)
    pub fn with_sleep_fn(mut self, sleep_fn: impl Fn(Duration) + Send + Sync + 'static) -> Self {
        self.sleep_fn = Box::new(sleep_fn);
        self
    }

    /// Shard this map serves
    pub fn shard(&self) -> u32 {
        self.shard
    }

    /// Snapshot of the map-level counters
    pub fn metrics(&self) -> MapMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Snapshot of the counters shared by this shard's entries
    pub fn entry_metrics(&self) -> EntryMetricsSnapshot {
        self.entry_metrics.snapshot()
    }

    /// Cardinality of the identity map and the ordered entry list
    ///
    /// The two are equal for any healthy map.
    pub fn entry_counts(&self) -> (usize, usize) {
        let state = self.state.read();
        (state.entries.len(), state.entry_list.len())
    }

    /// Ingest one untimed sample for this shard
    pub fn add_untimed(
        &self,
        sample: MetricSample,
        metadatas: &[StagedMetadata],
    ) -> Result<(), AggregationError> {
        let key = EntryKey {
            metric_type: sample.metric_type(),
            id_hash: hash_metric_id(&sample.id),
        };
        let entry = self.find_or_create(key)?;
        let result = entry.add_untimed(&sample, metadatas);
        entry.dec_writer();
        result
    }

    /// Expire idle entries and report shard occupancy
    ///
    /// Finishes within approximately `target` wall time; remaining entries
    /// are handled on the next tick.
    pub fn tick(&self, target: Duration) -> TickResult {
        let expired_entries = self.delete_expired(target);
        let active_entries = self.state.read().entry_list.len();
        let active_elems = self.lists.tick();

        TickResult {
            active_entries,
            expired_entries,
            active_elems,
        }
    }

    /// Update the runtime limits of the map and every live entry
    pub fn set_runtime_options(&self, runtime: RuntimeOptions) {
        {
            let mut state = self.state.write();
            state.runtime_opts = runtime.clone();
            reset_map_rate_limiter(&mut state, &self.opts);
        }

        // Hold the deletion lock so no entry we are about to update gets
        // expired out from under the walk. Inserts still proceed.
        let _del_guard = self.entry_list_del_lock.lock();
        self.for_each_entry(|map_entry| {
            map_entry.entry.set_runtime_options(&runtime);
        });
    }

    /// Reject further work
    pub fn close(&self) {
        let mut state = self.state.write();
        if state.closed {
            return;
        }
        state.closed = true;
        self.lists.close();
    }

    fn find_or_create(&self, key: EntryKey) -> Result<Arc<Entry>, AggregationError> {
        {
            let state = self.state.read();
            if state.closed {
                return Err(AggregationError::MetricMapClosed);
            }
            if let Some(entry) = lookup_entry(&state, key) {
                // Incrementing the writer count under the map lock is what
                // keeps expiration from racing an in-flight write.
                entry.inc_writer();
                return Ok(entry);
            }
        }

        let entry = {
            let mut state = self.state.write();
            if state.closed {
                return Err(AggregationError::MetricMapClosed);
            }
            if let Some(entry) = lookup_entry(&state, key) {
                entry.inc_writer();
                return Ok(entry);
            }

            let now_nanos = (self.opts.clock)();
            if state.first_insert_nanos.is_none() {
                state.first_insert_nanos = Some(now_nanos);
            }
            self.apply_new_metric_rate_limit(&state, now_nanos)?;

            let entry = self.entry_pool.get();
            entry.reset(Arc::clone(&self.lists), &state.runtime_opts);
            let node = state.entry_list.push_back(MapEntry {
                key,
                entry: Arc::clone(&entry),
            });
            state.entries.insert(key, node);
            entry.inc_writer();
            entry
        };
        self.metrics.record_new_entry();
        Ok(entry)
    }

    fn apply_new_metric_rate_limit(
        &self,
        state: &MapState,
        now_nanos: i64,
    ) -> Result<(), AggregationError> {
        let limiter = match &state.rate_limiter {
            Some(limiter) => limiter,
            None => return Ok(()),
        };

        // A freshly started shard may legitimately see a burst of unknown
        // metrics; the warmup window keeps the limit out of the way.
        let warmup_nanos = state.runtime_opts.write_new_metric_no_limit_warmup.as_nanos() as i64;
        if let Some(first) = state.first_insert_nanos {
            if now_nanos < first.saturating_add(warmup_nanos) {
                self.metrics.record_no_rate_limit_warmup();
                return Ok(());
            }
        }

        if limiter.is_allowed(1) {
            return Ok(());
        }
        self.metrics.record_new_metric_rate_limit_exceeded();
        Err(AggregationError::NewMetricRateLimitExceeded)
    }

    fn delete_expired(&self, target: Duration) -> usize {
        let num_entries = self.state.read().entry_list.len();
        if num_entries == 0 {
            return 0;
        }

        let start_nanos = (self.opts.clock)();
        let per_entry_nanos = target.as_nanos() as i64 / num_entries as i64;
        let mut expired: Vec<MapEntry> = Vec::new();
        let mut num_expired = 0;
        let mut entry_idx: usize = 0;

        self.for_each_entry(|map_entry| {
            let now_nanos = (self.opts.clock)();
            if entry_idx > 0 && entry_idx % SOFT_DEADLINE_CHECK_EVERY == 0 {
                let deadline = start_nanos + entry_idx as i64 * per_entry_nanos;
                if now_nanos < deadline {
                    (self.sleep_fn)(Duration::from_nanos((deadline - now_nanos) as u64));
                }
            }
            if map_entry.entry.should_expire(now_nanos) {
                expired.push(map_entry.clone());
            }
            if expired.len() >= EXPIRE_BATCH_SIZE {
                num_expired += self.purge_expired(now_nanos, std::mem::take(&mut expired));
            }
            entry_idx += 1;
        });

        num_expired += self.purge_expired((self.opts.clock)(), expired);
        num_expired
    }

    fn purge_expired(&self, now_nanos: i64, candidates: Vec<MapEntry>) -> usize {
        if candidates.is_empty() {
            return 0;
        }
        let mut recycled: Vec<Arc<Entry>> = Vec::new();
        {
            let _del_guard = self.entry_list_del_lock.lock();
            let mut state = self.state.write();
            for candidate in candidates {
                if candidate.entry.try_expire(now_nanos) {
                    if let Some(node) = state.entries.remove(&candidate.key) {
                        state.entry_list.remove(node);
                    }
                    recycled.push(candidate.entry);
                }
            }
        }
        let num_expired = recycled.len();
        for entry in recycled {
            // Only recycle entries nothing else still references.
            if Arc::strong_count(&entry) == 1 {
                self.entry_pool.put(entry);
            }
        }
        num_expired
    }

    /// Invoke `f` on every live entry in batches
    ///
    /// The map lock is held shared only while a batch is collected and
    /// released before the callbacks run, so writes proceed concurrently.
    fn for_each_entry(&self, mut f: impl FnMut(&MapEntry)) {
        let (batch_size, mut cursor) = {
            let state = self.state.read();
            let len = state.entry_list.len();
            if len == 0 {
                return;
            }
            let batch = ((self.opts.entry_check_batch_percent * len as f64).ceil() as usize).max(1);
            (batch, state.entry_list.front())
        };

        let mut batch: Vec<MapEntry> = Vec::with_capacity(batch_size);
        while cursor.is_some() {
            {
                let state = self.state.read();
                let mut checked = 0;
                while let Some(node) = cursor {
                    if checked >= batch_size {
                        break;
                    }
                    // A stale cursor means the node expired while the lock
                    // was released; the remainder waits for the next pass.
                    match state.entry_list.get(node) {
                        Some(map_entry) => batch.push(map_entry.clone()),
                        None => {
                            cursor = None;
                            break;
                        }
                    }
                    cursor = state.entry_list.next(node);
                    checked += 1;
                }
            }
            for map_entry in batch.drain(..) {
                f(&map_entry);
            }
        }
    }
}

fn lookup_entry(state: &MapState, key: EntryKey) -> Option<Arc<Entry>> {
    let node = state.entries.get(&key)?;
    state
        .entry_list
        .get(*node)
        .map(|map_entry| Arc::clone(&map_entry.entry))
}

fn reset_map_rate_limiter(state: &mut MapState, opts: &AggregatorOptions) {
    let new_limit = state.runtime_opts.write_new_metric_limit_per_shard_per_second;
    if new_limit <= 0 {
        state.rate_limiter = None;
        return;
    }
    match &state.rate_limiter {
        Some(limiter) => limiter.reset(new_limit),
        None => state.rate_limiter = Some(RateLimiter::new(new_limit, opts.clock.clone())),
    }
}
