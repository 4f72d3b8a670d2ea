//! Integration tests for the per-shard aggregation map
//!
//! These tests validate the ingest lifecycle end to end:
//! - Value and new-metric rate limits, including warmup
//! - Idle expiration through tick and entry recycling
//! - Map/list cardinality staying in sync under mixed load
//! - Metadata update idempotence and runtime reconfiguration

use std::sync::Arc;
use std::time::Duration;

use shardflow::aggregator::{AggregatorOptions, MetricMap, RuntimeOptions};
use shardflow::clock::ManualClock;
use shardflow::error::AggregationError;
use shardflow::types::{
    AggregationId, MetricSample, Pipeline, PipelineMetadata, PipelineOp, StagedMetadata,
    StoragePolicy,
};

// ============================================================================
// Helpers
// ============================================================================

fn shard_map(clock: &ManualClock, runtime: RuntimeOptions) -> MetricMap {
    let opts = AggregatorOptions::default()
        .with_clock(clock.as_fn())
        .with_entry_ttl(Duration::from_secs(1));
    MetricMap::new(0, opts, runtime).with_sleep_fn(|_| {})
}

fn default_metadatas() -> Vec<StagedMetadata> {
    vec![StagedMetadata::default()]
}

fn counter(id: &str, value: i64) -> MetricSample {
    MetricSample::counter(id.as_bytes().to_vec(), value)
}

// ============================================================================
// Rate limits
// ============================================================================

#[test]
fn test_per_entry_value_limit_caps_writes_within_a_second() {
    let clock = ManualClock::new(0);
    let map = shard_map(
        &clock,
        RuntimeOptions {
            write_values_per_metric_limit_per_second: 10,
            ..Default::default()
        },
    );
    let metadatas = default_metadatas();

    let mut accepted = 0;
    let mut limited = 0;
    for _ in 0..15 {
        match map.add_untimed(counter("api.requests", 1), &metadatas) {
            Ok(()) => accepted += 1,
            Err(AggregationError::ValueRateLimitExceeded) => limited += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(accepted, 10);
    assert_eq!(limited, 5);

    let entry_metrics = map.entry_metrics();
    assert_eq!(entry_metrics.value_rate_limit_exceeded, 5);
    assert_eq!(entry_metrics.dropped_values, 5);

    // The next second refills the bucket.
    clock.advance(Duration::from_secs(1));
    map.add_untimed(counter("api.requests", 1), &default_metadatas())
        .unwrap();
}

#[test]
fn test_value_limit_is_per_metric() {
    let clock = ManualClock::new(0);
    let map = shard_map(
        &clock,
        RuntimeOptions {
            write_values_per_metric_limit_per_second: 1,
            ..Default::default()
        },
    );
    let metadatas = default_metadatas();

    map.add_untimed(counter("a", 1), &metadatas).unwrap();
    assert!(map.add_untimed(counter("a", 1), &metadatas).is_err());
    // A different metric has its own bucket.
    map.add_untimed(counter("b", 1), &metadatas).unwrap();
}

#[test]
fn test_new_metric_limit_with_warmup_window() {
    let clock = ManualClock::new(0);
    let map = shard_map(
        &clock,
        RuntimeOptions {
            write_new_metric_limit_per_shard_per_second: 3,
            write_new_metric_no_limit_warmup: Duration::from_secs(60),
            ..Default::default()
        },
    );
    let metadatas = default_metadatas();

    // A freshly started shard ingests a burst of unknown metrics freely.
    for i in 0..50 {
        map.add_untimed(counter(&format!("burst-{i}"), 1), &metadatas)
            .unwrap();
    }
    assert_eq!(map.metrics().new_entries, 50);
    assert_eq!(map.metrics().new_metric_rate_limit_exceeded, 0);

    // Past the warmup the limiter takes over.
    clock.advance(Duration::from_secs(120));
    for i in 0..3 {
        map.add_untimed(counter(&format!("late-{i}"), 1), &metadatas)
            .unwrap();
    }
    let err = map
        .add_untimed(counter("late-3", 1), &metadatas)
        .unwrap_err();
    assert_eq!(err, AggregationError::NewMetricRateLimitExceeded);
    assert_eq!(map.metrics().dropped_new_metrics, 1);
}

// ============================================================================
// Expiration
// ============================================================================

#[test]
fn test_idle_entry_expires_and_reinsert_counts_as_new() {
    let clock = ManualClock::new(0);
    let map = shard_map(&clock, RuntimeOptions::default());
    let metadatas = default_metadatas();

    map.add_untimed(counter("cpu.user", 1), &metadatas).unwrap();
    assert_eq!(map.metrics().new_entries, 1);

    clock.advance(Duration::from_secs(2));
    let result = map.tick(Duration::from_millis(100));
    assert_eq!(result.expired_entries, 1);
    assert_eq!(result.active_entries, 0);
    assert_eq!(map.entry_counts(), (0, 0));

    // Writing the same identity again allocates a fresh entry.
    map.add_untimed(counter("cpu.user", 1), &metadatas).unwrap();
    assert_eq!(map.metrics().new_entries, 2);
}

#[test]
fn test_tick_expires_only_idle_entries() {
    let clock = ManualClock::new(0);
    let map = shard_map(&clock, RuntimeOptions::default());
    let metadatas = default_metadatas();

    map.add_untimed(counter("old", 1), &metadatas).unwrap();
    clock.advance(Duration::from_millis(800));
    map.add_untimed(counter("fresh", 1), &metadatas).unwrap();
    clock.advance(Duration::from_millis(400));

    // `old` is 1.2s idle, `fresh` only 0.4s.
    let result = map.tick(Duration::from_millis(100));
    assert_eq!(result.expired_entries, 1);
    assert_eq!(result.active_entries, 1);

    // A write refreshes idle time and keeps the survivor alive.
    map.add_untimed(counter("fresh", 1), &metadatas).unwrap();
    clock.advance(Duration::from_millis(800));
    let result = map.tick(Duration::from_millis(100));
    assert_eq!(result.expired_entries, 0);
}

#[test]
fn test_expired_elements_leave_the_resolution_lists() {
    let clock = ManualClock::new(0);
    let map = shard_map(&clock, RuntimeOptions::default());
    map.add_untimed(counter("gone", 1), &default_metadatas())
        .unwrap();

    let before = map.tick(Duration::from_millis(100));
    assert!(before.active_elems > 0);

    clock.advance(Duration::from_secs(2));
    let after = map.tick(Duration::from_millis(100));
    assert_eq!(after.expired_entries, 1);
    assert_eq!(after.active_elems, 0);
}

// ============================================================================
// Cardinality invariants
// ============================================================================

#[test]
fn test_map_and_list_cardinality_match_under_mixed_load() {
    let clock = ManualClock::new(0);
    let map = Arc::new(shard_map(&clock, RuntimeOptions::default()));
    let metadatas = Arc::new(default_metadatas());

    let mut handles = Vec::new();
    for worker in 0..4 {
        let map = Arc::clone(&map);
        let metadatas = Arc::clone(&metadatas);
        handles.push(std::thread::spawn(move || {
            for i in 0..200 {
                let id = format!("w{}-m{}", worker, i % 50);
                map.add_untimed(counter(&id, 1), &metadatas).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let (map_len, list_len) = map.entry_counts();
    assert_eq!(map_len, list_len);
    assert_eq!(map_len, 4 * 50);

    clock.advance(Duration::from_secs(2));
    map.tick(Duration::from_millis(200));
    let (map_len, list_len) = map.entry_counts();
    assert_eq!(map_len, list_len);
    assert_eq!(map_len, 0);
}

// ============================================================================
// Metadata handling
// ============================================================================

#[test]
fn test_repeated_metadata_updates_are_idempotent() {
    let clock = ManualClock::new(1_000_000_000);
    let map = shard_map(&clock, RuntimeOptions::default());

    let custom = vec![StagedMetadata {
        cutover_nanos: 100,
        tombstoned: false,
        pipelines: vec![PipelineMetadata {
            storage_policies: vec![StoragePolicy::new(
                Duration::from_secs(30),
                Duration::from_secs(3600),
            )],
            ..Default::default()
        }],
    }];

    map.add_untimed(counter("m", 1), &custom).unwrap();
    map.add_untimed(counter("m", 1), &custom).unwrap();
    map.add_untimed(counter("m", 1), &custom).unwrap();

    // The same staged metadata applied repeatedly updates bindings once.
    assert_eq!(map.entry_metrics().metadata_updates, 1);
}

#[test]
fn test_newer_cutover_supersedes_and_stale_is_ignored() {
    let clock = ManualClock::new(1_000_000_000);
    let map = shard_map(&clock, RuntimeOptions::default());

    let stage = |cutover: i64, resolution_secs: u64| {
        vec![StagedMetadata {
            cutover_nanos: cutover,
            tombstoned: false,
            pipelines: vec![PipelineMetadata {
                storage_policies: vec![StoragePolicy::new(
                    Duration::from_secs(resolution_secs),
                    Duration::from_secs(3600),
                )],
                ..Default::default()
            }],
        }]
    };

    map.add_untimed(counter("m", 1), &stage(100, 10)).unwrap();
    map.add_untimed(counter("m", 1), &stage(200, 30)).unwrap();
    assert_eq!(map.entry_metrics().metadata_updates, 2);

    // An older stage arriving late is counted stale and changes nothing.
    map.add_untimed(counter("m", 1), &stage(100, 10)).unwrap();
    assert_eq!(map.entry_metrics().metadata_updates, 2);
    assert!(map.entry_metrics().stale_metadata >= 1);
}

#[test]
fn test_rollup_pipeline_is_a_distinct_emission_stream() {
    let clock = ManualClock::new(1_000_000_000);
    let map = shard_map(&clock, RuntimeOptions::default());
    let policy = StoragePolicy::new(Duration::from_secs(10), Duration::from_secs(3600));

    let staged = |cutover: i64, pipelines: Vec<PipelineMetadata>| {
        vec![StagedMetadata {
            cutover_nanos: cutover,
            tombstoned: false,
            pipelines,
        }]
    };
    let plain = PipelineMetadata {
        storage_policies: vec![policy],
        ..Default::default()
    };
    let rolled = PipelineMetadata {
        storage_policies: vec![policy],
        pipeline: Pipeline {
            ops: vec![
                PipelineOp::Transform("absolute".to_string()),
                PipelineOp::Rollup {
                    id: b"requests.by_endpoint".as_ref().into(),
                    aggregation_id: AggregationId(3),
                },
            ],
        },
        ..Default::default()
    };

    // One storage policy, two applied pipelines: two live elements.
    map.add_untimed(counter("m", 1), &staged(100, vec![plain.clone(), rolled.clone()]))
        .unwrap();
    let result = map.tick(Duration::from_millis(50));
    assert_eq!(result.active_elems, 2);

    // Re-applying the identical pipeline set is not a new update.
    map.add_untimed(counter("m", 1), &staged(100, vec![plain.clone(), rolled]))
        .unwrap();
    assert_eq!(map.entry_metrics().metadata_updates, 1);

    // Dropping the rollup pipeline at the next cutover tombstones its
    // element only.
    map.add_untimed(counter("m", 1), &staged(200, vec![plain]))
        .unwrap();
    assert_eq!(map.entry_metrics().metadata_updates, 2);
    let result = map.tick(Duration::from_millis(50));
    assert_eq!(result.active_elems, 1);
}

#[test]
fn test_tombstoned_metric_accepted_without_ingestion() {
    let clock = ManualClock::new(1_000_000_000);
    let map = shard_map(&clock, RuntimeOptions::default());

    let tombstoned = vec![StagedMetadata {
        cutover_nanos: 100,
        tombstoned: true,
        ..Default::default()
    }];
    map.add_untimed(counter("rollup", 1), &tombstoned).unwrap();
    assert_eq!(map.entry_metrics().tombstoned_metadata, 1);
}

#[test]
fn test_timer_batches_split_by_configured_maximum() {
    let clock = ManualClock::new(0);
    let opts = AggregatorOptions {
        max_timer_batch_size_per_write: 4,
        ..AggregatorOptions::default().with_clock(clock.as_fn())
    };
    let map = MetricMap::new(0, opts, RuntimeOptions::default()).with_sleep_fn(|_| {});

    let values: Vec<f64> = (0..10).map(|i| i as f64).collect();
    map.add_untimed(
        MetricSample::timer(b"latency".as_ref(), values),
        &default_metadatas(),
    )
    .unwrap();
    assert_eq!(map.metrics().new_entries, 1);
}

// ============================================================================
// Runtime reconfiguration and shutdown
// ============================================================================

#[test]
fn test_runtime_options_apply_to_map_and_live_entries() {
    let clock = ManualClock::new(0);
    let map = shard_map(&clock, RuntimeOptions::default());
    let metadatas = default_metadatas();

    map.add_untimed(counter("live", 1), &metadatas).unwrap();

    map.set_runtime_options(RuntimeOptions {
        write_values_per_metric_limit_per_second: 2,
        write_new_metric_limit_per_shard_per_second: 1,
        write_new_metric_no_limit_warmup: Duration::ZERO,
    });

    // The live entry picked up the value limit.
    clock.advance(Duration::from_secs(1));
    map.add_untimed(counter("live", 1), &metadatas).unwrap();
    map.add_untimed(counter("live", 1), &metadatas).unwrap();
    let err = map.add_untimed(counter("live", 1), &metadatas).unwrap_err();
    assert_eq!(err, AggregationError::ValueRateLimitExceeded);

    // The map picked up the new-metric limit (warmup already elapsed
    // relative to the first insert).
    map.add_untimed(counter("new-1", 1), &metadatas).unwrap();
    let err = map.add_untimed(counter("new-2", 1), &metadatas).unwrap_err();
    assert_eq!(err, AggregationError::NewMetricRateLimitExceeded);

    // Disabling the limits restores free flow.
    map.set_runtime_options(RuntimeOptions::default());
    map.add_untimed(counter("live", 1), &metadatas).unwrap();
    map.add_untimed(counter("new-2", 1), &metadatas).unwrap();
}

#[test]
fn test_closed_map_rejects_all_work() {
    let clock = ManualClock::new(0);
    let map = shard_map(&clock, RuntimeOptions::default());
    map.add_untimed(counter("m", 1), &default_metadatas())
        .unwrap();

    map.close();
    let err = map
        .add_untimed(counter("m", 1), &default_metadatas())
        .unwrap_err();
    assert_eq!(err, AggregationError::MetricMapClosed);

    let err = map
        .add_untimed(counter("other", 1), &default_metadatas())
        .unwrap_err();
    assert_eq!(err, AggregationError::MetricMapClosed);
}
