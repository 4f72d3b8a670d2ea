//! Integration tests for the replicated-shard message writer
//!
//! These tests drive the full produce/retry/ack lifecycle:
//! - Scans with no consumers, then delivery once one is registered
//! - External acks reclaiming queue and ack-map slots
//! - Message id ordering and ack liveness through close
//! - The background retry loop draining the queue at shutdown

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use shardflow::clock::ManualClock;
use shardflow::producer::{
    ConsumerWriter, MessageMeta, MessageWriter, MessageWriterOptions, RefCountedMessage,
};

// ============================================================================
// Helpers
// ============================================================================

struct RecordingConsumer {
    address: String,
    fail: AtomicBool,
    payloads: Mutex<Vec<Bytes>>,
}

impl RecordingConsumer {
    fn new(address: &str) -> Arc<Self> {
        Arc::new(Self {
            address: address.to_string(),
            fail: AtomicBool::new(false),
            payloads: Mutex::new(Vec::new()),
        })
    }

    fn delivered(&self) -> usize {
        self.payloads.lock().len()
    }
}

impl ConsumerWriter for RecordingConsumer {
    fn write(&self, payload: &[u8]) -> std::io::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "consumer unavailable",
            ));
        }
        self.payloads.lock().push(Bytes::copy_from_slice(payload));
        Ok(())
    }

    fn address(&self) -> &str {
        &self.address
    }
}

fn writer_with_clock(shard: u64, clock: &ManualClock) -> MessageWriter {
    MessageWriter::new(
        shard,
        MessageWriterOptions::default().with_clock(clock.as_fn()),
    )
}

fn payload(data: &str) -> Arc<RefCountedMessage> {
    Arc::new(RefCountedMessage::new(Bytes::copy_from_slice(
        data.as_bytes(),
    )))
}

// ============================================================================
// Retry and ack lifecycle
// ============================================================================

#[test]
fn test_no_writers_then_delivery_then_external_ack() {
    let clock = ManualClock::new(1);
    let writer = writer_with_clock(9, &clock);

    // Enqueue three messages with no consumer writers registered.
    writer.write(&payload("m1"));
    writer.write(&payload("m2"));
    writer.write(&payload("m3"));
    assert_eq!(writer.queue_size(), 3);

    // First scan: every message is retryable but there is nobody to write
    // to.
    writer.retry_unacknowledged();
    assert_eq!(writer.metrics().no_writers_error, 3);
    assert_eq!(writer.metrics().write_success, 0);
    assert_eq!(writer.queue_size(), 3);

    // Register a consumer; the next scan delivers all three.
    let consumer = RecordingConsumer::new("consumer-a");
    writer.add_consumer_writer(consumer.clone());
    writer.retry_unacknowledged();
    assert_eq!(consumer.delivered(), 3);
    assert_eq!(writer.metrics().write_success, 3);

    // Ack the second message externally; once it comes due again it is
    // removed from both the queue and the acks map.
    writer.ack(MessageMeta { shard: 9, id: 2 });
    assert_eq!(writer.ack_map_size(), 2);

    clock.advance(Duration::from_secs(60));
    writer.retry_unacknowledged();
    assert_eq!(writer.queue_size(), 2);
    assert_eq!(writer.ack_map_size(), 2);
    assert_eq!(consumer.delivered(), 5);
}

#[test]
fn test_message_ids_are_strictly_increasing_per_writer() {
    let clock = ManualClock::new(1);
    let writer = writer_with_clock(2, &clock);
    let consumer = RecordingConsumer::new("c");
    writer.add_consumer_writer(consumer);

    for i in 0..100 {
        writer.write(&payload(&format!("m{i}")));
    }
    assert_eq!(writer.queue_size(), 100);
    assert_eq!(writer.ack_map_size(), 100);

    // Every id from 1..=100 is ackable exactly once, in any order.
    for id in (1..=100u64).rev() {
        writer.ack(MessageMeta { shard: 2, id });
    }
    assert_eq!(writer.ack_map_size(), 0);
}

#[test]
fn test_cutover_cutoff_window_gates_writes() {
    let clock = ManualClock::new(5_000);
    let writer = writer_with_clock(0, &clock);
    writer.set_cutover_nanos(10_000);
    writer.set_cutoff_nanos(20_000);
    assert_eq!(writer.cutover_nanos(), 10_000);
    assert_eq!(writer.cutoff_nanos(), 20_000);

    writer.write(&payload("before"));
    clock.set(15_000);
    writer.write(&payload("inside"));
    clock.set(20_000);
    writer.write(&payload("after"));

    assert_eq!(writer.queue_size(), 1);
    let metrics = writer.metrics();
    assert_eq!(metrics.write_before_cutover, 1);
    assert_eq!(metrics.write_after_cutoff, 1);
}

#[test]
fn test_rejected_write_takes_no_payload_reference() {
    let clock = ManualClock::new(1_000);
    let writer = writer_with_clock(0, &clock);
    writer.set_cutover_nanos(2_000);

    let rm = payload("early");
    writer.write(&rm);
    assert_eq!(rm.ref_count(), 0);

    clock.set(2_000);
    writer.write(&rm);
    assert_eq!(rm.ref_count(), 1);
}

#[test]
fn test_delivery_rotates_to_healthy_consumer() {
    let clock = ManualClock::new(1);
    let writer = writer_with_clock(0, &clock);

    let down = RecordingConsumer::new("down");
    down.fail.store(true, Ordering::SeqCst);
    let up = RecordingConsumer::new("up");
    writer.add_consumer_writer(down.clone());
    writer.add_consumer_writer(up.clone());

    for i in 0..10 {
        writer.write(&payload(&format!("m{i}")));
    }
    writer.retry_unacknowledged();

    // Exactly one delivery per message, all landing on the healthy
    // consumer.
    assert_eq!(up.delivered(), 10);
    assert_eq!(down.delivered(), 0);
    assert_eq!(writer.metrics().write_success, 10);
    assert_eq!(writer.metrics().all_consumers_write_error, 0);
}

#[test]
fn test_removed_consumer_no_longer_receives() {
    let clock = ManualClock::new(1);
    let writer = writer_with_clock(0, &clock);
    let a = RecordingConsumer::new("a");
    let b = RecordingConsumer::new("b");
    writer.add_consumer_writer(a.clone());
    writer.add_consumer_writer(b.clone());
    writer.remove_consumer_writer("a");

    writer.write(&payload("m"));
    writer.retry_unacknowledged();

    assert_eq!(a.delivered(), 0);
    assert_eq!(b.delivered(), 1);
}

// ============================================================================
// Background loop and close
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_background_loop_delivers_and_close_joins() {
    let clock = ManualClock::new(1);
    let opts = MessageWriterOptions {
        message_queue_scan_interval: Duration::from_millis(10),
        close_check_interval: Duration::from_millis(10),
        ..MessageWriterOptions::default().with_clock(clock.as_fn())
    };
    let writer = Arc::new(MessageWriter::new(1, opts));
    let consumer = RecordingConsumer::new("c");
    writer.add_consumer_writer(consumer.clone());
    writer.init();

    writer.write(&payload("m1"));
    writer.write(&payload("m2"));

    // The background loop picks the messages up without manual scans.
    for _ in 0..200 {
        if consumer.delivered() >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(consumer.delivered() >= 2);

    // Acked messages are gone by the time close returns.
    writer.ack(MessageMeta { shard: 1, id: 1 });
    writer.ack(MessageMeta { shard: 1, id: 2 });
    writer.close().await;
    assert_eq!(writer.queue_size(), 0);
    assert_eq!(writer.ack_map_size(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_close_drains_unacked_messages_via_retry_loop() {
    let clock = ManualClock::new(1);
    let opts = MessageWriterOptions {
        message_queue_scan_interval: Duration::from_millis(10),
        close_check_interval: Duration::from_millis(10),
        ..MessageWriterOptions::default().with_clock(clock.as_fn())
    };
    let writer = Arc::new(MessageWriter::new(1, opts));

    // An unhealthy consumer set: deliveries always fail.
    let down = RecordingConsumer::new("down");
    down.fail.store(true, Ordering::SeqCst);
    writer.add_consumer_writer(down);
    writer.init();

    for i in 0..20 {
        writer.write(&payload(&format!("m{i}")));
    }

    // Close must not hang on the unhealthy consumer: the retry loop's
    // close fast path acks and discards everything still queued.
    writer.close().await;
    assert_eq!(writer.queue_size(), 0);
    assert_eq!(writer.ack_map_size(), 0);

    // Closing again is a no-op.
    writer.close().await;
}

#[tokio::test]
async fn test_close_without_init_drains_inline() {
    let clock = ManualClock::new(1);
    let writer = writer_with_clock(1, &clock);
    let rm = payload("m");
    writer.write(&rm);
    assert_eq!(rm.ref_count(), 1);

    writer.close().await;
    assert_eq!(writer.queue_size(), 0);
    assert_eq!(writer.ack_map_size(), 0);
    // The local ack at drain released the payload reference.
    assert_eq!(rm.ref_count(), 0);
}

#[test]
fn test_ack_unknown_metadata_is_noop() {
    let clock = ManualClock::new(1);
    let writer = writer_with_clock(3, &clock);
    writer.write(&payload("m"));

    writer.ack(MessageMeta { shard: 3, id: 42 });
    assert_eq!(writer.queue_size(), 1);
    assert_eq!(writer.ack_map_size(), 1);

    // Double-acking the real message is also fine.
    writer.ack(MessageMeta { shard: 3, id: 1 });
    writer.ack(MessageMeta { shard: 3, id: 1 });
    assert_eq!(writer.ack_map_size(), 0);
}
