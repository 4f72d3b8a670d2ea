//! Replicated-shard message writer
//!
//! Owns the outbound queue of one replicated shard: assigns monotonic
//! message ids, fans deliveries across the current consumer connections,
//! and retries unacknowledged messages with jittered exponential backoff.
//! Delivery failures are counted, never surfaced to the caller of
//! [`MessageWriter::write`] — retry is the error path.
//!
//! # Locking
//!
//! The writer lock guards the queue, the id counter, and the consumer set;
//! the acks map has its own lock and is always acquired after the writer
//! lock. Consumer sets are replaced copy-on-write so a delivery pass
//! iterates a stable snapshot without holding the writer lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::list::{NodeList, NodeRef};
use crate::pool::Pool;
use crate::producer::consumer::ConsumerWriter;
use crate::producer::message::{Message, MessageMeta, RefCountedMessage};
use crate::producer::metrics::{MessageWriterMetrics, MessageWriterMetricsSnapshot};
use crate::producer::MessageWriterOptions;

type ConsumerSet = Arc<Vec<Arc<dyn ConsumerWriter>>>;

struct WriterState {
    msg_id: u64,
    queue: NodeList<Arc<Message>>,
    consumer_writers: ConsumerSet,
    cutover_nanos: i64,
    cutoff_nanos: i64,
    is_closed: bool,
}

/// Outbound message writer of one replicated shard
pub struct MessageWriter {
    shard: u64,
    opts: MessageWriterOptions,
    state: RwLock<WriterState>,
    acks: Mutex<HashMap<MessageMeta, Arc<Message>>>,
    pool: Pool<Arc<Message>>,
    metrics: Arc<MessageWriterMetrics>,
    done_tx: broadcast::Sender<()>,
    retry_task: Mutex<Option<JoinHandle<()>>>,
}

impl MessageWriter {
    /// Create the writer for a replicated shard
    pub fn new(shard: u64, opts: MessageWriterOptions) -> Self {
        let (done_tx, _) = broadcast::channel(1);
        let pool = Pool::new(opts.message_pool_capacity, move || {
            Arc::new(Message::new(shard))
        });
        Self {
            shard,
            state: RwLock::new(WriterState {
                msg_id: 0,
                queue: NodeList::new(),
                consumer_writers: Arc::new(Vec::new()),
                cutover_nanos: 0,
                cutoff_nanos: 0,
                is_closed: false,
            }),
            acks: Mutex::new(HashMap::with_capacity(opts.initial_ack_map_capacity)),
            pool,
            metrics: Arc::new(MessageWriterMetrics::default()),
            done_tx,
            retry_task: Mutex::new(None),
            opts,
        }
    }

    /// Replicated shard this writer serves
    pub fn replicated_shard(&self) -> u64 {
        self.shard
    }

    /// Snapshot of the writer's counters
    pub fn metrics(&self) -> MessageWriterMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Enqueue one message for replication
    ///
    /// Writes outside the `[cutover, cutoff)` validity window are counted
    /// and discarded; there is no error surface.
    pub fn write(&self, rm: &Arc<RefCountedMessage>) {
        let now_nanos = (self.opts.clock)();
        {
            let state = self.state.read();
            if !self.is_valid_write(&state, now_nanos) {
                return;
            }
        }
        rm.inc_ref();
        let msg = self.pool.get();

        let mut state = self.state.write();
        state.msg_id += 1;
        msg.reset(state.msg_id, Arc::clone(rm));
        self.acks.lock().insert(msg.meta(), Arc::clone(&msg));
        state.queue.push_back(msg);
    }

    /// Acknowledge a message by its metadata
    ///
    /// Acking an unknown (already acked) metadata is a no-op.
    pub fn ack(&self, meta: MessageMeta) {
        let msg = self.acks.lock().remove(&meta);
        if let Some(msg) = msg {
            msg.ack();
        }
    }

    /// Start the background retry loop
    pub fn init(self: &Arc<Self>) {
        let mut retry_task = self.retry_task.lock();
        if retry_task.is_some() {
            return;
        }

        let writer = Arc::clone(self);
        let mut shutdown = self.done_tx.subscribe();
        let handle = tokio::spawn(async move {
            let scan_interval = writer.opts.message_queue_scan_interval;
            // Initial jitter spreads scans of the per-shard writers apart.
            let jitter_nanos = rand::thread_rng().gen_range(0..scan_interval.as_nanos() as u64);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_nanos(jitter_nanos)) => {}
                _ = shutdown.recv() => return,
            }

            let mut ticker = tokio::time::interval(scan_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            debug!(shard = writer.shard, "message retry loop started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let w = Arc::clone(&writer);
                        if let Err(e) =
                            tokio::task::spawn_blocking(move || w.retry_unacknowledged()).await
                        {
                            warn!(shard = writer.shard, error = %e, "retry scan failed");
                        }
                    }
                    _ = shutdown.recv() => {
                        debug!(shard = writer.shard, "message retry loop stopped");
                        break;
                    }
                }
            }
        });
        *retry_task = Some(handle);
    }

    /// Close the writer, draining the queue first
    ///
    /// The retry loop drains remaining messages through its close fast
    /// path, so shutdown is not blocked by unhealthy consumers.
    pub async fn close(&self) {
        {
            let mut state = self.state.write();
            if state.is_closed {
                return;
            }
            state.is_closed = true;
        }

        if self.retry_task.lock().is_some() {
            while self.queue_size() > 0 {
                tokio::time::sleep(self.opts.close_check_interval).await;
            }
        } else {
            // No retry loop to drain for us.
            self.drain_queue();
        }

        let _ = self.done_tx.send(());
        let task = self.retry_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Register a consumer connection
    pub fn add_consumer_writer(&self, consumer: Arc<dyn ConsumerWriter>) {
        let mut state = self.state.write();
        let mut consumers = Vec::with_capacity(state.consumer_writers.len() + 1);
        consumers.extend(state.consumer_writers.iter().cloned());
        consumers.push(consumer);
        state.consumer_writers = Arc::new(consumers);
    }

    /// Remove the consumer connection with the given address
    pub fn remove_consumer_writer(&self, addr: &str) {
        let mut state = self.state.write();
        let consumers: Vec<Arc<dyn ConsumerWriter>> = state
            .consumer_writers
            .iter()
            .filter(|c| c.address() != addr)
            .cloned()
            .collect();
        state.consumer_writers = Arc::new(consumers);
    }

    /// Nanosecond timestamp from which writes are accepted; `0` disables
    pub fn cutover_nanos(&self) -> i64 {
        self.state.read().cutover_nanos
    }

    /// Set the cutover timestamp
    pub fn set_cutover_nanos(&self, nanos: i64) {
        self.state.write().cutover_nanos = nanos;
    }

    /// Nanosecond timestamp from which writes are rejected; `0` disables
    pub fn cutoff_nanos(&self) -> i64 {
        self.state.read().cutoff_nanos
    }

    /// Set the cutoff timestamp
    pub fn set_cutoff_nanos(&self, nanos: i64) {
        self.state.write().cutoff_nanos = nanos;
    }

    /// Number of messages queued in the writer
    pub fn queue_size(&self) -> usize {
        self.state.read().queue.len()
    }

    /// Number of unacknowledged messages tracked in the acks map
    pub fn ack_map_size(&self) -> usize {
        self.acks.lock().len()
    }

    /// Run one retry pass over the queue
    ///
    /// Normally driven by the background loop started from
    /// [`MessageWriter::init`]; exposed so callers can drive scans
    /// deterministically.
    pub fn retry_unacknowledged(&self) {
        self.metrics.record_retry_scan();
        let mut cursor = self.state.read().queue.front();

        while let Some(start) = cursor {
            let now_nanos = (self.opts.clock)();
            let (next, to_retry, consumers) = {
                let mut state = self.state.write();
                let (next, to_retry) = self.retry_batch_with_lock(&mut state, start, now_nanos);
                (next, to_retry, Arc::clone(&state.consumer_writers))
            };

            if !to_retry.is_empty() {
                if consumers.is_empty() {
                    // Not expected under a healthy placement.
                    self.metrics.record_no_writers_error(to_retry.len() as u64);
                } else {
                    for msg in &to_retry {
                        self.write_message(&consumers, msg);
                    }
                }
            }
            cursor = next;
        }
    }

    /// Visit up to one batch of queue positions under the writer lock
    ///
    /// Returns the resume position and the messages due for delivery. The
    /// batch bound keeps the lock hold short so one slow shard does not
    /// stall writes on the others.
    fn retry_batch_with_lock(
        &self,
        state: &mut WriterState,
        start: NodeRef,
        now_nanos: i64,
    ) -> (Option<NodeRef>, Vec<Arc<Message>>) {
        let mut to_retry = Vec::new();
        let mut iterated = 0;
        let mut cursor = Some(start);

        while let Some(node) = cursor {
            iterated += 1;
            if iterated > self.opts.message_retry_batch_size {
                break;
            }
            let next = state.queue.next(node);
            let msg = match state.queue.get(node) {
                Some(msg) => Arc::clone(msg),
                None => {
                    cursor = next;
                    continue;
                }
            };

            if state.is_closed {
                // Ack locally and discard so unacked messages for an
                // unhealthy consumer set do not stay in memory forever.
                self.acks.lock().remove(&msg.meta());
                msg.ack();
                state.queue.remove(node);
                self.pool.put(msg);
                cursor = next;
                continue;
            }
            if msg.retry_at_nanos() > now_nanos {
                cursor = next;
                continue;
            }
            if msg.is_dropped_or_acked() {
                // Remove the ack in case the message was dropped upstream
                // rather than acked.
                self.acks.lock().remove(&msg.meta());
                state.queue.remove(node);
                self.pool.put(msg);
                cursor = next;
                continue;
            }
            to_retry.push(msg);
            cursor = next;
        }
        (cursor, to_retry)
    }

    /// Attempt to deliver one message to exactly one consumer
    fn write_message(&self, consumers: &[Arc<dyn ConsumerWriter>], msg: &Arc<Message>) {
        msg.inc_write_times();
        let payload = match msg.bytes() {
            Some(payload) => payload,
            // Acked or dropped between the scan and the delivery attempt.
            None => return,
        };

        let now_nanos = (self.opts.clock)();
        let num_consumers = consumers.len();
        let start = now_nanos.max(0) as usize % num_consumers;
        let mut written = false;
        for i in 0..num_consumers {
            let consumer = &consumers[(start + i) % num_consumers];
            match consumer.write(&payload) {
                Ok(()) => {
                    self.metrics.record_write_success();
                    written = true;
                    break;
                }
                Err(_) => self.metrics.record_one_consumer_write_error(),
            }
        }
        if !written {
            self.metrics.record_all_consumers_write_error();
        }

        let unit_jitter: f64 = rand::thread_rng().gen();
        msg.set_retry_at_nanos(now_nanos.saturating_add(next_backoff_nanos(
            msg.write_times(),
            &self.opts.retry,
            unit_jitter,
        )));
    }

    fn is_valid_write(&self, state: &WriterState, now_nanos: i64) -> bool {
        if state.cutoff_nanos > 0 && now_nanos >= state.cutoff_nanos {
            self.metrics.record_write_after_cutoff();
            return false;
        }
        if state.cutover_nanos > 0 && now_nanos < state.cutover_nanos {
            self.metrics.record_write_before_cutover();
            return false;
        }
        true
    }

    fn drain_queue(&self) {
        let mut state = self.state.write();
        while let Some(node) = state.queue.front() {
            if let Some(msg) = state.queue.remove(node) {
                self.acks.lock().remove(&msg.meta());
                msg.ack();
                self.pool.put(msg);
            }
        }
    }
}

/// Jittered exponential backoff in nanoseconds
///
/// `unit_jitter` is a uniform draw from `[0, 1)`. The result is
/// `initial * factor^(write_times - 1)` spread by the jitter fraction and
/// clamped into `[initial, max_backoff]`.
fn next_backoff_nanos(
    write_times: u64,
    retry: &crate::producer::RetryOptions,
    unit_jitter: f64,
) -> i64 {
    let initial = retry.initial_backoff.as_nanos() as f64;
    let max = retry.max_backoff.as_nanos() as f64;
    let exponent = write_times.saturating_sub(1).min(63) as i32;
    let mut backoff = initial * retry.backoff_factor.powi(exponent);
    if retry.jitter > 0.0 {
        let spread = retry.jitter.min(1.0);
        backoff *= 1.0 - spread + unit_jitter * 2.0 * spread;
    }
    backoff.clamp(initial, max) as i64
}
