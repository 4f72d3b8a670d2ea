//! Messages and their metadata
//!
//! A produced message is refcounted: the producer holds one reference and
//! every replicated-shard writer that enqueues it takes another. Writers
//! ack or observe upstream drops through shared atomic flags, so the acks
//! map and the retry scan never contend on a message body lock.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

/// Identity of one message within one replicated shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageMeta {
    /// Replicated shard the message belongs to
    pub shard: u64,
    /// Monotonic id assigned by the shard's writer
    pub id: u64,
}

/// Refcounted message payload shared across replicated writers
pub struct RefCountedMessage {
    payload: Bytes,
    refs: AtomicI64,
    dropped: AtomicBool,
}

impl RefCountedMessage {
    /// Wrap a payload
    pub fn new(payload: Bytes) -> Self {
        Self {
            payload,
            refs: AtomicI64::new(0),
            dropped: AtomicBool::new(false),
        }
    }

    /// The payload bytes
    pub fn payload(&self) -> Bytes {
        self.payload.clone()
    }

    /// Take a reference (one per enqueueing writer)
    pub fn inc_ref(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Release a reference
    pub fn dec_ref(&self) {
        self.refs.fetch_sub(1, Ordering::AcqRel);
    }

    /// Outstanding references
    pub fn ref_count(&self) -> i64 {
        self.refs.load(Ordering::Acquire)
    }

    /// Mark the message dropped upstream
    ///
    /// Writers observe the flag during their retry scan and reclaim the
    /// message without delivering it.
    pub fn mark_dropped(&self) {
        self.dropped.store(true, Ordering::Release);
    }

    /// Whether the message was dropped upstream
    pub fn is_dropped(&self) -> bool {
        self.dropped.load(Ordering::Acquire)
    }
}

/// One enqueued message of a replicated-shard writer
///
/// Lives in both the writer's queue and its acks map until acked, observed
/// dropped, or discarded at close; then it returns to the writer's pool.
pub(crate) struct Message {
    shard: u64,
    id: AtomicU64,
    payload: Mutex<Option<Arc<RefCountedMessage>>>,
    retry_at_nanos: AtomicI64,
    write_times: AtomicU64,
    acked: AtomicBool,
}

impl Message {
    pub(crate) fn new(shard: u64) -> Self {
        Self {
            shard,
            id: AtomicU64::new(0),
            payload: Mutex::new(None),
            retry_at_nanos: AtomicI64::new(0),
            write_times: AtomicU64::new(0),
            acked: AtomicBool::new(false),
        }
    }

    /// Reset for a freshly assigned id and payload
    pub(crate) fn reset(&self, id: u64, rm: Arc<RefCountedMessage>) {
        self.id.store(id, Ordering::Release);
        *self.payload.lock() = Some(rm);
        self.retry_at_nanos.store(0, Ordering::Release);
        self.write_times.store(0, Ordering::Release);
        self.acked.store(false, Ordering::Release);
    }

    pub(crate) fn meta(&self) -> MessageMeta {
        MessageMeta {
            shard: self.shard,
            id: self.id.load(Ordering::Acquire),
        }
    }

    /// Ack the message, releasing its payload reference
    ///
    /// Returns false when already acked.
    pub(crate) fn ack(&self) -> bool {
        if self.acked.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(rm) = self.payload.lock().take() {
            rm.dec_ref();
        }
        true
    }

    pub(crate) fn is_acked(&self) -> bool {
        self.acked.load(Ordering::Acquire)
    }

    pub(crate) fn is_dropped_or_acked(&self) -> bool {
        if self.is_acked() {
            return true;
        }
        match self.payload.lock().as_ref() {
            Some(rm) => rm.is_dropped(),
            None => true,
        }
    }

    /// Payload snapshot for a delivery attempt
    ///
    /// None when the message was acked or dropped in the meantime.
    pub(crate) fn bytes(&self) -> Option<Bytes> {
        let payload = self.payload.lock();
        match payload.as_ref() {
            Some(rm) if !rm.is_dropped() => Some(rm.payload()),
            _ => None,
        }
    }

    pub(crate) fn retry_at_nanos(&self) -> i64 {
        self.retry_at_nanos.load(Ordering::Acquire)
    }

    pub(crate) fn set_retry_at_nanos(&self, nanos: i64) {
        self.retry_at_nanos.store(nanos, Ordering::Release);
    }

    pub(crate) fn write_times(&self) -> u64 {
        self.write_times.load(Ordering::Acquire)
    }

    pub(crate) fn inc_write_times(&self) {
        self.write_times.fetch_add(1, Ordering::AcqRel);
    }
}
