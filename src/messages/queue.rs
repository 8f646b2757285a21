//! Global reply queue
//!
//! One FIFO shared by every trigger. Producers never block: a full queue
//! either evicts its oldest envelope or rejects the new batch, depending on
//! the configured [`OverflowPolicy`]. A batch is always enqueued contiguously
//! so its replies leave in order.

use super::envelope::ReplyEnvelope;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::warn;

/// Default capacity of the queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// What happens when an enqueue would exceed capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OverflowPolicy {
    /// No limit
    Unbounded,
    /// Evict the oldest queued envelopes to make room
    #[default]
    DropOldest,
    /// Refuse the whole incoming batch
    RejectNew,
}

/// Queue errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("delivery queue is full (capacity {capacity})")]
    Full { capacity: usize },

    #[error("delivery queue is closed")]
    Closed,
}

/// Outcome of a successful enqueue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EnqueueReport {
    pub accepted: usize,
    /// Older envelopes dropped to make room
    pub evicted: usize,
}

/// Snapshot of delivery counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct DeliveryStats {
    pub queued: u64,
    pub sent: u64,
    pub retried: u64,
    /// Gave up after exhausting attempts
    pub dropped: u64,
    pub evicted: u64,
    pub rejected: u64,
    pub pending: usize,
}

impl DeliveryStats {
    /// Every accepted envelope has reached a terminal state
    pub fn is_settled(&self) -> bool {
        self.pending == 0 && self.sent + self.dropped + self.evicted >= self.queued
    }
}

#[derive(Debug, Default)]
struct Counters {
    queued: AtomicU64,
    sent: AtomicU64,
    retried: AtomicU64,
    dropped: AtomicU64,
    evicted: AtomicU64,
    rejected: AtomicU64,
}

/// Shared reply queue
pub struct DeliveryQueue {
    pending: Mutex<VecDeque<ReplyEnvelope>>,
    capacity: usize,
    policy: OverflowPolicy,
    closed: AtomicBool,
    counters: Counters,
    /// Wakes the delivery coordinator
    notify: Arc<Notify>,
}

impl std::fmt::Debug for DeliveryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryQueue")
            .field("pending", &self.pending.lock().len())
            .field("capacity", &self.capacity)
            .field("policy", &self.policy)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .field("notify", &"Notify")
            .finish()
    }
}

impl Default for DeliveryQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY, OverflowPolicy::default())
    }
}

impl DeliveryQueue {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            policy,
            closed: AtomicBool::new(false),
            counters: Counters::default(),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Notifier the coordinator waits on
    pub fn notifier(&self) -> &Arc<Notify> {
        &self.notify
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Append a batch in order. Never waits.
    pub fn enqueue_batch(&self, batch: Vec<ReplyEnvelope>) -> Result<EnqueueReport, QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }
        if batch.is_empty() {
            return Ok(EnqueueReport::default());
        }

        let incoming = batch.len();
        let report = {
            let mut pending = self.pending.lock();
            let mut evicted = 0;

            match self.policy {
                OverflowPolicy::Unbounded => {}
                OverflowPolicy::RejectNew => {
                    if pending.len() + incoming > self.capacity {
                        self.counters
                            .rejected
                            .fetch_add(incoming as u64, Ordering::Relaxed);
                        warn!(
                            pending = pending.len(),
                            incoming,
                            capacity = self.capacity,
                            "delivery queue full, batch rejected"
                        );
                        return Err(QueueError::Full {
                            capacity: self.capacity,
                        });
                    }
                }
                OverflowPolicy::DropOldest => {
                    while pending.len() + incoming > self.capacity && pending.pop_front().is_some() {
                        evicted += 1;
                    }
                }
            }

            pending.extend(batch);
            // A batch larger than capacity loses its own head
            while self.policy == OverflowPolicy::DropOldest && pending.len() > self.capacity {
                pending.pop_front();
                evicted += 1;
            }

            EnqueueReport {
                accepted: incoming,
                evicted,
            }
        };

        self.counters
            .queued
            .fetch_add(incoming as u64, Ordering::Relaxed);
        if report.evicted > 0 {
            self.counters
                .evicted
                .fetch_add(report.evicted as u64, Ordering::Relaxed);
            warn!(
                evicted = report.evicted,
                capacity = self.capacity,
                "delivery queue full, oldest replies dropped"
            );
        }
        self.notify.notify_one();
        Ok(report)
    }

    /// Take the next envelope
    pub fn pop(&self) -> Option<ReplyEnvelope> {
        self.pending.lock().pop_front()
    }

    /// Return an envelope to the head, ahead of everything else
    pub fn push_front(&self, envelope: ReplyEnvelope) {
        self.pending.lock().push_front(envelope);
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Stop accepting new batches; queued envelopes stay
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn record_sent(&self) {
        self.counters.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.counters.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self) {
        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> DeliveryStats {
        DeliveryStats {
            queued: self.counters.queued.load(Ordering::Relaxed),
            sent: self.counters.sent.load(Ordering::Relaxed),
            retried: self.counters.retried.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            evicted: self.counters.evicted.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            pending: self.len(),
        }
    }
}
