//! Counters for one messaging node.

use std::sync::atomic::{AtomicU64, Ordering};

/// Metrics for a messaging node.
///
/// Shared between the loop task, the flush task and the owning [`crate::Messaging`].
#[derive(Debug, Default)]
pub struct MessagingMetrics {
    /// Loop iterations completed, successful or not
    pub cycles: AtomicU64,

    /// Envelopes deleted by the expiry step
    pub expired: AtomicU64,

    /// Envelopes locked by this node
    pub claimed: AtomicU64,

    /// Envelopes handed to listeners
    pub dispatched: AtomicU64,

    /// Listener invocations that returned an error or panicked
    pub listener_failures: AtomicU64,

    /// Loop iterations aborted by a store error
    pub cycle_errors: AtomicU64,

    /// Replies and acknowledgements queued by dispatch
    pub replies_queued: AtomicU64,

    /// Envelopes written by buffer flushes
    pub envelopes_flushed: AtomicU64,

    /// Buffer flushes that failed and were requeued
    pub flush_errors: AtomicU64,
}

impl MessagingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        Self::add(counter, 1);
    }

    /// Get current snapshot of all metrics.
    pub fn snapshot(&self) -> MessagingSnapshot {
        MessagingSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            claimed: self.claimed.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            listener_failures: self.listener_failures.load(Ordering::Relaxed),
            cycle_errors: self.cycle_errors.load(Ordering::Relaxed),
            replies_queued: self.replies_queued.load(Ordering::Relaxed),
            envelopes_flushed: self.envelopes_flushed.load(Ordering::Relaxed),
            flush_errors: self.flush_errors.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of messaging metrics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessagingSnapshot {
    pub cycles: u64,
    pub expired: u64,
    pub claimed: u64,
    pub dispatched: u64,
    pub listener_failures: u64,
    pub cycle_errors: u64,
    pub replies_queued: u64,
    pub envelopes_flushed: u64,
    pub flush_errors: u64,
}
