//! Outbound buffer.
//!
//! Producers append envelopes without touching the store. A background task
//! swaps the buffer for an empty one on every tick and writes the batch with
//! a single bulk insert. The buffer is unbounded: if the store cannot keep up
//! it grows without limit.

use crate::metrics::MessagingMetrics;
use dovecote_core::{DovecoteResult, Envelope, INITIAL_FLUSH_DELAY_MS};
use dovecote_storage::QueueStore;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Pending outbound envelopes, shared by cloning.
#[derive(Debug, Clone, Default)]
pub struct OutboundBuffer {
    pending: Arc<Mutex<Vec<Envelope>>>,
}

impl OutboundBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    // A panic while holding the lock leaves the vector intact; keep using it.
    fn lock(&self) -> MutexGuard<'_, Vec<Envelope>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an envelope for the next flush.
    pub fn enqueue(&self, envelope: Envelope) {
        self.lock().push(envelope);
    }

    /// Swap the buffer for an empty one and return its contents.
    pub fn take(&self) -> Vec<Envelope> {
        std::mem::take(&mut *self.lock())
    }

    /// Put a batch back ahead of anything queued since it was taken.
    pub fn requeue_front(&self, mut batch: Vec<Envelope>) {
        let mut pending = self.lock();
        batch.append(&mut pending);
        *pending = batch;
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Write everything pending with one bulk insert.
    ///
    /// On failure the batch is requeued so the next flush retries it.
    pub async fn flush<S: QueueStore + ?Sized>(
        &self,
        store: &S,
        metrics: &MessagingMetrics,
    ) -> DovecoteResult<usize> {
        let batch = self.take();
        if batch.is_empty() {
            return Ok(0);
        }

        let count = batch.len();
        match store.insert_many(batch.clone()).await {
            Ok(_) => {
                MessagingMetrics::add(&metrics.envelopes_flushed, count as u64);
                tracing::debug!(count, "Flushed outbound envelopes");
                Ok(count)
            }
            Err(e) => {
                MessagingMetrics::incr(&metrics.flush_errors);
                self.requeue_front(batch);
                Err(e)
            }
        }
    }
}

/// Background task that flushes the buffer every `pause_interval`, starting
/// after a short initial delay. Performs a final flush on shutdown.
pub fn spawn_flush_task<S: QueueStore + 'static>(
    buffer: OutboundBuffer,
    store: Arc<S>,
    pause_interval: Duration,
    metrics: Arc<MessagingMetrics>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let start = Instant::now() + Duration::from_millis(INITIAL_FLUSH_DELAY_MS);
        let mut ticker = interval_at(start, pause_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }

                _ = ticker.tick() => {
                    if let Err(e) = buffer.flush(store.as_ref(), &metrics).await {
                        tracing::error!(
                            error = %e,
                            pending = buffer.len(),
                            "Outbound flush failed; batch requeued"
                        );
                    }
                }
            }
        }

        if let Err(e) = buffer.flush(store.as_ref(), &metrics).await {
            tracing::error!(
                error = %e,
                dropped = buffer.len(),
                "Final outbound flush failed"
            );
        }
        tracing::debug!("Outbound flush task stopped");
    })
}
