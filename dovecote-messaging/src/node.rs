//! Messaging node: the claim/dispatch loop.
//!
//! Each cycle runs six steps against the shared queue store:
//!
//! 1. Expire: delete envelopes older than their TTL
//! 2. Claim: lock eligible envelopes for this node (one conditional update)
//! 3. Fetch: read envelopes locked by this node plus pending broadcasts
//! 4. Re-validate: re-read each one; skip vanished, expired or stolen ones
//! 5. Dispatch: global listeners, then name-scoped listeners
//! 6. Finalize: acknowledge broadcasts, delete exclusives, release the rest
//!
//! Replies produced by listeners go through the outbound buffer and reach the
//! store on the next flush.

use crate::buffer::{spawn_flush_task, OutboundBuffer};
use crate::listener::Outbox;
use crate::metrics::{MessagingMetrics, MessagingSnapshot};
use crate::registry::{ListenerRef, ListenerRegistry};
use chrono::Utc;
use dovecote_core::{
    DovecoteResult, Envelope, EnvelopeId, LockHolder, MessagingConfig, MessagingError, NodeId,
};
use dovecote_storage::{ClaimLimit, QueueStore, REQUIRED_INDEXES};
use futures_util::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Text of the acknowledgement synthesized when auto-answer is on.
pub const AUTO_ANSWER_MSG: &str = "received";

// ============================================================================
// CYCLE REPORT
// ============================================================================

/// What one loop iteration did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub expired: u64,
    pub claimed: u64,
    pub fetched: usize,
    pub dispatched: usize,
    pub skipped: usize,
    pub listener_failures: usize,
    pub replies: usize,
}

// ============================================================================
// MESSAGING NODE
// ============================================================================

/// One messaging node.
///
/// Owns its store handle, identity, listener registry, outbound buffer and
/// metrics. Nodes sharing a store exchange envelopes; nothing is global.
pub struct Messaging<S: QueueStore> {
    store: Arc<S>,
    config: MessagingConfig,
    registry: ListenerRegistry,
    buffer: OutboundBuffer,
    metrics: Arc<MessagingMetrics>,
    running: AtomicBool,
}

impl<S: QueueStore> std::fmt::Debug for Messaging<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Messaging")
            .field("node_id", &self.config.node_id)
            .field("registry", &self.registry)
            .field("pending", &self.buffer.len())
            .field("running", &self.is_running())
            .finish()
    }
}

impl<S: QueueStore> Messaging<S> {
    /// Create a node. The configuration is validated.
    pub fn new(store: Arc<S>, config: MessagingConfig) -> DovecoteResult<Self> {
        config.validate()?;
        Ok(Self {
            store,
            config,
            registry: ListenerRegistry::new(),
            buffer: OutboundBuffer::new(),
            metrics: Arc::new(MessagingMetrics::new()),
            running: AtomicBool::new(false),
        })
    }

    pub fn node_id(&self) -> &NodeId {
        &self.config.node_id
    }

    pub fn config(&self) -> &MessagingConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<MessagingMetrics> {
        &self.metrics
    }

    /// Envelopes queued but not yet flushed.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Send handle for this node.
    pub fn outbox(&self) -> Outbox {
        Outbox::new(self.config.node_id.clone(), self.buffer.clone())
    }

    // ------------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------------

    /// Queue an envelope for the next buffer flush.
    pub fn queue_message(&self, envelope: Envelope) {
        self.outbox().queue(envelope);
    }

    /// Write an envelope to the store immediately, bypassing the buffer.
    pub async fn store_message(&self, mut envelope: Envelope) -> DovecoteResult<EnvelopeId> {
        envelope.prepare_for_send(&self.config.node_id);
        self.store.insert(envelope).await
    }

    /// Flush the outbound buffer now.
    pub async fn flush(&self) -> DovecoteResult<usize> {
        self.buffer.flush(self.store.as_ref(), &self.metrics).await
    }

    // ------------------------------------------------------------------------
    // Listener registration
    // ------------------------------------------------------------------------

    pub fn register_global(&self, listener: ListenerRef) {
        listener.bind(Some(self.outbox()));
        self.registry.register_global(listener);
    }

    pub fn register_for(&self, name: &str, listener: ListenerRef) {
        listener.bind(Some(self.outbox()));
        self.registry.register_for(name, listener);
    }

    pub fn unregister_global(&self, listener: &ListenerRef) -> bool {
        let removed = self.registry.unregister_global(listener);
        if removed {
            listener.bind(None);
        }
        removed
    }

    pub fn unregister_for(&self, name: &str, listener: &ListenerRef) -> bool {
        let removed = self.registry.unregister_for(name, listener);
        if removed {
            listener.bind(None);
        }
        removed
    }

    pub fn registry(&self) -> &ListenerRegistry {
        &self.registry
    }

    /// Unbind and drop every listener.
    pub fn clear_listeners(&self) {
        for listener in self.registry.clear() {
            listener.bind(None);
        }
    }

    // ------------------------------------------------------------------------
    // Loop body
    // ------------------------------------------------------------------------

    /// Run one claim/dispatch iteration.
    pub async fn run_cycle(&self) -> DovecoteResult<CycleReport> {
        let node = &self.config.node_id;
        let mut report = CycleReport::default();

        let now = Utc::now();
        report.expired = self.store.delete_expired(now).await?;
        MessagingMetrics::add(&self.metrics.expired, report.expired);

        let limit = ClaimLimit::from_process_multiple(self.config.process_multiple);
        report.claimed = self.store.claim(node, now, limit).await?;
        MessagingMetrics::add(&self.metrics.claimed, report.claimed);

        let batch = self.store.fetch_for(node).await?;
        report.fetched = batch.len();

        for fetched in batch {
            let Some(envelope) = self.store.get(fetched.id).await? else {
                report.skipped += 1;
                continue;
            };
            if envelope.is_expired(Utc::now()) {
                self.store.delete(envelope.id).await?;
                report.skipped += 1;
                continue;
            }
            if !envelope.is_fetchable_by(node) {
                tracing::debug!(
                    node_id = %node,
                    envelope_id = %envelope.id,
                    "Envelope lock changed before dispatch; skipping"
                );
                report.skipped += 1;
                continue;
            }

            self.dispatch(&envelope, &mut report).await;
            self.finalize(&envelope).await?;
        }

        if report.claimed > 0 || report.dispatched > 0 || report.expired > 0 {
            tracing::debug!(
                node_id = %node,
                expired = report.expired,
                claimed = report.claimed,
                dispatched = report.dispatched,
                skipped = report.skipped,
                "Messaging cycle completed"
            );
        }
        Ok(report)
    }

    async fn dispatch(&self, envelope: &Envelope, report: &mut CycleReport) {
        let node = &self.config.node_id;
        report.dispatched += 1;
        MessagingMetrics::incr(&self.metrics.dispatched);

        for listener in self.registry.listeners_for(&envelope.name) {
            let outcome = AssertUnwindSafe(listener.on_message(envelope))
                .catch_unwind()
                .await;

            let reply = match outcome {
                Ok(Ok(reply)) => reply,
                Ok(Err(e)) => {
                    report.listener_failures += 1;
                    MessagingMetrics::incr(&self.metrics.listener_failures);
                    tracing::error!(
                        node_id = %node,
                        envelope_id = %envelope.id,
                        listener = listener.name(),
                        error = %e,
                        "Listener failed"
                    );
                    continue;
                }
                Err(panic) => {
                    report.listener_failures += 1;
                    MessagingMetrics::incr(&self.metrics.listener_failures);
                    let err = MessagingError::ListenerFailed {
                        listener: listener.name().to_string(),
                        reason: panic_message(panic.as_ref()),
                    };
                    tracing::error!(
                        node_id = %node,
                        envelope_id = %envelope.id,
                        error = %err,
                        "Listener panicked"
                    );
                    continue;
                }
            };

            // Answers are not auto-acknowledged, or two auto-answering nodes
            // would reply to each other forever.
            let reply = reply.or_else(|| {
                (self.config.auto_answer && envelope.in_answer_to.is_none()).then(|| {
                    Envelope::exclusive(envelope.name.clone(), AUTO_ANSWER_MSG, "")
                })
            });

            if let Some(reply) = reply {
                self.queue_message(envelope.answer_with(reply));
                report.replies += 1;
                MessagingMetrics::incr(&self.metrics.replies_queued);
            }
        }
    }

    async fn finalize(&self, envelope: &Envelope) -> DovecoteResult<()> {
        let node = &self.config.node_id;
        match &envelope.locked_by {
            Some(LockHolder::All) => {
                self.store.add_processed_by(envelope.msg_id, node).await?;
            }
            Some(LockHolder::Node(holder)) if holder == node && envelope.is_exclusive() => {
                self.store.delete(envelope.id).await?;
            }
            _ => {
                self.store.release(envelope.id, node).await?;
            }
        }
        Ok(())
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "listener panicked".to_string()
    }
}

// ============================================================================
// BACKGROUND TASKS
// ============================================================================

impl<S: QueueStore + 'static> Messaging<S> {
    /// Request the store's indexes and spawn the loop and flush tasks.
    ///
    /// ```ignore
    /// let node = Arc::new(Messaging::new(store, MessagingConfig::from_env())?);
    /// node.register_for("job", Arc::new(JobListener));
    /// let handle = node.start().await?;
    /// // ...
    /// let metrics = handle.shutdown().await?;
    /// ```
    pub async fn start(self: &Arc<Self>) -> DovecoteResult<MessagingHandle<S>> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(MessagingError::AlreadyRunning {
                node_id: self.config.node_id.to_string(),
            }
            .into());
        }

        if let Err(e) = self.store.ensure_indexes(REQUIRED_INDEXES).await {
            self.running.store(false, Ordering::SeqCst);
            return Err(e);
        }

        // Separate signals: the flush task must outlive the loop so replies
        // from the last cycle reach the final flush.
        let (loop_shutdown_tx, loop_shutdown_rx) = watch::channel(false);
        let (flush_shutdown_tx, flush_shutdown_rx) = watch::channel(false);
        let flush_task = spawn_flush_task(
            self.buffer.clone(),
            self.store.clone(),
            self.config.pause_interval,
            self.metrics.clone(),
            flush_shutdown_rx,
        );
        let loop_task = tokio::spawn(messaging_loop(self.clone(), loop_shutdown_rx));

        tracing::info!(
            node_id = %self.config.node_id,
            pause_interval_ms = self.config.pause_interval.as_millis() as u64,
            process_multiple = self.config.process_multiple,
            auto_answer = self.config.auto_answer,
            "Messaging node started"
        );

        Ok(MessagingHandle {
            node: self.clone(),
            loop_shutdown_tx,
            flush_shutdown_tx,
            loop_task,
            flush_task,
        })
    }
}

/// Loop task: run a cycle, then sleep the full pause interval, until
/// shutdown. A cycle in progress always completes. Store errors are logged
/// and counted; the loop carries on after the pause.
async fn messaging_loop<S: QueueStore + 'static>(
    node: Arc<Messaging<S>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    while !*shutdown_rx.borrow() {
        if let Err(e) = node.run_cycle().await {
            MessagingMetrics::incr(&node.metrics.cycle_errors);
            tracing::error!(
                node_id = %node.config.node_id,
                error = %e,
                "Messaging cycle failed"
            );
        }
        MessagingMetrics::incr(&node.metrics.cycles);

        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = sleep(node.config.pause_interval) => {}
        }
    }
    tracing::info!(node_id = %node.config.node_id, "Messaging loop shutting down");

    node.clear_listeners();
    node.running.store(false, Ordering::SeqCst);
}

/// Handle to a started node's background tasks.
pub struct MessagingHandle<S: QueueStore + 'static> {
    node: Arc<Messaging<S>>,
    loop_shutdown_tx: watch::Sender<bool>,
    flush_shutdown_tx: watch::Sender<bool>,
    loop_task: JoinHandle<()>,
    flush_task: JoinHandle<()>,
}

impl<S: QueueStore + 'static> std::fmt::Debug for MessagingHandle<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagingHandle")
            .field("node_id", &self.node.config.node_id)
            .field("loop_finished", &self.loop_task.is_finished())
            .field("flush_finished", &self.flush_task.is_finished())
            .finish()
    }
}

impl<S: QueueStore + 'static> MessagingHandle<S> {
    pub fn node(&self) -> &Arc<Messaging<S>> {
        &self.node
    }

    /// Stop the loop and wait for its current cycle, then stop the flush task
    /// and wait for its final flush. Returns the node's metrics.
    pub async fn shutdown(self) -> DovecoteResult<MessagingSnapshot> {
        // Receivers may already be gone if a task ended early.
        let _ = self.loop_shutdown_tx.send(true);
        let loop_result = self.loop_task.await;

        let _ = self.flush_shutdown_tx.send(true);
        loop_result.map_err(|e| MessagingError::TaskFailed {
            reason: format!("messaging loop: {}", e),
        })?;
        self.flush_task
            .await
            .map_err(|e| MessagingError::TaskFailed {
                reason: format!("outbound flush: {}", e),
            })?;

        let snapshot = self.node.metrics.snapshot();
        tracing::info!(
            node_id = %self.node.config.node_id,
            cycles = snapshot.cycles,
            dispatched = snapshot.dispatched,
            listener_failures = snapshot.listener_failures,
            cycle_errors = snapshot.cycle_errors,
            envelopes_flushed = snapshot.envelopes_flushed,
            "Messaging node stopped"
        );
        Ok(snapshot)
    }
}
