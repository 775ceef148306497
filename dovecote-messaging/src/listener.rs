//! Message listener contract and the send handle given to listeners.

use crate::buffer::OutboundBuffer;
use async_trait::async_trait;
use dovecote_core::{DovecoteResult, Envelope, NodeId};

/// Send handle of a messaging node.
///
/// Envelopes queued through an outbox are stamped with the node as sender
/// and written by the node's next buffer flush.
#[derive(Debug, Clone)]
pub struct Outbox {
    node_id: NodeId,
    buffer: OutboundBuffer,
}

impl Outbox {
    pub fn new(node_id: NodeId, buffer: OutboundBuffer) -> Self {
        Self { node_id, buffer }
    }

    /// Node this outbox sends as.
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Stamp the envelope for sending and append it to the outbound buffer.
    pub fn queue(&self, mut envelope: Envelope) {
        envelope.prepare_for_send(&self.node_id);
        tracing::trace!(
            node_id = %self.node_id,
            name = %envelope.name,
            mode = %envelope.delivery_mode,
            "Queued envelope"
        );
        self.buffer.enqueue(envelope);
    }
}

/// Receiver of dispatched envelopes.
///
/// Registered on a node either globally (every envelope) or for one message
/// name. Dispatch is sequential per node; a slow listener delays the rest of
/// the batch.
#[async_trait]
pub trait MessageListener: Send + Sync {
    /// Name used in logs and error reports.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Handle one envelope. A returned envelope is sent back to the original
    /// sender as an answer.
    async fn on_message(&self, envelope: &Envelope) -> DovecoteResult<Option<Envelope>>;

    /// Called with the owning node's outbox on registration and with `None`
    /// on unregistration or shutdown.
    fn bind(&self, _outbox: Option<Outbox>) {}
}
