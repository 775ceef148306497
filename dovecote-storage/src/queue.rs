//! Queue store contract.
//!
//! The queue store is the only synchronization point between nodes. It has
//! no native queue or lock primitive; every delivery guarantee is built from
//! inserts, conditional updates, deletes and sorted reads on envelopes.

use async_trait::async_trait;
use dovecote_core::{DovecoteResult, Envelope, EnvelopeId, MsgId, NodeId, Timestamp};

// ============================================================================
// INDEXES
// ============================================================================

/// A secondary index a backend should maintain for the loop's queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexSpec {
    pub name: &'static str,
    pub fields: &'static [&'static str],
}

/// Indexes requested when a messaging node starts.
pub const REQUIRED_INDEXES: &[IndexSpec] = &[
    IndexSpec {
        name: "locked_by_timestamp",
        fields: &["locked_by", "timestamp"],
    },
    IndexSpec {
        name: "locked_by_processed_by",
        fields: &["locked_by", "processed_by"],
    },
    IndexSpec {
        name: "timestamp",
        fields: &["timestamp"],
    },
];

// ============================================================================
// CLAIM LIMIT
// ============================================================================

/// How many eligible envelopes a single claim may lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimLimit {
    /// Only the oldest eligible envelope.
    One,
    /// Every eligible envelope.
    All,
}

impl ClaimLimit {
    pub fn from_process_multiple(process_multiple: bool) -> Self {
        if process_multiple {
            ClaimLimit::All
        } else {
            ClaimLimit::One
        }
    }
}

/// Sort key giving FIFO order with a stable tie-break.
pub fn fifo_key(envelope: &Envelope) -> (Timestamp, EnvelopeId) {
    (envelope.timestamp, envelope.id)
}

// ============================================================================
// QUEUE STORE TRAIT
// ============================================================================

/// Shared collection of envelopes.
///
/// Implementations must make [`QueueStore::claim`] a per-document conditional
/// write: eligibility is re-checked at the moment each envelope is locked, so
/// two nodes racing on the same envelope cannot both own it.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Request the given secondary indexes. Idempotent.
    async fn ensure_indexes(&self, indexes: &[IndexSpec]) -> DovecoteResult<()>;

    /// Insert a batch of envelopes. Nil ids are replaced with fresh ones.
    async fn insert_many(&self, envelopes: Vec<Envelope>) -> DovecoteResult<Vec<EnvelopeId>>;

    /// Insert one envelope.
    async fn insert(&self, envelope: Envelope) -> DovecoteResult<EnvelopeId> {
        let ids = self.insert_many(vec![envelope]).await?;
        ids.into_iter().next().ok_or_else(|| {
            dovecote_core::StoreError::InsertFailed {
                reason: "store returned no id".to_string(),
            }
            .into()
        })
    }

    /// Delete every envelope whose age at `now` exceeds its TTL.
    async fn delete_expired(&self, now: Timestamp) -> DovecoteResult<u64>;

    /// Lock eligible envelopes for `node`, returning how many were locked.
    async fn claim(&self, node: &NodeId, now: Timestamp, limit: ClaimLimit) -> DovecoteResult<u64>;

    /// Envelopes `node` should dispatch, ascending by timestamp.
    async fn fetch_for(&self, node: &NodeId) -> DovecoteResult<Vec<Envelope>>;

    /// Re-read one envelope.
    async fn get(&self, id: EnvelopeId) -> DovecoteResult<Option<Envelope>>;

    /// Delete one envelope; returns whether it existed.
    async fn delete(&self, id: EnvelopeId) -> DovecoteResult<bool>;

    /// Add `node` to `processed_by` of every envelope with `msg_id`.
    /// Idempotent; returns how many envelopes changed.
    async fn add_processed_by(&self, msg_id: MsgId, node: &NodeId) -> DovecoteResult<u64>;

    /// Unlock an envelope held by `node` and mark it processed by `node`.
    /// Returns false if the envelope is gone or no longer held by `node`.
    async fn release(&self, id: EnvelopeId, node: &NodeId) -> DovecoteResult<bool>;

    /// Number of stored envelopes.
    async fn count(&self) -> DovecoteResult<usize>;

    /// Every stored envelope, ascending by timestamp.
    async fn list(&self) -> DovecoteResult<Vec<Envelope>>;
}
