//! The envelope: unit of transport between nodes.
//!
//! An envelope is a plain document in the shared queue store. All delivery
//! semantics (exclusive vs. broadcast, claiming, acknowledgement, expiry) are
//! expressed through its lock and lifecycle fields.
//!
//! # Lock lifecycle
//!
//! ```text
//! Exclusive: None ── claim ──→ Node(self) ── dispatch ──→ deleted
//! Broadcast: All ── dispatch ──→ processed_by += self ──→ ... ──→ TTL expiry
//! ```

use crate::{new_id, DurationMs, EnvelopeId, MsgId, NodeId, Timestamp};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Lock sentinel marking a broadcast envelope as claimed for fan-out.
pub const LOCK_ALL: &str = "ALL";

/// Default time-to-live for envelopes (30 seconds).
pub const DEFAULT_TTL_MS: DurationMs = 30_000;

// ============================================================================
// DELIVERY MODE
// ============================================================================

/// How many nodes should process an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryMode {
    /// Exactly one node (or the addressed node) processes and removes it.
    #[serde(rename = "SINGLE")]
    Exclusive,
    /// Every eligible node processes it once; removed only by TTL expiry.
    #[serde(rename = "MULTI")]
    Broadcast,
}

impl DeliveryMode {
    /// Convert to the stored string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            DeliveryMode::Exclusive => "SINGLE",
            DeliveryMode::Broadcast => "MULTI",
        }
    }
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_db_str())
    }
}

// ============================================================================
// LOCK HOLDER
// ============================================================================

/// Current owner of an envelope's lock.
///
/// Stored as a plain string: a node id, or the [`LOCK_ALL`] sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum LockHolder {
    /// Exclusively claimed by one node.
    Node(NodeId),
    /// Claimed for broadcast fan-out.
    All,
}

impl LockHolder {
    pub fn is_node(&self, node: &NodeId) -> bool {
        matches!(self, LockHolder::Node(holder) if holder == node)
    }
}

impl From<LockHolder> for String {
    fn from(holder: LockHolder) -> Self {
        match holder {
            LockHolder::Node(node) => node.as_str().to_string(),
            LockHolder::All => LOCK_ALL.to_string(),
        }
    }
}

impl From<String> for LockHolder {
    fn from(value: String) -> Self {
        if value == LOCK_ALL {
            return LockHolder::All;
        }
        // Node ids are validated on construction; stored values are trusted.
        LockHolder::Node(NodeId::from_stored(value))
    }
}

impl fmt::Display for LockHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockHolder::Node(node) => write!(f, "{}", node),
            LockHolder::All => f.write_str(LOCK_ALL),
        }
    }
}

// ============================================================================
// ENVELOPE
// ============================================================================

/// A message record exchanged between nodes through the queue store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Store-assigned identity; nil until inserted
    pub id: EnvelopeId,
    /// Logical message identity, stable across lock cycles
    pub msg_id: MsgId,
    /// Originating node, stamped when queued
    pub sender: Option<NodeId>,
    /// Target node; `None` means any/all eligible nodes
    pub to: Option<NodeId>,
    /// Exclusive or broadcast delivery
    #[serde(rename = "type")]
    pub delivery_mode: DeliveryMode,
    /// Topic used for listener dispatch
    pub name: String,
    /// Free-form message text
    pub msg: String,
    /// Free-form value
    pub value: String,
    /// Ordered auxiliary tokens
    #[serde(default)]
    pub additional: Vec<String>,
    /// Creation time; FIFO order and TTL base
    pub timestamp: Timestamp,
    /// Maximum age in milliseconds
    pub ttl: DurationMs,
    /// Current lock owner
    pub locked_by: Option<LockHolder>,
    /// Time of last lock acquisition (diagnostic only)
    pub locked_at: Option<Timestamp>,
    /// Nodes that already dispatched this envelope
    #[serde(default)]
    pub processed_by: Vec<NodeId>,
    /// `msg_id` of the envelope this one answers
    #[serde(default)]
    pub in_answer_to: Option<MsgId>,
}

impl Envelope {
    /// Create a new unsent envelope.
    pub fn new(
        name: impl Into<String>,
        delivery_mode: DeliveryMode,
        msg: impl Into<String>,
        value: impl Into<String>,
        ttl: DurationMs,
    ) -> Self {
        Self {
            id: Uuid::nil(),
            msg_id: new_id(),
            sender: None,
            to: None,
            delivery_mode,
            name: name.into(),
            msg: msg.into(),
            value: value.into(),
            additional: Vec::new(),
            timestamp: Utc::now(),
            ttl,
            locked_by: None,
            locked_at: None,
            processed_by: Vec::new(),
            in_answer_to: None,
        }
    }

    /// Create an exclusive envelope with the default TTL.
    pub fn exclusive(
        name: impl Into<String>,
        msg: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self::new(name, DeliveryMode::Exclusive, msg, value, DEFAULT_TTL_MS)
    }

    /// Create a broadcast envelope with the default TTL.
    pub fn broadcast(
        name: impl Into<String>,
        msg: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self::new(name, DeliveryMode::Broadcast, msg, value, DEFAULT_TTL_MS)
    }

    /// Address the envelope to one node.
    pub fn with_to(mut self, to: NodeId) -> Self {
        self.to = Some(to);
        self
    }

    /// Set the time-to-live.
    pub fn with_ttl(mut self, ttl: DurationMs) -> Self {
        self.ttl = ttl;
        self
    }

    /// Override the creation timestamp.
    pub fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Append an auxiliary token.
    pub fn with_additional(mut self, token: impl Into<String>) -> Self {
        self.additional.push(token.into());
        self
    }

    pub fn is_exclusive(&self) -> bool {
        self.delivery_mode == DeliveryMode::Exclusive
    }

    /// Check whether the envelope outlived its TTL at `now`.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        (now - self.timestamp).num_milliseconds() > self.ttl
    }

    pub fn is_addressed_to(&self, node: &NodeId) -> bool {
        self.to.as_ref().map_or(true, |to| to == node)
    }

    pub fn is_sent_by(&self, node: &NodeId) -> bool {
        self.sender.as_ref() == Some(node)
    }

    pub fn is_processed_by(&self, node: &NodeId) -> bool {
        self.processed_by.contains(node)
    }

    pub fn is_locked_by(&self, node: &NodeId) -> bool {
        self.locked_by.as_ref().is_some_and(|holder| holder.is_node(node))
    }

    /// Claim eligibility: unlocked, not from `node`, not yet processed by
    /// `node`, and unaddressed or addressed to `node`.
    pub fn is_claimable_by(&self, node: &NodeId) -> bool {
        self.locked_by.is_none()
            && !self.is_sent_by(node)
            && !self.is_processed_by(node)
            && self.is_addressed_to(node)
    }

    /// Fetch eligibility after the claim step: locked by `node`, or a
    /// broadcast `node` has not yet processed.
    pub fn is_fetchable_by(&self, node: &NodeId) -> bool {
        match &self.locked_by {
            Some(LockHolder::Node(holder)) => holder == node,
            Some(LockHolder::All) => {
                !self.is_processed_by(node) && !self.is_sent_by(node) && self.is_addressed_to(node)
            }
            None => false,
        }
    }

    /// Record that `node` dispatched this envelope. Idempotent.
    pub fn mark_processed_by(&mut self, node: &NodeId) {
        if !self.is_processed_by(node) {
            self.processed_by.push(node.clone());
        }
    }

    /// Lock the envelope for `node` at `now`.
    pub fn lock_for(&mut self, node: &NodeId, now: Timestamp) {
        self.locked_by = Some(LockHolder::Node(node.clone()));
        self.locked_at = Some(now);
    }

    /// Drop the lock and record `node` as having processed the envelope.
    pub fn release_by(&mut self, node: &NodeId) {
        self.locked_by = None;
        self.locked_at = None;
        self.mark_processed_by(node);
    }

    /// Stamp sender and initial lock state before the envelope is written.
    ///
    /// The sender is added to `processed_by`, exclusive envelopes start
    /// unlocked, broadcast envelopes start locked by [`LockHolder::All`].
    pub fn prepare_for_send(&mut self, sender: &NodeId) {
        self.sender = Some(sender.clone());
        self.mark_processed_by(sender);
        self.locked_at = None;
        self.locked_by = match self.delivery_mode {
            DeliveryMode::Exclusive => None,
            DeliveryMode::Broadcast => Some(LockHolder::All),
        };
    }

    /// Turn `reply` into an answer to this envelope: exclusive, addressed to
    /// this envelope's sender, linked through `in_answer_to`.
    pub fn answer_with(&self, mut reply: Envelope) -> Envelope {
        reply.in_answer_to = Some(self.msg_id);
        reply.to = self.sender.clone();
        reply.delivery_mode = DeliveryMode::Exclusive;
        reply
    }
}
