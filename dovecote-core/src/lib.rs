//! Dovecote Core - Envelope Types
//!
//! Pure data structures shared by every dovecote crate: the message envelope,
//! node and entity identities, the error taxonomy and messaging configuration.
//! This crate contains no I/O.

use chrono::{DateTime, Utc};
use uuid::Uuid;

pub mod config;
pub mod envelope;
pub mod error;
pub mod identity;

pub use config::{MessagingConfig, DEFAULT_PAUSE_INTERVAL_MS, INITIAL_FLUSH_DELAY_MS};
pub use envelope::{DeliveryMode, Envelope, LockHolder, DEFAULT_TTL_MS, LOCK_ALL};
pub use error::{
    CacheSyncError, ConfigError, DovecoteError, DovecoteResult, MessagingError, StoreError,
};
pub use identity::{EntityType, NodeId, RecordId};

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Store-assigned envelope identity (UUIDv7, timestamp-sortable).
pub type EnvelopeId = Uuid;

/// Logical message identity, stable across lock/unlock cycles.
pub type MsgId = Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Duration in milliseconds for TTL values.
pub type DurationMs = i64;

/// Generate a new UUIDv7 identifier.
pub fn new_id() -> Uuid {
    Uuid::now_v7()
}
