//! Error types for dovecote operations

use crate::{EntityType, EnvelopeId};
use thiserror::Error;

/// Queue store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Envelope not found: {id}")]
    NotFound { id: EnvelopeId },

    #[error("Insert failed: {reason}")]
    InsertFailed { reason: String },

    #[error("Transaction failed: {reason}")]
    TransactionFailed { reason: String },

    #[error("Envelope encoding failed: {reason}")]
    Serialization { reason: String },

    #[error("Store unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Messaging node errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MessagingError {
    #[error("Invalid node id '{value}': {reason}")]
    InvalidNodeId { value: String, reason: String },

    #[error("Listener {listener} failed: {reason}")]
    ListenerFailed { listener: String, reason: String },

    #[error("Messaging node {node_id} is already running")]
    AlreadyRunning { node_id: String },

    #[error("Background task failed: {reason}")]
    TaskFailed { reason: String },

    #[error("Failed to init tracing subscriber: {reason}")]
    TelemetryInit { reason: String },
}

/// Cache synchronization errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheSyncError {
    #[error("class not found: {type_name}")]
    TypeNotResolved { type_name: String },

    #[error("Unknown cache directive '{name}' with value '{value}'")]
    UnknownDirective { name: String, value: String },

    #[error("Refresh failed for {entity_type} with id {id}: {reason}")]
    RefreshFailed {
        entity_type: EntityType,
        id: String,
        reason: String,
    },

    #[error("Local cache failure: {reason}")]
    CacheFailure { reason: String },

    #[error("Config reload failed: {reason}")]
    ConfigReloadFailed { reason: String },
}

/// Master error type for all dovecote errors.
#[derive(Debug, Clone, Error)]
pub enum DovecoteError {
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Messaging error: {0}")]
    Messaging(#[from] MessagingError),

    #[error("Cache sync error: {0}")]
    CacheSync(#[from] CacheSyncError),
}

/// Result type alias for dovecote operations.
pub type DovecoteResult<T> = Result<T, DovecoteError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_store_error_display_not_found() {
        let err = StoreError::NotFound { id: Uuid::nil() };
        let msg = format!("{}", err);
        assert!(msg.contains("Envelope not found"));
        assert!(msg.contains("00000000-0000-0000-0000-000000000000"));
    }

    #[test]
    fn test_config_error_display_invalid_value() {
        let err = ConfigError::InvalidValue {
            field: "pause_interval".to_string(),
            value: "0ms".to_string(),
            reason: "must be positive".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("pause_interval"));
        assert!(msg.contains("0ms"));
        assert!(msg.contains("must be positive"));
    }

    #[test]
    fn test_type_not_resolved_names_the_class() {
        let err = CacheSyncError::TypeNotResolved {
            type_name: "Invoice".to_string(),
        };
        assert_eq!(format!("{}", err), "class not found: Invoice");
    }

    #[test]
    fn test_dovecote_error_from_store() {
        let err: DovecoteError = StoreError::LockPoisoned.into();
        assert!(matches!(err, DovecoteError::Storage(StoreError::LockPoisoned)));
        assert!(format!("{}", err).contains("Storage error"));
    }

    #[test]
    fn test_dovecote_error_from_messaging() {
        let err: DovecoteError = MessagingError::ListenerFailed {
            listener: "audit".to_string(),
            reason: "boom".to_string(),
        }
        .into();
        let msg = format!("{}", err);
        assert!(msg.contains("audit"));
        assert!(msg.contains("boom"));
    }
}
