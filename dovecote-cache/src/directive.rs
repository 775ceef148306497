//! Cache directives and their envelope encoding.
//!
//! | Directive | `name` | `value` | `additional` |
//! |-----------|--------|---------|--------------|
//! | `TypeClear` | `cache_sync_type` | type name | empty |
//! | `RecordEvent` | `cache_sync_record` | type name | record ids |
//! | `AllClear` | `cache_sync_type` | `ALL` | empty |
//! | `ConfigReload` | `cache_sync_type` | config type name | empty |
//!
//! The reason travels in `msg`. Directives are always broadcast.

use dovecote_core::{
    CacheSyncError, DeliveryMode, DurationMs, EntityType, Envelope, RecordId, DEFAULT_TTL_MS,
};

/// Message name of type-wide directives.
pub const CACHE_SYNC_TYPE: &str = "cache_sync_type";

/// Message name of per-record directives.
pub const CACHE_SYNC_RECORD: &str = "cache_sync_record";

/// Value that turns a type directive into a clear-everything directive.
pub const ALL_TYPES: &str = "ALL";

/// Message name of the reply a node sends after handling a directive.
pub const CLEAR_CACHE_ANSWER: &str = "clear_cache_answer";

/// Names the synchronizer listens on.
pub const DIRECTIVE_NAMES: [&str; 2] = [CACHE_SYNC_TYPE, CACHE_SYNC_RECORD];

/// Default directive TTL; long enough for every node to see it.
pub const DEFAULT_DIRECTIVE_TTL_MS: DurationMs = DEFAULT_TTL_MS;

/// A cache-invalidation instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheDirective {
    /// Drop every cached entry of one type.
    TypeClear {
        entity_type: EntityType,
        reason: String,
    },
    /// Refresh or evict specific records of one type.
    RecordEvent {
        entity_type: EntityType,
        entity_ids: Vec<RecordId>,
        reason: String,
    },
    /// Drop every local cache.
    AllClear { reason: String },
    /// Re-read configuration.
    ConfigReload { reason: String },
}

impl CacheDirective {
    /// Type the directive is scoped to, for hook dispatch.
    pub fn entity_type(&self) -> Option<EntityType> {
        match self {
            CacheDirective::TypeClear { entity_type, .. }
            | CacheDirective::RecordEvent { entity_type, .. } => Some(entity_type.clone()),
            CacheDirective::ConfigReload { .. } => Some(EntityType::config()),
            CacheDirective::AllClear { .. } => None,
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            CacheDirective::TypeClear { reason, .. }
            | CacheDirective::RecordEvent { reason, .. }
            | CacheDirective::AllClear { reason }
            | CacheDirective::ConfigReload { reason } => reason,
        }
    }

    /// Encode as a broadcast envelope.
    pub fn to_envelope(&self, ttl: DurationMs) -> Envelope {
        let (name, value, additional) = match self {
            CacheDirective::TypeClear { entity_type, .. } => {
                (CACHE_SYNC_TYPE, entity_type.to_string(), Vec::new())
            }
            CacheDirective::RecordEvent {
                entity_type,
                entity_ids,
                ..
            } => (CACHE_SYNC_RECORD, entity_type.to_string(), entity_ids.clone()),
            CacheDirective::AllClear { .. } => (CACHE_SYNC_TYPE, ALL_TYPES.to_string(), Vec::new()),
            CacheDirective::ConfigReload { .. } => {
                (CACHE_SYNC_TYPE, EntityType::CONFIG.to_string(), Vec::new())
            }
        };

        let mut envelope = Envelope::new(name, DeliveryMode::Broadcast, self.reason(), value, ttl);
        envelope.additional = additional;
        envelope
    }

    /// Decode an envelope received on one of [`DIRECTIVE_NAMES`].
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, CacheSyncError> {
        let reason = envelope.msg.clone();
        match envelope.name.as_str() {
            CACHE_SYNC_TYPE if envelope.value == ALL_TYPES => Ok(CacheDirective::AllClear { reason }),
            CACHE_SYNC_TYPE if envelope.value == EntityType::CONFIG => {
                Ok(CacheDirective::ConfigReload { reason })
            }
            CACHE_SYNC_TYPE => Ok(CacheDirective::TypeClear {
                entity_type: EntityType::new(envelope.value.clone()),
                reason,
            }),
            CACHE_SYNC_RECORD => Ok(CacheDirective::RecordEvent {
                entity_type: EntityType::new(envelope.value.clone()),
                entity_ids: envelope.additional.clone(),
                reason,
            }),
            other => Err(CacheSyncError::UnknownDirective {
                name: other.to_string(),
                value: envelope.value.clone(),
            }),
        }
    }
}
