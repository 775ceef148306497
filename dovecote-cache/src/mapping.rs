//! Collaborators supplied by the object-mapping layer.

use crate::strategy::CachePolicy;
use async_trait::async_trait;
use dovecote_core::{DovecoteResult, EntityType, RecordId};

/// A stored record as seen by the synchronizer.
pub trait Record: Send + Sync {
    fn entity_type(&self) -> EntityType;

    /// Store identity of the record, if it has been assigned one.
    fn identity(&self) -> Option<RecordId>;
}

/// Type metadata and configuration access of the mapping layer.
#[async_trait]
pub trait EntityMapping: Send + Sync {
    /// Resolve a type name received from another node.
    /// `None` if this node does not know the type.
    fn resolve_type(&self, name: &str) -> Option<EntityType>;

    /// Cache settings of a type; `None` for uncached types.
    fn cache_policy(&self, entity_type: &EntityType) -> Option<CachePolicy>;

    /// Re-read process-wide configuration.
    async fn reload_config(&self) -> DovecoteResult<()>;
}

/// Storage lifecycle hooks the mapping layer fires after writes.
///
/// Implementations must not fail the caller: the write already happened.
pub trait LifecycleListener: Send + Sync {
    fn post_store(&self, record: &dyn Record, is_new: bool);

    fn post_remove(&self, record: &dyn Record);

    /// Bulk removal by query.
    fn post_remove_type(&self, entity_type: &EntityType);

    /// In-place update of `kind` (set, inc, push, ...).
    fn post_update(&self, entity_type: &EntityType, kind: &str);

    fn post_drop(&self, entity_type: &EntityType);
}
