//! Node-local cache access.

use async_trait::async_trait;
use dovecote_core::{DovecoteResult, EntityType};

/// The node-local entity cache. Only invalidation is exposed; storage and
/// eviction policy belong to the cache itself.
#[async_trait]
pub trait LocalCache: Send + Sync {
    /// Drop every cached entry of every type.
    async fn clear_all(&self) -> DovecoteResult<()>;

    /// Drop every cached entry of one type.
    async fn clear_type(&self, entity_type: &EntityType) -> DovecoteResult<()>;

    /// Whether a record is currently cached.
    async fn contains(&self, entity_type: &EntityType, id: &str) -> DovecoteResult<bool>;

    /// Evict one record. Returns whether it was cached.
    async fn remove_entry(&self, entity_type: &EntityType, id: &str) -> DovecoteResult<bool>;

    /// Replace one cached record with a fresh read from the store.
    async fn refresh_entry(&self, entity_type: &EntityType, id: &str) -> DovecoteResult<()>;
}
