//! In-memory queue store.
//!
//! Envelopes live in a HashMap behind an RwLock. Clones share the same map,
//! so several [`crate::QueueStore`] users in one process (one per simulated
//! node) see the same queue. Claims re-check eligibility under the write
//! lock, which makes them atomic with respect to every other clone.

use crate::queue::{fifo_key, ClaimLimit, IndexSpec, QueueStore};
use async_trait::async_trait;
use dovecote_core::{
    DovecoteResult, Envelope, EnvelopeId, MsgId, NodeId, StoreError, Timestamp,
};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

/// In-memory queue store for tests and single-process deployments.
#[derive(Debug, Clone, Default)]
pub struct InMemoryQueueStore {
    envelopes: Arc<RwLock<HashMap<EnvelopeId, Envelope>>>,
    indexes: Arc<RwLock<Vec<IndexSpec>>>,
}

impl InMemoryQueueStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Indexes requested so far.
    pub fn indexes(&self) -> DovecoteResult<Vec<IndexSpec>> {
        let indexes = self
            .indexes
            .read()
            .map_err(|_| StoreError::LockPoisoned)?;
        Ok(indexes.clone())
    }

    /// Remove every envelope.
    pub fn clear(&self) -> DovecoteResult<()> {
        self.envelopes
            .write()
            .map_err(|_| StoreError::LockPoisoned)?
            .clear();
        Ok(())
    }

    fn sorted(mut envelopes: Vec<Envelope>) -> Vec<Envelope> {
        envelopes.sort_by_key(fifo_key);
        envelopes
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn ensure_indexes(&self, indexes: &[IndexSpec]) -> DovecoteResult<()> {
        let mut known = self
            .indexes
            .write()
            .map_err(|_| StoreError::LockPoisoned)?;
        for index in indexes {
            if !known.iter().any(|k| k.name == index.name) {
                known.push(*index);
            }
        }
        Ok(())
    }

    async fn insert_many(&self, envelopes: Vec<Envelope>) -> DovecoteResult<Vec<EnvelopeId>> {
        let mut map = self
            .envelopes
            .write()
            .map_err(|_| StoreError::LockPoisoned)?;

        let mut prepared = Vec::with_capacity(envelopes.len());
        for mut envelope in envelopes {
            if envelope.id.is_nil() {
                envelope.id = Uuid::now_v7();
            }
            let duplicate = map.contains_key(&envelope.id)
                || prepared.iter().any(|e: &Envelope| e.id == envelope.id);
            if duplicate {
                return Err(StoreError::InsertFailed {
                    reason: format!("duplicate envelope id {}", envelope.id),
                }
                .into());
            }
            prepared.push(envelope);
        }

        let ids = prepared.iter().map(|e| e.id).collect();
        for envelope in prepared {
            map.insert(envelope.id, envelope);
        }
        Ok(ids)
    }

    async fn delete_expired(&self, now: Timestamp) -> DovecoteResult<u64> {
        let mut map = self
            .envelopes
            .write()
            .map_err(|_| StoreError::LockPoisoned)?;
        let before = map.len();
        map.retain(|_, envelope| !envelope.is_expired(now));
        Ok((before - map.len()) as u64)
    }

    async fn claim(&self, node: &NodeId, now: Timestamp, limit: ClaimLimit) -> DovecoteResult<u64> {
        let mut map = self
            .envelopes
            .write()
            .map_err(|_| StoreError::LockPoisoned)?;

        let mut eligible: Vec<_> = map
            .values()
            .filter(|e| e.is_claimable_by(node))
            .map(|e| (fifo_key(e), e.id))
            .collect();
        eligible.sort();
        if limit == ClaimLimit::One {
            eligible.truncate(1);
        }

        let mut claimed = 0;
        for (_, id) in eligible {
            if let Some(envelope) = map.get_mut(&id) {
                // Conditional write: the precondition must still hold.
                if envelope.is_claimable_by(node) {
                    envelope.lock_for(node, now);
                    claimed += 1;
                }
            }
        }
        Ok(claimed)
    }

    async fn fetch_for(&self, node: &NodeId) -> DovecoteResult<Vec<Envelope>> {
        let map = self
            .envelopes
            .read()
            .map_err(|_| StoreError::LockPoisoned)?;
        let fetched = map
            .values()
            .filter(|e| e.is_fetchable_by(node))
            .cloned()
            .collect();
        Ok(Self::sorted(fetched))
    }

    async fn get(&self, id: EnvelopeId) -> DovecoteResult<Option<Envelope>> {
        let map = self
            .envelopes
            .read()
            .map_err(|_| StoreError::LockPoisoned)?;
        Ok(map.get(&id).cloned())
    }

    async fn delete(&self, id: EnvelopeId) -> DovecoteResult<bool> {
        let mut map = self
            .envelopes
            .write()
            .map_err(|_| StoreError::LockPoisoned)?;
        Ok(map.remove(&id).is_some())
    }

    async fn add_processed_by(&self, msg_id: MsgId, node: &NodeId) -> DovecoteResult<u64> {
        let mut map = self
            .envelopes
            .write()
            .map_err(|_| StoreError::LockPoisoned)?;
        let mut changed = 0;
        for envelope in map.values_mut().filter(|e| e.msg_id == msg_id) {
            if !envelope.is_processed_by(node) {
                envelope.mark_processed_by(node);
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn release(&self, id: EnvelopeId, node: &NodeId) -> DovecoteResult<bool> {
        let mut map = self
            .envelopes
            .write()
            .map_err(|_| StoreError::LockPoisoned)?;
        match map.get_mut(&id) {
            Some(envelope) if envelope.is_locked_by(node) => {
                envelope.release_by(node);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn count(&self) -> DovecoteResult<usize> {
        let map = self
            .envelopes
            .read()
            .map_err(|_| StoreError::LockPoisoned)?;
        Ok(map.len())
    }

    async fn list(&self) -> DovecoteResult<Vec<Envelope>> {
        let map = self
            .envelopes
            .read()
            .map_err(|_| StoreError::LockPoisoned)?;
        Ok(Self::sorted(map.values().cloned().collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use dovecote_core::{LockHolder, DEFAULT_TTL_MS};

    fn node(id: &str) -> NodeId {
        NodeId::new(id).expect("valid node id")
    }

    fn sent_by(sender: &NodeId, mut envelope: Envelope) -> Envelope {
        envelope.prepare_for_send(sender);
        envelope
    }

    #[tokio::test]
    async fn test_insert_assigns_ids() {
        let store = InMemoryQueueStore::new();
        let ids = store
            .insert_many(vec![
                Envelope::exclusive("a", "", ""),
                Envelope::exclusive("b", "", ""),
            ])
            .await
            .expect("insert should succeed");

        assert_eq!(ids.len(), 2);
        assert!(ids.iter().all(|id| !id.is_nil()));
        assert_eq!(store.count().await.expect("count"), 2);
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected_atomically() {
        let store = InMemoryQueueStore::new();
        let id = store
            .insert(Envelope::exclusive("a", "", ""))
            .await
            .expect("insert should succeed");

        let mut dup = Envelope::exclusive("b", "", "");
        dup.id = id;
        let result = store
            .insert_many(vec![Envelope::exclusive("c", "", ""), dup])
            .await;

        assert!(result.is_err());
        assert_eq!(store.count().await.expect("count"), 1);
    }

    #[tokio::test]
    async fn test_claim_one_takes_oldest() {
        let store = InMemoryQueueStore::new();
        let a = node("a");
        let b = node("b");
        let now = Utc::now();

        let newer = sent_by(&a, Envelope::exclusive("new", "", "").with_timestamp(now));
        let older = sent_by(
            &a,
            Envelope::exclusive("old", "", "").with_timestamp(now - Duration::seconds(1)),
        );
        store.insert_many(vec![newer, older]).await.expect("insert");

        assert_eq!(store.claim(&b, now, ClaimLimit::One).await.expect("claim"), 1);
        let fetched = store.fetch_for(&b).await.expect("fetch");
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].name, "old");
    }

    #[tokio::test]
    async fn test_claim_is_exclusive_between_nodes() {
        let store = InMemoryQueueStore::new();
        let a = node("a");
        store
            .insert(sent_by(&a, Envelope::exclusive("job", "", "")))
            .await
            .expect("insert");

        let now = Utc::now();
        let first = store.claim(&node("b"), now, ClaimLimit::All).await.expect("claim");
        let second = store.claim(&node("c"), now, ClaimLimit::All).await.expect("claim");

        assert_eq!(first + second, 1);
        assert!(store.fetch_for(&node("c")).await.expect("fetch").is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_fetch_and_processed_by() {
        let store = InMemoryQueueStore::new();
        let a = node("a");
        let b = node("b");
        let env = sent_by(&a, Envelope::broadcast("news", "", ""));
        let msg_id = env.msg_id;
        store.insert(env).await.expect("insert");

        assert_eq!(store.claim(&b, Utc::now(), ClaimLimit::All).await.expect("claim"), 0);
        assert_eq!(store.fetch_for(&b).await.expect("fetch").len(), 1);
        assert!(store.fetch_for(&a).await.expect("fetch").is_empty());

        assert_eq!(store.add_processed_by(msg_id, &b).await.expect("ack"), 1);
        assert_eq!(store.add_processed_by(msg_id, &b).await.expect("ack"), 0);
        assert!(store.fetch_for(&b).await.expect("fetch").is_empty());

        let stored = store.list().await.expect("list");
        assert_eq!(stored[0].locked_by, Some(LockHolder::All));
        assert_eq!(stored[0].processed_by, vec![a, b]);
    }

    #[tokio::test]
    async fn test_delete_expired() {
        let store = InMemoryQueueStore::new();
        let now = Utc::now();
        let stale = Envelope::exclusive("old", "", "")
            .with_ttl(100)
            .with_timestamp(now - Duration::milliseconds(500));
        let fresh = Envelope::exclusive("new", "", "").with_ttl(DEFAULT_TTL_MS);
        store.insert_many(vec![stale, fresh]).await.expect("insert");

        assert_eq!(store.delete_expired(now).await.expect("expire"), 1);
        let left = store.list().await.expect("list");
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].name, "new");
    }

    #[tokio::test]
    async fn test_release_requires_ownership() {
        let store = InMemoryQueueStore::new();
        let a = node("a");
        let b = node("b");
        let id = store
            .insert(sent_by(&a, Envelope::exclusive("job", "", "")))
            .await
            .expect("insert");
        store.claim(&b, Utc::now(), ClaimLimit::All).await.expect("claim");

        assert!(!store.release(id, &node("c")).await.expect("release"));
        assert!(store.release(id, &b).await.expect("release"));

        let released = store.get(id).await.expect("get").expect("still stored");
        assert!(released.locked_by.is_none());
        assert!(released.is_processed_by(&b));
        assert!(!released.is_claimable_by(&b));
        assert!(released.is_claimable_by(&node("c")));
    }

    #[tokio::test]
    async fn test_ensure_indexes_is_idempotent() {
        let store = InMemoryQueueStore::new();
        store
            .ensure_indexes(crate::REQUIRED_INDEXES)
            .await
            .expect("indexes");
        store
            .ensure_indexes(crate::REQUIRED_INDEXES)
            .await
            .expect("indexes");
        assert_eq!(store.indexes().expect("indexes").len(), 3);
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let store = InMemoryQueueStore::new();
        let other = store.clone();
        let id = store.insert(Envelope::exclusive("x", "", "")).await.expect("insert");
        assert!(other.delete(id).await.expect("delete"));
        assert_eq!(store.count().await.expect("count"), 0);
    }
}
