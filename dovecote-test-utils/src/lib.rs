//! Dovecote Test Utilities
//!
//! Shared test infrastructure for the dovecote workspace:
//! - Fakes for the mapping layer, local cache and queue store
//! - Recording, failing and panicking message listeners
//! - Cache sync hooks that veto or record
//! - Proptest generators and fixtures

pub use dovecote_cache::{
    CachePolicy, CacheStrategy, CacheSyncListener, CacheSynchronizer, EntityMapping, HookOutcome,
    LocalCache, Record, SyncConfig,
};
pub use dovecote_core::{
    DeliveryMode, DovecoteError, DovecoteResult, EntityType, Envelope, MessagingConfig,
    MessagingError, NodeId, StoreError, Timestamp,
};
pub use dovecote_messaging::{MessageListener, Messaging};
pub use dovecote_storage::{InMemoryQueueStore, QueueStore};

use async_trait::async_trait;
use dovecote_core::{EnvelopeId, MsgId, RecordId};
use dovecote_messaging::Outbox;
use dovecote_storage::{ClaimLimit, IndexSpec};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

// ============================================================================
// MAPPING LAYER FAKES
// ============================================================================

/// A record with an explicit type and optional identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestRecord {
    pub entity_type: EntityType,
    pub id: Option<RecordId>,
}

impl TestRecord {
    pub fn new(entity_type: &str, id: &str) -> Self {
        Self {
            entity_type: EntityType::new(entity_type),
            id: Some(id.to_string()),
        }
    }

    /// A record that has not been assigned an identity yet.
    pub fn unsaved(entity_type: &str) -> Self {
        Self {
            entity_type: EntityType::new(entity_type),
            id: None,
        }
    }
}

impl Record for TestRecord {
    fn entity_type(&self) -> EntityType {
        self.entity_type.clone()
    }

    fn identity(&self) -> Option<RecordId> {
        self.id.clone()
    }
}

/// Mapping with a fixed set of known types and policies.
#[derive(Debug, Default)]
pub struct StaticMapping {
    known: HashSet<EntityType>,
    policies: HashMap<EntityType, CachePolicy>,
    reloads: AtomicUsize,
    fail_reload: AtomicBool,
}

impl StaticMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a known type with a policy.
    pub fn with_policy(mut self, entity_type: &str, policy: CachePolicy) -> Self {
        let entity_type = EntityType::new(entity_type);
        self.known.insert(entity_type.clone());
        self.policies.insert(entity_type, policy);
        self
    }

    /// Register a known type that is not cached.
    pub fn with_uncached(mut self, entity_type: &str) -> Self {
        self.known.insert(EntityType::new(entity_type));
        self
    }

    pub fn reload_count(&self) -> usize {
        self.reloads.load(Ordering::SeqCst)
    }

    pub fn set_fail_reload(&self, fail: bool) {
        self.fail_reload.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl EntityMapping for StaticMapping {
    fn resolve_type(&self, name: &str) -> Option<EntityType> {
        let entity_type = EntityType::new(name);
        self.known.contains(&entity_type).then_some(entity_type)
    }

    fn cache_policy(&self, entity_type: &EntityType) -> Option<CachePolicy> {
        self.policies.get(entity_type).copied()
    }

    async fn reload_config(&self) -> DovecoteResult<()> {
        if self.fail_reload.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable {
                reason: "config store offline".to_string(),
            }
            .into());
        }
        self.reloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Local cache holding a version counter per cached record.
///
/// `refresh_entry` bumps the version, so tests can tell a re-read from an
/// untouched entry.
#[derive(Debug, Default)]
pub struct InMemoryLocalCache {
    entries: RwLock<HashMap<EntityType, BTreeMap<String, u64>>>,
    clear_all_calls: AtomicUsize,
}

impl InMemoryLocalCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache `ids` under `entity_type` at version 1.
    pub fn seed(&self, entity_type: &str, ids: &[&str]) {
        let mut entries = self.entries.write().expect("local cache lock");
        let type_cache = entries.entry(EntityType::new(entity_type)).or_default();
        for id in ids {
            type_cache.insert(id.to_string(), 1);
        }
    }

    /// Cached ids of a type, sorted.
    pub fn ids(&self, entity_type: &str) -> Vec<String> {
        self.entries
            .read()
            .expect("local cache lock")
            .get(&EntityType::new(entity_type))
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn version(&self, entity_type: &str, id: &str) -> Option<u64> {
        self.entries
            .read()
            .expect("local cache lock")
            .get(&EntityType::new(entity_type))
            .and_then(|c| c.get(id).copied())
    }

    pub fn clear_all_calls(&self) -> usize {
        self.clear_all_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LocalCache for InMemoryLocalCache {
    async fn clear_all(&self) -> DovecoteResult<()> {
        self.clear_all_calls.fetch_add(1, Ordering::SeqCst);
        self.entries.write().expect("local cache lock").clear();
        Ok(())
    }

    async fn clear_type(&self, entity_type: &EntityType) -> DovecoteResult<()> {
        self.entries
            .write()
            .expect("local cache lock")
            .remove(entity_type);
        Ok(())
    }

    async fn contains(&self, entity_type: &EntityType, id: &str) -> DovecoteResult<bool> {
        Ok(self
            .entries
            .read()
            .expect("local cache lock")
            .get(entity_type)
            .is_some_and(|c| c.contains_key(id)))
    }

    async fn remove_entry(&self, entity_type: &EntityType, id: &str) -> DovecoteResult<bool> {
        Ok(self
            .entries
            .write()
            .expect("local cache lock")
            .get_mut(entity_type)
            .and_then(|c| c.remove(id))
            .is_some())
    }

    async fn refresh_entry(&self, entity_type: &EntityType, id: &str) -> DovecoteResult<()> {
        if let Some(version) = self
            .entries
            .write()
            .expect("local cache lock")
            .get_mut(entity_type)
            .and_then(|c| c.get_mut(id))
        {
            *version += 1;
        }
        Ok(())
    }
}

// ============================================================================
// QUEUE STORE FAKES
// ============================================================================

/// Queue store wrapper that fails a configurable number of upcoming calls.
#[derive(Debug, Clone, Default)]
pub struct FlakyQueueStore<S: QueueStore = InMemoryQueueStore> {
    inner: S,
    failures_left: Arc<AtomicU64>,
}

impl<S: QueueStore> FlakyQueueStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            failures_left: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Make the next `n` store calls fail.
    pub fn fail_next(&self, n: u64) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn check(&self) -> DovecoteResult<()> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::Unavailable {
                reason: "injected failure".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl<S: QueueStore> QueueStore for FlakyQueueStore<S> {
    async fn ensure_indexes(&self, indexes: &[IndexSpec]) -> DovecoteResult<()> {
        self.check()?;
        self.inner.ensure_indexes(indexes).await
    }

    async fn insert_many(&self, envelopes: Vec<Envelope>) -> DovecoteResult<Vec<EnvelopeId>> {
        self.check()?;
        self.inner.insert_many(envelopes).await
    }

    async fn delete_expired(&self, now: Timestamp) -> DovecoteResult<u64> {
        self.check()?;
        self.inner.delete_expired(now).await
    }

    async fn claim(&self, node: &NodeId, now: Timestamp, limit: ClaimLimit) -> DovecoteResult<u64> {
        self.check()?;
        self.inner.claim(node, now, limit).await
    }

    async fn fetch_for(&self, node: &NodeId) -> DovecoteResult<Vec<Envelope>> {
        self.check()?;
        self.inner.fetch_for(node).await
    }

    async fn get(&self, id: EnvelopeId) -> DovecoteResult<Option<Envelope>> {
        self.check()?;
        self.inner.get(id).await
    }

    async fn delete(&self, id: EnvelopeId) -> DovecoteResult<bool> {
        self.check()?;
        self.inner.delete(id).await
    }

    async fn add_processed_by(&self, msg_id: MsgId, node: &NodeId) -> DovecoteResult<u64> {
        self.check()?;
        self.inner.add_processed_by(msg_id, node).await
    }

    async fn release(&self, id: EnvelopeId, node: &NodeId) -> DovecoteResult<bool> {
        self.check()?;
        self.inner.release(id, node).await
    }

    async fn count(&self) -> DovecoteResult<usize> {
        self.inner.count().await
    }

    async fn list(&self) -> DovecoteResult<Vec<Envelope>> {
        self.inner.list().await
    }
}

// ============================================================================
// MESSAGE LISTENERS
// ============================================================================

/// Listener that records every envelope and optionally replies.
#[derive(Debug, Default)]
pub struct RecordingListener {
    label: String,
    received: Mutex<Vec<Envelope>>,
    reply: Option<(String, String)>,
    bound: Mutex<Option<NodeId>>,
}

impl RecordingListener {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            ..Self::default()
        }
    }

    /// Reply to every envelope with `name`/`msg`.
    pub fn replying(label: &str, name: &str, msg: &str) -> Self {
        Self {
            reply: Some((name.to_string(), msg.to_string())),
            ..Self::new(label)
        }
    }

    pub fn received(&self) -> Vec<Envelope> {
        self.received.lock().expect("recording lock").clone()
    }

    pub fn count(&self) -> usize {
        self.received.lock().expect("recording lock").len()
    }

    /// Node whose outbox the listener currently holds.
    pub fn bound_to(&self) -> Option<NodeId> {
        self.bound.lock().expect("recording lock").clone()
    }
}

#[async_trait]
impl MessageListener for RecordingListener {
    fn name(&self) -> &str {
        &self.label
    }

    async fn on_message(&self, envelope: &Envelope) -> DovecoteResult<Option<Envelope>> {
        self.received
            .lock()
            .expect("recording lock")
            .push(envelope.clone());
        Ok(self
            .reply
            .as_ref()
            .map(|(name, msg)| Envelope::exclusive(name.clone(), msg.clone(), "")))
    }

    fn bind(&self, outbox: Option<Outbox>) {
        *self.bound.lock().expect("recording lock") = outbox.map(|o| o.node_id().clone());
    }
}

/// Listener that always returns an error.
#[derive(Debug, Default)]
pub struct FailingListener {
    pub calls: AtomicUsize,
}

#[async_trait]
impl MessageListener for FailingListener {
    fn name(&self) -> &str {
        "failing"
    }

    async fn on_message(&self, _envelope: &Envelope) -> DovecoteResult<Option<Envelope>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(MessagingError::ListenerFailed {
            listener: "failing".to_string(),
            reason: "refused".to_string(),
        }
        .into())
    }
}

/// Listener that panics on every envelope.
#[derive(Debug, Default)]
pub struct PanickingListener;

#[async_trait]
impl MessageListener for PanickingListener {
    fn name(&self) -> &str {
        "panicking"
    }

    async fn on_message(&self, envelope: &Envelope) -> DovecoteResult<Option<Envelope>> {
        panic!("cannot handle {}", envelope.name);
    }
}

// ============================================================================
// CACHE SYNC HOOKS
// ============================================================================

/// Hook that vetoes sends and/or clears.
#[derive(Debug, Clone)]
pub struct VetoHook {
    pub reason: String,
    pub on_send: bool,
    pub on_clear: bool,
}

impl VetoHook {
    pub fn sends(reason: &str) -> Self {
        Self {
            reason: reason.to_string(),
            on_send: true,
            on_clear: false,
        }
    }

    pub fn clears(reason: &str) -> Self {
        Self {
            reason: reason.to_string(),
            on_send: false,
            on_clear: true,
        }
    }
}

impl CacheSyncListener for VetoHook {
    fn pre_send(&self, _entity_type: Option<&EntityType>, _envelope: &Envelope) -> HookOutcome {
        if self.on_send {
            HookOutcome::veto(self.reason.clone())
        } else {
            HookOutcome::Proceed
        }
    }

    fn pre_clear(&self, _entity_type: Option<&EntityType>, _envelope: &Envelope) -> HookOutcome {
        if self.on_clear {
            HookOutcome::veto(self.reason.clone())
        } else {
            HookOutcome::Proceed
        }
    }
}

/// Hook that records every call as `"<hook>:<type>"`.
#[derive(Debug, Default)]
pub struct RecordingHook {
    calls: Mutex<Vec<String>>,
}

impl RecordingHook {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("hook lock").clone()
    }

    fn record(&self, hook: &str, entity_type: Option<&EntityType>) {
        let scope = entity_type.map_or_else(|| "*".to_string(), |t| t.to_string());
        self.calls
            .lock()
            .expect("hook lock")
            .push(format!("{}:{}", hook, scope));
    }
}

impl CacheSyncListener for RecordingHook {
    fn pre_send(&self, entity_type: Option<&EntityType>, _envelope: &Envelope) -> HookOutcome {
        self.record("pre_send", entity_type);
        HookOutcome::Proceed
    }

    fn post_send(&self, entity_type: Option<&EntityType>, _envelope: &Envelope) {
        self.record("post_send", entity_type);
    }

    fn pre_clear(&self, entity_type: Option<&EntityType>, _envelope: &Envelope) -> HookOutcome {
        self.record("pre_clear", entity_type);
        HookOutcome::Proceed
    }

    fn post_clear(&self, entity_type: Option<&EntityType>, _envelope: &Envelope) {
        self.record("post_clear", entity_type);
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for dovecote types.

    use super::*;
    use chrono::{Duration, Utc};
    use proptest::prelude::*;

    /// Generate a node id from a small pool so collisions are likely.
    pub fn arb_node_id() -> impl Strategy<Value = NodeId> {
        "[a-e]".prop_map(|s| NodeId::new(format!("node-{}", s)).expect("valid node id"))
    }

    pub fn arb_entity_type() -> impl Strategy<Value = EntityType> {
        prop_oneof![
            Just(EntityType::new("Invoice")),
            Just(EntityType::new("Order")),
            Just(EntityType::new("Customer")),
        ]
    }

    pub fn arb_delivery_mode() -> impl Strategy<Value = DeliveryMode> {
        prop_oneof![Just(DeliveryMode::Exclusive), Just(DeliveryMode::Broadcast)]
    }

    pub fn arb_strategy() -> impl Strategy<Value = CacheStrategy> {
        prop_oneof![
            Just(CacheStrategy::None),
            Just(CacheStrategy::UpdateEntry),
            Just(CacheStrategy::RemoveEntryFromTypeCache),
            Just(CacheStrategy::ClearTypeCache),
        ]
    }

    pub fn arb_policy() -> impl Strategy<Value = CachePolicy> {
        (arb_strategy(), any::<bool>(), any::<bool>()).prop_map(
            |(strategy, read_cache_enabled, clear_on_write)| CachePolicy {
                strategy,
                read_cache_enabled,
                clear_on_write,
            },
        )
    }

    /// Generate an envelope queued by `sender`, up to a minute old.
    pub fn arb_sent_envelope() -> impl Strategy<Value = Envelope> {
        (
            arb_node_id(),
            proptest::option::of(arb_node_id()),
            arb_delivery_mode(),
            "[a-z]{1,8}",
            0i64..60_000,
        )
            .prop_map(|(sender, to, mode, name, age_ms)| {
                let mut envelope = Envelope::new(name, mode, "", "", dovecote_core::DEFAULT_TTL_MS)
                    .with_timestamp(Utc::now() - Duration::milliseconds(age_ms));
                envelope.to = to;
                envelope.prepare_for_send(&sender);
                envelope
            })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built nodes and synchronizers.

    use super::*;

    pub fn node_id(id: &str) -> NodeId {
        NodeId::new(id).expect("valid node id")
    }

    /// Fast-cycling config for node `id`.
    pub fn fast_config(id: &str) -> MessagingConfig {
        MessagingConfig::for_testing().with_node_id(node_id(id))
    }

    /// A messaging node on `store`, not started.
    pub fn messaging_node<S: QueueStore>(store: &Arc<S>, id: &str) -> Arc<Messaging<S>> {
        Arc::new(Messaging::new(store.clone(), fast_config(id)).expect("valid messaging config"))
    }

    /// Synchronizer over a static mapping and in-memory cache.
    pub fn synchronizer(
        mapping: StaticMapping,
    ) -> (
        Arc<CacheSynchronizer<StaticMapping, InMemoryLocalCache>>,
        Arc<StaticMapping>,
        Arc<InMemoryLocalCache>,
    ) {
        let mapping = Arc::new(mapping);
        let cache = Arc::new(InMemoryLocalCache::new());
        let sync = CacheSynchronizer::new(mapping.clone(), cache.clone(), SyncConfig::default())
            .expect("valid sync config");
        (Arc::new(sync), mapping, cache)
    }

    /// Run one cycle on each node in order, flushing each node first.
    pub async fn step<S: QueueStore>(nodes: &[&Arc<Messaging<S>>]) {
        for node in nodes {
            node.flush().await.expect("flush");
        }
        for node in nodes {
            node.run_cycle().await.expect("cycle");
        }
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertion helpers for dovecote results.

    use super::*;

    /// Assert that a DovecoteResult is Ok.
    #[track_caller]
    pub fn assert_ok<T: std::fmt::Debug>(result: &DovecoteResult<T>) {
        assert!(result.is_ok(), "Expected Ok, got Err: {:?}", result);
    }

    /// Assert that a DovecoteResult is a Storage error.
    #[track_caller]
    pub fn assert_storage_error<T: std::fmt::Debug>(result: &DovecoteResult<T>) {
        match result {
            Err(DovecoteError::Storage(_)) => {}
            other => panic!("Expected Storage error, got: {:?}", other),
        }
    }

    /// Assert that every envelope in `envelopes` lists `node` exactly once.
    #[track_caller]
    pub fn assert_processed_once(envelopes: &[Envelope], node: &NodeId) {
        for envelope in envelopes {
            let hits = envelope.processed_by.iter().filter(|n| *n == node).count();
            assert_eq!(
                hits, 1,
                "envelope {} lists {} {} times in processed_by",
                envelope.id, node, hits
            );
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
