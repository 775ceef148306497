//! Cache synchronization between two nodes sharing one queue store.

use dovecote_cache::{
    CachePolicy, CacheStrategy, CacheSynchronizer, LifecycleListener, SendOutcome, CACHE_SYNC_RECORD,
    CACHE_SYNC_TYPE, CLEAR_CACHE_ANSWER,
};
use dovecote_core::{EntityType, Envelope};
use dovecote_messaging::Messaging;
use dovecote_storage::{InMemoryQueueStore, QueueStore};
use dovecote_test_utils::fixtures::{messaging_node, step, synchronizer};
use dovecote_test_utils::{
    InMemoryLocalCache, RecordingHook, RecordingListener, StaticMapping, TestRecord, VetoHook,
};
use std::sync::Arc;

type NodeSync = CacheSynchronizer<StaticMapping, InMemoryLocalCache>;

/// Two attached nodes with identical mappings.
struct Cluster {
    store: Arc<InMemoryQueueStore>,
    a: Arc<Messaging<InMemoryQueueStore>>,
    b: Arc<Messaging<InMemoryQueueStore>>,
    sync_a: Arc<NodeSync>,
    sync_b: Arc<NodeSync>,
    mapping_b: Arc<StaticMapping>,
    cache_b: Arc<InMemoryLocalCache>,
    answers_a: Arc<RecordingListener>,
}

fn mapping() -> StaticMapping {
    StaticMapping::new()
        .with_policy("Invoice", CachePolicy::cached(CacheStrategy::ClearTypeCache))
        .with_policy("Order", CachePolicy::cached(CacheStrategy::RemoveEntryFromTypeCache))
        .with_policy("Customer", CachePolicy::cached(CacheStrategy::UpdateEntry))
        .with_policy(
            "Audit",
            CachePolicy::cached(CacheStrategy::ClearTypeCache).with_clear_on_write(false),
        )
        .with_uncached("Log")
}

fn cluster_with(mapping_a: StaticMapping, mapping_b: StaticMapping) -> Cluster {
    let store = Arc::new(InMemoryQueueStore::new());
    let a = messaging_node(&store, "node-a");
    let b = messaging_node(&store, "node-b");
    let (sync_a, _, _) = synchronizer(mapping_a);
    let (sync_b, mapping_b, cache_b) = synchronizer(mapping_b);
    sync_a.attach(&a);
    sync_b.attach(&b);

    let answers_a = Arc::new(RecordingListener::new("answers"));
    a.register_for(CLEAR_CACHE_ANSWER, answers_a.clone());

    Cluster {
        store,
        a,
        b,
        sync_a,
        sync_b,
        mapping_b,
        cache_b,
        answers_a,
    }
}

fn cluster() -> Cluster {
    cluster_with(mapping(), mapping())
}

impl Cluster {
    /// Deliver everything A queued to B, then B's answers back to A.
    async fn exchange(&self) {
        step(&[&self.a, &self.b]).await;
        step(&[&self.b, &self.a]).await;
    }

    fn answer_texts(&self) -> Vec<String> {
        self.answers_a.received().into_iter().map(|e| e.msg).collect()
    }
}

// ============================================================================
// TYPE CLEAR
// ============================================================================

#[tokio::test]
async fn test_drop_clears_type_on_other_node() {
    let cluster = cluster();
    cluster.cache_b.seed("Invoice", &["1", "2"]);
    cluster.cache_b.seed("Order", &["7"]);

    cluster.sync_a.post_drop(&EntityType::new("Invoice"));
    assert_eq!(cluster.a.pending(), 1);
    cluster.exchange().await;

    assert!(cluster.cache_b.ids("Invoice").is_empty());
    assert_eq!(cluster.cache_b.ids("Order"), vec!["7"]);
    assert_eq!(cluster.answer_texts(), vec!["cache cleared for type: Invoice"]);

    let answer = &cluster.answers_a.received()[0];
    assert_eq!(answer.name, CLEAR_CACHE_ANSWER);
    assert_eq!(answer.sender, Some(cluster.b.node_id().clone()));
    assert_eq!(cluster.sync_b.metrics().snapshot().clears_applied, 1);
}

#[tokio::test]
async fn test_sender_does_not_clear_own_cache() {
    let store = Arc::new(InMemoryQueueStore::new());
    let a = messaging_node(&store, "node-a");
    let (sync_a, _, cache_a) = synchronizer(mapping());
    sync_a.attach(&a);
    cache_a.seed("Invoice", &["1"]);

    sync_a.post_update(&EntityType::new("Invoice"), "set");
    step(&[&a]).await;
    step(&[&a]).await;

    assert_eq!(cache_a.ids("Invoice"), vec!["1"]);
    let queued = store.list().await.expect("list");
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].name, CACHE_SYNC_TYPE);
    assert_eq!(queued[0].msg, "Update: set");
}

#[tokio::test]
async fn test_store_with_clear_type_strategy_sends_type_clear() {
    let cluster = cluster();
    cluster.cache_b.seed("Invoice", &["1"]);

    let outcome = cluster
        .sync_a
        .send_for_record(&TestRecord::new("Invoice", "1"), true, "store");
    assert_eq!(outcome, SendOutcome::Queued);
    cluster.exchange().await;

    assert!(cluster.cache_b.ids("Invoice").is_empty());
}

// ============================================================================
// RECORD EVENTS
// ============================================================================

#[tokio::test]
async fn test_remove_entry_strategy_evicts_only_that_record() {
    let cluster = cluster();
    cluster.cache_b.seed("Order", &["41", "42", "43"]);

    cluster
        .sync_a
        .post_store(&TestRecord::new("Order", "42"), false);
    assert_eq!(cluster.a.pending(), 1);
    cluster.exchange().await;

    assert_eq!(cluster.cache_b.ids("Order"), vec!["41", "43"]);
    assert_eq!(cluster.answer_texts(), vec!["cache cleared for type: Order"]);
}

#[tokio::test]
async fn test_update_entry_strategy_refreshes_record() {
    let cluster = cluster();
    cluster.cache_b.seed("Customer", &["c1", "c2"]);

    cluster
        .sync_a
        .post_store(&TestRecord::new("Customer", "c1"), false);
    cluster.exchange().await;

    assert_eq!(cluster.cache_b.version("Customer", "c1"), Some(2));
    assert_eq!(cluster.cache_b.version("Customer", "c2"), Some(1));
}

#[tokio::test]
async fn test_record_event_for_uncached_record_is_noop() {
    let cluster = cluster();
    cluster.cache_b.seed("Order", &["1"]);

    cluster
        .sync_a
        .post_store(&TestRecord::new("Order", "99"), false);
    cluster.exchange().await;

    assert_eq!(cluster.cache_b.ids("Order"), vec!["1"]);
    assert_eq!(cluster.answer_texts(), vec!["cache cleared for type: Order"]);
}

#[tokio::test]
async fn test_new_records_are_not_announced_for_per_record_strategies() {
    let cluster = cluster();

    for entity_type in ["Order", "Customer"] {
        let outcome = cluster
            .sync_a
            .send_for_record(&TestRecord::new(entity_type, "1"), true, "store");
        assert_eq!(outcome, SendOutcome::Skipped);
    }
    assert_eq!(cluster.a.pending(), 0);
}

#[tokio::test]
async fn test_remove_of_single_record_clears_whole_type() {
    let cluster = cluster();
    cluster.cache_b.seed("Order", &["1", "2"]);

    cluster.sync_a.post_remove(&TestRecord::new("Order", "1"));
    cluster.exchange().await;

    assert!(cluster.cache_b.ids("Order").is_empty());
    let stored = cluster.store.list().await.expect("list");
    assert!(stored.iter().all(|e| e.name != CACHE_SYNC_RECORD));
}

// ============================================================================
// SKIPPED SENDS
// ============================================================================

#[tokio::test]
async fn test_types_without_propagation_are_skipped() {
    let cluster = cluster();

    let skipped = [
        cluster.sync_a.send_type_clear(&EntityType::new("Audit"), "drop"),
        cluster.sync_a.send_type_clear(&EntityType::new("Log"), "drop"),
        cluster.sync_a.send_type_clear(&EntityType::new("Ghost"), "drop"),
        cluster.sync_a.send_type_clear(&EntityType::envelope(), "drop"),
    ];
    assert!(skipped.iter().all(|o| *o == SendOutcome::Skipped));
    assert_eq!(cluster.a.pending(), 0);
    assert_eq!(cluster.sync_a.metrics().snapshot().skipped, 4);
}

#[tokio::test]
async fn test_detached_synchronizer_skips_sends() {
    let cluster = cluster();
    cluster.sync_a.detach(&cluster.a);
    assert!(!cluster.sync_a.is_attached());

    let outcome = cluster
        .sync_a
        .send_type_clear(&EntityType::new("Invoice"), "drop");
    assert_eq!(outcome, SendOutcome::Skipped);
    assert_eq!(cluster.a.pending(), 0);
}

// ============================================================================
// RECEIVE EDGE CASES
// ============================================================================

#[tokio::test]
async fn test_unknown_type_answers_class_not_found() {
    let mapping_b = StaticMapping::new()
        .with_policy("Order", CachePolicy::cached(CacheStrategy::ClearTypeCache));
    let cluster = cluster_with(mapping(), mapping_b);
    cluster.cache_b.seed("Order", &["1"]);

    cluster.sync_a.post_drop(&EntityType::new("Invoice"));
    cluster.exchange().await;

    assert_eq!(cluster.answer_texts(), vec!["class not found: Invoice"]);
    assert_eq!(cluster.cache_b.ids("Order"), vec!["1"]);
}

#[tokio::test]
async fn test_locally_uncached_type_answers_uncached() {
    let mapping_b = mapping().with_policy(
        "Invoice",
        CachePolicy::cached(CacheStrategy::ClearTypeCache).with_read_cache(false),
    );
    let cluster = cluster_with(mapping(), mapping_b);
    cluster.cache_b.seed("Invoice", &["1"]);

    cluster.sync_a.post_drop(&EntityType::new("Invoice"));
    cluster.exchange().await;

    assert_eq!(cluster.answer_texts(), vec!["type is uncached: Invoice"]);
    assert_eq!(cluster.cache_b.ids("Invoice"), vec!["1"]);
}

#[tokio::test]
async fn test_clear_all_empties_every_type() {
    let cluster = cluster();
    cluster.cache_b.seed("Invoice", &["1"]);
    cluster.cache_b.seed("Order", &["2"]);

    assert_eq!(cluster.sync_a.send_clear_all("maintenance"), SendOutcome::Queued);
    cluster.exchange().await;

    assert_eq!(cluster.cache_b.clear_all_calls(), 1);
    assert!(cluster.cache_b.ids("Invoice").is_empty());
    assert!(cluster.cache_b.ids("Order").is_empty());
    assert_eq!(cluster.answer_texts(), vec!["cache completely cleared"]);
}

#[tokio::test]
async fn test_config_write_triggers_reload() {
    let cluster = cluster();

    cluster
        .sync_a
        .post_store(&TestRecord::new(EntityType::CONFIG, "timeout"), true);
    cluster.exchange().await;

    assert_eq!(cluster.mapping_b.reload_count(), 1);
    assert_eq!(cluster.answer_texts(), vec!["config reread"]);
}

#[tokio::test]
async fn test_failed_config_reload_answers_error() {
    let cluster = cluster();
    cluster.mapping_b.set_fail_reload(true);

    cluster.sync_a.post_remove_type(&EntityType::config());
    cluster.exchange().await;

    let texts = cluster.answer_texts();
    assert_eq!(texts.len(), 1);
    assert!(texts[0].starts_with("Error processing message:"), "{}", texts[0]);
    assert_eq!(cluster.sync_b.metrics().snapshot().receive_errors, 1);
}

#[tokio::test]
async fn test_unknown_directive_name_answers_error() {
    let cluster = cluster();
    let text = cluster
        .sync_b
        .handle(&Envelope::broadcast("cache_sync_bogus", "", "Order"))
        .await;

    assert!(text.starts_with("Error processing message:"), "{}", text);
    assert_eq!(cluster.sync_b.metrics().snapshot().receive_errors, 1);
}

// ============================================================================
// HOOKS
// ============================================================================

#[tokio::test]
async fn test_pre_send_veto_stops_directive() {
    let cluster = cluster();
    let recording = Arc::new(RecordingHook::default());
    cluster.sync_a.hooks().add_listener(recording.clone());
    cluster.sync_a.hooks().add_listener_for_type(
        EntityType::new("Invoice"),
        Arc::new(VetoHook::sends("frozen")),
    );

    let vetoed = cluster
        .sync_a
        .send_type_clear(&EntityType::new("Invoice"), "drop");
    assert_eq!(vetoed, SendOutcome::Vetoed("frozen".to_string()));
    assert_eq!(cluster.a.pending(), 0);

    let queued = cluster
        .sync_a
        .send_type_clear(&EntityType::new("Order"), "drop");
    assert_eq!(queued, SendOutcome::Queued);
    assert_eq!(
        recording.calls(),
        vec!["pre_send:Invoice", "pre_send:Order", "post_send:Order"]
    );
    assert_eq!(cluster.sync_a.metrics().snapshot().vetoed, 1);
}

#[tokio::test]
async fn test_pre_clear_veto_keeps_cache() {
    let cluster = cluster();
    cluster.cache_b.seed("Invoice", &["1"]);
    let after_veto = Arc::new(RecordingHook::default());
    cluster
        .sync_b
        .hooks()
        .add_listener(Arc::new(VetoHook::clears("busy")));
    cluster.sync_b.hooks().add_listener(after_veto.clone());

    cluster.sync_a.post_drop(&EntityType::new("Invoice"));
    cluster.exchange().await;

    assert_eq!(cluster.cache_b.ids("Invoice"), vec!["1"]);
    assert_eq!(cluster.answer_texts(), vec!["clear vetoed: busy"]);
    assert!(after_veto.calls().is_empty());
    assert_eq!(cluster.sync_b.metrics().snapshot().clears_applied, 0);
}

#[tokio::test]
async fn test_clear_hooks_see_resolved_type() {
    let cluster = cluster();
    let recording = Arc::new(RecordingHook::default());
    cluster.sync_b.hooks().add_listener(recording.clone());

    cluster.sync_a.post_drop(&EntityType::new("Invoice"));
    cluster.exchange().await;
    cluster.sync_a.send_clear_all("reset");
    cluster.exchange().await;

    assert_eq!(
        recording.calls(),
        vec![
            "pre_clear:Invoice",
            "post_clear:Invoice",
            "pre_clear:*",
            "post_clear:*"
        ]
    );
}
