//! Property-Based Tests for the Send Path
//!
//! **Property: Policy decides propagation**
//!
//! For any entity type, cache policy and new/existing record, a stored
//! record SHALL queue exactly one directive when the policy propagates writes
//! with a strategy other than `None`, except for new records under a
//! per-record strategy. Per-record strategies SHALL use the record directive
//! and `ClearTypeCache` the type directive.

use dovecote_cache::{CachePolicy, CacheStrategy, SendOutcome, CACHE_SYNC_RECORD, CACHE_SYNC_TYPE};
use dovecote_core::EntityType;
use dovecote_storage::{InMemoryQueueStore, QueueStore};
use dovecote_test_utils::fixtures::{messaging_node, synchronizer};
use dovecote_test_utils::generators::{arb_entity_type, arb_policy};
use dovecote_test_utils::{StaticMapping, TestRecord};
use proptest::prelude::*;
use proptest::test_runner::TestCaseError;
use std::sync::Arc;

fn expected_directive(policy: &CachePolicy, is_new: bool) -> Option<&'static str> {
    if !policy.propagates_writes() {
        return None;
    }
    match policy.strategy {
        CacheStrategy::None => None,
        CacheStrategy::ClearTypeCache => Some(CACHE_SYNC_TYPE),
        _ if is_new => None,
        _ => Some(CACHE_SYNC_RECORD),
    }
}

/// Store one record through an attached synchronizer and return the outcome
/// plus the names of the envelopes that reached the queue store.
async fn send_once(
    entity_type: &EntityType,
    policy: CachePolicy,
    is_new: bool,
) -> Result<(SendOutcome, Vec<String>), TestCaseError> {
    let store = Arc::new(InMemoryQueueStore::new());
    let node = messaging_node(&store, "node-a");
    let mapping = StaticMapping::new().with_policy(entity_type.as_str(), policy);
    let (sync, _, _) = synchronizer(mapping);
    sync.attach(&node);

    let record = TestRecord::new(entity_type.as_str(), "42");
    let outcome = sync.send_for_record(&record, is_new, "stored");

    node.flush()
        .await
        .map_err(|e| TestCaseError::fail(e.to_string()))?;
    let names = store
        .list()
        .await
        .map_err(|e| TestCaseError::fail(e.to_string()))?
        .into_iter()
        .map(|e| e.name)
        .collect();
    Ok((outcome, names))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_policy_decides_propagation(
        entity_type in arb_entity_type(),
        policy in arb_policy(),
        is_new in any::<bool>(),
    ) {
        let rt = tokio::runtime::Runtime::new()
            .map_err(|e| TestCaseError::fail(format!("Failed to create runtime: {}", e)))?;
        let (outcome, names) = rt.block_on(send_once(&entity_type, policy, is_new))?;

        match expected_directive(&policy, is_new) {
            Some(name) => {
                prop_assert_eq!(outcome, SendOutcome::Queued);
                prop_assert_eq!(names, vec![name.to_string()]);
            }
            None => {
                prop_assert_eq!(outcome, SendOutcome::Skipped);
                prop_assert!(names.is_empty());
            }
        }
    }
}
