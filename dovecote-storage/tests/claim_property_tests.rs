//! Property-Based Tests for Claim Exclusivity
//!
//! **Property: Exclusive claim**
//!
//! For any set of queued envelopes and any interleaving of claiming nodes,
//! no envelope SHALL end up locked by more than one node, and no node SHALL
//! claim an envelope it sent, already processed, or that is addressed to
//! another node. Holds for both the in-memory and the LMDB store.

use chrono::Utc;
use dovecote_core::{DeliveryMode, Envelope, LockHolder, NodeId, DEFAULT_TTL_MS};
use dovecote_storage::{ClaimLimit, InMemoryQueueStore, LmdbQueueStore, QueueStore};
use proptest::prelude::*;
use proptest::test_runner::TestCaseError;
use tempfile::TempDir;

// ============================================================================
// GENERATORS
// ============================================================================

const NODES: [&str; 4] = ["n0", "n1", "n2", "n3"];

fn node(index: usize) -> NodeId {
    NodeId::new(NODES[index % NODES.len()]).expect("valid node id")
}

#[derive(Debug, Clone)]
struct Shape {
    sender: usize,
    to: Option<usize>,
    broadcast: bool,
}

fn shape_strategy() -> impl Strategy<Value = Shape> {
    (0..NODES.len(), proptest::option::of(0..NODES.len()), any::<bool>())
        .prop_map(|(sender, to, broadcast)| Shape { sender, to, broadcast })
}

fn build(shape: &Shape) -> Envelope {
    let mode = if shape.broadcast {
        DeliveryMode::Broadcast
    } else {
        DeliveryMode::Exclusive
    };
    let mut envelope = Envelope::new("topic", mode, "", "", DEFAULT_TTL_MS);
    if let Some(to) = shape.to {
        envelope = envelope.with_to(node(to));
    }
    envelope.prepare_for_send(&node(shape.sender));
    envelope
}

// ============================================================================
// SHARED CHECK
// ============================================================================

async fn check_exclusive_claims<S: QueueStore>(
    store: &S,
    shapes: &[Shape],
    order: &[usize],
    multiple: bool,
) -> Result<(), TestCaseError> {
    let envelopes: Vec<Envelope> = shapes.iter().map(build).collect();
    store
        .insert_many(envelopes)
        .await
        .map_err(|e| TestCaseError::fail(e.to_string()))?;

    let limit = ClaimLimit::from_process_multiple(multiple);
    let mut total = 0u64;
    for index in order {
        total += store
            .claim(&node(*index), Utc::now(), limit)
            .await
            .map_err(|e| TestCaseError::fail(e.to_string()))?;
    }

    let stored = store
        .list()
        .await
        .map_err(|e| TestCaseError::fail(e.to_string()))?;

    let locked_by_node = stored
        .iter()
        .filter(|e| matches!(e.locked_by, Some(LockHolder::Node(_))))
        .count() as u64;
    prop_assert_eq!(locked_by_node, total);

    for envelope in &stored {
        match &envelope.locked_by {
            Some(LockHolder::Node(holder)) => {
                prop_assert!(envelope.is_exclusive());
                prop_assert!(envelope.sender.as_ref() != Some(holder));
                prop_assert!(envelope.to.is_none() || envelope.to.as_ref() == Some(holder));
            }
            Some(LockHolder::All) => prop_assert!(!envelope.is_exclusive()),
            None => {}
        }
    }
    Ok(())
}

// ============================================================================
// PROPERTIES
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_in_memory_claims_are_exclusive(
        shapes in proptest::collection::vec(shape_strategy(), 0..12),
        order in proptest::collection::vec(0..NODES.len(), 1..8),
        multiple in any::<bool>(),
    ) {
        let rt = tokio::runtime::Runtime::new()
            .map_err(|e| TestCaseError::fail(format!("Failed to create runtime: {}", e)))?;
        rt.block_on(async {
            let store = InMemoryQueueStore::new();
            check_exclusive_claims(&store, &shapes, &order, multiple).await
        })?;
    }

    #[test]
    fn prop_lmdb_claims_are_exclusive(
        shapes in proptest::collection::vec(shape_strategy(), 0..12),
        order in proptest::collection::vec(0..NODES.len(), 1..8),
        multiple in any::<bool>(),
    ) {
        let rt = tokio::runtime::Runtime::new()
            .map_err(|e| TestCaseError::fail(format!("Failed to create runtime: {}", e)))?;
        let dir = TempDir::new()
            .map_err(|e| TestCaseError::fail(format!("Failed to create temp dir: {}", e)))?;
        let store = LmdbQueueStore::new(dir.path(), 10)
            .map_err(|e| TestCaseError::fail(e.to_string()))?;
        rt.block_on(async {
            check_exclusive_claims(&store, &shapes, &order, multiple).await
        })?;
    }

    #[test]
    fn prop_single_claim_locks_at_most_one(
        shapes in proptest::collection::vec(shape_strategy(), 0..12),
        claimer in 0..NODES.len(),
    ) {
        let rt = tokio::runtime::Runtime::new()
            .map_err(|e| TestCaseError::fail(format!("Failed to create runtime: {}", e)))?;
        let claimed = rt.block_on(async {
            let store = InMemoryQueueStore::new();
            let envelopes: Vec<Envelope> = shapes.iter().map(build).collect();
            store.insert_many(envelopes).await?;
            store.claim(&node(claimer), Utc::now(), ClaimLimit::One).await
        }).map_err(|e| TestCaseError::fail(e.to_string()))?;
        prop_assert!(claimed <= 1);
    }
}

#[tokio::test]
async fn test_two_handles_share_lmdb_queue() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let producer = LmdbQueueStore::new(dir.path(), 10).expect("open store");
    let consumer = producer.clone();

    let mut envelope = Envelope::exclusive("job", "run", "");
    envelope.prepare_for_send(&node(0));
    producer.insert(envelope).await.expect("insert");

    assert_eq!(
        consumer
            .claim(&node(1), Utc::now(), ClaimLimit::All)
            .await
            .expect("claim"),
        1
    );
    assert_eq!(
        producer
            .claim(&node(2), Utc::now(), ClaimLimit::All)
            .await
            .expect("claim"),
        0
    );
    assert_eq!(consumer.fetch_for(&node(1)).await.expect("fetch").len(), 1);
}
