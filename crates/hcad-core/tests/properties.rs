//! Property tests for routing, result aggregation and the entity cache.

use hcad_core::aggregator::{AggregateError, Mergeable, ResultAggregator};
use hcad_core::config::{CacheConfig, CheckpointConfig};
use hcad_core::model::{Entity, EntityKey};
use hcad_core::ring::{ClusterNode, RingSnapshot};
use hcad_core::scorer::{AnomalyScorer, EwmaScorer};
use hcad_core::{CheckpointWriter, DetectionStats, EntityCache, InMemoryCheckpointStore};
use proptest::prelude::*;
use proptest::test_runner::TestCaseError;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

// ---------------------------------------------------------------------------
// Helpers / Strategies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
struct Sum(u64);

impl Mergeable for Sum {
    fn merge(self, other: Self) -> Self {
        Sum(self.0 + other.0)
    }
}

fn arb_node_ids() -> impl Strategy<Value = Vec<String>> {
    prop::collection::hash_set("[a-z]{2,6}", 1..8).prop_map(|ids| ids.into_iter().collect())
}

/// `Some` is a successful sub-response, `None` a failure
fn arb_outcomes() -> impl Strategy<Value = Vec<Option<u64>>> {
    prop::collection::vec(prop::option::of(0u64..1000), 0..24)
}

// ---------------------------------------------------------------------------
// Ring
// ---------------------------------------------------------------------------

proptest! {
    #[test]
    fn test_routing_ignores_membership_order(
        (ids, shuffled) in arb_node_ids()
            .prop_flat_map(|ids| (Just(ids.clone()), Just(ids).prop_shuffle())),
        keys in prop::collection::vec("[a-z0-9_]{1,24}", 1..32),
    ) {
        let a: Vec<ClusterNode> = ids.iter().map(|id| ClusterNode::new(id.clone())).collect();
        let b: Vec<ClusterNode> = shuffled.iter().map(|id| ClusterNode::new(id.clone())).collect();
        let ring_a = RingSnapshot::build(&a, 16);
        let ring_b = RingSnapshot::build(&b, 16);

        prop_assert_eq!(ring_a.nodes(), ring_b.nodes());
        for key in &keys {
            let owner = ring_a.route(key);
            prop_assert!(owner.is_some());
            prop_assert_eq!(owner, ring_b.route(key));
        }
    }

    #[test]
    fn test_ineligible_nodes_never_own_keys(
        ids in arb_node_ids(),
        keys in prop::collection::vec("[a-z0-9_]{1,24}", 1..32),
    ) {
        let mut nodes: Vec<ClusterNode> =
            ids.iter().map(|id| ClusterNode::new(id.clone())).collect();
        nodes[0].eligible = false;
        let ring = RingSnapshot::build(&nodes, 8);

        for key in &keys {
            prop_assert_ne!(ring.route(key), Some(ids[0].as_str()));
        }
    }

    #[test]
    fn test_entity_identity_ignores_attribute_order(
        attrs in prop::collection::btree_map("[a-z]{1,6}", "[a-z0-9]{1,6}", 1..5),
    ) {
        let forward = Entity::new(attrs.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        let reverse = Entity::new(attrs.iter().rev().map(|(k, v)| (k.as_str(), v.as_str())));
        prop_assert_eq!(forward.id_within("d1"), reverse.id_within("d1"));
        prop_assert_eq!(forward.to_string(), reverse.to_string());
    }
}

// ---------------------------------------------------------------------------
// Aggregator
// ---------------------------------------------------------------------------

fn run_aggregator(
    outcomes: &[Option<u64>],
    partial: bool,
) -> (usize, Option<Result<Sum, AggregateError<String>>>) {
    let fired = Arc::new(AtomicUsize::new(0));
    let delivered = Arc::new(parking_lot::Mutex::new(None));
    let aggregator = {
        let fired = fired.clone();
        let delivered = delivered.clone();
        ResultAggregator::<Sum, String>::new(outcomes.len(), "all failed", partial, move |result| {
            fired.fetch_add(1, Ordering::SeqCst);
            *delivered.lock() = Some(result);
        })
    };

    for outcome in outcomes {
        match outcome {
            Some(v) => aggregator.on_response(Sum(*v)),
            None => aggregator.on_failure("boom".to_string()),
        }
    }
    // Late completions must not fire the listener again; with N = 0 this one delivers
    aggregator.on_failure("late".to_string());

    let result = delivered.lock().take();
    (fired.load(Ordering::SeqCst), result)
}

proptest! {
    #[test]
    fn test_aggregator_fires_exactly_once(outcomes in arb_outcomes(), partial in any::<bool>()) {
        let (fired, result) = run_aggregator(&outcomes, partial);
        prop_assert_eq!(fired, 1);
        prop_assert!(result.is_some());
    }

    #[test]
    fn test_partial_mode_merges_every_success(outcomes in arb_outcomes()) {
        prop_assume!(!outcomes.is_empty());
        let (_, result) = run_aggregator(&outcomes, true);
        let successes: Vec<u64> = outcomes.iter().flatten().copied().collect();
        let failures = outcomes.len() - successes.len();

        match result {
            Some(Ok(sum)) => prop_assert_eq!(sum.0, successes.iter().sum::<u64>()),
            Some(Err(AggregateError::NoResponse { errors })) => {
                prop_assert!(successes.is_empty());
                prop_assert_eq!(errors.len(), failures);
            }
            other => prop_assert!(false, "unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_strict_mode_lists_every_failure(outcomes in arb_outcomes()) {
        prop_assume!(!outcomes.is_empty());
        let (_, result) = run_aggregator(&outcomes, false);
        let failures = outcomes.iter().filter(|o| o.is_none()).count();

        match result {
            Some(Ok(_)) => prop_assert_eq!(failures, 0),
            Some(Err(AggregateError::Failed { message, errors })) => {
                prop_assert!(failures > 0);
                prop_assert_eq!(errors.len(), failures);
                prop_assert!(message.starts_with("all failed Exceptions: ["));
            }
            Some(Err(AggregateError::NoResponse { .. })) => {
                prop_assert!(false, "strict mode reported no response")
            }
            None => prop_assert!(false, "nothing delivered"),
        }
    }
}

// ---------------------------------------------------------------------------
// Entity cache
// ---------------------------------------------------------------------------

const CACHE_DETECTOR: &str = "d1";
const CACHE_CAPACITY: usize = 3;

#[derive(Debug, Clone)]
enum CacheOp {
    Score(u8),
    Remove(u8),
    Clear,
    Maintenance,
    /// Remove an entity while a scoring call holds it, racing a second lookup
    ScoreWhileRemoved(u8),
}

fn arb_cache_ops() -> impl Strategy<Value = Vec<CacheOp>> {
    let op = prop_oneof![
        4 => (0u8..8).prop_map(CacheOp::Score),
        1 => (0u8..8).prop_map(CacheOp::Remove),
        1 => Just(CacheOp::Clear),
        1 => Just(CacheOp::Maintenance),
        1 => (0u8..8).prop_map(CacheOp::ScoreWhileRemoved),
    ];
    prop::collection::vec(op, 1..48)
}

fn block_on<F: Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
        .block_on(future)
}

fn host(i: u8) -> Entity {
    Entity::single("host", &format!("h{}", i))
}

async fn score_once(cache: &EntityCache, i: u8) {
    let mut handle = cache.get(CACHE_DETECTOR, &host(i), &[1.0]).await;
    EwmaScorer::default().score(&mut handle.model, &[1.0]);
}

/// Every scoring call lands on the single state of its entity: after any mix
/// of lookups, removals, clears, maintenance and capacity evictions, each
/// entity's model has seen exactly the calls made for it, and every entity
/// that left the cache was flushed to the store.
async fn check_cache_ops(ops: Vec<CacheOp>, expire: bool) -> Result<(), TestCaseError> {
    let stats = DetectionStats::new().map_err(|e| TestCaseError::fail(e.to_string()))?;
    let store = Arc::new(InMemoryCheckpointStore::new());
    let writer = Arc::new(CheckpointWriter::new(
        CheckpointConfig::default(),
        store.clone(),
        stats.clone(),
    ));
    let config = CacheConfig {
        max_entities: CACHE_CAPACITY,
        entity_ttl_secs: if expire { 0 } else { 3600 },
        checkpoint_interval_secs: 0,
        ..CacheConfig::default()
    };
    let cache = Arc::new(EntityCache::new(
        config,
        store.clone(),
        writer.clone(),
        Arc::new(EwmaScorer::default()),
        stats,
    ));

    let mut expected: BTreeMap<u8, u64> = BTreeMap::new();
    for op in ops {
        match op {
            CacheOp::Score(i) => {
                score_once(&cache, i).await;
                *expected.entry(i).or_default() += 1;
            }
            CacheOp::Remove(i) => {
                cache.remove(CACHE_DETECTOR, &host(i));
            }
            CacheOp::Clear => {
                cache.clear(CACHE_DETECTOR);
            }
            CacheOp::Maintenance => {
                cache.maintenance();
            }
            CacheOp::ScoreWhileRemoved(i) => {
                let mut held = cache.get(CACHE_DETECTOR, &host(i), &[1.0]).await;
                EwmaScorer::default().score(&mut held.model, &[1.0]);
                prop_assert!(cache.remove(CACHE_DETECTOR, &host(i)));

                let racer = {
                    let cache = cache.clone();
                    tokio::spawn(async move { score_once(&cache, i).await })
                };
                for _ in 0..5 {
                    tokio::task::yield_now().await;
                }
                prop_assert!(!racer.is_finished(), "lookup ran while the state was held");

                drop(held);
                racer.await.map_err(|e| TestCaseError::fail(e.to_string()))?;
                *expected.entry(i).or_default() += 2;
            }
        }
    }

    writer.flush().await;
    prop_assert_eq!(writer.pending_len(), 0);
    prop_assert_eq!(cache.retiring_len(), 0);
    prop_assert!(cache.len() <= CACHE_CAPACITY);

    for &i in expected.keys() {
        if !cache.contains(CACHE_DETECTOR, &host(i)) {
            prop_assert!(store.contains(&EntityKey::new(CACHE_DETECTOR, &host(i))));
        }
    }
    for (&i, &calls) in &expected {
        let handle = cache.get(CACHE_DETECTOR, &host(i), &[1.0]).await;
        prop_assert_eq!(handle.model.samples(), calls, "entity h{}", i);
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_cache_keeps_one_state_per_entity(ops in arb_cache_ops(), expire in any::<bool>()) {
        block_on(check_cache_ops(ops, expire))?;
    }
}
