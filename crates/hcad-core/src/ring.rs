//! Consistent hash ring
//!
//! Maps an entity's routing key to the node that owns its model.
//! - Each eligible node occupies `virtual_nodes_per_node` positions hashed
//!   with xxh3; a key belongs to the first position at or after its hash,
//!   wrapping around.
//! - A `RingSnapshot` is immutable. Membership changes build a new snapshot
//!   and swap it in atomically; readers never see a partial ring.
//! - Routing on a fixed snapshot is a pure function of the key, so every node
//!   computes the same owner without coordination.

use crate::stats::DetectionStats;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use xxhash_rust::xxh3::xxh3_64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterNode {
    pub id: String,
    /// Whether the node may host entity models
    pub eligible: bool,
}

impl ClusterNode {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            eligible: true,
        }
    }
}

/// Push notification from the membership feed
#[derive(Debug, Clone)]
pub enum MembershipEvent {
    Joined(ClusterNode),
    Left(String),
    /// Full replacement of the member list
    Snapshot(Vec<ClusterNode>),
}

#[derive(Debug, Default)]
pub struct RingSnapshot {
    positions: BTreeMap<u64, String>,
    nodes: Vec<String>,
}

impl RingSnapshot {
    pub fn build<'a>(
        nodes: impl IntoIterator<Item = &'a ClusterNode>,
        virtual_nodes: usize,
    ) -> Self {
        let mut ids: Vec<String> = nodes
            .into_iter()
            .filter(|n| n.eligible)
            .map(|n| n.id.clone())
            .collect();
        ids.sort();
        ids.dedup();

        let mut positions = BTreeMap::new();
        for id in &ids {
            for i in 0..virtual_nodes.max(1) {
                let hash = xxh3_64(format!("{}#{}", id, i).as_bytes());
                // Sorted insertion order makes collisions resolve identically everywhere
                positions.entry(hash).or_insert_with(|| id.clone());
            }
        }
        Self { positions, nodes: ids }
    }

    pub fn route(&self, key: &str) -> Option<&str> {
        let hash = xxh3_64(key.as_bytes());
        self.positions
            .range(hash..)
            .next()
            .or_else(|| self.positions.iter().next())
            .map(|(_, node)| node.as_str())
    }

    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

pub struct HashRing {
    virtual_nodes: usize,
    members: Mutex<BTreeMap<String, ClusterNode>>,
    snapshot: RwLock<Arc<RingSnapshot>>,
    stats: DetectionStats,
}

impl HashRing {
    pub fn new(virtual_nodes: usize, stats: DetectionStats) -> Self {
        Self {
            virtual_nodes,
            members: Mutex::new(BTreeMap::new()),
            snapshot: RwLock::new(Arc::new(RingSnapshot::default())),
            stats,
        }
    }

    /// Owner of `key` on the current ring; `None` only when no node is eligible
    pub fn get_owning_node(&self, key: &str) -> Option<String> {
        self.snapshot().route(key).map(str::to_string)
    }

    pub fn snapshot(&self) -> Arc<RingSnapshot> {
        self.snapshot.read().clone()
    }

    pub fn apply(&self, event: MembershipEvent) {
        let mut members = self.members.lock();
        match event {
            MembershipEvent::Joined(node) => {
                debug!(node = %node.id, eligible = node.eligible, "Node joined");
                members.insert(node.id.clone(), node);
            }
            MembershipEvent::Left(id) => {
                debug!(node = %id, "Node left");
                members.remove(&id);
            }
            MembershipEvent::Snapshot(nodes) => {
                *members = nodes.into_iter().map(|n| (n.id.clone(), n)).collect();
            }
        }
        let rebuilt = Arc::new(RingSnapshot::build(members.values(), self.virtual_nodes));
        let count = rebuilt.nodes().len();
        *self.snapshot.write() = rebuilt;
        drop(members);

        self.stats.ring_nodes.set(count as i64);
        info!(nodes = count, "Hash ring rebuilt");
    }

    /// Consume membership events until the feed closes or `cancel` fires
    pub fn spawn_membership_listener(
        self: Arc<Self>,
        mut events: mpsc::Receiver<MembershipEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => self.apply(event),
                        None => break,
                    },
                }
            }
            debug!("Membership listener stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring_of(ids: &[&str]) -> HashRing {
        let ring = HashRing::new(50, DetectionStats::new().unwrap());
        ring.apply(MembershipEvent::Snapshot(ids.iter().map(|id| ClusterNode::new(*id)).collect()));
        ring
    }

    #[test]
    fn test_empty_ring_routes_nowhere() {
        let ring = HashRing::new(10, DetectionStats::new().unwrap());
        assert!(ring.get_owning_node("d1_entity_1").is_none());
    }

    #[test]
    fn test_routing_is_deterministic_across_instances() {
        let a = ring_of(&["n1", "n2", "n3"]);
        let b = ring_of(&["n3", "n1", "n2"]);
        for i in 0..200 {
            let key = format!("d1_entity_{}", i);
            assert_eq!(a.get_owning_node(&key), b.get_owning_node(&key));
        }
    }

    #[test]
    fn test_ineligible_nodes_are_skipped() {
        let ring = HashRing::new(20, DetectionStats::new().unwrap());
        ring.apply(MembershipEvent::Snapshot(vec![
            ClusterNode::new("data"),
            ClusterNode {
                id: "master".into(),
                eligible: false,
            },
        ]));
        for i in 0..50 {
            assert_eq!(ring.get_owning_node(&format!("k{}", i)).as_deref(), Some("data"));
        }
    }

    #[test]
    fn test_leave_moves_only_departed_keys() {
        let ring = ring_of(&["n1", "n2", "n3"]);
        let before: Vec<_> = (0..300).map(|i| ring.get_owning_node(&format!("k{}", i))).collect();
        ring.apply(MembershipEvent::Left("n2".into()));
        for (i, owner) in before.iter().enumerate() {
            let now = ring.get_owning_node(&format!("k{}", i));
            if owner.as_deref() != Some("n2") {
                assert_eq!(&now, owner);
            } else {
                assert_ne!(now.as_deref(), Some("n2"));
            }
        }
    }

    #[test]
    fn test_ring_nodes_gauge() {
        let stats = DetectionStats::new().unwrap();
        let ring = HashRing::new(5, stats.clone());
        ring.apply(MembershipEvent::Joined(ClusterNode::new("a")));
        ring.apply(MembershipEvent::Joined(ClusterNode::new("b")));
        assert_eq!(stats.ring_nodes.get(), 2);
    }

    #[tokio::test]
    async fn test_membership_listener() {
        let ring = Arc::new(HashRing::new(5, DetectionStats::new().unwrap()));
        let (tx, rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let handle = ring.clone().spawn_membership_listener(rx, cancel.clone());
        tx.send(MembershipEvent::Joined(ClusterNode::new("n1"))).await.unwrap();
        drop(tx);
        handle.await.unwrap();
        assert_eq!(ring.get_owning_node("anything").as_deref(), Some("n1"));
    }
}
