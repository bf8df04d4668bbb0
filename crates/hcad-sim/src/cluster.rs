//! In-process cluster
//!
//! Runs N `DetectionNode`s on one runtime. They share the collaborator stores
//! and talk through a `JitteryTransport`, which wraps `LocalTransport` with
//! random latency and dropped batches. Membership changes are broadcast to
//! every node's ring through its own listener channel, so rings converge the
//! same way they would from a real discovery feed.

use crate::generator::{GeneratorStats, SyntheticFeatureStore};
use async_trait::async_trait;
use hcad_core::checkpoint::InMemoryCheckpointStore;
use hcad_core::config::HcadConfig;
use hcad_core::model::Detector;
use hcad_core::stats::StatsSnapshot;
use hcad_core::store::{InMemoryDetectorStore, InMemoryResultIndex, InMemoryStateStore};
use hcad_core::transport::{EntityBatchRequest, EntityBatchResponse};
use hcad_core::{
    CircuitBreakerService, ClusterNode, Collaborators, DetectionError, DetectionNode,
    LocalTransport, MembershipEvent, SubRequestTransport,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const MEMBERSHIP_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub nodes: usize,
    pub hcad: HcadConfig,
    /// Upper bound of random per-batch latency
    pub max_jitter_ms: u64,
    /// Probability that a batch never reaches its node
    pub drop_rate: f64,
    pub maintenance_period: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            nodes: 3,
            hcad: HcadConfig::default(),
            max_jitter_ms: 20,
            drop_rate: 0.0,
            maintenance_period: Duration::from_secs(30),
        }
    }
}

// ============================================================================
// TRANSPORT
// ============================================================================

pub struct JitteryTransport {
    inner: LocalTransport,
    max_jitter_ms: u64,
    drop_rate: f64,
    dropped: AtomicU64,
}

impl JitteryTransport {
    pub fn new(max_jitter_ms: u64, drop_rate: f64) -> Self {
        Self {
            inner: LocalTransport::new(),
            max_jitter_ms,
            drop_rate: drop_rate.clamp(0.0, 1.0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn local(&self) -> &LocalTransport {
        &self.inner
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl SubRequestTransport for JitteryTransport {
    async fn send(
        &self,
        node: &str,
        request: EntityBatchRequest,
    ) -> Result<EntityBatchResponse, DetectionError> {
        if self.drop_rate > 0.0 && fastrand::f64() < self.drop_rate {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Err(DetectionError::NodeUnavailable { node: node.to_string() });
        }
        if self.max_jitter_ms > 0 {
            let jitter = fastrand::u64(0..=self.max_jitter_ms);
            tokio::time::sleep(Duration::from_millis(jitter)).await;
        }
        self.inner.send(node, request).await
    }
}

// ============================================================================
// CLUSTER
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct NodeSnapshot {
    pub id: String,
    pub member: bool,
    pub cached_entities: usize,
    pub pending_checkpoints: usize,
    pub stats: StatsSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterSnapshot {
    pub nodes: Vec<NodeSnapshot>,
    pub results_indexed: usize,
    pub checkpoints_stored: usize,
    pub dropped_batches: u64,
    pub generator: GeneratorStats,
}

pub struct SimCluster {
    nodes: Vec<DetectionNode>,
    membership: Vec<mpsc::Sender<MembershipEvent>>,
    departed: Mutex<Option<String>>,
    transport: Arc<JitteryTransport>,
    detectors: Arc<InMemoryDetectorStore>,
    features: Arc<SyntheticFeatureStore>,
    results: Arc<InMemoryResultIndex>,
    checkpoints: Arc<InMemoryCheckpointStore>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SimCluster {
    /// Assemble and start every node; must run inside a tokio runtime
    pub fn start(
        config: &ClusterConfig,
        features: Arc<SyntheticFeatureStore>,
    ) -> Result<Self, prometheus::Error> {
        let transport = Arc::new(JitteryTransport::new(config.max_jitter_ms, config.drop_rate));
        let detectors = Arc::new(InMemoryDetectorStore::new());
        let results = Arc::new(InMemoryResultIndex::new());
        let checkpoints = Arc::new(InMemoryCheckpointStore::new());
        let collaborators = Collaborators {
            detectors: detectors.clone(),
            features: features.clone(),
            checkpoints: checkpoints.clone(),
            results: results.clone(),
            detector_states: Arc::new(InMemoryStateStore::new()),
            transport: transport.clone(),
        };

        let cancel = CancellationToken::new();
        let mut nodes = Vec::with_capacity(config.nodes);
        let mut membership = Vec::with_capacity(config.nodes);
        let mut tasks = Vec::new();
        for i in 0..config.nodes.max(1) {
            let breaker = Arc::new(CircuitBreakerService::from_config(&config.hcad.breaker));
            let id = format!("node-{}", i);
            let node = DetectionNode::new(id, &config.hcad, collaborators.clone(), breaker)?;
            transport.local().register(&node.id, node.worker.clone());

            let (tx, rx) = mpsc::channel(MEMBERSHIP_CHANNEL_CAPACITY);
            tasks.push(node.ring.clone().spawn_membership_listener(rx, cancel.child_token()));
            tasks.extend(node.spawn_maintenance(config.maintenance_period));
            membership.push(tx);
            nodes.push(node);
        }

        let members: Vec<ClusterNode> =
            nodes.iter().map(|n| ClusterNode::new(n.id.clone())).collect();
        for node in &nodes {
            node.ring.apply(MembershipEvent::Snapshot(members.clone()));
        }
        info!(nodes = nodes.len(), "Simulated cluster started");

        Ok(Self {
            nodes,
            membership,
            departed: Mutex::new(None),
            transport,
            detectors,
            features,
            results,
            checkpoints,
            cancel,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn add_detector(&self, detector: Detector) {
        info!(
            detector_id = %detector.id,
            entity_fields = ?detector.category_fields,
            "Detector registered"
        );
        self.detectors.put(detector);
    }

    pub fn nodes(&self) -> &[DetectionNode] {
        &self.nodes
    }

    pub fn node(&self, id: &str) -> Option<&DetectionNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// A random member to coordinate the next request
    pub fn coordinator(&self) -> &DetectionNode {
        let departed = self.departed.lock().clone();
        let members: Vec<&DetectionNode> = self
            .nodes
            .iter()
            .filter(|n| departed.as_deref() != Some(n.id.as_str()))
            .collect();
        match members.len() {
            0 => &self.nodes[0],
            len => members[fastrand::usize(..len)],
        }
    }

    async fn broadcast(&self, event: MembershipEvent) {
        for tx in &self.membership {
            if tx.send(event.clone()).await.is_err() {
                warn!("Membership listener closed");
            }
        }
    }

    /// Take one node out of the ring, or bring the departed one back.
    /// The departed node keeps running: only routing changes.
    pub async fn churn(&self) -> Option<MembershipEvent> {
        if self.nodes.len() < 2 {
            return None;
        }
        let returning = self.departed.lock().take();
        let event = match returning {
            Some(id) => {
                info!(node = %id, "Node rejoining ring");
                MembershipEvent::Joined(ClusterNode::new(id))
            }
            None => {
                let id = self.nodes[fastrand::usize(..self.nodes.len())].id.clone();
                info!(node = %id, "Node leaving ring");
                *self.departed.lock() = Some(id.clone());
                MembershipEvent::Left(id)
            }
        };
        self.broadcast(event.clone()).await;
        Some(event)
    }

    /// Delete a detector from storage once, then clear it from every node.
    /// Returns the cached entities dropped across the cluster.
    pub async fn delete_detector(&self, detector_id: &str) -> Result<usize, DetectionError> {
        let mut nodes = self.nodes.iter();
        let Some(first) = nodes.next() else {
            return Err(DetectionError::DetectorNotFound(detector_id.to_string()));
        };
        let mut cleared = first.delete_detector(detector_id).await?;
        for node in nodes {
            cleared += node.clear_detector(detector_id);
        }
        Ok(cleared)
    }

    pub fn snapshot(&self) -> ClusterSnapshot {
        let departed = self.departed.lock().clone();
        ClusterSnapshot {
            nodes: self
                .nodes
                .iter()
                .map(|n| NodeSnapshot {
                    id: n.id.clone(),
                    member: departed.as_deref() != Some(n.id.as_str()),
                    cached_entities: n.cache.len(),
                    pending_checkpoints: n.writer.pending_len(),
                    stats: n.stats.snapshot(),
                })
                .collect(),
            results_indexed: self.results.len(),
            checkpoints_stored: self.checkpoints.len(),
            dropped_batches: self.transport.dropped(),
            generator: self.features.stats(),
        }
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop listeners and tickers, then drain every checkpoint queue
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for node in &self.nodes {
            node.shutdown().await;
        }
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        info!(checkpoints = self.checkpoints.len(), "Simulated cluster stopped");
    }
}
