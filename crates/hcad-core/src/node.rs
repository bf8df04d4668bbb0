//! Node assembly
//!
//! Wires every per-node component to its collaborators: one breaker registry,
//! ring, state manager, checkpoint writer, entity cache, worker and
//! dispatcher per node. Collaborators (stores and transport) are shared.

use crate::breaker::CircuitBreakerService;
use crate::cache::EntityCache;
use crate::checkpoint::{CheckpointStore, CheckpointWriter};
use crate::config::HcadConfig;
use crate::dispatcher::Dispatcher;
use crate::error::DetectionError;
use crate::ring::HashRing;
use crate::scorer::{AnomalyScorer, EwmaScorer};
use crate::state::{DetectionStateHandler, StateManager};
use crate::stats::DetectionStats;
use crate::store::{DetectorStateStore, DetectorStore, FeatureStore, ResultIndexer};
use crate::task::{CancellationState, TaskManager};
use crate::transport::SubRequestTransport;
use crate::worker::ModelWorker;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// External systems a node talks to
#[derive(Clone)]
pub struct Collaborators {
    pub detectors: Arc<dyn DetectorStore>,
    pub features: Arc<dyn FeatureStore>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub results: Arc<dyn ResultIndexer>,
    pub detector_states: Arc<dyn DetectorStateStore>,
    pub transport: Arc<dyn SubRequestTransport>,
}

pub struct DetectionNode {
    pub id: String,
    pub stats: DetectionStats,
    pub breaker: Arc<CircuitBreakerService>,
    pub ring: Arc<HashRing>,
    pub state: Arc<StateManager>,
    pub writer: Arc<CheckpointWriter>,
    pub cache: Arc<EntityCache>,
    pub worker: Arc<ModelWorker>,
    pub dispatcher: Arc<Dispatcher>,
    pub tasks: Arc<TaskManager>,
    detectors: Arc<dyn DetectorStore>,
    cancel: CancellationToken,
}

impl DetectionNode {
    /// Must be called inside a tokio runtime
    pub fn new(
        id: impl Into<String>,
        config: &HcadConfig,
        collaborators: Collaborators,
        breaker: Arc<CircuitBreakerService>,
    ) -> Result<Self, prometheus::Error> {
        let id = id.into();
        let stats = DetectionStats::new()?;
        let scorer: Arc<dyn AnomalyScorer> =
            Arc::new(EwmaScorer::with_min_samples(config.cache.cold_start_min_samples));

        let ring = Arc::new(HashRing::new(config.ring.virtual_nodes_per_node, stats.clone()));
        let state = Arc::new(StateManager::new(
            config.state.clone(),
            collaborators.detectors.clone(),
        ));
        let writer = Arc::new(CheckpointWriter::new(
            config.checkpoint.clone(),
            collaborators.checkpoints.clone(),
            stats.clone(),
        ));
        let cache = Arc::new(EntityCache::new(
            config.cache.clone(),
            collaborators.checkpoints.clone(),
            writer.clone(),
            scorer.clone(),
            stats.clone(),
        ));
        let worker = Arc::new(ModelWorker::new(
            id.clone(),
            cache.clone(),
            breaker.clone(),
            scorer,
            state.clone(),
            collaborators.results.clone(),
            config.dispatch.max_concurrent_batches_per_node,
        ));
        let handler = Arc::new(DetectionStateHandler::new(
            collaborators.detector_states.clone(),
            state.clone(),
        ));
        let dispatcher = Arc::new(
            Dispatcher::new(
                id.clone(),
                config.dispatch.clone(),
                breaker.clone(),
                state.clone(),
                collaborators.features.clone(),
                ring.clone(),
                collaborators.transport.clone(),
                stats.clone(),
            )
            .with_state_handler(handler),
        );
        let tasks = Arc::new(TaskManager::new(dispatcher.clone()));

        info!(node = %id, "Detection node assembled");
        Ok(Self {
            id,
            stats,
            breaker,
            ring,
            state,
            writer,
            cache,
            worker,
            dispatcher,
            tasks,
            detectors: collaborators.detectors,
            cancel: CancellationToken::new(),
        })
    }

    /// Start cache and state maintenance tickers
    pub fn spawn_maintenance(&self, period: Duration) -> Vec<JoinHandle<()>> {
        vec![
            self.cache.clone().spawn_maintenance(period, self.cancel.clone()),
            self.state.clone().spawn_maintenance(period, self.cancel.clone()),
        ]
    }

    /// Drop everything this node holds for a detector: a running historical
    /// task, its runtime state and its cached entity models. Models are
    /// flushed to checkpoints in the background. Returns the entities dropped.
    pub fn clear_detector(&self, detector_id: &str) -> usize {
        if self.tasks.cancel(detector_id) == CancellationState::Cancelled {
            info!(node = %self.id, detector_id, "Cancelled historical run of cleared detector");
        }
        self.state.clear(detector_id);
        self.cache.clear(detector_id)
    }

    /// Delete a detector from storage and clear it from this node. Every
    /// other node of the cluster still needs `clear_detector`.
    pub async fn delete_detector(&self, detector_id: &str) -> Result<usize, DetectionError> {
        if !self.detectors.delete_detector(detector_id).await? {
            return Err(DetectionError::DetectorNotFound(detector_id.to_string()));
        }
        let cleared = self.clear_detector(detector_id);
        info!(node = %self.id, detector_id, entities = cleared, "Detector deleted");
        Ok(cleared)
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop background tickers and wait for queued checkpoints
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.writer.flush().await;
        info!(node = %self.id, "Detection node stopped");
    }
}
