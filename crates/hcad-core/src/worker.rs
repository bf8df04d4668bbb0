//! Model worker
//!
//! Receiving side of an entity batch. For every entity it locks the cached
//! model state (restoring or cold-starting it on a miss), scores the feature
//! vector and writes the result to the result index.
//!
//! A worker refuses batches instead of queueing them without bound: when all
//! batch permits are taken the reply is "not acknowledged", which the
//! coordinator turns into backpressure on this node.

use crate::breaker::CircuitBreakerService;
use crate::cache::EntityCache;
use crate::error::{DetectionError, IndexError};
use crate::model::{AnomalyResult, EntityScore};
use crate::scorer::AnomalyScorer;
use crate::state::StateManager;
use crate::store::{ResultBulkRequest, ResultIndexer};
use crate::transport::{BatchHandler, EntityBatchRequest, EntityBatchResponse};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

pub struct ModelWorker {
    node_id: String,
    cache: Arc<EntityCache>,
    breaker: Arc<CircuitBreakerService>,
    scorer: Arc<dyn AnomalyScorer>,
    state: Arc<StateManager>,
    indexer: Arc<dyn ResultIndexer>,
    permits: Arc<Semaphore>,
}

impl ModelWorker {
    pub fn new(
        node_id: impl Into<String>,
        cache: Arc<EntityCache>,
        breaker: Arc<CircuitBreakerService>,
        scorer: Arc<dyn AnomalyScorer>,
        state: Arc<StateManager>,
        indexer: Arc<dyn ResultIndexer>,
        max_concurrent_batches: usize,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            cache,
            breaker,
            scorer,
            state,
            indexer,
            permits: Arc::new(Semaphore::new(max_concurrent_batches)),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn cache(&self) -> &Arc<EntityCache> {
        &self.cache
    }

    async fn score_batch(&self, request: EntityBatchRequest) -> EntityBatchResponse {
        let detector_id = request.detector_id.as_str();
        let execution_start = Utc::now();
        // Under write pressure only anomalies and errors are indexed
        let essential_only = self.state.is_index_throttled_recently();

        let mut scores = Vec::with_capacity(request.entities.len());
        let mut bulk = ResultBulkRequest::new();

        for item in request.entities {
            let outcome = {
                let mut handle = self.cache.get(detector_id, &item.entity, &item.features).await;
                if let Some(err) = handle.restore_error().filter(|e| e.is_end_run()) {
                    self.state.set_cold_start_exception(
                        detector_id,
                        DetectionError::end_run(detector_id, err.to_string(), true),
                    );
                }
                self.scorer.score(&mut handle.model, &item.features)
            };

            let result = AnomalyResult {
                detector_id: detector_id.to_string(),
                entity: Some(item.entity.clone()),
                anomaly_score: outcome.score,
                anomaly_grade: outcome.grade,
                confidence: outcome.confidence,
                feature_data: item.features,
                data_start_time: request.start,
                data_end_time: request.end,
                execution_start_time: execution_start,
                execution_end_time: Utc::now(),
                error: None,
            };
            if !essential_only || result.is_essential() {
                bulk.add(result);
            }

            scores.push(EntityScore {
                entity: item.entity,
                score: outcome.score,
                grade: outcome.grade,
                confidence: outcome.confidence,
            });
        }

        self.index(detector_id, bulk).await;
        EntityBatchResponse::acknowledged(scores)
    }

    async fn index(&self, detector_id: &str, bulk: ResultBulkRequest) {
        if bulk.is_empty() {
            return;
        }
        match self.indexer.bulk_index(bulk).await {
            Ok(count) => {
                self.state.reset_index_pressure(detector_id);
                debug!(detector_id, count, "Indexed anomaly results");
            }
            Err(IndexError::Throttled(reason)) => {
                self.state.set_last_index_throttled_time(Utc::now());
                let pressure = self.state.add_index_pressure(detector_id);
                warn!(detector_id, pressure, %reason, "Result index throttled");
            }
            Err(e) => {
                warn!(detector_id, error = %e, "Failed to index anomaly results");
            }
        }
    }
}

#[async_trait]
impl BatchHandler for ModelWorker {
    async fn handle(
        &self,
        request: EntityBatchRequest,
    ) -> Result<EntityBatchResponse, DetectionError> {
        if self.breaker.is_open() {
            warn!(
                node = %self.node_id,
                detector_id = %request.detector_id,
                "Circuit breaker open, rejecting batch"
            );
            return Err(DetectionError::limit_exceeded(&request.detector_id));
        }
        let Ok(_permit) = self.permits.clone().try_acquire_owned() else {
            warn!(
                node = %self.node_id,
                detector_id = %request.detector_id,
                "Worker saturated, batch not acknowledged"
            );
            return Ok(EntityBatchResponse::not_acknowledged());
        };
        debug!(
            node = %self.node_id,
            request_id = %request.request_id,
            entities = request.entities.len(),
            "Scoring entity batch"
        );
        Ok(self.score_batch(request).await)
    }
}
