//! Detection request coordinator
//!
//! Drives one top-level request through its stages:
//!
//! `CHECK_BREAKER -> CHECK_STATE -> FETCH_FEATURES -> ROUTE_AND_FANOUT ->
//! AWAIT_SUBRESPONSES -> MERGE -> RESPOND`
//!
//! Only request-level preconditions (open breaker, cached end-run error,
//! feature fetch failure) fail before fan-out. Per-entity and per-node
//! failures are folded into the `ResultAggregator`. Every sub-request carries
//! its own timeout, so the request always resolves.

use crate::aggregator::{AggregateError, Mergeable, ResultAggregator};
use crate::breaker::CircuitBreakerService;
use crate::config::DispatchConfig;
use crate::error::{ALL_NODES_FAILED_MSG, DETECTOR_DISABLED_MSG, DetectionError, NO_ACK_ERR};
use crate::model::{DetectionRequest, DetectionResponse, EntityFeatures, EntityKey, EntityScore};
use crate::ring::HashRing;
use crate::state::{DetectionStateHandler, StateManager};
use crate::stats::DetectionStats;
use crate::store::FeatureStore;
use crate::transport::{EntityBatchRequest, SubRequestTransport};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{Instrument, debug, error, info_span, warn};
use uuid::Uuid;

/// Partial result of one node: the most anomalous entity it scored
#[derive(Debug, Clone, Default)]
pub struct NodeResult {
    pub top: Option<EntityScore>,
    pub entities: usize,
}

impl NodeResult {
    pub fn from_scores(scores: Vec<EntityScore>) -> Self {
        let entities = scores.len();
        let top = scores.into_iter().reduce(more_anomalous);
        Self { top, entities }
    }
}

fn more_anomalous(a: EntityScore, b: EntityScore) -> EntityScore {
    let key = |s: &EntityScore| (s.grade, s.score);
    let (ka, kb) = (key(&a), key(&b));
    match ka.0.total_cmp(&kb.0).then(ka.1.total_cmp(&kb.1)) {
        std::cmp::Ordering::Less => b,
        std::cmp::Ordering::Greater => a,
        // Ties resolve on the entity so merge order never matters
        std::cmp::Ordering::Equal => {
            if a.entity <= b.entity {
                a
            } else {
                b
            }
        }
    }
}

impl Mergeable for NodeResult {
    fn merge(self, other: Self) -> Self {
        let top = match (self.top, other.top) {
            (Some(a), Some(b)) => Some(more_anomalous(a, b)),
            (a, b) => a.or(b),
        };
        Self {
            top,
            entities: self.entities + other.entities,
        }
    }
}

pub struct Dispatcher {
    node_id: String,
    config: DispatchConfig,
    breaker: Arc<CircuitBreakerService>,
    state: Arc<StateManager>,
    state_handler: Option<Arc<DetectionStateHandler>>,
    features: Arc<dyn FeatureStore>,
    ring: Arc<HashRing>,
    transport: Arc<dyn SubRequestTransport>,
    stats: DetectionStats,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: impl Into<String>,
        config: DispatchConfig,
        breaker: Arc<CircuitBreakerService>,
        state: Arc<StateManager>,
        features: Arc<dyn FeatureStore>,
        ring: Arc<HashRing>,
        transport: Arc<dyn SubRequestTransport>,
        stats: DetectionStats,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            config,
            breaker,
            state,
            state_handler: None,
            features,
            ring,
            transport,
            stats,
        }
    }

    /// Persist detector errors through `handler` instead of only remembering them
    pub fn with_state_handler(mut self, handler: Arc<DetectionStateHandler>) -> Self {
        self.state_handler = Some(handler);
        self
    }

    pub fn state(&self) -> &Arc<StateManager> {
        &self.state
    }

    pub async fn execute(
        &self,
        request: DetectionRequest,
    ) -> Result<DetectionResponse, DetectionError> {
        let request_id = Uuid::new_v4();
        let span = info_span!(
            "detect",
            %request_id,
            coordinator = %self.node_id,
            detector_id = %request.detector_id
        );
        async move {
            self.stats.execute_requests.inc();
            let detector_id = request.detector_id.clone();
            let (result, multi_entity) = self.run(request_id, request).await;

            if let Err(e) = &result {
                self.stats.execute_failures.inc();
                if multi_entity {
                    self.stats.hc_execute_failures.inc();
                }
                if e.is_end_run() {
                    error!(error = %e, "Detection ended");
                } else {
                    warn!(error = %e, "Detection failed");
                }
            }
            self.record_outcome(&detector_id, result.as_ref().err()).await;
            result
        }
        .instrument(span)
        .await
    }

    async fn record_outcome(&self, detector_id: &str, error: Option<&DetectionError>) {
        let message = error.map(|e| e.to_string());
        match &self.state_handler {
            Some(handler) => {
                if let Err(e) = handler.save_error(detector_id, message).await {
                    warn!(error = %e, "Failed to save detector state");
                }
            }
            None => self.state.set_last_detection_error(detector_id, message),
        }
    }

    async fn run(
        &self,
        request_id: Uuid,
        request: DetectionRequest,
    ) -> (Result<DetectionResponse, DetectionError>, bool) {
        let detector_id = request.detector_id.as_str();

        // CHECK_BREAKER
        if self.breaker.is_open() {
            self.stats.breaker_rejections.inc();
            return (Err(DetectionError::limit_exceeded(detector_id)), false);
        }

        let detector = match self.state.get_anomaly_detector(detector_id).await {
            Ok(detector) => detector,
            Err(e) => return (Err(e), false),
        };
        let multi_entity = detector.is_multi_entity();
        if multi_entity {
            self.stats.hc_execute_requests.inc();
        }
        if !detector.enabled {
            let error = DetectionError::end_run(detector_id, DETECTOR_DISABLED_MSG, true);
            return (Err(error), multi_entity);
        }

        // CHECK_STATE
        if let Some(e) = self.state.fetch_cold_start_exception(detector_id) {
            return (Err(e), multi_entity);
        }

        // FETCH_FEATURES
        let features = match self
            .features
            .features_by_entities(&detector, request.start, request.end)
            .await
        {
            Ok(features) => features,
            Err(e) => {
                let e = e.classify(detector_id);
                if e.is_end_run() {
                    self.state.set_cold_start_exception(detector_id, e.clone());
                }
                return (Err(e), multi_entity);
            }
        };
        if features.is_empty() {
            debug!("No feature data in window");
            return (Ok(DetectionResponse::empty()), multi_entity);
        }

        // ROUTE_AND_FANOUT
        let ring = self.ring.snapshot();
        let mut groups: HashMap<String, Vec<EntityFeatures>> = HashMap::new();
        let mut unroutable = Vec::new();
        for (entity, vector) in features {
            let key = EntityKey::new(detector_id, &entity).model_id();
            match ring.route(&key) {
                Some(node) => groups.entry(node.to_string()).or_default().push(EntityFeatures {
                    entity,
                    features: vector,
                }),
                None => unroutable.push(entity),
            }
        }
        debug!(nodes = groups.len(), unroutable = unroutable.len(), "Fanning out");

        let expected = groups.len() + unroutable.len();
        let (aggregator, terminal) = ResultAggregator::<NodeResult, DetectionError>::with_channel(
            expected,
            ALL_NODES_FAILED_MSG,
            self.config.return_on_partial_results,
        );
        let aggregator = Arc::new(aggregator);

        for entity in unroutable {
            aggregator.on_failure(DetectionError::Routing {
                detector_id: detector_id.to_string(),
                entity: entity.to_string(),
            });
        }

        let mut tasks = Vec::with_capacity(groups.len());
        for (node, entities) in groups {
            let batch = EntityBatchRequest {
                request_id,
                detector_id: detector_id.to_string(),
                start: request.start,
                end: request.end,
                entities,
            };
            tasks.push(tokio::spawn(
                self.sub_request(node, batch, aggregator.clone()).in_current_span(),
            ));
        }

        // AWAIT_SUBRESPONSES
        for joined in futures::future::join_all(tasks).await {
            if let Err(e) = joined {
                // A crashed sub-request still counts toward N
                aggregator.on_failure(DetectionError::InternalFailure {
                    detector_id: detector_id.to_string(),
                    message: e.to_string(),
                });
            }
        }

        // MERGE
        let merged = match terminal.await {
            Ok(merged) => merged,
            Err(_) => {
                return (
                    Err(DetectionError::InternalFailure {
                        detector_id: detector_id.to_string(),
                        message: "aggregation ended without a result".into(),
                    }),
                    multi_entity,
                );
            }
        };

        // RESPOND
        let result = match merged {
            Ok(node_result) => Ok(match node_result.top {
                Some(top) => DetectionResponse {
                    anomaly_grade: top.grade,
                    anomaly_score: top.score,
                    confidence: top.confidence,
                    error: None,
                },
                None => DetectionResponse::empty(),
            }),
            Err(e) => Err(classify_aggregate(detector_id, e)),
        };
        (result, multi_entity)
    }

    /// One sub-request; always reports exactly once into the aggregator
    fn sub_request(
        &self,
        node: String,
        batch: EntityBatchRequest,
        aggregator: Arc<ResultAggregator<NodeResult, DetectionError>>,
    ) -> impl Future<Output = ()> + Send + 'static {
        let state = self.state.clone();
        let transport = self.transport.clone();
        let timeout = self.config.sub_request_timeout();
        let timeout_ms = self.config.sub_request_timeout_ms;

        async move {
            if state.is_muted(&node) {
                aggregator.on_failure(DetectionError::NodeMuted { node });
                return;
            }
            let detector_id = batch.detector_id.clone();
            match tokio::time::timeout(timeout, transport.send(&node, batch)).await {
                Err(_) => aggregator.on_failure(DetectionError::Timeout { node, timeout_ms }),
                Ok(Err(e)) => aggregator.on_failure(e),
                Ok(Ok(response)) if !response.acknowledged => {
                    state.add_pressure(&node);
                    aggregator.on_failure(DetectionError::no_ack(detector_id));
                }
                Ok(Ok(response)) => {
                    state.reset_pressure(&node);
                    aggregator.on_response(NodeResult::from_scores(response.scores));
                }
            }
        }
    }
}

/// Surface the most actionable cause of an aggregate failure
fn classify_aggregate(detector_id: &str, error: AggregateError<DetectionError>) -> DetectionError {
    let errors = error.errors();
    if let Some(limit) = errors.iter().find(|e| matches!(e, DetectionError::LimitExceeded { .. })) {
        return limit.clone();
    }
    if let Some(end_run) = errors.iter().find(|e| e.is_end_run()) {
        return end_run.clone();
    }
    let not_acknowledged = errors
        .iter()
        .any(|e| {
            matches!(e, DetectionError::InternalFailure { message, .. } if message == NO_ACK_ERR)
        });
    if not_acknowledged {
        return DetectionError::no_ack(detector_id);
    }
    match error {
        AggregateError::NoResponse { .. } => DetectionError::NoResponse,
        AggregateError::Failed { message, .. } => DetectionError::Aggregated(message),
    }
}
