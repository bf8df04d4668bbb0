//! Node-to-node sub-requests
//!
//! The coordinator sends each owning node one `EntityBatchRequest` carrying
//! the feature vectors of the entities it owns. The node answers with
//! per-entity scores, or with `acknowledged == false` when it cannot take the
//! batch. Timeouts are applied by the caller around `send`.

use crate::error::DetectionError;
use crate::model::{EntityFeatures, EntityScore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityBatchRequest {
    pub request_id: Uuid,
    pub detector_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub entities: Vec<EntityFeatures>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityBatchResponse {
    pub acknowledged: bool,
    pub scores: Vec<EntityScore>,
}

impl EntityBatchResponse {
    pub fn acknowledged(scores: Vec<EntityScore>) -> Self {
        Self {
            acknowledged: true,
            scores,
        }
    }

    pub fn not_acknowledged() -> Self {
        Self::default()
    }
}

#[async_trait]
pub trait SubRequestTransport: Send + Sync {
    async fn send(
        &self,
        node: &str,
        request: EntityBatchRequest,
    ) -> Result<EntityBatchResponse, DetectionError>;
}

/// Receiving side of a sub-request
#[async_trait]
pub trait BatchHandler: Send + Sync {
    async fn handle(
        &self,
        request: EntityBatchRequest,
    ) -> Result<EntityBatchResponse, DetectionError>;
}

/// In-process transport routing to registered handlers, with injectable latency
#[derive(Default)]
pub struct LocalTransport {
    handlers: DashMap<String, Arc<dyn BatchHandler>>,
    delays: DashMap<String, Duration>,
    sent: AtomicU64,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, node: &str, handler: Arc<dyn BatchHandler>) {
        self.handlers.insert(node.to_string(), handler);
    }

    pub fn unregister(&self, node: &str) {
        self.handlers.remove(node);
    }

    /// Delay every batch sent to `node`
    pub fn set_delay(&self, node: &str, delay: Duration) {
        self.delays.insert(node.to_string(), delay);
    }

    pub fn clear_delay(&self, node: &str) {
        self.delays.remove(node);
    }

    /// Batches sent so far, including ones that failed
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl SubRequestTransport for LocalTransport {
    async fn send(
        &self,
        node: &str,
        request: EntityBatchRequest,
    ) -> Result<EntityBatchResponse, DetectionError> {
        self.sent.fetch_add(1, Ordering::Relaxed);
        let delay = self.delays.get(node).map(|d| *d);
        let handler = self.handlers.get(node).map(|h| h.value().clone());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match handler {
            Some(handler) => handler.handle(request).await,
            None => Err(DetectionError::NodeUnavailable { node: node.to_string() }),
        }
    }
}
