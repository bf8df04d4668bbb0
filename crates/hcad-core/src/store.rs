//! External collaborators
//!
//! Detector configuration, feature queries, result indexing and persisted
//! detector state all live outside the core. Each is reached through a small
//! async trait; the in-memory implementations back the simulator and tests.

use crate::error::{DetectionError, FeatureError, IndexError};
use crate::model::{AnomalyResult, Detector, DetectorInternalState, Entity};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

pub type EntityFeatureMap = HashMap<Entity, Vec<f64>>;

#[async_trait]
pub trait DetectorStore: Send + Sync {
    async fn get_detector(&self, detector_id: &str) -> Result<Option<Detector>, DetectionError>;
    /// Returns whether the detector existed
    async fn delete_detector(&self, detector_id: &str) -> Result<bool, DetectionError>;
}

#[async_trait]
pub trait FeatureStore: Send + Sync {
    /// Feature vectors of every entity with data in `[start, end)`
    async fn features_by_entities(
        &self,
        detector: &Detector,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<EntityFeatureMap, FeatureError>;
}

#[async_trait]
pub trait ResultIndexer: Send + Sync {
    async fn bulk_index(&self, request: ResultBulkRequest) -> Result<usize, IndexError>;
}

#[async_trait]
pub trait DetectorStateStore: Send + Sync {
    async fn get_state(
        &self,
        detector_id: &str,
    ) -> Result<Option<DetectorInternalState>, DetectionError>;
    async fn put_state(
        &self,
        detector_id: &str,
        state: DetectorInternalState,
    ) -> Result<(), DetectionError>;
}

/// Batch of results bound for the result index
#[derive(Debug, Clone, Default)]
pub struct ResultBulkRequest {
    results: Vec<AnomalyResult>,
}

impl ResultBulkRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, result: AnomalyResult) {
        self.results.push(result);
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn results(&self) -> &[AnomalyResult] {
        &self.results
    }

    pub fn validate(&self) -> Result<(), IndexError> {
        if self.results.is_empty() {
            return Err(IndexError::EmptyBulk);
        }
        Ok(())
    }

    pub fn into_results(self) -> Vec<AnomalyResult> {
        self.results
    }
}

// ============================================================================
// IN-MEMORY IMPLEMENTATIONS
// ============================================================================

#[derive(Default)]
pub struct InMemoryDetectorStore {
    detectors: DashMap<String, Detector>,
    fetches: AtomicU64,
}

impl InMemoryDetectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, detector: Detector) {
        self.detectors.insert(detector.id.clone(), detector);
    }

    pub fn delete(&self, detector_id: &str) -> Option<Detector> {
        self.detectors.remove(detector_id).map(|(_, d)| d)
    }

    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl DetectorStore for InMemoryDetectorStore {
    async fn get_detector(&self, detector_id: &str) -> Result<Option<Detector>, DetectionError> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        Ok(self.detectors.get(detector_id).map(|d| d.clone()))
    }

    async fn delete_detector(&self, detector_id: &str) -> Result<bool, DetectionError> {
        Ok(self.delete(detector_id).is_some())
    }
}

/// Feature store answering from fixed per-detector fixtures
#[derive(Default)]
pub struct StaticFeatureStore {
    fixtures: DashMap<String, Result<EntityFeatureMap, FeatureError>>,
    queries: AtomicU64,
}

impl StaticFeatureStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_features(&self, detector_id: &str, features: EntityFeatureMap) {
        self.fixtures.insert(detector_id.to_string(), Ok(features));
    }

    pub fn set_error(&self, detector_id: &str, error: FeatureError) {
        self.fixtures.insert(detector_id.to_string(), Err(error));
    }

    pub fn query_count(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl FeatureStore for StaticFeatureStore {
    async fn features_by_entities(
        &self,
        detector: &Detector,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> Result<EntityFeatureMap, FeatureError> {
        self.queries.fetch_add(1, Ordering::Relaxed);
        match self.fixtures.get(&detector.id) {
            Some(fixture) => fixture.clone(),
            None => Ok(EntityFeatureMap::new()),
        }
    }
}

#[derive(Default)]
pub struct InMemoryResultIndex {
    results: Mutex<Vec<AnomalyResult>>,
    throttle_next: AtomicU32,
}

impl InMemoryResultIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the next `n` bulk writes as throttled
    pub fn throttle_next(&self, n: u32) {
        self.throttle_next.store(n, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.results.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.lock().is_empty()
    }

    pub fn results(&self) -> Vec<AnomalyResult> {
        self.results.lock().clone()
    }
}

#[async_trait]
impl ResultIndexer for InMemoryResultIndex {
    async fn bulk_index(&self, request: ResultBulkRequest) -> Result<usize, IndexError> {
        request.validate()?;
        let throttled = self
            .throttle_next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok();
        if throttled {
            return Err(IndexError::Throttled("result index rejected execution".into()));
        }
        let count = request.len();
        self.results.lock().extend(request.into_results());
        Ok(count)
    }
}

#[derive(Default)]
pub struct InMemoryStateStore {
    states: DashMap<String, DetectorInternalState>,
    writes: AtomicU64,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl DetectorStateStore for InMemoryStateStore {
    async fn get_state(
        &self,
        detector_id: &str,
    ) -> Result<Option<DetectorInternalState>, DetectionError> {
        Ok(self.states.get(detector_id).map(|s| s.clone()))
    }

    async fn put_state(
        &self,
        detector_id: &str,
        state: DetectorInternalState,
    ) -> Result<(), DetectionError> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.states.insert(detector_id.to_string(), state);
        Ok(())
    }
}
