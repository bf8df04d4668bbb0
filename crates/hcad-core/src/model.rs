//! Core data model
//!
//! Detector configuration is owned by external storage and is read-only here.
//! An `Entity` has no identity outside its detector; its derived id is a hash
//! of the detector id and the category values. `ModelState` is the mutable
//! per-entity snapshot owned by exactly one cache entry.

use crate::scorer::FeatureModel;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use xxhash_rust::xxh3::Xxh3;

// ============================================================================
// DETECTOR
// ============================================================================

/// One feature extracted per detection interval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub name: String,
    /// Aggregation applied to the source field (e.g. `avg(latency)`)
    pub aggregation: String,
    pub enabled: bool,
}

/// Detector definition as stored in configuration storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detector {
    pub id: String,
    pub name: String,
    pub features: Vec<Feature>,
    /// Fields whose value tuple identifies an entity
    pub category_fields: Vec<String>,
    pub enabled: bool,
    pub interval_secs: u64,
}

impl Detector {
    pub fn new(id: impl Into<String>, category_fields: Vec<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            features: Vec::new(),
            category_fields,
            enabled: true,
            interval_secs: 60,
        }
    }

    pub fn with_feature(mut self, name: &str, aggregation: &str) -> Self {
        self.features.push(Feature {
            name: name.to_string(),
            aggregation: aggregation.to_string(),
            enabled: true,
        });
        self
    }

    pub fn is_multi_entity(&self) -> bool {
        !self.category_fields.is_empty()
    }

    pub fn enabled_features(&self) -> impl Iterator<Item = &Feature> {
        self.features.iter().filter(|f| f.enabled)
    }
}

// ============================================================================
// ENTITY
// ============================================================================

/// Category-field values identifying one time series inside a detector
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Entity {
    /// (field, value) pairs sorted by field
    attributes: Vec<(String, String)>,
}

impl Entity {
    pub fn new<I, K, V>(attributes: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut attributes: Vec<(String, String)> = attributes
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        attributes.sort();
        Self { attributes }
    }

    pub fn single(field: &str, value: &str) -> Self {
        Self::new([(field, value)])
    }

    pub fn attributes(&self) -> &[(String, String)] {
        &self.attributes
    }

    /// Derived identifier: hash(detector_id, category values)
    pub fn id_within(&self, detector_id: &str) -> EntityId {
        let mut hasher = Xxh3::new();
        hash_part(&mut hasher, detector_id);
        for (field, value) in &self.attributes {
            hash_part(&mut hasher, field);
            hash_part(&mut hasher, value);
        }
        EntityId(hasher.digest())
    }
}

/// Length-prefixed so that no two attribute lists share an encoding
fn hash_part(hasher: &mut Xxh3, part: &str) {
    hasher.update(&(part.len() as u64).to_le_bytes());
    hasher.update(part.as_bytes());
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (field, value)) in self.attributes.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}={}", field, value)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub u64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Cache and checkpoint key: at most one live entry per key per node
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub detector_id: String,
    pub entity_id: EntityId,
}

impl EntityKey {
    pub fn new(detector_id: &str, entity: &Entity) -> Self {
        Self {
            detector_id: detector_id.to_string(),
            entity_id: entity.id_within(detector_id),
        }
    }

    /// Routing key hashed onto the ring
    pub fn model_id(&self) -> String {
        format!("{}_entity_{}", self.detector_id, self.entity_id)
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.detector_id, self.entity_id)
    }
}

/// Feature values of one entity for one interval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityFeatures {
    pub entity: Entity,
    pub features: Vec<f64>,
}

// ============================================================================
// MODEL STATE
// ============================================================================

/// Mutable per-entity model snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelState {
    pub detector_id: String,
    pub entity: Entity,
    pub model: FeatureModel,
    pub last_used: DateTime<Utc>,
    pub last_checkpoint: Option<DateTime<Utc>>,
}

impl ModelState {
    pub fn new(detector_id: &str, entity: Entity, model: FeatureModel) -> Self {
        Self {
            detector_id: detector_id.to_string(),
            entity,
            model,
            last_used: Utc::now(),
            last_checkpoint: None,
        }
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(&self.detector_id, &self.entity)
    }
}

// ============================================================================
// REQUEST / RESPONSE
// ============================================================================

/// Top-level detection request for one interval of one detector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRequest {
    pub detector_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DetectionRequest {
    pub fn new(detector_id: impl Into<String>, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            detector_id: detector_id.into(),
            start,
            end,
        }
    }
}

/// Merged outcome of a detection run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResponse {
    pub anomaly_grade: f64,
    pub anomaly_score: f64,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DetectionResponse {
    /// Response for a window without any feature data
    pub fn empty() -> Self {
        Self {
            anomaly_grade: f64::NAN,
            anomaly_score: f64::NAN,
            confidence: f64::NAN,
            error: None,
        }
    }
}

/// Score of one entity for one interval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityScore {
    pub entity: Entity,
    pub score: f64,
    pub grade: f64,
    pub confidence: f64,
}

/// Result record written to the result index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyResult {
    pub detector_id: String,
    pub entity: Option<Entity>,
    pub anomaly_score: f64,
    pub anomaly_grade: f64,
    pub confidence: f64,
    pub feature_data: Vec<f64>,
    pub data_start_time: DateTime<Utc>,
    pub data_end_time: DateTime<Utc>,
    pub execution_start_time: DateTime<Utc>,
    pub execution_end_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AnomalyResult {
    /// Results with a zero grade are dropped first under write pressure
    pub fn is_essential(&self) -> bool {
        self.anomaly_grade > 0.0 || self.error.is_some()
    }
}

/// Persisted detector error state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorInternalState {
    pub last_update_time: DateTime<Utc>,
    pub error: Option<String>,
}

// ============================================================================
// JOB
// ============================================================================

/// Periodic detection job parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorJob {
    pub name: String,
    pub interval_secs: u64,
    /// Delay applied to the window end to let late data arrive
    pub window_delay_secs: u64,
    pub enabled: bool,
    pub enabled_time: Option<DateTime<Utc>>,
    pub disabled_time: Option<DateTime<Utc>>,
    pub last_update_time: DateTime<Utc>,
    pub lock_duration_secs: u64,
}

impl DetectorJob {
    pub fn new(name: impl Into<String>, interval_secs: u64) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            interval_secs,
            window_delay_secs: 0,
            enabled: true,
            enabled_time: Some(now),
            disabled_time: None,
            last_update_time: now,
            lock_duration_secs: interval_secs,
        }
    }

    /// The `[start, end)` window a run triggered at `now` should score
    pub fn detection_window(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let end = now - Duration::seconds(self.window_delay_secs as i64);
        let start = end - Duration::seconds(self.interval_secs as i64);
        (start, end)
    }

    pub fn disable(&mut self, now: DateTime<Utc>) {
        self.enabled = false;
        self.disabled_time = Some(now);
        self.last_update_time = now;
    }
}
