//! Synthetic feature data
//!
//! Stands in for the search backend that aggregates raw documents into
//! per-entity feature vectors. Every entity gets a log-normal baseline per
//! feature; each query draws noisy samples around it and, with a configurable
//! probability, multiplies one entity's sample into a spike. Injected spikes
//! are counted as ground truth.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hcad_core::model::{Detector, Entity};
use hcad_core::store::{EntityFeatureMap, FeatureStore};
use hcad_core::FeatureError;
use parking_lot::Mutex;
use rand::Rng;
use rand::distr::Distribution;
use rand_distr::{LogNormal, Normal};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    /// Distinct entities reported per multi-entity detector
    pub entities_per_detector: usize,
    /// Parameters of the log-normal baseline distribution
    pub baseline_mu: f64,
    pub baseline_sigma: f64,
    /// Relative standard deviation of samples around the baseline
    pub noise: f64,
    /// Probability that an entity's sample is a spike
    pub anomaly_rate: f64,
    pub anomaly_magnitude: f64,
    /// Probability that a whole query fails
    pub query_failure_rate: f64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            entities_per_detector: 200,
            baseline_mu: 4.0,
            baseline_sigma: 0.5,
            noise: 0.05,
            anomaly_rate: 0.005,
            anomaly_magnitude: 8.0,
            query_failure_rate: 0.0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GeneratorStats {
    pub queries: u64,
    pub failed_queries: u64,
    pub samples: u64,
    pub injected_anomalies: u64,
}

pub struct SyntheticFeatureStore {
    config: GeneratorConfig,
    baselines: Mutex<HashMap<(String, Entity), Vec<f64>>>,
    queries: AtomicU64,
    failed_queries: AtomicU64,
    samples: AtomicU64,
    injected: AtomicU64,
}

impl SyntheticFeatureStore {
    pub fn new(config: GeneratorConfig) -> Self {
        Self {
            config,
            baselines: Mutex::new(HashMap::new()),
            queries: AtomicU64::new(0),
            failed_queries: AtomicU64::new(0),
            samples: AtomicU64::new(0),
            injected: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> GeneratorStats {
        GeneratorStats {
            queries: self.queries.load(Ordering::Relaxed),
            failed_queries: self.failed_queries.load(Ordering::Relaxed),
            samples: self.samples.load(Ordering::Relaxed),
            injected_anomalies: self.injected.load(Ordering::Relaxed),
        }
    }

    /// Entities a detector reports: one per index, or a single unnamed one
    fn entities(&self, detector: &Detector) -> Vec<Entity> {
        if !detector.is_multi_entity() {
            return vec![Entity::new(Vec::<(String, String)>::new())];
        }
        (0..self.config.entities_per_detector)
            .map(|i| {
                Entity::new(
                    detector
                        .category_fields
                        .iter()
                        .map(|field| (field.clone(), format!("{}-{:04}", field, i))),
                )
            })
            .collect()
    }

    fn baseline(
        &self,
        detector: &Detector,
        entity: &Entity,
        features: usize,
    ) -> Result<Vec<f64>, FeatureError> {
        let key = (detector.id.clone(), entity.clone());
        let mut baselines = self.baselines.lock();
        if let Some(existing) = baselines.get(&key).filter(|b| b.len() == features) {
            return Ok(existing.clone());
        }
        let dist = LogNormal::new(self.config.baseline_mu, self.config.baseline_sigma)
            .map_err(|e| FeatureError::Other(format!("bad baseline distribution: {}", e)))?;
        let mut rng = rand::rng();
        let baseline: Vec<f64> = (0..features).map(|_| dist.sample(&mut rng)).collect();
        baselines.insert(key, baseline.clone());
        Ok(baseline)
    }

    fn sample(&self, baseline: &[f64]) -> Result<Vec<f64>, FeatureError> {
        let mut rng = rand::rng();
        let spike = rng.random_bool(self.config.anomaly_rate.clamp(0.0, 1.0));
        if spike {
            self.injected.fetch_add(1, Ordering::Relaxed);
        }
        baseline
            .iter()
            .map(|mean| -> Result<f64, FeatureError> {
                let normal = Normal::new(*mean, mean.abs() * self.config.noise)
                    .map_err(|e| FeatureError::Other(format!("bad noise distribution: {}", e)))?;
                let value = normal.sample(&mut rng);
                Ok(if spike { value * self.config.anomaly_magnitude } else { value })
            })
            .collect()
    }
}

#[async_trait]
impl FeatureStore for SyntheticFeatureStore {
    async fn features_by_entities(
        &self,
        detector: &Detector,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> Result<EntityFeatureMap, FeatureError> {
        self.queries.fetch_add(1, Ordering::Relaxed);
        if rand::rng().random_bool(self.config.query_failure_rate.clamp(0.0, 1.0)) {
            self.failed_queries.fetch_add(1, Ordering::Relaxed);
            return Err(FeatureError::Other("synthetic query failure".into()));
        }

        let features = detector.enabled_features().count();
        if features == 0 {
            return Ok(EntityFeatureMap::new());
        }

        let mut out = EntityFeatureMap::new();
        for entity in self.entities(detector) {
            let baseline = self.baseline(detector, &entity, features)?;
            out.insert(entity, self.sample(&baseline)?);
        }
        self.samples.fetch_add(out.len() as u64, Ordering::Relaxed);
        Ok(out)
    }
}
