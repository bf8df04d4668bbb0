//! Anomaly scoring
//!
//! The statistical model is opaque to the pipeline: a scorer turns a feature
//! vector into `(score, grade, confidence)` and mutates the model it was given.
//! `EwmaScorer` is the reference implementation: one exponentially weighted
//! mean/variance tracker per feature, scored by the largest absolute z-score.

use serde::{Deserialize, Serialize};

/// Exponentially weighted mean and variance of one feature
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Ewma {
    alpha: f64,
    mean: f64,
    variance: f64,
    initialized: bool,
}

impl Ewma {
    pub fn new(half_life: f64) -> Self {
        let alpha = 1.0 - (-std::f64::consts::LN_2 / half_life).exp();
        Self {
            alpha,
            mean: 0.0,
            variance: 0.0,
            initialized: false,
        }
    }

    pub fn update(&mut self, sample: f64) {
        if !self.initialized {
            self.mean = sample;
            self.variance = 0.0;
            self.initialized = true;
        } else {
            let diff = sample - self.mean;
            self.mean += self.alpha * diff;
            self.variance = (1.0 - self.alpha) * (self.variance + self.alpha * diff * diff);
        }
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn std_dev(&self) -> f64 {
        self.variance.sqrt()
    }

    /// Distance of `sample` from the mean in standard deviations
    fn z_score(&self, sample: f64) -> f64 {
        if !self.initialized {
            return 0.0;
        }
        let std = self.std_dev().max(1e-9);
        ((sample - self.mean) / std).abs()
    }
}

/// Per-entity model weights
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FeatureModel {
    trackers: Vec<Ewma>,
    samples: u64,
}

impl FeatureModel {
    pub fn feature_count(&self) -> usize {
        self.trackers.len()
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }
}

/// Output of one scoring call
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreOutcome {
    pub score: f64,
    /// 0.0 when normal, up to 1.0 for severe anomalies
    pub grade: f64,
    pub confidence: f64,
}

pub trait AnomalyScorer: Send + Sync {
    /// Fresh model for a cold-start entity
    fn new_model(&self, feature_count: usize) -> FeatureModel;

    /// Score `features` and fold them into `model`
    fn score(&self, model: &mut FeatureModel, features: &[f64]) -> ScoreOutcome;
}

#[derive(Debug, Clone)]
pub struct EwmaScorer {
    pub half_life: f64,
    /// z-score at which grading starts
    pub threshold: f64,
    /// Samples observed before grades are emitted
    pub min_samples: u64,
}

impl Default for EwmaScorer {
    fn default() -> Self {
        Self {
            half_life: 30.0,
            threshold: 3.0,
            min_samples: 32,
        }
    }
}

impl EwmaScorer {
    pub fn with_min_samples(min_samples: u64) -> Self {
        Self {
            min_samples,
            ..Self::default()
        }
    }
}

impl AnomalyScorer for EwmaScorer {
    fn new_model(&self, feature_count: usize) -> FeatureModel {
        FeatureModel {
            trackers: (0..feature_count).map(|_| Ewma::new(self.half_life)).collect(),
            samples: 0,
        }
    }

    fn score(&self, model: &mut FeatureModel, features: &[f64]) -> ScoreOutcome {
        // Feature set changed under the detector: start over
        if model.trackers.len() != features.len() {
            *model = self.new_model(features.len());
        }

        let score = model
            .trackers
            .iter()
            .zip(features)
            .filter(|(_, v)| v.is_finite())
            .map(|(t, v)| t.z_score(*v))
            .fold(0.0_f64, f64::max);

        for (tracker, value) in model.trackers.iter_mut().zip(features) {
            if value.is_finite() {
                tracker.update(*value);
            }
        }
        model.samples += 1;

        let warm = model.samples > self.min_samples;
        let grade = if warm && score > self.threshold {
            ((score - self.threshold) / self.threshold).min(1.0)
        } else {
            0.0
        };
        let confidence = if self.min_samples == 0 {
            1.0
        } else {
            (model.samples as f64 / self.min_samples as f64).min(1.0)
        };

        ScoreOutcome {
            score,
            grade,
            confidence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ewma_tracks_mean() {
        let mut ewma = Ewma::new(5.0);
        for _ in 0..100 {
            ewma.update(10.0);
        }
        assert!((ewma.mean() - 10.0).abs() < 1e-9);
        assert!(ewma.std_dev() < 1e-9);
    }

    #[test]
    fn test_no_grade_during_warmup() {
        let scorer = EwmaScorer::with_min_samples(10);
        let mut model = scorer.new_model(1);
        scorer.score(&mut model, &[1.0]);
        let outcome = scorer.score(&mut model, &[1000.0]);
        assert_eq!(outcome.grade, 0.0);
        assert!(outcome.confidence < 1.0);
    }

    #[test]
    fn test_spike_is_graded_after_warmup() {
        let scorer = EwmaScorer::with_min_samples(10);
        let mut model = scorer.new_model(2);
        for i in 0..50 {
            let jitter = if i % 2 == 0 { 0.5 } else { -0.5 };
            let outcome = scorer.score(&mut model, &[10.0 + jitter, 5.0]);
            if i > 20 {
                assert_eq!(outcome.grade, 0.0);
            }
        }
        let outcome = scorer.score(&mut model, &[100.0, 5.0]);
        assert!(outcome.grade > 0.0);
        assert!(outcome.grade <= 1.0);
        assert_eq!(outcome.confidence, 1.0);
    }

    #[test]
    fn test_feature_count_change_resets_model() {
        let scorer = EwmaScorer::default();
        let mut model = scorer.new_model(1);
        scorer.score(&mut model, &[1.0]);
        scorer.score(&mut model, &[1.0, 2.0, 3.0]);
        assert_eq!(model.feature_count(), 3);
        assert_eq!(model.samples(), 1);
    }
}
