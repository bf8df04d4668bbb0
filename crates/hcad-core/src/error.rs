//! Error taxonomy for the detection pipeline
//!
//! Errors fall into four families:
//! - **Transient**: routing misses, sub-request timeouts, muted nodes. They are
//!   folded into partial-failure accounting and never abort a whole request.
//! - **End-run**: conditions that keep failing until someone fixes them
//!   (malformed query, missing index, disabled detector). They are remembered
//!   by the `StateManager` so later requests short-circuit.
//! - **Resource exhaustion**: circuit breaker open, reported as limit exceeded.
//! - **Acknowledgement failure**: a peer refused an entity batch.

use thiserror::Error;

pub const MEMORY_CIRCUIT_BROKEN_ERR_MSG: &str = "Memory circuit is broken.";
pub const INVALID_SEARCH_QUERY_MSG: &str = "Invalid search query.";
pub const TROUBLE_QUERYING_ERR_MSG: &str = "Having trouble querying data: ";
pub const NO_ACK_ERR: &str = "no acknowledgements from model hosting nodes.";
pub const NO_RESPONSE: &str = "No response collected";
pub const DETECTOR_DISABLED_MSG: &str = "Detector is disabled.";
pub const ALL_NODES_FAILED_MSG: &str = "Failed to get results from model hosting nodes.";

/// User-visible failure of a detection run or one of its sub-requests.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DetectionError {
    #[error("{message}")]
    LimitExceeded { detector_id: String, message: String },

    #[error("{message}")]
    EndRun {
        detector_id: String,
        message: String,
        /// Whether the caller should stop the detector job right away
        end_now: bool,
    },

    #[error("{message}")]
    InternalFailure { detector_id: String, message: String },

    #[error("no eligible node owns entity {entity} of detector {detector_id}")]
    Routing { detector_id: String, entity: String },

    #[error("sub-request to node {node} timed out after {timeout_ms}ms")]
    Timeout { node: String, timeout_ms: u64 },

    #[error("node {node} is muted after repeated backpressure")]
    NodeMuted { node: String },

    #[error("node {node} is not reachable")]
    NodeUnavailable { node: String },

    #[error("{0}")]
    Aggregated(String),

    #[error("No response collected")]
    NoResponse,

    #[error("detector {0} not found")]
    DetectorNotFound(String),

    #[error("feature query failed for detector {detector_id}: {message}")]
    FeatureQuery { detector_id: String, message: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("a historical run is already active for detector {0}")]
    TaskRunning(String),
}

impl DetectionError {
    pub fn limit_exceeded(detector_id: impl Into<String>) -> Self {
        Self::LimitExceeded {
            detector_id: detector_id.into(),
            message: MEMORY_CIRCUIT_BROKEN_ERR_MSG.to_string(),
        }
    }

    pub fn end_run(
        detector_id: impl Into<String>,
        message: impl Into<String>,
        end_now: bool,
    ) -> Self {
        Self::EndRun {
            detector_id: detector_id.into(),
            message: message.into(),
            end_now,
        }
    }

    pub fn no_ack(detector_id: impl Into<String>) -> Self {
        Self::InternalFailure {
            detector_id: detector_id.into(),
            message: NO_ACK_ERR.to_string(),
        }
    }

    /// End-run errors keep recurring until corrected externally
    pub fn is_end_run(&self) -> bool {
        matches!(self, Self::EndRun { .. })
    }

    /// Transient conditions that a later run may not hit again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Routing { .. }
                | Self::Timeout { .. }
                | Self::NodeMuted { .. }
                | Self::NodeUnavailable { .. }
                | Self::FeatureQuery { .. }
                | Self::Storage(_)
        )
    }
}

/// Failure reported by the feature query service.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FeatureError {
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("index not found: {0}")]
    IndexNotFound(String),
    #[error("{0}")]
    Other(String),
}

impl FeatureError {
    /// Map a feature fetch failure onto the detection taxonomy.
    pub fn classify(self, detector_id: &str) -> DetectionError {
        match self {
            Self::InvalidQuery(_) => {
                DetectionError::end_run(detector_id, INVALID_SEARCH_QUERY_MSG, false)
            }
            Self::IndexNotFound(index) => DetectionError::end_run(
                detector_id,
                format!("{}{}", TROUBLE_QUERYING_ERR_MSG, index),
                true,
            ),
            Self::Other(message) => DetectionError::FeatureQuery {
                detector_id: detector_id.to_string(),
                message,
            },
        }
    }
}

/// Errors raised while reading, writing or decoding checkpoints.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CheckpointError {
    #[error("serialization failed: {0}")]
    SerializationFailed(String),
    #[error("deserialization failed: {0}")]
    DeserializationFailed(String),
    #[error("unsupported checkpoint version: {found} (max supported: {max_supported})")]
    UnsupportedVersion { found: u32, max_supported: u32 },
    #[error("checkpoint index not found: {0}")]
    IndexNotFound(String),
    #[error("checkpoint store error: {0}")]
    Store(String),
}

impl CheckpointError {
    /// A missing checkpoint index will not heal by retrying
    pub fn is_end_run(&self) -> bool {
        matches!(self, Self::IndexNotFound(_))
    }
}

/// Errors returned by the result index.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IndexError {
    #[error("no requests added")]
    EmptyBulk,
    #[error("write throttled: {0}")]
    Throttled(String),
    #[error("index error: {0}")]
    Other(String),
}

/// Errors raised while sampling a breaker's resource signal.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BreakerError {
    #[error("failed to sample {resource}: {reason}")]
    Sample { resource: String, reason: String },
}

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load config: {0}")]
    Load(#[from] ::config::ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_error_classification() {
        let err = FeatureError::InvalidQuery("bad agg".into()).classify("d1");
        assert!(err.is_end_run());
        assert_eq!(err.to_string(), INVALID_SEARCH_QUERY_MSG);

        let err = FeatureError::IndexNotFound("metrics-*".into()).classify("d1");
        assert!(matches!(err, DetectionError::EndRun { end_now: true, .. }));
        assert!(err.to_string().starts_with(TROUBLE_QUERYING_ERR_MSG));

        let err = FeatureError::Other("shard failure".into()).classify("d1");
        assert!(!err.is_end_run());
        assert!(err.is_retryable());
    }

    #[test]
    fn test_retryable_classes() {
        assert!(
            DetectionError::Timeout {
                node: "n1".into(),
                timeout_ms: 10
            }
            .is_retryable()
        );
        assert!(!DetectionError::limit_exceeded("d1").is_retryable());
        assert!(!DetectionError::no_ack("d1").is_retryable());
        assert_eq!(DetectionError::no_ack("d1").to_string(), NO_ACK_ERR);
    }
}
