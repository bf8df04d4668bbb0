//! Runtime configuration
//!
//! Every tunable lives in a per-concern struct with a `Default`. `HcadConfig`
//! is layered with the `config` crate: defaults first, then an optional file,
//! then `HCAD_*` environment variables. Any field missing from a layer keeps
//! the value below it.

use crate::error::ConfigError;
use ::config::{Config, Environment, File, FileFormat, Map, Source};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration for the resource circuit breakers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Administrative switch; when false no breaker ever rejects work
    pub enabled: bool,
    /// Memory usage (percent of total) above which the memory breaker opens
    pub memory_threshold_percent: f64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            memory_threshold_percent: 85.0,
        }
    }
}

/// Configuration for the consistent hash ring
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RingConfig {
    /// Virtual positions per physical node
    pub virtual_nodes_per_node: usize,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            virtual_nodes_per_node: 100,
        }
    }
}

/// Configuration for the per-node entity cache
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum live entities on this node
    pub max_entities: usize,
    /// Optional cap on live entities of a single detector
    pub max_entities_per_detector: Option<usize>,
    /// Entities idle longer than this are evicted during maintenance
    pub entity_ttl_secs: u64,
    /// Live entities are checkpointed at least this often
    pub checkpoint_interval_secs: u64,
    /// Samples a fresh model must observe before it grades anomalies
    pub cold_start_min_samples: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entities: 10_000,
            max_entities_per_detector: None,
            entity_ttl_secs: 3600,
            checkpoint_interval_secs: 600,
            cold_start_min_samples: 32,
        }
    }
}

impl CacheConfig {
    pub fn entity_ttl(&self) -> Duration {
        Duration::from_secs(self.entity_ttl_secs)
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_interval_secs)
    }
}

/// Configuration for the background checkpoint writer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub max_retries: u32,
    /// First retry delay; doubled on every further attempt
    pub retry_base_delay_ms: u64,
    /// Upper bound of a single retry delay
    pub max_retry_delay_ms: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_delay_ms: 100,
            max_retry_delay_ms: 10_000,
        }
    }
}

impl CheckpointConfig {
    /// Backoff before retry number `attempt + 1`
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt);
        let delay = self.retry_base_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_retry_delay_ms))
    }
}

/// Configuration for fan-out dispatch
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Timeout applied to every sub-request independently
    pub sub_request_timeout_ms: u64,
    /// Merge whatever succeeded even when some sub-requests failed
    pub return_on_partial_results: bool,
    /// Entity batches a worker accepts concurrently before refusing
    pub max_concurrent_batches_per_node: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            sub_request_timeout_ms: 10_000,
            return_on_partial_results: true,
            max_concurrent_batches_per_node: 64,
        }
    }
}

impl DispatchConfig {
    pub fn sub_request_timeout(&self) -> Duration {
        Duration::from_millis(self.sub_request_timeout_ms)
    }
}

/// Configuration for transient per-detector state
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// How long a fetched detector definition is reused
    pub detector_cache_ttl_secs: u64,
    /// How long a cached end-run error short-circuits new requests
    pub end_run_error_ttl_secs: u64,
    /// Idle runtime states are dropped after this long
    pub state_ttl_secs: u64,
    /// Consecutive backpressure signals before a node is muted
    pub max_retry_for_unresponsive_node: u32,
    /// How long a muted node is skipped
    pub backpressure_mute_secs: u64,
    /// Window after a throttled write during which optional writes are skipped
    pub index_throttle_window_secs: u64,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            detector_cache_ttl_secs: 300,
            end_run_error_ttl_secs: 300,
            state_ttl_secs: 3600,
            max_retry_for_unresponsive_node: 5,
            backpressure_mute_secs: 60,
            index_throttle_window_secs: 60,
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HcadConfig {
    pub breaker: BreakerConfig,
    pub ring: RingConfig,
    pub cache: CacheConfig,
    pub checkpoint: CheckpointConfig,
    pub dispatch: DispatchConfig,
    pub state: StateConfig,
}

/// Prefix of environment overrides, e.g. `HCAD_CACHE__MAX_ENTITIES=5000`
pub const ENV_PREFIX: &str = "HCAD";

/// `HCAD_<SECTION>__<FIELD>`: a double underscore separates nesting levels
fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

impl HcadConfig {
    /// Load configuration: defaults, then the optional file, then `HCAD_*`
    /// environment variables. The file format follows its extension.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::layered(path.map(File::from), environment())
    }

    /// Defaults overlaid with a JSON document; the environment is not consulted
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        Self::layered(
            Some(File::from_str(raw, FileFormat::Json)),
            environment().source(Some(Map::new())),
        )
    }

    fn layered<S>(file: Option<S>, env: Environment) -> Result<Self, ConfigError>
    where
        S: Source + Send + Sync + 'static,
    {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);
        if let Some(file) = file {
            builder = builder.add_source(file);
        }
        Ok(builder.add_source(env).build()?.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = HcadConfig::from_json_str(r#"{"cache": {"max_entities": 5}}"#).unwrap();
        assert_eq!(config.cache.max_entities, 5);
        assert_eq!(config.cache.entity_ttl_secs, 3600);
        assert!(config.breaker.enabled);
        assert_eq!(config.ring.virtual_nodes_per_node, 100);
    }

    #[test]
    fn test_retry_delay_doubles_and_saturates() {
        let config = CheckpointConfig {
            max_retries: 200,
            retry_base_delay_ms: 100,
            max_retry_delay_ms: 1_000,
        };
        assert_eq!(config.retry_delay(0), Duration::from_millis(100));
        assert_eq!(config.retry_delay(2), Duration::from_millis(400));
        assert_eq!(config.retry_delay(4), Duration::from_millis(1_000));
        assert_eq!(config.retry_delay(64), Duration::from_millis(1_000));
        assert_eq!(config.retry_delay(u32::MAX), Duration::from_millis(1_000));
    }

    fn env(vars: &[(&str, &str)]) -> Environment {
        let vars: Map<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        environment().source(Some(vars))
    }

    #[test]
    fn test_env_overrides() {
        let config = HcadConfig::layered(
            None::<File<::config::FileSourceString, FileFormat>>,
            env(&[
                ("HCAD_BREAKER__ENABLED", "false"),
                ("HCAD_DISPATCH__SUB_REQUEST_TIMEOUT_MS", "250"),
                ("HCAD_STATE__BACKPRESSURE_MUTE_SECS", "7"),
                ("HCAD_CACHE__MAX_ENTITIES_PER_DETECTOR", "40"),
                ("UNRELATED", "x"),
            ]),
        )
        .unwrap();
        assert!(!config.breaker.enabled);
        assert_eq!(config.dispatch.sub_request_timeout(), Duration::from_millis(250));
        assert_eq!(config.state.backpressure_mute_secs, 7);
        assert_eq!(config.cache.max_entities_per_detector, Some(40));
        assert_eq!(config.cache.max_entities, 10_000);
    }

    #[test]
    fn test_env_overrides_file() {
        let raw = r#"{"checkpoint": {"max_retries": 9, "retry_base_delay_ms": 8}}"#;
        let file = File::from_str(raw, FileFormat::Json);
        let config =
            HcadConfig::layered(Some(file), env(&[("HCAD_CHECKPOINT__MAX_RETRIES", "1")])).unwrap();
        assert_eq!(config.checkpoint.max_retries, 1);
        assert_eq!(config.checkpoint.retry_base_delay_ms, 8);
    }

    #[test]
    fn test_invalid_override_rejected() {
        let err = HcadConfig::layered(
            None::<File<::config::FileSourceString, FileFormat>>,
            env(&[("HCAD_CACHE__MAX_ENTITIES", "lots")]),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Load(_)));
    }
}
