//! Transient per-detector and per-node state
//!
//! `StateManager` is a short-lived memo that lets the pipeline skip repeated
//! storage lookups and repeated failing work. Nothing here is persisted; a
//! restart simply starts from empty.
//!
//! Node backpressure: each refused or throttled call adds pressure to a node.
//! Once pressure reaches `max_retry_for_unresponsive_node` the node is muted
//! for `backpressure_mute_secs` and callers skip it. A successful call resets
//! the counter.

use crate::config::StateConfig;
use crate::error::DetectionError;
use crate::model::{Detector, DetectorInternalState};
use crate::store::{DetectorStateStore, DetectorStore};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug)]
struct DetectorRuntimeState {
    detector: Option<(Detector, Instant)>,
    last_error: Option<String>,
    cold_start_exception: Option<(DetectionError, Instant)>,
    /// Throttled result writes since the last clean one
    index_pressure: u32,
    last_access: Instant,
}

impl DetectorRuntimeState {
    fn new() -> Self {
        Self {
            detector: None,
            last_error: None,
            cold_start_exception: None,
            index_pressure: 0,
            last_access: Instant::now(),
        }
    }
}

#[derive(Debug, Default)]
struct NodePressure {
    count: u32,
    muted_until: Option<Instant>,
}

pub struct StateManager {
    config: StateConfig,
    detector_store: Arc<dyn DetectorStore>,
    states: DashMap<String, DetectorRuntimeState>,
    pressure: DashMap<String, NodePressure>,
    last_index_throttled: Mutex<Option<DateTime<Utc>>>,
}

impl StateManager {
    pub fn new(config: StateConfig, detector_store: Arc<dyn DetectorStore>) -> Self {
        Self {
            config,
            detector_store,
            states: DashMap::new(),
            pressure: DashMap::new(),
            last_index_throttled: Mutex::new(None),
        }
    }

    fn with_state<R>(
        &self,
        detector_id: &str,
        f: impl FnOnce(&mut DetectorRuntimeState) -> R,
    ) -> R {
        let mut state = self
            .states
            .entry(detector_id.to_string())
            .or_insert_with(DetectorRuntimeState::new);
        state.last_access = Instant::now();
        f(&mut state)
    }

    /// Detector definition, served from memory while fresh
    pub async fn get_anomaly_detector(
        &self,
        detector_id: &str,
    ) -> Result<Detector, DetectionError> {
        let ttl = Duration::from_secs(self.config.detector_cache_ttl_secs);
        let cached = self.with_state(detector_id, |state| match &state.detector {
            Some((detector, fetched)) if fetched.elapsed() < ttl => Some(detector.clone()),
            _ => None,
        });
        if let Some(detector) = cached {
            return Ok(detector);
        }

        let detector = self
            .detector_store
            .get_detector(detector_id)
            .await?
            .ok_or_else(|| DetectionError::DetectorNotFound(detector_id.to_string()))?;
        self.with_state(detector_id, |state| {
            state.detector = Some((detector.clone(), Instant::now()));
        });
        Ok(detector)
    }

    pub fn get_last_detection_error(&self, detector_id: &str) -> Option<String> {
        self.states.get(detector_id).and_then(|s| s.last_error.clone())
    }

    pub fn set_last_detection_error(&self, detector_id: &str, error: Option<String>) {
        self.with_state(detector_id, |state| state.last_error = error);
    }

    pub fn set_cold_start_exception(&self, detector_id: &str, error: DetectionError) {
        self.with_state(detector_id, |state| {
            state.cold_start_exception = Some((error, Instant::now()));
        });
    }

    /// Pending cold-start failure of the detector, if any.
    ///
    /// End-run errors keep short-circuiting requests until they age out;
    /// any other error is reported once and cleared.
    pub fn fetch_cold_start_exception(&self, detector_id: &str) -> Option<DetectionError> {
        let ttl = Duration::from_secs(self.config.end_run_error_ttl_secs);
        let mut state = self.states.get_mut(detector_id)?;
        let (error, recorded) = state.cold_start_exception.take()?;
        if error.is_end_run() {
            if recorded.elapsed() >= ttl {
                return None;
            }
            state.cold_start_exception = Some((error.clone(), recorded));
        }
        Some(error)
    }

    // ------------------------------------------------------------------------
    // Backpressure
    // ------------------------------------------------------------------------

    pub fn add_pressure(&self, node_id: &str) {
        let mut entry = self.pressure.entry(node_id.to_string()).or_default();
        entry.count += 1;
        if entry.count >= self.config.max_retry_for_unresponsive_node && entry.muted_until.is_none()
        {
            let mute = Duration::from_secs(self.config.backpressure_mute_secs);
            entry.muted_until = Some(Instant::now() + mute);
            warn!(node = node_id, pressure = entry.count, "Muting unresponsive node");
        }
    }

    pub fn reset_pressure(&self, node_id: &str) {
        if let Some((_, previous)) = self.pressure.remove(node_id) {
            if previous.muted_until.is_some() {
                info!(node = node_id, "Node recovered from backpressure");
            }
        }
    }

    pub fn pressure(&self, node_id: &str) -> u32 {
        self.pressure.get(node_id).map(|p| p.count).unwrap_or(0)
    }

    pub fn is_muted(&self, node_id: &str) -> bool {
        let expired = match self.pressure.get(node_id) {
            Some(p) => match p.muted_until {
                Some(until) if Instant::now() < until => return true,
                Some(_) => true,
                None => false,
            },
            None => false,
        };
        if expired {
            // Mute window over: give the node a fresh budget
            self.pressure.remove(node_id);
            debug!(node = node_id, "Node mute expired");
        }
        false
    }

    // ------------------------------------------------------------------------
    // Result index throttling
    // ------------------------------------------------------------------------

    /// Record a throttled result write; returns the detector's new count
    pub fn add_index_pressure(&self, detector_id: &str) -> u32 {
        self.with_state(detector_id, |state| {
            state.index_pressure += 1;
            state.index_pressure
        })
    }

    pub fn reset_index_pressure(&self, detector_id: &str) {
        if let Some(mut state) = self.states.get_mut(detector_id) {
            state.index_pressure = 0;
        }
    }

    pub fn index_pressure(&self, detector_id: &str) -> u32 {
        self.states.get(detector_id).map(|s| s.index_pressure).unwrap_or(0)
    }

    pub fn set_last_index_throttled_time(&self, at: DateTime<Utc>) {
        *self.last_index_throttled.lock() = Some(at);
    }

    pub fn get_last_index_throttled_time(&self) -> Option<DateTime<Utc>> {
        *self.last_index_throttled.lock()
    }

    /// Whether a result write was throttled within the throttle window
    pub fn is_index_throttled_recently(&self) -> bool {
        let window = chrono::Duration::seconds(self.config.index_throttle_window_secs as i64);
        self.get_last_index_throttled_time()
            .is_some_and(|at| Utc::now() - at < window)
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Forget everything about a deleted detector
    pub fn clear(&self, detector_id: &str) {
        if self.states.remove(detector_id).is_some() {
            debug!(detector_id, "Cleared detector runtime state");
        }
    }

    /// Drop runtime states idle longer than the state TTL
    pub fn maintenance(&self) -> usize {
        let ttl = Duration::from_secs(self.config.state_ttl_secs);
        let before = self.states.len();
        self.states.retain(|_, state| state.last_access.elapsed() < ttl);
        let removed = before.saturating_sub(self.states.len());
        if removed > 0 {
            debug!(removed, "Dropped idle detector states");
        }
        removed
    }

    pub fn spawn_maintenance(
        self: Arc<Self>,
        period: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.maintenance();
                    }
                }
            }
        })
    }
}

// ============================================================================
// DETECTION STATE HANDLER
// ============================================================================

/// Decides whether a persisted state must be rewritten for a new error.
/// Returns the state to write, or `None` to leave storage alone.
pub fn error_strategy(
    current: Option<&DetectorInternalState>,
    error: Option<&str>,
    now: DateTime<Utc>,
) -> Option<DetectorInternalState> {
    let fresh = || DetectorInternalState {
        last_update_time: now,
        error: error.map(str::to_string),
    };
    match current {
        None => Some(fresh()),
        Some(state) if state.error.as_deref() == error => None,
        Some(_) => Some(fresh()),
    }
}

/// Persists detector errors, skipping writes that would change nothing
pub struct DetectionStateHandler {
    state_store: Arc<dyn DetectorStateStore>,
    state_manager: Arc<StateManager>,
}

impl DetectionStateHandler {
    pub fn new(state_store: Arc<dyn DetectorStateStore>, state_manager: Arc<StateManager>) -> Self {
        Self {
            state_store,
            state_manager,
        }
    }

    /// Returns whether the persisted state was rewritten
    pub async fn save_error(
        &self,
        detector_id: &str,
        error: Option<String>,
    ) -> Result<bool, DetectionError> {
        if self.state_manager.get_last_detection_error(detector_id) == error {
            return Ok(false);
        }
        self.state_manager.set_last_detection_error(detector_id, error.clone());

        let current = self.state_store.get_state(detector_id).await?;
        match error_strategy(current.as_ref(), error.as_deref(), Utc::now()) {
            Some(next) => {
                self.state_store.put_state(detector_id, next).await?;
                debug!(detector_id, error = ?error, "Saved detector error state");
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryDetectorStore, InMemoryStateStore};

    fn manager(config: StateConfig) -> (StateManager, Arc<InMemoryDetectorStore>) {
        let store = Arc::new(InMemoryDetectorStore::new());
        store.put(Detector::new("d1", vec!["host".into()]));
        (StateManager::new(config, store.clone()), store)
    }

    #[tokio::test]
    async fn test_detector_is_cached() {
        let (manager, store) = manager(StateConfig::default());
        manager.get_anomaly_detector("d1").await.unwrap();
        manager.get_anomaly_detector("d1").await.unwrap();
        assert_eq!(store.fetch_count(), 1);
        assert!(matches!(
            manager.get_anomaly_detector("missing").await,
            Err(DetectionError::DetectorNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_expired_detector_is_refetched() {
        let (manager, store) = manager(StateConfig {
            detector_cache_ttl_secs: 0,
            ..StateConfig::default()
        });
        manager.get_anomaly_detector("d1").await.unwrap();
        manager.get_anomaly_detector("d1").await.unwrap();
        assert_eq!(store.fetch_count(), 2);
    }

    #[test]
    fn test_end_run_cold_start_error_persists() {
        let (manager, _) = manager(StateConfig::default());
        manager.set_cold_start_exception("d1", DetectionError::end_run("d1", "bad", false));
        assert!(manager.fetch_cold_start_exception("d1").is_some());
        assert!(manager.fetch_cold_start_exception("d1").is_some());
    }

    #[test]
    fn test_transient_cold_start_error_is_cleared() {
        let (manager, _) = manager(StateConfig::default());
        manager.set_cold_start_exception("d1", DetectionError::Storage("flaky".into()));
        assert!(manager.fetch_cold_start_exception("d1").is_some());
        assert!(manager.fetch_cold_start_exception("d1").is_none());
    }

    #[test]
    fn test_expired_end_run_error() {
        let (manager, _) = manager(StateConfig {
            end_run_error_ttl_secs: 0,
            ..StateConfig::default()
        });
        manager.set_cold_start_exception("d1", DetectionError::end_run("d1", "bad", false));
        assert!(manager.fetch_cold_start_exception("d1").is_none());
    }

    #[test]
    fn test_pressure_mutes_node() {
        let (manager, _) = manager(StateConfig {
            max_retry_for_unresponsive_node: 3,
            ..StateConfig::default()
        });
        manager.add_pressure("n1");
        manager.add_pressure("n1");
        assert!(!manager.is_muted("n1"));
        manager.add_pressure("n1");
        assert!(manager.is_muted("n1"));
        manager.reset_pressure("n1");
        assert!(!manager.is_muted("n1"));
        assert_eq!(manager.pressure("n1"), 0);
    }

    #[test]
    fn test_mute_expires() {
        let (manager, _) = manager(StateConfig {
            max_retry_for_unresponsive_node: 1,
            backpressure_mute_secs: 0,
            ..StateConfig::default()
        });
        manager.add_pressure("n1");
        assert!(!manager.is_muted("n1"));
        assert_eq!(manager.pressure("n1"), 0);
    }

    #[test]
    fn test_index_throttle_window() {
        let (manager, _) = manager(StateConfig::default());
        assert!(!manager.is_index_throttled_recently());
        manager.set_last_index_throttled_time(Utc::now());
        assert!(manager.is_index_throttled_recently());
        manager.set_last_index_throttled_time(Utc::now() - chrono::Duration::seconds(3600));
        assert!(!manager.is_index_throttled_recently());
    }

    #[test]
    fn test_index_pressure_is_kept_apart_from_nodes() {
        let (manager, _) = manager(StateConfig {
            max_retry_for_unresponsive_node: 1,
            ..StateConfig::default()
        });
        // A detector sharing a node's name never mutes that node
        assert_eq!(manager.add_index_pressure("n1"), 1);
        assert_eq!(manager.add_index_pressure("n1"), 2);
        assert!(!manager.is_muted("n1"));
        assert_eq!(manager.pressure("n1"), 0);

        manager.reset_index_pressure("n1");
        assert_eq!(manager.index_pressure("n1"), 0);
        manager.add_index_pressure("d1");
        manager.clear("d1");
        assert_eq!(manager.index_pressure("d1"), 0);
    }

    #[test]
    fn test_maintenance_drops_idle_states() {
        let (manager, _) = manager(StateConfig {
            state_ttl_secs: 0,
            ..StateConfig::default()
        });
        manager.set_last_detection_error("d1", Some("x".into()));
        assert_eq!(manager.maintenance(), 1);
        assert!(manager.get_last_detection_error("d1").is_none());
    }

    #[test]
    fn test_error_strategy() {
        let now = Utc::now();
        let with = |error: Option<&str>| DetectorInternalState {
            last_update_time: now,
            error: error.map(str::to_string),
        };

        assert_eq!(error_strategy(None, Some("e"), now), Some(with(Some("e"))));
        assert_eq!(error_strategy(Some(&with(Some("e"))), Some("e"), now), None);
        assert_eq!(error_strategy(Some(&with(None)), Some("e"), now), Some(with(Some("e"))));
        assert_eq!(error_strategy(Some(&with(Some("e"))), None, now), Some(with(None)));
        assert_eq!(error_strategy(Some(&with(None)), None, now), None);
    }

    #[tokio::test]
    async fn test_save_error_skips_repeated_error() {
        let (manager, _) = manager(StateConfig::default());
        let manager = Arc::new(manager);
        let store = Arc::new(InMemoryStateStore::new());
        let handler = DetectionStateHandler::new(store.clone(), manager.clone());

        assert!(handler.save_error("d1", Some("boom".into())).await.unwrap());
        assert!(!handler.save_error("d1", Some("boom".into())).await.unwrap());
        assert_eq!(store.write_count(), 1);
        assert!(handler.save_error("d1", None).await.unwrap());
        assert_eq!(store.write_count(), 2);
        assert_eq!(manager.get_last_detection_error("d1"), None);
    }
}
