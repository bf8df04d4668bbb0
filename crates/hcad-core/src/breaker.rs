//! Resource circuit breakers
//!
//! `CircuitBreakerService` is an explicitly owned registry of named breakers.
//! It reports open when any registered breaker is open, unless the service is
//! administratively disabled. Breakers sample their own signal without any
//! shared locking.
//!
//! A breaker that fails to sample counts as closed for that check, so a
//! broken signal never halts detection on its own.

use crate::config::BreakerConfig;
use crate::error::BreakerError;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

pub const MEMORY_BREAKER: &str = "mem";

/// Source of memory usage readings
pub trait MemorySampler: Send + Sync {
    /// Used memory as a percentage of total (0-100)
    fn used_percent(&self) -> Result<f64, BreakerError>;
}

/// Reads `/proc/meminfo`
#[derive(Debug, Default)]
pub struct SystemMemorySampler;

impl MemorySampler for SystemMemorySampler {
    fn used_percent(&self) -> Result<f64, BreakerError> {
        let raw = std::fs::read_to_string("/proc/meminfo").map_err(|e| BreakerError::Sample {
            resource: "memory".into(),
            reason: e.to_string(),
        })?;
        parse_meminfo(&raw)
    }
}

fn parse_meminfo(raw: &str) -> Result<f64, BreakerError> {
    let field = |name: &str| -> Option<f64> {
        raw.lines()
            .find(|l| l.starts_with(name))
            .and_then(|l| l.split_whitespace().nth(1))
            .and_then(|v| v.parse().ok())
    };
    match (field("MemTotal:"), field("MemAvailable:")) {
        (Some(total), Some(available)) if total > 0.0 => Ok((total - available) / total * 100.0),
        _ => Err(BreakerError::Sample {
            resource: "memory".into(),
            reason: "MemTotal/MemAvailable missing".into(),
        }),
    }
}

/// Opens when memory usage crosses a threshold
pub struct MemoryBreaker {
    threshold_percent: f64,
    sampler: Arc<dyn MemorySampler>,
}

impl MemoryBreaker {
    pub fn new(threshold_percent: f64, sampler: Arc<dyn MemorySampler>) -> Self {
        Self {
            threshold_percent,
            sampler,
        }
    }

    pub fn is_open(&self) -> Result<bool, BreakerError> {
        Ok(self.sampler.used_percent()? > self.threshold_percent)
    }
}

/// Capability implemented by custom breakers
pub trait BreakerSignal: Send + Sync {
    fn is_open(&self) -> Result<bool, BreakerError>;
}

/// Breaker driven by an explicit flag (operators, tests, fault injection)
#[derive(Debug, Default)]
pub struct ManualBreaker {
    open: AtomicBool,
}

impl ManualBreaker {
    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::Relaxed);
    }
}

impl BreakerSignal for ManualBreaker {
    fn is_open(&self) -> Result<bool, BreakerError> {
        Ok(self.open.load(Ordering::Relaxed))
    }
}

#[derive(Clone)]
pub enum Breaker {
    Memory(Arc<MemoryBreaker>),
    Custom(Arc<dyn BreakerSignal>),
}

impl Breaker {
    pub fn is_open(&self) -> Result<bool, BreakerError> {
        match self {
            Self::Memory(b) => b.is_open(),
            Self::Custom(b) => b.is_open(),
        }
    }
}

pub struct CircuitBreakerService {
    breakers: DashMap<String, Breaker>,
    enabled: AtomicBool,
}

impl CircuitBreakerService {
    pub fn new(enabled: bool) -> Self {
        Self {
            breakers: DashMap::new(),
            enabled: AtomicBool::new(enabled),
        }
    }

    /// Service with the default memory breaker registered
    pub fn from_config(config: &BreakerConfig) -> Self {
        let service = Self::new(config.enabled);
        service.register(
            MEMORY_BREAKER,
            Breaker::Memory(Arc::new(MemoryBreaker::new(
                config.memory_threshold_percent,
                Arc::new(SystemMemorySampler),
            ))),
        );
        service
    }

    /// Insert-if-absent; returns false when the name is already taken
    pub fn register(&self, name: &str, breaker: Breaker) -> bool {
        match self.breakers.entry(name.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(breaker);
                info!(breaker = name, "Registered circuit breaker");
                true
            }
        }
    }

    pub fn unregister(&self, name: &str) -> Option<Breaker> {
        self.breakers.remove(name).map(|(_, b)| b)
    }

    pub fn clear(&self) {
        self.breakers.clear();
    }

    pub fn get(&self, name: &str) -> Option<Breaker> {
        self.breakers.get(name).map(|b| b.clone())
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn is_open(&self) -> bool {
        if !self.is_enabled() {
            return false;
        }
        // Snapshot first so sampling never runs under a shard lock
        let breakers: Vec<(String, Breaker)> = self
            .breakers
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        breakers.iter().any(|(name, breaker)| match breaker.is_open() {
            Ok(open) => open,
            Err(e) => {
                warn!(breaker = %name, error = %e, "Breaker sampling failed, treating as closed");
                false
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSampler(f64);

    impl MemorySampler for FixedSampler {
        fn used_percent(&self) -> Result<f64, BreakerError> {
            Ok(self.0)
        }
    }

    struct FailingSignal;

    impl BreakerSignal for FailingSignal {
        fn is_open(&self) -> Result<bool, BreakerError> {
            Err(BreakerError::Sample {
                resource: "disk".into(),
                reason: "io".into(),
            })
        }
    }

    #[test]
    fn test_disabled_service_never_opens() {
        let service = CircuitBreakerService::new(false);
        let manual = Arc::new(ManualBreaker::default());
        manual.set_open(true);
        service.register("manual", Breaker::Custom(manual));
        assert!(!service.is_open());
        service.set_enabled(true);
        assert!(service.is_open());
    }

    #[test]
    fn test_any_open_breaker_opens_service() {
        let service = CircuitBreakerService::new(true);
        let a = Arc::new(ManualBreaker::default());
        let b = Arc::new(ManualBreaker::default());
        service.register("a", Breaker::Custom(a.clone()));
        service.register("b", Breaker::Custom(b.clone()));
        assert!(!service.is_open());
        b.set_open(true);
        assert!(service.is_open());
        b.set_open(false);
        a.set_open(true);
        assert!(service.is_open());
    }

    #[test]
    fn test_register_is_insert_if_absent() {
        let service = CircuitBreakerService::new(true);
        let open = Arc::new(ManualBreaker::default());
        open.set_open(true);
        assert!(service.register("x", Breaker::Custom(Arc::new(ManualBreaker::default()))));
        assert!(!service.register("x", Breaker::Custom(open)));
        assert!(!service.is_open());
        assert!(service.unregister("x").is_some());
        assert!(service.get("x").is_none());
    }

    #[test]
    fn test_failing_signal_fails_open() {
        let service = CircuitBreakerService::new(true);
        service.register("disk", Breaker::Custom(Arc::new(FailingSignal)));
        assert!(!service.is_open());
    }

    #[test]
    fn test_memory_breaker_threshold() {
        let service = CircuitBreakerService::new(true);
        service.register(
            MEMORY_BREAKER,
            Breaker::Memory(Arc::new(MemoryBreaker::new(85.0, Arc::new(FixedSampler(90.0))))),
        );
        assert!(service.is_open());
        service.unregister(MEMORY_BREAKER);
        service.register(
            MEMORY_BREAKER,
            Breaker::Memory(Arc::new(MemoryBreaker::new(85.0, Arc::new(FixedSampler(40.0))))),
        );
        assert!(!service.is_open());
    }

    #[test]
    fn test_parse_meminfo() {
        let raw = "MemTotal:       1000 kB\nMemFree:         100 kB\nMemAvailable:    250 kB\n";
        let used = parse_meminfo(raw).unwrap();
        assert!((used - 75.0).abs() < 1e-9);
        assert!(parse_meminfo("garbage").is_err());
    }
}
