//! Detection statistics
//!
//! Counters and gauges live in a registry owned by `DetectionStats` rather
//! than the process-global prometheus registry, so several in-process nodes
//! (and tests) never collide on metric names.

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use serde::Serialize;

#[derive(Clone)]
pub struct DetectionStats {
    registry: Registry,
    pub execute_requests: IntCounter,
    pub execute_failures: IntCounter,
    /// High-cardinality (multi-entity) requests
    pub hc_execute_requests: IntCounter,
    pub hc_execute_failures: IntCounter,
    pub breaker_rejections: IntCounter,
    pub cache_evictions: IntCounter,
    pub checkpoint_flush_failures: IntCounter,
    pub cache_entities: IntGauge,
    pub ring_nodes: IntGauge,
}

/// Plain snapshot for JSON endpoints
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub execute_requests: u64,
    pub execute_failures: u64,
    pub hc_execute_requests: u64,
    pub hc_execute_failures: u64,
    pub breaker_rejections: u64,
    pub cache_evictions: u64,
    pub checkpoint_flush_failures: u64,
    pub cache_entities: i64,
    pub ring_nodes: i64,
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter, prometheus::Error> {
    let c = IntCounter::new(name, help)?;
    registry.register(Box::new(c.clone()))?;
    Ok(c)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGauge, prometheus::Error> {
    let g = IntGauge::new(name, help)?;
    registry.register(Box::new(g.clone()))?;
    Ok(g)
}

impl DetectionStats {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        Ok(Self {
            execute_requests: counter(
                &registry,
                "hcad_execute_request_total",
                "Detection requests received",
            )?,
            execute_failures: counter(
                &registry,
                "hcad_execute_failure_total",
                "Detection requests that failed",
            )?,
            hc_execute_requests: counter(
                &registry,
                "hcad_hc_execute_request_total",
                "Multi-entity detection requests received",
            )?,
            hc_execute_failures: counter(
                &registry,
                "hcad_hc_execute_failure_total",
                "Multi-entity detection requests that failed",
            )?,
            breaker_rejections: counter(
                &registry,
                "hcad_breaker_rejections_total",
                "Requests rejected by an open circuit breaker",
            )?,
            cache_evictions: counter(
                &registry,
                "hcad_cache_evictions_total",
                "Entity models evicted from cache",
            )?,
            checkpoint_flush_failures: counter(
                &registry,
                "hcad_checkpoint_flush_failures_total",
                "Checkpoint writes dropped after exhausting retries",
            )?,
            cache_entities: gauge(
                &registry,
                "hcad_cache_entities",
                "Entity models resident in cache",
            )?,
            ring_nodes: gauge(&registry, "hcad_ring_nodes", "Eligible nodes on the hash ring")?,
            registry,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Prometheus text exposition of every metric
    pub fn encode_text(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            execute_requests: self.execute_requests.get(),
            execute_failures: self.execute_failures.get(),
            hc_execute_requests: self.hc_execute_requests.get(),
            hc_execute_failures: self.hc_execute_failures.get(),
            breaker_rejections: self.breaker_rejections.get(),
            cache_evictions: self.cache_evictions.get(),
            checkpoint_flush_failures: self.checkpoint_flush_failures.get(),
            cache_entities: self.cache_entities.get(),
            ring_nodes: self.ring_nodes.get(),
        }
    }
}
