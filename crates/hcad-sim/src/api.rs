//! HTTP endpoints
//!
//! - `GET /health`          liveness
//! - `GET /metrics`         prometheus text of every node, labelled by node
//! - `GET /metrics/{node}`  prometheus text of one node
//! - `GET /stats`           cluster and scheduler snapshot as JSON
//! - `DELETE /detectors/{id}` delete a detector and clear it from every node

use crate::cluster::{ClusterSnapshot, SimCluster};
use crate::scheduler::{Scheduler, SchedulerStats};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get};
use axum::{Json, Router};
use hcad_core::DetectionError;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

#[derive(Clone)]
pub struct AppState {
    pub cluster: Arc<SimCluster>,
    pub scheduler: Arc<Scheduler>,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub version: &'static str,
    pub cluster: ClusterSnapshot,
    pub scheduler: SchedulerStats,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub detector_id: String,
    pub entities_cleared: usize,
    pub job_removed: bool,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/metrics/{node}", get(node_metrics_handler))
        .route("/stats", get(stats_handler))
        .route("/detectors/{id}", delete(delete_detector_handler))
        .with_state(state)
}

async fn health_handler() -> &'static str {
    "OK"
}

async fn metrics_handler(State(state): State<AppState>) -> String {
    let texts: Vec<(String, String)> = state
        .cluster
        .nodes()
        .iter()
        .map(|n| (n.id.clone(), n.stats.encode_text()))
        .collect();
    merge_labelled(&texts)
}

async fn node_metrics_handler(
    State(state): State<AppState>,
    Path(node): Path<String>,
) -> Result<String, StatusCode> {
    state
        .cluster
        .node(&node)
        .map(|n| n.stats.encode_text())
        .ok_or(StatusCode::NOT_FOUND)
}

async fn stats_handler(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        version: env!("CARGO_PKG_VERSION"),
        cluster: state.cluster.snapshot(),
        scheduler: state.scheduler.stats(),
    })
}

async fn delete_detector_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeleteResponse>, StatusCode> {
    match state.cluster.delete_detector(&id).await {
        Ok(entities_cleared) => Ok(Json(DeleteResponse {
            job_removed: state.scheduler.remove_job(&id),
            detector_id: id,
            entities_cleared,
        })),
        Err(DetectionError::DetectorNotFound(_)) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            warn!(detector_id = %id, error = %e, "Failed to delete detector");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

#[derive(Default)]
struct Family {
    comments: Vec<String>,
    samples: Vec<String>,
}

/// Merge per-node exposition texts into one, adding a `node` label to every
/// sample and keeping each family's lines contiguous.
fn merge_labelled(texts: &[(String, String)]) -> String {
    let mut families: BTreeMap<String, Family> = BTreeMap::new();
    for (node, text) in texts {
        for line in text.lines() {
            if let Some(comment) = line.strip_prefix("# ") {
                let name = comment.split_whitespace().nth(1).unwrap_or_default();
                let family = families.entry(name.to_string()).or_default();
                if !family.comments.iter().any(|c| c == line) {
                    family.comments.push(line.to_string());
                }
                continue;
            }
            let Some((series, value)) = line.rsplit_once(' ') else {
                continue;
            };
            let name = series.split('{').next().unwrap_or(series);
            let labelled = match series.strip_suffix('}') {
                Some(open) => format!("{},node=\"{}\"}} {}", open, node, value),
                None => format!("{}{{node=\"{}\"}} {}", series, node, value),
            };
            families.entry(name.to_string()).or_default().samples.push(labelled);
        }
    }

    let mut out = String::new();
    for family in families.values() {
        for line in family.comments.iter().chain(&family.samples) {
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_labelled_groups_families() {
        let text = concat!(
            "# HELP hcad_ring_nodes Eligible nodes\n",
            "# TYPE hcad_ring_nodes gauge\n",
            "hcad_ring_nodes 3\n",
            "# TYPE x counter\n",
            "x{a=\"b\"} 1\n",
        );
        let merged = merge_labelled(&[("n0".into(), text.into()), ("n1".into(), text.into())]);
        let lines: Vec<&str> = merged.lines().collect();
        assert_eq!(
            lines,
            vec![
                "# HELP hcad_ring_nodes Eligible nodes",
                "# TYPE hcad_ring_nodes gauge",
                "hcad_ring_nodes{node=\"n0\"} 3",
                "hcad_ring_nodes{node=\"n1\"} 3",
                "# TYPE x counter",
                "x{a=\"b\",node=\"n0\"} 1",
                "x{a=\"b\",node=\"n1\"} 1",
            ]
        );
    }
}
