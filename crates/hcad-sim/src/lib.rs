//! hcad-sim: in-process cluster simulator for hcad-core
//!
//! Drives the detection library end to end without external systems:
//! - `generator` synthesizes per-entity feature vectors with injected spikes
//! - `cluster` runs N nodes over a lossy, jittery in-process transport and
//!   churns ring membership
//! - `scheduler` triggers detector jobs on their interval
//! - `api` exposes health, metrics and stats over HTTP

pub mod api;
pub mod cluster;
pub mod generator;
pub mod scheduler;

pub use api::{AppState, router};
pub use cluster::{ClusterConfig, JitteryTransport, SimCluster};
pub use generator::{GeneratorConfig, SyntheticFeatureStore};
pub use scheduler::Scheduler;
