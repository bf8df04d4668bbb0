//! HCAD core: distributed multi-entity anomaly detection
//!
//! Scores many independent entity time series across a cluster:
//! - `ring` routes every entity to the node that owns its model
//! - `cache` keeps entity models in memory with checkpoint fallback
//! - `dispatcher` fans a request out per owning node and `aggregator` merges
//!   the partial results under a partial-failure policy
//! - `breaker` and `state` short-circuit work that cannot succeed

pub mod aggregator;
pub mod breaker;
pub mod cache;
pub mod checkpoint;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod model;
pub mod node;
pub mod ring;
pub mod scorer;
pub mod state;
pub mod stats;
pub mod store;
pub mod task;
pub mod transport;
pub mod worker;

pub use aggregator::{AggregateError, Mergeable, ResultAggregator};
pub use breaker::{Breaker, CircuitBreakerService, ManualBreaker};
pub use cache::{EntityCache, EntityHandle, EvictionPolicy, StateOrigin};
pub use checkpoint::{CheckpointStore, CheckpointWriter, InMemoryCheckpointStore};
pub use config::HcadConfig;
pub use dispatcher::Dispatcher;
pub use error::{DetectionError, FeatureError};
pub use model::{Detector, DetectionRequest, DetectionResponse, Entity, EntityKey, ModelState};
pub use node::{Collaborators, DetectionNode};
pub use ring::{ClusterNode, HashRing, MembershipEvent};
pub use state::StateManager;
pub use stats::DetectionStats;
pub use task::{CancellationState, TaskManager};
pub use transport::{LocalTransport, SubRequestTransport};
pub use worker::ModelWorker;
