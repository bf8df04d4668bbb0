//! hcad-sim - multi-node anomaly detection cluster simulator
//!
//! Usage:
//!   hcad-sim --nodes 5 --detectors 3 --entities 500
//!   hcad-sim --config hcad.json --churn-every 6 --drop-rate 0.01
//!   HCAD_CACHE__MAX_ENTITIES=500 hcad-sim --nodes 4
//!   RUST_LOG=hcad_core=debug hcad-sim --duration-secs 120

use clap::Parser;
use hcad_core::config::HcadConfig;
use hcad_core::model::{Detector, DetectorJob};
use hcad_sim::{
    AppState, ClusterConfig, GeneratorConfig, Scheduler, SimCluster, SyntheticFeatureStore, router,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "hcad-sim")]
#[command(about = "In-process multi-node high-cardinality anomaly detection simulator")]
struct Cli {
    /// Nodes in the simulated cluster
    #[arg(short, long, default_value = "3")]
    nodes: usize,

    /// Multi-entity detectors to register
    #[arg(short, long, default_value = "2")]
    detectors: usize,

    /// Entities reported per detector
    #[arg(short, long, default_value = "200")]
    entities: usize,

    /// Detection interval in seconds
    #[arg(long, default_value = "10")]
    interval_secs: u64,

    /// Stop after this many seconds; runs until Ctrl+C when absent
    #[arg(long)]
    duration_secs: Option<u64>,

    /// Configuration file (JSON, TOML or YAML); `HCAD_*` variables override it
    #[arg(short, long, env = "HCAD_SIM_CONFIG")]
    config: Option<PathBuf>,

    /// Probability that an entity sample is a spike
    #[arg(long, default_value = "0.005")]
    anomaly_rate: f64,

    /// Probability that a sub-request batch is dropped
    #[arg(long, default_value = "0.0")]
    drop_rate: f64,

    /// Upper bound of per-batch transport latency
    #[arg(long, default_value = "20")]
    jitter_ms: u64,

    /// Toggle ring membership every N scheduler ticks (0 = never)
    #[arg(long, default_value = "0")]
    churn_every: u64,

    #[arg(long, env = "HCAD_SIM_LISTEN", default_value = "127.0.0.1:3000")]
    listen: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let hcad = HcadConfig::load(cli.config.as_deref())?;

    info!(
        nodes = cli.nodes,
        detectors = cli.detectors,
        entities = cli.entities,
        interval_secs = cli.interval_secs,
        "Starting hcad simulator"
    );

    let features = Arc::new(SyntheticFeatureStore::new(GeneratorConfig {
        entities_per_detector: cli.entities,
        anomaly_rate: cli.anomaly_rate,
        ..GeneratorConfig::default()
    }));
    let cluster_config = ClusterConfig {
        nodes: cli.nodes,
        hcad,
        max_jitter_ms: cli.jitter_ms,
        drop_rate: cli.drop_rate,
        maintenance_period: Duration::from_secs(cli.interval_secs.max(1) * 3),
    };
    let cluster = Arc::new(SimCluster::start(&cluster_config, features)?);

    let mut jobs = Vec::with_capacity(cli.detectors);
    for i in 0..cli.detectors {
        let id = format!("detector-{}", i);
        let mut detector = Detector::new(&id, vec!["host".into(), "region".into()])
            .with_feature("latency_p50", "avg")
            .with_feature("error_rate", "sum");
        detector.interval_secs = cli.interval_secs;
        cluster.add_detector(detector);
        jobs.push(DetectorJob::new(id, cli.interval_secs));
    }

    let cancel = cluster.cancellation();
    let scheduler = Arc::new(Scheduler::new(cluster.clone(), jobs, cli.churn_every));
    let scheduler_handle = scheduler
        .clone()
        .spawn(Duration::from_secs(cli.interval_secs.max(1)), cancel.child_token());

    let app = router(AppState {
        cluster: cluster.clone(),
        scheduler: scheduler.clone(),
    });
    let listener = TcpListener::bind(&cli.listen).await?;
    info!(addr = %cli.listen, "Simulator listening.");
    info!("Endpoints:");
    info!("  GET  /health         - Health check");
    info!("  GET  /metrics        - Prometheus metrics, every node");
    info!("  GET  /metrics/{{node}} - Prometheus metrics, one node");
    info!("  GET  /stats          - Cluster and scheduler stats");

    let stop = cancel.clone();
    let deadline = cli.duration_secs.map(Duration::from_secs);
    tokio::spawn(async move {
        match deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = tokio::time::sleep(deadline) => {}
                }
            }
            None => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
        info!("Shutting down... (draining checkpoint queues)");
        stop.cancel();
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.clone().cancelled_owned())
        .await?;

    if let Err(e) = scheduler_handle.await {
        tracing::warn!(error = %e, "Scheduler task ended abnormally");
    }
    cluster.shutdown().await;

    let summary = serde_json::json!({
        "cluster": cluster.snapshot(),
        "scheduler": scheduler.stats(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    info!("Simulator stopped. Goodbye.");
    Ok(())
}
