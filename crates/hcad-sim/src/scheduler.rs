//! Periodic detection scheduler
//!
//! Plays the role of the external job scheduler: every tick, each enabled
//! `DetectorJob` whose interval has elapsed gets one detection run on a
//! randomly chosen coordinator. A run failing with an end-run error that asks
//! to stop now disables its job, the way a real scheduler would stop the
//! detector.

use crate::cluster::SimCluster;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use hcad_core::model::{DetectionRequest, DetectorJob};
use hcad_core::DetectionError;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub ticks: u64,
    pub runs: u64,
    pub failures: u64,
    pub anomalies: u64,
    pub churn_events: u64,
    pub jobs: Vec<DetectorJob>,
}

pub struct Scheduler {
    cluster: Arc<SimCluster>,
    jobs: Mutex<Vec<DetectorJob>>,
    /// Membership churn every N ticks; 0 disables churn
    churn_every: u64,
    ticks: AtomicU64,
    runs: AtomicU64,
    failures: AtomicU64,
    anomalies: AtomicU64,
    churn_events: AtomicU64,
}

impl Scheduler {
    pub fn new(cluster: Arc<SimCluster>, jobs: Vec<DetectorJob>, churn_every: u64) -> Self {
        Self {
            cluster,
            jobs: Mutex::new(jobs),
            churn_every,
            ticks: AtomicU64::new(0),
            runs: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            anomalies: AtomicU64::new(0),
            churn_events: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            ticks: self.ticks.load(Ordering::Relaxed),
            runs: self.runs.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            anomalies: self.anomalies.load(Ordering::Relaxed),
            churn_events: self.churn_events.load(Ordering::Relaxed),
            jobs: self.jobs.lock().clone(),
        }
    }

    /// Stop scheduling a job; returns whether it existed
    pub fn remove_job(&self, name: &str) -> bool {
        let mut jobs = self.jobs.lock();
        let before = jobs.len();
        jobs.retain(|job| job.name != name);
        jobs.len() != before
    }

    fn due_jobs(&self, now: DateTime<Utc>) -> Vec<DetectorJob> {
        self.jobs
            .lock()
            .iter()
            .filter(|job| job.enabled)
            .filter(|job| {
                now - job.last_update_time >= ChronoDuration::seconds(job.interval_secs as i64)
            })
            .cloned()
            .collect()
    }

    /// Run every due job once; returns how many ran
    pub async fn tick(&self, now: DateTime<Utc>) -> usize {
        let tick = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;
        if self.churn_every > 0
            && tick % self.churn_every == 0
            && self.cluster.churn().await.is_some()
        {
            self.churn_events.fetch_add(1, Ordering::Relaxed);
        }

        let due = self.due_jobs(now);
        let runs = due.iter().map(|job| self.run_job(job, now));
        let outcomes = futures::future::join_all(runs).await;

        let mut jobs = self.jobs.lock();
        for (name, outcome) in due.iter().map(|j| j.name.as_str()).zip(outcomes) {
            let Some(job) = jobs.iter_mut().find(|j| j.name == name) else {
                continue;
            };
            job.last_update_time = now;
            if let Err(e) = outcome {
                if matches!(e, DetectionError::EndRun { end_now: true, .. }) {
                    job.disable(now);
                    warn!(detector_id = %job.name, error = %e, "Detector job disabled");
                }
            }
        }
        due.len()
    }

    async fn run_job(&self, job: &DetectorJob, now: DateTime<Utc>) -> Result<(), DetectionError> {
        let (start, end) = job.detection_window(now);
        let coordinator = self.cluster.coordinator();
        self.runs.fetch_add(1, Ordering::Relaxed);

        match coordinator.dispatcher.execute(DetectionRequest::new(&job.name, start, end)).await {
            Ok(response) => {
                if response.anomaly_grade > 0.0 {
                    self.anomalies.fetch_add(1, Ordering::Relaxed);
                    info!(
                        detector_id = %job.name,
                        grade = response.anomaly_grade,
                        score = response.anomaly_score,
                        "Anomaly detected"
                    );
                } else {
                    debug!(detector_id = %job.name, coordinator = %coordinator.id, "Run complete");
                }
                Ok(())
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                if e.is_end_run() {
                    error!(detector_id = %job.name, error = %e, "Run ended");
                }
                Err(e)
            }
        }
    }

    /// Tick every `period` until cancelled
    pub fn spawn(self: Arc<Self>, period: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        self.tick(Utc::now()).await;
                    }
                }
            }
            info!(runs = self.runs.load(Ordering::Relaxed), "Scheduler stopped");
        })
    }
}
