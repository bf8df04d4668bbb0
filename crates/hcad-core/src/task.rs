//! Historical detection runs
//!
//! A historical run replays a detector over `[start, end)` one window at a
//! time through the regular `Dispatcher`. Runs are cancelled cooperatively:
//! the token is checked between windows, and a window whose result arrives
//! after cancellation is discarded rather than counted.

use crate::dispatcher::Dispatcher;
use crate::error::DetectionError;
use crate::model::DetectionRequest;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Outcome of a cancel request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CancellationState {
    Cancelled,
    AlreadyCancelled,
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskStatus {
    Running,
    Finished,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskProgress {
    pub task_id: Uuid,
    pub detector_id: String,
    pub windows_total: usize,
    pub windows_done: usize,
    pub anomalies: usize,
    pub failures: usize,
    pub status: TaskStatus,
    pub last_error: Option<String>,
}

struct TaskEntry {
    token: CancellationToken,
    progress: Arc<Mutex<TaskProgress>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

pub struct TaskManager {
    dispatcher: Arc<Dispatcher>,
    tasks: DashMap<String, Arc<TaskEntry>>,
}

impl TaskManager {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            tasks: DashMap::new(),
        }
    }

    /// Start replaying `detector_id` over `[start, end)` in `window`-sized steps
    pub fn run_historical(
        &self,
        detector_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        window: Duration,
    ) -> Result<Uuid, DetectionError> {
        let windows = split_windows(start, end, window);
        let task_id = Uuid::new_v4();
        let token = CancellationToken::new();
        let progress = Arc::new(Mutex::new(TaskProgress {
            task_id,
            detector_id: detector_id.to_string(),
            windows_total: windows.len(),
            windows_done: 0,
            anomalies: 0,
            failures: 0,
            status: TaskStatus::Running,
            last_error: None,
        }));
        let entry = Arc::new(TaskEntry {
            token: token.clone(),
            progress: progress.clone(),
            handle: Mutex::new(None),
        });

        match self.tasks.entry(detector_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().progress.lock().status == TaskStatus::Running {
                    return Err(DetectionError::TaskRunning(detector_id.to_string()));
                }
                occupied.insert(entry.clone());
            }
            Entry::Vacant(vacant) => {
                vacant.insert(entry.clone());
            }
        }

        let dispatcher = self.dispatcher.clone();
        let id = detector_id.to_string();
        let handle = tokio::spawn(async move {
            info!(detector_id = %id, %task_id, windows = windows.len(), "Historical run started");
            let status = replay(&dispatcher, &id, windows, &token, &progress).await;
            progress.lock().status = status;
            info!(detector_id = %id, %task_id, ?status, "Historical run ended");
        });
        *entry.handle.lock() = Some(handle);
        Ok(task_id)
    }

    pub fn cancel(&self, detector_id: &str) -> CancellationState {
        let Some(entry) = self.tasks.get(detector_id).map(|e| e.value().clone()) else {
            return CancellationState::NotFound;
        };
        if entry.token.is_cancelled() {
            return CancellationState::AlreadyCancelled;
        }
        if entry.progress.lock().status != TaskStatus::Running {
            return CancellationState::NotFound;
        }
        entry.token.cancel();
        info!(detector_id, "Historical run cancellation requested");
        CancellationState::Cancelled
    }

    pub fn progress(&self, detector_id: &str) -> Option<TaskProgress> {
        self.tasks.get(detector_id).map(|e| e.progress.lock().clone())
    }

    /// Wait for the run of `detector_id` to end and return its final progress
    pub async fn wait(&self, detector_id: &str) -> Option<TaskProgress> {
        let entry = self.tasks.get(detector_id).map(|e| e.value().clone())?;
        let handle = entry.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(detector_id, error = %e, "Historical run task aborted");
                entry.progress.lock().status = TaskStatus::Failed;
            }
        }
        let progress = entry.progress.lock().clone();
        Some(progress)
    }
}

fn split_windows(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    window: Duration,
) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    let mut windows = Vec::new();
    if window <= Duration::zero() {
        return windows;
    }
    let mut cursor = start;
    while cursor < end {
        let next = (cursor + window).min(end);
        windows.push((cursor, next));
        cursor = next;
    }
    windows
}

async fn replay(
    dispatcher: &Dispatcher,
    detector_id: &str,
    windows: Vec<(DateTime<Utc>, DateTime<Utc>)>,
    token: &CancellationToken,
    progress: &Mutex<TaskProgress>,
) -> TaskStatus {
    for (start, end) in windows {
        if token.is_cancelled() {
            return TaskStatus::Cancelled;
        }
        let request = DetectionRequest::new(detector_id, start, end);
        let result = tokio::select! {
            _ = token.cancelled() => return TaskStatus::Cancelled,
            result = dispatcher.execute(request) => result,
        };
        // Arrived after cancellation: drop it
        if token.is_cancelled() {
            return TaskStatus::Cancelled;
        }

        let mut p = progress.lock();
        p.windows_done += 1;
        match result {
            Ok(response) => {
                if response.anomaly_grade > 0.0 {
                    p.anomalies += 1;
                }
            }
            Err(e) => {
                p.failures += 1;
                p.last_error = Some(e.to_string());
                if e.is_end_run() {
                    return TaskStatus::Failed;
                }
            }
        }
    }
    TaskStatus::Finished
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_windows() {
        let start = Utc::now();
        let windows = split_windows(start, start + Duration::minutes(25), Duration::minutes(10));
        assert_eq!(windows.len(), 3);
        assert_eq!(windows[2].1 - windows[2].0, Duration::minutes(5));
        assert!(split_windows(start, start, Duration::minutes(1)).is_empty());
        assert!(split_windows(start, start + Duration::minutes(1), Duration::zero()).is_empty());
    }
}
