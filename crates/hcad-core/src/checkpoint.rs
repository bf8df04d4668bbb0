//! Checkpoint persistence
//!
//! Entity model state is persisted as versioned bincode blobs through a
//! `CheckpointStore`. Writes happen off the request path in a background
//! `CheckpointWriter`:
//! - Evicted state and periodic snapshots of live entries are staged in a
//!   pending map, then flushed in order. Until the flush succeeds the cache
//!   can take evicted state back, so an entity that is evicted and
//!   immediately requested again never loses updates.
//! - Failed writes are retried with exponential backoff and dropped (with a
//!   counter and an error log) once retries run out.

use crate::config::CheckpointConfig;
use crate::error::CheckpointError;
use crate::model::{EntityKey, ModelState};
use crate::stats::DetectionStats;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Version for checkpoint format migrations
pub const CHECKPOINT_VERSION: u32 = 1;

/// Serialized state of one entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityCheckpoint {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub state: ModelState,
}

impl EntityCheckpoint {
    pub fn new(state: ModelState) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            saved_at: Utc::now(),
            state,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CheckpointError> {
        bincode::serialize(self).map_err(|e| CheckpointError::SerializationFailed(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CheckpointError> {
        let checkpoint: EntityCheckpoint = bincode::deserialize(bytes)
            .map_err(|e| CheckpointError::DeserializationFailed(e.to_string()))?;

        if checkpoint.version > CHECKPOINT_VERSION {
            return Err(CheckpointError::UnsupportedVersion {
                found: checkpoint.version,
                max_supported: CHECKPOINT_VERSION,
            });
        }

        Ok(checkpoint)
    }
}

/// Key-value checkpoint storage; eventual persistence is acceptable
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn get(&self, key: &EntityKey) -> Result<Option<ModelState>, CheckpointError>;
    async fn put(&self, key: &EntityKey, state: &ModelState) -> Result<(), CheckpointError>;
}

/// In-process store holding encoded checkpoints, with fault injection hooks
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    blobs: DashMap<EntityKey, Vec<u8>>,
    puts: AtomicU64,
    fail_next_puts: AtomicU32,
    index_missing: AtomicBool,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    pub fn contains(&self, key: &EntityKey) -> bool {
        self.blobs.contains_key(key)
    }

    /// Successful writes so far
    pub fn put_count(&self) -> u64 {
        self.puts.load(Ordering::Relaxed)
    }

    /// Make the next `n` writes fail
    pub fn fail_next_puts(&self, n: u32) {
        self.fail_next_puts.store(n, Ordering::Relaxed);
    }

    /// Simulate a deleted checkpoint index
    pub fn set_index_missing(&self, missing: bool) {
        self.index_missing.store(missing, Ordering::Relaxed);
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn get(&self, key: &EntityKey) -> Result<Option<ModelState>, CheckpointError> {
        if self.index_missing.load(Ordering::Relaxed) {
            return Err(CheckpointError::IndexNotFound("checkpoints".into()));
        }
        match self.blobs.get(key) {
            Some(bytes) => Ok(Some(EntityCheckpoint::from_bytes(&bytes)?.state)),
            None => Ok(None),
        }
    }

    async fn put(&self, key: &EntityKey, state: &ModelState) -> Result<(), CheckpointError> {
        let injected = self
            .fail_next_puts
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(CheckpointError::Store("injected write failure".into()));
        }
        let bytes = EntityCheckpoint::new(state.clone()).to_bytes()?;
        self.blobs.insert(key.clone(), bytes);
        self.puts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

// ============================================================================
// BACKGROUND WRITER
// ============================================================================

#[derive(Debug, Default)]
pub struct WriterStats {
    pub written: AtomicU64,
    pub failed: AtomicU64,
    pub retried: AtomicU64,
    /// Staged state reclaimed by the cache before it was flushed
    pub reclaimed: AtomicU64,
}

/// Latest state staged for one key
struct Staged {
    seq: u64,
    state: ModelState,
    /// A flush message for this key sits in the queue
    queued: bool,
}

enum WriterMessage {
    /// Write whatever is staged for the key when the message is handled
    Flush(EntityKey),
    Barrier(oneshot::Sender<()>),
}

type PendingMap = DashMap<EntityKey, Staged>;

/// Writes staged state off the request path.
///
/// Each key holds at most one staged state and at most one queued flush. The
/// worker always writes the newest staged state of a key, one write at a
/// time, so a store never ends up holding an older state than one already
/// written for the same key.
pub struct CheckpointWriter {
    tx: mpsc::UnboundedSender<WriterMessage>,
    pending: Arc<PendingMap>,
    next_seq: AtomicU64,
    stats: Arc<WriterStats>,
}

impl CheckpointWriter {
    /// Spawns the writer task; must be called inside a tokio runtime
    pub fn new(
        config: CheckpointConfig,
        store: Arc<dyn CheckpointStore>,
        metrics: DetectionStats,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(DashMap::new());
        let stats = Arc::new(WriterStats::default());

        let worker = Worker {
            config,
            store,
            pending: pending.clone(),
            stats: stats.clone(),
            metrics,
        };
        tokio::spawn(worker.run(rx));

        Self {
            tx,
            pending,
            next_seq: AtomicU64::new(0),
            stats,
        }
    }

    pub fn stats(&self) -> &WriterStats {
        &self.stats
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Stage state for writing. It stays reclaimable until written, and a
    /// later stage of the same key replaces it.
    pub fn stage(&self, state: ModelState) {
        let key = state.key();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let needs_flush = match self.pending.entry(key.clone()) {
            Entry::Occupied(mut staged) => {
                let staged = staged.get_mut();
                staged.seq = seq;
                staged.state = state;
                !std::mem::replace(&mut staged.queued, true)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Staged {
                    seq,
                    state,
                    queued: true,
                });
                true
            }
        };
        if needs_flush {
            self.submit(WriterMessage::Flush(key));
        }
    }

    /// Reclaim staged state that has not been written yet
    pub fn take_pending(&self, key: &EntityKey) -> Option<ModelState> {
        let (_, staged) = self.pending.remove(key)?;
        self.stats.reclaimed.fetch_add(1, Ordering::Relaxed);
        Some(staged.state)
    }

    /// Wait until everything staged before this call has been written
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(WriterMessage::Barrier(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    fn submit(&self, message: WriterMessage) {
        if self.tx.send(message).is_err() {
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
            error!("Checkpoint writer is closed, flush request dropped");
        }
    }
}

struct Worker {
    config: CheckpointConfig,
    store: Arc<dyn CheckpointStore>,
    pending: Arc<PendingMap>,
    stats: Arc<WriterStats>,
    metrics: DetectionStats,
}

impl Worker {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<WriterMessage>) {
        info!("Checkpoint writer started");
        while let Some(message) = rx.recv().await {
            match message {
                WriterMessage::Flush(key) => self.flush(key).await,
                WriterMessage::Barrier(done) => {
                    let _ = done.send(());
                }
            }
        }
        info!("Checkpoint writer stopped");
    }

    async fn flush(&self, key: EntityKey) {
        // A stage from here on queues a fresh flush behind this one
        let staged = self.pending.get_mut(&key).map(|mut staged| {
            staged.queued = false;
            (staged.seq, staged.state.clone())
        });
        // Reclaimed since it was queued
        let Some((seq, state)) = staged else { return };
        self.write(&key, &state).await;
        self.pending.remove_if(&key, |_, staged| staged.seq == seq);
    }

    async fn write(&self, key: &EntityKey, state: &ModelState) {
        for attempt in 0..=self.config.max_retries {
            match self.store.put(key, state).await {
                Ok(()) => {
                    self.stats.written.fetch_add(1, Ordering::Relaxed);
                    debug!(entity = %key, "Checkpoint written");
                    return;
                }
                Err(e) => {
                    warn!(attempt, entity = %key, error = %e, "Checkpoint write failed");
                }
            }

            if attempt < self.config.max_retries {
                self.stats.retried.fetch_add(1, Ordering::Relaxed);
                tokio::time::sleep(self.config.retry_delay(attempt)).await;
            }
        }

        self.stats.failed.fetch_add(1, Ordering::Relaxed);
        self.metrics.checkpoint_flush_failures.inc();
        error!(entity = %key, "Dropped checkpoint after max retries");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Entity;
    use crate::scorer::{AnomalyScorer, EwmaScorer};
    use tokio::sync::Semaphore;

    fn state(value: &str) -> ModelState {
        ModelState::new("d1", Entity::single("host", value), EwmaScorer::default().new_model(2))
    }

    fn scored(state: &ModelState, times: usize) -> ModelState {
        let mut next = state.clone();
        for _ in 0..times {
            EwmaScorer::default().score(&mut next.model, &[1.0, 2.0]);
        }
        next
    }

    fn config() -> CheckpointConfig {
        CheckpointConfig {
            max_retries: 2,
            retry_base_delay_ms: 1,
            max_retry_delay_ms: 10,
        }
    }

    fn writer(store: Arc<dyn CheckpointStore>) -> CheckpointWriter {
        CheckpointWriter::new(config(), store, DetectionStats::new().unwrap())
    }

    /// Holds every write until a permit is released
    struct GatedStore {
        inner: InMemoryCheckpointStore,
        gate: Semaphore,
    }

    #[async_trait]
    impl CheckpointStore for GatedStore {
        async fn get(&self, key: &EntityKey) -> Result<Option<ModelState>, CheckpointError> {
            self.inner.get(key).await
        }

        async fn put(&self, key: &EntityKey, state: &ModelState) -> Result<(), CheckpointError> {
            let permit = self
                .gate
                .acquire()
                .await
                .map_err(|e| CheckpointError::Store(e.to_string()))?;
            permit.forget();
            self.inner.put(key, state).await
        }
    }

    #[test]
    fn test_checkpoint_bytes() {
        let checkpoint = EntityCheckpoint::new(state("a"));
        let bytes = checkpoint.to_bytes().unwrap();
        let restored = EntityCheckpoint::from_bytes(&bytes).unwrap();
        assert_eq!(restored.state, checkpoint.state);
    }

    #[test]
    fn test_future_version_rejected() {
        let mut checkpoint = EntityCheckpoint::new(state("a"));
        checkpoint.version = CHECKPOINT_VERSION + 1;
        let bytes = checkpoint.to_bytes().unwrap();
        assert!(matches!(
            EntityCheckpoint::from_bytes(&bytes),
            Err(CheckpointError::UnsupportedVersion { .. })
        ));
        assert!(matches!(
            EntityCheckpoint::from_bytes(&[1, 2, 3]),
            Err(CheckpointError::DeserializationFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_staged_state_is_flushed() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let writer = writer(store.clone());
        let s = state("a");
        let key = s.key();
        writer.stage(s.clone());
        writer.flush().await;
        assert_eq!(store.get(&key).await.unwrap(), Some(s));
        assert_eq!(writer.pending_len(), 0);
        assert_eq!(writer.stats().written.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_reclaimed_state_is_not_written() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let writer = writer(store.clone());
        let s = state("a");
        let key = s.key();
        writer.stage(s.clone());
        assert_eq!(writer.take_pending(&key), Some(s));
        writer.flush().await;
        assert!(!store.contains(&key));
        assert_eq!(writer.stats().reclaimed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_restaging_keeps_only_the_newest_state() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let writer = writer(store.clone());
        let older = state("a");
        let newer = scored(&older, 3);
        writer.stage(older.clone());
        writer.stage(newer.clone());
        writer.stage(scored(&older, 1));
        writer.stage(newer.clone());
        writer.flush().await;

        assert_eq!(store.get(&older.key()).await.unwrap(), Some(newer));
        assert_eq!(store.put_count(), 1);
        assert_eq!(writer.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_stage_during_write_is_written_after_it() {
        let store = Arc::new(GatedStore {
            inner: InMemoryCheckpointStore::new(),
            gate: Semaphore::new(0),
        });
        let writer = writer(store.clone());
        let older = state("a");
        let newer = scored(&older, 2);

        writer.stage(older.clone());
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        // The older write may be in flight; the newer state must land last
        writer.stage(newer.clone());
        store.gate.add_permits(2);
        writer.flush().await;

        assert_eq!(store.get(&older.key()).await.unwrap(), Some(newer));
        assert_eq!(writer.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_write_retries_then_succeeds() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        store.fail_next_puts(2);
        let writer = writer(store.clone());
        writer.stage(state("a"));
        writer.flush().await;
        assert_eq!(store.put_count(), 1);
        assert_eq!(writer.stats().retried.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_write_dropped_after_max_retries() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        store.fail_next_puts(10);
        let metrics = DetectionStats::new().unwrap();
        let writer = CheckpointWriter::new(config(), store.clone(), metrics.clone());
        writer.stage(state("a"));
        writer.flush().await;
        assert_eq!(store.put_count(), 0);
        assert_eq!(writer.stats().failed.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.checkpoint_flush_failures.get(), 1);
    }

    #[tokio::test]
    async fn test_missing_index() {
        let store = InMemoryCheckpointStore::new();
        store.set_index_missing(true);
        let err = store.get(&state("a").key()).await.unwrap_err();
        assert!(err.is_end_run());
    }
}
