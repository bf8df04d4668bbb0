//! Per-node entity model cache
//!
//! Holds the `ModelState` of every entity this node currently scores.
//! - Each entry sits behind its own async mutex, so scoring calls for one
//!   entity are serialized while different entities proceed in parallel.
//! - On a miss the state is reclaimed from the checkpoint writer's pending
//!   map, then read from the checkpoint store, then cold-started.
//! - When full, the entry with the lowest eviction score is evicted. Its state
//!   is staged with the checkpoint writer before the entry becomes
//!   unreachable, then flushed in the background.
//! - Eviction only considers entries it can lock without waiting; an entry in
//!   use is never evicted from under its holder.
//! - An entry removed while in use is parked as retiring until its holder lets
//!   go. A lookup of the same key waits for it, so one entity never has two
//!   live states.

use crate::checkpoint::{CheckpointStore, CheckpointWriter};
use crate::config::CacheConfig;
use crate::error::CheckpointError;
use crate::model::{Entity, EntityKey, ModelState};
use crate::scorer::AnomalyScorer;
use crate::stats::DetectionStats;
use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::{Mutex, OwnedMappedMutexGuard, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// ============================================================================
// EVICTION POLICY
// ============================================================================

/// Bookkeeping for one cache entry
#[derive(Debug, Clone)]
pub struct EntryMeta {
    pub hits: u64,
    pub created_at: Instant,
    pub last_access: Instant,
    pub last_checkpoint: Instant,
}

impl EntryMeta {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            hits: 1,
            created_at: now,
            last_access: now,
            last_checkpoint: now,
        }
    }

    fn touch(&mut self) {
        self.last_access = Instant::now();
        self.hits += 1;
    }
}

/// Ranks entries for eviction; lower scores are evicted first
pub trait EvictionPolicy: Send + Sync {
    fn eviction_score(&self, meta: &EntryMeta, now: Instant) -> f64;
}

/// Frequency-weighted recency: `max(ln(hits), 1) / (idle_secs + 1)`
#[derive(Debug, Default, Clone, Copy)]
pub struct RecencyFrequencyPolicy;

impl EvictionPolicy for RecencyFrequencyPolicy {
    fn eviction_score(&self, meta: &EntryMeta, now: Instant) -> f64 {
        let idle = now.saturating_duration_since(meta.last_access).as_secs_f64();
        let frequency = (meta.hits as f64).ln().max(1.0);
        frequency / (idle + 1.0)
    }
}

/// Plain least-recently-used
#[derive(Debug, Default, Clone, Copy)]
pub struct LeastRecentlyUsedPolicy;

impl EvictionPolicy for LeastRecentlyUsedPolicy {
    fn eviction_score(&self, meta: &EntryMeta, now: Instant) -> f64 {
        -now.saturating_duration_since(meta.last_access).as_secs_f64()
    }
}

// ============================================================================
// HANDLE
// ============================================================================

/// Where the state behind a handle came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateOrigin {
    Cached,
    /// Reclaimed from the checkpoint writer before it was flushed
    Pending,
    Checkpoint,
    ColdStart,
}

/// Exclusive access to one entity's state; the entry stays locked until dropped
pub struct EntityHandle {
    guard: OwnedMappedMutexGuard<Option<ModelState>, ModelState>,
    origin: StateOrigin,
    restore_error: Option<CheckpointError>,
}

impl EntityHandle {
    pub fn origin(&self) -> StateOrigin {
        self.origin
    }

    /// Checkpoint read failure that forced a cold start
    pub fn restore_error(&self) -> Option<&CheckpointError> {
        self.restore_error.as_ref()
    }
}

impl Deref for EntityHandle {
    type Target = ModelState;

    fn deref(&self) -> &ModelState {
        &self.guard
    }
}

impl DerefMut for EntityHandle {
    fn deref_mut(&mut self) -> &mut ModelState {
        &mut self.guard
    }
}

// ============================================================================
// CACHE
// ============================================================================

struct Slot {
    /// `None` while loading, or after the state was handed to the writer
    state: Arc<Mutex<Option<ModelState>>>,
    meta: parking_lot::Mutex<EntryMeta>,
    /// Set once the slot is no longer reachable through the map
    detached: AtomicBool,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(None)),
            meta: parking_lot::Mutex::new(EntryMeta::new()),
            detached: AtomicBool::new(false),
        }
    }
}

type SlotGuard = OwnedMutexGuard<Option<ModelState>>;

type RetiringMap = DashMap<EntityKey, Arc<Slot>>;

/// Stage a retiring slot's state and forget the slot
fn drain_retired(
    writer: &CheckpointWriter,
    retiring: &RetiringMap,
    key: &EntityKey,
    slot: &Arc<Slot>,
    mut guard: SlotGuard,
) {
    if let Some(state) = guard.take() {
        writer.stage(state);
    }
    drop(guard);
    retiring.remove_if(key, |_, current| Arc::ptr_eq(current, slot));
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub expired: usize,
    pub checkpointed: usize,
}

pub struct EntityCache {
    config: CacheConfig,
    entries: DashMap<EntityKey, Arc<Slot>>,
    /// Removed while in use; flushed once the holder lets go
    retiring: Arc<RetiringMap>,
    per_detector: DashMap<String, usize>,
    store: Arc<dyn CheckpointStore>,
    writer: Arc<CheckpointWriter>,
    scorer: Arc<dyn AnomalyScorer>,
    policy: Arc<dyn EvictionPolicy>,
    stats: DetectionStats,
    runtime: Handle,
}

impl EntityCache {
    /// Must be called inside a tokio runtime
    pub fn new(
        config: CacheConfig,
        store: Arc<dyn CheckpointStore>,
        writer: Arc<CheckpointWriter>,
        scorer: Arc<dyn AnomalyScorer>,
        stats: DetectionStats,
    ) -> Self {
        Self {
            config,
            entries: DashMap::new(),
            retiring: Arc::new(DashMap::new()),
            per_detector: DashMap::new(),
            store,
            writer,
            scorer,
            policy: Arc::new(RecencyFrequencyPolicy),
            stats,
            runtime: Handle::current(),
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn EvictionPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries removed while in use whose state is not staged yet
    pub fn retiring_len(&self) -> usize {
        self.retiring.len()
    }

    pub fn detector_len(&self, detector_id: &str) -> usize {
        self.per_detector.get(detector_id).map(|c| *c).unwrap_or(0)
    }

    pub fn contains(&self, detector_id: &str, entity: &Entity) -> bool {
        self.entries.contains_key(&EntityKey::new(detector_id, entity))
    }

    /// Lock the entity's state, loading or cold-starting it on a miss
    pub async fn get(&self, detector_id: &str, entity: &Entity, features: &[f64]) -> EntityHandle {
        let key = EntityKey::new(detector_id, entity);
        loop {
            let existing = self.entries.get(&key).map(|slot| slot.value().clone());
            if let Some(slot) = existing {
                let guard = slot.state.clone().lock_owned().await;
                if slot.detached.load(Ordering::Acquire) || guard.is_none() {
                    // Evicted while we waited, or an abandoned load
                    drop(guard);
                    self.unlink(&key, &slot);
                    continue;
                }
                slot.meta.lock().touch();
                if let Ok(mut mapped) = OwnedMutexGuard::try_map(guard, |state| state.as_mut()) {
                    mapped.last_used = Utc::now();
                    return EntityHandle {
                        guard: mapped,
                        origin: StateOrigin::Cached,
                        restore_error: None,
                    };
                }
                continue;
            }

            self.make_room(detector_id);

            let slot = Arc::new(Slot::new());
            let Ok(mut guard) = slot.state.clone().try_lock_owned() else {
                continue;
            };
            match self.entries.entry(key.clone()) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(vacant) => {
                    vacant.insert(slot.clone());
                    *self.per_detector.entry(detector_id.to_string()).or_insert(0) += 1;
                    self.stats.cache_entities.inc();
                }
            }

            self.await_retired(&key).await;
            let (state, origin, restore_error) =
                self.load(&key, detector_id, entity, features).await;
            *guard = Some(state);
            if let Ok(mut mapped) = OwnedMutexGuard::try_map(guard, |state| state.as_mut()) {
                mapped.last_used = Utc::now();
                return EntityHandle {
                    guard: mapped,
                    origin,
                    restore_error,
                };
            }
        }
    }

    /// Wait for a busy removal of `key` to let go, then stage its state
    async fn await_retired(&self, key: &EntityKey) {
        let retiring = self.retiring.get(key).map(|slot| slot.value().clone());
        if let Some(slot) = retiring {
            let guard = slot.state.clone().lock_owned().await;
            drain_retired(&self.writer, &self.retiring, key, &slot, guard);
        }
    }

    async fn load(
        &self,
        key: &EntityKey,
        detector_id: &str,
        entity: &Entity,
        features: &[f64],
    ) -> (ModelState, StateOrigin, Option<CheckpointError>) {
        if let Some(state) = self.writer.take_pending(key) {
            return (state, StateOrigin::Pending, None);
        }
        let cold =
            || ModelState::new(detector_id, entity.clone(), self.scorer.new_model(features.len()));
        match self.store.get(key).await {
            Ok(Some(state)) => (state, StateOrigin::Checkpoint, None),
            Ok(None) => (cold(), StateOrigin::ColdStart, None),
            Err(e) => {
                warn!(entity = %key, error = %e, "Checkpoint restore failed, cold starting");
                (cold(), StateOrigin::ColdStart, Some(e))
            }
        }
    }

    /// Drop one entity; its state is flushed in the background
    pub fn remove(&self, detector_id: &str, entity: &Entity) -> bool {
        let key = EntityKey::new(detector_id, entity);
        let Some(slot) = self.entries.get(&key).map(|s| s.value().clone()) else {
            return false;
        };
        self.retire(key, slot);
        true
    }

    /// Drop every entity of a detector; states are flushed in the background
    pub fn clear(&self, detector_id: &str) -> usize {
        let victims: Vec<(EntityKey, Arc<Slot>)> = self
            .entries
            .iter()
            .filter(|e| e.key().detector_id == detector_id)
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let count = victims.len();
        for (key, slot) in victims {
            self.retire(key, slot);
        }
        info!(detector_id, entities = count, "Cleared detector from entity cache");
        count
    }

    /// Expire idle entries and snapshot entries due for a checkpoint
    pub fn maintenance(&self) -> MaintenanceReport {
        let now = Instant::now();
        let ttl = self.config.entity_ttl();
        let interval = self.config.checkpoint_interval();
        let mut report = MaintenanceReport::default();

        let slots: Vec<(EntityKey, Arc<Slot>)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        for (key, slot) in slots {
            let meta = slot.meta.lock().clone();
            // Busy entries are neither idle nor safe to snapshot
            let Ok(mut guard) = slot.state.clone().try_lock_owned() else {
                continue;
            };
            if now.saturating_duration_since(meta.last_access) >= ttl {
                if self.evict_locked(&key, &slot, guard) {
                    self.stats.cache_evictions.inc();
                    report.expired += 1;
                }
            } else if now.saturating_duration_since(meta.last_checkpoint) >= interval {
                if let Some(state) = guard.as_mut() {
                    state.last_checkpoint = Some(Utc::now());
                    self.writer.stage(state.clone());
                    slot.meta.lock().last_checkpoint = now;
                    report.checkpointed += 1;
                }
            }
        }

        if report.expired > 0 || report.checkpointed > 0 {
            debug!(
                expired = report.expired,
                checkpointed = report.checkpointed,
                "Entity cache maintenance"
            );
        }
        report
    }

    /// Run `maintenance` every `period` until cancelled
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

    fn make_room(&self, detector_id: &str) {
        if let Some(cap) = self.config.max_entities_per_detector {
            while self.detector_len(detector_id) >= cap {
                if !self.evict_one(Some(detector_id)) {
                    break;
                }
            }
        }
        while self.entries.len() >= self.config.max_entities {
            // Every candidate busy: admit anyway rather than block
            if !self.evict_one(None) {
                break;
            }
        }
    }

    fn evict_one(&self, detector_id: Option<&str>) -> bool {
        let now = Instant::now();
        let mut candidates: Vec<(f64, EntityKey, Arc<Slot>)> = self
            .entries
            .iter()
            .filter(|e| detector_id.is_none_or(|d| e.key().detector_id == d))
            .map(|e| {
                let score = self.policy.eviction_score(&e.value().meta.lock(), now);
                (score, e.key().clone(), e.value().clone())
            })
            .collect();
        candidates.sort_by(|a, b| a.0.total_cmp(&b.0));

        for (score, key, slot) in candidates {
            let Ok(guard) = slot.state.clone().try_lock_owned() else {
                continue;
            };
            if self.evict_locked(&key, &slot, guard) {
                self.stats.cache_evictions.inc();
                debug!(entity = %key, score, "Evicted entity model");
            }
            return true;
        }
        false
    }

    /// Hand the state to the writer, then make the slot unreachable.
    /// Returns whether there was any state to flush.
    fn evict_locked(&self, key: &EntityKey, slot: &Arc<Slot>, mut guard: SlotGuard) -> bool {
        match guard.take() {
            Some(state) => {
                self.writer.stage(state);
                self.unlink(key, slot);
                drop(guard);
                true
            }
            None => {
                self.unlink(key, slot);
                false
            }
        }
    }

    fn retire(&self, key: EntityKey, slot: Arc<Slot>) {
        match slot.state.clone().try_lock_owned() {
            Ok(guard) => {
                self.evict_locked(&key, &slot, guard);
            }
            Err(_) => {
                // Parked before unlinking so a lookup never misses it
                self.retiring.insert(key.clone(), slot.clone());
                self.unlink(&key, &slot);
                let writer = self.writer.clone();
                let retiring = self.retiring.clone();
                self.runtime.spawn(async move {
                    let guard = slot.state.clone().lock_owned().await;
                    drain_retired(&writer, &retiring, &key, &slot, guard);
                });
            }
        }
    }

    fn unlink(&self, key: &EntityKey, slot: &Arc<Slot>) {
        slot.detached.store(true, Ordering::Release);
        let removed = self.entries.remove_if(key, |_, current| Arc::ptr_eq(current, slot));
        if removed.is_some() {
            if let Some(mut count) = self.per_detector.get_mut(&key.detector_id) {
                *count = count.saturating_sub(1);
            }
            self.stats.cache_entities.dec();
        }
    }
}
