//! Record stores behind the pipeline.
//!
//! The durable metadata store is an external collaborator; components only
//! see these traits and receive `Arc<dyn ...>` handles at construction. The
//! [`MemoryStore`] implementation backs tests and the simulation CLI.
//!
//! # Example
//! ```ignore
//! use upm_runtime::repository::{MemoryStore, Stores};
//!
//! let stores = Stores::in_memory();
//! let trainer = stores.trainers.load_trainer(&"fraud".into()).await?;
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use upm_core::{
    Adapter, AdapterId, BatchId, DriftWindow, DriftWindowId, FeatureBatch, Snapshot, SnapshotId,
    SnapshotStatus, TrainerId, TrainerRecord,
};

/// Error type for record store operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Conflicting write: {0}")]
    Conflict(String),

    #[error("Store backend error: {0}")]
    Backend(String),
}

/// Upstream feature store: full batches are fetched by id.
#[async_trait]
pub trait BatchSource: Send + Sync {
    async fn fetch_batch(&self, id: &BatchId) -> Result<FeatureBatch, StoreError>;
}

/// Checkpointed trainer state.
#[async_trait]
pub trait TrainerRepository: Send + Sync {
    async fn save_trainer(&self, record: &TrainerRecord) -> Result<(), StoreError>;

    async fn load_trainer(&self, id: &TrainerId) -> Result<Option<TrainerRecord>, StoreError>;
}

/// Snapshot metadata records.
#[async_trait]
pub trait SnapshotRepository: Send + Sync {
    /// Reserve the next version for a trainer. A version is never handed out
    /// twice, even if the snapshot that used it is later deleted.
    async fn allocate_version(&self, trainer_id: &TrainerId) -> Result<u64, StoreError>;

    /// Insert a new record. Fails with `Conflict` if the id already exists.
    async fn insert_snapshot(&self, snapshot: &Snapshot) -> Result<(), StoreError>;

    async fn get_snapshot(&self, id: &SnapshotId) -> Result<Option<Snapshot>, StoreError>;

    /// All snapshots of a trainer, ordered by version.
    async fn list_snapshots(&self, trainer_id: &TrainerId) -> Result<Vec<Snapshot>, StoreError>;

    async fn list_all_snapshots(&self) -> Result<Vec<Snapshot>, StoreError>;

    /// Replace an existing record. Fails with `NotFound` if it does not exist.
    async fn update_snapshot(&self, snapshot: &Snapshot) -> Result<(), StoreError>;

    /// Demote the trainer's activated snapshot (if any) to `demote_to` and
    /// activate `id`, as one atomic write. Returns the demoted snapshot id.
    async fn promote(
        &self,
        trainer_id: &TrainerId,
        id: &SnapshotId,
        demote_to: SnapshotStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<SnapshotId>, StoreError>;

    /// Remove a record. Removing a missing record is not an error.
    async fn delete_snapshot(&self, id: &SnapshotId) -> Result<(), StoreError>;
}

/// Registered downstream consumers.
#[async_trait]
pub trait AdapterRepository: Send + Sync {
    async fn upsert_adapter(&self, adapter: &Adapter) -> Result<(), StoreError>;

    async fn get_adapter(&self, id: &AdapterId) -> Result<Option<Adapter>, StoreError>;

    async fn list_adapters(&self) -> Result<Vec<Adapter>, StoreError>;

    async fn remove_adapter(&self, id: &AdapterId) -> Result<(), StoreError>;
}

/// Drift evaluation windows.
#[async_trait]
pub trait DriftWindowRepository: Send + Sync {
    async fn save_window(&self, window: &DriftWindow) -> Result<(), StoreError>;

    async fn list_windows(&self, trainer_id: &TrainerId) -> Result<Vec<DriftWindow>, StoreError>;
}

/// Explicit bundle of store handles passed to every component.
#[derive(Clone)]
pub struct Stores {
    pub batches: Arc<dyn BatchSource>,
    pub trainers: Arc<dyn TrainerRepository>,
    pub snapshots: Arc<dyn SnapshotRepository>,
    pub adapters: Arc<dyn AdapterRepository>,
    pub drift_windows: Arc<dyn DriftWindowRepository>,
}

impl Stores {
    /// Every handle backed by the same [`MemoryStore`].
    pub fn from_memory(store: Arc<MemoryStore>) -> Self {
        Self {
            batches: store.clone(),
            trainers: store.clone(),
            snapshots: store.clone(),
            adapters: store.clone(),
            drift_windows: store,
        }
    }

    pub fn in_memory() -> Self {
        Self::from_memory(Arc::new(MemoryStore::new()))
    }
}

/// In-memory record store for testing and simulation
#[derive(Default)]
pub struct MemoryStore {
    batches: RwLock<HashMap<BatchId, FeatureBatch>>,
    trainers: RwLock<HashMap<TrainerId, TrainerRecord>>,
    snapshots: RwLock<HashMap<SnapshotId, Snapshot>>,
    versions: RwLock<HashMap<TrainerId, u64>>,
    adapters: RwLock<BTreeMap<AdapterId, Adapter>>,
    windows: RwLock<HashMap<DriftWindowId, DriftWindow>>,
}

fn poisoned<E: std::fmt::Display>(e: E) -> StoreError {
    StoreError::Backend(e.to_string())
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a batch available to [`BatchSource::fetch_batch`].
    pub fn insert_batch(&self, batch: FeatureBatch) -> Result<(), StoreError> {
        let mut batches = self.batches.write().map_err(poisoned)?;
        batches.insert(batch.id.clone(), batch);
        Ok(())
    }

    pub fn batch_count(&self) -> usize {
        self.batches.read().map(|b| b.len()).unwrap_or(0)
    }
}

#[async_trait]
impl BatchSource for MemoryStore {
    async fn fetch_batch(&self, id: &BatchId) -> Result<FeatureBatch, StoreError> {
        let batches = self.batches.read().map_err(poisoned)?;
        batches
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("batch {}", id)))
    }
}

#[async_trait]
impl TrainerRepository for MemoryStore {
    async fn save_trainer(&self, record: &TrainerRecord) -> Result<(), StoreError> {
        let mut trainers = self.trainers.write().map_err(poisoned)?;
        trainers.insert(record.trainer_id.clone(), record.clone());
        Ok(())
    }

    async fn load_trainer(&self, id: &TrainerId) -> Result<Option<TrainerRecord>, StoreError> {
        let trainers = self.trainers.read().map_err(poisoned)?;
        Ok(trainers.get(id).cloned())
    }
}

#[async_trait]
impl SnapshotRepository for MemoryStore {
    async fn allocate_version(&self, trainer_id: &TrainerId) -> Result<u64, StoreError> {
        let mut versions = self.versions.write().map_err(poisoned)?;
        let next = versions.entry(trainer_id.clone()).or_insert(0);
        *next += 1;
        Ok(*next)
    }

    async fn insert_snapshot(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let mut snapshots = self.snapshots.write().map_err(poisoned)?;
        if snapshots.contains_key(&snapshot.id) {
            return Err(StoreError::Conflict(format!(
                "snapshot {} already exists",
                snapshot.id
            )));
        }
        snapshots.insert(snapshot.id.clone(), snapshot.clone());
        Ok(())
    }

    async fn get_snapshot(&self, id: &SnapshotId) -> Result<Option<Snapshot>, StoreError> {
        let snapshots = self.snapshots.read().map_err(poisoned)?;
        Ok(snapshots.get(id).cloned())
    }

    async fn list_snapshots(&self, trainer_id: &TrainerId) -> Result<Vec<Snapshot>, StoreError> {
        let snapshots = self.snapshots.read().map_err(poisoned)?;
        let mut list: Vec<Snapshot> = snapshots
            .values()
            .filter(|s| &s.trainer_id == trainer_id)
            .cloned()
            .collect();
        list.sort_by_key(|s| s.version);
        Ok(list)
    }

    async fn list_all_snapshots(&self) -> Result<Vec<Snapshot>, StoreError> {
        let snapshots = self.snapshots.read().map_err(poisoned)?;
        let mut list: Vec<Snapshot> = snapshots.values().cloned().collect();
        list.sort_by(|a, b| {
            a.trainer_id
                .cmp(&b.trainer_id)
                .then_with(|| a.version.cmp(&b.version))
        });
        Ok(list)
    }

    async fn update_snapshot(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let mut snapshots = self.snapshots.write().map_err(poisoned)?;
        match snapshots.get_mut(&snapshot.id) {
            Some(existing) => {
                *existing = snapshot.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("snapshot {}", snapshot.id))),
        }
    }

    async fn promote(
        &self,
        trainer_id: &TrainerId,
        id: &SnapshotId,
        demote_to: SnapshotStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<SnapshotId>, StoreError> {
        let mut snapshots = self.snapshots.write().map_err(poisoned)?;

        match snapshots.get(id) {
            Some(target) if &target.trainer_id == trainer_id => {}
            Some(target) => {
                return Err(StoreError::Conflict(format!(
                    "snapshot {} belongs to trainer {}, not {}",
                    id, target.trainer_id, trainer_id
                )))
            }
            None => return Err(StoreError::NotFound(format!("snapshot {}", id))),
        }

        let mut demoted = None;
        for snapshot in snapshots.values_mut() {
            if &snapshot.trainer_id == trainer_id
                && snapshot.status == SnapshotStatus::Activated
                && &snapshot.id != id
            {
                snapshot.status = demote_to;
                demoted = Some(snapshot.id.clone());
            }
        }

        if let Some(target) = snapshots.get_mut(id) {
            target.status = SnapshotStatus::Activated;
            target.activated_at = Some(at);
        }

        Ok(demoted)
    }

    async fn delete_snapshot(&self, id: &SnapshotId) -> Result<(), StoreError> {
        let mut snapshots = self.snapshots.write().map_err(poisoned)?;
        snapshots.remove(id);
        Ok(())
    }
}

#[async_trait]
impl AdapterRepository for MemoryStore {
    async fn upsert_adapter(&self, adapter: &Adapter) -> Result<(), StoreError> {
        let mut adapters = self.adapters.write().map_err(poisoned)?;
        adapters.insert(adapter.id.clone(), adapter.clone());
        Ok(())
    }

    async fn get_adapter(&self, id: &AdapterId) -> Result<Option<Adapter>, StoreError> {
        let adapters = self.adapters.read().map_err(poisoned)?;
        Ok(adapters.get(id).cloned())
    }

    async fn list_adapters(&self) -> Result<Vec<Adapter>, StoreError> {
        let adapters = self.adapters.read().map_err(poisoned)?;
        Ok(adapters.values().cloned().collect())
    }

    async fn remove_adapter(&self, id: &AdapterId) -> Result<(), StoreError> {
        let mut adapters = self.adapters.write().map_err(poisoned)?;
        adapters.remove(id);
        Ok(())
    }
}

#[async_trait]
impl DriftWindowRepository for MemoryStore {
    async fn save_window(&self, window: &DriftWindow) -> Result<(), StoreError> {
        let mut windows = self.windows.write().map_err(poisoned)?;
        windows.insert(window.id.clone(), window.clone());
        Ok(())
    }

    async fn list_windows(&self, trainer_id: &TrainerId) -> Result<Vec<DriftWindow>, StoreError> {
        let windows = self.windows.read().map_err(poisoned)?;
        let mut list: Vec<DriftWindow> = windows
            .values()
            .filter(|w| &w.trainer_id == trainer_id)
            .cloned()
            .collect();
        list.sort_by_key(|w| w.opened_at);
        Ok(list)
    }
}
