//! Durable, verifiable, versioned persistence of trainer parameters.
//!
//! Every snapshot is checksummed (sha256 of the uncompressed bytes) before it
//! is written and re-verified on every load. Promotion between rollout stages
//! goes through the [`ActivationPolicy`]; rollback deliberately does not.
//!
//! Per trainer, `create`, `begin_shadow`, `activate`, `rollback` and `delete`
//! serialize on an async mutex, and the demote+promote pair is a single
//! [`SnapshotRepository::promote`] call. No reader can observe two activated
//! snapshots for the same trainer.

pub mod blob;
pub mod codec;

pub use blob::BlobStore;
pub use codec::Codec;

use crate::event_bus::EventBus;
use crate::metrics::Metrics;
use crate::policy::{ActivationPolicy, PolicyDecision};
use crate::repository::{SnapshotRepository, StoreError};
use chrono::Utc;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};
use upm_core::{
    Actor, EventKind, Snapshot, SnapshotId, SnapshotMetadata, SnapshotStatus, TrainerId,
    TrainingMode, UpmEvent,
};
use uuid::Uuid;

/// Hex-encoded sha256 of `data`.
pub fn checksum(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("Checksum mismatch: declared {declared}, computed {computed}")]
    ChecksumMismatch { declared: String, computed: String },

    #[error("Integrity check failed for snapshot {id}: expected {expected}, found {actual}")]
    Integrity {
        id: SnapshotId,
        expected: String,
        actual: String,
    },

    #[error("Snapshot not found: {0}")]
    NotFound(SnapshotId),

    #[error("Snapshot {0} is activated and cannot be deleted")]
    ActiveSnapshot(SnapshotId),

    #[error("Invalid transition for snapshot {id}: {from} -> {to}")]
    InvalidTransition {
        id: SnapshotId,
        from: SnapshotStatus,
        to: SnapshotStatus,
    },

    #[error("Snapshot I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Codec error ({codec}): {message}")]
    Codec { codec: &'static str, message: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SnapshotError {
    /// Integrity failures are never worth retrying.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            SnapshotError::Integrity { .. } | SnapshotError::ChecksumMismatch { .. }
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Directory under which blobs are written.
    pub root: PathBuf,
    /// Preferred codec; resolved once when the manager is built.
    pub compression: Codec,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./snapshots"),
            compression: Codec::default(),
        }
    }
}

/// Parameters handed over by a trainer for persistence.
#[derive(Debug, Clone)]
pub struct CreateSnapshotRequest {
    pub trainer_id: TrainerId,
    pub mode: TrainingMode,
    pub params: Vec<u8>,
    /// Caller-declared sha256 of `params`.
    pub checksum: String,
    pub batch_count: u64,
    pub avg_loss: f64,
    pub labels: BTreeMap<String, String>,
    pub correlation_id: Uuid,
}

impl CreateSnapshotRequest {
    /// Build a request whose declared checksum is computed from `params`.
    pub fn new(trainer_id: TrainerId, mode: TrainingMode, params: Vec<u8>) -> Self {
        let checksum = checksum(&params);
        Self {
            trainer_id,
            mode,
            params,
            checksum,
            batch_count: 0,
            avg_loss: 0.0,
            labels: BTreeMap::new(),
            correlation_id: Uuid::new_v4(),
        }
    }

    pub fn with_stats(mut self, batch_count: u64, avg_loss: f64) -> Self {
        self.batch_count = batch_count;
        self.avg_loss = avg_loss;
        self
    }
}

#[derive(Debug, Clone)]
pub enum ActivationOutcome {
    Activated {
        snapshot: Snapshot,
        previous: Option<SnapshotId>,
    },
    /// The snapshot was already the trainer's active one. Nothing changed.
    AlreadyActive { snapshot: Snapshot },
    /// Policy refused the promotion. Nothing changed.
    Denied { reason: String },
}

impl ActivationOutcome {
    pub fn is_activated(&self) -> bool {
        matches!(
            self,
            ActivationOutcome::Activated { .. } | ActivationOutcome::AlreadyActive { .. }
        )
    }
}

pub struct SnapshotManager {
    repo: Arc<dyn SnapshotRepository>,
    blobs: BlobStore,
    codec: Codec,
    policy: Arc<dyn ActivationPolicy>,
    events: EventBus,
    metrics: Metrics,
    locks: Mutex<FxHashMap<TrainerId, Arc<tokio::sync::Mutex<()>>>>,
}

impl SnapshotManager {
    pub fn new(
        config: SnapshotConfig,
        repo: Arc<dyn SnapshotRepository>,
        policy: Arc<dyn ActivationPolicy>,
        events: EventBus,
        metrics: Metrics,
    ) -> Self {
        let codec = Codec::resolve(config.compression);
        info!(
            root = %config.root.display(),
            codec = %codec,
            "Snapshot manager ready"
        );
        Self {
            repo,
            blobs: BlobStore::new(config.root),
            codec,
            policy,
            events,
            metrics,
            locks: Mutex::new(FxHashMap::default()),
        }
    }

    /// Codec used for new snapshots.
    pub fn codec(&self) -> Codec {
        self.codec
    }

    fn trainer_lock(&self, trainer_id: &TrainerId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(trainer_id.clone()).or_default().clone()
    }

    async fn require(&self, id: &SnapshotId) -> Result<Snapshot, SnapshotError> {
        self.repo
            .get_snapshot(id)
            .await?
            .ok_or_else(|| SnapshotError::NotFound(id.clone()))
    }

    /// Verify, compress and persist a new snapshot in `created` status.
    pub async fn create(&self, request: CreateSnapshotRequest) -> Result<Snapshot, SnapshotError> {
        let computed = checksum(&request.params);
        if !computed.eq_ignore_ascii_case(&request.checksum) {
            warn!(
                trainer = %request.trainer_id,
                declared = %request.checksum,
                computed = %computed,
                "Refusing snapshot with mismatched checksum"
            );
            return Err(SnapshotError::ChecksumMismatch {
                declared: request.checksum,
                computed,
            });
        }

        let lock = self.trainer_lock(&request.trainer_id);
        let _guard = lock.lock().await;

        let version = self.repo.allocate_version(&request.trainer_id).await?;
        let id = SnapshotId::generate();
        let compressed = self.codec.compress(&request.params)?;
        let path = self.blobs.path_for(
            &request.trainer_id,
            version,
            &id,
            self.codec.extension(),
        );

        let size_bytes = self
            .blobs
            .write(&path, &compressed)
            .await
            .map_err(|source| SnapshotError::Io {
                path: path.clone(),
                source,
            })?;

        let snapshot = Snapshot {
            id: id.clone(),
            trainer_id: request.trainer_id.clone(),
            version,
            mode: request.mode,
            status: SnapshotStatus::Created,
            checksum: computed,
            storage_path: path.to_string_lossy().into_owned(),
            size_bytes,
            metadata: SnapshotMetadata {
                compression: self.codec.name().to_string(),
                original_size: request.params.len() as u64,
                batch_count: request.batch_count,
                avg_loss: request.avg_loss,
                labels: request.labels,
            },
            created_at: Utc::now(),
            shadow_started_at: None,
            activated_at: None,
        };

        if let Err(e) = self.repo.insert_snapshot(&snapshot).await {
            if let Err(cleanup) = self.blobs.remove(&path).await {
                warn!(path = %path.display(), "Failed to remove orphaned blob: {}", cleanup);
            }
            return Err(e.into());
        }

        info!(
            trainer = %snapshot.trainer_id,
            snapshot = %snapshot.id,
            version,
            size_bytes,
            codec = %self.codec,
            "Snapshot created"
        );
        self.metrics
            .record_snapshot(snapshot.trainer_id.as_str(), size_bytes, version);
        self.events.publish(UpmEvent::new(
            snapshot.trainer_id.clone(),
            request.correlation_id,
            EventKind::SnapshotCreated {
                snapshot_id: snapshot.id.clone(),
                version,
                mode: snapshot.mode,
                size_bytes,
                batch_count: snapshot.metadata.batch_count,
            },
        ));
        Ok(snapshot)
    }

    /// Read, decompress and verify a snapshot's parameters.
    pub async fn load(&self, id: &SnapshotId) -> Result<Vec<u8>, SnapshotError> {
        let snapshot = self.require(id).await?;
        self.load_snapshot(&snapshot).await
    }

    pub async fn load_snapshot(&self, snapshot: &Snapshot) -> Result<Vec<u8>, SnapshotError> {
        let path = PathBuf::from(&snapshot.storage_path);
        let raw = self
            .blobs
            .read(&path)
            .await
            .map_err(|source| SnapshotError::Io {
                path: path.clone(),
                source,
            })?;

        let codec = Codec::from_name(&snapshot.metadata.compression).ok_or_else(|| {
            SnapshotError::Codec {
                codec: "unknown",
                message: format!(
                    "snapshot {} was written with unsupported codec '{}'",
                    snapshot.id, snapshot.metadata.compression
                ),
            }
        })?;
        let params = codec.decompress(&raw)?;

        let actual = checksum(&params);
        if actual != snapshot.checksum {
            warn!(
                snapshot = %snapshot.id,
                expected = %snapshot.checksum,
                actual = %actual,
                "Snapshot failed integrity check"
            );
            return Err(SnapshotError::Integrity {
                id: snapshot.id.clone(),
                expected: snapshot.checksum.clone(),
                actual,
            });
        }
        Ok(params)
    }

    /// Move a freshly created snapshot into shadow validation.
    pub async fn begin_shadow(&self, id: &SnapshotId) -> Result<Snapshot, SnapshotError> {
        let trainer_id = self.require(id).await?.trainer_id;
        let lock = self.trainer_lock(&trainer_id);
        let _guard = lock.lock().await;

        let mut snapshot = self.require(id).await?;
        match snapshot.status {
            SnapshotStatus::Shadow => return Ok(snapshot),
            SnapshotStatus::Created => {}
            from => {
                return Err(SnapshotError::InvalidTransition {
                    id: id.clone(),
                    from,
                    to: SnapshotStatus::Shadow,
                })
            }
        }

        snapshot.status = SnapshotStatus::Shadow;
        snapshot.shadow_started_at = Some(Utc::now());
        self.repo.update_snapshot(&snapshot).await?;
        info!(trainer = %trainer_id, snapshot = %id, "Snapshot entered shadow validation");
        Ok(snapshot)
    }

    /// Promote a snapshot, subject to policy for non-shadow modes.
    pub async fn activate(
        &self,
        id: &SnapshotId,
        actor: &Actor,
        tenant: Option<&str>,
    ) -> Result<ActivationOutcome, SnapshotError> {
        self.activate_with_correlation(id, actor, tenant, Uuid::new_v4())
            .await
    }

    pub async fn activate_with_correlation(
        &self,
        id: &SnapshotId,
        actor: &Actor,
        tenant: Option<&str>,
        correlation_id: Uuid,
    ) -> Result<ActivationOutcome, SnapshotError> {
        let trainer_id = self.require(id).await?.trainer_id;
        let lock = self.trainer_lock(&trainer_id);
        let _guard = lock.lock().await;

        let snapshot = self.require(id).await?;
        match snapshot.status {
            SnapshotStatus::Activated => {
                debug!(snapshot = %id, "Snapshot already active");
                return Ok(ActivationOutcome::AlreadyActive { snapshot });
            }
            SnapshotStatus::Created | SnapshotStatus::Shadow => {}
            from => {
                return Err(SnapshotError::InvalidTransition {
                    id: id.clone(),
                    from,
                    to: SnapshotStatus::Activated,
                })
            }
        }

        if snapshot.mode != TrainingMode::Shadow {
            if let PolicyDecision::Deny(reason) =
                self.policy.can_activate(actor, &snapshot, tenant).await
            {
                info!(
                    trainer = %trainer_id,
                    snapshot = %id,
                    actor = %actor.id,
                    reason = %reason,
                    "Activation denied"
                );
                return Ok(ActivationOutcome::Denied { reason });
            }
        }

        let previous = self
            .repo
            .promote(&trainer_id, id, SnapshotStatus::Archived, Utc::now())
            .await?;
        let snapshot = self.require(id).await?;

        info!(
            trainer = %trainer_id,
            snapshot = %id,
            version = snapshot.version,
            mode = %snapshot.mode,
            actor = %actor.id,
            previous = ?previous.as_ref().map(|p| p.as_str()),
            "Snapshot activated"
        );
        self.events.publish(UpmEvent::new(
            trainer_id,
            correlation_id,
            EventKind::SnapshotActivated {
                snapshot_id: snapshot.id.clone(),
                version: snapshot.version,
                mode: snapshot.mode,
                previous_snapshot_id: previous.clone(),
                actor: actor.id.clone(),
            },
        ));
        Ok(ActivationOutcome::Activated { snapshot, previous })
    }

    /// Make `id` the active snapshot again, bypassing rollout policy.
    ///
    /// The target's blob is verified before anything changes.
    pub async fn rollback(&self, id: &SnapshotId, reason: &str) -> Result<Snapshot, SnapshotError> {
        self.rollback_with_correlation(id, reason, Uuid::new_v4())
            .await
    }

    pub async fn rollback_with_correlation(
        &self,
        id: &SnapshotId,
        reason: &str,
        correlation_id: Uuid,
    ) -> Result<Snapshot, SnapshotError> {
        let trainer_id = self.require(id).await?.trainer_id;
        let lock = self.trainer_lock(&trainer_id);
        let _guard = lock.lock().await;

        let target = self.require(id).await?;
        self.load_snapshot(&target).await?;

        let previous = if target.status == SnapshotStatus::Activated {
            None
        } else {
            self.repo
                .promote(&trainer_id, id, SnapshotStatus::RolledBack, Utc::now())
                .await?
        };
        let snapshot = self.require(id).await?;

        warn!(
            trainer = %trainer_id,
            from = ?previous.as_ref().map(|p| p.as_str()),
            to = %id,
            version = snapshot.version,
            reason,
            "Rolled back snapshot"
        );
        self.events.publish(UpmEvent::new(
            trainer_id,
            correlation_id,
            EventKind::Rollback {
                from_snapshot_id: previous,
                to_snapshot_id: snapshot.id.clone(),
                to_version: snapshot.version,
                mode: snapshot.mode,
                reason: reason.to_string(),
            },
        ));
        Ok(snapshot)
    }

    /// Remove a non-active snapshot and its blob.
    pub async fn delete(&self, id: &SnapshotId) -> Result<(), SnapshotError> {
        let trainer_id = self.require(id).await?.trainer_id;
        let lock = self.trainer_lock(&trainer_id);
        let _guard = lock.lock().await;

        let snapshot = self.require(id).await?;
        if snapshot.status == SnapshotStatus::Activated {
            return Err(SnapshotError::ActiveSnapshot(id.clone()));
        }

        let path = PathBuf::from(&snapshot.storage_path);
        self.blobs
            .remove(&path)
            .await
            .map_err(|source| SnapshotError::Io { path, source })?;
        self.repo.delete_snapshot(id).await?;
        debug!(trainer = %trainer_id, snapshot = %id, "Snapshot deleted");
        Ok(())
    }

    /// Garbage-collect terminal snapshots older than `retention`.
    pub async fn cleanup_old(&self, retention: Duration) -> Result<usize, SnapshotError> {
        let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(retention)
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);

        let mut removed = 0;
        for snapshot in self.repo.list_all_snapshots().await? {
            if !snapshot.status.is_terminal() || snapshot.created_at >= cutoff {
                continue;
            }
            match self.delete(&snapshot.id).await {
                Ok(()) => removed += 1,
                Err(SnapshotError::ActiveSnapshot(_)) | Err(SnapshotError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        if removed > 0 {
            info!(removed, "Cleaned up old snapshots");
        }
        Ok(removed)
    }

    pub async fn list(&self, trainer_id: &TrainerId) -> Result<Vec<Snapshot>, SnapshotError> {
        Ok(self.repo.list_snapshots(trainer_id).await?)
    }

    pub async fn get(&self, id: &SnapshotId) -> Result<Option<Snapshot>, SnapshotError> {
        Ok(self.repo.get_snapshot(id).await?)
    }

    pub async fn active_for(
        &self,
        trainer_id: &TrainerId,
    ) -> Result<Option<Snapshot>, SnapshotError> {
        Ok(self
            .repo
            .list_snapshots(trainer_id)
            .await?
            .into_iter()
            .find(|s| s.status == SnapshotStatus::Activated))
    }

    /// Highest-version snapshot of a trainer, whatever its status.
    pub async fn latest_for(
        &self,
        trainer_id: &TrainerId,
    ) -> Result<Option<Snapshot>, SnapshotError> {
        Ok(self.repo.list_snapshots(trainer_id).await?.into_iter().last())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{AllowAllPolicy, PolicyConfig, StagedRolloutPolicy};
    use crate::repository::MemoryStore;
    use upm_core::Role;

    struct Harness {
        _dir: tempfile::TempDir,
        manager: SnapshotManager,
        store: Arc<MemoryStore>,
        bus: EventBus,
    }

    fn harness_with(codec: Codec, policy: Arc<dyn ActivationPolicy>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let bus = EventBus::new();
        let manager = SnapshotManager::new(
            SnapshotConfig {
                root: dir.path().to_path_buf(),
                compression: codec,
            },
            store.clone(),
            policy,
            bus.clone(),
            Metrics::new(),
        );
        Harness {
            _dir: dir,
            manager,
            store,
            bus,
        }
    }

    fn harness() -> Harness {
        harness_with(Codec::Gzip, Arc::new(AllowAllPolicy))
    }

    fn request(trainer: &str, mode: TrainingMode, params: &[u8]) -> CreateSnapshotRequest {
        CreateSnapshotRequest::new(trainer.into(), mode, params.to_vec())
    }

    #[tokio::test]
    async fn test_create_then_load() {
        let h = harness();
        let s = h
            .manager
            .create(request("t1", TrainingMode::Shadow, b"weights-v1"))
            .await
            .unwrap();
        assert_eq!(s.version, 1);
        assert_eq!(s.status, SnapshotStatus::Created);
        assert_eq!(s.metadata.compression, "gzip");
        assert_eq!(s.metadata.original_size, 10);
        assert!(s.storage_path.ends_with(&format!("t1/v1-{}.gz", s.id)));
        assert_eq!(h.manager.load(&s.id).await.unwrap(), b"weights-v1");
    }

    #[tokio::test]
    async fn test_checksum_mismatch_writes_nothing() {
        let h = harness();
        let mut req = request("t1", TrainingMode::Shadow, b"weights");
        req.checksum = checksum(b"other");
        let err = h.manager.create(req).await.unwrap_err();
        assert!(matches!(err, SnapshotError::ChecksumMismatch { .. }));
        assert!(h.manager.list(&"t1".into()).await.unwrap().is_empty());
        assert!(!h.manager.blobs.root().join("t1").exists());
    }

    #[tokio::test]
    async fn test_tampered_blob_fails_integrity() {
        let h = harness_with(Codec::None, Arc::new(AllowAllPolicy));
        let s = h
            .manager
            .create(request("t1", TrainingMode::Shadow, b"weights"))
            .await
            .unwrap();
        std::fs::write(&s.storage_path, b"tampered").unwrap();
        let err = h.manager.load(&s.id).await.unwrap_err();
        assert!(err.is_integrity());
    }

    #[tokio::test]
    async fn test_versions_strictly_increase_after_delete() {
        let h = harness();
        let s1 = h
            .manager
            .create(request("t1", TrainingMode::Shadow, b"a"))
            .await
            .unwrap();
        h.manager.delete(&s1.id).await.unwrap();
        let s2 = h
            .manager
            .create(request("t1", TrainingMode::Shadow, b"b"))
            .await
            .unwrap();
        assert_eq!(s2.version, 2);
    }

    #[tokio::test]
    async fn test_activate_archives_previous() {
        let h = harness();
        let mut sub = h.bus.subscribe();
        let s1 = h
            .manager
            .create(request("t1", TrainingMode::Shadow, b"a"))
            .await
            .unwrap();
        let s2 = h
            .manager
            .create(request("t1", TrainingMode::Shadow, b"b"))
            .await
            .unwrap();

        let admin = Actor::admin("root");
        h.manager.activate(&s1.id, &admin, None).await.unwrap();
        let outcome = h.manager.activate(&s2.id, &admin, None).await.unwrap();
        match outcome {
            ActivationOutcome::Activated { previous, .. } => assert_eq!(previous, Some(s1.id.clone())),
            other => panic!("unexpected outcome: {:?}", other),
        }

        let s1 = h.manager.get(&s1.id).await.unwrap().unwrap();
        assert_eq!(s1.status, SnapshotStatus::Archived);
        assert_eq!(
            h.manager.active_for(&"t1".into()).await.unwrap().unwrap().id,
            s2.id
        );

        let names: Vec<&str> = sub.drain().iter().map(|e| e.name()).collect();
        assert_eq!(
            names,
            vec![
                "snapshot.created",
                "snapshot.created",
                "snapshot.activated",
                "snapshot.activated"
            ]
        );
    }

    #[tokio::test]
    async fn test_activate_is_idempotent() {
        let h = harness();
        let s = h
            .manager
            .create(request("t1", TrainingMode::Shadow, b"a"))
            .await
            .unwrap();
        let admin = Actor::admin("root");
        h.manager.activate(&s.id, &admin, None).await.unwrap();
        let mut sub = h.bus.subscribe();
        let again = h.manager.activate(&s.id, &admin, None).await.unwrap();
        assert!(matches!(again, ActivationOutcome::AlreadyActive { .. }));
        assert!(sub.drain().is_empty());
    }

    #[tokio::test]
    async fn test_denied_activation_changes_nothing() {
        let policy = StagedRolloutPolicy::new(PolicyConfig::default());
        let h = harness_with(Codec::Gzip, Arc::new(policy));
        let s = h
            .manager
            .create(request("t1", TrainingMode::Canary, b"a"))
            .await
            .unwrap();
        let mut sub = h.bus.subscribe();
        let outcome = h
            .manager
            .activate(&s.id, &Actor::operator("op"), Some("acme"))
            .await
            .unwrap();
        assert!(matches!(outcome, ActivationOutcome::Denied { .. }));
        let s = h.manager.get(&s.id).await.unwrap().unwrap();
        assert_eq!(s.status, SnapshotStatus::Created);
        assert!(sub.drain().is_empty());
    }

    #[tokio::test]
    async fn test_shadow_mode_skips_policy() {
        let policy = StagedRolloutPolicy::new(PolicyConfig::default());
        let h = harness_with(Codec::Gzip, Arc::new(policy));
        let s = h
            .manager
            .create(request("t1", TrainingMode::Shadow, b"a"))
            .await
            .unwrap();
        let outcome = h
            .manager
            .activate(&s.id, &Actor::new("v", Role::Viewer), None)
            .await
            .unwrap();
        assert!(outcome.is_activated());
    }

    #[tokio::test]
    async fn test_rollback_marks_previous_rolled_back() {
        let h = harness();
        let admin = Actor::admin("root");
        let s1 = h
            .manager
            .create(request("t1", TrainingMode::Shadow, b"a"))
            .await
            .unwrap();
        h.manager.activate(&s1.id, &admin, None).await.unwrap();
        let s2 = h
            .manager
            .create(request("t1", TrainingMode::Shadow, b"b"))
            .await
            .unwrap();
        h.manager.activate(&s2.id, &admin, None).await.unwrap();

        let mut sub = h.bus.subscribe();
        let restored = h.manager.rollback(&s1.id, "drift breach").await.unwrap();
        assert_eq!(restored.status, SnapshotStatus::Activated);
        let s2 = h.manager.get(&s2.id).await.unwrap().unwrap();
        assert_eq!(s2.status, SnapshotStatus::RolledBack);

        let events = sub.drain();
        assert_eq!(events.len(), 1);
        match &events[0].kind {
            EventKind::Rollback {
                from_snapshot_id,
                reason,
                ..
            } => {
                assert_eq!(from_snapshot_id.as_ref(), Some(&s2.id));
                assert_eq!(reason, "drift breach");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rollback_to_corrupt_target_changes_nothing() {
        let h = harness_with(Codec::None, Arc::new(AllowAllPolicy));
        let admin = Actor::admin("root");
        let s1 = h
            .manager
            .create(request("t1", TrainingMode::Shadow, b"a"))
            .await
            .unwrap();
        let s2 = h
            .manager
            .create(request("t1", TrainingMode::Shadow, b"b"))
            .await
            .unwrap();
        h.manager.activate(&s2.id, &admin, None).await.unwrap();
        std::fs::write(&s1.storage_path, b"zz").unwrap();

        let err = h.manager.rollback(&s1.id, "test").await.unwrap_err();
        assert!(err.is_integrity());
        assert_eq!(
            h.manager.active_for(&"t1".into()).await.unwrap().unwrap().id,
            s2.id
        );
    }

    #[tokio::test]
    async fn test_delete_refuses_active() {
        let h = harness();
        let s = h
            .manager
            .create(request("t1", TrainingMode::Shadow, b"a"))
            .await
            .unwrap();
        h.manager
            .activate(&s.id, &Actor::admin("root"), None)
            .await
            .unwrap();
        let err = h.manager.delete(&s.id).await.unwrap_err();
        assert!(matches!(err, SnapshotError::ActiveSnapshot(_)));
    }

    #[tokio::test]
    async fn test_delete_with_missing_blob_succeeds() {
        let h = harness();
        let s = h
            .manager
            .create(request("t1", TrainingMode::Shadow, b"a"))
            .await
            .unwrap();
        std::fs::remove_file(&s.storage_path).unwrap();
        h.manager.delete(&s.id).await.unwrap();
        assert!(h.store.get_snapshot(&s.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_begin_shadow_transition() {
        let h = harness();
        let s = h
            .manager
            .create(request("t1", TrainingMode::Active, b"a"))
            .await
            .unwrap();
        let shadowed = h.manager.begin_shadow(&s.id).await.unwrap();
        assert_eq!(shadowed.status, SnapshotStatus::Shadow);
        assert!(shadowed.shadow_started_at.is_some());

        h.manager
            .activate(&s.id, &Actor::admin("root"), None)
            .await
            .unwrap();
        let err = h.manager.begin_shadow(&s.id).await.unwrap_err();
        assert!(matches!(err, SnapshotError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_terminal() {
        let h = harness();
        let admin = Actor::admin("root");
        let s1 = h
            .manager
            .create(request("t1", TrainingMode::Shadow, b"a"))
            .await
            .unwrap();
        h.manager.activate(&s1.id, &admin, None).await.unwrap();
        let s2 = h
            .manager
            .create(request("t1", TrainingMode::Shadow, b"b"))
            .await
            .unwrap();
        h.manager.activate(&s2.id, &admin, None).await.unwrap();
        let s3 = h
            .manager
            .create(request("t1", TrainingMode::Shadow, b"c"))
            .await
            .unwrap();

        let removed = h.manager.cleanup_old(Duration::ZERO).await.unwrap();
        assert_eq!(removed, 1);
        assert!(h.manager.get(&s1.id).await.unwrap().is_none());
        assert!(h.manager.get(&s2.id).await.unwrap().is_some());
        assert!(h.manager.get(&s3.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_concurrent_activations_leave_one_active() {
        let h = Arc::new(harness());
        let mut ids = Vec::new();
        for i in 0..8u8 {
            let s = h
                .manager
                .create(request("t1", TrainingMode::Shadow, &[i]))
                .await
                .unwrap();
            ids.push(s.id);
        }

        let mut tasks = tokio::task::JoinSet::new();
        for id in ids {
            let h = h.clone();
            tasks.spawn(async move {
                // Losers may already be archived by the time they run
                let _ = h.manager.activate(&id, &Actor::admin("root"), None).await;
            });
        }
        while let Some(res) = tasks.join_next().await {
            res.unwrap();
        }

        let active = h
            .manager
            .list(&"t1".into())
            .await
            .unwrap()
            .into_iter()
            .filter(|s| s.status == SnapshotStatus::Activated)
            .count();
        assert_eq!(active, 1);
    }
}
