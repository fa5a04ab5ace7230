//! Propagation of activated snapshots to registered adapters.
//!
//! A sync run selects every adapter whose mode matches the snapshot's mode
//! and dispatches them in fixed-size batches with a short pause between
//! batches. A batch is dispatched without waiting for the previous one to
//! finish. Each adapter retries independently with exponential backoff;
//! one slow or failing adapter never holds up another.
//!
//! Runs touching the same adapter are serialized. A run for the trainer's
//! active snapshot stops as soon as another snapshot becomes active, so an
//! adapter is never left `synced` to a demoted snapshot.

use crate::event_bus::EventSubscription;
use crate::event_bus::EventBus;
use crate::metrics::Metrics;
use crate::repository::{AdapterRepository, StoreError};
use crate::snapshot::{SnapshotError, SnapshotManager};
use async_trait::async_trait;
use chrono::Utc;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use upm_core::{
    Adapter, AdapterId, EventKind, Snapshot, SnapshotId, SnapshotStatus, SyncStatus, UpmEvent,
};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Push timed out after {0:?}")]
    Timeout(Duration),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Adapters dispatched per batch.
    pub batch_size: usize,
    /// Pause between dispatching consecutive batches.
    #[serde(with = "crate::serde_duration")]
    pub batch_pause: Duration,
    /// Timeout of a single push.
    #[serde(with = "crate::serde_duration")]
    pub push_timeout: Duration,
    /// Attempts per adapter before it is marked errored.
    pub max_attempts: u32,
    #[serde(with = "crate::serde_duration")]
    pub backoff_base: Duration,
    #[serde(with = "crate::serde_duration")]
    pub backoff_max: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            batch_pause: Duration::from_millis(100),
            push_timeout: Duration::from_secs(30),
            max_attempts: 3,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
        }
    }
}

/// Delivery mechanism for snapshot parameters.
#[async_trait]
pub trait AdapterTransport: Send + Sync {
    async fn push(&self, adapter: &Adapter, snapshot: &Snapshot, params: &[u8])
        -> Result<(), SyncError>;
}

/// POSTs parameters to `<endpoint>/snapshots`.
pub struct HttpAdapterTransport {
    client: reqwest::Client,
    api_key: Option<String>,
}

impl HttpAdapterTransport {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
        }
    }
}

#[async_trait]
impl AdapterTransport for HttpAdapterTransport {
    async fn push(
        &self,
        adapter: &Adapter,
        snapshot: &Snapshot,
        params: &[u8],
    ) -> Result<(), SyncError> {
        let endpoint = adapter.endpoint.as_deref().ok_or_else(|| {
            SyncError::Transport(format!("adapter {} has no endpoint", adapter.id))
        })?;
        let url = format!("{}/snapshots", endpoint.trim_end_matches('/'));

        let mut request = self
            .client
            .post(&url)
            .header("content-type", "application/octet-stream")
            .header("x-upm-trainer-id", snapshot.trainer_id.as_str())
            .header("x-upm-snapshot-id", snapshot.id.as_str())
            .header("x-upm-snapshot-version", snapshot.version.to_string())
            .header("x-upm-checksum", snapshot.checksum.as_str())
            .body(params.to_vec());
        if let Some(key) = &self.api_key {
            request = request.header("x-api-key", key);
        }

        match request.send().await {
            Ok(resp) if resp.status().is_success() => Ok(()),
            Ok(resp) => Err(SyncError::Transport(format!(
                "{} responded HTTP {}",
                url,
                resp.status()
            ))),
            Err(e) => Err(SyncError::Transport(format!("cannot reach {}: {}", url, e))),
        }
    }
}

/// Logs each push and succeeds. Used by simulations.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingTransport;

#[async_trait]
impl AdapterTransport for LoggingTransport {
    async fn push(
        &self,
        adapter: &Adapter,
        snapshot: &Snapshot,
        params: &[u8],
    ) -> Result<(), SyncError> {
        info!(
            adapter = %adapter.id,
            snapshot = %snapshot.id,
            version = snapshot.version,
            bytes = params.len(),
            "Pushed snapshot to adapter"
        );
        Ok(())
    }
}

/// Outcome of one sync run.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub synced: Vec<AdapterId>,
    pub failed: Vec<AdapterId>,
    /// Adapters left alone because a newer snapshot became active.
    pub superseded: Vec<AdapterId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AdapterOutcome {
    Synced,
    Superseded,
}

type AdapterLocks = Mutex<FxHashMap<AdapterId, Arc<AsyncMutex<()>>>>;

#[derive(Clone)]
pub struct AdapterSync {
    config: SyncConfig,
    adapters: Arc<dyn AdapterRepository>,
    snapshots: Arc<SnapshotManager>,
    transport: Arc<dyn AdapterTransport>,
    events: EventBus,
    metrics: Metrics,
    adapter_locks: Arc<AdapterLocks>,
}

impl AdapterSync {
    pub fn new(
        config: SyncConfig,
        adapters: Arc<dyn AdapterRepository>,
        snapshots: Arc<SnapshotManager>,
        transport: Arc<dyn AdapterTransport>,
        events: EventBus,
        metrics: Metrics,
    ) -> Self {
        Self {
            config,
            adapters,
            snapshots,
            transport,
            events,
            metrics,
            adapter_locks: Arc::new(Mutex::new(FxHashMap::default())),
        }
    }

    /// Register or re-register an adapter. Always resets it to `pending`.
    pub async fn register(&self, mut adapter: Adapter) -> Result<Adapter, SyncError> {
        adapter.sync_status = SyncStatus::Pending;
        adapter.last_error = None;
        self.adapters.upsert_adapter(&adapter).await?;
        info!(adapter = %adapter.id, mode = %adapter.mode, "Adapter registered");
        Ok(adapter)
    }

    pub async fn list(&self) -> Result<Vec<Adapter>, SyncError> {
        Ok(self.adapters.list_adapters().await?)
    }

    pub async fn sync_all(&self, snapshot_id: &SnapshotId) -> Result<SyncReport, SyncError> {
        self.sync_all_with_correlation(snapshot_id, Uuid::new_v4())
            .await
    }

    /// Push `snapshot_id` to every adapter whose mode matches it.
    ///
    /// If the snapshot is active when the run starts, the run is abandoned
    /// for every adapter not yet synced once it stops being active.
    pub async fn sync_all_with_correlation(
        &self,
        snapshot_id: &SnapshotId,
        correlation_id: Uuid,
    ) -> Result<SyncReport, SyncError> {
        self.run(snapshot_id, correlation_id, false).await
    }

    async fn run(
        &self,
        snapshot_id: &SnapshotId,
        correlation_id: Uuid,
        require_active: bool,
    ) -> Result<SyncReport, SyncError> {
        let snapshot = self
            .snapshots
            .get(snapshot_id)
            .await?
            .ok_or_else(|| SnapshotError::NotFound(snapshot_id.clone()))?;
        let track_active = snapshot.status == SnapshotStatus::Activated;
        if require_active && !track_active {
            info!(
                snapshot = %snapshot.id,
                status = %snapshot.status,
                "Snapshot is no longer active, skipping adapter sync"
            );
            return Ok(SyncReport::default());
        }
        let targets: Vec<Adapter> = self
            .adapters
            .list_adapters()
            .await?
            .into_iter()
            .filter(|a| a.mode == snapshot.mode)
            .collect();

        info!(
            snapshot = %snapshot.id,
            version = snapshot.version,
            mode = %snapshot.mode,
            adapters = targets.len(),
            "Starting adapter sync"
        );

        let snapshot = Arc::new(snapshot);
        let mut tasks = JoinSet::new();
        let batch_size = self.config.batch_size.max(1);
        let batches: Vec<&[Adapter]> = targets.chunks(batch_size).collect();
        for (i, batch) in batches.iter().enumerate() {
            for adapter in batch.iter() {
                let this = self.clone();
                let snapshot = snapshot.clone();
                let adapter_id = adapter.id.clone();
                tasks.spawn(async move {
                    let result = this
                        .sync_adapter(&adapter_id, &snapshot, correlation_id, track_active)
                        .await;
                    (adapter_id, result)
                });
            }
            if i + 1 < batches.len() {
                tokio::time::sleep(self.config.batch_pause).await;
            }
        }

        let mut report = SyncReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((id, Ok(AdapterOutcome::Synced))) => report.synced.push(id),
                Ok((id, Ok(AdapterOutcome::Superseded))) => report.superseded.push(id),
                Ok((id, Err(e))) => {
                    debug!(adapter = %id, "Adapter sync failed: {}", e);
                    report.failed.push(id);
                }
                Err(e) => error!("Adapter sync task panicked: {}", e),
            }
        }
        report.synced.sort();
        report.failed.sort();
        report.superseded.sort();

        info!(
            snapshot = %snapshot.id,
            synced = report.synced.len(),
            failed = report.failed.len(),
            superseded = report.superseded.len(),
            "Adapter sync finished"
        );
        Ok(report)
    }

    fn adapter_lock(&self, adapter_id: &AdapterId) -> Arc<AsyncMutex<()>> {
        let mut locks = self.adapter_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(adapter_id.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    async fn still_active(&self, snapshot: &Snapshot) -> Result<bool, SyncError> {
        Ok(self
            .snapshots
            .active_for(&snapshot.trainer_id)
            .await?
            .is_some_and(|active| active.id == snapshot.id))
    }

    async fn supersede(
        &self,
        adapter_id: &AdapterId,
        snapshot: &Snapshot,
        started: Instant,
        status_touched: bool,
    ) -> Result<AdapterOutcome, SyncError> {
        info!(
            adapter = %adapter_id,
            snapshot = %snapshot.id,
            "Snapshot was superseded, abandoning push"
        );
        if status_touched {
            self.set_status(adapter_id, SyncStatus::Pending, None, None)
                .await?;
        }
        self.metrics
            .record_sync("superseded", started.elapsed().as_secs_f64());
        Ok(AdapterOutcome::Superseded)
    }

    async fn sync_adapter(
        &self,
        adapter_id: &AdapterId,
        snapshot: &Snapshot,
        correlation_id: Uuid,
        track_active: bool,
    ) -> Result<AdapterOutcome, SyncError> {
        let lock = self.adapter_lock(adapter_id);
        let _guard = lock.lock().await;
        let started = Instant::now();
        if track_active && !self.still_active(snapshot).await? {
            return self.supersede(adapter_id, snapshot, started, false).await;
        }
        self.set_status(adapter_id, SyncStatus::Syncing, None, None)
            .await?;

        let params = match self.snapshots.load_snapshot(snapshot).await {
            Ok(params) => params,
            Err(e) => {
                let err = SyncError::from(e);
                error!(
                    adapter = %adapter_id,
                    snapshot = %snapshot.id,
                    "Snapshot failed verification, not pushing: {}",
                    err
                );
                self.give_up(adapter_id, snapshot, 1, &err, correlation_id)
                    .await;
                self.metrics
                    .record_sync("integrity_failed", started.elapsed().as_secs_f64());
                return Err(err);
            }
        };

        let mut backoff = self.config.backoff_base;
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            if track_active && !self.still_active(snapshot).await? {
                return self.supersede(adapter_id, snapshot, started, true).await;
            }
            let Some(adapter) = self.adapters.get_adapter(adapter_id).await? else {
                return Err(SyncError::Store(StoreError::NotFound(format!(
                    "adapter {}",
                    adapter_id
                ))));
            };

            let result = match tokio::time::timeout(
                self.config.push_timeout,
                self.transport.push(&adapter, snapshot, &params),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(SyncError::Timeout(self.config.push_timeout)),
            };

            match result {
                Ok(()) => {
                    if track_active && !self.still_active(snapshot).await? {
                        return self.supersede(adapter_id, snapshot, started, true).await;
                    }
                    self.set_status(
                        adapter_id,
                        SyncStatus::Synced,
                        Some(snapshot.id.clone()),
                        None,
                    )
                    .await?;
                    self.metrics
                        .record_sync("synced", started.elapsed().as_secs_f64());
                    debug!(adapter = %adapter_id, snapshot = %snapshot.id, attempt, "Adapter synced");
                    return Ok(AdapterOutcome::Synced);
                }
                Err(e) if attempt >= max_attempts => {
                    warn!(
                        adapter = %adapter_id,
                        snapshot = %snapshot.id,
                        attempts = attempt,
                        "Giving up on adapter: {}",
                        e
                    );
                    self.give_up(adapter_id, snapshot, attempt, &e, correlation_id)
                        .await;
                    self.metrics
                        .record_sync("errored", started.elapsed().as_secs_f64());
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        adapter = %adapter_id,
                        attempt,
                        "Push failed: {}, retrying in {:?}",
                        e,
                        backoff
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.config.backoff_max);
                }
            }
        }
    }

    async fn give_up(
        &self,
        adapter_id: &AdapterId,
        snapshot: &Snapshot,
        attempts: u32,
        err: &SyncError,
        correlation_id: Uuid,
    ) {
        if let Err(e) = self
            .set_status(adapter_id, SyncStatus::Errored, None, Some(err.to_string()))
            .await
        {
            warn!(adapter = %adapter_id, "Failed to record adapter error: {}", e);
        }
        self.events.publish(UpmEvent::new(
            snapshot.trainer_id.clone(),
            correlation_id,
            EventKind::AdapterSyncFailed {
                adapter_id: adapter_id.clone(),
                snapshot_id: snapshot.id.clone(),
                attempts,
                error: err.to_string(),
            },
        ));
    }

    async fn set_status(
        &self,
        adapter_id: &AdapterId,
        status: SyncStatus,
        synced_snapshot: Option<SnapshotId>,
        error: Option<String>,
    ) -> Result<(), SyncError> {
        let mut adapter = self
            .adapters
            .get_adapter(adapter_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("adapter {}", adapter_id)))?;
        adapter.sync_status = status;
        adapter.last_error = error;
        if let Some(id) = synced_snapshot {
            adapter.synced_snapshot_id = Some(id);
            adapter.last_synced_at = Some(Utc::now());
        }
        self.adapters.upsert_adapter(&adapter).await?;
        Ok(())
    }

    /// Sync on every `snapshot.activated` and `rollback` event until the bus closes.
    ///
    /// Events are handled one at a time in publish order. A snapshot that is
    /// no longer active by the time its event is handled is skipped.
    pub fn spawn(self: Arc<Self>, mut subscription: EventSubscription) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                let snapshot_id = match &event.kind {
                    EventKind::SnapshotActivated { snapshot_id, .. } => snapshot_id.clone(),
                    EventKind::Rollback { to_snapshot_id, .. } => to_snapshot_id.clone(),
                    _ => continue,
                };
                if let Err(e) = self.run(&snapshot_id, event.correlation_id, true).await {
                    error!(snapshot = %snapshot_id, "Adapter sync run failed: {}", e);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::AllowAllPolicy;
    use crate::repository::MemoryStore;
    use crate::snapshot::{Codec, CreateSnapshotRequest, SnapshotConfig};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use upm_core::{Actor, TrainingMode};

    /// Fails the first `failures` pushes to each listed adapter.
    #[derive(Default)]
    struct FlakyTransport {
        failures: Mutex<std::collections::HashMap<String, u32>>,
        pushes: AtomicU32,
    }

    impl FlakyTransport {
        fn failing(adapter: &str, times: u32) -> Self {
            let t = Self::default();
            t.failures
                .lock()
                .unwrap()
                .insert(adapter.to_string(), times);
            t
        }
    }

    #[async_trait]
    impl AdapterTransport for FlakyTransport {
        async fn push(&self, adapter: &Adapter, _: &Snapshot, _: &[u8]) -> Result<(), SyncError> {
            self.pushes.fetch_add(1, Ordering::SeqCst);
            let mut failures = self.failures.lock().unwrap();
            match failures.get_mut(adapter.id.as_str()) {
                Some(n) if *n > 0 => {
                    *n -= 1;
                    Err(SyncError::Transport("connection refused".into()))
                }
                _ => Ok(()),
            }
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        sync: AdapterSync,
        snapshots: Arc<SnapshotManager>,
        bus: EventBus,
    }

    fn harness(transport: Arc<dyn AdapterTransport>, codec: Codec) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let bus = EventBus::new();
        let snapshots = Arc::new(SnapshotManager::new(
            SnapshotConfig {
                root: dir.path().to_path_buf(),
                compression: codec,
            },
            store.clone(),
            Arc::new(AllowAllPolicy),
            bus.clone(),
            Metrics::new(),
        ));
        let sync = AdapterSync::new(
            SyncConfig {
                batch_pause: Duration::from_millis(1),
                backoff_base: Duration::from_millis(1),
                backoff_max: Duration::from_millis(4),
                ..SyncConfig::default()
            },
            store,
            snapshots.clone(),
            transport,
            bus.clone(),
            Metrics::new(),
        );
        Harness {
            _dir: dir,
            sync,
            snapshots,
            bus,
        }
    }

    async fn shadow_snapshot(h: &Harness) -> Snapshot {
        h.snapshots
            .create(CreateSnapshotRequest::new(
                "t1".into(),
                TrainingMode::Shadow,
                b"params".to_vec(),
            ))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_only_matching_mode_is_synced() {
        let transport = Arc::new(FlakyTransport::default());
        let h = harness(transport.clone(), Codec::Gzip);
        h.sync
            .register(Adapter::new("shadow-1", TrainingMode::Shadow))
            .await
            .unwrap();
        h.sync
            .register(Adapter::new("active-1", TrainingMode::Active))
            .await
            .unwrap();
        let s = shadow_snapshot(&h).await;

        let report = h.sync.sync_all(&s.id).await.unwrap();
        assert_eq!(report.synced, vec![AdapterId::new("shadow-1")]);
        assert!(report.failed.is_empty());
        assert_eq!(transport.pushes.load(Ordering::SeqCst), 1);

        let adapters = h.sync.list().await.unwrap();
        let active = adapters.iter().find(|a| a.id.as_str() == "active-1").unwrap();
        assert_eq!(active.sync_status, SyncStatus::Pending);
        let shadow = adapters.iter().find(|a| a.id.as_str() == "shadow-1").unwrap();
        assert_eq!(shadow.sync_status, SyncStatus::Synced);
        assert_eq!(shadow.synced_snapshot_id.as_ref(), Some(&s.id));
        assert!(shadow.last_synced_at.is_some());
    }

    #[tokio::test]
    async fn test_transient_failure_recovers_within_attempts() {
        let transport = Arc::new(FlakyTransport::failing("edge", 2));
        let h = harness(transport.clone(), Codec::Gzip);
        h.sync
            .register(Adapter::new("edge", TrainingMode::Shadow))
            .await
            .unwrap();
        let s = shadow_snapshot(&h).await;
        let report = h.sync.sync_all(&s.id).await.unwrap();
        assert_eq!(report.synced.len(), 1);
        assert_eq!(transport.pushes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_mark_errored_and_emit_event() {
        let transport = Arc::new(FlakyTransport::failing("edge", 10));
        let h = harness(transport.clone(), Codec::Gzip);
        let mut sub = h.bus.subscribe();
        h.sync
            .register(Adapter::new("edge", TrainingMode::Shadow))
            .await
            .unwrap();
        let s = shadow_snapshot(&h).await;
        let report = h.sync.sync_all(&s.id).await.unwrap();
        assert_eq!(report.failed, vec![AdapterId::new("edge")]);
        assert_eq!(transport.pushes.load(Ordering::SeqCst), 3);

        let adapter = &h.sync.list().await.unwrap()[0];
        assert_eq!(adapter.sync_status, SyncStatus::Errored);
        assert!(adapter.last_error.is_some());

        let failed: Vec<_> = sub
            .drain()
            .into_iter()
            .filter(|e| e.name() == "adapter.sync_failed")
            .collect();
        assert_eq!(failed.len(), 1);
        match &failed[0].kind {
            EventKind::AdapterSyncFailed { attempts, .. } => assert_eq!(*attempts, 3),
            other => panic!("unexpected event: {:?}", other),
        }

        // Re-registering is the recovery path
        let reset = h
            .sync
            .register(Adapter::new("edge", TrainingMode::Shadow))
            .await
            .unwrap();
        assert_eq!(reset.sync_status, SyncStatus::Pending);
    }

    #[tokio::test]
    async fn test_integrity_failure_is_not_retried() {
        let transport = Arc::new(FlakyTransport::default());
        let h = harness(transport.clone(), Codec::None);
        h.sync
            .register(Adapter::new("edge", TrainingMode::Shadow))
            .await
            .unwrap();
        let s = shadow_snapshot(&h).await;
        std::fs::write(&s.storage_path, b"corrupted").unwrap();

        let report = h.sync.sync_all(&s.id).await.unwrap();
        assert_eq!(report.failed.len(), 1);
        assert_eq!(transport.pushes.load(Ordering::SeqCst), 0);
        assert_eq!(
            h.sync.list().await.unwrap()[0].sync_status,
            SyncStatus::Errored
        );
    }

    #[tokio::test]
    async fn test_batches_cover_all_adapters() {
        let transport = Arc::new(FlakyTransport::default());
        let h = harness(transport.clone(), Codec::Gzip);
        for i in 0..25 {
            h.sync
                .register(Adapter::new(format!("edge-{:02}", i), TrainingMode::Shadow))
                .await
                .unwrap();
        }
        let s = shadow_snapshot(&h).await;
        let report = h.sync.sync_all(&s.id).await.unwrap();
        assert_eq!(report.synced.len(), 25);
        assert_eq!(transport.pushes.load(Ordering::SeqCst), 25);
    }

    #[tokio::test]
    async fn test_activation_event_triggers_sync() {
        let transport = Arc::new(FlakyTransport::default());
        let h = harness(transport.clone(), Codec::Gzip);
        h.sync
            .register(Adapter::new("edge", TrainingMode::Shadow))
            .await
            .unwrap();
        let _listener = Arc::new(h.sync.clone()).spawn(h.bus.subscribe());

        let s = shadow_snapshot(&h).await;
        h.snapshots
            .activate(&s.id, &Actor::admin("root"), None)
            .await
            .unwrap();

        for _ in 0..200 {
            if h.sync.list().await.unwrap()[0].sync_status == SyncStatus::Synced {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("adapter was never synced");
    }

    /// Holds the push of one snapshot until released; records every push.
    struct GatedTransport {
        gated: SnapshotId,
        started: tokio::sync::Notify,
        release: tokio::sync::Notify,
        pushed: Mutex<Vec<SnapshotId>>,
    }

    impl GatedTransport {
        fn new(gated: SnapshotId) -> Self {
            Self {
                gated,
                started: tokio::sync::Notify::new(),
                release: tokio::sync::Notify::new(),
                pushed: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl AdapterTransport for GatedTransport {
        async fn push(&self, _: &Adapter, snapshot: &Snapshot, _: &[u8]) -> Result<(), SyncError> {
            if snapshot.id == self.gated {
                self.started.notify_one();
                self.release.notified().await;
            }
            self.pushed.lock().unwrap().push(snapshot.id.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_slow_push_of_demoted_snapshot_does_not_win() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let bus = EventBus::new();
        let snapshots = Arc::new(SnapshotManager::new(
            SnapshotConfig {
                root: dir.path().to_path_buf(),
                compression: Codec::Gzip,
            },
            store.clone(),
            Arc::new(AllowAllPolicy),
            bus.clone(),
            Metrics::new(),
        ));
        let create = || {
            snapshots.create(CreateSnapshotRequest::new(
                "t1".into(),
                TrainingMode::Shadow,
                b"params".to_vec(),
            ))
        };
        let s1 = create().await.unwrap();
        let s2 = create().await.unwrap();

        let transport = Arc::new(GatedTransport::new(s1.id.clone()));
        let sync = AdapterSync::new(
            SyncConfig::default(),
            store,
            snapshots.clone(),
            transport.clone(),
            bus.clone(),
            Metrics::new(),
        );
        sync.register(Adapter::new("edge", TrainingMode::Shadow))
            .await
            .unwrap();
        let _listener = Arc::new(sync.clone()).spawn(bus.subscribe());

        let admin = Actor::admin("root");
        snapshots.activate(&s1.id, &admin, None).await.unwrap();
        transport.started.notified().await;
        // s1 is mid-push when s2 replaces it
        snapshots.activate(&s2.id, &admin, None).await.unwrap();
        transport.release.notify_one();

        let mut adapter = sync.list().await.unwrap().remove(0);
        for _ in 0..200 {
            if adapter.sync_status == SyncStatus::Synced {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            adapter = sync.list().await.unwrap().remove(0);
        }
        assert_eq!(adapter.sync_status, SyncStatus::Synced);
        assert_eq!(adapter.synced_snapshot_id.as_ref(), Some(&s2.id));
        assert_eq!(
            snapshots.active_for(&"t1".into()).await.unwrap().map(|s| s.id),
            Some(s2.id.clone())
        );
        assert_eq!(*transport.pushed.lock().unwrap(), vec![s1.id.clone(), s2.id.clone()]);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let adapter = sync.list().await.unwrap().remove(0);
        assert_eq!(adapter.synced_snapshot_id.as_ref(), Some(&s2.id));
    }

    #[tokio::test]
    async fn test_sync_of_demoted_snapshot_is_superseded() {
        let transport = Arc::new(FlakyTransport::default());
        let h = harness(transport.clone(), Codec::Gzip);
        h.sync
            .register(Adapter::new("edge", TrainingMode::Shadow))
            .await
            .unwrap();
        let s1 = shadow_snapshot(&h).await;
        let s2 = shadow_snapshot(&h).await;
        let admin = Actor::admin("root");
        h.snapshots.activate(&s1.id, &admin, None).await.unwrap();
        h.snapshots.activate(&s2.id, &admin, None).await.unwrap();

        // Demoted snapshots are not tracked, so an explicit push still goes out
        let report = h.sync.sync_all(&s1.id).await.unwrap();
        assert_eq!(report.synced, vec![AdapterId::new("edge")]);

        let report = h.sync.run(&s1.id, Uuid::new_v4(), true).await.unwrap();
        assert!(report.synced.is_empty() && report.superseded.is_empty());
        assert_eq!(transport.pushes.load(Ordering::SeqCst), 1);

        let report = h.sync.sync_all(&s2.id).await.unwrap();
        assert_eq!(report.synced, vec![AdapterId::new("edge")]);
        let adapter = &h.sync.list().await.unwrap()[0];
        assert_eq!(adapter.synced_snapshot_id.as_ref(), Some(&s2.id));
    }

    #[tokio::test]
    async fn test_unknown_snapshot_is_an_error() {
        let h = harness(Arc::new(LoggingTransport), Codec::Gzip);
        let err = h.sync.sync_all(&"missing".into()).await.unwrap_err();
        assert!(matches!(err, SyncError::Snapshot(SnapshotError::NotFound(_))));
    }
}
