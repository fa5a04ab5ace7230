//! Deployment-level wiring.
//!
//! [`UpmRuntime`] owns one supervised unit per trainer: a replay task feeding
//! a trainer task, plus a drift task. The three talk only through mpsc
//! channels. Every collaborator is handed in through [`RuntimeDeps`]; nothing
//! is looked up globally.

use crate::adapter_sync::{AdapterSync, AdapterTransport, LoggingTransport, SyncConfig, SyncError, SyncReport};
use crate::drift::{run_drift_loop, DriftCommand, DriftConfig, DriftMonitor};
use crate::event_bus::{EventBus, EventSubscription};
use crate::kernel::KernelFactory;
use crate::metrics::Metrics;
use crate::policy::{ActivationPolicy, PolicyConfig, StagedRolloutPolicy};
use crate::replay_buffer::{run_replay_loop, ReplayBuffer, ReplayCommand, ReplayConfig};
use crate::repository::{StoreError, Stores};
use crate::snapshot::{ActivationOutcome, SnapshotConfig, SnapshotError, SnapshotManager};
use crate::supervisor::{supervise_trainer, SupervisorConfig, SupervisorExit, WorkerBuilder};
use crate::trainer::{TrainerCommand, TrainerConfig, TrainerError};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use upm_core::{
    Actor, Adapter, BatchNotification, DriftWindow, Snapshot, SnapshotId, TrainerId,
    TrainerRecord, TrainingMode, Value,
};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Unknown trainer: {0}")]
    UnknownTrainer(TrainerId),

    #[error("Trainer already running: {0}")]
    DuplicateTrainer(TrainerId),

    #[error("Trainer {0} is no longer accepting commands")]
    ChannelClosed(TrainerId),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Trainer(#[from] TrainerError),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub snapshot: SnapshotConfig,
    pub replay: ReplayConfig,
    pub trainer: TrainerConfig,
    pub drift: DriftConfig,
    pub sync: SyncConfig,
    pub supervisor: SupervisorConfig,
}

/// Collaborators injected into the runtime.
pub struct RuntimeDeps {
    pub stores: Stores,
    pub kernel: KernelFactory,
    pub policy: Arc<dyn ActivationPolicy>,
    pub transport: Arc<dyn AdapterTransport>,
    pub events: EventBus,
    pub metrics: Metrics,
}

impl RuntimeDeps {
    /// Staged rollout policy with default settings, logging transport,
    /// fresh event bus and registry.
    pub fn new(stores: Stores, kernel: KernelFactory) -> Self {
        Self {
            stores,
            kernel,
            policy: Arc::new(StagedRolloutPolicy::new(PolicyConfig::default())),
            transport: Arc::new(LoggingTransport),
            events: EventBus::new(),
            metrics: Metrics::new(),
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn ActivationPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn AdapterTransport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = metrics;
        self
    }
}

#[derive(Clone)]
struct UnitSenders {
    replay: mpsc::Sender<ReplayCommand>,
    trainer: mpsc::Sender<TrainerCommand>,
    drift: mpsc::Sender<DriftCommand>,
}

struct TrainerUnit {
    senders: UnitSenders,
    replay_task: JoinHandle<()>,
    trainer_task: JoinHandle<SupervisorExit>,
    drift_task: JoinHandle<()>,
}

pub struct UpmRuntime {
    config: RuntimeConfig,
    stores: Stores,
    kernel: KernelFactory,
    events: EventBus,
    metrics: Metrics,
    snapshots: Arc<SnapshotManager>,
    sync: Arc<AdapterSync>,
    units: Mutex<FxHashMap<TrainerId, TrainerUnit>>,
    sync_listener: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl UpmRuntime {
    /// Build the shared components and start the adapter sync listener.
    /// Must be called inside a tokio runtime.
    pub fn start(deps: RuntimeDeps, config: RuntimeConfig) -> Self {
        let RuntimeDeps {
            stores,
            kernel,
            policy,
            transport,
            events,
            metrics,
        } = deps;

        let snapshots = Arc::new(SnapshotManager::new(
            config.snapshot.clone(),
            stores.snapshots.clone(),
            policy,
            events.clone(),
            metrics.clone(),
        ));
        let sync = Arc::new(AdapterSync::new(
            config.sync.clone(),
            stores.adapters.clone(),
            snapshots.clone(),
            transport,
            events.clone(),
            metrics.clone(),
        ));
        let listener = sync.clone().spawn(events.subscribe());

        info!(
            codec = snapshots.codec().name(),
            snapshot_root = %config.snapshot.root.display(),
            "UPM runtime started"
        );

        Self {
            config,
            stores,
            kernel,
            events,
            metrics,
            snapshots,
            sync,
            units: Mutex::new(FxHashMap::default()),
            sync_listener: std::sync::Mutex::new(Some(listener)),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> EventSubscription {
        self.events.subscribe()
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn snapshots(&self) -> &Arc<SnapshotManager> {
        &self.snapshots
    }

    pub fn adapter_sync(&self) -> &Arc<AdapterSync> {
        &self.sync
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub async fn trainer_ids(&self) -> Vec<TrainerId> {
        let mut ids: Vec<_> = self.units.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Start (or restore) a trainer and its replay and drift tasks.
    pub async fn spawn_trainer(
        &self,
        trainer_id: TrainerId,
        mode: TrainingMode,
    ) -> Result<TrainerRecord, RuntimeError> {
        let mut units = self.units.lock().await;
        if units.contains_key(&trainer_id) {
            return Err(RuntimeError::DuplicateTrainer(trainer_id));
        }

        let builder = WorkerBuilder {
            trainer_id: trainer_id.clone(),
            mode,
            kernel: self.kernel.clone(),
            batches: self.stores.batches.clone(),
            trainers: self.stores.trainers.clone(),
            snapshots: self.snapshots.clone(),
            metrics: self.metrics.clone(),
            config: self.config.trainer.clone(),
        };
        let worker = builder.build().await?;
        let record = worker.record().clone();

        let active = self
            .snapshots
            .active_for(&trainer_id)
            .await?
            .map(|s| s.id);
        let monitor = DriftMonitor::start(
            trainer_id.clone(),
            active,
            self.config.drift.clone(),
            self.stores.drift_windows.clone(),
            self.events.clone(),
            self.metrics.clone(),
        )
        .await?;

        let buffer_size = self.config.trainer.command_buffer.max(1);
        let (trainer_tx, trainer_rx) = mpsc::channel(buffer_size);
        let (replay_tx, replay_rx) = mpsc::channel(buffer_size);
        let (drift_tx, drift_rx) = mpsc::channel(buffer_size);

        let buffer = ReplayBuffer::new(trainer_id.clone(), self.config.replay.clone())
            .with_metrics(self.metrics.clone());
        let replay_task = tokio::spawn(run_replay_loop(buffer, replay_rx, trainer_tx.clone()));
        let trainer_task = tokio::spawn(supervise_trainer(
            builder,
            worker,
            trainer_rx,
            self.config.supervisor.clone(),
        ));
        let drift_task = tokio::spawn(run_drift_loop(monitor, drift_rx));

        units.insert(
            trainer_id.clone(),
            TrainerUnit {
                senders: UnitSenders {
                    replay: replay_tx,
                    trainer: trainer_tx,
                    drift: drift_tx,
                },
                replay_task,
                trainer_task,
                drift_task,
            },
        );
        info!(
            trainer = %trainer_id,
            mode = %record.mode,
            batch_count = record.batch_count,
            "Trainer unit spawned"
        );
        Ok(record)
    }

    async fn senders(&self, trainer_id: &TrainerId) -> Result<UnitSenders, RuntimeError> {
        self.units
            .lock()
            .await
            .get(trainer_id)
            .map(|unit| unit.senders.clone())
            .ok_or_else(|| RuntimeError::UnknownTrainer(trainer_id.clone()))
    }

    /// Hand a batch notification to its trainer's replay buffer.
    pub async fn notify_batch_created(
        &self,
        notification: BatchNotification,
    ) -> Result<(), RuntimeError> {
        let trainer_id = notification.trainer_id.clone();
        let senders = self.senders(&trainer_id).await?;
        senders
            .replay
            .send(ReplayCommand::Notify(notification))
            .await
            .map_err(|_| RuntimeError::ChannelClosed(trainer_id))
    }

    /// Release everything buffered for `trainer_id` now.
    pub async fn flush(&self, trainer_id: &TrainerId) -> Result<usize, RuntimeError> {
        let senders = self.senders(trainer_id).await?;
        let (tx, rx) = oneshot::channel();
        senders
            .replay
            .send(ReplayCommand::Flush(tx))
            .await
            .map_err(|_| RuntimeError::ChannelClosed(trainer_id.clone()))?;
        rx.await
            .map_err(|_| RuntimeError::ChannelClosed(trainer_id.clone()))
    }

    pub async fn record_comparison(
        &self,
        trainer_id: &TrainerId,
        prediction: Value,
        ground_truth: Value,
    ) -> Result<(), RuntimeError> {
        let senders = self.senders(trainer_id).await?;
        senders
            .drift
            .send(DriftCommand::Record {
                prediction,
                ground_truth,
            })
            .await
            .map_err(|_| RuntimeError::ChannelClosed(trainer_id.clone()))
    }

    pub async fn drift_window(&self, trainer_id: &TrainerId) -> Result<DriftWindow, RuntimeError> {
        let senders = self.senders(trainer_id).await?;
        let (tx, rx) = oneshot::channel();
        senders
            .drift
            .send(DriftCommand::Current(tx))
            .await
            .map_err(|_| RuntimeError::ChannelClosed(trainer_id.clone()))?;
        rx.await
            .map_err(|_| RuntimeError::ChannelClosed(trainer_id.clone()))
    }

    /// Evaluate and close the open drift window now.
    pub async fn close_drift_window(
        &self,
        trainer_id: &TrainerId,
    ) -> Result<Option<DriftWindow>, RuntimeError> {
        let senders = self.senders(trainer_id).await?;
        let (tx, rx) = oneshot::channel();
        senders
            .drift
            .send(DriftCommand::Close(tx))
            .await
            .map_err(|_| RuntimeError::ChannelClosed(trainer_id.clone()))?;
        rx.await
            .map_err(|_| RuntimeError::ChannelClosed(trainer_id.clone()))
    }

    async fn send_trainer(
        &self,
        trainer_id: &TrainerId,
        command: TrainerCommand,
    ) -> Result<(), RuntimeError> {
        let senders = self.senders(trainer_id).await?;
        senders
            .trainer
            .send(command)
            .await
            .map_err(|_| RuntimeError::ChannelClosed(trainer_id.clone()))
    }

    /// Stop applying updates. A running update completes first.
    pub async fn pause(&self, trainer_id: &TrainerId) -> Result<(), RuntimeError> {
        self.send_trainer(trainer_id, TrainerCommand::Pause).await
    }

    pub async fn resume(&self, trainer_id: &TrainerId) -> Result<(), RuntimeError> {
        self.send_trainer(trainer_id, TrainerCommand::Resume).await
    }

    /// Trainer record as seen by the worker, after every queued command.
    pub async fn status(&self, trainer_id: &TrainerId) -> Result<TrainerRecord, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.send_trainer(trainer_id, TrainerCommand::Status(tx))
            .await?;
        rx.await
            .map_err(|_| RuntimeError::ChannelClosed(trainer_id.clone()))
    }

    pub async fn begin_shadow(&self, id: &SnapshotId) -> Result<Snapshot, RuntimeError> {
        Ok(self.snapshots.begin_shadow(id).await?)
    }

    /// Activate a snapshot and point its trainer's drift monitor at it.
    /// Adapter sync follows from the published `snapshot.activated` event.
    pub async fn activate(
        &self,
        id: &SnapshotId,
        actor: &Actor,
        tenant: Option<&str>,
    ) -> Result<ActivationOutcome, RuntimeError> {
        let outcome = self
            .snapshots
            .activate_with_correlation(id, actor, tenant, Uuid::new_v4())
            .await?;
        if let ActivationOutcome::Activated { snapshot, .. } = &outcome {
            self.retarget_drift(snapshot).await;
        }
        Ok(outcome)
    }

    pub async fn rollback(&self, id: &SnapshotId, reason: &str) -> Result<Snapshot, RuntimeError> {
        let snapshot = self.snapshots.rollback(id, reason).await?;
        self.retarget_drift(&snapshot).await;
        Ok(snapshot)
    }

    async fn retarget_drift(&self, snapshot: &Snapshot) {
        let Ok(senders) = self.senders(&snapshot.trainer_id).await else {
            return;
        };
        if senders
            .drift
            .send(DriftCommand::Retarget(snapshot.id.clone()))
            .await
            .is_err()
        {
            warn!(trainer = %snapshot.trainer_id, "Drift task gone, window not retargeted");
        }
    }

    pub async fn register_adapter(&self, adapter: Adapter) -> Result<Adapter, RuntimeError> {
        Ok(self.sync.register(adapter).await?)
    }

    /// Push a snapshot to its adapters now, outside the event-driven path.
    pub async fn sync_snapshot(&self, id: &SnapshotId) -> Result<SyncReport, RuntimeError> {
        Ok(self.sync.sync_all(id).await?)
    }

    /// Flush every replay buffer, drain every trainer, then stop all tasks.
    pub async fn shutdown(&self) {
        let units: Vec<(TrainerId, TrainerUnit)> = self.units.lock().await.drain().collect();
        for (trainer_id, unit) in units {
            let TrainerUnit {
                senders,
                replay_task,
                trainer_task,
                drift_task,
            } = unit;
            let UnitSenders {
                replay,
                trainer,
                drift,
            } = senders;

            // Closing the replay input flushes it into the trainer
            drop(replay);
            if let Err(e) = replay_task.await {
                warn!(trainer = %trainer_id, "Replay task failed: {}", e);
            }

            if trainer.send(TrainerCommand::Shutdown).await.is_err() {
                warn!(trainer = %trainer_id, "Trainer already stopped");
            }
            drop(trainer);
            match trainer_task.await {
                Ok(exit) => info!(trainer = %trainer_id, exit = ?exit, "Trainer drained"),
                Err(e) => warn!(trainer = %trainer_id, "Trainer task failed: {}", e),
            }

            drop(drift);
            if let Err(e) = drift_task.await {
                warn!(trainer = %trainer_id, "Drift task failed: {}", e);
            }
        }

        let listener = self
            .sync_listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(listener) = listener {
            listener.abort();
        }
        info!("UPM runtime stopped");
    }
}
