//! Trainer actor: the sole mutator of one trainer's parameters.
//!
//! Each released batch produces exactly one kernel update. Every
//! `snapshot_interval` batches the worker exports its parameters and awaits
//! [`SnapshotManager::create`] inline, so a snapshot always reflects a fully
//! applied update. Fetch, update and snapshot failures park the worker in
//! `errored` until an operator sends `Resume`.

use crate::kernel::{KernelError, TrainingKernel};
use crate::metrics::Metrics;
use crate::repository::{BatchSource, StoreError, TrainerRepository};
use crate::snapshot::{checksum, CreateSnapshotRequest, SnapshotError, SnapshotManager};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use upm_core::{BatchId, Snapshot, TrainerId, TrainerRecord, TrainerStatus, TrainingMode};
use uuid::Uuid;

/// Snapshot label carrying the id of the last batch folded into it.
pub const LAST_BATCH_LABEL: &str = "last_batch_id";

#[derive(Debug, thiserror::Error)]
pub enum TrainerError {
    #[error("Failed to fetch batch {batch}: {source}")]
    Fetch {
        batch: BatchId,
        #[source]
        source: StoreError,
    },

    #[error("Kernel update failed: {0}")]
    Kernel(#[from] KernelError),

    #[error("Snapshot failed: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("Trainer unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    /// A snapshot is taken every this many applied batches.
    pub snapshot_interval: u64,
    /// Bound of the command channel feeding the worker.
    pub command_buffer: usize,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            snapshot_interval: 100,
            command_buffer: 1024,
        }
    }
}

#[derive(Debug)]
pub enum TrainerCommand {
    BatchReady(BatchId),
    Pause,
    Resume,
    Status(oneshot::Sender<TrainerRecord>),
    Shutdown,
}

/// Why [`TrainerWorker::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainerExit {
    Shutdown,
    ChannelClosed,
}

/// Result of handling one `BatchReady`.
#[derive(Debug, Clone)]
pub enum BatchOutcome {
    Applied { loss: f64, snapshot: Option<Snapshot> },
    Skipped(&'static str),
}

pub struct TrainerWorker {
    record: TrainerRecord,
    kernel: Box<dyn TrainingKernel>,
    batches: Arc<dyn BatchSource>,
    trainers: Arc<dyn TrainerRepository>,
    snapshots: Arc<SnapshotManager>,
    metrics: Metrics,
    config: TrainerConfig,
}

impl TrainerWorker {
    pub fn new(
        record: TrainerRecord,
        kernel: Box<dyn TrainingKernel>,
        batches: Arc<dyn BatchSource>,
        trainers: Arc<dyn TrainerRepository>,
        snapshots: Arc<SnapshotManager>,
        metrics: Metrics,
        config: TrainerConfig,
    ) -> Self {
        Self {
            record,
            kernel,
            batches,
            trainers,
            snapshots,
            metrics,
            config,
        }
    }

    /// Rebuild a worker from its checkpointed record and newest snapshot.
    ///
    /// A trainer with no record starts fresh in `mode`.
    #[allow(clippy::too_many_arguments)]
    pub async fn restore(
        trainer_id: TrainerId,
        mode: TrainingMode,
        mut kernel: Box<dyn TrainingKernel>,
        batches: Arc<dyn BatchSource>,
        trainers: Arc<dyn TrainerRepository>,
        snapshots: Arc<SnapshotManager>,
        metrics: Metrics,
        config: TrainerConfig,
    ) -> Result<Self, TrainerError> {
        let mut record = match trainers.load_trainer(&trainer_id).await {
            Ok(Some(record)) => record,
            Ok(None) => TrainerRecord::new(trainer_id.clone(), mode),
            Err(e) => return Err(TrainerError::Unavailable(e.to_string())),
        };

        let latest = snapshots.latest_for(&trainer_id).await?;
        if let Some(latest) = &latest {
            let params = snapshots.load_snapshot(latest).await?;
            kernel.import_params(&params)?;
            info!(
                trainer = %trainer_id,
                snapshot = %latest.id,
                version = latest.version,
                "Restored parameters from snapshot"
            );
        }
        rewind_to_snapshot(&mut record, latest.as_ref());

        let worker = Self::new(record, kernel, batches, trainers, snapshots, metrics, config);
        worker.persist().await;
        Ok(worker)
    }

    pub fn record(&self) -> &TrainerRecord {
        &self.record
    }

    pub fn trainer_id(&self) -> &TrainerId {
        &self.record.trainer_id
    }

    /// Process commands until `Shutdown` or the channel closes.
    pub async fn run(&mut self, commands: &mut mpsc::Receiver<TrainerCommand>) -> TrainerExit {
        info!(
            trainer = %self.record.trainer_id,
            mode = %self.record.mode,
            status = %self.record.status,
            batch_count = self.record.batch_count,
            "Trainer worker started"
        );
        while let Some(cmd) = commands.recv().await {
            match cmd {
                TrainerCommand::BatchReady(id) => {
                    // Failures are already recorded on the worker
                    let _ = self.handle_batch(&id).await;
                }
                TrainerCommand::Pause => self.pause().await,
                TrainerCommand::Resume => self.resume().await,
                TrainerCommand::Status(reply) => {
                    let _ = reply.send(self.record.clone());
                }
                TrainerCommand::Shutdown => {
                    info!(trainer = %self.record.trainer_id, "Trainer worker shutting down");
                    return TrainerExit::Shutdown;
                }
            }
        }
        TrainerExit::ChannelClosed
    }

    pub async fn handle_batch(&mut self, batch_id: &BatchId) -> Result<BatchOutcome, TrainerError> {
        match self.record.status {
            TrainerStatus::Paused => {
                debug!(trainer = %self.record.trainer_id, batch = %batch_id, "Paused, ignoring batch");
                return Ok(BatchOutcome::Skipped("paused"));
            }
            TrainerStatus::Errored => {
                warn!(
                    trainer = %self.record.trainer_id,
                    batch = %batch_id,
                    "Trainer is errored, ignoring batch until resumed"
                );
                return Ok(BatchOutcome::Skipped("errored"));
            }
            TrainerStatus::Idle | TrainerStatus::Training => {}
        }

        let batch = match self.batches.fetch_batch(batch_id).await {
            Ok(batch) => batch,
            Err(source) => {
                return Err(self
                    .fail(TrainerError::Fetch {
                        batch: batch_id.clone(),
                        source,
                    })
                    .await)
            }
        };

        if batch.trainer_id != self.record.trainer_id {
            warn!(
                trainer = %self.record.trainer_id,
                batch = %batch.id,
                owner = %batch.trainer_id,
                "Batch belongs to another trainer, skipping"
            );
            return Ok(BatchOutcome::Skipped("foreign"));
        }
        if !batch.is_trainable() {
            info!(
                trainer = %self.record.trainer_id,
                batch = %batch.id,
                status = ?batch.status,
                "Batch is not trainable, skipping"
            );
            return Ok(BatchOutcome::Skipped("untrainable"));
        }

        let started = Instant::now();
        let loss = match self.kernel.apply_update(&batch) {
            Ok(loss) => loss,
            Err(e) => return Err(self.fail(e.into()).await),
        };
        let elapsed = started.elapsed().as_secs_f64();

        self.record.batch_count += 1;
        self.record.total_loss += loss;
        self.record.avg_loss = self.record.total_loss / self.record.batch_count as f64;
        self.record.last_batch_id = Some(batch.id.clone());
        self.record.status = TrainerStatus::Training;
        self.record.last_error = None;
        self.metrics.record_update(
            self.record.trainer_id.as_str(),
            loss,
            elapsed,
            self.record.batch_count,
        );
        debug!(
            trainer = %self.record.trainer_id,
            batch = %batch.id,
            loss,
            batch_count = self.record.batch_count,
            "Applied update"
        );
        self.persist().await;

        let interval = self.config.snapshot_interval;
        let snapshot = if interval > 0 && self.record.batch_count % interval == 0 {
            match self.take_snapshot().await {
                Ok(snapshot) => Some(snapshot),
                Err(e) => return Err(self.fail(e).await),
            }
        } else {
            None
        };

        Ok(BatchOutcome::Applied { loss, snapshot })
    }

    async fn take_snapshot(&mut self) -> Result<Snapshot, TrainerError> {
        let params = self.kernel.export_params()?;
        let request = CreateSnapshotRequest {
            trainer_id: self.record.trainer_id.clone(),
            mode: self.record.mode,
            checksum: checksum(&params),
            params,
            batch_count: self.record.batch_count,
            avg_loss: self.record.avg_loss,
            labels: self
                .record
                .last_batch_id
                .iter()
                .map(|id| (LAST_BATCH_LABEL.to_string(), id.to_string()))
                .collect(),
            correlation_id: Uuid::new_v4(),
        };
        let snapshot = self.snapshots.create(request).await?;
        self.record.last_snapshot_id = Some(snapshot.id.clone());
        self.persist().await;
        Ok(snapshot)
    }

    pub async fn pause(&mut self) {
        if self.record.status == TrainerStatus::Paused {
            return;
        }
        self.record.status = TrainerStatus::Paused;
        info!(trainer = %self.record.trainer_id, "Trainer paused");
        self.persist().await;
    }

    /// Leave `paused` or `errored`. Other states are unchanged.
    pub async fn resume(&mut self) {
        if !matches!(
            self.record.status,
            TrainerStatus::Paused | TrainerStatus::Errored
        ) {
            return;
        }
        self.record.status = if self.record.batch_count > 0 {
            TrainerStatus::Training
        } else {
            TrainerStatus::Idle
        };
        self.record.last_error = None;
        info!(trainer = %self.record.trainer_id, status = %self.record.status, "Trainer resumed");
        self.persist().await;
    }

    async fn fail(&mut self, err: TrainerError) -> TrainerError {
        error!(
            trainer = %self.record.trainer_id,
            error = %err,
            "Trainer entered errored state"
        );
        self.record.status = TrainerStatus::Errored;
        self.record.last_error = Some(err.to_string());
        self.persist().await;
        err
    }

    /// Checkpoint the record. A failed checkpoint is logged, not fatal.
    async fn persist(&self) {
        let mut record = self.record.clone();
        record.updated_at = Utc::now();
        if let Err(e) = self.trainers.save_trainer(&record).await {
            warn!(trainer = %record.trainer_id, "Failed to checkpoint trainer state: {}", e);
        }
    }
}

/// Align the counters with the parameters actually restored.
///
/// Updates applied after the newest snapshot are not in the kernel any
/// more, so the record must not count them either.
fn rewind_to_snapshot(record: &mut TrainerRecord, snapshot: Option<&Snapshot>) {
    let (batch_count, avg_loss, last_batch_id, snapshot_id) = match snapshot {
        Some(s) => (
            s.metadata.batch_count,
            s.metadata.avg_loss,
            s.metadata.labels.get(LAST_BATCH_LABEL).map(|id| BatchId::new(id.as_str())),
            Some(s.id.clone()),
        ),
        None => (0, 0.0, None, None),
    };
    if record.batch_count > batch_count {
        warn!(
            trainer = %record.trainer_id,
            checkpointed = record.batch_count,
            restored = batch_count,
            "Discarding updates applied after the last snapshot"
        );
    }
    record.batch_count = batch_count;
    record.avg_loss = avg_loss;
    record.total_loss = avg_loss * batch_count as f64;
    record.last_batch_id = last_batch_id;
    record.last_snapshot_id = snapshot_id;
    if batch_count == 0 && record.status == TrainerStatus::Training {
        record.status = TrainerStatus::Idle;
    }
}
