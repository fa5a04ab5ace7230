//! Panic supervision for trainer workers.
//!
//! A worker that panics is rebuilt from its last checkpoint and keeps
//! draining the same command channel. A trainer that panics more than
//! `max_restarts` times inside `restart_window` is abandoned: its record is
//! marked errored and the channel is dropped.

use crate::kernel::KernelFactory;
use crate::metrics::Metrics;
use crate::repository::{BatchSource, TrainerRepository};
use crate::snapshot::SnapshotManager;
use crate::trainer::{TrainerCommand, TrainerConfig, TrainerError, TrainerExit, TrainerWorker};
use chrono::Utc;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use upm_core::{TrainerId, TrainerRecord, TrainerStatus, TrainingMode};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub max_restarts: usize,
    #[serde(with = "crate::serde_duration")]
    pub restart_window: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            restart_window: Duration::from_secs(60),
        }
    }
}

/// Sliding-window restart counter.
#[derive(Debug)]
pub struct RestartBudget {
    max_restarts: usize,
    window: Duration,
    restarts: VecDeque<Instant>,
}

impl RestartBudget {
    pub fn new(config: &SupervisorConfig) -> Self {
        Self {
            max_restarts: config.max_restarts,
            window: config.restart_window,
            restarts: VecDeque::new(),
        }
    }

    /// Record a restart at `now`; false once the budget is exhausted.
    pub fn try_restart(&mut self, now: Instant) -> bool {
        while let Some(&oldest) = self.restarts.front() {
            if now.duration_since(oldest) > self.window {
                self.restarts.pop_front();
            } else {
                break;
            }
        }
        if self.restarts.len() >= self.max_restarts {
            return false;
        }
        self.restarts.push_back(now);
        true
    }

    pub fn recent(&self) -> usize {
        self.restarts.len()
    }
}

/// Everything needed to (re)build one trainer's worker.
#[derive(Clone)]
pub struct WorkerBuilder {
    pub trainer_id: TrainerId,
    pub mode: TrainingMode,
    pub kernel: KernelFactory,
    pub batches: Arc<dyn BatchSource>,
    pub trainers: Arc<dyn TrainerRepository>,
    pub snapshots: Arc<SnapshotManager>,
    pub metrics: Metrics,
    pub config: TrainerConfig,
}

impl WorkerBuilder {
    pub async fn build(&self) -> Result<TrainerWorker, TrainerError> {
        TrainerWorker::restore(
            self.trainer_id.clone(),
            self.mode,
            (self.kernel)(),
            self.batches.clone(),
            self.trainers.clone(),
            self.snapshots.clone(),
            self.metrics.clone(),
            self.config.clone(),
        )
        .await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorExit {
    Stopped(TrainerExit),
    /// Restart budget exhausted or the worker could not be rebuilt.
    Abandoned { restarts: usize },
}

/// Run `worker` until it stops, rebuilding it through `builder` after panics.
pub async fn supervise_trainer(
    builder: WorkerBuilder,
    mut worker: TrainerWorker,
    mut commands: mpsc::Receiver<TrainerCommand>,
    config: SupervisorConfig,
) -> SupervisorExit {
    let mut budget = RestartBudget::new(&config);
    loop {
        let outcome = AssertUnwindSafe(worker.run(&mut commands))
            .catch_unwind()
            .await;
        let message = match outcome {
            Ok(exit) => return SupervisorExit::Stopped(exit),
            Err(payload) => panic_to_string(payload),
        };

        error!(trainer = %builder.trainer_id, "Trainer worker panicked: {}", message);
        builder.metrics.record_restart(builder.trainer_id.as_str());

        if !budget.try_restart(Instant::now()) {
            let restarts = budget.recent();
            error!(
                trainer = %builder.trainer_id,
                restarts,
                window = ?config.restart_window,
                "Restart budget exhausted, abandoning trainer"
            );
            mark_abandoned(&builder, &message).await;
            return SupervisorExit::Abandoned { restarts };
        }

        worker = match builder.build().await {
            Ok(worker) => {
                info!(
                    trainer = %builder.trainer_id,
                    restarts = budget.recent(),
                    "Trainer worker restarted from checkpoint"
                );
                worker
            }
            Err(e) => {
                error!(trainer = %builder.trainer_id, "Cannot rebuild trainer worker: {}", e);
                mark_abandoned(&builder, &e.to_string()).await;
                return SupervisorExit::Abandoned {
                    restarts: budget.recent(),
                };
            }
        };
    }
}

async fn mark_abandoned(builder: &WorkerBuilder, reason: &str) {
    let mut record = match builder.trainers.load_trainer(&builder.trainer_id).await {
        Ok(Some(record)) => record,
        _ => TrainerRecord::new(builder.trainer_id.clone(), builder.mode),
    };
    record.status = TrainerStatus::Errored;
    record.last_error = Some(format!("abandoned after repeated panics: {}", reason));
    record.updated_at = Utc::now();
    if let Err(e) = builder.trainers.save_trainer(&record).await {
        warn!(trainer = %builder.trainer_id, "Failed to persist abandoned trainer: {}", e);
    }
}

fn panic_to_string(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
