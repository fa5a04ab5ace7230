//! Synthetic workload for exercising a runtime end to end.
//!
//! Each trainer learns `y = 2x + 1` from generated batches, receives
//! prediction / ground-truth pairs offset by a constant error, and optionally
//! has its newest snapshot activated.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::info;
use upm_core::{
    Actor, BatchNotification, BatchStatus, DriftWindowStatus, FeatureBatch, TrainerId, Value,
};
use upm_runtime::{ActivationOutcome, MemoryStore, UpmRuntime};

use crate::config::SimulationConfig;

#[derive(Debug, Clone)]
pub struct TrainerSummary {
    pub trainer_id: TrainerId,
    pub batch_count: u64,
    pub avg_loss: f64,
    pub snapshots: usize,
    pub latest_version: Option<u64>,
    pub drift_status: Option<DriftWindowStatus>,
    pub drift_p95: Option<f64>,
    pub activated: bool,
}

/// Generate one batch of `rows` samples on the line `y = 2x + 1`.
pub fn synthetic_batch(
    trainer_id: &TrainerId,
    index: u64,
    rows: usize,
    origin: DateTime<Utc>,
) -> FeatureBatch {
    let window_start = origin + ChronoDuration::minutes(index as i64);
    let rows = rows.max(1);
    let features: Vec<Vec<f64>> = (0..rows)
        .map(|r| vec![((index as usize + r) % 20) as f64 / 20.0])
        .collect();
    let labels = features.iter().map(|row| 2.0 * row[0] + 1.0).collect();
    FeatureBatch {
        id: format!("{}-{:06}", trainer_id, index).into(),
        trainer_id: trainer_id.clone(),
        window_start,
        window_end: window_start + ChronoDuration::minutes(1),
        features,
        labels: Some(labels),
        status: BatchStatus::Filled,
    }
}

/// Drive every configured trainer through training, drift scoring and
/// (optionally) activation. Trainers must already be spawned.
pub async fn run_simulation(
    runtime: &UpmRuntime,
    store: &MemoryStore,
    config: &SimulationConfig,
) -> Result<Vec<TrainerSummary>> {
    let origin = Utc::now() - ChronoDuration::minutes(config.batches as i64);
    let mut summaries = Vec::with_capacity(config.trainers.len());

    for name in &config.trainers {
        let trainer_id = TrainerId::new(name.as_str());

        for index in 0..config.batches {
            let batch = synthetic_batch(&trainer_id, index, config.rows_per_batch, origin);
            let notification = BatchNotification {
                batch_id: batch.id.clone(),
                trainer_id: batch.trainer_id.clone(),
                window_start: batch.window_start,
                window_end: batch.window_end,
                status: batch.status,
            };
            store
                .insert_batch(batch)
                .with_context(|| format!("storing batch {} for {}", index, trainer_id))?;
            runtime.notify_batch_created(notification).await?;
        }
        let released = runtime.flush(&trainer_id).await?;
        let record = runtime.status(&trainer_id).await?;
        info!(
            trainer = %trainer_id,
            released,
            batch_count = record.batch_count,
            avg_loss = record.avg_loss,
            "Training pass complete"
        );

        for i in 0..config.comparisons {
            let x = (i % 20) as f64 / 20.0;
            let truth = 2.0 * x + 1.0;
            runtime
                .record_comparison(
                    &trainer_id,
                    Value::Float(truth + config.prediction_offset),
                    Value::Float(truth),
                )
                .await?;
        }
        let window = runtime.close_drift_window(&trainer_id).await?;

        let snapshots = runtime.snapshots().list(&trainer_id).await?;
        let mut activated = false;
        if config.activate {
            if let Some(latest) = snapshots.last() {
                let actor = Actor::admin(config.actor.as_str());
                let outcome = runtime.activate(&latest.id, &actor, None).await?;
                activated = matches!(
                    outcome,
                    ActivationOutcome::Activated { .. } | ActivationOutcome::AlreadyActive { .. }
                );
            }
        }

        summaries.push(TrainerSummary {
            trainer_id,
            batch_count: record.batch_count,
            avg_loss: record.avg_loss,
            snapshots: snapshots.len(),
            latest_version: snapshots.last().map(|s| s.version),
            drift_status: window.as_ref().map(|w| w.status),
            drift_p95: window.and_then(|w| w.score_p95),
            activated,
        });
    }
    Ok(summaries)
}
