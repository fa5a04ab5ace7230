//! Drift monitoring of a candidate snapshot against ground truth.
//!
//! Comparisons accumulate in a fixed-duration window. When the window closes
//! the P95 of per-sample scores is checked against the threshold; a breach
//! marks the window quarantined and emits a `drift.quarantine` event that
//! recommends rollback. The monitor never rolls back on its own.
//!
//! Scoring picks a strategy from the prediction's shape:
//!
//! | prediction / truth | score |
//! |---|---|
//! | both numeric | `|a - b|`, or `1` if that is not finite |
//! | both maps | fraction of the key union whose values differ |
//! | anything else | `0` if equal, `1` otherwise |

use crate::event_bus::EventBus;
use crate::metrics::Metrics;
use crate::repository::{DriftWindowRepository, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use upm_core::{
    Comparison, DriftWindow, DriftWindowStatus, EventKind, SnapshotId, TrainerId, UpmEvent, Value,
};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftConfig {
    /// Length of one evaluation window.
    #[serde(with = "crate::serde_duration")]
    pub window: Duration,
    /// Windows with fewer samples are resolved without a score.
    pub min_samples: usize,
    /// P95 at or above this value triggers quarantine.
    pub threshold: f64,
    pub quarantine_enabled: bool,
    /// How often the actor checks for an expired window.
    #[serde(with = "crate::serde_duration")]
    pub check_interval: Duration,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(3600),
            min_samples: 100,
            threshold: 0.2,
            quarantine_enabled: true,
            check_interval: Duration::from_secs(10),
        }
    }
}

/// Per-sample divergence between a prediction and the observed truth.
pub fn drift_score(prediction: &Value, ground_truth: &Value) -> f64 {
    match (prediction, ground_truth) {
        (a, b) if a.is_numeric() && b.is_numeric() => match (a.as_float(), b.as_float()) {
            (Some(x), Some(y)) if (x - y).is_finite() => (x - y).abs(),
            _ => 1.0,
        },
        (Value::Map(a), Value::Map(b)) => {
            let keys: BTreeSet<&String> = a.keys().chain(b.keys()).collect();
            if keys.is_empty() {
                return 0.0;
            }
            let differing = keys
                .iter()
                .filter(|k| a.get(k.as_str()) != b.get(k.as_str()))
                .count();
            differing as f64 / keys.len() as f64
        }
        (a, b) => {
            if a == b {
                0.0
            } else {
                1.0
            }
        }
    }
}

/// Nearest-rank percentile (`p` in `0.0..=1.0`).
pub fn percentile(scores: &[f64], p: f64) -> Option<f64> {
    if scores.is_empty() {
        return None;
    }
    let mut sorted = scores.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    Some(nearest_rank(&sorted, p))
}

fn nearest_rank(sorted: &[f64], p: f64) -> f64 {
    let n = sorted.len();
    let rank = (p.clamp(0.0, 1.0) * n as f64).ceil() as usize;
    sorted[rank.saturating_sub(1).min(n - 1)]
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreSummary {
    pub p95: f64,
    pub mean: f64,
    pub max: f64,
    pub count: usize,
}

pub fn summarize(scores: &[f64]) -> Option<ScoreSummary> {
    if scores.is_empty() {
        return None;
    }
    let mut sorted = scores.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let count = sorted.len();
    Some(ScoreSummary {
        p95: nearest_rank(&sorted, 0.95),
        mean: sorted.iter().sum::<f64>() / count as f64,
        max: sorted[count - 1],
        count,
    })
}

pub struct DriftMonitor {
    trainer_id: TrainerId,
    config: DriftConfig,
    window: DriftWindow,
    correlation_id: Uuid,
    samples: Vec<Comparison>,
    repo: Arc<dyn DriftWindowRepository>,
    events: EventBus,
    metrics: Metrics,
}

impl DriftMonitor {
    /// Open the first window for `snapshot_id` and persist it.
    pub async fn start(
        trainer_id: TrainerId,
        snapshot_id: Option<SnapshotId>,
        config: DriftConfig,
        repo: Arc<dyn DriftWindowRepository>,
        events: EventBus,
        metrics: Metrics,
    ) -> Result<Self, StoreError> {
        let window = DriftWindow::open(trainer_id.clone(), snapshot_id, config.threshold);
        repo.save_window(&window).await?;
        Ok(Self {
            trainer_id,
            config,
            window,
            correlation_id: Uuid::new_v4(),
            samples: Vec::new(),
            repo,
            events,
            metrics,
        })
    }

    pub fn current_window(&self) -> &DriftWindow {
        &self.window
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    fn window_expired(&self, now: DateTime<Utc>) -> bool {
        let length = chrono::Duration::from_std(self.config.window).unwrap_or(chrono::Duration::MAX);
        now - self.window.opened_at >= length
    }

    /// Score one prediction and add it to the open window.
    pub async fn record(
        &mut self,
        prediction: Value,
        ground_truth: Value,
    ) -> Result<Comparison, StoreError> {
        let now = Utc::now();
        if self.window_expired(now) {
            self.close_window().await?;
        }

        let score = drift_score(&prediction, &ground_truth);
        let comparison = Comparison {
            prediction,
            ground_truth,
            drift_score: score,
            timestamp: now,
        };
        self.samples.push(comparison.clone());
        self.window.sample_count = self.samples.len();

        self.events.publish(UpmEvent::new(
            self.trainer_id.clone(),
            self.correlation_id,
            EventKind::ShadowDelta {
                window_id: self.window.id.clone(),
                snapshot_id: self.window.snapshot_id.clone(),
                drift_score: score,
            },
        ));
        Ok(comparison)
    }

    /// Close the window if its duration has elapsed.
    pub async fn tick(&mut self) -> Result<Option<DriftWindow>, StoreError> {
        if self.window_expired(Utc::now()) {
            return self.close_window().await.map(Some);
        }
        Ok(None)
    }

    /// Evaluate and close the open window, then open the next one for the
    /// same snapshot. Returns the closed window.
    pub async fn close_window(&mut self) -> Result<DriftWindow, StoreError> {
        let snapshot_id = self.window.snapshot_id.clone();
        self.rotate(snapshot_id).await
    }

    /// Close the open window and start evaluating a new candidate.
    pub async fn retarget(&mut self, snapshot_id: SnapshotId) -> Result<DriftWindow, StoreError> {
        info!(
            trainer = %self.trainer_id,
            snapshot = %snapshot_id,
            "Retargeting drift monitor"
        );
        self.rotate(Some(snapshot_id)).await
    }

    async fn rotate(&mut self, next_snapshot: Option<SnapshotId>) -> Result<DriftWindow, StoreError> {
        let (closed, alert) = self.evaluate();
        self.repo.save_window(&closed).await?;

        let next = DriftWindow::open(self.trainer_id.clone(), next_snapshot, self.config.threshold);
        if let Err(e) = self.repo.save_window(&next).await {
            // Keep the current window open, in memory and in the store
            if let Err(reopen) = self.repo.save_window(&self.window).await {
                warn!(
                    trainer = %self.trainer_id,
                    window = %self.window.id,
                    "Failed to reopen drift window: {}",
                    reopen
                );
            }
            return Err(e);
        }

        if let Some(kind) = alert {
            self.events.publish(UpmEvent::new(
                self.trainer_id.clone(),
                self.correlation_id,
                kind,
            ));
        }
        self.window = next;
        self.correlation_id = Uuid::new_v4();
        self.samples.clear();
        Ok(closed)
    }

    /// Score the open window. Returns the closed window and, on a breach,
    /// the quarantine event to publish once the close is stored.
    fn evaluate(&self) -> (DriftWindow, Option<EventKind>) {
        let mut window = self.window.clone();
        window.closed_at = Some(Utc::now());
        window.sample_count = self.samples.len();

        if self.samples.len() < self.config.min_samples {
            info!(
                trainer = %self.trainer_id,
                window = %window.id,
                samples = self.samples.len(),
                min_samples = self.config.min_samples,
                "Not enough samples, skipping drift evaluation"
            );
            window.status = DriftWindowStatus::Resolved;
            self.metrics.record_drift_window("insufficient");
            return (window, None);
        }

        let scores: Vec<f64> = self.samples.iter().map(|c| c.drift_score).collect();
        let Some(summary) = summarize(&scores) else {
            window.status = DriftWindowStatus::Resolved;
            return (window, None);
        };
        window.score_p95 = Some(summary.p95);
        window.score_mean = Some(summary.mean);
        window.score_max = Some(summary.max);
        self.metrics.record_drift_scores(
            self.trainer_id.as_str(),
            summary.p95,
            summary.mean,
            summary.max,
        );

        if self.config.quarantine_enabled && summary.p95 >= window.threshold {
            window.status = DriftWindowStatus::Quarantined;
            warn!(
                trainer = %self.trainer_id,
                window = %window.id,
                snapshot = ?window.snapshot_id.as_ref().map(|s| s.as_str()),
                p95 = summary.p95,
                threshold = window.threshold,
                samples = summary.count,
                "Drift threshold breached, recommending rollback"
            );
            self.metrics.record_drift_window("quarantined");
            let alert = EventKind::DriftQuarantine {
                window_id: window.id.clone(),
                snapshot_id: window.snapshot_id.clone(),
                score_p95: summary.p95,
                threshold: window.threshold,
                sample_count: summary.count,
                recommendation: "rollback".to_string(),
            };
            (window, Some(alert))
        } else {
            window.status = DriftWindowStatus::Resolved;
            debug!(
                trainer = %self.trainer_id,
                window = %window.id,
                p95 = summary.p95,
                "Drift window resolved"
            );
            self.metrics.record_drift_window("resolved");
            (window, None)
        }
    }
}

/// Input to a trainer's drift task.
#[derive(Debug)]
pub enum DriftCommand {
    Record {
        prediction: Value,
        ground_truth: Value,
    },
    Retarget(SnapshotId),
    /// Close the open window now; replies with the closed window.
    Close(oneshot::Sender<Option<DriftWindow>>),
    Current(oneshot::Sender<DriftWindow>),
}

/// Drive a drift monitor until its command channel closes.
pub async fn run_drift_loop(mut monitor: DriftMonitor, mut commands: mpsc::Receiver<DriftCommand>) {
    let period = monitor.config.check_interval.max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            cmd = commands.recv() => {
                let Some(cmd) = cmd else { break };
                let result = match cmd {
                    DriftCommand::Record { prediction, ground_truth } => {
                        monitor.record(prediction, ground_truth).await.map(|_| ())
                    }
                    DriftCommand::Retarget(snapshot_id) => {
                        monitor.retarget(snapshot_id).await.map(|_| ())
                    }
                    DriftCommand::Close(reply) => match monitor.close_window().await {
                        Ok(closed) => {
                            let _ = reply.send(Some(closed));
                            Ok(())
                        }
                        Err(e) => {
                            let _ = reply.send(None);
                            Err(e)
                        }
                    },
                    DriftCommand::Current(reply) => {
                        let _ = reply.send(monitor.current_window().clone());
                        Ok(())
                    }
                };
                if let Err(e) = result {
                    warn!(trainer = %monitor.trainer_id, "Drift window store error: {}", e);
                }
            }
            _ = ticker.tick() => {
                if let Err(e) = monitor.tick().await {
                    warn!(trainer = %monitor.trainer_id, "Drift window store error: {}", e);
                }
            }
        }
    }
    debug!(trainer = %monitor.trainer_id, "Drift loop stopped");
}
