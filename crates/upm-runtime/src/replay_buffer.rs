//! Out-of-order, duplicate-tolerant buffering of batch notifications.
//!
//! Notifications for one trainer can arrive late, twice, or out of order.
//! The buffer holds them sorted by `window_start` and periodically releases
//! the earliest contiguous run: entries are accepted while the gap to the
//! previously accepted entry stays within `gap_multiplier * expected_interval`.
//! Everything past the first larger gap waits for the next release.
//!
//! Nothing here returns an error. Duplicates and overflow are dropped with a
//! log line and a counter.

use crate::metrics::Metrics;
use crate::trainer::TrainerCommand;
use chrono::{DateTime, Utc};
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use upm_core::{BatchId, BatchNotification, TrainerId};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Maximum number of buffered entries.
    pub capacity: usize,
    /// Nominal spacing between consecutive batch windows.
    #[serde(with = "crate::serde_duration")]
    pub expected_interval: Duration,
    /// Largest tolerated gap, as a multiple of `expected_interval`.
    pub gap_multiplier: f64,
    /// Ingest delay beyond which an entry is flagged late.
    #[serde(with = "crate::serde_duration")]
    pub late_tolerance: Duration,
    /// How many released ids are remembered for deduplication.
    pub released_id_cap: usize,
    /// Period of the release timer.
    #[serde(with = "crate::serde_duration")]
    pub release_interval: Duration,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            expected_interval: Duration::from_secs(60),
            gap_multiplier: 2.0,
            late_tolerance: Duration::from_secs(300),
            released_id_cap: 10_000,
            release_interval: Duration::from_secs(1),
        }
    }
}

impl ReplayConfig {
    fn max_gap(&self) -> chrono::Duration {
        let multiplier = if self.gap_multiplier.is_finite() {
            self.gap_multiplier.max(0.0)
        } else {
            0.0
        };
        let gap = self.expected_interval.mul_f64(multiplier);
        chrono::Duration::from_std(gap).unwrap_or(chrono::Duration::MAX)
    }

    fn late_tolerance(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.late_tolerance).unwrap_or(chrono::Duration::MAX)
    }
}

#[derive(Debug, Clone)]
pub struct BufferedEntry<P> {
    pub id: BatchId,
    pub window_start: DateTime<Utc>,
    pub payload: P,
    pub received_at: DateTime<Utc>,
    /// Arrived past the late tolerance, or behind the release point.
    pub late: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Buffered,
    BufferedLate,
    Duplicate,
    DroppedFull,
}

impl AddOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AddOutcome::Buffered => "buffered",
            AddOutcome::BufferedLate => "buffered_late",
            AddOutcome::Duplicate => "duplicate",
            AddOutcome::DroppedFull => "dropped_full",
        }
    }
}

pub struct ReplayBuffer<P> {
    trainer_id: TrainerId,
    config: ReplayConfig,
    entries: BTreeMap<(DateTime<Utc>, BatchId), BufferedEntry<P>>,
    buffered_ids: FxHashSet<BatchId>,
    released_ids: FxHashSet<BatchId>,
    released_order: VecDeque<BatchId>,
    release_point: Option<DateTime<Utc>>,
    metrics: Option<Metrics>,
}

impl<P> ReplayBuffer<P> {
    pub fn new(trainer_id: TrainerId, config: ReplayConfig) -> Self {
        Self {
            trainer_id,
            config,
            entries: BTreeMap::new(),
            buffered_ids: FxHashSet::default(),
            released_ids: FxHashSet::default(),
            released_order: VecDeque::new(),
            release_point: None,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn trainer_id(&self) -> &TrainerId {
        &self.trainer_id
    }

    pub fn config(&self) -> &ReplayConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `window_start` of the most recently released entry.
    pub fn release_point(&self) -> Option<DateTime<Utc>> {
        self.release_point
    }

    pub fn add(&mut self, id: BatchId, window_start: DateTime<Utc>, payload: P) -> AddOutcome {
        self.add_at(id, window_start, payload, Utc::now())
    }

    /// Like [`add`](Self::add) with an explicit arrival time.
    pub fn add_at(
        &mut self,
        id: BatchId,
        window_start: DateTime<Utc>,
        payload: P,
        received_at: DateTime<Utc>,
    ) -> AddOutcome {
        let outcome = self.insert(id, window_start, payload, received_at);
        if let Some(m) = &self.metrics {
            m.record_replay(self.trainer_id.as_str(), outcome.as_str(), self.entries.len());
        }
        outcome
    }

    fn insert(
        &mut self,
        id: BatchId,
        window_start: DateTime<Utc>,
        payload: P,
        received_at: DateTime<Utc>,
    ) -> AddOutcome {
        if self.released_ids.contains(&id) || self.buffered_ids.contains(&id) {
            debug!(trainer = %self.trainer_id, batch = %id, "Dropping duplicate batch notification");
            return AddOutcome::Duplicate;
        }

        if self.entries.len() >= self.config.capacity {
            warn!(
                trainer = %self.trainer_id,
                batch = %id,
                capacity = self.config.capacity,
                "Replay buffer full, dropping batch notification"
            );
            return AddOutcome::DroppedFull;
        }

        let delayed = received_at - window_start > self.config.late_tolerance();
        let behind = self.release_point.is_some_and(|p| window_start < p);
        let late = delayed || behind;
        if late {
            warn!(
                trainer = %self.trainer_id,
                batch = %id,
                window_start = %window_start,
                behind_release_point = behind,
                "Late batch notification"
            );
        }

        self.buffered_ids.insert(id.clone());
        self.entries.insert(
            (window_start, id.clone()),
            BufferedEntry {
                id,
                window_start,
                payload,
                received_at,
                late,
            },
        );

        if late {
            AddOutcome::BufferedLate
        } else {
            AddOutcome::Buffered
        }
    }

    /// Release the earliest contiguous run of entries.
    pub fn release(&mut self) -> Vec<BufferedEntry<P>> {
        let max_gap = self.config.max_gap();
        let mut run_len = 0;
        let mut previous: Option<DateTime<Utc>> = None;
        for (window_start, _) in self.entries.keys() {
            if let Some(prev) = previous {
                if *window_start - prev > max_gap {
                    break;
                }
            }
            previous = Some(*window_start);
            run_len += 1;
        }
        self.take_front(run_len)
    }

    /// Release everything regardless of gaps. Used on shutdown.
    pub fn flush(&mut self) -> Vec<BufferedEntry<P>> {
        let all = self.entries.len();
        self.take_front(all)
    }

    fn take_front(&mut self, count: usize) -> Vec<BufferedEntry<P>> {
        let mut released = Vec::with_capacity(count);
        for _ in 0..count {
            let Some((_, entry)) = self.entries.pop_first() else {
                break;
            };
            self.buffered_ids.remove(&entry.id);
            self.remember_released(entry.id.clone());
            self.release_point = Some(match self.release_point {
                Some(p) if p > entry.window_start => p,
                _ => entry.window_start,
            });
            released.push(entry);
        }

        if let Some(m) = &self.metrics {
            if !released.is_empty() {
                m.replay_events_total
                    .with_label_values(&[self.trainer_id.as_str(), "released"])
                    .inc_by(released.len() as f64);
            }
            m.set_replay_depth(self.trainer_id.as_str(), self.entries.len());
        }
        released
    }

    fn remember_released(&mut self, id: BatchId) {
        if self.released_ids.insert(id.clone()) {
            self.released_order.push_back(id);
        }
        while self.released_order.len() > self.config.released_id_cap {
            if let Some(old) = self.released_order.pop_front() {
                self.released_ids.remove(&old);
            }
        }
    }
}

/// Input to a trainer's replay task.
#[derive(Debug)]
pub enum ReplayCommand {
    Notify(BatchNotification),
    /// Release everything now; replies with the number forwarded.
    Flush(oneshot::Sender<usize>),
}

/// Drive a replay buffer: buffer notifications, release on a timer, forward
/// released batches to the trainer in order. Flushes when the input closes.
pub async fn run_replay_loop(
    mut buffer: ReplayBuffer<BatchNotification>,
    mut commands: mpsc::Receiver<ReplayCommand>,
    trainer: mpsc::Sender<TrainerCommand>,
) {
    let period = buffer.config.release_interval.max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // Skip the immediate first tick
    ticker.tick().await;

    loop {
        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(ReplayCommand::Notify(n)) => {
                    buffer.add(n.batch_id.clone(), n.window_start, n);
                }
                Some(ReplayCommand::Flush(reply)) => {
                    let released = buffer.flush();
                    let Some(count) = forward(&buffer.trainer_id, released, &trainer).await else {
                        return;
                    };
                    let _ = reply.send(count);
                }
                None => break,
            },
            _ = ticker.tick() => {
                let released = buffer.release();
                if forward(&buffer.trainer_id, released, &trainer).await.is_none() {
                    return;
                }
            }
        }
    }

    let remaining = buffer.flush();
    let count = forward(&buffer.trainer_id, remaining, &trainer)
        .await
        .unwrap_or_default();
    info!(trainer = %buffer.trainer_id, flushed = count, "Replay loop stopped");
}

/// Returns the number forwarded, or `None` if the trainer is gone.
async fn forward(
    trainer_id: &TrainerId,
    released: Vec<BufferedEntry<BatchNotification>>,
    trainer: &mpsc::Sender<TrainerCommand>,
) -> Option<usize> {
    let mut count = 0;
    for entry in released {
        if trainer
            .send(TrainerCommand::BatchReady(entry.id))
            .await
            .is_err()
        {
            warn!(trainer = %trainer_id, "Trainer channel closed, stopping replay loop");
            return None;
        }
        count += 1;
    }
    Some(count)
}
