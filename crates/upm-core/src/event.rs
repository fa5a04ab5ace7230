//! Domain events emitted by the pipeline.
//!
//! Delivery is at-least-once: every event carries a unique `id`, and
//! subscribers are expected to deduplicate on it. `correlation_id` ties
//! together events caused by the same operation (e.g. an activation and the
//! adapter failures it led to).

use crate::types::{AdapterId, DriftWindowId, SnapshotId, TrainerId, TrainingMode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Envelope for every emitted event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpmEvent {
    pub id: Uuid,
    pub correlation_id: Uuid,
    pub trainer_id: TrainerId,
    pub occurred_at: DateTime<Utc>,
    pub kind: EventKind,
}

impl UpmEvent {
    pub fn new(trainer_id: TrainerId, correlation_id: Uuid, kind: EventKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            correlation_id,
            trainer_id,
            occurred_at: Utc::now(),
            kind,
        }
    }

    /// Wire name of the event, e.g. `snapshot.created`.
    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn snapshot_id(&self) -> Option<&SnapshotId> {
        match &self.kind {
            EventKind::SnapshotCreated { snapshot_id, .. }
            | EventKind::SnapshotActivated { snapshot_id, .. }
            | EventKind::AdapterSyncFailed { snapshot_id, .. } => Some(snapshot_id),
            EventKind::Rollback { to_snapshot_id, .. } => Some(to_snapshot_id),
            EventKind::DriftQuarantine { snapshot_id, .. }
            | EventKind::ShadowDelta { snapshot_id, .. } => snapshot_id.as_ref(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum EventKind {
    #[serde(rename = "snapshot.created")]
    SnapshotCreated {
        snapshot_id: SnapshotId,
        version: u64,
        mode: TrainingMode,
        size_bytes: u64,
        batch_count: u64,
    },

    #[serde(rename = "snapshot.activated")]
    SnapshotActivated {
        snapshot_id: SnapshotId,
        version: u64,
        mode: TrainingMode,
        previous_snapshot_id: Option<SnapshotId>,
        actor: String,
    },

    #[serde(rename = "rollback")]
    Rollback {
        from_snapshot_id: Option<SnapshotId>,
        to_snapshot_id: SnapshotId,
        to_version: u64,
        mode: TrainingMode,
        reason: String,
    },

    #[serde(rename = "drift.quarantine")]
    DriftQuarantine {
        window_id: DriftWindowId,
        snapshot_id: Option<SnapshotId>,
        score_p95: f64,
        threshold: f64,
        sample_count: usize,
        recommendation: String,
    },

    #[serde(rename = "shadow_delta")]
    ShadowDelta {
        window_id: DriftWindowId,
        snapshot_id: Option<SnapshotId>,
        drift_score: f64,
    },

    #[serde(rename = "adapter.sync_failed")]
    AdapterSyncFailed {
        adapter_id: AdapterId,
        snapshot_id: SnapshotId,
        attempts: u32,
        error: String,
    },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SnapshotCreated { .. } => "snapshot.created",
            Self::SnapshotActivated { .. } => "snapshot.activated",
            Self::Rollback { .. } => "rollback",
            Self::DriftQuarantine { .. } => "drift.quarantine",
            Self::ShadowDelta { .. } => "shadow_delta",
            Self::AdapterSyncFailed { .. } => "adapter.sync_failed",
        }
    }
}
