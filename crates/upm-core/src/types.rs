//! Domain records shared by every UPM component.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Name of an online-learning process owning one evolving model.
    TrainerId
);
string_id!(
    /// Identifier of an upstream feature batch.
    BatchId
);
string_id!(
    /// Identifier of a registered downstream consumer.
    AdapterId
);
string_id!(
    /// Identifier of a persisted snapshot.
    SnapshotId
);
string_id!(
    /// Identifier of a drift evaluation window.
    DriftWindowId
);

impl SnapshotId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl DriftWindowId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// Production exposure level, shared by trainers, snapshots and adapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TrainingMode {
    #[default]
    Shadow,
    Canary,
    Active,
}

impl std::fmt::Display for TrainingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Shadow => write!(f, "shadow"),
            Self::Canary => write!(f, "canary"),
            Self::Active => write!(f, "active"),
        }
    }
}

impl std::str::FromStr for TrainingMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "shadow" => Ok(Self::Shadow),
            "canary" => Ok(Self::Canary),
            "active" => Ok(Self::Active),
            other => Err(format!(
                "Unknown mode: '{}'. Use: shadow, canary, active",
                other
            )),
        }
    }
}

// =============================================================================
// Feature batches
// =============================================================================

/// Upstream lifecycle of a feature batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Filled,
    Failed,
}

/// A time-bounded set of precomputed features and labels. Owned upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureBatch {
    pub id: BatchId,
    pub trainer_id: TrainerId,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub features: Vec<Vec<f64>>,
    #[serde(default)]
    pub labels: Option<Vec<f64>>,
    pub status: BatchStatus,
}

impl FeatureBatch {
    /// Only batches that are filled and carry labels can be trained on.
    pub fn is_trainable(&self) -> bool {
        self.status == BatchStatus::Filled
            && self.labels.as_ref().is_some_and(|l| !l.is_empty())
    }
}

/// "Feature batch created" notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchNotification {
    pub batch_id: BatchId,
    pub trainer_id: TrainerId,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub status: BatchStatus,
}

// =============================================================================
// Trainers
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TrainerStatus {
    #[default]
    Idle,
    Training,
    Paused,
    Errored,
}

impl std::fmt::Display for TrainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Training => write!(f, "training"),
            Self::Paused => write!(f, "paused"),
            Self::Errored => write!(f, "errored"),
        }
    }
}

/// Checkpointed trainer state. Parameters themselves are durable through snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerRecord {
    pub trainer_id: TrainerId,
    pub mode: TrainingMode,
    pub status: TrainerStatus,
    pub batch_count: u64,
    pub total_loss: f64,
    pub avg_loss: f64,
    pub last_batch_id: Option<BatchId>,
    pub last_snapshot_id: Option<SnapshotId>,
    #[serde(default)]
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl TrainerRecord {
    pub fn new(trainer_id: TrainerId, mode: TrainingMode) -> Self {
        Self {
            trainer_id,
            mode,
            status: TrainerStatus::Idle,
            batch_count: 0,
            total_loss: 0.0,
            avg_loss: 0.0,
            last_batch_id: None,
            last_snapshot_id: None,
            last_error: None,
            updated_at: Utc::now(),
        }
    }
}

// =============================================================================
// Snapshots
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotStatus {
    Created,
    Shadow,
    Activated,
    RolledBack,
    Archived,
}

impl SnapshotStatus {
    /// Terminal snapshots are eligible for garbage collection.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::RolledBack | Self::Archived)
    }
}

impl std::fmt::Display for SnapshotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Shadow => write!(f, "shadow"),
            Self::Activated => write!(f, "activated"),
            Self::RolledBack => write!(f, "rolled_back"),
            Self::Archived => write!(f, "archived"),
        }
    }
}

/// Descriptive metadata persisted alongside a snapshot record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    /// Codec the blob was written with (`none`, `gzip`, `zstd`).
    pub compression: String,
    /// Size of the serialized parameters before compression.
    pub original_size: u64,
    /// Number of batches applied when the snapshot was taken.
    pub batch_count: u64,
    pub avg_loss: f64,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// An immutable, versioned, checksummed serialization of a trainer's parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub trainer_id: TrainerId,
    pub version: u64,
    pub mode: TrainingMode,
    pub status: SnapshotStatus,
    /// Hex sha256 of the uncompressed parameter bytes.
    pub checksum: String,
    pub storage_path: String,
    /// Size of the blob on disk.
    pub size_bytes: u64,
    pub metadata: SnapshotMetadata,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub shadow_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub activated_at: Option<DateTime<Utc>>,
}

// =============================================================================
// Drift
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftWindowStatus {
    Open,
    Resolved,
    Quarantined,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftWindow {
    pub id: DriftWindowId,
    pub trainer_id: TrainerId,
    pub snapshot_id: Option<SnapshotId>,
    pub threshold: f64,
    pub score_p95: Option<f64>,
    pub score_mean: Option<f64>,
    pub score_max: Option<f64>,
    pub sample_count: usize,
    pub status: DriftWindowStatus,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl DriftWindow {
    pub fn open(trainer_id: TrainerId, snapshot_id: Option<SnapshotId>, threshold: f64) -> Self {
        Self::open_at(trainer_id, snapshot_id, threshold, Utc::now())
    }

    pub fn open_at(
        trainer_id: TrainerId,
        snapshot_id: Option<SnapshotId>,
        threshold: f64,
        opened_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: DriftWindowId::generate(),
            trainer_id,
            snapshot_id,
            threshold,
            score_p95: None,
            score_mean: None,
            score_max: None,
            sample_count: 0,
            status: DriftWindowStatus::Open,
            opened_at,
            closed_at: None,
        }
    }
}

/// One prediction compared against ground truth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comparison {
    pub prediction: crate::Value,
    pub ground_truth: crate::Value,
    pub drift_score: f64,
    pub timestamp: DateTime<Utc>,
}

// =============================================================================
// Adapters
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    #[default]
    Pending,
    Syncing,
    Synced,
    Errored,
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Syncing => write!(f, "syncing"),
            Self::Synced => write!(f, "synced"),
            Self::Errored => write!(f, "errored"),
        }
    }
}

/// A registered downstream consumer of activated snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Adapter {
    pub id: AdapterId,
    pub mode: TrainingMode,
    /// Push target for HTTP transports.
    #[serde(default)]
    pub endpoint: Option<String>,
    pub sync_status: SyncStatus,
    pub last_synced_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub synced_snapshot_id: Option<SnapshotId>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl Adapter {
    pub fn new(id: impl Into<AdapterId>, mode: TrainingMode) -> Self {
        Self {
            id: id.into(),
            mode,
            endpoint: None,
            sync_status: SyncStatus::Pending,
            last_synced_at: None,
            synced_snapshot_id: None,
            last_error: None,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }
}

// =============================================================================
// Actors
// =============================================================================

/// Access role with hierarchical permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Viewer = 0,
    Operator = 1,
    Admin = 2,
}

impl Role {
    /// Check if this role has at least the given permission level.
    pub fn has_permission(&self, required: Role) -> bool {
        (*self as u8) >= (required as u8)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Viewer => write!(f, "viewer"),
            Role::Operator => write!(f, "operator"),
            Role::Admin => write!(f, "admin"),
        }
    }
}

/// Whoever asks for an activation or rollback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub role: Role,
}

impl Actor {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }

    pub fn admin(id: impl Into<String>) -> Self {
        Self::new(id, Role::Admin)
    }

    pub fn operator(id: impl Into<String>) -> Self {
        Self::new(id, Role::Operator)
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}
