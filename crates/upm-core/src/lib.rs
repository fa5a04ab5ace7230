//! # UPM Core
//!
//! Foundational types for the Unified Persistent Model online-training and
//! safety pipeline.
//!
//! ## Modules
//!
//! - [`types`]: identifiers and the durable records (feature batches, trainer
//!   state, snapshots, drift windows, adapters, actors)
//! - [`value`]: prediction / ground-truth values compared by drift scoring
//! - [`event`]: the event envelope published for external control planes

pub mod event;
pub mod types;
pub mod value;

pub use event::{EventKind, UpmEvent};
pub use types::{
    Actor, Adapter, AdapterId, BatchId, BatchNotification, BatchStatus, Comparison, DriftWindow,
    DriftWindowId, DriftWindowStatus, FeatureBatch, Role, Snapshot, SnapshotId, SnapshotMetadata,
    SnapshotStatus, SyncStatus, TrainerId, TrainerRecord, TrainerStatus, TrainingMode,
};
pub use value::Value;
