//! # UPM Runtime
//!
//! Online training and safety pipeline for the Unified Persistent Model.
//!
//! ## Components
//!
//! - [`replay_buffer`]: reorders and dedupes batch notifications per trainer
//! - [`trainer`]: applies one kernel update per released batch and snapshots periodically
//! - [`snapshot`]: checksummed, versioned parameter persistence and the rollout lifecycle
//! - [`drift`]: windowed prediction vs ground-truth scoring with quarantine
//! - [`adapter_sync`]: pushes activated snapshots to registered adapters with retries
//! - [`supervisor`] and [`runtime`]: one supervised unit per trainer, wired explicitly
//!
//! Shared plumbing lives in [`repository`] (store traits), [`event_bus`],
//! [`metrics`] and [`policy`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use upm_runtime::{LinearKernel, RuntimeConfig, RuntimeDeps, Stores, UpmRuntime};
//! use upm_core::TrainingMode;
//!
//! # async fn demo() -> Result<(), upm_runtime::RuntimeError> {
//! let deps = RuntimeDeps::new(Stores::in_memory(), LinearKernel::factory(0.01));
//! let runtime = UpmRuntime::start(deps, RuntimeConfig::default());
//! runtime.spawn_trainer("fraud-score".into(), TrainingMode::Shadow).await?;
//! runtime.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod adapter_sync;
pub mod drift;
pub mod event_bus;
pub mod kernel;
pub mod metrics;
pub mod policy;
pub mod replay_buffer;
pub mod repository;
pub mod runtime;
pub mod serde_duration;
pub mod snapshot;
pub mod supervisor;
pub mod trainer;

pub use adapter_sync::{
    AdapterSync, AdapterTransport, HttpAdapterTransport, LoggingTransport, SyncConfig, SyncError,
    SyncReport,
};
pub use drift::{drift_score, percentile, DriftCommand, DriftConfig, DriftMonitor};
pub use event_bus::{EventBus, EventSubscription, JsonlEventJournal};
pub use kernel::{KernelError, KernelFactory, LinearKernel, TrainingKernel};
pub use metrics::{Metrics, MetricsServer};
pub use policy::{
    ActivationPolicy, AllowAllPolicy, PolicyConfig, PolicyDecision, StagedRolloutPolicy,
};
pub use replay_buffer::{AddOutcome, ReplayBuffer, ReplayCommand, ReplayConfig};
pub use repository::{
    AdapterRepository, BatchSource, DriftWindowRepository, MemoryStore, SnapshotRepository,
    StoreError, Stores, TrainerRepository,
};
pub use runtime::{RuntimeConfig, RuntimeDeps, RuntimeError, UpmRuntime};
pub use snapshot::{
    ActivationOutcome, Codec, CreateSnapshotRequest, SnapshotConfig, SnapshotError,
    SnapshotManager,
};
pub use supervisor::{SupervisorConfig, SupervisorExit};
pub use trainer::{TrainerCommand, TrainerConfig, TrainerError, TrainerWorker};
