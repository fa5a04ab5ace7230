//! Configuration file support for UPM
//!
//! Supports both YAML and TOML configuration files.
//!
//! # Example YAML configuration:
//! ```yaml
//! logging:
//!   level: info
//!   format: json
//!
//! metrics:
//!   enabled: true
//!   port: 9090
//!
//! storage:
//!   snapshot_root: /var/lib/upm/snapshots
//!   compression: zstd
//!   journal: /var/lib/upm/events.jsonl
//!
//! trainer:
//!   snapshot_interval: 100
//!
//! drift:
//!   window: 1h
//!   threshold: 0.2
//!
//! adapters:
//!   - id: edge-eu
//!     mode: shadow
//!     endpoint: http://edge-eu:8080
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use upm_core::{Adapter, TrainingMode};
use upm_runtime::snapshot::Codec;
use upm_runtime::supervisor::SupervisorConfig;
use upm_runtime::{
    DriftConfig, PolicyConfig, ReplayConfig, RuntimeConfig, SnapshotConfig, SyncConfig,
    TrainerConfig,
};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
    pub storage: StorageConfig,
    pub replay: ReplayConfig,
    pub trainer: TrainerConfig,
    pub drift: DriftConfig,
    pub sync: SyncConfig,
    pub supervisor: SupervisorConfig,
    pub policy: PolicyConfig,
    pub transport: TransportConfig,
    pub simulation: SimulationConfig,
    /// Adapters registered at startup
    pub adapters: Vec<AdapterEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error); `RUST_LOG` wins if set
    pub level: String,

    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

/// Prometheus endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub bind: String,
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: "127.0.0.1".to_string(),
            port: 9090,
        }
    }
}

impl MetricsConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// Where snapshots and the event journal live
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub snapshot_root: PathBuf,

    /// Preferred codec; zstd falls back to gzip when not compiled in
    pub compression: Codec,

    /// JSON-lines event journal
    pub journal: Option<PathBuf>,

    /// Terminal snapshots older than this are removed at startup
    #[serde(with = "upm_runtime::serde_duration")]
    pub snapshot_retention: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            snapshot_root: PathBuf::from("./snapshots"),
            compression: Codec::default(),
            journal: None,
            snapshot_retention: Duration::from_secs(7 * 86_400),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Log pushes without sending anything
    #[default]
    Logging,
    Http,
}

/// How snapshots reach adapters
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TransportConfig {
    pub kind: TransportKind,

    /// Sent as `x-api-key` by the HTTP transport
    pub api_key: Option<String>,
}

/// An adapter registered from the config file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterEntry {
    pub id: String,
    #[serde(default)]
    pub mode: TrainingMode,
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl AdapterEntry {
    pub fn to_adapter(&self) -> Adapter {
        let adapter = Adapter::new(self.id.as_str(), self.mode);
        match &self.endpoint {
            Some(endpoint) => adapter.with_endpoint(endpoint.as_str()),
            None => adapter,
        }
    }
}

/// Synthetic workload driven by `upm run`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub trainers: Vec<String>,
    pub mode: TrainingMode,
    /// Batches generated per trainer
    pub batches: u64,
    pub rows_per_batch: usize,
    /// Prediction / ground-truth pairs recorded per trainer
    pub comparisons: usize,
    /// Constant error added to every synthetic prediction
    pub prediction_offset: f64,
    pub learning_rate: f64,
    /// Activate each trainer's newest snapshot at the end
    pub activate: bool,
    pub actor: String,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            trainers: vec!["demo".to_string()],
            mode: TrainingMode::Shadow,
            batches: 500,
            rows_per_batch: 8,
            comparisons: 200,
            prediction_offset: 0.05,
            learning_rate: 0.01,
            activate: true,
            actor: "upm-cli".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a file (YAML or TOML, auto-detected by extension)
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e.to_string()))?;

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();

        match extension.as_str() {
            "yaml" | "yml" => Self::from_yaml(&content),
            "toml" => Self::from_toml(&content),
            _ => Self::from_yaml(&content).or_else(|_| Self::from_toml(&content)),
        }
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Overlay `other` onto this config. Fields left at their default in
    /// `other` keep this config's value; adapters are appended.
    pub fn merge(&mut self, other: Config) {
        let logging = LoggingConfig::default();
        if other.logging.level != logging.level {
            self.logging.level = other.logging.level;
        }
        if other.logging.format != logging.format {
            self.logging.format = other.logging.format;
        }

        let metrics = MetricsConfig::default();
        if other.metrics.enabled {
            self.metrics.enabled = true;
        }
        if other.metrics.bind != metrics.bind {
            self.metrics.bind = other.metrics.bind;
        }
        if other.metrics.port != metrics.port {
            self.metrics.port = other.metrics.port;
        }

        let storage = StorageConfig::default();
        if other.storage.snapshot_root != storage.snapshot_root {
            self.storage.snapshot_root = other.storage.snapshot_root;
        }
        if other.storage.compression != storage.compression {
            self.storage.compression = other.storage.compression;
        }
        if other.storage.journal.is_some() {
            self.storage.journal = other.storage.journal;
        }
        if other.storage.snapshot_retention != storage.snapshot_retention {
            self.storage.snapshot_retention = other.storage.snapshot_retention;
        }

        if other.transport.kind != TransportKind::default() {
            self.transport.kind = other.transport.kind;
        }
        if other.transport.api_key.is_some() {
            self.transport.api_key = other.transport.api_key;
        }

        self.adapters.extend(other.adapters);
    }

    /// Runtime settings derived from this file
    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            snapshot: SnapshotConfig {
                root: self.storage.snapshot_root.clone(),
                compression: self.storage.compression,
            },
            replay: self.replay.clone(),
            trainer: self.trainer.clone(),
            drift: self.drift.clone(),
            sync: self.sync.clone(),
            supervisor: self.supervisor.clone(),
        }
    }

    /// Create an example configuration
    pub fn example() -> Self {
        Self {
            logging: LoggingConfig {
                level: "info".to_string(),
                format: LogFormat::Json,
            },
            metrics: MetricsConfig {
                enabled: true,
                bind: "0.0.0.0".to_string(),
                port: 9090,
            },
            storage: StorageConfig {
                snapshot_root: PathBuf::from("/var/lib/upm/snapshots"),
                journal: Some(PathBuf::from("/var/lib/upm/events.jsonl")),
                ..Default::default()
            },
            policy: PolicyConfig {
                canary_tenants: ["tenant-a".to_string()].into_iter().collect(),
                ..Default::default()
            },
            transport: TransportConfig {
                kind: TransportKind::Http,
                api_key: Some("your-adapter-api-key".to_string()),
            },
            adapters: vec![
                AdapterEntry {
                    id: "edge-eu".to_string(),
                    mode: TrainingMode::Shadow,
                    endpoint: Some("http://edge-eu:8080".to_string()),
                },
                AdapterEntry {
                    id: "edge-us".to_string(),
                    mode: TrainingMode::Shadow,
                    endpoint: Some("http://edge-us:8080".to_string()),
                },
            ],
            ..Default::default()
        }
    }

    pub fn example_yaml() -> String {
        serde_yaml::to_string(&Self::example()).unwrap_or_default()
    }

    pub fn example_toml() -> String {
        toml::to_string_pretty(&Self::example()).unwrap_or_default()
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    IoError(PathBuf, String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),
}
