//! Tests for upm-cli: config parsing, merging, example generation and the
//! synthetic workload.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use upm_cli::config::*;
use upm_cli::simulation::{run_simulation, synthetic_batch};
use upm_core::{DriftWindowStatus, SyncStatus, TrainerId, TrainingMode};
use upm_runtime::snapshot::Codec;
use upm_runtime::{
    AllowAllPolicy, LinearKernel, MemoryStore, ReplayConfig, RuntimeDeps, Stores, UpmRuntime,
};

// =============================================================================
// Defaults
// =============================================================================

#[test]
fn config_default_logging() {
    let cfg = Config::default();
    assert_eq!(cfg.logging.level, "info");
    assert_eq!(cfg.logging.format, LogFormat::Text);
}

#[test]
fn config_default_metrics_disabled() {
    let cfg = Config::default();
    assert!(!cfg.metrics.enabled);
    assert_eq!(cfg.metrics.addr(), "127.0.0.1:9090");
}

#[test]
fn config_default_storage() {
    let cfg = Config::default();
    assert_eq!(cfg.storage.snapshot_root, PathBuf::from("./snapshots"));
    assert_eq!(cfg.storage.compression, Codec::Zstd);
    assert!(cfg.storage.journal.is_none());
    assert_eq!(cfg.storage.snapshot_retention, Duration::from_secs(7 * 86_400));
}

#[test]
fn config_default_pipeline_sections() {
    let cfg = Config::default();
    assert_eq!(cfg.replay.capacity, 1000);
    assert_eq!(cfg.trainer.snapshot_interval, 100);
    assert_eq!(cfg.drift.min_samples, 100);
    assert_eq!(cfg.drift.threshold, 0.2);
    assert_eq!(cfg.sync.max_attempts, 3);
    assert_eq!(cfg.sync.batch_size, 10);
    assert_eq!(cfg.supervisor.max_restarts, 3);
    assert_eq!(cfg.policy.min_shadow_duration, Duration::from_secs(3600));
    assert_eq!(cfg.transport.kind, TransportKind::Logging);
}

// =============================================================================
// YAML / TOML parsing
// =============================================================================

#[test]
fn yaml_full_document() {
    let yaml = r#"
logging:
  level: debug
  format: json
metrics:
  enabled: true
  port: 9100
storage:
  snapshot_root: /data/snapshots
  compression: gzip
  journal: /data/events.jsonl
  snapshot_retention: 2d
replay:
  expected_interval: 5m
  gap_multiplier: 3.0
trainer:
  snapshot_interval: 50
policy:
  canary_tenants: [acme, globex]
  min_shadow_duration: 30m
adapters:
  - id: edge-1
    mode: canary
    endpoint: http://edge-1:8080
  - id: edge-2
"#;
    let cfg = Config::from_yaml(yaml).unwrap();
    assert_eq!(cfg.logging.level, "debug");
    assert_eq!(cfg.logging.format, LogFormat::Json);
    assert!(cfg.metrics.enabled);
    assert_eq!(cfg.metrics.port, 9100);
    assert_eq!(cfg.storage.compression, Codec::Gzip);
    assert_eq!(cfg.storage.journal, Some(PathBuf::from("/data/events.jsonl")));
    assert_eq!(cfg.storage.snapshot_retention, Duration::from_secs(2 * 86_400));
    assert_eq!(cfg.replay.expected_interval, Duration::from_secs(300));
    assert_eq!(cfg.replay.gap_multiplier, 3.0);
    assert_eq!(cfg.trainer.snapshot_interval, 50);
    assert!(cfg.policy.canary_tenants.contains("acme"));
    assert_eq!(cfg.policy.min_shadow_duration, Duration::from_secs(1800));

    assert_eq!(cfg.adapters.len(), 2);
    assert_eq!(cfg.adapters[0].mode, TrainingMode::Canary);
    let adapter = cfg.adapters[0].to_adapter();
    assert_eq!(adapter.endpoint.as_deref(), Some("http://edge-1:8080"));
    assert_eq!(adapter.sync_status, SyncStatus::Pending);
    assert_eq!(cfg.adapters[1].mode, TrainingMode::Shadow);
    assert!(cfg.adapters[1].endpoint.is_none());
}

#[test]
fn toml_document() {
    let toml = r#"
[logging]
level = "warn"

[drift]
window = "15m"
threshold = 0.35
quarantine_enabled = false

[sync]
push_timeout = 10
backoff_max = "1m"

[simulation]
trainers = ["a", "b"]
batches = 20

[[adapters]]
id = "edge"
mode = "active"
"#;
    let cfg = Config::from_toml(toml).unwrap();
    assert_eq!(cfg.logging.level, "warn");
    assert_eq!(cfg.drift.window, Duration::from_secs(900));
    assert_eq!(cfg.drift.threshold, 0.35);
    assert!(!cfg.drift.quarantine_enabled);
    assert_eq!(cfg.sync.push_timeout, Duration::from_secs(10));
    assert_eq!(cfg.sync.backoff_max, Duration::from_secs(60));
    assert_eq!(cfg.simulation.trainers, vec!["a", "b"]);
    assert_eq!(cfg.simulation.batches, 20);
    assert_eq!(cfg.adapters[0].mode, TrainingMode::Active);
}

#[test]
fn yaml_invalid_duration_is_parse_error() {
    let err = Config::from_yaml("drift:\n  window: soon\n").unwrap_err();
    assert!(matches!(err, ConfigError::ParseError(_)));
}

#[test]
fn load_detects_format_by_extension() {
    let dir = tempfile::tempdir().unwrap();
    let yaml_path = dir.path().join("upm.yaml");
    std::fs::write(&yaml_path, "trainer:\n  snapshot_interval: 7\n").unwrap();
    assert_eq!(Config::load(&yaml_path).unwrap().trainer.snapshot_interval, 7);

    let toml_path = dir.path().join("upm.toml");
    std::fs::write(&toml_path, "[trainer]\nsnapshot_interval = 9\n").unwrap();
    assert_eq!(Config::load(&toml_path).unwrap().trainer.snapshot_interval, 9);

    // Unknown extension falls back from YAML to TOML
    let other = dir.path().join("upm.conf");
    std::fs::write(&other, "[trainer]\nsnapshot_interval = 11\n").unwrap();
    assert_eq!(Config::load(&other).unwrap().trainer.snapshot_interval, 11);
}

#[test]
fn load_missing_file_is_io_error() {
    let err = Config::load("/definitely/not/here.yaml").unwrap_err();
    assert!(matches!(err, ConfigError::IoError(_, _)));
}

// =============================================================================
// Merge and examples
// =============================================================================

#[test]
fn merge_overrides_only_non_default_fields() {
    let mut base = Config::default();
    base.metrics.port = 9999;
    base.adapters.push(AdapterEntry {
        id: "base".into(),
        mode: TrainingMode::Shadow,
        endpoint: None,
    });

    let mut other = Config::default();
    other.logging.format = LogFormat::Json;
    other.storage.journal = Some(PathBuf::from("/tmp/j.jsonl"));
    other.adapters.push(AdapterEntry {
        id: "extra".into(),
        mode: TrainingMode::Canary,
        endpoint: None,
    });

    base.merge(other);
    assert_eq!(base.logging.format, LogFormat::Json);
    assert_eq!(base.metrics.port, 9999);
    assert_eq!(base.storage.journal, Some(PathBuf::from("/tmp/j.jsonl")));
    let ids: Vec<_> = base.adapters.iter().map(|a| a.id.as_str()).collect();
    assert_eq!(ids, vec!["base", "extra"]);
}

#[test]
fn example_yaml_round_trips() {
    let yaml = Config::example_yaml();
    assert!(!yaml.is_empty());
    let parsed = Config::from_yaml(&yaml).unwrap();
    assert_eq!(parsed.adapters.len(), 2);
    assert_eq!(parsed.transport.kind, TransportKind::Http);
    assert_eq!(parsed.drift.window, Duration::from_secs(3600));
}

#[test]
fn example_toml_round_trips() {
    let toml = Config::example_toml();
    assert!(!toml.is_empty());
    let parsed = Config::from_toml(&toml).unwrap();
    assert_eq!(parsed.adapters.len(), 2);
    assert!(parsed.metrics.enabled);
    assert_eq!(parsed.sync.batch_pause, Duration::from_millis(100));
}

// =============================================================================
// Simulation
// =============================================================================

#[test]
fn synthetic_batches_are_contiguous_and_labeled() {
    let trainer = TrainerId::new("sim");
    let origin = chrono::Utc::now();
    let a = synthetic_batch(&trainer, 0, 4, origin);
    let b = synthetic_batch(&trainer, 1, 4, origin);
    assert_eq!(a.features.len(), 4);
    assert_eq!(a.labels.as_ref().map(|l| l.len()), Some(4));
    assert!(a.is_trainable());
    assert_eq!(b.window_start - a.window_start, chrono::Duration::minutes(1));
    assert_ne!(a.id, b.id);
}

#[tokio::test]
async fn simulation_trains_scores_and_activates() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.storage.snapshot_root = dir.path().to_path_buf();
    config.storage.compression = Codec::Gzip;
    config.trainer.snapshot_interval = 10;
    config.replay = ReplayConfig {
        release_interval: Duration::from_secs(3600),
        ..ReplayConfig::default()
    };
    config.simulation.trainers = vec!["alpha".into(), "beta".into()];
    config.simulation.batches = 30;
    config.simulation.comparisons = 150;
    config.simulation.prediction_offset = 0.5;

    let store = Arc::new(MemoryStore::new());
    let deps = RuntimeDeps::new(Stores::from_memory(store.clone()), LinearKernel::factory(0.01))
        .with_policy(Arc::new(AllowAllPolicy));
    let runtime = UpmRuntime::start(deps, config.runtime_config());
    for name in &config.simulation.trainers {
        runtime
            .spawn_trainer(TrainerId::new(name.as_str()), TrainingMode::Shadow)
            .await
            .unwrap();
    }

    let summaries = run_simulation(&runtime, &store, &config.simulation)
        .await
        .unwrap();
    assert_eq!(summaries.len(), 2);
    for s in &summaries {
        assert_eq!(s.batch_count, 30);
        assert_eq!(s.snapshots, 3);
        assert_eq!(s.latest_version, Some(3));
        assert_eq!(s.drift_status, Some(DriftWindowStatus::Quarantined));
        let p95 = s.drift_p95.unwrap();
        assert!((p95 - 0.5).abs() < 1e-9, "p95 was {}", p95);
        assert!(s.activated);
    }
    runtime.shutdown().await;
}
