//! UPM CLI - run and inspect the online-training pipeline

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use upm_cli::config::{Config, TransportKind};
use upm_cli::simulation::run_simulation;
use upm_cli::{init_tracing, journal_summary};
use upm_core::TrainerId;
use upm_runtime::{
    AdapterTransport, HttpAdapterTransport, JsonlEventJournal, LinearKernel, LoggingTransport,
    MemoryStore, MetricsServer, RuntimeDeps, StagedRolloutPolicy, Stores, UpmRuntime,
};

#[derive(Parser)]
#[command(name = "upm")]
#[command(author = "UPM Contributors")]
#[command(version = "0.1.0")]
#[command(about = "UPM - online training with snapshot, drift and rollout safety", long_about = None)]
struct Cli {
    /// Path to configuration file (YAML or TOML)
    #[arg(short, long, global = true, env = "UPM_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a runtime and drive the configured synthetic workload through it
    Run {
        /// Keep serving metrics after the workload until Ctrl-C
        #[arg(long)]
        hold: bool,

        /// Override the number of batches per trainer
        #[arg(long)]
        batches: Option<u64>,
    },

    /// Print an example configuration
    Config {
        /// Output format (yaml or toml)
        #[arg(short, long, default_value = "yaml")]
        format: String,

        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Load the configuration file and report what it resolves to
    Validate,

    /// Summarise an event journal
    Events {
        /// Path to the JSON-lines journal
        journal: PathBuf,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::load(path).map_err(|e| anyhow::anyhow!("{}", e)),
        None => Ok(Config::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { hold, batches } => {
            let mut config = load_config(cli.config.as_ref())?;
            if let Some(batches) = batches {
                config.simulation.batches = batches;
            }
            init_tracing(&config.logging)?;
            run(config, hold).await?;
        }

        Commands::Config { format, output } => {
            let content = match format.to_lowercase().as_str() {
                "yaml" | "yml" => Config::example_yaml(),
                "toml" => Config::example_toml(),
                _ => anyhow::bail!("Unsupported format: {}. Use 'yaml' or 'toml'", format),
            };

            if let Some(path) = output {
                std::fs::write(&path, &content)?;
                println!("Configuration written to: {}", path.display());
            } else {
                println!("{}", content);
            }
        }

        Commands::Validate => {
            let Some(path) = cli.config.as_ref() else {
                anyhow::bail!("--config (or UPM_CONFIG) is required for validate");
            };
            let config = load_config(Some(path))?;
            let runtime = config.runtime_config();
            println!("Configuration OK: {}", path.display());
            println!("  snapshot root:     {}", runtime.snapshot.root.display());
            println!("  compression:       {}", runtime.snapshot.compression);
            println!("  snapshot interval: {}", runtime.trainer.snapshot_interval);
            println!(
                "  drift:             window {:?}, threshold {}, min samples {}",
                runtime.drift.window, runtime.drift.threshold, runtime.drift.min_samples
            );
            println!("  adapters:          {}", config.adapters.len());
        }

        Commands::Events { journal } => {
            let counts = journal_summary(&journal)?;
            if counts.is_empty() {
                println!("No events in {}", journal.display());
            }
            for (name, count) in counts {
                println!("{:<24} {}", name, count);
            }
        }
    }

    Ok(())
}

async fn run(config: Config, hold: bool) -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let transport: Arc<dyn AdapterTransport> = match config.transport.kind {
        TransportKind::Http => Arc::new(HttpAdapterTransport::new(config.transport.api_key.clone())),
        TransportKind::Logging => Arc::new(LoggingTransport),
    };
    let deps = RuntimeDeps::new(
        Stores::from_memory(store.clone()),
        LinearKernel::factory(config.simulation.learning_rate),
    )
    .with_policy(Arc::new(StagedRolloutPolicy::new(config.policy.clone())))
    .with_transport(transport);
    let runtime = UpmRuntime::start(deps, config.runtime_config());

    let metrics_task = if config.metrics.enabled {
        let server = MetricsServer::new(runtime.metrics().clone(), config.metrics.addr());
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                warn!("Metrics server stopped: {}", e);
            }
        }))
    } else {
        None
    };

    let journal = match &config.storage.journal {
        Some(path) => {
            let journal = Arc::new(JsonlEventJournal::open(path)?);
            info!(path = %path.display(), "Journaling events");
            let task = journal.clone().spawn(runtime.subscribe());
            Some((journal, task))
        }
        None => None,
    };

    let removed = runtime
        .snapshots()
        .cleanup_old(config.storage.snapshot_retention)
        .await?;
    if removed > 0 {
        info!(removed, "Removed expired snapshots");
    }

    for entry in &config.adapters {
        runtime.register_adapter(entry.to_adapter()).await?;
    }
    for name in &config.simulation.trainers {
        runtime
            .spawn_trainer(TrainerId::new(name.as_str()), config.simulation.mode)
            .await?;
    }

    let summaries = run_simulation(&runtime, &store, &config.simulation).await?;
    for s in &summaries {
        println!(
            "{}: {} batches, avg loss {:.5}, {} snapshots (latest v{}), drift {} (p95 {}), {}",
            s.trainer_id,
            s.batch_count,
            s.avg_loss,
            s.snapshots,
            s.latest_version.map(|v| v.to_string()).unwrap_or_else(|| "-".into()),
            s.drift_status
                .map(|st| format!("{:?}", st).to_lowercase())
                .unwrap_or_else(|| "-".into()),
            s.drift_p95
                .map(|p| format!("{:.3}", p))
                .unwrap_or_else(|| "-".into()),
            if s.activated { "activated" } else { "not activated" },
        );
    }

    if hold {
        info!("Workload finished, holding until Ctrl-C");
        tokio::signal::ctrl_c().await?;
    }

    runtime.shutdown().await;
    if let Some((journal, task)) = journal {
        // The bus outlives the runtime; wait for the journal to catch up
        let published = runtime.events().published_total();
        for _ in 0..200 {
            if journal.count() >= published {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        task.abort();
        info!(
            path = %journal.path().display(),
            events = journal.count(),
            "Event journal closed"
        );
    }
    if let Some(task) = metrics_task {
        task.abort();
    }
    Ok(())
}
