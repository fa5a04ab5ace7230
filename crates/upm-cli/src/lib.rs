//! UPM CLI library - testable functions and modules
//!
//! Configuration loading, logging setup and the synthetic workload used by
//! the `upm` binary.

pub mod config;
pub mod simulation;

use anyhow::Result;
use std::collections::BTreeMap;
use std::path::Path;
use tracing_subscriber::EnvFilter;
use upm_runtime::JsonlEventJournal;

use config::{LogFormat, LoggingConfig};

/// Install the global subscriber. `RUST_LOG` overrides the configured level.
pub fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .map_err(|e| anyhow::anyhow!("invalid log level '{}': {}", logging.level, e))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match logging.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.try_init(),
    };
    result.map_err(|e| anyhow::anyhow!("failed to initialise logging: {}", e))
}

/// Count journaled events by name.
pub fn journal_summary(path: &Path) -> Result<BTreeMap<&'static str, usize>> {
    let events = JsonlEventJournal::read_all(path)
        .map_err(|e| anyhow::anyhow!("cannot read journal {}: {}", path.display(), e))?;
    let mut counts = BTreeMap::new();
    for event in &events {
        *counts.entry(event.name()).or_insert(0) += 1;
    }
    Ok(counts)
}
