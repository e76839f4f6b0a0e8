//! Daemon log file.
//!
//! The daemon runs detached, so its tracing output goes to
//! `~/.loghub/daemon.log` instead of a terminal.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

/// Build the filter: `RUST_LOG` when set, else `level`.
pub fn log_filter(level: &str) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(level).with_context(|| format!("Invalid log level '{}'", level)),
    }
}

/// Install the global subscriber writing to `path` (appending).
pub fn init_daemon_log(path: &Path, level: &str) -> Result<()> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open daemon log: {}", path.display()))?;
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(level)?)
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install daemon log subscriber: {}", e))
}
