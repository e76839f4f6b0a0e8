//! Home-based storage paths for daemon persistence.
//!
//! Everything lives under `~/.loghub/` unless `LOGHUB_HOME` points elsewhere:
//! - `config.yaml` - Daemon configuration
//! - `daemon.json` - Ports of the running daemon
//! - `daemon.pid` / `daemon.lock` - Process management
//! - `seed` - Store seed for locally named logs
//! - `network.json` - Remembered network configurations
//! - `daemon.log` - Daemon log

use crate::store::keys::{hex_decode_32, hex_encode};
use anyhow::{Context, Result};
use rand::RngCore;
use std::fs;
use std::path::{Path, PathBuf};

const LOGHUB_DIR: &str = ".loghub";

/// Environment variable relocating the home directory.
pub const HOME_ENV: &str = "LOGHUB_HOME";

/// Returns the daemon's home directory, creating it if needed.
pub fn loghub_home_dir() -> Result<PathBuf> {
    let dir = match std::env::var_os(HOME_ENV) {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => dirs::home_dir()
            .context("Could not determine home directory for loghub storage")?
            .join(LOGHUB_DIR),
    };
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create loghub directory: {}", dir.display()))?;
    Ok(dir)
}

pub fn config_path() -> Result<PathBuf> {
    Ok(loghub_home_dir()?.join("config.yaml"))
}

/// JSON with the RPC and events ports of the running daemon.
pub fn port_path() -> Result<PathBuf> {
    Ok(loghub_home_dir()?.join("daemon.json"))
}

pub fn pid_path() -> Result<PathBuf> {
    Ok(loghub_home_dir()?.join("daemon.pid"))
}

/// Held exclusively by the running daemon.
pub fn lock_path() -> Result<PathBuf> {
    Ok(loghub_home_dir()?.join("daemon.lock"))
}

pub fn seed_path() -> Result<PathBuf> {
    Ok(loghub_home_dir()?.join("seed"))
}

pub fn network_configs_path() -> Result<PathBuf> {
    Ok(loghub_home_dir()?.join("network.json"))
}

pub fn daemon_log_path() -> Result<PathBuf> {
    Ok(loghub_home_dir()?.join("daemon.log"))
}

/// Read the hex seed at `path`, generating and persisting one on first use.
pub fn load_or_create_seed(path: &Path) -> Result<[u8; 32]> {
    if path.exists() {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read seed file: {}", path.display()))?;
        return hex_decode_32(content.trim())
            .map_err(|e| anyhow::anyhow!("Invalid seed in {}: {}", path.display(), e));
    }
    let mut seed = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut seed);
    fs::write(path, hex_encode(&seed))
        .with_context(|| format!("Failed to write seed file: {}", path.display()))?;
    Ok(seed)
}

#[cfg(test)]
#[path = "tests/hub_paths_tests.rs"]
mod tests;
