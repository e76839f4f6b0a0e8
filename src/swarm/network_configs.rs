//! Remembered network configurations, persisted so that announced topics
//! are rejoined after a restart.

use super::JoinOptions;
use crate::store::DiscoveryKey;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfiguration {
    pub discovery_key: DiscoveryKey,
    pub announce: bool,
    pub lookup: bool,
}

impl NetworkConfiguration {
    pub fn join_options(&self) -> JoinOptions {
        JoinOptions {
            announce: self.announce,
            lookup: self.lookup,
            flush: false,
            remember: true,
        }
    }
}

/// Configurations keyed by discovery key, backed by a JSON file.
#[derive(Debug, Default)]
pub struct NetworkConfigurations {
    path: Option<PathBuf>,
    entries: Vec<NetworkConfiguration>,
}

impl NetworkConfigurations {
    /// In-memory only; nothing is written to disk.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load from `path`. A missing file yields an empty set.
    pub fn load(path: &Path) -> Result<Self> {
        let entries = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?
        } else {
            Vec::new()
        };
        Ok(Self {
            path: Some(path.to_path_buf()),
            entries,
        })
    }

    pub fn list(&self) -> &[NetworkConfiguration] {
        &self.entries
    }

    pub fn get(&self, discovery_key: &DiscoveryKey) -> Option<&NetworkConfiguration> {
        self.entries
            .iter()
            .find(|c| &c.discovery_key == discovery_key)
    }

    /// Record the options for a topic. Leaving a topic forgets it.
    pub fn remember(&mut self, discovery_key: DiscoveryKey, opts: JoinOptions) -> Result<()> {
        self.entries.retain(|c| c.discovery_key != discovery_key);
        if !opts.is_leave() {
            self.entries.push(NetworkConfiguration {
                discovery_key,
                announce: opts.announce,
                lookup: opts.lookup,
            });
        }
        self.persist()
    }

    pub fn forget(&mut self, discovery_key: &DiscoveryKey) -> Result<()> {
        self.entries.retain(|c| &c.discovery_key != discovery_key);
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let content = serde_json::to_string_pretty(&self.entries)
            .context("Failed to serialize network configurations")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }
}
