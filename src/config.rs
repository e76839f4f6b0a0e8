use crate::store::keys::hex_decode_32;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;

/// Daemon configuration, read from `config.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct HubConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    /// RPC port. A free port is picked when unset.
    #[serde(default)]
    pub port: Option<u16>,
    /// Port of the pushed-events listener. A free port is picked when unset.
    #[serde(default)]
    pub events_port: Option<u16>,
    /// Seconds a session's events wait for its events connection before
    /// they are discarded.
    #[serde(default = "default_events_claim_timeout_secs")]
    pub events_claim_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: None,
            events_port: None,
            events_claim_timeout_secs: default_events_claim_timeout_secs(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_events_claim_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// Unreferenced logs kept open before the oldest is evicted.
    #[serde(default = "default_max_idle_logs")]
    pub max_idle_logs: usize,
    /// Hex seed for locally named logs. Generated and persisted when unset.
    #[serde(default)]
    pub seed: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_idle_logs: default_max_idle_logs(),
            seed: None,
        }
    }
}

fn default_max_idle_logs() -> usize {
    16
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkConfig {
    /// Never announce topics; remembered configurations are not rejoined.
    #[serde(default)]
    pub no_announce: bool,
    /// Settle join attempts immediately. Without remote candidates there is
    /// nothing to wait for.
    #[serde(default = "default_true")]
    pub auto_settle: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            no_announce: false,
            auto_settle: true,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    #[serde(default = "default_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

impl HubConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file as YAML: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `explicit` if given, else the default config file when it exists,
    /// else the built-in defaults.
    pub fn resolve(explicit: Option<&Path>, default_path: &Path) -> Result<Self> {
        match explicit {
            Some(path) => Self::load(path),
            None if default_path.exists() => Self::load(default_path),
            None => Ok(Self::default()),
        }
    }

    /// The configured seed, if any.
    pub fn seed(&self) -> Result<Option<[u8; 32]>> {
        self.store
            .seed
            .as_deref()
            .map(|hex| hex_decode_32(hex).map_err(|e| anyhow::anyhow!("Invalid store seed: {}", e)))
            .transpose()
    }

    pub fn validate(&self) -> Result<()> {
        self.server
            .host
            .parse::<IpAddr>()
            .with_context(|| format!("Invalid server host '{}'", self.server.host))?;

        if let (Some(port), Some(events_port)) = (self.server.port, self.server.events_port) {
            if port != 0 && port == events_port {
                anyhow::bail!(
                    "server.port and server.events_port must differ (both are {})",
                    port
                );
            }
        }

        if self.server.events_claim_timeout_secs == 0 {
            anyhow::bail!("server.events_claim_timeout_secs must be at least 1");
        }

        if self.store.max_idle_logs > 65_536 {
            anyhow::bail!(
                "store.max_idle_logs must be at most 65536, got {}",
                self.store.max_idle_logs
            );
        }
        self.seed()?;

        tracing_subscriber::EnvFilter::try_new(&self.log.level)
            .with_context(|| format!("Invalid log level '{}'", self.log.level))?;

        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
