//! Networking layer contract.
//!
//! The hub never talks to the DHT or to peer sockets directly. It configures
//! discovery topics and observes flush progress through [`Swarm`]; the
//! replication code attaches peers to logs through the `store` hooks.

pub mod local;
pub mod network_configs;

use crate::error::HubResult;
use crate::store::DiscoveryKey;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot};

pub use local::LocalSwarm;
pub use network_configs::{NetworkConfiguration, NetworkConfigurations};

/// How a discovery key should be joined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinOptions {
    pub announce: bool,
    pub lookup: bool,
    /// Resolve `configure` only after the topic has flushed.
    #[serde(default)]
    pub flush: bool,
    /// Persist the configuration and rejoin it on the next start.
    #[serde(default)]
    pub remember: bool,
}

impl JoinOptions {
    pub fn announce() -> Self {
        Self {
            announce: true,
            lookup: true,
            flush: false,
            remember: false,
        }
    }

    pub fn leave() -> Self {
        Self {
            announce: false,
            lookup: false,
            flush: false,
            remember: false,
        }
    }

    pub fn is_leave(&self) -> bool {
        !self.announce && !self.lookup
    }
}

/// Public networking status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwarmStatus {
    pub holepunchable: bool,
    pub remote_address: String,
    pub joined_topics: usize,
}

#[async_trait::async_trait]
pub trait Swarm: Send + Sync {
    /// Join or leave a discovery topic. With `opts.flush` set, resolves once
    /// the topic's first round of connection attempts has settled.
    async fn configure(&self, discovery_key: DiscoveryKey, opts: JoinOptions) -> HubResult<()>;

    /// Whether the topic is currently joined.
    fn joined(&self, discovery_key: &DiscoveryKey) -> bool;

    /// Whether the topic's join attempts have settled.
    fn flushed(&self, discovery_key: &DiscoveryKey) -> bool;

    /// One-shot signal: every join attempt queued so far has settled.
    fn flush(&self) -> oneshot::Receiver<()>;

    /// Stream of topics whose join attempts have settled.
    fn subscribe_flushed(&self) -> broadcast::Receiver<DiscoveryKey>;

    fn status(&self) -> SwarmStatus;
}
