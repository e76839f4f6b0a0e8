//! Swarm configuration requested by a client.

use super::state::SessionState;
use crate::error::{HubError, HubResult};
use crate::store::DiscoveryKey;
use crate::swarm::{JoinOptions, SwarmStatus};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStatus {
    pub swarm: SwarmStatus,
    /// Number of remembered configurations rejoined on startup.
    pub remembered: usize,
}

pub struct NetworkSession {
    state: Arc<SessionState>,
}

impl NetworkSession {
    pub fn new(state: Arc<SessionState>) -> Self {
        Self { state }
    }

    /// Join or leave a topic. With `remember` the configuration is persisted
    /// and rejoined on the next start; leaving forgets it.
    pub async fn configure(&self, discovery_key: DiscoveryKey, opts: JoinOptions) -> HubResult<()> {
        let ctx = self.state.ctx().clone();
        let mut opts = opts;
        if ctx.no_announce {
            opts.announce = false;
        }
        if opts.remember {
            ctx.network_configs
                .lock()
                .remember(discovery_key, opts)
                .map_err(|e| HubError::Storage {
                    message: format!("{:#}", e),
                })?;
        }
        tracing::debug!(topic = %discovery_key, announce = opts.announce, lookup = opts.lookup, "configuring network");
        ctx.swarm.configure(discovery_key, opts).await
    }

    pub fn status(&self) -> NetworkStatus {
        let ctx = self.state.ctx();
        NetworkStatus {
            swarm: ctx.swarm.status(),
            remembered: ctx.network_configs.lock().list().len(),
        }
    }
}
