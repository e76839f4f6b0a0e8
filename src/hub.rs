//! Process-wide state shared by every client session.

use crate::error::HubResult;
use crate::lock::{LockManager, SessionId};
use crate::readiness::ReadinessTracker;
use crate::session::{ClientEvent, ClientSession};
use crate::store::LogStore;
use crate::swarm::{NetworkConfigurations, Swarm, SwarmStatus};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Build identifiers reported by `status`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const BUILD_SHA: &str = env!("LOGHUB_GIT_SHA");

#[derive(Debug, Clone)]
pub struct HubOptions {
    /// Seed deriving the keys of locally named logs.
    pub seed: [u8; 32],
    /// Unreferenced logs kept open before the oldest is evicted.
    pub max_idle_logs: usize,
    /// Never announce topics, whatever clients request.
    pub no_announce: bool,
}

impl Default for HubOptions {
    fn default() -> Self {
        Self {
            seed: [0; 32],
            max_idle_logs: 16,
            no_announce: false,
        }
    }
}

/// Everything a session reaches through its state.
pub struct HubContext {
    pub store: Arc<LogStore>,
    pub swarm: Arc<dyn Swarm>,
    pub tracker: Arc<ReadinessTracker>,
    pub locks: Arc<LockManager>,
    pub network_configs: Mutex<NetworkConfigurations>,
    pub no_announce: bool,
    live_sessions: AtomicUsize,
}

impl HubContext {
    pub(crate) fn session_opened(&self) {
        self.live_sessions.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn session_closed(&self) {
        self.live_sessions.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn live_sessions(&self) -> usize {
        self.live_sessions.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubStatus {
    pub version: String,
    pub build_sha: String,
    pub sessions: usize,
    pub open_logs: usize,
    pub network: SwarmStatus,
}

pub struct Hub {
    ctx: Arc<HubContext>,
    next_session: AtomicU64,
    feed_listener: u64,
    flush_listener: JoinHandle<()>,
}

impl Hub {
    /// Must be called inside a tokio runtime.
    pub fn new(
        opts: HubOptions,
        swarm: Arc<dyn Swarm>,
        network_configs: NetworkConfigurations,
    ) -> Self {
        let store = Arc::new(LogStore::new(opts.seed, opts.max_idle_logs));
        let tracker = ReadinessTracker::new(swarm.clone());
        let flush_listener = tracker.spawn_flush_listener();
        let feed_listener = {
            let tracker = tracker.clone();
            store.subscribe_feeds(move |log| tracker.track(log))
        };
        let ctx = Arc::new(HubContext {
            store,
            swarm,
            tracker,
            locks: Arc::new(LockManager::new()),
            network_configs: Mutex::new(network_configs),
            no_announce: opts.no_announce,
            live_sessions: AtomicUsize::new(0),
        });
        Self {
            ctx,
            next_session: AtomicU64::new(1),
            feed_listener,
            flush_listener,
        }
    }

    pub fn context(&self) -> &Arc<HubContext> {
        &self.ctx
    }

    /// Open a session for a new connection.
    pub fn connect(&self) -> HubResult<(ClientSession, mpsc::UnboundedReceiver<ClientEvent>)> {
        let id: SessionId = self.next_session.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(session = id, "session connected");
        ClientSession::new(id, self.ctx.clone())
    }

    /// Rejoin every remembered announce configuration. Returns how many
    /// topics were rejoined.
    pub async fn rejoin(&self) -> usize {
        if self.ctx.no_announce {
            return 0;
        }
        let configs: Vec<_> = self
            .ctx
            .network_configs
            .lock()
            .list()
            .iter()
            .filter(|c| c.announce)
            .cloned()
            .collect();
        let mut rejoined = 0;
        for config in configs {
            match self
                .ctx
                .swarm
                .configure(config.discovery_key, config.join_options())
                .await
            {
                Ok(()) => rejoined += 1,
                Err(e) => {
                    tracing::warn!(topic = %config.discovery_key, error = %e, "rejoin failed")
                }
            }
        }
        tracing::info!(rejoined, "rejoined remembered topics");
        rejoined
    }

    pub fn status(&self) -> HubStatus {
        HubStatus {
            version: VERSION.to_string(),
            build_sha: BUILD_SHA.to_string(),
            sessions: self.ctx.live_sessions(),
            open_logs: self.ctx.store.open_count(),
            network: self.ctx.swarm.status(),
        }
    }

    /// Close every open log. Sessions still connected see their pending
    /// operations fail.
    pub fn close(&self) {
        self.ctx.store.close_all();
        tracing::info!("hub closed");
    }
}

impl Drop for Hub {
    fn drop(&mut self) {
        self.ctx.store.unsubscribe_feeds(self.feed_listener);
        self.flush_listener.abort();
    }
}

#[cfg(test)]
#[path = "tests/hub_tests.rs"]
mod tests;
