//! Client sessions: everything one connection owns.
//!
//! A [`ClientSession`] bundles the per-connection state with the three
//! facades the RPC layer dispatches into: [`BasestoreSession`] (open and
//! close logs), [`LogSession`] (operations on open logs) and
//! [`NetworkSession`] (swarm configuration).

pub mod basestore;
pub mod log_session;
pub mod log_watch;
pub mod network;
pub mod resources;
pub mod state;

use crate::hub::HubContext;
use crate::lock::SessionId;
use crate::store::{LogKey, PeerInfo, PeerKey};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

pub use basestore::{BasestoreSession, LogSnapshot, OpenRequest};
pub use log_session::{LogSession, ReadOptions, SeekOptions, UpdateOptions, UpdateOutcome};
pub use log_watch::WatchKind;
pub use network::{NetworkSession, NetworkStatus};
pub use resources::ResourceTable;
pub use state::SessionState;

/// Notification pushed to a client without a reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientEvent {
    /// A log was opened into the store by any session.
    Feed { key: LogKey },
    Append {
        id: String,
        length: u64,
        byte_length: u64,
    },
    PeerOpen { id: String, peer: PeerInfo },
    PeerRemove { id: String, peer: PeerInfo },
    /// A weakly referenced log was closed.
    Close { id: String },
    Download {
        id: String,
        seq: u64,
        byte_length: u64,
    },
    Upload {
        id: String,
        seq: u64,
        byte_length: u64,
    },
    Extension {
        id: String,
        resource_id: String,
        remote_public_key: PeerKey,
        data: Vec<u8>,
    },
    /// A read started waiting for its block.
    Wait { id: String, on_wait_id: u64, seq: u64 },
}

pub struct ClientSession {
    state: Arc<SessionState>,
    pub basestore: BasestoreSession,
    pub logs: LogSession,
    pub network: NetworkSession,
}

impl ClientSession {
    pub fn new(
        id: SessionId,
        ctx: Arc<HubContext>,
    ) -> crate::error::HubResult<(Self, mpsc::UnboundedReceiver<ClientEvent>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = SessionState::new(id, ctx, tx);
        let session = Self {
            basestore: BasestoreSession::new(state.clone())?,
            logs: LogSession::new(state.clone()),
            network: NetworkSession::new(state.clone()),
            state,
        };
        Ok((session, rx))
    }

    pub fn id(&self) -> SessionId {
        self.state.id()
    }

    pub fn events_token(&self) -> &str {
        self.state.events_token()
    }

    pub fn state(&self) -> &Arc<SessionState> {
        &self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    /// Tear the session down: cancel every outstanding operation, release its
    /// locks and drop its log references.
    pub fn disconnect(&self) {
        let failures = self.state.teardown();
        if !failures.is_empty() {
            tracing::warn!(session = self.id(), failures = failures.len(), "teardown finished with errors");
        }
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
