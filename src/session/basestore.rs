//! Opening and closing logs on behalf of one session.

use super::log_watch::{forward, watch_log, WatchKind};
use super::state::{ResourceKind, SessionResource, SessionState, INTERNAL_PREFIX};
use super::ClientEvent;
use crate::error::{HubError, HubResult};
use crate::store::{DiscoveryKey, LogEvent, LogKey, LogSpec, PeerInfo};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const FEED_RESOURCE: &str = "@loghub/feed";

/// Which log to open and how to hold it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenRequest {
    pub key: Option<LogKey>,
    pub name: Option<String>,
    /// A weak reference does not keep the log from being evicted; the client
    /// receives a `Close` event when that happens.
    #[serde(default)]
    pub weak: bool,
}

/// State of a log at the moment it was opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSnapshot {
    pub key: LogKey,
    pub discovery_key: DiscoveryKey,
    pub length: u64,
    pub byte_length: u64,
    pub writable: bool,
    pub peers: Vec<PeerInfo>,
}

pub struct BasestoreSession {
    state: Arc<SessionState>,
}

impl BasestoreSession {
    /// Subscribe the session to store-wide feed notifications.
    pub fn new(state: Arc<SessionState>) -> HubResult<Self> {
        let store = state.ctx().store.clone();
        let events = state.events();
        let listener = store.subscribe_feeds(move |log| {
            let _ = events.send(ClientEvent::Feed { key: log.key() });
        });
        let value = SessionResource {
            token: state.next_token(),
            kind: ResourceKind::Listener,
        };
        state.add_resource(FEED_RESOURCE, value, move || {
            store.unsubscribe_feeds(listener);
            Ok(())
        })?;
        Ok(Self { state })
    }

    pub async fn open(&self, id: &str, request: OpenRequest) -> HubResult<LogSnapshot> {
        if self.state.has_log(id) {
            return Err(HubError::SessionInUse { id: id.to_string() });
        }
        let spec = LogSpec {
            key: request.key,
            name: request.name,
        };
        let log = self.state.ctx().store.get(&spec)?;
        self.state.add_log(id, log.clone(), request.weak)?;

        if let Err(e) = log.ready().await {
            self.discard(id);
            return Err(e);
        }
        if let Err(e) = self.subscribe(id, &log, request.weak) {
            self.discard(id);
            return Err(e);
        }

        tracing::debug!(session = self.state.id(), id = %id, log = %log.key(), weak = request.weak, "log opened in session");
        Ok(LogSnapshot {
            key: log.key(),
            discovery_key: log.discovery_key(),
            length: log.length(),
            byte_length: log.byte_length(),
            writable: log.writable(),
            peers: log.peers().into_iter().filter(|p| p.remote_opened).collect(),
        })
    }

    /// Release everything the session registered under `id` and drop the
    /// reference. Every resource is released even when some fail; the first
    /// failure is returned.
    pub fn close(&self, id: &str) -> HubResult<()> {
        if !self.state.has_log(id) {
            return Err(HubError::unknown_log(id));
        }
        let failures = self.state.release_log_resources(id);
        self.state.remove_log(id)?;
        tracing::debug!(session = self.state.id(), id = %id, "log closed in session");
        match failures.into_iter().next() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn subscribe(&self, id: &str, log: &Arc<crate::store::Log>, weak: bool) -> HubResult<()> {
        watch_log(&self.state, id, log, WatchKind::Appends)?;
        forward(
            &self.state,
            id,
            &format!("{}peers-{}", INTERNAL_PREFIX, id),
            log,
            |id, event| match event {
                LogEvent::PeerOpen(peer) => Some(ClientEvent::PeerOpen {
                    id: id.to_string(),
                    peer: peer.clone(),
                }),
                LogEvent::PeerRemove(peer) if peer.remote_opened => {
                    Some(ClientEvent::PeerRemove {
                        id: id.to_string(),
                        peer: peer.clone(),
                    })
                }
                _ => None,
            },
        )?;
        if weak {
            forward(
                &self.state,
                id,
                &format!("{}close-{}", INTERNAL_PREFIX, id),
                log,
                |id, event| match event {
                    LogEvent::Close => Some(ClientEvent::Close { id: id.to_string() }),
                    _ => None,
                },
            )?;
        }
        Ok(())
    }

    fn discard(&self, id: &str) {
        for e in self.state.release_log_resources(id) {
            tracing::warn!(id = %id, error = %e, "release after failed open");
        }
        let _ = self.state.remove_log(id);
    }
}
