//! Event forwarding from logs to the client.
//!
//! Each subscription is a session resource whose dealloc unsubscribes, so
//! closing the log or tearing the session down stops the forwarding.

use super::log_session::LogSession;
use super::state::{ResourceKind, SessionResource, SessionState, INTERNAL_PREFIX};
use super::ClientEvent;
use crate::error::HubResult;
use crate::store::{Log, LogEvent};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Event stream a client can watch on an open log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WatchKind {
    Appends,
    Downloads,
    Uploads,
}

impl WatchKind {
    fn resource_id(self, id: &str) -> String {
        let kind = match self {
            WatchKind::Appends => "append",
            WatchKind::Downloads => "download",
            WatchKind::Uploads => "upload",
        };
        format!("{}{}-{}", INTERNAL_PREFIX, kind, id)
    }
}

/// Subscribe `map` to `log` and register the subscription as `resource_id`
/// under `log_id`. Events `map` turns into `Some` are sent to the client.
pub(super) fn forward(
    state: &SessionState,
    log_id: &str,
    resource_id: &str,
    log: &Arc<Log>,
    map: impl Fn(&str, &LogEvent) -> Option<ClientEvent> + Send + Sync + 'static,
) -> HubResult<()> {
    let events = state.events();
    let forwarded_id = log_id.to_string();
    let listener = log.subscribe(move |event| {
        if let Some(event) = map(&forwarded_id, event) {
            let _ = events.send(event);
        }
    });
    let value = SessionResource {
        token: state.next_token(),
        kind: ResourceKind::Listener,
    };
    let log = log.clone();
    state.add_log_resource(log_id, resource_id, value, move || {
        log.unsubscribe(listener);
        Ok(())
    })
}

/// Forward `kind` events of `log` under its fixed resource id. Returns
/// without change when the watch is already registered.
pub(super) fn watch_log(
    state: &SessionState,
    id: &str,
    log: &Arc<Log>,
    kind: WatchKind,
) -> HubResult<()> {
    let resource_id = kind.resource_id(id);
    if state.has_resource(&resource_id) {
        return Ok(());
    }
    forward(state, id, &resource_id, log, move |id, event| match (kind, event) {
        (WatchKind::Appends, LogEvent::Append { length, byte_length }) => {
            Some(ClientEvent::Append {
                id: id.to_string(),
                length: *length,
                byte_length: *byte_length,
            })
        }
        (WatchKind::Downloads, LogEvent::Download { seq, byte_length }) => {
            Some(ClientEvent::Download {
                id: id.to_string(),
                seq: *seq,
                byte_length: *byte_length,
            })
        }
        (WatchKind::Uploads, LogEvent::Upload { seq, byte_length }) => {
            Some(ClientEvent::Upload {
                id: id.to_string(),
                seq: *seq,
                byte_length: *byte_length,
            })
        }
        _ => None,
    })
}

impl LogSession {
    /// Start forwarding `kind` events for the log. Watching twice is a no-op.
    pub fn watch(&self, id: &str, kind: WatchKind) -> HubResult<()> {
        let log = self.state.log(id)?;
        watch_log(&self.state, id, &log, kind)
    }

    /// Stop forwarding `kind` events. Unwatching twice is a no-op.
    pub fn unwatch(&self, id: &str, kind: WatchKind) -> HubResult<()> {
        self.state.log(id)?;
        let resource_id = kind.resource_id(id);
        if self.state.has_resource(&resource_id) {
            self.state.delete_log_resource(id, &resource_id, false)?;
        }
        Ok(())
    }
}
