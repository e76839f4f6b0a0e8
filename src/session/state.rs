//! Per-connection session state.
//!
//! A [`SessionState`] owns the session's resource table, its open log
//! references and the sender half of its event stream. Teardown cancels every
//! outstanding resource, releases every strong log reference and is safe to
//! run more than once.

use super::resources::ResourceTable;
use super::ClientEvent;
use crate::error::{HubError, HubResult};
use crate::hub::HubContext;
use crate::lock::{LockTicket, SessionId};
use crate::store::{DiscoveryKey, Log};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Prefix of resource ids the hub registers on its own behalf.
pub const INTERNAL_PREFIX: &str = "@loghub/";

/// What a registered resource is.
#[derive(Debug, Clone)]
pub enum ResourceKind {
    /// Event forwarding from a log or from the store.
    Listener,
    /// An outstanding read, update or download.
    Pending,
    /// A held or queued log lock, released through its own ticket.
    Lock {
        discovery_key: DiscoveryKey,
        ticket: LockTicket,
    },
    /// A registered extension handler.
    Extension { log: Arc<Log>, name: String },
}

/// Value stored in the session's resource table. The token tells apart two
/// registrations that reused one id.
#[derive(Debug, Clone)]
pub struct SessionResource {
    pub token: u64,
    pub kind: ResourceKind,
}

struct LogReference {
    log: Arc<Log>,
    weak: bool,
}

pub struct SessionState {
    id: SessionId,
    events_token: String,
    ctx: Arc<HubContext>,
    resources: ResourceTable<SessionResource>,
    logs: Mutex<HashMap<String, LogReference>>,
    log_resources: Mutex<HashMap<String, HashSet<String>>>,
    events: mpsc::UnboundedSender<ClientEvent>,
    next_token: AtomicU64,
    closed: AtomicBool,
}

impl SessionState {
    pub fn new(
        id: SessionId,
        ctx: Arc<HubContext>,
        events: mpsc::UnboundedSender<ClientEvent>,
    ) -> Arc<Self> {
        ctx.session_opened();
        Arc::new(Self {
            id,
            events_token: uuid::Uuid::new_v4().to_string(),
            ctx,
            resources: ResourceTable::new(),
            logs: Mutex::new(HashMap::new()),
            log_resources: Mutex::new(HashMap::new()),
            events,
            next_token: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn events_token(&self) -> &str {
        &self.events_token
    }

    pub fn ctx(&self) -> &Arc<HubContext> {
        &self.ctx
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn next_token(&self) -> u64 {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }

    /// Fresh id for a resource the hub registers itself.
    pub fn internal_id(&self, kind: &str) -> String {
        format!("{}{}-{}", INTERNAL_PREFIX, kind, self.next_token())
    }

    /// Client-chosen resource ids live outside the hub's own namespace.
    pub fn check_client_id(resource_id: &str) -> HubResult<()> {
        if resource_id.starts_with(INTERNAL_PREFIX) {
            return Err(HubError::invalid(format!(
                "resource ids starting with {} are reserved",
                INTERNAL_PREFIX
            )));
        }
        Ok(())
    }

    pub fn events(&self) -> mpsc::UnboundedSender<ClientEvent> {
        self.events.clone()
    }

    pub fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    // Log references

    pub fn has_log(&self, id: &str) -> bool {
        self.logs.lock().contains_key(id)
    }

    /// Register a log under `id`. Strong references pin the log in the store.
    pub fn add_log(&self, id: &str, log: Arc<Log>, weak: bool) -> HubResult<()> {
        // Teardown drains under this lock after marking the session closed.
        let mut logs = self.logs.lock();
        if self.is_closed() {
            return Err(HubError::Cancelled);
        }
        if logs.contains_key(id) {
            return Err(HubError::SessionInUse { id: id.to_string() });
        }
        if !weak {
            self.ctx.store.increment(&log.discovery_key());
        }
        logs.insert(id.to_string(), LogReference { log, weak });
        Ok(())
    }

    pub fn log(&self, id: &str) -> HubResult<Arc<Log>> {
        self.logs
            .lock()
            .get(id)
            .map(|r| r.log.clone())
            .ok_or_else(|| HubError::unknown_log(id))
    }

    pub fn remove_log(&self, id: &str) -> HubResult<()> {
        let reference = self
            .logs
            .lock()
            .remove(id)
            .ok_or_else(|| HubError::unknown_log(id))?;
        if !reference.weak {
            self.ctx.store.decrement(&reference.log.discovery_key());
        }
        Ok(())
    }

    pub fn log_count(&self) -> usize {
        self.logs.lock().len()
    }

    // Resources

    pub fn has_resource(&self, id: &str) -> bool {
        self.resources.has(id)
    }

    pub fn resource(&self, id: &str) -> HubResult<SessionResource> {
        self.resources.get(id)
    }

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    /// Register a session-level resource.
    pub fn add_resource(
        &self,
        id: &str,
        value: SessionResource,
        dealloc: impl FnOnce() -> HubResult<()> + Send + 'static,
    ) -> HubResult<()> {
        self.resources.add(id, value, dealloc)?;
        self.reject_if_closed(id)
    }

    /// Register a resource that belongs to the log open under `log_id`, so
    /// closing that log releases it.
    pub fn add_log_resource(
        &self,
        log_id: &str,
        resource_id: &str,
        value: SessionResource,
        dealloc: impl FnOnce() -> HubResult<()> + Send + 'static,
    ) -> HubResult<()> {
        self.resources.add(resource_id, value, dealloc)?;
        self.log_resources
            .lock()
            .entry(log_id.to_string())
            .or_default()
            .insert(resource_id.to_string());
        self.reject_if_closed(resource_id)
    }

    /// Whether `resource_id` was registered under the log open as `log_id`.
    pub fn owns_log_resource(&self, log_id: &str, resource_id: &str) -> bool {
        self.log_resources
            .lock()
            .get(log_id)
            .is_some_and(|ids| ids.contains(resource_id))
    }

    /// Delete a resource registered under `log_id`. Resources of other logs
    /// are `UnknownResource` here.
    pub fn delete_log_resource(
        &self,
        log_id: &str,
        resource_id: &str,
        skip_dealloc: bool,
    ) -> HubResult<()> {
        if !self.owns_log_resource(log_id, resource_id) {
            return Err(HubError::unknown_resource(resource_id));
        }
        self.forget_log_resource(log_id, resource_id);
        self.resources.delete(resource_id, skip_dealloc)
    }

    /// Remove the bookkeeping of a resource that completed on its own. Only
    /// the registration carrying `token` is removed.
    pub fn finish_log_resource(&self, log_id: &str, resource_id: &str, token: u64) {
        if self
            .resources
            .get(resource_id)
            .is_ok_and(|r| r.token == token)
        {
            self.forget_log_resource(log_id, resource_id);
            let _ = self.resources.delete(resource_id, true);
        }
    }

    /// Cancel a registration identified by `token`, if it is still present.
    pub fn cancel_log_resource(&self, log_id: &str, resource_id: &str, token: u64) {
        if self
            .resources
            .get(resource_id)
            .is_ok_and(|r| r.token == token)
        {
            if let Err(e) = self.delete_log_resource(log_id, resource_id, false) {
                tracing::debug!(resource = %resource_id, error = %e, "cancel on drop failed");
            }
        }
    }

    /// Delete every resource registered under `log_id`.
    pub fn release_log_resources(&self, log_id: &str) -> Vec<HubError> {
        let ids = self.log_resources.lock().remove(log_id).unwrap_or_default();
        ids.into_iter()
            .filter(|id| self.resources.has(id))
            .filter_map(|id| self.resources.delete(&id, false).err())
            .collect()
    }

    fn forget_log_resource(&self, log_id: &str, resource_id: &str) {
        let mut log_resources = self.log_resources.lock();
        if let Some(ids) = log_resources.get_mut(log_id) {
            ids.remove(resource_id);
            if ids.is_empty() {
                log_resources.remove(log_id);
            }
        }
    }

    /// A registration that raced with teardown must not outlive the session.
    fn reject_if_closed(&self, id: &str) -> HubResult<()> {
        if self.is_closed() {
            let _ = self.resources.delete(id, false);
            return Err(HubError::Cancelled);
        }
        Ok(())
    }

    /// Cancel everything the session owns and drop its log references.
    /// Returns the dealloc failures; later calls do nothing.
    pub fn teardown(&self) -> Vec<HubError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Vec::new();
        }
        let failures = self.resources.delete_all();
        self.log_resources.lock().clear();

        let references: Vec<LogReference> = self.logs.lock().drain().map(|(_, r)| r).collect();
        for reference in references {
            if !reference.weak {
                self.ctx.store.decrement(&reference.log.discovery_key());
            }
        }
        self.ctx.session_closed();
        tracing::debug!(session = self.id, failures = failures.len(), "session torn down");
        failures
    }
}

impl Drop for SessionState {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Drop guard for a suspending operation registered as a resource.
///
/// Completing the operation calls [`PendingGuard::finish`], which removes the
/// entry without running its dealloc. Dropping the guard early (the request
/// future was abandoned) cancels the operation through its dealloc.
pub struct PendingGuard<'a> {
    state: &'a SessionState,
    log_id: &'a str,
    resource_id: String,
    token: u64,
    armed: bool,
}

impl<'a> PendingGuard<'a> {
    /// Register `resource_id` under `log_id` and guard it.
    pub fn register(
        state: &'a SessionState,
        log_id: &'a str,
        resource_id: String,
        kind: ResourceKind,
        dealloc: impl FnOnce() -> HubResult<()> + Send + 'static,
    ) -> HubResult<Self> {
        let token = state.next_token();
        state.add_log_resource(log_id, &resource_id, SessionResource { token, kind }, dealloc)?;
        Ok(Self {
            state,
            log_id,
            resource_id,
            token,
            armed: true,
        })
    }

    /// The operation resolved: drop the bookkeeping entry.
    pub fn finish(mut self) {
        self.armed = false;
        self.state
            .finish_log_resource(self.log_id, &self.resource_id, self.token);
    }

    /// The operation resolved and the resource lives on (a held lock).
    pub fn keep(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.state
                .cancel_log_resource(self.log_id, &self.resource_id, self.token);
        }
    }
}
