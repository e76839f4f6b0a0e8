//! Operations a client runs against the logs it has open.
//!
//! Every operation that can suspend registers a resource for as long as it is
//! outstanding. Cancelling the resource (explicitly, through `close`, or by
//! session teardown) fails the operation; dropping the request future
//! cancels it too.

use super::state::{PendingGuard, ResourceKind, SessionResource, SessionState};
use super::ClientEvent;
use crate::error::{HubError, HubResult};
use crate::store::{
    AppendOutcome, DownloadHandle, DownloadRange, Get, LengthWait, Log, PeerKey, SeekOutcome,
    SeekPosition,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadOptions {
    /// Wait for a missing block instead of failing `NotAvailable`.
    pub wait: bool,
    /// Give up with `NotAvailable` once peer discovery is exhausted and no
    /// peer has the block.
    #[serde(default)]
    pub if_available: bool,
    /// Emit a `Wait` event carrying this id when the read starts waiting.
    #[serde(default)]
    pub on_wait_id: Option<u64>,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            wait: true,
            if_available: false,
            on_wait_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateOptions {
    #[serde(default)]
    pub if_available: bool,
    /// Length to wait for. Defaults to one past the current length.
    #[serde(default)]
    pub min_length: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateOutcome {
    pub length: u64,
    pub byte_length: u64,
    /// Whether the log reached the requested length.
    pub updated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeekOptions {
    pub wait: bool,
    #[serde(default)]
    pub if_available: bool,
}

impl Default for SeekOptions {
    fn default() -> Self {
        Self {
            wait: true,
            if_available: false,
        }
    }
}

pub struct LogSession {
    pub(super) state: Arc<SessionState>,
}

impl LogSession {
    pub fn new(state: Arc<SessionState>) -> Self {
        Self { state }
    }

    pub async fn read(
        &self,
        id: &str,
        resource_id: &str,
        seq: u64,
        opts: ReadOptions,
    ) -> HubResult<Vec<u8>> {
        SessionState::check_client_id(resource_id)?;
        let log = self.state.log(id)?;
        self.fetch(id, resource_id.to_string(), &log, seq, opts).await
    }

    /// Cancel an outstanding operation of the log open as `id`. Unknown or
    /// finished ids, and ids registered under another log, are ignored.
    pub fn cancel(&self, id: &str, resource_id: &str) -> HubResult<()> {
        SessionState::check_client_id(resource_id)?;
        self.state.log(id)?;
        if !self.state.owns_log_resource(id, resource_id) {
            return Ok(());
        }
        match self.state.delete_log_resource(id, resource_id, false) {
            Err(HubError::UnknownResource { .. }) => Ok(()),
            result => result,
        }
    }

    pub fn append(&self, id: &str, blocks: Vec<Vec<u8>>) -> HubResult<AppendOutcome> {
        self.state.log(id)?.append(blocks)
    }

    pub async fn update(&self, id: &str, opts: UpdateOptions) -> HubResult<UpdateOutcome> {
        let log = self.state.log(id)?;
        self.wait_for_update(id, &log, opts).await
    }

    pub async fn seek(
        &self,
        id: &str,
        byte_offset: u64,
        opts: SeekOptions,
    ) -> HubResult<SeekPosition> {
        let log = self.state.log(id)?;
        loop {
            match log.seek(byte_offset)? {
                SeekOutcome::Found(position) => return Ok(position),
                SeekOutcome::Missing(seq) => {
                    let read = ReadOptions {
                        wait: opts.wait,
                        if_available: opts.if_available,
                        on_wait_id: None,
                    };
                    self.fetch(id, self.state.internal_id("seek"), &log, seq, read)
                        .await?;
                }
                SeekOutcome::BeyondEnd => {
                    if !opts.wait {
                        return Err(HubError::NotAvailable);
                    }
                    let update = UpdateOptions {
                        if_available: opts.if_available,
                        min_length: Some(log.length() + 1),
                    };
                    if !self.wait_for_update(id, &log, update).await?.updated {
                        return Err(HubError::NotAvailable);
                    }
                }
            }
        }
    }

    pub async fn exists(&self, id: &str, seq: u64) -> HubResult<bool> {
        let log = self.state.log(id)?;
        log.ready().await?;
        Ok(log.has(seq))
    }

    /// Resolve once every block in `range` is local. Live ranges never
    /// resolve on their own.
    pub async fn download(&self, id: &str, resource_id: &str, range: DownloadRange) -> HubResult<()> {
        SessionState::check_client_id(resource_id)?;
        let log = self.state.log(id)?;
        let (download_id, rx) = match log.download(range)? {
            DownloadHandle::Complete => return Ok(()),
            DownloadHandle::Pending { id, rx } => (id, rx),
        };
        let guard = PendingGuard::register(
            &self.state,
            id,
            resource_id.to_string(),
            ResourceKind::Pending,
            {
                let log = log.clone();
                move || {
                    log.undownload(download_id);
                    Ok(())
                }
            },
        )?;
        let result = rx.await.unwrap_or(Err(HubError::Cancelled));
        guard.finish();
        result
    }

    /// Stop a download. Unknown or finished ids are ignored.
    pub fn undownload(&self, id: &str, resource_id: &str) -> HubResult<()> {
        self.cancel(id, resource_id)
    }

    pub fn downloaded(&self, id: &str, start: u64, end: Option<u64>) -> HubResult<u64> {
        Ok(self.state.log(id)?.downloaded(start, end))
    }

    /// Take the log's lock, waiting behind other sessions if needed.
    pub async fn acquire_lock(&self, id: &str) -> HubResult<()> {
        let log = self.state.log(id)?;
        let discovery_key = log.discovery_key();
        let locks = self.state.ctx().locks.clone();
        let ticket = locks.ticket(self.state.id());
        let guard = PendingGuard::register(
            &self.state,
            id,
            lock_resource_id(id),
            ResourceKind::Lock {
                discovery_key,
                ticket,
            },
            {
                let locks = locks.clone();
                move || {
                    locks.cancel(&discovery_key, ticket);
                    Ok(())
                }
            },
        )?;
        match locks.acquire(discovery_key, ticket).await {
            Ok(()) => {
                guard.keep();
                Ok(())
            }
            Err(e) => {
                guard.finish();
                Err(e)
            }
        }
    }

    /// Release the lock taken through `id`. A lock taken through another id
    /// of the same log is released through that id.
    pub fn release_lock(&self, id: &str) -> HubResult<()> {
        let log = self.state.log(id)?;
        let locks = &self.state.ctx().locks;
        let resource_id = lock_resource_id(id);
        let held = self
            .state
            .resource(&resource_id)
            .ok()
            .and_then(|resource| match resource.kind {
                ResourceKind::Lock {
                    discovery_key,
                    ticket,
                } => Some((discovery_key, ticket)),
                _ => None,
            });
        let Some((discovery_key, ticket)) = held else {
            return Err(match locks.holder(&log.discovery_key()) {
                Some(_) => HubError::NotOwner,
                None => HubError::NotLocked,
            });
        };
        locks.release(&discovery_key, ticket)?;
        self.state.delete_log_resource(id, &resource_id, true)
    }

    /// Register a handler for extension messages named `name`; incoming
    /// messages are forwarded as `Extension` events.
    pub fn register_extension(&self, id: &str, resource_id: &str, name: &str) -> HubResult<()> {
        SessionState::check_client_id(resource_id)?;
        let log = self.state.log(id)?;
        let events = self.state.events();
        let (log_id, forwarded_id) = (id.to_string(), resource_id.to_string());
        let handle = log.register_extension(name, move |from, data| {
            let _ = events.send(ClientEvent::Extension {
                id: log_id.clone(),
                resource_id: forwarded_id.clone(),
                remote_public_key: *from,
                data: data.to_vec(),
            });
        })?;
        let value = SessionResource {
            token: self.state.next_token(),
            kind: ResourceKind::Extension {
                log: log.clone(),
                name: name.to_string(),
            },
        };
        self.state
            .add_log_resource(id, resource_id, value, move || {
                log.unregister_extension(handle);
                Ok(())
            })
    }

    pub fn unregister_extension(&self, id: &str, resource_id: &str) -> HubResult<()> {
        SessionState::check_client_id(resource_id)?;
        self.state.log(id)?;
        self.state.delete_log_resource(id, resource_id, false)
    }

    /// Send an extension message to every peer, or to the peer with
    /// `remote_public_key`. Returns the number of peers it was queued for.
    pub fn send_extension(
        &self,
        id: &str,
        resource_id: &str,
        remote_public_key: Option<PeerKey>,
        data: &[u8],
    ) -> HubResult<usize> {
        SessionState::check_client_id(resource_id)?;
        self.state.log(id)?;
        if !self.state.owns_log_resource(id, resource_id) {
            return Err(HubError::unknown_resource(resource_id));
        }
        let ResourceKind::Extension { log, name } = self.state.resource(resource_id)?.kind else {
            return Err(HubError::invalid(format!(
                "resource {} is not an extension",
                resource_id
            )));
        };
        Ok(match remote_public_key {
            Some(peer) => log.send_extension(&name, data, &peer),
            None => log.broadcast_extension(&name, data),
        })
    }

    /// Shared body of `read` and the reads `seek` issues.
    async fn fetch(
        &self,
        id: &str,
        resource_id: String,
        log: &Arc<Log>,
        seq: u64,
        opts: ReadOptions,
    ) -> HubResult<Vec<u8>> {
        let (read_id, mut rx) = match log.get(seq, opts.wait)? {
            Get::Ready(block) => return Ok(block),
            Get::Pending { id, rx } => (id, rx),
        };
        let guard = PendingGuard::register(&self.state, id, resource_id, ResourceKind::Pending, {
            let log = log.clone();
            move || {
                log.cancel_read(read_id, HubError::Cancelled);
                Ok(())
            }
        })?;
        if let Some(on_wait_id) = opts.on_wait_id {
            self.state.emit(ClientEvent::Wait {
                id: id.to_string(),
                on_wait_id,
                seq,
            });
        }

        let outcome = if opts.if_available {
            let gate = self.state.ctx().tracker.read_gate(log);
            tokio::select! {
                biased;
                outcome = &mut rx => outcome,
                _ = gate.wait() => {
                    if !log.has(seq) && !log.peer_has(seq) {
                        log.cancel_read(read_id, HubError::NotAvailable);
                    }
                    rx.await
                }
            }
        } else {
            rx.await
        };
        guard.finish();
        outcome.unwrap_or(Err(HubError::Cancelled))
    }

    /// Shared body of `update` and the waits `seek` issues past the end.
    async fn wait_for_update(
        &self,
        id: &str,
        log: &Arc<Log>,
        opts: UpdateOptions,
    ) -> HubResult<UpdateOutcome> {
        let min_length = opts.min_length.unwrap_or_else(|| log.length() + 1);
        let (wait_id, mut rx) = match log.wait_for_length(min_length)? {
            LengthWait::Ready(_) => return Ok(snapshot(log, true)),
            LengthWait::Pending { id, rx } => (id, rx),
        };
        let guard = PendingGuard::register(
            &self.state,
            id,
            self.state.internal_id("update"),
            ResourceKind::Pending,
            {
                let log = log.clone();
                move || {
                    log.cancel_length_wait(wait_id, HubError::Cancelled);
                    Ok(())
                }
            },
        )?;

        let outcome = if opts.if_available {
            let gate = self.state.ctx().tracker.update_gate(log);
            tokio::select! {
                biased;
                outcome = &mut rx => outcome,
                _ = gate.wait() => {
                    if log.remote_length() < min_length {
                        log.cancel_length_wait(wait_id, HubError::NotAvailable);
                    }
                    rx.await
                }
            }
        } else {
            rx.await
        };
        guard.finish();
        match outcome.unwrap_or(Err(HubError::Cancelled)) {
            Ok(_) => Ok(snapshot(log, true)),
            Err(HubError::NotAvailable) => Ok(snapshot(log, false)),
            Err(e) => Err(e),
        }
    }
}

fn snapshot(log: &Log, updated: bool) -> UpdateOutcome {
    UpdateOutcome {
        length: log.length(),
        byte_length: log.byte_length(),
        updated,
    }
}

pub(super) fn lock_resource_id(id: &str) -> String {
    format!("{}lock-{}", super::state::INTERNAL_PREFIX, id)
}

#[cfg(test)]
#[path = "tests/log_session_tests.rs"]
mod tests;
