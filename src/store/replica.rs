//! Replication hooks: connected peers, remotely received blocks and
//! extension messages.
//!
//! The block-exchange protocol itself lives outside this crate. It drives a
//! [`Log`] through these methods whenever a peer connects, announces a length,
//! delivers a block, requests a block, or sends an extension message.

use super::keys::PeerKey;
use super::log::{Log, LogEvent};
use crate::error::{HubError, HubResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Public view of a connected peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub remote_public_key: PeerKey,
    pub remote_address: String,
    /// Length the peer has announced for this log.
    pub remote_length: u64,
    /// Whether the peer finished opening the log on its side.
    pub remote_opened: bool,
}

/// Message queued for delivery to a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    Extension { name: String, data: Vec<u8> },
}

/// Handler receiving `(sender, payload)` for one registered extension.
pub type ExtensionHandler = Arc<dyn Fn(&PeerKey, &[u8]) + Send + Sync>;

pub(super) struct PeerConnection {
    pub(super) info: PeerInfo,
    outbox: mpsc::UnboundedSender<PeerMessage>,
}

pub(super) struct RegisteredExtension {
    name: String,
    handler: ExtensionHandler,
}

impl Log {
    /// Attach a peer. `outbox` receives the messages addressed to it.
    pub fn add_peer(
        &self,
        info: PeerInfo,
        outbox: mpsc::UnboundedSender<PeerMessage>,
    ) -> HubResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(HubError::LogClosed);
        }
        state
            .peers
            .retain(|p| p.info.remote_public_key != info.remote_public_key);
        state.peers.push(PeerConnection {
            info: info.clone(),
            outbox,
        });
        state.emit(LogEvent::PeerAdd(info.clone()));
        if info.remote_opened {
            state.emit(LogEvent::PeerOpen(info));
        }
        Ok(())
    }

    pub fn remove_peer(&self, key: &PeerKey) -> Option<PeerInfo> {
        let mut state = self.state.lock();
        let index = state
            .peers
            .iter()
            .position(|p| &p.info.remote_public_key == key)?;
        let peer = state.peers.remove(index);
        state.emit(LogEvent::PeerRemove(peer.info.clone()));
        Some(peer.info)
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.state
            .lock()
            .peers
            .iter()
            .map(|p| p.info.clone())
            .collect()
    }

    pub fn peer_count(&self) -> usize {
        self.state.lock().peers.len()
    }

    /// Whether any connected peer has announced a length covering `seq`.
    pub fn peer_has(&self, seq: u64) -> bool {
        self.state
            .lock()
            .peers
            .iter()
            .any(|p| p.info.remote_length > seq)
    }

    /// Largest length announced by any connected peer.
    pub fn remote_length(&self) -> u64 {
        self.state
            .lock()
            .peers
            .iter()
            .map(|p| p.info.remote_length)
            .max()
            .unwrap_or(0)
    }

    /// Record a length announcement. Replicas grow to the announced length.
    pub fn on_remote_length(&self, peer: &PeerKey, length: u64) -> HubResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(HubError::LogClosed);
        }
        if let Some(conn) = state
            .peers
            .iter_mut()
            .find(|p| &p.info.remote_public_key == peer)
        {
            conn.info.remote_length = conn.info.remote_length.max(length);
        }
        if !self.writable() {
            state.grow_to(length);
        }
        Ok(())
    }

    /// Store a block received from a peer.
    pub fn on_remote_block(&self, peer: &PeerKey, seq: u64, data: Vec<u8>) -> HubResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(HubError::LogClosed);
        }
        if self.writable() {
            return Err(HubError::NotWritable);
        }
        if state.has(seq) {
            return Ok(());
        }
        tracing::debug!(log = %self.key(), peer = %peer, seq, "block downloaded");

        state.grow_to(seq + 1);
        let size = data.len() as u64;
        state.blocks[seq as usize] = Some(data);
        state.byte_length += size;
        state.emit(LogEvent::Download {
            seq,
            byte_length: size,
        });
        state.settle_blocks();
        Ok(())
    }

    /// Serve a locally present block to a peer.
    pub fn serve_block(&self, peer: &PeerKey, seq: u64) -> Option<Vec<u8>> {
        let state = self.state.lock();
        let block = state.blocks.get(usize::try_from(seq).ok()?)?.clone()?;
        tracing::debug!(log = %self.key(), peer = %peer, seq, "block uploaded");
        state.emit(LogEvent::Upload {
            seq,
            byte_length: block.len() as u64,
        });
        Some(block)
    }

    /// Register a handler for extension messages named `name`. Several
    /// handlers may share a name; each receives every message.
    pub fn register_extension(
        &self,
        name: &str,
        handler: impl Fn(&PeerKey, &[u8]) + Send + Sync + 'static,
    ) -> HubResult<u64> {
        if name.is_empty() {
            return Err(HubError::invalid("extension name must not be empty"));
        }
        let id = self.next_id();
        let mut state = self.state.lock();
        if state.closed {
            return Err(HubError::LogClosed);
        }
        state.extensions.insert(
            id,
            RegisteredExtension {
                name: name.to_string(),
                handler: Arc::new(handler),
            },
        );
        Ok(id)
    }

    pub fn unregister_extension(&self, id: u64) {
        self.state.lock().extensions.remove(&id);
    }

    /// Send an extension message to every connected peer. Returns the number
    /// of peers the message was queued for.
    pub fn broadcast_extension(&self, name: &str, data: &[u8]) -> usize {
        let state = self.state.lock();
        state
            .peers
            .iter()
            .filter(|p| {
                p.outbox
                    .send(PeerMessage::Extension {
                        name: name.to_string(),
                        data: data.to_vec(),
                    })
                    .is_ok()
            })
            .count()
    }

    /// Send an extension message to the peer with public key `to`.
    pub fn send_extension(&self, name: &str, data: &[u8], to: &PeerKey) -> usize {
        let state = self.state.lock();
        state
            .peers
            .iter()
            .filter(|p| &p.info.remote_public_key == to)
            .filter(|p| {
                p.outbox
                    .send(PeerMessage::Extension {
                        name: name.to_string(),
                        data: data.to_vec(),
                    })
                    .is_ok()
            })
            .count()
    }

    /// Dispatch an extension message received from `from`.
    pub fn on_extension_message(&self, from: &PeerKey, name: &str, data: &[u8]) {
        let state = self.state.lock();
        for ext in state.extensions.values().filter(|e| e.name == name) {
            (ext.handler)(from, data);
        }
    }
}

#[cfg(test)]
#[path = "tests/replica_tests.rs"]
mod tests;
