//! In-process storage engine for a single append-only log.
//!
//! A [`Log`] owns its blocks, its connected peers and every pending operation
//! against it (reads, length waits, downloads). Pending operations are plain
//! oneshot senders keyed by an id, so any caller holding the id can cancel them
//! without touching the waiting task.
//!
//! Events are emitted while the state lock is held. This keeps appends, peer
//! adds and peer removes in order for every listener, and it means listeners
//! must only forward the event (never call back into the log).

use super::download::PendingDownload;
use super::keys::{DiscoveryKey, LogKey};
use super::replica::{PeerConnection, PeerInfo, RegisteredExtension};
use crate::error::{HubError, HubResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

pub type ListenerId = u64;
pub type ReadId = u64;
pub type WaitId = u64;

/// Callback invoked for every event on a log.
pub type Listener = Arc<dyn Fn(&LogEvent) + Send + Sync>;

/// Something that happened to a log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    Append { length: u64, byte_length: u64 },
    PeerAdd(PeerInfo),
    PeerOpen(PeerInfo),
    PeerRemove(PeerInfo),
    Download { seq: u64, byte_length: u64 },
    Upload { seq: u64, byte_length: u64 },
    Close,
}

/// Result of a successful append.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendOutcome {
    pub length: u64,
    pub byte_length: u64,
    /// Sequence number of the first appended block.
    pub seq: u64,
}

/// Block position for a byte offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeekPosition {
    pub seq: u64,
    pub block_offset: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekOutcome {
    Found(SeekPosition),
    /// The block at this sequence number must be fetched before seeking further.
    Missing(u64),
    /// The offset lies past the end of the log.
    BeyondEnd,
}

/// A read either completes immediately or leaves a pending handle behind.
#[derive(Debug)]
pub enum Get {
    Ready(Vec<u8>),
    Pending {
        id: ReadId,
        rx: oneshot::Receiver<HubResult<Vec<u8>>>,
    },
}

#[derive(Debug)]
pub enum LengthWait {
    Ready(u64),
    Pending {
        id: WaitId,
        rx: oneshot::Receiver<HubResult<u64>>,
    },
}

/// Blocks kept by the store after a log has been evicted, so a later open
/// sees the same data.
#[derive(Debug, Default)]
pub struct RetainedBlocks {
    pub blocks: Vec<Option<Vec<u8>>>,
    pub byte_length: u64,
}

struct PendingRead {
    seq: u64,
    tx: oneshot::Sender<HubResult<Vec<u8>>>,
}

struct PendingLength {
    min_length: u64,
    tx: oneshot::Sender<HubResult<u64>>,
}

pub(super) struct LogState {
    pub(super) blocks: Vec<Option<Vec<u8>>>,
    pub(super) byte_length: u64,
    pub(super) closed: bool,
    pub(super) peers: Vec<PeerConnection>,
    pub(super) downloads: HashMap<u64, PendingDownload>,
    pub(super) extensions: BTreeMap<u64, RegisteredExtension>,
    listeners: BTreeMap<ListenerId, Listener>,
    reads: HashMap<ReadId, PendingRead>,
    length_waiters: HashMap<WaitId, PendingLength>,
}

impl LogState {
    pub(super) fn length(&self) -> u64 {
        self.blocks.len() as u64
    }

    pub(super) fn has(&self, seq: u64) -> bool {
        usize::try_from(seq)
            .ok()
            .and_then(|i| self.blocks.get(i))
            .is_some_and(|b| b.is_some())
    }

    pub(super) fn emit(&self, event: LogEvent) {
        for listener in self.listeners.values() {
            listener(&event);
        }
    }

    /// Resolve every pending read and download that the current blocks satisfy.
    pub(super) fn settle_blocks(&mut self) {
        let ready: Vec<ReadId> = self
            .reads
            .iter()
            .filter(|(_, read)| self.has(read.seq))
            .map(|(id, _)| *id)
            .collect();
        for id in ready {
            if let Some(read) = self.reads.remove(&id) {
                let block = self.blocks[read.seq as usize].clone().unwrap_or_default();
                let _ = read.tx.send(Ok(block));
            }
        }
        self.settle_downloads();
    }

    /// Resolve length waiters after the log grew.
    pub(super) fn settle_length(&mut self) {
        let length = self.length();
        let ready: Vec<WaitId> = self
            .length_waiters
            .iter()
            .filter(|(_, w)| length >= w.min_length)
            .map(|(id, _)| *id)
            .collect();
        for id in ready {
            if let Some(waiter) = self.length_waiters.remove(&id) {
                let _ = waiter.tx.send(Ok(length));
            }
        }
    }

    /// Grow a sparse replica to `length` blocks, emitting an append event.
    pub(super) fn grow_to(&mut self, length: u64) {
        if length <= self.length() {
            return;
        }
        self.blocks.resize(length as usize, None);
        self.emit(LogEvent::Append {
            length,
            byte_length: self.byte_length,
        });
        self.settle_length();
    }
}

/// One open append-only log.
pub struct Log {
    key: LogKey,
    discovery_key: DiscoveryKey,
    writable: bool,
    next_id: AtomicU64,
    pub(super) state: Mutex<LogState>,
}

impl Log {
    pub fn new(key: LogKey, writable: bool) -> Arc<Self> {
        Self::restore(key, writable, RetainedBlocks::default())
    }

    pub fn restore(key: LogKey, writable: bool, retained: RetainedBlocks) -> Arc<Self> {
        Arc::new(Self {
            key,
            discovery_key: key.discovery_key(),
            writable,
            next_id: AtomicU64::new(1),
            state: Mutex::new(LogState {
                blocks: retained.blocks,
                byte_length: retained.byte_length,
                closed: false,
                peers: Vec::new(),
                downloads: HashMap::new(),
                extensions: BTreeMap::new(),
                listeners: BTreeMap::new(),
                reads: HashMap::new(),
                length_waiters: HashMap::new(),
            }),
        })
    }

    pub(super) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn key(&self) -> LogKey {
        self.key
    }

    pub fn discovery_key(&self) -> DiscoveryKey {
        self.discovery_key
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn length(&self) -> u64 {
        self.state.lock().length()
    }

    pub fn byte_length(&self) -> u64 {
        self.state.lock().byte_length
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Wait until the log can serve requests.
    ///
    /// The in-process engine is ready as soon as it exists; a closed log never
    /// becomes ready again.
    pub async fn ready(&self) -> HubResult<()> {
        if self.is_closed() {
            return Err(HubError::LogClosed);
        }
        Ok(())
    }

    pub fn has(&self, seq: u64) -> bool {
        self.state.lock().has(seq)
    }

    pub fn append(&self, blocks: Vec<Vec<u8>>) -> HubResult<AppendOutcome> {
        if blocks.is_empty() {
            return Err(HubError::invalid("append requires at least one block"));
        }
        let mut state = self.state.lock();
        if state.closed {
            return Err(HubError::LogClosed);
        }
        if !self.writable {
            return Err(HubError::NotWritable);
        }

        let seq = state.length();
        for block in blocks {
            state.byte_length += block.len() as u64;
            state.blocks.push(Some(block));
        }
        let outcome = AppendOutcome {
            length: state.length(),
            byte_length: state.byte_length,
            seq,
        };

        state.emit(LogEvent::Append {
            length: outcome.length,
            byte_length: outcome.byte_length,
        });
        state.settle_blocks();
        state.settle_length();
        Ok(outcome)
    }

    /// Fetch a block. With `wait` unset a missing block fails `NotAvailable`.
    pub fn get(&self, seq: u64, wait: bool) -> HubResult<Get> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(HubError::LogClosed);
        }
        if let Some(Some(block)) = usize::try_from(seq).ok().and_then(|i| state.blocks.get(i)) {
            return Ok(Get::Ready(block.clone()));
        }
        if !wait {
            return Err(HubError::NotAvailable);
        }

        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        state.reads.insert(id, PendingRead { seq, tx });
        Ok(Get::Pending { id, rx })
    }

    /// Fail a pending read with `reason`. Unknown ids are ignored.
    pub fn cancel_read(&self, id: ReadId, reason: HubError) -> bool {
        let read = self.state.lock().reads.remove(&id);
        match read {
            Some(read) => {
                let _ = read.tx.send(Err(reason));
                true
            }
            None => false,
        }
    }

    /// Wait until the log holds at least `min_length` blocks.
    pub fn wait_for_length(&self, min_length: u64) -> HubResult<LengthWait> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(HubError::LogClosed);
        }
        if state.length() >= min_length {
            return Ok(LengthWait::Ready(state.length()));
        }
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        state
            .length_waiters
            .insert(id, PendingLength { min_length, tx });
        Ok(LengthWait::Pending { id, rx })
    }

    pub fn cancel_length_wait(&self, id: WaitId, reason: HubError) -> bool {
        let waiter = self.state.lock().length_waiters.remove(&id);
        match waiter {
            Some(waiter) => {
                let _ = waiter.tx.send(Err(reason));
                true
            }
            None => false,
        }
    }

    /// Locate the block containing `byte_offset`.
    pub fn seek(&self, byte_offset: u64) -> HubResult<SeekOutcome> {
        let state = self.state.lock();
        if state.closed {
            return Err(HubError::LogClosed);
        }
        let mut remaining = byte_offset;
        for (seq, block) in state.blocks.iter().enumerate() {
            let Some(block) = block else {
                return Ok(SeekOutcome::Missing(seq as u64));
            };
            let size = block.len() as u64;
            if remaining < size {
                return Ok(SeekOutcome::Found(SeekPosition {
                    seq: seq as u64,
                    block_offset: remaining,
                }));
            }
            remaining -= size;
        }
        Ok(SeekOutcome::BeyondEnd)
    }

    pub fn subscribe(&self, listener: impl Fn(&LogEvent) + Send + Sync + 'static) -> ListenerId {
        let id = self.next_id();
        self.state.lock().listeners.insert(id, Arc::new(listener));
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) {
        self.state.lock().listeners.remove(&id);
    }

    /// Close the log: fail everything pending, notify listeners, and hand the
    /// blocks back to the caller.
    pub fn close(&self) -> RetainedBlocks {
        let mut state = self.state.lock();
        if state.closed {
            return RetainedBlocks::default();
        }
        state.closed = true;

        for (_, read) in state.reads.drain() {
            let _ = read.tx.send(Err(HubError::LogClosed));
        }
        for (_, waiter) in state.length_waiters.drain() {
            let _ = waiter.tx.send(Err(HubError::LogClosed));
        }
        for (_, download) in state.downloads.drain() {
            let _ = download.tx.send(Err(HubError::LogClosed));
        }

        state.emit(LogEvent::Close);
        state.listeners.clear();
        state.extensions.clear();
        state.peers.clear();

        RetainedBlocks {
            blocks: std::mem::take(&mut state.blocks),
            byte_length: std::mem::take(&mut state.byte_length),
        }
    }
}

impl std::fmt::Debug for Log {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Log")
            .field("key", &self.key)
            .field("writable", &self.writable)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[path = "tests/log_tests.rs"]
mod tests;
