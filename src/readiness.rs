//! Replication readiness: has peer discovery for a log had a fair chance yet?
//!
//! Reads and updates with `if_available` must neither hang when no peer will
//! ever show up nor give up while peers are still being found. For every log
//! opened into the store the tracker keeps two waiter sets:
//!
//! - read waiters are released once discovery is exhausted: the log's own
//!   topic has flushed, or (if the log never joined) the global one-shot
//!   swarm flush has fired;
//! - update waiters additionally release as soon as any peer attaches.
//!
//! A log that joins its topic after the global flush fired does not reuse the
//! stale global flag; it waits for its own topic flush.

use crate::store::{DiscoveryKey, Log, LogEvent};
use crate::swarm::Swarm;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

/// Outcome of asking whether a log is ready.
#[derive(Debug)]
pub enum Gate {
    Ready,
    Pending(oneshot::Receiver<()>),
}

impl Gate {
    pub fn is_ready(&self) -> bool {
        matches!(self, Gate::Ready)
    }

    /// Resolve once the gate opens. A dropped entry (log closed) opens it.
    pub async fn wait(self) {
        if let Gate::Pending(rx) = self {
            let _ = rx.await;
        }
    }
}

#[derive(Default)]
struct ReadinessEntry {
    flush_waiters: Vec<oneshot::Sender<()>>,
    peer_add_waiters: Vec<oneshot::Sender<()>>,
    global_flushed: bool,
}

impl ReadinessEntry {
    fn fire_all(&mut self) {
        for tx in self
            .flush_waiters
            .drain(..)
            .chain(self.peer_add_waiters.drain(..))
        {
            let _ = tx.send(());
        }
    }

    fn fire_peer_add(&mut self) {
        for tx in self.peer_add_waiters.drain(..) {
            let _ = tx.send(());
        }
    }
}

pub struct ReadinessTracker {
    swarm: Arc<dyn Swarm>,
    entries: Mutex<HashMap<DiscoveryKey, ReadinessEntry>>,
}

impl ReadinessTracker {
    pub fn new(swarm: Arc<dyn Swarm>) -> Arc<Self> {
        Arc::new(Self {
            swarm,
            entries: Mutex::new(HashMap::new()),
        })
    }

    /// Start tracking a freshly opened log. Calling it again for a tracked
    /// discovery key does nothing.
    pub fn track(self: &Arc<Self>, log: &Arc<Log>) {
        let discovery_key = log.discovery_key();
        {
            let mut entries = self.entries.lock();
            if entries.contains_key(&discovery_key) {
                return;
            }
            entries.insert(discovery_key, ReadinessEntry::default());
        }
        tracing::debug!(topic = %discovery_key, "tracking readiness");

        let flushed = self.swarm.flush();
        let tracker = Arc::downgrade(self);
        tokio::spawn(async move {
            if flushed.await.is_ok() {
                if let Some(tracker) = tracker.upgrade() {
                    tracker.on_global_flush(&discovery_key);
                }
            }
        });

        let tracker = Arc::downgrade(self);
        log.subscribe(move |event| {
            let Some(tracker) = tracker.upgrade() else {
                return;
            };
            match event {
                LogEvent::PeerAdd(_) => tracker.on_peer_add(&discovery_key),
                LogEvent::Close => tracker.untrack(&discovery_key),
                _ => {}
            }
        });
    }

    pub fn is_tracked(&self, discovery_key: &DiscoveryKey) -> bool {
        self.entries.lock().contains_key(discovery_key)
    }

    /// Drop the entry. Pending gates open.
    pub fn untrack(&self, discovery_key: &DiscoveryKey) {
        self.entries.lock().remove(discovery_key);
    }

    /// Consume the swarm's per-topic flush notifications.
    pub fn spawn_flush_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let mut flushed = self.swarm.subscribe_flushed();
        let tracker: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                match flushed.recv().await {
                    Ok(discovery_key) => match tracker.upgrade() {
                        Some(tracker) => tracker.on_flushed(&discovery_key),
                        None => break,
                    },
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "flush listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Gate for reads waiting on data that may never arrive.
    pub fn read_gate(&self, log: &Log) -> Gate {
        let discovery_key = log.discovery_key();
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(&discovery_key) else {
            return Gate::Ready;
        };
        let ready = if self.swarm.joined(&discovery_key) {
            self.swarm.flushed(&discovery_key)
        } else {
            entry.global_flushed
        };
        if ready {
            return Gate::Ready;
        }
        let (tx, rx) = oneshot::channel();
        entry.flush_waiters.push(tx);
        Gate::Pending(rx)
    }

    /// Gate for updates, which need an actual peer to learn anything new.
    pub fn update_gate(&self, log: &Log) -> Gate {
        if log.peer_count() > 0 {
            return Gate::Ready;
        }
        let discovery_key = log.discovery_key();
        let rx = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(&discovery_key) else {
                return Gate::Ready;
            };
            let ready = if self.swarm.joined(&discovery_key) {
                self.swarm.flushed(&discovery_key)
            } else {
                entry.global_flushed
            };
            if ready {
                return Gate::Ready;
            }
            let (tx, rx) = oneshot::channel();
            entry.peer_add_waiters.push(tx);
            rx
        };
        // A peer may have attached between the first check and registration.
        if log.peer_count() > 0 {
            return Gate::Ready;
        }
        Gate::Pending(rx)
    }

    fn on_flushed(&self, discovery_key: &DiscoveryKey) {
        if let Some(entry) = self.entries.lock().get_mut(discovery_key) {
            tracing::debug!(topic = %discovery_key, "topic flushed, releasing waiters");
            entry.fire_all();
        }
    }

    fn on_global_flush(&self, discovery_key: &DiscoveryKey) {
        if self.swarm.joined(discovery_key) {
            return;
        }
        if let Some(entry) = self.entries.lock().get_mut(discovery_key) {
            tracing::debug!(topic = %discovery_key, "swarm flushed, releasing waiters");
            entry.global_flushed = true;
            entry.fire_all();
        }
    }

    fn on_peer_add(&self, discovery_key: &DiscoveryKey) {
        if let Some(entry) = self.entries.lock().get_mut(discovery_key) {
            entry.fire_peer_add();
        }
    }
}

#[cfg(test)]
#[path = "tests/readiness_tests.rs"]
mod tests;
