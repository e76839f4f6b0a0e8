//! In-process swarm without remote candidates.
//!
//! An auto-settling `LocalSwarm` has nobody to connect to, so every join
//! attempt settles as soon as it is queued. A manual one leaves settling to
//! the caller (`settle`, `settle_global`, `settle_all`), which lets tests
//! and embedders replay any ordering of flush events.

use super::{JoinOptions, Swarm, SwarmStatus};
use crate::error::{HubError, HubResult};
use crate::store::DiscoveryKey;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::{broadcast, oneshot};

/// Capacity of the flushed-topic broadcast channel.
const FLUSHED_CHANNEL_CAPACITY: usize = 256;

struct Topic {
    opts: JoinOptions,
    flushed: bool,
    waiters: Vec<oneshot::Sender<()>>,
}

#[derive(Default)]
struct LocalState {
    topics: HashMap<DiscoveryKey, Topic>,
    flush_waiters: Vec<oneshot::Sender<()>>,
}

pub struct LocalSwarm {
    auto_settle: bool,
    state: Mutex<LocalState>,
    flushed_tx: broadcast::Sender<DiscoveryKey>,
}

impl LocalSwarm {
    /// A swarm whose join attempts settle immediately.
    pub fn new() -> Self {
        Self::with_auto_settle(true)
    }

    /// A swarm that only settles when told to.
    pub fn manual() -> Self {
        Self::with_auto_settle(false)
    }

    pub fn with_auto_settle(auto_settle: bool) -> Self {
        let (flushed_tx, _) = broadcast::channel(FLUSHED_CHANNEL_CAPACITY);
        Self {
            auto_settle,
            state: Mutex::new(LocalState::default()),
            flushed_tx,
        }
    }

    /// Mark one topic flushed. Returns false if the topic is not joined or
    /// had already flushed.
    pub fn settle(&self, discovery_key: &DiscoveryKey) -> bool {
        let waiters = {
            let mut state = self.state.lock();
            let Some(topic) = state.topics.get_mut(discovery_key) else {
                return false;
            };
            if topic.flushed {
                return false;
            }
            topic.flushed = true;
            std::mem::take(&mut topic.waiters)
        };
        tracing::debug!(topic = %discovery_key, "topic flushed");
        let _ = self.flushed_tx.send(*discovery_key);
        for waiter in waiters {
            let _ = waiter.send(());
        }
        true
    }

    /// Fire the pending one-shot global flush signals.
    pub fn settle_global(&self) {
        let waiters = std::mem::take(&mut self.state.lock().flush_waiters);
        tracing::debug!(waiters = waiters.len(), "swarm flushed");
        for waiter in waiters {
            let _ = waiter.send(());
        }
    }

    /// Settle every joined topic, then the global signal.
    pub fn settle_all(&self) {
        let keys: Vec<DiscoveryKey> = self.state.lock().topics.keys().copied().collect();
        for key in keys {
            self.settle(&key);
        }
        self.settle_global();
    }

    pub fn topic_options(&self, discovery_key: &DiscoveryKey) -> Option<JoinOptions> {
        self.state
            .lock()
            .topics
            .get(discovery_key)
            .map(|topic| topic.opts)
    }
}

impl Default for LocalSwarm {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Swarm for LocalSwarm {
    async fn configure(&self, discovery_key: DiscoveryKey, opts: JoinOptions) -> HubResult<()> {
        if opts.is_leave() {
            self.state.lock().topics.remove(&discovery_key);
            tracing::debug!(topic = %discovery_key, "topic left");
            return Ok(());
        }

        let pending = {
            let mut state = self.state.lock();
            let topic = state.topics.entry(discovery_key).or_insert_with(|| Topic {
                opts,
                flushed: false,
                waiters: Vec::new(),
            });
            topic.opts = opts;
            if opts.flush && !topic.flushed {
                let (tx, rx) = oneshot::channel();
                topic.waiters.push(tx);
                Some(rx)
            } else {
                None
            }
        };
        tracing::debug!(topic = %discovery_key, announce = opts.announce, lookup = opts.lookup, "topic joined");

        if self.auto_settle {
            self.settle(&discovery_key);
        }
        match pending {
            Some(rx) => rx.await.map_err(|_| HubError::Network {
                message: format!("topic {} was left before it flushed", discovery_key),
            }),
            None => Ok(()),
        }
    }

    fn joined(&self, discovery_key: &DiscoveryKey) -> bool {
        self.state.lock().topics.contains_key(discovery_key)
    }

    fn flushed(&self, discovery_key: &DiscoveryKey) -> bool {
        self.state
            .lock()
            .topics
            .get(discovery_key)
            .is_some_and(|topic| topic.flushed)
    }

    fn flush(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock();
        let settled = state.topics.values().all(|topic| topic.flushed);
        if self.auto_settle && settled {
            let _ = tx.send(());
        } else {
            state.flush_waiters.push(tx);
        }
        rx
    }

    fn subscribe_flushed(&self) -> broadcast::Receiver<DiscoveryKey> {
        self.flushed_tx.subscribe()
    }

    fn status(&self) -> SwarmStatus {
        SwarmStatus {
            holepunchable: false,
            remote_address: String::new(),
            joined_topics: self.state.lock().topics.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dk(byte: u8) -> DiscoveryKey {
        DiscoveryKey([byte; 32])
    }

    #[tokio::test]
    async fn test_auto_settle_flushes_on_configure() {
        let swarm = LocalSwarm::new();
        let mut flushed = swarm.subscribe_flushed();
        swarm
            .configure(
                dk(1),
                JoinOptions {
                    flush: true,
                    ..JoinOptions::announce()
                },
            )
            .await
            .unwrap();

        assert!(swarm.joined(&dk(1)));
        assert!(swarm.flushed(&dk(1)));
        assert_eq!(flushed.recv().await.unwrap(), dk(1));
        assert!(swarm.flush().await.is_ok());
    }

    #[tokio::test]
    async fn test_manual_settle_controls_flush() {
        let swarm = LocalSwarm::manual();
        swarm.configure(dk(1), JoinOptions::announce()).await.unwrap();
        assert!(swarm.joined(&dk(1)));
        assert!(!swarm.flushed(&dk(1)));

        let mut global = swarm.flush();
        assert!(global.try_recv().is_err());

        assert!(swarm.settle(&dk(1)));
        assert!(!swarm.settle(&dk(1)));
        assert!(swarm.flushed(&dk(1)));
        assert!(global.try_recv().is_err());

        swarm.settle_global();
        assert!(global.await.is_ok());
    }

    #[tokio::test]
    async fn test_leave_removes_topic() {
        let swarm = LocalSwarm::new();
        swarm.configure(dk(1), JoinOptions::announce()).await.unwrap();
        swarm.configure(dk(1), JoinOptions::leave()).await.unwrap();
        assert!(!swarm.joined(&dk(1)));
        assert_eq!(swarm.status().joined_topics, 0);
    }

    #[tokio::test]
    async fn test_configure_with_flush_waits_for_settle() {
        let swarm = std::sync::Arc::new(LocalSwarm::manual());
        let joining = {
            let swarm = swarm.clone();
            tokio::spawn(async move {
                swarm
                    .configure(
                        dk(2),
                        JoinOptions {
                            flush: true,
                            ..JoinOptions::announce()
                        },
                    )
                    .await
            })
        };

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!joining.is_finished());
        assert!(swarm.settle(&dk(2)));
        assert!(joining.await.unwrap().is_ok());
    }
}
