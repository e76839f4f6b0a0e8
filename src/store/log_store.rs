//! Keyed, reference-counted cache of open logs shared by every session.
//!
//! Strong references pin a log in the cache. When the last strong reference
//! is dropped the log becomes idle; idle logs beyond `max_idle_logs` are
//! evicted oldest first. Eviction closes the log (weak holders see a close
//! event) but the blocks are retained, so reopening the same key finds them.

use super::keys::{DiscoveryKey, LogKey};
use super::log::{Log, RetainedBlocks};
use crate::error::{HubError, HubResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Which log to open: a local name, a key, or both (they must agree).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSpec {
    pub key: Option<LogKey>,
    pub name: Option<String>,
}

impl LogSpec {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            key: None,
            name: Some(name.into()),
        }
    }

    pub fn key(key: LogKey) -> Self {
        Self {
            key: Some(key),
            name: None,
        }
    }
}

/// Callback invoked when a log is opened into the cache.
pub type FeedListener = Arc<dyn Fn(&Arc<Log>) + Send + Sync>;

struct CacheEntry {
    log: Arc<Log>,
    strong: usize,
}

#[derive(Default)]
struct StoreState {
    open: HashMap<DiscoveryKey, CacheEntry>,
    idle: VecDeque<DiscoveryKey>,
    retained: HashMap<LogKey, RetainedBlocks>,
    owned: HashSet<LogKey>,
}

pub struct LogStore {
    seed: [u8; 32],
    max_idle_logs: usize,
    next_listener: AtomicU64,
    state: Mutex<StoreState>,
    feed_listeners: Mutex<BTreeMap<u64, FeedListener>>,
}

impl LogStore {
    pub fn new(seed: [u8; 32], max_idle_logs: usize) -> Self {
        Self {
            seed,
            max_idle_logs,
            next_listener: AtomicU64::new(1),
            state: Mutex::new(StoreState::default()),
            feed_listeners: Mutex::new(BTreeMap::new()),
        }
    }

    /// Resolve or create a log.
    ///
    /// Named logs are owned (writable) by this process. Logs opened only by
    /// key are read-only replicas unless this store created them by name.
    pub fn get(&self, spec: &LogSpec) -> HubResult<Arc<Log>> {
        let (key, named) = match (&spec.key, &spec.name) {
            (_, Some(name)) if name.is_empty() => {
                return Err(HubError::invalid("log name must not be empty"))
            }
            (Some(key), Some(name)) => {
                let derived = LogKey::derive_named(&self.seed, name);
                if derived != *key {
                    return Err(HubError::invalid(format!(
                        "key {} does not belong to log named {}",
                        key, name
                    )));
                }
                (derived, true)
            }
            (None, Some(name)) => (LogKey::derive_named(&self.seed, name), true),
            (Some(key), None) => (*key, false),
            (None, None) => return Err(HubError::invalid("open requires a key or a name")),
        };

        let opened = {
            let mut state = self.state.lock();
            if named {
                state.owned.insert(key);
            }
            let discovery_key = key.discovery_key();
            if let Some(entry) = state.open.get(&discovery_key) {
                return Ok(entry.log.clone());
            }

            let writable = state.owned.contains(&key);
            let retained = state.retained.remove(&key).unwrap_or_default();
            let log = Log::restore(key, writable, retained);
            state.open.insert(
                discovery_key,
                CacheEntry {
                    log: log.clone(),
                    strong: 0,
                },
            );
            state.idle.push_back(discovery_key);
            log
        };

        tracing::debug!(log = %opened.key(), writable = opened.writable(), "log opened");
        let listeners: Vec<FeedListener> = self.feed_listeners.lock().values().cloned().collect();
        for listener in listeners {
            listener(&opened);
        }
        Ok(opened)
    }

    /// Look up an open log without creating it.
    pub fn find(&self, discovery_key: &DiscoveryKey) -> Option<Arc<Log>> {
        self.state
            .lock()
            .open
            .get(discovery_key)
            .map(|e| e.log.clone())
    }

    /// Pin a log in the cache.
    pub fn increment(&self, discovery_key: &DiscoveryKey) {
        let mut state = self.state.lock();
        if let Some(entry) = state.open.get_mut(discovery_key) {
            entry.strong += 1;
            state.idle.retain(|k| k != discovery_key);
        }
    }

    /// Drop a strong reference, evicting idle logs past the limit.
    pub fn decrement(&self, discovery_key: &DiscoveryKey) {
        let evicted = {
            let mut state = self.state.lock();
            let Some(entry) = state.open.get_mut(discovery_key) else {
                return;
            };
            if entry.strong == 0 {
                return;
            }
            entry.strong -= 1;
            if entry.strong == 0 {
                state.idle.push_back(*discovery_key);
            }
            let mut evicted = Vec::new();
            while state.idle.len() > self.max_idle_logs {
                let Some(oldest) = state.idle.pop_front() else {
                    break;
                };
                if let Some(entry) = state.open.remove(&oldest) {
                    evicted.push(entry.log);
                }
            }
            evicted
        };

        for log in evicted {
            tracing::debug!(log = %log.key(), "evicting idle log");
            let retained = log.close();
            self.state.lock().retained.insert(log.key(), retained);
        }
    }

    pub fn strong_count(&self, discovery_key: &DiscoveryKey) -> usize {
        self.state
            .lock()
            .open
            .get(discovery_key)
            .map_or(0, |e| e.strong)
    }

    pub fn open_count(&self) -> usize {
        self.state.lock().open.len()
    }

    pub fn subscribe_feeds(&self, listener: impl Fn(&Arc<Log>) + Send + Sync + 'static) -> u64 {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.feed_listeners.lock().insert(id, Arc::new(listener));
        id
    }

    pub fn unsubscribe_feeds(&self, id: u64) {
        self.feed_listeners.lock().remove(&id);
    }

    /// Close every open log. Used at daemon shutdown.
    pub fn close_all(&self) {
        let logs: Vec<Arc<Log>> = {
            let mut state = self.state.lock();
            state.idle.clear();
            state.open.drain().map(|(_, e)| e.log).collect()
        };
        for log in logs {
            let retained = log.close();
            self.state.lock().retained.insert(log.key(), retained);
        }
    }
}

#[cfg(test)]
#[path = "tests/log_store_tests.rs"]
mod tests;
