//! Per-log mutual exclusion shared by every session of the process.
//!
//! Lock state lives in a side table keyed by discovery key. Each acquire
//! carries a [`LockTicket`] so a session's queued request can be withdrawn
//! (or its held lock released) by the session's teardown.

use crate::error::{HubError, HubResult};
use crate::store::DiscoveryKey;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;

pub type SessionId = u64;

/// Identifies one acquire request by one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockTicket {
    pub session: SessionId,
    seq: u64,
}

struct LockState {
    holder: LockTicket,
    waiters: VecDeque<(LockTicket, oneshot::Sender<()>)>,
}

#[derive(Default)]
pub struct LockManager {
    next_seq: AtomicU64,
    locks: Mutex<HashMap<DiscoveryKey, LockState>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ticket(&self, session: SessionId) -> LockTicket {
        LockTicket {
            session,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Take the lock, waiting behind earlier requests if it is held.
    pub async fn acquire(&self, discovery_key: DiscoveryKey, ticket: LockTicket) -> HubResult<()> {
        let rx = {
            let mut locks = self.locks.lock();
            match locks.get_mut(&discovery_key) {
                None => {
                    locks.insert(
                        discovery_key,
                        LockState {
                            holder: ticket,
                            waiters: VecDeque::new(),
                        },
                    );
                    tracing::debug!(topic = %discovery_key, session = ticket.session, "lock acquired");
                    return Ok(());
                }
                Some(state) => {
                    let (tx, rx) = oneshot::channel();
                    state.waiters.push_back((ticket, tx));
                    tracing::debug!(
                        topic = %discovery_key,
                        session = ticket.session,
                        queued = state.waiters.len(),
                        "lock busy, waiting"
                    );
                    rx
                }
            }
        };
        rx.await.map_err(|_| HubError::Cancelled)
    }

    /// Release the lock taken with `ticket`. Another ticket of the same
    /// session does not own it.
    pub fn release(&self, discovery_key: &DiscoveryKey, ticket: LockTicket) -> HubResult<()> {
        let mut locks = self.locks.lock();
        let Some(state) = locks.get_mut(discovery_key) else {
            return Err(HubError::NotLocked);
        };
        if state.holder != ticket {
            return Err(HubError::NotOwner);
        }
        Self::hand_off(&mut locks, discovery_key);
        Ok(())
    }

    /// Withdraw a queued request, or release the lock if `ticket` holds it.
    /// Returns whether anything changed.
    pub fn cancel(&self, discovery_key: &DiscoveryKey, ticket: LockTicket) -> bool {
        let mut locks = self.locks.lock();
        let Some(state) = locks.get_mut(discovery_key) else {
            return false;
        };
        if state.holder == ticket {
            Self::hand_off(&mut locks, discovery_key);
            return true;
        }
        let before = state.waiters.len();
        state.waiters.retain(|(waiting, _)| *waiting != ticket);
        before != state.waiters.len()
    }

    pub fn holder(&self, discovery_key: &DiscoveryKey) -> Option<LockTicket> {
        self.locks.lock().get(discovery_key).map(|s| s.holder)
    }

    pub fn waiting(&self, discovery_key: &DiscoveryKey) -> usize {
        self.locks
            .lock()
            .get(discovery_key)
            .map_or(0, |s| s.waiters.len())
    }

    /// Pass the lock to the first waiter still listening, or unlock.
    fn hand_off(locks: &mut HashMap<DiscoveryKey, LockState>, discovery_key: &DiscoveryKey) {
        let Some(state) = locks.get_mut(discovery_key) else {
            return;
        };
        while let Some((ticket, tx)) = state.waiters.pop_front() {
            if tx.send(()).is_ok() {
                tracing::debug!(topic = %discovery_key, session = ticket.session, "lock handed off");
                state.holder = ticket;
                return;
            }
        }
        locks.remove(discovery_key);
        tracing::debug!(topic = %discovery_key, "lock released");
    }
}

#[cfg(test)]
#[path = "tests/lock_tests.rs"]
mod tests;
