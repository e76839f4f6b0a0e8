//! Range downloads: keep a set of blocks pending until all are local.

use super::log::{Log, LogState};
use crate::error::{HubError, HubResult};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

/// Blocks a download asks for.
///
/// `blocks`, when non-empty, overrides `start`/`end`. Without `blocks` and
/// without `end` the range is live: it follows the log forever and never
/// completes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRange {
    pub start: u64,
    pub end: Option<u64>,
    #[serde(default)]
    pub blocks: Vec<u64>,
    #[serde(default)]
    pub linear: bool,
}

impl DownloadRange {
    pub fn bounded(start: u64, end: u64) -> Self {
        Self {
            start,
            end: Some(end),
            ..Self::default()
        }
    }

    pub fn live(start: u64) -> Self {
        Self {
            start,
            ..Self::default()
        }
    }

    pub fn blocks(blocks: Vec<u64>) -> Self {
        Self {
            blocks,
            ..Self::default()
        }
    }

    pub fn is_live(&self) -> bool {
        self.blocks.is_empty() && self.end.is_none()
    }

    fn validate(&self) -> HubResult<()> {
        match self.end {
            Some(end) if end < self.start => Err(HubError::invalid(format!(
                "download range end {} precedes start {}",
                end, self.start
            ))),
            _ => Ok(()),
        }
    }

    fn is_satisfied(&self, state: &LogState) -> bool {
        if !self.blocks.is_empty() {
            return self.blocks.iter().all(|seq| state.has(*seq));
        }
        match self.end {
            Some(end) => (self.start..end).all(|seq| state.has(seq)),
            None => false,
        }
    }
}

pub(super) struct PendingDownload {
    range: DownloadRange,
    pub(super) tx: oneshot::Sender<HubResult<()>>,
}

#[derive(Debug)]
pub enum DownloadHandle {
    /// Every requested block was already local.
    Complete,
    Pending {
        id: u64,
        rx: oneshot::Receiver<HubResult<()>>,
    },
}

impl LogState {
    pub(super) fn settle_downloads(&mut self) {
        let done: Vec<u64> = self
            .downloads
            .iter()
            .filter(|(_, d)| d.range.is_satisfied(self))
            .map(|(id, _)| *id)
            .collect();
        for id in done {
            if let Some(download) = self.downloads.remove(&id) {
                let _ = download.tx.send(Ok(()));
            }
        }
    }
}

impl Log {
    pub fn download(&self, range: DownloadRange) -> HubResult<DownloadHandle> {
        range.validate()?;
        let id = self.next_id();
        let mut state = self.state.lock();
        if state.closed {
            return Err(HubError::LogClosed);
        }
        if range.is_satisfied(&state) {
            return Ok(DownloadHandle::Complete);
        }
        tracing::debug!(log = %self.key(), id, ?range, "download started");
        let (tx, rx) = oneshot::channel();
        state.downloads.insert(id, PendingDownload { range, tx });
        Ok(DownloadHandle::Pending { id, rx })
    }

    /// Stop a pending download; its waiter resolves `Cancelled`. Returns
    /// whether the download was still pending.
    pub fn undownload(&self, id: u64) -> bool {
        let download = self.state.lock().downloads.remove(&id);
        match download {
            Some(download) => {
                let _ = download.tx.send(Err(HubError::Cancelled));
                true
            }
            None => false,
        }
    }

    /// Bytes held locally for blocks in `start..end` (`end` defaults to the
    /// log length).
    pub fn downloaded(&self, start: u64, end: Option<u64>) -> u64 {
        let state = self.state.lock();
        let end = end.unwrap_or(state.length()).min(state.length());
        (start..end)
            .filter_map(|seq| state.blocks[seq as usize].as_ref())
            .map(|block| block.len() as u64)
            .sum()
    }

    pub fn pending_downloads(&self) -> usize {
        self.state.lock().downloads.len()
    }
}
