//! In-process storage engine: logs, their replication hooks, and the
//! reference-counted store that shares them between sessions.

pub mod download;
pub mod keys;
pub mod log;
pub mod log_store;
pub mod replica;

pub use download::{DownloadHandle, DownloadRange};
pub use keys::{DiscoveryKey, LogKey, PeerKey};
pub use log::{
    AppendOutcome, Get, LengthWait, Log, LogEvent, RetainedBlocks, SeekOutcome, SeekPosition,
};
pub use log_store::{LogSpec, LogStore};
pub use replica::{PeerInfo, PeerMessage};
