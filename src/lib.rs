//! loghub: a daemon that owns append-only logs and serves them to many
//! client sessions over RPC.

pub mod config;
pub mod daemon;
pub mod daemon_log;
pub mod error;
pub mod hub;
pub mod hub_paths;
pub mod lock;
pub mod readiness;
pub mod rpc;
pub mod session;
pub mod store;
pub mod swarm;

pub use error::{HubError, HubResult};
pub use hub::{Hub, HubOptions};
