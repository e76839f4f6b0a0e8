//! RPC service definitions for client ↔ daemon communication.
//!
//! Two tarpc services share the wire format:
//! - [`hub_service::LogHubService`]: request/response operations of one client
//!   session, served by the daemon.
//! - [`hub_service::ClientEvents`]: pushed notifications, served by the client
//!   on a second connection and called by the daemon.

pub mod hub_service;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Contents of the daemon's port file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortFileContent {
    pub port: u16,
    pub events_port: u16,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

#[cfg(test)]
#[path = "tests/rpc_tests.rs"]
mod tests;
