//! The loghub daemon.
//!
//! ## Architecture
//!
//! - **Server (`rpc_server.rs`)**: tarpc server; one client session per
//!   connection, plus a listener that pushes each session's events over a
//!   second connection.
//! - **Client (`rpc_client.rs`)**: typed wrapper over the service and the
//!   events subscription.

pub mod rpc_client;
pub mod rpc_server;

#[cfg(test)]
pub(crate) mod rpc_tests;

pub use rpc_client::{EventSubscription, HubClient};
pub use rpc_server::{run_daemon, run_events_listener, run_hub_server, EventRoutes, HubServer};
