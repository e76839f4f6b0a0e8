//! Integration tests for the daemon's RPC layer.
//!
//! These tests spin up real RPC servers and clients to test the full
//! communication flow. No mocks are used.


use crate::daemon::rpc_client::HubClient;
use crate::daemon::rpc_server::{run_events_listener, run_hub_server, EventRoutes};
use crate::hub::{Hub, HubOptions};
use crate::session::OpenRequest;
use crate::swarm::{LocalSwarm, NetworkConfigurations};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub const SETTLE: Duration = Duration::from_millis(50);
pub const RESOLVE: Duration = Duration::from_secs(2);

/// Find an available TCP port for testing.
pub fn find_test_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

pub fn named(name: &str) -> OpenRequest {
    OpenRequest {
        name: Some(name.to_string()),
        ..OpenRequest::default()
    }
}

/// Test harness that manages a real daemon server for testing.
pub struct TestServer {
    pub port: u16,
    pub events_port: u16,
    pub hub: Arc<Hub>,
    pub routes: Arc<EventRoutes>,
    pub shutdown_tx: broadcast::Sender<()>,
    pub server_handle: tokio::task::JoinHandle<()>,
    _events_handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    pub async fn start() -> Self {
        let port = find_test_port();
        let events_port = find_test_port();

        let hub = Arc::new(Hub::new(
            HubOptions::default(),
            Arc::new(LocalSwarm::new()),
            NetworkConfigurations::in_memory(),
        ));
        let routes = Arc::new(EventRoutes::new());
        let (shutdown_tx, _) = broadcast::channel(1);

        let server_handle = {
            let hub = hub.clone();
            let routes = routes.clone();
            let shutdown_tx = shutdown_tx.clone();
            tokio::spawn(async move {
                let _ = run_hub_server(hub, routes, shutdown_tx, "127.0.0.1", port).await;
            })
        };

        let events_handle = {
            let routes = routes.clone();
            let shutdown_tx = shutdown_tx.clone();
            tokio::spawn(async move {
                let _ = run_events_listener(routes, shutdown_tx, "127.0.0.1", events_port).await;
            })
        };

        // Give server time to start
        tokio::time::sleep(SETTLE).await;

        Self {
            port,
            events_port,
            hub,
            routes,
            shutdown_tx,
            server_handle,
            _events_handle: events_handle,
        }
    }

    /// Create a client connected to this server.
    pub async fn client(&self) -> HubClient {
        HubClient::connect("127.0.0.1", self.port, self.events_port)
            .await
            .unwrap()
    }

    /// Poll until the hub counts `expected` live sessions.
    pub async fn wait_for_sessions(&self, expected: usize) {
        tokio::time::timeout(RESOLVE, async {
            while self.hub.status().sessions != expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
