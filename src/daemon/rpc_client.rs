//! RPC client for the hub daemon.
//!
//! A [`HubClient`] is one client session: every call runs in the session
//! opened for its connection, and dropping the client tears the session down.

use crate::error::HubResult;
use crate::hub::HubStatus;
use crate::hub_paths;
use crate::rpc::hub_service::{ClientEvents, LogHubServiceClient};
use crate::rpc::PortFileContent;
use crate::session::{
    ClientEvent, LogSnapshot, NetworkStatus, OpenRequest, ReadOptions, SeekOptions,
    UpdateOptions, UpdateOutcome, WatchKind,
};
use crate::store::{AppendOutcome, DiscoveryKey, DownloadRange, PeerKey, SeekPosition};
use crate::swarm::JoinOptions;
use anyhow::{Context, Result};
use futures::StreamExt;
use std::time::Duration;
use tarpc::client::{self, RpcError};
use tarpc::server::{self, Channel};
use tarpc::tokio_serde::formats::Bincode;
use tokio::sync::mpsc;

/// Maximum connection attempts with exponential backoff.
const MAX_CONNECT_ATTEMPTS: u32 = 5;

/// Base delay for exponential backoff (milliseconds).
const BASE_DELAY_MS: u64 = 100;

/// Deadline of calls that may suspend until the network delivers.
const LONG_DEADLINE: Duration = Duration::from_secs(24 * 60 * 60);

pub struct HubClient {
    client: LogHubServiceClient,
    host: String,
    events_port: u16,
}

fn context() -> tarpc::context::Context {
    tarpc::context::current()
}

fn long_context() -> tarpc::context::Context {
    let mut ctx = tarpc::context::current();
    ctx.deadline = std::time::Instant::now() + LONG_DEADLINE;
    ctx
}

/// Unwrap both the transport and the hub layer. Hub errors stay
/// downcastable to [`crate::error::HubError`].
fn flatten<T>(result: std::result::Result<HubResult<T>, RpcError>) -> Result<T> {
    let reply = result.context("RPC call failed")?;
    Ok(reply?)
}

impl HubClient {
    /// Connect to a daemon at `host`.
    pub async fn connect(host: &str, port: u16, events_port: u16) -> Result<Self> {
        use tarpc::serde_transport::tcp;

        let addr = format!("{}:{}", host, port);
        let transport = tcp::connect(&addr, Bincode::default)
            .await
            .with_context(|| format!("Failed to connect to loghub daemon at {}", addr))?;
        let client = LogHubServiceClient::new(client::Config::default(), transport).spawn();
        Ok(Self {
            client,
            host: host.to_string(),
            events_port,
        })
    }

    /// Connect to the local daemon named by the port file, retrying while it
    /// starts up.
    pub async fn from_port_file() -> Result<Self> {
        let port_path = hub_paths::port_path()?;
        let mut delay_ms = BASE_DELAY_MS;

        for attempt in 1..=MAX_CONNECT_ATTEMPTS {
            if let Ok(content) = std::fs::read_to_string(&port_path) {
                if let Ok(port_info) = serde_json::from_str::<PortFileContent>(&content) {
                    match Self::connect("127.0.0.1", port_info.port, port_info.events_port).await {
                        Ok(client) => return Ok(client),
                        Err(e) => tracing::debug!(attempt, error = %e, "daemon not reachable yet"),
                    }
                }
            }

            if attempt < MAX_CONNECT_ATTEMPTS {
                // Add jitter (±25%)
                let jitter = (delay_ms as f64 * 0.25 * (rand::random::<f64>() * 2.0 - 1.0)) as i64;
                let actual_delay = (delay_ms as i64 + jitter).max(10) as u64;
                tokio::time::sleep(Duration::from_millis(actual_delay)).await;
                delay_ms *= 2;
            }
        }

        anyhow::bail!(
            "No loghub daemon reachable after {} attempts (port file: {})",
            MAX_CONNECT_ATTEMPTS,
            port_path.display()
        )
    }

    /// Open the events connection of this session.
    pub async fn subscribe(&self) -> Result<EventSubscription> {
        let token = self
            .client
            .events_token(context())
            .await
            .context("Failed to fetch events token")?;
        EventSubscription::connect(&self.host, self.events_port, token).await
    }

    pub async fn status(&self) -> Result<HubStatus> {
        self.client.status(context()).await.context("RPC call failed")
    }

    pub async fn shutdown(&self) -> Result<()> {
        flatten(self.client.shutdown(context()).await)
    }

    pub async fn open(&self, id: &str, request: OpenRequest) -> Result<LogSnapshot> {
        flatten(self.client.open(long_context(), id.to_string(), request).await)
    }

    pub async fn close(&self, id: &str) -> Result<()> {
        flatten(self.client.close(context(), id.to_string()).await)
    }

    pub async fn read(
        &self,
        id: &str,
        resource_id: &str,
        seq: u64,
        opts: ReadOptions,
    ) -> Result<Vec<u8>> {
        flatten(
            self.client
                .read(long_context(), id.to_string(), resource_id.to_string(), seq, opts)
                .await,
        )
    }

    pub async fn cancel(&self, id: &str, resource_id: &str) -> Result<()> {
        flatten(
            self.client
                .cancel(context(), id.to_string(), resource_id.to_string())
                .await,
        )
    }

    pub async fn append(&self, id: &str, blocks: Vec<Vec<u8>>) -> Result<AppendOutcome> {
        flatten(self.client.append(context(), id.to_string(), blocks).await)
    }

    pub async fn update(&self, id: &str, opts: UpdateOptions) -> Result<UpdateOutcome> {
        flatten(self.client.update(long_context(), id.to_string(), opts).await)
    }

    pub async fn seek(&self, id: &str, byte_offset: u64, opts: SeekOptions) -> Result<SeekPosition> {
        flatten(
            self.client
                .seek(long_context(), id.to_string(), byte_offset, opts)
                .await,
        )
    }

    pub async fn exists(&self, id: &str, seq: u64) -> Result<bool> {
        flatten(self.client.exists(long_context(), id.to_string(), seq).await)
    }

    pub async fn download(&self, id: &str, resource_id: &str, range: DownloadRange) -> Result<()> {
        flatten(
            self.client
                .download(long_context(), id.to_string(), resource_id.to_string(), range)
                .await,
        )
    }

    pub async fn undownload(&self, id: &str, resource_id: &str) -> Result<()> {
        flatten(
            self.client
                .undownload(context(), id.to_string(), resource_id.to_string())
                .await,
        )
    }

    pub async fn downloaded(&self, id: &str, start: u64, end: Option<u64>) -> Result<u64> {
        flatten(
            self.client
                .downloaded(context(), id.to_string(), start, end)
                .await,
        )
    }

    pub async fn acquire_lock(&self, id: &str) -> Result<()> {
        flatten(self.client.acquire_lock(long_context(), id.to_string()).await)
    }

    pub async fn release_lock(&self, id: &str) -> Result<()> {
        flatten(self.client.release_lock(context(), id.to_string()).await)
    }

    pub async fn register_extension(&self, id: &str, resource_id: &str, name: &str) -> Result<()> {
        flatten(
            self.client
                .register_extension(
                    context(),
                    id.to_string(),
                    resource_id.to_string(),
                    name.to_string(),
                )
                .await,
        )
    }

    pub async fn unregister_extension(&self, id: &str, resource_id: &str) -> Result<()> {
        flatten(
            self.client
                .unregister_extension(context(), id.to_string(), resource_id.to_string())
                .await,
        )
    }

    pub async fn send_extension(
        &self,
        id: &str,
        resource_id: &str,
        remote_public_key: Option<PeerKey>,
        data: Vec<u8>,
    ) -> Result<usize> {
        flatten(
            self.client
                .send_extension(
                    context(),
                    id.to_string(),
                    resource_id.to_string(),
                    remote_public_key,
                    data,
                )
                .await,
        )
    }

    pub async fn watch(&self, id: &str, kind: WatchKind) -> Result<()> {
        flatten(self.client.watch(context(), id.to_string(), kind).await)
    }

    pub async fn unwatch(&self, id: &str, kind: WatchKind) -> Result<()> {
        flatten(self.client.unwatch(context(), id.to_string(), kind).await)
    }

    pub async fn configure_network(
        &self,
        discovery_key: DiscoveryKey,
        opts: JoinOptions,
    ) -> Result<()> {
        flatten(
            self.client
                .configure_network(long_context(), discovery_key, opts)
                .await,
        )
    }

    pub async fn network_status(&self) -> Result<NetworkStatus> {
        self.client
            .network_status(context())
            .await
            .context("RPC call failed")
    }
}

/// Handler that implements ClientEvents and forwards events to a channel.
#[derive(Clone)]
struct EventsHandler {
    token: String,
    tx: mpsc::UnboundedSender<ClientEvent>,
}

impl ClientEvents for EventsHandler {
    async fn claim(self, _: tarpc::context::Context) -> String {
        self.token
    }

    async fn event(self, _: tarpc::context::Context, event: ClientEvent) {
        let _ = self.tx.send(event);
    }
}

/// Pushed events of one client session, in emission order.
pub struct EventSubscription {
    rx: mpsc::UnboundedReceiver<ClientEvent>,
    _server_task: tokio::task::JoinHandle<()>,
}

impl EventSubscription {
    async fn connect(host: &str, events_port: u16, token: String) -> Result<Self> {
        use tarpc::serde_transport::tcp;

        let addr = format!("{}:{}", host, events_port);
        let transport = tcp::connect(&addr, Bincode::default)
            .await
            .with_context(|| format!("Failed to connect to events port {}", addr))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let handler = EventsHandler { token, tx };

        // The daemon calls into this server to push events.
        let server_task = tokio::spawn(async move {
            let channel = server::BaseChannel::with_defaults(transport);
            channel
                .execute(handler.serve())
                .for_each(|response| async {
                    tokio::spawn(response);
                })
                .await;
            tracing::debug!("events connection ended");
        });

        Ok(Self {
            rx,
            _server_task: server_task,
        })
    }

    /// Receive the next event. Returns None once the connection is closed.
    pub async fn recv(&mut self) -> Option<ClientEvent> {
        self.rx.recv().await
    }
}
