//! RPC server for the hub daemon.
//!
//! Every accepted connection on the RPC port becomes one client session. A
//! client that wants pushed events opens a second connection on the events
//! port; the daemon acts as the tarpc client there and asks the connection
//! which session it belongs to.

use crate::config::HubConfig;
use crate::error::HubResult;
use crate::hub::{Hub, HubOptions, HubStatus};
use crate::hub_paths;
use crate::rpc::hub_service::{ClientEventsClient, LogHubService};
use crate::rpc::PortFileContent;
use crate::session::{
    ClientEvent, ClientSession, LogSnapshot, NetworkStatus, OpenRequest, ReadOptions,
    SeekOptions, UpdateOptions, UpdateOutcome, WatchKind,
};
use crate::store::{AppendOutcome, DiscoveryKey, DownloadRange, PeerKey, SeekPosition};
use crate::swarm::{JoinOptions, LocalSwarm, NetworkConfigurations};
use anyhow::Context;
use fs2::FileExt;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tarpc::server::{self, Channel};
use tarpc::tokio_serde::formats::Bincode;
use tokio::sync::{broadcast, mpsc};

const DEFAULT_CLAIM_TIMEOUT: Duration = Duration::from_secs(30);

/// Event streams of sessions whose events connection has not been claimed
/// yet, keyed by events token.
pub struct EventRoutes {
    pending: Mutex<HashMap<String, mpsc::UnboundedReceiver<ClientEvent>>>,
    claim_timeout: Duration,
}

impl Default for EventRoutes {
    fn default() -> Self {
        Self::with_claim_timeout(DEFAULT_CLAIM_TIMEOUT)
    }
}

impl EventRoutes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_claim_timeout(claim_timeout: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            claim_timeout,
        }
    }

    /// Park a session's stream until its events connection claims it. A
    /// stream still unclaimed after the claim timeout is dropped, and the
    /// session's later events are discarded.
    pub fn insert(self: &Arc<Self>, token: String, events: mpsc::UnboundedReceiver<ClientEvent>) {
        self.pending.lock().insert(token.clone(), events);
        let routes = Arc::downgrade(self);
        let claim_timeout = self.claim_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(claim_timeout).await;
            let expired = routes.upgrade().and_then(|routes| routes.take(&token));
            if expired.is_some() {
                tracing::debug!(%token, "events stream never claimed, dropped");
            }
        });
    }

    /// Hand the stream to the events connection that claimed `token`. A
    /// stream can be claimed once.
    pub fn take(&self, token: &str) -> Option<mpsc::UnboundedReceiver<ClientEvent>> {
        self.pending.lock().remove(token)
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

/// Server implementation for LogHubService; one per connection.
#[derive(Clone)]
pub struct HubServer {
    hub: Arc<Hub>,
    session: Arc<ClientSession>,
    shutdown_tx: broadcast::Sender<()>,
}

impl HubServer {
    pub fn new(hub: Arc<Hub>, session: Arc<ClientSession>, shutdown_tx: broadcast::Sender<()>) -> Self {
        Self {
            hub,
            session,
            shutdown_tx,
        }
    }
}

impl LogHubService for HubServer {
    async fn status(self, _: tarpc::context::Context) -> HubStatus {
        self.hub.status()
    }

    async fn shutdown(self, _: tarpc::context::Context) -> HubResult<()> {
        tracing::info!(session = self.session.id(), "shutdown requested");
        let _ = self.shutdown_tx.send(());
        Ok(())
    }

    async fn events_token(self, _: tarpc::context::Context) -> String {
        self.session.events_token().to_string()
    }

    async fn open(
        self,
        _: tarpc::context::Context,
        id: String,
        request: OpenRequest,
    ) -> HubResult<LogSnapshot> {
        self.session.basestore.open(&id, request).await
    }

    async fn close(self, _: tarpc::context::Context, id: String) -> HubResult<()> {
        self.session.basestore.close(&id)
    }

    async fn read(
        self,
        _: tarpc::context::Context,
        id: String,
        resource_id: String,
        seq: u64,
        opts: ReadOptions,
    ) -> HubResult<Vec<u8>> {
        self.session.logs.read(&id, &resource_id, seq, opts).await
    }

    async fn cancel(
        self,
        _: tarpc::context::Context,
        id: String,
        resource_id: String,
    ) -> HubResult<()> {
        self.session.logs.cancel(&id, &resource_id)
    }

    async fn append(
        self,
        _: tarpc::context::Context,
        id: String,
        blocks: Vec<Vec<u8>>,
    ) -> HubResult<AppendOutcome> {
        self.session.logs.append(&id, blocks)
    }

    async fn update(
        self,
        _: tarpc::context::Context,
        id: String,
        opts: UpdateOptions,
    ) -> HubResult<UpdateOutcome> {
        self.session.logs.update(&id, opts).await
    }

    async fn seek(
        self,
        _: tarpc::context::Context,
        id: String,
        byte_offset: u64,
        opts: SeekOptions,
    ) -> HubResult<SeekPosition> {
        self.session.logs.seek(&id, byte_offset, opts).await
    }

    async fn exists(self, _: tarpc::context::Context, id: String, seq: u64) -> HubResult<bool> {
        self.session.logs.exists(&id, seq).await
    }

    async fn download(
        self,
        _: tarpc::context::Context,
        id: String,
        resource_id: String,
        range: DownloadRange,
    ) -> HubResult<()> {
        self.session.logs.download(&id, &resource_id, range).await
    }

    async fn undownload(
        self,
        _: tarpc::context::Context,
        id: String,
        resource_id: String,
    ) -> HubResult<()> {
        self.session.logs.undownload(&id, &resource_id)
    }

    async fn downloaded(
        self,
        _: tarpc::context::Context,
        id: String,
        start: u64,
        end: Option<u64>,
    ) -> HubResult<u64> {
        self.session.logs.downloaded(&id, start, end)
    }

    async fn acquire_lock(self, _: tarpc::context::Context, id: String) -> HubResult<()> {
        self.session.logs.acquire_lock(&id).await
    }

    async fn release_lock(self, _: tarpc::context::Context, id: String) -> HubResult<()> {
        self.session.logs.release_lock(&id)
    }

    async fn register_extension(
        self,
        _: tarpc::context::Context,
        id: String,
        resource_id: String,
        name: String,
    ) -> HubResult<()> {
        self.session
            .logs
            .register_extension(&id, &resource_id, &name)
    }

    async fn unregister_extension(
        self,
        _: tarpc::context::Context,
        id: String,
        resource_id: String,
    ) -> HubResult<()> {
        self.session.logs.unregister_extension(&id, &resource_id)
    }

    async fn send_extension(
        self,
        _: tarpc::context::Context,
        id: String,
        resource_id: String,
        remote_public_key: Option<PeerKey>,
        data: Vec<u8>,
    ) -> HubResult<usize> {
        self.session
            .logs
            .send_extension(&id, &resource_id, remote_public_key, &data)
    }

    async fn watch(self, _: tarpc::context::Context, id: String, kind: WatchKind) -> HubResult<()> {
        self.session.logs.watch(&id, kind)
    }

    async fn unwatch(
        self,
        _: tarpc::context::Context,
        id: String,
        kind: WatchKind,
    ) -> HubResult<()> {
        self.session.logs.unwatch(&id, kind)
    }

    async fn configure_network(
        self,
        _: tarpc::context::Context,
        discovery_key: DiscoveryKey,
        opts: JoinOptions,
    ) -> HubResult<()> {
        self.session.network.configure(discovery_key, opts).await
    }

    async fn network_status(self, _: tarpc::context::Context) -> NetworkStatus {
        self.session.network.status()
    }
}

/// Accept client connections until shutdown. Each connection gets its own
/// session, torn down when the connection closes.
pub async fn run_hub_server(
    hub: Arc<Hub>,
    routes: Arc<EventRoutes>,
    shutdown_tx: broadcast::Sender<()>,
    host: &str,
    port: u16,
) -> anyhow::Result<()> {
    use tarpc::serde_transport::tcp;

    let addr = format!("{}:{}", host, port);
    let mut listener = tcp::listen(&addr, Bincode::default).await?;
    tracing::info!(%addr, "RPC server listening");

    let mut shutdown_rx = shutdown_tx.subscribe();

    loop {
        tokio::select! {
            Some(result) = listener.next() => {
                match result {
                    Ok(transport) => {
                        let (session, events) = match hub.connect() {
                            Ok(connected) => connected,
                            Err(e) => {
                                tracing::warn!(error = %e, "failed to open session");
                                continue;
                            }
                        };
                        let token = session.events_token().to_string();
                        routes.insert(token.clone(), events);
                        let session = Arc::new(session);
                        let server = HubServer::new(hub.clone(), session.clone(), shutdown_tx.clone());
                        let channel = server::BaseChannel::with_defaults(transport);
                        let routes = routes.clone();

                        tokio::spawn(async move {
                            channel.execute(server.serve()).for_each(|response| async {
                                tokio::spawn(response);
                            }).await;
                            session.disconnect();
                            routes.take(&token);
                            tracing::debug!(session = session.id(), "client disconnected");
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept error");
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                break;
            }
        }
    }

    Ok(())
}

/// Accept events connections until shutdown. Each connection is asked for
/// its token and then receives its session's events in order.
pub async fn run_events_listener(
    routes: Arc<EventRoutes>,
    shutdown_tx: broadcast::Sender<()>,
    host: &str,
    events_port: u16,
) -> anyhow::Result<()> {
    use tarpc::client;
    use tarpc::serde_transport::tcp;

    let addr = format!("{}:{}", host, events_port);
    let mut listener = tcp::listen(&addr, Bincode::default).await?;
    tracing::info!(%addr, "events listener ready");

    let mut shutdown_rx = shutdown_tx.subscribe();

    loop {
        tokio::select! {
            Some(result) = listener.next() => {
                match result {
                    Ok(transport) => {
                        let client = ClientEventsClient::new(client::Config::default(), transport).spawn();
                        tokio::spawn(forward_events(client, routes.clone()));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "events accept error");
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                break;
            }
        }
    }

    Ok(())
}

async fn forward_events(client: ClientEventsClient, routes: Arc<EventRoutes>) {
    let token = match client.claim(tarpc::context::current()).await {
        Ok(token) => token,
        Err(e) => {
            tracing::warn!(error = %e, "events connection did not claim a session");
            return;
        }
    };
    let Some(mut events) = routes.take(&token) else {
        tracing::warn!("events connection claimed an unknown or taken token");
        return;
    };
    while let Some(event) = events.recv().await {
        if let Err(e) = client.event(tarpc::context::current(), event).await {
            tracing::debug!(error = %e, "events connection closed");
            break;
        }
    }
}

/// Find an available TCP port.
pub async fn find_available_port(host: &str) -> anyhow::Result<u16> {
    use tokio::net::TcpListener;
    let listener = TcpListener::bind(format!("{}:0", host)).await?;
    Ok(listener.local_addr()?.port())
}

async fn pick_port(host: &str, configured: Option<u16>) -> anyhow::Result<u16> {
    match configured {
        Some(port) if port != 0 => Ok(port),
        _ => find_available_port(host).await,
    }
}

/// Main entry point of the daemon. Runs until a client requests shutdown.
pub async fn run_daemon(config: HubConfig) -> anyhow::Result<()> {
    let lock_path = hub_paths::lock_path()?;
    let lock_file = std::fs::File::create(&lock_path)
        .with_context(|| format!("Failed to create lock file: {}", lock_path.display()))?;
    lock_file
        .try_lock_exclusive()
        .context("Another loghub daemon is already running")?;

    let pid = std::process::id();
    let pid_path = hub_paths::pid_path()?;
    std::fs::write(&pid_path, pid.to_string()).context("Failed to write PID file")?;

    let seed = match config.seed()? {
        Some(seed) => seed,
        None => hub_paths::load_or_create_seed(&hub_paths::seed_path()?)?,
    };
    let network_configs = NetworkConfigurations::load(&hub_paths::network_configs_path()?)?;
    let swarm = Arc::new(LocalSwarm::with_auto_settle(config.network.auto_settle));
    let hub = Arc::new(Hub::new(
        HubOptions {
            seed,
            max_idle_logs: config.store.max_idle_logs,
            no_announce: config.network.no_announce,
        },
        swarm,
        network_configs,
    ));
    let routes = Arc::new(EventRoutes::with_claim_timeout(Duration::from_secs(
        config.server.events_claim_timeout_secs,
    )));
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let host = config.server.host.clone();
    let port = pick_port(&host, config.server.port).await?;
    let events_port = pick_port(&host, config.server.events_port).await?;

    let port_path = hub_paths::port_path()?;
    let port_content = PortFileContent {
        port,
        events_port,
        pid,
        started_at: chrono::Utc::now(),
    };
    std::fs::write(&port_path, serde_json::to_string(&port_content)?)
        .context("Failed to write port file")?;
    tracing::info!(port, events_port, pid, "daemon starting");

    {
        let routes = routes.clone();
        let shutdown_tx = shutdown_tx.clone();
        let host = host.clone();
        tokio::spawn(async move {
            if let Err(e) = run_events_listener(routes, shutdown_tx, &host, events_port).await {
                tracing::error!(error = %e, "events listener failed");
            }
        });
    }

    hub.rejoin().await;

    let served = run_hub_server(hub.clone(), routes, shutdown_tx, &host, port).await;

    hub.close();
    let _ = std::fs::remove_file(&port_path);
    let _ = std::fs::remove_file(&pid_path);
    let _ = FileExt::unlock(&lock_file);
    tracing::info!("daemon stopped");
    served
}
