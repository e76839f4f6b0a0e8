//! Service definitions for client sessions.

use crate::error::HubResult;
use crate::hub::HubStatus;
use crate::session::{
    ClientEvent, LogSnapshot, NetworkStatus, OpenRequest, ReadOptions, SeekOptions,
    UpdateOptions, UpdateOutcome, WatchKind,
};
use crate::store::{AppendOutcome, DiscoveryKey, DownloadRange, PeerKey, SeekPosition};
use crate::swarm::JoinOptions;

/// Service exposed by the daemon. Each connection is one client session;
/// dropping the connection tears the session down.
#[tarpc::service]
pub trait LogHubService {
    /// Daemon version, session count and network status.
    async fn status() -> HubStatus;

    /// Stop the daemon.
    async fn shutdown() -> HubResult<()>;

    /// Token binding an events connection to this session.
    async fn events_token() -> String;

    async fn open(id: String, request: OpenRequest) -> HubResult<LogSnapshot>;

    async fn close(id: String) -> HubResult<()>;

    async fn read(id: String, resource_id: String, seq: u64, opts: ReadOptions)
        -> HubResult<Vec<u8>>;

    /// Cancel an outstanding read or download.
    async fn cancel(id: String, resource_id: String) -> HubResult<()>;

    async fn append(id: String, blocks: Vec<Vec<u8>>) -> HubResult<AppendOutcome>;

    async fn update(id: String, opts: UpdateOptions) -> HubResult<UpdateOutcome>;

    async fn seek(id: String, byte_offset: u64, opts: SeekOptions) -> HubResult<SeekPosition>;

    async fn exists(id: String, seq: u64) -> HubResult<bool>;

    async fn download(id: String, resource_id: String, range: DownloadRange) -> HubResult<()>;

    async fn undownload(id: String, resource_id: String) -> HubResult<()>;

    async fn downloaded(id: String, start: u64, end: Option<u64>) -> HubResult<u64>;

    async fn acquire_lock(id: String) -> HubResult<()>;

    async fn release_lock(id: String) -> HubResult<()>;

    async fn register_extension(id: String, resource_id: String, name: String) -> HubResult<()>;

    async fn unregister_extension(id: String, resource_id: String) -> HubResult<()>;

    /// Returns the number of peers the message was queued for.
    async fn send_extension(
        id: String,
        resource_id: String,
        remote_public_key: Option<PeerKey>,
        data: Vec<u8>,
    ) -> HubResult<usize>;

    async fn watch(id: String, kind: WatchKind) -> HubResult<()>;

    async fn unwatch(id: String, kind: WatchKind) -> HubResult<()>;

    async fn configure_network(discovery_key: DiscoveryKey, opts: JoinOptions) -> HubResult<()>;

    async fn network_status() -> NetworkStatus;
}

/// Callback service for pushed notifications (daemon → client).
/// Clients implement this service; the daemon calls into it.
#[tarpc::service]
pub trait ClientEvents {
    /// Events token of the session this connection belongs to.
    async fn claim() -> String;

    async fn event(event: ClientEvent);
}
