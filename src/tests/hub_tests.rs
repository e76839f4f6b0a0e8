use super::*;
use crate::session::OpenRequest;
use crate::store::DiscoveryKey;
use crate::swarm::{JoinOptions, LocalSwarm};
use tempfile::TempDir;

fn hub_with(swarm: Arc<LocalSwarm>, no_announce: bool, configs: NetworkConfigurations) -> Hub {
    Hub::new(
        HubOptions {
            no_announce,
            ..HubOptions::default()
        },
        swarm,
        configs,
    )
}

#[tokio::test]
async fn test_status_counts_sessions_and_logs() {
    let hub = hub_with(
        Arc::new(LocalSwarm::new()),
        false,
        NetworkConfigurations::in_memory(),
    );
    let status = hub.status();
    assert_eq!(status.version, VERSION);
    assert_eq!(status.sessions, 0);
    assert_eq!(status.open_logs, 0);

    let (session, _rx) = hub.connect().unwrap();
    session
        .basestore
        .open(
            "a",
            OpenRequest {
                name: Some("alpha".to_string()),
                ..OpenRequest::default()
            },
        )
        .await
        .unwrap();
    let status = hub.status();
    assert_eq!(status.sessions, 1);
    assert_eq!(status.open_logs, 1);

    drop(session);
    assert_eq!(hub.status().sessions, 0);
}

#[tokio::test]
async fn test_opened_logs_are_tracked() {
    let hub = hub_with(
        Arc::new(LocalSwarm::manual()),
        false,
        NetworkConfigurations::in_memory(),
    );
    let (session, _rx) = hub.connect().unwrap();
    let snapshot = session
        .basestore
        .open(
            "a",
            OpenRequest {
                name: Some("alpha".to_string()),
                ..OpenRequest::default()
            },
        )
        .await
        .unwrap();
    assert!(hub.context().tracker.is_tracked(&snapshot.discovery_key));

    hub.close();
    assert!(!hub.context().tracker.is_tracked(&snapshot.discovery_key));
    assert_eq!(hub.status().open_logs, 0);
}

#[tokio::test]
async fn test_rejoin_only_announced_configurations() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("network.json");
    let mut configs = NetworkConfigurations::load(&path).unwrap();
    configs
        .remember(DiscoveryKey([1; 32]), JoinOptions::announce())
        .unwrap();
    configs
        .remember(
            DiscoveryKey([2; 32]),
            JoinOptions {
                announce: false,
                lookup: true,
                flush: false,
                remember: true,
            },
        )
        .unwrap();

    let swarm = Arc::new(LocalSwarm::new());
    let hub = hub_with(swarm.clone(), false, NetworkConfigurations::load(&path).unwrap());
    assert_eq!(hub.rejoin().await, 1);
    assert!(swarm.joined(&DiscoveryKey([1; 32])));
    assert!(!swarm.joined(&DiscoveryKey([2; 32])));
}

#[tokio::test]
async fn test_no_announce_skips_rejoin_and_strips_announce() {
    let mut configs = NetworkConfigurations::in_memory();
    configs
        .remember(DiscoveryKey([1; 32]), JoinOptions::announce())
        .unwrap();
    let swarm = Arc::new(LocalSwarm::new());
    let hub = hub_with(swarm.clone(), true, configs);
    assert_eq!(hub.rejoin().await, 0);
    assert!(!swarm.joined(&DiscoveryKey([1; 32])));

    let (session, _rx) = hub.connect().unwrap();
    session
        .network
        .configure(DiscoveryKey([3; 32]), JoinOptions::announce())
        .await
        .unwrap();
    let opts = swarm.topic_options(&DiscoveryKey([3; 32])).unwrap();
    assert!(!opts.announce);
    assert!(opts.lookup);
}

#[tokio::test]
async fn test_configure_remember_persists() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("network.json");
    let swarm = Arc::new(LocalSwarm::new());
    let hub = hub_with(swarm.clone(), false, NetworkConfigurations::load(&path).unwrap());
    let (session, _rx) = hub.connect().unwrap();

    let remembered = JoinOptions {
        remember: true,
        flush: true,
        ..JoinOptions::announce()
    };
    session
        .network
        .configure(DiscoveryKey([4; 32]), remembered)
        .await
        .unwrap();
    assert_eq!(session.network.status().remembered, 1);
    assert_eq!(session.network.status().swarm.joined_topics, 1);
    assert_eq!(NetworkConfigurations::load(&path).unwrap().list().len(), 1);

    let leave = JoinOptions {
        remember: true,
        ..JoinOptions::leave()
    };
    session
        .network
        .configure(DiscoveryKey([4; 32]), leave)
        .await
        .unwrap();
    assert_eq!(session.network.status().remembered, 0);
    assert!(!swarm.joined(&DiscoveryKey([4; 32])));
}
