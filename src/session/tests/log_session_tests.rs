//! Tests for per-log session operations.

use super::*;
use crate::hub::{Hub, HubOptions};
use crate::session::{ClientSession, OpenRequest, WatchKind};
use crate::store::{LogKey, PeerInfo, PeerMessage};
use crate::swarm::{LocalSwarm, NetworkConfigurations};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver};

const SETTLE: Duration = Duration::from_millis(50);
const RESOLVE: Duration = Duration::from_secs(2);

fn test_hub() -> Hub {
    Hub::new(
        HubOptions::default(),
        Arc::new(LocalSwarm::new()),
        NetworkConfigurations::in_memory(),
    )
}

async fn session_with_log(
    hub: &Hub,
    request: OpenRequest,
) -> (Arc<ClientSession>, UnboundedReceiver<ClientEvent>, Arc<Log>) {
    let (session, rx) = hub.connect().unwrap();
    session.basestore.open("log", request).await.unwrap();
    let log = session.state().log("log").unwrap();
    (Arc::new(session), rx, log)
}

fn named(name: &str) -> OpenRequest {
    OpenRequest {
        name: Some(name.to_string()),
        ..OpenRequest::default()
    }
}

fn replica_of(key: LogKey) -> OpenRequest {
    OpenRequest {
        key: Some(key),
        ..OpenRequest::default()
    }
}

fn attach_peer(log: &Log, byte: u8, remote_length: u64) -> mpsc::UnboundedReceiver<PeerMessage> {
    let (tx, rx) = mpsc::unbounded_channel();
    log.add_peer(
        PeerInfo {
            remote_public_key: PeerKey([byte; 32]),
            remote_address: "127.0.0.1:9000".to_string(),
            remote_length,
            remote_opened: true,
        },
        tx,
    )
    .unwrap();
    rx
}

fn pushed_events(rx: &mut UnboundedReceiver<ClientEvent>) -> Vec<ClientEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if matches!(event, ClientEvent::Extension { .. } | ClientEvent::Wait { .. }) {
            events.push(event);
        }
    }
    events
}

#[tokio::test]
async fn test_cancel_pending_read_twice() {
    let hub = test_hub();
    let (session, _rx, _log) = session_with_log(&hub, named("alpha")).await;

    let reader = session.clone();
    let read = tokio::spawn(async move {
        reader
            .logs
            .read("log", "r1", 0, ReadOptions::default())
            .await
    });
    tokio::time::sleep(SETTLE).await;

    session.logs.cancel("log", "r1").unwrap();
    session.logs.cancel("log", "r1").unwrap();
    let result = tokio::time::timeout(RESOLVE, read).await.unwrap().unwrap();
    assert_eq!(result, Err(HubError::Cancelled));
    assert_eq!(
        session.logs.cancel("other", "r1"),
        Err(HubError::unknown_log("other"))
    );
}

#[tokio::test]
async fn test_dropped_read_releases_its_resource() {
    let hub = test_hub();
    let (session, _rx, log) = session_with_log(&hub, named("alpha")).await;

    let abandoned = tokio::time::timeout(
        SETTLE,
        session.logs.read("log", "r1", 3, ReadOptions::default()),
    )
    .await;
    assert!(abandoned.is_err());
    assert!(!session.state().has_resource("r1"));

    // The id is free again and the next read completes normally.
    log.append(vec![b"a".to_vec()]).unwrap();
    assert_eq!(
        session
            .logs
            .read("log", "r1", 0, ReadOptions::default())
            .await
            .unwrap(),
        b"a".to_vec()
    );
}

#[tokio::test]
async fn test_duplicate_read_id_is_rejected() {
    let hub = test_hub();
    let (session, _rx, _log) = session_with_log(&hub, named("alpha")).await;

    let reader = session.clone();
    let first = tokio::spawn(async move {
        reader
            .logs
            .read("log", "r1", 0, ReadOptions::default())
            .await
    });
    tokio::time::sleep(SETTLE).await;

    assert_eq!(
        session
            .logs
            .read("log", "r1", 1, ReadOptions::default())
            .await,
        Err(HubError::DuplicateResource {
            id: "r1".to_string()
        })
    );
    session.logs.append("log", vec![b"first".to_vec()]).unwrap();
    let result = tokio::time::timeout(RESOLVE, first).await.unwrap().unwrap();
    assert_eq!(result.unwrap(), b"first".to_vec());
}

#[tokio::test]
async fn test_wait_event_and_if_available_without_peers() {
    let hub = test_hub();
    let key = LogKey([3; 32]);
    let (session, mut rx, _log) = session_with_log(&hub, replica_of(key)).await;
    assert_eq!(
        session
            .logs
            .read(
                "log",
                "r1",
                5,
                ReadOptions {
                    wait: true,
                    if_available: true,
                    on_wait_id: Some(7)
                }
            )
            .await,
        Err(HubError::NotAvailable)
    );
    assert_eq!(
        pushed_events(&mut rx),
        vec![ClientEvent::Wait {
            id: "log".to_string(),
            on_wait_id: 7,
            seq: 5
        }]
    );
    assert!(!session.state().has_resource("r1"));
}

#[tokio::test]
async fn test_if_available_read_waits_for_a_peer_that_has_the_block() {
    let hub = test_hub();
    let key = LogKey([9; 32]);
    let (session, _rx, log) = session_with_log(&hub, replica_of(key)).await;
    let _outbox = attach_peer(&log, 1, 4);

    let reader = session.clone();
    let read = tokio::spawn(async move {
        let opts = ReadOptions {
            if_available: true,
            ..ReadOptions::default()
        };
        reader.logs.read("log", "r1", 2, opts).await
    });
    tokio::time::sleep(SETTLE).await;
    assert!(!read.is_finished());

    log.on_remote_block(&PeerKey([1; 32]), 2, b"remote".to_vec())
        .unwrap();
    let result = tokio::time::timeout(RESOLVE, read).await.unwrap().unwrap();
    assert_eq!(result.unwrap(), b"remote".to_vec());
}

#[tokio::test]
async fn test_update_waits_for_growth() {
    let hub = test_hub();
    let (session, _rx, log) = session_with_log(&hub, named("alpha")).await;

    let updater = session.clone();
    let update = tokio::spawn(async move {
        updater
            .logs
            .update(
                "log",
                UpdateOptions {
                    min_length: Some(2),
                    ..UpdateOptions::default()
                },
            )
            .await
    });
    tokio::time::sleep(SETTLE).await;
    log.append(vec![b"a".to_vec()]).unwrap();
    tokio::time::sleep(SETTLE).await;
    assert!(!update.is_finished());

    log.append(vec![b"bc".to_vec()]).unwrap();
    let outcome = tokio::time::timeout(RESOLVE, update)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(
        outcome,
        UpdateOutcome {
            length: 2,
            byte_length: 3,
            updated: true
        }
    );
}

#[tokio::test]
async fn test_update_if_available_without_remote_length() {
    let hub = test_hub();
    let key = LogKey([4; 32]);
    let (session, _rx, log) = session_with_log(&hub, replica_of(key)).await;
    let _outbox = attach_peer(&log, 1, 0);

    let outcome = tokio::time::timeout(
        RESOLVE,
        session.logs.update(
            "log",
            UpdateOptions {
                if_available: true,
                min_length: None,
            },
        ),
    )
    .await
    .unwrap()
    .unwrap();
    assert!(!outcome.updated);
    assert_eq!(outcome.length, 0);
    assert_eq!(session.state().resource_count(), 3);
}

#[tokio::test]
async fn test_seek_local_and_past_end() {
    let hub = test_hub();
    let (session, _rx, log) = session_with_log(&hub, named("alpha")).await;
    log.append(vec![b"abcd".to_vec(), b"efg".to_vec(), b"hijkl".to_vec()])
        .unwrap();

    let position = session
        .logs
        .seek("log", 5, SeekOptions::default())
        .await
        .unwrap();
    assert_eq!(position.seq, 1);
    assert_eq!(position.block_offset, 1);

    let no_wait = SeekOptions {
        wait: false,
        if_available: false,
    };
    assert_eq!(
        session.logs.seek("log", 12, no_wait).await,
        Err(HubError::NotAvailable)
    );

    let seeker = session.clone();
    let waiting = tokio::spawn(async move {
        seeker
            .logs
            .seek("log", 13, SeekOptions::default())
            .await
    });
    tokio::time::sleep(SETTLE).await;
    log.append(vec![b"mnop".to_vec()]).unwrap();
    let position = tokio::time::timeout(RESOLVE, waiting)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(position.seq, 3);
    assert_eq!(position.block_offset, 1);
}

#[tokio::test]
async fn test_seek_fetches_missing_blocks() {
    let hub = test_hub();
    let key = LogKey([6; 32]);
    let (session, _rx, log) = session_with_log(&hub, replica_of(key)).await;
    let peer = PeerKey([1; 32]);
    let _outbox = attach_peer(&log, 1, 2);
    log.on_remote_length(&peer, 2).unwrap();

    let seeker = session.clone();
    let seek = tokio::spawn(async move {
        seeker
            .logs
            .seek("log", 4, SeekOptions::default())
            .await
    });
    tokio::time::sleep(SETTLE).await;
    log.on_remote_block(&peer, 0, b"abc".to_vec()).unwrap();
    tokio::time::sleep(SETTLE).await;
    log.on_remote_block(&peer, 1, b"defg".to_vec()).unwrap();

    let position = tokio::time::timeout(RESOLVE, seek)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(position.seq, 1);
    assert_eq!(position.block_offset, 1);
}

#[tokio::test]
async fn test_exists_and_downloaded() {
    let hub = test_hub();
    let (session, _rx, log) = session_with_log(&hub, named("alpha")).await;
    log.append(vec![b"abcd".to_vec(), b"efg".to_vec()]).unwrap();

    assert!(session.logs.exists("log", 1).await.unwrap());
    assert!(!session.logs.exists("log", 2).await.unwrap());
    assert_eq!(session.logs.downloaded("log", 0, None).unwrap(), 7);
    assert_eq!(session.logs.downloaded("log", 1, Some(2)).unwrap(), 3);
    session
        .logs
        .download("log", "dl", DownloadRange::bounded(0, 2))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_append_to_replica_fails() {
    let hub = test_hub();
    let key = LogKey([8; 32]);
    let (session, _rx, _log) = session_with_log(&hub, replica_of(key)).await;
    assert_eq!(
        session.logs.append("log", vec![b"x".to_vec()]),
        Err(HubError::NotWritable)
    );
}

#[tokio::test]
async fn test_lock_misuse() {
    let hub = test_hub();
    let (session, _rx, _log) = session_with_log(&hub, named("alpha")).await;

    assert_eq!(session.logs.release_lock("log"), Err(HubError::NotLocked));
    session.logs.acquire_lock("log").await.unwrap();
    assert_eq!(
        session.logs.acquire_lock("log").await,
        Err(HubError::DuplicateResource {
            id: lock_resource_id("log")
        })
    );
    session.logs.release_lock("log").unwrap();
    assert!(!session.state().has_resource(&lock_resource_id("log")));
    session.logs.acquire_lock("log").await.unwrap();
}

#[tokio::test]
async fn test_extensions_receive_and_send() {
    let hub = test_hub();
    let (session, mut rx, log) = session_with_log(&hub, named("alpha")).await;
    let mut outbox = attach_peer(&log, 2, 0);

    session.logs.register_extension("log", "ext-1", "chat").unwrap();
    session.logs.register_extension("log", "ext-2", "chat").unwrap();
    log.on_extension_message(&PeerKey([2; 32]), "chat", b"hi");

    let events = pushed_events(&mut rx);
    assert_eq!(events.len(), 2);
    assert!(events.contains(&ClientEvent::Extension {
        id: "log".to_string(),
        resource_id: "ext-1".to_string(),
        remote_public_key: PeerKey([2; 32]),
        data: b"hi".to_vec(),
    }));

    assert_eq!(
        session.logs.send_extension("log", "ext-1", None, b"all").unwrap(),
        1
    );
    assert_eq!(
        session
            .logs
            .send_extension("log", "ext-1", Some(PeerKey([3; 32])), b"nobody")
            .unwrap(),
        0
    );
    assert_eq!(
        outbox.try_recv().unwrap(),
        PeerMessage::Extension {
            name: "chat".to_string(),
            data: b"all".to_vec()
        }
    );

    session.logs.unregister_extension("log", "ext-1").unwrap();
    assert_eq!(
        session.logs.unregister_extension("log", "ext-1"),
        Err(HubError::unknown_resource("ext-1"))
    );
    log.on_extension_message(&PeerKey([2; 32]), "chat", b"again");
    assert_eq!(pushed_events(&mut rx).len(), 1);
    assert!(matches!(
        session.logs.send_extension("log", "ext-1", None, b"x"),
        Err(HubError::UnknownResource { .. })
    ));
    assert!(matches!(
        session.logs.register_extension("log", "ext-3", ""),
        Err(HubError::InvalidArgument { .. })
    ));
}

#[tokio::test]
async fn test_send_extension_requires_extension_resource() {
    let hub = test_hub();
    let (session, _rx, _log) = session_with_log(&hub, named("alpha")).await;
    session.logs.watch("log", WatchKind::Downloads).unwrap();
    assert!(matches!(
        session.logs.send_extension("log", "@loghub/download-log", None, b"x"),
        Err(HubError::InvalidArgument { .. })
    ));
}

#[tokio::test]
async fn test_watch_is_idempotent() {
    let hub = test_hub();
    let key = LogKey([7; 32]);
    let (session, mut rx, log) = session_with_log(&hub, replica_of(key)).await;
    let before = session.state().resource_count();

    session.logs.watch("log", WatchKind::Downloads).unwrap();
    session.logs.watch("log", WatchKind::Downloads).unwrap();
    assert_eq!(session.state().resource_count(), before + 1);

    let peer = PeerKey([1; 32]);
    let _outbox = attach_peer(&log, 1, 1);
    log.on_remote_block(&peer, 0, b"abc".to_vec()).unwrap();
    let downloads: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
        .filter(|e| matches!(e, ClientEvent::Download { .. }))
        .collect();
    assert_eq!(
        downloads,
        vec![ClientEvent::Download {
            id: "log".to_string(),
            seq: 0,
            byte_length: 3
        }]
    );

    session.logs.unwatch("log", WatchKind::Downloads).unwrap();
    assert_eq!(session.state().resource_count(), before);
}
