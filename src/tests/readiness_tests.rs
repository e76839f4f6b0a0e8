//! Tests for the replication readiness heuristic.

use super::*;
use crate::store::{LogKey, PeerInfo, PeerKey};
use crate::swarm::{JoinOptions, LocalSwarm};
use std::time::Duration;
use tokio::sync::mpsc;

const SETTLE: Duration = Duration::from_millis(50);
const RELEASE: Duration = Duration::from_secs(2);

fn setup() -> (Arc<LocalSwarm>, Arc<ReadinessTracker>, Arc<Log>) {
    let swarm = Arc::new(LocalSwarm::manual());
    let tracker = ReadinessTracker::new(swarm.clone());
    tracker.spawn_flush_listener();
    let log = Log::new(LogKey([5; 32]), false);
    (swarm, tracker, log)
}

fn attach_peer(log: &Log, byte: u8) {
    let (tx, _rx) = mpsc::unbounded_channel();
    log.add_peer(
        PeerInfo {
            remote_public_key: PeerKey([byte; 32]),
            remote_address: "127.0.0.1:9000".to_string(),
            remote_length: 0,
            remote_opened: true,
        },
        tx,
    )
    .unwrap();
}

async fn still_pending(gate: Gate) -> Gate {
    let Gate::Pending(mut rx) = gate else {
        panic!("gate opened too early");
    };
    tokio::time::sleep(SETTLE).await;
    assert!(rx.try_recv().is_err(), "gate opened too early");
    Gate::Pending(rx)
}

#[tokio::test]
async fn test_untracked_log_is_always_ready() {
    let (_swarm, tracker, log) = setup();
    assert!(tracker.read_gate(&log).is_ready());
    assert!(tracker.update_gate(&log).is_ready());
}

#[tokio::test]
async fn test_read_released_when_joined_topic_flushes() {
    let (swarm, tracker, log) = setup();
    swarm
        .configure(log.discovery_key(), JoinOptions::announce())
        .await
        .unwrap();
    tracker.track(&log);

    let gate = still_pending(tracker.read_gate(&log)).await;
    assert!(swarm.settle(&log.discovery_key()));
    tokio::time::timeout(RELEASE, gate.wait()).await.unwrap();

    assert!(tracker.read_gate(&log).is_ready());
}

#[tokio::test]
async fn test_update_released_by_peer_before_flush() {
    let (swarm, tracker, log) = setup();
    swarm
        .configure(log.discovery_key(), JoinOptions::announce())
        .await
        .unwrap();
    tracker.track(&log);

    let read = tracker.read_gate(&log);
    let update = tracker.update_gate(&log);
    attach_peer(&log, 1);
    tokio::time::timeout(RELEASE, update.wait()).await.unwrap();

    // Reads still wait for discovery to finish.
    let read = still_pending(read).await;
    assert!(tracker.update_gate(&log).is_ready());
    swarm.settle(&log.discovery_key());
    tokio::time::timeout(RELEASE, read.wait()).await.unwrap();
}

#[tokio::test]
async fn test_global_flush_releases_unjoined_log() {
    let (swarm, tracker, log) = setup();
    tracker.track(&log);

    let read = still_pending(tracker.read_gate(&log)).await;
    let update = tracker.update_gate(&log);
    swarm.settle_global();

    tokio::time::timeout(RELEASE, read.wait()).await.unwrap();
    tokio::time::timeout(RELEASE, update.wait()).await.unwrap();
    assert!(tracker.read_gate(&log).is_ready());
    assert!(tracker.update_gate(&log).is_ready());
}

#[tokio::test]
async fn test_late_join_waits_for_its_own_flush() {
    let (swarm, tracker, log) = setup();
    tracker.track(&log);
    swarm
        .configure(log.discovery_key(), JoinOptions::announce())
        .await
        .unwrap();

    let read = tracker.read_gate(&log);
    swarm.settle_global();
    let read = still_pending(read).await;
    assert!(!tracker.read_gate(&log).is_ready());

    swarm.settle(&log.discovery_key());
    tokio::time::timeout(RELEASE, read.wait()).await.unwrap();
}

#[tokio::test]
async fn test_track_is_idempotent_and_close_untracks() {
    let (_swarm, tracker, log) = setup();
    tracker.track(&log);
    tracker.track(&log);
    assert!(tracker.is_tracked(&log.discovery_key()));

    let read = tracker.read_gate(&log);
    assert!(!read.is_ready());
    log.close();
    assert!(!tracker.is_tracked(&log.discovery_key()));
    tokio::time::timeout(RELEASE, read.wait()).await.unwrap();
}

#[tokio::test]
async fn test_auto_settling_swarm_is_ready_quickly() {
    let swarm = Arc::new(LocalSwarm::new());
    let tracker = ReadinessTracker::new(swarm.clone());
    tracker.spawn_flush_listener();
    let log = Log::new(LogKey([6; 32]), true);
    tracker.track(&log);

    tokio::time::timeout(RELEASE, tracker.read_gate(&log).wait())
        .await
        .unwrap();
}
