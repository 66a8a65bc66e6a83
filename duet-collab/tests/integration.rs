//! Integration tests for the relay and raw sync clients.
//!
//! These tests start a real relay and connect real clients, verifying the
//! state vector handshake and delta fan-out.

use duet_collab::broadcast::BroadcastGroup;
use duet_collab::client::{ConnectionState, SyncClient, SyncEvent};
use duet_collab::protocol::PeerInfo;
use duet_collab::server::{ServerConfig, SyncServer};
use std::sync::Arc;
use tokio::sync::mpsc::Receiver;
use tokio::time::{timeout, Duration};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{GetString, ReadTxn, StateVector, Text, Transact, Update};

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a relay on a free port, return the port.
async fn start_test_server(max_peers_per_room: usize) -> u16 {
    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        max_peers_per_room,
        broadcast_capacity: 64,
    };
    let server = SyncServer::new(config);
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    // Give server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    port
}

async fn connect_client(name: &str, room: &str, port: u16) -> (SyncClient, Receiver<SyncEvent>) {
    let mut client = SyncClient::new(PeerInfo::new(name), room, format!("ws://127.0.0.1:{port}"));
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    assert_eq!(
        timeout(Duration::from_secs(1), events.recv()).await.unwrap(),
        Some(SyncEvent::Connected)
    );
    (client, events)
}

/// Waits for the first event matching `pred`, skipping others.
async fn wait_for(events: &mut Receiver<SyncEvent>, pred: impl Fn(&SyncEvent) -> bool) -> SyncEvent {
    timeout(Duration::from_secs(2), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn drain(events: &mut Receiver<SyncEvent>) {
    while let Ok(Some(_)) = timeout(Duration::from_millis(50), events.recv()).await {}
}

fn text_update(content: &str) -> Vec<u8> {
    let doc = yrs::Doc::new();
    let text = doc.get_or_insert_text("t");
    {
        let mut txn = doc.transact_mut();
        text.insert(&mut txn, 0, content);
    }
    let txn = doc.transact();
    txn.encode_state_as_update_v1(&StateVector::default())
}

fn read_text(update: &[u8]) -> String {
    let doc = yrs::Doc::new();
    let text = doc.get_or_insert_text("t");
    {
        let mut txn = doc.transact_mut();
        txn.apply_update(Update::decode_v1(update).unwrap()).unwrap();
    }
    let txn = doc.transact();
    text.get_string(&txn)
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let port = start_test_server(10).await;
    let result = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/lobby")).await;
    assert!(result.is_ok(), "Should connect to relay");
}

#[tokio::test]
async fn test_handshake_reaches_synced() {
    let port = start_test_server(10).await;
    let (client, mut events) = connect_client("Alice", "handshake", port).await;

    client
        .send_state_vector(StateVector::default().encode_v1())
        .await
        .unwrap();

    let synced = wait_for(&mut events, |e| matches!(e, SyncEvent::Synced(_))).await;
    let SyncEvent::Synced(update) = synced else { unreachable!() };
    assert!(Update::decode_v1(&update).unwrap().is_empty());
    wait_for(&mut events, |e| matches!(e, SyncEvent::SyncStep1(_))).await;
    assert_eq!(client.connection_state().await, ConnectionState::Synced);
}

#[tokio::test]
async fn test_delta_broadcast_between_clients() {
    let port = start_test_server(10).await;
    let (client1, mut events1) = connect_client("Alice", "shared", port).await;
    let (_client2, mut events2) = connect_client("Bob", "shared", port).await;

    let joined = wait_for(&mut events1, |e| matches!(e, SyncEvent::PeerJoined(_))).await;
    assert!(matches!(joined, SyncEvent::PeerJoined(info) if info.name == "Bob"));
    drain(&mut events2).await;

    let update = text_update("hello");
    assert_eq!(client1.send_delta(update.clone()).await.unwrap(), 1);

    let event = wait_for(&mut events2, |e| matches!(e, SyncEvent::RemoteDelta { .. })).await;
    let SyncEvent::RemoteDelta { peer_id, clock, update: received } = event else { unreachable!() };
    assert_eq!(peer_id, client1.peer_info().peer_id);
    assert_eq!(clock, 1);
    assert_eq!(received, update);
}

#[tokio::test]
async fn test_late_joiner_receives_room_state() {
    let port = start_test_server(10).await;
    let (client1, _events1) = connect_client("Alice", "late", port).await;
    client1.send_delta(text_update("kept by the relay")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (client2, mut events2) = connect_client("Bob", "late", port).await;
    client2
        .send_state_vector(StateVector::default().encode_v1())
        .await
        .unwrap();

    let SyncEvent::Synced(update) = wait_for(&mut events2, |e| matches!(e, SyncEvent::Synced(_))).await else {
        unreachable!()
    };
    assert_eq!(read_text(&update), "kept by the relay");
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let port = start_test_server(10).await;
    let (client1, _events1) = connect_client("Alice", "room-a", port).await;
    let (_client2, mut events2) = connect_client("Bob", "room-b", port).await;
    drain(&mut events2).await;

    client1.send_delta(text_update("a only")).await.unwrap();

    let leaked = timeout(Duration::from_millis(200), async {
        loop {
            match events2.recv().await {
                Some(SyncEvent::RemoteDelta { .. }) => return true,
                Some(_) => continue,
                None => return false,
            }
        }
    })
    .await;
    assert!(leaked.is_err(), "room-b should not see room-a deltas");
}

#[tokio::test]
async fn test_full_room_closes_connection() {
    let port = start_test_server(1).await;
    let (_client1, _events1) = connect_client("Alice", "tiny", port).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (client2, mut events2) = connect_client("Bob", "tiny", port).await;
    wait_for(&mut events2, |e| *e == SyncEvent::Disconnected).await;
    assert_eq!(client2.connection_state().await, ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_peer_left_on_disconnect() {
    let port = start_test_server(10).await;
    let (_client1, mut events1) = connect_client("Alice", "leaving", port).await;
    let (mut client2, _events2) = connect_client("Bob", "leaving", port).await;
    let bob = client2.peer_info().peer_id;
    wait_for(&mut events1, |e| matches!(e, SyncEvent::PeerJoined(_))).await;

    client2.disconnect().await;
    assert_eq!(client2.connection_state().await, ConnectionState::Disconnected);

    let left = wait_for(&mut events1, |e| matches!(e, SyncEvent::PeerLeft(_))).await;
    assert_eq!(left, SyncEvent::PeerLeft(bob));
}

#[tokio::test]
async fn test_broadcast_group_high_throughput() {
    let group = BroadcastGroup::new(2048);

    let mut receivers = Vec::new();
    for i in 0..100 {
        receivers.push(group.add_peer(PeerInfo::new(format!("Peer{i}"))).await);
    }

    let start = std::time::Instant::now();
    for i in 0..1000u64 {
        group.broadcast_raw(Arc::new(vec![i as u8; 64]));
    }
    let elapsed = start.elapsed();

    assert!(elapsed.as_millis() < 100, "1000 broadcasts took {elapsed:?}");
    assert_eq!(group.stats().await.active_peers, 100);
}

async fn wait_for_rooms(server: &SyncServer, count: usize) {
    timeout(Duration::from_secs(2), async {
        while server.room_count().await != count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for room count");
}

#[tokio::test]
async fn test_room_reopens_after_last_peer_leaves() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = Arc::new(SyncServer::with_defaults());
    let serving = server.clone();
    tokio::spawn(async move {
        serving.serve(listener).await.unwrap();
    });

    let (mut alice, _alice_events) = connect_client("Alice", "reopen", port).await;
    wait_for_rooms(&server, 1).await;
    alice.disconnect().await;
    wait_for_rooms(&server, 0).await;

    let (bob, mut bob_events) = connect_client("Bob", "reopen", port).await;
    let (_carol, mut carol_events) = connect_client("Carol", "reopen", port).await;
    wait_for(&mut bob_events, |e| matches!(e, SyncEvent::PeerJoined(info) if info.name == "Carol")).await;
    assert_eq!(server.active_rooms().await, vec!["reopen".to_string()]);

    bob.send_delta(text_update("after reopen")).await.unwrap();
    let event = wait_for(&mut carol_events, |e| matches!(e, SyncEvent::RemoteDelta { .. })).await;
    let SyncEvent::RemoteDelta { update, .. } = event else { unreachable!() };
    assert_eq!(read_text(&update), "after reopen");
}

#[tokio::test]
async fn test_ping_pong() {
    let port = start_test_server(10).await;
    let (client, _events) = connect_client("PingUser", "ping", port).await;
    client.send_ping().await.unwrap();
}
