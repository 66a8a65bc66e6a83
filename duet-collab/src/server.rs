//! WebSocket relay with room-based document routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Room ("lobby") ── Yrs Doc ── BroadcastGroup
//! Client B ──┘         │                           │
//!                      └── last awareness per peer  ├──▶ Client A
//!                                                   └──▶ Client B
//! ```
//!
//! Each room keeps:
//! - a Yrs `Doc` holding the authoritative merged state
//! - a `BroadcastGroup` for fan-out
//! - the last join and selection payload of every peer, replayed to newcomers
//!
//! Rooms live only as long as someone is connected to them. Joining and
//! leaving both happen under the write lock of the room table, so a room is
//! never removed while a peer is on its way in.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{ReadTxn, StateVector, Transact, Update};

use crate::broadcast::BroadcastGroup;
use crate::presence::AwarenessMessage;
use crate::protocol::{MessageType, PeerInfo, SyncMessage};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Connections beyond this many per room are closed after the join.
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room.
    pub broadcast_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
}

/// Last awareness frames seen from one peer, kept encoded.
#[derive(Default)]
struct PresenceCache {
    join: Option<Arc<Vec<u8>>>,
    selection: Option<Arc<Vec<u8>>>,
}

impl PresenceCache {
    fn frames(&self) -> impl Iterator<Item = &Arc<Vec<u8>>> {
        self.join.iter().chain(self.selection.iter())
    }
}

struct DocumentRoom {
    doc: yrs::Doc,
    broadcast: Arc<BroadcastGroup>,
    presence: HashMap<Uuid, PresenceCache>,
}

impl DocumentRoom {
    fn new(capacity: usize) -> Self {
        Self {
            doc: yrs::Doc::new(),
            broadcast: Arc::new(BroadcastGroup::new(capacity)),
            presence: HashMap::new(),
        }
    }

    /// Applies an update to the authoritative doc. Returns false if the
    /// payload did not decode or apply.
    fn apply_update(&self, payload: &[u8]) -> bool {
        let update = match Update::decode_v1(payload) {
            Ok(update) => update,
            Err(e) => {
                log::warn!("Dropping undecodable update: {e}");
                return false;
            }
        };
        let mut txn = self.doc.transact_mut();
        match txn.apply_update(update) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Dropping update that failed to apply: {e}");
                false
            }
        }
    }

    fn diff(&self, state_vector: &[u8]) -> Option<Vec<u8>> {
        let remote = StateVector::decode_v1(state_vector).ok()?;
        let txn = self.doc.transact();
        Some(txn.encode_diff_v1(&remote))
    }

    fn state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }
}

/// Everything a connection handler needs from the relay.
#[derive(Clone)]
struct Shared {
    config: ServerConfig,
    rooms: Arc<RwLock<HashMap<String, DocumentRoom>>>,
    stats: Arc<RwLock<ServerStats>>,
}

impl Shared {
    fn new(config: ServerConfig) -> Self {
        Self {
            config,
            rooms: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }
}

/// Where a connection is after its handshake.
struct Membership {
    peer_id: Uuid,
    room: String,
    rx: broadcast::Receiver<Arc<Vec<u8>>>,
}

/// The sync relay.
pub struct SyncServer {
    shared: Shared,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            shared: Shared::new(config),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Binds the configured address and serves until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serves connections from an already bound listener. Dropping the
    /// returned future closes every connection it accepted.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        log::info!("Relay listening on {}", listener.local_addr()?);

        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    log::debug!("New TCP connection from {addr}");

                    let shared = self.shared.clone();
                    connections.spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, shared).await {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }

                Some(finished) = connections.join_next() => {
                    if let Err(e) = finished {
                        log::error!("Connection task failed: {e}");
                    }
                }
            }
        }
    }

    pub async fn stats(&self) -> ServerStats {
        self.shared.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.shared.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    pub async fn room_count(&self) -> usize {
        self.shared.rooms.read().await.len()
    }

    pub async fn active_rooms(&self) -> Vec<String> {
        self.shared.rooms.read().await.keys().cloned().collect()
    }
}

async fn send(
    sink: &mut (impl Sink<Message, Error = WsError> + Unpin),
    msg: &SyncMessage,
) -> Result<(), BoxError> {
    sink.send(Message::Binary(msg.encode()?.into())).await?;
    Ok(())
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, shared: Shared) -> Result<(), BoxError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    log::info!("WebSocket connection established from {addr}");
    {
        let mut s = shared.stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    let mut membership: Option<Membership> = None;
    let result: Result<(), BoxError> = async {
        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let sync_msg = match SyncMessage::decode(&data) {
                                Ok(m) => m,
                                Err(e) => {
                                    log::warn!("Failed to decode message from {addr}: {e}");
                                    continue;
                                }
                            };
                            {
                                let mut s = shared.stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += data.len() as u64;
                            }

                            match sync_msg.msg_type {
                                MessageType::PeerJoined => {
                                    if membership.is_some() {
                                        log::warn!("Duplicate join from {addr}, ignoring");
                                        continue;
                                    }
                                    match join(&shared, &sync_msg, &mut ws_sender).await? {
                                        Some(joined) => membership = Some(joined),
                                        None => {
                                            ws_sender.send(Message::Close(None)).await?;
                                            break;
                                        }
                                    }
                                }
                                _ => match membership.as_ref() {
                                    Some(member) => {
                                        handle_message(&shared, member, sync_msg, &mut ws_sender).await?;
                                    }
                                    None => {
                                        log::debug!("{:?} from {addr} before join, ignoring", sync_msg.msg_type);
                                    }
                                },
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                msg = async {
                    match membership.as_mut() {
                        Some(member) => member.rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    match msg {
                        Ok(data) => {
                            let own = matches!(
                                (SyncMessage::decode(&data), membership.as_ref()),
                                (Ok(m), Some(member)) if m.peer_id == member.peer_id
                            );
                            if !own {
                                ws_sender.send(Message::Binary(data.to_vec().into())).await?;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Peer at {addr} lagged by {n} messages");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
        Ok(())
    }
    .await;

    if let Some(member) = membership {
        leave(&shared, member).await;
    }
    shared.stats.write().await.active_connections -= 1;

    result
}

/// Registers the peer in its room. Returns `None` when the room is full.
async fn join(
    shared: &Shared,
    msg: &SyncMessage,
    ws_sender: &mut (impl Sink<Message, Error = WsError> + Unpin),
) -> Result<Option<Membership>, BoxError> {
    let info = msg
        .peer_info()
        .unwrap_or_else(|_| PeerInfo::with_id(msg.peer_id, "anonymous"));

    let (group, rx, replay) = {
        let mut rooms = shared.rooms.write().await;
        let present = match rooms.get(&msg.room) {
            Some(room) => room.broadcast.peer_count().await,
            None => 0,
        };
        if present >= shared.config.max_peers_per_room {
            log::warn!("Room {} is full, rejecting {}", msg.room, info.name);
            shared.stats.write().await.rejected_connections += 1;
            return Ok(None);
        }
        let room = rooms
            .entry(msg.room.clone())
            .or_insert_with(|| DocumentRoom::new(shared.config.broadcast_capacity));
        let rx = room.broadcast.add_peer(info.clone()).await;
        let replay: Vec<Arc<Vec<u8>>> = room.presence.values().flat_map(PresenceCache::frames).cloned().collect();
        let group = room.broadcast.clone();
        shared.stats.write().await.active_rooms = rooms.len();
        (group, rx, replay)
    };

    let member = Membership {
        peer_id: info.peer_id,
        room: msg.room.clone(),
        rx,
    };
    let announced: Result<(), BoxError> = async {
        for frame in replay {
            ws_sender.send(Message::Binary(frame.to_vec().into())).await?;
        }
        group.broadcast(&SyncMessage::peer_joined(msg.room.clone(), &info)?)?;
        Ok(())
    }
    .await;
    // Registered peers must leave again even if the handshake broke off.
    if let Err(e) = announced {
        leave(shared, member).await;
        return Err(e);
    }

    log::info!("Peer {} ({}) joined room {}", info.name, info.peer_id, msg.room);
    Ok(Some(member))
}

async fn handle_message(
    shared: &Shared,
    member: &Membership,
    msg: SyncMessage,
    ws_sender: &mut (impl Sink<Message, Error = WsError> + Unpin),
) -> Result<(), BoxError> {
    match msg.msg_type {
        MessageType::SyncStep1 => {
            let replies = {
                let rooms = shared.rooms.read().await;
                rooms
                    .get(&member.room)
                    .and_then(|room| room.diff(&msg.payload).map(|diff| (diff, room.state_vector())))
            };
            match replies {
                Some((diff, state_vector)) => {
                    send(ws_sender, &SyncMessage::sync_step2(Uuid::nil(), member.room.clone(), diff)).await?;
                    send(ws_sender, &SyncMessage::sync_step1(Uuid::nil(), member.room.clone(), state_vector)).await?;
                }
                None => log::warn!("Bad state vector from {}", member.peer_id),
            }
        }

        MessageType::SyncStep2 | MessageType::Delta => {
            // A client's SyncStep2 carries what the relay lacked; others only
            // need it when it is not empty.
            let empty = Update::decode_v1(&msg.payload).map(|u| u.is_empty()).unwrap_or(false);
            let group = {
                let rooms = shared.rooms.read().await;
                match rooms.get(&member.room) {
                    Some(room) if room.apply_update(&msg.payload) => Some(room.broadcast.clone()),
                    _ => None,
                }
            };
            if let Some(group) = group {
                if msg.msg_type == MessageType::Delta || !empty {
                    let fanned = SyncMessage::delta(msg.peer_id, msg.room, msg.clock, msg.payload);
                    group.broadcast(&fanned)?;
                }
            }
        }

        MessageType::Awareness => {
            let group = {
                let mut rooms = shared.rooms.write().await;
                let Some(room) = rooms.get_mut(&member.room) else {
                    return Ok(());
                };
                match AwarenessMessage::decode(&msg.payload) {
                    Ok(AwarenessMessage::Join { record }) => {
                        log::info!("Presence: {} joined room {}", record.name, member.room);
                        room.presence.entry(msg.peer_id).or_default().join = Some(Arc::new(msg.encode()?));
                    }
                    Ok(AwarenessMessage::Selection { .. }) => {
                        log::trace!("Presence: selection update in room {}", member.room);
                        room.presence.entry(msg.peer_id).or_default().selection = Some(Arc::new(msg.encode()?));
                    }
                    Ok(AwarenessMessage::Leave { client_id }) => {
                        log::info!("Presence: {} left room {}", client_id, member.room);
                        room.presence.remove(&msg.peer_id);
                    }
                    Err(e) => log::debug!("Opaque awareness payload from {}: {e}", msg.peer_id),
                }
                room.broadcast.clone()
            };
            group.broadcast(&msg)?;
        }

        MessageType::Ping => {
            send(ws_sender, &SyncMessage::pong(member.peer_id)).await?;
        }

        other => log::debug!("Unhandled message type: {other:?}"),
    }
    Ok(())
}

async fn leave(shared: &Shared, member: Membership) {
    let Membership { peer_id, room, rx } = member;
    drop(rx);

    let mut rooms = shared.rooms.write().await;
    let empty = match rooms.get_mut(&room) {
        Some(state) => {
            state.broadcast.remove_peer(&peer_id).await;
            state.presence.remove(&peer_id);
            if let Err(e) = state.broadcast.broadcast(&SyncMessage::peer_left(peer_id, room.clone())) {
                log::error!("Failed to announce departure of {peer_id}: {e}");
            }
            state.broadcast.peer_count().await == 0
        }
        None => false,
    };
    if empty {
        rooms.remove(&room);
        log::info!("Room {room} removed (empty)");
    }
    shared.stats.write().await.active_rooms = rooms.len();
    log::info!("Peer {peer_id} left room {room}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use yrs::{GetString, Text, WriteTxn};

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.max_peers_per_room, 100);
        assert_eq!(config.broadcast_capacity, 256);
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = SyncServer::with_defaults();
        assert_eq!(server.stats().await, ServerStats::default());
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
        assert_eq!(server.room_count().await, 0);
        assert!(server.active_rooms().await.is_empty());
    }

    #[test]
    fn test_room_diff_and_apply() {
        let source = yrs::Doc::new();
        {
            let mut txn = source.transact_mut();
            let text = txn.get_or_insert_text("t");
            text.insert(&mut txn, 0, "relayed");
        }
        let update = source.transact().encode_state_as_update_v1(&StateVector::default());

        let room = DocumentRoom::new(4);
        assert!(room.apply_update(&update));
        assert!(!room.apply_update(&[0xFF, 0x01]));

        let empty_sv = StateVector::default().encode_v1();
        let diff = room.diff(&empty_sv).unwrap();
        let copy = yrs::Doc::new();
        {
            let mut txn = copy.transact_mut();
            txn.apply_update(Update::decode_v1(&diff).unwrap()).unwrap();
        }
        let text = copy.get_or_insert_text("t");
        assert_eq!(text.get_string(&copy.transact()), "relayed");

        // Nothing left to send to a peer that has everything.
        let full = room.diff(&room.state_vector()).unwrap();
        assert!(Update::decode_v1(&full).unwrap().is_empty());
    }

    fn discard() -> impl Sink<Message, Error = WsError> + Unpin {
        futures_util::sink::drain::<Message>().sink_map_err(|never| -> WsError { match never {} })
    }

    fn joining(room: &str) -> SyncMessage {
        SyncMessage::peer_joined(room.to_string(), &PeerInfo::new("peer")).unwrap()
    }

    #[tokio::test]
    async fn test_rejoin_while_last_peer_leaves_shares_one_group() {
        let shared = Shared::new(ServerConfig::default());
        let mut sink = discard();

        let first = join(&shared, &joining("again"), &mut sink).await.unwrap().unwrap();
        let rejoin = joining("again");
        let (_, second) = tokio::join!(leave(&shared, first), join(&shared, &rejoin, &mut sink));
        let second = second.unwrap().unwrap();
        let mut third = join(&shared, &joining("again"), &mut sink).await.unwrap().unwrap();
        assert_eq!(shared.rooms.read().await.len(), 1);

        let source = yrs::Doc::new();
        {
            let mut txn = source.transact_mut();
            let text = txn.get_or_insert_text("t");
            text.insert(&mut txn, 0, "still shared");
        }
        let update = source.transact().encode_state_as_update_v1(&StateVector::default());
        let delta = SyncMessage::delta(second.peer_id, "again", 1, update);
        handle_message(&shared, &second, delta, &mut sink).await.unwrap();

        let relayed = tokio::time::timeout(std::time::Duration::from_secs(1), async {
            loop {
                let frame = third.rx.recv().await.unwrap();
                let msg = SyncMessage::decode(&frame).unwrap();
                if msg.msg_type == MessageType::Delta {
                    return msg;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(relayed.peer_id, second.peer_id);
    }

    #[tokio::test]
    async fn test_last_leave_removes_room_and_full_room_rejects() {
        let shared = Shared::new(ServerConfig {
            max_peers_per_room: 1,
            ..ServerConfig::default()
        });
        let mut sink = discard();

        let only = join(&shared, &joining("tiny"), &mut sink).await.unwrap().unwrap();
        assert!(join(&shared, &joining("tiny"), &mut sink).await.unwrap().is_none());
        assert_eq!(shared.stats.read().await.rejected_connections, 1);

        leave(&shared, only).await;
        assert!(shared.rooms.read().await.is_empty());
        assert_eq!(shared.stats.read().await.active_rooms, 0);
        assert!(join(&shared, &joining("tiny"), &mut sink).await.unwrap().is_some());
    }

    #[test]
    fn test_presence_cache_order() {
        let cache = PresenceCache {
            join: Some(Arc::new(vec![1])),
            selection: Some(Arc::new(vec![2])),
        };
        let frames: Vec<u8> = cache.frames().map(|f| f[0]).collect();
        assert_eq!(frames, vec![1, 2]);
        assert_eq!(PresenceCache::default().frames().count(), 0);
    }
}
