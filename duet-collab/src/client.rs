//! WebSocket sync client for connecting to the relay.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect; no automatic reconnect)
//! - State vector exchange and delta send/receive
//! - Awareness updates, dropped while offline
//!
//! The socket is driven by a reader and a writer task. Everything they learn
//! is reported through [`SyncEvent`]s; they never touch editor state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage};

const CHANNEL_CAPACITY: usize = 256;
const CLOSE_TIMEOUT: Duration = Duration::from_millis(500);

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// The relay has answered our state vector at least once.
    Synced,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    Connected,
    Disconnected,
    /// The relay's state vector; answer with the updates it lacks.
    SyncStep1(Vec<u8>),
    /// The relay's answer to our state vector.
    Synced(Vec<u8>),
    RemoteDelta {
        peer_id: Uuid,
        clock: u64,
        update: Vec<u8>,
    },
    RemoteAwareness {
        peer_id: Uuid,
        payload: Vec<u8>,
    },
    PeerJoined(PeerInfo),
    PeerLeft(Uuid),
}

/// The sync client.
pub struct SyncClient {
    peer_info: PeerInfo,
    room: String,
    state: Arc<RwLock<ConnectionState>>,
    /// Lamport clock for outgoing deltas.
    clock: Arc<AtomicU64>,
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    event_tx: mpsc::Sender<SyncEvent>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
    server_url: String,
}

impl SyncClient {
    pub fn new(peer_info: PeerInfo, room: impl Into<String>, server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(CHANNEL_CAPACITY);
        Self {
            peer_info,
            room: room.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            clock: Arc::new(AtomicU64::new(0)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            reader: None,
            writer: None,
            server_url: server_url.into(),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connects to `<server_url>/<room>` and announces this peer.
    ///
    /// On failure the state stays `Connecting`; there is no retry.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let url = format!("{}/{}", self.server_url.trim_end_matches('/'), self.room);
        let (ws_stream, _) = tokio_tungstenite::connect_async(&url).await.map_err(|e| {
            log::warn!("Could not connect to {url}: {e}");
            ProtocolError::Connect(e.to_string())
        })?;
        log::info!("Connected to {url} as {}", self.peer_info.name);

        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(CHANNEL_CAPACITY);

        // Writer: forwards the outgoing channel and closes the socket once
        // every sender is gone.
        self.writer = Some(tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        }));

        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let clock = self.clock.clone();
        let peer_id = self.peer_info.peer_id;
        self.reader = Some(tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let sync_msg = match SyncMessage::decode(&data) {
                            Ok(m) => m,
                            Err(e) => {
                                log::warn!("Dropping malformed frame: {e}");
                                continue;
                            }
                        };
                        if sync_msg.peer_id == peer_id {
                            continue;
                        }

                        let event = match sync_msg.msg_type {
                            MessageType::SyncStep1 => Some(SyncEvent::SyncStep1(sync_msg.payload)),
                            MessageType::SyncStep2 => {
                                *state.write().await = ConnectionState::Synced;
                                Some(SyncEvent::Synced(sync_msg.payload))
                            }
                            MessageType::Delta => {
                                clock.fetch_max(sync_msg.clock, Ordering::SeqCst);
                                Some(SyncEvent::RemoteDelta {
                                    peer_id: sync_msg.peer_id,
                                    clock: sync_msg.clock,
                                    update: sync_msg.payload,
                                })
                            }
                            MessageType::Awareness => Some(SyncEvent::RemoteAwareness {
                                peer_id: sync_msg.peer_id,
                                payload: sync_msg.payload,
                            }),
                            MessageType::PeerJoined => match sync_msg.peer_info() {
                                Ok(info) => Some(SyncEvent::PeerJoined(info)),
                                Err(e) => {
                                    log::warn!("Bad peer info: {e}");
                                    None
                                }
                            },
                            MessageType::PeerLeft => Some(SyncEvent::PeerLeft(sync_msg.peer_id)),
                            MessageType::Pong => {
                                log::trace!("pong");
                                None
                            }
                            MessageType::Ping => None,
                        };

                        if let Some(evt) = event {
                            if event_tx.send(evt).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        }));

        let join = SyncMessage::peer_joined(self.room.clone(), &self.peer_info)?;
        out_tx
            .send(join.encode()?)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        self.outgoing_tx = Some(out_tx);

        let _ = self.event_tx.send(SyncEvent::Connected).await;
        Ok(())
    }

    async fn send(&self, msg: SyncMessage) -> Result<(), ProtocolError> {
        let tx = self.outgoing_tx.as_ref().ok_or(ProtocolError::ConnectionClosed)?;
        tx.send(msg.encode()?)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    async fn is_connected(&self) -> bool {
        self.outgoing_tx.is_some() && *self.state.read().await != ConnectionState::Disconnected
    }

    /// Sends our state vector; the relay answers with `Synced` and its own
    /// state vector.
    pub async fn send_state_vector(&self, state_vector: Vec<u8>) -> Result<(), ProtocolError> {
        self.send(SyncMessage::sync_step1(self.peer_info.peer_id, self.room.clone(), state_vector))
            .await
    }

    /// Answers the relay's state vector with the updates it lacks.
    pub async fn send_sync_step2(&self, update: Vec<u8>) -> Result<(), ProtocolError> {
        self.send(SyncMessage::sync_step2(self.peer_info.peer_id, self.room.clone(), update))
            .await
    }

    /// Sends a yrs update. Fails when not connected.
    pub async fn send_delta(&self, update: Vec<u8>) -> Result<u64, ProtocolError> {
        if !self.is_connected().await {
            return Err(ProtocolError::ConnectionClosed);
        }
        let clock = self.clock.fetch_add(1, Ordering::SeqCst) + 1;
        self.send(SyncMessage::delta(self.peer_info.peer_id, self.room.clone(), clock, update))
            .await?;
        Ok(clock)
    }

    /// Sends an encoded awareness message. Silently dropped while offline.
    pub async fn send_awareness(&self, payload: Vec<u8>) -> Result<(), ProtocolError> {
        if !self.is_connected().await {
            return Ok(());
        }
        let clock = self.clock.load(Ordering::SeqCst);
        self.send(SyncMessage::awareness(self.peer_info.peer_id, self.room.clone(), clock, payload))
            .await
    }

    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        self.send(SyncMessage::ping(self.peer_info.peer_id)).await
    }

    /// Closes the socket and stops both tasks.
    pub async fn disconnect(&mut self) {
        // Dropping the only sender lets the writer flush and close.
        self.outgoing_tx = None;
        if let Some(mut writer) = self.writer.take() {
            if tokio::time::timeout(CLOSE_TIMEOUT, &mut writer).await.is_err() {
                writer.abort();
            }
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        *self.state.write().await = ConnectionState::Disconnected;
        log::info!("Disconnected {} from room {}", self.peer_info.name, self.room);
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn peer_info(&self) -> &PeerInfo {
        &self.peer_info
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Current Lamport clock value.
    pub fn clock(&self) -> u64 {
        self.clock.load(Ordering::SeqCst)
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
    }
}
