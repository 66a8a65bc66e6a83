//! Binary protocol between sync clients and the relay.
//!
//! Wire format (bincode-encoded, binary WebSocket frames only):
//! ```text
//! ┌──────────┬───────────┬───────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ room      │ clock    │ payload  │
//! │ 1 byte   │ 16 bytes  │ len + utf8│ varint   │ variable │
//! └──────────┴───────────┴───────────┴──────────┴──────────┘
//! ```
//!
//! Document payloads are yrs v1 updates or state vectors. Awareness payloads
//! are encoded [`crate::presence::AwarenessMessage`]s; the relay only looks
//! inside them to track joins and leaves.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Yrs state vector; the receiver answers with a `SyncStep2`.
    SyncStep1 = 1,
    /// Yrs update holding what the requester lacks.
    SyncStep2 = 2,
    /// Incremental update from a local transaction.
    Delta = 3,
    /// Presence payload.
    Awareness = 4,
    PeerJoined = 5,
    PeerLeft = 6,
    Ping = 7,
    Pong = 8,
}

/// Peer identity announced when joining a room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerInfo {
    pub peer_id: Uuid,
    pub name: String,
}

impl PeerInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), name)
    }

    pub fn with_id(peer_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            peer_id,
            name: name.into(),
        }
    }
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    pub room: String,
    /// Lamport clock; only meaningful on deltas and awareness.
    pub clock: u64,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn new(msg_type: MessageType, peer_id: Uuid, room: impl Into<String>, clock: u64, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            peer_id,
            room: room.into(),
            clock,
            payload,
        }
    }

    pub fn delta(peer_id: Uuid, room: impl Into<String>, clock: u64, update: Vec<u8>) -> Self {
        Self::new(MessageType::Delta, peer_id, room, clock, update)
    }

    pub fn sync_step1(peer_id: Uuid, room: impl Into<String>, state_vector: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep1, peer_id, room, 0, state_vector)
    }

    pub fn sync_step2(peer_id: Uuid, room: impl Into<String>, update: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep2, peer_id, room, 0, update)
    }

    pub fn awareness(peer_id: Uuid, room: impl Into<String>, clock: u64, payload: Vec<u8>) -> Self {
        Self::new(MessageType::Awareness, peer_id, room, clock, payload)
    }

    pub fn peer_joined(room: impl Into<String>, info: &PeerInfo) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::PeerJoined, info.peer_id, room, 0, encode_payload(info)?))
    }

    pub fn peer_left(peer_id: Uuid, room: impl Into<String>) -> Self {
        Self::new(MessageType::PeerLeft, peer_id, room, 0, Vec::new())
    }

    pub fn ping(peer_id: Uuid) -> Self {
        Self::new(MessageType::Ping, peer_id, String::new(), 0, Vec::new())
    }

    pub fn pong(peer_id: Uuid) -> Self {
        Self::new(MessageType::Pong, peer_id, String::new(), 0, Vec::new())
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_payload(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_payload(bytes)
    }

    /// Parse the payload of a `PeerJoined` message.
    pub fn peer_info(&self) -> Result<PeerInfo, ProtocolError> {
        if self.msg_type != MessageType::PeerJoined {
            return Err(ProtocolError::InvalidMessageType(self.msg_type));
        }
        decode_payload(&self.payload)
    }
}

pub(crate) fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

pub(crate) fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(value)
}

/// Wire and connection errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("unexpected message type {0:?}")]
    InvalidMessageType(MessageType),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("connection closed")]
    ConnectionClosed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delta_roundtrip() {
        let peer = Uuid::new_v4();
        let msg = SyncMessage::delta(peer, "lobby", 42, vec![1, 2, 3, 4, 5]);
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.room, "lobby");
        assert_eq!(decoded.clock, 42);
    }

    #[test]
    fn test_peer_joined_payload() {
        let info = PeerInfo::new("user_a1b2c3");
        let msg = SyncMessage::peer_joined("lobby", &info).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.msg_type, MessageType::PeerJoined);
        assert_eq!(decoded.peer_id, info.peer_id);
        assert_eq!(decoded.peer_info().unwrap(), info);
    }

    #[test]
    fn test_peer_info_wrong_type() {
        let msg = SyncMessage::ping(Uuid::new_v4());
        assert_eq!(
            msg.peer_info(),
            Err(ProtocolError::InvalidMessageType(MessageType::Ping))
        );
    }

    #[test]
    fn test_decode_garbage() {
        assert!(matches!(
            SyncMessage::decode(&[0xFF, 0xFE, 0xFD]),
            Err(ProtocolError::Deserialization(_))
        ));
    }

    #[test]
    fn test_small_delta_stays_small() {
        let msg = SyncMessage::delta(Uuid::new_v4(), "room-1", 1, vec![0u8; 50]);
        let encoded = msg.encode().unwrap();
        assert!(encoded.len() < 100, "encoded size {} too large", encoded.len());
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::SyncStep1 as u8, 1);
        assert_eq!(MessageType::Delta as u8, 3);
        assert_eq!(MessageType::Pong as u8, 8);
    }
}
