//! Presence: who is in the room and where their selection is.
//!
//! Presence is ephemeral and best effort. Each client publishes its
//! [`AwarenessRecord`] on join and its selection on every change; receivers
//! keep the latest record per peer and forget peers that leave.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use duet_core::selection::{Point, Range};
use duet_core::{Document, Operation, SelectionObserver};

use crate::protocol::{decode_payload, encode_payload, ProtocolError};

/// Cursor color, always one of [`PALETTE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

const fn rgb(r: u8, g: u8, b: u8) -> CursorColor {
    CursorColor { r, g, b }
}

/// Colors readable both as a caret and as a translucent selection on white.
pub const PALETTE: [CursorColor; 10] = [
    rgb(0xe6, 0x19, 0x4b),
    rgb(0x3c, 0xb4, 0x4b),
    rgb(0x43, 0x63, 0xd8),
    rgb(0xf5, 0x82, 0x31),
    rgb(0x91, 0x1e, 0xb4),
    rgb(0x42, 0x9e, 0xa6),
    rgb(0xf0, 0x32, 0xe6),
    rgb(0x80, 0x80, 0x00),
    rgb(0x9a, 0x63, 0x24),
    rgb(0x00, 0x00, 0x75),
];

impl CursorColor {
    /// Stable palette entry for a client.
    pub fn from_client_id(id: Uuid) -> Self {
        PALETTE[(id.as_u128() % PALETTE.len() as u128) as usize]
    }

    pub fn is_valid(&self) -> bool {
        PALETTE.contains(self)
    }

    pub fn hex(&self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

impl fmt::Display for CursorColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex())
    }
}

/// Display name derived from the client id, e.g. `user_3fa2c1`.
pub fn display_name(id: Uuid) -> String {
    let hex = id.simple().to_string();
    format!("user_{}", &hex[..6])
}

/// What one client publishes about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessRecord {
    pub client_id: Uuid,
    pub name: String,
    pub color: CursorColor,
    pub selection: Option<Range>,
}

impl AwarenessRecord {
    pub fn new(client_id: Uuid) -> Self {
        Self {
            client_id,
            name: display_name(client_id),
            color: CursorColor::from_client_id(client_id),
            selection: None,
        }
    }
}

/// Awareness updates carried inside `MessageType::Awareness` payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AwarenessMessage {
    Join {
        record: AwarenessRecord,
    },
    Selection {
        client_id: Uuid,
        selection: Option<Range>,
        /// Per-sender counter; older updates are dropped.
        clock: u64,
    },
    Leave {
        client_id: Uuid,
    },
}

impl AwarenessMessage {
    pub fn client_id(&self) -> Uuid {
        match self {
            AwarenessMessage::Join { record } => record.client_id,
            AwarenessMessage::Selection { client_id, .. } | AwarenessMessage::Leave { client_id } => *client_id,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_payload(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_payload(bytes)
    }
}

/// A remote selection that resolves in the current document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCursor {
    pub client_id: Uuid,
    pub name: String,
    pub color: CursorColor,
    pub selection: Range,
    pub caret: Point,
}

#[derive(Debug, Clone)]
struct RemotePeer {
    record: AwarenessRecord,
    clock: u64,
}

/// Local record plus the latest record of every remote peer in the room.
pub struct PresenceRoom {
    local: AwarenessRecord,
    clock: u64,
    peers: HashMap<Uuid, RemotePeer>,
    outgoing: Vec<AwarenessMessage>,
}

impl PresenceRoom {
    pub fn new(client_id: Uuid) -> Self {
        Self {
            local: AwarenessRecord::new(client_id),
            clock: 0,
            peers: HashMap::new(),
            outgoing: Vec::new(),
        }
    }

    pub fn local_record(&self) -> &AwarenessRecord {
        &self.local
    }

    pub fn client_id(&self) -> Uuid {
        self.local.client_id
    }

    pub fn join_message(&self) -> AwarenessMessage {
        AwarenessMessage::Join {
            record: self.local.clone(),
        }
    }

    pub fn leave_message(&self) -> AwarenessMessage {
        AwarenessMessage::Leave {
            client_id: self.local.client_id,
        }
    }

    /// Records a local selection change and queues its broadcast.
    pub fn set_local_selection(&mut self, selection: Option<Range>) {
        self.clock += 1;
        self.local.selection = selection.clone();
        self.outgoing.push(AwarenessMessage::Selection {
            client_id: self.local.client_id,
            selection,
            clock: self.clock,
        });
    }

    /// Drains the messages waiting to be sent.
    pub fn take_outgoing(&mut self) -> Vec<AwarenessMessage> {
        std::mem::take(&mut self.outgoing)
    }

    /// Applies a message from the network. Returns whether anything changed.
    pub fn handle_message(&mut self, msg: &AwarenessMessage) -> bool {
        if msg.client_id() == self.local.client_id {
            return false;
        }

        match msg {
            AwarenessMessage::Join { record } => {
                let mut record = record.clone();
                if !record.color.is_valid() {
                    log::debug!("replacing off-palette color from {}", record.client_id);
                    record.color = CursorColor::from_client_id(record.client_id);
                }
                log::debug!("presence: {} joined", record.name);
                self.peers.insert(record.client_id, RemotePeer { record, clock: 0 });
                true
            }
            AwarenessMessage::Selection {
                client_id,
                selection,
                clock,
            } => {
                // Peers seen before their join get a placeholder record.
                let peer = self.peers.entry(*client_id).or_insert_with(|| RemotePeer {
                    record: AwarenessRecord::new(*client_id),
                    clock: 0,
                });
                if *clock <= peer.clock {
                    log::trace!("stale selection from {} ({} <= {})", client_id, clock, peer.clock);
                    return false;
                }
                peer.clock = *clock;
                peer.record.selection = selection.clone();
                log::trace!("presence: {} moved selection", peer.record.name);
                true
            }
            AwarenessMessage::Leave { client_id } => self.peer_left(*client_id),
        }
    }

    /// Forgets a peer, e.g. when the transport reports it gone.
    pub fn peer_left(&mut self, client_id: Uuid) -> bool {
        match self.peers.remove(&client_id) {
            Some(peer) => {
                log::debug!("presence: {} left", peer.record.name);
                true
            }
            None => false,
        }
    }

    /// Moves remote selections through operations applied to the local
    /// tree. A selection whose node is gone is dropped until its owner
    /// publishes again.
    pub fn transform_remote(&mut self, ops: &[Operation]) {
        if ops.is_empty() {
            return;
        }
        for peer in self.peers.values_mut() {
            if let Some(selection) = peer.record.selection.take() {
                peer.record.selection = ops.iter().try_fold(selection, |selection, op| selection.transform(op));
            }
        }
    }

    pub fn peer(&self, client_id: &Uuid) -> Option<&AwarenessRecord> {
        self.peers.get(client_id).map(|peer| &peer.record)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Remote selections whose points exist in `doc`, ordered by client id.
    pub fn remote_cursors(&self, doc: &Document) -> Vec<RemoteCursor> {
        let mut cursors: Vec<RemoteCursor> = self
            .peers
            .values()
            .filter_map(|peer| {
                let selection = peer.record.selection.as_ref()?;
                if !doc.has_point(&selection.anchor) || !doc.has_point(&selection.focus) {
                    return None;
                }
                Some(RemoteCursor {
                    client_id: peer.record.client_id,
                    name: peer.record.name.clone(),
                    color: peer.record.color,
                    selection: selection.clone(),
                    caret: selection.focus.clone(),
                })
            })
            .collect();
        cursors.sort_by_key(|cursor| cursor.client_id);
        cursors
    }
}

impl SelectionObserver for PresenceRoom {
    fn selection_changed(&mut self, selection: Option<&Range>) {
        self.set_local_selection(selection.cloned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caret(path: &[usize], offset: usize) -> Range {
        Range::collapsed(Point::new(path.to_vec(), offset))
    }

    #[test]
    fn test_identity_is_stable() {
        let id = Uuid::parse_str("3fa2c1d4-0000-4000-8000-000000000000").unwrap();
        let record = AwarenessRecord::new(id);
        assert_eq!(record.name, "user_3fa2c1");
        assert_eq!(record.color, CursorColor::from_client_id(id));
        assert!(record.color.is_valid());
        assert_eq!(PALETTE[0].hex(), "#e6194b");
    }

    #[test]
    fn test_message_roundtrip() {
        let msg = AwarenessMessage::Selection {
            client_id: Uuid::new_v4(),
            selection: Some(caret(&[0, 1], 3)),
            clock: 9,
        };
        assert_eq!(AwarenessMessage::decode(&msg.encode().unwrap()).unwrap(), msg);
    }

    #[test]
    fn test_own_messages_ignored() {
        let mut room = PresenceRoom::new(Uuid::new_v4());
        let join = room.join_message();
        assert!(!room.handle_message(&join));
        assert_eq!(room.peer_count(), 0);
    }

    #[test]
    fn test_join_selection_leave() {
        let mut room = PresenceRoom::new(Uuid::new_v4());
        let mut other = PresenceRoom::new(Uuid::new_v4());
        let other_id = other.client_id();

        assert!(room.handle_message(&other.join_message()));
        other.selection_changed(Some(&caret(&[0, 0], 2)));
        for msg in other.take_outgoing() {
            assert!(room.handle_message(&msg));
        }
        assert_eq!(room.peer(&other_id).unwrap().selection, Some(caret(&[0, 0], 2)));

        assert!(room.handle_message(&other.leave_message()));
        assert!(room.peer(&other_id).is_none());
        assert!(!room.peer_left(other_id));
    }

    #[test]
    fn test_stale_selection_dropped() {
        let mut room = PresenceRoom::new(Uuid::new_v4());
        let id = Uuid::new_v4();
        let update = |clock, offset| AwarenessMessage::Selection {
            client_id: id,
            selection: Some(caret(&[0, 0], offset)),
            clock,
        };

        assert!(room.handle_message(&update(2, 5)));
        assert!(!room.handle_message(&update(1, 1)));
        assert_eq!(room.peer(&id).unwrap().selection, Some(caret(&[0, 0], 5)));
        // Placeholder identity for a peer whose join we missed.
        assert_eq!(room.peer(&id).unwrap().name, display_name(id));
    }

    #[test]
    fn test_off_palette_color_replaced() {
        let mut room = PresenceRoom::new(Uuid::new_v4());
        let mut record = AwarenessRecord::new(Uuid::new_v4());
        record.color = CursorColor { r: 1, g: 2, b: 3 };
        room.handle_message(&AwarenessMessage::Join { record: record.clone() });
        assert_eq!(
            room.peer(&record.client_id).unwrap().color,
            CursorColor::from_client_id(record.client_id)
        );
    }

    #[test]
    fn test_remote_selections_follow_edits() {
        let mut room = PresenceRoom::new(Uuid::new_v4());
        let (typing, gone) = (Uuid::new_v4(), Uuid::new_v4());
        for (id, selection) in [(typing, caret(&[1, 0], 5)), (gone, caret(&[0, 0], 1))] {
            room.handle_message(&AwarenessMessage::Selection {
                client_id: id,
                selection: Some(selection),
                clock: 1,
            });
        }

        room.transform_remote(&[
            Operation::InsertText {
                path: vec![1, 0],
                offset: 0,
                text: "abc".into(),
            },
            Operation::RemoveNode {
                path: vec![0],
                node: Document::initial().children[0].clone(),
            },
        ]);

        assert_eq!(room.peer(&typing).unwrap().selection, Some(caret(&[0, 0], 8)));
        assert_eq!(room.peer(&gone).unwrap().selection, None);
    }

    #[test]
    fn test_remote_cursors_skip_unresolved_points() {
        let doc = Document::initial();
        let mut room = PresenceRoom::new(Uuid::new_v4());
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let selection = Range::new(Point::new(vec![0, 0], 0), Point::new(vec![0, 1], 2));
        room.handle_message(&AwarenessMessage::Selection {
            client_id: a,
            selection: Some(selection.clone()),
            clock: 1,
        });
        room.handle_message(&AwarenessMessage::Selection {
            client_id: b,
            selection: Some(caret(&[7, 0], 0)),
            clock: 1,
        });

        let cursors = room.remote_cursors(&doc);
        assert_eq!(cursors.len(), 1);
        assert_eq!(cursors[0].client_id, a);
        assert_eq!(cursors[0].caret, Point::new(vec![0, 1], 2));
        assert_eq!(cursors[0].selection, selection);
    }
}
