//! # duet-collab: transport and sessions for duet
//!
//! Moves yrs updates and presence between editors through a WebSocket relay.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐     WebSocket      ┌─────────────┐
//! │ CollabSession │ ◄────────────────► │ SyncServer  │
//! │  Editor       │    Binary Proto    │ (relay)     │
//! │  Binding      │                    └──────┬──────┘
//! │  PresenceRoom │                           │
//! │  SyncClient   │                    ┌──────┴──────┐
//! └───────────────┘                    │ Yrs Doc per │
//!                                      │ room + fan- │
//!                                      │ out group   │
//!                                      └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Binary wire protocol (bincode-encoded SyncMessage)
//! - [`broadcast`]: Room-based fan-out
//! - [`server`]: WebSocket relay
//! - [`client`]: WebSocket sync client
//! - [`presence`]: Awareness records and remote cursors
//! - [`session`]: Connection state machine around one editor

pub mod protocol;
pub mod broadcast;
pub mod server;
pub mod client;
pub mod presence;
pub mod session;

pub use protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage};
pub use broadcast::{BroadcastGroup, BroadcastStats};
pub use presence::{AwarenessMessage, AwarenessRecord, CursorColor, PresenceRoom, RemoteCursor, PALETTE};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use client::{ConnectionState, SyncClient, SyncEvent};
pub use session::{CollabSession, SessionConfig, SessionError, Surface};
