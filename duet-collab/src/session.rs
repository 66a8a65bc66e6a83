//! A mounted collaborative editor: editor, binding, presence and transport
//! wired together, plus the connection state machine around them.
//!
//! ```text
//!            mount                 first SyncStep2
//! Disconnected ────▶ Connecting ──────────────────▶ Synced
//!      ▲                                              │
//!      └──────────── transport failure / unmount ─────┘
//! ```
//!
//! A session is owned by one task. Events from the socket tasks arrive over a
//! channel and are applied one at a time by [`CollabSession::handle_event`].

use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use duet_core::history::DEFAULT_MAX_STEPS;
use duet_core::{Binding, CoreError, Document, Editor, Operation, OperationSink};

use crate::client::{ConnectionState, SyncClient, SyncEvent};
use crate::presence::{AwarenessMessage, PresenceRoom, RemoteCursor};
use crate::protocol::{PeerInfo, ProtocolError};

pub const PLACEHOLDER: &str = "Connecting...";

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub server_url: String,
    pub room: String,
    /// Loaded into the room when the relay's copy turns out to be empty.
    pub initial: Option<Document>,
    pub history_limit: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090".to_string(),
            room: "duet".to_string(),
            initial: Some(Document::initial()),
            history_limit: DEFAULT_MAX_STEPS,
        }
    }
}

/// What a view may render right now. Changes go through
/// [`CollabSession::edit`].
pub enum Surface<'a> {
    Editor(&'a Editor),
    Placeholder(&'static str),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("session has been unmounted")]
    Unmounted,
}

pub struct CollabSession {
    config: SessionConfig,
    state: ConnectionState,
    editor: Editor,
    binding: Binding,
    presence: PresenceRoom,
    client: SyncClient,
    events: Option<mpsc::Receiver<SyncEvent>>,
    unmounted: bool,
}

impl CollabSession {
    /// Connects to the relay and asks for the room's state.
    ///
    /// Never fails: if the relay cannot be reached the session stays
    /// `Connecting` and the surface stays a placeholder.
    pub async fn mount(config: SessionConfig) -> Self {
        let client_id = Uuid::new_v4();
        let presence = PresenceRoom::new(client_id);
        let info = PeerInfo::with_id(client_id, presence.local_record().name.clone());

        let mut editor = Editor::with_history_limit(Document::default(), config.history_limit);
        // The placeholder paragraph is local only; the room decides the content.
        editor.take_outbox();

        let mut client = SyncClient::new(info, config.room.clone(), config.server_url.clone());
        let events = client.take_event_rx();

        let mut session = Self {
            config,
            state: ConnectionState::Disconnected,
            editor,
            binding: Binding::new(),
            presence,
            client,
            events,
            unmounted: false,
        };

        session.state = ConnectionState::Connecting;
        if let Err(e) = session.client.connect().await {
            log::warn!("Session for room {} could not connect: {e}", session.config.room);
            return session;
        }
        if let Err(e) = session.handshake().await {
            log::warn!("Handshake with room {} failed: {e}", session.config.room);
        }
        session
    }

    async fn handshake(&mut self) -> Result<(), SessionError> {
        let state_vector = self.binding.encode_state_vector()?;
        self.client.send_state_vector(state_vector).await?;
        let join = self.presence.join_message().encode()?;
        self.client.send_awareness(join).await?;
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn client_id(&self) -> Uuid {
        self.presence.client_id()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn surface(&self) -> Surface<'_> {
        match self.state {
            ConnectionState::Synced => Surface::Editor(&self.editor),
            _ => Surface::Placeholder(PLACEHOLDER),
        }
    }

    pub fn document(&self) -> &Document {
        self.editor.document()
    }

    pub fn editor(&self) -> &Editor {
        &self.editor
    }

    pub fn presence(&self) -> &PresenceRoom {
        &self.presence
    }

    pub fn remote_cursors(&self) -> Vec<RemoteCursor> {
        self.presence.remote_cursors(self.editor.document())
    }

    /// Non-local transactions seen by the binding.
    pub fn remote_transactions(&self) -> u64 {
        self.binding.remote_transactions()
    }

    /// Runs a command against the editor and publishes its effects.
    /// Returns `Ok(None)` without running `f` unless the session is synced.
    pub async fn edit<R>(&mut self, f: impl FnOnce(&mut Editor) -> R) -> Result<Option<R>, SessionError> {
        if self.unmounted {
            return Err(SessionError::Unmounted);
        }
        if self.state != ConnectionState::Synced {
            log::debug!("edit ignored while {:?}", self.state);
            return Ok(None);
        }

        let result = f(&mut self.editor);
        self.flush_and_send().await?;
        self.publish_selection().await?;
        Ok(Some(result))
    }

    /// Applies one event from the transport.
    pub async fn handle_event(&mut self, event: SyncEvent) -> Result<(), SessionError> {
        if self.unmounted {
            return Err(SessionError::Unmounted);
        }

        match event {
            SyncEvent::Connected => log::debug!("transport connected"),
            SyncEvent::Disconnected => {
                log::info!("Session for room {} lost its connection", self.config.room);
                self.state = ConnectionState::Disconnected;
            }
            SyncEvent::SyncStep1(state_vector) => match self.binding.encode_diff(&state_vector) {
                Ok(diff) => self.client.send_sync_step2(diff).await?,
                Err(CoreError::Crdt(e)) => log::warn!("skipping malformed state vector: {e}"),
                Err(e) => return Err(e.into()),
            },
            SyncEvent::Synced(update) => self.on_synced(&update).await?,
            SyncEvent::RemoteDelta { peer_id, clock, update } => {
                log::debug!("delta {clock} from {peer_id}, {} bytes", update.len());
                self.flush_and_send().await?;
                if let Some(ops) = self.integrate(&update)? {
                    self.apply_to_editor(&ops).await?;
                }
            }
            SyncEvent::RemoteAwareness { peer_id, payload } => match AwarenessMessage::decode(&payload) {
                Ok(msg) => {
                    self.presence.handle_message(&msg);
                }
                Err(e) => log::warn!("skipping malformed awareness from {peer_id}: {e}"),
            },
            SyncEvent::PeerJoined(info) => log::info!("{} joined room {}", info.name, self.config.room),
            SyncEvent::PeerLeft(peer_id) => {
                self.presence.peer_left(peer_id);
            }
        }
        Ok(())
    }

    async fn on_synced(&mut self, update: &[u8]) -> Result<(), SessionError> {
        self.flush_and_send().await?;
        let Some(mut ops) = self.integrate(update)? else {
            return Ok(());
        };

        if self.state != ConnectionState::Synced {
            if let Some(initial) = self.config.initial.clone() {
                if self.binding.is_empty()? {
                    if let Some(seed) = self.binding.seed(&initial)? {
                        log::info!("Room {} was empty, loading the initial document", self.config.room);
                        self.send_update(seed).await?;
                        ops = self.binding.reconcile(self.editor.document())?;
                    }
                }
            }
            self.state = ConnectionState::Synced;
            log::info!("Session synced with room {}", self.config.room);
        }

        self.apply_to_editor(&ops).await
    }

    /// Feeds a remote update to the binding. Malformed updates are logged
    /// and skipped. The editor must have no pending operations: the mirror
    /// is diffed against it.
    fn integrate(&mut self, update: &[u8]) -> Result<Option<Vec<Operation>>, SessionError> {
        match self.binding.apply_remote(update, self.editor.document()) {
            Ok(ops) => Ok(Some(ops)),
            Err(CoreError::Crdt(e)) => {
                log::warn!("skipping malformed update: {e}");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn apply_to_editor(&mut self, ops: &[Operation]) -> Result<(), SessionError> {
        if let Err(e) = self.editor.apply_remote(ops) {
            log::warn!("remote operations did not apply ({e}), resyncing from the mirror");
            return self.resync().await;
        }
        self.presence.transform_remote(ops);
        self.flush_and_send().await?;
        self.publish_selection().await
    }

    async fn flush_and_send(&mut self) -> Result<(), SessionError> {
        if let Some(update) = self.flush()? {
            self.send_update(update).await?;
        }
        Ok(())
    }

    /// Writes pending local operations to the mirror. A failed write leaves
    /// the mirror ahead of the editor; the session then resyncs.
    fn flush(&mut self) -> Result<Option<Vec<u8>>, SessionError> {
        let mut outgoing = Outgoing {
            binding: &self.binding,
            presence: &mut self.presence,
        };
        match self.editor.flush_to(&mut outgoing) {
            Ok(update) => Ok(update.flatten()),
            Err(CoreError::Disposed) => Err(SessionError::Unmounted),
            Err(e) => {
                log::warn!("local operations did not reach the mirror: {e}");
                let ops = self.binding.reconcile(self.editor.document())?;
                self.editor.apply_remote(&ops)?;
                if let Err(e) = self.editor.flush_to(&mut self.binding) {
                    log::error!("mirror rejected normalization fixes: {e}");
                }
                Ok(Some(self.binding.encode_state()?))
            }
        }
    }

    /// Brings the editor back in line with the mirror and republishes the
    /// whole mirror state.
    async fn resync(&mut self) -> Result<(), SessionError> {
        let remote = self.binding.read_document()?;
        let ops = duet_core::collab::reconcile::diff(self.editor.document(), &remote);
        // The editor rejected a diff of itself; start over from the mirror.
        if self.editor.apply_remote(&ops).is_err() {
            log::error!("editor could not follow the mirror, rebuilding it");
            self.editor = Editor::with_history_limit(remote, self.config.history_limit);
        }
        self.flush_and_send().await?;
        let state = self.binding.encode_state()?;
        self.send_update(state).await
    }

    async fn send_update(&mut self, update: Vec<u8>) -> Result<(), SessionError> {
        match self.client.send_delta(update).await {
            Ok(clock) => {
                log::trace!("sent delta {clock}");
                Ok(())
            }
            Err(e) => {
                log::warn!("could not send update: {e}");
                self.state = ConnectionState::Disconnected;
                Err(e.into())
            }
        }
    }

    async fn publish_selection(&mut self) -> Result<(), SessionError> {
        self.editor.notify_selection(&mut self.presence);
        for msg in self.presence.take_outgoing() {
            self.client.send_awareness(msg.encode()?).await?;
        }
        Ok(())
    }

    /// Waits for the next transport event. `None` once unmounted or once
    /// the transport is gone.
    pub async fn next_event(&mut self) -> Option<SyncEvent> {
        self.events.as_mut()?.recv().await
    }

    /// Handles events until none arrives for `quiet`. Returns how many
    /// were handled.
    pub async fn process_pending(&mut self, quiet: Duration) -> Result<usize, SessionError> {
        let mut handled = 0;
        while let Ok(Some(event)) = tokio::time::timeout(quiet, self.next_event()).await {
            self.handle_event(event).await?;
            handled += 1;
        }
        Ok(handled)
    }

    /// Handles events until the session is synced or `timeout` passes.
    pub async fn wait_until_synced(&mut self, timeout: Duration) -> Result<bool, SessionError> {
        let deadline = Instant::now() + timeout;
        while self.state != ConnectionState::Synced {
            match tokio::time::timeout_at(deadline, self.next_event()).await {
                Ok(Some(event)) => self.handle_event(event).await?,
                Ok(None) | Err(_) => return Ok(false),
            }
        }
        Ok(true)
    }

    /// Tears the session down. Nothing reaches the editor afterwards.
    pub async fn unmount(&mut self) {
        if self.unmounted {
            return;
        }
        self.binding.dispose();
        match self.presence.leave_message().encode() {
            Ok(leave) => {
                if let Err(e) = self.client.send_awareness(leave).await {
                    log::debug!("leave not sent: {e}");
                }
            }
            Err(e) => log::warn!("could not encode leave: {e}"),
        }
        self.client.disconnect().await;
        self.events = None;
        self.state = ConnectionState::Disconnected;
        self.unmounted = true;
        log::info!("Session for room {} unmounted", self.config.room);
    }

    pub fn is_unmounted(&self) -> bool {
        self.unmounted
    }
}

/// Local operations on their way to the mirror. Remote cursors are moved
/// past them on the way.
struct Outgoing<'a> {
    binding: &'a Binding,
    presence: &'a mut PresenceRoom,
}

impl OperationSink for Outgoing<'_> {
    type Output = Option<Vec<u8>>;

    fn apply_local(&mut self, ops: &[Operation], document: &Document) -> Result<Self::Output, CoreError> {
        self.presence.transform_remote(ops);
        self.binding.apply_local(ops, document)
    }
}
