//! Registry of all peer sessions.
//!
//! The registry owns every [`PeerSession`], routes transport events to the
//! session they belong to, and enforces one transport per peer. It never
//! blocks: every method runs to completion on the caller's task, and
//! failures inside one session never affect another.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use protocol::{Identity, Message, MessagePayload, NumericId, ProtocolError, Role};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::session::{ChatRecord, PeerSession, SessionEvent, SessionOutput, SessionState};
use crate::transport::{Connection, ConnectionId, Transport, TransportError, TransportEvent};

/// Errors returned by registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The input is not a nine-digit numeric id.
    #[error("invalid peer id: {0:?}")]
    InvalidPeerId(String),

    /// Attempted to connect to the local identity.
    #[error("cannot open a session with yourself")]
    SelfDial,

    /// No session exists for the peer.
    #[error("no session with {0}")]
    SessionNotFound(NumericId),

    /// The session has not completed its handshake.
    #[error("session with {0} is not secure")]
    NotSecure(NumericId),

    /// Transport failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Protocol failure, such as an oversized attachment.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Notifications produced while handling registry operations.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// A session moved to a new state.
    StateChanged {
        peer: NumericId,
        state: SessionState,
    },
    /// A message from a peer was decrypted and stored.
    MessageReceived { peer: NumericId, message: Message },
    /// A peer failed verification.
    SecurityAlert { peer: NumericId, reason: String },
    /// A handshake broke off for a reason that says nothing about the
    /// peer's identity.
    HandshakeFailed { peer: NumericId, reason: String },
}

/// One row of the chat list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatSummary {
    pub peer: NumericId,
    pub state: SessionState,
    pub unread: u32,
    pub last_message: String,
    pub last_activity: i64,
}

/// Owns all sessions for one local identity.
pub struct SessionRegistry<T: Transport> {
    identity: Arc<Identity>,
    transport: T,
    sessions: HashMap<NumericId, PeerSession>,
    events: Vec<RegistryEvent>,
    dirty: bool,
}

impl<T: Transport> SessionRegistry<T> {
    /// Creates an empty registry.
    pub fn new(identity: Arc<Identity>, transport: T) -> Self {
        Self {
            identity,
            transport,
            sessions: HashMap::new(),
            events: Vec::new(),
            dirty: false,
        }
    }

    /// Returns the local numeric id.
    pub fn local_id(&self) -> &NumericId {
        self.identity.numeric_id()
    }

    /// Returns the number of sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Returns whether there are no sessions.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Returns the session for `peer`.
    pub fn session(&self, peer: &NumericId) -> Option<&PeerSession> {
        self.sessions.get(peer)
    }

    /// Returns the state of the session with `peer`.
    pub fn state(&self, peer: &NumericId) -> Option<SessionState> {
        self.sessions.get(peer).map(PeerSession::state)
    }

    /// Returns the message history with `peer`.
    pub fn messages(&self, peer: &NumericId) -> Option<&[Message]> {
        self.sessions.get(peer).map(PeerSession::messages)
    }

    /// Opens or reuses the session with the peer named by `input`.
    ///
    /// `input` may contain separators such as spaces or `#`. An existing
    /// session is reused; if it is down, one reconnect attempt is made.
    pub fn dial(&mut self, input: &str) -> Result<NumericId, RegistryError> {
        let peer =
            NumericId::parse(input).map_err(|_| RegistryError::InvalidPeerId(input.to_string()))?;
        if &peer == self.local_id() {
            return Err(RegistryError::SelfDial);
        }

        if let Some(session) = self.sessions.get(&peer) {
            debug!(peer = %peer, state = %session.state(), "Reusing existing session");
            if session.state().is_down() {
                self.drive(&peer, |s| s.handle(SessionEvent::Reconnect));
            }
            return Ok(peer);
        }

        info!(peer = %peer, "Opening new session");
        self.sessions.insert(
            peer.clone(),
            PeerSession::new(Arc::clone(&self.identity), peer.clone(), Role::Initiator),
        );
        self.dirty = true;
        self.emit_state(&peer, SessionState::Connecting);
        self.connect(&peer);
        Ok(peer)
    }

    /// Accepts an inbound connection.
    ///
    /// An existing session for the peer is reused and keeps its history;
    /// its previous transport, if any, is closed.
    ///
    /// When both sides dial each other at once, the connection dialed by the
    /// lower numeric id is kept on both ends. An inbound connection that
    /// loses that comparison is closed and the outbound one carries on.
    pub fn accept(&mut self, connection: Arc<dyn Connection>) -> Result<(), RegistryError> {
        let peer = connection.peer().clone();
        if &peer == self.local_id() {
            warn!(connection = %connection.id(), "Refusing inbound connection claiming our own id");
            connection.close();
            return Err(RegistryError::SelfDial);
        }

        if self.local_id() < &peer && self.is_dialing(&peer) {
            debug!(
                peer = %peer,
                connection = %connection.id(),
                "Simultaneous dial, keeping our outbound connection"
            );
            connection.close();
            return Ok(());
        }

        let identity = Arc::clone(&self.identity);
        let mut created = false;
        let session = self.sessions.entry(peer.clone()).or_insert_with(|| {
            created = true;
            PeerSession::new(identity, peer.clone(), Role::Responder)
        });
        session.attach(connection, Role::Responder);

        info!(peer = %peer, new = created, "Accepted inbound connection");
        if created {
            self.dirty = true;
        }
        self.emit_state(&peer, SessionState::Connecting);
        Ok(())
    }

    /// Routes one transport event.
    ///
    /// Events for a connection other than the session's current one are
    /// stale and dropped.
    pub fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Incoming(connection) => {
                if let Err(e) = self.accept(connection) {
                    debug!(error = %e, "Inbound connection refused");
                }
            }
            TransportEvent::NetworkRestored => {
                let dialed = self.reconnect_all();
                info!(dialed, "Network restored");
            }
            TransportEvent::Open { connection, peer } => {
                self.drive_current(&peer, connection, |s| s.handle(SessionEvent::Opened));
            }
            TransportEvent::Data {
                connection,
                peer,
                frame,
            } => {
                self.drive_current(&peer, connection, |s| s.handle_frame(&frame));
            }
            TransportEvent::Closed { connection, peer } => {
                self.drive_current(&peer, connection, |s| s.handle(SessionEvent::Closed));
            }
            TransportEvent::Error {
                connection,
                peer,
                error,
            } => {
                debug!(peer = %peer, error = %error, "Transport error");
                self.drive_current(&peer, connection, |s| s.handle(SessionEvent::Failed(error)));
            }
        }
    }

    /// Encrypts and sends `payload` to `peer`.
    pub fn send(
        &mut self,
        peer: &NumericId,
        payload: MessagePayload,
    ) -> Result<Message, RegistryError> {
        let session = self
            .sessions
            .get_mut(peer)
            .ok_or_else(|| RegistryError::SessionNotFound(peer.clone()))?;
        let message = session.send(payload)?;
        self.dirty = true;
        Ok(message)
    }

    /// Marks the session with `peer` as viewed, clearing its unread count.
    pub fn activate(&mut self, peer: &NumericId) -> Result<(), RegistryError> {
        let session = self
            .sessions
            .get_mut(peer)
            .ok_or_else(|| RegistryError::SessionNotFound(peer.clone()))?;
        if session.unread() > 0 {
            session.activate();
            self.dirty = true;
        }
        Ok(())
    }

    /// Returns all sessions ordered by last activity, most recent first.
    pub fn chat_list(&self) -> Vec<ChatSummary> {
        let mut chats: Vec<ChatSummary> = self
            .sessions
            .values()
            .map(|s| ChatSummary {
                peer: s.peer_id().clone(),
                state: s.state(),
                unread: s.unread(),
                last_message: s.last_message().to_string(),
                last_activity: s.last_activity(),
            })
            .collect();
        chats.sort_by(|a, b| {
            b.last_activity
                .cmp(&a.last_activity)
                .then_with(|| a.peer.cmp(&b.peer))
        });
        chats
    }

    /// Re-dials every session that is `Disconnected` or `Offline`.
    ///
    /// Each such session gets exactly one attempt. Returns the number of
    /// sessions dialed.
    pub fn reconnect_all(&mut self) -> usize {
        let down: Vec<NumericId> = self
            .sessions
            .values()
            .filter(|s| s.state().is_down())
            .map(|s| s.peer_id().clone())
            .collect();

        for peer in &down {
            self.drive(peer, |s| s.handle(SessionEvent::Reconnect));
        }
        if !down.is_empty() {
            debug!(count = down.len(), "Reconnect sweep");
        }
        down.len()
    }

    /// Closes the session with `peer`. Closing twice has no further effect.
    pub fn close(&mut self, peer: &NumericId) -> Result<(), RegistryError> {
        if !self.sessions.contains_key(peer) {
            return Err(RegistryError::SessionNotFound(peer.clone()));
        }
        self.drive(peer, |s| s.handle(SessionEvent::LocalClose));
        Ok(())
    }

    /// Closes every session.
    pub fn close_all(&mut self) {
        let peers: Vec<NumericId> = self.sessions.keys().cloned().collect();
        for peer in &peers {
            self.drive(peer, |s| s.handle(SessionEvent::LocalClose));
        }
    }

    /// Closes and deletes the session with `peer`, including its history.
    pub fn remove(&mut self, peer: &NumericId) -> Result<(), RegistryError> {
        self.close(peer)?;
        self.sessions.remove(peer);
        self.dirty = true;
        info!(peer = %peer, "Session removed");
        Ok(())
    }

    /// Returns the persisted form of every session.
    pub fn snapshot(&self) -> BTreeMap<NumericId, ChatRecord> {
        self.sessions
            .iter()
            .map(|(peer, session)| (peer.clone(), session.to_record()))
            .collect()
    }

    /// Loads persisted sessions as `Disconnected`.
    ///
    /// Sessions that already exist are left untouched.
    pub fn restore(&mut self, records: BTreeMap<NumericId, ChatRecord>) {
        for (peer, mut record) in records {
            if &peer == self.local_id() || self.sessions.contains_key(&peer) {
                continue;
            }
            record.id = peer.clone();
            self.sessions
                .insert(peer, PeerSession::restore(Arc::clone(&self.identity), record));
        }
    }

    /// Returns and clears pending notifications.
    pub fn take_events(&mut self) -> Vec<RegistryEvent> {
        std::mem::take(&mut self.events)
    }

    /// Returns whether persisted data changed since the last call, and
    /// clears the flag.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::replace(&mut self.dirty, false)
    }

    /// Returns whether persisted data changed since the flag was last cleared.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Returns whether our own outbound connection to `peer` is still
    /// handshaking.
    fn is_dialing(&self, peer: &NumericId) -> bool {
        self.sessions.get(peer).is_some_and(|s| {
            s.role() == Role::Initiator
                && s.state().is_handshaking()
                && s.connection_id().is_some()
        })
    }

    fn emit_state(&mut self, peer: &NumericId, state: SessionState) {
        self.events.push(RegistryEvent::StateChanged {
            peer: peer.clone(),
            state,
        });
    }

    /// Starts a transport to `peer` and attaches it to the session.
    fn connect(&mut self, peer: &NumericId) {
        match self.transport.dial(peer) {
            Ok(connection) => {
                if let Some(session) = self.sessions.get_mut(peer) {
                    session.attach(connection, Role::Initiator);
                }
            }
            Err(error) => {
                warn!(peer = %peer, error = %error, "Dial failed");
                self.drive(peer, |s| s.handle(SessionEvent::Failed(error)));
            }
        }
    }

    fn drive_current<F>(&mut self, peer: &NumericId, connection: ConnectionId, f: F)
    where
        F: FnOnce(&mut PeerSession) -> Vec<SessionOutput>,
    {
        let current = self.sessions.get(peer).and_then(PeerSession::connection_id);
        if current != Some(connection) {
            debug!(peer = %peer, connection = %connection, "Ignoring event for stale connection");
            return;
        }
        self.drive(peer, f);
    }

    /// Runs `f` on the session and acts on its outputs.
    fn drive<F>(&mut self, peer: &NumericId, f: F)
    where
        F: FnOnce(&mut PeerSession) -> Vec<SessionOutput>,
    {
        let Some(session) = self.sessions.get_mut(peer) else {
            return;
        };
        let before = session.state();
        let outputs = f(session);
        let after = session.state();

        if before != after {
            self.emit_state(peer, after);
        }

        for output in outputs {
            match output {
                SessionOutput::Dial => self.connect(peer),
                SessionOutput::HandshakeRejected(error) if error.is_security_alert() => {
                    self.events.push(RegistryEvent::SecurityAlert {
                        peer: peer.clone(),
                        reason: error.to_string(),
                    });
                }
                SessionOutput::HandshakeRejected(error) => {
                    self.events.push(RegistryEvent::HandshakeFailed {
                        peer: peer.clone(),
                        reason: error.to_string(),
                    });
                }
                SessionOutput::MessageReceived(message) => {
                    self.dirty = true;
                    self.events.push(RegistryEvent::MessageReceived {
                        peer: peer.clone(),
                        message,
                    });
                }
            }
        }
    }
}

impl<T: Transport> Drop for SessionRegistry<T> {
    fn drop(&mut self) {
        for session in self.sessions.values_mut() {
            session.handle(SessionEvent::LocalClose);
        }
    }
}
