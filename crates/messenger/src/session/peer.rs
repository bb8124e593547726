//! A single peer session: state, transport handle, secret and history.

use std::collections::VecDeque;
use std::sync::Arc;

use protocol::{
    codec, Handshake, Identity, Message, MessagePayload, NumericId, ProtocolError, Role, Sender,
    SharedSecret, WireFrame,
};
use tracing::{debug, info, warn};

use super::state::{transition, Effect, SessionEvent, SessionState};
use super::{now_millis, ChatRecord};
use crate::registry::RegistryError;
use crate::transport::{Connection, ConnectionId, TransportError};

/// Chat-list preview shown once a handshake completes.
const SECURED_PREVIEW: &str = "Secure connection established";

/// Something the registry must act on after a session handled an event.
#[derive(Debug)]
pub enum SessionOutput {
    /// The session needs a new transport to its peer.
    Dial,
    /// The handshake failed and the connection was dropped.
    HandshakeRejected(ProtocolError),
    /// A message was decrypted and appended.
    MessageReceived(Message),
}

/// The stateful record of one conversation with one peer.
///
/// The session exclusively owns its transport handle and shared secret.
/// Closing the session closes the handle; the secret lives only as long as
/// the connection it was negotiated on.
pub struct PeerSession {
    peer_id: NumericId,
    local: Arc<Identity>,
    role: Role,
    state: SessionState,
    connection: Option<Arc<dyn Connection>>,
    handshake: Option<Handshake>,
    shared_secret: Option<SharedSecret>,
    messages: Vec<Message>,
    last_activity: i64,
    unread: u32,
    last_message: String,
}

impl PeerSession {
    /// Creates a session that is about to connect.
    pub fn new(local: Arc<Identity>, peer_id: NumericId, role: Role) -> Self {
        Self {
            peer_id,
            local,
            role,
            state: SessionState::Connecting,
            connection: None,
            handshake: None,
            shared_secret: None,
            messages: Vec::new(),
            last_activity: now_millis(),
            unread: 0,
            last_message: String::new(),
        }
    }

    /// Recreates a session from its persisted form, without a transport.
    pub fn restore(local: Arc<Identity>, record: ChatRecord) -> Self {
        Self {
            peer_id: record.id,
            local,
            role: Role::Initiator,
            state: SessionState::Disconnected,
            connection: None,
            handshake: None,
            shared_secret: None,
            messages: record.messages,
            last_activity: record.timestamp,
            unread: record.unread,
            last_message: record.last_message,
        }
    }

    /// Returns the peer's numeric id.
    pub fn peer_id(&self) -> &NumericId {
        &self.peer_id
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Returns which side opened the current connection.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Returns the id of the attached connection.
    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.connection.as_ref().map(|c| c.id())
    }

    /// Returns whether a shared secret is installed.
    pub fn is_secure(&self) -> bool {
        self.state == SessionState::Secure && self.shared_secret.is_some()
    }

    /// Returns the fingerprint of the installed secret.
    pub fn secret_fingerprint(&self) -> Option<String> {
        self.shared_secret.as_ref().map(SharedSecret::fingerprint)
    }

    /// Returns the message history in order.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Returns the number of unread messages.
    pub fn unread(&self) -> u32 {
        self.unread
    }

    /// Returns the preview of the last message.
    pub fn last_message(&self) -> &str {
        &self.last_message
    }

    /// Returns the last activity time in epoch milliseconds.
    pub fn last_activity(&self) -> i64 {
        self.last_activity
    }

    /// Clears the unread counter.
    pub fn activate(&mut self) {
        self.unread = 0;
    }

    /// Attaches a fresh connection, replacing any previous one.
    ///
    /// A previous live connection is closed first so that at most one
    /// transport to the peer exists. Secret and handshake state start over.
    pub fn attach(&mut self, connection: Arc<dyn Connection>, role: Role) {
        if let Some(old) = self.connection.take() {
            debug!(peer = %self.peer_id, connection = %old.id(), "Replacing connection");
            old.close();
        }
        self.shared_secret = None;
        self.handshake = None;
        self.role = role;
        self.state = SessionState::Connecting;
        self.connection = Some(connection);
        self.touch();
    }

    /// Handles a raw text frame from the attached connection.
    pub fn handle_frame(&mut self, text: &str) -> Vec<SessionOutput> {
        match WireFrame::from_json(text) {
            Ok(WireFrame::Msg { payload }) => self.handle(SessionEvent::MessageFrame(payload)),
            Ok(frame) => self.handle(SessionEvent::HandshakeFrame(frame)),
            Err(e) => {
                debug!(peer = %self.peer_id, error = %e, "Dropping unparseable frame");
                Vec::new()
            }
        }
    }

    /// Runs `event` and every follow-up event through the state machine.
    pub fn handle(&mut self, event: SessionEvent) -> Vec<SessionOutput> {
        let mut outputs = Vec::new();
        let mut queue = VecDeque::from([event]);

        while let Some(event) = queue.pop_front() {
            let (next, effects) = transition(self.state, self.role, event);
            if next != self.state {
                debug!(peer = %self.peer_id, from = %self.state, to = %next, "Session state changed");
                self.state = next;
            }
            for effect in effects {
                self.apply(effect, &mut queue, &mut outputs);
            }
        }

        outputs
    }

    fn apply(
        &mut self,
        effect: Effect,
        queue: &mut VecDeque<SessionEvent>,
        outputs: &mut Vec<SessionOutput>,
    ) {
        match effect {
            Effect::SendSyn => {
                let mut handshake =
                    Handshake::new_initiator(Arc::clone(&self.local), self.peer_id.clone());
                match handshake.start() {
                    Ok(syn) => {
                        self.handshake = Some(handshake);
                        if let Err(e) = self.send_frame(&syn) {
                            queue.push_back(SessionEvent::Failed(e));
                        }
                    }
                    Err(e) => queue.push_back(SessionEvent::HandshakeRejected(e)),
                }
            }
            Effect::ProcessHandshake(frame) => {
                let role = self.role;
                let handshake = self.handshake.get_or_insert_with(|| {
                    Handshake::new(Arc::clone(&self.local), self.peer_id.clone(), role)
                });
                match handshake.receive(&frame) {
                    Ok(outcome) => {
                        if let Some(reply) = outcome.reply {
                            if let Err(e) = self.send_frame(&reply) {
                                queue.push_back(SessionEvent::Failed(e));
                                return;
                            }
                        }
                        queue.push_back(SessionEvent::HandshakeCompleted(outcome.secret));
                    }
                    Err(e) => queue.push_back(SessionEvent::HandshakeRejected(e)),
                }
            }
            Effect::InstallSecret(secret) => {
                info!(peer = %self.peer_id, "Session secured");
                self.shared_secret = Some(secret);
                self.last_message = SECURED_PREVIEW.to_string();
                self.touch();
            }
            Effect::DiscardSecret => {
                self.shared_secret = None;
                self.handshake = None;
            }
            Effect::Decrypt(payload) => {
                let Some(secret) = self.shared_secret.as_ref() else {
                    debug!(peer = %self.peer_id, "Dropping msg frame without secret");
                    return;
                };
                match codec::decrypt_payload(secret, &payload) {
                    Ok(content) => {
                        let message = Message::new(Sender::Peer, content, now_millis());
                        self.append(message.clone());
                        self.unread += 1;
                        outputs.push(SessionOutput::MessageReceived(message));
                    }
                    Err(e) => {
                        debug!(peer = %self.peer_id, error = %e, "Dropping undecryptable frame");
                    }
                }
            }
            Effect::CloseTransport => {
                if let Some(connection) = self.connection.take() {
                    connection.close();
                }
            }
            Effect::Dial => outputs.push(SessionOutput::Dial),
            Effect::Alert(err) => {
                warn!(peer = %self.peer_id, error = %err, "Handshake rejected");
                outputs.push(SessionOutput::HandshakeRejected(err));
            }
        }
    }

    /// Encrypts and sends `payload`, appending it to history on success.
    ///
    /// Oversized attachments are rejected before anything is encrypted.
    pub fn send(&mut self, payload: MessagePayload) -> Result<Message, RegistryError> {
        codec::check_size(&payload)?;

        let secret = match (&self.shared_secret, self.state) {
            (Some(secret), SessionState::Secure) => secret,
            _ => return Err(RegistryError::NotSecure(self.peer_id.clone())),
        };
        let frame = codec::seal_message(secret, &payload)?;
        self.send_frame(&frame)?;

        let message = Message::new(Sender::Local, payload, now_millis());
        self.append(message.clone());
        Ok(message)
    }

    fn send_frame(&self, frame: &WireFrame) -> Result<(), TransportError> {
        let connection = self.connection.as_ref().ok_or(TransportError::Closed)?;
        let text = frame
            .to_json()
            .map_err(|e| TransportError::Other(e.to_string()))?;
        connection.send(&text)
    }

    fn append(&mut self, message: Message) {
        self.last_message = message.content.preview();
        self.last_activity = message.timestamp;
        self.messages.push(message);
    }

    fn touch(&mut self) {
        self.last_activity = now_millis();
    }

    /// Produces the persisted form of this session.
    ///
    /// The status is always `disconnected`: no live state is ever stored.
    pub fn to_record(&self) -> ChatRecord {
        ChatRecord {
            id: self.peer_id.clone(),
            messages: self.messages.clone(),
            status: SessionState::Disconnected,
            unread: self.unread,
            last_message: self.last_message.clone(),
            timestamp: self.last_activity,
        }
    }
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("peer_id", &self.peer_id)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("connection", &self.connection_id())
            .field("secure", &self.shared_secret.is_some())
            .field("messages", &self.messages.len())
            .field("unread", &self.unread)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryNetwork, Transport, TransportEvent};
    use protocol::MAX_ATTACHMENT_SIZE;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Side {
        session: PeerSession,
        events: UnboundedReceiver<TransportEvent>,
    }

    /// Feeds every queued transport event for the attached connection.
    fn pump(side: &mut Side) -> Vec<SessionOutput> {
        let mut outputs = Vec::new();
        while let Ok(event) = side.events.try_recv() {
            let current = side.session.connection_id();
            match event {
                TransportEvent::Incoming(conn) => side.session.attach(conn, Role::Responder),
                TransportEvent::Open { connection, .. } if Some(connection) == current => {
                    outputs.extend(side.session.handle(SessionEvent::Opened));
                }
                TransportEvent::Data {
                    connection, frame, ..
                } if Some(connection) == current => {
                    outputs.extend(side.session.handle_frame(&frame));
                }
                TransportEvent::Closed { connection, .. } if Some(connection) == current => {
                    outputs.extend(side.session.handle(SessionEvent::Closed));
                }
                _ => {}
            }
        }
        outputs
    }

    fn connected_pair() -> (Side, Side) {
        let alice = Arc::new(Identity::generate());
        let bob = Arc::new(Identity::generate());
        let network = MemoryNetwork::new();
        let (alice_transport, alice_rx) = network.join(alice.numeric_id().clone());
        let (_bob_transport, bob_rx) = network.join(bob.numeric_id().clone());

        let mut a = Side {
            session: PeerSession::new(Arc::clone(&alice), bob.numeric_id().clone(), Role::Initiator),
            events: alice_rx,
        };
        let b = Side {
            session: PeerSession::new(Arc::clone(&bob), alice.numeric_id().clone(), Role::Responder),
            events: bob_rx,
        };

        let conn = alice_transport.dial(bob.numeric_id()).unwrap();
        a.session.attach(conn, Role::Initiator);
        (a, b)
    }

    fn secure_pair() -> (Side, Side) {
        let (mut a, mut b) = connected_pair();
        for _ in 0..3 {
            pump(&mut a);
            pump(&mut b);
        }
        (a, b)
    }

    #[test]
    fn test_handshake_over_memory_transport() {
        let (a, b) = secure_pair();
        assert_eq!(a.session.state(), SessionState::Secure);
        assert_eq!(b.session.state(), SessionState::Secure);
        assert_eq!(a.session.secret_fingerprint(), b.session.secret_fingerprint());
        assert_eq!(a.session.last_message(), SECURED_PREVIEW);
        assert_eq!(b.session.last_message(), SECURED_PREVIEW);
    }

    #[test]
    fn test_message_exchange() {
        let (mut a, mut b) = secure_pair();

        a.session.send(MessagePayload::text("hi bob")).unwrap();
        let outputs = pump(&mut b);

        assert!(matches!(outputs.as_slice(), [SessionOutput::MessageReceived(_)]));
        assert_eq!(b.session.messages().len(), 1);
        assert_eq!(b.session.messages()[0].sender, Sender::Peer);
        assert_eq!(b.session.unread(), 1);
        assert_eq!(b.session.last_message(), "hi bob");

        assert_eq!(a.session.messages()[0].sender, Sender::Local);
        assert_eq!(a.session.unread(), 0);

        b.session.activate();
        assert_eq!(b.session.unread(), 0);
    }

    #[test]
    fn test_send_requires_secure() {
        let (mut a, _b) = connected_pair();
        assert!(matches!(
            a.session.send(MessagePayload::text("too early")),
            Err(RegistryError::NotSecure(_))
        ));
        assert!(a.session.messages().is_empty());
    }

    #[test]
    fn test_oversized_attachment_rejected() {
        let (mut a, _b) = secure_pair();
        let image = MessagePayload::Image {
            content: "x".repeat(MAX_ATTACHMENT_SIZE + 1),
            file_name: None,
        };
        assert!(matches!(
            a.session.send(image),
            Err(RegistryError::Protocol(ProtocolError::PayloadTooLarge { .. }))
        ));
        assert!(a.session.messages().is_empty());
    }

    #[test]
    fn test_msg_frame_before_secure_is_ignored() {
        let (_a, mut b) = connected_pair();
        // Deliver the Incoming and Open events only; no Syn has been sent.
        pump(&mut b);
        assert_eq!(b.session.state(), SessionState::Connecting);

        let bogus = r#"{"type":"msg","payload":{"iv":"000000000000000000000000","ciphertext":"00"}}"#;
        let outputs = b.session.handle_frame(bogus);
        assert!(outputs.is_empty());
        assert!(b.session.messages().is_empty());
    }

    #[test]
    fn test_garbage_frame_dropped() {
        let (mut a, _b) = secure_pair();
        assert!(a.session.handle_frame("not json").is_empty());
        assert_eq!(a.session.state(), SessionState::Secure);
    }

    #[test]
    fn test_tampered_msg_dropped() {
        let (mut a, mut b) = secure_pair();
        a.session.send(MessagePayload::text("original")).unwrap();

        let Ok(TransportEvent::Data { frame, .. }) = b.events.try_recv() else {
            panic!("expected data frame");
        };
        let mut value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        let ciphertext = value["payload"]["ciphertext"].as_str().unwrap().to_string();
        let flipped = if ciphertext.starts_with('0') { "1" } else { "0" };
        value["payload"]["ciphertext"] = format!("{}{}", flipped, &ciphertext[1..]).into();

        let outputs = b.session.handle_frame(&value.to_string());
        assert!(outputs.is_empty());
        assert!(b.session.messages().is_empty());
        assert_eq!(b.session.state(), SessionState::Secure);
    }

    #[test]
    fn test_close_discards_secret() {
        let (mut a, _b) = secure_pair();
        a.session.handle(SessionEvent::LocalClose);
        assert_eq!(a.session.state(), SessionState::Disconnected);
        assert!(a.session.secret_fingerprint().is_none());
        assert!(a.session.connection_id().is_none());

        // Second close changes nothing.
        assert!(a.session.handle(SessionEvent::LocalClose).is_empty());
        assert_eq!(a.session.state(), SessionState::Disconnected);
    }

    #[test]
    fn test_reconnect_requests_dial() {
        let (mut a, _b) = secure_pair();
        a.session.handle(SessionEvent::LocalClose);
        let outputs = a.session.handle(SessionEvent::Reconnect);
        assert!(matches!(outputs.as_slice(), [SessionOutput::Dial]));
        assert_eq!(a.session.state(), SessionState::Connecting);
    }

    #[test]
    fn test_record_is_always_disconnected() {
        let (mut a, mut b) = secure_pair();
        a.session.send(MessagePayload::text("persist me")).unwrap();
        pump(&mut b);

        let record = b.session.to_record();
        assert_eq!(record.status, SessionState::Disconnected);
        assert_eq!(record.unread, 1);
        assert_eq!(record.last_message, "persist me");

        let restored = PeerSession::restore(Arc::new(Identity::generate()), record);
        assert_eq!(restored.state(), SessionState::Disconnected);
        assert_eq!(restored.messages().len(), 1);
        assert!(restored.secret_fingerprint().is_none());
    }
}
