//! Per-peer connection lifecycle as a pure transition function.
//!
//! ```text
//!              Opened (initiator)        Ack verified
//! Connecting ─────────────────> SynSent ─────────────┐
//!     │                                              v
//!     │   Syn received          Syn verified
//!     └──────────────> SynReceived ──────────────> Secure
//!                                                    │
//!        close / error / handshake rejected          v
//!     ┌──────────────────────────────────── Disconnected | Offline
//!     │                                              │
//!     └───────────────── Reconnect ──────────────────┘ -> Connecting
//! ```
//!
//! [`transition`] never performs I/O. It returns the next state together
//! with the [`Effect`]s the owning session must carry out, so every path can
//! be exercised without a transport.

use std::fmt;

use protocol::{EncryptedPayload, ProtocolError, Role, SharedSecret, WireFrame};
use serde::{Deserialize, Serialize};

use crate::transport::TransportError;

/// Lifecycle state of a peer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionState {
    /// Transport is being established.
    Connecting,
    /// Initiator sent `Syn` and waits for `Ack`.
    SynSent,
    /// Responder received `Syn` and is verifying it.
    SynReceived,
    /// Handshake complete; messages flow.
    Secure,
    /// Connection is gone.
    Disconnected,
    /// The peer address was reported unreachable.
    Offline,
}

impl SessionState {
    /// Returns the lowercase status label.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Connecting => "connecting",
            SessionState::SynSent => "syn-sent",
            SessionState::SynReceived => "syn-received",
            SessionState::Secure => "secure",
            SessionState::Disconnected => "disconnected",
            SessionState::Offline => "offline",
        }
    }

    /// Returns whether a transport is attached or being attached.
    pub fn is_live(&self) -> bool {
        !self.is_down()
    }

    /// Returns whether the session has no transport and may be re-dialed.
    pub fn is_down(&self) -> bool {
        matches!(self, SessionState::Disconnected | SessionState::Offline)
    }

    /// Returns whether the handshake is still in progress.
    pub fn is_handshaking(&self) -> bool {
        matches!(
            self,
            SessionState::Connecting | SessionState::SynSent | SessionState::SynReceived
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input to the state machine.
#[derive(Debug)]
pub enum SessionEvent {
    /// The transport connection opened.
    Opened,
    /// A handshake frame arrived.
    HandshakeFrame(WireFrame),
    /// A `msg` frame arrived.
    MessageFrame(EncryptedPayload),
    /// The handshake verified the peer and derived a secret.
    HandshakeCompleted(SharedSecret),
    /// The handshake failed.
    HandshakeRejected(ProtocolError),
    /// The transport connection closed.
    Closed,
    /// The transport reported an error.
    Failed(TransportError),
    /// A reconnect attempt was requested.
    Reconnect,
    /// The local user closed the session.
    LocalClose,
}

/// Work the session must perform after a transition.
#[derive(Debug)]
pub enum Effect {
    /// Create the initiator handshake and send `Syn`.
    SendSyn,
    /// Feed a frame to the handshake.
    ProcessHandshake(WireFrame),
    /// Install the verified shared secret.
    InstallSecret(SharedSecret),
    /// Drop the shared secret and handshake state.
    DiscardSecret,
    /// Decrypt a message and append it to history.
    Decrypt(EncryptedPayload),
    /// Close and release the transport handle.
    CloseTransport,
    /// Ask the registry to dial the peer.
    Dial,
    /// Raise a security alert.
    Alert(ProtocolError),
}

/// Computes the next state and the effects for `event`.
pub fn transition(state: SessionState, role: Role, event: SessionEvent) -> (SessionState, Vec<Effect>) {
    use SessionState::*;

    match (state, event) {
        (Connecting, SessionEvent::Opened) => match role {
            Role::Initiator => (SynSent, vec![Effect::SendSyn]),
            Role::Responder => (Connecting, vec![]),
        },

        (Connecting, SessionEvent::HandshakeFrame(frame @ WireFrame::HandshakeSyn { .. }))
            if role == Role::Responder =>
        {
            (SynReceived, vec![Effect::ProcessHandshake(frame)])
        }
        // Everything else before Secure goes to the handshake, which rejects
        // frames that do not fit the role and phase.
        (s, SessionEvent::HandshakeFrame(frame)) if s.is_handshaking() => {
            (s, vec![Effect::ProcessHandshake(frame)])
        }
        (s, SessionEvent::HandshakeFrame(_)) => (s, vec![]),

        (Secure, SessionEvent::MessageFrame(payload)) => (Secure, vec![Effect::Decrypt(payload)]),
        (s, SessionEvent::MessageFrame(_)) => (s, vec![]),

        (SynSent | SynReceived, SessionEvent::HandshakeCompleted(secret)) => {
            (Secure, vec![Effect::InstallSecret(secret)])
        }
        (s, SessionEvent::HandshakeCompleted(_)) => (s, vec![]),

        (s, SessionEvent::HandshakeRejected(err)) if s.is_handshaking() => (
            Disconnected,
            vec![Effect::DiscardSecret, Effect::CloseTransport, Effect::Alert(err)],
        ),
        (s, SessionEvent::HandshakeRejected(_)) => (s, vec![]),

        (s, SessionEvent::Closed | SessionEvent::LocalClose) if s.is_live() => {
            (Disconnected, vec![Effect::DiscardSecret, Effect::CloseTransport])
        }
        (s, SessionEvent::Failed(err)) if s.is_live() => {
            let next = match err {
                TransportError::PeerUnavailable(_) => Offline,
                _ => Disconnected,
            };
            (next, vec![Effect::DiscardSecret, Effect::CloseTransport])
        }
        (s, SessionEvent::Closed | SessionEvent::LocalClose | SessionEvent::Failed(_)) => (s, vec![]),

        (s, SessionEvent::Reconnect) if s.is_down() => (Connecting, vec![Effect::Dial]),
        (s, SessionEvent::Reconnect) => (s, vec![]),

        (s, SessionEvent::Opened) => (s, vec![]),
    }
}
