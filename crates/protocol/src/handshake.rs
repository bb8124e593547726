//! Two-message mutual authentication handshake.
//!
//! The handshake binds the cryptographic identity of a peer to the numeric
//! id the transport reports for the connection:
//!
//! ```text
//! initiator                          responder
//!   -> {handshake-syn, pubI}
//!                                    verify id(pubI) == transport peer id
//!                                    derive ECDH(privR, pubI)
//!   <- {handshake-ack, pubR}
//! verify id(pubR) == transport peer id
//! derive ECDH(privI, pubR)
//! ```
//!
//! A secret is only returned after the verification step succeeds. Any
//! failure moves the handshake to [`HandshakePhase::Failed`], which is
//! terminal for the connection.

use std::sync::Arc;

use hkdf::Hkdf;
use sha2::{Digest, Sha256};

use crate::aead::{AeadKey, KEY_LENGTH};
use crate::error::{ProtocolError, Result};
use crate::identity::{Identity, Jwk, NumericId, PeerPublicKey};
use crate::messages::WireFrame;

/// HKDF info string binding derived keys to this protocol and cipher.
const SHARED_SECRET_INFO: &[u8] = b"hashhello/v1/aes-256-gcm";

/// State of the handshake on one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
    /// Nothing sent or received yet.
    None,
    /// Initiator: `Syn` sent, waiting for `Ack`.
    SynSent,
    /// Responder: `Syn` received and being verified.
    SynReceived,
    /// Peer verified and shared secret derived.
    Secure,
    /// Handshake failed; the connection must be closed.
    Failed,
}

/// Role in the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Dialed the connection and sends the first frame.
    Initiator,
    /// Accepted the connection and waits for `Syn`.
    Responder,
}

/// Symmetric AEAD key shared with exactly one peer.
///
/// Owned by the session it was installed on and never persisted.
pub struct SharedSecret {
    key: AeadKey,
}

impl SharedSecret {
    /// Returns the AEAD key.
    pub fn key(&self) -> &AeadKey {
        &self.key
    }

    /// Returns a SHA-256 fingerprint of the key material, hex-encoded.
    ///
    /// Two parties hold the same secret exactly when their fingerprints match.
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(self.key.as_bytes()))
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSecret")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// Imports `public_key` and checks that it hashes to `expected`.
pub fn verify_peer(expected: &NumericId, public_key: &Jwk) -> Result<PeerPublicKey> {
    let peer = PeerPublicKey::import(public_key)?;
    if !peer.matches(expected) {
        return Err(ProtocolError::IdentityMismatch {
            expected: expected.to_string(),
            actual: peer.numeric_id().to_string(),
        });
    }
    Ok(peer)
}

/// Derives the shared AEAD key from a local identity and a peer public key.
///
/// X25519 output is expanded with HKDF-SHA256. Non-contributory agreements
/// (low-order peer points) are rejected.
pub fn derive_shared_secret(local: &Identity, remote: &PeerPublicKey) -> Result<SharedSecret> {
    let agreed = local.secret().diffie_hellman(remote.as_dalek());
    if !agreed.was_contributory() {
        return Err(ProtocolError::HandshakeFailed(
            "non-contributory key agreement".to_string(),
        ));
    }

    let hkdf = Hkdf::<Sha256>::new(None, agreed.as_bytes());
    let mut okm = [0u8; KEY_LENGTH];
    hkdf.expand(SHARED_SECRET_INFO, &mut okm)
        .map_err(|e| ProtocolError::HandshakeFailed(format!("key expansion failed: {}", e)))?;

    Ok(SharedSecret {
        key: AeadKey::from_bytes(okm),
    })
}

/// Result of processing an inbound handshake frame.
#[derive(Debug)]
pub struct HandshakeOutcome {
    /// The verified shared secret.
    pub secret: SharedSecret,
    /// Frame to send back to the peer, if any.
    pub reply: Option<WireFrame>,
}

/// Handshake state for a single connection.
pub struct Handshake {
    local: Arc<Identity>,
    peer: NumericId,
    role: Role,
    phase: HandshakePhase,
}

impl Handshake {
    /// Creates the handshake for a connection this side dialed.
    pub fn new_initiator(local: Arc<Identity>, peer: NumericId) -> Self {
        Self {
            local,
            peer,
            role: Role::Initiator,
            phase: HandshakePhase::None,
        }
    }

    /// Creates the handshake for a connection this side accepted.
    pub fn new_responder(local: Arc<Identity>, peer: NumericId) -> Self {
        Self {
            local,
            peer,
            role: Role::Responder,
            phase: HandshakePhase::None,
        }
    }

    /// Creates a handshake for the given role.
    pub fn new(local: Arc<Identity>, peer: NumericId, role: Role) -> Self {
        match role {
            Role::Initiator => Self::new_initiator(local, peer),
            Role::Responder => Self::new_responder(local, peer),
        }
    }

    /// Returns the current phase.
    pub fn phase(&self) -> HandshakePhase {
        self.phase
    }

    /// Returns the role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Returns the transport-level peer id this handshake verifies against.
    pub fn peer(&self) -> &NumericId {
        &self.peer
    }

    /// Returns whether the handshake is complete.
    pub fn is_secure(&self) -> bool {
        self.phase == HandshakePhase::Secure
    }

    fn own_public_key(&self) -> Jwk {
        self.local.public_key_jwk()
    }

    /// Produces the initiator's `Syn` frame.
    pub fn start(&mut self) -> Result<WireFrame> {
        match (self.role, self.phase) {
            (Role::Initiator, HandshakePhase::None) => {
                self.phase = HandshakePhase::SynSent;
                Ok(WireFrame::HandshakeSyn {
                    public_key: self.own_public_key(),
                })
            }
            _ => Err(ProtocolError::HandshakeFailed(format!(
                "cannot start handshake as {:?} in phase {:?}",
                self.role, self.phase
            ))),
        }
    }

    /// Processes an inbound handshake frame.
    ///
    /// On success the returned outcome carries the verified secret and, for
    /// the responder, the `Ack` to send. On failure the phase becomes
    /// `Failed` and no secret exists anywhere.
    pub fn receive(&mut self, frame: &WireFrame) -> Result<HandshakeOutcome> {
        let result = self.process(frame);
        if result.is_err() {
            self.phase = HandshakePhase::Failed;
        }
        result
    }

    fn process(&mut self, frame: &WireFrame) -> Result<HandshakeOutcome> {
        match (self.role, self.phase, frame) {
            (Role::Responder, HandshakePhase::None, WireFrame::HandshakeSyn { public_key }) => {
                self.phase = HandshakePhase::SynReceived;
                let secret = self.verify_and_derive(public_key)?;
                self.phase = HandshakePhase::Secure;
                Ok(HandshakeOutcome {
                    secret,
                    reply: Some(WireFrame::HandshakeAck {
                        public_key: self.own_public_key(),
                    }),
                })
            }
            (Role::Initiator, HandshakePhase::SynSent, WireFrame::HandshakeAck { public_key }) => {
                let secret = self.verify_and_derive(public_key)?;
                self.phase = HandshakePhase::Secure;
                Ok(HandshakeOutcome {
                    secret,
                    reply: None,
                })
            }
            (role, phase, frame) => Err(ProtocolError::HandshakeFailed(format!(
                "unexpected {} frame as {:?} in phase {:?}",
                frame.kind(),
                role,
                phase
            ))),
        }
    }

    fn verify_and_derive(&self, public_key: &Jwk) -> Result<SharedSecret> {
        let remote = verify_peer(&self.peer, public_key)?;
        derive_shared_secret(&self.local, &remote)
    }
}

impl std::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handshake")
            .field("peer", &self.peer)
            .field("role", &self.role)
            .field("phase", &self.phase)
            .finish()
    }
}
