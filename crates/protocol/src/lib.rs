//! # HashHello Protocol Library
//!
//! This crate provides the identity model, handshake and message encryption
//! for the HashHello peer-to-peer messenger.
//!
//! ## Overview
//!
//! - **Identities**: X25519 keypairs addressed by a nine-digit numeric id
//!   derived from the public key
//! - **Handshake**: two-message exchange that proves a peer owns the key
//!   behind the id it connected as, then derives a shared AES-256-GCM key
//! - **Message Codec**: JSON payloads sealed into hex-encoded `msg` frames
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │           Message Payloads              │  JSON, tagged by type
//! ├─────────────────────────────────────────┤
//! │           AEAD Encryption               │  AES-256-GCM, random IV
//! ├─────────────────────────────────────────┤
//! │              Wire Frames                │  handshake-syn/ack, msg
//! ├─────────────────────────────────────────┤
//! │      Transport (numeric-id routed)      │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use protocol::{codec, Handshake, Identity, MessagePayload};
//!
//! let alice = Arc::new(Identity::generate());
//! let bob = Arc::new(Identity::generate());
//!
//! let mut dialer = Handshake::new_initiator(alice.clone(), bob.numeric_id().clone());
//! let mut listener = Handshake::new_responder(bob.clone(), alice.numeric_id().clone());
//!
//! let syn = dialer.start().unwrap();
//! let accepted = listener.receive(&syn).unwrap();
//! let completed = dialer.receive(&accepted.reply.unwrap()).unwrap();
//!
//! let frame = codec::seal_message(&completed.secret, &MessagePayload::text("hi")).unwrap();
//! let opened = codec::open_message(&accepted.secret, &frame).unwrap();
//! assert_eq!(opened, MessagePayload::text("hi"));
//! ```
//!
//! ## Modules
//!
//! - [`identity`]: Keypairs, numeric ids, credentials
//! - [`handshake`]: Peer verification and shared secret derivation
//! - [`codec`]: Message encryption and decryption
//! - [`messages`]: Wire frame and payload definitions
//! - [`aead`]: AES-256-GCM primitive
//! - [`error`]: Error types

pub mod aead;
pub mod codec;
pub mod error;
pub mod handshake;
pub mod identity;
pub mod messages;

pub use aead::{AeadKey, Sealed, KEY_LENGTH, NONCE_LENGTH, TAG_LENGTH};
pub use error::{ProtocolError, Result};
pub use handshake::{
    derive_shared_secret, verify_peer, Handshake, HandshakeOutcome, HandshakePhase, Role,
    SharedSecret,
};
pub use identity::{Identity, Jwk, NumericId, PeerPublicKey, NUMERIC_ID_DIGITS};
pub use messages::{
    EncryptedPayload, Message, MessagePayload, Sender, WireFrame, MAX_ATTACHMENT_SIZE,
};
