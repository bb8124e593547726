//! # HashHello Messenger Library
//!
//! Peer sessions, encrypted local storage and the async runtime for the
//! HashHello end-to-end encrypted messenger.
//!
//! ## Overview
//!
//! - **Sessions**: One state machine per peer, from transport open through
//!   the handshake to a secure channel and back
//! - **Registry**: Routes transport events to sessions and keeps at most one
//!   transport per peer
//! - **Storage**: Identity, chat histories and contacts encrypted at rest
//!   under a password-derived key
//! - **Runtime**: Event loop, reconnect timer and persistence
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                         Messenger                          │
//! ├────────────────────────────────────────────────────────────┤
//! │                                                            │
//! │  ┌──────────────────────────────────────────────────────┐  │
//! │  │                  SessionRegistry                     │  │
//! │  │   ┌─────────────┐ ┌─────────────┐ ┌─────────────┐    │  │
//! │  │   │ PeerSession │ │ PeerSession │ │ PeerSession │    │  │
//! │  │   └─────────────┘ └─────────────┘ └─────────────┘    │  │
//! │  └──────────────────────────────────────────────────────┘  │
//! │                                                            │
//! │  ┌──────────────────────┐  ┌────────────────────────────┐  │
//! │  │   SecureStorage      │  │       ContactBook          │  │
//! │  └──────────────────────┘  └────────────────────────────┘  │
//! │                                                            │
//! └────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//!                      Transport (black box)
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`contacts`]: Local address book
//! - [`registry`]: Multi-session registry
//! - [`runtime`]: Async messenger
//! - [`session`]: Per-peer state machine
//! - [`storage`]: Encrypted persistence and backups
//! - [`transport`]: Transport abstraction and in-memory implementation

pub mod config;
pub mod contacts;
pub mod registry;
pub mod runtime;
pub mod session;
pub mod storage;
pub mod transport;

// Re-export protocol for convenience
pub use protocol;

pub use config::Config;
pub use contacts::ContactBook;
pub use registry::{ChatSummary, RegistryError, RegistryEvent, SessionRegistry};
pub use runtime::{Messenger, MessengerEvent, MessengerState};
pub use session::{ChatRecord, PeerSession, SessionState};
pub use storage::{BackupBundle, PendingImport, SecureStorage, StorageError};
pub use transport::{
    Connection, ConnectionId, MemoryNetwork, MemoryTransport, Transport, TransportError,
    TransportEvent,
};
