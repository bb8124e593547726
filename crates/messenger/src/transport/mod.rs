//! Transport abstraction for peer-to-peer data channels.
//!
//! The messenger treats connection establishment, NAT traversal and delivery
//! as a black box. A transport dials peers by numeric id and reports what
//! happens on each connection as a stream of [`TransportEvent`]s, delivered
//! in arrival order.
//!
//! - [`memory`]: In-process transport used by tests and local demos

pub mod memory;

use std::fmt;
use std::sync::Arc;

use protocol::NumericId;
use thiserror::Error;

pub use memory::{MemoryNetwork, MemoryTransport};

/// Errors reported by a transport.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The peer address is not reachable right now.
    #[error("peer unavailable: {0}")]
    PeerUnavailable(String),

    /// The connection has been closed.
    #[error("connection closed")]
    Closed,

    /// Any other transport failure.
    #[error("transport error: {0}")]
    Other(String),
}

/// Identifier of a single transport connection.
///
/// A peer can be reached over several connections over time; events name
/// the connection they belong to so stale ones can be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A live data channel to one peer.
///
/// The handle is a plain capability: it carries no session state.
pub trait Connection: Send + Sync + fmt::Debug {
    /// Returns the connection identifier.
    fn id(&self) -> ConnectionId;

    /// Returns the numeric id the transport associates with the remote end.
    fn peer(&self) -> &NumericId;

    /// Queues one text frame for delivery.
    fn send(&self, frame: &str) -> Result<(), TransportError>;

    /// Closes the connection. Calling this more than once has no effect.
    fn close(&self);
}

/// Dials peers by numeric id.
pub trait Transport: Send + Sync {
    /// Starts a connection to `peer`.
    ///
    /// The handle is returned immediately; the outcome arrives later as an
    /// `Open` or `Error` event for the returned connection.
    fn dial(&self, peer: &NumericId) -> Result<Arc<dyn Connection>, TransportError>;
}

/// Something that happened on the transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A remote peer opened a connection to us.
    Incoming(Arc<dyn Connection>),
    /// The connection is ready to carry data.
    Open {
        connection: ConnectionId,
        peer: NumericId,
    },
    /// A text frame arrived.
    Data {
        connection: ConnectionId,
        peer: NumericId,
        frame: String,
    },
    /// The connection was closed by either side.
    Closed {
        connection: ConnectionId,
        peer: NumericId,
    },
    /// The connection failed.
    Error {
        connection: ConnectionId,
        peer: NumericId,
        error: TransportError,
    },
    /// Connectivity to the wider network came back.
    NetworkRestored,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_display() {
        assert_eq!(
            TransportError::PeerUnavailable("123456789".to_string()).to_string(),
            "peer unavailable: 123456789"
        );
        assert_eq!(TransportError::Closed.to_string(), "connection closed");
    }

    #[test]
    fn test_connection_id_display() {
        assert_eq!(ConnectionId(7).to_string(), "conn-7");
    }
}
