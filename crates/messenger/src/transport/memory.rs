//! In-process transport.
//!
//! A [`MemoryNetwork`] routes frames between endpoints that joined it under a
//! numeric id. Each endpoint receives its events on an unbounded channel, so
//! per-connection FIFO order holds exactly as on a real data channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use protocol::NumericId;
use tokio::sync::mpsc;
use tracing::debug;

use super::{Connection, ConnectionId, Transport, TransportError, TransportEvent};

type EventSender = mpsc::UnboundedSender<TransportEvent>;

#[derive(Default)]
struct NetworkInner {
    endpoints: HashMap<NumericId, EventSender>,
    next_connection: u64,
}

/// A simulated network shared by any number of endpoints.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

impl MemoryNetwork {
    /// Creates an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, NetworkInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers an endpoint reachable as `id`.
    ///
    /// Joining again under the same id replaces the previous endpoint.
    pub fn join(
        &self,
        id: NumericId,
    ) -> (MemoryTransport, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().endpoints.insert(id.clone(), tx);
        debug!(peer = %id, "Endpoint joined memory network");
        (
            MemoryTransport {
                local: id,
                network: self.clone(),
            },
            rx,
        )
    }

    /// Makes `id` unreachable. Existing connections are not affected.
    pub fn leave(&self, id: &NumericId) {
        self.lock().endpoints.remove(id);
    }

    /// Returns whether `id` is currently reachable.
    pub fn is_reachable(&self, id: &NumericId) -> bool {
        self.lock().endpoints.contains_key(id)
    }

    /// Tells the endpoint `id` that connectivity came back.
    pub fn signal_restored(&self, id: &NumericId) {
        if let Some(tx) = self.lock().endpoints.get(id) {
            let _ = tx.send(TransportEvent::NetworkRestored);
        }
    }
}

/// One endpoint's view of a [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemoryTransport {
    local: NumericId,
    network: MemoryNetwork,
}

impl MemoryTransport {
    /// Returns the id this endpoint joined under.
    pub fn local_id(&self) -> &NumericId {
        &self.local
    }
}

impl Transport for MemoryTransport {
    fn dial(&self, peer: &NumericId) -> Result<Arc<dyn Connection>, TransportError> {
        let mut inner = self.network.lock();
        let local_tx = inner
            .endpoints
            .get(&self.local)
            .cloned()
            .ok_or_else(|| TransportError::Other("local endpoint is not on the network".into()))?;

        inner.next_connection += 1;
        let id = ConnectionId(inner.next_connection);
        let closed = Arc::new(AtomicBool::new(false));

        let remote_tx = inner
            .endpoints
            .get(peer)
            .filter(|tx| !tx.is_closed())
            .cloned();

        let Some(remote_tx) = remote_tx else {
            closed.store(true, Ordering::SeqCst);
            let _ = local_tx.send(TransportEvent::Error {
                connection: id,
                peer: peer.clone(),
                error: TransportError::PeerUnavailable(peer.to_string()),
            });
            return Ok(Arc::new(MemoryConnection {
                id,
                peer: peer.clone(),
                local: self.local.clone(),
                local_tx: local_tx.clone(),
                remote_tx: local_tx,
                closed,
            }));
        };

        let ours = MemoryConnection {
            id,
            peer: peer.clone(),
            local: self.local.clone(),
            local_tx: local_tx.clone(),
            remote_tx: remote_tx.clone(),
            closed: Arc::clone(&closed),
        };
        let theirs = MemoryConnection {
            id,
            peer: self.local.clone(),
            local: peer.clone(),
            local_tx: remote_tx.clone(),
            remote_tx: local_tx.clone(),
            closed,
        };

        let _ = remote_tx.send(TransportEvent::Incoming(Arc::new(theirs)));
        let _ = remote_tx.send(TransportEvent::Open {
            connection: id,
            peer: self.local.clone(),
        });
        let _ = local_tx.send(TransportEvent::Open {
            connection: id,
            peer: peer.clone(),
        });

        debug!(peer = %peer, connection = %id, "Memory connection established");
        Ok(Arc::new(ours))
    }
}

/// One half of a memory connection.
struct MemoryConnection {
    id: ConnectionId,
    peer: NumericId,
    local: NumericId,
    local_tx: EventSender,
    remote_tx: EventSender,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl Connection for MemoryConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn peer(&self) -> &NumericId {
        &self.peer
    }

    fn send(&self, frame: &str) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.remote_tx
            .send(TransportEvent::Data {
                connection: self.id,
                peer: self.local.clone(),
                frame: frame.to_string(),
            })
            .map_err(|_| TransportError::Closed)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.remote_tx.send(TransportEvent::Closed {
            connection: self.id,
            peer: self.local.clone(),
        });
        let _ = self.local_tx.send(TransportEvent::Closed {
            connection: self.id,
            peer: self.peer.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(value: &str) -> NumericId {
        NumericId::new(value).unwrap()
    }

    #[tokio::test]
    async fn test_dial_delivers_incoming_and_open() {
        let network = MemoryNetwork::new();
        let (alice, mut alice_rx) = network.join(id("111111111"));
        let (_bob, mut bob_rx) = network.join(id("222222222"));

        let conn = alice.dial(&id("222222222")).unwrap();
        assert_eq!(conn.peer(), &id("222222222"));

        match bob_rx.recv().await.unwrap() {
            TransportEvent::Incoming(remote) => {
                assert_eq!(remote.id(), conn.id());
                assert_eq!(remote.peer(), &id("111111111"));
            }
            other => panic!("expected incoming, got {:?}", other),
        }
        assert!(matches!(bob_rx.recv().await.unwrap(), TransportEvent::Open { .. }));
        assert!(matches!(alice_rx.recv().await.unwrap(), TransportEvent::Open { .. }));
    }

    #[tokio::test]
    async fn test_frames_arrive_in_order() {
        let network = MemoryNetwork::new();
        let (alice, _alice_rx) = network.join(id("111111111"));
        let (_bob, mut bob_rx) = network.join(id("222222222"));

        let conn = alice.dial(&id("222222222")).unwrap();
        for i in 0..5 {
            conn.send(&format!("frame-{}", i)).unwrap();
        }

        let mut frames = Vec::new();
        while frames.len() < 5 {
            if let TransportEvent::Data { frame, peer, .. } = bob_rx.recv().await.unwrap() {
                assert_eq!(peer, id("111111111"));
                frames.push(frame);
            }
        }
        assert_eq!(frames, vec!["frame-0", "frame-1", "frame-2", "frame-3", "frame-4"]);
    }

    #[tokio::test]
    async fn test_dial_unreachable_reports_peer_unavailable() {
        let network = MemoryNetwork::new();
        let (alice, mut alice_rx) = network.join(id("111111111"));

        let conn = alice.dial(&id("999999999")).unwrap();
        match alice_rx.recv().await.unwrap() {
            TransportEvent::Error {
                connection, error, ..
            } => {
                assert_eq!(connection, conn.id());
                assert!(matches!(error, TransportError::PeerUnavailable(_)));
            }
            other => panic!("expected error, got {:?}", other),
        }
        assert_eq!(conn.send("x"), Err(TransportError::Closed));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_notifies_both_sides() {
        let network = MemoryNetwork::new();
        let (alice, mut alice_rx) = network.join(id("111111111"));
        let (_bob, mut bob_rx) = network.join(id("222222222"));

        let conn = alice.dial(&id("222222222")).unwrap();
        conn.close();
        conn.close();
        assert_eq!(conn.send("late"), Err(TransportError::Closed));

        // Open, then exactly one Closed.
        assert!(matches!(alice_rx.recv().await.unwrap(), TransportEvent::Open { .. }));
        assert!(matches!(alice_rx.recv().await.unwrap(), TransportEvent::Closed { .. }));
        assert!(alice_rx.try_recv().is_err());

        assert!(matches!(bob_rx.recv().await.unwrap(), TransportEvent::Incoming(_)));
        assert!(matches!(bob_rx.recv().await.unwrap(), TransportEvent::Open { .. }));
        assert!(matches!(bob_rx.recv().await.unwrap(), TransportEvent::Closed { .. }));
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_leave_and_restore() {
        let network = MemoryNetwork::new();
        let (_alice, mut alice_rx) = network.join(id("111111111"));
        assert!(network.is_reachable(&id("111111111")));

        network.signal_restored(&id("111111111"));
        assert!(matches!(
            alice_rx.recv().await.unwrap(),
            TransportEvent::NetworkRestored
        ));

        network.leave(&id("111111111"));
        assert!(!network.is_reachable(&id("111111111")));
    }
}
