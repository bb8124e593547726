//! Async runtime wiring the registry, transport and storage together.
//!
//! The [`Messenger`] owns the session registry behind an async mutex and
//! runs two background tasks:
//!
//! ```text
//!  transport events ──> event loop ──┐
//!                                    ├──> SessionRegistry ──> MessengerEvent (broadcast)
//!  reconnect timer ─────────────────┘            │
//!                                                └──> SecureStorage (sessions blob)
//! ```
//!
//! Transport events are consumed one at a time in arrival order. Every
//! mutation that changes persisted data rewrites the sessions blob; a failed
//! write is logged and leaves the previous blob in place.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use protocol::{Identity, Message, MessagePayload, NumericId};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::NetworkConfig;
use crate::contacts::ContactBook;
use crate::registry::{ChatSummary, RegistryError, RegistryEvent, SessionRegistry};
use crate::session::{ChatRecord, SessionState};
use crate::storage::SecureStorage;
use crate::transport::{Transport, TransportEvent};

/// Messenger lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessengerState {
    /// Not started, or fully stopped.
    Stopped,
    /// Background tasks are running.
    Running,
    /// Shutting down.
    ShuttingDown,
}

/// Events emitted by the messenger.
#[derive(Debug, Clone)]
pub enum MessengerEvent {
    /// Messenger state changed.
    StateChanged(MessengerState),
    /// A peer session changed state.
    SessionStateChanged {
        peer: NumericId,
        state: SessionState,
    },
    /// A message arrived from a peer.
    MessageReceived { peer: NumericId, message: Message },
    /// A peer failed identity verification.
    SecurityAlert { peer: NumericId, reason: String },
    /// A handshake failed without an identity problem.
    HandshakeFailed { peer: NumericId, reason: String },
    /// Persisting data failed; the previous blob is unchanged.
    PersistFailed { message: String },
}

impl From<RegistryEvent> for MessengerEvent {
    fn from(event: RegistryEvent) -> Self {
        match event {
            RegistryEvent::StateChanged { peer, state } => {
                MessengerEvent::SessionStateChanged { peer, state }
            }
            RegistryEvent::MessageReceived { peer, message } => {
                MessengerEvent::MessageReceived { peer, message }
            }
            RegistryEvent::SecurityAlert { peer, reason } => {
                MessengerEvent::SecurityAlert { peer, reason }
            }
            RegistryEvent::HandshakeFailed { peer, reason } => {
                MessengerEvent::HandshakeFailed { peer, reason }
            }
        }
    }
}

/// State shared between the messenger handle and its background tasks.
struct Shared<T: Transport> {
    registry: Mutex<SessionRegistry<T>>,
    storage: Mutex<SecureStorage>,
    contacts: Mutex<ContactBook>,
    event_tx: broadcast::Sender<MessengerEvent>,
}

impl<T: Transport> Shared<T> {
    /// Publishes pending registry events and persists if anything changed.
    async fn flush(&self, registry: &mut SessionRegistry<T>) {
        for event in registry.take_events() {
            let _ = self.event_tx.send(event.into());
        }
        if registry.take_dirty() {
            let snapshot = registry.snapshot();
            let storage = self.storage.lock().await;
            if let Err(e) = storage.save_sessions(&snapshot) {
                warn!(error = %e, "Failed to persist sessions");
                let _ = self.event_tx.send(MessengerEvent::PersistFailed {
                    message: e.to_string(),
                });
            }
        }
    }
}

/// A running messenger for one unlocked identity.
pub struct Messenger<T: Transport + 'static> {
    identity: Arc<Identity>,
    shared: Arc<Shared<T>>,
    state: Arc<RwLock<MessengerState>>,
    transport_events: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    reconnect_interval: Duration,
    shutdown_token: CancellationToken,
}

impl<T: Transport + 'static> Messenger<T> {
    /// Creates a messenger over an unlocked `storage`.
    ///
    /// Persisted sessions are restored as `Disconnected`; persisted contacts
    /// are loaded.
    pub fn new(
        identity: Arc<Identity>,
        transport: T,
        transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        storage: SecureStorage,
        network: &NetworkConfig,
    ) -> Result<Self> {
        let chats = storage
            .load_sessions()
            .context("Failed to load saved sessions")?;
        let contacts = storage
            .load_contacts()
            .context("Failed to load contacts")?;

        let mut registry = SessionRegistry::new(Arc::clone(&identity), transport);
        registry.restore(chats);
        debug!(sessions = registry.len(), contacts = contacts.len(), "Restored saved state");

        let (event_tx, _) = broadcast::channel(256);

        Ok(Self {
            identity,
            shared: Arc::new(Shared {
                registry: Mutex::new(registry),
                storage: Mutex::new(storage),
                contacts: Mutex::new(contacts),
                event_tx,
            }),
            state: Arc::new(RwLock::new(MessengerState::Stopped)),
            transport_events: Mutex::new(Some(transport_events)),
            reconnect_interval: network.reconnect_interval(),
            shutdown_token: CancellationToken::new(),
        })
    }

    /// Returns the local identity.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Returns the current state.
    pub async fn state(&self) -> MessengerState {
        *self.state.read().await
    }

    /// Returns a receiver for messenger events.
    pub fn subscribe(&self) -> broadcast::Receiver<MessengerEvent> {
        self.shared.event_tx.subscribe()
    }

    /// Returns the storage, for inspection.
    pub fn storage(&self) -> &Mutex<SecureStorage> {
        &self.shared.storage
    }

    /// Starts the event loop and the reconnect timer.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != MessengerState::Stopped {
                anyhow::bail!("Messenger is already running");
            }
            *state = MessengerState::Running;
        }

        let events = self
            .transport_events
            .lock()
            .await
            .take()
            .context("Messenger cannot be restarted after stop")?;

        let shared = Arc::clone(&self.shared);
        let token = self.shutdown_token.clone();
        tokio::spawn(async move {
            Self::run_event_loop(shared, events, token).await;
        });

        let shared = Arc::clone(&self.shared);
        let token = self.shutdown_token.clone();
        let interval = self.reconnect_interval;
        tokio::spawn(async move {
            Self::run_reconnect_timer(shared, interval, token).await;
        });

        self.emit_event(MessengerEvent::StateChanged(MessengerState::Running));
        info!(id = %self.identity.numeric_id(), "Messenger started");
        Ok(())
    }

    async fn run_event_loop(
        shared: Arc<Shared<T>>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
        shutdown_token: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = shutdown_token.cancelled() => {
                    debug!("Event loop received shutdown signal");
                    break;
                }
                event = events.recv() => {
                    let Some(event) = event else {
                        info!("Transport event channel closed");
                        break;
                    };
                    let mut registry = shared.registry.lock().await;
                    registry.handle_event(event);
                    shared.flush(&mut registry).await;
                }
            }
        }
    }

    async fn run_reconnect_timer(
        shared: Arc<Shared<T>>,
        interval: Duration,
        shutdown_token: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown_token.cancelled() => break,
                _ = ticker.tick() => {
                    let mut registry = shared.registry.lock().await;
                    let dialed = registry.reconnect_all();
                    if dialed > 0 {
                        debug!(dialed, "Periodic reconnect sweep");
                    }
                    shared.flush(&mut registry).await;
                }
            }
        }
    }

    /// Stops background tasks, closes every session and persists.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            match *state {
                MessengerState::Stopped => return Ok(()),
                MessengerState::ShuttingDown => {
                    anyhow::bail!("Messenger is already shutting down")
                }
                MessengerState::Running => *state = MessengerState::ShuttingDown,
            }
        }
        self.emit_event(MessengerEvent::StateChanged(MessengerState::ShuttingDown));

        self.shutdown_token.cancel();

        {
            let mut registry = self.shared.registry.lock().await;
            registry.close_all();
            let snapshot = registry.snapshot();
            registry.take_events();
            registry.take_dirty();
            if let Err(e) = self.shared.storage.lock().await.save_sessions(&snapshot) {
                warn!(error = %e, "Failed to persist sessions on shutdown");
            }
        }

        *self.state.write().await = MessengerState::Stopped;
        self.emit_event(MessengerEvent::StateChanged(MessengerState::Stopped));
        info!("Messenger stopped");
        Ok(())
    }

    fn emit_event(&self, event: MessengerEvent) {
        let _ = self.shared.event_tx.send(event);
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    /// Opens or reuses the session with the peer named by `input`.
    pub async fn dial(&self, input: &str) -> Result<NumericId, RegistryError> {
        let mut registry = self.shared.registry.lock().await;
        let result = registry.dial(input);
        self.shared.flush(&mut registry).await;
        result
    }

    /// Encrypts and sends `payload` to `peer`.
    pub async fn send(
        &self,
        peer: &NumericId,
        payload: MessagePayload,
    ) -> Result<Message, RegistryError> {
        let mut registry = self.shared.registry.lock().await;
        let result = registry.send(peer, payload);
        self.shared.flush(&mut registry).await;
        result
    }

    /// Clears the unread count of `peer`.
    pub async fn activate(&self, peer: &NumericId) -> Result<(), RegistryError> {
        let mut registry = self.shared.registry.lock().await;
        let result = registry.activate(peer);
        self.shared.flush(&mut registry).await;
        result
    }

    /// Closes the session with `peer`.
    pub async fn close(&self, peer: &NumericId) -> Result<(), RegistryError> {
        let mut registry = self.shared.registry.lock().await;
        let result = registry.close(peer);
        self.shared.flush(&mut registry).await;
        result
    }

    /// Deletes the session with `peer` and its history.
    pub async fn remove(&self, peer: &NumericId) -> Result<(), RegistryError> {
        let mut registry = self.shared.registry.lock().await;
        let result = registry.remove(peer);
        self.shared.flush(&mut registry).await;
        result
    }

    /// Re-dials every `Disconnected` or `Offline` session immediately.
    pub async fn network_restored(&self) -> usize {
        let mut registry = self.shared.registry.lock().await;
        let dialed = registry.reconnect_all();
        self.shared.flush(&mut registry).await;
        info!(dialed, "Network restored");
        dialed
    }

    /// Returns the chat list, most recent first.
    pub async fn chat_list(&self) -> Vec<ChatSummary> {
        self.shared.registry.lock().await.chat_list()
    }

    /// Returns the message history with `peer`.
    pub async fn messages(&self, peer: &NumericId) -> Option<Vec<Message>> {
        self.shared
            .registry
            .lock()
            .await
            .messages(peer)
            .map(<[Message]>::to_vec)
    }

    /// Returns the state of the session with `peer`.
    pub async fn session_state(&self, peer: &NumericId) -> Option<SessionState> {
        self.shared.registry.lock().await.state(peer)
    }

    /// Returns the persisted form of every session.
    pub async fn snapshot(&self) -> BTreeMap<NumericId, ChatRecord> {
        self.shared.registry.lock().await.snapshot()
    }

    // =========================================================================
    // Contacts
    // =========================================================================

    /// Returns a copy of the contact book.
    pub async fn contacts(&self) -> ContactBook {
        self.shared.contacts.lock().await.clone()
    }

    /// Names `peer` and persists the contact book.
    pub async fn set_contact(&self, peer: NumericId, name: &str) {
        let mut contacts = self.shared.contacts.lock().await;
        contacts.set(peer, name);
        self.persist_contacts(&contacts).await;
    }

    /// Removes the name for `peer` and persists the contact book.
    pub async fn remove_contact(&self, peer: &NumericId) {
        let mut contacts = self.shared.contacts.lock().await;
        if contacts.remove(peer).is_some() {
            self.persist_contacts(&contacts).await;
        }
    }

    async fn persist_contacts(&self, contacts: &ContactBook) {
        if let Err(e) = self.shared.storage.lock().await.save_contacts(contacts) {
            warn!(error = %e, "Failed to persist contacts");
            self.emit_event(MessengerEvent::PersistFailed {
                message: e.to_string(),
            });
        }
    }
}
