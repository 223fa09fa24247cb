//! Broadcast relay: turns per-connection inbound events into ordered
//! [`ChatEvent`]s and fans them out to every registered connection.
//!
//! All registry mutation and event construction happens on one task that
//! drains a single inbound queue (see [`Relay::spawn`]). Socket tasks only
//! talk to it through a [`RelayHandle`], so every broadcast sees the registry
//! exactly as it stood when the event was processed, and timestamps follow
//! processing order.
//!
//! Fan-out never waits on a recipient: each connection has a bounded outbox
//! and a full or closed outbox just loses that one event.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use babble_proto::event::{ChatEvent, Timestamp};
use chrono::{DateTime, Utc};
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::registry::{ConnectionId, Registry};

/// Author attributed to messages from connections that never joined.
pub const ANONYMOUS: &str = "Anonymous";

/// Default capacity of the relay's inbound queue.
pub const DEFAULT_INBOUND_QUEUE_SIZE: usize = 1024;

/// Sending half of a connection's outbound queue.
pub type Outbox = mpsc::Sender<Arc<ChatEvent>>;

/// Events the relay accepts, each scoped to one connection.
#[derive(Debug)]
pub enum Inbound {
    /// The transport accepted a new connection.
    Connected {
        /// Identifier allocated for the connection.
        id: ConnectionId,
        /// Where broadcasts for this connection are queued.
        outbox: Outbox,
    },
    /// The connection announced a display name.
    Join {
        /// Originating connection.
        id: ConnectionId,
        /// Name as sent by the client, untrimmed.
        name: String,
    },
    /// The connection sent a chat line.
    Message {
        /// Originating connection.
        id: ConnectionId,
        /// Text as sent by the client, untrimmed.
        body: String,
    },
    /// The transport closed the connection.
    Disconnected {
        /// Connection that went away.
        id: ConnectionId,
    },
}

/// Why a single recipient missed a broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// The recipient's outbound queue is at capacity.
    #[error("outbound queue is full")]
    QueueFull,
    /// The recipient's writer has already gone away.
    #[error("connection is closed")]
    Closed,
}

/// The relay task is no longer running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("relay task has stopped")]
pub struct RelayClosed;

/// Hands out event timestamps that never go backwards.
///
/// Each stamp is truncated to milliseconds and clamped to be no earlier than
/// the previous one, so a wall-clock step backwards cannot reorder events.
#[derive(Debug, Default)]
pub struct EventClock {
    last: Option<Timestamp>,
}

impl EventClock {
    /// Creates a clock that has issued no timestamps yet.
    #[must_use]
    pub const fn new() -> Self {
        Self { last: None }
    }

    /// Stamps an event with the current time.
    pub fn now(&mut self) -> Timestamp {
        self.stamp(Utc::now())
    }

    /// Stamps an event observed at `at`.
    pub fn stamp(&mut self, at: DateTime<Utc>) -> Timestamp {
        let candidate = Timestamp::from_datetime(at);
        let stamp = self.last.map_or(candidate, |last| last.max(candidate));
        self.last = Some(stamp);
        stamp
    }
}

/// The ordering authority. Owns the registry and the event clock.
#[derive(Debug, Default)]
pub struct Relay {
    registry: Registry<Outbox>,
    clock: EventClock,
}

impl Relay {
    /// Creates a relay with no connections.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            registry: Registry::new(),
            clock: EventClock::new(),
        }
    }

    /// Starts the relay task and returns a handle for feeding it events.
    ///
    /// The task runs until every clone of the returned handle is dropped.
    ///
    /// # Panics
    ///
    /// Panics if `inbound_queue_size` is zero.
    #[must_use]
    pub fn spawn(inbound_queue_size: usize) -> RelayHandle {
        let (tx, rx) = mpsc::channel(inbound_queue_size);
        tokio::spawn(Self::new().run(rx));
        RelayHandle {
            tx,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Processes inbound events one at a time until the queue closes.
    pub async fn run(mut self, mut inbound: mpsc::Receiver<Inbound>) {
        tracing::debug!("relay task started");
        while let Some(event) = inbound.recv().await {
            self.handle(event);
        }
        tracing::info!(connections = self.registry.len(), "relay task stopped");
    }

    /// Applies one inbound event, returning the broadcast it produced, if any.
    pub fn handle(&mut self, inbound: Inbound) -> Option<Arc<ChatEvent>> {
        match inbound {
            Inbound::Connected { id, outbox } => {
                self.register(id, outbox);
                None
            }
            Inbound::Join { id, name } => self.handle_join(id, &name),
            Inbound::Message { id, body } => self.handle_message(id, &body),
            Inbound::Disconnected { id } => self.handle_disconnect(id),
        }
    }

    /// Adds a freshly accepted connection. It starts without a display name.
    pub fn register(&mut self, id: ConnectionId, outbox: Outbox) {
        self.registry.register(id, outbox);
        tracing::info!(conn = %id, connections = self.registry.len(), "connection registered");
    }

    /// Binds a display name and announces the join to everyone, joiner
    /// included.
    ///
    /// Blank names, unknown connections and repeat joins are dropped without
    /// any event.
    pub fn handle_join(&mut self, id: ConnectionId, raw_name: &str) -> Option<Arc<ChatEvent>> {
        let name = match self.registry.bind(id, raw_name) {
            Ok(name) => name.to_string(),
            Err(e) => {
                tracing::warn!(conn = %id, error = %e, "join dropped");
                return None;
            }
        };

        tracing::info!(conn = %id, name = %name, "joined");
        let event = ChatEvent::system(format!("{name} has joined the chat"), self.clock.now());
        Some(self.broadcast(event))
    }

    /// Broadcasts a chat line to everyone, sender included.
    ///
    /// Connections that have not joined are attributed to [`ANONYMOUS`].
    /// Whitespace-only bodies and messages from unknown connections are
    /// dropped.
    pub fn handle_message(&mut self, id: ConnectionId, raw_body: &str) -> Option<Arc<ChatEvent>> {
        let body = raw_body.trim();
        if body.is_empty() {
            tracing::debug!(conn = %id, "empty message dropped");
            return None;
        }

        let Some(conn) = self.registry.get(id) else {
            tracing::warn!(conn = %id, "message from unknown connection dropped");
            return None;
        };
        let author = conn.display_name().unwrap_or(ANONYMOUS).to_string();

        let event = ChatEvent::user(author, body, self.clock.now());
        Some(self.broadcast(event))
    }

    /// Removes a connection and, if it had joined, tells everyone who is left.
    ///
    /// Disconnecting an unknown or already removed connection does nothing.
    pub fn handle_disconnect(&mut self, id: ConnectionId) -> Option<Arc<ChatEvent>> {
        let Some(conn) = self.registry.unregister(id) else {
            tracing::debug!(conn = %id, "disconnect for unknown connection ignored");
            return None;
        };
        tracing::info!(conn = %id, connections = self.registry.len(), "connection closed");

        let name = conn.display_name()?;
        tracing::info!(conn = %id, name = %name, "left");
        let event = ChatEvent::system(format!("{name} has left the chat"), self.clock.now());
        Some(self.broadcast(event))
    }

    /// Number of live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Read access to the registry.
    #[must_use]
    pub const fn registry(&self) -> &Registry<Outbox> {
        &self.registry
    }

    /// Queues `event` for every connection in the current registry snapshot.
    fn broadcast(&self, event: ChatEvent) -> Arc<ChatEvent> {
        let event = Arc::new(event);
        let snapshot = self.registry.snapshot();

        let mut delivered = 0usize;
        for conn in snapshot {
            match deliver(conn.sink(), &event) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(conn = %conn.id(), error = %e, "delivery failed, event dropped");
                }
            }
        }

        tracing::debug!(
            system = event.is_system(),
            recipients = snapshot.len(),
            delivered,
            "broadcast event"
        );
        event
    }
}

/// Enqueues an event on one outbox without waiting.
fn deliver(outbox: &Outbox, event: &Arc<ChatEvent>) -> Result<(), DeliveryError> {
    outbox.try_send(Arc::clone(event)).map_err(|e| match e {
        TrySendError::Full(_) => DeliveryError::QueueFull,
        TrySendError::Closed(_) => DeliveryError::Closed,
    })
}

/// Cloneable entry point to a running relay task.
///
/// Also allocates connection ids, so ids are unique for as long as any
/// handle to the relay exists.
#[derive(Debug, Clone)]
pub struct RelayHandle {
    tx: mpsc::Sender<Inbound>,
    next_id: Arc<AtomicU64>,
}

impl RelayHandle {
    /// Registers a new connection and returns its id.
    ///
    /// # Errors
    ///
    /// Returns [`RelayClosed`] if the relay task has stopped.
    pub async fn connect(&self, outbox: Outbox) -> Result<ConnectionId, RelayClosed> {
        let id = ConnectionId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.send(Inbound::Connected { id, outbox }).await?;
        Ok(id)
    }

    /// Forwards a join request.
    ///
    /// # Errors
    ///
    /// Returns [`RelayClosed`] if the relay task has stopped.
    pub async fn join(&self, id: ConnectionId, name: impl Into<String>) -> Result<(), RelayClosed> {
        self.send(Inbound::Join {
            id,
            name: name.into(),
        })
        .await
    }

    /// Forwards a chat line.
    ///
    /// # Errors
    ///
    /// Returns [`RelayClosed`] if the relay task has stopped.
    pub async fn message(
        &self,
        id: ConnectionId,
        body: impl Into<String>,
    ) -> Result<(), RelayClosed> {
        self.send(Inbound::Message {
            id,
            body: body.into(),
        })
        .await
    }

    /// Reports that the transport closed a connection.
    ///
    /// # Errors
    ///
    /// Returns [`RelayClosed`] if the relay task has stopped.
    pub async fn disconnect(&self, id: ConnectionId) -> Result<(), RelayClosed> {
        self.send(Inbound::Disconnected { id }).await
    }

    async fn send(&self, inbound: Inbound) -> Result<(), RelayClosed> {
        self.tx.send(inbound).await.map_err(|_| RelayClosed)
    }
}
