//! Connection registry for the relay.
//!
//! The [`Registry`] is the authoritative set of live connections and the
//! display names bound to them. It is owned by the relay task and never
//! shared, so it needs no locking. Connections are kept in registration
//! order, which is also the fan-out order.
//!
//! The registry is generic over the per-connection delivery handle `S` so it
//! carries no transport knowledge of its own.

use std::fmt;

/// Process-unique identifier assigned to a connection at accept time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Wraps a raw identifier value.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw identifier value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Errors that can occur during registry operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// The requested display name is empty after trimming.
    #[error("display name is empty")]
    InvalidName,
    /// The connection is not (or no longer) registered.
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),
    /// The connection already has a display name; names never change.
    #[error("connection {id} is already bound as {name:?}")]
    AlreadyBound {
        /// Connection that tried to rebind.
        id: ConnectionId,
        /// Name it is already bound to.
        name: String,
    },
}

/// A live connection as seen by the registry.
#[derive(Debug)]
pub struct Connection<S> {
    id: ConnectionId,
    display_name: Option<String>,
    sink: S,
}

impl<S> Connection<S> {
    /// Returns the connection identifier.
    #[must_use]
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    /// Returns the bound display name, or `None` before a successful join.
    #[must_use]
    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    /// Returns the delivery handle for this connection.
    #[must_use]
    pub const fn sink(&self) -> &S {
        &self.sink
    }
}

/// Ordered set of live connections.
#[derive(Debug)]
pub struct Registry<S> {
    connections: Vec<Connection<S>>,
}

impl<S> Default for Registry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> Registry<S> {
    /// Creates an empty registry.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            connections: Vec::new(),
        }
    }

    /// Adds a newly accepted connection with no display name.
    ///
    /// Callers never register the same id twice; ids come from a monotonic
    /// allocator.
    pub fn register(&mut self, id: ConnectionId, sink: S) {
        debug_assert!(self.get(id).is_none(), "{id} registered twice");
        self.connections.push(Connection {
            id,
            display_name: None,
            sink,
        });
    }

    /// Binds a display name to a connection, returning the trimmed name.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidName`] if `name` is empty after
    /// trimming, [`RegistryError::UnknownConnection`] if `id` is not
    /// registered, or [`RegistryError::AlreadyBound`] if the connection
    /// already has a name.
    pub fn bind(&mut self, id: ConnectionId, name: &str) -> Result<&str, RegistryError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(RegistryError::InvalidName);
        }

        let conn = self
            .connections
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or(RegistryError::UnknownConnection(id))?;

        if let Some(existing) = &conn.display_name {
            return Err(RegistryError::AlreadyBound {
                id,
                name: existing.clone(),
            });
        }

        Ok(conn.display_name.insert(name.to_string()).as_str())
    }

    /// Removes a connection, returning it if it was present.
    ///
    /// Removing an absent connection is a no-op.
    pub fn unregister(&mut self, id: ConnectionId) -> Option<Connection<S>> {
        let index = self.connections.iter().position(|c| c.id == id)?;
        Some(self.connections.remove(index))
    }

    /// Looks up a live connection.
    #[must_use]
    pub fn get(&self, id: ConnectionId) -> Option<&Connection<S>> {
        self.connections.iter().find(|c| c.id == id)
    }

    /// Returns the current connections in registration order.
    #[must_use]
    pub fn snapshot(&self) -> &[Connection<S>] {
        &self.connections
    }

    /// Number of live connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Returns `true` if no connections are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
