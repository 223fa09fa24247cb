//! Inbound events sent by clients to the relay.
//!
//! Each WebSocket text frame carries one JSON object tagged by `type`:
//!
//! ```json
//! {"type":"join","name":"Ann"}
//! {"type":"message","content":"hi"}
//! ```
//!
//! Disconnects have no frame of their own; the relay derives them from the
//! transport closing.

use serde::{Deserialize, Serialize};

/// Events a client can send over its connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientEvent {
    /// Announce a display name for this connection.
    ///
    /// The relay trims the name and ignores it if nothing is left.
    Join {
        /// Requested display name.
        name: String,
    },

    /// Broadcast a line of text to everyone connected.
    Message {
        /// Message text. Whitespace-only content is dropped by the relay.
        content: String,
    },
}

impl ClientEvent {
    /// Convenience constructor for a join event.
    #[must_use]
    pub fn join(name: impl Into<String>) -> Self {
        Self::Join { name: name.into() }
    }

    /// Convenience constructor for a message event.
    #[must_use]
    pub fn message(content: impl Into<String>) -> Self {
        Self::Message {
            content: content.into(),
        }
    }
}
