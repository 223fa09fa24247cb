//! JSON encoding for WebSocket text frames.
//!
//! The relay decodes [`ClientEvent`]s and encodes [`ChatEvent`]s; the
//! opposite pair exists for clients and tests.

use crate::client::ClientEvent;
use crate::event::ChatEvent;

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for CodecError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Encodes a [`ChatEvent`] into a JSON text frame.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the event cannot be serialized.
pub fn encode_event(event: &ChatEvent) -> Result<String, CodecError> {
    Ok(serde_json::to_string(event)?)
}

/// Decodes a [`ChatEvent`] from a JSON text frame.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the text is not a valid event.
pub fn decode_event(text: &str) -> Result<ChatEvent, CodecError> {
    Ok(serde_json::from_str(text)?)
}

/// Encodes a [`ClientEvent`] into a JSON text frame.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the event cannot be serialized.
pub fn encode_client(event: &ClientEvent) -> Result<String, CodecError> {
    Ok(serde_json::to_string(event)?)
}

/// Decodes a [`ClientEvent`] from a JSON text frame.
///
/// # Errors
///
/// Returns `CodecError::Serialization` for malformed JSON, an unknown
/// `type` tag, or missing fields.
pub fn decode_client(text: &str) -> Result<ClientEvent, CodecError> {
    Ok(serde_json::from_str(text)?)
}
