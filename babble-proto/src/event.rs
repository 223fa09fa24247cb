//! Outbound chat events.
//!
//! A [`ChatEvent`] is the single unit the relay fans out to every connected
//! client. It serializes to a flat JSON object:
//!
//! ```json
//! {"kind":"user","author":"Ann","content":"hi","timestamp":"2026-10-18T12:00:00.123Z"}
//! ```
//!
//! `author` only exists on `user` events; [`EventKind`] makes a system event
//! carrying an author unrepresentable.

use std::fmt;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A UTC instant at millisecond precision.
///
/// Serialized as RFC 3339 with exactly three fractional digits and a `Z`
/// suffix, the shape browsers produce with `Date.prototype.toISOString`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Creates a timestamp for the current instant.
    #[must_use]
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    /// Creates a timestamp from a `DateTime`, dropping sub-millisecond digits.
    #[must_use]
    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        Self(at.trunc_subsecs(3))
    }

    /// Creates a timestamp from milliseconds since the UNIX epoch.
    ///
    /// Returns `None` if the value is outside chrono's representable range.
    #[must_use]
    pub fn from_millis(millis: i64) -> Option<Self> {
        DateTime::from_timestamp_millis(millis).map(Self)
    }

    /// Returns the timestamp as milliseconds since the UNIX epoch.
    #[must_use]
    pub fn as_millis(&self) -> i64 {
        self.0.timestamp_millis()
    }

    /// Returns the underlying `DateTime`.
    #[must_use]
    pub const fn as_datetime(&self) -> &DateTime<Utc> {
        &self.0
    }

    /// Formats the timestamp as ISO-8601, e.g. `2026-10-18T12:00:00.123Z`.
    #[must_use]
    pub fn to_iso8601(&self) -> String {
        self.0.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    /// Parses an RFC 3339 timestamp, converting any offset to UTC.
    ///
    /// # Errors
    ///
    /// Returns a [`chrono::ParseError`] if `s` is not valid RFC 3339.
    pub fn parse(s: &str) -> Result<Self, chrono::ParseError> {
        DateTime::parse_from_rfc3339(s).map(|at| Self::from_datetime(at.with_timezone(&Utc)))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_iso8601())
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_iso8601())
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Who an event is attributed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum EventKind {
    /// A notice generated by the relay itself (joins and departures).
    System,
    /// A message typed by a connected client.
    User {
        /// Display name of the sending connection at the time it was sent.
        author: String,
    },
}

/// The canonical outbound message unit, fanned out to every connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatEvent {
    /// System notice or user-authored message.
    #[serde(flatten)]
    pub kind: EventKind,
    /// Text content. Never empty for events emitted by the relay.
    #[serde(rename = "content")]
    pub body: String,
    /// When the relay processed the event.
    pub timestamp: Timestamp,
}

impl ChatEvent {
    /// Creates a system notice.
    #[must_use]
    pub fn system(body: impl Into<String>, timestamp: Timestamp) -> Self {
        Self {
            kind: EventKind::System,
            body: body.into(),
            timestamp,
        }
    }

    /// Creates a user-authored message.
    #[must_use]
    pub fn user(author: impl Into<String>, body: impl Into<String>, timestamp: Timestamp) -> Self {
        Self {
            kind: EventKind::User {
                author: author.into(),
            },
            body: body.into(),
            timestamp,
        }
    }

    /// Returns the author of a user message, or `None` for system notices.
    #[must_use]
    pub fn author(&self) -> Option<&str> {
        match &self.kind {
            EventKind::System => None,
            EventKind::User { author } => Some(author),
        }
    }

    /// Returns `true` if this is a relay-generated notice.
    #[must_use]
    pub const fn is_system(&self) -> bool {
        matches!(self.kind, EventKind::System)
    }
}
