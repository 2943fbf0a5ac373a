//! Event records and their chronological ordering.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use uuid::Uuid;

/// Unique identifier for an event.
///
/// Event ids are opaque strings that are:
/// - Globally unique per authoritative event
/// - Immutable once assigned
/// - The secondary ordering key of the log (lexicographic)
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    /// Creates an event id from an existing string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh, globally unique event id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventId({})", self.0)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for EventId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for EventId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Identifier of a participant in a collaboration session.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    /// The reserved id of the authoritative host.
    pub const HOST: &'static str = "host";

    /// Creates a client id from an existing string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the reserved host id.
    #[must_use]
    pub fn host() -> Self {
        Self(Self::HOST.to_string())
    }

    /// Returns true if this is the reserved host id.
    #[must_use]
    pub fn is_host(&self) -> bool {
        self.0 == Self::HOST
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientId({})", self.0)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ClientId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for ClientId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// The origin of an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSource {
    /// The id of the participant that produced the event.
    pub client_id: ClientId,
}

impl EventSource {
    /// Creates a source for the given client.
    pub fn client(client_id: impl Into<ClientId>) -> Self {
        Self {
            client_id: client_id.into(),
        }
    }

    /// Creates the reserved host source.
    #[must_use]
    pub fn host() -> Self {
        Self {
            client_id: ClientId::host(),
        }
    }
}

/// An immutable record in the event log.
///
/// Events carry an opaque domain payload; the core never inspects it.
/// Chronological order is `(timestamp, id)` — timestamp ascending, ties
/// broken by lexicographic id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event<P> {
    /// Globally unique id; identity and secondary ordering key.
    pub id: EventId,
    /// Milliseconds since the Unix epoch; primary ordering key.
    pub timestamp: i64,
    /// The origin of the event.
    pub source: EventSource,
    /// Domain-defined payload, opaque to the core.
    pub payload: P,
    /// Optional opaque metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

impl<P> Event<P> {
    /// Creates a new event without context metadata.
    pub fn new(id: EventId, timestamp: i64, source: EventSource, payload: P) -> Self {
        Self {
            id,
            timestamp,
            source,
            payload,
            context: None,
        }
    }

    /// Attaches context metadata.
    #[must_use]
    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }

    /// Returns the `(timestamp, id)` ordering key.
    pub fn sort_key(&self) -> (i64, &EventId) {
        (self.timestamp, &self.id)
    }

    /// Compares two events chronologically: timestamp ascending, then id.
    pub fn chronological(a: &Self, b: &Self) -> Ordering {
        a.sort_key().cmp(&b.sort_key())
    }
}
