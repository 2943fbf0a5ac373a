//! Wire messages exchanged between clients and the host.

use crate::event::{Event, EventId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A protocol message.
///
/// The envelope is format-neutral: in-memory ports carry `Message` values
/// directly, while [`Message::encode`] / [`Message::decode`] provide the
/// JSON form with a `type` discriminator for byte transports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Message<P> {
    /// A proposal (client to host) or an authoritative record (host to
    /// client).
    Event {
        /// The carried event.
        event: Event<P>,
    },
    /// The host refused a proposal; only the proposer receives this.
    #[serde(rename_all = "camelCase")]
    Rejection {
        /// Id of the refused proposal.
        event_id: EventId,
    },
    /// Request for every authoritative event newer than `since`.
    RequestHistory {
        /// Exclusive lower bound, milliseconds since the Unix epoch.
        since: i64,
    },
    /// Catch-up reply; events are sorted ascending chronologically.
    EventHistory {
        /// The events newer than the requested bound.
        events: Vec<Event<P>>,
    },
}

impl<P> Message<P> {
    /// Returns the wire name of the message type.
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Event { .. } => "event",
            Message::Rejection { .. } => "rejection",
            Message::RequestHistory { .. } => "requestHistory",
            Message::EventHistory { .. } => "eventHistory",
        }
    }
}

impl<P: Serialize> Message<P> {
    /// Encodes to the JSON wire form.
    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl<P: DeserializeOwned> Message<P> {
    /// Decodes from the JSON wire form.
    pub fn decode(input: &str) -> serde_json::Result<Self> {
        serde_json::from_str(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventSource;

    fn event(id: &str, timestamp: i64, value: i64) -> Event<i64> {
        Event::new(EventId::from(id), timestamp, EventSource::client("c1"), value)
    }

    #[test]
    fn type_names_match_wire_tags() {
        let msg: Message<i64> = Message::Event {
            event: event("a", 1, 0),
        };
        assert_eq!(msg.type_name(), "event");
        assert!(msg.encode().unwrap().contains("\"type\":\"event\""));

        let msg: Message<i64> = Message::RequestHistory { since: 5000 };
        assert_eq!(msg.type_name(), "requestHistory");
        assert!(msg.encode().unwrap().contains("\"type\":\"requestHistory\""));
    }

    #[test]
    fn rejection_uses_camel_case_field() {
        let msg: Message<i64> = Message::Rejection {
            event_id: EventId::from("b"),
        };
        let json = msg.encode().unwrap();
        assert!(json.contains("\"eventId\":\"b\""));
    }

    #[test]
    fn event_roundtrip() {
        let msg = Message::Event {
            event: event("a", 1000, 5),
        };
        let decoded = Message::<i64>::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn history_roundtrip() {
        let msg = Message::EventHistory {
            events: vec![event("a", 100, 1), event("b", 200, 2)],
        };
        let decoded = Message::<i64>::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn unknown_type_fails_to_decode() {
        let result = Message::<i64>::decode(r#"{"type":"compact","upTo":9}"#);
        assert!(result.is_err());
    }
}
