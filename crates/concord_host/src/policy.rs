//! Host-side domain policy: proposal validation and per-client projection.

use concord_protocol::{ClientId, Event};

/// Domain policy injected into the host.
///
/// Both methods must be deterministic. `filter_for_client` runs once per
/// recipient per broadcast and once per event when serving history.
pub trait HostPolicy<P: Clone>: Send + Sync {
    /// Returns whether a proposed event is acceptable from this client.
    fn validate(&self, event: &Event<P>, client_id: &ClientId) -> bool {
        let _ = (event, client_id);
        true
    }

    /// Projects an event for one recipient.
    ///
    /// Returning `None` suppresses the event for that recipient; the
    /// returned event may also be a redacted copy.
    fn filter_for_client(&self, event: &Event<P>, client_id: &ClientId) -> Option<Event<P>> {
        let _ = client_id;
        Some(event.clone())
    }
}

/// Policy that accepts every proposal and broadcasts events unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl<P: Clone> HostPolicy<P> for AcceptAll {}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_protocol::{EventId, EventSource};

    #[test]
    fn accept_all_passes_everything_through() {
        let event = Event::new(EventId::from("a"), 100, EventSource::host(), 5i64);
        let client = ClientId::new("c1");

        assert!(HostPolicy::validate(&AcceptAll, &event, &client));
        let filtered = HostPolicy::filter_for_client(&AcceptAll, &event, &client);
        assert_eq!(filtered, Some(event));
    }
}
