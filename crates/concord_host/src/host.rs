//! Host role: the single authority over event ordering.
//!
//! The host validates proposals, overwrites their timestamp and source,
//! appends them to the authoritative log, and rebroadcasts them to every
//! registered client through the domain policy's per-client filter.
//! Accepted ids are remembered forever so a duplicate or replayed proposal
//! is rejected even after the event itself was removed.

use crate::error::HostResult;
use crate::policy::HostPolicy;
use concord_log::EventLog;
use concord_protocol::{
    ClientId, Clock, Event, EventId, EventSource, Message, Port, PortListener, PortSubscription,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

/// Counters describing a host's activity.
#[derive(Debug, Clone, Default)]
pub struct HostStats {
    /// Proposals accepted and broadcast.
    pub accepted: u64,
    /// Proposals rejected (duplicates, policy failures, apply failures).
    pub rejected: u64,
    /// Broadcast passes performed.
    pub broadcasts: u64,
    /// History requests served.
    pub history_requests: u64,
}

struct ClientEntry<P> {
    port: Arc<dyn Port<P>>,
    // Held so dropping the entry aborts the port registration.
    _subscription: PortSubscription,
}

struct HostInner<P> {
    clients: HashMap<ClientId, ClientEntry<P>>,
    past_ids: HashSet<EventId>,
}

/// The host role.
pub struct Host<S, P> {
    engine: Arc<EventLog<S, P>>,
    policy: Arc<dyn HostPolicy<P>>,
    clock: Arc<dyn Clock>,
    inner: Mutex<HostInner<P>>,
    stats: Mutex<HostStats>,
    // Handed to per-client port listeners so they can route back here
    // without keeping the host alive.
    self_ref: Weak<Host<S, P>>,
}

/// Port listener that routes one client's messages into the host.
struct ClientChannel<S, P> {
    host: Weak<Host<S, P>>,
    client_id: ClientId,
}

impl<S, P> PortListener<P> for ClientChannel<S, P>
where
    S: Send + Sync + 'static,
    P: Clone + Send + Sync + 'static,
{
    fn on_message(&self, message: Message<P>) {
        if let Some(host) = self.host.upgrade() {
            host.handle_client_message(&self.client_id, message);
        }
    }

    fn on_message_error(&self, reason: &str) {
        tracing::warn!(client = %self.client_id, reason, "malformed message ignored");
    }
}

impl<S, P> Host<S, P>
where
    S: Send + Sync + 'static,
    P: Clone + Send + Sync + 'static,
{
    /// Creates a host around an authoritative engine.
    pub fn new(
        engine: Arc<EventLog<S, P>>,
        policy: Arc<dyn HostPolicy<P>>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            engine,
            policy,
            clock,
            inner: Mutex::new(HostInner {
                clients: HashMap::new(),
                past_ids: HashSet::new(),
            }),
            stats: Mutex::new(HostStats::default()),
            self_ref: Weak::clone(self_ref),
        })
    }

    /// Returns the authoritative engine.
    pub fn engine(&self) -> &Arc<EventLog<S, P>> {
        &self.engine
    }

    /// Returns a copy of the activity counters.
    pub fn stats(&self) -> HostStats {
        self.stats.lock().clone()
    }

    /// Returns the number of registered clients.
    pub fn client_count(&self) -> usize {
        self.inner.lock().clients.len()
    }

    /// Returns true if an event id has ever been accepted.
    pub fn is_known(&self, id: &EventId) -> bool {
        self.inner.lock().past_ids.contains(id)
    }

    /// Registers a client and subscribes to its port.
    ///
    /// Registering an id again replaces the previous port; the old
    /// registration is aborted.
    pub fn add_client(&self, client_id: ClientId, port: Arc<dyn Port<P>>) {
        let channel: Arc<dyn PortListener<P>> = Arc::new(ClientChannel {
            host: Weak::clone(&self.self_ref),
            client_id: client_id.clone(),
        });
        let subscription = port.subscribe(channel);
        self.inner.lock().clients.insert(
            client_id,
            ClientEntry {
                port,
                _subscription: subscription,
            },
        );
    }

    /// Drops a client registration and aborts its port subscription.
    pub fn remove_client(&self, client_id: &ClientId) {
        self.inner.lock().clients.remove(client_id);
    }

    /// Creates and broadcasts a host-originated event.
    pub fn dispatch(&self, payload: P) -> HostResult<EventId> {
        let id = EventId::generate();
        let event = Event::new(id.clone(), self.stamp(&id), EventSource::host(), payload);
        self.inner.lock().past_ids.insert(id.clone());
        self.engine.dispatch(event.clone())?;
        self.broadcast(&event);
        Ok(id)
    }

    /// Removes an authoritative event from the log.
    ///
    /// The id stays in the past-id set, so a client retrying the same id
    /// is still rejected as a duplicate.
    pub fn remove_event(&self, id: &EventId) -> HostResult<()> {
        self.engine.remove_event(id)?;
        Ok(())
    }

    /// Handles a message arriving from a client's port.
    pub fn handle_client_message(&self, client_id: &ClientId, message: Message<P>) {
        match message {
            Message::Event { event } => self.handle_proposal(client_id, event),
            Message::RequestHistory { since } => self.handle_history_request(client_id, since),
            other => {
                tracing::debug!(
                    client = %client_id,
                    kind = other.type_name(),
                    "unexpected message on host port ignored"
                );
            }
        }
    }

    fn handle_proposal(&self, client_id: &ClientId, proposed: Event<P>) {
        if !self.validate_proposal(client_id, &proposed) {
            self.stats.lock().rejected += 1;
            self.post_rejection(client_id, proposed.id);
            return;
        }

        // The proposal becomes authoritative: the host's clock and the
        // registered client id override whatever the client sent.
        let timestamp = self.stamp(&proposed.id);
        let event = Event {
            timestamp,
            source: EventSource::client(client_id.clone()),
            ..proposed
        };

        self.inner.lock().past_ids.insert(event.id.clone());
        match self.engine.dispatch(event.clone()) {
            Ok(()) => {
                self.stats.lock().accepted += 1;
                self.broadcast(&event);
            }
            Err(err) => {
                // The id stays recorded so a retry cannot resurrect it.
                tracing::warn!(id = %event.id, error = %err, "accepted proposal failed to apply; rejecting");
                self.stats.lock().rejected += 1;
                self.post_rejection(client_id, event.id);
            }
        }
    }

    fn validate_proposal(&self, client_id: &ClientId, event: &Event<P>) -> bool {
        if self.inner.lock().past_ids.contains(&event.id) {
            tracing::debug!(id = %event.id, client = %client_id, "duplicate proposal");
            return false;
        }
        self.policy.validate(event, client_id)
    }

    fn handle_history_request(&self, client_id: &ClientId, since: i64) {
        self.stats.lock().history_requests += 1;
        let events: Vec<Event<P>> = self
            .engine
            .events_since(since)
            .into_iter()
            .filter_map(|event| self.policy.filter_for_client(&event, client_id))
            .collect();

        let port = self.client_port(client_id);
        let Some(port) = port else {
            tracing::debug!(client = %client_id, "history request from unregistered client dropped");
            return;
        };
        if let Err(err) = port.post(Message::EventHistory { events }) {
            tracing::warn!(client = %client_id, error = %err, "failed to post history reply");
        }
    }

    fn post_rejection(&self, client_id: &ClientId, event_id: EventId) {
        let Some(port) = self.client_port(client_id) else {
            tracing::debug!(client = %client_id, "rejection for unregistered client dropped");
            return;
        };
        if let Err(err) = port.post(Message::Rejection { event_id }) {
            tracing::warn!(client = %client_id, error = %err, "failed to post rejection");
        }
    }

    fn client_port(&self, client_id: &ClientId) -> Option<Arc<dyn Port<P>>> {
        self.inner
            .lock()
            .clients
            .get(client_id)
            .map(|entry| Arc::clone(&entry.port))
    }

    /// Posts an event to every registered client through the per-client
    /// filter. A failing post is logged and never aborts the loop.
    fn broadcast(&self, event: &Event<P>) {
        let recipients: Vec<(ClientId, Arc<dyn Port<P>>)> = self
            .inner
            .lock()
            .clients
            .iter()
            .map(|(id, entry)| (id.clone(), Arc::clone(&entry.port)))
            .collect();
        self.stats.lock().broadcasts += 1;

        for (client_id, port) in recipients {
            let Some(filtered) = self.policy.filter_for_client(event, &client_id) else {
                continue;
            };
            if let Err(err) = port.post(Message::Event { event: filtered }) {
                tracing::warn!(client = %client_id, error = %err, "broadcast post failed; continuing");
            }
        }
    }

    /// Authoritative timestamp for the next event.
    ///
    /// The wall clock is clamped so `(timestamp, id)` always sorts strictly
    /// after the log tail, even when the clock stalls or steps backwards.
    fn stamp(&self, id: &EventId) -> i64 {
        let now = self.clock.now_ms();
        match self.engine.last_event_key() {
            Some((tail_ts, tail_id)) => {
                let stamp = now.max(tail_ts);
                if stamp == tail_ts && *id <= tail_id {
                    tail_ts + 1
                } else {
                    stamp
                }
            }
            None => now,
        }
    }
}
