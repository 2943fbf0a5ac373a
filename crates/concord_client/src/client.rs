//! Client role: optimistic proposals against an authoritative host.
//!
//! A client wraps an event log engine and a port. Proposals are applied
//! locally before the host confirms them; the authoritative record that
//! comes back (possibly re-timestamped and re-sourced) is ground truth and
//! replaces the optimistic copy. Unconfirmed proposals are resent on a
//! timer and on every reconnect, and a rejection rolls the proposal out of
//! the local log.

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use concord_log::EventLog;
use concord_protocol::{
    Clock, Event, EventId, EventSource, Message, Port, PortListener, PortSubscription,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Counters describing a client's activity.
#[derive(Debug, Clone, Default)]
pub struct ClientStats {
    /// Proposals issued locally.
    pub proposed: u64,
    /// Proposals confirmed by an authoritative record.
    pub confirmed: u64,
    /// Proposals rolled back after a rejection.
    pub rejected: u64,
    /// Resends of unconfirmed proposals.
    pub retries: u64,
    /// Events integrated from history replies.
    pub history_events: u64,
}

#[derive(Debug, Clone)]
struct RetryEntry {
    due_ms: i64,
    event_id: EventId,
}

struct ClientInner<P> {
    pending: HashMap<EventId, Event<P>>,
    retries: VecDeque<RetryEntry>,
}

/// The client role.
///
/// Construction subscribes the client to its port; inbound messages and
/// connect transitions drive it from there. The embedder drives the retry
/// loop by calling [`Client::poll_retries`] from its timer.
pub struct Client<S, P> {
    config: ClientConfig,
    engine: Arc<EventLog<S, P>>,
    port: Arc<dyn Port<P>>,
    clock: Arc<dyn Clock>,
    inner: Mutex<ClientInner<P>>,
    stats: Mutex<ClientStats>,
    subscription: Mutex<Option<PortSubscription>>,
}

impl<S, P> Client<S, P>
where
    S: Send + Sync + 'static,
    P: Clone + Send + Sync + 'static,
{
    /// Creates a client and subscribes it to the port.
    pub fn connect(
        config: ClientConfig,
        engine: Arc<EventLog<S, P>>,
        port: Arc<dyn Port<P>>,
        clock: Arc<dyn Clock>,
    ) -> ClientResult<Arc<Self>> {
        config.validate()?;
        let client = Arc::new(Self {
            config,
            engine,
            port,
            clock,
            inner: Mutex::new(ClientInner {
                pending: HashMap::new(),
                retries: VecDeque::new(),
            }),
            stats: Mutex::new(ClientStats::default()),
            subscription: Mutex::new(None),
        });
        let listener: Arc<dyn PortListener<P>> = client.clone();
        let subscription = client.port.subscribe(listener);
        *client.subscription.lock() = Some(subscription);
        Ok(client)
    }

    /// Returns this participant's id.
    pub fn client_id(&self) -> &concord_protocol::ClientId {
        &self.config.client_id
    }

    /// Returns the wrapped engine.
    pub fn engine(&self) -> &Arc<EventLog<S, P>> {
        &self.engine
    }

    /// Returns a copy of the activity counters.
    pub fn stats(&self) -> ClientStats {
        self.stats.lock().clone()
    }

    /// Returns the number of unconfirmed proposals.
    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Returns true if a proposal with this id is unconfirmed.
    pub fn is_pending(&self, id: &EventId) -> bool {
        self.inner.lock().pending.contains_key(id)
    }

    /// Proposes a domain action.
    ///
    /// The event is stamped with a fresh id and the local clock, applied
    /// optimistically to the local log, and posted to the host. A reducer
    /// error rolls the proposal back and nothing is sent.
    pub fn propose(&self, payload: P) -> ClientResult<EventId> {
        let event = Event::new(
            EventId::generate(),
            self.clock.now_ms(),
            EventSource::client(self.config.client_id.clone()),
            payload,
        );
        self.inner
            .lock()
            .pending
            .insert(event.id.clone(), event.clone());

        if let Err(err) = self.engine.dispatch(event.clone()) {
            self.inner.lock().pending.remove(&event.id);
            return Err(ClientError::Engine(err));
        }
        self.stats.lock().proposed += 1;

        self.post_event(&event);
        self.arm_retry(&event.id);
        Ok(event.id)
    }

    /// Resends due proposals that are still unconfirmed and re-arms them.
    ///
    /// Entries whose proposal has been confirmed or rejected are discarded,
    /// which terminates their retry loop.
    pub fn poll_retries(&self) {
        let now = self.clock.now_ms();
        loop {
            let entry = {
                let mut inner = self.inner.lock();
                match inner.retries.front() {
                    Some(front) if front.due_ms <= now => inner.retries.pop_front(),
                    _ => None,
                }
            };
            let Some(entry) = entry else { break };

            let event = self.inner.lock().pending.get(&entry.event_id).cloned();
            if let Some(event) = event {
                self.stats.lock().retries += 1;
                self.post_event(&event);
                self.arm_retry(&event.id);
            }
        }
    }

    /// Returns the earliest retry deadline, if any proposals are armed.
    pub fn next_retry_at(&self) -> Option<i64> {
        self.inner.lock().retries.front().map(|entry| entry.due_ms)
    }

    fn post_event(&self, event: &Event<P>) {
        if let Err(err) = self.port.post(Message::Event {
            event: event.clone(),
        }) {
            tracing::warn!(id = %event.id, error = %err, "failed to post proposal; retry will resend");
        }
    }

    /// Schedules a resend for the proposal, replacing any entry already
    /// armed for the same id.
    ///
    /// Exactly one retry entry exists per pending proposal; re-arming
    /// moves its deadline. Reconnect resends would otherwise pile up a
    /// queue entry per cycle and multiply the timed resends.
    fn arm_retry(&self, id: &EventId) {
        let due_ms = self.clock.now_ms() + self.config.retry_timeout.as_millis() as i64;
        let mut inner = self.inner.lock();
        inner.retries.retain(|entry| entry.event_id != *id);
        inner.retries.push_back(RetryEntry {
            due_ms,
            event_id: id.clone(),
        });
    }

    /// Integrates an authoritative event from the host.
    fn handle_event(&self, event: Event<P>) {
        let was_pending = self.inner.lock().pending.remove(&event.id).is_some();
        if was_pending {
            self.stats.lock().confirmed += 1;
        }

        if let Some(existing) = self.engine.find_event(&event.id) {
            if existing.timestamp == event.timestamp && existing.source == event.source {
                tracing::debug!(id = %event.id, "duplicate authoritative event ignored");
                return;
            }
            // The authoritative record wins over the optimistic copy.
            if let Err(err) = self.engine.remove_event(&event.id) {
                tracing::warn!(id = %event.id, error = %err, "failed to drop optimistic copy");
                return;
            }
        }
        self.integrate(event);
    }

    fn integrate(&self, event: Event<P>) {
        let extends_tail = match self.engine.last_event_key() {
            Some(tail) => tail < (event.timestamp, event.id.clone()),
            None => true,
        };
        let result = if extends_tail {
            self.engine.dispatch(event)
        } else {
            self.engine.insert_events(vec![event])
        };
        if let Err(err) = result {
            tracing::warn!(error = %err, "failed to integrate authoritative event");
        }
    }

    /// Rolls back a rejected proposal.
    fn handle_rejection(&self, event_id: EventId) {
        if self.inner.lock().pending.remove(&event_id).is_none() {
            tracing::debug!(id = %event_id, "rejection for unknown proposal ignored");
            return;
        }
        self.stats.lock().rejected += 1;
        if let Err(err) = self.engine.remove_event(&event_id) {
            tracing::warn!(id = %event_id, error = %err, "failed to roll back rejected proposal");
        }
    }

    /// Integrates a history reply.
    fn handle_history(&self, events: Vec<Event<P>>) {
        let mut fresh = Vec::with_capacity(events.len());
        for event in events {
            let confirmed = self.inner.lock().pending.remove(&event.id).is_some();
            if confirmed {
                // History confirmed a proposal we never saw acknowledged;
                // the authoritative record replaces the optimistic copy.
                self.stats.lock().confirmed += 1;
                if let Err(err) = self.engine.remove_event(&event.id) {
                    tracing::warn!(id = %event.id, error = %err, "failed to drop optimistic copy");
                    continue;
                }
            }
            if !self.engine.contains_event(&event.id) {
                fresh.push(event);
            }
        }
        self.stats.lock().history_events += fresh.len() as u64;
        if let Err(err) = self.engine.insert_events(fresh) {
            tracing::warn!(error = %err, "failed to integrate event history");
        }
    }

    /// Resends unconfirmed proposals and requests catch-up history.
    fn handle_connected(&self) {
        let mut pending: Vec<Event<P>> = self.inner.lock().pending.values().cloned().collect();
        pending.sort_by(Event::chronological);
        for event in &pending {
            self.post_event(event);
            self.arm_retry(&event.id);
        }

        let since = self.engine.last_timestamp().unwrap_or(0);
        if let Err(err) = self.port.post(Message::RequestHistory { since }) {
            tracing::warn!(error = %err, "failed to request history");
        }
    }
}

impl<S, P> PortListener<P> for Client<S, P>
where
    S: Send + Sync + 'static,
    P: Clone + Send + Sync + 'static,
{
    fn on_message(&self, message: Message<P>) {
        match message {
            Message::Event { event } => self.handle_event(event),
            Message::Rejection { event_id } => self.handle_rejection(event_id),
            Message::EventHistory { events } => self.handle_history(events),
            Message::RequestHistory { .. } => {
                tracing::debug!("requestHistory on a client port ignored");
            }
        }
    }

    fn on_connected(&self) {
        self.handle_connected();
    }

    fn on_message_error(&self, reason: &str) {
        tracing::warn!(reason, "malformed message on client port ignored");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_protocol::{ClientId, ManualClock, PortError, PortResult};
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    struct Counter {
        count: i64,
    }

    /// Port double that records posts, in the role of a real transport.
    #[derive(Default)]
    struct CapturePort {
        posted: Mutex<Vec<Message<i64>>>,
    }

    impl CapturePort {
        fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn posted(&self) -> Vec<Message<i64>> {
            self.posted.lock().clone()
        }

        fn posted_event_ids(&self) -> Vec<EventId> {
            self.posted()
                .into_iter()
                .filter_map(|message| match message {
                    Message::Event { event } => Some(event.id),
                    _ => None,
                })
                .collect()
        }
    }

    impl Port<i64> for CapturePort {
        fn post(&self, message: Message<i64>) -> PortResult<()> {
            self.posted.lock().push(message);
            Ok(())
        }

        fn subscribe(&self, _listener: Arc<dyn PortListener<i64>>) -> PortSubscription {
            PortSubscription::new(|| {})
        }

        fn is_connected(&self) -> bool {
            true
        }
    }

    /// Port double that always fails to send.
    struct DeadPort;

    impl Port<i64> for DeadPort {
        fn post(&self, _message: Message<i64>) -> PortResult<()> {
            Err(PortError::Send("wire unplugged".into()))
        }

        fn subscribe(&self, _listener: Arc<dyn PortListener<i64>>) -> PortSubscription {
            PortSubscription::new(|| {})
        }

        fn is_connected(&self) -> bool {
            false
        }
    }

    fn counter_engine() -> Arc<EventLog<Counter, i64>> {
        Arc::new(EventLog::new(Counter { count: 0 }, |state, event| {
            if event.payload == i64::MIN {
                return Err("unsupported value".into());
            }
            Ok(Counter {
                count: state.count + event.payload,
            })
        }))
    }

    fn make_client(
        port: Arc<dyn Port<i64>>,
        clock: Arc<ManualClock>,
    ) -> Arc<Client<Counter, i64>> {
        Client::connect(
            ClientConfig::new("c1").with_retry_timeout(Duration::from_secs(5)),
            counter_engine(),
            port,
            clock,
        )
        .unwrap()
    }

    fn authoritative(id: &EventId, timestamp: i64, value: i64) -> Message<i64> {
        Message::Event {
            event: Event::new(
                id.clone(),
                timestamp,
                EventSource::client(ClientId::new("c1")),
                value,
            ),
        }
    }

    #[test]
    fn propose_applies_optimistically() {
        let port = CapturePort::new();
        let clock = Arc::new(ManualClock::new(1000));
        let client = make_client(port.clone(), clock);

        let id = client.propose(5).unwrap();

        assert_eq!(client.engine().state().count, 5);
        assert!(client.is_pending(&id));
        assert_eq!(port.posted_event_ids(), vec![id]);
        assert_eq!(client.next_retry_at(), Some(6000));
        assert_eq!(client.stats().proposed, 1);
    }

    #[test]
    fn propose_rolls_back_on_reducer_failure() {
        let port = CapturePort::new();
        let clock = Arc::new(ManualClock::new(1000));
        let client = make_client(port.clone(), clock);

        let result = client.propose(i64::MIN);

        assert!(matches!(result, Err(ClientError::Engine(_))));
        assert_eq!(client.pending_count(), 0);
        assert!(port.posted().is_empty());
        assert_eq!(client.engine().state().count, 0);
    }

    #[test]
    fn confirmation_adopts_the_authoritative_record() {
        let port = CapturePort::new();
        let clock = Arc::new(ManualClock::new(1000));
        let client = make_client(port.clone(), clock);

        let id = client.propose(5).unwrap();
        client.on_message(authoritative(&id, 1200, 5));

        assert_eq!(client.pending_count(), 0);
        let events = client.engine().events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].timestamp, 1200);
        assert_eq!(client.engine().state().count, 5);
        assert_eq!(client.stats().confirmed, 1);
    }

    #[test]
    fn duplicate_authoritative_delivery_is_idempotent() {
        let port = CapturePort::new();
        let clock = Arc::new(ManualClock::new(1000));
        let client = make_client(port.clone(), clock);

        let id = client.propose(5).unwrap();
        client.on_message(authoritative(&id, 1200, 5));
        client.on_message(authoritative(&id, 1200, 5));

        assert_eq!(client.engine().len(), 1);
        assert_eq!(client.engine().state().count, 5);
    }

    #[test]
    fn rejection_rolls_the_proposal_back() {
        let port = CapturePort::new();
        let clock = Arc::new(ManualClock::new(2000));
        let client = make_client(port.clone(), clock);

        let id = client.propose(7).unwrap();
        assert_eq!(client.engine().state().count, 7);

        client.on_message(Message::Rejection {
            event_id: id.clone(),
        });

        assert_eq!(client.pending_count(), 0);
        assert_eq!(client.engine().state().count, 0);
        assert!(client.engine().is_empty());
        assert_eq!(client.stats().rejected, 1);
    }

    #[test]
    fn rejection_for_unknown_id_is_ignored() {
        let port = CapturePort::new();
        let clock = Arc::new(ManualClock::new(1000));
        let client = make_client(port.clone(), clock);

        let id = client.propose(5).unwrap();
        client.on_message(authoritative(&id, 1200, 5));

        // A late rejection after confirmation must not touch the log.
        client.on_message(Message::Rejection {
            event_id: id.clone(),
        });

        assert_eq!(client.engine().len(), 1);
        assert_eq!(client.engine().state().count, 5);
    }

    #[test]
    fn non_tail_authoritative_event_is_inserted_in_order() {
        let port = CapturePort::new();
        let clock = Arc::new(ManualClock::new(1000));
        let client = make_client(port.clone(), clock);

        client.on_message(authoritative(&EventId::from("z"), 5000, 1));
        client.on_message(authoritative(&EventId::from("m"), 4000, 2));

        let timestamps: Vec<i64> = client
            .engine()
            .events()
            .iter()
            .map(|e| e.timestamp)
            .collect();
        assert_eq!(timestamps, vec![4000, 5000]);
        assert_eq!(client.engine().state().count, 3);
    }

    #[test]
    fn history_is_filtered_against_the_log() {
        let port = CapturePort::new();
        let clock = Arc::new(ManualClock::new(1000));
        let client = make_client(port.clone(), clock);

        client.on_message(authoritative(&EventId::from("a"), 5000, 1));
        client.on_message(Message::EventHistory {
            events: vec![
                Event::new(EventId::from("a"), 5000, EventSource::host(), 1),
                Event::new(EventId::from("b"), 5500, EventSource::host(), 2),
                Event::new(EventId::from("c"), 6000, EventSource::host(), 4),
            ],
        });

        assert_eq!(client.engine().len(), 3);
        assert_eq!(client.engine().state().count, 7);
        assert_eq!(client.stats().history_events, 2);
    }

    #[test]
    fn history_confirms_unacknowledged_proposals() {
        let port = CapturePort::new();
        let clock = Arc::new(ManualClock::new(1000));
        let client = make_client(port.clone(), clock);

        let id = client.propose(5).unwrap();
        client.on_message(Message::EventHistory {
            events: vec![Event::new(
                id.clone(),
                1300,
                EventSource::client(ClientId::new("c1")),
                5,
            )],
        });

        assert_eq!(client.pending_count(), 0);
        let events = client.engine().events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].timestamp, 1300);

        // The pending slot is gone, so a later rejection is a no-op.
        client.on_message(Message::Rejection {
            event_id: id.clone(),
        });
        assert_eq!(client.engine().len(), 1);
    }

    #[test]
    fn retries_resend_until_confirmed() {
        let port = CapturePort::new();
        let clock = Arc::new(ManualClock::new(1000));
        let client = make_client(port.clone(), Arc::clone(&clock));

        let id = client.propose(5).unwrap();
        assert_eq!(port.posted_event_ids().len(), 1);

        clock.advance(4999);
        client.poll_retries();
        assert_eq!(port.posted_event_ids().len(), 1); // not due yet

        clock.advance(1);
        client.poll_retries();
        assert_eq!(port.posted_event_ids(), vec![id.clone(), id.clone()]);
        assert_eq!(client.stats().retries, 1);

        client.on_message(authoritative(&id, 7000, 5));
        clock.advance(5000);
        client.poll_retries();
        assert_eq!(port.posted_event_ids().len(), 2); // loop terminated
        assert_eq!(client.next_retry_at(), None);
    }

    #[test]
    fn retries_stop_after_rejection() {
        let port = CapturePort::new();
        let clock = Arc::new(ManualClock::new(1000));
        let client = make_client(port.clone(), Arc::clone(&clock));

        let id = client.propose(5).unwrap();
        client.on_message(Message::Rejection { event_id: id });

        clock.advance(10_000);
        client.poll_retries();
        assert_eq!(port.posted_event_ids().len(), 1); // only the original
        assert_eq!(client.next_retry_at(), None);
    }

    #[test]
    fn reconnects_keep_a_single_retry_entry_per_proposal() {
        let port = CapturePort::new();
        let clock = Arc::new(ManualClock::new(1000));
        let client = make_client(port.clone(), Arc::clone(&clock));

        let id = client.propose(5).unwrap();
        client.on_connected();
        client.on_connected();

        // The proposal itself plus one resend per reconnect.
        assert_eq!(port.posted_event_ids().len(), 3);

        clock.advance(10_000);
        client.poll_retries();

        // Re-arming replaced the queued entry instead of stacking new
        // ones, so the due window produces a single timed resend.
        assert_eq!(port.posted_event_ids().len(), 4);
        assert_eq!(client.stats().retries, 1);
        assert!(client.is_pending(&id));
        assert_eq!(client.next_retry_at(), Some(16_000));
    }

    #[test]
    fn post_failure_is_survivable() {
        let clock = Arc::new(ManualClock::new(1000));
        let client = Client::connect(
            ClientConfig::new("c1"),
            counter_engine(),
            Arc::new(DeadPort),
            clock.clone(),
        )
        .unwrap();

        // The optimistic apply still happens; the retry queue keeps the
        // proposal alive for the next reconnect.
        let id = client.propose(5).unwrap();
        assert_eq!(client.engine().state().count, 5);
        assert!(client.is_pending(&id));
    }

    #[test]
    fn connected_resends_pending_and_requests_history() {
        let port = CapturePort::new();
        let clock = Arc::new(ManualClock::new(1000));
        let client = make_client(port.clone(), Arc::clone(&clock));

        let first = client.propose(1).unwrap();
        clock.advance(10);
        let second = client.propose(2).unwrap();
        client.on_message(authoritative(&first, 2000, 1));

        client.on_connected();

        let posted = port.posted();
        // propose, propose, resend of the still-pending proposal, history.
        assert_eq!(posted.len(), 4);
        match &posted[2] {
            Message::Event { event } => {
                assert_eq!(event.id, second);
                assert_eq!(event.payload, 2);
            }
            other => panic!("expected an event resend, got {other:?}"),
        }
        assert_eq!(posted[3], Message::RequestHistory { since: 2000 });
    }
}
