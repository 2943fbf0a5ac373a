//! The event log engine.
//!
//! State is derived exclusively by folding the embedder's reducer over the
//! log, which is kept strictly sorted by `(timestamp, id)`. Snapshots
//! checkpoint `(state, event_index)` pairs so that insertion into the past
//! and removal only replay the affected suffix.
//!
//! All failing operations are atomic: a reducer error leaves the log, the
//! snapshots, and the derived state exactly as they were.

use crate::config::LogConfig;
use crate::error::{DomainError, EngineError, EngineResult};
use crate::snapshot::{Snapshot, SnapshotId};
use concord_protocol::{merge_by, Event, EventId};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

type Listener<S> = Arc<dyn Fn(&S) + Send + Sync>;

struct ListenerSet<S> {
    entries: Vec<(u64, Listener<S>)>,
    next_id: u64,
}

impl<S> ListenerSet<S> {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_id: 0,
        }
    }
}

/// Handle for a state subscription.
///
/// Unsubscribing is idempotent; dropping the handle unsubscribes as well.
pub struct ListenerHandle {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl ListenerHandle {
    /// Removes the listener registration. Subsequent calls are no-ops.
    pub fn unsubscribe(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

struct Inner<S, P> {
    initial: Arc<S>,
    state: Arc<S>,
    events: Vec<Event<P>>,
    ids: HashSet<EventId>,
    snapshots: Vec<Snapshot<S>>,
    next_snapshot_id: u64,
}

impl<S, P> Inner<S, P> {
    /// Event index of the newest snapshot, or 0 when none exists.
    fn newest_snapshot_index(&self) -> usize {
        self.snapshots.last().map(|s| s.event_index).unwrap_or(0)
    }

    /// Newest snapshot whose prefix `[0, event_index)` is still intact when
    /// everything from `index` onward is about to change.
    fn rewind_base(&self, index: usize) -> (Arc<S>, usize, usize) {
        let keep = self.snapshots.partition_point(|s| s.event_index <= index);
        match self.snapshots[..keep].last() {
            Some(snapshot) => (Arc::clone(&snapshot.state), snapshot.event_index, keep),
            None => (Arc::clone(&self.initial), 0, keep),
        }
    }
}

/// An event log with derived state.
///
/// The engine is parameterized over the derived state `S` and the domain
/// payload `P`; both are opaque to it. The reducer is a plain function
/// injected at construction; it must be pure, must not mutate its input
/// state, and must not call back into the engine.
///
/// Public operations are designed for a single logical executor. The
/// internals are guarded so the type is `Send + Sync`, but callers that
/// share an engine across threads must serialize operations externally to
/// keep notification order meaningful.
pub struct EventLog<S, P> {
    reduce: Box<dyn Fn(&S, &Event<P>) -> Result<S, DomainError> + Send + Sync>,
    config: LogConfig,
    inner: Mutex<Inner<S, P>>,
    listeners: Arc<Mutex<ListenerSet<S>>>,
}

impl<S, P> EventLog<S, P> {
    /// Creates an engine with the default configuration.
    pub fn new<R>(initial: S, reduce: R) -> Self
    where
        R: Fn(&S, &Event<P>) -> Result<S, DomainError> + Send + Sync + 'static,
    {
        Self::build(initial, reduce, LogConfig::default())
    }

    /// Creates an engine with an explicit configuration.
    ///
    /// Fails fast on invalid parameters, e.g. a zero snapshot interval.
    pub fn with_config<R>(initial: S, reduce: R, config: LogConfig) -> EngineResult<Self>
    where
        R: Fn(&S, &Event<P>) -> Result<S, DomainError> + Send + Sync + 'static,
    {
        config.validate()?;
        Ok(Self::build(initial, reduce, config))
    }

    fn build<R>(initial: S, reduce: R, config: LogConfig) -> Self
    where
        R: Fn(&S, &Event<P>) -> Result<S, DomainError> + Send + Sync + 'static,
    {
        let initial = Arc::new(initial);
        Self {
            reduce: Box::new(reduce),
            config,
            inner: Mutex::new(Inner {
                state: Arc::clone(&initial),
                initial,
                events: Vec::new(),
                ids: HashSet::new(),
                snapshots: Vec::new(),
                next_snapshot_id: 0,
            }),
            listeners: Arc::new(Mutex::new(ListenerSet::new())),
        }
    }

    /// Returns the current derived state.
    ///
    /// The returned `Arc` points at the same allocation across calls until
    /// the next state transition.
    pub fn state(&self) -> Arc<S> {
        Arc::clone(&self.inner.lock().state)
    }

    /// Registers a state listener.
    ///
    /// The listener is invoked synchronously with the current state exactly
    /// once before this method returns, and again after every successful
    /// state transition. A panicking listener is isolated and reported; it
    /// never aborts the notification pass or the transition itself.
    /// Listeners may subscribe or unsubscribe others during notification;
    /// each pass iterates a snapshot of the listener list taken at its
    /// start.
    pub fn subscribe<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&S) + Send + Sync + 'static,
        S: 'static,
    {
        let listener: Listener<S> = Arc::new(listener);
        let id = {
            let mut set = self.listeners.lock();
            let id = set.next_id;
            set.next_id += 1;
            set.entries.push((id, Arc::clone(&listener)));
            id
        };

        let state = self.state();
        invoke_listener(&listener, &state);

        let weak = Arc::downgrade(&self.listeners);
        ListenerHandle {
            cancel: Some(Box::new(move || {
                prune_listener(&weak, id);
            })),
        }
    }

    /// Appends an event at the tail of the log.
    ///
    /// The event's `(timestamp, id)` must sort strictly after every current
    /// entry; older events belong in [`EventLog::insert_events`]. The
    /// reducer runs before anything is committed, so a reducer error leaves
    /// the engine untouched.
    pub fn dispatch(&self, event: Event<P>) -> EngineResult<()> {
        let state = {
            let mut inner = self.inner.lock();
            if inner.ids.contains(&event.id) {
                return Err(EngineError::DuplicateEvent {
                    id: event.id.clone(),
                });
            }
            if let Some(last) = inner.events.last() {
                if Event::chronological(last, &event) != Ordering::Less {
                    return Err(EngineError::OutOfOrder {
                        id: event.id.clone(),
                    });
                }
            }

            let next = (self.reduce)(&inner.state, &event).map_err(EngineError::Reducer)?;
            inner.ids.insert(event.id.clone());
            inner.events.push(event);
            inner.state = Arc::new(next);
            self.maybe_snapshot(&mut inner);
            Arc::clone(&inner.state)
        };
        self.notify(&state);
        Ok(())
    }

    /// Folds events into the current state without touching the log.
    ///
    /// Subscribers are notified once at the end. An empty slice is a
    /// no-op. All-or-nothing under reducer failure.
    pub fn replay(&self, events: &[Event<P>]) -> EngineResult<()> {
        if events.is_empty() {
            return Ok(());
        }
        let state = {
            let mut inner = self.inner.lock();
            let mut state = Arc::clone(&inner.state);
            for event in events {
                state = Arc::new((self.reduce)(&state, event).map_err(EngineError::Reducer)?);
            }
            inner.state = Arc::clone(&state);
            state
        };
        self.notify(&state);
        Ok(())
    }

    /// Captures a `(state, log length)` checkpoint.
    ///
    /// Returns the identity of the snapshot; [`EventLog::drop_snapshot`]
    /// removes exactly that snapshot. Capturing twice without an
    /// intervening transition returns the existing snapshot's id.
    pub fn create_snapshot(&self) -> SnapshotId {
        let mut inner = self.inner.lock();
        let event_index = inner.events.len();
        if let Some(last) = inner.snapshots.last() {
            if last.event_index == event_index {
                return last.id;
            }
        }
        let id = SnapshotId(inner.next_snapshot_id);
        inner.next_snapshot_id += 1;
        let state = Arc::clone(&inner.state);
        inner.snapshots.push(Snapshot {
            id,
            state,
            event_index,
        });
        id
    }

    /// Removes the snapshot with the given identity, if still present.
    pub fn drop_snapshot(&self, id: SnapshotId) {
        self.inner.lock().snapshots.retain(|s| s.id != id);
    }

    /// Discards the log and all snapshots and adopts a new baseline state.
    ///
    /// Subscribers are notified once.
    pub fn rebaseline(&self, new_state: S) {
        let state = {
            let mut inner = self.inner.lock();
            let state = Arc::new(new_state);
            inner.initial = Arc::clone(&state);
            inner.state = Arc::clone(&state);
            inner.events.clear();
            inner.ids.clear();
            inner.snapshots.clear();
            state
        };
        self.notify(&state);
    }

    /// Returns the number of events in the log.
    pub fn len(&self) -> usize {
        self.inner.lock().events.len()
    }

    /// Returns true if the log is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().events.is_empty()
    }

    /// Returns the timestamp of the newest event, if any.
    pub fn last_timestamp(&self) -> Option<i64> {
        self.inner.lock().events.last().map(|e| e.timestamp)
    }

    /// Returns the `(timestamp, id)` key of the newest event, if any.
    pub fn last_event_key(&self) -> Option<(i64, EventId)> {
        self.inner
            .lock()
            .events
            .last()
            .map(|e| (e.timestamp, e.id.clone()))
    }

    /// Returns true if an event with this id is in the log.
    pub fn contains_event(&self, id: &EventId) -> bool {
        self.inner.lock().ids.contains(id)
    }

    /// Returns the number of live snapshots.
    pub fn snapshot_count(&self) -> usize {
        self.inner.lock().snapshots.len()
    }

    /// Returns the event indexes of the live snapshots, ascending.
    pub fn snapshot_indices(&self) -> Vec<usize> {
        self.inner
            .lock()
            .snapshots
            .iter()
            .map(|s| s.event_index)
            .collect()
    }

    fn maybe_snapshot(&self, inner: &mut Inner<S, P>) {
        if inner.events.len() - inner.newest_snapshot_index() >= self.config.snapshot_interval {
            let id = SnapshotId(inner.next_snapshot_id);
            inner.next_snapshot_id += 1;
            let state = Arc::clone(&inner.state);
            let event_index = inner.events.len();
            inner.snapshots.push(Snapshot {
                id,
                state,
                event_index,
            });
        }
    }

    fn notify(&self, state: &Arc<S>) {
        let pass: Vec<Listener<S>> = self
            .listeners
            .lock()
            .entries
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in pass {
            invoke_listener(&listener, state);
        }
    }
}

impl<S, P: Clone> EventLog<S, P> {
    /// Integrates events that may belong anywhere in the timeline.
    ///
    /// `events` must be sorted ascending by `(timestamp, id)`; events whose
    /// id is already in the log are skipped. The engine rewinds to the
    /// newest snapshot still covering an unchanged prefix, merges the
    /// detached tail with the new events, and replays forward. Invalidated
    /// snapshots are dropped. Subscribers are notified exactly once; the
    /// internal rewind is not observable. An effectively empty input is a
    /// no-op. All-or-nothing under reducer failure.
    pub fn insert_events(&self, events: Vec<Event<P>>) -> EngineResult<()> {
        let state = {
            let mut inner = self.inner.lock();
            let fresh: Vec<Event<P>> = events
                .into_iter()
                .filter(|e| !inner.ids.contains(&e.id))
                .collect();
            if fresh.is_empty() {
                return Ok(());
            }
            debug_assert!(fresh
                .windows(2)
                .all(|pair| Event::chronological(&pair[0], &pair[1]) == Ordering::Less));

            let first_timestamp = fresh[0].timestamp;
            let anchor = inner
                .events
                .partition_point(|e| e.timestamp <= first_timestamp);
            let (base_state, base_index, keep_snapshots) = inner.rewind_base(anchor);

            let tail: Vec<Event<P>> = inner.events[base_index..].to_vec();
            let merged = merge_by(tail, fresh, Event::chronological);

            let mut state = base_state;
            for event in &merged {
                state = Arc::new((self.reduce)(&state, event).map_err(EngineError::Reducer)?);
            }

            for event in &merged {
                inner.ids.insert(event.id.clone());
            }
            inner.events.truncate(base_index);
            inner.events.extend(merged);
            inner.snapshots.truncate(keep_snapshots);
            inner.state = Arc::clone(&state);
            state
        };
        self.notify(&state);
        Ok(())
    }

    /// Removes the event with the given id from the log.
    ///
    /// Snapshots past the removal point are dropped and the suffix is
    /// replayed from the newest surviving one. An unknown id is a no-op
    /// with no notification.
    pub fn remove_event(&self, id: &EventId) -> EngineResult<()> {
        let state = {
            let mut inner = self.inner.lock();
            let Some(index) = inner.events.iter().position(|e| &e.id == id) else {
                return Ok(());
            };
            let (base_state, base_index, keep_snapshots) = inner.rewind_base(index);

            let suffix: Vec<Event<P>> = inner.events[base_index..]
                .iter()
                .filter(|e| &e.id != id)
                .cloned()
                .collect();

            let mut state = base_state;
            for event in &suffix {
                state = Arc::new((self.reduce)(&state, event).map_err(EngineError::Reducer)?);
            }

            inner.ids.remove(id);
            inner.events.truncate(base_index);
            inner.events.extend(suffix);
            inner.snapshots.truncate(keep_snapshots);
            inner.state = Arc::clone(&state);
            state
        };
        self.notify(&state);
        Ok(())
    }

    /// Returns a copy of the log, in chronological order.
    pub fn events(&self) -> Vec<Event<P>> {
        self.inner.lock().events.clone()
    }

    /// Returns the events with `timestamp > since`, in chronological order.
    pub fn events_since(&self, since: i64) -> Vec<Event<P>> {
        let inner = self.inner.lock();
        let start = inner.events.partition_point(|e| e.timestamp <= since);
        inner.events[start..].to_vec()
    }

    /// Returns a copy of the event with the given id, if present.
    pub fn find_event(&self, id: &EventId) -> Option<Event<P>> {
        let inner = self.inner.lock();
        if !inner.ids.contains(id) {
            return None;
        }
        inner.events.iter().find(|e| &e.id == id).cloned()
    }
}

fn invoke_listener<S>(listener: &Listener<S>, state: &Arc<S>) {
    if catch_unwind(AssertUnwindSafe(|| listener(state.as_ref()))).is_err() {
        tracing::warn!("state listener panicked; continuing notification");
    }
}

fn prune_listener<S>(listeners: &Weak<Mutex<ListenerSet<S>>>, id: u64) {
    if let Some(listeners) = listeners.upgrade() {
        listeners
            .lock()
            .entries
            .retain(|(entry_id, _)| *entry_id != id);
    }
}
