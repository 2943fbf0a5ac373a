//! Reconnecting message port: contract and in-memory loopback pair.
//!
//! A port is an ordered, at-least-once, bidirectional message channel that
//! survives reconnects. Posting while disconnected buffers the message for
//! ordered delivery on the next connect transition; duplicates are possible
//! across reconnects, so consumers must be idempotent under event id.

use crate::messages::Message;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;

/// Result type for port operations.
pub type PortResult<T> = Result<T, PortError>;

/// Errors raised by a port.
#[derive(Debug, Error)]
pub enum PortError {
    /// The other end of the channel is gone.
    #[error("port closed")]
    Closed,

    /// The underlying transport refused the message.
    #[error("send failed: {0}")]
    Send(String),
}

/// Receiver side of a port registration.
///
/// `on_connected`, `on_disconnected`, and `on_message_error` have empty
/// defaults so listeners only override the transitions they care about.
pub trait PortListener<P>: Send + Sync {
    /// Called for every inbound message, in delivery order.
    fn on_message(&self, message: Message<P>);

    /// Called when the port transitions to connected.
    fn on_connected(&self) {}

    /// Called when the port transitions to disconnected.
    fn on_disconnected(&self) {}

    /// Called when an inbound payload could not be decoded.
    fn on_message_error(&self, reason: &str) {
        let _ = reason;
    }
}

/// An asynchronous message channel with reconnect semantics.
pub trait Port<P>: Send + Sync {
    /// Enqueues a message.
    ///
    /// While disconnected the message is buffered and delivered, in order,
    /// when the port reconnects.
    fn post(&self, message: Message<P>) -> PortResult<()>;

    /// Registers a listener; the returned handle removes it again.
    fn subscribe(&self, listener: Arc<dyn PortListener<P>>) -> PortSubscription;

    /// Returns whether the port is currently connected.
    fn is_connected(&self) -> bool;
}

/// Abort handle for a port listener registration.
///
/// Cancelling is idempotent; dropping the handle cancels the registration
/// as well.
pub struct PortSubscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl PortSubscription {
    /// Wraps a cancellation action.
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Removes the listener registration. Subsequent calls are no-ops.
    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for PortSubscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for PortSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortSubscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

struct ListenerSet<P> {
    entries: Vec<(u64, Arc<dyn PortListener<P>>)>,
    next_id: u64,
}

impl<P> ListenerSet<P> {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_id: 0,
        }
    }
}

/// One endpoint of an in-memory port pair.
///
/// Delivery is synchronous: a `post` on one endpoint invokes the peer's
/// listeners before returning, preserving per-port order.
pub struct LoopbackPort<P> {
    up: Arc<AtomicBool>,
    listeners: Arc<Mutex<ListenerSet<P>>>,
    outbox: Mutex<VecDeque<Message<P>>>,
    peer: Mutex<Weak<LoopbackPort<P>>>,
}

impl<P> LoopbackPort<P> {
    fn new(up: Arc<AtomicBool>) -> Self {
        Self {
            up,
            listeners: Arc::new(Mutex::new(ListenerSet::new())),
            outbox: Mutex::new(VecDeque::new()),
            peer: Mutex::new(Weak::new()),
        }
    }

    fn listener_snapshot(&self) -> Vec<Arc<dyn PortListener<P>>> {
        self.listeners
            .lock()
            .entries
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect()
    }

    fn notify_connected(&self) {
        for listener in self.listener_snapshot() {
            listener.on_connected();
        }
    }

    fn notify_disconnected(&self) {
        for listener in self.listener_snapshot() {
            listener.on_disconnected();
        }
    }
}

impl<P: Clone> LoopbackPort<P> {
    fn deliver(&self, message: Message<P>) {
        for listener in self.listener_snapshot() {
            listener.on_message(message.clone());
        }
    }

    fn flush_outbox(&self) {
        let drained: Vec<Message<P>> = self.outbox.lock().drain(..).collect();
        if drained.is_empty() {
            return;
        }
        let peer = { self.peer.lock().upgrade() };
        let Some(peer) = peer else { return };
        for message in drained {
            peer.deliver(message);
        }
    }
}

impl<P: Clone + Send + Sync + 'static> Port<P> for LoopbackPort<P> {
    fn post(&self, message: Message<P>) -> PortResult<()> {
        if !self.up.load(Ordering::SeqCst) {
            self.outbox.lock().push_back(message);
            return Ok(());
        }
        let peer = { self.peer.lock().upgrade() };
        match peer {
            Some(peer) => {
                peer.deliver(message);
                Ok(())
            }
            None => Err(PortError::Closed),
        }
    }

    fn subscribe(&self, listener: Arc<dyn PortListener<P>>) -> PortSubscription {
        let id = {
            let mut set = self.listeners.lock();
            let id = set.next_id;
            set.next_id += 1;
            set.entries.push((id, listener));
            id
        };
        let weak = Arc::downgrade(&self.listeners);
        PortSubscription::new(move || {
            if let Some(listeners) = weak.upgrade() {
                listeners
                    .lock()
                    .entries
                    .retain(|(entry_id, _)| *entry_id != id);
            }
        })
    }

    fn is_connected(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }
}

/// A pair of in-memory ports joined by one link.
///
/// The link starts connected. [`LoopbackLink::set_up`] drives the shared
/// connect/disconnect state: on reconnect both endpoints flush their
/// buffered messages (in post order) and then raise `on_connected`.
pub struct LoopbackLink<P> {
    up: Arc<AtomicBool>,
    left: Arc<LoopbackPort<P>>,
    right: Arc<LoopbackPort<P>>,
}

/// Creates a connected in-memory port pair.
pub fn loopback<P: Clone + Send + Sync + 'static>() -> LoopbackLink<P> {
    let up = Arc::new(AtomicBool::new(true));
    let left = Arc::new(LoopbackPort::new(Arc::clone(&up)));
    let right = Arc::new(LoopbackPort::new(Arc::clone(&up)));
    *left.peer.lock() = Arc::downgrade(&right);
    *right.peer.lock() = Arc::downgrade(&left);
    LoopbackLink { up, left, right }
}

impl<P: Clone + Send + Sync + 'static> LoopbackLink<P> {
    /// Returns the left endpoint.
    pub fn left(&self) -> Arc<LoopbackPort<P>> {
        Arc::clone(&self.left)
    }

    /// Returns the right endpoint.
    pub fn right(&self) -> Arc<LoopbackPort<P>> {
        Arc::clone(&self.right)
    }

    /// Returns whether the link is up.
    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }

    /// Transitions the link. A no-op when the state does not change.
    pub fn set_up(&self, up: bool) {
        let was = self.up.swap(up, Ordering::SeqCst);
        if was == up {
            return;
        }
        if up {
            self.left.flush_outbox();
            self.right.flush_outbox();
            self.left.notify_connected();
            self.right.notify_connected();
        } else {
            self.left.notify_disconnected();
            self.right.notify_disconnected();
        }
    }
}
