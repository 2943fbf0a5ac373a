//! # Concord Protocol
//!
//! Event model and wire messages for the Concord collaboration core.
//!
//! This crate provides:
//! - `Event` records ordered chronologically by `(timestamp, id)`
//! - Wire messages (`event`, `rejection`, `requestHistory`, `eventHistory`)
//! - The reconnecting `Port` contract and an in-memory loopback pair
//! - A stable sorted merge used for timeline insertion
//! - A millisecond `Clock` contract
//!
//! This is a pure protocol crate with no network I/O.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod clock;
mod event;
mod merge;
mod messages;
mod port;

pub use clock::{Clock, ManualClock, SystemClock};
pub use event::{ClientId, Event, EventId, EventSource};
pub use merge::merge_by;
pub use messages::Message;
pub use port::{
    loopback, LoopbackLink, LoopbackPort, Port, PortError, PortListener, PortResult,
    PortSubscription,
};
