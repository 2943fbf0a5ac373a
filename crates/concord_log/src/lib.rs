//! # Concord Log
//!
//! Event log engine for the Concord collaboration core.
//!
//! This crate provides:
//! - An append-only log ordered by `(timestamp, id)`
//! - State derivation by replay of an embedder-supplied reducer
//! - Periodic snapshots with invalidation on out-of-order insertion
//! - Timeline insertion, removal by id, and hard rebaseline
//! - Synchronous state subscription with listener isolation

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod engine;
mod error;
mod snapshot;

pub use config::LogConfig;
pub use engine::{EventLog, ListenerHandle};
pub use error::{DomainError, EngineError, EngineResult};
pub use snapshot::SnapshotId;
