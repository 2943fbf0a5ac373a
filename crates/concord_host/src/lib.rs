//! # Concord Host
//!
//! Host role of the Concord collaboration core.
//!
//! This crate provides:
//! - Validation and duplicate rejection of client proposals
//! - Authoritative timestamping and source assignment
//! - Broadcast with per-client filtering
//! - History serving for reconnect catch-up

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod host;
mod policy;

pub use error::{HostError, HostResult};
pub use host::{Host, HostStats};
pub use policy::{AcceptAll, HostPolicy};
