//! # Concord Client
//!
//! Client role of the Concord collaboration core.
//!
//! This crate provides:
//! - Optimistic proposals applied locally before host confirmation
//! - A pending set with timed resends until confirmation or rejection
//! - Rollback of rejected proposals
//! - History catch-up after reconnects

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod client;
mod config;
mod error;

pub use client::{Client, ClientStats};
pub use config::ClientConfig;
pub use error::{ClientError, ClientResult};
