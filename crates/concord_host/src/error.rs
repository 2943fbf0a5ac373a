//! Error types for the host role.

use concord_log::EngineError;
use concord_protocol::PortError;
use thiserror::Error;

/// Result type for host operations.
pub type HostResult<T> = Result<T, HostError>;

/// Errors that can occur in host operations.
#[derive(Debug, Error)]
pub enum HostError {
    /// The authoritative engine refused an operation.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// The port refused a message.
    #[error("port error: {0}")]
    Port(#[from] PortError),
}
