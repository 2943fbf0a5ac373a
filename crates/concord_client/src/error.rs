//! Error types for the client role.

use concord_log::EngineError;
use concord_protocol::PortError;
use thiserror::Error;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors that can occur in client operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Invalid construction parameters.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// What was wrong.
        message: String,
    },

    /// The local engine refused an operation.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// The port refused a message.
    #[error("port error: {0}")]
    Port(#[from] PortError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_errors_pass_through() {
        let err: ClientError = EngineError::InvalidConfig {
            message: "snapshot interval must be at least 1".into(),
        }
        .into();
        assert!(err.to_string().contains("snapshot interval"));
    }
}
