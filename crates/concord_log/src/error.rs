//! Error types for the event log engine.

use concord_protocol::EventId;
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Opaque error produced by the embedder's reducer.
pub type DomainError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur in engine operations.
///
/// Every failing operation is atomic: when an error is returned, the log,
/// the snapshots, and the derived state are unchanged.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid construction parameters.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// What was wrong.
        message: String,
    },

    /// A dispatched event does not sort strictly after the log tail.
    #[error("event {id} does not extend the log tail")]
    OutOfOrder {
        /// Id of the offending event.
        id: EventId,
    },

    /// An event with this id is already in the log.
    #[error("duplicate event id {id}")]
    DuplicateEvent {
        /// The duplicated id.
        id: EventId,
    },

    /// The reducer reported a domain error.
    #[error("reducer failed: {0}")]
    Reducer(#[source] DomainError),
}
