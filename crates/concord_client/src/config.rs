//! Configuration for the client role.

use crate::error::{ClientError, ClientResult};
use concord_protocol::ClientId;
use std::time::Duration;

/// Configuration for a client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// This participant's id; stamped into proposal sources.
    pub client_id: ClientId,
    /// How long to wait before resending an unconfirmed proposal.
    pub retry_timeout: Duration,
}

impl ClientConfig {
    /// Default proposal retry timeout.
    pub const DEFAULT_RETRY_TIMEOUT: Duration = Duration::from_secs(5);

    /// Creates a configuration with default values.
    pub fn new(client_id: impl Into<ClientId>) -> Self {
        Self {
            client_id: client_id.into(),
            retry_timeout: Self::DEFAULT_RETRY_TIMEOUT,
        }
    }

    /// Sets the proposal retry timeout.
    #[must_use]
    pub fn with_retry_timeout(mut self, timeout: Duration) -> Self {
        self.retry_timeout = timeout;
        self
    }

    /// Checks the configuration for construction-time errors.
    pub fn validate(&self) -> ClientResult<()> {
        if self.retry_timeout.is_zero() {
            return Err(ClientError::InvalidConfig {
                message: "retry timeout must be positive".into(),
            });
        }
        if self.client_id.is_host() {
            return Err(ClientError::InvalidConfig {
                message: "client id \"host\" is reserved".into(),
            });
        }
        Ok(())
    }
}
