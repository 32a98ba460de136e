//! Error types for the broker client.
//!
//! [`BrokerError`] covers every failure the client surfaces. Errors split into two
//! scopes:
//!
//! - **connection-scoped** (`Configuration`, `Transport`): dialing, channel,
//!   declare and stream failures. Retried by the supervisor once a client is running.
//! - **message-scoped** (`Serialization`, `Validation`, `Callback`): tied to a single
//!   message. The dispatch engine logs them and keeps reading.

use std::time::Duration;

use thiserror::Error;

/// Error returned by a consumer callback.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

/// Validation failures for envelopes, bindings and destinations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// A required envelope field is empty.
    #[error("field {0} required")]
    MissingField(&'static str),
    /// A consumer binding was registered without a routing key.
    #[error("routing key must not be empty")]
    EmptyRoutingKey,
    /// A publish targeted an empty destination.
    #[error("destination must not be empty")]
    EmptyDestination,
}

/// Errors produced by the broker client.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Bad address or configuration value. Fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Dial, channel, declare, consume or send failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Payload could not be encoded or a message body could not be decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Envelope, binding or destination failed validation.
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// A consumer callback failed.
    #[error("callback error: {0}")]
    Callback(CallbackError),

    /// The client has been shut down.
    #[error("client is shut down")]
    Shutdown,

    /// Background tasks did not stop within the shutdown grace period.
    #[error("shutdown grace {grace:?} exceeded; {pending} task(s) still running")]
    GraceExceeded {
        /// The configured grace duration.
        grace: Duration,
        /// Number of tasks that were still running.
        pending: usize,
    },
}

impl BrokerError {
    /// Wraps any displayable transport failure.
    pub fn transport(context: &str, err: impl std::fmt::Display) -> Self {
        BrokerError::Transport(format!("{context}: {err}"))
    }

    /// Returns a short stable label (snake_case) for logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            BrokerError::Configuration(_) => "configuration",
            BrokerError::Transport(_) => "transport",
            BrokerError::Serialization(_) => "serialization",
            BrokerError::Validation(_) => "validation",
            BrokerError::Callback(_) => "callback",
            BrokerError::Shutdown => "shutdown",
            BrokerError::GraceExceeded { .. } => "grace_exceeded",
        }
    }

    /// True for failures the supervisor retries on its backoff schedule.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BrokerError::Transport(_))
    }

    /// True for failures scoped to a single message.
    pub fn is_message_scoped(&self) -> bool {
        matches!(
            self,
            BrokerError::Serialization(_) | BrokerError::Validation(_) | BrokerError::Callback(_)
        )
    }
}
