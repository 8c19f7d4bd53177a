//! Errors surfaced to bridge users.

use std::time::Duration;

use crate::bridge::protocol::ErrorInfo;

/// Why an outbound call did not produce a value.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CallError {
    /// The peer ran the operation and reported a failure.
    #[error("remote error: {0}")]
    Remote(ErrorInfo),

    /// The channel was torn down before the reply arrived.
    #[error("transport closed")]
    TransportClosed,

    #[error("call `{operation}` timed out after {timeout:?}")]
    Timeout {
        operation: String,
        timeout: Duration,
    },

    #[error("failed to encode request: {0}")]
    Encode(String),

    /// Broken bridge invariant, e.g. a correlation id issued twice.
    #[error("internal bridge error: {0}")]
    Internal(String),

    /// Name is empty or collides with a terminal envelope type.
    #[error("`{0}` cannot be used as an operation name")]
    InvalidOperation(String),
}

impl CallError {
    /// The peer's error description, for `Remote` failures.
    pub fn remote(&self) -> Option<&ErrorInfo> {
        match self {
            Self::Remote(info) => Some(info),
            _ => None,
        }
    }

    pub fn is_transport_closed(&self) -> bool {
        matches!(self, Self::TransportClosed)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Inbound requests are dispatched on tokio tasks.
    #[error("bridge must be created inside a tokio runtime")]
    NoRuntime,
}
