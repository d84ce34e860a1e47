//! Error types for the Replibox SDK.

use crate::transport::TransportError;
use rbx_cud::CudError;
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// What a timed out wait was waiting for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeoutKind {
    /// The transport did not connect in time.
    Connect,
    /// The server did not acknowledge a request in time.
    Response,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutKind::Connect => write!(f, "connection"),
            TimeoutKind::Response => write!(f, "response"),
        }
    }
}

/// Error type for SDK operations.
///
/// Rejected mutations are never errors; they surface as the boolean or
/// [`ModifyLevel`](rbx_core::ModifyLevel) result of the operation.
#[derive(Error, Debug, Clone)]
pub enum ClientError {
    /// The action needs a live connection and the policy forbids waiting.
    #[error("Connection required: the transport is not connected")]
    ConnectionRequired,

    #[error("Timed out waiting for {0}")]
    Timeout(TimeoutKind),

    /// The caller fired the abort trigger of a pending wait.
    #[error("Wait aborted")]
    Aborted,

    #[error("Subscription failed: {reason}")]
    SubscriptionFailed { reason: Value },

    /// The server answered a request with an error.
    #[error("Request rejected: {reason}")]
    Rejected { reason: Value },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Serialization(err.to_string())
    }
}

impl From<CudError> for ClientError {
    fn from(err: CudError) -> Self {
        ClientError::Protocol(err.to_string())
    }
}

impl From<TransportError> for ClientError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::NotConnected => ClientError::ConnectionRequired,
            TransportError::Rejected(reason) => ClientError::Rejected { reason },
            TransportError::AckTimeout => ClientError::Timeout(TimeoutKind::Response),
            TransportError::Failed(msg) => ClientError::Transport(msg),
        }
    }
}

/// Result type for SDK operations.
pub type Result<T> = std::result::Result<T, ClientError>;
