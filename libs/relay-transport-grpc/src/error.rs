use std::time::Duration;

use thiserror::Error;
use tonic::{Code, Status};

/// Failures of the supervised outbound channel.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConnectivityError {
    /// The configured endpoint cannot be turned into a channel target.
    #[error("invalid endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    /// No channel could be opened within the establish budget.
    #[error("failed to connect to {endpoint} after {attempts} attempt(s): {reason}")]
    Connect {
        endpoint: String,
        attempts: u32,
        reason: String,
    },

    /// The remote answered the call with a non-OK status.
    #[error("rpc failed: {}: {}", .0.code(), .0.message())]
    Rpc(#[from] Status),

    /// The per-call deadline elapsed before a response arrived.
    #[error("deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    /// The supervisor has been shut down.
    #[error("connection supervisor is closed")]
    Closed,
}

impl ConnectivityError {
    /// `true` for failures that warrant a reconnect: the remote reported
    /// `UNAVAILABLE` or the channel never became ready.
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        match self {
            Self::Rpc(status) => status.code() == Code::Unavailable,
            Self::Connect { .. } => true,
            _ => false,
        }
    }
}
