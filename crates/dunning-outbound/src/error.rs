use std::time::Duration;

use crate::types::{ConnectionState, RecipientId};

/// Errors surfaced to callers of the outbound service.
///
/// Admission errors (`Validation`, `RateLimited`, `Duplicate`,
/// `NotConnected`, `SecurityBlocked`) are returned synchronously and the
/// request never reaches the queue.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OutboundError {
    #[error("invalid request: {reason}")]
    Validation { reason: String },

    #[error("rate limit exceeded: {reason} (retry in {}s)", retry_after.as_secs())]
    RateLimited {
        reason: String,
        retry_after: Duration,
    },

    #[error("duplicate message to {recipient} within dedup window")]
    Duplicate { recipient: RecipientId },

    #[error("not connected (state: {state})")]
    NotConnected { state: ConnectionState },

    #[error("outbound blocked: suspicious activity detected")]
    SecurityBlocked,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("session rejected, fresh pairing required")]
    FatalSession,

    #[error("outbound service shut down")]
    Shutdown,
}

/// How the application should treat a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Temporarily blocked; the same request may succeed later.
    RetryLater,
    /// Will never succeed as-is.
    Rejected,
    /// Went wrong while in flight or the service is gone.
    Failed,
}

impl OutboundError {
    pub fn disposition(&self) -> Disposition {
        match self {
            OutboundError::RateLimited { .. }
            | OutboundError::SecurityBlocked
            | OutboundError::NotConnected { .. } => Disposition::RetryLater,
            OutboundError::Validation { .. }
            | OutboundError::Duplicate { .. }
            | OutboundError::FatalSession => Disposition::Rejected,
            OutboundError::Transport(_) | OutboundError::Shutdown => Disposition::Failed,
        }
    }

    pub(crate) fn validation(reason: impl Into<String>) -> Self {
        OutboundError::Validation {
            reason: reason.into(),
        }
    }
}

impl From<dunning_transport::TransportError> for OutboundError {
    fn from(e: dunning_transport::TransportError) -> Self {
        match e {
            dunning_transport::TransportError::InvalidRecipient(id) => {
                OutboundError::validation(format!("malformed recipient id {id:?}"))
            }
            other => OutboundError::Transport(other.to_string()),
        }
    }
}
