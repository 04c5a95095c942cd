use crate::RecipientId;

/// Errors returned across the transport boundary.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(#[source] anyhow::Error),

    #[error("send to {recipient} failed: {source}")]
    Send {
        recipient: RecipientId,
        #[source]
        source: anyhow::Error,
    },

    #[error("heartbeat failed: {0}")]
    Heartbeat(#[source] anyhow::Error),

    #[error("transport is not connected")]
    NotConnected,

    #[error("credential store failed: {0}")]
    Credentials(#[from] std::io::Error),

    #[error("invalid recipient id: {0:?}")]
    InvalidRecipient(String),

    #[error("transport is shut down")]
    Shutdown,
}
