use serde::{Deserialize, Serialize};

use crate::{Credentials, RecipientId};

/// Short-lived bootstrap token rendered (usually as a QR code) for manual approval.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingPayload(pub String);

impl std::fmt::Debug for PairingPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let short: String = self.0.chars().take(8).collect();
        write!(f, "PairingPayload({short}...)")
    }
}

/// A message received from the chat network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub from: RecipientId,
    pub body: String,
    /// Provider timestamp (Unix ms).
    pub timestamp: u64,
}

/// Why the transport closed the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DisconnectReason {
    /// Stored session is corrupt or rejected. Needs a fresh pairing.
    BadSession,
    /// Provider asks the client to reconnect (routine after pairing).
    RestartRequired,
    /// Device list on the account no longer matches this session.
    MultiDeviceMismatch,
    /// Session was revoked from the phone or another device.
    LoggedOut,
    /// Another client took over this session.
    ConnectionReplaced,
    /// Socket dropped or the server closed it.
    ConnectionLost,
    /// Keep-alive or handshake timed out.
    TimedOut,
    /// Any other status code.
    Unknown(u16),
}

impl DisconnectReason {
    /// Map a transport status code to a reason.
    pub fn from_code(code: u16) -> Self {
        match code {
            401 => DisconnectReason::LoggedOut,
            408 => DisconnectReason::TimedOut,
            411 => DisconnectReason::MultiDeviceMismatch,
            428 => DisconnectReason::ConnectionLost,
            440 => DisconnectReason::ConnectionReplaced,
            500 => DisconnectReason::BadSession,
            515 => DisconnectReason::RestartRequired,
            other => DisconnectReason::Unknown(other),
        }
    }
}

/// Items on the stream returned by [`ChatTransport::connect`](crate::ChatTransport::connect).
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A pairing payload was issued (first time or rotated).
    Pairing(PairingPayload),
    /// Authentication finished; the connection can send.
    Opened,
    /// The session blob changed and should be persisted.
    CredentialsUpdated(Credentials),
    /// A message arrived.
    Inbound(InboundMessage),
    /// The connection closed.
    Closed(DisconnectReason),
}
