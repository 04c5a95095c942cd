use std::fmt;

use serde::{Deserialize, Serialize};

pub use dunning_transport::{InboundMessage, PairingPayload, RecipientId};

/// Lifecycle state of the transport connection.
///
/// Exactly one value at a time; only the connection manager changes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionState {
    Closed,
    Connecting,
    QrPending,
    Open,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Closed => "closed",
            ConnectionState::Connecting => "connecting",
            ConnectionState::QrPending => "qr-pending",
            ConnectionState::Open => "open",
            ConnectionState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Identifier handed back when a send is admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(uuid::Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Aggregate result of a broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastTally {
    pub success_count: usize,
    pub failed_count: usize,
}

impl BroadcastTally {
    pub fn total(&self) -> usize {
        self.success_count + self.failed_count
    }
}

/// Current wall-clock time in Unix milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_state_display_matches_serde() {
        for state in [
            ConnectionState::Closed,
            ConnectionState::Connecting,
            ConnectionState::QrPending,
            ConnectionState::Open,
            ConnectionState::Error,
        ] {
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{state}\""));
        }
    }

    #[test]
    fn message_ids_are_unique() {
        assert_ne!(MessageId::new(), MessageId::new());
    }

    #[test]
    fn tally_total() {
        let t = BroadcastTally {
            success_count: 5,
            failed_count: 2,
        };
        assert_eq!(t.total(), 7);
    }
}
