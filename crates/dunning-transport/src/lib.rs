//! Chat transport boundary for the dunning stack.
//!
//! The wire protocol, cryptography and multi-device pairing live in an
//! external transport library. This crate only describes what the
//! outbound layer consumes from it: a [`ChatTransport`] that connects,
//! sends, heartbeats and tears down, the [`TransportEvent`] stream it
//! produces, and a [`CredentialStore`] for the opaque session blob.
//!
//! # Quick start
//!
//! ```rust
//! use dunning_transport::RecipientId;
//!
//! let to: RecipientId = "6281234567890@s.example.net".parse().unwrap();
//! assert_eq!(to.local_part(), "6281234567890");
//!
//! let same = RecipientId::from_phone("+62 812-3456-7890", "s.example.net").unwrap();
//! assert_eq!(to, same);
//! ```

mod credentials;
mod error;
mod event;
#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

pub use credentials::{CredentialStore, Credentials, FileCredentialStore, MemoryCredentialStore};
pub use error::TransportError;
pub use event::{DisconnectReason, InboundMessage, PairingPayload, TransportEvent};

use std::fmt;
use std::str::FromStr;

use tokio::sync::mpsc;

/// Maximum length of the local part of a recipient id.
const MAX_LOCAL_LEN: usize = 64;

/// Maximum length of the domain part of a recipient id.
const MAX_DOMAIN_LEN: usize = 128;

/// Transport-specific address a message is sent to (`local@domain`).
///
/// Parsing validates the shape only; whether the account exists is the
/// transport's business.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecipientId(String);

impl RecipientId {
    /// Build a recipient id from a phone number in any common notation.
    ///
    /// Spaces, dashes, dots, parentheses and a leading `+` are stripped;
    /// whatever remains must be 6 to 20 digits.
    pub fn from_phone(number: &str, domain: &str) -> Result<Self, TransportError> {
        let digits: String = number
            .trim()
            .trim_start_matches('+')
            .chars()
            .filter(|c| !matches!(c, ' ' | '-' | '.' | '(' | ')'))
            .collect();

        if digits.len() < 6 || digits.len() > 20 || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(TransportError::InvalidRecipient(number.to_string()));
        }

        format!("{digits}@{domain}").parse()
    }

    /// Everything before the `@`.
    pub fn local_part(&self) -> &str {
        self.0.split_once('@').map(|(l, _)| l).unwrap_or(&self.0)
    }

    /// Everything after the `@`.
    pub fn domain(&self) -> &str {
        self.0.split_once('@').map(|(_, d)| d).unwrap_or("")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecipientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for RecipientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecipientId({})", self.0)
    }
}

impl FromStr for RecipientId {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TransportError::InvalidRecipient(s.to_string());

        let (local, domain) = s.split_once('@').ok_or_else(invalid)?;
        if local.is_empty() || local.len() > MAX_LOCAL_LEN {
            return Err(invalid());
        }
        if !local
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '+'))
        {
            return Err(invalid());
        }
        if domain.is_empty()
            || domain.len() > MAX_DOMAIN_LEN
            || !domain.contains('.')
            || domain.starts_with('.')
            || domain.ends_with('.')
            || !domain
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-'))
        {
            return Err(invalid());
        }

        Ok(Self(s.to_ascii_lowercase()))
    }
}

impl serde::Serialize for RecipientId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for RecipientId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// The capability the outbound layer consumes from the chat library.
///
/// In production this wraps the real client. In tests: [`mock::MockTransport`].
/// The connection manager is the only caller; every method takes
/// `&mut self` because the handle is never shared.
#[async_trait::async_trait]
pub trait ChatTransport: Send + 'static {
    /// Open a connection, resuming the session when credentials are given.
    ///
    /// Returns the stream of lifecycle events for this connection. The
    /// stream ends when the connection is torn down.
    async fn connect(
        &mut self,
        credentials: Option<Credentials>,
    ) -> Result<mpsc::Receiver<TransportEvent>, TransportError>;

    /// Send a text body to a recipient.
    async fn send(&mut self, to: &RecipientId, body: &str) -> Result<(), TransportError>;

    /// Lightweight keep-alive (presence update or equivalent).
    async fn heartbeat(&mut self) -> Result<(), TransportError>;

    /// Close the connection, keeping the session valid.
    async fn disconnect(&mut self) -> Result<(), TransportError>;

    /// Invalidate the session on the provider side and close.
    async fn logout(&mut self) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_valid_recipient() {
        let id: RecipientId = "628123@s.example.net".parse().unwrap();
        assert_eq!(id.local_part(), "628123");
        assert_eq!(id.domain(), "s.example.net");
        assert_eq!(id.to_string(), "628123@s.example.net");
    }

    #[test]
    fn parse_normalizes_case() {
        let id: RecipientId = "Treasurer@Group.Example.NET".parse().unwrap();
        assert_eq!(id.as_str(), "treasurer@group.example.net");
    }

    #[test]
    fn reject_malformed_recipients() {
        for bad in [
            "",
            "no-at-sign",
            "@s.example.net",
            "628123@",
            "628123@localhost",
            "628 123@s.example.net",
            "628123@.example.net",
            "628123@example.net.",
            "a@b@c.net",
        ] {
            assert!(bad.parse::<RecipientId>().is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn from_phone_strips_formatting() {
        let id = RecipientId::from_phone("+62 (812) 3456-7890", "s.example.net").unwrap();
        assert_eq!(id.as_str(), "6281234567890@s.example.net");
    }

    #[test]
    fn from_phone_rejects_short_or_alpha() {
        assert!(RecipientId::from_phone("123", "s.example.net").is_err());
        assert!(RecipientId::from_phone("62812abc999", "s.example.net").is_err());
    }

    #[test]
    fn serde_roundtrip_as_string() {
        let id: RecipientId = "628123@s.example.net".parse().unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"628123@s.example.net\"");
        let back: RecipientId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
        assert!(serde_json::from_str::<RecipientId>("\"nope\"").is_err());
    }
}
