use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::OutboundError;

/// Tunables for the outbound service.
///
/// Durations (de)serialize as integer milliseconds. Missing fields take
/// the defaults below.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboundConfig {
    // ── Rate limiting ──────────────────────────────
    /// Admissions allowed in any trailing minute.
    pub max_per_minute: usize,
    /// Admissions allowed in any trailing hour.
    pub max_per_hour: usize,
    /// Minimum gap between two admissions, any recipient.
    #[serde(with = "duration_ms")]
    pub min_interval: Duration,
    /// Longest body accepted, in characters.
    pub max_body_len: usize,
    /// Length of the "per minute" window. Only shortened for simulations.
    #[serde(with = "duration_ms")]
    pub minute_window: Duration,
    /// Length of the "per hour" window.
    #[serde(with = "duration_ms")]
    pub hour_window: Duration,

    // ── Delivery ───────────────────────────────────
    /// Retries after the first failed send before the item is dropped.
    pub max_send_retries: u32,
    /// Pause before a retry, multiplied by the retry count.
    #[serde(with = "duration_ms")]
    pub retry_backoff: Duration,
    /// A send still pending after this long counts as a failed attempt.
    #[serde(with = "duration_ms")]
    pub send_timeout: Duration,

    // ── Dedup ──────────────────────────────────────
    /// Identical (recipient, body) pairs are refused for this long.
    #[serde(with = "duration_ms")]
    pub dedup_window: Duration,
    /// Upper bound on remembered pairs.
    pub dedup_capacity: usize,

    // ── Security monitor ───────────────────────────
    /// Violations above this count (within `violation_window`) raise the flag.
    pub violation_threshold: usize,
    #[serde(with = "duration_ms")]
    pub violation_window: Duration,
    /// How long the suspicious flag stays raised.
    #[serde(with = "duration_ms")]
    pub suspicious_cooldown: Duration,

    // ── Connection ─────────────────────────────────
    #[serde(with = "duration_ms")]
    pub reconnect_base: Duration,
    #[serde(with = "duration_ms")]
    pub reconnect_cap: Duration,
    pub max_reconnect_attempts: u32,
    /// Longest wait in `connecting` before giving up on the attempt.
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
    /// Lifetime of a pairing payload before manual refresh is required.
    #[serde(with = "duration_ms")]
    pub pairing_timeout: Duration,
    /// Keep-alive period while open.
    #[serde(with = "duration_ms")]
    pub session_refresh_period: Duration,
    /// Inactivity after which a heartbeat is sent.
    #[serde(with = "duration_ms")]
    pub idle_threshold: Duration,

    // ── Broadcast ──────────────────────────────────
    pub broadcast_batch_size: usize,
    #[serde(with = "duration_ms")]
    pub broadcast_batch_delay: Duration,

    /// Capacity of the observer event channel.
    pub event_buffer: usize,
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            max_per_minute: 5,
            max_per_hour: 60,
            min_interval: Duration::from_secs(12),
            max_body_len: 4096,
            minute_window: Duration::from_secs(60),
            hour_window: Duration::from_secs(60 * 60),
            max_send_retries: 2,
            retry_backoff: Duration::from_secs(5),
            send_timeout: Duration::from_secs(30),
            dedup_window: Duration::from_secs(60 * 60),
            dedup_capacity: 10_000,
            violation_threshold: 3,
            violation_window: Duration::from_secs(10 * 60),
            suspicious_cooldown: Duration::from_secs(5 * 60),
            reconnect_base: Duration::from_secs(5),
            reconnect_cap: Duration::from_secs(5 * 60),
            max_reconnect_attempts: 5,
            connect_timeout: Duration::from_secs(2 * 60),
            pairing_timeout: Duration::from_secs(60),
            session_refresh_period: Duration::from_secs(8 * 60 * 60),
            idle_threshold: Duration::from_secs(30 * 60),
            broadcast_batch_size: 3,
            broadcast_batch_delay: Duration::from_secs(60),
            event_buffer: 256,
        }
    }
}

impl OutboundConfig {
    /// Reject settings the service cannot run with.
    pub fn validate(&self) -> Result<(), OutboundError> {
        if self.max_per_minute == 0 || self.max_per_hour == 0 {
            return Err(OutboundError::validation("rate ceilings must be non-zero"));
        }
        if self.max_per_hour < self.max_per_minute {
            return Err(OutboundError::validation(
                "max_per_hour must be at least max_per_minute",
            ));
        }
        if self.max_body_len == 0 {
            return Err(OutboundError::validation("max_body_len must be non-zero"));
        }
        if self.dedup_capacity == 0 {
            return Err(OutboundError::validation("dedup_capacity must be non-zero"));
        }
        if self.minute_window.is_zero() || self.hour_window.is_zero() {
            return Err(OutboundError::validation("rate windows must be non-zero"));
        }
        // Every admission inside the dedup window must fit, or the LRU
        // forgets live pairs.
        let hours = self.dedup_window.as_nanos().div_ceil(self.hour_window.as_nanos());
        let needed = self.max_per_hour as u128 * hours;
        if (self.dedup_capacity as u128) < needed {
            return Err(OutboundError::validation(format!(
                "dedup_capacity {} is below the {needed} sends allowed per dedup window",
                self.dedup_capacity
            )));
        }
        if self.send_timeout.is_zero() {
            return Err(OutboundError::validation("send_timeout must be non-zero"));
        }
        if self.broadcast_batch_size == 0 {
            return Err(OutboundError::validation("broadcast_batch_size must be non-zero"));
        }
        if self.reconnect_cap < self.reconnect_base {
            return Err(OutboundError::validation(
                "reconnect_cap must not be below reconnect_base",
            ));
        }
        if self.event_buffer == 0 {
            return Err(OutboundError::validation("event_buffer must be non-zero"));
        }
        Ok(())
    }

    /// Divide every duration by `factor` (simulations and demos).
    pub fn scaled(mut self, factor: u32) -> Self {
        let factor = factor.max(1);
        for d in [
            &mut self.min_interval,
            &mut self.minute_window,
            &mut self.hour_window,
            &mut self.retry_backoff,
            &mut self.send_timeout,
            &mut self.dedup_window,
            &mut self.violation_window,
            &mut self.suspicious_cooldown,
            &mut self.reconnect_base,
            &mut self.reconnect_cap,
            &mut self.connect_timeout,
            &mut self.pairing_timeout,
            &mut self.session_refresh_period,
            &mut self.idle_threshold,
            &mut self.broadcast_batch_delay,
        ] {
            *d /= factor;
        }
        self
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert!(OutboundConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_batch_size_rejected() {
        let config = OutboundConfig {
            broadcast_batch_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn inverted_reconnect_bounds_rejected() {
        let config = OutboundConfig {
            reconnect_base: Duration::from_secs(60),
            reconnect_cap: Duration::from_secs(10),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn dedup_capacity_must_cover_the_window() {
        let tight = OutboundConfig {
            dedup_capacity: 59,
            ..Default::default()
        };
        assert!(tight.validate().is_err());

        let exact = OutboundConfig {
            dedup_capacity: 60,
            ..Default::default()
        };
        assert!(exact.validate().is_ok());

        // A window spanning part of a second hour needs room for both.
        let longer = OutboundConfig {
            dedup_window: Duration::from_secs(90 * 60),
            dedup_capacity: 100,
            ..Default::default()
        };
        assert!(longer.validate().is_err());
        assert!(OutboundConfig { dedup_capacity: 120, ..longer }.validate().is_ok());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: OutboundConfig =
            serde_json::from_str(r#"{"max_per_minute": 2, "min_interval": 500}"#).unwrap();
        assert_eq!(config.max_per_minute, 2);
        assert_eq!(config.min_interval, Duration::from_millis(500));
        assert_eq!(config.broadcast_batch_size, 3);
    }

    #[test]
    fn durations_serialize_as_millis() {
        let json = serde_json::to_value(OutboundConfig::default()).unwrap();
        assert_eq!(json["min_interval"], 12_000);
        assert_eq!(json["session_refresh_period"], 8 * 60 * 60 * 1000);
    }

    #[test]
    fn scaled_divides_durations() {
        let config = OutboundConfig::default().scaled(100);
        assert_eq!(config.min_interval, Duration::from_millis(120));
        assert_eq!(config.broadcast_batch_delay, Duration::from_millis(600));
        assert_eq!(config.max_per_minute, 5);
    }
}
