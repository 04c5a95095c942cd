/// Security monitor: rolling send counters and the suspicious-activity flag.
///
/// Pure state, no I/O, no timers: every method takes `now`. The runtime
/// loop arms a single deadline for the flag's auto-clear. This is the
/// only writer of [`SecurityMetrics`]; everyone else reads snapshots.
use std::collections::HashMap;
use std::time::{Duration, Instant};

use dunning_metrics::{Counter, SlidingWindow};
use serde::Serialize;

use crate::config::OutboundConfig;
use crate::types::{now_ms, RecipientId};

/// Read-only copy of the monitor's counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecurityMetrics {
    pub messages_this_minute: usize,
    pub messages_this_hour: usize,
    pub failed_attempts: u64,
    pub rate_limit_violations: u64,
    /// Unix ms of the last admitted message.
    pub last_message_at: Option<u64>,
    pub suspicious_activity: bool,
    /// Time left before the flag clears on its own.
    #[serde(serialize_with = "ser_opt_ms")]
    pub suspicious_remaining: Option<Duration>,
    /// Send attempts per recipient (observability only).
    pub attempts_by_recipient: HashMap<RecipientId, u64>,
}

fn ser_opt_ms<S: serde::Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
    match d {
        Some(d) => s.serialize_some(&(d.as_millis() as u64)),
        None => s.serialize_none(),
    }
}

/// Out-of-band notice for the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "alert", rename_all = "kebab-case")]
pub enum SecurityAlert {
    /// Too many rate-limit violations; outbound is blocked for the cooldown.
    SuspiciousActivity {
        #[serde(serialize_with = "ser_ms")]
        cooldown: Duration,
    },
    SuspicionCleared,
    /// Nobody scanned the pairing payload in time.
    PairingExpired,
    /// The remote side rejected the stored session; credentials were wiped.
    SessionInvalidated,
    MultiDeviceMismatch,
    LoggedOut,
    /// Automatic reconnection gave up.
    ReconnectExhausted { attempts: u32 },
}

fn ser_ms<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// Rolling counters plus a circuit-breaker flag with cooldown.
pub struct SecurityMonitor {
    minute: SlidingWindow,
    hour: SlidingWindow,
    violations: SlidingWindow,
    failed_attempts: Counter,
    rate_limit_violations: Counter,
    attempts: HashMap<RecipientId, Counter>,
    last_message: Option<(Instant, u64)>,
    suspicious_until: Option<Instant>,
    violation_threshold: usize,
    cooldown: Duration,
}

impl SecurityMonitor {
    pub fn new(config: &OutboundConfig) -> Self {
        Self {
            minute: SlidingWindow::new(config.minute_window),
            hour: SlidingWindow::new(config.hour_window),
            violations: SlidingWindow::new(config.violation_window),
            failed_attempts: Counter::new(),
            rate_limit_violations: Counter::new(),
            attempts: HashMap::new(),
            last_message: None,
            suspicious_until: None,
            violation_threshold: config.violation_threshold,
            cooldown: config.suspicious_cooldown,
        }
    }

    /// Count an admitted message against the minute and hour windows.
    pub fn record_message_at(&mut self, now: Instant) {
        self.minute.record(now);
        self.hour.record(now);
        self.last_message = Some((now, now_ms()));
    }

    /// Count a transport send attempt toward `recipient`.
    pub fn record_attempt(&mut self, recipient: &RecipientId) {
        self.attempts.entry(recipient.clone()).or_default().inc();
    }

    /// Count a message dropped after exhausting its retries.
    pub fn record_failure(&mut self) {
        self.failed_attempts.inc();
    }

    /// Count a rate-limit violation.
    ///
    /// Returns `true` when this violation raised the suspicious flag.
    pub fn record_violation_at(&mut self, now: Instant) -> bool {
        self.rate_limit_violations.inc();
        self.violations.record(now);

        if self.is_suspicious_at(now) {
            return false;
        }
        if self.violations.count(now) > self.violation_threshold {
            self.suspicious_until = Some(now + self.cooldown);
            self.violations.clear();
            tracing::warn!(
                cooldown_s = self.cooldown.as_secs(),
                "suspicious activity: too many rate-limit violations"
            );
            return true;
        }
        false
    }

    /// Whether outbound activity is currently blocked.
    ///
    /// The flag clears itself once the cooldown has elapsed.
    pub fn is_suspicious_at(&self, now: Instant) -> bool {
        self.suspicious_until.is_some_and(|until| now < until)
    }

    /// When the current flag clears, if raised.
    pub fn suspicious_until(&self) -> Option<Instant> {
        self.suspicious_until
    }

    /// Drop an elapsed flag. Returns `true` if one was cleared.
    pub fn clear_expired_at(&mut self, now: Instant) -> bool {
        match self.suspicious_until {
            Some(until) if now >= until => {
                self.suspicious_until = None;
                tracing::info!("suspicious activity flag cleared");
                true
            }
            _ => false,
        }
    }

    pub fn messages_this_minute(&mut self, now: Instant) -> usize {
        self.minute.count(now)
    }

    pub fn messages_this_hour(&mut self, now: Instant) -> usize {
        self.hour.count(now)
    }

    /// Instant of the last admitted message.
    pub fn last_message_at(&self) -> Option<Instant> {
        self.last_message.map(|(at, _)| at)
    }

    /// Earliest instant at which the minute window has room for one more.
    pub fn minute_available_at(&mut self, now: Instant, limit: usize) -> Instant {
        self.minute.available_at(now, limit)
    }

    /// Earliest instant at which the hour window has room for one more.
    pub fn hour_available_at(&mut self, now: Instant, limit: usize) -> Instant {
        self.hour.available_at(now, limit)
    }

    pub fn snapshot_at(&mut self, now: Instant) -> SecurityMetrics {
        SecurityMetrics {
            messages_this_minute: self.minute.count(now),
            messages_this_hour: self.hour.count(now),
            failed_attempts: self.failed_attempts.get(),
            rate_limit_violations: self.rate_limit_violations.get(),
            last_message_at: self.last_message.map(|(_, ms)| ms),
            suspicious_activity: self.is_suspicious_at(now),
            suspicious_remaining: self
                .suspicious_until
                .filter(|&until| now < until)
                .map(|until| until - now),
            attempts_by_recipient: self
                .attempts
                .iter()
                .map(|(id, c)| (id.clone(), c.get()))
                .collect(),
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Zero every counter and drop the flag (logout).
    pub fn reset(&mut self) {
        self.minute.clear();
        self.hour.clear();
        self.violations.clear();
        self.failed_attempts.reset();
        self.rate_limit_violations.reset();
        self.attempts.clear();
        self.last_message = None;
        self.suspicious_until = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> SecurityMonitor {
        SecurityMonitor::new(&OutboundConfig::default())
    }

    fn recipient() -> RecipientId {
        "628123@s.example.net".parse().unwrap()
    }

    #[test]
    fn counts_messages_in_windows() {
        let mut m = monitor();
        let t0 = Instant::now();
        m.record_message_at(t0);
        m.record_message_at(t0 + Duration::from_secs(30));

        assert_eq!(m.messages_this_minute(t0 + Duration::from_secs(45)), 2);
        assert_eq!(m.messages_this_minute(t0 + Duration::from_secs(75)), 1);
        assert_eq!(m.messages_this_hour(t0 + Duration::from_secs(75)), 2);
        assert_eq!(m.last_message_at(), Some(t0 + Duration::from_secs(30)));
    }

    #[test]
    fn flag_raised_when_threshold_exceeded() {
        let mut m = monitor();
        let t0 = Instant::now();

        for i in 0..3 {
            assert!(!m.record_violation_at(t0 + Duration::from_secs(i)));
        }
        assert!(!m.is_suspicious_at(t0 + Duration::from_secs(3)));

        assert!(m.record_violation_at(t0 + Duration::from_secs(3)));
        assert!(m.is_suspicious_at(t0 + Duration::from_secs(4)));
    }

    #[test]
    fn flag_clears_after_cooldown() {
        let mut m = monitor();
        let t0 = Instant::now();
        for _ in 0..4 {
            m.record_violation_at(t0);
        }
        let until = m.suspicious_until().unwrap();
        assert_eq!(until, t0 + Duration::from_secs(300));

        assert!(m.is_suspicious_at(until - Duration::from_millis(1)));
        assert!(!m.is_suspicious_at(until));

        assert!(!m.clear_expired_at(until - Duration::from_millis(1)));
        assert!(m.clear_expired_at(until));
        assert!(m.suspicious_until().is_none());
    }

    #[test]
    fn violations_outside_window_do_not_accumulate() {
        let mut m = monitor();
        let t0 = Instant::now();
        for i in 0..6 {
            // One violation every 5 minutes: never more than 2 within 10 min.
            assert!(!m.record_violation_at(t0 + Duration::from_secs(300 * i)));
        }
        assert_eq!(m.snapshot_at(t0 + Duration::from_secs(1500)).rate_limit_violations, 6);
    }

    #[test]
    fn snapshot_is_a_copy() {
        let mut m = monitor();
        let t0 = Instant::now();
        m.record_message_at(t0);
        m.record_attempt(&recipient());
        m.record_attempt(&recipient());
        m.record_failure();

        let snap = m.snapshot_at(t0);
        m.record_failure();

        assert_eq!(snap.messages_this_minute, 1);
        assert_eq!(snap.failed_attempts, 1);
        assert_eq!(snap.attempts_by_recipient[&recipient()], 2);
        assert!(!snap.suspicious_activity);
        assert!(snap.last_message_at.is_some());
    }

    #[test]
    fn reset_zeroes_everything() {
        let mut m = monitor();
        let t0 = Instant::now();
        m.record_message_at(t0);
        for _ in 0..4 {
            m.record_violation_at(t0);
        }
        m.reset();

        let snap = m.snapshot_at(t0);
        assert_eq!(snap.messages_this_minute, 0);
        assert_eq!(snap.rate_limit_violations, 0);
        assert!(!snap.suspicious_activity);
        assert!(snap.attempts_by_recipient.is_empty());
    }

    #[test]
    fn alert_serializes_tagged() {
        let json = serde_json::to_value(SecurityAlert::SuspiciousActivity {
            cooldown: Duration::from_secs(300),
        })
        .unwrap();
        assert_eq!(json["alert"], "suspicious-activity");
        assert_eq!(json["cooldown"], 300_000);
    }
}
