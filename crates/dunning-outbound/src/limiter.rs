/// Rate limiter: global admission gate in front of the delivery queue.
///
/// Rejects when the trailing minute or hour is full, or when the last
/// admission was less than `min_interval` ago. The interval applies to
/// all recipients at once, which serializes sends. Every rejection is
/// reported to the [`SecurityMonitor`] as a violation.
use std::fmt;
use std::time::{Duration, Instant};

use crate::config::OutboundConfig;
use crate::error::OutboundError;
use crate::security::SecurityMonitor;

/// Which ceiling refused the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitReason {
    PerMinute,
    PerHour,
    Interval,
}

/// A refused acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimited {
    pub reason: RateLimitReason,
    pub retry_after: Duration,
    /// The violation tipped the monitor into suspicious mode.
    pub raised_flag: bool,
}

impl fmt::Display for RateLimited {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reason {
            RateLimitReason::PerMinute => f.write_str("per-minute ceiling reached"),
            RateLimitReason::PerHour => f.write_str("per-hour ceiling reached"),
            RateLimitReason::Interval => f.write_str("minimum interval not elapsed"),
        }
    }
}

impl From<RateLimited> for OutboundError {
    fn from(r: RateLimited) -> Self {
        OutboundError::RateLimited {
            reason: r.to_string(),
            retry_after: r.retry_after,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimiter {
    max_per_minute: usize,
    max_per_hour: usize,
    min_interval: Duration,
}

impl RateLimiter {
    pub fn new(config: &OutboundConfig) -> Self {
        Self {
            max_per_minute: config.max_per_minute,
            max_per_hour: config.max_per_hour,
            min_interval: config.min_interval,
        }
    }

    /// Check the ceilings and, if they allow it, count one admission.
    pub fn try_acquire_at(
        &self,
        monitor: &mut SecurityMonitor,
        now: Instant,
    ) -> Result<(), RateLimited> {
        if let Some((reason, ready_at)) = self.blocked_at(monitor, now) {
            let raised_flag = monitor.record_violation_at(now);
            tracing::debug!(?reason, "admission refused by rate limiter");
            return Err(RateLimited {
                reason,
                retry_after: ready_at.saturating_duration_since(now),
                raised_flag,
            });
        }
        monitor.record_message_at(now);
        Ok(())
    }

    /// Earliest instant an acquisition would succeed. No side effects.
    pub fn next_permit_at(&self, monitor: &mut SecurityMonitor, now: Instant) -> Instant {
        self.blocked_at(monitor, now)
            .map(|(_, at)| at)
            .unwrap_or(now)
    }

    fn blocked_at(
        &self,
        monitor: &mut SecurityMonitor,
        now: Instant,
    ) -> Option<(RateLimitReason, Instant)> {
        let mut blocked: Option<(RateLimitReason, Instant)> = None;
        let mut consider = |reason, at: Instant| {
            let later = match blocked {
                Some((_, cur)) => at > cur,
                None => true,
            };
            if at > now && later {
                blocked = Some((reason, at));
            }
        };

        consider(
            RateLimitReason::Interval,
            monitor
                .last_message_at()
                .map(|last| last + self.min_interval)
                .unwrap_or(now),
        );
        consider(
            RateLimitReason::PerMinute,
            monitor.minute_available_at(now, self.max_per_minute),
        );
        consider(
            RateLimitReason::PerHour,
            monitor.hour_available_at(now, self.max_per_hour),
        );

        blocked
    }
}
