use std::time::Duration;

/// Delay before reconnect attempt number `attempt` (1-based).
///
/// `min(base * 2^(attempt - 1), cap)`. The shift is clamped so large
/// attempt counts saturate at the cap instead of overflowing.
pub fn backoff_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(31);
    base.checked_mul(1u32 << exp).unwrap_or(cap).min(cap)
}

/// Reconnect attempt bookkeeping.
#[derive(Debug, Clone)]
pub struct ReconnectState {
    attempts: u32,
    base: Duration,
    cap: Duration,
    max_attempts: u32,
}

impl ReconnectState {
    pub fn new(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self {
            attempts: 0,
            base,
            cap,
            max_attempts,
        }
    }

    /// Count one more attempt and return its delay.
    ///
    /// `None` once the ceiling is reached; the counter is left as is.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.max_attempts {
            return None;
        }
        self.attempts += 1;
        Some(backoff_delay(self.base, self.cap, self.attempts))
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Successful open or manual restart.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubling_sequence() {
        let base = Duration::from_secs(5);
        let cap = Duration::from_secs(300);
        let delays: Vec<u64> = (1..=8)
            .map(|a| backoff_delay(base, cap, a).as_secs())
            .collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 80, 160, 300, 300]);
    }

    #[test]
    fn huge_attempt_saturates_at_cap() {
        let cap = Duration::from_secs(300);
        assert_eq!(backoff_delay(Duration::from_secs(5), cap, u32::MAX), cap);
    }

    #[test]
    fn ceiling_stops_scheduling() {
        let mut r = ReconnectState::new(Duration::from_secs(1), Duration::from_secs(60), 3);
        assert_eq!(r.next_delay(), Some(Duration::from_secs(1)));
        assert_eq!(r.next_delay(), Some(Duration::from_secs(2)));
        assert_eq!(r.next_delay(), Some(Duration::from_secs(4)));
        assert_eq!(r.next_delay(), None);
        assert_eq!(r.attempts(), 3);

        r.reset();
        assert_eq!(r.next_delay(), Some(Duration::from_secs(1)));
    }
}
