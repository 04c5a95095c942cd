//! Metric primitives for the dunning stack.
//!
//! - [`Counter`]: atomic monotonic counter, serializes as a plain number.
//! - [`SlidingWindow`]: events within the trailing `span`, counted
//!   against the caller's clock instead of periodic reset timers.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// A monotonically increasing counter backed by [`AtomicU64`].
///
/// Relaxed ordering: good enough for statistics.
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_by(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    /// Back to zero (used on session teardown).
    pub fn reset(&self) {
        self.0.store(0, Ordering::Relaxed);
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for Counter {
    fn clone(&self) -> Self {
        Self(AtomicU64::new(self.get()))
    }
}

impl fmt::Debug for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Counter").field(&self.get()).finish()
    }
}

impl serde::Serialize for Counter {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.get().serialize(serializer)
    }
}

// ── SlidingWindow ────────────────────────────────────────────────────

/// Counts events that happened within the trailing `span`.
///
/// Timestamps are supplied by the caller, so the window never drifts
/// from elapsed time and tests can drive it with any clock. Expects
/// non-decreasing timestamps.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    span: Duration,
    hits: VecDeque<Instant>,
}

impl SlidingWindow {
    pub fn new(span: Duration) -> Self {
        Self {
            span,
            hits: VecDeque::new(),
        }
    }

    /// Record one event at `now`.
    pub fn record(&mut self, now: Instant) {
        self.prune(now);
        self.hits.push_back(now);
    }

    /// Events within `(now - span, now]`.
    pub fn count(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.hits.len()
    }

    /// Earliest instant at which fewer than `limit` events remain in the window.
    ///
    /// Returns `now` when there is already room.
    pub fn available_at(&mut self, now: Instant, limit: usize) -> Instant {
        self.prune(now);
        if self.hits.len() < limit {
            return now;
        }
        // The (len - limit)th oldest hit has to age out.
        let idx = self.hits.len() - limit.max(1).min(self.hits.len());
        self.hits
            .get(idx)
            .map(|&t| t + self.span)
            .unwrap_or(now)
    }

    pub fn clear(&mut self) {
        self.hits.clear();
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&front) = self.hits.front() {
            if now.saturating_duration_since(front) >= self.span {
                self.hits.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_operations() {
        let c = Counter::new();
        assert_eq!(c.get(), 0);
        c.inc();
        c.inc_by(10);
        assert_eq!(c.get(), 11);
        c.reset();
        assert_eq!(c.get(), 0);
    }

    #[test]
    fn clone_is_independent() {
        let c = Counter::new();
        c.inc_by(42);
        let c2 = c.clone();
        c.inc();
        assert_eq!(c.get(), 43);
        assert_eq!(c2.get(), 42);
    }

    #[test]
    fn counter_serializes_as_number() {
        let c = Counter::new();
        c.inc_by(99);
        assert_eq!(serde_json::to_string(&c).unwrap(), "99");
    }

    #[test]
    fn window_expires_old_hits() {
        let t0 = Instant::now();
        let mut w = SlidingWindow::new(Duration::from_secs(60));

        w.record(t0);
        w.record(t0 + Duration::from_secs(30));
        assert_eq!(w.count(t0 + Duration::from_secs(59)), 2);
        assert_eq!(w.count(t0 + Duration::from_secs(60)), 1);
        assert_eq!(w.count(t0 + Duration::from_secs(90)), 0);
    }

    #[test]
    fn available_at_when_room() {
        let t0 = Instant::now();
        let mut w = SlidingWindow::new(Duration::from_secs(60));
        w.record(t0);
        assert_eq!(w.available_at(t0, 2), t0);
    }

    #[test]
    fn available_at_when_full() {
        let t0 = Instant::now();
        let mut w = SlidingWindow::new(Duration::from_secs(60));
        w.record(t0);
        w.record(t0 + Duration::from_secs(10));
        w.record(t0 + Duration::from_secs(20));

        let now = t0 + Duration::from_secs(25);
        // Limit 3: the oldest must age out.
        assert_eq!(w.available_at(now, 3), t0 + Duration::from_secs(60));
        // Limit 2: two must age out, the second one decides.
        assert_eq!(w.available_at(now, 2), t0 + Duration::from_secs(70));
    }

    #[test]
    fn clear_empties_window() {
        let t0 = Instant::now();
        let mut w = SlidingWindow::new(Duration::from_secs(60));
        w.record(t0);
        w.clear();
        assert_eq!(w.count(t0), 0);
    }
}
