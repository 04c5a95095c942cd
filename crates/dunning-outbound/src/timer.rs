use std::time::Instant;

/// A single-purpose timer slot.
///
/// Arming replaces the previous deadline, so one slot can never hold two
/// live timers. The runtime loop sleeps until the earliest armed slot.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    pub fn arm(&mut self, at: Instant) {
        self.0 = Some(at);
    }

    /// Arm only if nothing is armed yet.
    pub fn arm_if_idle(&mut self, at: Instant) {
        if self.0.is_none() {
            self.0 = Some(at);
        }
    }

    pub fn cancel(&mut self) {
        self.0 = None;
    }

    pub fn at(&self) -> Option<Instant> {
        self.0
    }

    pub fn is_armed(&self) -> bool {
        self.0.is_some()
    }

    /// Disarm and return `true` if the deadline has passed.
    pub fn fire_if_due(&mut self, now: Instant) -> bool {
        match self.0 {
            Some(at) if at <= now => {
                self.0 = None;
                true
            }
            _ => false,
        }
    }
}

/// Earliest of a set of optional instants.
pub fn earliest(candidates: impl IntoIterator<Item = Option<Instant>>) -> Option<Instant> {
    candidates.into_iter().flatten().min()
}
