/// Broadcast orchestrator: feeds a recipient list through the send path in batches.
///
/// A job only tracks progress. The runtime admits one recipient at a time
/// through the same gates as a direct send, waits for the delivery outcome,
/// and pauses between batches. Jobs run one after another in FIFO order.
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::types::{BroadcastTally, MessageId};

/// Where a job is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Admit the next recipient once `at` is reached.
    Admit { at: Instant },
    /// One recipient is queued; wait for its outcome.
    AwaitDelivery { id: MessageId },
    /// Inter-batch pause.
    BatchPause { until: Instant },
}

pub struct BroadcastJob {
    id: u64,
    body: String,
    batches: VecDeque<VecDeque<String>>,
    phase: Phase,
    tally: BroadcastTally,
    batch_delay: Duration,
}

impl BroadcastJob {
    pub fn new(
        id: u64,
        recipients: Vec<String>,
        body: String,
        batch_size: usize,
        batch_delay: Duration,
        now: Instant,
    ) -> Self {
        let batches = recipients
            .chunks(batch_size.max(1))
            .map(|chunk| chunk.iter().cloned().collect())
            .collect();
        Self {
            id,
            body,
            batches,
            phase: Phase::Admit { at: now },
            tally: BroadcastTally::default(),
            batch_delay,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn tally(&self) -> BroadcastTally {
        self.tally
    }

    /// Batches not yet fully admitted (including the current one).
    pub fn batches_left(&self) -> usize {
        self.batches.len()
    }

    /// Recipients not yet admitted.
    pub fn remaining(&self) -> usize {
        self.batches.iter().map(VecDeque::len).sum()
    }

    pub fn is_done(&self) -> bool {
        self.batches.is_empty() && !matches!(self.phase, Phase::AwaitDelivery { .. })
    }

    /// Instant the job wants to be driven again; `None` while awaiting delivery.
    pub fn wake_at(&self) -> Option<Instant> {
        match self.phase {
            Phase::Admit { at } => Some(at),
            Phase::BatchPause { until } => Some(until),
            Phase::AwaitDelivery { .. } => None,
        }
    }

    /// Next recipient of the current batch, without taking it.
    pub fn peek_recipient(&self) -> Option<&str> {
        self.batches
            .front()
            .and_then(|batch| batch.front())
            .map(String::as_str)
    }

    /// Postpone the next admission.
    pub fn defer_until(&mut self, at: Instant) {
        self.phase = Phase::Admit { at };
    }

    /// The peeked recipient was queued as `id`.
    pub fn admitted(&mut self, id: MessageId) {
        self.take_recipient();
        self.phase = Phase::AwaitDelivery { id };
    }

    /// The peeked recipient was refused before reaching the queue.
    pub fn refused(&mut self, now: Instant) {
        self.take_recipient();
        self.tally.failed_count += 1;
        self.advance(now);
    }

    /// Outcome of the queued item. Ignored unless `id` is the one awaited.
    pub fn settle(&mut self, id: MessageId, delivered: bool, now: Instant) -> bool {
        match self.phase {
            Phase::AwaitDelivery { id: awaited } if awaited == id => {
                if delivered {
                    self.tally.success_count += 1;
                } else {
                    self.tally.failed_count += 1;
                }
                self.advance(now);
                true
            }
            _ => false,
        }
    }

    /// Leave the pause and resume admissions.
    pub fn end_pause(&mut self, now: Instant) {
        if let Phase::BatchPause { until } = self.phase {
            if until <= now {
                self.phase = Phase::Admit { at: now };
            }
        }
    }

    /// Count everything not yet delivered as failed and finish.
    pub fn abort(&mut self, now: Instant) -> BroadcastTally {
        let mut failed = self.remaining();
        if matches!(self.phase, Phase::AwaitDelivery { .. }) {
            failed += 1;
        }
        self.tally.failed_count += failed;
        self.batches.clear();
        self.phase = Phase::Admit { at: now };
        self.tally
    }

    fn take_recipient(&mut self) {
        if let Some(batch) = self.batches.front_mut() {
            batch.pop_front();
        }
    }

    /// Move on after a recipient settled: next in batch, or pause.
    fn advance(&mut self, now: Instant) {
        let batch_finished = self.batches.front().is_some_and(VecDeque::is_empty);
        if batch_finished {
            self.batches.pop_front();
            if !self.batches.is_empty() {
                tracing::debug!(
                    job = self.id,
                    batches_left = self.batches.len(),
                    "batch done, pausing"
                );
                self.phase = Phase::BatchPause {
                    until: now + self.batch_delay,
                };
                return;
            }
        }
        self.phase = Phase::Admit { at: now };
    }
}
