/// Delivery queue: ordered pending sends with head-of-line retry.
///
/// Pure data structure plus the processor's bookkeeping. The runtime
/// loop is the single consumer: it pops the head, hands it to the
/// transport, and reports the outcome back here.
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::dedup::{dedup_key, DedupKey};
use crate::types::{MessageId, RecipientId};

/// Who asked for the send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Direct,
    Broadcast(u64),
}

/// A pending send.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub id: MessageId,
    pub recipient: RecipientId,
    pub body: String,
    pub enqueued_at: Instant,
    pub retry_count: u32,
    pub origin: Origin,
}

impl QueuedMessage {
    pub fn new(recipient: RecipientId, body: String, origin: Origin, now: Instant) -> Self {
        Self {
            id: MessageId::new(),
            recipient,
            body,
            enqueued_at: now,
            retry_count: 0,
            origin,
        }
    }

    pub fn key(&self) -> DedupKey {
        dedup_key(&self.recipient, &self.body)
    }
}

/// What to do with an item whose send just failed.
#[derive(Debug)]
pub enum RetryDecision {
    /// Back at the head after `delay`.
    Retry { delay: Duration },
    /// Out of retries; counted as failed.
    Drop(QueuedMessage),
}

pub struct DeliveryQueue {
    items: VecDeque<QueuedMessage>,
    max_retries: u32,
    retry_backoff: Duration,
}

impl DeliveryQueue {
    pub fn new(max_retries: u32, retry_backoff: Duration) -> Self {
        Self {
            items: VecDeque::new(),
            max_retries,
            retry_backoff,
        }
    }

    pub fn push(&mut self, item: QueuedMessage) {
        self.items.push_back(item);
    }

    pub fn pop(&mut self) -> Option<QueuedMessage> {
        self.items.pop_front()
    }

    /// Put back an item that never reached the transport. No retry is counted.
    pub fn requeue(&mut self, item: QueuedMessage) {
        self.items.push_front(item);
    }

    /// Retry `item` ahead of everything else, or drop it past the ceiling.
    pub fn on_failure(&mut self, mut item: QueuedMessage) -> RetryDecision {
        if item.retry_count < self.max_retries {
            item.retry_count += 1;
            let delay = self.retry_backoff * item.retry_count;
            tracing::debug!(
                id = %item.id,
                retry = item.retry_count,
                "send failed, retrying at queue head"
            );
            self.items.push_front(item);
            RetryDecision::Retry { delay }
        } else {
            RetryDecision::Drop(item)
        }
    }

    /// Whether an identical (recipient, body) pair is already pending.
    pub fn contains_key(&self, key: &DedupKey) -> bool {
        self.items.iter().any(|m| &m.key() == key)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Remove every pending item that came from `origin`.
    pub fn take_origin(&mut self, origin: Origin) -> Vec<QueuedMessage> {
        let (taken, kept): (VecDeque<_>, VecDeque<_>) =
            self.items.drain(..).partition(|m| m.origin == origin);
        self.items = kept;
        taken.into()
    }

    /// Remove everything without processing it.
    pub fn clear(&mut self) -> Vec<QueuedMessage> {
        self.items.drain(..).collect()
    }
}

/// Processor bookkeeping: at most one drain cycle runs at a time.
#[derive(Debug, Default)]
pub struct Processor {
    running: bool,
    in_flight: bool,
    resume_at: Option<Instant>,
}

impl Processor {
    /// Start a drain cycle unless one is already running.
    ///
    /// Returns `true` if this call started it.
    pub fn start(&mut self, now: Instant) -> bool {
        if self.running {
            return false;
        }
        self.running = true;
        self.resume_at = Some(now);
        true
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    /// Next instant the processor wants to pop, if it is waiting.
    pub fn resume_at(&self) -> Option<Instant> {
        if self.running && !self.in_flight {
            self.resume_at
        } else {
            None
        }
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.resume_at().is_some_and(|at| at <= now)
    }

    pub fn begin_send(&mut self) {
        self.in_flight = true;
        self.resume_at = None;
    }

    /// Send finished; continue after `wait`, or stop if nothing is left.
    pub fn finish_send(&mut self, queue_empty: bool, now: Instant, wait: Duration) {
        self.in_flight = false;
        if queue_empty {
            self.stop();
        } else {
            self.resume_at = Some(now + wait);
        }
    }

    /// The send was called off before completing. Parks the cycle.
    pub fn cancel_send(&mut self) {
        self.in_flight = false;
        self.resume_at = None;
    }

    /// Park until [`resume`](Self::resume) (connection down, flag raised).
    pub fn pause(&mut self) {
        self.resume_at = None;
    }

    /// Continue a parked cycle at `now`. No-op when idle.
    pub fn resume(&mut self, now: Instant) {
        if self.running && !self.in_flight && self.resume_at.is_none() {
            self.resume_at = Some(now);
        }
    }

    pub fn stop(&mut self) {
        self.running = false;
        self.in_flight = false;
        self.resume_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(n: u8, now: Instant) -> QueuedMessage {
        QueuedMessage::new(
            format!("62800{n}@s.example.net").parse().unwrap(),
            format!("reminder {n}"),
            Origin::Direct,
            now,
        )
    }

    #[test]
    fn fifo_order() {
        let t0 = Instant::now();
        let mut q = DeliveryQueue::new(2, Duration::from_secs(5));
        q.push(msg(1, t0));
        q.push(msg(2, t0));
        assert_eq!(q.pop().unwrap().body, "reminder 1");
        assert_eq!(q.pop().unwrap().body, "reminder 2");
        assert!(q.pop().is_none());
    }

    #[test]
    fn failed_item_jumps_ahead() {
        let t0 = Instant::now();
        let mut q = DeliveryQueue::new(2, Duration::from_secs(5));
        q.push(msg(1, t0));
        q.push(msg(2, t0));

        let head = q.pop().unwrap();
        let RetryDecision::Retry { delay } = q.on_failure(head) else {
            panic!("expected retry");
        };
        assert_eq!(delay, Duration::from_secs(5));

        let again = q.pop().unwrap();
        assert_eq!(again.body, "reminder 1");
        assert_eq!(again.retry_count, 1);
    }

    #[test]
    fn dropped_after_retry_ceiling() {
        let t0 = Instant::now();
        let mut q = DeliveryQueue::new(2, Duration::from_secs(5));
        q.push(msg(1, t0));

        let mut delays = vec![];
        loop {
            let item = q.pop().unwrap();
            match q.on_failure(item) {
                RetryDecision::Retry { delay } => delays.push(delay),
                RetryDecision::Drop(item) => {
                    assert_eq!(item.retry_count, 2);
                    break;
                }
            }
        }
        assert_eq!(delays, vec![Duration::from_secs(5), Duration::from_secs(10)]);
        assert!(q.is_empty());
    }

    #[test]
    fn requeue_keeps_retry_count() {
        let t0 = Instant::now();
        let mut q = DeliveryQueue::new(2, Duration::from_secs(5));
        q.push(msg(1, t0));
        q.push(msg(2, t0));

        let head = q.pop().unwrap();
        q.requeue(head);
        let again = q.pop().unwrap();
        assert_eq!(again.body, "reminder 1");
        assert_eq!(again.retry_count, 0);
    }

    #[test]
    fn contains_pending_pair() {
        let t0 = Instant::now();
        let mut q = DeliveryQueue::new(2, Duration::from_secs(5));
        let m = msg(1, t0);
        let key = m.key();
        q.push(m);
        assert!(q.contains_key(&key));
        assert!(!q.contains_key(&msg(2, t0).key()));
    }

    #[test]
    fn take_origin_keeps_the_rest_in_order() {
        let t0 = Instant::now();
        let mut q = DeliveryQueue::new(2, Duration::from_secs(5));
        q.push(msg(1, t0));
        let mut b = msg(2, t0);
        b.origin = Origin::Broadcast(7);
        q.push(b);
        q.push(msg(3, t0));

        let taken = q.take_origin(Origin::Broadcast(7));
        assert_eq!(taken.len(), 1);
        assert_eq!(q.pop().unwrap().body, "reminder 1");
        assert_eq!(q.pop().unwrap().body, "reminder 3");
    }

    #[test]
    fn clear_returns_pending() {
        let t0 = Instant::now();
        let mut q = DeliveryQueue::new(2, Duration::from_secs(5));
        q.push(msg(1, t0));
        q.push(msg(2, t0));
        assert_eq!(q.clear().len(), 2);
        assert!(q.is_empty());
    }

    #[test]
    fn processor_single_cycle() {
        let t0 = Instant::now();
        let mut p = Processor::default();
        assert!(p.start(t0));
        assert!(!p.start(t0));
        assert!(p.is_due(t0));

        p.begin_send();
        assert!(!p.is_due(t0));
        assert!(p.resume_at().is_none());

        p.finish_send(false, t0, Duration::from_secs(12));
        assert!(!p.is_due(t0 + Duration::from_secs(11)));
        assert!(p.is_due(t0 + Duration::from_secs(12)));

        p.begin_send();
        p.finish_send(true, t0, Duration::from_secs(12));
        assert!(!p.is_running());
        assert!(p.start(t0));
    }

    #[test]
    fn processor_pause_and_resume() {
        let t0 = Instant::now();
        let mut p = Processor::default();
        p.start(t0);
        p.pause();
        assert!(!p.is_due(t0 + Duration::from_secs(60)));

        p.resume(t0 + Duration::from_secs(60));
        assert!(p.is_due(t0 + Duration::from_secs(60)));

        p.stop();
        p.resume(t0);
        assert!(!p.is_running());
    }

    #[test]
    fn cancelled_send_parks_until_resumed() {
        let t0 = Instant::now();
        let mut p = Processor::default();
        p.start(t0);
        p.begin_send();
        p.pause();
        p.resume(t0);
        assert!(p.is_in_flight());
        assert!(!p.is_due(t0));

        p.cancel_send();
        assert!(p.is_running());
        assert!(!p.is_due(t0 + Duration::from_secs(60)));
        p.resume(t0 + Duration::from_secs(60));
        assert!(p.is_due(t0 + Duration::from_secs(60)));
    }
}
