use std::collections::VecDeque;
use std::time::Instant;

use dunning_transport::TransportEvent;

use crate::broadcast::{BroadcastJob, Phase};
use crate::config::OutboundConfig;
use crate::connection::{ConnectionAction, ConnectionManager, HeartbeatCause};
use crate::dedup::DedupStore;
use crate::error::OutboundError;
use crate::limiter::{RateLimited, RateLimiter};
use crate::queue::{DeliveryQueue, Origin, Processor, QueuedMessage, RetryDecision};
use crate::security::{SecurityAlert, SecurityMetrics, SecurityMonitor};
use crate::timer::{earliest, Deadline};
use crate::types::{ConnectionState, MessageId, PairingPayload, RecipientId};

use super::effect::RuntimeEffect;
use super::{ServiceEvent, ServiceStatus};

/// Outcome of a broadcast request that passed its preconditions.
#[derive(Debug, PartialEq, Eq)]
pub enum BroadcastStart {
    /// Nothing to send; the tally is final.
    Empty,
    /// Job queued; its reply is resolved by a later `FinishBroadcast`.
    Started(u64),
}

/// Complete service state: pure logic, no async, no I/O.
///
/// Every handler appends the effects the executor must perform.
pub struct ServiceState {
    pub(crate) config: OutboundConfig,

    // Gates
    pub(crate) monitor: SecurityMonitor,
    pub(crate) limiter: RateLimiter,
    pub(crate) dedup: DedupStore,

    // Delivery
    pub(crate) queue: DeliveryQueue,
    pub(crate) processor: Processor,
    /// Copy of the item handed to the transport, until its outcome is in.
    delivering: Option<QueuedMessage>,

    // Connection
    pub(crate) connection: ConnectionManager,

    // Broadcast
    broadcasts: VecDeque<BroadcastJob>,
    next_job_id: u64,

    suspicious_clear: Deadline,
}

impl ServiceState {
    pub fn new(config: OutboundConfig) -> Self {
        Self {
            monitor: SecurityMonitor::new(&config),
            limiter: RateLimiter::new(&config),
            dedup: DedupStore::new(config.dedup_window, config.dedup_capacity),
            queue: DeliveryQueue::new(config.max_send_retries, config.retry_backoff),
            processor: Processor::default(),
            delivering: None,
            connection: ConnectionManager::new(&config),
            broadcasts: VecDeque::new(),
            next_job_id: 1,
            suspicious_clear: Deadline::default(),
            config,
        }
    }

    /// Earliest instant at which [`on_tick`](Self::on_tick) has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        earliest([
            self.connection.next_deadline(),
            self.processor.resume_at(),
            self.broadcasts.front().and_then(BroadcastJob::wake_at),
            self.suspicious_clear.at(),
        ])
    }

    // ── Queries ──────────────────────────────────────────────────────────

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn pairing(&self) -> Option<PairingPayload> {
        self.connection.pairing().cloned()
    }

    pub fn is_ready(&self, now: Instant) -> bool {
        self.connection.is_open() && !self.monitor.is_suspicious_at(now)
    }

    pub fn metrics(&mut self, now: Instant) -> SecurityMetrics {
        self.monitor.snapshot_at(now)
    }

    pub fn status(&mut self, now: Instant) -> ServiceStatus {
        let purged = self.dedup.purge_expired_at(now);
        if purged > 0 {
            tracing::trace!(purged, "expired dedup records dropped");
        }
        ServiceStatus {
            connection: self.connection.state(),
            ready: self.is_ready(now),
            queue_len: self.queue.len() + usize::from(self.delivering.is_some()),
            processor_running: self.processor.is_running(),
            active_broadcasts: self.broadcasts.len(),
            reconnect_attempts: self.connection.reconnect_attempts(),
            reconnect_scheduled: self.connection.reconnect_pending(),
            dedup_entries: self.dedup.len(),
            security: self.monitor.snapshot_at(now),
        }
    }

    // ── Commands ─────────────────────────────────────────────────────────

    pub fn initialize(
        &mut self,
        now: Instant,
        effects: &mut Vec<RuntimeEffect>,
    ) -> Result<bool, OutboundError> {
        if self.monitor.is_suspicious_at(now) {
            return Err(OutboundError::SecurityBlocked);
        }
        let (started, actions) = self.connection.initialize(now);
        self.apply(actions, now, effects);
        Ok(started)
    }

    /// Admission path for a single message.
    ///
    /// Checks run in a fixed order: security flag, validation, connection,
    /// duplicate, rate limit. A rejected request never touches the queue.
    pub fn send_message(
        &mut self,
        recipient: &str,
        body: String,
        now: Instant,
        effects: &mut Vec<RuntimeEffect>,
    ) -> Result<MessageId, OutboundError> {
        if self.monitor.is_suspicious_at(now) {
            return Err(OutboundError::SecurityBlocked);
        }
        let recipient: RecipientId = recipient.parse()?;
        self.validate_body(&body)?;
        self.require_open()?;
        if self.is_duplicate(&recipient, &body, now) {
            return Err(OutboundError::Duplicate { recipient });
        }
        if let Err(limited) = self.limiter.try_acquire_at(&mut self.monitor, now) {
            self.on_rate_limited(&limited, now, effects);
            return Err(limited.into());
        }
        let id = self.enqueue(recipient, body, Origin::Direct, now, effects);
        self.pump(now, effects);
        Ok(id)
    }

    pub fn broadcast(
        &mut self,
        recipients: Vec<String>,
        body: String,
        now: Instant,
        effects: &mut Vec<RuntimeEffect>,
    ) -> Result<BroadcastStart, OutboundError> {
        if self.monitor.is_suspicious_at(now) {
            return Err(OutboundError::SecurityBlocked);
        }
        self.validate_body(&body)?;
        self.require_open()?;
        if recipients.is_empty() {
            return Ok(BroadcastStart::Empty);
        }

        let id = self.next_job_id;
        self.next_job_id += 1;
        let job = BroadcastJob::new(
            id,
            recipients,
            body,
            self.config.broadcast_batch_size,
            self.config.broadcast_batch_delay,
            now,
        );
        tracing::info!(
            job = id,
            recipients = job.remaining(),
            batches = job.batches_left(),
            "broadcast started"
        );
        self.broadcasts.push_back(job);
        self.drive_broadcasts(now, effects);
        self.pump(now, effects);
        Ok(BroadcastStart::Started(id))
    }

    /// Local close: cancel timers, drop pending work, go `closed`.
    pub fn disconnect(&mut self, now: Instant, effects: &mut Vec<RuntimeEffect>) {
        self.teardown(now, effects);
        let actions = self.connection.disconnect();
        self.apply(actions, now, effects);
    }

    /// Terminal teardown: as [`disconnect`](Self::disconnect), plus revoke
    /// the session and reset every counter.
    pub fn logout(&mut self, now: Instant, effects: &mut Vec<RuntimeEffect>) {
        self.teardown(now, effects);
        let actions = self.connection.logout();
        self.apply(actions, now, effects);
        self.monitor.reset();
        self.dedup.clear();
        self.suspicious_clear.cancel();
    }

    // ── Transport ────────────────────────────────────────────────────────

    pub fn handle_transport_event(
        &mut self,
        event: TransportEvent,
        now: Instant,
        effects: &mut Vec<RuntimeEffect>,
    ) {
        let actions = match event {
            TransportEvent::Pairing(payload) => self.connection.on_pairing(payload, now),
            TransportEvent::Opened => self.connection.on_opened(now),
            TransportEvent::CredentialsUpdated(credentials) => {
                self.connection.on_credentials(credentials)
            }
            TransportEvent::Inbound(message) => {
                self.connection.record_activity(now);
                effects.push(RuntimeEffect::Emit(ServiceEvent::Inbound { message }));
                Vec::new()
            }
            TransportEvent::Closed(reason) => self.connection.on_closed(reason, now),
        };
        self.apply(actions, now, effects);
        self.pump(now, effects);
    }

    pub fn handle_stream_ended(&mut self, now: Instant, effects: &mut Vec<RuntimeEffect>) {
        let actions = self.connection.on_stream_ended(now);
        self.apply(actions, now, effects);
    }

    pub fn on_connect_failed(&mut self, now: Instant) -> Vec<RuntimeEffect> {
        let mut effects = Vec::new();
        let actions = self.connection.on_connect_failed(now);
        self.apply(actions, now, &mut effects);
        effects
    }

    pub fn on_heartbeat_result(
        &mut self,
        cause: HeartbeatCause,
        ok: bool,
        now: Instant,
    ) -> Vec<RuntimeEffect> {
        let mut effects = Vec::new();
        let actions = self.connection.on_heartbeat_result(cause, ok, now);
        self.apply(actions, now, &mut effects);
        effects
    }

    /// Outcome of a `Deliver` effect.
    pub fn on_send_result(
        &mut self,
        item: QueuedMessage,
        result: Result<(), String>,
        now: Instant,
    ) -> Vec<RuntimeEffect> {
        let mut effects = Vec::new();
        self.delivering = None;
        match result {
            Ok(()) => {
                self.dedup.mark_sent_at(&item.recipient, &item.body, now);
                self.connection.record_activity(now);
                tracing::debug!(id = %item.id, recipient = %item.recipient, "delivered");
                effects.push(RuntimeEffect::Emit(ServiceEvent::MessageDelivered {
                    id: item.id,
                    recipient: item.recipient.clone(),
                }));
                self.processor
                    .finish_send(self.queue.is_empty(), now, self.config.min_interval);
                self.settle_broadcast(item.origin, item.id, true, now);
            }
            Err(error) if !self.processor.is_running() || self.is_orphaned(&item) => {
                tracing::debug!(id = %item.id, %error, "send failed for discarded work, not retried");
                self.processor
                    .finish_send(self.queue.is_empty(), now, self.config.min_interval);
            }
            Err(error) => {
                tracing::warn!(id = %item.id, recipient = %item.recipient, %error, "send failed");
                match self.queue.on_failure(item) {
                    RetryDecision::Retry { delay } => {
                        self.processor.finish_send(false, now, delay);
                    }
                    RetryDecision::Drop(item) => {
                        self.monitor.record_failure();
                        tracing::warn!(
                            id = %item.id,
                            attempts = item.retry_count + 1,
                            "retries exhausted, message dropped"
                        );
                        effects.push(RuntimeEffect::Emit(ServiceEvent::MessageFailed {
                            id: item.id,
                            recipient: item.recipient.clone(),
                            attempts: item.retry_count + 1,
                            error,
                        }));
                        self.processor
                            .finish_send(self.queue.is_empty(), now, self.config.min_interval);
                        self.settle_broadcast(item.origin, item.id, false, now);
                    }
                }
            }
        }
        self.drive_broadcasts(now, &mut effects);
        self.pump(now, &mut effects);
        effects
    }

    /// A `Deliver` called off before the transport answered.
    ///
    /// The item goes back to the head without counting a retry, unless
    /// the work it belonged to is gone.
    pub fn on_delivery_cancelled(&mut self, item: QueuedMessage) -> Vec<RuntimeEffect> {
        self.delivering = None;
        if !self.processor.is_running() || self.is_orphaned(&item) {
            tracing::debug!(id = %item.id, "cancelled delivery discarded");
            return Vec::new();
        }
        tracing::debug!(id = %item.id, "cancelled delivery requeued");
        self.queue.requeue(item);
        self.processor.cancel_send();
        Vec::new()
    }

    // ── Tick ─────────────────────────────────────────────────────────────

    /// Fire every due timer.
    pub fn on_tick(&mut self, now: Instant, effects: &mut Vec<RuntimeEffect>) {
        if self.suspicious_clear.fire_if_due(now) && self.monitor.clear_expired_at(now) {
            effects.push(RuntimeEffect::Emit(ServiceEvent::SecurityAlert {
                alert: SecurityAlert::SuspicionCleared,
            }));
            if self.connection.is_open() {
                self.processor.resume(now);
            }
        }

        let actions = self.connection.on_tick(now);
        self.apply(actions, now, effects);

        self.drive_broadcasts(now, effects);
        self.pump(now, effects);
    }

    // ── Internals ────────────────────────────────────────────────────────

    fn validate_body(&self, body: &str) -> Result<(), OutboundError> {
        if body.trim().is_empty() {
            return Err(OutboundError::validation("message body is empty"));
        }
        let len = body.chars().count();
        if len > self.config.max_body_len {
            return Err(OutboundError::validation(format!(
                "message body is {len} characters, limit is {}",
                self.config.max_body_len
            )));
        }
        Ok(())
    }

    fn require_open(&self) -> Result<(), OutboundError> {
        if self.connection.is_open() {
            Ok(())
        } else if self.connection.session_revoked() {
            Err(OutboundError::FatalSession)
        } else {
            Err(OutboundError::NotConnected {
                state: self.connection.state(),
            })
        }
    }

    /// Sent within the window, or an identical pair already pending.
    fn is_duplicate(&mut self, recipient: &RecipientId, body: &str, now: Instant) -> bool {
        if self.dedup.is_duplicate_at(recipient, body, now) {
            return true;
        }
        let key = crate::dedup::dedup_key(recipient, body);
        self.queue.contains_key(&key) || self.delivering.as_ref().is_some_and(|m| m.key() == key)
    }

    /// Broadcast item whose job has already finished.
    fn is_orphaned(&self, item: &QueuedMessage) -> bool {
        match item.origin {
            Origin::Broadcast(job) => !self.broadcasts.iter().any(|j| j.id() == job),
            Origin::Direct => false,
        }
    }

    fn enqueue(
        &mut self,
        recipient: RecipientId,
        body: String,
        origin: Origin,
        now: Instant,
        effects: &mut Vec<RuntimeEffect>,
    ) -> MessageId {
        let item = QueuedMessage::new(recipient, body, origin, now);
        let id = item.id;
        tracing::debug!(%id, recipient = %item.recipient, queue_len = self.queue.len() + 1, "queued");
        effects.push(RuntimeEffect::Emit(ServiceEvent::MessageQueued {
            id,
            recipient: item.recipient.clone(),
        }));
        self.queue.push(item);
        self.processor.start(now);
        id
    }

    /// Hand the queue head to the transport if the processor is due.
    fn pump(&mut self, now: Instant, effects: &mut Vec<RuntimeEffect>) {
        if !self.processor.is_due(now) {
            return;
        }
        if !self.connection.is_open() || self.monitor.is_suspicious_at(now) {
            self.processor.pause();
            return;
        }
        match self.queue.pop() {
            Some(item) => {
                self.processor.begin_send();
                self.monitor.record_attempt(&item.recipient);
                self.delivering = Some(item.clone());
                effects.push(RuntimeEffect::Deliver(item));
            }
            None => self.processor.stop(),
        }
    }

    /// A refusal that tipped the monitor puts the whole service on hold.
    fn on_rate_limited(&mut self, limited: &RateLimited, now: Instant, effects: &mut Vec<RuntimeEffect>) {
        if limited.raised_flag {
            self.raise_suspicion(now, effects);
        }
    }

    fn raise_suspicion(&mut self, now: Instant, effects: &mut Vec<RuntimeEffect>) {
        if let Some(until) = self.monitor.suspicious_until() {
            self.suspicious_clear.arm(until);
        }
        effects.push(RuntimeEffect::Emit(ServiceEvent::SecurityAlert {
            alert: SecurityAlert::SuspiciousActivity {
                cooldown: self.monitor.cooldown(),
            },
        }));
        self.processor.pause();
        self.abort_broadcasts(now, effects);
    }

    /// Turn connection actions into effects and react to state changes.
    fn apply(&mut self, actions: Vec<ConnectionAction>, now: Instant, effects: &mut Vec<RuntimeEffect>) {
        for action in actions {
            match action {
                ConnectionAction::Connect => effects.push(RuntimeEffect::Connect),
                ConnectionAction::Disconnect => effects.push(RuntimeEffect::Disconnect),
                ConnectionAction::Logout => effects.push(RuntimeEffect::Logout),
                ConnectionAction::Heartbeat(cause) => effects.push(RuntimeEffect::Heartbeat(cause)),
                ConnectionAction::SaveCredentials(c) => {
                    effects.push(RuntimeEffect::SaveCredentials(c))
                }
                ConnectionAction::ClearCredentials => effects.push(RuntimeEffect::ClearCredentials),
                ConnectionAction::PairingChanged(payload) => {
                    effects.push(RuntimeEffect::Emit(ServiceEvent::PairingPayload { payload }))
                }
                ConnectionAction::Alert(alert) => {
                    effects.push(RuntimeEffect::Emit(ServiceEvent::SecurityAlert { alert }))
                }
                ConnectionAction::StateChanged { previous, current } => {
                    effects.push(RuntimeEffect::Emit(ServiceEvent::ConnectionStateChanged {
                        previous,
                        current,
                    }));
                    if current == ConnectionState::Open {
                        self.processor.resume(now);
                    } else if previous == ConnectionState::Open {
                        self.processor.pause();
                        if self.delivering.is_some() {
                            effects.push(RuntimeEffect::CancelDelivery);
                        }
                        self.abort_broadcasts(now, effects);
                    }
                }
            }
        }
    }

    /// Drop pending work ahead of a local close.
    fn teardown(&mut self, now: Instant, effects: &mut Vec<RuntimeEffect>) {
        self.abort_broadcasts(now, effects);
        let dropped = self.queue.clear();
        if !dropped.is_empty() {
            tracing::info!(dropped = dropped.len(), "pending messages discarded");
        }
        self.processor.stop();
    }

    /// Advance the head broadcast as far as it can go right now.
    fn drive_broadcasts(&mut self, now: Instant, effects: &mut Vec<RuntimeEffect>) {
        loop {
            let Some(job) = self.broadcasts.front_mut() else {
                return;
            };
            if job.is_done() {
                let (id, tally) = (job.id(), job.tally());
                self.broadcasts.pop_front();
                tracing::info!(
                    job = id,
                    success = tally.success_count,
                    failed = tally.failed_count,
                    "broadcast finished"
                );
                effects.push(RuntimeEffect::Emit(ServiceEvent::BroadcastFinished { job: id, tally }));
                effects.push(RuntimeEffect::FinishBroadcast { job: id, tally });
                continue;
            }

            match job.phase() {
                Phase::AwaitDelivery { .. } => return,
                Phase::BatchPause { until } => {
                    if now < until {
                        return;
                    }
                    job.end_pause(now);
                }
                Phase::Admit { at } => {
                    if now < at {
                        return;
                    }
                    self.admit_broadcast_head(now, effects);
                }
            }
        }
    }

    /// Push the head job's next recipient through the send gates.
    ///
    /// Waits for a permit instead of taking a rate-limit rejection, so a
    /// broadcast never counts as a violation.
    fn admit_broadcast_head(&mut self, now: Instant, effects: &mut Vec<RuntimeEffect>) {
        let Some(job) = self.broadcasts.front() else {
            return;
        };
        let job_id = job.id();
        let body = job.body().to_string();
        let raw = job.peek_recipient().map(str::to_string);

        let recipient = match raw.as_deref().map(str::parse::<RecipientId>) {
            Some(Ok(r)) => r,
            Some(Err(e)) => {
                tracing::warn!(job = job_id, error = %e, "broadcast recipient rejected");
                self.refuse_broadcast_head(now);
                return;
            }
            None => {
                self.refuse_broadcast_head(now);
                return;
            }
        };
        if self.is_duplicate(&recipient, &body, now) {
            tracing::debug!(job = job_id, %recipient, "broadcast recipient is a duplicate");
            self.refuse_broadcast_head(now);
            return;
        }

        let permit_at = self.limiter.next_permit_at(&mut self.monitor, now);
        if permit_at > now {
            if let Some(job) = self.broadcasts.front_mut() {
                job.defer_until(permit_at);
            }
            return;
        }
        if let Err(limited) = self.limiter.try_acquire_at(&mut self.monitor, now) {
            if let Some(job) = self.broadcasts.front_mut() {
                job.defer_until(now + limited.retry_after);
            }
            self.on_rate_limited(&limited, now, effects);
            return;
        }

        let id = self.enqueue(recipient, body, Origin::Broadcast(job_id), now, effects);
        if let Some(job) = self.broadcasts.front_mut() {
            job.admitted(id);
        }
    }

    fn refuse_broadcast_head(&mut self, now: Instant) {
        if let Some(job) = self.broadcasts.front_mut() {
            job.refused(now);
        }
    }

    fn settle_broadcast(&mut self, origin: Origin, id: MessageId, delivered: bool, now: Instant) {
        let Origin::Broadcast(job_id) = origin else {
            return;
        };
        if let Some(job) = self.broadcasts.iter_mut().find(|j| j.id() == job_id) {
            job.settle(id, delivered, now);
        }
    }

    /// Finish every broadcast now, counting what is left as failed.
    fn abort_broadcasts(&mut self, now: Instant, effects: &mut Vec<RuntimeEffect>) {
        while let Some(mut job) = self.broadcasts.pop_front() {
            self.queue.take_origin(Origin::Broadcast(job.id()));
            let tally = job.abort(now);
            tracing::warn!(
                job = job.id(),
                success = tally.success_count,
                failed = tally.failed_count,
                "broadcast aborted"
            );
            effects.push(RuntimeEffect::Emit(ServiceEvent::BroadcastFinished {
                job: job.id(),
                tally,
            }));
            effects.push(RuntimeEffect::FinishBroadcast {
                job: job.id(),
                tally,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    const ALICE: &str = "628111@s.example.net";
    const BOB: &str = "628222@s.example.net";

    /// State with an open connection at `t0`.
    fn open_state(config: OutboundConfig) -> (ServiceState, Instant) {
        let t0 = Instant::now();
        let mut state = ServiceState::new(config);
        let mut effects = Vec::new();
        assert_eq!(state.initialize(t0, &mut effects), Ok(true));
        state.handle_transport_event(TransportEvent::Opened, t0, &mut effects);
        assert_eq!(state.connection_state(), ConnectionState::Open);
        (state, t0)
    }

    fn delivered(effects: &[RuntimeEffect]) -> Vec<QueuedMessage> {
        effects
            .iter()
            .filter_map(|e| match e {
                RuntimeEffect::Deliver(item) => Some(item.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn initialize_emits_connect() {
        let mut state = ServiceState::new(OutboundConfig::default());
        let mut effects = Vec::new();
        assert_eq!(state.initialize(Instant::now(), &mut effects), Ok(true));
        assert!(effects.iter().any(|e| matches!(e, RuntimeEffect::Connect)));
    }

    #[test]
    fn send_requires_open() {
        let mut state = ServiceState::new(OutboundConfig::default());
        let mut effects = Vec::new();
        let err = state
            .send_message(ALICE, "hi".into(), Instant::now(), &mut effects)
            .unwrap_err();
        assert_eq!(
            err,
            OutboundError::NotConnected {
                state: ConnectionState::Closed
            }
        );
    }

    #[test]
    fn validation_before_connection() {
        let mut state = ServiceState::new(OutboundConfig::default());
        let mut effects = Vec::new();
        let now = Instant::now();
        assert!(matches!(
            state.send_message("not-an-id", "hi".into(), now, &mut effects),
            Err(OutboundError::Validation { .. })
        ));
        assert!(matches!(
            state.send_message(ALICE, "   ".into(), now, &mut effects),
            Err(OutboundError::Validation { .. })
        ));
        assert!(matches!(
            state.send_message(ALICE, "x".repeat(4097), now, &mut effects),
            Err(OutboundError::Validation { .. })
        ));
    }

    #[test]
    fn admitted_send_is_delivered_immediately() {
        let (mut state, t0) = open_state(OutboundConfig::default());
        let mut effects = Vec::new();
        let id = state
            .send_message(ALICE, "pay 50k".into(), t0, &mut effects)
            .unwrap();
        let items = delivered(&effects);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, id);
        assert!(state.processor.is_in_flight());
    }

    #[test]
    fn pending_identical_pair_is_duplicate() {
        let config = OutboundConfig {
            min_interval: Duration::ZERO,
            ..Default::default()
        };
        let (mut state, t0) = open_state(config);
        let mut effects = Vec::new();
        state.send_message(ALICE, "a".into(), t0, &mut effects).unwrap();
        state.send_message(BOB, "a".into(), t0, &mut effects).unwrap();
        // Second item is still queued behind the in-flight one.
        assert_eq!(
            state.send_message(BOB, "a".into(), t0, &mut effects),
            Err(OutboundError::Duplicate {
                recipient: BOB.parse().unwrap()
            })
        );
    }

    #[test]
    fn success_marks_dedup_and_spaces_next_send() {
        let config = OutboundConfig {
            min_interval: Duration::ZERO,
            ..Default::default()
        };
        let (mut state, t0) = open_state(config);
        let mut effects = Vec::new();
        state.send_message(ALICE, "a".into(), t0, &mut effects).unwrap();
        let item = delivered(&effects).remove(0);

        let effects = state.on_send_result(item, Ok(()), t0);
        assert!(effects
            .iter()
            .any(|e| matches!(e, RuntimeEffect::Emit(ServiceEvent::MessageDelivered { .. }))));
        assert!(!state.processor.is_running());

        let mut effects = Vec::new();
        assert!(matches!(
            state.send_message(ALICE, "a".into(), t0 + secs(1), &mut effects),
            Err(OutboundError::Duplicate { .. })
        ));
    }

    #[test]
    fn failing_item_retried_at_head_then_dropped() {
        let (mut state, t0) = open_state(OutboundConfig::default());
        let mut effects = Vec::new();
        state.send_message(ALICE, "a".into(), t0, &mut effects).unwrap();
        let mut item = delivered(&effects).remove(0);

        let mut now = t0;
        for expected in [5, 10] {
            let effects = state.on_send_result(item, Err("boom".into()), now);
            assert!(delivered(&effects).is_empty());
            let resume = state.processor.resume_at().unwrap();
            assert_eq!(resume - now, secs(expected));
            now = resume;

            let mut effects = Vec::new();
            state.on_tick(now, &mut effects);
            item = delivered(&effects).remove(0);
        }
        assert_eq!(item.retry_count, 2);

        let effects = state.on_send_result(item, Err("boom".into()), now);
        assert!(effects.iter().any(|e| matches!(
            e,
            RuntimeEffect::Emit(ServiceEvent::MessageFailed { attempts: 3, .. })
        )));
        assert_eq!(state.metrics(now).failed_attempts, 1);
        assert!(state.queue.is_empty());
    }

    #[test]
    fn suspicion_blocks_then_clears() {
        let (mut state, t0) = open_state(OutboundConfig::default());
        let mut effects = Vec::new();
        state.send_message(ALICE, "first".into(), t0, &mut effects).unwrap();

        for i in 0..4 {
            let _ = state.send_message(BOB, format!("spam {i}"), t0 + secs(1), &mut effects);
        }
        assert!(effects.iter().any(|e| matches!(
            e,
            RuntimeEffect::Emit(ServiceEvent::SecurityAlert {
                alert: SecurityAlert::SuspiciousActivity { .. }
            })
        )));
        assert_eq!(
            state.send_message(BOB, "fine".into(), t0 + secs(20), &mut effects),
            Err(OutboundError::SecurityBlocked)
        );
        assert!(!state.is_ready(t0 + secs(20)));

        let clear_at = state.next_deadline().unwrap();
        assert_eq!(clear_at, t0 + secs(1) + secs(300));
        let mut effects = Vec::new();
        state.on_tick(clear_at, &mut effects);
        assert!(state.is_ready(clear_at));
        assert!(state
            .send_message(BOB, "fine".into(), clear_at, &mut effects)
            .is_ok());
    }

    #[test]
    fn close_pauses_processor_and_keeps_queue() {
        let config = OutboundConfig {
            min_interval: Duration::ZERO,
            ..Default::default()
        };
        let (mut state, t0) = open_state(config);
        let mut effects = Vec::new();
        state.send_message(ALICE, "a".into(), t0, &mut effects).unwrap();
        state.send_message(BOB, "b".into(), t0, &mut effects).unwrap();
        let item = delivered(&effects).remove(0);
        // Failed item goes back to the head, ahead of BOB.
        state.on_send_result(item, Err("reset".into()), t0);

        let mut effects = Vec::new();
        state.handle_transport_event(
            TransportEvent::Closed(dunning_transport::DisconnectReason::ConnectionLost),
            t0,
            &mut effects,
        );
        assert_eq!(state.queue.len(), 2);
        assert!(state.processor.resume_at().is_none());

        // Reconnect and reopen: the retried item goes out first.
        let mut effects = Vec::new();
        state.on_tick(t0 + secs(5), &mut effects);
        assert!(effects.iter().any(|e| matches!(e, RuntimeEffect::Connect)));
        state.handle_transport_event(TransportEvent::Opened, t0 + secs(6), &mut effects);
        let items = delivered(&effects);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].recipient.as_str(), ALICE);
    }

    #[test]
    fn logout_resets_everything() {
        let (mut state, t0) = open_state(OutboundConfig::default());
        let mut effects = Vec::new();
        state.send_message(ALICE, "a".into(), t0, &mut effects).unwrap();

        let mut effects = Vec::new();
        state.logout(t0, &mut effects);
        assert!(effects.iter().any(|e| matches!(e, RuntimeEffect::Logout)));
        assert!(effects.iter().any(|e| matches!(e, RuntimeEffect::ClearCredentials)));
        assert_eq!(state.connection_state(), ConnectionState::Closed);
        assert!(state.queue.is_empty());
        assert!(!state.processor.is_running());
        assert_eq!(state.metrics(t0).messages_this_minute, 0);
        assert_eq!(state.next_deadline(), None);
    }

    #[test]
    fn broadcast_skips_invalid_and_duplicate_recipients() {
        let config = OutboundConfig {
            min_interval: Duration::ZERO,
            ..Default::default()
        };
        let (mut state, t0) = open_state(config);
        let mut effects = Vec::new();
        let start = state
            .broadcast(
                vec!["bogus".into(), ALICE.into(), ALICE.into()],
                "due".into(),
                t0,
                &mut effects,
            )
            .unwrap();
        assert_eq!(start, BroadcastStart::Started(1));

        let item = delivered(&effects).remove(0);
        assert_eq!(item.recipient.as_str(), ALICE);
        let effects = state.on_send_result(item, Ok(()), t0);
        let tally = effects.iter().find_map(|e| match e {
            RuntimeEffect::FinishBroadcast { tally, .. } => Some(*tally),
            _ => None,
        });
        let tally = tally.expect("broadcast finished");
        assert_eq!(tally.success_count, 1);
        assert_eq!(tally.failed_count, 2);
    }

    #[test]
    fn broadcast_aborts_on_close() {
        let (mut state, t0) = open_state(OutboundConfig::default());
        let mut effects = Vec::new();
        state
            .broadcast(vec![ALICE.into(), BOB.into()], "due".into(), t0, &mut effects)
            .unwrap();

        let mut effects = Vec::new();
        state.handle_transport_event(
            TransportEvent::Closed(dunning_transport::DisconnectReason::TimedOut),
            t0,
            &mut effects,
        );
        let tally = effects
            .iter()
            .find_map(|e| match e {
                RuntimeEffect::FinishBroadcast { tally, .. } => Some(*tally),
                _ => None,
            })
            .expect("broadcast aborted");
        assert_eq!(tally.failed_count, 2);
        assert!(state.queue.is_empty());
    }

    #[test]
    fn delivery_behind_a_failed_heartbeat_is_held_back() {
        let config = OutboundConfig {
            session_refresh_period: secs(10),
            retry_backoff: secs(10),
            ..Default::default()
        };
        let (mut state, t0) = open_state(config);
        let mut effects = Vec::new();
        state.send_message(ALICE, "due".into(), t0, &mut effects).unwrap();
        let item = delivered(&effects).remove(0);
        state.on_send_result(item, Err("reset".into()), t0);

        // Refresh and retry come due together; the heartbeat runs first.
        let mut effects = Vec::new();
        state.on_tick(t0 + secs(10), &mut effects);
        let heartbeat = effects
            .iter()
            .position(|e| matches!(e, RuntimeEffect::Heartbeat(HeartbeatCause::SessionRefresh)))
            .unwrap();
        let deliver = effects
            .iter()
            .position(|e| matches!(e, RuntimeEffect::Deliver(_)))
            .unwrap();
        assert!(heartbeat < deliver);
        let item = delivered(&effects).remove(0);

        let follow_up = state.on_heartbeat_result(HeartbeatCause::SessionRefresh, false, t0 + secs(10));
        assert_eq!(state.connection_state(), ConnectionState::Closed);
        assert!(follow_up.iter().any(|e| matches!(e, RuntimeEffect::CancelDelivery)));

        // The pending Deliver never reaches the transport: back to the
        // head, retry count untouched.
        assert!(state.on_delivery_cancelled(item).is_empty());
        assert_eq!(state.status(t0 + secs(10)).queue_len, 1);
        assert!(state.processor.resume_at().is_none());

        let mut effects = Vec::new();
        state.on_tick(t0 + secs(15), &mut effects);
        assert!(effects.iter().any(|e| matches!(e, RuntimeEffect::Connect)));
        state.handle_transport_event(TransportEvent::Opened, t0 + secs(16), &mut effects);
        let items = delivered(&effects);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].recipient.as_str(), ALICE);
        assert_eq!(items[0].retry_count, 1);
    }

    #[test]
    fn in_flight_item_counts_as_pending() {
        let (mut state, t0) = open_state(OutboundConfig::default());
        let mut effects = Vec::new();
        state.send_message(ALICE, "due".into(), t0, &mut effects).unwrap();
        assert!(state.queue.is_empty());
        assert_eq!(state.status(t0).queue_len, 1);
        assert_eq!(
            state.send_message(ALICE, "due".into(), t0 + secs(20), &mut effects),
            Err(OutboundError::Duplicate {
                recipient: ALICE.parse().unwrap()
            })
        );
    }

    #[test]
    fn outcome_after_logout_is_not_retried() {
        let (mut state, t0) = open_state(OutboundConfig::default());
        let mut effects = Vec::new();
        state.send_message(ALICE, "a".into(), t0, &mut effects).unwrap();
        let item = delivered(&effects).remove(0);

        let mut effects = Vec::new();
        state.logout(t0, &mut effects);
        assert!(effects.iter().any(|e| matches!(e, RuntimeEffect::CancelDelivery)));

        state.on_delivery_cancelled(item.clone());
        assert!(state.queue.is_empty());
        state.on_send_result(item, Err("aborted".into()), t0);
        assert!(state.queue.is_empty());
        assert_eq!(state.status(t0).queue_len, 0);
        assert!(!state.processor.is_running());
    }

    #[test]
    fn tipping_refusal_raises_suspicion_and_aborts_broadcasts() {
        let (mut state, t0) = open_state(OutboundConfig::default());
        let mut effects = Vec::new();
        state
            .broadcast(vec![ALICE.into(), BOB.into()], "due".into(), t0, &mut effects)
            .unwrap();
        for _ in 0..4 {
            state.monitor.record_violation_at(t0);
        }

        let mut effects = Vec::new();
        let limited = RateLimited {
            reason: crate::limiter::RateLimitReason::Interval,
            retry_after: secs(12),
            raised_flag: true,
        };
        state.on_rate_limited(&limited, t0, &mut effects);

        assert!(effects.iter().any(|e| matches!(
            e,
            RuntimeEffect::Emit(ServiceEvent::SecurityAlert {
                alert: SecurityAlert::SuspiciousActivity { .. }
            })
        )));
        assert!(effects
            .iter()
            .any(|e| matches!(e, RuntimeEffect::FinishBroadcast { .. })));
        assert_eq!(state.next_deadline(), Some(t0 + secs(300)));
    }

    #[test]
    fn status_drops_expired_dedup_records_and_shows_reconnect() {
        let (mut state, t0) = open_state(OutboundConfig::default());
        let mut effects = Vec::new();
        state.send_message(ALICE, "a".into(), t0, &mut effects).unwrap();
        let item = delivered(&effects).remove(0);
        state.on_send_result(item, Ok(()), t0);

        let status = state.status(t0);
        assert_eq!(status.dedup_entries, 1);
        assert!(!status.reconnect_scheduled);

        let later = t0 + secs(60 * 60);
        let mut effects = Vec::new();
        state.handle_transport_event(
            TransportEvent::Closed(dunning_transport::DisconnectReason::ConnectionLost),
            later,
            &mut effects,
        );
        let status = state.status(later);
        assert_eq!(status.dedup_entries, 0);
        assert!(status.reconnect_scheduled);
    }

    #[test]
    fn empty_broadcast_needs_no_job() {
        let (mut state, t0) = open_state(OutboundConfig::default());
        let mut effects = Vec::new();
        assert_eq!(
            state.broadcast(Vec::new(), "due".into(), t0, &mut effects),
            Ok(BroadcastStart::Empty)
        );
    }
}
