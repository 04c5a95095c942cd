/// Connection manager: lifecycle state machine for the chat session.
///
/// Pure logic: every input takes `now` and returns the actions the
/// runtime must carry out. Timers are [`Deadline`] slots, one per
/// purpose, so re-arming a timer always replaces the previous one.
///
/// ```text
///   closed ──initialize──► connecting ──pairing──► qr-pending
///     ▲  ▲                    │    │                   │
///     │  └──reconnect timer───┘    └──opened──► open ◄─┘
///     │                       connect error│        │ close / heartbeat failure
///     └──────── give up ◄──── error ◄──────┘        ▼
///                                            classify reason
/// ```
use std::time::{Duration, Instant};

use dunning_transport::{Credentials, DisconnectReason, PairingPayload};

use crate::backoff::ReconnectState;
use crate::config::OutboundConfig;
use crate::security::SecurityAlert;
use crate::timer::{earliest, Deadline};
use crate::types::ConnectionState;

/// Why a heartbeat was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatCause {
    SessionRefresh,
    Idle,
}

/// Work the runtime performs on the manager's behalf.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionAction {
    /// Open a transport session with the stored credentials.
    Connect,
    /// Drop the transport session without revoking it.
    Disconnect,
    /// Revoke the session remotely.
    Logout,
    Heartbeat(HeartbeatCause),
    SaveCredentials(Credentials),
    ClearCredentials,
    StateChanged {
        previous: ConnectionState,
        current: ConnectionState,
    },
    PairingChanged(Option<PairingPayload>),
    Alert(SecurityAlert),
}

pub struct ConnectionManager {
    state: ConnectionState,
    reconnect: ReconnectState,
    pairing: Option<PairingPayload>,
    last_activity: Option<Instant>,
    /// The provider rejected or revoked the session; only a fresh
    /// `initialize` (and pairing) brings it back.
    session_revoked: bool,

    // ── Timers ─────────────────────────────────────
    connect_timeout: Deadline,
    qr_expiry: Deadline,
    session_refresh: Deadline,
    idle_check: Deadline,
    reconnect_at: Deadline,

    connect_timeout_after: Duration,
    pairing_timeout: Duration,
    session_refresh_period: Duration,
    idle_threshold: Duration,
}

impl ConnectionManager {
    pub fn new(config: &OutboundConfig) -> Self {
        Self {
            state: ConnectionState::Closed,
            reconnect: ReconnectState::new(
                config.reconnect_base,
                config.reconnect_cap,
                config.max_reconnect_attempts,
            ),
            pairing: None,
            last_activity: None,
            session_revoked: false,
            connect_timeout: Deadline::default(),
            qr_expiry: Deadline::default(),
            session_refresh: Deadline::default(),
            idle_check: Deadline::default(),
            reconnect_at: Deadline::default(),
            connect_timeout_after: config.connect_timeout,
            pairing_timeout: config.pairing_timeout,
            session_refresh_period: config.session_refresh_period,
            idle_threshold: config.idle_threshold,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    /// Current pairing payload; only set while `qr-pending`.
    pub fn pairing(&self) -> Option<&PairingPayload> {
        self.pairing.as_ref()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect.attempts()
    }

    /// Whether a reconnect is scheduled.
    pub fn reconnect_pending(&self) -> bool {
        self.reconnect_at.is_armed()
    }

    pub fn session_revoked(&self) -> bool {
        self.session_revoked
    }

    /// Earliest armed timer.
    pub fn next_deadline(&self) -> Option<Instant> {
        earliest([
            self.connect_timeout.at(),
            self.qr_expiry.at(),
            self.session_refresh.at(),
            self.idle_check.at(),
            self.reconnect_at.at(),
        ])
    }

    // ── Commands ───────────────────────────────────

    /// Start a session unless one is already underway.
    ///
    /// Returns `false` (and no actions) when already connecting, pairing
    /// or open. A manual start resets the reconnect counter.
    pub fn initialize(&mut self, now: Instant) -> (bool, Vec<ConnectionAction>) {
        match self.state {
            ConnectionState::Connecting | ConnectionState::QrPending | ConnectionState::Open => {
                (false, Vec::new())
            }
            ConnectionState::Closed | ConnectionState::Error => {
                self.reconnect_at.cancel();
                self.reconnect.reset();
                self.session_revoked = false;
                let mut actions = Vec::new();
                self.start_connecting(now, &mut actions);
                (true, actions)
            }
        }
    }

    /// Close the session locally. No reconnect is scheduled.
    pub fn disconnect(&mut self) -> Vec<ConnectionAction> {
        let mut actions = Vec::new();
        self.cancel_all();
        self.clear_pairing(&mut actions);
        actions.push(ConnectionAction::Disconnect);
        self.transition(ConnectionState::Closed, &mut actions);
        actions
    }

    /// Revoke the session and forget the credentials.
    pub fn logout(&mut self) -> Vec<ConnectionAction> {
        let mut actions = Vec::new();
        self.cancel_all();
        self.reconnect.reset();
        self.clear_pairing(&mut actions);
        actions.push(ConnectionAction::Logout);
        actions.push(ConnectionAction::ClearCredentials);
        self.transition(ConnectionState::Closed, &mut actions);
        self.last_activity = None;
        actions
    }

    /// Note traffic on the session (send success, inbound, heartbeat ok).
    pub fn record_activity(&mut self, now: Instant) {
        self.last_activity = Some(now);
    }

    // ── Transport inputs ───────────────────────────

    /// `connect()` itself returned an error.
    pub fn on_connect_failed(&mut self, now: Instant) -> Vec<ConnectionAction> {
        let mut actions = Vec::new();
        if self.state != ConnectionState::Connecting {
            return actions;
        }
        self.connect_timeout.cancel();
        self.transition(ConnectionState::Error, &mut actions);
        self.schedule_reconnect(now, &mut actions);
        actions
    }

    /// A pairing payload was issued or rotated.
    ///
    /// The expiry timer starts on the first payload of a pairing session;
    /// rotations only replace the payload.
    pub fn on_pairing(&mut self, payload: PairingPayload, now: Instant) -> Vec<ConnectionAction> {
        let mut actions = Vec::new();
        match self.state {
            ConnectionState::Connecting => {
                self.connect_timeout.cancel();
                self.transition(ConnectionState::QrPending, &mut actions);
            }
            ConnectionState::QrPending => {}
            other => {
                tracing::debug!(state = %other, "ignoring pairing payload");
                return actions;
            }
        }
        self.qr_expiry.arm_if_idle(now + self.pairing_timeout);
        self.pairing = Some(payload.clone());
        actions.push(ConnectionAction::PairingChanged(Some(payload)));
        actions
    }

    pub fn on_opened(&mut self, now: Instant) -> Vec<ConnectionAction> {
        let mut actions = Vec::new();
        if !matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::QrPending
        ) {
            tracing::debug!(state = %self.state, "ignoring open notification");
            return actions;
        }
        self.connect_timeout.cancel();
        self.qr_expiry.cancel();
        self.reconnect_at.cancel();
        self.reconnect.reset();
        self.clear_pairing(&mut actions);
        self.transition(ConnectionState::Open, &mut actions);
        self.last_activity = Some(now);
        self.session_refresh.arm(now + self.session_refresh_period);
        self.idle_check.arm(now + self.idle_threshold);
        tracing::info!("chat session open");
        actions
    }

    pub fn on_credentials(&mut self, credentials: Credentials) -> Vec<ConnectionAction> {
        vec![ConnectionAction::SaveCredentials(credentials)]
    }

    /// The transport reported the connection closed.
    pub fn on_closed(&mut self, reason: DisconnectReason, now: Instant) -> Vec<ConnectionAction> {
        let mut actions = Vec::new();
        if matches!(self.state, ConnectionState::Closed | ConnectionState::Error) {
            tracing::debug!(?reason, "close on inactive connection ignored");
            return actions;
        }
        self.cancel_session_timers();
        self.clear_pairing(&mut actions);
        self.transition(ConnectionState::Closed, &mut actions);

        match reason {
            DisconnectReason::BadSession => {
                tracing::warn!("session rejected by provider, credentials cleared");
                self.reconnect.reset();
                self.session_revoked = true;
                actions.push(ConnectionAction::ClearCredentials);
                actions.push(ConnectionAction::Alert(SecurityAlert::SessionInvalidated));
            }
            DisconnectReason::RestartRequired => {
                tracing::info!("provider requested restart, reconnecting");
                self.reconnect_at.arm(now);
            }
            DisconnectReason::MultiDeviceMismatch => {
                tracing::warn!("multi-device mismatch, not reconnecting");
                actions.push(ConnectionAction::Alert(SecurityAlert::MultiDeviceMismatch));
            }
            DisconnectReason::LoggedOut => {
                tracing::warn!("session logged out remotely");
                self.reconnect.reset();
                self.session_revoked = true;
                actions.push(ConnectionAction::ClearCredentials);
                actions.push(ConnectionAction::Alert(SecurityAlert::LoggedOut));
            }
            transient => {
                tracing::info!(reason = ?transient, "connection lost");
                self.schedule_reconnect(now, &mut actions);
            }
        }
        actions
    }

    /// The event stream ended without a close notification.
    pub fn on_stream_ended(&mut self, now: Instant) -> Vec<ConnectionAction> {
        self.on_closed(DisconnectReason::ConnectionLost, now)
    }

    pub fn on_heartbeat_result(
        &mut self,
        cause: HeartbeatCause,
        ok: bool,
        now: Instant,
    ) -> Vec<ConnectionAction> {
        let mut actions = Vec::new();
        if ok {
            self.record_activity(now);
            return actions;
        }
        if self.state != ConnectionState::Open {
            return actions;
        }
        tracing::warn!(?cause, "heartbeat failed, dropping connection");
        self.cancel_session_timers();
        actions.push(ConnectionAction::Disconnect);
        self.transition(ConnectionState::Closed, &mut actions);
        self.schedule_reconnect(now, &mut actions);
        actions
    }

    // ── Timers ─────────────────────────────────────

    pub fn on_tick(&mut self, now: Instant) -> Vec<ConnectionAction> {
        let mut actions = Vec::new();

        if self.connect_timeout.fire_if_due(now) && self.state == ConnectionState::Connecting {
            tracing::warn!("connect attempt timed out");
            actions.push(ConnectionAction::Disconnect);
            self.transition(ConnectionState::Closed, &mut actions);
            self.schedule_reconnect(now, &mut actions);
        }

        if self.qr_expiry.fire_if_due(now) && self.state == ConnectionState::QrPending {
            tracing::warn!("pairing payload expired, manual restart required");
            self.clear_pairing(&mut actions);
            actions.push(ConnectionAction::Alert(SecurityAlert::PairingExpired));
            actions.push(ConnectionAction::Disconnect);
            self.transition(ConnectionState::Closed, &mut actions);
        }

        if self.reconnect_at.fire_if_due(now)
            && matches!(self.state, ConnectionState::Closed | ConnectionState::Error)
        {
            tracing::info!(attempt = self.reconnect.attempts(), "reconnecting");
            self.start_connecting(now, &mut actions);
        }

        if self.session_refresh.fire_if_due(now) && self.is_open() {
            actions.push(ConnectionAction::Heartbeat(HeartbeatCause::SessionRefresh));
            self.session_refresh.arm(now + self.session_refresh_period);
        }

        if self.idle_check.fire_if_due(now) && self.is_open() {
            let last = self.last_activity.unwrap_or(now);
            if now.saturating_duration_since(last) >= self.idle_threshold {
                actions.push(ConnectionAction::Heartbeat(HeartbeatCause::Idle));
                self.idle_check.arm(now + self.idle_threshold);
            } else {
                self.idle_check.arm(last + self.idle_threshold);
            }
        }

        actions
    }

    // ── Internals ──────────────────────────────────

    fn start_connecting(&mut self, now: Instant, actions: &mut Vec<ConnectionAction>) {
        self.transition(ConnectionState::Connecting, actions);
        self.connect_timeout.arm(now + self.connect_timeout_after);
        actions.push(ConnectionAction::Connect);
    }

    fn schedule_reconnect(&mut self, now: Instant, actions: &mut Vec<ConnectionAction>) {
        match self.reconnect.next_delay() {
            Some(delay) => {
                tracing::info!(
                    attempt = self.reconnect.attempts(),
                    delay_ms = delay.as_millis() as u64,
                    "reconnect scheduled"
                );
                self.reconnect_at.arm(now + delay);
            }
            None => {
                let attempts = self.reconnect.attempts();
                tracing::warn!(attempts, "reconnect attempts exhausted");
                self.transition(ConnectionState::Closed, actions);
                actions.push(ConnectionAction::Alert(SecurityAlert::ReconnectExhausted {
                    attempts,
                }));
            }
        }
    }

    fn transition(&mut self, to: ConnectionState, actions: &mut Vec<ConnectionAction>) {
        if self.state == to {
            return;
        }
        let previous = self.state;
        self.state = to;
        tracing::debug!(%previous, current = %to, "connection state changed");
        actions.push(ConnectionAction::StateChanged {
            previous,
            current: to,
        });
    }

    fn clear_pairing(&mut self, actions: &mut Vec<ConnectionAction>) {
        if self.pairing.take().is_some() {
            actions.push(ConnectionAction::PairingChanged(None));
        }
    }

    fn cancel_session_timers(&mut self) {
        self.connect_timeout.cancel();
        self.qr_expiry.cancel();
        self.session_refresh.cancel();
        self.idle_check.cancel();
    }

    fn cancel_all(&mut self) {
        self.cancel_session_timers();
        self.reconnect_at.cancel();
    }
}
