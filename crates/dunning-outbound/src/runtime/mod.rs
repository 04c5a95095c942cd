/// Outbound service runtime: integrates the gates, queue and connection into a live event loop.
///
/// One task owns the transport and every piece of mutable state (monitor,
/// dedup store, queue, connection manager, broadcast jobs). The application
/// talks to it through a cloneable [`ServiceHandle`] and observes it through
/// a broadcast channel of [`ServiceEvent`]s, so any number of observers can
/// listen without replacing each other.
mod effect;
mod executor;
mod r#loop;
mod observer;
mod state;

use std::time::Instant;

use dunning_transport::{ChatTransport, CredentialStore};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::OutboundConfig;
use crate::error::OutboundError;
use crate::security::{SecurityAlert, SecurityMetrics};
use crate::types::{
    BroadcastTally, ConnectionState, InboundMessage, MessageId, PairingPayload, RecipientId,
};

pub use observer::ServiceObserver;

type Reply<T> = oneshot::Sender<Result<T, OutboundError>>;

// ── Commands (app → runtime) ──────────────────────────────────────────

/// Commands the application sends to the service loop.
pub enum ServiceCommand {
    /// Begin connecting. Replies `false` if already underway.
    Initialize { reply: Reply<bool> },
    SendMessage {
        recipient: String,
        body: String,
        reply: Reply<MessageId>,
    },
    /// Reply arrives when the whole broadcast has settled.
    Broadcast {
        recipients: Vec<String>,
        body: String,
        reply: Reply<BroadcastTally>,
    },
    GetState {
        reply: oneshot::Sender<ConnectionState>,
    },
    GetPairing {
        reply: oneshot::Sender<Option<PairingPayload>>,
    },
    IsReady { reply: oneshot::Sender<bool> },
    GetMetrics {
        reply: oneshot::Sender<SecurityMetrics>,
    },
    GetStatus {
        reply: oneshot::Sender<ServiceStatus>,
    },
    /// Close the session locally, keep credentials.
    Disconnect { reply: Reply<()> },
    /// Revoke the session, clear credentials and counters.
    Logout { reply: Reply<()> },
    /// Stop the loop.
    Shutdown,
}

// ── Events (runtime → app) ───────────────────────────────────────────

/// Everything observers can see.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServiceEvent {
    ConnectionStateChanged {
        previous: ConnectionState,
        current: ConnectionState,
    },
    /// New pairing payload to render, or `None` once it is no longer valid.
    PairingPayload { payload: Option<PairingPayload> },
    Inbound { message: InboundMessage },
    SecurityAlert { alert: SecurityAlert },
    MessageQueued {
        id: MessageId,
        recipient: RecipientId,
    },
    MessageDelivered {
        id: MessageId,
        recipient: RecipientId,
    },
    /// Dropped after exhausting its retries.
    MessageFailed {
        id: MessageId,
        recipient: RecipientId,
        attempts: u32,
        error: String,
    },
    BroadcastFinished { job: u64, tally: BroadcastTally },
}

/// Point-in-time view of the whole service.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub connection: ConnectionState,
    pub ready: bool,
    pub queue_len: usize,
    pub processor_running: bool,
    pub active_broadcasts: usize,
    pub reconnect_attempts: u32,
    pub reconnect_scheduled: bool,
    pub dedup_entries: usize,
    pub security: SecurityMetrics,
}

// ── ServiceHandle (app-facing API) ───────────────────────────────────

/// Handle to a running outbound service.
///
/// Cheap to clone. Every call fails with [`OutboundError::Shutdown`] once
/// the loop has stopped.
#[derive(Clone)]
pub struct ServiceHandle {
    cmd_tx: mpsc::Sender<ServiceCommand>,
    events: broadcast::Sender<ServiceEvent>,
}

impl ServiceHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> ServiceCommand,
    ) -> Result<T, OutboundError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| OutboundError::Shutdown)?;
        rx.await.map_err(|_| OutboundError::Shutdown)
    }

    /// Begin connecting. `Ok(false)` if a session is already starting or open.
    pub async fn initialize(&self) -> Result<bool, OutboundError> {
        self.request(|reply| ServiceCommand::Initialize { reply })
            .await?
    }

    /// Validate, gate and enqueue one message.
    ///
    /// Returns once the message is admitted, not once it is delivered.
    pub async fn send_message(&self, recipient: &str, body: &str) -> Result<MessageId, OutboundError> {
        self.request(|reply| ServiceCommand::SendMessage {
            recipient: recipient.to_string(),
            body: body.to_string(),
            reply,
        })
        .await?
    }

    /// Send `body` to every recipient in batches and wait for the tally.
    pub async fn broadcast(
        &self,
        recipients: Vec<String>,
        body: &str,
    ) -> Result<BroadcastTally, OutboundError> {
        self.request(|reply| ServiceCommand::Broadcast {
            recipients,
            body: body.to_string(),
            reply,
        })
        .await?
    }

    pub async fn connection_state(&self) -> Result<ConnectionState, OutboundError> {
        self.request(|reply| ServiceCommand::GetState { reply }).await
    }

    /// Pairing payload awaiting approval, if any.
    pub async fn pairing_payload(&self) -> Result<Option<PairingPayload>, OutboundError> {
        self.request(|reply| ServiceCommand::GetPairing { reply })
            .await
    }

    /// Open and not blocked by the security monitor.
    pub async fn is_ready(&self) -> Result<bool, OutboundError> {
        self.request(|reply| ServiceCommand::IsReady { reply }).await
    }

    pub async fn security_metrics(&self) -> Result<SecurityMetrics, OutboundError> {
        self.request(|reply| ServiceCommand::GetMetrics { reply })
            .await
    }

    pub async fn status(&self) -> Result<ServiceStatus, OutboundError> {
        self.request(|reply| ServiceCommand::GetStatus { reply })
            .await
    }

    /// Close the session and drop pending sends. Credentials are kept.
    pub async fn disconnect(&self) -> Result<(), OutboundError> {
        self.request(|reply| ServiceCommand::Disconnect { reply })
            .await?
    }

    /// Terminal teardown: revoke the session, clear credentials, reset counters.
    pub async fn logout(&self) -> Result<(), OutboundError> {
        self.request(|reply| ServiceCommand::Logout { reply }).await?
    }

    /// New receiver for every event emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.events.subscribe()
    }

    /// Feed events to `observer` on a dedicated task until the service stops.
    pub fn observe<O: ServiceObserver>(&self, observer: O) -> JoinHandle<()> {
        tokio::spawn(observer::run(observer, self.subscribe()))
    }

    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(ServiceCommand::Shutdown).await;
    }
}

// ── OutboundService ──────────────────────────────────────────────────

/// The outbound service: spawn it and talk to it through the handle.
pub struct OutboundService;

impl OutboundService {
    /// Validate `config` and start the service loop on the current runtime.
    ///
    /// Takes ownership of the transport. Nothing connects until
    /// [`ServiceHandle::initialize`] is called.
    pub fn spawn<T, S>(
        transport: T,
        store: S,
        config: OutboundConfig,
    ) -> Result<ServiceHandle, OutboundError>
    where
        T: ChatTransport,
        S: CredentialStore,
    {
        config.validate()?;

        let (cmd_tx, cmd_rx) = mpsc::channel::<ServiceCommand>(64);
        let (events, _) = broadcast::channel::<ServiceEvent>(config.event_buffer);

        let executor =
            executor::Executor::new(transport, store, events.clone(), config.send_timeout);
        let state = state::ServiceState::new(config);
        tokio::spawn(r#loop::service_loop(state, executor, cmd_rx));

        Ok(ServiceHandle { cmd_tx, events })
    }
}

/// Current instant on the runtime clock (pausable in tests).
pub(crate) fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}
