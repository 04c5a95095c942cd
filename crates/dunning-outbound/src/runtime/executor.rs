//! Effect executor: the only place that touches I/O.
//!
//! Takes the effects produced by `ServiceState` and performs them:
//! - Connect / Disconnect / Logout / Heartbeat -> transport
//! - Deliver / CancelDelivery -> send task, result back through the loop
//! - SaveCredentials / ClearCredentials -> credential store
//! - Emit -> observer channel
//! - FinishBroadcast -> pending broadcast reply
//!
//! Transport outcomes are fed straight back into the state, and whatever
//! that produces joins the same work list.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use dunning_transport::{ChatTransport, CredentialStore, TransportEvent};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::queue::QueuedMessage;
use crate::types::{BroadcastTally, ConnectionState};

use super::effect::RuntimeEffect;
use super::state::ServiceState;
use super::{now, Reply, ServiceEvent};

/// A send running on its own task so the loop keeps serving commands.
pub(super) struct InFlight {
    pub item: QueuedMessage,
    pub task: JoinHandle<Result<(), String>>,
}

pub(super) struct Executor<T, S> {
    /// Shared with the send task; everything else locks it inline.
    transport: Arc<Mutex<T>>,
    store: S,
    events: broadcast::Sender<ServiceEvent>,
    send_timeout: Duration,
    /// Event stream of the live transport session, if any.
    pub(super) stream: Option<mpsc::Receiver<TransportEvent>>,
    pub(super) in_flight: Option<InFlight>,
    broadcast_replies: HashMap<u64, Reply<BroadcastTally>>,
}

impl<T: ChatTransport, S: CredentialStore> Executor<T, S> {
    pub fn new(
        transport: T,
        store: S,
        events: broadcast::Sender<ServiceEvent>,
        send_timeout: Duration,
    ) -> Self {
        Self {
            transport: Arc::new(Mutex::new(transport)),
            store,
            events,
            send_timeout,
            stream: None,
            in_flight: None,
            broadcast_replies: HashMap::new(),
        }
    }

    /// Park the reply for broadcast `job` until its `FinishBroadcast` runs.
    pub fn await_broadcast(&mut self, job: u64, reply: Reply<BroadcastTally>) {
        self.broadcast_replies.insert(job, reply);
    }

    /// Execute `effects` and every follow-up they produce.
    pub async fn run(&mut self, state: &mut ServiceState, effects: Vec<RuntimeEffect>) {
        let mut work: VecDeque<RuntimeEffect> = effects.into();
        while let Some(effect) = work.pop_front() {
            let follow_up = self.execute(state, effect).await;
            work.extend(follow_up);
        }
    }

    async fn execute(&mut self, state: &mut ServiceState, effect: RuntimeEffect) -> Vec<RuntimeEffect> {
        match effect {
            RuntimeEffect::Connect => {
                let credentials = match self.store.load().await {
                    Ok(c) => c,
                    Err(e) => {
                        tracing::warn!("credential load failed, pairing from scratch: {e}");
                        None
                    }
                };
                let connected = self.transport.lock().await.connect(credentials).await;
                match connected {
                    Ok(rx) => {
                        self.stream = Some(rx);
                        Vec::new()
                    }
                    Err(e) => {
                        tracing::warn!("connect failed: {e}");
                        self.stream = None;
                        state.on_connect_failed(now())
                    }
                }
            }

            RuntimeEffect::Disconnect => {
                let follow_up = self.cancel_delivery(state).await;
                self.stream = None;
                if let Err(e) = self.transport.lock().await.disconnect().await {
                    tracing::debug!("transport disconnect: {e}");
                }
                follow_up
            }

            RuntimeEffect::Logout => {
                let follow_up = self.cancel_delivery(state).await;
                self.stream = None;
                if let Err(e) = self.transport.lock().await.logout().await {
                    tracing::warn!("transport logout failed: {e}");
                }
                follow_up
            }

            RuntimeEffect::Deliver(item) => {
                // An earlier effect in this batch may have closed the link.
                if state.connection_state() != ConnectionState::Open {
                    return state.on_delivery_cancelled(item);
                }
                let transport = Arc::clone(&self.transport);
                let limit = self.send_timeout;
                let (to, body) = (item.recipient.clone(), item.body.clone());
                let task = tokio::spawn(async move {
                    let mut transport = transport.lock_owned().await;
                    match tokio::time::timeout(limit, transport.send(&to, &body)).await {
                        Ok(result) => result.map_err(|e| e.to_string()),
                        Err(_) => Err(format!("send timed out after {limit:?}")),
                    }
                });
                self.in_flight = Some(InFlight { item, task });
                Vec::new()
            }

            RuntimeEffect::CancelDelivery => self.cancel_delivery(state).await,

            RuntimeEffect::Heartbeat(cause) => {
                if self.in_flight.is_some() {
                    // The pending send holds the link; its outcome says enough.
                    tracing::debug!(?cause, "heartbeat skipped, send in flight");
                    return Vec::new();
                }
                let ok = match self.transport.lock().await.heartbeat().await {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::warn!(?cause, "heartbeat failed: {e}");
                        false
                    }
                };
                state.on_heartbeat_result(cause, ok, now())
            }

            RuntimeEffect::SaveCredentials(credentials) => {
                if let Err(e) = self.store.save(&credentials).await {
                    tracing::error!("credential save failed: {e}");
                }
                Vec::new()
            }

            RuntimeEffect::ClearCredentials => {
                if let Err(e) = self.store.clear().await {
                    tracing::error!("credential clear failed: {e}");
                }
                Vec::new()
            }

            RuntimeEffect::Emit(event) => {
                // No subscribers is fine.
                let _ = self.events.send(event);
                Vec::new()
            }

            RuntimeEffect::FinishBroadcast { job, tally } => {
                if let Some(reply) = self.broadcast_replies.remove(&job) {
                    let _ = reply.send(Ok(tally));
                }
                Vec::new()
            }
        }
    }

    /// Stop the send in flight, if any, and hand its item back.
    ///
    /// A send that already finished is reported as such rather than
    /// requeued, so nothing goes out twice.
    async fn cancel_delivery(&mut self, state: &mut ServiceState) -> Vec<RuntimeEffect> {
        let Some(InFlight { item, task }) = self.in_flight.take() else {
            return Vec::new();
        };
        task.abort();
        match task.await {
            Ok(result) => state.on_send_result(item, result, now()),
            Err(_) => {
                tracing::debug!(id = %item.id, "delivery cancelled");
                state.on_delivery_cancelled(item)
            }
        }
    }

    /// Close the transport on the way out. Pending broadcast callers see `Shutdown`.
    pub async fn shutdown(&mut self) {
        self.broadcast_replies.clear();
        if let Some(in_flight) = self.in_flight.take() {
            in_flight.task.abort();
        }
        if self.stream.take().is_some() {
            if let Err(e) = self.transport.lock().await.disconnect().await {
                tracing::debug!("transport disconnect on shutdown: {e}");
            }
        }
    }
}
