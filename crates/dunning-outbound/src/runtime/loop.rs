/// The outbound service event loop.
///
/// A single async task that owns all mutable state and multiplexes over
/// transport events, the outcome of the send in flight, application
/// commands, and the earliest armed timer.
use std::future::pending;
use std::time::Instant;

use dunning_transport::{ChatTransport, CredentialStore, TransportEvent};
use tokio::sync::mpsc;

use crate::queue::QueuedMessage;

use super::executor::{Executor, InFlight};
use super::state::{BroadcastStart, ServiceState};
use super::{now, ServiceCommand};

/// Main event loop: owns all service state.
pub(super) async fn service_loop<T, S>(
    mut state: ServiceState,
    mut exec: Executor<T, S>,
    mut cmd_rx: mpsc::Receiver<ServiceCommand>,
) where
    T: ChatTransport,
    S: CredentialStore,
{
    tracing::debug!("outbound service loop started");

    loop {
        let deadline = state.next_deadline();

        tokio::select! {
            biased;

            // ── 1. Transport session events ─────────────────
            event = next_transport_event(&mut exec.stream) => {
                let mut effects = Vec::new();
                match event {
                    Some(event) => state.handle_transport_event(event, now(), &mut effects),
                    None => {
                        tracing::debug!("transport stream ended");
                        exec.stream = None;
                        state.handle_stream_ended(now(), &mut effects);
                    }
                }
                exec.run(&mut state, effects).await;
            }

            // ── 2. Delivery outcome ─────────────────────────
            (item, result) = next_delivery(&mut exec.in_flight) => {
                let effects = state.on_send_result(item, result, now());
                exec.run(&mut state, effects).await;
            }

            // ── 3. Application commands ─────────────────────
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else {
                    tracing::debug!("all handles dropped");
                    break;
                };
                if !handle_command(cmd, &mut state, &mut exec).await {
                    break;
                }
            }

            // ── 4. Timers ───────────────────────────────────
            _ = sleep_until(deadline) => {
                let mut effects = Vec::new();
                state.on_tick(now(), &mut effects);
                exec.run(&mut state, effects).await;
            }
        }
    }

    exec.shutdown().await;
    tracing::debug!("outbound service loop stopped");
}

/// Apply one command. Returns `false` on shutdown.
///
/// Replies go out after the effects ran, so a caller that sees
/// `initialize` return can already observe the transport call.
async fn handle_command<T, S>(
    cmd: ServiceCommand,
    state: &mut ServiceState,
    exec: &mut Executor<T, S>,
) -> bool
where
    T: ChatTransport,
    S: CredentialStore,
{
    let mut effects = Vec::new();
    match cmd {
        ServiceCommand::Initialize { reply } => {
            let result = state.initialize(now(), &mut effects);
            exec.run(state, effects).await;
            let _ = reply.send(result);
        }

        ServiceCommand::SendMessage {
            recipient,
            body,
            reply,
        } => {
            let result = state.send_message(&recipient, body, now(), &mut effects);
            if let Err(e) = &result {
                tracing::debug!(%recipient, "send refused: {e}");
            }
            // Reply before delivering: admission is the contract.
            let _ = reply.send(result);
            exec.run(state, effects).await;
        }

        ServiceCommand::Broadcast {
            recipients,
            body,
            reply,
        } => match state.broadcast(recipients, body, now(), &mut effects) {
            Ok(BroadcastStart::Empty) => {
                let _ = reply.send(Ok(Default::default()));
            }
            Ok(BroadcastStart::Started(job)) => {
                exec.await_broadcast(job, reply);
                exec.run(state, effects).await;
            }
            Err(e) => {
                exec.run(state, effects).await;
                let _ = reply.send(Err(e));
            }
        },

        ServiceCommand::GetState { reply } => {
            let _ = reply.send(state.connection_state());
        }

        ServiceCommand::GetPairing { reply } => {
            let _ = reply.send(state.pairing());
        }

        ServiceCommand::IsReady { reply } => {
            let _ = reply.send(state.is_ready(now()));
        }

        ServiceCommand::GetMetrics { reply } => {
            let _ = reply.send(state.metrics(now()));
        }

        ServiceCommand::GetStatus { reply } => {
            let _ = reply.send(state.status(now()));
        }

        ServiceCommand::Disconnect { reply } => {
            state.disconnect(now(), &mut effects);
            exec.run(state, effects).await;
            let _ = reply.send(Ok(()));
        }

        ServiceCommand::Logout { reply } => {
            state.logout(now(), &mut effects);
            exec.run(state, effects).await;
            let _ = reply.send(Ok(()));
        }

        ServiceCommand::Shutdown => return false,
    }
    true
}

async fn next_transport_event(
    stream: &mut Option<mpsc::Receiver<TransportEvent>>,
) -> Option<TransportEvent> {
    match stream {
        Some(rx) => rx.recv().await,
        None => pending().await,
    }
}

/// Wait for the send task to finish and take its item back.
async fn next_delivery(in_flight: &mut Option<InFlight>) -> (QueuedMessage, Result<(), String>) {
    let Some(running) = in_flight.as_mut() else {
        return pending().await;
    };
    let result = match (&mut running.task).await {
        Ok(result) => result,
        Err(e) => Err(format!("send task failed: {e}")),
    };
    match in_flight.take() {
        Some(done) => (done.item, result),
        None => pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => pending().await,
    }
}
