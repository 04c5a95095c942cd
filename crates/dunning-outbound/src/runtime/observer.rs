use tokio::sync::broadcast;

use crate::security::SecurityAlert;
use crate::types::{ConnectionState, InboundMessage, PairingPayload};

use super::ServiceEvent;

/// Typed callbacks over the service event stream.
///
/// Every method has a no-op default; implement only what you need.
/// Register with [`ServiceHandle::observe`](super::ServiceHandle::observe),
/// as many times as you like.
#[async_trait::async_trait]
pub trait ServiceObserver: Send + 'static {
    async fn on_connection_state(&mut self, _previous: ConnectionState, _current: ConnectionState) {}

    async fn on_pairing(&mut self, _payload: Option<&PairingPayload>) {}

    async fn on_inbound(&mut self, _message: &InboundMessage) {}

    async fn on_security_alert(&mut self, _alert: &SecurityAlert) {}

    /// Any event, after the typed callback (if any) ran.
    async fn on_event(&mut self, _event: &ServiceEvent) {}
}

pub(super) async fn run<O: ServiceObserver>(
    mut observer: O,
    mut rx: broadcast::Receiver<ServiceEvent>,
) {
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "observer lagging, events dropped");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        match &event {
            ServiceEvent::ConnectionStateChanged { previous, current } => {
                observer.on_connection_state(*previous, *current).await;
            }
            ServiceEvent::PairingPayload { payload } => {
                observer.on_pairing(payload.as_ref()).await;
            }
            ServiceEvent::Inbound { message } => observer.on_inbound(message).await,
            ServiceEvent::SecurityAlert { alert } => observer.on_security_alert(alert).await,
            _ => {}
        }
        observer.on_event(&event).await;
    }
}
