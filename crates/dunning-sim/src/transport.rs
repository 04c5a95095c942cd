/// Simulated chat transport.
///
/// Plays the provider side of a session: a fresh connect without
/// credentials shows a pairing payload, "scans" it after `link_delay`,
/// hands out credentials and asks for a restart, exactly like a real
/// first login. Resumed sessions open after `link_delay`. Sends fail at
/// random with probability `fail_rate`, and every `drop_every`
/// successful sends the connection is dropped.
use std::time::Duration;

use anyhow::anyhow;
use dunning_outbound::now_ms;
use dunning_transport::{
    ChatTransport, Credentials, DisconnectReason, InboundMessage, PairingPayload, RecipientId,
    TransportError, TransportEvent,
};
use rand::Rng;
use tokio::sync::mpsc;

pub struct SimConfig {
    pub fail_rate: f64,
    pub link_delay: Duration,
    /// Drop the connection after this many successful sends (0 = never).
    pub drop_every: u32,
    /// Probability that a recipient answers a reminder.
    pub reply_rate: f64,
}

pub struct SimTransport {
    config: SimConfig,
    event_tx: Option<mpsc::Sender<TransportEvent>>,
    delivered: u32,
}

impl SimTransport {
    pub fn new(config: SimConfig) -> Self {
        Self {
            config,
            event_tx: None,
            delivered: 0,
        }
    }

    fn live(&self) -> Result<&mpsc::Sender<TransportEvent>, TransportError> {
        self.event_tx.as_ref().ok_or(TransportError::NotConnected)
    }
}

#[async_trait::async_trait]
impl ChatTransport for SimTransport {
    async fn connect(
        &mut self,
        credentials: Option<Credentials>,
    ) -> Result<mpsc::Receiver<TransportEvent>, TransportError> {
        let (tx, rx) = mpsc::channel(64);
        let delay = self.config.link_delay;
        let events = tx.clone();

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match credentials {
                Some(_) => {
                    let _ = events.send(TransportEvent::Opened).await;
                }
                None => {
                    let payload = format!("2@{:016x}", rand::rng().random::<u64>());
                    tracing::info!("sim: pairing payload issued");
                    let _ = events
                        .send(TransportEvent::Pairing(PairingPayload(payload)))
                        .await;
                    tokio::time::sleep(delay).await;
                    let blob: Vec<u8> = (0..32).map(|_| rand::rng().random()).collect();
                    let _ = events
                        .send(TransportEvent::CredentialsUpdated(Credentials::new(blob)))
                        .await;
                    let _ = events
                        .send(TransportEvent::Closed(DisconnectReason::RestartRequired))
                        .await;
                }
            }
        });

        self.event_tx = Some(tx);
        self.delivered = 0;
        Ok(rx)
    }

    async fn send(&mut self, to: &RecipientId, body: &str) -> Result<(), TransportError> {
        let tx = self.live()?.clone();

        let refused = rand::rng().random_bool(self.config.fail_rate.clamp(0.0, 1.0));
        if refused {
            return Err(TransportError::Send {
                recipient: to.clone(),
                source: anyhow!("sim: delivery refused"),
            });
        }
        tracing::debug!(%to, len = body.len(), "sim: delivered");

        let answers = rand::rng().random_bool(self.config.reply_rate.clamp(0.0, 1.0));
        if answers {
            let reply = TransportEvent::Inbound(InboundMessage {
                from: to.clone(),
                body: "ok, paying today".into(),
                timestamp: now_ms(),
            });
            let delay = self.config.link_delay;
            let events = tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = events.send(reply).await;
            });
        }

        self.delivered += 1;
        if self.config.drop_every > 0 && self.delivered % self.config.drop_every == 0 {
            tracing::info!(delivered = self.delivered, "sim: dropping connection");
            let _ = tx
                .send(TransportEvent::Closed(DisconnectReason::ConnectionLost))
                .await;
        }
        Ok(())
    }

    async fn heartbeat(&mut self) -> Result<(), TransportError> {
        self.live().map(|_| ())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.event_tx = None;
        Ok(())
    }

    async fn logout(&mut self) -> Result<(), TransportError> {
        self.event_tx = None;
        Ok(())
    }
}
