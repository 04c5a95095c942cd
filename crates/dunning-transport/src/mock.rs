//! In-memory transport for tests.
//!
//! Records every call, lets the test push [`TransportEvent`]s into the
//! live connection stream, and injects send/heartbeat/connect failures.
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::{ChatTransport, Credentials, RecipientId, TransportError, TransportEvent};

/// A send the mock accepted.
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub to: RecipientId,
    pub body: String,
    pub at: Instant,
}

#[derive(Default)]
struct MockState {
    sent: Vec<SentMessage>,
    send_attempts: u32,
    fail_next_sends: u32,
    fail_all_sends: bool,
    fail_next_connects: u32,
    heartbeat_fails: bool,
    heartbeats: u32,
    connects: Vec<Option<Credentials>>,
    disconnects: u32,
    logouts: u32,
    event_tx: Option<mpsc::Sender<TransportEvent>>,
}

/// Fake transport that records calls for verification.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Successful sends, in order.
    pub fn sent(&self) -> Vec<SentMessage> {
        self.lock().sent.clone()
    }

    /// All calls to `send`, successful or not.
    pub fn send_attempts(&self) -> u32 {
        self.lock().send_attempts
    }

    /// Fail the next `n` sends, then succeed again.
    pub fn fail_next_sends(&self, n: u32) {
        self.lock().fail_next_sends = n;
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.lock().fail_all_sends = fail;
    }

    /// Fail the next `n` connect calls.
    pub fn fail_next_connects(&self, n: u32) {
        self.lock().fail_next_connects = n;
    }

    pub fn set_heartbeat_fails(&self, fail: bool) {
        self.lock().heartbeat_fails = fail;
    }

    pub fn heartbeats(&self) -> u32 {
        self.lock().heartbeats
    }

    /// Credentials passed to each `connect` call.
    pub fn connects(&self) -> Vec<Option<Credentials>> {
        self.lock().connects.clone()
    }

    pub fn disconnects(&self) -> u32 {
        self.lock().disconnects
    }

    pub fn logouts(&self) -> u32 {
        self.lock().logouts
    }

    /// Whether a connection stream is currently live.
    pub fn is_connected(&self) -> bool {
        self.lock().event_tx.is_some()
    }

    /// Push an event into the current connection stream.
    ///
    /// Returns `false` when no connection is live.
    pub async fn emit(&self, event: TransportEvent) -> bool {
        let tx = self.lock().event_tx.clone();
        match tx {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }
}

#[async_trait::async_trait]
impl ChatTransport for MockTransport {
    async fn connect(
        &mut self,
        credentials: Option<Credentials>,
    ) -> Result<mpsc::Receiver<TransportEvent>, TransportError> {
        let mut state = self.lock();
        state.connects.push(credentials);
        if state.fail_next_connects > 0 {
            state.fail_next_connects -= 1;
            return Err(TransportError::Connect(anyhow::anyhow!("mock: connect refused")));
        }
        let (tx, rx) = mpsc::channel(64);
        state.event_tx = Some(tx);
        Ok(rx)
    }

    async fn send(&mut self, to: &RecipientId, body: &str) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.send_attempts += 1;
        if state.event_tx.is_none() {
            return Err(TransportError::NotConnected);
        }
        if state.fail_all_sends || state.fail_next_sends > 0 {
            state.fail_next_sends = state.fail_next_sends.saturating_sub(1);
            return Err(TransportError::Send {
                recipient: to.clone(),
                source: anyhow::anyhow!("mock: send failed"),
            });
        }
        state.sent.push(SentMessage {
            to: to.clone(),
            body: body.to_string(),
            at: Instant::now(),
        });
        Ok(())
    }

    async fn heartbeat(&mut self) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.heartbeats += 1;
        if state.heartbeat_fails {
            return Err(TransportError::Heartbeat(anyhow::anyhow!("mock: heartbeat failed")));
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.disconnects += 1;
        state.event_tx = None;
        Ok(())
    }

    async fn logout(&mut self) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.logouts += 1;
        state.event_tx = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_sends_and_failures() {
        let mut mock = MockTransport::new();
        let spy = mock.clone();
        let _rx = mock.connect(None).await.unwrap();
        let to: RecipientId = "628123@s.example.net".parse().unwrap();

        spy.fail_next_sends(1);
        assert!(mock.send(&to, "hello").await.is_err());
        assert!(mock.send(&to, "hello").await.is_ok());

        assert_eq!(spy.send_attempts(), 2);
        assert_eq!(spy.sent().len(), 1);
        assert_eq!(spy.sent()[0].body, "hello");
    }

    #[tokio::test]
    async fn emit_reaches_connection_stream() {
        let mut mock = MockTransport::new();
        let spy = mock.clone();
        assert!(!spy.emit(TransportEvent::Opened).await);

        let mut rx = mock.connect(None).await.unwrap();
        assert!(spy.emit(TransportEvent::Opened).await);
        assert!(matches!(rx.recv().await, Some(TransportEvent::Opened)));

        mock.disconnect().await.unwrap();
        assert!(rx.recv().await.is_none());
    }
}
