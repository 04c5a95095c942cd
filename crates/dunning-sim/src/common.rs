use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Context;
use dunning_outbound::{
    ConnectionState, OutboundConfig, OutboundError, ServiceEvent, ServiceHandle, ServiceObserver,
};

use crate::events::{emit, EventService};

/// Load the service config, then compress its clock by `speedup`.
///
/// Missing file means defaults; missing fields in the file too.
pub fn load_config(path: Option<&Path>, speedup: u32) -> anyhow::Result<OutboundConfig> {
    let config = match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            serde_json::from_str::<OutboundConfig>(&raw)
                .with_context(|| format!("parsing config {}", path.display()))?
        }
        None => OutboundConfig::default(),
    };
    let config = config.scaled(speedup);
    config.validate()?;
    Ok(config)
}

/// Synthetic member address number `i`.
pub fn member(i: usize, domain: &str) -> String {
    format!("62812{:07}@{domain}", 1_000_000 + i)
}

/// Elapsed seconds since `start`.
pub fn elapsed_s(start: Instant) -> f64 {
    start.elapsed().as_secs_f64()
}

// ── Event recorder ──────────────────────────────────────────────

/// Counters collected from the service event stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct RunStats {
    pub delivered: u32,
    pub failed: u32,
    pub opens: u32,
}

/// Observer that echoes every service event as JSONL and keeps counts.
#[derive(Clone)]
pub struct Recorder {
    start: Instant,
    stats: Arc<Mutex<RunStats>>,
}

impl Recorder {
    pub fn new(start: Instant) -> Self {
        Self {
            start,
            stats: Arc::default(),
        }
    }

    pub fn stats(&self) -> RunStats {
        self.stats.lock().map(|s| *s).unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl ServiceObserver for Recorder {
    async fn on_event(&mut self, event: &ServiceEvent) {
        if let Ok(mut stats) = self.stats.lock() {
            match event {
                ServiceEvent::MessageDelivered { .. } => stats.delivered += 1,
                ServiceEvent::MessageFailed { .. } => stats.failed += 1,
                ServiceEvent::ConnectionStateChanged {
                    current: ConnectionState::Open,
                    ..
                } => stats.opens += 1,
                _ => {}
            }
        }
        emit(&EventService {
            inner: event,
            elapsed_s: elapsed_s(self.start),
        });
    }
}

// ── Service helpers ─────────────────────────────────────────────

/// Poll until the service can send, or fail after `timeout`.
pub async fn wait_ready(handle: &ServiceHandle, timeout: Duration) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if handle.is_ready().await? {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            let state = handle.connection_state().await?;
            anyhow::bail!("service not ready after {timeout:?} (state: {state})");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Poll until nothing is queued and no broadcast is running.
pub async fn wait_drained(handle: &ServiceHandle) -> Result<(), OutboundError> {
    loop {
        let status = handle.status().await?;
        if status.queue_len == 0 && status.active_broadcasts == 0 {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn members_are_valid_recipients() {
        for i in [0, 1, 42, 9_999] {
            let id: dunning_outbound::RecipientId = member(i, "s.example.net").parse().unwrap();
            assert!(id.local_part().starts_with("62812"));
        }
        assert_ne!(member(1, "s.example.net"), member(2, "s.example.net"));
    }

    #[test]
    fn config_file_is_scaled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"max_per_minute": 2, "min_interval": 10000}"#).unwrap();

        let config = load_config(Some(&path), 10).unwrap();
        assert_eq!(config.max_per_minute, 2);
        assert_eq!(config.min_interval, Duration::from_secs(1));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"broadcast_batch_size": 0}"#).unwrap();
        assert!(load_config(Some(&path), 1).is_err());
    }
}
