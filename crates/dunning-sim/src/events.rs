use crate::output;
use dunning_outbound::{BroadcastTally, SecurityMetrics, ServiceEvent};
use serde::Serialize;
use std::io::Write;

/// Emit a JSONL event to stdout (flushed immediately for piped output).
/// If --output-dir was provided, also writes to the JSONL file.
pub fn emit<T: Serialize>(event: &T) {
    if let Ok(json) = serde_json::to_string(event) {
        let stdout = std::io::stdout();
        let mut lock = stdout.lock();
        let _ = writeln!(lock, "{json}");
        let _ = lock.flush();

        output::write_jsonl_line(&json);
    }
}

/// RFC 3339 timestamp for JSONL events.
pub fn now_iso() -> String {
    chrono::Local::now().to_rfc3339()
}

// ── Session events ──────────────────────────────────────────────

#[derive(Serialize)]
pub struct EventStarted {
    pub event: &'static str,
    pub mode: String,
    pub recipients: usize,
    pub speedup: u32,
    pub fail_rate: f64,
    pub timestamp: String,
}

// ── Service events ──────────────────────────────────────────────

/// A [`ServiceEvent`] stamped with the simulation clock.
#[derive(Serialize)]
pub struct EventService<'a> {
    #[serde(flatten)]
    pub inner: &'a ServiceEvent,
    pub elapsed_s: f64,
}

// ── Admission results ───────────────────────────────────────────

#[derive(Serialize)]
pub struct EventAdmission {
    pub event: &'static str,
    pub seq: u32,
    pub recipient: String,
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disposition: Option<String>,
    pub elapsed_s: f64,
}

// ── Broadcast result ────────────────────────────────────────────

#[derive(Serialize)]
pub struct EventBroadcastResult {
    pub event: &'static str,
    pub recipients: usize,
    #[serde(flatten)]
    pub tally: BroadcastTally,
    pub elapsed_s: f64,
}

// ── Summary ─────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct EventSummary {
    pub event: &'static str,
    pub mode: String,
    pub delivered: u32,
    pub failed: u32,
    pub rejected: u32,
    pub reconnections: u32,
    pub security: SecurityMetrics,
    pub elapsed_s: f64,
}
