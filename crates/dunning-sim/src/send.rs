/// Send mode: one reminder per member through `send_message`.
///
/// Polite by default: a `RetryLater` refusal is waited out and retried.
/// With `burst` every refusal is taken as final, which is the quickest
/// way to watch the security monitor trip.
use std::time::Instant;

use dunning_outbound::{Disposition, OutboundError, ServiceHandle};

use crate::common::elapsed_s;
use crate::events::{emit, EventAdmission};

pub struct SendConfig {
    pub recipients: Vec<String>,
    pub body: String,
    pub burst: bool,
}

/// Returns how many requests were refused for good.
pub async fn run(handle: &ServiceHandle, config: SendConfig, start: Instant) -> anyhow::Result<u32> {
    let mut rejected = 0u32;

    for (seq, recipient) in config.recipients.iter().enumerate() {
        let seq = seq as u32 + 1;
        let body = format!("{} (ref #{seq})", config.body);

        loop {
            match handle.send_message(recipient, &body).await {
                Ok(id) => {
                    emit(&admission(seq, recipient, Ok(id.to_string()), start));
                    break;
                }
                Err(OutboundError::Shutdown) => return Err(OutboundError::Shutdown.into()),
                Err(e) => {
                    emit(&admission(seq, recipient, Err(&e), start));
                    if config.burst || e.disposition() != Disposition::RetryLater {
                        rejected += 1;
                        break;
                    }
                    let wait = match &e {
                        OutboundError::RateLimited { retry_after, .. } => *retry_after,
                        _ => handle
                            .security_metrics()
                            .await?
                            .suspicious_remaining
                            .unwrap_or_default(),
                    };
                    eprintln!("  #{seq} {recipient}: {e}, waiting {:.1}s", wait.as_secs_f64());
                    tokio::time::sleep(wait.max(std::time::Duration::from_millis(10))).await;
                }
            }
        }
    }

    Ok(rejected)
}

fn admission(
    seq: u32,
    recipient: &str,
    result: Result<String, &OutboundError>,
    start: Instant,
) -> EventAdmission {
    let (accepted, id, error, disposition) = match result {
        Ok(id) => (true, Some(id), None, None),
        Err(e) => (
            false,
            None,
            Some(e.to_string()),
            Some(format!("{:?}", e.disposition())),
        ),
    };
    EventAdmission {
        event: "admission",
        seq,
        recipient: recipient.to_string(),
        accepted,
        id,
        error,
        disposition,
        elapsed_s: elapsed_s(start),
    }
}
