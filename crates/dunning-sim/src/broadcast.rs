/// Broadcast mode: one `broadcast` call over the whole member list.
use std::time::Instant;

use dunning_outbound::{BroadcastTally, ServiceHandle};

use crate::common::elapsed_s;
use crate::events::{emit, EventBroadcastResult};

pub struct BroadcastConfig {
    pub recipients: Vec<String>,
    pub body: String,
}

pub async fn run(
    handle: &ServiceHandle,
    config: BroadcastConfig,
    start: Instant,
) -> anyhow::Result<BroadcastTally> {
    let count = config.recipients.len();
    eprintln!("Broadcasting to {count} members ...");

    let began = Instant::now();
    let tally = handle.broadcast(config.recipients, &config.body).await?;

    emit(&EventBroadcastResult {
        event: "broadcast_result",
        recipients: count,
        tally,
        elapsed_s: elapsed_s(start),
    });
    eprintln!(
        "  {}/{count} delivered, {} failed, in {:.1}s",
        tally.success_count,
        tally.failed_count,
        began.elapsed().as_secs_f64()
    );
    Ok(tally)
}
