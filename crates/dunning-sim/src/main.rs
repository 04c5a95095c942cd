mod broadcast;
mod common;
mod events;
mod output;
mod send;
mod transport;

use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use dunning_outbound::OutboundService;
use dunning_transport::{CredentialStore, FileCredentialStore, MemoryCredentialStore};

use crate::common::{elapsed_s, load_config, member, wait_drained, wait_ready, Recorder};
use crate::events::{emit, now_iso, EventStarted, EventSummary};
use crate::transport::{SimConfig, SimTransport};

#[derive(Parser)]
#[command(name = "dunning-sim", about = "Drive the outbound layer over a simulated chat transport")]
struct Cli {
    /// JSON file with `OutboundConfig` overrides.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Divide every configured duration by this factor.
    #[arg(long, default_value = "60")]
    speedup: u32,

    /// Probability that a single send fails.
    #[arg(long, default_value = "0.0")]
    fail_rate: f64,

    /// Drop the connection after every N successful sends (0 = never).
    #[arg(long, default_value = "0")]
    drop_every: u32,

    /// Probability that a member answers.
    #[arg(long, default_value = "0.1")]
    reply_rate: f64,

    /// Simulated network delay in ms.
    #[arg(long, default_value = "100")]
    link_delay: u64,

    /// Persist the session here instead of in memory.
    #[arg(long)]
    session_dir: Option<PathBuf>,

    /// Domain used for generated member addresses.
    #[arg(long, default_value = "s.example.net")]
    domain: String,

    /// Also write the JSONL transcript to a file in this directory.
    #[arg(long)]
    output_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// One reminder per member via individual sends.
    Send {
        /// Number of generated members (ignored with --to).
        #[arg(long, default_value = "8")]
        members: usize,
        /// Explicit comma-separated recipient list.
        #[arg(long, value_delimiter = ',')]
        to: Vec<String>,
        #[arg(long, default_value = "Friendly reminder: this month's fee is due.")]
        body: String,
        /// Fire without waiting out rate limits.
        #[arg(long)]
        burst: bool,
    },

    /// One batched broadcast to every member.
    Broadcast {
        #[arg(long, default_value = "7")]
        members: usize,
        #[arg(long, value_delimiter = ',')]
        to: Vec<String>,
        #[arg(long, default_value = "Friendly reminder: this month's fee is due.")]
        body: String,
    },
}

impl Command {
    fn mode(&self) -> &'static str {
        match self {
            Command::Send { .. } => "send",
            Command::Broadcast { .. } => "broadcast",
        }
    }
}

fn recipients(members: usize, to: &[String], domain: &str) -> Vec<String> {
    if to.is_empty() {
        (0..members).map(|i| member(i, domain)).collect()
    } else {
        to.to_vec()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if !(0.0..=1.0).contains(&cli.fail_rate) || !(0.0..=1.0).contains(&cli.reply_rate) {
        anyhow::bail!("--fail-rate and --reply-rate must be within 0..=1");
    }

    if let Some(dir) = &cli.output_dir {
        let path = output::transcript_path(dir, cli.command.mode())?;
        output::init_jsonl_writer(&path)?;
        eprintln!("Transcript: {}", path.display());
    }

    eprintln!("dunning-sim v{}", env!("CARGO_PKG_VERSION"));

    match cli.session_dir.clone() {
        Some(dir) => run(cli, FileCredentialStore::new(dir)).await,
        None => run(cli, MemoryCredentialStore::new()).await,
    }
}

async fn run<S: CredentialStore>(cli: Cli, store: S) -> anyhow::Result<()> {
    let start = Instant::now();
    let config = load_config(cli.config.as_deref(), cli.speedup)?;
    let ready_timeout = config.connect_timeout + config.pairing_timeout + Duration::from_secs(5);

    let transport = SimTransport::new(SimConfig {
        fail_rate: cli.fail_rate,
        link_delay: Duration::from_millis(cli.link_delay),
        drop_every: cli.drop_every,
        reply_rate: cli.reply_rate,
    });
    let handle = OutboundService::spawn(transport, store, config)?;
    let recorder = Recorder::new(start);
    let _observer = handle.observe(recorder.clone());

    let mode = cli.command.mode();
    let members = match &cli.command {
        Command::Send { members, to, .. } | Command::Broadcast { members, to, .. } => {
            recipients(*members, to, &cli.domain)
        }
    };
    emit(&EventStarted {
        event: "started",
        mode: mode.to_string(),
        recipients: members.len(),
        speedup: cli.speedup,
        fail_rate: cli.fail_rate,
        timestamp: now_iso(),
    });

    handle.initialize().await?;
    wait_ready(&handle, ready_timeout).await?;

    let work = async {
        let rejected = match cli.command {
            Command::Send { body, burst, .. } => {
                let config = send::SendConfig {
                    recipients: members,
                    body,
                    burst,
                };
                send::run(&handle, config, start).await?
            }
            Command::Broadcast { body, .. } => {
                let config = broadcast::BroadcastConfig {
                    recipients: members,
                    body,
                };
                broadcast::run(&handle, config, start).await?;
                0
            }
        };
        wait_drained(&handle).await?;
        anyhow::Ok(rejected)
    };

    let rejected = tokio::select! {
        result = work => result?,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("\nCtrl+C received, shutting down...");
            0
        }
    };

    // Let the observer catch up with the last events.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let stats = recorder.stats();
    emit(&EventSummary {
        event: "summary",
        mode: mode.to_string(),
        delivered: stats.delivered,
        failed: stats.failed,
        rejected,
        reconnections: stats.opens.saturating_sub(1),
        security: handle.security_metrics().await?,
        elapsed_s: elapsed_s(start),
    });

    handle.shutdown().await;
    Ok(())
}
