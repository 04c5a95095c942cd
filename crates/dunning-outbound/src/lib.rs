//! Outbound messaging layer for the dunning bot.
//!
//! Sits between the application ("remind member X") and a chat transport
//! and makes sure every send respects the rate ceilings, is not a
//! duplicate, survives transient disconnects, and stops cold when the
//! traffic pattern starts to look abusive.
//!
//! Gates: [`SecurityMonitor`], [`DedupStore`], [`RateLimiter`].
//! Delivery: [`DeliveryQueue`] drained by a single processor.
//! Lifecycle: [`ConnectionManager`] with backoff, pairing expiry and keep-alive.
//! Entry point: [`OutboundService::spawn`] returns a [`ServiceHandle`].

pub mod backoff;
pub mod broadcast;
pub mod config;
pub mod connection;
pub mod dedup;
pub mod error;
pub mod limiter;
pub mod queue;
pub mod runtime;
pub mod security;
pub mod timer;
pub mod types;

pub use backoff::{backoff_delay, ReconnectState};
pub use broadcast::BroadcastJob;
pub use config::OutboundConfig;
pub use connection::{ConnectionAction, ConnectionManager, HeartbeatCause};
pub use dedup::{dedup_key, DedupKey, DedupStore};
pub use error::{Disposition, OutboundError};
pub use limiter::{RateLimitReason, RateLimited, RateLimiter};
pub use queue::{DeliveryQueue, Origin, Processor, QueuedMessage, RetryDecision};
pub use runtime::{
    OutboundService, ServiceCommand, ServiceEvent, ServiceHandle, ServiceObserver, ServiceStatus,
};
pub use security::{SecurityAlert, SecurityMetrics, SecurityMonitor};
pub use types::{
    now_ms, BroadcastTally, ConnectionState, InboundMessage, MessageId, PairingPayload,
    RecipientId,
};
