use dunning_transport::Credentials;

use crate::connection::HeartbeatCause;
use crate::queue::QueuedMessage;
use crate::types::BroadcastTally;

use super::ServiceEvent;

/// Intent produced by the pure logic in `ServiceState`.
///
/// State handlers return `Vec<RuntimeEffect>`; the executor performs them
/// against the transport, the credential store and the event channel.
#[derive(Debug)]
pub enum RuntimeEffect {
    /// Load stored credentials and open a transport session.
    Connect,
    Disconnect,
    Logout,
    /// Hand one queued message to the transport.
    Deliver(QueuedMessage),
    /// Call off the delivery in flight; its item comes back to the state.
    CancelDelivery,
    Heartbeat(HeartbeatCause),
    SaveCredentials(Credentials),
    ClearCredentials,
    /// Publish to observers.
    Emit(ServiceEvent),
    /// Resolve the caller waiting on broadcast `job`.
    FinishBroadcast { job: u64, tally: BroadcastTally },
}
