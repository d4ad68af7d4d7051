use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::config::IceServer;

/// Events a peer-connection implementation reports back to the registry.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// Outbound negotiation payload that must reach the remote side through
    /// the rendezvous service.
    Signal(Value),
    /// The direct transport is established.
    Connect,
    /// Negotiation or transport failure.
    Error(String),
}

/// Construction parameters for one peer connection.
#[derive(Debug, Clone)]
pub struct PeerInit {
    /// Whether this side proposes the exchange (initiator) or responds
    /// (answerer).
    pub initiator: bool,
    pub ice_servers: Vec<IceServer>,
}

/// Opaque direct-transport capability consumed by the registry. The crate
/// never looks inside negotiation payloads; it only routes them.
pub trait PeerConnection: Send + Sync {
    /// Feed an inbound signal payload into the negotiation.
    fn signal(&self, payload: Value);

    /// Tear the connection down. Must be idempotent.
    fn destroy(&self);
}

/// Factory seam so platform-specific transports can be substituted.
pub trait PeerConnectionFactory: Send + Sync {
    /// Create a connection plus the receiver its events arrive on.
    fn create(&self, init: PeerInit) -> (Arc<dyn PeerConnection>, mpsc::UnboundedReceiver<PeerEvent>);
}
