pub mod api;
pub mod config;
pub mod error;
pub mod mock;
pub mod peer;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod socket;

pub use api::{HttpIdentityProvider, IdentityProvider};
pub use config::{IceServer, SessionConfig, SessionConfigBuilder};
pub use error::{ErrorKind, SignalingError};
pub use peer::{PeerConnection, PeerConnectionFactory, PeerEvent, PeerInit};
pub use registry::{ConnectOptions, ConnectionInfo, ConnectionRegistry, RegistryEvent};
pub use session::{IdentitySession, InboundSignal, SessionEvent};
pub use socket::{ControlConnector, WsConnector};

#[cfg(test)]
mod tests;
