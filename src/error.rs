use thiserror::Error;

/// Discriminant callers branch on when a session or connection fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ServerError,
    UnavailableId,
    InvalidKey,
    SocketError,
    SocketClosed,
    Network,
    Disconnected,
    PeerUnavailable,
    MalformedMessage,
    Transport,
    CannotReconnect,
    NotDisconnected,
}

/// Session- and connection-scoped failures surfaced by the signaling engine.
///
/// Variants are cloneable so one failure can both reject a pending future and
/// be re-emitted on an event stream.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SignalingError {
    #[error("server error: {0}")]
    Server(String),
    #[error("ID \"{0}\" is taken")]
    UnavailableId(String),
    #[error("API key \"{0}\" is invalid")]
    InvalidKey(String),
    #[error("socket error: {0}")]
    Socket(String),
    #[error("underlying socket is already closed")]
    SocketClosed,
    #[error("lost connection to server")]
    Network,
    #[error("cannot connect to a new peer after disconnecting from the server")]
    Disconnected,
    #[error("could not connect to peer {0}")]
    PeerUnavailable(String),
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("peer transport failure: {0}")]
    Transport(String),
    #[error("cannot reconnect: the session has already been destroyed")]
    CannotReconnect,
    #[error("cannot reconnect: the session is not disconnected from the server")]
    NotDisconnected,
}

impl SignalingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Server(_) => ErrorKind::ServerError,
            Self::UnavailableId(_) => ErrorKind::UnavailableId,
            Self::InvalidKey(_) => ErrorKind::InvalidKey,
            Self::Socket(_) => ErrorKind::SocketError,
            Self::SocketClosed => ErrorKind::SocketClosed,
            Self::Network => ErrorKind::Network,
            Self::Disconnected => ErrorKind::Disconnected,
            Self::PeerUnavailable(_) => ErrorKind::PeerUnavailable,
            Self::Malformed(_) => ErrorKind::MalformedMessage,
            Self::Transport(_) => ErrorKind::Transport,
            Self::CannotReconnect => ErrorKind::CannotReconnect,
            Self::NotDisconnected => ErrorKind::NotDisconnected,
        }
    }

    /// The remote identity an error is scoped to, for kinds that carry one.
    pub fn peer_identity(&self) -> Option<&str> {
        match self {
            Self::PeerUnavailable(identity) => Some(identity),
            _ => None,
        }
    }
}
