use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::api::IdentityProvider;
use crate::config::{self, IceServer, SessionConfig};
use crate::error::SignalingError;
use crate::peer::{PeerConnection, PeerConnectionFactory, PeerEvent, PeerInit};
use crate::session::{IdentitySession, InboundSignal, SessionEvent};
use crate::socket::ControlConnector;

/// Identifying facts about one tracked peer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub connection_id: String,
    pub remote_identity: String,
}

/// Per-connection overrides applied on top of the session configuration.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Replaces the session's ICE server list for this connection only.
    pub ice_servers: Option<Vec<IceServer>>,
}

/// Observable state of one tracked connection, for callers and tests.
#[derive(Debug, Clone)]
pub struct ConnectionState {
    pub connection_id: String,
    pub remote_identity: String,
    pub connected: bool,
}

/// Events the registry emits to its consumer.
#[derive(Debug)]
pub enum RegistryEvent {
    /// The session identity was confirmed by the rendezvous service.
    Open(String),
    /// A tracked peer connection reported connected.
    Connection(ConnectionInfo),
    /// A peer connection failed after it had already connected. Non-fatal.
    ConnectionError {
        connection_id: String,
        remote_identity: String,
        message: String,
    },
    PeerLeft(Option<String>),
    Error(SignalingError),
    Disconnected(Option<String>),
    Closed,
}

struct ConnectionRecord {
    remote_identity: String,
    peer: Arc<dyn PeerConnection>,
    connected: bool,
    /// Single-shot result cell for the caller's `connect` future; `take()`n
    /// on first settle so it can never resolve twice.
    pending: Option<oneshot::Sender<Result<ConnectionInfo, SignalingError>>>,
}

/// Maps locally generated connection ids to in-flight or established peer
/// connections, multiplexing their signaling over one [`IdentitySession`].
pub struct ConnectionRegistry {
    session: Arc<IdentitySession>,
    factory: Arc<dyn PeerConnectionFactory>,
    ice_servers: Vec<IceServer>,
    connections: Mutex<HashMap<String, ConnectionRecord>>,
    events: mpsc::UnboundedSender<RegistryEvent>,
    closed: AtomicBool,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl ConnectionRegistry {
    /// Registry over a session with an explicit identity.
    pub fn with_identity(
        identity: impl Into<String>,
        config: SessionConfig,
        connector: Arc<dyn ControlConnector>,
        factory: Arc<dyn PeerConnectionFactory>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<RegistryEvent>) {
        let (session, session_events) = IdentitySession::with_identity(identity, config, connector);
        Self::build(session, session_events, factory)
    }

    /// Registry over a session that acquires its identity from the provider.
    pub fn acquire(
        config: SessionConfig,
        connector: Arc<dyn ControlConnector>,
        provider: Arc<dyn IdentityProvider>,
        factory: Arc<dyn PeerConnectionFactory>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<RegistryEvent>) {
        let (session, session_events) = IdentitySession::acquire(config, connector, provider);
        Self::build(session, session_events, factory)
    }

    fn build(
        session: Arc<IdentitySession>,
        session_events: mpsc::UnboundedReceiver<SessionEvent>,
        factory: Arc<dyn PeerConnectionFactory>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<RegistryEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let ice_servers = session.config().ice_servers.clone();
        let registry = Arc::new(Self {
            session,
            factory,
            ice_servers,
            connections: Mutex::new(HashMap::new()),
            events: events_tx,
            closed: AtomicBool::new(false),
            tasks: StdMutex::new(Vec::new()),
        });
        let demux = Arc::clone(&registry);
        let handle = tokio::spawn(async move {
            demux.run(session_events).await;
        });
        registry.tasks.lock().unwrap().push(handle);
        (registry, events_rx)
    }

    pub fn session(&self) -> &Arc<IdentitySession> {
        &self.session
    }

    /// Resolves with this session's identity once the service confirms it.
    pub async fn identity(&self) -> Result<String, SignalingError> {
        self.session.identity().await
    }

    /// Initiates a peer connection to a remote identity; resolves once the
    /// peer connection reports connected, rejects if it errors first. There
    /// is no built-in deadline; callers wanting one should wrap this future.
    pub async fn connect(
        self: &Arc<Self>,
        remote_identity: &str,
    ) -> Result<ConnectionInfo, SignalingError> {
        self.connect_with(remote_identity, ConnectOptions::default())
            .await
    }

    /// [`connect`](Self::connect) with per-connection transport overrides.
    pub async fn connect_with(
        self: &Arc<Self>,
        remote_identity: &str,
        options: ConnectOptions,
    ) -> Result<ConnectionInfo, SignalingError> {
        if self.closed.load(Ordering::SeqCst) || !self.session.is_usable() {
            return Err(SignalingError::Disconnected);
        }
        let ice_servers = options
            .ice_servers
            .unwrap_or_else(|| self.ice_servers.clone());
        let (result_tx, result_rx) = oneshot::channel();
        let (peer, peer_events) = self.factory.create(PeerInit {
            initiator: true,
            ice_servers,
        });
        let connection_id = {
            let mut connections = self.connections.lock().await;
            let mut connection_id = config::random_token();
            while connections.contains_key(&connection_id) {
                connection_id = config::random_token();
            }
            connections.insert(
                connection_id.clone(),
                ConnectionRecord {
                    remote_identity: remote_identity.to_string(),
                    peer,
                    connected: false,
                    pending: Some(result_tx),
                },
            );
            connection_id
        };
        debug!(
            target: "beacon::registry",
            connection = %connection_id,
            remote = %remote_identity,
            "initiating connection"
        );
        self.spawn_peer_pump(connection_id, remote_identity.to_string(), peer_events);
        result_rx.await.map_err(|_| SignalingError::Disconnected)?
    }

    /// Snapshot of all tracked connections.
    pub async fn connections(&self) -> Vec<ConnectionState> {
        self.connections
            .lock()
            .await
            .iter()
            .map(|(id, record)| ConnectionState {
                connection_id: id.clone(),
                remote_identity: record.remote_identity.clone(),
                connected: record.connected,
            })
            .collect()
    }

    /// Destroys the session and every tracked peer connection. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(target: "beacon::registry", "closing registry");
        self.session.destroy().await;
        {
            let mut connections = self.connections.lock().await;
            for (_, mut record) in connections.drain() {
                if let Some(pending) = record.pending.take() {
                    let _ = pending.send(Err(SignalingError::Disconnected));
                }
                record.peer.destroy();
            }
        }
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        let _ = self.events.send(RegistryEvent::Closed);
    }

    async fn run(self: Arc<Self>, mut session_events: mpsc::UnboundedReceiver<SessionEvent>) {
        while let Some(event) = session_events.recv().await {
            match event {
                SessionEvent::Open(identity) => {
                    let _ = self.events.send(RegistryEvent::Open(identity));
                }
                SessionEvent::Signal(signal) => self.handle_inbound_signal(signal).await,
                SessionEvent::Leave(peer) => {
                    let _ = self.events.send(RegistryEvent::PeerLeft(peer));
                }
                SessionEvent::Error(SignalingError::PeerUnavailable(identity)) => {
                    self.expire_peer(&identity).await;
                }
                SessionEvent::Error(other) => {
                    // Unclassified session errors pass through unchanged.
                    let _ = self.events.send(RegistryEvent::Error(other));
                }
                SessionEvent::Disconnected(prior) => {
                    let _ = self.events.send(RegistryEvent::Disconnected(prior));
                }
                SessionEvent::Close => {
                    if !self.closed.load(Ordering::SeqCst) {
                        let _ = self.events.send(RegistryEvent::Closed);
                    }
                }
                SessionEvent::Unknown(frame) => {
                    trace!(
                        target: "beacon::registry",
                        kind = %frame.kind,
                        "ignoring unrecognized server frame"
                    );
                }
            }
        }
    }

    /// Routes an inbound signal to its record, creating an answerer record on
    /// first sight of a connection id. Lookup and insert happen under one
    /// lock hold so racing frames for the same new id cannot create
    /// duplicates.
    async fn handle_inbound_signal(self: &Arc<Self>, signal: InboundSignal) {
        let peer = {
            let mut connections = self.connections.lock().await;
            match connections.get(&signal.connection_id) {
                Some(record) => Arc::clone(&record.peer),
                None => {
                    let (peer, peer_events) = self.factory.create(PeerInit {
                        initiator: false,
                        ice_servers: self.ice_servers.clone(),
                    });
                    connections.insert(
                        signal.connection_id.clone(),
                        ConnectionRecord {
                            remote_identity: signal.remote_identity.clone(),
                            peer: Arc::clone(&peer),
                            connected: false,
                            pending: None,
                        },
                    );
                    debug!(
                        target: "beacon::registry",
                        connection = %signal.connection_id,
                        remote = %signal.remote_identity,
                        "accepting incoming connection"
                    );
                    self.spawn_peer_pump(
                        signal.connection_id.clone(),
                        signal.remote_identity.clone(),
                        peer_events,
                    );
                    peer
                }
            }
        };
        peer.signal(signal.signal);
    }

    fn spawn_peer_pump(
        self: &Arc<Self>,
        connection_id: String,
        remote_identity: String,
        mut peer_events: mpsc::UnboundedReceiver<PeerEvent>,
    ) {
        let registry = Arc::clone(self);
        let handle = tokio::spawn(async move {
            while let Some(event) = peer_events.recv().await {
                match event {
                    PeerEvent::Signal(payload) => {
                        if let Err(err) = registry
                            .session
                            .signal(&remote_identity, payload, &connection_id)
                            .await
                        {
                            warn!(
                                target: "beacon::registry",
                                connection = %connection_id,
                                error = %err,
                                "failed to forward outbound signal"
                            );
                        }
                    }
                    PeerEvent::Connect => registry.handle_peer_connected(&connection_id).await,
                    PeerEvent::Error(message) => {
                        if registry.handle_peer_error(&connection_id, message).await {
                            break;
                        }
                    }
                }
            }
        });
        self.tasks.lock().unwrap().push(handle);
    }

    async fn handle_peer_connected(&self, connection_id: &str) {
        let mut connections = self.connections.lock().await;
        let Some(record) = connections.get_mut(connection_id) else {
            return;
        };
        record.connected = true;
        let info = ConnectionInfo {
            connection_id: connection_id.to_string(),
            remote_identity: record.remote_identity.clone(),
        };
        debug!(
            target: "beacon::registry",
            connection = %connection_id,
            remote = %info.remote_identity,
            "peer connection established"
        );
        if let Some(pending) = record.pending.take() {
            let _ = pending.send(Ok(info.clone()));
        }
        let _ = self.events.send(RegistryEvent::Connection(info));
    }

    /// Returns true when the record was removed and the pump should stop.
    async fn handle_peer_error(&self, connection_id: &str, message: String) -> bool {
        let mut connections = self.connections.lock().await;
        let Some(record) = connections.get_mut(connection_id) else {
            return true;
        };
        if record.connected {
            // The future already settled; surface per-connection, non-fatal.
            warn!(
                target: "beacon::registry",
                connection = %connection_id,
                message = %message,
                "established peer connection failed"
            );
            let _ = self.events.send(RegistryEvent::ConnectionError {
                connection_id: connection_id.to_string(),
                remote_identity: record.remote_identity.clone(),
                message,
            });
            return false;
        }
        let Some(mut record) = connections.remove(connection_id) else {
            return true;
        };
        warn!(
            target: "beacon::registry",
            connection = %connection_id,
            message = %message,
            "peer connection failed before connecting"
        );
        if let Some(pending) = record.pending.take() {
            let _ = pending.send(Err(SignalingError::Transport(message)));
        }
        record.peer.destroy();
        true
    }

    /// EXPIRE handling: rejects and removes still-pending records targeting
    /// the expired identity; established connections are left alone.
    async fn expire_peer(&self, identity: &str) {
        let mut connections = self.connections.lock().await;
        let doomed: Vec<String> = connections
            .iter()
            .filter(|(_, record)| record.remote_identity == identity && !record.connected)
            .map(|(id, _)| id.clone())
            .collect();
        for connection_id in doomed {
            if let Some(mut record) = connections.remove(&connection_id) {
                debug!(
                    target: "beacon::registry",
                    connection = %connection_id,
                    remote = %identity,
                    "expiring pending connection"
                );
                if let Some(pending) = record.pending.take() {
                    let _ = pending.send(Err(SignalingError::PeerUnavailable(identity.to_string())));
                }
                record.peer.destroy();
            }
        }
    }
}
