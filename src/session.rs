use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use tokio::sync::{RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::api::IdentityProvider;
use crate::config::{self, SessionConfig};
use crate::error::SignalingError;
use crate::protocol::{self, Frame, SignalPayload, frame_type};
use crate::socket::{ControlConnector, ControlSocket, SocketEvent};

/// Inbound signal demultiplexed off the control connection.
#[derive(Debug, Clone)]
pub struct InboundSignal {
    pub remote_identity: String,
    pub connection_id: String,
    pub signal: Value,
}

/// Events the session emits for the registry (or any other consumer).
#[derive(Debug)]
pub enum SessionEvent {
    /// The rendezvous service confirmed the session identity.
    Open(String),
    Signal(InboundSignal),
    /// A remote peer closed its connection to this session. Not fatal.
    Leave(Option<String>),
    Error(SignalingError),
    /// The control channel dropped; carries the identity that was active.
    Disconnected(Option<String>),
    /// Terminal: the session was destroyed.
    Close,
    /// Frame with a type this crate does not recognize. Not fatal.
    Unknown(Frame),
}

type OpenedCell = watch::Sender<Option<Result<String, SignalingError>>>;

/// Owns the session's identity lifecycle on top of [`ControlSocket`]:
/// acquire, confirm-open, disconnect, reconnect, destroy, and the
/// encode/decode of the control-connection envelope.
pub struct IdentitySession {
    config: SessionConfig,
    socket: Arc<ControlSocket>,
    events: mpsc::UnboundedSender<SessionEvent>,
    identity: RwLock<Option<String>>,
    last_identity: RwLock<Option<String>>,
    open: AtomicBool,
    disconnected: AtomicBool,
    destroyed: AtomicBool,
    /// Single-assignment cell for the identity future; refuses re-resolution.
    opened: OpenedCell,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl IdentitySession {
    /// Construction with an explicit identity: skips identity acquisition.
    pub fn with_identity(
        identity: impl Into<String>,
        config: SessionConfig,
        connector: Arc<dyn ControlConnector>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SessionEvent>) {
        let (session, events_rx) = Self::build(config, connector);
        let identity = identity.into();
        let init = Arc::clone(&session);
        session.spawn(async move {
            init.initialize(identity).await;
        });
        (session, events_rx)
    }

    /// Construction that asks the provider for an identity first.
    pub fn acquire(
        config: SessionConfig,
        connector: Arc<dyn ControlConnector>,
        provider: Arc<dyn IdentityProvider>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SessionEvent>) {
        let (session, events_rx) = Self::build(config, connector);
        let init = Arc::clone(&session);
        session.spawn(async move {
            match provider.retrieve_identity().await {
                Ok(identity) => init.initialize(identity).await,
                Err(err) => init.abort(err).await,
            }
        });
        (session, events_rx)
    }

    fn build(
        config: SessionConfig,
        connector: Arc<dyn ControlConnector>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (socket, socket_events) = ControlSocket::new(config.clone(), connector);
        let (opened, _) = watch::channel(None);
        let session = Arc::new(Self {
            config,
            socket,
            events: events_tx,
            identity: RwLock::new(None),
            last_identity: RwLock::new(None),
            open: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            opened,
            tasks: StdMutex::new(Vec::new()),
        });
        let dispatch = Arc::clone(&session);
        session.spawn(async move {
            dispatch.run(socket_events).await;
        });
        (session, events_rx)
    }

    fn spawn(&self, fut: impl std::future::Future<Output = ()> + Send + 'static) {
        self.tasks.lock().unwrap().push(tokio::spawn(fut));
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Whether the session can still deliver outbound signals.
    pub fn is_usable(&self) -> bool {
        !self.is_disconnected() && !self.is_destroyed()
    }

    pub async fn current_identity(&self) -> Option<String> {
        self.identity.read().await.clone()
    }

    /// Resolves with this session's identity once the service confirms OPEN;
    /// rejects only if the session aborts before ever opening.
    pub async fn identity(&self) -> Result<String, SignalingError> {
        let mut rx = self.opened.subscribe();
        let resolved = rx
            .wait_for(|slot| slot.is_some())
            .await
            .map_err(|_| SignalingError::SocketClosed)?;
        match resolved.as_ref() {
            Some(result) => result.clone(),
            None => Err(SignalingError::SocketClosed),
        }
    }

    async fn initialize(self: &Arc<Self>, identity: String) {
        debug!(target: "beacon::session", identity = %identity, "starting control connection");
        *self.identity.write().await = Some(identity.clone());
        let token = config::random_token();
        if let Err(err) = self.socket.start(&identity, &token).await {
            self.abort(err).await;
        }
    }

    async fn run(self: Arc<Self>, mut socket_events: mpsc::UnboundedReceiver<SocketEvent>) {
        while let Some(event) = socket_events.recv().await {
            if self.is_destroyed() {
                break;
            }
            match event {
                SocketEvent::Message(frame) => self.handle_frame(frame).await,
                SocketEvent::Malformed(raw) => {
                    let _ = self.events.send(SessionEvent::Error(SignalingError::Malformed(raw)));
                }
                SocketEvent::Disconnected => self.handle_transport_drop().await,
            }
        }
    }

    async fn handle_frame(&self, frame: Frame) {
        match frame.kind.as_str() {
            frame_type::OPEN => self.handle_open().await,
            frame_type::ERROR => {
                self.abort(SignalingError::Server(frame.error_message())).await;
            }
            frame_type::ID_TAKEN => {
                let identity = self.identity.read().await.clone().unwrap_or_default();
                self.abort(SignalingError::UnavailableId(identity)).await;
            }
            frame_type::INVALID_KEY => {
                self.abort(SignalingError::InvalidKey(self.config.key.clone())).await;
            }
            frame_type::LEAVE => {
                let _ = self.events.send(SessionEvent::Leave(frame.src));
            }
            frame_type::EXPIRE => {
                // Scoped to the offending remote identity, never fatal here.
                let peer = frame.src.unwrap_or_default();
                let _ = self
                    .events
                    .send(SessionEvent::Error(SignalingError::PeerUnavailable(peer)));
            }
            frame_type::OFFER | frame_type::ANSWER | frame_type::CANDIDATE => {
                self.handle_signal_frame(frame);
            }
            _ => {
                trace!(target: "beacon::session", kind = %frame.kind, "unrecognized frame");
                let _ = self.events.send(SessionEvent::Unknown(frame));
            }
        }
    }

    async fn handle_open(&self) {
        let Some(identity) = self.identity.read().await.clone() else {
            warn!(target: "beacon::session", "OPEN received before an identity was assigned");
            return;
        };
        *self.last_identity.write().await = Some(identity.clone());
        self.open.store(true, Ordering::SeqCst);
        self.disconnected.store(false, Ordering::SeqCst);
        debug!(target: "beacon::session", identity = %identity, "session open");
        self.resolve_opened(Ok(identity.clone()));
        let _ = self.events.send(SessionEvent::Open(identity));
    }

    fn handle_signal_frame(&self, frame: Frame) {
        let kind = frame.kind;
        let Some(src) = frame.src else {
            warn!(target: "beacon::session", kind = %kind, "signal frame without source identity");
            return;
        };
        let Some(payload) = frame
            .payload
            .and_then(|payload| serde_json::from_value::<SignalPayload>(payload).ok())
        else {
            warn!(target: "beacon::session", kind = %kind, src = %src, "signal frame with malformed payload");
            return;
        };
        if kind == frame_type::CANDIDATE && !protocol::has_candidate(&payload.signal) {
            warn!(
                target: "beacon::session",
                connection = %payload.id,
                src = %src,
                "dropping malformed inbound candidate"
            );
            return;
        }
        let _ = self.events.send(SessionEvent::Signal(InboundSignal {
            remote_identity: src,
            connection_id: payload.id,
            signal: payload.signal,
        }));
    }

    async fn handle_transport_drop(&self) {
        if self.is_disconnected() {
            return;
        }
        if self.last_identity.read().await.is_none() {
            // Transport died before the session ever opened.
            self.abort(SignalingError::SocketClosed).await;
        } else {
            let _ = self.events.send(SessionEvent::Error(SignalingError::Network));
            self.disconnect().await;
        }
    }

    /// Emits the error, then destroys the session if it never opened, or
    /// degrades to a disconnect (existing peer connections are left alone).
    async fn abort(&self, error: SignalingError) {
        warn!(target: "beacon::session", error = %error, "aborting session");
        self.resolve_opened(Err(error.clone()));
        let _ = self.events.send(SessionEvent::Error(error));
        if self.last_identity.read().await.is_none() {
            self.destroy().await;
        } else {
            self.disconnect().await;
        }
    }

    fn resolve_opened(&self, result: Result<String, SignalingError>) {
        let mut result = Some(result);
        self.opened.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = result.take();
            true
        });
    }

    /// Delivers an outbound signal payload for a connection to a remote
    /// identity. Payloads that classify as neither offer, answer, nor a
    /// well-formed candidate are silently not sent.
    pub async fn signal(
        &self,
        remote_identity: &str,
        payload: Value,
        connection_id: &str,
    ) -> Result<(), SignalingError> {
        if !self.is_usable() {
            return Err(SignalingError::Disconnected);
        }
        let Some(kind) = protocol::classify_signal(&payload) else {
            trace!(
                target: "beacon::session",
                connection = %connection_id,
                "ignoring unclassifiable signal payload"
            );
            return Ok(());
        };
        let frame = Frame::signal(
            kind,
            remote_identity,
            SignalPayload {
                id: connection_id.to_string(),
                signal: payload,
            },
        )?;
        self.socket.send(frame).await
    }

    /// Drops the control channel but leaves peer connections alone.
    /// Idempotent.
    pub async fn disconnect(&self) {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        self.open.store(false, Ordering::SeqCst);
        self.socket.close().await;
        let prior = self.identity.write().await.take();
        if let Some(prior) = prior.clone() {
            *self.last_identity.write().await = Some(prior);
        }
        debug!(target: "beacon::session", identity = ?prior, "disconnected from server");
        let _ = self.events.send(SessionEvent::Disconnected(prior));
    }

    /// Re-establishes the control connection with the previous identity.
    pub async fn reconnect(self: &Arc<Self>) -> Result<(), SignalingError> {
        if self.is_destroyed() {
            return Err(SignalingError::CannotReconnect);
        }
        if self.is_disconnected() {
            let Some(identity) = self.last_identity.read().await.clone() else {
                return Err(SignalingError::CannotReconnect);
            };
            debug!(target: "beacon::session", identity = %identity, "reconnecting");
            self.disconnected.store(false, Ordering::SeqCst);
            self.initialize(identity).await;
            Ok(())
        } else if !self.is_open() {
            // First connection attempt still in flight; nothing to do.
            Ok(())
        } else {
            Err(SignalingError::NotDisconnected)
        }
    }

    /// Terminal teardown. No signaling is possible afterwards. Idempotent.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(target: "beacon::session", "destroying session");
        self.disconnect().await;
        self.socket.close().await;
        self.resolve_opened(Err(SignalingError::Disconnected));
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        let _ = self.events.send(SessionEvent::Close);
    }
}
