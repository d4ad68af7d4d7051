//! In-memory doubles for the control transport and the peer-connection
//! factory, used by the test suite and available to embedders that need to
//! substitute platform networking primitives.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use url::Url;

use crate::error::SignalingError;
use crate::peer::{PeerConnection, PeerConnectionFactory, PeerEvent, PeerInit};
use crate::protocol::{Frame, SignalPayload, frame_type};
use crate::socket::{ControlConnector, ControlSink, ControlSource};

/// Server side of one accepted mock control connection.
pub struct MockRemote {
    /// URL the client connected with.
    pub url: Url,
    /// Text frames the client sent.
    pub incoming: mpsc::UnboundedReceiver<String>,
    /// Handle for pushing frames (or transport errors) at the client. Drop it
    /// to close the transport.
    pub outgoing: mpsc::UnboundedSender<Result<String, SignalingError>>,
}

impl MockRemote {
    pub fn send_frame(&self, frame: &Frame) {
        let text = serde_json::to_string(frame).expect("serialize mock frame");
        let _ = self.outgoing.send(Ok(text));
    }

    pub fn send_raw(&self, text: &str) {
        let _ = self.outgoing.send(Ok(text.to_string()));
    }

    /// Next frame the client sent, decoded.
    pub async fn recv_frame(&mut self) -> Option<Frame> {
        let text = self.incoming.recv().await?;
        serde_json::from_str(&text).ok()
    }
}

/// Control connector backed by in-process channels; every accepted
/// connection is handed to the test as a [`MockRemote`].
pub struct MockConnector {
    remotes: mpsc::UnboundedSender<MockRemote>,
    refuse: AtomicBool,
}

impl MockConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MockRemote>) {
        let (remotes_tx, remotes_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                remotes: remotes_tx,
                refuse: AtomicBool::new(false),
            }),
            remotes_rx,
        )
    }

    /// Makes subsequent connection attempts fail.
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }
}

#[async_trait]
impl ControlConnector for MockConnector {
    async fn connect(
        &self,
        url: &Url,
    ) -> Result<(Box<dyn ControlSink>, Box<dyn ControlSource>), SignalingError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(SignalingError::Socket("connection refused".to_string()));
        }
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let remote = MockRemote {
            url: url.clone(),
            incoming: in_rx,
            outgoing: out_tx,
        };
        self.remotes
            .send(remote)
            .map_err(|_| SignalingError::Socket("mock server is gone".to_string()))?;
        Ok((Box::new(MockSink(in_tx)), Box::new(MockSource(out_rx))))
    }
}

struct MockSink(mpsc::UnboundedSender<String>);

#[async_trait]
impl ControlSink for MockSink {
    async fn send(&mut self, text: String) -> Result<(), SignalingError> {
        self.0
            .send(text)
            .map_err(|_| SignalingError::Socket("mock remote closed".to_string()))
    }

    async fn close(&mut self) {}
}

struct MockSource(mpsc::UnboundedReceiver<Result<String, SignalingError>>);

#[async_trait]
impl ControlSource for MockSource {
    async fn next(&mut self) -> Option<Result<String, SignalingError>> {
        self.0.recv().await
    }
}

/// Peer connection that records inbound signals and lets the test drive
/// events.
pub struct MockPeerConnection {
    inbound: mpsc::UnboundedSender<Value>,
    destroyed: AtomicBool,
}

impl MockPeerConnection {
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

impl PeerConnection for MockPeerConnection {
    fn signal(&self, payload: Value) {
        let _ = self.inbound.send(payload);
    }

    fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }
}

/// Test-side handle to one created mock peer connection.
pub struct MockPeerHandle {
    pub initiator: bool,
    pub ice_servers: Vec<crate::config::IceServer>,
    /// Drives [`PeerEvent`]s into the registry.
    pub events: mpsc::UnboundedSender<PeerEvent>,
    /// Signals the registry fed into this peer.
    pub received: mpsc::UnboundedReceiver<Value>,
    pub peer: Arc<MockPeerConnection>,
}

/// Factory handing every created peer to the test as a [`MockPeerHandle`].
pub struct MockPeerFactory {
    handles: mpsc::UnboundedSender<MockPeerHandle>,
}

impl MockPeerFactory {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MockPeerHandle>) {
        let (handles_tx, handles_rx) = mpsc::unbounded_channel();
        (Arc::new(Self { handles: handles_tx }), handles_rx)
    }
}

impl PeerConnectionFactory for MockPeerFactory {
    fn create(
        &self,
        init: PeerInit,
    ) -> (Arc<dyn PeerConnection>, mpsc::UnboundedReceiver<PeerEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let peer = Arc::new(MockPeerConnection {
            inbound: in_tx,
            destroyed: AtomicBool::new(false),
        });
        let _ = self.handles.send(MockPeerHandle {
            initiator: init.initiator,
            ice_servers: init.ice_servers,
            events: events_tx,
            received: in_rx,
            peer: Arc::clone(&peer),
        });
        (peer, events_rx)
    }
}

/// Server-side frame constructors for tests.
pub fn open_frame() -> Frame {
    Frame {
        kind: frame_type::OPEN.to_string(),
        payload: None,
        src: None,
        dst: None,
    }
}

pub fn error_frame(msg: &str) -> Frame {
    Frame {
        kind: frame_type::ERROR.to_string(),
        payload: Some(json!({ "msg": msg })),
        src: None,
        dst: None,
    }
}

pub fn simple_frame(kind: &str) -> Frame {
    Frame {
        kind: kind.to_string(),
        payload: None,
        src: None,
        dst: None,
    }
}

pub fn peer_frame(kind: &str, src: &str) -> Frame {
    Frame {
        kind: kind.to_string(),
        payload: None,
        src: Some(src.to_string()),
        dst: None,
    }
}

pub fn signal_frame(kind: &str, src: &str, connection_id: &str, signal: Value) -> Frame {
    let payload = SignalPayload {
        id: connection_id.to_string(),
        signal,
    };
    Frame {
        kind: kind.to_string(),
        payload: Some(serde_json::to_value(payload).expect("serialize mock payload")),
        src: Some(src.to_string()),
        dst: None,
    }
}
