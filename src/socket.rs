use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, trace, warn};
use url::Url;

use crate::config::SessionConfig;
use crate::error::SignalingError;
use crate::protocol::Frame;

/// Events the socket reports to the session.
#[derive(Debug)]
pub enum SocketEvent {
    Message(Frame),
    /// Inbound data that failed to decode. The connection stays up.
    Malformed(String),
    /// The transport dropped. Emitted exactly once per close.
    Disconnected,
}

/// Write half of a control transport.
#[async_trait]
pub trait ControlSink: Send {
    async fn send(&mut self, text: String) -> Result<(), SignalingError>;
    async fn close(&mut self);
}

/// Read half of a control transport. `None` means the transport closed.
#[async_trait]
pub trait ControlSource: Send {
    async fn next(&mut self) -> Option<Result<String, SignalingError>>;
}

/// Pluggable connector so tests and embedders can swap the network layer.
#[async_trait]
pub trait ControlConnector: Send + Sync {
    async fn connect(
        &self,
        url: &Url,
    ) -> Result<(Box<dyn ControlSink>, Box<dyn ControlSource>), SignalingError>;
}

/// Default connector over tokio-tungstenite.
#[derive(Debug, Default)]
pub struct WsConnector;

#[async_trait]
impl ControlConnector for WsConnector {
    async fn connect(
        &self,
        url: &Url,
    ) -> Result<(Box<dyn ControlSink>, Box<dyn ControlSource>), SignalingError> {
        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| SignalingError::Socket(format!("websocket connect failed: {err}")))?;
        debug!(target: "beacon::socket", url = %url, "control websocket connected");
        let (sink, source) = stream.split();
        Ok((Box::new(WsSink(sink)), Box::new(WsSource(source))))
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct WsSink(futures_util::stream::SplitSink<WsStream, Message>);

#[async_trait]
impl ControlSink for WsSink {
    async fn send(&mut self, text: String) -> Result<(), SignalingError> {
        self.0
            .send(Message::Text(text))
            .await
            .map_err(|err| SignalingError::Socket(format!("websocket write failed: {err}")))
    }

    async fn close(&mut self) {
        let _ = self.0.close().await;
    }
}

struct WsSource(futures_util::stream::SplitStream<WsStream>);

#[async_trait]
impl ControlSource for WsSource {
    async fn next(&mut self) -> Option<Result<String, SignalingError>> {
        while let Some(message) = self.0.next().await {
            match message {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Binary(data)) => match String::from_utf8(data) {
                    Ok(text) => return Some(Ok(text)),
                    Err(_) => {
                        return Some(Err(SignalingError::Malformed(
                            "non-utf8 binary frame".to_string(),
                        )));
                    }
                },
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(err) => return Some(Err(SignalingError::Socket(err.to_string()))),
            }
        }
        None
    }
}

/// Owns the one control connection to the rendezvous service.
///
/// Messages sent before an identity is assigned are queued and flushed in
/// FIFO order when the transport opens. Once an identity exists, sends while
/// the transport is down are dropped; delivery guarantees live with callers.
pub struct ControlSocket {
    config: SessionConfig,
    connector: Arc<dyn ControlConnector>,
    events: mpsc::UnboundedSender<SocketEvent>,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    identity: Option<String>,
    queue: Vec<Frame>,
    writer: Option<mpsc::UnboundedSender<String>>,
    connecting: bool,
    tasks: Vec<JoinHandle<()>>,
}

impl ControlSocket {
    pub fn new(
        config: SessionConfig,
        connector: Arc<dyn ControlConnector>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SocketEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let socket = Arc::new(Self {
            config,
            connector,
            events: events_tx,
            inner: Mutex::new(Inner::default()),
        });
        (socket, events_rx)
    }

    /// Opens the control connection for an identity. No-op while a connection
    /// is up or being established; callable again after a close to reconnect.
    pub async fn start(self: &Arc<Self>, identity: &str, token: &str) -> Result<(), SignalingError> {
        {
            let mut inner = self.inner.lock().await;
            if inner.writer.is_some() || inner.connecting {
                return Ok(());
            }
            inner.connecting = true;
            inner.identity = Some(identity.to_string());
        }

        let url = match self.config.control_url(identity, token) {
            Ok(url) => url,
            Err(err) => {
                self.inner.lock().await.connecting = false;
                return Err(err);
            }
        };
        let (sink, source) = match self.connector.connect(&url).await {
            Ok(pair) => pair,
            Err(err) => {
                self.inner.lock().await.connecting = false;
                return Err(err);
            }
        };

        let (out_tx, out_rx) = mpsc::unbounded_channel::<String>();
        let writer_task = tokio::spawn(write_loop(sink, out_rx));

        let socket = Arc::clone(self);
        let events = self.events.clone();
        let reader_task = tokio::spawn(async move {
            let mut source = source;
            while let Some(item) = source.next().await {
                match item {
                    Ok(text) => match serde_json::from_str::<Frame>(&text) {
                        Ok(frame) => {
                            let _ = events.send(SocketEvent::Message(frame));
                        }
                        Err(err) => {
                            warn!(
                                target: "beacon::socket",
                                error = %err,
                                "dropping malformed inbound frame"
                            );
                            let _ = events.send(SocketEvent::Malformed(text));
                        }
                    },
                    Err(SignalingError::Malformed(detail)) => {
                        warn!(
                            target: "beacon::socket",
                            detail = %detail,
                            "dropping undecodable inbound data"
                        );
                        let _ = events.send(SocketEvent::Malformed(detail));
                    }
                    Err(err) => {
                        warn!(target: "beacon::socket", error = %err, "control transport error");
                        break;
                    }
                }
            }
            socket.handle_transport_closed().await;
        });

        let heartbeat_tx = out_tx.clone();
        let ping_interval = self.config.ping_interval;
        let heartbeat_task = tokio::spawn(async move {
            let frame = match serde_json::to_string(&Frame::heartbeat()) {
                Ok(frame) => frame,
                Err(_) => return,
            };
            let mut ticker = interval(ping_interval);
            // interval yields immediately; the first heartbeat waits one period
            ticker.tick().await;
            loop {
                ticker.tick().await;
                trace!(target: "beacon::socket", "sending heartbeat");
                if heartbeat_tx.send(frame.clone()).is_err() {
                    break;
                }
            }
        });

        let mut inner = self.inner.lock().await;
        inner.connecting = false;
        inner.writer = Some(out_tx.clone());
        inner.tasks.push(writer_task);
        inner.tasks.push(reader_task);
        inner.tasks.push(heartbeat_task);
        for frame in inner.queue.drain(..).collect::<Vec<_>>() {
            match serde_json::to_string(&frame) {
                Ok(text) => {
                    let _ = out_tx.send(text);
                }
                Err(err) => {
                    warn!(target: "beacon::socket", error = %err, "dropping unserializable queued frame");
                }
            }
        }
        Ok(())
    }

    /// Sends a frame, queueing it if no identity has been assigned yet.
    pub async fn send(&self, frame: Frame) -> Result<(), SignalingError> {
        if frame.kind.is_empty() {
            return Err(SignalingError::Malformed("message has no type".to_string()));
        }
        let mut inner = self.inner.lock().await;
        if inner.identity.is_none() {
            inner.queue.push(frame);
            return Ok(());
        }
        let Some(writer) = inner.writer.as_ref() else {
            trace!(
                target: "beacon::socket",
                kind = %frame.kind,
                "transport not open, dropping outbound frame"
            );
            return Ok(());
        };
        let text = serde_json::to_string(&frame)
            .map_err(|err| SignalingError::Malformed(err.to_string()))?;
        writer
            .send(text)
            .map_err(|_| SignalingError::Socket("control writer is gone".to_string()))
    }

    /// Tears down timers and transport bindings without emitting further
    /// events. Idempotent.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        inner.writer = None;
        inner.connecting = false;
        for task in inner.tasks.drain(..) {
            task.abort();
        }
    }

    async fn handle_transport_closed(&self) {
        let mut inner = self.inner.lock().await;
        // A second close callback while already disconnected is a no-op.
        if inner.writer.is_none() {
            return;
        }
        inner.writer = None;
        for task in inner.tasks.drain(..) {
            task.abort();
        }
        debug!(target: "beacon::socket", "control transport dropped");
        let _ = self.events.send(SocketEvent::Disconnected);
    }
}

async fn write_loop(mut sink: Box<dyn ControlSink>, mut out_rx: mpsc::UnboundedReceiver<String>) {
    while let Some(text) = out_rx.recv().await {
        if let Err(err) = sink.send(text).await {
            warn!(target: "beacon::socket", error = %err, "control transport write failed");
            break;
        }
    }
    sink.close().await;
}
