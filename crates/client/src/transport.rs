// Reconnecting transport: one persistent socket per session.
//
// The socket itself is recreated on every reconnect; the `Transport` value,
// its subscribers, and its outbound queue survive across reconnects.
//
// Lifecycle:
//   closed → connecting → open → closed   (socket ends)
//   closed → (poll every interval) → connecting   (only after an unexpected close)
//
// Frames sent while not open are queued (when enabled) and flushed in FIFO
// order the moment the next socket opens, before `Open` is announced.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use futures::future::{self, BoxFuture};
use futures::{FutureExt, Sink, SinkExt, Stream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};

use crate::config::ConnectionConfig;

// ── Socket abstraction ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("failed to connect: {0}")]
    Connect(String),
    #[error("socket error: {0}")]
    Socket(String),
    #[error("not connected and outbound queueing is disabled")]
    NotConnected,
    #[error("failed to encode frame: {0}")]
    Encode(String),
}

/// Outbound half of an open socket.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;
/// Inbound half of an open socket. Ends when the socket closes.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;

/// Opens sockets for the transport. Abstracted for testability.
pub trait Connector: Send + Sync + 'static {
    fn connect(
        &self,
        url: &str,
        protocols: &[String],
    ) -> BoxFuture<'static, Result<(FrameSink, FrameStream), TransportError>>;
}

/// Production connector backed by tokio-tungstenite.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketConnector;

impl Connector for WebSocketConnector {
    fn connect(
        &self,
        url: &str,
        protocols: &[String],
    ) -> BoxFuture<'static, Result<(FrameSink, FrameStream), TransportError>> {
        let url = url.to_string();
        let protocols = protocols.join(", ");

        async move {
            let mut request = url
                .as_str()
                .into_client_request()
                .map_err(|error| TransportError::Connect(error.to_string()))?;
            if !protocols.is_empty() {
                let header = HeaderValue::from_str(&protocols)
                    .map_err(|error| TransportError::Connect(error.to_string()))?;
                request.headers_mut().insert("Sec-WebSocket-Protocol", header);
            }

            let (socket, _) = tokio_tungstenite::connect_async(request)
                .await
                .map_err(|error| TransportError::Connect(error.to_string()))?;
            let (write, read) = socket.split();

            let sink = write
                .with(|text: String| future::ok::<_, WsError>(Message::Text(text.into())))
                .sink_map_err(|error| TransportError::Socket(error.to_string()));

            // A read error leaves the socket unusable; end the stream after reporting it.
            let stream = read
                .filter_map(|message| {
                    future::ready(match message {
                        Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
                        Ok(Message::Binary(bytes)) => {
                            Some(Ok(String::from_utf8_lossy(&bytes).into_owned()))
                        }
                        Ok(_) => None,
                        Err(error) => Some(Err(TransportError::Socket(error.to_string()))),
                    })
                })
                .scan(false, |failed, item| {
                    if *failed {
                        return future::ready(None);
                    }
                    *failed = item.is_err();
                    future::ready(Some(item))
                });

            Ok((Box::pin(sink) as FrameSink, Box::pin(stream) as FrameStream))
        }
        .boxed()
    }
}

// ── Events ──────────────────────────────────────────────────────────

/// Events observed by transport subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Open,
    /// An inbound frame: parsed JSON, or the raw text if it is not JSON.
    Message(Value),
    /// A socket error. Does not by itself close the transport.
    Error(String),
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Open,
}

// ── Transport ───────────────────────────────────────────────────────

/// Handle to the session's socket. Cloning shares the same connection.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<TransportInner>,
}

struct TransportInner {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    state: Mutex<TransportState>,
}

struct TransportState {
    connection: ConnectionState,
    /// Bumped for every socket attempt; tasks of older attempts go inert.
    generation: u64,
    writer: Option<mpsc::UnboundedSender<String>>,
    queue: VecDeque<String>,
    /// Set by `close()` so the close is not treated as a connection loss.
    closing: bool,
    socket_task: Option<JoinHandle<()>>,
    reconnect_task: Option<JoinHandle<()>>,
    subscribers: Vec<mpsc::UnboundedSender<TransportEvent>>,
}

impl TransportState {
    fn emit(&mut self, event: TransportEvent) {
        self.subscribers.retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }
}

impl Transport {
    /// Create the transport. Unless `config.lazy` is set, the socket starts
    /// connecting immediately; must be called within a tokio runtime.
    pub fn new(config: ConnectionConfig, connector: Arc<dyn Connector>) -> Self {
        let lazy = config.lazy;
        let transport = Self {
            inner: Arc::new(TransportInner {
                config,
                connector,
                state: Mutex::new(TransportState {
                    connection: ConnectionState::Closed,
                    generation: 0,
                    writer: None,
                    queue: VecDeque::new(),
                    closing: false,
                    socket_task: None,
                    reconnect_task: None,
                    subscribers: Vec::new(),
                }),
            }),
        };
        if !lazy {
            transport.open();
        }
        transport
    }

    /// Start connecting. A no-op while already open or connecting.
    pub fn open(&self) {
        let mut state = self.inner.lock();
        if state.connection != ConnectionState::Closed {
            return;
        }
        state.closing = false;
        self.inner.start_connecting(&mut state);
    }

    /// Close intentionally: no reconnect follows and any pending reconnect
    /// poll is cancelled. Queued frames are kept for a later `open()`.
    pub fn close(&self) {
        let mut state = self.inner.lock();
        state.closing = true;
        state.generation += 1;
        if let Some(task) = state.reconnect_task.take() {
            task.abort();
        }
        if let Some(task) = state.socket_task.take() {
            task.abort();
        }
        // Dropping the writer lets the write task close the socket gracefully.
        state.writer = None;
        if state.connection != ConnectionState::Closed {
            state.connection = ConnectionState::Closed;
            state.emit(TransportEvent::Close);
        }
        info!(url = %self.inner.config.url, "transport closed");
    }

    /// Serialize and send a frame, or queue it while disconnected.
    pub fn send<T: Serialize>(&self, frame: &T) -> Result<(), TransportError> {
        let text =
            serde_json::to_string(frame).map_err(|error| TransportError::Encode(error.to_string()))?;

        let mut state = self.inner.lock();
        let text = match (&state.connection, &state.writer) {
            (ConnectionState::Open, Some(writer)) => match writer.send(text) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(text)) => text,
            },
            _ => text,
        };

        if !self.inner.config.enqueue {
            warn!("dropping outbound frame: transport is not open");
            return Err(TransportError::NotConnected);
        }
        state.queue.push_back(text);
        debug!(queued = state.queue.len(), "queued outbound frame until reconnect");
        Ok(())
    }

    /// Subscribe to transport events. Every subscriber sees every event.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportEvent> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.inner.lock().subscribers.push(sender);
        receiver
    }

    pub fn ready(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().connection
    }

    /// Number of frames waiting for the next open socket.
    pub fn queued(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }
}

impl TransportInner {
    fn lock(&self) -> MutexGuard<'_, TransportState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn start_connecting(self: &Arc<Self>, state: &mut TransportState) {
        state.connection = ConnectionState::Connecting;
        state.generation += 1;
        let generation = state.generation;
        let connect = self.connector.connect(&self.config.url, &self.config.protocols);
        state.socket_task = Some(tokio::spawn(run_socket(Arc::downgrade(self), generation, connect)));
        debug!(url = %self.config.url, generation, "connecting");
    }

    /// Deliver an event if `generation` is still the live socket.
    fn emit_current(&self, generation: u64, event: TransportEvent) -> bool {
        let mut state = self.lock();
        if state.generation != generation {
            return false;
        }
        state.emit(event);
        true
    }

    fn socket_closed(self: &Arc<Self>, generation: u64) {
        let mut state = self.lock();
        if state.generation != generation || state.connection == ConnectionState::Closed {
            return;
        }
        self.connection_lost(&mut state);
    }

    /// The write half of the live socket failed on `frame`. The frame and
    /// everything still waiting behind it go back to the queue.
    fn write_failed(
        self: &Arc<Self>,
        generation: u64,
        frame: String,
        mut outbound: mpsc::UnboundedReceiver<String>,
    ) {
        let mut state = self.lock();
        if state.generation != generation || state.connection != ConnectionState::Open {
            return;
        }
        state.writer = None;
        let mut unsent = vec![frame];
        while let Ok(frame) = outbound.try_recv() {
            unsent.push(frame);
        }
        if self.config.enqueue {
            for frame in unsent.into_iter().rev() {
                state.queue.push_front(frame);
            }
        } else {
            warn!(dropped = unsent.len(), "dropping frames that could not be written");
        }
        self.connection_lost(&mut state);
    }

    fn connection_lost(self: &Arc<Self>, state: &mut TransportState) {
        state.connection = ConnectionState::Closed;
        state.writer = None;
        if let Some(task) = state.socket_task.take() {
            task.abort();
        }
        state.emit(TransportEvent::Close);

        if !state.closing && self.config.reconnect {
            warn!(url = %self.config.url, "connection lost; polling to reconnect");
            self.schedule_reconnect(state);
        }
    }

    fn schedule_reconnect(self: &Arc<Self>, state: &mut TransportState) {
        if state.reconnect_task.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let interval = self.config.reconnect_interval();
        let weak = Arc::downgrade(self);

        state.reconnect_task = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let mut state = inner.lock();
                if state.closing {
                    return;
                }
                match state.connection {
                    ConnectionState::Closed => {
                        info!(url = %inner.config.url, "reconnecting");
                        inner.start_connecting(&mut state);
                    }
                    ConnectionState::Connecting => {}
                    ConnectionState::Open => return,
                }
            }
        }));
    }
}

async fn run_socket(
    inner: Weak<TransportInner>,
    generation: u64,
    connect: BoxFuture<'static, Result<(FrameSink, FrameStream), TransportError>>,
) {
    let connected = connect.await;
    let Some(transport) = inner.upgrade() else {
        return;
    };

    let (sink, mut stream) = match connected {
        Ok(socket) => socket,
        Err(error) => {
            warn!(%error, "socket failed to open");
            transport.emit_current(generation, TransportEvent::Error(error.to_string()));
            transport.socket_closed(generation);
            return;
        }
    };

    let (writer, outbound) = mpsc::unbounded_channel();
    {
        let mut state = transport.lock();
        if state.generation != generation {
            return;
        }
        let flushed = state.queue.len();
        for frame in state.queue.drain(..) {
            let _ = writer.send(frame);
        }
        state.writer = Some(writer);
        state.connection = ConnectionState::Open;
        state.emit(TransportEvent::Open);
        info!(url = %transport.config.url, flushed, "socket open");
    }
    tokio::spawn(write_frames(inner.clone(), generation, sink, outbound));
    drop(transport);

    while let Some(item) = stream.next().await {
        let Some(transport) = inner.upgrade() else {
            return;
        };
        let event = match item {
            Ok(text) => TransportEvent::Message(parse_frame(&text)),
            Err(error) => {
                warn!(%error, "socket error");
                TransportEvent::Error(error.to_string())
            }
        };
        if !transport.emit_current(generation, event) {
            return;
        }
    }

    if let Some(transport) = inner.upgrade() {
        transport.socket_closed(generation);
    }
}

async fn write_frames(
    inner: Weak<TransportInner>,
    generation: u64,
    mut sink: FrameSink,
    mut outbound: mpsc::UnboundedReceiver<String>,
) {
    while let Some(frame) = outbound.recv().await {
        if let Err(error) = sink.send(frame.clone()).await {
            warn!(%error, "failed to write frame");
            if let Some(transport) = inner.upgrade() {
                transport.write_failed(generation, frame, outbound);
            }
            return;
        }
    }
    let _ = sink.close().await;
}

/// Inbound frames are JSON; anything else (keepalives from intermediaries)
/// is passed through as a raw string.
fn parse_frame(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| {
        debug!(len = text.len(), "delivering non-JSON frame as raw text");
        Value::String(text.to_owned())
    })
}
