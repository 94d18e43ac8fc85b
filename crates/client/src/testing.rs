// In-memory sockets for unit tests: futures channels stand in for the wire.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::channel::mpsc as wire;
use futures::future::BoxFuture;
use futures::{FutureExt, SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::commands::CommandClient;
use crate::config::ConnectionConfig;
use crate::transport::{Connector, FrameSink, FrameStream, Transport, TransportError};

pub(crate) fn test_config() -> ConnectionConfig {
    ConnectionConfig { url: "ws://127.0.0.1:9/socket".to_string(), ..ConnectionConfig::default() }
}

/// Server side of one mock connection.
pub(crate) struct MockSocket {
    outbound: wire::UnboundedReceiver<String>,
    inbound: wire::UnboundedSender<Result<String, TransportError>>,
}

impl MockSocket {
    /// Next frame the client wrote, decoded as JSON.
    pub(crate) async fn next_frame(&mut self) -> Value {
        let text = self.outbound.next().await.expect("client should write a frame");
        serde_json::from_str(&text).expect("client frames should be JSON")
    }

    /// Next frame if one is already buffered.
    pub(crate) fn try_next_frame(&mut self) -> Option<Value> {
        let text = self.outbound.try_next().ok().flatten()?;
        Some(serde_json::from_str(&text).expect("client frames should be JSON"))
    }

    /// Fail every later client write while keeping the read half open.
    pub(crate) fn stop_accepting_writes(&mut self) {
        self.outbound.close();
    }

    pub(crate) fn push(&self, frame: Value) {
        self.push_raw(&frame.to_string());
    }

    pub(crate) fn push_raw(&self, text: &str) {
        self.inbound.unbounded_send(Ok(text.to_string())).expect("client should be reading");
    }

    pub(crate) fn push_error(&self, message: &str) {
        self.inbound
            .unbounded_send(Err(TransportError::Socket(message.to_string())))
            .expect("client should be reading");
    }

    pub(crate) fn data(&self, request_id: &str, data_type: &str, data: Value) {
        self.push(json!({ "requestId": request_id, "status": "data", "dataType": data_type, "data": data }));
    }

    pub(crate) fn done(&self, request_id: &str) {
        self.push(json!({ "requestId": request_id, "status": "done" }));
    }

    pub(crate) fn exception(&self, request_id: &str, text: &str) {
        self.push(json!({ "requestId": request_id, "status": "exception", "data": { "text": text } }));
    }

    /// Simulate the server dropping the connection.
    pub(crate) fn hang_up(self) {}
}

pub(crate) struct MockConnector {
    attempts: AtomicUsize,
    failures: AtomicUsize,
    sockets: mpsc::UnboundedSender<MockSocket>,
}

impl MockConnector {
    pub(crate) fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MockSocket>) {
        let (sockets, receiver) = mpsc::unbounded_channel();
        let connector =
            Self { attempts: AtomicUsize::new(0), failures: AtomicUsize::new(0), sockets };
        (Arc::new(connector), receiver)
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Refuse the next `count` connection attempts.
    pub(crate) fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }
}

impl Connector for MockConnector {
    fn connect(
        &self,
        _url: &str,
        _protocols: &[String],
    ) -> BoxFuture<'static, Result<(FrameSink, FrameStream), TransportError>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if refused {
            return async { Err(TransportError::Connect("connection refused".to_string())) }.boxed();
        }

        let (outbound_tx, outbound_rx) = wire::unbounded();
        let (inbound_tx, inbound_rx) = wire::unbounded();
        let _ = self.sockets.send(MockSocket { outbound: outbound_rx, inbound: inbound_tx });

        let sink: FrameSink =
            Box::pin(outbound_tx.sink_map_err(|error| TransportError::Socket(error.to_string())));
        let stream: FrameStream = Box::pin(inbound_rx);
        async move { Ok((sink, stream)) }.boxed()
    }
}

/// A command client wired to a fresh mock connection.
pub(crate) async fn connected_commands() -> (CommandClient, MockSocket) {
    let (connector, mut sockets) = MockConnector::new();
    let transport = Transport::new(test_config(), connector);
    let commands = CommandClient::new(transport, Some("token-1".to_string()));
    let socket = sockets.recv().await.expect("transport should connect");
    (commands, socket)
}

/// Answers every frame through `handler` on a background task and records
/// each frame it saw.
pub(crate) fn serve<F>(mut socket: MockSocket, mut handler: F) -> Arc<Mutex<Vec<Value>>>
where
    F: FnMut(&Value, &MockSocket) + Send + 'static,
{
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&seen);
    tokio::spawn(async move {
        while let Some(text) = socket.outbound.next().await {
            let frame: Value = serde_json::from_str(&text).expect("client frames should be JSON");
            log.lock().expect("log lock").push(frame.clone());
            handler(&frame, &socket);
        }
    });
    seen
}

/// Commands named in a recorded frame log, in order.
pub(crate) fn commands_seen(log: &Arc<Mutex<Vec<Value>>>) -> Vec<String> {
    log.lock()
        .expect("log lock")
        .iter()
        .filter_map(|frame| frame["command"].as_str().map(str::to_string))
        .collect()
}
