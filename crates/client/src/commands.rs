// Remote command service: request/response correlation over the transport.
//
// Every command gets a fresh request id. Inbound envelopes are routed to the
// request's `CommandStream` until a terminal status (`done`, `exception`)
// arrives, the consumer drops the stream, or the client cancels. After that
// the id is unknown and late frames are ignored.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};

use diql_common::protocol::envelope::{
    strip_local_annotations, CancelFrame, CommandFrame, Envelope, EnvelopeStatus,
};
use futures::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace, warn};

use crate::transport::{Transport, TransportError, TransportEvent};

#[derive(Debug, Error)]
pub enum CommandError {
    /// The server answered with an `exception` envelope.
    #[error("{0}")]
    Exception(String),
    /// The request was deregistered before any answer arrived.
    #[error("request {0} ended without an answer")]
    Abandoned(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("failed to encode command data: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode answer to `{command}`: {source}")]
    Decode {
        command: String,
        #[source]
        source: serde_json::Error,
    },
}

/// One answer for an outstanding request.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandEvent {
    Data { data_type: Option<String>, data: Value },
    Done,
    Exception(String),
}

impl CommandEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Data { .. })
    }
}

/// Session-level signals raised by the command channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The server rejected the session's credential; it has been cleared.
    LoggedOut { request_id: String },
}

// ── Client ──────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct CommandClient {
    inner: Arc<CommandInner>,
}

struct CommandInner {
    transport: Transport,
    next_request_id: AtomicI64,
    pending: Mutex<HashMap<String, mpsc::UnboundedSender<CommandEvent>>>,
    credential: Mutex<Option<String>>,
    session_events: broadcast::Sender<SessionEvent>,
}

impl CommandClient {
    /// Wrap a transport and start routing its inbound frames. Must be called
    /// within a tokio runtime.
    pub fn new(transport: Transport, credential: Option<String>) -> Self {
        let events = transport.subscribe();
        let (session_events, _) = broadcast::channel(16);
        let inner = Arc::new(CommandInner {
            transport,
            next_request_id: AtomicI64::new(i64::MIN),
            pending: Mutex::new(HashMap::new()),
            credential: Mutex::new(credential),
            session_events,
        });
        tokio::spawn(route_inbound(Arc::downgrade(&inner), events));
        Self { inner }
    }

    /// Issue a command. Answers arrive on the returned stream, which ends
    /// after the terminal answer.
    pub fn execute(&self, command: &str, mut data: Value) -> Result<CommandStream, CommandError> {
        let request_id = self.inner.next_request_id.fetch_add(1, Ordering::Relaxed).to_string();
        strip_local_annotations(&mut data);

        let (sender, events) = mpsc::unbounded_channel();
        self.inner.pending().insert(request_id.clone(), sender);

        let frame = CommandFrame {
            request_id: request_id.clone(),
            command: command.to_string(),
            command_data: data,
            credential: self.credential(),
        };
        debug!(request_id = %request_id, command, "issuing command");
        if let Err(error) = self.inner.transport.send(&frame) {
            self.inner.deregister(&request_id);
            return Err(error.into());
        }

        Ok(CommandStream { request_id, events, client: Arc::downgrade(&self.inner) })
    }

    /// Issue a command and wait for its first answer: the first data payload,
    /// or `null` when the command completes without data. The request is
    /// deregistered once that answer is taken.
    pub async fn call(&self, command: &str, data: Value) -> Result<Value, CommandError> {
        let mut stream = self.execute(command, data)?;
        match stream.next().await {
            Some(CommandEvent::Data { data, .. }) => Ok(data),
            Some(CommandEvent::Done) => Ok(Value::Null),
            Some(CommandEvent::Exception(text)) => Err(CommandError::Exception(text)),
            None => Err(CommandError::Abandoned(stream.request_id().to_string())),
        }
    }

    /// Typed variant of [`CommandClient::call`].
    pub async fn call_as<P, R>(&self, command: &str, params: &P) -> Result<R, CommandError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let data = serde_json::to_value(params).map_err(CommandError::Encode)?;
        let answer = self.call(command, data).await?;
        serde_json::from_value(answer)
            .map_err(|source| CommandError::Decode { command: command.to_string(), source })
    }

    /// Tell the server to stop and forget the request locally. Does not wait
    /// for the server to confirm.
    pub fn cancel(&self, request_id: &str) {
        let was_pending = self.inner.deregister(request_id).is_some();
        debug!(request_id, was_pending, "cancelling request");
        if let Err(error) = self.inner.transport.send(&CancelFrame::new(request_id)) {
            warn!(request_id, %error, "failed to send cancel frame");
        }
    }

    pub fn credential(&self) -> Option<String> {
        self.inner.credential.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    pub fn set_credential(&self, credential: Option<String>) {
        *self.inner.credential.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = credential;
    }

    pub fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.session_events.subscribe()
    }

    /// Number of requests still waiting for a terminal answer.
    pub fn pending_count(&self) -> usize {
        self.inner.pending().len()
    }

    pub fn is_pending(&self, request_id: &str) -> bool {
        self.inner.pending().contains_key(request_id)
    }

    pub fn transport(&self) -> &Transport {
        &self.inner.transport
    }
}

impl CommandInner {
    fn pending(&self) -> MutexGuard<'_, HashMap<String, mpsc::UnboundedSender<CommandEvent>>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn deregister(&self, request_id: &str) -> Option<mpsc::UnboundedSender<CommandEvent>> {
        self.pending().remove(request_id)
    }

    fn dispatch(&self, frame: Value) {
        let envelope: Envelope = match serde_json::from_value(frame) {
            Ok(envelope) => envelope,
            Err(error) => {
                debug!(%error, "ignoring inbound frame that is not a result envelope");
                return;
            }
        };
        let request_id = envelope.request_id.clone();

        match envelope.status {
            EnvelopeStatus::Data => {
                let sender = self.pending().get(&request_id).cloned();
                let Some(sender) = sender else {
                    warn!(request_id = %request_id, "data for unknown request");
                    return;
                };
                let event = CommandEvent::Data {
                    data_type: envelope.data_type,
                    data: envelope.data.unwrap_or(Value::Null),
                };
                if sender.send(event).is_err() {
                    // Consumer is gone; nothing more will be read.
                    self.deregister(&request_id);
                }
            }
            EnvelopeStatus::Done => match self.deregister(&request_id) {
                Some(sender) => {
                    let _ = sender.send(CommandEvent::Done);
                }
                // Expected after a client-side cancel.
                None => trace!(request_id = %request_id, "done for unknown request"),
            },
            EnvelopeStatus::Exception => {
                let text = envelope.exception_text();
                match self.deregister(&request_id) {
                    Some(sender) => {
                        let _ = sender.send(CommandEvent::Exception(text));
                    }
                    None => warn!(request_id = %request_id, %text, "exception for unknown request"),
                }
            }
            EnvelopeStatus::AuthenticationException => {
                self.deregister(&request_id);
                *self.credential.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
                warn!(request_id = %request_id, "session rejected by server; logging out");
                let _ = self.session_events.send(SessionEvent::LoggedOut { request_id });
            }
        }
    }
}

async fn route_inbound(
    inner: Weak<CommandInner>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if let TransportEvent::Message(frame) = event {
            inner.dispatch(frame);
        }
    }
}

// ── Stream ──────────────────────────────────────────────────────────

/// Answers of one request. Dropping the stream deregisters the request
/// without notifying the server; use [`CommandStream::cancel`] for that.
pub struct CommandStream {
    request_id: String,
    events: mpsc::UnboundedReceiver<CommandEvent>,
    client: Weak<CommandInner>,
}

impl CommandStream {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Cancel the request on the server and locally.
    pub fn cancel(self) {
        if let Some(inner) = self.client.upgrade() {
            CommandClient { inner }.cancel(&self.request_id);
        }
    }
}

impl Stream for CommandStream {
    type Item = CommandEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}

impl Drop for CommandStream {
    fn drop(&mut self) {
        if let Some(inner) = self.client.upgrade() {
            inner.deregister(&self.request_id);
        }
    }
}
