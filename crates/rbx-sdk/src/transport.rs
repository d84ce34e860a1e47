//! Transport boundary.
//!
//! The SDK only needs a duplex, reconnecting socket that can emit an event
//! and wait for its acknowledgement, fire an event without one, and publish
//! its lifecycle and incoming messages. Everything else about the socket is
//! the integrator's concern.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

/// Lifecycle changes and messages published by a transport.
#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    Connected,
    /// The connection was (re)authenticated.
    Authenticated,
    Disconnected,
    Message { event: String, payload: Value },
}

/// Transport error type.
#[derive(Error, Clone, Debug, PartialEq)]
pub enum TransportError {
    #[error("Not connected")]
    NotConnected,
    /// The remote side acknowledged with an error.
    #[error("Rejected: {0}")]
    Rejected(Value),
    #[error("Acknowledgement timed out")]
    AckTimeout,
    #[error("Transport failed: {0}")]
    Failed(String),
}

/// Abstract duplex transport.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn is_connected(&self) -> bool;

    /// Try to establish the connection.
    ///
    /// Success is also announced through [`TransportEvent::Connected`].
    async fn connect(&self) -> Result<(), TransportError>;

    /// Emit an event and wait for its acknowledgement.
    async fn emit(&self, event: &str, payload: Value) -> Result<Value, TransportError>;

    /// Emit an event without waiting for an acknowledgement.
    async fn send(&self, event: &str, payload: Value) -> Result<(), TransportError>;

    /// Subscribe to lifecycle events and incoming messages.
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
}

type Responder = dyn Fn(&str, &Value) -> Result<Value, TransportError> + Send + Sync;

/// A request observed by a [`MemoryTransport`].
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedRequest {
    pub event: String,
    pub payload: Value,
    /// True for `emit`, false for `send`.
    pub acknowledged: bool,
}

/// In-memory transport for testing and simulation.
///
/// Acknowledgements come from a responder closure standing in for the
/// server; lifecycle changes and server messages are injected by hand.
pub struct MemoryTransport {
    connected: RwLock<bool>,
    auto_connect: RwLock<bool>,
    response_delay: RwLock<Option<Duration>>,
    responder: RwLock<Option<Arc<Responder>>>,
    requests: RwLock<Vec<RecordedRequest>>,
    events: broadcast::Sender<TransportEvent>,
}

impl MemoryTransport {
    /// Create a disconnected transport that connects on the first attempt.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            connected: RwLock::new(false),
            auto_connect: RwLock::new(true),
            response_delay: RwLock::new(None),
            responder: RwLock::new(None),
            requests: RwLock::new(Vec::new()),
            events,
        }
    }

    /// Create a transport that is already connected.
    pub fn connected() -> Self {
        let transport = Self::new();
        *transport.connected.write() = true;
        transport
    }

    /// Install the closure answering `emit` calls.
    pub fn set_responder<F>(&self, responder: F)
    where
        F: Fn(&str, &Value) -> Result<Value, TransportError> + Send + Sync + 'static,
    {
        *self.responder.write() = Some(Arc::new(responder));
    }

    /// Builder form of [`set_responder`](Self::set_responder).
    pub fn with_responder<F>(self, responder: F) -> Self
    where
        F: Fn(&str, &Value) -> Result<Value, TransportError> + Send + Sync + 'static,
    {
        self.set_responder(responder);
        self
    }

    /// Whether `connect` succeeds on its own or waits for [`go_online`](Self::go_online).
    pub fn set_auto_connect(&self, enabled: bool) {
        *self.auto_connect.write() = enabled;
    }

    /// Delay every acknowledgement.
    pub fn set_response_delay(&self, delay: Option<Duration>) {
        *self.response_delay.write() = delay;
    }

    pub fn go_online(&self) {
        *self.connected.write() = true;
        let _ = self.events.send(TransportEvent::Connected);
    }

    pub fn go_offline(&self) {
        *self.connected.write() = false;
        let _ = self.events.send(TransportEvent::Disconnected);
    }

    pub fn authenticate(&self) {
        let _ = self.events.send(TransportEvent::Authenticated);
    }

    /// Deliver a message as if the server sent it.
    pub fn deliver(&self, event: impl Into<String>, payload: Value) {
        let _ = self.events.send(TransportEvent::Message {
            event: event.into(),
            payload,
        });
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.read().clone()
    }

    /// Payloads of every request sent to `event`.
    pub fn requests_to(&self, event: &str) -> Vec<Value> {
        self.requests
            .read()
            .iter()
            .filter(|r| r.event == event)
            .map(|r| r.payload.clone())
            .collect()
    }

    pub fn clear_requests(&self) {
        self.requests.write().clear();
    }

    fn record(&self, event: &str, payload: &Value, acknowledged: bool) {
        self.requests.write().push(RecordedRequest {
            event: event.to_owned(),
            payload: payload.clone(),
            acknowledged,
        });
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn is_connected(&self) -> bool {
        *self.connected.read()
    }

    async fn connect(&self) -> Result<(), TransportError> {
        if self.is_connected() {
            return Ok(());
        }
        if *self.auto_connect.read() {
            self.go_online();
            Ok(())
        } else {
            Err(TransportError::Failed("server unreachable".into()))
        }
    }

    async fn emit(&self, event: &str, payload: Value) -> Result<Value, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.record(event, &payload, true);

        let delay = *self.response_delay.read();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let responder = self.responder.read().clone();
        match responder {
            Some(responder) => responder(event, &payload),
            None => Err(TransportError::AckTimeout),
        }
    }

    async fn send(&self, event: &str, payload: Value) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.record(event, &payload, false);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}
