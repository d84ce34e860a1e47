//! Waiting for a connection and for acknowledgements.

use crate::error::{ClientError, Result, TimeoutKind};
use crate::transport::{Transport, TransportEvent};
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, oneshot};
use tracing::debug;

/// Caller-held trigger that rejects a pending connection wait.
///
/// Aborting only abandons the wait; the connect attempt already handed to
/// the transport keeps running.
#[derive(Clone, Default)]
pub struct AbortTrigger {
    pending: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl AbortTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the pending wait.
    ///
    /// Returns true if a wait was pending and is now rejected.
    pub fn abort(&self) -> bool {
        match self.pending.lock().take() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    /// Check if a wait is currently armed on this trigger.
    pub fn is_pending(&self) -> bool {
        self.pending.lock().as_ref().is_some_and(|tx| !tx.is_closed())
    }

    fn arm(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        *self.pending.lock() = Some(tx);
        rx
    }
}

impl fmt::Debug for AbortTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortTrigger")
            .field("pending", &self.is_pending())
            .finish()
    }
}

/// What to do when an action needs a connection the transport lacks.
#[derive(Clone, Debug, Default)]
pub enum ConnectTimeout {
    /// Use the client-wide default.
    #[default]
    Default,
    /// Fail immediately with [`ClientError::ConnectionRequired`].
    Fail,
    /// Wait without limit.
    Wait,
    /// Wait at most the given time.
    After(Duration),
    /// Wait until connected or until the trigger fires.
    Abort(AbortTrigger),
}

impl ConnectTimeout {
    /// Replace [`ConnectTimeout::Default`] by `default`.
    pub fn resolve(self, default: &ConnectTimeout) -> ConnectTimeout {
        match self {
            ConnectTimeout::Default => default.clone(),
            other => other,
        }
    }
}

/// Make sure the transport is connected, connecting it if the policy allows.
pub async fn ensure_connected<T: Transport>(transport: &Arc<T>, policy: ConnectTimeout) -> Result<()> {
    if transport.is_connected() {
        return Ok(());
    }
    if matches!(policy, ConnectTimeout::Fail) {
        return Err(ClientError::ConnectionRequired);
    }

    // Subscribe before connecting so the Connected event cannot be missed.
    let mut events = transport.subscribe();
    let connector = Arc::clone(transport);
    tokio::spawn(async move {
        if let Err(err) = connector.connect().await {
            debug!(%err, "connect attempt failed");
        }
    });

    let connected = wait_for_connected(transport.as_ref(), &mut events);
    match policy {
        ConnectTimeout::After(limit) => tokio::time::timeout(limit, connected)
            .await
            .map_err(|_| ClientError::Timeout(TimeoutKind::Connect))?,
        ConnectTimeout::Abort(trigger) => {
            let abort = trigger.arm();
            tokio::select! {
                result = connected => result,
                Ok(()) = abort => Err(ClientError::Aborted),
            }
        }
        ConnectTimeout::Default | ConnectTimeout::Wait | ConnectTimeout::Fail => connected.await,
    }
}

async fn wait_for_connected<T: Transport>(
    transport: &T,
    events: &mut broadcast::Receiver<TransportEvent>,
) -> Result<()> {
    loop {
        if transport.is_connected() {
            return Ok(());
        }
        match events.recv().await {
            Ok(TransportEvent::Connected) => return Ok(()),
            Ok(_) | Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => {
                return Err(ClientError::Transport("transport event stream closed".into()))
            }
        }
    }
}

/// Emit a request and wait for its acknowledgement.
pub async fn request<T: Transport>(
    transport: &T,
    event: &str,
    payload: Value,
    response_timeout: Duration,
) -> Result<Value> {
    match tokio::time::timeout(response_timeout, transport.emit(event, payload)).await {
        Ok(result) => result.map_err(ClientError::from),
        Err(_) => Err(ClientError::Timeout(TimeoutKind::Response)),
    }
}
