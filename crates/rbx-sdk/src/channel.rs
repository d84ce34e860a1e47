//! Channel engine and channel handles.
//!
//! Many local handles may be interested in the same server-side channel. The
//! engine keeps one registration per channel id holding the set of
//! interested handles, issues one subscribe per distinct channel and sends an
//! unsubscribe only when the last handle releases it. Handles subscribing
//! to the same request at once share the one subscribe in flight. After the transport
//! reconnects or re-authenticates, every registered channel is subscribed
//! again exactly once.

use crate::config::ClientConfig;
use crate::connection::{ensure_connected, request, ConnectTimeout};
use crate::error::{ClientError, Result};
use crate::protocol::{
    ChannelKickOutPackage, ChannelPublishPackage, ChannelSubscribeRequest,
    CHANNEL_KICK_OUT_EVENT, CHANNEL_PUBLISH_EVENT, CHANNEL_START_INDICATOR,
    CHANNEL_UNSUBSCRIBE_ACTION,
};
use crate::transport::{Transport, TransportEvent};
use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use ulid::Ulid;

/// Identity of a subscribed channel: server channel id plus optional member.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId {
    pub id: String,
    pub member: Option<String>,
}

impl ChannelId {
    pub fn new(id: impl Into<String>, member: Option<String>) -> Self {
        Self {
            id: id.into(),
            member,
        }
    }

    /// Full id the server expects unsubscribes on.
    pub fn full_id(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.member {
            Some(member) => write!(f, "{}.{}", self.id, member),
            None => f.write_str(&self.id),
        }
    }
}

/// What a handle asks to subscribe to.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SubscribeRequest {
    pub identifier: String,
    pub member: Option<String>,
    pub api_level: Option<u32>,
}

impl SubscribeRequest {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            member: None,
            api_level: None,
        }
    }

    pub fn with_member(mut self, member: impl Into<String>) -> Self {
        self.member = Some(member.into());
        self
    }

    pub fn with_api_level(mut self, level: u32) -> Self {
        self.api_level = Some(level);
        self
    }

    fn to_wire(&self) -> ChannelSubscribeRequest {
        ChannelSubscribeRequest {
            channel: self.identifier.clone(),
            member: self.member.clone(),
            api_level: self.api_level,
        }
    }
}

/// Unique identity of a channel handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandleId(Ulid);

impl HandleId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for HandleId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Events delivered to a channel handle.
#[derive(Clone, Debug, PartialEq)]
pub enum ChannelEvent {
    Subscribed { channel: ChannelId },
    /// A resubscribe after a reconnect was refused; the handle stays
    /// registered and is retried on the next reconnect.
    SubscribeFailed { request: SubscribeRequest, reason: Value },
    Unsubscribed { channel: ChannelId },
    Publish { channel: ChannelId, event: String, data: Option<Value> },
    KickedOut { channel: ChannelId, code: Option<Value>, data: Option<Value> },
    ConnectionLost,
}

struct Registration {
    request: SubscribeRequest,
    handles: HashMap<HandleId, broadcast::Sender<ChannelEvent>>,
}

/// Result of a subscribe in flight; `None` until it completes.
type SubscribeOutcome = Option<Result<ChannelId>>;

enum Pending {
    Lead(watch::Sender<SubscribeOutcome>),
    Wait(watch::Receiver<SubscribeOutcome>),
}

/// Removes the in-flight entry of a leading subscribe, also when it is
/// cancelled.
struct PendingSubscribe<'a, T: Transport> {
    engine: &'a ChannelEngine<T>,
    request: &'a SubscribeRequest,
}

impl<T: Transport> Drop for PendingSubscribe<'_, T> {
    fn drop(&mut self) {
        self.engine.pending.lock().remove(self.request);
    }
}

/// Reference-counting registry of channel subscriptions over one transport.
pub struct ChannelEngine<T: Transport> {
    transport: Arc<T>,
    connect_timeout: ConnectTimeout,
    response_timeout: Duration,
    event_buffer: usize,
    registrations: Mutex<HashMap<ChannelId, Registration>>,
    /// Subscribes in flight by request. Lock before `registrations`.
    pending: Mutex<HashMap<SubscribeRequest, watch::Receiver<SubscribeOutcome>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Transport> ChannelEngine<T> {
    pub fn new(transport: Arc<T>, config: &ClientConfig) -> Self {
        Self {
            transport,
            connect_timeout: config.connect_timeout.clone(),
            response_timeout: config.response_timeout,
            event_buffer: config.event_buffer.max(1),
            registrations: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            listener: Mutex::new(None),
        }
    }

    /// Start listening to the transport for lifecycle changes and channel
    /// messages. Calling it again replaces the listener.
    pub fn attach(self: &Arc<Self>) {
        let events = self.transport.subscribe();
        let listener = tokio::spawn(run_listener(Arc::downgrade(self), events));
        if let Some(previous) = self.listener.lock().replace(listener) {
            previous.abort();
        }
    }

    /// Subscribe on the server and tell the handles already registered for
    /// the resulting channel, except `except`.
    ///
    /// A refused subscribe is only reported to the caller.
    pub async fn try_subscribe(
        &self,
        request: &SubscribeRequest,
        except: Option<HandleId>,
    ) -> Result<ChannelId> {
        let channel = self.subscribe_request(request).await?;
        self.notify(&channel, except, ChannelEvent::Subscribed {
            channel: channel.clone(),
        });
        Ok(channel)
    }

    async fn subscribe_request(&self, subscribe: &SubscribeRequest) -> Result<ChannelId> {
        ensure_connected(&self.transport, self.connect_timeout.clone()).await?;
        let ack = request(
            self.transport.as_ref(),
            CHANNEL_START_INDICATOR,
            serde_json::to_value(subscribe.to_wire())?,
            self.response_timeout,
        )
        .await
        .map_err(|err| match err {
            ClientError::Rejected { reason } => ClientError::SubscriptionFailed { reason },
            other => other,
        })?;

        let id = match ack {
            Value::String(id) => id,
            other => return Err(ClientError::Protocol(format!("invalid channel id {}", other))),
        };
        let channel = ChannelId::new(id, subscribe.member.clone());
        debug!(channel = %channel, identifier = %subscribe.identifier, "subscribed to channel");
        Ok(channel)
    }

    /// Subscribe `handle` to `request` and register its interest.
    ///
    /// A channel already live for an equal request is reused, and a
    /// subscribe in flight for it is awaited instead of sending another.
    pub async fn join(
        &self,
        request: &SubscribeRequest,
        handle: HandleId,
        events: &broadcast::Sender<ChannelEvent>,
    ) -> Result<ChannelId> {
        loop {
            let role = {
                let mut pending = self.pending.lock();
                if let Some(channel) = self.live_channel_for(request) {
                    self.register_interest(channel.clone(), request.clone(), handle, events.clone());
                    return Ok(channel);
                }
                match pending.get(request) {
                    Some(waiting) => Pending::Wait(waiting.clone()),
                    None => {
                        let (done, waiting) = watch::channel(None);
                        pending.insert(request.clone(), waiting);
                        Pending::Lead(done)
                    }
                }
            };

            let mut waiting = match role {
                Pending::Lead(done) => return self.lead_subscribe(request, handle, events, done).await,
                Pending::Wait(waiting) => waiting,
            };
            let outcome = waiting
                .wait_for(Option::is_some)
                .await
                .ok()
                .and_then(|outcome| outcome.clone());
            match outcome {
                Some(Ok(channel)) => {
                    self.register_interest(channel.clone(), request.clone(), handle, events.clone());
                    return Ok(channel);
                }
                Some(Err(err)) => return Err(err),
                // The leading subscribe was cancelled.
                None => continue,
            }
        }
    }

    async fn lead_subscribe(
        &self,
        request: &SubscribeRequest,
        handle: HandleId,
        events: &broadcast::Sender<ChannelEvent>,
        done: watch::Sender<SubscribeOutcome>,
    ) -> Result<ChannelId> {
        let _pending = PendingSubscribe { engine: self, request };
        let result = self.try_subscribe(request, Some(handle)).await;
        if let Ok(channel) = &result {
            self.register_interest(channel.clone(), request.clone(), handle, events.clone());
        }
        // Waiting handles may have been dropped.
        let _ = done.send(Some(result.clone()));
        result
    }

    /// Add `handle` to the handles interested in `channel`.
    pub fn register_interest(
        &self,
        channel: ChannelId,
        request: SubscribeRequest,
        handle: HandleId,
        events: broadcast::Sender<ChannelEvent>,
    ) {
        self.registrations
            .lock()
            .entry(channel)
            .or_insert_with(|| Registration {
                request,
                handles: HashMap::new(),
            })
            .handles
            .insert(handle, events);
    }

    /// Remove `handle` from `channel`. If no handle is left, the server
    /// subscription is released.
    ///
    /// Returns true if this was the last interest in the channel.
    pub async fn release_interest(&self, channel: &ChannelId, handle: HandleId) -> Result<bool> {
        match self.detach(channel, handle) {
            Some(full_id) => {
                self.send_unsubscribe(&full_id).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Remove `handle`; returns the full id to unsubscribe if it was the last one.
    fn detach(&self, channel: &ChannelId, handle: HandleId) -> Option<String> {
        let mut registrations = self.registrations.lock();
        let registration = registrations.get_mut(channel)?;
        registration.handles.remove(&handle)?;
        if !registration.handles.is_empty() {
            return None;
        }
        registrations.remove(channel);
        Some(channel.full_id())
    }

    /// Drop every interest of `handle`; returns the full ids to unsubscribe.
    fn detach_handle(&self, handle: HandleId) -> Vec<String> {
        let channels = self.channels_of(handle);
        channels
            .iter()
            .filter_map(|channel| self.detach(channel, handle))
            .collect()
    }

    async fn send_unsubscribe(&self, full_id: &str) -> Result<()> {
        // The server drops subscriptions of a closed connection by itself.
        if !self.transport.is_connected() {
            return Ok(());
        }
        self.transport
            .send(full_id, json!([CHANNEL_UNSUBSCRIBE_ACTION]))
            .await?;
        debug!(channel = %full_id, "unsubscribed from channel");
        Ok(())
    }

    /// Channel already registered for an equal request.
    pub fn live_channel_for(&self, request: &SubscribeRequest) -> Option<ChannelId> {
        self.registrations
            .lock()
            .iter()
            .find(|(_, registration)| &registration.request == request)
            .map(|(channel, _)| channel.clone())
    }

    /// Channels `handle` is registered for.
    pub fn channels_of(&self, handle: HandleId) -> Vec<ChannelId> {
        let mut channels: Vec<ChannelId> = self
            .registrations
            .lock()
            .iter()
            .filter(|(_, registration)| registration.handles.contains_key(&handle))
            .map(|(channel, _)| channel.clone())
            .collect();
        channels.sort();
        channels
    }

    /// Number of handles registered for `channel`.
    pub fn interest_count(&self, channel: &ChannelId) -> usize {
        self.registrations
            .lock()
            .get(channel)
            .map_or(0, |registration| registration.handles.len())
    }

    /// Subscribe every registered channel again, once per distinct request,
    /// and wait for all of them.
    ///
    /// Returns the number of subscribe requests issued.
    pub async fn resubscribe_all(&self) -> usize {
        let pending: Vec<(ChannelId, SubscribeRequest)> = {
            let registrations = self.registrations.lock();
            let mut checked = HashSet::new();
            registrations
                .iter()
                .filter(|(_, registration)| checked.insert(registration.request.clone()))
                .map(|(channel, registration)| (channel.clone(), registration.request.clone()))
                .collect()
        };
        let issued = pending.len();

        let results = join_all(pending.into_iter().map(|(previous, subscribe)| async move {
            let result = self.subscribe_request(&subscribe).await;
            (previous, subscribe, result)
        }))
        .await;

        for (previous, subscribe, result) in results {
            match result {
                Ok(channel) => {
                    self.rekey(&previous, &channel);
                    self.notify(&channel, None, ChannelEvent::Subscribed {
                        channel: channel.clone(),
                    });
                }
                Err(err) => {
                    warn!(channel = %previous, %err, "resubscribe failed");
                    let reason = match err {
                        ClientError::SubscriptionFailed { reason } => reason,
                        other => json!(other.to_string()),
                    };
                    self.notify(&previous, None, ChannelEvent::SubscribeFailed {
                        request: subscribe,
                        reason,
                    });
                }
            }
        }
        issued
    }

    /// Move a registration whose server channel id changed.
    fn rekey(&self, previous: &ChannelId, channel: &ChannelId) {
        if previous == channel {
            return;
        }
        let mut registrations = self.registrations.lock();
        let Some(moved) = registrations.remove(previous) else {
            return;
        };
        match registrations.get_mut(channel) {
            Some(existing) => existing.handles.extend(moved.handles),
            None => {
                registrations.insert(channel.clone(), moved);
            }
        }
    }

    /// Release every handle, optionally only for one channel identifier.
    ///
    /// Returns the number of channels unsubscribed.
    pub async fn unsubscribe_all(&self, identifier: Option<&str>) -> Result<usize> {
        let removed: Vec<(ChannelId, Registration)> = {
            let mut registrations = self.registrations.lock();
            let matching: Vec<ChannelId> = registrations
                .iter()
                .filter(|(_, registration)| {
                    identifier.map_or(true, |identifier| registration.request.identifier == identifier)
                })
                .map(|(channel, _)| channel.clone())
                .collect();
            matching
                .into_iter()
                .filter_map(|channel| registrations.remove(&channel).map(|r| (channel, r)))
                .collect()
        };

        for (channel, registration) in &removed {
            for events in registration.handles.values() {
                let _ = events.send(ChannelEvent::Unsubscribed {
                    channel: channel.clone(),
                });
            }
            self.send_unsubscribe(&channel.full_id()).await?;
        }
        Ok(removed.len())
    }

    fn notify(&self, channel: &ChannelId, except: Option<HandleId>, event: ChannelEvent) {
        let registrations = self.registrations.lock();
        let Some(registration) = registrations.get(channel) else {
            return;
        };
        for (handle, events) in &registration.handles {
            if Some(*handle) != except {
                let _ = events.send(event.clone());
            }
        }
    }

    fn dispatch_publish(&self, package: ChannelPublishPackage) {
        let registrations = self.registrations.lock();
        for (channel, registration) in registrations.iter() {
            if !addresses(channel, &package.channel_id, package.member.as_deref()) {
                continue;
            }
            for events in registration.handles.values() {
                let _ = events.send(ChannelEvent::Publish {
                    channel: channel.clone(),
                    event: package.event.clone(),
                    data: package.data.clone(),
                });
            }
        }
    }

    fn dispatch_kick_out(&self, package: ChannelKickOutPackage) {
        let kicked: Vec<(ChannelId, Registration)> = {
            let mut registrations = self.registrations.lock();
            let matching: Vec<ChannelId> = registrations
                .keys()
                .filter(|channel| addresses(channel, &package.channel_id, package.member.as_deref()))
                .cloned()
                .collect();
            matching
                .into_iter()
                .filter_map(|channel| registrations.remove(&channel).map(|r| (channel, r)))
                .collect()
        };

        for (channel, registration) in kicked {
            debug!(channel = %channel, "kicked out of channel");
            for events in registration.handles.values() {
                let _ = events.send(ChannelEvent::KickedOut {
                    channel: channel.clone(),
                    code: package.code.clone(),
                    data: package.data.clone(),
                });
            }
        }
    }

    fn notify_connection_lost(&self) {
        let registrations = self.registrations.lock();
        let mut notified = HashSet::new();
        for registration in registrations.values() {
            for (handle, events) in &registration.handles {
                if notified.insert(*handle) {
                    let _ = events.send(ChannelEvent::ConnectionLost);
                }
            }
        }
    }

    async fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Connected | TransportEvent::Authenticated => {
                let issued = self.resubscribe_all().await;
                if issued > 0 {
                    debug!(channels = issued, "resubscribed channels");
                }
            }
            TransportEvent::Disconnected => self.notify_connection_lost(),
            TransportEvent::Message { event, payload } if event == CHANNEL_PUBLISH_EVENT => {
                match serde_json::from_value(payload) {
                    Ok(package) => self.dispatch_publish(package),
                    Err(err) => warn!(%err, "dropping malformed channel publish"),
                }
            }
            TransportEvent::Message { event, payload } if event == CHANNEL_KICK_OUT_EVENT => {
                match serde_json::from_value(payload) {
                    Ok(package) => self.dispatch_kick_out(package),
                    Err(err) => warn!(%err, "dropping malformed channel kick-out"),
                }
            }
            TransportEvent::Message { .. } => {}
        }
    }
}

impl<T: Transport> Drop for ChannelEngine<T> {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.get_mut().take() {
            listener.abort();
        }
    }
}

/// Check if a package for `id`/`member` addresses `channel`.
fn addresses(channel: &ChannelId, id: &str, member: Option<&str>) -> bool {
    channel.id == id && member.map_or(true, |member| channel.member.as_deref() == Some(member))
}

async fn run_listener<T: Transport>(
    weak: Weak<ChannelEngine<T>>,
    mut events: broadcast::Receiver<TransportEvent>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(missed)) => {
                warn!(missed, "channel listener lagged");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        let Some(engine) = weak.upgrade() else {
            break;
        };
        engine.handle_transport_event(event).await;
    }
}

/// A local handle expressing interest in channels.
///
/// Dropping the handle releases its interests.
pub struct Channel<T: Transport> {
    id: HandleId,
    engine: Arc<ChannelEngine<T>>,
    events: broadcast::Sender<ChannelEvent>,
}

impl<T: Transport> Channel<T> {
    pub fn new(engine: Arc<ChannelEngine<T>>) -> Self {
        let (events, _) = broadcast::channel(engine.event_buffer);
        Self {
            id: HandleId::new(),
            engine,
            events,
        }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    /// Subscribe to handle events.
    pub fn events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    /// Channels this handle is registered for.
    pub fn subscriptions(&self) -> Vec<ChannelId> {
        self.engine.channels_of(self.id)
    }

    pub fn is_subscribed(&self, channel: &ChannelId) -> bool {
        self.subscriptions().contains(channel)
    }

    /// Subscribe to a channel.
    ///
    /// If another handle already holds the channel, or is subscribing to it
    /// right now, no further network subscribe is sent.
    pub async fn subscribe(&self, request: SubscribeRequest) -> Result<ChannelId> {
        let channel = self.engine.join(&request, self.id, &self.events).await?;
        // Ignore send errors (no receivers yet)
        let _ = self.events.send(ChannelEvent::Subscribed {
            channel: channel.clone(),
        });
        Ok(channel)
    }

    /// Release this handle's interest in `channel`.
    pub async fn unsubscribe(&self, channel: &ChannelId) -> Result<()> {
        if !self.is_subscribed(channel) {
            return Ok(());
        }
        self.engine.release_interest(channel, self.id).await?;
        let _ = self.events.send(ChannelEvent::Unsubscribed {
            channel: channel.clone(),
        });
        Ok(())
    }

    /// Release every interest of this handle.
    pub async fn unsubscribe_all(&self) -> Result<()> {
        for channel in self.subscriptions() {
            self.unsubscribe(&channel).await?;
        }
        Ok(())
    }
}

impl<T: Transport> Drop for Channel<T> {
    fn drop(&mut self) {
        let released = self.engine.detach_handle(self.id);
        if released.is_empty() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let engine = Arc::clone(&self.engine);
        runtime.spawn(async move {
            for full_id in released {
                if let Err(err) = engine.send_unsubscribe(&full_id).await {
                    debug!(channel = %full_id, %err, "unsubscribe of dropped handle failed");
                }
            }
        });
    }
}
