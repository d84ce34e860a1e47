//! Databox session: a live client-side replica of one server-owned collection.
//!
//! A databox owns its replica tree exclusively. The server pushes cud
//! packages on the session output key, the client pulls data with `fetch`
//! and both end up in the same [`Head`]. After the transport drops, the
//! replica is frozen; on reconnect the configured [`ReloadStrategy`]
//! decides between replaying missed packages and rebuilding the data in a
//! parallel reload session that is swapped in at once.
//!
//! [`ReloadStrategy`]: crate::reload::ReloadStrategy

use crate::config::{ClientConfig, DataboxConfig};
use crate::connection::{ensure_connected, request, ConnectTimeout};
use crate::error::{ClientError, Result};
use crate::protocol::{
    ConnectRequest, ConnectResponse, FetchResponse, HistoryResponse, InputAction, InputPackage,
    OutputAction, OutputPackage, SessionTarget, SnapshotResponse, DATABOX_START_INDICATOR,
};
use crate::reload::{CudHistory, GapInfo, ReloadDecision};
use crate::state::{DataboxState, StateMachine};
use crate::transport::{Transport, TransportEvent};
use async_trait::async_trait;
use parking_lot::Mutex;
use rbx_core::{Comparator, Head, Node, ValueMerger};
use rbx_cud::{apply_package, ApplyReport, CudApplied, CudId, CudPackage};
use serde_json::{json, Value};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Events emitted by a databox.
#[derive(Clone, Debug, PartialEq)]
pub enum DataboxEvent {
    /// A server session was opened or restored.
    Connected { last_cud_id: CudId },
    /// The databox was disconnected by the client.
    Disconnected,
    /// The transport dropped; the data is frozen until it reconnects.
    ConnectionLost,
    /// One operation of a cud package changed the replica.
    CudApplied { cud_id: CudId, applied: CudApplied },
    /// The plain data view changed.
    DataChanged,
    /// Missed packages were replayed or the data was rebuilt.
    ///
    /// `replayed` counts cud packages for a replay and fetches for a
    /// resnapshot.
    Reloaded { replayed: usize, resnapshot: bool },
    /// The server closed the databox.
    Closed { code: Option<Value>, data: Option<Value> },
    /// The server kicked this client out of the databox.
    KickedOut { code: Option<Value>, data: Option<Value> },
    Signal { name: String, data: Option<Value> },
}

/// Result of a fetch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FetchOutcome {
    /// Server counter of the response.
    pub counter: u64,
    /// False if a newer response had already been applied.
    pub accepted: bool,
    pub data_changed: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct SessionKeys {
    input: String,
    output: String,
}

#[derive(PartialEq, Eq)]
enum Flow {
    Continue,
    /// The server asked for the data to be rebuilt.
    Reload,
    Stop,
}

/// A reload session ready to be swapped in.
struct ReloadBuild {
    /// Fetch counter of the last replayed fetch.
    counter: Option<u64>,
    replayed: usize,
    /// Newest cud package contained in the snapshot.
    last_cud_id: CudId,
}

struct Inner {
    state: StateMachine,
    main: Head,
    /// Parallel root built during a resnapshot.
    reload: Option<Head>,
    last_cud_id: CudId,
    keys: Option<SessionKeys>,
    parallel_fetch: bool,
    token: Option<String>,
    last_fetch_counter: Option<u64>,
    /// Accepted fetch inputs, replayed by a resnapshot.
    fetch_history: Vec<Value>,
    disconnected_at: Option<Instant>,
}

impl Inner {
    /// Forget the server session; the data itself stays readable.
    fn teardown(&mut self) -> Option<SessionKeys> {
        let _ = self.state.transition(DataboxState::Disconnected);
        self.reload = None;
        self.last_cud_id = CudId::default();
        self.token = None;
        self.last_fetch_counter = None;
        self.fetch_history.clear();
        self.disconnected_at = None;
        self.keys.take()
    }
}

struct Shared<T: Transport> {
    identifier: String,
    config: DataboxConfig,
    connect_timeout: ConnectTimeout,
    response_timeout: Duration,
    transport: Arc<T>,
    inner: Mutex<Inner>,
    events: broadcast::Sender<DataboxEvent>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// A databox replica bound to one identifier (and optional member).
///
/// Cloning is cheap; clones share the same session.
pub struct Databox<T: Transport> {
    shared: Arc<Shared<T>>,
}

impl<T: Transport> Clone for Databox<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Transport> Databox<T> {
    pub fn new(
        identifier: impl Into<String>,
        transport: Arc<T>,
        config: DataboxConfig,
        client: &ClientConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(client.event_buffer.max(1));
        let connect_timeout = config
            .connect_timeout
            .clone()
            .resolve(&client.databox_connect_timeout);
        let inner = Inner {
            state: StateMachine::new(),
            main: Head::new(config.component_options()),
            reload: None,
            last_cud_id: CudId::default(),
            keys: None,
            parallel_fetch: false,
            token: None,
            last_fetch_counter: None,
            fetch_history: Vec::new(),
            disconnected_at: None,
        };

        Self {
            shared: Arc::new(Shared {
                identifier: identifier.into(),
                config,
                connect_timeout,
                response_timeout: client.response_timeout,
                transport,
                inner: Mutex::new(inner),
                events,
                worker: Mutex::new(None),
            }),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.shared.identifier
    }

    pub fn member(&self) -> Option<&str> {
        self.shared.config.member.as_deref()
    }

    pub fn state(&self) -> DataboxState {
        self.shared.inner.lock().state.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Whether the server allows fetches to run in parallel.
    pub fn parallel_fetch(&self) -> bool {
        self.shared.inner.lock().parallel_fetch
    }

    /// Last applied cud id.
    pub fn last_cud_id(&self) -> CudId {
        self.shared.inner.lock().last_cud_id
    }

    /// Owned copy of the plain data view.
    pub fn data(&self) -> Value {
        self.shared.inner.lock().main.data()
    }

    /// Read the replica tree without copying it.
    pub fn read<R>(&self, f: impl FnOnce(&Head) -> R) -> R {
        f(&self.shared.inner.lock().main)
    }

    /// Subscribe to databox events.
    pub fn subscribe(&self) -> broadcast::Receiver<DataboxEvent> {
        self.shared.events.subscribe()
    }

    /// Install a comparator on every keyed component.
    ///
    /// Returns true if the data was reordered.
    pub fn set_comparator(&self, comparator: Option<Comparator>) -> bool {
        let reordered = {
            let mut inner = self.shared.inner.lock();
            if let Some(reload) = inner.reload.as_mut() {
                reload.set_comparator(comparator.clone());
            }
            inner.main.set_comparator(comparator)
        };
        if reordered {
            self.shared.emit(DataboxEvent::DataChanged);
        }
        reordered
    }

    pub fn set_value_merger(&self, merger: Option<ValueMerger>) {
        let mut inner = self.shared.inner.lock();
        if let Some(reload) = inner.reload.as_mut() {
            reload.set_value_merger(merger.clone());
        }
        inner.main.set_value_merger(merger);
    }

    /// Open a server session and load the initial snapshot.
    ///
    /// A suspended databox restores its previous session instead.
    pub async fn connect(&self) -> Result<()> {
        let shared = &self.shared;
        let current = self.state();
        match current {
            DataboxState::Connected | DataboxState::Reloading => return Ok(()),
            DataboxState::Suspended => return shared.recover().await,
            DataboxState::Connecting => {
                return Err(ClientError::InvalidState("connect already in progress".into()))
            }
            DataboxState::Disconnected => {}
        }
        shared.inner.lock().state.transition(DataboxState::Connecting)?;

        // Subscribe before the handshake so no push after it is missed.
        let events = shared.transport.subscribe();
        let response = match shared.handshake(false).await {
            Ok(response) => response,
            Err(err) => {
                let _ = shared.inner.lock().state.transition(DataboxState::Disconnected);
                return Err(err);
            }
        };

        let last_cud_id = response.last_cud_id;
        {
            let mut inner = shared.inner.lock();
            let options = inner.main.options().clone();
            inner.main = match response.snapshot {
                Some(raw) => Head::from_raw(raw, options),
                None => Head::new(options),
            };
            inner.reload = None;
            inner.last_cud_id = last_cud_id;
            inner.keys = Some(SessionKeys {
                input: response.input_key,
                output: response.output_key,
            });
            inner.parallel_fetch = response.parallel_fetch;
            inner.token = None;
            inner.last_fetch_counter = None;
            inner.fetch_history.clear();
            inner.disconnected_at = None;
            inner.state.transition(DataboxState::Connected)?;
        }

        shared.start_worker(events);
        info!(databox = %shared.identifier, %last_cud_id, "databox connected");
        shared.emit(DataboxEvent::Connected { last_cud_id });
        Ok(())
    }

    /// Fetch data and merge it into the replica.
    ///
    /// A response whose counter is not newer than the last accepted one is
    /// discarded.
    pub async fn fetch(&self, input: Value) -> Result<FetchOutcome> {
        let shared = &self.shared;
        ensure_connected(&shared.transport, shared.connect_timeout.clone()).await?;
        let state = self.state();
        if !state.is_connected() {
            return Err(ClientError::InvalidState(format!("cannot fetch while {}", state)));
        }

        let response = shared.fetch_raw(SessionTarget::Main, input.clone()).await?;
        let outcome = {
            let mut inner = shared.inner.lock();
            if inner.last_fetch_counter.is_some_and(|last| response.counter <= last) {
                debug!(databox = %shared.identifier, counter = response.counter, "discarding stale fetch response");
                FetchOutcome {
                    counter: response.counter,
                    accepted: false,
                    data_changed: false,
                }
            } else {
                inner.last_fetch_counter = Some(response.counter);
                if response.token.is_some() {
                    inner.token = response.token;
                }
                let node = Node::from_raw(response.data);
                if let Some(reload) = inner.reload.as_mut() {
                    reload.merge_with_new(node.clone());
                }
                let data_changed = inner.main.merge_with_new(node);
                inner.fetch_history.push(input);
                FetchOutcome {
                    counter: response.counter,
                    accepted: true,
                    data_changed,
                }
            }
        };

        if outcome.data_changed {
            shared.emit(DataboxEvent::DataChanged);
        }
        Ok(outcome)
    }

    /// Clone the main session into a parallel reload session.
    pub async fn copy_session(&self) -> Result<()> {
        self.shared.copy_session().await
    }

    /// Discard one session: `Reload` drops the reload session, `Main`
    /// replaces the main session by the reload session.
    pub async fn reset_session(&self, target: SessionTarget) -> Result<()> {
        self.shared.reset_session(target).await
    }

    /// Ask the server for the id of its newest cud package.
    pub async fn server_last_cud_id(&self) -> Result<CudId> {
        let raw = self
            .shared
            .input(InputPackage::new(InputAction::GetLastCudId))
            .await?;
        Ok(serde_json::from_value(raw)?)
    }

    /// Rebuild the data from a fresh server snapshot plus the fetch
    /// history, then swap it in.
    pub async fn reload(&self) -> Result<()> {
        self.shared.resnapshot(None).await
    }

    /// Release the server session.
    ///
    /// The data stays readable until the next `connect`, which starts over
    /// with a new session.
    pub async fn disconnect(&self) -> Result<()> {
        let shared = &self.shared;
        let keys = {
            let mut inner = shared.inner.lock();
            if inner.state.state() == DataboxState::Disconnected {
                return Ok(());
            }
            inner.teardown()
        };
        if let Some(worker) = shared.worker.lock().take() {
            worker.abort();
        }

        if let Some(keys) = keys {
            if shared.transport.is_connected() {
                let payload = serde_json::to_value(InputPackage::new(InputAction::Disconnect))?;
                if let Err(err) = shared.transport.send(&keys.input, payload).await {
                    debug!(databox = %shared.identifier, %err, "disconnect notice not delivered");
                }
            }
        }

        info!(databox = %shared.identifier, "databox disconnected");
        shared.emit(DataboxEvent::Disconnected);
        Ok(())
    }
}

impl<T: Transport> Shared<T> {
    fn emit(&self, event: DataboxEvent) {
        let _ = self.events.send(event);
    }

    fn start_worker(self: &Arc<Self>, events: broadcast::Receiver<TransportEvent>) {
        let worker = tokio::spawn(run_worker(Arc::downgrade(self), events));
        if let Some(previous) = self.worker.lock().replace(worker) {
            previous.abort();
        }
    }

    fn is_output_event(&self, event: &str) -> bool {
        self.inner
            .lock()
            .keys
            .as_ref()
            .is_some_and(|keys| keys.output == event)
    }

    fn input_key(&self) -> Result<String> {
        self.inner
            .lock()
            .keys
            .as_ref()
            .map(|keys| keys.input.clone())
            .ok_or_else(|| ClientError::InvalidState("databox has no server session".into()))
    }

    async fn handshake(&self, restore: bool) -> Result<ConnectResponse> {
        ensure_connected(&self.transport, self.connect_timeout.clone()).await?;

        let token = if restore && self.config.token_restore {
            self.inner.lock().token.clone()
        } else {
            None
        };
        let connect_request = ConnectRequest {
            databox: self.identifier.clone(),
            member: self.config.member.clone(),
            api_level: self.config.api_level,
            token,
            init_input: self.config.init_input.clone(),
        };
        let raw = request(
            self.transport.as_ref(),
            DATABOX_START_INDICATOR,
            serde_json::to_value(&connect_request)?,
            self.response_timeout,
        )
        .await?;
        Ok(serde_json::from_value(raw)?)
    }

    async fn input(&self, package: InputPackage) -> Result<Value> {
        let key = self.input_key()?;
        request(
            self.transport.as_ref(),
            &key,
            serde_json::to_value(&package)?,
            self.response_timeout,
        )
        .await
    }

    async fn fetch_raw(&self, target: SessionTarget, input: Value) -> Result<FetchResponse> {
        let package = InputPackage::new(InputAction::Fetch)
            .with_target(target)
            .with_input(input);
        let raw = self.input(package).await?;
        Ok(serde_json::from_value(raw)?)
    }

    async fn copy_session(&self) -> Result<()> {
        self.input(InputPackage::new(InputAction::CopySession)).await?;
        let mut inner = self.inner.lock();
        inner.reload = Some(inner.main.clone());
        Ok(())
    }

    async fn reset_session(&self, target: SessionTarget) -> Result<()> {
        self.input(InputPackage::new(InputAction::ResetSession).with_target(target))
            .await?;
        let changed = {
            let mut inner = self.inner.lock();
            match target {
                SessionTarget::Reload => {
                    inner.reload = None;
                    false
                }
                SessionTarget::Main => match inner.reload.take() {
                    Some(reload) => {
                        let before = inner.main.data();
                        inner.main = reload;
                        before != inner.main.data()
                    }
                    None => false,
                },
            }
        };
        if changed {
            self.emit(DataboxEvent::DataChanged);
        }
        Ok(())
    }

    /// Apply a cud package to the main session and to a pending reload session.
    fn apply_cud(&self, package: &CudPackage) -> ApplyReport {
        let report = {
            let mut inner = self.inner.lock();
            if let Some(reload) = inner.reload.as_mut() {
                apply_package(reload, package, false);
            }
            let report = apply_package(&mut inner.main, package, true);
            if package.id > inner.last_cud_id {
                inner.last_cud_id = package.id;
            }
            report
        };

        trace!(
            databox = %self.identifier,
            cud_id = %package.id,
            applied = report.applied.len(),
            "applied cud package"
        );
        for applied in &report.applied {
            self.emit(DataboxEvent::CudApplied {
                cud_id: package.id,
                applied: applied.clone(),
            });
        }
        if report.data_changed {
            self.emit(DataboxEvent::DataChanged);
        }
        report
    }

    fn handle_output(&self, payload: Value) -> Flow {
        let package: OutputPackage = match serde_json::from_value(payload) {
            Ok(package) => package,
            Err(err) => {
                warn!(databox = %self.identifier, %err, "dropping malformed output package");
                return Flow::Continue;
            }
        };
        let action = match OutputAction::try_from(package.action) {
            Ok(action) => action,
            Err(err) => {
                warn!(databox = %self.identifier, %err, "dropping output package");
                return Flow::Continue;
            }
        };

        match action {
            OutputAction::Cud => {
                match package.data.map(CudPackage::from_value) {
                    Some(Ok(cud)) => {
                        self.apply_cud(&cud);
                    }
                    Some(Err(err)) => {
                        warn!(databox = %self.identifier, %err, "dropping invalid cud package")
                    }
                    None => warn!(databox = %self.identifier, "dropping cud event without package"),
                }
                Flow::Continue
            }
            OutputAction::Reload => Flow::Reload,
            OutputAction::Close => {
                self.inner.lock().teardown();
                info!(databox = %self.identifier, "databox closed by server");
                self.emit(DataboxEvent::Closed {
                    code: package.code,
                    data: package.data,
                });
                Flow::Stop
            }
            OutputAction::KickOut => {
                self.inner.lock().teardown();
                info!(databox = %self.identifier, "kicked out of databox");
                self.emit(DataboxEvent::KickedOut {
                    code: package.code,
                    data: package.data,
                });
                Flow::Stop
            }
            OutputAction::Signal => {
                self.emit(DataboxEvent::Signal {
                    name: package.signal.unwrap_or_default(),
                    data: package.data,
                });
                Flow::Continue
            }
        }
    }

    fn on_connection_lost(&self) {
        let lost = {
            let mut inner = self.inner.lock();
            let live = inner.state.state().is_connected();
            if live && inner.state.transition(DataboxState::Suspended).is_ok() {
                inner.disconnected_at = Some(Instant::now());
                true
            } else {
                false
            }
        };
        if lost {
            info!(databox = %self.identifier, "connection lost, databox suspended");
            self.emit(DataboxEvent::ConnectionLost);
        }
    }

    /// Restore the session of a suspended databox.
    async fn recover(&self) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            if inner.state.state() != DataboxState::Suspended {
                return Ok(());
            }
            inner.state.transition(DataboxState::Connecting)?;
        }

        let result = self.reconnect_session().await;
        if result.is_err() {
            let mut inner = self.inner.lock();
            if inner.state.state() == DataboxState::Connecting {
                let _ = inner.state.transition(DataboxState::Suspended);
            }
        }
        result
    }

    async fn reconnect_session(&self) -> Result<()> {
        let response = self.handshake(true).await?;
        let seed = SnapshotResponse::from(&response);
        let (gap, fetches) = {
            let mut inner = self.inner.lock();
            inner.keys = Some(SessionKeys {
                input: response.input_key,
                output: response.output_key,
            });
            inner.parallel_fetch = response.parallel_fetch;
            let gap = GapInfo {
                last_applied: inner.last_cud_id,
                server_last: response.last_cud_id,
                disconnected_for: inner.disconnected_at.take().map(|at| at.elapsed()),
                token_used: response.token_used,
            };
            inner.state.transition(DataboxState::Connected)?;
            (gap, inner.fetch_history.len())
        };
        info!(
            databox = %self.identifier,
            missed = gap.missed(),
            token_used = gap.token_used,
            "databox reconnected"
        );
        self.emit(DataboxEvent::Connected {
            last_cud_id: gap.server_last,
        });

        // Without the token the server lost the fetch position.
        if !gap.token_used && fetches > 0 {
            return self.resnapshot(Some(seed)).await;
        }

        let history = SessionHistory { shared: self };
        match self.config.reload_strategy.decide(&gap, &history).await? {
            ReloadDecision::Replay(packages) => {
                for package in &packages {
                    self.apply_cud(package);
                }
                if !packages.is_empty() {
                    debug!(databox = %self.identifier, replayed = packages.len(), "replayed missed cud packages");
                    self.emit(DataboxEvent::Reloaded {
                        replayed: packages.len(),
                        resnapshot: false,
                    });
                }
                Ok(())
            }
            ReloadDecision::Resnapshot => self.resnapshot(Some(seed)).await,
        }
    }

    /// Rebuild the data in a reload session and swap it in.
    ///
    /// The reload session starts from `seed`, or from a snapshot requested
    /// for it, and replays the fetch history on top. Readers keep seeing the
    /// main session until the swap. The worker never awaits this, so cud
    /// packages arriving meanwhile are applied to both sessions in order.
    async fn resnapshot(&self, seed: Option<SnapshotResponse>) -> Result<()> {
        let history = {
            let mut inner = self.inner.lock();
            inner.state.transition(DataboxState::Reloading)?;
            inner.fetch_history.clone()
        };
        debug!(databox = %self.identifier, fetches = history.len(), "building reload session");

        let built = self.build_reload_session(seed, &history).await;
        if built.is_err() {
            let discard = InputPackage::new(InputAction::ResetSession).with_target(SessionTarget::Reload);
            if let Err(err) = self.input(discard).await {
                debug!(databox = %self.identifier, %err, "reload session not discarded on server");
            }
        }

        let changed = {
            let mut inner = self.inner.lock();
            let reloading = inner.state.state() == DataboxState::Reloading;
            let changed = match (&built, reloading) {
                (Ok(build), true) => match inner.reload.take() {
                    Some(reload) => {
                        let before = inner.main.data();
                        inner.main = reload;
                        if build.counter.is_some() {
                            inner.last_fetch_counter = build.counter;
                        }
                        if build.last_cud_id > inner.last_cud_id {
                            inner.last_cud_id = build.last_cud_id;
                        }
                        Some(before != inner.main.data())
                    }
                    None => None,
                },
                _ => {
                    inner.reload = None;
                    None
                }
            };
            if reloading {
                if let Err(err) = inner.state.transition(DataboxState::Connected) {
                    debug!(databox = %self.identifier, %err, "databox not reconnected after reload");
                }
            }
            changed
        };

        let build = built?;
        let Some(changed) = changed else {
            return Err(ClientError::InvalidState(
                "databox left the reloading state during a resnapshot".into(),
            ));
        };
        info!(
            databox = %self.identifier,
            changed,
            replayed = build.replayed,
            last_cud_id = %build.last_cud_id,
            "databox reloaded"
        );
        self.emit(DataboxEvent::Reloaded {
            replayed: build.replayed,
            resnapshot: true,
        });
        if changed {
            self.emit(DataboxEvent::DataChanged);
        }
        Ok(())
    }

    async fn build_reload_session(&self, seed: Option<SnapshotResponse>, history: &[Value]) -> Result<ReloadBuild> {
        self.copy_session().await?;

        let seed = match seed {
            Some(seed) => seed,
            None => {
                let package = InputPackage::new(InputAction::Snapshot).with_target(SessionTarget::Reload);
                serde_json::from_value(self.input(package).await?)?
            }
        };
        {
            let mut inner = self.inner.lock();
            if let Some(reload) = inner.reload.as_mut() {
                reload.replace(seed.data.map(Node::from_raw));
            }
        }

        let mut counter = None;
        for input in history {
            let response = self.fetch_raw(SessionTarget::Reload, input.clone()).await?;
            {
                let mut inner = self.inner.lock();
                if let Some(reload) = inner.reload.as_mut() {
                    reload.merge_with_new(Node::from_raw(response.data));
                }
                if response.token.is_some() {
                    inner.token = response.token;
                }
            }
            counter = Some(response.counter);
        }

        self.input(InputPackage::new(InputAction::ResetSession).with_target(SessionTarget::Main))
            .await?;
        Ok(ReloadBuild {
            counter,
            replayed: history.len(),
            last_cud_id: seed.last_cud_id,
        })
    }
}

impl<T: Transport> Shared<T> {
    /// Rebuild the data beside the worker.
    fn spawn_resnapshot(self: &Arc<Self>) {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = shared.resnapshot(None).await {
                warn!(databox = %shared.identifier, %err, "databox reload failed");
            }
        });
    }

    /// Restore the session beside the worker.
    fn spawn_recover(self: &Arc<Self>) {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = shared.recover().await {
                warn!(databox = %shared.identifier, %err, "databox recovery failed");
            }
        });
    }
}

impl<T: Transport> Drop for Shared<T> {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut().take() {
            worker.abort();
        }
    }
}

/// Retained history of the current server session.
struct SessionHistory<'a, T: Transport> {
    shared: &'a Shared<T>,
}

#[async_trait]
impl<'a, T: Transport> CudHistory for SessionHistory<'a, T> {
    async fn missed_since(&self, last_applied: CudId) -> Result<HistoryResponse> {
        let package = InputPackage::new(InputAction::History).with_input(json!(last_applied));
        let raw = self.shared.input(package).await?;
        let history: HistoryResponse = serde_json::from_value(raw)?;
        history.packages.iter().try_for_each(CudPackage::validate)?;
        Ok(history)
    }
}

async fn run_worker<T: Transport>(weak: Weak<Shared<T>>, mut events: broadcast::Receiver<TransportEvent>) {
    loop {
        let event = events.recv().await;
        let Some(shared) = weak.upgrade() else {
            break;
        };

        let flow = match event {
            Ok(TransportEvent::Message { event, payload }) => {
                if shared.is_output_event(&event) {
                    shared.handle_output(payload)
                } else {
                    Flow::Continue
                }
            }
            Ok(TransportEvent::Disconnected) => {
                shared.on_connection_lost();
                Flow::Continue
            }
            Ok(TransportEvent::Connected) => {
                shared.spawn_recover();
                Flow::Continue
            }
            Ok(TransportEvent::Authenticated) => Flow::Continue,
            Err(RecvError::Lagged(missed)) => {
                warn!(databox = %shared.identifier, missed, "transport events lagged, reloading");
                Flow::Reload
            }
            Err(RecvError::Closed) => Flow::Stop,
        };

        match flow {
            Flow::Continue => {}
            Flow::Reload => shared.spawn_resnapshot(),
            Flow::Stop => break,
        }
    }
}
