//! Subscription channel to a connected simulator
//!
//! One [`SubscriptionChannel`] is bound to one transport session. It runs a
//! single session task that owns the transport: the task forwards queued
//! requests, polls for inbound messages with a short timeout so it notices a
//! close promptly, and demultiplexes updates onto registry entries.
//!
//! Update callbacks run on the session task, one per updated entry, in wire
//! order. A callback that needs to do slow work should hand the event off.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, trace, warn};

use crate::config::{ChannelConfig, MAX_OUTBOUND_CAPACITY};
use crate::protocol::{DatarefParam, Inbound, Request, parse_dataref_path};
use crate::registry::Registry;
use crate::transport::Transport;
use crate::types::{CommandEntry, MAX_ARRAY_INDEX, PendingRequest, Value, VariableEntry};
use crate::{LinkError, Result};

/// Update delivered to the channel callback.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// A dataref received a new value
    Dataref(Arc<VariableEntry>),
    /// A command started or stopped being active
    CommandActive { command: Arc<CommandEntry>, active: bool },
}

impl ChannelEvent {
    pub fn name(&self) -> &str {
        match self {
            ChannelEvent::Dataref(entry) => entry.name(),
            ChannelEvent::CommandActive { command, .. } => command.name(),
        }
    }
}

/// Callback shared by every subscription on a channel.
pub type EventCallback = Arc<dyn Fn(ChannelEvent) + Send + Sync>;

/// State shared between the channel handle and its session task.
struct Shared {
    registry: Arc<Registry>,
    callback: RwLock<Option<EventCallback>>,
    pending: Mutex<HashMap<u64, PendingRequest>>,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, HashMap<u64, PendingRequest>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: ChannelEvent) {
        let callback = self.callback.read().unwrap_or_else(PoisonError::into_inner).clone();
        match callback {
            Some(callback) => callback(event),
            None => trace!("No callback registered for {}", event.name()),
        }
    }

    /// Decode one inbound message and apply it.
    fn dispatch(&self, text: &str) {
        let message = match Inbound::parse(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping message: {}", e);
                return;
            }
        };

        match message {
            Inbound::Result { req_id, success, error_code, error_message } => {
                let pending = req_id.and_then(|id| self.pending().remove(&id));
                let kind = pending.as_ref().map(|p| p.kind);
                if success {
                    debug!(req_id, ?kind, "Request acknowledged");
                } else {
                    let message = match (error_message, error_code) {
                        (Some(message), Some(code)) => format!("{} ({})", message, code),
                        (Some(message), None) => message,
                        (None, Some(code)) => code.to_string(),
                        (None, None) => "no reason given".to_string(),
                    };
                    let error = LinkError::RequestFailed { req_id: req_id.unwrap_or_default(), message };
                    warn!(?kind, "{}", error);
                }
            }
            Inbound::DatarefUpdateValues { data } => {
                for (key, value) in data {
                    let Ok(id) = key.parse::<i64>() else {
                        warn!("Ignoring update for non-numeric id {:?}", key);
                        continue;
                    };
                    let Some(entry) = self.registry.dataref_by_id(id) else {
                        debug!(id, "No dataref for id, late update for a released dataref");
                        continue;
                    };
                    match entry.apply_update(&value) {
                        Ok(()) => {
                            trace!(dataref = entry.name(), "Value updated");
                            self.emit(ChannelEvent::Dataref(entry));
                        }
                        Err(e) => warn!(dataref = entry.name(), "{}", e),
                    }
                }
            }
            Inbound::CommandUpdateIsActive { data } => {
                for (key, active) in data {
                    let Some(command) = key.parse::<i64>().ok().and_then(|id| self.registry.command_by_id(id)) else {
                        debug!("No command for id {}", key);
                        continue;
                    };
                    command.set_active(active);
                    self.emit(ChannelEvent::CommandActive { command, active });
                }
            }
            Inbound::Unknown => warn!("Ignoring message of unknown type"),
        }
    }
}

/// Persistent request/update session with the simulator.
pub struct SubscriptionChannel {
    shared: Arc<Shared>,
    outbound: mpsc::Sender<String>,
    next_req_id: tokio::sync::Mutex<u64>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    close_timeout: Duration,
}

impl std::fmt::Debug for SubscriptionChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionChannel")
            .field("closed", &self.cancel.is_cancelled())
            .field("pending", &self.shared.pending().len())
            .finish()
    }
}

impl SubscriptionChannel {
    /// Start a session on `transport`.
    pub fn open<T: Transport>(transport: T, registry: Arc<Registry>, config: &ChannelConfig) -> Self {
        Self::open_in(transport, registry, config, info_span!("channel"))
    }

    /// Start a session whose task logs inside `span`.
    pub fn open_in<T: Transport>(
        transport: T,
        registry: Arc<Registry>,
        config: &ChannelConfig,
        span: tracing::Span,
    ) -> Self {
        let shared = Arc::new(Shared { registry, callback: RwLock::new(None), pending: Mutex::default() });
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_capacity.clamp(1, MAX_OUTBOUND_CAPACITY));
        let cancel = CancellationToken::new();

        let task = tokio::spawn(
            session_task(transport, outbound_rx, Arc::clone(&shared), cancel.clone(), config.poll_timeout())
                .instrument(span),
        );

        Self {
            shared,
            outbound: outbound_tx,
            next_req_id: tokio::sync::Mutex::new(0),
            cancel,
            task: Mutex::new(Some(task)),
            close_timeout: config.close_timeout(),
        }
    }

    /// Register the callback invoked for every update, replacing any previous one.
    pub fn set_callback(&self, callback: impl Fn(ChannelEvent) + Send + Sync + 'static) {
        *self.shared.callback.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
    }

    /// Tag `request` with the next request id and queue it.
    ///
    /// Ids start at 1 and increase strictly in transmission order.
    pub async fn send(&self, request: Request) -> Result<u64> {
        if self.cancel.is_cancelled() {
            return Err(LinkError::not_connected("sending a request"));
        }
        let kind = request.action.kind();

        let mut next = self.next_req_id.lock().await;
        let req_id = *next + 1;
        let text = serde_json::to_string(&request.with_req_id(req_id))?;
        self.shared.pending().insert(req_id, PendingRequest::new(req_id, kind));
        if self.outbound.send(text).await.is_err() {
            self.shared.pending().remove(&req_id);
            return Err(LinkError::not_connected("sending a request"));
        }
        *next = req_id;
        trace!(req_id, ?kind, "Request queued");
        Ok(req_id)
    }

    /// Subscribe to value updates for datarefs.
    ///
    /// Names may carry an array index (`sim/x/values[4]`). Names the simulator
    /// does not know are skipped with a warning. Returns `None` if nothing was
    /// left to subscribe.
    pub async fn subscribe_datarefs<S: AsRef<str>>(&self, names: &[S]) -> Result<Option<u64>> {
        let params = self.dataref_params(names, true).await?;
        if params.is_empty() {
            return Ok(None);
        }
        self.send(Request::subscribe_datarefs(params)).await.map(Some)
    }

    /// Stop value updates for datarefs.
    pub async fn unsubscribe_datarefs<S: AsRef<str>>(&self, names: &[S]) -> Result<Option<u64>> {
        let params = self.dataref_params(names, false).await?;
        if params.is_empty() {
            return Ok(None);
        }
        self.send(Request::unsubscribe_datarefs(params)).await.map(Some)
    }

    /// Subscribe to activity updates for commands.
    pub async fn subscribe_commands<S: AsRef<str>>(&self, names: &[S]) -> Result<Option<u64>> {
        let ids = self.command_ids(names).await?;
        if ids.is_empty() {
            return Ok(None);
        }
        self.send(Request::subscribe_commands(ids)).await.map(Some)
    }

    pub async fn unsubscribe_commands<S: AsRef<str>>(&self, names: &[S]) -> Result<Option<u64>> {
        let ids = self.command_ids(names).await?;
        if ids.is_empty() {
            return Ok(None);
        }
        self.send(Request::unsubscribe_commands(ids)).await.map(Some)
    }

    /// Write a dataref, or one element of an array dataref (`sim/x/values[4]`).
    pub async fn set_dataref(&self, name: &str, value: Value) -> Result<u64> {
        let (path, index) = parse_dataref_path(name);
        let entry = self.shared.registry.resolve_dataref(path).await?.ok_or_else(|| LinkError::dataref_miss(path))?;
        if !entry.is_writable() {
            debug!(dataref = path, "Writing a dataref listed as read-only");
        }
        self.send(Request::set_datarefs(vec![DatarefParam::set(entry.id(), index, value.to_json())])).await
    }

    /// Press (`true`) or release (`false`) a command.
    pub async fn set_command_active(&self, name: &str, active: bool) -> Result<u64> {
        let command = self.shared.registry.resolve_command(name).await?.ok_or_else(|| LinkError::command_miss(name))?;
        self.send(Request::set_command_active(command.id(), active)).await
    }

    /// Run a command for `duration` seconds; zero is a single press.
    pub async fn activate_command(&self, name: &str, duration: f64) -> Result<u64> {
        let command = self.shared.registry.resolve_command(name).await?.ok_or_else(|| LinkError::command_miss(name))?;
        self.send(Request::activate_command(command.id(), duration)).await
    }

    /// Requests not yet acknowledged, oldest first.
    pub fn pending_requests(&self) -> Vec<PendingRequest> {
        let mut pending: Vec<_> = self.shared.pending().values().cloned().collect();
        pending.sort_by_key(|p| p.req_id);
        pending
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.shared.registry
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the session has ended, by close or by end of stream.
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }

    /// Stop the session and wait for its task, bounded by the close timeout.
    pub async fn close(&self) {
        self.cancel.cancel();
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            match tokio::time::timeout(self.close_timeout, task).await {
                Ok(_) => debug!("Channel session joined"),
                Err(_) => warn!("Channel session did not stop within {:?}", self.close_timeout),
            }
        }
    }

    /// Resolve names into request parameters, registering or releasing array indices.
    async fn dataref_params<S: AsRef<str>>(&self, names: &[S], subscribe: bool) -> Result<Vec<DatarefParam>> {
        // id -> indices named in this request, None for the whole dataref
        let mut grouped: BTreeMap<i64, Option<Vec<u32>>> = BTreeMap::new();
        for name in names {
            let (path, index) = parse_dataref_path(name.as_ref());
            let Some(entry) = self.shared.registry.resolve_dataref(path).await? else {
                warn!("Dataref {} not found in simulator", path);
                continue;
            };
            match index {
                Some(index) if index > MAX_ARRAY_INDEX => {
                    warn!(dataref = path, index, max = MAX_ARRAY_INDEX, "Array index out of range, skipping");
                }
                Some(index) if entry.value_type().is_array() => {
                    if subscribe {
                        entry.append_index(index);
                    } else {
                        entry.remove_index(index);
                    }
                    if let Some(indices) = grouped.entry(entry.id()).or_insert_with(|| Some(Vec::new())) {
                        indices.push(index);
                    }
                }
                Some(index) => {
                    warn!(dataref = path, index, "Index given for a scalar dataref, using whole value");
                    grouped.insert(entry.id(), None);
                }
                None => {
                    grouped.insert(entry.id(), None);
                }
            }
        }
        Ok(grouped
            .into_iter()
            .map(|(id, indices)| match indices {
                Some(indices) => DatarefParam::indices(id, indices),
                None => DatarefParam::whole(id),
            })
            .collect())
    }

    async fn command_ids<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<i64>> {
        let mut ids = Vec::with_capacity(names.len());
        for name in names {
            match self.shared.registry.resolve_command(name.as_ref()).await? {
                Some(command) => ids.push(command.id()),
                None => warn!("Command {} not found in simulator", name.as_ref()),
            }
        }
        Ok(ids)
    }
}

impl Drop for SubscriptionChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Session task: owns the transport until cancelled or the stream ends.
async fn session_task<T: Transport>(
    mut transport: T,
    mut outbound: mpsc::Receiver<String>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    poll: Duration,
) {
    info!("Channel session started");
    let mut received = 0u64;
    let mut idle_polls = 0u64;
    const IDLE_DEBUG_EVERY: u64 = 10;
    const IDLE_INFO_EVERY: u64 = 50;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Channel session cancelled");
                break;
            }
            Some(text) = outbound.recv() => {
                trace!(len = text.len(), "Sending request");
                if let Err(e) = transport.send(text).await {
                    warn!("Send failed, ending session: {}", e);
                    break;
                }
            }
            result = tokio::time::timeout(poll, transport.recv()) => match result {
                Err(_) => {
                    idle_polls += 1;
                    if idle_polls % IDLE_INFO_EVERY == 0 {
                        info!("Waiting for data from simulator");
                    } else if idle_polls % IDLE_DEBUG_EVERY == 0 {
                        debug!("Waiting for data from simulator");
                    }
                }
                Ok(Ok(Some(text))) => {
                    if received == 0 {
                        debug!("First message received");
                    }
                    received += 1;
                    shared.dispatch(&text);
                }
                Ok(Ok(None)) => {
                    info!("Simulator closed the stream");
                    break;
                }
                Ok(Err(e @ LinkError::Decode { .. })) => {
                    warn!("Dropping undecodable message: {}", e);
                }
                Ok(Err(e)) => {
                    warn!("Receive failed, ending session: {}", e);
                    break;
                }
            }
        }
    }

    if let Err(e) = transport.close().await {
        debug!("Transport close failed: {}", e);
    }
    let dropped = {
        let mut pending = shared.pending();
        let count = pending.len();
        pending.clear();
        count
    };
    cancel.cancel();
    info!(received, dropped_pending = dropped, "Channel session ended");
}
