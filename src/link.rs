//! Simulator link: discovery, session management and monitoring in one place
//!
//! [`SimulatorLink`] owns a [`ConnectionSupervisor`] and reacts to its
//! connectivity changes from a single link task:
//!
//! - simulator found: open an [`Endpoint`] for the beacon, point the registry
//!   at its directory (discarding ids from any previous session), start a
//!   [`SubscriptionChannel`] and subscribe every monitored name again
//! - simulator lost: close the channel
//! - channel ended while the simulator is still announcing: reopen after the
//!   retry interval
//!
//! Monitored names are reference counted, so several consumers can ask for
//! the same dataref and it stays subscribed until the last one releases it.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::beacon::{BeaconListener, Discovery};
use crate::config::{ApiConfig, LinkConfig};
use crate::connection::{
    ChannelEvent, ConnectionSupervisor, ConnectivityCallback, EventCallback, SubscriptionChannel,
};
use crate::instruction::InstructionTable;
use crate::registry::{Directory, Registry};
use crate::rest::RestClient;
use crate::transport::{Transport, WebSocketTransport};
use crate::types::{BeaconRecord, local_addresses};
use crate::{LinkError, Result};

/// Everything needed to talk to one simulator session.
pub struct Endpoint {
    /// Name lookup for the registry
    pub directory: Arc<dyn Directory>,
    /// Stream for the subscription channel
    pub transport: Box<dyn Transport>,
}

/// Opens sessions to a discovered simulator.
#[async_trait::async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, beacon: &BeaconRecord) -> Result<Endpoint>;
}

/// Connector for the X-Plane web API: REST directory plus WebSocket stream.
#[derive(Debug, Clone)]
pub struct WebApiConnector {
    api: ApiConfig,
    local: Vec<IpAddr>,
}

impl WebApiConnector {
    pub fn new(api: &ApiConfig) -> Self {
        Self { api: api.clone(), local: local_addresses() }
    }
}

#[async_trait::async_trait]
impl Connector for WebApiConnector {
    async fn connect(&self, beacon: &BeaconRecord) -> Result<Endpoint> {
        let client = RestClient::for_beacon(beacon, &self.local, &self.api).await?;
        let transport = WebSocketTransport::connect(&client.websocket_url()).await?;
        Ok(Endpoint { directory: Arc::new(client), transport: Box::new(transport) })
    }
}

/// Per-name monitor counts.
#[derive(Debug, Default)]
struct Monitors {
    counts: BTreeMap<String, usize>,
}

impl Monitors {
    /// Count one more consumer per name; returns names that were not monitored before.
    fn acquire<S: AsRef<str>>(&mut self, names: &[S]) -> Vec<String> {
        let mut added = Vec::new();
        for name in names {
            let name = name.as_ref();
            let count = self.counts.entry(name.to_string()).or_insert(0);
            *count += 1;
            if *count == 1 {
                added.push(name.to_string());
            }
        }
        added
    }

    /// Count one consumer less per name; returns names no longer monitored.
    fn release<S: AsRef<str>>(&mut self, names: &[S]) -> Vec<String> {
        let mut released = Vec::new();
        for name in names {
            let name = name.as_ref();
            match self.counts.get_mut(name) {
                None => warn!("{} is not monitored", name),
                Some(count) => {
                    *count -= 1;
                    if *count == 0 {
                        self.counts.remove(name);
                        released.push(name.to_string());
                    }
                }
            }
        }
        released
    }

    fn count(&self, name: &str) -> usize {
        self.counts.get(name).copied().unwrap_or(0)
    }

    fn names(&self) -> Vec<String> {
        self.counts.keys().cloned().collect()
    }
}

enum Session {
    Down,
    Up(Arc<SubscriptionChannel>),
    RetryAt(Instant),
}

struct Inner {
    supervisor: ConnectionSupervisor,
    connector: Arc<dyn Connector>,
    registry: Arc<Registry>,
    config: LinkConfig,
    channel: RwLock<Option<Arc<SubscriptionChannel>>>,
    datarefs: Mutex<Monitors>,
    commands: Mutex<Monitors>,
    events: tokio::sync::Mutex<mpsc::UnboundedReceiver<bool>>,
    callback: Arc<RwLock<Option<EventCallback>>>,
    connectivity: RwLock<Option<ConnectivityCallback>>,
}

impl Inner {
    fn channel(&self) -> Option<Arc<SubscriptionChannel>> {
        self.channel.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn datarefs(&self) -> MutexGuard<'_, Monitors> {
        self.datarefs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn commands(&self) -> MutexGuard<'_, Monitors> {
        self.commands.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, connected: bool) {
        let callback = self.connectivity.read().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(callback) = callback {
            callback(connected);
        }
    }

    fn retry_later(&self) -> Session {
        Session::RetryAt(Instant::now() + self.config.supervisor.retry_interval())
    }

    async fn close_channel(&self) {
        let channel = self.channel.write().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(channel) = channel {
            channel.close().await;
            info!("Session closed");
        }
    }

    async fn open_session(&self) -> Session {
        self.close_channel().await;
        let Some(beacon) = self.supervisor.beacon() else {
            debug!("Beacon gone before the session opened");
            return Session::Down;
        };

        let endpoint = match self.connector.connect(&beacon).await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                warn!(
                    ip = %beacon.ip,
                    "Cannot open session: {}; retrying in {:?}",
                    e,
                    self.config.supervisor.retry_interval()
                );
                return self.retry_later();
            }
        };

        self.registry.rebind(endpoint.directory);
        let channel = Arc::new(SubscriptionChannel::open_in(
            endpoint.transport,
            Arc::clone(&self.registry),
            &self.config.channel,
            info_span!("channel", host = %beacon.ip),
        ));
        let slot = Arc::clone(&self.callback);
        channel.set_callback(move |event| {
            let callback = slot.read().unwrap_or_else(PoisonError::into_inner).clone();
            if let Some(callback) = callback {
                callback(event);
            }
        });
        *self.channel.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&channel));

        self.resubscribe(&channel).await;
        info!(ip = %beacon.ip, port = beacon.port, hostname = %beacon.hostname, "Session open");
        Session::Up(channel)
    }

    async fn resubscribe(&self, channel: &SubscriptionChannel) {
        let datarefs = self.datarefs().names();
        if !datarefs.is_empty() {
            match channel.subscribe_datarefs(&datarefs).await {
                Ok(req_id) => debug!(?req_id, count = datarefs.len(), "Datarefs subscribed"),
                Err(e) => warn!("Could not subscribe monitored datarefs: {}", e),
            }
        }
        let commands = self.commands().names();
        if !commands.is_empty() {
            match channel.subscribe_commands(&commands).await {
                Ok(req_id) => debug!(?req_id, count = commands.len(), "Commands subscribed"),
                Err(e) => warn!("Could not subscribe monitored commands: {}", e),
            }
        }
    }
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Connection to whichever X-Plane instance announces itself.
pub struct SimulatorLink {
    inner: Arc<Inner>,
    running: Mutex<Option<Running>>,
}

impl std::fmt::Debug for SimulatorLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatorLink")
            .field("status", &self.inner.supervisor.status())
            .field("session", &self.inner.channel().is_some())
            .field("monitored", &self.inner.datarefs().counts.len())
            .finish()
    }
}

impl SimulatorLink {
    /// Link using multicast beacon discovery and the web API.
    ///
    /// # Errors
    ///
    /// [`LinkError::Config`] if `config` does not pass [`LinkConfig::validate`].
    pub fn new(config: LinkConfig) -> Result<Self> {
        config.validate()?;
        let discovery = Arc::new(BeaconListener::new(&config.discovery));
        let connector = Arc::new(WebApiConnector::new(&config.api));
        Self::with_parts(discovery, connector, config)
    }

    /// Link over caller-supplied discovery and connector.
    pub fn with_parts(
        discovery: Arc<dyn Discovery>,
        connector: Arc<dyn Connector>,
        config: LinkConfig,
    ) -> Result<Self> {
        config.validate()?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let supervisor = ConnectionSupervisor::new(discovery, &config, move |connected| {
            let _ = events_tx.send(connected);
        });
        Ok(Self {
            inner: Arc::new(Inner {
                supervisor,
                connector,
                registry: Arc::new(Registry::unbound()),
                config,
                channel: RwLock::new(None),
                datarefs: Mutex::default(),
                commands: Mutex::default(),
                events: tokio::sync::Mutex::new(events_rx),
                callback: Arc::new(RwLock::new(None)),
                connectivity: RwLock::new(None),
            }),
            running: Mutex::new(None),
        })
    }

    /// Register the callback for dataref and command updates.
    pub fn set_callback(&self, callback: impl Fn(ChannelEvent) + Send + Sync + 'static) {
        *self.inner.callback.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
    }

    /// Register the callback for simulator visibility changes.
    pub fn on_connectivity(&self, callback: impl Fn(bool) + Send + Sync + 'static) {
        *self.inner.connectivity.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
    }

    /// Start discovery and the link task. Does nothing if already started.
    pub fn start(&self) {
        self.inner.supervisor.connect();
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(current) = running.as_ref()
            && !current.task.is_finished()
        {
            debug!("Link already started");
            return;
        }
        let cancel = CancellationToken::new();
        let task = tokio::spawn(link_task(Arc::clone(&self.inner), cancel.clone()).instrument(info_span!("link")));
        *running = Some(Running { cancel, task });
        info!("Link started");
    }

    /// Stop discovery, close the session and wait for the link task.
    pub async fn stop(&self) {
        self.inner.supervisor.disconnect().await;
        let running = self.running.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(Running { cancel, task }) = running {
            cancel.cancel();
            let join_timeout = self.inner.config.supervisor.join_timeout();
            if tokio::time::timeout(join_timeout, task).await.is_err() {
                warn!("Link task did not stop within {:?}", join_timeout);
            }
        }
        self.inner.close_channel().await;
        info!("Link stopped");
    }

    /// Keep datarefs subscribed, across reconnects, until released.
    ///
    /// Returns the subscribe request id when a session is open and a name
    /// was not monitored yet.
    pub async fn monitor<S: AsRef<str>>(&self, names: &[S]) -> Result<Option<u64>> {
        let added = self.inner.datarefs().acquire(names);
        match self.inner.channel() {
            Some(channel) if !added.is_empty() => channel.subscribe_datarefs(&added).await,
            _ => Ok(None),
        }
    }

    /// Release datarefs; the last release unsubscribes.
    pub async fn unmonitor<S: AsRef<str>>(&self, names: &[S]) -> Result<Option<u64>> {
        let released = self.inner.datarefs().release(names);
        match self.inner.channel() {
            Some(channel) if !released.is_empty() => channel.unsubscribe_datarefs(&released).await,
            _ => Ok(None),
        }
    }

    /// Keep command activity subscribed until released.
    pub async fn monitor_commands<S: AsRef<str>>(&self, names: &[S]) -> Result<Option<u64>> {
        let added = self.inner.commands().acquire(names);
        match self.inner.channel() {
            Some(channel) if !added.is_empty() => channel.subscribe_commands(&added).await,
            _ => Ok(None),
        }
    }

    pub async fn unmonitor_commands<S: AsRef<str>>(&self, names: &[S]) -> Result<Option<u64>> {
        let released = self.inner.commands().release(names);
        match self.inner.channel() {
            Some(channel) if !released.is_empty() => channel.unsubscribe_commands(&released).await,
            _ => Ok(None),
        }
    }

    /// Number of consumers monitoring a dataref.
    pub fn monitor_count(&self, name: &str) -> usize {
        self.inner.datarefs().count(name)
    }

    pub fn is_monitored(&self, name: &str) -> bool {
        self.monitor_count(name) > 0
    }

    /// Run a named instruction on the current session.
    pub async fn execute(&self, table: &InstructionTable, name: &str) -> Result<Vec<u64>> {
        let channel = self.channel().ok_or_else(|| LinkError::not_connected(format!("executing {}", name)))?;
        table.execute(name, &channel).await
    }

    /// Channel of the current session.
    pub fn channel(&self) -> Option<Arc<SubscriptionChannel>> {
        self.inner.channel()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    pub fn is_connected(&self) -> bool {
        self.inner.supervisor.is_connected()
    }

    pub fn beacon(&self) -> Option<BeaconRecord> {
        self.inner.supervisor.beacon()
    }
}

impl Drop for SimulatorLink {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().unwrap_or_else(PoisonError::into_inner).take() {
            running.cancel.cancel();
        }
    }
}

async fn channel_ended(channel: Option<&SubscriptionChannel>) {
    match channel {
        Some(channel) => channel.closed().await,
        None => std::future::pending().await,
    }
}

async fn retry_due(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn link_task(inner: Arc<Inner>, cancel: CancellationToken) {
    let mut events = inner.events.lock().await;
    let mut session = Session::Down;

    loop {
        let channel = match &session {
            Session::Up(channel) => Some(Arc::clone(channel)),
            _ => None,
        };
        let retry_at = match &session {
            Session::RetryAt(at) => Some(*at),
            _ => None,
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(true) => {
                    session = inner.open_session().await;
                    inner.notify(true);
                }
                Some(false) => {
                    inner.close_channel().await;
                    session = Session::Down;
                    inner.notify(false);
                }
                None => break,
            },
            _ = channel_ended(channel.as_deref()) => {
                inner.close_channel().await;
                session = if inner.supervisor.is_connected() {
                    warn!(
                        "Session ended while X-Plane is still announcing, reopening in {:?}",
                        inner.config.supervisor.retry_interval()
                    );
                    inner.retry_later()
                } else {
                    Session::Down
                };
            }
            _ = retry_due(retry_at) => {
                session = if inner.supervisor.is_connected() { inner.open_session().await } else { Session::Down };
            }
        }
    }

    inner.close_channel().await;
    while let Ok(connected) = events.try_recv() {
        inner.notify(connected);
    }
    debug!("Link task ended");
}
