//! Connection supervisor: finds the simulator and keeps watching it
//!
//! The supervisor runs one background loop per `connect()`:
//!
//! ```text
//!            connect()              beacon heard
//!   Idle ─────────────▶ Searching ───────────────▶ Connected
//!    ▲                      ▲                          │
//!    │ disconnect()         └──── beacon lost ─────────┘
//!    └──────────────────────────────────────────────────
//! ```
//!
//! Transitions into and out of `Connected` are reported through the
//! connectivity callback with `true`/`false`. The callback runs on the loop
//! task and must not block.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, trace, warn};

use crate::beacon::Discovery;
use crate::config::{LinkConfig, SupervisorConfig};
use crate::types::{BeaconRecord, ConnectionStatus};
use crate::LinkError;

/// Connectivity callback, called with `true` on connect and `false` on loss.
pub type ConnectivityCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// State written by the loop and read by anyone.
struct State {
    status: AtomicU8,
    beacon: RwLock<Option<BeaconRecord>>,
    callback: ConnectivityCallback,
}

impl State {
    fn status(&self) -> ConnectionStatus {
        ConnectionStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn set_beacon(&self, beacon: Option<BeaconRecord>) {
        *self.beacon.write().unwrap_or_else(PoisonError::into_inner) = beacon;
    }

    fn beacon(&self) -> Option<BeaconRecord> {
        self.beacon.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Move to `Connected`; true if this was a transition.
    fn mark_connected(&self) -> bool {
        self.status.swap(ConnectionStatus::Connected as u8, Ordering::AcqRel) != ConnectionStatus::Connected as u8
    }

    /// Move `Connected` to `Searching`; true if this was a transition.
    fn mark_lost(&self) -> bool {
        self.status
            .compare_exchange(
                ConnectionStatus::Connected as u8,
                ConnectionStatus::Searching as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Move to `Idle`, reporting loss exactly once if connected.
    fn stop(&self) {
        self.set_beacon(None);
        let previous = self.status.swap(ConnectionStatus::Idle as u8, Ordering::AcqRel);
        if previous == ConnectionStatus::Connected as u8 {
            (self.callback)(false);
        }
    }
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Long-lived discovery and liveness loop for one simulator.
pub struct ConnectionSupervisor {
    discovery: Arc<dyn Discovery>,
    discovery_timeout: Duration,
    config: SupervisorConfig,
    state: Arc<State>,
    running: Mutex<Option<Running>>,
    loops_started: AtomicUsize,
    span: tracing::Span,
}

impl std::fmt::Debug for ConnectionSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSupervisor")
            .field("status", &self.state.status())
            .field("beacon", &self.state.beacon())
            .finish()
    }
}

impl ConnectionSupervisor {
    pub fn new(
        discovery: Arc<dyn Discovery>,
        config: &LinkConfig,
        callback: impl Fn(bool) + Send + Sync + 'static,
    ) -> Self {
        Self {
            discovery,
            discovery_timeout: config.discovery.timeout(),
            config: config.supervisor.clone(),
            state: Arc::new(State {
                status: AtomicU8::new(ConnectionStatus::Idle as u8),
                beacon: RwLock::new(None),
                callback: Arc::new(callback),
            }),
            running: Mutex::new(None),
            loops_started: AtomicUsize::new(0),
            span: info_span!("supervisor"),
        }
    }

    /// Log the loop inside `span` instead of the default `supervisor` span.
    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }

    /// Start the loop. Calling this while the loop runs does nothing.
    pub fn connect(&self) {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(current) = running.as_ref()
            && !current.task.is_finished()
        {
            debug!("Supervisor loop already started");
            return;
        }

        let cancel = CancellationToken::new();
        self.state.status.store(ConnectionStatus::Searching as u8, Ordering::Release);
        let task = tokio::spawn(
            supervise(
                Arc::clone(&self.discovery),
                Arc::clone(&self.state),
                self.config.clone(),
                self.discovery_timeout,
                cancel.clone(),
            )
            .instrument(self.span.clone()),
        );
        *running = Some(Running { cancel, task });
        self.loops_started.fetch_add(1, Ordering::AcqRel);
        debug!("Supervisor loop started");
    }

    /// Stop the loop and wait for it, bounded by the join timeout.
    ///
    /// Reports `false` through the callback if a simulator was connected.
    pub async fn disconnect(&self) {
        let running = self.running.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(Running { cancel, task }) = running else {
            debug!("Supervisor loop not running");
            self.state.stop();
            return;
        };

        debug!("Stopping supervisor loop");
        cancel.cancel();
        let join_timeout = self.config.join_timeout();
        if tokio::time::timeout(join_timeout, task).await.is_err() {
            warn!("Supervisor loop did not stop within {:?}, continuing", join_timeout);
        }
        self.state.stop();
        debug!("Supervisor disconnected");
    }

    /// Whether a simulator beacon is current.
    pub fn is_connected(&self) -> bool {
        self.state.status() == ConnectionStatus::Connected
    }

    pub(crate) fn status(&self) -> ConnectionStatus {
        self.state.status()
    }

    /// Beacon of the connected simulator.
    pub fn beacon(&self) -> Option<BeaconRecord> {
        self.state.beacon()
    }

    /// Number of loops started over the supervisor's lifetime.
    #[cfg(test)]
    pub(crate) fn loops_started(&self) -> usize {
        self.loops_started.load(Ordering::Acquire)
    }
}

impl Drop for ConnectionSupervisor {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().unwrap_or_else(PoisonError::into_inner).take() {
            running.cancel.cancel();
        }
    }
}

async fn supervise(
    discovery: Arc<dyn Discovery>,
    state: Arc<State>,
    config: SupervisorConfig,
    timeout: Duration,
    cancel: CancellationToken,
) {
    let mut failures: u64 = 0;
    let warn_every = u64::from(config.warn_every.max(1));

    loop {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = discovery.discover(timeout) => result,
        };

        match result {
            Ok(beacon) => {
                failures = 0;
                let previous = state.beacon();
                state.set_beacon(Some(beacon.clone()));

                if state.mark_connected() {
                    info!(ip = %beacon.ip, port = beacon.port, hostname = %beacon.hostname, "Connected to X-Plane {}", beacon.version);
                    check_version(&beacon, &config);
                    (state.callback)(true);
                } else if previous.as_ref().is_some_and(|p| p.ip != beacon.ip || p.port != beacon.port) {
                    // Same status, different simulator: observers must rebind
                    info!(ip = %beacon.ip, port = beacon.port, "X-Plane moved to a new host");
                    (state.callback)(false);
                    (state.callback)(true);
                } else {
                    trace!("X-Plane still announcing");
                }
            }
            Err(e) => {
                state.set_beacon(None);
                if state.mark_lost() {
                    warn!("Lost X-Plane beacon: {}", e);
                    (state.callback)(false);
                }
                match e {
                    LinkError::VersionNotSupported { .. } => error!("X-Plane version not supported: {}", e),
                    e if e.is_not_found() => {
                        if failures % warn_every == 0 {
                            error!(attempt = failures + 1, "X-Plane instance not found on local network");
                        } else {
                            debug!(attempt = failures + 1, "X-Plane instance not found");
                        }
                        failures += 1;
                    }
                    e => {
                        if failures % warn_every == 0 {
                            error!(attempt = failures + 1, "Discovery failed: {}", e);
                        }
                        failures += 1;
                    }
                }
            }
        }

        let wait = if state.status() == ConnectionStatus::Connected {
            config.monitor_interval()
        } else {
            config.retry_interval()
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }
        trace!("Next discovery attempt");
    }

    state.stop();
    debug!("Supervisor loop ended");
}

/// Warn when the simulator is outside the supported version window.
/// Returns whether it is inside.
fn check_version(beacon: &BeaconRecord, config: &SupervisorConfig) -> bool {
    if beacon.version_within(config.min_version, config.max_version) {
        debug!("X-Plane version {} within {}..={}", beacon.version, config.min_version, config.max_version);
        return true;
    }
    let (bound, limit) =
        if beacon.version < config.min_version { ("minimal", config.min_version) } else { ("maximal", config.max_version) };
    warn!(
        "X-Plane version {} detected, {} version is {}; some features may not work",
        beacon.version, bound, limit
    );
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{Outcome, ScriptedDiscovery, beacon_record};
    use std::sync::Mutex as StdMutex;

    fn fast_config() -> LinkConfig {
        let mut config = LinkConfig::default();
        config.discovery.timeout_secs = 0.05;
        config.supervisor.retry_interval_secs = 0.01;
        config.supervisor.monitor_interval_secs = 0.01;
        config.supervisor.join_timeout_secs = 1.0;
        config
    }

    fn recorder() -> (Arc<StdMutex<Vec<bool>>>, impl Fn(bool) + Send + Sync + 'static) {
        let events = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        (events, move |connected| sink.lock().unwrap().push(connected))
    }

    async fn wait_for(events: &Arc<StdMutex<Vec<bool>>>, len: usize) {
        for _ in 0..200 {
            if events.lock().unwrap().len() >= len {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {} events, got {:?}", len, events.lock().unwrap());
    }

    #[tokio::test]
    async fn connects_after_failed_attempts() {
        let _ = tracing_subscriber::fmt::try_init();
        let discovery = Arc::new(
            ScriptedDiscovery::new()
                .then(Outcome::NotFound)
                .then(Outcome::NotFound)
                .otherwise(Outcome::Found(beacon_record([127, 0, 0, 1], 121400))),
        );
        let (events, callback) = recorder();
        let supervisor = ConnectionSupervisor::new(discovery.clone(), &fast_config(), callback);

        supervisor.connect();
        wait_for(&events, 1).await;

        assert!(supervisor.is_connected());
        assert_eq!(supervisor.beacon().unwrap().version, 121400);
        assert!(discovery.calls() >= 3);
        supervisor.disconnect().await;
        assert_eq!(*events.lock().unwrap(), vec![true, false]);
        assert_eq!(supervisor.status(), ConnectionStatus::Idle);
    }

    #[tokio::test]
    async fn connect_twice_runs_one_loop() {
        let discovery = Arc::new(ScriptedDiscovery::new());
        let (_events, callback) = recorder();
        let supervisor = ConnectionSupervisor::new(discovery, &fast_config(), callback);

        supervisor.connect();
        supervisor.connect();
        assert_eq!(supervisor.loops_started(), 1);
        assert_eq!(supervisor.status(), ConnectionStatus::Searching);

        supervisor.disconnect().await;
        supervisor.connect();
        assert_eq!(supervisor.loops_started(), 2);
        supervisor.disconnect().await;
    }

    #[tokio::test]
    async fn lost_beacon_reports_false_then_recovers() {
        let record = beacon_record([127, 0, 0, 1], 121400);
        let discovery = Arc::new(ScriptedDiscovery::new().otherwise(Outcome::Found(record.clone())));
        let (events, callback) = recorder();
        let supervisor = ConnectionSupervisor::new(discovery.clone(), &fast_config(), callback);

        supervisor.connect();
        wait_for(&events, 1).await;

        discovery.set_fallback(Outcome::NotFound);
        wait_for(&events, 2).await;
        assert!(!supervisor.is_connected());
        assert!(supervisor.beacon().is_none());

        discovery.set_fallback(Outcome::Found(record));
        wait_for(&events, 3).await;
        assert_eq!(*events.lock().unwrap(), vec![true, false, true]);
        supervisor.disconnect().await;
    }

    #[tokio::test]
    async fn unsupported_version_clears_beacon() {
        let discovery = Arc::new(
            ScriptedDiscovery::new()
                .then(Outcome::Found(beacon_record([127, 0, 0, 1], 121400)))
                .otherwise(Outcome::Unsupported),
        );
        let (events, callback) = recorder();
        let supervisor = ConnectionSupervisor::new(discovery, &fast_config(), callback);

        supervisor.connect();
        wait_for(&events, 2).await;

        assert_eq!(*events.lock().unwrap(), vec![true, false]);
        assert!(supervisor.beacon().is_none());
        assert_eq!(supervisor.status(), ConnectionStatus::Searching);
        supervisor.disconnect().await;
    }

    #[tokio::test]
    async fn host_change_reports_reconnect() {
        let discovery = Arc::new(
            ScriptedDiscovery::new()
                .then(Outcome::Found(beacon_record([10, 0, 0, 1], 121400)))
                .otherwise(Outcome::Found(beacon_record([10, 0, 0, 2], 121400))),
        );
        let (events, callback) = recorder();
        let supervisor = ConnectionSupervisor::new(discovery, &fast_config(), callback);

        supervisor.connect();
        wait_for(&events, 3).await;

        assert_eq!(events.lock().unwrap()[..3], [true, false, true]);
        assert_eq!(supervisor.beacon().unwrap().ip.to_string(), "10.0.0.2");
        supervisor.disconnect().await;
    }

    #[tokio::test]
    async fn disconnect_interrupts_retry_wait() {
        let mut config = fast_config();
        config.supervisor.retry_interval_secs = 60.0;
        let (events, callback) = recorder();
        let supervisor = ConnectionSupervisor::new(Arc::new(ScriptedDiscovery::new()), &config, callback);

        supervisor.connect();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = std::time::Instant::now();
        supervisor.disconnect().await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(events.lock().unwrap().is_empty());
    }

    #[test]
    fn version_window_is_inclusive() {
        let config = LinkConfig::default().supervisor;
        assert!(check_version(&beacon_record([127, 0, 0, 1], 121100), &config));
        assert!(check_version(&beacon_record([127, 0, 0, 1], 121499), &config));
        assert!(!check_version(&beacon_record([127, 0, 0, 1], 121099), &config));
        assert!(!check_version(&beacon_record([127, 0, 0, 1], 121500), &config));
    }

    #[tokio::test]
    async fn out_of_window_version_still_connects() {
        let discovery = Arc::new(ScriptedDiscovery::new().otherwise(Outcome::Found(beacon_record([127, 0, 0, 1], 120000))));
        let (events, callback) = recorder();
        let supervisor = ConnectionSupervisor::new(discovery, &fast_config(), callback);

        supervisor.connect();
        wait_for(&events, 1).await;
        assert!(supervisor.is_connected());
        supervisor.disconnect().await;
    }

    #[tokio::test]
    async fn disconnect_without_connect_is_quiet() {
        let (events, callback) = recorder();
        let supervisor = ConnectionSupervisor::new(Arc::new(ScriptedDiscovery::new()), &fast_config(), callback);
        supervisor.disconnect().await;
        assert!(events.lock().unwrap().is_empty());
        assert_eq!(supervisor.status(), ConnectionStatus::Idle);
    }
}
