//! UDP session with one simulator

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, trace, warn};

use super::packet::{DrefValue, DrefWrite, MAX_DATAGRAM_LEN, RrefRequest, decode_values, encode_command};
use crate::config::UdpConfig;
use crate::connection::{ChannelEvent, EventCallback};
use crate::types::{BeaconRecord, Value, ValueType, VariableEntry};
use crate::{LinkError, Result};

/// Command names that stand for "do nothing" and are never sent.
pub const PLACEHOLDER_COMMANDS: &[&str] = &["none", "noop", "no-operation", "no-command", "do-nothing", "placeholder"];

/// Subscribe requests sent back to back before pausing.
const SUBSCRIBE_BURST: usize = 100;
const SUBSCRIBE_PAUSE: Duration = Duration::from_millis(200);

#[derive(Default)]
struct Subscriptions {
    next_index: i32,
    by_index: HashMap<i32, Arc<VariableEntry>>,
    by_name: HashMap<String, i32>,
}

struct Shared {
    subscriptions: Mutex<Subscriptions>,
    callback: RwLock<Option<EventCallback>>,
}

impl Shared {
    fn subscriptions(&self) -> MutexGuard<'_, Subscriptions> {
        self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store received values; entries whose value changed are reported in wire order.
    fn apply(&self, values: &[(i32, f32)]) {
        let changed: Vec<Arc<VariableEntry>> = {
            let subscriptions = self.subscriptions();
            values
                .iter()
                .filter_map(|(index, value)| {
                    let Some(entry) = subscriptions.by_index.get(index) else {
                        trace!(index, "Value for an index no longer subscribed");
                        return None;
                    };
                    let value = f64::from(*value);
                    if entry.update_count() > 0 && entry.value().as_f64() == Some(value) {
                        return None;
                    }
                    match entry.apply_update(&serde_json::json!(value)) {
                        Ok(()) => Some(Arc::clone(entry)),
                        Err(e) => {
                            warn!(dataref = entry.name(), "{}", e);
                            None
                        }
                    }
                })
                .collect()
        };

        let callback = self.callback.read().unwrap_or_else(PoisonError::into_inner).clone();
        for entry in changed {
            match &callback {
                Some(callback) => callback(ChannelEvent::Dataref(entry)),
                None => trace!("No callback registered for {}", entry.name()),
            }
        }
    }
}

/// Dataref values, writes and commands over the simulator's UDP port.
///
/// Values arrive as 32-bit floats at the requested frequency; the callback
/// fires only when a value changes.
pub struct UdpChannel {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    shared: Arc<Shared>,
    frequency: u32,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    close_timeout: Duration,
}

impl std::fmt::Debug for UdpChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpChannel")
            .field("peer", &self.peer)
            .field("closed", &self.cancel.is_cancelled())
            .field("subscribed", &self.shared.subscriptions().by_name.len())
            .finish()
    }
}

impl UdpChannel {
    /// Open a session with the simulator behind `beacon`.
    pub async fn open(beacon: &BeaconRecord, config: &UdpConfig) -> Result<Self> {
        let peer = SocketAddr::new(beacon.ip, beacon.port);
        let socket = UdpSocket::bind(SocketAddr::from((config.bind, 0))).await?;
        socket.connect(peer).await?;
        let socket = Arc::new(socket);
        debug!(local = ?socket.local_addr().ok(), "UDP socket connected to {}", peer);

        let shared = Arc::new(Shared { subscriptions: Mutex::default(), callback: RwLock::new(None) });
        let cancel = CancellationToken::new();
        let task = tokio::spawn(
            receive_task(
                Arc::clone(&socket),
                Arc::clone(&shared),
                cancel.clone(),
                config.receive_timeout(),
                config.max_timeouts.max(1),
            )
            .instrument(info_span!("udp", host = %beacon.ip)),
        );

        Ok(Self {
            socket,
            peer,
            shared,
            frequency: config.frequency.max(1),
            cancel,
            task: Mutex::new(Some(task)),
            close_timeout: config.close_timeout(),
        })
    }

    /// Register the callback invoked for every changed value, replacing any previous one.
    pub fn set_callback(&self, callback: impl Fn(ChannelEvent) + Send + Sync + 'static) {
        *self.shared.callback.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
    }

    /// Subscribe to datarefs at the configured frequency.
    ///
    /// Array elements are named as the simulator expects, `sim/x/values[4]`.
    /// Returns the number of requests sent.
    pub async fn subscribe_datarefs<S: AsRef<str>>(&self, names: &[S]) -> Result<usize> {
        self.subscribe_datarefs_at(names, self.frequency).await
    }

    /// Subscribe to datarefs, or change the frequency of existing subscriptions.
    pub async fn subscribe_datarefs_at<S: AsRef<str>>(&self, names: &[S], frequency: u32) -> Result<usize> {
        if frequency == 0 {
            return self.unsubscribe_datarefs(names).await;
        }
        let frequency = i32::try_from(frequency).unwrap_or(i32::MAX);
        let mut sent = 0;
        for name in names {
            let name = name.as_ref();
            let index = self.register(name)?;
            self.send(&RrefRequest { frequency, index, name: name.to_string() }.encode()?, "subscribe").await?;
            sent += 1;
            if sent % SUBSCRIBE_BURST == 0 {
                tokio::time::sleep(SUBSCRIBE_PAUSE).await;
            }
        }
        debug!(count = sent, frequency, "Datarefs subscribed");
        Ok(sent)
    }

    /// Stop updates for datarefs. Names not subscribed are skipped.
    pub async fn unsubscribe_datarefs<S: AsRef<str>>(&self, names: &[S]) -> Result<usize> {
        let mut sent = 0;
        for name in names {
            let name = name.as_ref();
            let released = {
                let mut subscriptions = self.shared.subscriptions();
                let index = subscriptions.by_name.remove(name);
                if let Some(index) = &index {
                    subscriptions.by_index.remove(index);
                }
                index
            };
            let Some(index) = released else {
                debug!("{} is not subscribed", name);
                continue;
            };
            self.send(&RrefRequest { frequency: 0, index, name: name.to_string() }.encode()?, "unsubscribe").await?;
            sent += 1;
        }
        Ok(sent)
    }

    /// Write a scalar dataref.
    pub async fn write_dataref(&self, name: &str, value: DrefValue) -> Result<()> {
        self.send(&DrefWrite { value, name: name.to_string() }.encode()?, "write").await?;
        debug!(dataref = name, ?value, "Dataref written");
        Ok(())
    }

    /// Write a scalar [`Value`], as 32-bit float or integer.
    pub async fn set_dataref(&self, name: &str, value: &Value) -> Result<()> {
        self.write_dataref(name, DrefValue::try_from(value)?).await
    }

    /// Press and release a command. Placeholder names are skipped; returns
    /// whether the command was sent.
    pub async fn command_once(&self, name: &str) -> Result<bool> {
        self.command(name, "").await
    }

    /// Start holding a command.
    pub async fn command_begin(&self, name: &str) -> Result<bool> {
        self.command(name, "/begin").await
    }

    /// Release a held command.
    pub async fn command_end(&self, name: &str) -> Result<bool> {
        self.command(name, "/end").await
    }

    /// Last value received for a subscribed dataref.
    pub fn value(&self, name: &str) -> Option<Value> {
        let subscriptions = self.shared.subscriptions();
        let index = subscriptions.by_name.get(name)?;
        subscriptions.by_index.get(index).map(|entry| entry.value())
    }

    /// Subscribed names, sorted.
    pub fn subscribed(&self) -> Vec<String> {
        let mut names: Vec<_> = self.shared.subscriptions().by_name.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the session has ended, by close or by repeated receive timeouts.
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }

    /// Cancel every subscription, stop the receive task and wait for it.
    pub async fn close(&self) {
        if !self.cancel.is_cancelled() {
            let names = self.subscribed();
            if let Err(e) = self.unsubscribe_datarefs(&names).await {
                debug!("Could not cancel subscriptions: {}", e);
            }
        }
        self.cancel.cancel();
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            match tokio::time::timeout(self.close_timeout, task).await {
                Ok(_) => debug!("UDP session joined"),
                Err(_) => warn!("UDP session did not stop within {:?}", self.close_timeout),
            }
        }
    }

    /// Index for `name`, allocating one on first subscription.
    fn register(&self, name: &str) -> Result<i32> {
        let mut subscriptions = self.shared.subscriptions();
        if let Some(index) = subscriptions.by_name.get(name) {
            return Ok(*index);
        }
        let index = subscriptions.next_index;
        subscriptions.next_index = index
            .checked_add(1)
            .ok_or_else(|| LinkError::invalid_name(name, "no subscription index left"))?;
        subscriptions.by_name.insert(name.to_string(), index);
        subscriptions
            .by_index
            .insert(index, Arc::new(VariableEntry::new(name, i64::from(index), ValueType::Float)));
        Ok(index)
    }

    async fn command(&self, name: &str, suffix: &str) -> Result<bool> {
        if PLACEHOLDER_COMMANDS.iter().any(|p| p.eq_ignore_ascii_case(name)) {
            warn!("Command {:?} is a placeholder, not sent", name);
            return Ok(false);
        }
        let full = format!("{}{}", name, suffix);
        self.send(&encode_command(&full)?, "command").await?;
        debug!(command = %full, "Command sent");
        Ok(true)
    }

    async fn send(&self, datagram: &[u8], what: &str) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(LinkError::not_connected(format!("UDP {}", what)));
        }
        self.socket.send(datagram).await?;
        trace!(len = datagram.len(), "Sent {} datagram", what);
        Ok(())
    }
}

impl Drop for UdpChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn receive_task(
    socket: Arc<UdpSocket>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    timeout: Duration,
    max_timeouts: u32,
) {
    info!("UDP session started");
    let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
    let mut timeouts = 0u32;
    let mut received = 0u64;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = tokio::time::timeout(timeout, socket.recv(&mut buf)) => match result {
                Ok(Ok(len)) => {
                    timeouts = 0;
                    received += 1;
                    match decode_values(&buf[..len]) {
                        Ok(values) => shared.apply(&values),
                        Err(e) => warn!("Dropping datagram: {}", e),
                    }
                }
                Ok(Err(e)) => {
                    // Refused while nothing listens on the simulator port yet
                    debug!("Receive failed: {}", e);
                    tokio::time::sleep(timeout.min(Duration::from_millis(100))).await;
                }
                Err(_) => {
                    if shared.subscriptions().by_index.is_empty() {
                        continue;
                    }
                    timeouts += 1;
                    info!(timeouts, max_timeouts, "No values from simulator within {:?}", timeout);
                    if timeouts >= max_timeouts {
                        warn!("Too many receive timeouts, ending UDP session");
                        break;
                    }
                }
            }
        }
    }

    cancel.cancel();
    info!(received, "UDP session ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::beacon_record;
    use crate::udp::{DREF_LEN, encode_values};
    use tokio::sync::mpsc;

    const AIRSPEED: &str = "sim/cockpit2/gauges/indicators/airspeed_kts_pilot";
    const N1: &str = "sim/flightmodel/engine/ENGN_N1_[0]";

    /// Simulator end of a UDP session on loopback.
    struct FakeSimulator {
        socket: UdpSocket,
        client: Option<SocketAddr>,
    }

    impl FakeSimulator {
        async fn start() -> (Self, BeaconRecord) {
            let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let mut beacon = beacon_record([127, 0, 0, 1], 121400);
            beacon.port = socket.local_addr().unwrap().port();
            (Self { socket, client: None }, beacon)
        }

        async fn next(&mut self) -> Vec<u8> {
            let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
            let (len, from) = tokio::time::timeout(Duration::from_secs(2), self.socket.recv_from(&mut buf))
                .await
                .expect("no datagram within 2s")
                .unwrap();
            self.client = Some(from);
            buf.truncate(len);
            buf
        }

        async fn next_request(&mut self) -> RrefRequest {
            RrefRequest::decode(&self.next().await).unwrap()
        }

        async fn send_values(&self, values: &[(i32, f32)]) {
            let client = self.client.expect("client has not sent anything yet");
            self.socket.send_to(&encode_values(values), client).await.unwrap();
        }
    }

    fn config() -> UdpConfig {
        UdpConfig { receive_timeout_secs: 0.05, max_timeouts: 3, close_timeout_secs: 1.0, ..UdpConfig::default() }
    }

    async fn open() -> (UdpChannel, FakeSimulator, mpsc::UnboundedReceiver<ChannelEvent>) {
        let _ = tracing_subscriber::fmt::try_init();
        let (simulator, beacon) = FakeSimulator::start().await;
        let channel = UdpChannel::open(&beacon, &config()).await.unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        channel.set_callback(move |event| {
            let _ = tx.send(event);
        });
        (channel, simulator, rx)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<ChannelEvent>) -> ChannelEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("no event within 2s")
            .expect("callback dropped")
    }

    #[tokio::test]
    async fn subscriptions_get_stable_indices() {
        let (channel, mut simulator, _rx) = open().await;

        assert_eq!(channel.subscribe_datarefs(&[AIRSPEED, N1]).await.unwrap(), 2);
        let first = simulator.next_request().await;
        let second = simulator.next_request().await;
        assert_eq!((first.name.as_str(), first.index, first.frequency), (AIRSPEED, 0, 2));
        assert_eq!((second.name.as_str(), second.index), (N1, 1));

        // Resubscribing changes the frequency, not the index
        channel.subscribe_datarefs_at(&[N1], 10).await.unwrap();
        let again = simulator.next_request().await;
        assert_eq!((again.index, again.frequency), (1, 10));
        assert_eq!(channel.subscribed(), vec![AIRSPEED.to_string(), N1.to_string()]);
    }

    #[tokio::test]
    async fn values_are_reported_on_change() {
        let (channel, mut simulator, mut rx) = open().await;
        channel.subscribe_datarefs(&[AIRSPEED, N1]).await.unwrap();
        simulator.next_request().await;
        simulator.next_request().await;

        simulator.send_values(&[(0, 120.5), (1, 87.0), (7, 1.0)]).await;
        let ChannelEvent::Dataref(airspeed) = next_event(&mut rx).await else { panic!("expected dataref event") };
        let ChannelEvent::Dataref(n1) = next_event(&mut rx).await else { panic!("expected dataref event") };
        assert_eq!((airspeed.name(), airspeed.value()), (AIRSPEED, Value::Float(120.5)));
        assert_eq!((n1.name(), n1.value()), (N1, Value::Float(87.0)));

        // Unchanged airspeed is not reported again
        simulator.send_values(&[(0, 120.5), (1, 88.0)]).await;
        let ChannelEvent::Dataref(n1) = next_event(&mut rx).await else { panic!("expected dataref event") };
        assert_eq!(n1.value(), Value::Float(88.0));
        assert!(rx.try_recv().is_err());
        assert_eq!(channel.value(AIRSPEED), Some(Value::Float(120.5)));
    }

    #[tokio::test]
    async fn foreign_datagrams_are_ignored() {
        let (channel, mut simulator, mut rx) = open().await;
        channel.subscribe_datarefs(&[AIRSPEED]).await.unwrap();
        simulator.next_request().await;

        let client = simulator.client.unwrap();
        simulator.socket.send_to(b"DATA*garbage", client).await.unwrap();
        simulator.send_values(&[(0, 42.0)]).await;

        let ChannelEvent::Dataref(entry) = next_event(&mut rx).await else { panic!("expected dataref event") };
        assert_eq!(entry.value(), Value::Float(42.0));
        assert!(!channel.is_closed());
    }

    #[tokio::test]
    async fn unsubscribe_sends_zero_frequency() {
        let (channel, mut simulator, _rx) = open().await;
        channel.subscribe_datarefs(&[AIRSPEED]).await.unwrap();
        simulator.next_request().await;

        assert_eq!(channel.unsubscribe_datarefs(&[AIRSPEED, "sim/not/subscribed"]).await.unwrap(), 1);
        let request = simulator.next_request().await;
        assert_eq!((request.index, request.frequency), (0, 0));
        assert!(channel.subscribed().is_empty());
    }

    #[tokio::test]
    async fn writes_and_commands() {
        let (channel, mut simulator, _rx) = open().await;

        channel.set_dataref("sim/cockpit/switches/anti_ice_surf_heat_left", &Value::Int(1)).await.unwrap();
        let write = simulator.next().await;
        assert_eq!(write.len(), DREF_LEN);
        assert_eq!(&write[5..9], &1i32.to_le_bytes());

        assert!(channel.command_once("sim/autopilot/heading_sync").await.unwrap());
        assert_eq!(simulator.next().await, b"CMND\0sim/autopilot/heading_sync".to_vec());
        assert!(channel.command_begin("sim/starters/engage_starter_1").await.unwrap());
        assert_eq!(simulator.next().await, b"CMND\0sim/starters/engage_starter_1/begin".to_vec());
        assert!(channel.command_end("sim/starters/engage_starter_1").await.unwrap());
        assert_eq!(simulator.next().await, b"CMND\0sim/starters/engage_starter_1/end".to_vec());

        assert!(!channel.command_once("noop").await.unwrap());
        assert!(channel.set_dataref("sim/x", &Value::String("ABC".into())).await.is_err());
    }

    #[tokio::test]
    async fn silent_simulator_ends_session() {
        let (channel, mut simulator, _rx) = open().await;
        channel.subscribe_datarefs(&[AIRSPEED]).await.unwrap();
        simulator.next_request().await;

        tokio::time::timeout(Duration::from_secs(2), channel.closed()).await.expect("session did not end");
        let err = channel.subscribe_datarefs(&[N1]).await.unwrap_err();
        assert!(matches!(err, LinkError::NotConnected { .. }));
    }

    #[tokio::test]
    async fn idle_without_subscriptions_stays_open() {
        let (channel, _simulator, _rx) = open().await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!channel.is_closed());
    }

    #[tokio::test]
    async fn close_cancels_subscriptions() {
        let (channel, mut simulator, _rx) = open().await;
        channel.subscribe_datarefs(&[AIRSPEED]).await.unwrap();
        simulator.next_request().await;

        channel.close().await;
        let request = simulator.next_request().await;
        assert_eq!((request.name.as_str(), request.frequency), (AIRSPEED, 0));
        assert!(channel.is_closed());
    }
}
