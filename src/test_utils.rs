//! Test doubles for the discovery, directory and transport seams
//!
//! These stand in for a running simulator so the supervisor, registry,
//! channel and link can be driven deterministically in tests and benchmarks.

#![cfg(any(test, feature = "benchmark"))]

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::beacon::{BeaconPacket, Discovery};
use crate::link::{Connector, Endpoint};
use crate::registry::{CommandRecord, DatarefRecord, Directory};
use crate::transport::Transport;
use crate::types::{BeaconRecord, ValueType};
use crate::{LinkError, Result};

/// Supported beacon packet for a local X-Plane.
pub fn beacon_packet(version: i32, port: u16, hostname: &str) -> BeaconPacket {
    BeaconPacket { major: 1, minor: 2, host_id: 1, version, role: 1, port, hostname: hostname.to_string() }
}

/// Beacon record as the listener would produce it.
pub fn beacon_record(ip: [u8; 4], version: u32) -> BeaconRecord {
    BeaconRecord {
        ip: IpAddr::V4(Ipv4Addr::from(ip)),
        port: 49000,
        hostname: "simbox".to_string(),
        version,
        role: 1,
    }
}

/// `dataref_update_values` message for the given ids.
pub fn update_message(values: &[(i64, serde_json::Value)]) -> String {
    let data: serde_json::Map<String, serde_json::Value> =
        values.iter().map(|(id, value)| (id.to_string(), value.clone())).collect();
    serde_json::json!({"type": "dataref_update_values", "data": data}).to_string()
}

/// Outcome of one scripted discovery attempt.
#[derive(Debug, Clone)]
pub enum Outcome {
    Found(BeaconRecord),
    NotFound,
    Unsupported,
}

/// Discovery source that replays a script, then repeats a fallback outcome.
#[derive(Debug)]
pub struct ScriptedDiscovery {
    script: Mutex<VecDeque<Outcome>>,
    fallback: Mutex<Outcome>,
    delay: Duration,
    calls: AtomicUsize,
}

impl Default for ScriptedDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedDiscovery {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(Outcome::NotFound),
            delay: Duration::from_millis(1),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn then(self, outcome: Outcome) -> Self {
        self.script.lock().unwrap().push_back(outcome);
        self
    }

    pub fn otherwise(self, outcome: Outcome) -> Self {
        *self.fallback.lock().unwrap() = outcome;
        self
    }

    /// Time each attempt takes before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Change the fallback while the supervisor is running.
    pub fn set_fallback(&self, outcome: Outcome) {
        *self.fallback.lock().unwrap() = outcome;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Discovery for ScriptedDiscovery {
    async fn discover(&self, timeout: Duration) -> Result<BeaconRecord> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay.min(timeout)).await;
        let next = self.script.lock().unwrap().pop_front();
        let outcome = next.unwrap_or_else(|| self.fallback.lock().unwrap().clone());
        match outcome {
            Outcome::Found(record) => Ok(record),
            Outcome::NotFound => Err(LinkError::IpNotFound { timeout }),
            Outcome::Unsupported => Err(LinkError::VersionNotSupported { major: 2, minor: 0, host_id: 1 }),
        }
    }
}

/// In-memory directory that counts lookups.
#[derive(Debug, Default)]
pub struct MockDirectory {
    datarefs: HashMap<String, DatarefRecord>,
    commands: HashMap<String, CommandRecord>,
    dataref_lookups: AtomicUsize,
    command_lookups: AtomicUsize,
}

impl MockDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dataref(mut self, id: i64, name: &str, value_type: ValueType) -> Self {
        let record = DatarefRecord { id, name: name.to_string(), value_type, is_writable: true };
        self.datarefs.insert(name.to_string(), record);
        self
    }

    pub fn with_command(mut self, id: i64, name: &str) -> Self {
        let record = CommandRecord { id, name: name.to_string(), description: None };
        self.commands.insert(name.to_string(), record);
        self
    }

    pub fn dataref_lookups(&self) -> usize {
        self.dataref_lookups.load(Ordering::SeqCst)
    }

    pub fn command_lookups(&self) -> usize {
        self.command_lookups.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Directory for MockDirectory {
    async fn lookup_dataref(&self, name: &str) -> Result<Option<DatarefRecord>> {
        self.dataref_lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.datarefs.get(name).cloned())
    }

    async fn lookup_command(&self, name: &str) -> Result<Option<CommandRecord>> {
        self.command_lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.commands.get(name).cloned())
    }
}

enum PeerMessage {
    Text(String),
    Garbled(String),
    Fail(String),
}

/// Transport half handed to the channel.
pub struct MockTransport {
    incoming: mpsc::UnboundedReceiver<PeerMessage>,
    outgoing: mpsc::UnboundedSender<String>,
    closed: Arc<AtomicBool>,
}

/// Simulator half of a [`MockTransport`].
pub struct MockPeer {
    incoming: Option<mpsc::UnboundedSender<PeerMessage>>,
    outgoing: mpsc::UnboundedReceiver<String>,
    closed: Arc<AtomicBool>,
}

/// Connected transport/peer pair.
pub fn mock_transport() -> (MockTransport, MockPeer) {
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let closed = Arc::new(AtomicBool::new(false));
    (
        MockTransport { incoming: in_rx, outgoing: out_tx, closed: Arc::clone(&closed) },
        MockPeer { incoming: Some(in_tx), outgoing: out_rx, closed },
    )
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, text: String) -> Result<()> {
        self.outgoing.send(text).map_err(|_| LinkError::transport("peer dropped"))
    }

    async fn recv(&mut self) -> Result<Option<String>> {
        match self.incoming.recv().await {
            Some(PeerMessage::Text(text)) => Ok(Some(text)),
            Some(PeerMessage::Garbled(details)) => Err(LinkError::decode("frame", details)),
            Some(PeerMessage::Fail(reason)) => Err(LinkError::transport(reason)),
            None => Ok(None),
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl MockPeer {
    /// Deliver a message to the channel.
    pub fn push(&self, text: impl Into<String>) {
        if let Some(tx) = &self.incoming {
            let _ = tx.send(PeerMessage::Text(text.into()));
        }
    }

    /// Deliver a frame the transport cannot decode.
    pub fn garble(&self, details: &str) {
        if let Some(tx) = &self.incoming {
            let _ = tx.send(PeerMessage::Garbled(details.to_string()));
        }
    }

    /// Make the channel's next receive fail.
    pub fn fail(&self, reason: &str) {
        if let Some(tx) = &self.incoming {
            let _ = tx.send(PeerMessage::Fail(reason.to_string()));
        }
    }

    /// End the stream, as a simulator shutting down would.
    pub fn hang_up(&mut self) {
        self.incoming = None;
    }

    /// Next request the channel sent, parsed.
    pub async fn next_request(&mut self) -> serde_json::Value {
        let text = tokio::time::timeout(Duration::from_secs(2), self.outgoing.recv())
            .await
            .expect("no request sent within 2s")
            .expect("transport dropped");
        serde_json::from_str(&text).unwrap()
    }

    /// Request already sent, if any.
    pub fn try_request(&mut self) -> Option<serde_json::Value> {
        self.outgoing.try_recv().ok().map(|text| serde_json::from_str(&text).unwrap())
    }

    /// Whether the channel closed its transport.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Connector serving a fixed directory and transports queued by the test.
#[derive(Default)]
pub struct MockConnector {
    directory: Arc<MockDirectory>,
    transports: Mutex<VecDeque<MockTransport>>,
    connects: AtomicUsize,
}

impl MockConnector {
    pub fn new(directory: Arc<MockDirectory>) -> Self {
        Self { directory, transports: Mutex::default(), connects: AtomicUsize::new(0) }
    }

    /// Queue a session for the next connect and return its simulator half.
    pub fn session(&self) -> MockPeer {
        let (transport, peer) = mock_transport();
        self.transports.lock().unwrap().push_back(transport);
        peer
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn directory(&self) -> &Arc<MockDirectory> {
        &self.directory
    }
}

#[async_trait::async_trait]
impl Connector for MockConnector {
    async fn connect(&self, _beacon: &BeaconRecord) -> Result<Endpoint> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let transport = self.transports.lock().unwrap().pop_front().ok_or_else(|| LinkError::transport("no session queued"))?;
        let directory: Arc<dyn Directory> = self.directory.clone();
        Ok(Endpoint { directory, transport: Box::new(transport) })
    }
}
