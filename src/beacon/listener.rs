//! Multicast beacon listener

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, info, trace, warn};

use super::packet::BeaconPacket;
use crate::config::DiscoveryConfig;
use crate::types::BeaconRecord;
use crate::{LinkError, Result};

/// Source of simulator beacons.
///
/// Implemented by [`BeaconListener`] for the network and by scripted
/// sources in tests.
#[async_trait::async_trait]
pub trait Discovery: Send + Sync + 'static {
    /// Wait up to `timeout` for one beacon.
    ///
    /// Returns:
    /// - `Ok(record)` - a supported simulator announced itself
    /// - `Err(LinkError::IpNotFound)` - nothing usable arrived in time
    /// - `Err(LinkError::VersionNotSupported)` - a beacon arrived from an incompatible sender
    async fn discover(&self, timeout: Duration) -> Result<BeaconRecord>;
}

/// Listens for X-Plane beacons on the multicast group.
///
/// Every call to [`Discovery::discover`] opens its own socket and drops it
/// before returning, so no descriptor outlives a discovery attempt.
#[derive(Debug, Clone)]
pub struct BeaconListener {
    group: Ipv4Addr,
    port: u16,
    interface: Ipv4Addr,
    max_packet: usize,
}

impl BeaconListener {
    pub fn new(config: &DiscoveryConfig) -> Self {
        Self {
            group: config.group,
            port: config.port,
            interface: config.interface,
            max_packet: config.max_packet,
        }
    }

    /// Address the listener receives on.
    pub fn group(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.group, self.port)
    }

    fn open_socket(&self) -> Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_nonblocking(true)?;
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;

        if self.group.is_multicast() {
            bind_to_multicast(&socket, &self.group(), &self.interface)?;
        } else {
            // Unicast address, e.g. loopback in tests
            socket.bind(&SockAddr::from(self.group()))?;
        }
        trace!("Beacon socket bound for {}", self.group());

        let std_socket: std::net::UdpSocket = socket.into();
        Ok(UdpSocket::from_std(std_socket)?)
    }
}

/// On Windows, unlike all Unix variants, it is improper to bind to the multicast address
#[cfg(windows)]
fn bind_to_multicast(socket: &Socket, addr: &SocketAddrV4, nic_addr: &Ipv4Addr) -> std::io::Result<()> {
    socket.join_multicast_v4(addr.ip(), nic_addr)?;
    let socketaddr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, addr.port()));
    socket.bind(&SockAddr::from(socketaddr))
}

/// On unixes we bind to the multicast address, which filters out unrelated traffic
#[cfg(not(windows))]
fn bind_to_multicast(socket: &Socket, addr: &SocketAddrV4, nic_addr: &Ipv4Addr) -> std::io::Result<()> {
    socket.bind(&SockAddr::from(SocketAddr::V4(*addr)))?;
    socket.join_multicast_v4(addr.ip(), nic_addr)
}

#[async_trait::async_trait]
impl Discovery for BeaconListener {
    async fn discover(&self, timeout: Duration) -> Result<BeaconRecord> {
        let socket = self.open_socket()?;
        let mut buf = vec![0u8; self.max_packet];

        let (len, sender) = match tokio::time::timeout(timeout, socket.recv_from(&mut buf)).await {
            Ok(received) => received?,
            Err(_) => {
                debug!("X-Plane beacon not heard within {:?}", timeout);
                return Err(LinkError::IpNotFound { timeout });
            }
        };
        drop(socket);
        trace!(len, %sender, "Beacon datagram received");

        match BeaconPacket::decode(&buf[..len]) {
            Ok(packet) => {
                info!(
                    sender = %sender,
                    port = packet.port,
                    hostname = %packet.hostname,
                    "X-Plane beacon version {}.{}.{}",
                    packet.major,
                    packet.minor,
                    packet.host_id
                );
                Ok(packet.into_record(sender.ip()))
            }
            Err(LinkError::MalformedPacket { reason, len }) => {
                debug!(sender = %sender, len, "Ignoring unknown packet: {}", reason);
                Err(LinkError::IpNotFound { timeout })
            }
            Err(e) => {
                warn!(sender = %sender, "{}", e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::beacon_packet;
    use std::net::IpAddr;
    use std::time::Instant;
    use tokio::sync::oneshot;

    fn loopback_listener(port: u16) -> BeaconListener {
        let config = DiscoveryConfig { group: Ipv4Addr::LOCALHOST, port, ..DiscoveryConfig::default() };
        BeaconListener::new(&config)
    }

    /// Send `payload` to `port` every 20ms until told to stop.
    fn spawn_sender(port: u16, payload: Vec<u8>) -> oneshot::Sender<()> {
        let (done_tx, mut done_rx) = oneshot::channel();
        tokio::spawn(async move {
            let Ok(socket) = UdpSocket::bind("127.0.0.1:0").await else { return };
            loop {
                let _ = socket.send_to(&payload, ("127.0.0.1", port)).await;
                tokio::select! {
                    _ = &mut done_rx => break,
                    _ = tokio::time::sleep(Duration::from_millis(20)) => {}
                }
            }
        });
        done_tx
    }

    #[tokio::test]
    async fn discovers_loopback_beacon() {
        let _ = tracing_subscriber::fmt::try_init();
        let listener = loopback_listener(47811);
        let done = spawn_sender(47811, beacon_packet(121400, 49000, "simbox").encode());

        let record = listener.discover(Duration::from_secs(2)).await.unwrap();
        let _ = done.send(());

        assert_eq!(record.ip, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(record.port, 49000);
        assert_eq!(record.hostname, "simbox");
        assert_eq!(record.version, 121400);
    }

    #[tokio::test]
    async fn malformed_packet_reads_as_not_found() {
        let listener = loopback_listener(47812);
        let done = spawn_sender(47812, b"HELLO this is not a beacon".to_vec());

        let err = listener.discover(Duration::from_secs(2)).await.unwrap_err();
        let _ = done.send(());

        assert!(matches!(err, LinkError::IpNotFound { .. }));
    }

    #[tokio::test]
    async fn unsupported_version_is_reported() {
        let listener = loopback_listener(47813);
        let mut packet = beacon_packet(121400, 49000, "simbox");
        packet.major = 2;
        let done = spawn_sender(47813, packet.encode());

        let err = listener.discover(Duration::from_secs(2)).await.unwrap_err();
        let _ = done.send(());

        assert!(matches!(err, LinkError::VersionNotSupported { major: 2, .. }));
    }

    #[tokio::test]
    async fn silence_times_out_and_releases_socket() {
        let listener = loopback_listener(47814);
        let timeout = Duration::from_millis(50);

        for _ in 0..20 {
            let started = Instant::now();
            let err = listener.discover(timeout).await.unwrap_err();
            assert!(matches!(err, LinkError::IpNotFound { .. }));
            assert!(started.elapsed() < timeout + Duration::from_millis(500));
        }

        // Port is free again once every attempt has dropped its socket
        let exclusive = std::net::UdpSocket::bind(("127.0.0.1", 47814));
        assert!(exclusive.is_ok());
    }
}
