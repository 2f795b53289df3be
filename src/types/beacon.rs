//! Discovered simulator endpoint

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use tracing::debug;

/// Role advertised by a master simulator instance.
pub const ROLE_MASTER: u32 = 1;

/// Endpoint of a running simulator, as announced by its beacon.
///
/// Immutable once produced. A fresh record is created on every successful
/// discovery and dropped when the supervisor loses the simulator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeaconRecord {
    /// Source address of the beacon packet
    pub ip: IpAddr,
    /// UDP port the simulator listens on
    pub port: u16,
    /// Hostname of the machine running the simulator
    pub hostname: String,
    /// Simulator version number, e.g. `121400` for 12.1.4
    pub version: u32,
    /// 1 = master, 2 = external visual, 3 = IOS
    pub role: u32,
}

impl BeaconRecord {
    /// Whether the simulator runs on this machine.
    ///
    /// `local` is the set of addresses of this host, usually from
    /// [`local_addresses`].
    pub fn is_local(&self, local: &[IpAddr]) -> bool {
        self.ip.is_loopback() || local.contains(&self.ip)
    }

    /// Whether `version` lies inside the inclusive window `[min, max]`.
    pub fn version_within(&self, min: u32, max: u32) -> bool {
        (min..=max).contains(&self.version)
    }

    /// Host to contact for the web API.
    ///
    /// Local simulators are reached over loopback, remote ones over the
    /// beacon's source address.
    pub fn api_host(&self, local: &[IpAddr]) -> IpAddr {
        if self.is_local(local) { IpAddr::V4(Ipv4Addr::LOCALHOST) } else { self.ip }
    }
}

/// IPv4 addresses of every interface of this host, loopback included.
pub fn local_addresses() -> Vec<IpAddr> {
    use network_interface::{NetworkInterface, NetworkInterfaceConfig};

    let mut addresses = vec![IpAddr::V4(Ipv4Addr::LOCALHOST)];
    match NetworkInterface::show() {
        Ok(interfaces) => {
            for itf in &interfaces {
                for addr in &itf.addr {
                    let ip = addr.ip();
                    if ip.is_ipv4() && !addresses.contains(&ip) {
                        addresses.push(ip);
                    }
                }
            }
        }
        Err(e) => debug!("Could not enumerate network interfaces: {}", e),
    }
    addresses
}
