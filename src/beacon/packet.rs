//! Beacon packet codec
//!
//! Layout, little-endian, fixed offsets:
//!
//! | offset | size | field |
//! |---|---|---|
//! | 0 | 5 | `"BECN\0"` |
//! | 5 | 1 | beacon major version |
//! | 6 | 1 | beacon minor version |
//! | 7 | 4 | application host id (i32, 1 = X-Plane, 2 = PlaneMaker) |
//! | 11 | 4 | simulator version number (i32) |
//! | 15 | 4 | role (u32) |
//! | 19 | 2 | port (u16) |
//! | 21 | .. | hostname, NUL-terminated |

use std::net::IpAddr;

use crate::types::BeaconRecord;
use crate::{LinkError, Result};

/// Packet magic, NUL included.
pub const BEACON_MAGIC: &[u8; 5] = b"BECN\0";

/// Size of the fixed header preceding the hostname.
pub const HEADER_LEN: usize = 21;

/// Largest datagram a beacon may occupy.
pub const MAX_PACKET_LEN: usize = 1472;

pub const SUPPORTED_MAJOR: u8 = 1;
pub const MAX_SUPPORTED_MINOR: u8 = 2;
pub const XPLANE_HOST_ID: i32 = 1;

/// Decoded beacon packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeaconPacket {
    pub major: u8,
    pub minor: u8,
    pub host_id: i32,
    pub version: i32,
    pub role: u32,
    pub port: u16,
    pub hostname: String,
}

impl BeaconPacket {
    /// Decode a single datagram.
    ///
    /// Fails with [`LinkError::MalformedPacket`] on a short packet or wrong
    /// magic, and with [`LinkError::VersionNotSupported`] when the beacon
    /// version or host id is not one this crate speaks.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(LinkError::malformed(format!("shorter than {} byte header", HEADER_LEN), bytes.len()));
        }
        if &bytes[0..5] != BEACON_MAGIC {
            return Err(LinkError::malformed("unknown magic", bytes.len()));
        }

        let major = bytes[5];
        let minor = bytes[6];
        let host_id = i32::from_le_bytes([bytes[7], bytes[8], bytes[9], bytes[10]]);
        let version = i32::from_le_bytes([bytes[11], bytes[12], bytes[13], bytes[14]]);
        let role = u32::from_le_bytes([bytes[15], bytes[16], bytes[17], bytes[18]]);
        let port = u16::from_le_bytes([bytes[19], bytes[20]]);

        if major != SUPPORTED_MAJOR || minor > MAX_SUPPORTED_MINOR || host_id != XPLANE_HOST_ID {
            return Err(LinkError::VersionNotSupported { major, minor, host_id });
        }

        let tail = &bytes[HEADER_LEN..];
        let end = tail.iter().position(|b| *b == 0).unwrap_or(tail.len());
        let hostname = String::from_utf8_lossy(&tail[..end]).into_owned();

        Ok(Self { major, minor, host_id, version, role, port, hostname })
    }

    /// Encode into the wire layout, hostname NUL-terminated.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LEN + self.hostname.len() + 1);
        bytes.extend_from_slice(BEACON_MAGIC);
        bytes.push(self.major);
        bytes.push(self.minor);
        bytes.extend_from_slice(&self.host_id.to_le_bytes());
        bytes.extend_from_slice(&self.version.to_le_bytes());
        bytes.extend_from_slice(&self.role.to_le_bytes());
        bytes.extend_from_slice(&self.port.to_le_bytes());
        bytes.extend_from_slice(self.hostname.as_bytes());
        bytes.push(0);
        bytes
    }

    /// Attach the sender address.
    pub fn into_record(self, ip: IpAddr) -> BeaconRecord {
        BeaconRecord {
            ip,
            port: self.port,
            hostname: self.hostname,
            version: u32::try_from(self.version).unwrap_or(0),
            role: self.role,
        }
    }
}
