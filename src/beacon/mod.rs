//! Simulator discovery over UDP multicast.
//!
//! A running X-Plane announces itself on `239.255.1.1:49707` with a small
//! fixed-layout "BECN" packet. [`BeaconPacket`] decodes that packet and
//! [`BeaconListener`] waits for one on the network.

mod listener;
mod packet;

pub use listener::{BeaconListener, Discovery};
pub use packet::{
    BEACON_MAGIC, BeaconPacket, HEADER_LEN, MAX_PACKET_LEN, MAX_SUPPORTED_MINOR, SUPPORTED_MAJOR, XPLANE_HOST_ID,
};
