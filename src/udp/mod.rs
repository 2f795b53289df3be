//! Legacy UDP interface of the simulator.
//!
//! Besides the web API, X-Plane accepts fixed-layout datagrams on the port
//! announced in its beacon: `RREF` subscribes to dataref values, `DREF`
//! writes one and `CMND` runs a command. [`UdpChannel`] speaks that
//! protocol for simulators whose web API is unavailable.

mod packet;
mod session;

pub use packet::{
    DREF_LEN, DrefValue, DrefWrite, MAX_DATAGRAM_LEN, RREF_NAME_LEN, RREF_REQUEST_LEN, RrefRequest, decode_values,
    encode_command, encode_values,
};
pub use session::{PLACEHOLDER_COMMANDS, UdpChannel};
