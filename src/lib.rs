//! X-Plane connectivity: beacon discovery, reconnect supervision and
//! dataref/command subscriptions over the simulator's web API.
//!
//! # Features
//!
//! - **Discovery**: decodes the `BECN` multicast beacon and finds simulators on the local network
//! - **Supervision**: background loop that tracks the simulator coming and going
//! - **Registry**: name to id cache, re-resolved on every new session
//! - **Subscriptions**: one WebSocket session with ordered, per-entry update callbacks
//! - **UDP**: `RREF`/`DREF`/`CMND` datagrams for simulators without the web API
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use xplink::{ChannelEvent, LinkConfig, XPlane};
//!
//! #[tokio::main]
//! async fn main() -> xplink::Result<()> {
//!     let link = XPlane::link(LinkConfig::default())?;
//!     link.set_callback(|event| {
//!         if let ChannelEvent::Dataref(entry) = event {
//!             println!("{} = {:?}", entry.name(), entry.value());
//!         }
//!     });
//!     link.monitor(&["sim/cockpit2/gauges/indicators/airspeed_kts_pilot"]).await?;
//!     link.start();
//!
//!     tokio::time::sleep(std::time::Duration::from_secs(600)).await;
//!     link.stop().await;
//!     Ok(())
//! }
//! ```

// Core types and error handling
mod error;
#[cfg_attr(any(test, feature = "benchmark"), path = "test_utils.rs")]
#[cfg(any(test, feature = "benchmark"))]
pub mod test_utils;
pub mod types;

// Discovery and session management
pub mod beacon;
pub mod connection;
pub mod link;
pub mod registry;

// Wire formats and transports
pub mod protocol;
pub mod rest;
pub mod transport;
pub mod udp;

// Configuration and actions
pub mod config;
pub mod instruction;
pub mod logging;

// Core exports
pub use error::*;
pub use types::*;

pub use beacon::{BeaconListener, BeaconPacket, Discovery};
pub use config::LinkConfig;
pub use connection::{ChannelEvent, ConnectionSupervisor, SubscriptionChannel};
pub use instruction::{Instruction, InstructionTable};
pub use link::{Connector, Endpoint, SimulatorLink, WebApiConnector};
pub use registry::{Directory, Registry};
pub use rest::{ApiVersion, RestClient};
pub use udp::UdpChannel;

/// Entry point for X-Plane connections.
///
/// # Examples
///
/// ## Find a simulator once
/// ```rust,no_run
/// use xplink::{LinkConfig, XPlane};
///
/// #[tokio::main]
/// async fn main() -> xplink::Result<()> {
///     let beacon = XPlane::discover(&LinkConfig::default()).await?;
///     println!("X-Plane {} at {}:{}", beacon.version, beacon.ip, beacon.port);
///     Ok(())
/// }
/// ```
pub struct XPlane;

impl XPlane {
    /// Wait for one beacon, up to the configured discovery timeout.
    ///
    /// # Errors
    ///
    /// - [`LinkError::IpNotFound`] if no valid beacon arrived in time
    /// - [`LinkError::VersionNotSupported`] if the beacon protocol is not understood
    /// - [`LinkError::Io`] if the multicast socket cannot be opened
    pub async fn discover(config: &LinkConfig) -> Result<BeaconRecord> {
        BeaconListener::new(&config.discovery).discover(config.discovery.timeout()).await
    }

    /// Find a simulator and open a UDP session with it.
    ///
    /// # Errors
    ///
    /// Those of [`XPlane::discover`], plus [`LinkError::Io`] if the UDP
    /// socket cannot be opened.
    pub async fn udp(config: &LinkConfig) -> Result<UdpChannel> {
        let beacon = Self::discover(config).await?;
        UdpChannel::open(&beacon, &config.udp).await
    }

    /// Link to whichever simulator announces itself. Call
    /// [`SimulatorLink::start`] to begin.
    ///
    /// # Errors
    ///
    /// [`LinkError::Config`] if `config` does not validate.
    pub fn link(config: LinkConfig) -> Result<SimulatorLink> {
        SimulatorLink::new(config)
    }
}
