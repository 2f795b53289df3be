//! Connectivity configuration
//!
//! Every setting has a default matching what X-Plane 12 expects, so an empty
//! file (or [`LinkConfig::default`]) is a working configuration:
//!
//! ```yaml
//! discovery:
//!   group: 239.255.1.1
//!   port: 49707
//!   timeout_secs: 3.0
//! supervisor:
//!   retry_interval_secs: 10.0
//!   min_version: 121100
//!   max_version: 121499
//! api:
//!   preferred_version: v2
//! udp:
//!   frequency: 2
//! ```

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::{LinkError, Result};

/// Longest interval or timeout accepted, one day.
pub const MAX_DURATION_SECS: f64 = 86_400.0;

/// Deepest outbound request queue accepted.
pub const MAX_OUTBOUND_CAPACITY: usize = 65_536;

/// Seconds to a `Duration`, clamped to `0..=MAX_DURATION_SECS`. Never panics,
/// even for settings that skipped [`LinkConfig::validate`].
fn seconds(secs: f64) -> Duration {
    if secs.is_nan() {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs.clamp(0.0, MAX_DURATION_SECS)).unwrap_or(Duration::ZERO)
}

/// Top-level configuration for a [`SimulatorLink`](crate::SimulatorLink).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LinkConfig {
    pub discovery: DiscoveryConfig,
    pub supervisor: SupervisorConfig,
    pub channel: ChannelConfig,
    pub api: ApiConfig,
    pub udp: UdpConfig,
}

/// Beacon listener settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DiscoveryConfig {
    /// Multicast group the simulator announces on
    pub group: Ipv4Addr,
    pub port: u16,
    /// Local interface used to join the group; unspecified lets the OS pick
    pub interface: Ipv4Addr,
    /// How long one discovery attempt waits for a beacon
    pub timeout_secs: f64,
    pub max_packet: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            group: Ipv4Addr::new(239, 255, 1, 1),
            port: 49707,
            interface: Ipv4Addr::UNSPECIFIED,
            timeout_secs: 3.0,
            max_packet: crate::beacon::MAX_PACKET_LEN,
        }
    }
}

impl DiscoveryConfig {
    pub fn timeout(&self) -> Duration {
        seconds(self.timeout_secs)
    }
}

/// Connection supervisor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SupervisorConfig {
    /// Pause between failed discovery attempts
    pub retry_interval_secs: f64,
    /// Pause between liveness checks while connected
    pub monitor_interval_secs: f64,
    /// Repeat the "not found" error every this many failed attempts
    pub warn_every: u32,
    /// Upper bound on waiting for the loop to exit on disconnect
    pub join_timeout_secs: f64,
    /// Oldest simulator version known to work; older versions only warn
    pub min_version: u32,
    /// Newest simulator version known to work; newer versions only warn
    pub max_version: u32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            retry_interval_secs: 10.0,
            monitor_interval_secs: 10.0,
            warn_every: 10,
            join_timeout_secs: 10.0,
            min_version: 121100,
            max_version: 121499,
        }
    }
}

impl SupervisorConfig {
    pub fn retry_interval(&self) -> Duration {
        seconds(self.retry_interval_secs)
    }

    pub fn monitor_interval(&self) -> Duration {
        seconds(self.monitor_interval_secs)
    }

    pub fn join_timeout(&self) -> Duration {
        seconds(self.join_timeout_secs)
    }
}

/// Subscription channel settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChannelConfig {
    /// Receive poll interval; bounds how long a stop request can go unnoticed
    pub poll_timeout_secs: f64,
    /// Upper bound on waiting for the session task on close
    pub close_timeout_secs: f64,
    /// Outbound request queue depth
    pub outbound_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self { poll_timeout_secs: 1.0, close_timeout_secs: 5.0, outbound_capacity: 64 }
    }
}

impl ChannelConfig {
    pub fn poll_timeout(&self) -> Duration {
        seconds(self.poll_timeout_secs)
    }

    pub fn close_timeout(&self) -> Duration {
        seconds(self.close_timeout_secs)
    }
}

/// X-Plane web API settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ApiConfig {
    pub root: String,
    /// Web API port when X-Plane runs on another host
    pub remote_port: u16,
    /// Web API port when X-Plane runs on this host
    pub local_port: u16,
    /// API version to use, e.g. `v2`; latest advertised when unset
    pub preferred_version: Option<String>,
    pub request_timeout_secs: f64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            root: "/api".to_string(),
            remote_port: 8080,
            local_port: 8086,
            preferred_version: None,
            request_timeout_secs: 10.0,
        }
    }
}

impl ApiConfig {
    pub fn request_timeout(&self) -> Duration {
        seconds(self.request_timeout_secs)
    }
}

/// Settings for the legacy UDP channel (`RREF`/`DREF`/`CMND`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UdpConfig {
    /// Local address to send from and receive values on
    pub bind: Ipv4Addr,
    /// Updates per second requested for each dataref
    pub frequency: u32,
    /// How long to wait for a values datagram before counting a timeout
    pub receive_timeout_secs: f64,
    /// Consecutive timeouts, while subscribed, that end the session
    pub max_timeouts: u32,
    /// Upper bound on waiting for the receive task on close
    pub close_timeout_secs: f64,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            bind: Ipv4Addr::UNSPECIFIED,
            frequency: 2,
            receive_timeout_secs: 10.0,
            max_timeouts: 5,
            close_timeout_secs: 5.0,
        }
    }
}

impl UdpConfig {
    pub fn receive_timeout(&self) -> Duration {
        seconds(self.receive_timeout_secs)
    }

    pub fn close_timeout(&self) -> Duration {
        seconds(self.close_timeout_secs)
    }
}

impl LinkConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: LinkConfig = serde_yaml_ng::from_str(yaml).map_err(|e| LinkError::Config {
            path: PathBuf::from("<inline>"),
            details: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration {}", path.display()))?;
        let config = Self::from_yaml(&text)
            .with_context(|| format!("Invalid configuration {}", path.display()))?;
        Ok(config)
    }

    /// Reject settings that would stall or spin the background loops.
    pub fn validate(&self) -> Result<()> {
        let durations = [
            ("discovery.timeout_secs", self.discovery.timeout_secs),
            ("supervisor.retry_interval_secs", self.supervisor.retry_interval_secs),
            ("supervisor.monitor_interval_secs", self.supervisor.monitor_interval_secs),
            ("supervisor.join_timeout_secs", self.supervisor.join_timeout_secs),
            ("channel.poll_timeout_secs", self.channel.poll_timeout_secs),
            ("channel.close_timeout_secs", self.channel.close_timeout_secs),
            ("api.request_timeout_secs", self.api.request_timeout_secs),
            ("udp.receive_timeout_secs", self.udp.receive_timeout_secs),
            ("udp.close_timeout_secs", self.udp.close_timeout_secs),
        ];
        for (key, secs) in durations {
            if !secs.is_finite() || secs <= 0.0 || Duration::try_from_secs_f64(secs).is_err() {
                return Err(invalid(format!("{} must be a positive number of seconds, got {}", key, secs)));
            }
            if secs > MAX_DURATION_SECS {
                return Err(invalid(format!("{} must be at most {} seconds, got {}", key, MAX_DURATION_SECS, secs)));
            }
        }
        if self.discovery.max_packet < crate::beacon::HEADER_LEN {
            return Err(invalid(format!("discovery.max_packet {} cannot hold a beacon", self.discovery.max_packet)));
        }
        if self.supervisor.warn_every == 0 {
            return Err(invalid("supervisor.warn_every must be at least 1"));
        }
        if self.supervisor.min_version > self.supervisor.max_version {
            return Err(invalid("supervisor.min_version exceeds supervisor.max_version"));
        }
        if self.channel.outbound_capacity == 0 || self.channel.outbound_capacity > MAX_OUTBOUND_CAPACITY {
            return Err(invalid(format!(
                "channel.outbound_capacity must be between 1 and {}, got {}",
                MAX_OUTBOUND_CAPACITY, self.channel.outbound_capacity
            )));
        }
        if self.udp.frequency == 0 {
            return Err(invalid("udp.frequency must be at least 1, 0 cancels a subscription"));
        }
        if self.udp.max_timeouts == 0 {
            return Err(invalid("udp.max_timeouts must be at least 1"));
        }
        Ok(())
    }
}

fn invalid(details: impl Into<String>) -> LinkError {
    LinkError::Config { path: PathBuf::from("<validated>"), details: details.into() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_xplane() {
        let config = LinkConfig::default();
        assert_eq!(config.discovery.group, Ipv4Addr::new(239, 255, 1, 1));
        assert_eq!(config.discovery.port, 49707);
        assert_eq!(config.discovery.timeout(), Duration::from_secs(3));
        assert_eq!(config.discovery.max_packet, 1472);
        assert_eq!(config.supervisor.retry_interval(), Duration::from_secs(10));
        assert_eq!(config.supervisor.warn_every, 10);
        assert_eq!(config.api.root, "/api");
        assert_eq!(config.api.local_port, 8086);
        assert_eq!(config.api.remote_port, 8080);
        assert_eq!(config.udp.frequency, 2);
        assert_eq!(config.udp.receive_timeout(), Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_document_is_default() {
        assert_eq!(LinkConfig::from_yaml("{}").unwrap(), LinkConfig::default());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let yaml = "supervisor:\n  retry_interval_secs: 2.5\napi:\n  preferred_version: v1\n";
        let config = LinkConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.supervisor.retry_interval(), Duration::from_millis(2500));
        assert_eq!(config.supervisor.monitor_interval(), Duration::from_secs(10));
        assert_eq!(config.api.preferred_version.as_deref(), Some("v1"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = LinkConfig::from_yaml("discovery:\n  grup: 1.2.3.4\n").unwrap_err();
        assert!(matches!(err, LinkError::Config { .. }));
    }

    #[test]
    fn zero_timeouts_are_rejected() {
        let err = LinkConfig::from_yaml("channel:\n  poll_timeout_secs: 0\n").unwrap_err();
        assert!(err.to_string().contains("poll_timeout_secs"));
    }

    #[test]
    fn huge_intervals_are_rejected() {
        let err = LinkConfig::from_yaml("supervisor:\n  retry_interval_secs: 1e30\n").unwrap_err();
        assert!(matches!(err, LinkError::Config { .. }));
        assert!(err.to_string().contains("retry_interval_secs"));

        let err = LinkConfig::from_yaml("channel:\n  close_timeout_secs: 86401\n").unwrap_err();
        assert!(err.to_string().contains("close_timeout_secs"));

        assert!(LinkConfig::from_yaml("channel:\n  outbound_capacity: 100000000\n").is_err());
    }

    #[test]
    fn unvalidated_durations_are_clamped() {
        let mut config = LinkConfig::default();
        config.supervisor.retry_interval_secs = 1e30;
        config.supervisor.monitor_interval_secs = f64::NAN;
        config.channel.poll_timeout_secs = -1.0;
        config.api.request_timeout_secs = f64::INFINITY;

        assert_eq!(config.supervisor.retry_interval(), Duration::from_secs(86_400));
        assert_eq!(config.supervisor.monitor_interval(), Duration::ZERO);
        assert_eq!(config.channel.poll_timeout(), Duration::ZERO);
        assert_eq!(config.api.request_timeout(), Duration::from_secs(86_400));
        assert!(config.validate().is_err());
    }

    #[test]
    fn inverted_version_window_is_rejected() {
        let yaml = "supervisor:\n  min_version: 121400\n  max_version: 121100\n";
        assert!(LinkConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "discovery:\n  port: 49000\n").unwrap();
        let config = LinkConfig::from_file(file.path()).unwrap();
        assert_eq!(config.discovery.port, 49000);
    }

    #[test]
    fn missing_file_names_path() {
        let err = LinkConfig::from_file("/nonexistent/xplink.yaml").unwrap_err();
        assert!(format!("{:#}", err).contains("/nonexistent/xplink.yaml"));
    }
}
