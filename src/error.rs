//! Error types for simulator connectivity.
//!
//! Every fallible operation in the crate returns [`LinkError`]. The variants
//! follow the failure modes of the connectivity layer, from beacon discovery
//! down to individual stream messages.
//!
//! ## Error Categories
//!
//! - **Discovery**: no beacon heard, unsupported beacon version, malformed packet
//! - **Session**: request rejected by the simulator, undecodable stream message
//! - **Lookup**: name not present in the simulator's dataref/command directory, or too long for UDP
//! - **Transport**: WebSocket, HTTP and socket failures
//! - **Usage**: calling an operation that needs a live session without one
//!
//! ## Recovery and Retry
//!
//! Transient failures are absorbed by the retry loops. Callers that do see an
//! error can ask whether retrying makes sense:
//!
//! ```rust
//! use std::time::Duration;
//! use xplink::LinkError;
//!
//! let error = LinkError::IpNotFound { timeout: Duration::from_secs(3) };
//! if error.is_retryable() {
//!     for suggestion in error.recovery_suggestions() {
//!         println!("  - {}", suggestion);
//!     }
//! }
//! ```

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for connectivity operations.
pub type Result<T, E = LinkError> = std::result::Result<T, E>;

/// Main error type for connectivity operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum LinkError {
    #[error("No running X-Plane instance found on the network within {timeout:?}")]
    IpNotFound { timeout: Duration },

    #[error("Beacon version not supported: {major}.{minor} (application host id {host_id})")]
    VersionNotSupported { major: u8, minor: u8, host_id: i32 },

    #[error("Malformed datagram ({len} bytes): {reason}")]
    MalformedPacket { reason: String, len: usize },

    #[error("Request {req_id} failed: {message}")]
    RequestFailed { req_id: u64, message: String },

    #[error("Decode error in {context}: {details}")]
    Decode { context: String, details: String },

    #[error("'{name}' not found in simulator {kind} directory")]
    LookupMiss { name: String, kind: &'static str },

    #[error("Invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("{operation} requires a connected simulator")]
    NotConnected { operation: String },

    #[error("Transport error: {reason}")]
    Transport {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("HTTP request to {url} failed")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Unexpected HTTP status {status} from {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("Configuration error in {path}: {details}")]
    Config { path: PathBuf, details: String },

    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("Socket error")]
    Io(#[from] std::io::Error),
}

impl LinkError {
    /// Returns whether this error is potentially recoverable through retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            LinkError::IpNotFound { .. } => true,
            // The broadcaster may have been a transient wrong source
            LinkError::VersionNotSupported { .. } => true,
            LinkError::MalformedPacket { .. } => true,
            LinkError::RequestFailed { .. } => false,
            LinkError::Decode { .. } => false,
            LinkError::LookupMiss { .. } => false,
            LinkError::InvalidName { .. } => false,
            LinkError::NotConnected { .. } => false,
            LinkError::Transport { .. } => true,
            LinkError::Http { .. } => true,
            LinkError::HttpStatus { status, .. } => *status >= 500,
            LinkError::Config { .. } => false,
            LinkError::Timeout { .. } => true,
            LinkError::Io(_) => true,
        }
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            LinkError::IpNotFound { .. } => vec![
                "Ensure X-Plane is running",
                "Check that this machine and X-Plane share a network segment",
                "Check that a firewall does not block UDP multicast on port 49707",
            ],
            LinkError::VersionNotSupported { .. } => vec![
                "Update X-Plane to a version with beacon protocol 1.0 to 1.2",
                "Check that the broadcaster is X-Plane and not PlaneMaker",
            ],
            LinkError::MalformedPacket { .. } => vec![
                "Ignore if another device broadcasts on the same multicast group",
                "Check the multicast group and port configuration",
            ],
            LinkError::RequestFailed { .. } => vec![
                "Check that the dataref is writable",
                "Verify the dataref or command exists on the loaded aircraft",
            ],
            LinkError::Decode { .. } => vec![
                "Check X-Plane web API version compatibility",
                "Verify the payload matches the dataref value type",
            ],
            LinkError::LookupMiss { .. } => vec![
                "Check dataref or command name spelling",
                "Verify the name exists for the currently loaded aircraft",
                "Commands require web API v2 (X-Plane 12.1.4 or later)",
            ],
            LinkError::InvalidName { .. } => vec![
                "Shorten the dataref or command name",
                "Remove NUL characters from the name",
            ],
            LinkError::NotConnected { .. } => vec![
                "Wait for the connectivity callback to report a connection",
                "Start the supervisor before issuing requests",
            ],
            LinkError::Transport { .. } => vec![
                "Check that the X-Plane web API is enabled",
                "Verify the web API port (8086 local, 8080 remote)",
            ],
            LinkError::Http { .. } | LinkError::HttpStatus { .. } => vec![
                "Check that the X-Plane web API is reachable",
                "Verify the selected API version is offered by X-Plane",
            ],
            LinkError::Config { .. } => vec![
                "Check the configuration file syntax",
                "Remove unknown keys from the configuration file",
            ],
            LinkError::Timeout { .. } => vec![
                "Increase timeout duration",
                "Check network latency to the simulator host",
            ],
            LinkError::Io(_) => vec![
                "Check that the multicast port is not exclusively bound",
                "Verify network interface availability",
            ],
        }
    }

    /// Helper constructor for malformed beacon packets.
    pub fn malformed(reason: impl Into<String>, len: usize) -> Self {
        LinkError::MalformedPacket { reason: reason.into(), len }
    }

    /// Helper constructor for stream and payload decode errors.
    pub fn decode(context: impl Into<String>, details: impl Into<String>) -> Self {
        LinkError::Decode { context: context.into(), details: details.into() }
    }

    /// Helper constructor for transport failures.
    pub fn transport(reason: impl Into<String>) -> Self {
        LinkError::Transport { reason: reason.into(), source: None }
    }

    /// Helper constructor for transport failures with source.
    pub fn transport_with_source(
        reason: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        LinkError::Transport { reason: reason.into(), source: Some(source) }
    }

    /// Helper constructor for operations issued without a session.
    pub fn not_connected(operation: impl Into<String>) -> Self {
        LinkError::NotConnected { operation: operation.into() }
    }

    /// Helper constructor for dataref directory misses.
    pub fn dataref_miss(name: impl Into<String>) -> Self {
        LinkError::LookupMiss { name: name.into(), kind: "dataref" }
    }

    /// Helper constructor for command directory misses.
    pub fn command_miss(name: impl Into<String>) -> Self {
        LinkError::LookupMiss { name: name.into(), kind: "command" }
    }

    /// Helper constructor for names that do not fit a UDP datagram.
    pub fn invalid_name(name: impl Into<String>, reason: impl Into<String>) -> Self {
        LinkError::InvalidName { name: name.into(), reason: reason.into() }
    }

    /// Whether this error only means "no simulator found yet".
    pub fn is_not_found(&self) -> bool {
        matches!(self, LinkError::IpNotFound { .. } | LinkError::MalformedPacket { .. })
    }
}

impl From<serde_json::Error> for LinkError {
    fn from(err: serde_json::Error) -> Self {
        LinkError::Decode { context: "JSON".to_string(), details: err.to_string() }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for LinkError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        LinkError::Transport { reason: "WebSocket".to_string(), source: Some(Box::new(err)) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn error_messages_carry_their_context(
                name in "[a-z]+(/[a-z_]+){1,4}",
                reason in ".*",
                req_id in 1u64..1_000_000u64,
                major in 0u8..=255u8,
                minor in 0u8..=255u8,
                host_id in -5i32..5i32,
                len in 0usize..1472usize,
            ) {
                let miss = LinkError::dataref_miss(name.clone());
                prop_assert!(miss.to_string().contains(&name));

                let malformed = LinkError::malformed(reason.clone(), len);
                let msg = malformed.to_string();
                prop_assert!(msg.contains(&reason));
                prop_assert!(msg.contains(&len.to_string()));

                let failed = LinkError::RequestFailed { req_id, message: reason.clone() };
                prop_assert!(failed.to_string().contains(&req_id.to_string()));

                let version = LinkError::VersionNotSupported { major, minor, host_id };
                let version_msg = version.to_string();
                let expected_version = format!("{}.{}", major, minor);
                prop_assert!(version_msg.contains(&expected_version));
            }

            #[test]
            fn io_errors_convert_with_source(reason in ".*") {
                let io_err = std::io::Error::other(reason.clone());
                let converted: LinkError = io_err.into();
                match &converted {
                    LinkError::Io(source) => prop_assert_eq!(source.to_string(), reason),
                    _ => prop_assert!(false, "Expected Io error from io::Error conversion"),
                }
                prop_assert!(std::error::Error::source(&converted).is_some());
            }
        }
    }

    #[test]
    fn discovery_failures_are_retryable() {
        let not_found = LinkError::IpNotFound { timeout: Duration::from_secs(3) };
        let version = LinkError::VersionNotSupported { major: 2, minor: 0, host_id: 1 };
        let malformed = LinkError::malformed("bad magic", 12);

        assert!(not_found.is_retryable());
        assert!(version.is_retryable());
        assert!(malformed.is_retryable());
        assert!(not_found.is_not_found());
        assert!(malformed.is_not_found());
        assert!(!version.is_not_found());
    }

    #[test]
    fn session_failures_are_advisory() {
        let failed = LinkError::RequestFailed { req_id: 7, message: "not writable".into() };
        let miss = LinkError::command_miss("sim/none");

        assert!(!failed.is_retryable());
        assert!(!miss.is_retryable());
        assert!(matches!(miss, LinkError::LookupMiss { kind: "command", .. }));
        assert!(!LinkError::invalid_name("sim/x", "too long").is_retryable());
    }

    #[test]
    fn recovery_suggestions_are_descriptive() {
        let errors = [
            LinkError::IpNotFound { timeout: Duration::from_secs(1) },
            LinkError::not_connected("subscribe"),
            LinkError::transport("closed"),
            LinkError::Timeout { duration: Duration::from_millis(10) },
        ];
        for error in &errors {
            let suggestions = error.recovery_suggestions();
            assert!(!suggestions.is_empty());
            assert!(suggestions.iter().all(|s| s.len() > 5));
        }
    }

    #[test]
    fn http_status_retry_depends_on_class() {
        let server = LinkError::HttpStatus { url: "http://x/api".into(), status: 503 };
        let client = LinkError::HttpStatus { url: "http://x/api".into(), status: 404 };
        assert!(server.is_retryable());
        assert!(!client.is_retryable());
    }

    #[test]
    fn error_traits_validation() {
        fn assert_send_sync_static<T: Send + Sync + 'static>() {}
        assert_send_sync_static::<LinkError>();

        let error = LinkError::transport("test");
        let _: &dyn std::error::Error = &error;
    }

    #[test]
    fn json_errors_become_decode_errors() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let converted: LinkError = err.into();
        assert!(matches!(converted, LinkError::Decode { .. }));
    }
}
