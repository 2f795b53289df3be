//! Log output for applications embedding the link
//!
//! The library only emits `tracing` events; installing a subscriber is left
//! to the application. [`init`] is a ready-made one: compact console output
//! filtered by `RUST_LOG`, falling back to a default directive.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};

/// Directive used when `RUST_LOG` is unset: link logs at info, the rest at warn.
pub const DEFAULT_DIRECTIVE: &str = "warn,xplink=info";

/// Filter from `RUST_LOG`, or `default` if unset or invalid.
pub fn env_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Install a global console subscriber.
///
/// Fails if a global subscriber is already installed.
pub fn init(default: &str) -> Result<(), TryInitError> {
    let console = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::NONE)
        .compact();

    tracing_subscriber::registry().with(env_filter(default)).with(console).try_init()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_directive_falls_back_to_default() {
        let filter = env_filter("definitely not [a directive");
        // EnvFilter::new skips directives it cannot parse
        assert!(!filter.to_string().contains("definitely"));
    }

    #[test]
    fn second_init_is_rejected() {
        let _ = init(DEFAULT_DIRECTIVE);
        assert!(init(DEFAULT_DIRECTIVE).is_err());
    }
}
