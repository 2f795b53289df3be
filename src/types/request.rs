//! In-flight request bookkeeping

use std::time::Instant;

/// What an outbound request asked the simulator to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Subscribe,
    Unsubscribe,
    Other,
}

/// A request awaiting its `result` message.
///
/// Removed when acknowledged or when the channel is torn down.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub req_id: u64,
    pub kind: RequestKind,
    pub sent_at: Instant,
}

impl PendingRequest {
    pub fn new(req_id: u64, kind: RequestKind) -> Self {
        Self { req_id, kind, sent_at: Instant::now() }
    }
}
