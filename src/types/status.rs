//! Connectivity status

use serde::{Deserialize, Serialize};

/// Connectivity state owned by the connection supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum ConnectionStatus {
    /// Supervisor loop not running
    #[default]
    Idle = 0,
    /// Loop running, no simulator found
    Searching = 1,
    /// Loop running, simulator beacon current
    Connected = 2,
}

impl ConnectionStatus {
    pub(crate) const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => ConnectionStatus::Searching,
            2 => ConnectionStatus::Connected,
            _ => ConnectionStatus::Idle,
        }
    }

    pub const fn is_running(&self) -> bool {
        !matches!(self, ConnectionStatus::Idle)
    }
}
