//! Long-lived connectivity tasks.
//!
//! - [`ConnectionSupervisor`] finds the simulator and reports connectivity changes
//! - [`SubscriptionChannel`] carries requests and value updates for one session

pub mod channel;
pub mod supervisor;


pub use channel::{ChannelEvent, EventCallback, SubscriptionChannel};
pub use supervisor::{ConnectionSupervisor, ConnectivityCallback};
