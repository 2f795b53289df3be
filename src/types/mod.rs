//! Core data records for simulator connectivity.
//!
//! ## Architecture
//!
//! - [`BeaconRecord`] is the endpoint announced by a simulator beacon
//! - [`ConnectionStatus`] is the supervisor's state, observed only through its callback
//! - [`VariableEntry`] and [`CommandEntry`] are the registry's cached name/id bindings
//! - [`Value`] and [`ValueType`] model dataref payloads
//! - [`PendingRequest`] correlates outbound requests with their results
//!
//! ## Usage Example
//!
//! ```rust
//! use xplink::types::{Value, ValueType, VariableEntry};
//!
//! let entry = VariableEntry::new("sim/flightmodel/engine/ENGN_N1_", 42, ValueType::FloatArray);
//! entry.append_index(0);
//! entry.apply_update(&serde_json::json!([87.5])).unwrap();
//! assert_eq!(entry.value_at(0), Some(Value::Float(87.5)));
//! ```

mod beacon;
mod entry;
mod request;
mod status;
mod value;

pub use beacon::{BeaconRecord, ROLE_MASTER, local_addresses};
pub use entry::{CommandEntry, MAX_ARRAY_INDEX, VariableEntry};
pub use request::{PendingRequest, RequestKind};
pub use status::ConnectionStatus;
pub use value::{Value, ValueType, decode_data};
