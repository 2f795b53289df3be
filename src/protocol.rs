//! JSON envelopes of the X-Plane web API stream
//!
//! Outbound requests carry a `type`, a client-assigned `req_id` and
//! action-specific `params`:
//!
//! ```json
//! {"type": "dataref_subscribe_values", "req_id": 3,
//!  "params": {"datarefs": [{"id": 1234}, {"id": 5678, "index": [0, 2]}]}}
//! ```
//!
//! Inbound messages are either `result` acknowledgements or value/state
//! updates keyed by string-encoded ids.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::RequestKind;

/// Request `type` values understood by the simulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    DatarefSubscribeValues,
    DatarefUnsubscribeValues,
    DatarefSetValues,
    CommandSubscribeIsActive,
    CommandUnsubscribeIsActive,
    CommandSetIsActive,
}

impl Action {
    pub fn kind(&self) -> RequestKind {
        match self {
            Action::DatarefSubscribeValues | Action::CommandSubscribeIsActive => RequestKind::Subscribe,
            Action::DatarefUnsubscribeValues | Action::CommandUnsubscribeIsActive => RequestKind::Unsubscribe,
            Action::DatarefSetValues | Action::CommandSetIsActive => RequestKind::Other,
        }
    }
}

/// Array index selector; the simulator accepts a single index or a list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IndexSpec {
    One(u32),
    Many(Vec<u32>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatarefParam {
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<IndexSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

impl DatarefParam {
    /// Whole dataref, or whole array.
    pub fn whole(id: i64) -> Self {
        Self { id, index: None, value: None }
    }

    pub fn indices(id: i64, indices: Vec<u32>) -> Self {
        Self { id, index: Some(IndexSpec::Many(indices)), value: None }
    }

    pub fn set(id: i64, index: Option<u32>, value: serde_json::Value) -> Self {
        Self { id, index: index.map(IndexSpec::One), value: Some(value) }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandParam {
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
}

impl CommandParam {
    pub fn id(id: i64) -> Self {
        Self { id, is_active: None, duration: None }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Params {
    Datarefs(Vec<DatarefParam>),
    Commands(Vec<CommandParam>),
}

/// Outbound request envelope.
///
/// `req_id` is assigned by the channel at send time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "type")]
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub req_id: Option<u64>,
    pub params: Params,
}

impl Request {
    pub fn new(action: Action, params: Params) -> Self {
        Self { action, req_id: None, params }
    }

    pub fn subscribe_datarefs(datarefs: Vec<DatarefParam>) -> Self {
        Self::new(Action::DatarefSubscribeValues, Params::Datarefs(datarefs))
    }

    pub fn unsubscribe_datarefs(datarefs: Vec<DatarefParam>) -> Self {
        Self::new(Action::DatarefUnsubscribeValues, Params::Datarefs(datarefs))
    }

    pub fn set_datarefs(datarefs: Vec<DatarefParam>) -> Self {
        Self::new(Action::DatarefSetValues, Params::Datarefs(datarefs))
    }

    pub fn subscribe_commands(ids: impl IntoIterator<Item = i64>) -> Self {
        Self::new(Action::CommandSubscribeIsActive, Params::Commands(ids.into_iter().map(CommandParam::id).collect()))
    }

    pub fn unsubscribe_commands(ids: impl IntoIterator<Item = i64>) -> Self {
        Self::new(Action::CommandUnsubscribeIsActive, Params::Commands(ids.into_iter().map(CommandParam::id).collect()))
    }

    /// Press (`true`) or release (`false`) a command.
    pub fn set_command_active(id: i64, active: bool) -> Self {
        let param = CommandParam { id, is_active: Some(active), duration: None };
        Self::new(Action::CommandSetIsActive, Params::Commands(vec![param]))
    }

    /// Activate a command for `duration` seconds; zero is a single press.
    pub fn activate_command(id: i64, duration: f64) -> Self {
        let param = CommandParam { id, is_active: Some(true), duration: Some(duration) };
        Self::new(Action::CommandSetIsActive, Params::Commands(vec![param]))
    }

    pub fn with_req_id(mut self, req_id: u64) -> Self {
        self.req_id = Some(req_id);
        self
    }
}

/// Inbound message.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    /// Acknowledgement of a request
    Result {
        #[serde(default)]
        req_id: Option<u64>,
        success: bool,
        #[serde(default)]
        error_code: Option<serde_json::Value>,
        #[serde(default)]
        error_message: Option<String>,
    },
    /// Dataref values keyed by string-encoded id
    DatarefUpdateValues { data: BTreeMap<String, serde_json::Value> },
    /// Command activity keyed by string-encoded id
    CommandUpdateIsActive { data: BTreeMap<String, bool> },
    #[serde(other)]
    Unknown,
}

impl Inbound {
    pub fn parse(text: &str) -> crate::Result<Self> {
        serde_json::from_str(text).map_err(|e| crate::LinkError::decode("stream message", e.to_string()))
    }
}

/// Split `sim/some/values[4]` into its path and index.
///
/// Names without a well-formed trailing `[n]` are returned unchanged.
pub fn parse_dataref_path(name: &str) -> (&str, Option<u32>) {
    if let Some(open) = name.find('[')
        && let Some(stripped) = name[open + 1..].strip_suffix(']')
        && let Ok(index) = stripped.parse::<u32>()
    {
        return (&name[..open], Some(index));
    }
    (name, None)
}
