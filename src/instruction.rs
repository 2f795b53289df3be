//! Named simulator instructions
//!
//! An [`InstructionTable`] maps names (typically a deck button action) to a
//! small [`Instruction`] descriptor. Executing a name resolves its commands and
//! datarefs through the channel's [`Registry`](crate::Registry), so ids are
//! always those of the current session.
//!
//! ```rust
//! use xplink::instruction::{Instruction, InstructionTable};
//!
//! let table = InstructionTable::from_yaml(
//!     r#"
//! gear_down:
//!   kind: once
//!   command: sim/flight_controls/landing_gear_down
//! starter:
//!   kind: hold
//!   command: sim/starters/engage_starter_1
//! "#,
//! )
//! .unwrap();
//! assert!(matches!(table.get("starter"), Some(Instruction::Hold { .. })));
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::connection::SubscriptionChannel;
use crate::types::Value;
use crate::{LinkError, Result};

/// What to ask of the simulator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Instruction {
    /// Single command press
    Once { command: String },
    /// Start a command, leaving it active
    Begin { command: String },
    /// Stop an active command
    End { command: String },
    /// Begin on one execution, end on the next
    Hold { command: String },
    /// Write a dataref, or one element with `path[index]`
    SetDataref { dataref: String, value: Value },
    /// Run each step in order, stopping at the first failure
    Sequence { steps: Vec<Instruction> },
}

impl Instruction {
    pub fn once(command: impl Into<String>) -> Self {
        Instruction::Once { command: command.into() }
    }

    pub fn hold(command: impl Into<String>) -> Self {
        Instruction::Hold { command: command.into() }
    }

    pub fn set_dataref(dataref: impl Into<String>, value: Value) -> Self {
        Instruction::SetDataref { dataref: dataref.into(), value }
    }
}

/// Name to instruction mapping, with the press state of `hold` instructions.
#[derive(Debug, Default)]
pub struct InstructionTable {
    instructions: BTreeMap<String, Instruction>,
    held: Mutex<HashSet<String>>,
}

impl InstructionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a YAML mapping of name to instruction.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let instructions: BTreeMap<String, Instruction> = serde_yaml_ng::from_str(yaml)
            .map_err(|e| LinkError::Config { path: PathBuf::from("<instructions>"), details: e.to_string() })?;
        Ok(Self { instructions, held: Mutex::default() })
    }

    /// Add or replace an instruction, returning the previous one.
    pub fn insert(&mut self, name: impl Into<String>, instruction: Instruction) -> Option<Instruction> {
        let name = name.into();
        self.held_names().remove(&name);
        self.instructions.insert(name, instruction)
    }

    pub fn remove(&mut self, name: &str) -> Option<Instruction> {
        self.held_names().remove(name);
        self.instructions.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&Instruction> {
        self.instructions.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.instructions.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Whether a `hold` instruction is currently pressed.
    pub fn is_held(&self, name: &str) -> bool {
        self.held_names().contains(name)
    }

    /// Execute the instruction registered under `name`.
    ///
    /// Returns the request ids sent, in order.
    pub async fn execute(&self, name: &str, channel: &SubscriptionChannel) -> Result<Vec<u64>> {
        let instruction = self
            .instructions
            .get(name)
            .ok_or_else(|| LinkError::LookupMiss { name: name.to_string(), kind: "instruction" })?;
        debug!(instruction = name, "Executing {:?}", instruction);
        let mut sent = Vec::new();
        self.run(name, instruction, channel, &mut sent).await?;
        Ok(sent)
    }

    fn run<'a>(
        &'a self,
        name: &'a str,
        instruction: &'a Instruction,
        channel: &'a SubscriptionChannel,
        sent: &'a mut Vec<u64>,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            match instruction {
                Instruction::Once { command } => sent.push(channel.activate_command(command, 0.0).await?),
                Instruction::Begin { command } => sent.push(channel.set_command_active(command, true).await?),
                Instruction::End { command } => sent.push(channel.set_command_active(command, false).await?),
                Instruction::Hold { command } => {
                    let begin = {
                        let mut held = self.held_names();
                        if held.remove(name) { false } else { held.insert(name.to_string()) }
                    };
                    match channel.set_command_active(command, begin).await {
                        Ok(req_id) => sent.push(req_id),
                        Err(e) => {
                            self.toggle_back(name, begin);
                            return Err(e);
                        }
                    }
                }
                Instruction::SetDataref { dataref, value } => sent.push(channel.set_dataref(dataref, value.clone()).await?),
                Instruction::Sequence { steps } => {
                    for (position, step) in steps.iter().enumerate() {
                        if let Err(e) = self.run(name, step, channel, sent).await {
                            warn!(instruction = name, step = position, "Sequence stopped: {}", e);
                            return Err(e);
                        }
                    }
                }
            }
            Ok(())
        }
        .boxed()
    }

    fn toggle_back(&self, name: &str, began: bool) {
        let mut held = self.held_names();
        if began {
            held.remove(name);
        } else {
            held.insert(name.to_string());
        }
    }

    fn held_names(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
