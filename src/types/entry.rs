//! Registry entries for datarefs and commands
//!
//! Entries are shared as `Arc`s between the registry, the subscription
//! channel's receive task and whoever holds them from a callback. Identity
//! fields are immutable; the value state sits behind a lock that is held only
//! for the duration of a single update.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::value::{Value, ValueType, json_array, json_f64, json_i64};
use crate::{LinkError, Result};

/// Highest array index accepted for a subscription or an update.
///
/// Array values are stored densely, so an index also sizes the stored vector.
pub const MAX_ARRAY_INDEX: u32 = 65_535;

#[derive(Debug, Default)]
struct VariableState {
    value: Value,
    previous: Value,
    indices: BTreeSet<u32>,
    previous_indices: BTreeSet<u32>,
    updates: u64,
}

/// A resolved dataref and its most recent value.
#[derive(Debug)]
pub struct VariableEntry {
    name: String,
    id: i64,
    value_type: ValueType,
    is_writable: bool,
    state: RwLock<VariableState>,
}

impl VariableEntry {
    pub fn new(name: impl Into<String>, id: i64, value_type: ValueType) -> Self {
        Self { name: name.into(), id, value_type, is_writable: false, state: RwLock::default() }
    }

    pub fn with_writable(mut self, is_writable: bool) -> Self {
        self.is_writable = is_writable;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Simulator-assigned id, valid for the current simulator session only.
    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    pub fn is_writable(&self) -> bool {
        self.is_writable
    }

    pub fn value(&self) -> Value {
        self.read().value.clone()
    }

    /// Value before the most recent update.
    pub fn previous_value(&self) -> Value {
        self.read().previous.clone()
    }

    /// Single element of an array dataref.
    pub fn value_at(&self, index: u32) -> Option<Value> {
        self.read().value.element(index as usize)
    }

    /// Number of updates applied since the entry was created.
    pub fn update_count(&self) -> u64 {
        self.read().updates
    }

    /// Subscribed array indices, in ascending order.
    pub fn indices(&self) -> Vec<u32> {
        self.read().indices.iter().copied().collect()
    }

    /// Register an array index. Returns `false` if it was already registered
    /// or is above [`MAX_ARRAY_INDEX`].
    pub fn append_index(&self, index: u32) -> bool {
        if index > MAX_ARRAY_INDEX {
            return false;
        }
        let mut state = self.write();
        if state.indices.contains(&index) {
            return false;
        }
        state.previous_indices = state.indices.clone();
        state.indices.insert(index);
        true
    }

    /// Unregister an array index. Returns `false` if it was not registered.
    pub fn remove_index(&self, index: u32) -> bool {
        let mut state = self.write();
        if !state.indices.contains(&index) {
            return false;
        }
        state.previous_indices = state.indices.clone();
        state.indices.remove(&index);
        true
    }

    /// Apply one value from an update message.
    ///
    /// Array datarefs with registered indices receive one element per index,
    /// in ascending index order. A payload sized for the index set that was
    /// active before the last index change is applied to that set; any other
    /// size mismatch fails without touching the stored value.
    pub fn apply_update(&self, payload: &serde_json::Value) -> Result<()> {
        let mut state = self.write();
        let next = if self.value_type.is_array() && !state.indices.is_empty() {
            let items = json_array(payload)?;
            let targets: Vec<u32> = if items.len() == state.indices.len() {
                state.indices.iter().copied().collect()
            } else if !state.previous_indices.is_empty() && items.len() == state.previous_indices.len() {
                state.previous_indices.iter().copied().collect()
            } else {
                return Err(LinkError::decode(
                    format!("update for {}", self.name),
                    format!("{} values for {} subscribed indices", items.len(), state.indices.len()),
                ));
            };
            scatter(&state.value, self.value_type, &targets, items)?
        } else {
            Value::from_json(self.value_type, payload)?
        };
        state.previous = std::mem::replace(&mut state.value, next);
        state.updates += 1;
        Ok(())
    }

    fn read(&self) -> RwLockReadGuard<'_, VariableState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, VariableState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Write `items` into a copy of `current` at the `targets` positions.
fn scatter(current: &Value, value_type: ValueType, targets: &[u32], items: &[serde_json::Value]) -> Result<Value> {
    let max = targets.iter().max().copied();
    if let Some(max) = max
        && max > MAX_ARRAY_INDEX
    {
        return Err(LinkError::decode("array update", format!("index {} above {}", max, MAX_ARRAY_INDEX)));
    }
    let len = max.map_or(0, |max| max as usize + 1);
    match value_type {
        ValueType::IntArray => {
            let mut values = match current {
                Value::IntArray(v) => v.clone(),
                _ => Vec::new(),
            };
            if values.len() < len {
                values.resize(len, 0);
            }
            for (index, item) in targets.iter().zip(items) {
                values[*index as usize] = json_i64(item)?;
            }
            Ok(Value::IntArray(values))
        }
        _ => {
            let mut values = match current {
                Value::FloatArray(v) => v.clone(),
                _ => Vec::new(),
            };
            if values.len() < len {
                values.resize(len, 0.0);
            }
            for (index, item) in targets.iter().zip(items) {
                values[*index as usize] = json_f64(item)?;
            }
            Ok(Value::FloatArray(values))
        }
    }
}

/// A resolved simulator command.
#[derive(Debug)]
pub struct CommandEntry {
    name: String,
    id: i64,
    description: Option<String>,
    active: AtomicBool,
}

impl CommandEntry {
    pub fn new(name: impl Into<String>, id: i64, description: Option<String>) -> Self {
        Self { name: name.into(), id, description, active: AtomicBool::new(false) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Last reported activity state.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scalar_update_keeps_previous_value() {
        let entry = VariableEntry::new("sim/cockpit/autopilot/altitude", 7, ValueType::Float);
        entry.apply_update(&json!(1000.0)).unwrap();
        entry.apply_update(&json!(2000.0)).unwrap();

        assert_eq!(entry.value(), Value::Float(2000.0));
        assert_eq!(entry.previous_value(), Value::Float(1000.0));
        assert_eq!(entry.update_count(), 2);
    }

    #[test]
    fn indexed_update_touches_only_subscribed_positions() {
        let entry = VariableEntry::new("arr", 3, ValueType::FloatArray);
        entry.append_index(5);
        entry.append_index(2);
        entry.apply_update(&json!([9.0, 9.0])).unwrap();

        assert_eq!(entry.value(), Value::FloatArray(vec![0.0, 0.0, 9.0, 0.0, 0.0, 9.0]));
        assert_eq!(entry.value_at(2), Some(Value::Float(9.0)));
        assert_eq!(entry.value_at(4), Some(Value::Float(0.0)));
    }

    #[test]
    fn indexed_update_preserves_other_elements() {
        let entry = VariableEntry::new("arr", 3, ValueType::IntArray);
        entry.apply_update(&json!([1, 2, 3, 4])).unwrap();
        entry.append_index(1);
        entry.apply_update(&json!([20])).unwrap();

        assert_eq!(entry.value(), Value::IntArray(vec![1, 20, 3, 4]));
    }

    #[test]
    fn size_mismatch_leaves_value_untouched() {
        let entry = VariableEntry::new("arr", 3, ValueType::FloatArray);
        entry.append_index(2);
        entry.append_index(5);
        entry.apply_update(&json!([1.0, 2.0])).unwrap();

        let err = entry.apply_update(&json!([9.0, 9.0, 9.0])).unwrap_err();
        assert!(matches!(err, LinkError::Decode { .. }));
        assert_eq!(entry.value_at(2), Some(Value::Float(1.0)));
        assert_eq!(entry.update_count(), 1);
    }

    #[test]
    fn late_update_applies_to_previous_indices() {
        let entry = VariableEntry::new("arr", 3, ValueType::FloatArray);
        entry.append_index(0);
        entry.append_index(1);
        entry.append_index(4);

        // Update sized for {0, 1} still in flight when index 4 was added
        entry.apply_update(&json!([5.0, 6.0])).unwrap();
        assert_eq!(entry.value(), Value::FloatArray(vec![5.0, 6.0]));
    }

    #[test]
    fn index_registration_is_idempotent() {
        let entry = VariableEntry::new("arr", 3, ValueType::IntArray);
        assert!(entry.append_index(3));
        assert!(!entry.append_index(3));
        assert!(entry.remove_index(3));
        assert!(!entry.remove_index(3));
        assert!(entry.indices().is_empty());
    }

    #[test]
    fn out_of_range_index_is_refused() {
        let entry = VariableEntry::new("arr", 3, ValueType::FloatArray);
        assert!(!entry.append_index(4_000_000_000));
        assert!(entry.indices().is_empty());
        assert!(entry.append_index(MAX_ARRAY_INDEX));

        entry.apply_update(&json!([1.5])).unwrap();
        assert_eq!(entry.value_at(MAX_ARRAY_INDEX), Some(Value::Float(1.5)));
    }

    #[test]
    fn scatter_rejects_index_above_limit() {
        let current = Value::FloatArray(vec![1.0, 2.0]);
        let err = scatter(&current, ValueType::FloatArray, &[0, 4_000_000_000], &[json!(3.0), json!(4.0)]).unwrap_err();
        assert!(matches!(err, LinkError::Decode { .. }));
    }

    #[test]
    fn data_update_decodes_string() {
        let entry = VariableEntry::new("sim/aircraft/view/acf_tailnum", 9, ValueType::Data);
        entry.apply_update(&json!("QUJDAAA=")).unwrap();
        assert_eq!(entry.value(), Value::String("ABC".into()));
    }

    #[test]
    fn command_activity_is_tracked() {
        let command = CommandEntry::new("sim/lights/landing_lights_on", 11, None);
        assert!(!command.is_active());
        command.set_active(true);
        assert!(command.is_active());
        assert_eq!(command.description(), None);
    }
}
