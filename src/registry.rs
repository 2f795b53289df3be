//! Name to id cache for datarefs and commands
//!
//! The simulator addresses datarefs and commands by numeric ids that are
//! only valid for one simulator session. The [`Registry`] resolves names
//! lazily through a [`Directory`], caches the result as a shared entry, and
//! is reloaded when the simulator host changes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::types::{CommandEntry, ValueType, VariableEntry};
use crate::{LinkError, Result};

/// Dataref as listed by the simulator directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatarefRecord {
    pub id: i64,
    pub name: String,
    pub value_type: ValueType,
    #[serde(default)]
    pub is_writable: bool,
}

/// Command as listed by the simulator directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Filter-by-name lookup against the simulator's directory.
///
/// Only used to populate the registry, never on the update path.
#[async_trait::async_trait]
pub trait Directory: Send + Sync + 'static {
    /// Returns `Ok(None)` when no dataref has this name.
    async fn lookup_dataref(&self, name: &str) -> Result<Option<DatarefRecord>>;

    /// Returns `Ok(None)` when no command has this name.
    async fn lookup_command(&self, name: &str) -> Result<Option<CommandRecord>>;
}

/// Directory used before any simulator has been found.
struct Unbound;

#[async_trait::async_trait]
impl Directory for Unbound {
    async fn lookup_dataref(&self, name: &str) -> Result<Option<DatarefRecord>> {
        Err(LinkError::not_connected(format!("resolving dataref {}", name)))
    }

    async fn lookup_command(&self, name: &str) -> Result<Option<CommandRecord>> {
        Err(LinkError::not_connected(format!("resolving command {}", name)))
    }
}

#[derive(Default)]
struct Cache {
    datarefs: HashMap<String, Arc<VariableEntry>>,
    datarefs_by_id: HashMap<i64, Arc<VariableEntry>>,
    commands: HashMap<String, Arc<CommandEntry>>,
    commands_by_id: HashMap<i64, Arc<CommandEntry>>,
}

/// Cache of resolved datarefs and commands.
///
/// Resolving the same name twice without an intervening [`Registry::reload`]
/// performs one directory lookup and yields the same `Arc` both times.
pub struct Registry {
    directory: RwLock<Arc<dyn Directory>>,
    cache: Mutex<Cache>,
    generation: AtomicU64,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cache = self.cache();
        f.debug_struct("Registry")
            .field("datarefs", &cache.datarefs.len())
            .field("commands", &cache.commands.len())
            .field("generation", &self.generation.load(Ordering::Acquire))
            .finish()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::unbound()
    }
}

impl Registry {
    pub fn new(directory: Arc<dyn Directory>) -> Self {
        Self { directory: RwLock::new(directory), cache: Mutex::default(), generation: AtomicU64::new(0) }
    }

    /// Registry with no directory; every lookup fails with `NotConnected`.
    pub fn unbound() -> Self {
        Self::new(Arc::new(Unbound))
    }

    /// Resolve a dataref name, looking it up on first use.
    pub async fn resolve_dataref(&self, name: &str) -> Result<Option<Arc<VariableEntry>>> {
        loop {
            if let Some(entry) = self.cache().datarefs.get(name) {
                return Ok(Some(Arc::clone(entry)));
            }

            let generation = self.generation.load(Ordering::Acquire);
            let Some(record) = self.directory().lookup_dataref(name).await? else {
                debug!("Dataref {} not found in simulator directory", name);
                return Ok(None);
            };

            let mut cache = self.cache();
            if self.generation.load(Ordering::Acquire) != generation {
                // Reloaded while looking up; the id may belong to the old host
                continue;
            }
            let entry = Arc::clone(cache.datarefs.entry(name.to_string()).or_insert_with(|| {
                Arc::new(VariableEntry::new(name, record.id, record.value_type).with_writable(record.is_writable))
            }));
            cache.datarefs_by_id.insert(entry.id(), Arc::clone(&entry));
            debug!(id = entry.id(), value_type = ?entry.value_type(), "Resolved dataref {}", name);
            return Ok(Some(entry));
        }
    }

    /// Resolve a command name, looking it up on first use.
    pub async fn resolve_command(&self, name: &str) -> Result<Option<Arc<CommandEntry>>> {
        loop {
            if let Some(entry) = self.cache().commands.get(name) {
                return Ok(Some(Arc::clone(entry)));
            }

            let generation = self.generation.load(Ordering::Acquire);
            let Some(record) = self.directory().lookup_command(name).await? else {
                debug!("Command {} not found in simulator directory", name);
                return Ok(None);
            };

            let mut cache = self.cache();
            if self.generation.load(Ordering::Acquire) != generation {
                continue;
            }
            let entry = Arc::clone(
                cache
                    .commands
                    .entry(name.to_string())
                    .or_insert_with(|| Arc::new(CommandEntry::new(name, record.id, record.description))),
            );
            cache.commands_by_id.insert(entry.id(), Arc::clone(&entry));
            debug!(id = entry.id(), "Resolved command {}", name);
            return Ok(Some(entry));
        }
    }

    /// Cached dataref for a simulator id.
    pub fn dataref_by_id(&self, id: i64) -> Option<Arc<VariableEntry>> {
        self.cache().datarefs_by_id.get(&id).cloned()
    }

    /// Cached command for a simulator id.
    pub fn command_by_id(&self, id: i64) -> Option<Arc<CommandEntry>> {
        self.cache().commands_by_id.get(&id).cloned()
    }

    /// Cached dataref for a name, without lookup.
    pub fn cached_dataref(&self, name: &str) -> Option<Arc<VariableEntry>> {
        self.cache().datarefs.get(name).cloned()
    }

    /// Register a subscribed array index on a cached dataref.
    ///
    /// Returns `false` if the dataref is not cached or the index was already registered.
    pub fn append_index(&self, name: &str, index: u32) -> bool {
        self.cached_dataref(name).is_some_and(|entry| entry.append_index(index))
    }

    /// Unregister a subscribed array index on a cached dataref.
    pub fn remove_index(&self, name: &str, index: u32) -> bool {
        self.cached_dataref(name).is_some_and(|entry| entry.remove_index(index))
    }

    /// Number of cached datarefs and commands.
    pub fn len(&self) -> (usize, usize) {
        let cache = self.cache();
        (cache.datarefs.len(), cache.commands.len())
    }

    pub fn is_empty(&self) -> bool {
        let cache = self.cache();
        cache.datarefs.is_empty() && cache.commands.is_empty()
    }

    /// Discard every cached entry; names are looked up again on next use.
    pub fn reload(&self) {
        let mut cache = self.cache();
        self.generation.fetch_add(1, Ordering::AcqRel);
        let dropped = (cache.datarefs.len(), cache.commands.len());
        *cache = Cache::default();
        info!(datarefs = dropped.0, commands = dropped.1, "Registry cache reloaded");
    }

    /// Point the registry at a new directory and discard the cache.
    pub fn rebind(&self, directory: Arc<dyn Directory>) {
        *self.directory.write().unwrap_or_else(PoisonError::into_inner) = directory;
        self.reload();
    }

    fn directory(&self) -> Arc<dyn Directory> {
        Arc::clone(&self.directory.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn cache(&self) -> MutexGuard<'_, Cache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockDirectory;

    fn directory() -> Arc<MockDirectory> {
        Arc::new(
            MockDirectory::new()
                .with_dataref(1, "sim/cockpit/radios/com1_freq_hz", ValueType::Int)
                .with_dataref(2, "sim/flightmodel/engine/ENGN_N1_", ValueType::FloatArray)
                .with_command(10, "sim/lights/landing_lights_toggle"),
        )
    }

    #[tokio::test]
    async fn resolve_twice_looks_up_once() {
        let dir = directory();
        let registry = Registry::new(dir.clone());

        let first = registry.resolve_dataref("sim/cockpit/radios/com1_freq_hz").await.unwrap().unwrap();
        let second = registry.resolve_dataref("sim/cockpit/radios/com1_freq_hz").await.unwrap().unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(dir.dataref_lookups(), 1);
        assert_eq!(first.id(), 1);
    }

    #[tokio::test]
    async fn miss_is_not_fatal() {
        let dir = directory();
        let registry = Registry::new(dir.clone());

        assert!(registry.resolve_dataref("sim/nothing").await.unwrap().is_none());
        assert!(registry.resolve_command("sim/nothing").await.unwrap().is_none());
        assert_eq!(registry.len(), (0, 0));
    }

    #[tokio::test]
    async fn resolved_entries_are_found_by_id() {
        let registry = Registry::new(directory());
        let engine = registry.resolve_dataref("sim/flightmodel/engine/ENGN_N1_").await.unwrap().unwrap();
        let lights = registry.resolve_command("sim/lights/landing_lights_toggle").await.unwrap().unwrap();

        assert!(Arc::ptr_eq(&registry.dataref_by_id(2).unwrap(), &engine));
        assert!(Arc::ptr_eq(&registry.command_by_id(10).unwrap(), &lights));
        assert!(registry.dataref_by_id(99).is_none());
    }

    #[tokio::test]
    async fn reload_forces_new_lookup() {
        let dir = directory();
        let registry = Registry::new(dir.clone());

        let before = registry.resolve_dataref("sim/cockpit/radios/com1_freq_hz").await.unwrap().unwrap();
        registry.reload();
        assert!(registry.dataref_by_id(1).is_none());
        let after = registry.resolve_dataref("sim/cockpit/radios/com1_freq_hz").await.unwrap().unwrap();

        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(dir.dataref_lookups(), 2);
    }

    #[tokio::test]
    async fn rebind_uses_new_directory_ids() {
        let registry = Registry::new(directory());
        registry.resolve_dataref("sim/cockpit/radios/com1_freq_hz").await.unwrap();

        let restarted = Arc::new(MockDirectory::new().with_dataref(77, "sim/cockpit/radios/com1_freq_hz", ValueType::Int));
        registry.rebind(restarted);

        let entry = registry.resolve_dataref("sim/cockpit/radios/com1_freq_hz").await.unwrap().unwrap();
        assert_eq!(entry.id(), 77);
    }

    #[tokio::test]
    async fn index_registration_goes_through_cache() {
        let registry = Registry::new(directory());
        assert!(!registry.append_index("sim/flightmodel/engine/ENGN_N1_", 0));

        registry.resolve_dataref("sim/flightmodel/engine/ENGN_N1_").await.unwrap();
        assert!(registry.append_index("sim/flightmodel/engine/ENGN_N1_", 1));
        assert!(registry.append_index("sim/flightmodel/engine/ENGN_N1_", 0));
        assert_eq!(registry.cached_dataref("sim/flightmodel/engine/ENGN_N1_").unwrap().indices(), vec![0, 1]);
        assert!(registry.remove_index("sim/flightmodel/engine/ENGN_N1_", 1));
    }

    #[tokio::test]
    async fn unbound_registry_reports_not_connected() {
        let registry = Registry::unbound();
        let err = registry.resolve_dataref("sim/x").await.unwrap_err();
        assert!(matches!(err, LinkError::NotConnected { .. }));
    }

    #[tokio::test]
    async fn concurrent_resolution_shares_one_entry() {
        let registry = Arc::new(Registry::new(directory()));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                registry.resolve_dataref("sim/cockpit/radios/com1_freq_hz").await.unwrap().unwrap()
            }));
        }
        let mut entries = Vec::new();
        for handle in handles {
            entries.push(handle.await.unwrap());
        }
        assert!(entries.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
    }
}
