//! Synchronous backend: named states held in memory, optionally written
//! through to a key-value store.

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use super::manager::StateManager;
use super::operations::{apply_change, find_item, CollectionChange, EqualityFn, ItemMatcher};
use crate::error::Result;
use crate::filter::{filter_items, FilterSpec};
use crate::kv::KeyValueStore;
use crate::notifications::{ChangeDelegate, ChangeEventType};
use crate::types::{NamedState, DEFAULT_KEY_FIELD};

/// Backend whose reads complete immediately.
///
/// With no storage this is a pure in-memory (session) backend; with a
/// [`KeyValueStore`] each collection is also stored as a JSON array under
/// `<prefix><name>` and reloaded on first access.
pub struct SyncStateManager {
    delegate: ChangeDelegate,
    states: RwLock<HashMap<String, NamedState>>,
    storage: Option<Arc<dyn KeyValueStore>>,
    key_prefix: String,
    matchers: RwLock<HashMap<String, ItemMatcher>>,
    default_key_field: String,
}

impl SyncStateManager {
    pub fn in_memory(backend_name: impl Into<String>) -> Self {
        Self {
            delegate: ChangeDelegate::new(backend_name),
            states: RwLock::new(HashMap::new()),
            storage: None,
            key_prefix: String::new(),
            matchers: RwLock::new(HashMap::new()),
            default_key_field: DEFAULT_KEY_FIELD.to_string(),
        }
    }

    pub fn with_storage(
        backend_name: impl Into<String>,
        storage: Arc<dyn KeyValueStore>,
        key_prefix: impl Into<String>,
    ) -> Self {
        Self {
            storage: Some(storage),
            key_prefix: key_prefix.into(),
            ..Self::in_memory(backend_name)
        }
    }

    /// Match records of `name` with a custom equality function.
    pub fn set_equality_fn(&self, name: &str, eq: EqualityFn) {
        self.matchers
            .write()
            .insert(name.to_string(), ItemMatcher::Custom(eq));
    }

    /// Match records of `name` on a key field other than the default.
    pub fn set_key_field(&self, name: &str, key_field: &str) {
        self.matchers
            .write()
            .insert(name.to_string(), ItemMatcher::key_field(key_field));
    }

    fn matcher_for(&self, name: &str) -> ItemMatcher {
        self.matchers
            .read()
            .get(name)
            .cloned()
            .unwrap_or_else(|| ItemMatcher::key_field(self.default_key_field.clone()))
    }

    fn storage_key(&self, name: &str) -> String {
        format!("{}{}", self.key_prefix, name)
    }

    fn load(&self, name: &str) -> Result<NamedState> {
        let mut state = NamedState::new(name);
        if let Some(storage) = &self.storage {
            if let Some(raw) = storage.get(&self.storage_key(name))? {
                match serde_json::from_str::<Vec<Value>>(&raw) {
                    Ok(values) => {
                        state.value = values;
                        state.has_been_set = true;
                    }
                    Err(e) => {
                        tracing::warn!(state = %name, error = %e, "stored state is not a JSON array, ignoring");
                    }
                }
            }
        }
        Ok(state)
    }

    fn persist(&self, state: &NamedState) -> Result<()> {
        if let Some(storage) = &self.storage {
            let encoded = serde_json::to_string(&state.value)?;
            storage.set(&self.storage_key(&state.name), &encoded)?;
        }
        Ok(())
    }

    /// Apply a change and persist it, returning the displaced record.
    fn mutate(&self, name: &str, change: CollectionChange) -> Result<Option<Value>> {
        let matcher = self.matcher_for(name);
        let needs_load = !self.states.read().contains_key(name);
        let loaded = if needs_load { Some(self.load(name)?) } else { None };

        let mut states = self.states.write();
        let state = states
            .entry(name.to_string())
            .or_insert_with(|| loaded.unwrap_or_else(|| NamedState::new(name)));
        let previous = apply_change(&mut state.value, change, &matcher)?;
        state.has_been_set = true;
        self.persist(state)?;
        Ok(previous)
    }

    fn snapshot(&self, name: &str) -> Result<Vec<Value>> {
        if let Some(state) = self.states.read().get(name) {
            return Ok(state.value.clone());
        }
        let loaded = self.load(name)?;
        let values = loaded.value.clone();
        self.states
            .write()
            .entry(name.to_string())
            .or_insert(loaded);
        Ok(values)
    }

    /// Whether a value was ever set for `name`.
    pub fn has_been_set(&self, name: &str) -> bool {
        self.states
            .read()
            .get(name)
            .map(|s| s.has_been_set)
            .unwrap_or(false)
    }
}

impl StateManager for SyncStateManager {
    fn delegate(&self) -> &ChangeDelegate {
        &self.delegate
    }

    fn get_state_by_name(&self, name: &str) -> Result<Vec<Value>> {
        self.snapshot(name)
    }

    fn set_state_by_name(&self, name: &str, values: Vec<Value>, _is_persisted: bool) -> Result<()> {
        self.mutate(name, CollectionChange::Replace(values.clone()))?;
        self.delegate
            .notify(name, ChangeEventType::StateChanged, Value::Array(values));
        Ok(())
    }

    fn add_new_item_to_state(&self, name: &str, item: Value, _is_persisted: bool) -> Result<()> {
        self.mutate(name, CollectionChange::Add(item.clone()))?;
        self.delegate.notify(name, ChangeEventType::ItemAdded, item);
        Ok(())
    }

    fn update_item_in_state(&self, name: &str, item: Value, _is_persisted: bool) -> Result<()> {
        let previous = self.mutate(name, CollectionChange::Update(item.clone()))?;
        self.delegate
            .notify_updated(name, item, previous.unwrap_or(Value::Null));
        Ok(())
    }

    fn remove_item_from_state(&self, name: &str, item: Value, _is_persisted: bool) -> Result<bool> {
        match self.mutate(name, CollectionChange::Remove(item))? {
            Some(removed) => {
                self.delegate
                    .notify(name, ChangeEventType::ItemDeleted, removed);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn find_item_in_state(&self, name: &str, item: &Value) -> Result<Option<Value>> {
        let values = self.snapshot(name)?;
        Ok(find_item(&values, item, &self.matcher_for(name)).cloned())
    }

    fn find_items_in_state(&self, name: &str, filter: &FilterSpec) -> Result<Vec<Value>> {
        let values = self.snapshot(name)?;
        Ok(filter_items(&values, filter))
    }
}
