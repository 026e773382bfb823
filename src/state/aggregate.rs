//! Routes named collections to the backends registered for them.

use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;

use super::manager::StateManager;
use crate::error::Result;
use crate::filter::FilterSpec;
use crate::notifications::{ChangeDelegate, ListenerId, StateChangeListener};

struct RegisteredBackend {
    manager: Arc<dyn StateManager>,
    /// Names routed here; None defers to `is_state_managed`.
    names: Option<Vec<String>>,
}

impl RegisteredBackend {
    fn handles(&self, name: &str) -> bool {
        match &self.names {
            Some(names) => names.iter().any(|n| n == name),
            None => self.manager.is_state_managed(name),
        }
    }
}

/// Fans writes out to every backend handling a name and reads from the
/// first one. A name nobody handles goes to the fallback backend, or is
/// logged and ignored when there is none.
pub struct AggregateStateManager {
    delegate: ChangeDelegate,
    backends: RwLock<Vec<RegisteredBackend>>,
    fallback: RwLock<Option<Arc<dyn StateManager>>>,
}

impl AggregateStateManager {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            delegate: ChangeDelegate::new(name),
            backends: RwLock::new(Vec::new()),
            fallback: RwLock::new(None),
        }
    }

    /// Backend for names no registered backend handles.
    pub fn set_fallback(&self, manager: Arc<dyn StateManager>) {
        *self.fallback.write() = Some(manager);
    }

    /// Register a backend for every name it reports as managed.
    pub fn add_backend(&self, manager: Arc<dyn StateManager>) {
        self.backends.write().push(RegisteredBackend {
            manager,
            names: None,
        });
    }

    /// Register a backend for an explicit set of names.
    pub fn add_backend_for(&self, manager: Arc<dyn StateManager>, names: Vec<String>) {
        self.backends.write().push(RegisteredBackend {
            manager,
            names: Some(names),
        });
    }

    pub fn backend_count(&self) -> usize {
        self.backends.read().len()
    }

    fn routed(&self, name: &str) -> Vec<Arc<dyn StateManager>> {
        let routed: Vec<_> = self
            .backends
            .read()
            .iter()
            .filter(|b| b.handles(name))
            .map(|b| Arc::clone(&b.manager))
            .collect();
        if !routed.is_empty() {
            return routed;
        }
        match self.fallback.read().clone() {
            Some(fallback) => vec![fallback],
            None => {
                tracing::warn!(state = %name, "no backend registered for state, ignoring");
                routed
            }
        }
    }

    fn primary(&self, name: &str) -> Option<Arc<dyn StateManager>> {
        self.routed(name).into_iter().next()
    }
}

impl StateManager for AggregateStateManager {
    fn delegate(&self) -> &ChangeDelegate {
        &self.delegate
    }

    fn is_state_managed(&self, name: &str) -> bool {
        self.fallback.read().is_some() || self.backends.read().iter().any(|b| b.handles(name))
    }

    fn get_state_by_name(&self, name: &str) -> Result<Vec<Value>> {
        match self.primary(name) {
            Some(manager) => manager.get_state_by_name(name),
            None => Ok(Vec::new()),
        }
    }

    fn is_state_ready(&self, name: &str) -> bool {
        self.primary(name).map_or(true, |manager| manager.is_state_ready(name))
    }

    fn set_state_by_name(&self, name: &str, values: Vec<Value>, is_persisted: bool) -> Result<()> {
        for manager in self.routed(name) {
            manager.set_state_by_name(name, values.clone(), is_persisted)?;
        }
        Ok(())
    }

    fn add_new_item_to_state(&self, name: &str, item: Value, is_persisted: bool) -> Result<()> {
        for manager in self.routed(name) {
            manager.add_new_item_to_state(name, item.clone(), is_persisted)?;
        }
        Ok(())
    }

    fn update_item_in_state(&self, name: &str, item: Value, is_persisted: bool) -> Result<()> {
        for manager in self.routed(name) {
            manager.update_item_in_state(name, item.clone(), is_persisted)?;
        }
        Ok(())
    }

    fn remove_item_from_state(&self, name: &str, item: Value, is_persisted: bool) -> Result<bool> {
        let mut removed = false;
        for manager in self.routed(name) {
            removed |= manager.remove_item_from_state(name, item.clone(), is_persisted)?;
        }
        Ok(removed)
    }

    fn find_item_in_state(&self, name: &str, item: &Value) -> Result<Option<Value>> {
        match self.primary(name) {
            Some(manager) => manager.find_item_in_state(name, item),
            None => Ok(None),
        }
    }

    fn find_items_in_state(&self, name: &str, filter: &FilterSpec) -> Result<Vec<Value>> {
        match self.primary(name) {
            Some(manager) => manager.find_items_in_state(name, filter),
            None => Ok(Vec::new()),
        }
    }

    /// Listeners attach to the backend reads come from.
    fn add_change_listener_for_name(
        &self,
        name: &str,
        listener: Arc<dyn StateChangeListener>,
    ) -> ListenerId {
        match self.primary(name) {
            Some(manager) => manager.add_change_listener_for_name(name, listener),
            None => self.delegate.add_listener(name, listener),
        }
    }

    fn fire_state_changed(&self, name: &str) -> Result<()> {
        match self.primary(name) {
            Some(manager) => manager.fire_state_changed(name),
            None => Ok(()),
        }
    }

    fn force_reset_for_get(&self, name: &str) {
        for manager in self.routed(name) {
            manager.force_reset_for_get(name);
        }
    }

    fn suppress_events(&self) {
        self.delegate.suppress_events();
        for backend in self.backends.read().iter() {
            backend.manager.suppress_events();
        }
        if let Some(fallback) = self.fallback.read().as_ref() {
            fallback.suppress_events();
        }
    }

    fn emit_events(&self) {
        self.delegate.emit_events();
        for backend in self.backends.read().iter() {
            backend.manager.emit_events();
        }
        if let Some(fallback) = self.fallback.read().as_ref() {
            fallback.emit_events();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::sync::SyncStateManager;
    use serde_json::json;

    #[test]
    fn test_writes_fan_out_reads_from_first() {
        let first = Arc::new(SyncStateManager::in_memory("first"));
        let second = Arc::new(SyncStateManager::in_memory("second"));
        let aggregate = AggregateStateManager::new("aggregate");
        aggregate.add_backend_for(first.clone(), vec!["users".into()]);
        aggregate.add_backend_for(second.clone(), vec!["users".into(), "logs".into()]);

        aggregate.add_new_item_to_state("users", json!({"_id": 1}), false).unwrap();
        assert_eq!(first.get_state_by_name("users").unwrap().len(), 1);
        assert_eq!(second.get_state_by_name("users").unwrap().len(), 1);

        aggregate.add_new_item_to_state("logs", json!({"_id": "l"}), false).unwrap();
        assert!(first.get_state_by_name("logs").unwrap().is_empty());
        assert_eq!(aggregate.get_state_by_name("logs").unwrap().len(), 1);
    }

    #[test]
    fn test_unregistered_name_is_noop() {
        let aggregate = AggregateStateManager::new("aggregate");
        aggregate.add_backend_for(Arc::new(SyncStateManager::in_memory("m")), vec!["users".into()]);

        aggregate.add_new_item_to_state("nobody", json!({"_id": 1}), false).unwrap();
        assert!(aggregate.get_state_by_name("nobody").unwrap().is_empty());
        assert!(!aggregate.remove_item_from_state("nobody", json!({"_id": 1}), false).unwrap());
        assert!(!aggregate.is_state_managed("nobody"));
        assert!(aggregate.is_state_managed("users"));
    }

    #[test]
    fn test_fallback_takes_unrouted_names() {
        let routed = Arc::new(SyncStateManager::in_memory("routed"));
        let session = Arc::new(SyncStateManager::in_memory("session"));
        let aggregate = AggregateStateManager::new("aggregate");
        aggregate.add_backend_for(routed.clone(), vec!["users".into()]);
        aggregate.set_fallback(session.clone());

        aggregate.add_new_item_to_state("users", json!({"_id": 1}), false).unwrap();
        aggregate.add_new_item_to_state("draft", json!({"_id": 2}), false).unwrap();
        assert!(session.get_state_by_name("users").unwrap().is_empty());
        assert_eq!(routed.get_state_by_name("users").unwrap().len(), 1);
        assert_eq!(aggregate.get_state_by_name("draft").unwrap(), vec![json!({"_id": 2})]);
    }
}
