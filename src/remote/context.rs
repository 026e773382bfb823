//! Named request context (tenant, session scope) merged into every request.

use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

/// Told whenever a context value changes.
pub trait ContextListener: Send + Sync {
    /// `value` is `None` when the context was removed.
    fn context_changed(&self, name: &str, value: Option<&Value>);
}

#[derive(Default)]
pub struct ContextRegistry {
    values: RwLock<BTreeMap<String, Value>>,
    listeners: RwLock<Vec<Weak<dyn ContextListener>>>,
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, name: &str, value: Value) {
        self.values.write().insert(name.to_string(), value.clone());
        tracing::debug!(context = %name, "context set");
        self.notify(name, Some(&value));
    }

    pub fn remove(&self, name: &str) -> Option<Value> {
        let removed = self.values.write().remove(name);
        if removed.is_some() {
            self.notify(name, None);
        }
        removed
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.values.read().get(name).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.values.read().is_empty()
    }

    /// All context values as one JSON object, or `None` if there are none.
    pub fn merged(&self) -> Option<Value> {
        let values = self.values.read();
        if values.is_empty() {
            return None;
        }
        let map: Map<String, Value> = values
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Some(Value::Object(map))
    }

    pub fn add_listener(&self, listener: Weak<dyn ContextListener>) {
        self.listeners.write().push(listener);
    }

    fn notify(&self, name: &str, value: Option<&Value>) {
        let live: Vec<Arc<dyn ContextListener>> = {
            let mut listeners = self.listeners.write();
            listeners.retain(|l| l.strong_count() > 0);
            listeners.iter().filter_map(Weak::upgrade).collect()
        };
        for listener in live {
            listener.context_changed(name, value);
        }
    }
}
