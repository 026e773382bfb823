//! The CRUD-by-name contract every backend implements.

use serde_json::Value;
use std::sync::Arc;

use crate::error::Result;
use crate::filter::FilterSpec;
use crate::notifications::{ChangeDelegate, ChangeEventType, ListenerId, StateChangeListener};

/// Uniform access to named collections, whatever holds them.
///
/// Mutations notify the backend's listeners with the precise change kind
/// (`ItemAdded`, `ItemUpdated`, `ItemDeleted`, `StateChanged`).
/// `is_persisted` marks a change that is already authoritative elsewhere
/// (for example pushed from another client) so the backend must not send
/// it back to its source.
pub trait StateManager: Send + Sync {
    /// The delegate holding this backend's listeners.
    fn delegate(&self) -> &ChangeDelegate;

    fn backend_name(&self) -> &str {
        self.delegate().backend_name()
    }

    /// Whether this backend holds the given name.
    fn is_state_managed(&self, _name: &str) -> bool {
        true
    }

    /// Current value of a named collection.
    ///
    /// Asynchronous backends return an empty collection while the first
    /// fetch is outstanding and report the data through `StateChanged`.
    fn get_state_by_name(&self, name: &str) -> Result<Vec<Value>>;

    /// Whether the last read of `name` returned the collection itself
    /// rather than a placeholder for an outstanding fetch.
    fn is_state_ready(&self, _name: &str) -> bool {
        true
    }

    fn set_state_by_name(&self, name: &str, values: Vec<Value>, is_persisted: bool) -> Result<()>;

    fn add_new_item_to_state(&self, name: &str, item: Value, is_persisted: bool) -> Result<()>;

    fn update_item_in_state(&self, name: &str, item: Value, is_persisted: bool) -> Result<()>;

    /// Returns whether a matching record was held locally.
    fn remove_item_from_state(&self, name: &str, item: Value, is_persisted: bool) -> Result<bool>;

    fn find_item_in_state(&self, name: &str, item: &Value) -> Result<Option<Value>>;

    fn find_items_in_state(&self, name: &str, filter: &FilterSpec) -> Result<Vec<Value>>;

    fn add_change_listener_for_name(
        &self,
        name: &str,
        listener: Arc<dyn StateChangeListener>,
    ) -> ListenerId {
        self.delegate().add_listener(name, listener)
    }

    /// Re-announce the current value of a name.
    fn fire_state_changed(&self, name: &str) -> Result<()> {
        let values = self.get_state_by_name(name)?;
        self.delegate()
            .notify(name, ChangeEventType::StateChanged, Value::Array(values));
        Ok(())
    }

    fn fire_states_changed(&self, names: &[&str]) -> Result<()> {
        for name in names {
            self.fire_state_changed(name)?;
        }
        Ok(())
    }

    /// Forget any completed fetch so the next read goes to the source.
    fn force_reset_for_get(&self, _name: &str) {}

    fn suppress_events(&self) {
        self.delegate().suppress_events();
    }

    fn emit_events(&self) {
        self.delegate().emit_events();
    }
}
