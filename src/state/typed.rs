//! Typed view over a named collection.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;

use super::manager::StateManager;
use crate::error::{Result, SyncError};
use crate::filter::FilterSpec;

/// Reads and writes one named collection as `T`, validating every record
/// at the boundary.
pub struct TypedCollection<T> {
    manager: Arc<dyn StateManager>,
    name: String,
    _record: PhantomData<fn() -> T>,
}

impl<T> TypedCollection<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(manager: Arc<dyn StateManager>, name: impl Into<String>) -> Self {
        Self {
            manager,
            name: name.into(),
            _record: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn all(&self) -> Result<Vec<T>> {
        self.manager
            .get_state_by_name(&self.name)?
            .into_iter()
            .map(|value| decode(&self.name, value))
            .collect()
    }

    pub fn matching(&self, filter: &FilterSpec) -> Result<Vec<T>> {
        self.manager
            .find_items_in_state(&self.name, filter)?
            .into_iter()
            .map(|value| decode(&self.name, value))
            .collect()
    }

    pub fn add(&self, record: &T) -> Result<()> {
        self.manager
            .add_new_item_to_state(&self.name, serde_json::to_value(record)?, false)
    }

    pub fn update(&self, record: &T) -> Result<()> {
        self.manager
            .update_item_in_state(&self.name, serde_json::to_value(record)?, false)
    }

    pub fn remove(&self, record: &T) -> Result<bool> {
        self.manager
            .remove_item_from_state(&self.name, serde_json::to_value(record)?, false)
    }
}

fn decode<T: DeserializeOwned>(name: &str, value: serde_json::Value) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|e| SyncError::Deserialization(format!("record in '{}': {}", name, e)))
}
