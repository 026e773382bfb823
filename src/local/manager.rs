//! Asynchronous-style backend over a [`LocalDatabase`].

use serde_json::Value;
use std::sync::Arc;

use super::database::LocalDatabase;
use crate::error::{Result, SyncError};
use crate::filter::{filter_items, FilterSpec};
use crate::notifications::{ChangeDelegate, ChangeEventType, ListenerId, StateChangeListener};
use crate::state::{AsyncStateCore, CollectionChange, FetchDecision, StateManager};
use crate::types::{key_of, RunState};

/// One object store per named state.
///
/// The first read of a name loads its store into the buffer and completes
/// the run; later reads are served from the buffer. Writes go to the
/// database first and only touch the buffer once they committed.
pub struct LocalStoreStateManager {
    core: AsyncStateCore,
    db: Arc<LocalDatabase>,
}

impl LocalStoreStateManager {
    pub fn new(backend_name: impl Into<String>, db: Arc<LocalDatabase>) -> Self {
        let core = AsyncStateCore::new(backend_name);
        for schema in db.schemas() {
            core.set_key_field(&schema.name, &schema.key_path);
        }
        Self { core, db }
    }

    pub fn database(&self) -> &Arc<LocalDatabase> {
        &self.db
    }

    pub fn core(&self) -> &AsyncStateCore {
        &self.core
    }

    fn ensure_store(&self, name: &str) -> Result<()> {
        if self.db.has_store(name) {
            Ok(())
        } else {
            Err(SyncError::ObjectStoreNotFound(name.to_string()))
        }
    }

    fn key(&self, name: &str, item: &Value) -> Result<String> {
        let key_field = self.core.key_field(name);
        key_of(item, &key_field).ok_or_else(|| SyncError::MissingKey {
            store: name.to_string(),
            key_field,
        })
    }
}

impl StateManager for LocalStoreStateManager {
    fn delegate(&self) -> &ChangeDelegate {
        self.core.delegate()
    }

    fn is_state_managed(&self, name: &str) -> bool {
        self.db.has_store(name)
    }

    fn is_state_ready(&self, name: &str) -> bool {
        self.core.run_state(name) == RunState::Completed
    }

    fn get_state_by_name(&self, name: &str) -> Result<Vec<Value>> {
        self.ensure_store(name)?;
        match self.core.begin_fetch(name) {
            FetchDecision::Ready(values) => Ok(values),
            FetchDecision::Pending => Ok(Vec::new()),
            FetchDecision::Start => match self.db.get_all(name) {
                Ok(values) => {
                    self.core.complete_fetch(name, values.clone());
                    Ok(values)
                }
                Err(e) => {
                    self.core.fail_fetch(name);
                    Err(e)
                }
            },
        }
    }

    fn set_state_by_name(&self, name: &str, values: Vec<Value>, _is_persisted: bool) -> Result<()> {
        self.ensure_store(name)?;
        self.db.replace_all(name, values.clone())?;
        self.core.replace_completed(name, values.clone());
        self.core
            .delegate()
            .notify(name, ChangeEventType::StateChanged, Value::Array(values));
        Ok(())
    }

    fn add_new_item_to_state(&self, name: &str, item: Value, _is_persisted: bool) -> Result<()> {
        self.ensure_store(name)?;
        self.db.put(name, item.clone())?;
        self.core.apply(name, CollectionChange::Add(item.clone()))?;
        self.core
            .delegate()
            .notify(name, ChangeEventType::ItemAdded, item);
        Ok(())
    }

    fn update_item_in_state(&self, name: &str, item: Value, _is_persisted: bool) -> Result<()> {
        self.ensure_store(name)?;
        self.db.put(name, item.clone())?;
        let previous = self.core.apply(name, CollectionChange::Update(item.clone()))?;
        self.core
            .delegate()
            .notify_updated(name, item, previous.unwrap_or(Value::Null));
        Ok(())
    }

    fn remove_item_from_state(&self, name: &str, item: Value, _is_persisted: bool) -> Result<bool> {
        self.ensure_store(name)?;
        let key = self.key(name, &item)?;
        let removed = self.db.delete(name, &key)?;
        self.core.apply(name, CollectionChange::Remove(item))?;
        match removed {
            Some(record) => {
                self.core
                    .delegate()
                    .notify(name, ChangeEventType::ItemDeleted, record);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn find_item_in_state(&self, name: &str, item: &Value) -> Result<Option<Value>> {
        self.ensure_store(name)?;
        let key = self.key(name, item)?;
        self.db.get(name, &key)
    }

    fn find_items_in_state(&self, name: &str, filter: &FilterSpec) -> Result<Vec<Value>> {
        self.ensure_store(name)?;
        let values = self.db.get_all(name)?;
        Ok(filter_items(&values, filter))
    }

    fn add_change_listener_for_name(
        &self,
        name: &str,
        listener: Arc<dyn StateChangeListener>,
    ) -> ListenerId {
        self.core.add_listener(name, listener)
    }

    fn fire_state_changed(&self, name: &str) -> Result<()> {
        if let Some(values) = self.core.buffered(name) {
            self.core
                .delegate()
                .notify(name, ChangeEventType::StateChanged, Value::Array(values));
            return Ok(());
        }
        // first read announces the loaded value itself
        self.get_state_by_name(name).map(|_| ())
    }

    fn force_reset_for_get(&self, name: &str) {
        self.core.force_reset(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::database::StoreSchema;
    use crate::notifications::{listener_fn, ChangeEvent};
    use crate::types::RunState;
    use parking_lot::Mutex;
    use serde_json::json;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> LocalStoreStateManager {
        let db = LocalDatabase::open(
            dir.path(),
            "app",
            vec![StoreSchema::keyed_by_id("users"), StoreSchema::new("orders", "orderNo")],
        )
        .unwrap();
        LocalStoreStateManager::new("local", Arc::new(db))
    }

    #[test]
    fn test_first_read_completes_run() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        manager.database().put("users", json!({"_id": "u1"})).unwrap();

        assert_eq!(manager.core().run_state("users"), RunState::NotStarted);
        assert_eq!(manager.get_state_by_name("users").unwrap(), vec![json!({"_id": "u1"})]);
        assert_eq!(manager.core().run_state("users"), RunState::Completed);
    }

    #[test]
    fn test_writes_reach_database_and_buffer() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        manager.get_state_by_name("orders").unwrap();

        manager.add_new_item_to_state("orders", json!({"orderNo": 7, "qty": 1}), false).unwrap();
        manager.update_item_in_state("orders", json!({"orderNo": 7, "qty": 3}), false).unwrap();

        assert_eq!(manager.database().get("orders", "7").unwrap(), Some(json!({"orderNo": 7, "qty": 3})));
        assert_eq!(manager.get_state_by_name("orders").unwrap(), vec![json!({"orderNo": 7, "qty": 3})]);

        assert!(manager.remove_item_from_state("orders", json!({"orderNo": 7}), false).unwrap());
        assert!(manager.get_state_by_name("orders").unwrap().is_empty());
    }

    #[test]
    fn test_unknown_store_errors() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        assert!(!manager.is_state_managed("ghosts"));
        assert!(matches!(
            manager.get_state_by_name("ghosts"),
            Err(SyncError::ObjectStoreNotFound(_))
        ));
    }

    #[test]
    fn test_late_listener_replay_and_set_state() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        manager
            .set_state_by_name("users", vec![json!({"_id": "a"}), json!({"_id": "b"})], false)
            .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        manager.add_change_listener_for_name(
            "users",
            listener_fn("late", move |event: &ChangeEvent| sink.lock().push(event.values().len())),
        );
        assert_eq!(*seen.lock(), vec![2]);
    }

    #[test]
    fn test_find_by_key_and_filter() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        manager
            .set_state_by_name("users", vec![json!({"_id": "a", "role": "admin"}), json!({"_id": "b", "role": "guest"})], false)
            .unwrap();

        assert_eq!(
            manager.find_item_in_state("users", &json!({"_id": "b"})).unwrap(),
            Some(json!({"_id": "b", "role": "guest"}))
        );
        let admins = manager
            .find_items_in_state("users", &FilterSpec::new().exact("role", vec![json!("admin")]))
            .unwrap();
        assert_eq!(admins.len(), 1);
    }
}
