//! Shared machinery for backends whose reads complete later.
//!
//! Each name moves through `NotStarted -> InProgress -> Completed`. The
//! first read starts exactly one fetch; reads during the fetch see an empty
//! collection; once completed the buffer answers instantly until
//! [`AsyncStateCore::force_reset`] sends the name back to `NotStarted`.

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use super::operations::{apply_change, find_item, CollectionChange, ItemMatcher};
use crate::error::Result;
use crate::notifications::{
    ChangeDelegate, ChangeEvent, ChangeEventType, ListenerId, StateChangeListener,
};
use crate::types::{NamedState, RunState, DEFAULT_KEY_FIELD};

/// What a read should do next.
#[derive(Clone, Debug, PartialEq)]
pub enum FetchDecision {
    /// This caller owns the fetch and must issue it.
    Start,
    /// A fetch is outstanding; answer with nothing.
    Pending,
    /// Buffered data is authoritative.
    Ready(Vec<Value>),
}

#[derive(Debug)]
struct AsyncEntry {
    run: RunState,
    buffer: NamedState,
}

impl AsyncEntry {
    fn new(name: &str) -> Self {
        Self {
            run: RunState::NotStarted,
            buffer: NamedState::new(name),
        }
    }
}

/// Run states, value buffers and listeners of one asynchronous backend.
pub struct AsyncStateCore {
    delegate: ChangeDelegate,
    entries: Mutex<HashMap<String, AsyncEntry>>,
    key_fields: RwLock<HashMap<String, String>>,
    default_key_field: String,
}

impl AsyncStateCore {
    pub fn new(backend_name: impl Into<String>) -> Self {
        Self {
            delegate: ChangeDelegate::new(backend_name),
            entries: Mutex::new(HashMap::new()),
            key_fields: RwLock::new(HashMap::new()),
            default_key_field: DEFAULT_KEY_FIELD.to_string(),
        }
    }

    pub fn delegate(&self) -> &ChangeDelegate {
        &self.delegate
    }

    pub fn set_key_field(&self, name: &str, key_field: &str) {
        self.key_fields
            .write()
            .insert(name.to_string(), key_field.to_string());
    }

    pub fn key_field(&self, name: &str) -> String {
        self.key_fields
            .read()
            .get(name)
            .cloned()
            .unwrap_or_else(|| self.default_key_field.clone())
    }

    fn matcher(&self, name: &str) -> ItemMatcher {
        ItemMatcher::key_field(self.key_field(name))
    }

    pub fn run_state(&self, name: &str) -> RunState {
        self.entries
            .lock()
            .get(name)
            .map(|e| e.run)
            .unwrap_or_default()
    }

    /// Decide how a read of `name` proceeds, moving `NotStarted` to
    /// `InProgress` for exactly one caller.
    pub fn begin_fetch(&self, name: &str) -> FetchDecision {
        let mut entries = self.entries.lock();
        let entry = entries
            .entry(name.to_string())
            .or_insert_with(|| AsyncEntry::new(name));
        match entry.run {
            RunState::NotStarted => {
                entry.run = RunState::InProgress;
                tracing::debug!(backend = %self.delegate.backend_name(), state = %name, "fetch started");
                FetchDecision::Start
            }
            RunState::InProgress => FetchDecision::Pending,
            RunState::Completed => FetchDecision::Ready(entry.buffer.value.clone()),
        }
    }

    /// Store fetched data, mark the name completed and announce it.
    pub fn complete_fetch(&self, name: &str, values: Vec<Value>) {
        {
            let mut entries = self.entries.lock();
            let entry = entries
                .entry(name.to_string())
                .or_insert_with(|| AsyncEntry::new(name));
            entry.run = RunState::Completed;
            entry.buffer.value = values.clone();
            entry.buffer.has_been_set = true;
        }
        tracing::debug!(
            backend = %self.delegate.backend_name(),
            state = %name,
            count = values.len(),
            "fetch completed"
        );
        self.delegate
            .notify(name, ChangeEventType::StateChanged, Value::Array(values));
    }

    /// Give up on an outstanding fetch so a later read may retry.
    pub fn fail_fetch(&self, name: &str) {
        if let Some(entry) = self.entries.lock().get_mut(name) {
            if entry.run == RunState::InProgress {
                entry.run = RunState::NotStarted;
            }
        }
        tracing::debug!(backend = %self.delegate.backend_name(), state = %name, "fetch abandoned");
    }

    /// Return a name to `NotStarted`, dropping its buffer.
    pub fn force_reset(&self, name: &str) {
        if let Some(entry) = self.entries.lock().get_mut(name) {
            entry.run = RunState::NotStarted;
            entry.buffer = NamedState::new(name);
        }
    }

    /// Buffered value, only once the fetch has completed.
    pub fn buffered(&self, name: &str) -> Option<Vec<Value>> {
        self.entries
            .lock()
            .get(name)
            .filter(|e| e.run == RunState::Completed)
            .map(|e| e.buffer.value.clone())
    }

    /// Apply a change to the buffer regardless of run state.
    pub fn apply(&self, name: &str, change: CollectionChange) -> Result<Option<Value>> {
        let matcher = self.matcher(name);
        let mut entries = self.entries.lock();
        let entry = entries
            .entry(name.to_string())
            .or_insert_with(|| AsyncEntry::new(name));
        let previous = apply_change(&mut entry.buffer.value, change, &matcher)?;
        entry.buffer.has_been_set = true;
        Ok(previous)
    }

    /// Replace the buffer and mark the name completed without announcing.
    pub fn replace_completed(&self, name: &str, values: Vec<Value>) {
        let mut entries = self.entries.lock();
        let entry = entries
            .entry(name.to_string())
            .or_insert_with(|| AsyncEntry::new(name));
        entry.run = RunState::Completed;
        entry.buffer.value = values;
        entry.buffer.has_been_set = true;
    }

    pub fn find_buffered(&self, name: &str, probe: &Value) -> Option<Value> {
        let matcher = self.matcher(name);
        self.entries
            .lock()
            .get(name)
            .and_then(|e| find_item(&e.buffer.value, probe, &matcher).cloned())
    }

    /// Register a listener; if the name already completed, the listener
    /// immediately receives one `StateChanged` with the buffered value.
    pub fn add_listener(&self, name: &str, listener: Arc<dyn StateChangeListener>) -> ListenerId {
        let id = self.delegate.add_listener(name, Arc::clone(&listener));
        if let Some(values) = self.buffered(name) {
            let event = ChangeEvent::new(
                self.delegate.backend_name(),
                name,
                ChangeEventType::StateChanged,
                Value::Array(values),
            );
            self.delegate.replay_to(listener.as_ref(), &event);
        }
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::listener_fn;
    use parking_lot::Mutex as PlMutex;
    use serde_json::json;

    #[test]
    fn test_fetch_starts_once() {
        let core = AsyncStateCore::new("remote");
        assert_eq!(core.begin_fetch("users"), FetchDecision::Start);
        assert_eq!(core.begin_fetch("users"), FetchDecision::Pending);
        assert_eq!(core.run_state("users"), RunState::InProgress);

        core.complete_fetch("users", vec![json!({"_id": 1})]);
        assert_eq!(core.begin_fetch("users"), FetchDecision::Ready(vec![json!({"_id": 1})]));
    }

    #[test]
    fn test_force_reset_allows_refetch() {
        let core = AsyncStateCore::new("remote");
        core.begin_fetch("users");
        core.complete_fetch("users", vec![]);
        core.force_reset("users");
        assert_eq!(core.run_state("users"), RunState::NotStarted);
        assert_eq!(core.buffered("users"), None);
        assert_eq!(core.begin_fetch("users"), FetchDecision::Start);
    }

    #[test]
    fn test_fail_fetch_returns_to_not_started() {
        let core = AsyncStateCore::new("remote");
        core.begin_fetch("users");
        core.fail_fetch("users");
        assert_eq!(core.begin_fetch("users"), FetchDecision::Start);
    }

    #[test]
    fn test_late_listener_gets_one_replay() {
        let core = AsyncStateCore::new("remote");
        core.begin_fetch("users");
        core.complete_fetch("users", vec![json!({"_id": "a"})]);

        let seen = Arc::new(PlMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        core.add_listener(
            "users",
            listener_fn("late", move |event: &ChangeEvent| sink.lock().push(event.clone())),
        );

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].event_type, ChangeEventType::StateChanged);
        assert_eq!(seen[0].value, json!([{"_id": "a"}]));
    }

    #[test]
    fn test_early_listener_gets_no_replay() {
        let core = AsyncStateCore::new("remote");
        let count = Arc::new(PlMutex::new(0));
        let sink = Arc::clone(&count);
        core.add_listener("users", listener_fn("early", move |_e: &ChangeEvent| *sink.lock() += 1));
        assert_eq!(*count.lock(), 0);

        core.begin_fetch("users");
        core.complete_fetch("users", vec![]);
        assert_eq!(*count.lock(), 1);
    }

    #[test]
    fn test_apply_uses_key_field() {
        let core = AsyncStateCore::new("remote");
        core.set_key_field("orders", "orderNo");
        core.replace_completed("orders", vec![json!({"orderNo": 5, "qty": 1})]);
        let previous = core
            .apply("orders", CollectionChange::Update(json!({"orderNo": 5, "qty": 2})))
            .unwrap();
        assert_eq!(previous, Some(json!({"orderNo": 5, "qty": 1})));
        assert_eq!(core.find_buffered("orders", &json!({"orderNo": 5})), Some(json!({"orderNo": 5, "qty": 2})));
    }
}
