//! Change event types and listener roles.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// What happened to a named state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeEventType {
    ItemAdded,
    ItemUpdated,
    ItemDeleted,
    StateChanged,
    FilterResults,
    FindItem,
    ItemNotModified,
}

/// A single change notification.
///
/// For `StateChanged` and `FilterResults` the value is a JSON array of
/// records; for the item events it is the record itself.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub backend_name: String,
    pub state_name: String,
    pub event_type: ChangeEventType,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_value: Option<Value>,
}

impl ChangeEvent {
    pub fn new(
        backend_name: impl Into<String>,
        state_name: impl Into<String>,
        event_type: ChangeEventType,
        value: Value,
    ) -> Self {
        Self {
            backend_name: backend_name.into(),
            state_name: state_name.into(),
            event_type,
            value,
            previous_value: None,
        }
    }

    pub fn with_previous(mut self, previous: Value) -> Self {
        self.previous_value = Some(previous);
        self
    }

    /// The records carried by the event, whether it holds one or many.
    pub fn values(&self) -> Vec<Value> {
        match &self.value {
            Value::Array(items) => items.clone(),
            Value::Null => Vec::new(),
            other => vec![other.clone()],
        }
    }
}

/// Receives change notifications for the names it registered for.
pub trait StateChangeListener: Send + Sync {
    fn state_changed(&self, event: &ChangeEvent);

    /// Name used in log lines.
    fn listener_name(&self) -> String {
        "listener".to_string()
    }
}

/// Adapts a closure into a listener.
pub struct FnListener<F>
where
    F: Fn(&ChangeEvent) + Send + Sync,
{
    name: String,
    callback: F,
}

impl<F> StateChangeListener for FnListener<F>
where
    F: Fn(&ChangeEvent) + Send + Sync,
{
    fn state_changed(&self, event: &ChangeEvent) {
        (self.callback)(event)
    }

    fn listener_name(&self) -> String {
        self.name.clone()
    }
}

/// Wrap a closure as a shareable listener.
pub fn listener_fn<F>(name: impl Into<String>, callback: F) -> Arc<dyn StateChangeListener>
where
    F: Fn(&ChangeEvent) + Send + Sync + 'static,
{
    Arc::new(FnListener {
        name: name.into(),
        callback,
    })
}

/// Identifier for a registered listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// Identifier for a channel subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Configuration for a channel subscription.
#[derive(Clone, Debug)]
pub struct SubscriptionConfig {
    /// Max buffered events before the subscriber is dropped.
    pub buffer_size: usize,

    /// Names to receive (None = every name).
    pub state_names: Option<Vec<String>>,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1000,
            state_names: None,
        }
    }
}

impl SubscriptionConfig {
    pub fn states(names: Vec<String>) -> Self {
        Self {
            state_names: Some(names),
            ..Default::default()
        }
    }
}

/// Handle to a channel subscription.
pub struct SubscriptionHandle {
    pub id: SubscriptionId,
    pub receiver: crossbeam_channel::Receiver<ChangeEvent>,
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .finish()
    }
}

impl SubscriptionHandle {
    /// Receive the next event (blocking).
    pub fn recv(&self) -> Result<ChangeEvent, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> Result<ChangeEvent, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<ChangeEvent, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}
