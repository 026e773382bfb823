//! Per-name listener registry that fans change events out.

use crossbeam_channel::{bounded, Sender};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use super::types::{
    ChangeEvent, ChangeEventType, ListenerId, StateChangeListener, SubscriptionConfig,
    SubscriptionHandle, SubscriptionId,
};

struct RegisteredListener {
    id: ListenerId,
    listener: Arc<dyn StateChangeListener>,
}

/// Internal channel subscription state.
struct ChannelSubscription {
    config: SubscriptionConfig,
    sender: Sender<ChangeEvent>,
}

impl ChannelSubscription {
    /// Try to send an event. Returns false if the buffer is full or the
    /// receiver went away.
    fn try_send(&self, event: ChangeEvent) -> bool {
        self.sender.try_send(event).is_ok()
    }

    fn matches(&self, state_name: &str) -> bool {
        match self.config.state_names {
            Some(ref names) => names.iter().any(|n| n == state_name),
            None => true,
        }
    }
}

/// Owns the listeners of one backend and delivers its events.
///
/// Delivery is synchronous and in registration order. No lock is held
/// while a listener runs, so listeners may call back into the backend.
pub struct ChangeDelegate {
    backend_name: String,
    listeners: RwLock<HashMap<String, Vec<RegisteredListener>>>,
    channels: RwLock<HashMap<SubscriptionId, ChannelSubscription>>,
    suppressed: AtomicBool,
    next_id: AtomicU64,
}

impl ChangeDelegate {
    pub fn new(backend_name: impl Into<String>) -> Self {
        Self {
            backend_name: backend_name.into(),
            listeners: RwLock::new(HashMap::new()),
            channels: RwLock::new(HashMap::new()),
            suppressed: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn backend_name(&self) -> &str {
        &self.backend_name
    }

    /// Register a listener for one name.
    pub fn add_listener(
        &self,
        state_name: &str,
        listener: Arc<dyn StateChangeListener>,
    ) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        tracing::debug!(
            backend = %self.backend_name,
            state = %state_name,
            listener = %listener.listener_name(),
            "listener added"
        );
        self.listeners
            .write()
            .entry(state_name.to_string())
            .or_default()
            .push(RegisteredListener { id, listener });
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        for registered in listeners.values_mut() {
            if let Some(pos) = registered.iter().position(|r| r.id == id) {
                registered.remove(pos);
                return true;
            }
        }
        false
    }

    pub fn listener_count(&self, state_name: &str) -> usize {
        self.listeners
            .read()
            .get(state_name)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Stop delivering events until `emit_events` is called.
    pub fn suppress_events(&self) {
        self.suppressed.store(true, Ordering::SeqCst);
    }

    pub fn emit_events(&self) {
        self.suppressed.store(false, Ordering::SeqCst);
    }

    pub fn is_suppressed(&self) -> bool {
        self.suppressed.load(Ordering::SeqCst)
    }

    /// Build and deliver an event for a name.
    pub fn notify(&self, state_name: &str, event_type: ChangeEventType, value: Value) {
        self.inform(ChangeEvent::new(
            self.backend_name.clone(),
            state_name,
            event_type,
            value,
        ));
    }

    pub fn notify_updated(&self, state_name: &str, value: Value, previous: Value) {
        self.inform(
            ChangeEvent::new(
                self.backend_name.clone(),
                state_name,
                ChangeEventType::ItemUpdated,
                value,
            )
            .with_previous(previous),
        );
    }

    /// Deliver an event to every listener of its name.
    pub fn inform(&self, event: ChangeEvent) {
        if self.is_suppressed() {
            tracing::trace!(
                backend = %self.backend_name,
                state = %event.state_name,
                "events suppressed"
            );
            return;
        }

        let targets: Vec<Arc<dyn StateChangeListener>> = self
            .listeners
            .read()
            .get(&event.state_name)
            .map(|registered| registered.iter().map(|r| Arc::clone(&r.listener)).collect())
            .unwrap_or_default();

        for listener in targets {
            listener.state_changed(&event);
        }

        self.broadcast_channels(&event);
    }

    /// Deliver one event to one listener only (late-subscriber replay).
    pub fn replay_to(&self, listener: &dyn StateChangeListener, event: &ChangeEvent) {
        if !self.is_suppressed() {
            listener.state_changed(event);
        }
    }

    // --- Channel subscriptions ---

    /// Subscribe through a bounded channel, for consumers on other threads.
    pub fn subscribe_channel(&self, config: SubscriptionConfig) -> SubscriptionHandle {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = bounded(config.buffer_size);
        self.channels
            .write()
            .insert(id, ChannelSubscription { config, sender });
        SubscriptionHandle { id, receiver }
    }

    pub fn unsubscribe_channel(&self, id: SubscriptionId) {
        self.channels.write().remove(&id);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.read().len()
    }

    /// Drops subscribers that fail to receive.
    fn broadcast_channels(&self, event: &ChangeEvent) {
        let mut to_remove = Vec::new();

        {
            let channels = self.channels.read();
            for (id, sub) in channels.iter() {
                if sub.matches(&event.state_name) && !sub.try_send(event.clone()) {
                    to_remove.push(*id);
                }
            }
        }

        if !to_remove.is_empty() {
            let mut channels = self.channels.write();
            for id in to_remove {
                tracing::warn!(backend = %self.backend_name, subscription = id.0, "dropping slow subscriber");
                channels.remove(&id);
            }
        }
    }
}
