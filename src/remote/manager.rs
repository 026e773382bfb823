//! Backend whose source of truth is a remote API reached through the queue.

use serde_json::Value;
use std::sync::{Arc, Weak};

use super::context::ContextRegistry;
use super::shape::ApiShape;
use crate::error::{Result, SyncError};
use crate::filter::{filter_items, FilterSpec};
use crate::notifications::{ChangeDelegate, ChangeEventType, ListenerId, StateChangeListener};
use crate::queue::{
    ApiRequest, QueueClass, RequestAssociation, RequestCompletion, RequestCompletionHandler,
    RequestOperation, RequestOutcome, RequestQueue,
};
use crate::state::{AsyncStateCore, CollectionChange, FetchDecision, StateManager};
use crate::types::{Clock, RequestId, RunState, Timestamp};

const NOT_MODIFIED: u16 = 304;

/// Maps CRUD calls to queued requests and folds completions back into the
/// buffer.
///
/// Writes are not applied locally until the server accepted them; the
/// matching `ItemAdded`/`ItemUpdated`/`ItemDeleted` fires on completion,
/// including completions of requests replayed after an offline period.
/// Writes flagged `is_persisted` are already authoritative and only touch
/// the buffer.
pub struct RemoteStateManager<S: ApiShape> {
    core: AsyncStateCore,
    shape: S,
    queue: Arc<RequestQueue>,
    contexts: Arc<ContextRegistry>,
    clock: Arc<dyn Clock>,
}

impl<S: ApiShape + 'static> RemoteStateManager<S> {
    /// Build the backend and register it as the queue's completion handler
    /// for `backend_name`.
    pub fn new(
        backend_name: impl Into<String>,
        shape: S,
        queue: Arc<RequestQueue>,
        contexts: Arc<ContextRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            core: AsyncStateCore::new(backend_name),
            shape,
            queue,
            contexts,
            clock,
        });
        let handler: Weak<dyn RequestCompletionHandler> =
            Arc::downgrade(&manager) as Weak<dyn RequestCompletionHandler>;
        manager
            .queue
            .register_handler(manager.core.delegate().backend_name(), handler);
        manager
    }
}

impl<S: ApiShape> RemoteStateManager<S> {
    pub fn shape(&self) -> &S {
        &self.shape
    }

    pub fn core(&self) -> &AsyncStateCore {
        &self.core
    }

    fn managed_or_warn(&self, name: &str) -> bool {
        if self.shape.is_managed(name) {
            true
        } else {
            tracing::warn!(backend = %self.backend_name(), state = %name, "no remote collection configured");
            false
        }
    }

    fn key_field_sync(&self, name: &str) {
        self.core.set_key_field(name, &self.shape.key_field(name));
    }

    fn enqueue(
        &self,
        name: &str,
        request: ApiRequest,
        operation: RequestOperation,
        item: Option<Value>,
        class: QueueClass,
    ) -> RequestId {
        let mut association = RequestAssociation::new(self.backend_name(), name, operation);
        if let Some(item) = item {
            association = association.with_item(item);
        }
        let request = request.with_context(self.contexts.merged());
        self.queue.add_request(request, association, class)
    }

    fn stamp(&self, item: Value, creating: bool) -> Value {
        let mut map = match item {
            Value::Object(map) => map,
            other => return other,
        };
        let now = Value::from(self.clock.now().as_millis());
        let user = self
            .queue
            .security()
            .current_user()
            .map(Value::String)
            .unwrap_or(Value::Null);
        if creating {
            map.insert("created".to_string(), now.clone());
            map.insert("createdBy".to_string(), user.clone());
        }
        map.insert("modified".to_string(), now);
        map.insert("modifiedBy".to_string(), user);
        Value::Object(map)
    }

    /// Ask the server whether `item` changed after `since`. The answer
    /// arrives as `ItemNotModified` or `ItemUpdated`.
    pub fn is_item_modified_since(
        &self,
        name: &str,
        item: &Value,
        since: Timestamp,
    ) -> Result<Option<RequestId>> {
        if !self.managed_or_warn(name) {
            return Ok(None);
        }
        let request = self.shape.modified_since(name, item, since)?;
        Ok(Some(self.enqueue(
            name,
            request,
            RequestOperation::ModifiedCheck,
            Some(item.clone()),
            QueueClass::Background,
        )))
    }

    fn completed_ok(&self, completion: &RequestCompletion, status: u16, data: Value) -> Result<()> {
        let name = completion.association.state_name.as_str();
        let op = &completion.association.operation;
        let delegate = self.core.delegate();

        match op {
            RequestOperation::FetchAll => {
                let values = match self.shape.unwrap_response(name, op, data) {
                    Ok(Value::Array(values)) => values,
                    Ok(Value::Null) => Vec::new(),
                    Ok(other) => {
                        self.core.fail_fetch(name);
                        return Err(SyncError::MalformedPayload(format!(
                            "expected an array for {name}, got {other}"
                        )));
                    }
                    Err(e) => {
                        self.core.fail_fetch(name);
                        return Err(e);
                    }
                };
                self.core.complete_fetch(name, values);
            }
            RequestOperation::FetchItem => {
                let record = self.shape.unwrap_response(name, op, data)?;
                if !record.is_null() && self.core.buffered(name).is_some() {
                    self.core.apply(name, CollectionChange::Update(record.clone()))?;
                }
                delegate.notify(name, ChangeEventType::FindItem, record);
            }
            RequestOperation::Create => {
                let record = self.server_record(name, op, data, completion)?;
                self.core.apply(name, CollectionChange::Add(record.clone()))?;
                delegate.notify(name, ChangeEventType::ItemAdded, record);
            }
            RequestOperation::Update => {
                let record = self.server_record(name, op, data, completion)?;
                let previous = self.core.apply(name, CollectionChange::Update(record.clone()))?;
                delegate.notify_updated(name, record, previous.unwrap_or(Value::Null));
            }
            RequestOperation::Delete => {
                let item = completion.association.item.clone().unwrap_or(Value::Null);
                let removed = self.core.apply(name, CollectionChange::Remove(item.clone()))?;
                delegate.notify(name, ChangeEventType::ItemDeleted, removed.unwrap_or(item));
            }
            RequestOperation::ModifiedCheck => {
                let item = completion.association.item.clone().unwrap_or(Value::Null);
                if status == NOT_MODIFIED {
                    delegate.notify(name, ChangeEventType::ItemNotModified, item);
                } else {
                    let record = self.shape.unwrap_response(name, op, data)?;
                    let record = if record.is_object() { record } else { item };
                    let previous = self.core.apply(name, CollectionChange::Update(record.clone()))?;
                    delegate.notify_updated(name, record, previous.unwrap_or(Value::Null));
                }
            }
            RequestOperation::LastModified => {}
        }
        Ok(())
    }

    /// The record as echoed by the server, falling back to what was sent.
    fn server_record(
        &self,
        name: &str,
        op: &RequestOperation,
        data: Value,
        completion: &RequestCompletion,
    ) -> Result<Value> {
        let sent = completion.association.item.clone().unwrap_or(Value::Null);
        let echoed = self.shape.unwrap_response(name, op, data)?;
        Ok(match (echoed, sent) {
            (Value::Object(echoed), Value::Object(mut sent)) => {
                sent.extend(echoed);
                Value::Object(sent)
            }
            (Value::Object(echoed), _) => Value::Object(echoed),
            (_, sent) => sent,
        })
    }
}

impl<S: ApiShape> RequestCompletionHandler for RemoteStateManager<S> {
    fn request_completed(&self, completion: &RequestCompletion) {
        let name = completion.association.state_name.as_str();
        match &completion.outcome {
            RequestOutcome::Success { status, data } => {
                if let Err(e) = self.completed_ok(completion, *status, data.clone()) {
                    tracing::warn!(
                        backend = %self.backend_name(),
                        state = %name,
                        request_id = %completion.request_id,
                        error = %e,
                        "could not apply response"
                    );
                }
            }
            RequestOutcome::Queued => {
                tracing::debug!(state = %name, request_id = %completion.request_id, "request held for offline replay");
            }
            RequestOutcome::Cancelled => {
                tracing::debug!(state = %name, request_id = %completion.request_id, "request cancelled");
                if completion.association.operation == RequestOperation::FetchAll {
                    self.core.fail_fetch(name);
                }
            }
            RequestOutcome::Failed { status, message } => {
                tracing::warn!(state = %name, request_id = %completion.request_id, status, message = %message, "remote request failed");
                if completion.association.operation == RequestOperation::FetchAll {
                    self.core.fail_fetch(name);
                }
            }
            RequestOutcome::Malformed { status, reason } => {
                tracing::warn!(state = %name, request_id = %completion.request_id, status, reason = %reason, "malformed remote response");
                if completion.association.operation == RequestOperation::FetchAll {
                    self.core.fail_fetch(name);
                }
            }
        }
    }
}

impl<S: ApiShape> StateManager for RemoteStateManager<S> {
    fn delegate(&self) -> &ChangeDelegate {
        self.core.delegate()
    }

    fn is_state_managed(&self, name: &str) -> bool {
        self.shape.is_managed(name)
    }

    fn is_state_ready(&self, name: &str) -> bool {
        self.core.run_state(name) == RunState::Completed
    }

    fn get_state_by_name(&self, name: &str) -> Result<Vec<Value>> {
        if !self.managed_or_warn(name) {
            return Ok(Vec::new());
        }
        match self.core.begin_fetch(name) {
            FetchDecision::Ready(values) => Ok(values),
            FetchDecision::Pending => Ok(Vec::new()),
            FetchDecision::Start => {
                self.key_field_sync(name);
                match self.shape.find_all(name) {
                    Ok(request) => {
                        self.enqueue(name, request, RequestOperation::FetchAll, None, QueueClass::Priority);
                        Ok(Vec::new())
                    }
                    Err(e) => {
                        self.core.fail_fetch(name);
                        Err(e)
                    }
                }
            }
        }
    }

    fn set_state_by_name(&self, name: &str, values: Vec<Value>, _is_persisted: bool) -> Result<()> {
        self.key_field_sync(name);
        self.core.replace_completed(name, values.clone());
        self.core
            .delegate()
            .notify(name, ChangeEventType::StateChanged, Value::Array(values));
        Ok(())
    }

    fn add_new_item_to_state(&self, name: &str, item: Value, is_persisted: bool) -> Result<()> {
        if !self.managed_or_warn(name) {
            return Ok(());
        }
        self.key_field_sync(name);
        if is_persisted {
            self.core.apply(name, CollectionChange::Add(item.clone()))?;
            self.core
                .delegate()
                .notify(name, ChangeEventType::ItemAdded, item);
            return Ok(());
        }
        let item = self.stamp(item, true);
        let request = self.shape.create(name, &item)?;
        self.enqueue(name, request, RequestOperation::Create, Some(item), QueueClass::Priority);
        Ok(())
    }

    fn update_item_in_state(&self, name: &str, item: Value, is_persisted: bool) -> Result<()> {
        if !self.managed_or_warn(name) {
            return Ok(());
        }
        self.key_field_sync(name);
        if is_persisted {
            let previous = self.core.apply(name, CollectionChange::Update(item.clone()))?;
            self.core
                .delegate()
                .notify_updated(name, item, previous.unwrap_or(Value::Null));
            return Ok(());
        }
        let item = self.stamp(item, false);
        let request = self.shape.update(name, &item)?;
        self.enqueue(name, request, RequestOperation::Update, Some(item), QueueClass::Priority);
        Ok(())
    }

    fn remove_item_from_state(&self, name: &str, item: Value, is_persisted: bool) -> Result<bool> {
        if !self.managed_or_warn(name) {
            return Ok(false);
        }
        self.key_field_sync(name);
        if is_persisted {
            let removed = self.core.apply(name, CollectionChange::Remove(item))?;
            if let Some(record) = &removed {
                self.core
                    .delegate()
                    .notify(name, ChangeEventType::ItemDeleted, record.clone());
            }
            return Ok(removed.is_some());
        }
        let held = self.core.find_buffered(name, &item).is_some();
        let request = self.shape.delete(name, &item)?;
        self.enqueue(name, request, RequestOperation::Delete, Some(item), QueueClass::Priority);
        Ok(held)
    }

    /// Buffered record if the collection is loaded; otherwise asks the
    /// server and reports through `FindItem`.
    fn find_item_in_state(&self, name: &str, item: &Value) -> Result<Option<Value>> {
        if !self.managed_or_warn(name) {
            return Ok(None);
        }
        self.key_field_sync(name);
        if self.core.buffered(name).is_some() {
            return Ok(self.core.find_buffered(name, item));
        }
        let request = self.shape.find_item(name, item)?;
        self.enqueue(name, request, RequestOperation::FetchItem, Some(item.clone()), QueueClass::Priority);
        Ok(None)
    }

    /// Evaluated against the loaded buffer and also reported as
    /// `FilterResults`. Starts a fetch if the collection is not loaded.
    fn find_items_in_state(&self, name: &str, filter: &FilterSpec) -> Result<Vec<Value>> {
        let Some(values) = self.core.buffered(name) else {
            self.get_state_by_name(name)?;
            return Ok(Vec::new());
        };
        let results = filter_items(&values, filter);
        self.core.delegate().notify(
            name,
            ChangeEventType::FilterResults,
            Value::Array(results.clone()),
        );
        Ok(results)
    }

    fn add_change_listener_for_name(
        &self,
        name: &str,
        listener: Arc<dyn StateChangeListener>,
    ) -> ListenerId {
        self.core.add_listener(name, listener)
    }

    fn fire_state_changed(&self, name: &str) -> Result<()> {
        match self.core.buffered(name) {
            Some(values) => {
                self.core
                    .delegate()
                    .notify(name, ChangeEventType::StateChanged, Value::Array(values));
                Ok(())
            }
            None => self.get_state_by_name(name).map(|_| ()),
        }
    }

    fn force_reset_for_get(&self, name: &str) {
        self.core.force_reset(name);
    }
}
