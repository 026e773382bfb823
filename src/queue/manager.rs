//! Priority/background request queue with an authentication admission gate.

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use super::security::{SecurityContext, TokenListener};
use super::types::{
    ApiRequest, ApiResponse, QueueClass, QueuedRequest, RequestAssociation, RequestCompletion,
    RequestCompletionHandler, RequestOutcome,
};
use crate::config::QueueConfig;
use crate::offline::OfflineManager;
use crate::transport::{DispatchRequest, HttpTransport};
use crate::types::RequestId;

const FORBIDDEN: u16 = 403;

/// Owns every request from enqueue until its completion handler ran.
///
/// Draining is batch-wise: priority entries first, then background, until
/// both are empty or the admission gate closes. Dispatch and completion
/// handlers run without any queue lock held, so handlers may enqueue.
pub struct RequestQueue {
    self_ref: Weak<RequestQueue>,
    config: QueueConfig,
    security: Arc<SecurityContext>,
    transport: Arc<dyn HttpTransport>,
    offline: Option<Arc<OfflineManager>>,
    inner: Mutex<QueueInner>,
    handlers: RwLock<HashMap<String, Weak<dyn RequestCompletionHandler>>>,
    next_id: AtomicU64,
}

#[derive(Default)]
struct QueueInner {
    priority: VecDeque<QueuedRequest>,
    background: VecDeque<QueuedRequest>,
    in_flight: HashMap<RequestId, QueuedRequest>,
    draining: bool,
}

impl RequestQueue {
    pub fn new(
        config: QueueConfig,
        security: Arc<SecurityContext>,
        transport: Arc<dyn HttpTransport>,
        offline: Option<Arc<OfflineManager>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<RequestQueue>| {
            let listener: Weak<dyn TokenListener> = weak.clone();
            security.add_token_listener(listener);
            Self {
                self_ref: weak.clone(),
                config,
                security,
                transport,
                offline,
                inner: Mutex::new(QueueInner::default()),
                handlers: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }
        })
    }

    pub fn security(&self) -> &Arc<SecurityContext> {
        &self.security
    }

    pub fn offline(&self) -> Option<&Arc<OfflineManager>> {
        self.offline.as_ref()
    }

    /// Route completions tagged `name` to `handler`.
    pub fn register_handler(&self, name: &str, handler: Weak<dyn RequestCompletionHandler>) {
        self.handlers.write().insert(name.to_string(), handler);
    }

    pub fn unregister_handler(&self, name: &str) {
        self.handlers.write().remove(name);
    }

    pub fn add_request(
        &self,
        request: ApiRequest,
        association: RequestAssociation,
        queue_class: QueueClass,
    ) -> RequestId {
        let queued = QueuedRequest {
            request,
            request_id: self.next_request_id(),
            queue_class,
            association,
            was_offline: false,
            offline_seq: None,
            auth_retries: 0,
        };
        let id = queued.request_id;
        tracing::debug!(
            request_id = %id,
            state = %queued.association.state_name,
            class = ?queue_class,
            "request queued"
        );
        self.push(queued, false);
        self.drain();
        id
    }

    pub fn add_priority_request(&self, request: ApiRequest, association: RequestAssociation) -> RequestId {
        self.add_request(request, association, QueueClass::Priority)
    }

    pub fn add_background_request(
        &self,
        request: ApiRequest,
        association: RequestAssociation,
    ) -> RequestId {
        self.add_request(request, association, QueueClass::Background)
    }

    /// Dispatch queued requests until both queues are empty or admission
    /// closes. Re-entrant calls return immediately; the running drain picks
    /// up their work.
    pub fn drain(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.draining {
                return;
            }
            inner.draining = true;
        }

        loop {
            let admitted = self.security.is_admission_open();
            let next = if admitted {
                let mut inner = self.inner.lock();
                let next = inner
                    .priority
                    .pop_front()
                    .or_else(|| inner.background.pop_front());
                if let Some(queued) = &next {
                    inner.in_flight.insert(queued.request_id, queued.clone());
                }
                next
            } else {
                None
            };

            match next {
                Some(queued) => self.dispatch(queued),
                None => {
                    let mut inner = self.inner.lock();
                    let waiting = !inner.priority.is_empty() || !inner.background.is_empty();
                    if waiting && self.security.is_admission_open() {
                        // work arrived between the pop and this check
                        continue;
                    }
                    if waiting {
                        tracing::debug!(
                            priority = inner.priority.len(),
                            background = inner.background.len(),
                            "admission closed, waiting for token"
                        );
                    }
                    inner.draining = false;
                    break;
                }
            }
        }
    }

    /// Drop every queued and in-flight request. Each dropped request is
    /// delivered as `Cancelled`; late completions for them are ignored.
    /// Dropped offline replays stay pending in the offline log.
    pub fn reset(&self) -> usize {
        let dropped: Vec<QueuedRequest> = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let mut in_flight: Vec<QueuedRequest> = inner.in_flight.drain().map(|(_, q)| q).collect();
            in_flight.sort_by_key(|q| q.request_id);
            in_flight
                .into_iter()
                .chain(inner.priority.drain(..))
                .chain(inner.background.drain(..))
                .collect()
        };
        let count = dropped.len();
        tracing::info!(dropped = count, "request queue reset");

        for queued in dropped {
            if let (Some(seq), Some(offline)) = (queued.offline_seq, &self.offline) {
                offline.cancel_replay(seq);
            }
            self.deliver(queued, RequestOutcome::Cancelled);
        }
        count
    }

    /// Mark the server reachable again and replay every pending offline
    /// request once, at priority.
    pub fn connectivity_restored(&self) -> usize {
        let Some(offline) = &self.offline else {
            return 0;
        };
        offline.go_online();

        let batch = offline.take_for_replay();
        let count = batch.len();
        for (seq, mut queued) in batch {
            queued.request_id = self.next_request_id();
            queued.queue_class = QueueClass::Priority;
            queued.was_offline = true;
            queued.offline_seq = Some(seq);
            queued.auth_retries = 0;
            tracing::debug!(request_id = %queued.request_id, seq, "replaying offline request");
            self.push(queued, false);
        }
        if count > 0 {
            tracing::info!(count, "replaying offline requests");
        }
        self.drain();
        count
    }

    pub fn priority_len(&self) -> usize {
        self.inner.lock().priority.len()
    }

    pub fn background_len(&self) -> usize {
        self.inner.lock().background.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.inner.lock().in_flight.len()
    }

    pub fn is_in_flight(&self, id: RequestId) -> bool {
        self.inner.lock().in_flight.contains_key(&id)
    }

    fn next_request_id(&self) -> RequestId {
        RequestId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn push(&self, queued: QueuedRequest, front: bool) {
        let mut inner = self.inner.lock();
        let queue = match queued.queue_class {
            QueueClass::Priority => &mut inner.priority,
            QueueClass::Background => &mut inner.background,
        };
        if front {
            queue.push_front(queued);
        } else {
            queue.push_back(queued);
        }
    }

    fn build_dispatch(&self, queued: &QueuedRequest) -> DispatchRequest {
        let mut headers = BTreeMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        if self.security.requires_token() {
            if let Some(token) = self.security.token() {
                headers.insert(
                    self.config.token_header.clone(),
                    format!("{}{}", self.config.token_prefix, token),
                );
            }
        }
        if let Some(context) = &queued.request.context {
            headers.insert(self.config.context_header.clone(), context.to_string());
        }

        DispatchRequest {
            request_id: queued.request_id,
            method: queued.request.method,
            url: queued.request.url.clone(),
            headers,
            body: queued.request.body.as_ref().map(|b| b.to_string()),
        }
    }

    fn dispatch(&self, queued: QueuedRequest) {
        let request = self.build_dispatch(&queued);
        let id = queued.request_id;
        tracing::debug!(request_id = %id, method = %request.method, url = %request.url, "dispatching");

        let queue = self.self_ref.clone();
        self.transport.dispatch(
            request,
            Box::new(move |response| {
                if let Some(queue) = queue.upgrade() {
                    queue.complete(id, response);
                }
            }),
        );
    }

    /// Entry point for transport completions.
    pub fn complete(&self, id: RequestId, response: ApiResponse) {
        let Some(queued) = self.inner.lock().in_flight.remove(&id) else {
            tracing::debug!(request_id = %id, status = response.status, "completion for request no longer in flight");
            return;
        };
        tracing::debug!(request_id = %id, status = response.status, "request completed");

        if response.status == FORBIDDEN {
            self.handle_forbidden(queued, response);
        } else if self.config.offline_statuses.contains(&response.status) {
            self.handle_offline(queued, response);
        } else {
            let outcome = RequestOutcome::from_response(&response);
            if let RequestOutcome::Malformed { reason, .. } = &outcome {
                tracing::warn!(request_id = %id, reason = %reason, "malformed response body");
            }
            self.settle_replay(&queued);
            self.deliver(queued, outcome);
        }
    }

    fn handle_forbidden(&self, mut queued: QueuedRequest, response: ApiResponse) {
        if queued.auth_retries >= self.config.max_auth_retries {
            tracing::warn!(request_id = %queued.request_id, "still forbidden after token refresh");
            self.settle_replay(&queued);
            self.deliver(
                queued,
                RequestOutcome::Failed {
                    status: FORBIDDEN,
                    message: response.body,
                },
            );
            return;
        }

        match self.security.refresh_token() {
            Ok(()) => {
                let old = queued.request_id;
                queued.request_id = self.next_request_id();
                queued.queue_class = QueueClass::Priority;
                queued.auth_retries += 1;
                tracing::info!(request_id = %old, retry_id = %queued.request_id, "re-enqueued after token refresh");
                self.push(queued, true);
                self.drain();
            }
            Err(e) => {
                self.settle_replay(&queued);
                self.deliver(
                    queued,
                    RequestOutcome::Failed {
                        status: FORBIDDEN,
                        message: e.to_string(),
                    },
                );
            }
        }
    }

    fn handle_offline(&self, queued: QueuedRequest, response: ApiResponse) {
        let Some(offline) = &self.offline else {
            self.deliver(
                queued,
                RequestOutcome::Failed {
                    status: response.status,
                    message: "server unreachable".to_string(),
                },
            );
            return;
        };

        // a replay that failed again stays in the log; only the first
        // failure is reported
        if let Some(seq) = queued.offline_seq {
            offline.release(seq);
            return;
        }

        match offline.add_offline_request(queued.clone()) {
            Ok(seq) => {
                tracing::info!(request_id = %queued.request_id, seq, "request stored for offline replay");
                self.deliver(queued, RequestOutcome::Queued);
            }
            Err(e) => {
                tracing::error!(request_id = %queued.request_id, error = %e, "failed to store offline request");
                self.deliver(
                    queued,
                    RequestOutcome::Failed {
                        status: response.status,
                        message: e.to_string(),
                    },
                );
            }
        }
    }

    fn settle_replay(&self, queued: &QueuedRequest) {
        if let (Some(seq), Some(offline)) = (queued.offline_seq, &self.offline) {
            if let Err(e) = offline.settle(seq) {
                tracing::error!(seq, error = %e, "failed to settle offline request");
            }
        }
    }

    fn deliver(&self, queued: QueuedRequest, outcome: RequestOutcome) {
        let handler = self
            .handlers
            .read()
            .get(&queued.association.handler)
            .and_then(Weak::upgrade);
        let Some(handler) = handler else {
            tracing::warn!(
                request_id = %queued.request_id,
                handler = %queued.association.handler,
                "no completion handler registered"
            );
            return;
        };

        let completion = RequestCompletion {
            request_id: queued.request_id,
            request: queued.request,
            association: queued.association,
            outcome,
            was_offline: queued.was_offline,
        };
        handler.request_completed(&completion);
    }
}

impl TokenListener for RequestQueue {
    fn token_available(&self) {
        self.drain();
    }
}
