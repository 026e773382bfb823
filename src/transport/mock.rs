//! Mock transport for testing.
//!
//! Captures dispatched requests and completes them either from a scripted
//! responder or on demand.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

use super::{CompletionFn, DispatchRequest, HttpTransport};
use crate::queue::ApiResponse;
use crate::types::RequestId;

type Responder = Arc<dyn Fn(&DispatchRequest) -> Option<ApiResponse> + Send + Sync>;

/// Records every dispatch. Requests the responder does not answer stay
/// pending until [`respond`](Self::respond) or
/// [`respond_next`](Self::respond_next) is called.
#[derive(Clone, Default)]
pub struct MockTransport {
    inner: Arc<Mutex<MockTransportInner>>,
}

#[derive(Default)]
struct MockTransportInner {
    dispatched: Vec<DispatchRequest>,
    pending: VecDeque<(DispatchRequest, CompletionFn)>,
    responder: Option<Responder>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every request synchronously with `response`.
    pub fn always(response: ApiResponse) -> Self {
        let transport = Self::new();
        transport.set_responder(move |_| Some(response.clone()));
        transport
    }

    /// Answer requests synchronously when `f` returns a response.
    pub fn set_responder<F>(&self, f: F)
    where
        F: Fn(&DispatchRequest) -> Option<ApiResponse> + Send + Sync + 'static,
    {
        self.inner.lock().responder = Some(Arc::new(f));
    }

    pub fn clear_responder(&self) {
        self.inner.lock().responder = None;
    }

    /// All requests dispatched so far, in order.
    pub fn dispatched(&self) -> Vec<DispatchRequest> {
        self.inner.lock().dispatched.clone()
    }

    pub fn dispatch_count(&self) -> usize {
        self.inner.lock().dispatched.len()
    }

    pub fn last_dispatched(&self) -> Option<DispatchRequest> {
        self.inner.lock().dispatched.last().cloned()
    }

    /// Requests waiting for a manual answer.
    pub fn pending(&self) -> Vec<DispatchRequest> {
        self.inner.lock().pending.iter().map(|(r, _)| r.clone()).collect()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Complete a specific pending request. Returns false if unknown.
    pub fn respond(&self, request_id: RequestId, response: ApiResponse) -> bool {
        let completion = {
            let mut inner = self.inner.lock();
            let pos = inner
                .pending
                .iter()
                .position(|(r, _)| r.request_id == request_id);
            pos.and_then(|p| inner.pending.remove(p))
        };
        match completion {
            Some((_, on_complete)) => {
                on_complete(response);
                true
            }
            None => false,
        }
    }

    /// Complete the oldest pending request.
    pub fn respond_next(&self, response: ApiResponse) -> Option<RequestId> {
        let next = self.inner.lock().pending.pop_front();
        next.map(|(request, on_complete)| {
            on_complete(response);
            request.request_id
        })
    }

    /// Complete every pending request, including ones dispatched while
    /// completing earlier ones.
    pub fn respond_all<F>(&self, f: F) -> usize
    where
        F: Fn(&DispatchRequest) -> ApiResponse,
    {
        let mut count = 0;
        loop {
            let next = self.inner.lock().pending.pop_front();
            let Some((request, on_complete)) = next else {
                break;
            };
            on_complete(f(&request));
            count += 1;
        }
        count
    }

    /// Forget everything, dropping pending completions unanswered.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.dispatched.clear();
        inner.pending.clear();
    }
}

impl HttpTransport for MockTransport {
    fn dispatch(&self, request: DispatchRequest, on_complete: CompletionFn) {
        let scripted = {
            let mut inner = self.inner.lock();
            inner.dispatched.push(request.clone());
            inner.responder.clone()
        };

        // responder and completion both run without the lock held
        if let Some(response) = scripted.and_then(|f| f(&request)) {
            on_complete(response);
            return;
        }
        self.inner.lock().pending.push_back((request, on_complete));
    }
}
