//! Transport that hands requests to worker threads over a channel.

use crossbeam_channel::{unbounded, Receiver, Sender};

use super::{CompletionFn, DispatchRequest, HttpTransport};
use crate::queue::ApiResponse;

/// A request plus the callback the worker must invoke once.
pub struct TransportJob {
    pub request: DispatchRequest,
    on_complete: CompletionFn,
}

impl TransportJob {
    pub fn complete(self, response: ApiResponse) {
        (self.on_complete)(response);
    }
}

/// Forwards dispatches to whoever holds the paired receiver.
///
/// The channel is unbounded: queued jobs wait for a worker instead of
/// failing. When the workers are gone the request completes immediately
/// with status 0, which the queue treats as offline.
#[derive(Clone)]
pub struct ChannelTransport {
    sender: Sender<TransportJob>,
}

impl ChannelTransport {
    pub fn new() -> (Self, Receiver<TransportJob>) {
        let (sender, receiver) = unbounded();
        (Self { sender }, receiver)
    }
}

impl HttpTransport for ChannelTransport {
    fn dispatch(&self, request: DispatchRequest, on_complete: CompletionFn) {
        let job = TransportJob {
            request,
            on_complete,
        };
        if let Err(err) = self.sender.send(job) {
            let job = err.into_inner();
            tracing::warn!(request_id = %job.request.request_id, "transport workers gone");
            job.complete(ApiResponse::no_response());
        }
    }
}
