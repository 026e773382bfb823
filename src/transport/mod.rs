//! Pluggable HTTP transport for the request queue.
//!
//! The queue never performs I/O itself. It hands a fully prepared
//! [`DispatchRequest`] to an [`HttpTransport`] together with a completion
//! callback, and the transport invokes the callback exactly once with the
//! response (status 0 when nothing came back).
//!
//! - [`MockTransport`] records requests and answers them from a script or
//!   on demand, for tests.
//! - [`ChannelTransport`] forwards requests over a crossbeam channel to
//!   worker threads that own the real HTTP client.

mod channel;
mod mock;

pub use channel::{ChannelTransport, TransportJob};
pub use mock::MockTransport;

use std::collections::BTreeMap;

use crate::queue::{ApiResponse, HttpMethod};
use crate::types::RequestId;

/// Called once with the response to a dispatched request.
pub type CompletionFn = Box<dyn FnOnce(ApiResponse) + Send>;

/// A request ready to go on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatchRequest {
    pub request_id: RequestId,
    pub method: HttpMethod,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
}

impl DispatchRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// Sends requests somewhere and reports back.
pub trait HttpTransport: Send + Sync {
    /// Start the request. `on_complete` may run before this returns.
    fn dispatch(&self, request: DispatchRequest, on_complete: CompletionFn);
}
