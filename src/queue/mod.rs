//! Request queue: the single path from backends to the network.
//!
//! Backends build an [`ApiRequest`] plus a [`RequestAssociation`] naming the
//! completion handler and enqueue it at priority or background. The queue
//! dispatches through an [`HttpTransport`](crate::transport::HttpTransport)
//! and classifies the response:
//!
//! | response | outcome |
//! |---|---|
//! | 2xx / 304 with JSON or empty body | `Success` |
//! | 2xx with an unparseable body | `Malformed`, not retried |
//! | 403 | token refresh, re-enqueued at priority |
//! | configured offline status (default 0) | offline log, `Queued` once |
//! | anything else | `Failed` |

mod manager;
mod security;
mod types;

pub use manager::RequestQueue;
pub use security::{SecurityContext, TokenListener, TokenProvider};
pub use types::{
    ApiRequest, ApiResponse, HttpMethod, QueueClass, QueuedRequest, RequestAssociation,
    RequestCompletion, RequestCompletionHandler, RequestOperation, RequestOutcome,
};
