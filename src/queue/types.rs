//! Request, completion and outcome types for the request queue.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::types::RequestId;

/// HTTP verbs used by the remote backends.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Patch => "PATCH",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request as built by a backend, before the queue adds headers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApiRequest {
    pub method: HttpMethod,
    pub url: String,
    #[serde(default)]
    pub body: Option<Value>,
    /// Scoping context merged from the context registry.
    #[serde(default)]
    pub context: Option<Value>,
}

impl ApiRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            body: None,
            context: None,
        }
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_context(mut self, context: Option<Value>) -> Self {
        self.context = context;
        self
    }
}

/// Which queue a request waits in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueClass {
    Priority,
    Background,
}

/// What the request is for, used to route the completion.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestOperation {
    FetchAll,
    FetchItem,
    Create,
    Update,
    Delete,
    ModifiedCheck,
    LastModified,
}

/// Routing information carried with a request from enqueue to completion.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestAssociation {
    /// Name of the registered completion handler.
    pub handler: String,
    pub state_name: String,
    pub operation: RequestOperation,
    /// The record the request was about, if any.
    #[serde(default)]
    pub item: Option<Value>,
}

impl RequestAssociation {
    pub fn new(
        handler: impl Into<String>,
        state_name: impl Into<String>,
        operation: RequestOperation,
    ) -> Self {
        Self {
            handler: handler.into(),
            state_name: state_name.into(),
            operation,
            item: None,
        }
    }

    pub fn with_item(mut self, item: Value) -> Self {
        self.item = Some(item);
        self
    }
}

/// A request owned by the queue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueuedRequest {
    pub request: ApiRequest,
    pub request_id: RequestId,
    pub queue_class: QueueClass,
    pub association: RequestAssociation,
    /// Replayed from the offline log.
    #[serde(default)]
    pub was_offline: bool,
    /// Offline log entry this replay settles.
    #[serde(default)]
    pub offline_seq: Option<u64>,
    /// Re-enqueues after token refreshes so far.
    #[serde(default)]
    pub auth_retries: u32,
}

/// Raw transport response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApiResponse {
    /// HTTP status; 0 when no response arrived.
    pub status: u16,
    pub body: String,
}

impl ApiResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn json(status: u16, body: &Value) -> Self {
        Self {
            status,
            body: body.to_string(),
        }
    }

    /// No response at all (connection refused, DNS failure, ...).
    pub fn no_response() -> Self {
        Self {
            status: 0,
            body: String::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status) || self.status == 304
    }
}

/// How a request ended, as seen by its completion handler.
#[derive(Clone, Debug, PartialEq)]
pub enum RequestOutcome {
    Success { status: u16, data: Value },
    Failed { status: u16, message: String },
    /// The response body could not be parsed. Not retried.
    Malformed { status: u16, reason: String },
    /// Handed to the offline log; it will be replayed later.
    Queued,
    /// Dropped by a queue reset before a response was used.
    Cancelled,
}

impl RequestOutcome {
    /// Classify a response that is neither forbidden nor offline.
    pub fn from_response(response: &ApiResponse) -> Self {
        if !response.is_success() {
            return RequestOutcome::Failed {
                status: response.status,
                message: response.body.clone(),
            };
        }
        if response.body.trim().is_empty() {
            return RequestOutcome::Success {
                status: response.status,
                data: Value::Null,
            };
        }
        match serde_json::from_str(&response.body) {
            Ok(data) => RequestOutcome::Success {
                status: response.status,
                data,
            },
            Err(e) => RequestOutcome::Malformed {
                status: response.status,
                reason: e.to_string(),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RequestOutcome::Success { .. })
    }
}

/// Delivered to a completion handler once per request.
#[derive(Clone, Debug)]
pub struct RequestCompletion {
    pub request_id: RequestId,
    pub request: ApiRequest,
    pub association: RequestAssociation,
    pub outcome: RequestOutcome,
    pub was_offline: bool,
}

/// Receives completions for requests tagged with its name.
pub trait RequestCompletionHandler: Send + Sync {
    fn request_completed(&self, completion: &RequestCompletion);
}
