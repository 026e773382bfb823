//! How CRUD verbs map onto a particular remote API.

use serde_json::Value;

use crate::error::Result;
use crate::queue::{ApiRequest, RequestOperation};
use crate::types::Timestamp;

/// Wire format of a remote API.
///
/// Builders fail with `StateNotManaged` for unknown names and `MissingKey`
/// when a record lacks its key.
pub trait ApiShape: Send + Sync {
    fn is_managed(&self, name: &str) -> bool;

    fn key_field(&self, name: &str) -> String;

    fn find_all(&self, name: &str) -> Result<ApiRequest>;

    fn find_item(&self, name: &str, item: &Value) -> Result<ApiRequest>;

    fn create(&self, name: &str, item: &Value) -> Result<ApiRequest>;

    fn update(&self, name: &str, item: &Value) -> Result<ApiRequest>;

    fn delete(&self, name: &str, item: &Value) -> Result<ApiRequest>;

    /// Ask whether the record changed after `since`.
    fn modified_since(&self, name: &str, item: &Value, since: Timestamp) -> Result<ApiRequest>;

    /// Extract the payload of a successful response.
    fn unwrap_response(&self, name: &str, operation: &RequestOperation, data: Value) -> Result<Value>;
}
