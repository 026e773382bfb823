//! Single-endpoint GraphQL mapping.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;

use super::shape::ApiShape;
use crate::error::{Result, SyncError};
use crate::queue::{ApiRequest, HttpMethod, RequestOperation};
use crate::types::{key_of, Timestamp, DEFAULT_KEY_FIELD};

/// A query or mutation document and the `data` attribute holding its
/// result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GraphQlOperation {
    pub document: String,
    pub data_attribute: String,
}

impl GraphQlOperation {
    pub fn new(document: impl Into<String>, data_attribute: impl Into<String>) -> Self {
        Self {
            document: document.into(),
            data_attribute: data_attribute.into(),
        }
    }
}

/// Operations configured for one collection. Missing ones are refused.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphQlCollection {
    pub name: String,
    pub key_field: String,
    pub find_all: Option<GraphQlOperation>,
    pub find_item: Option<GraphQlOperation>,
    pub create: Option<GraphQlOperation>,
    pub update: Option<GraphQlOperation>,
    pub delete: Option<GraphQlOperation>,
    pub modified_since: Option<GraphQlOperation>,
}

impl GraphQlCollection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key_field: DEFAULT_KEY_FIELD.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphQlConfig {
    pub endpoint: String,
    pub collections: Vec<GraphQlCollection>,
}

/// Every request is a `POST` to one endpoint with a
/// `{query|mutation, variables}` body; responses are unwrapped from
/// `data.<data_attribute>`.
#[derive(Clone, Debug, Default)]
pub struct GraphQlShape {
    endpoint: String,
    collections: HashMap<String, GraphQlCollection>,
}

#[derive(Clone, Copy)]
enum Kind {
    Query,
    Mutation,
}

impl GraphQlShape {
    pub fn new(config: GraphQlConfig) -> Self {
        Self {
            endpoint: config.endpoint,
            collections: config
                .collections
                .into_iter()
                .map(|c| (c.name.clone(), c))
                .collect(),
        }
    }

    fn collection(&self, name: &str) -> Result<&GraphQlCollection> {
        self.collections
            .get(name)
            .ok_or_else(|| SyncError::StateNotManaged(name.to_string()))
    }

    fn operation(&self, name: &str, operation: &RequestOperation) -> Result<&GraphQlOperation> {
        let collection = self.collection(name)?;
        let op = match operation {
            RequestOperation::FetchAll => &collection.find_all,
            RequestOperation::FetchItem => &collection.find_item,
            RequestOperation::Create => &collection.create,
            RequestOperation::Update => &collection.update,
            RequestOperation::Delete => &collection.delete,
            RequestOperation::ModifiedCheck => &collection.modified_since,
            RequestOperation::LastModified => &None,
        };
        op.as_ref().ok_or_else(|| {
            SyncError::InvalidOperation(format!("{name}: no GraphQL document for {operation:?}"))
        })
    }

    fn key(&self, name: &str, item: &Value) -> Result<String> {
        let collection = self.collection(name)?;
        key_of(item, &collection.key_field).ok_or_else(|| SyncError::MissingKey {
            store: name.to_string(),
            key_field: collection.key_field.clone(),
        })
    }

    fn request(
        &self,
        name: &str,
        operation: RequestOperation,
        kind: Kind,
        variables: Value,
    ) -> Result<ApiRequest> {
        let op = self.operation(name, &operation)?;
        let verb = match kind {
            Kind::Query => "query",
            Kind::Mutation => "mutation",
        };
        let mut body = serde_json::Map::new();
        body.insert(verb.to_string(), Value::String(op.document.clone()));
        body.insert("variables".to_string(), variables);
        Ok(ApiRequest::new(HttpMethod::Post, self.endpoint.clone()).with_body(Value::Object(body)))
    }
}

impl ApiShape for GraphQlShape {
    fn is_managed(&self, name: &str) -> bool {
        self.collections.contains_key(name)
    }

    fn key_field(&self, name: &str) -> String {
        self.collections
            .get(name)
            .map(|c| c.key_field.clone())
            .unwrap_or_else(|| DEFAULT_KEY_FIELD.to_string())
    }

    fn find_all(&self, name: &str) -> Result<ApiRequest> {
        self.request(name, RequestOperation::FetchAll, Kind::Query, json!({}))
    }

    fn find_item(&self, name: &str, item: &Value) -> Result<ApiRequest> {
        let id = self.key(name, item)?;
        self.request(name, RequestOperation::FetchItem, Kind::Query, json!({ "id": id }))
    }

    fn create(&self, name: &str, item: &Value) -> Result<ApiRequest> {
        self.request(name, RequestOperation::Create, Kind::Mutation, json!({ "item": item }))
    }

    fn update(&self, name: &str, item: &Value) -> Result<ApiRequest> {
        let id = self.key(name, item)?;
        self.request(
            name,
            RequestOperation::Update,
            Kind::Mutation,
            json!({ "id": id, "item": item }),
        )
    }

    fn delete(&self, name: &str, item: &Value) -> Result<ApiRequest> {
        let id = self.key(name, item)?;
        self.request(name, RequestOperation::Delete, Kind::Mutation, json!({ "id": id }))
    }

    fn modified_since(&self, name: &str, item: &Value, since: Timestamp) -> Result<ApiRequest> {
        let id = self.key(name, item)?;
        self.request(
            name,
            RequestOperation::ModifiedCheck,
            Kind::Query,
            json!({ "id": id, "since": since.as_millis() }),
        )
    }

    fn unwrap_response(&self, name: &str, operation: &RequestOperation, data: Value) -> Result<Value> {
        if data.is_null() {
            return Ok(Value::Null);
        }
        let op = self.operation(name, operation)?;
        match data.get("data").and_then(|d| d.get(&op.data_attribute)) {
            Some(value) => Ok(value.clone()),
            None => {
                let detail = data
                    .get("errors")
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| format!("missing data.{}", op.data_attribute));
                Err(SyncError::MalformedPayload(detail))
            }
        }
    }
}
