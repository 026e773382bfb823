//! Resource-style REST mapping.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use super::shape::ApiShape;
use crate::error::{Result, SyncError};
use crate::queue::{ApiRequest, HttpMethod, RequestOperation};
use crate::types::{key_of, Timestamp, DEFAULT_KEY_FIELD};

/// One REST collection rooted at `url`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RestCollection {
    pub name: String,
    pub url: String,
    #[serde(default = "default_key_field")]
    pub key_field: String,
}

fn default_key_field() -> String {
    DEFAULT_KEY_FIELD.to_string()
}

impl RestCollection {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            key_field: default_key_field(),
        }
    }

    pub fn with_key_field(mut self, key_field: impl Into<String>) -> Self {
        self.key_field = key_field.into();
        self
    }
}

/// `GET url`, `GET url/:id`, `POST url`, `PUT url/:id`, `DELETE url/:id`,
/// `PATCH url/:id/:modifiedTimestamp`.
#[derive(Clone, Debug, Default)]
pub struct RestShape {
    collections: HashMap<String, RestCollection>,
}

impl RestShape {
    pub fn new(collections: impl IntoIterator<Item = RestCollection>) -> Self {
        Self {
            collections: collections
                .into_iter()
                .map(|c| (c.name.clone(), c))
                .collect(),
        }
    }

    pub fn add_collection(&mut self, collection: RestCollection) {
        self.collections.insert(collection.name.clone(), collection);
    }

    fn collection(&self, name: &str) -> Result<&RestCollection> {
        self.collections
            .get(name)
            .ok_or_else(|| SyncError::StateNotManaged(name.to_string()))
    }

    fn item_url(&self, name: &str, item: &Value) -> Result<String> {
        let collection = self.collection(name)?;
        let id = key_of(item, &collection.key_field).ok_or_else(|| SyncError::MissingKey {
            store: name.to_string(),
            key_field: collection.key_field.clone(),
        })?;
        Ok(format!("{}/{}", collection.url.trim_end_matches('/'), id))
    }
}

impl ApiShape for RestShape {
    fn is_managed(&self, name: &str) -> bool {
        self.collections.contains_key(name)
    }

    fn key_field(&self, name: &str) -> String {
        self.collections
            .get(name)
            .map(|c| c.key_field.clone())
            .unwrap_or_else(default_key_field)
    }

    fn find_all(&self, name: &str) -> Result<ApiRequest> {
        Ok(ApiRequest::new(HttpMethod::Get, self.collection(name)?.url.clone()))
    }

    fn find_item(&self, name: &str, item: &Value) -> Result<ApiRequest> {
        Ok(ApiRequest::new(HttpMethod::Get, self.item_url(name, item)?))
    }

    fn create(&self, name: &str, item: &Value) -> Result<ApiRequest> {
        Ok(ApiRequest::new(HttpMethod::Post, self.collection(name)?.url.clone()).with_body(item.clone()))
    }

    fn update(&self, name: &str, item: &Value) -> Result<ApiRequest> {
        Ok(ApiRequest::new(HttpMethod::Put, self.item_url(name, item)?).with_body(item.clone()))
    }

    fn delete(&self, name: &str, item: &Value) -> Result<ApiRequest> {
        Ok(ApiRequest::new(HttpMethod::Delete, self.item_url(name, item)?))
    }

    fn modified_since(&self, name: &str, item: &Value, since: Timestamp) -> Result<ApiRequest> {
        let url = format!("{}/{}", self.item_url(name, item)?, since.as_millis());
        Ok(ApiRequest::new(HttpMethod::Patch, url))
    }

    fn unwrap_response(&self, _name: &str, _operation: &RequestOperation, data: Value) -> Result<Value> {
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn shape() -> RestShape {
        RestShape::new([
            RestCollection::new("users", "/api/users/"),
            RestCollection::new("orders", "/api/orders").with_key_field("orderNo"),
        ])
    }

    #[test]
    fn test_urls_and_verbs() {
        let shape = shape();
        let user = json!({"_id": "u1", "name": "Ann"});

        let all = shape.find_all("users").unwrap();
        assert_eq!((all.method, all.url.as_str()), (HttpMethod::Get, "/api/users/"));

        let one = shape.find_item("users", &user).unwrap();
        assert_eq!((one.method, one.url.as_str()), (HttpMethod::Get, "/api/users/u1"));

        let created = shape.create("users", &user).unwrap();
        assert_eq!(created.method, HttpMethod::Post);
        assert_eq!(created.body, Some(user.clone()));

        let updated = shape.update("users", &user).unwrap();
        assert_eq!((updated.method, updated.url.as_str()), (HttpMethod::Put, "/api/users/u1"));

        let deleted = shape.delete("orders", &json!({"orderNo": 12})).unwrap();
        assert_eq!((deleted.method, deleted.url.as_str()), (HttpMethod::Delete, "/api/orders/12"));

        let check = shape
            .modified_since("users", &user, Timestamp(1_700_000_000_000))
            .unwrap();
        assert_eq!(
            (check.method, check.url.as_str()),
            (HttpMethod::Patch, "/api/users/u1/1700000000000")
        );
    }

    #[test]
    fn test_errors() {
        let shape = shape();
        assert!(matches!(shape.find_all("ghosts"), Err(SyncError::StateNotManaged(_))));
        assert!(matches!(
            shape.update("orders", &json!({"_id": "x"})),
            Err(SyncError::MissingKey { .. })
        ));
        assert_eq!(shape.key_field("orders"), "orderNo");
        assert_eq!(shape.key_field("ghosts"), "_id");
    }
}
