//! Engine configuration.
//!
//! Every section has a `Default` and deserializes with `#[serde(default)]`,
//! so a JSON file only needs the keys it wants to change.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, SyncError};
use crate::remote::{GraphQlConfig, RestCollection};
use crate::types::DEFAULT_KEY_FIELD;

/// Top-level configuration consumed by [`SyncEngine`](crate::SyncEngine).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub queue: QueueConfig,
    pub offline: OfflineConfig,
    pub cache: CacheConfig,
    /// REST collections served by the REST backend.
    pub rest: Vec<RestCollection>,
    /// GraphQL endpoint and collections, if any.
    pub graphql: Option<GraphQlConfig>,
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| SyncError::Config(e.to_string()))
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_json_str(&text)?;
        tracing::debug!(path = %path.display(), "loaded engine config");
        Ok(config)
    }
}

/// Request queue settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Hold all dispatches until a bearer token is available.
    pub requires_token: bool,
    pub token_header: String,
    /// Prepended to the token in the header value.
    pub token_prefix: String,
    /// Header carrying the merged request context as JSON.
    pub context_header: String,
    /// Statuses meaning "server unreachable".
    pub offline_statuses: Vec<u16>,
    /// Token refreshes allowed per request before it fails.
    pub max_auth_retries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            requires_token: false,
            token_header: "Authorization".to_string(),
            token_prefix: "Bearer ".to_string(),
            context_header: "x-request-context".to_string(),
            offline_statuses: vec![0],
            max_auth_retries: 1,
        }
    }
}

/// Offline manager settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
    /// Durable pending-request log. In-memory when unset.
    pub log_path: Option<PathBuf>,
    pub max_pending: usize,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            log_path: None,
            max_pending: 10_000,
        }
    }
}

/// Persistent local cache settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub database_dir: PathBuf,
    pub database_name: String,
    /// Endpoint answering `{collection: millis}`.
    pub last_modified_url: Option<String>,
    pub loaded_flag_prefix: String,
    /// Durable loaded flags. In-memory when unset.
    pub flags_path: Option<PathBuf>,
    pub collections: Vec<CacheCollectionConfig>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            database_dir: PathBuf::from("./cache"),
            database_name: "app".to_string(),
            last_modified_url: None,
            loaded_flag_prefix: "loaded.".to_string(),
            flags_path: None,
            collections: Vec::new(),
        }
    }
}

/// One cached collection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheCollectionConfig {
    pub name: String,
    pub key_field: String,
    /// Backend name the collection is fetched from.
    pub source: String,
    pub refresh_interval_secs: u64,
    /// Stored in the per-user database.
    pub private: bool,
}

impl CacheCollectionConfig {
    pub fn new(name: impl Into<String>, source: impl Into<String>, refresh_interval_secs: u64) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            refresh_interval_secs,
            ..Default::default()
        }
    }

    pub fn private(mut self) -> Self {
        self.private = true;
        self
    }

    pub fn with_key_field(mut self, key_field: impl Into<String>) -> Self {
        self.key_field = key_field.into();
        self
    }
}

impl Default for CacheCollectionConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            key_field: DEFAULT_KEY_FIELD.to_string(),
            source: String::new(),
            refresh_interval_secs: 300,
            private: false,
        }
    }
}
