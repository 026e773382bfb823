//! One cache namespace: a local database plus its loaded flags.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;

use crate::config::CacheCollectionConfig;
use crate::error::Result;
use crate::kv::KeyValueStore;
use crate::local::{LocalDatabase, LocalStoreStateManager, StoreSchema, TransactionMode};
use crate::state::StateManager;
use crate::types::{Timestamp, DEFAULT_KEY_FIELD};

const LAST_REFRESHED_FIELD: &str = "lastRefreshed";

/// Per-user database name; the user id never reaches the filesystem.
pub fn user_database_name(base: &str, user_id: &str) -> String {
    let digest = Sha256::digest(user_id.as_bytes());
    format!("{}-{}", base, &hex::encode(digest)[..16])
}

/// Cached collections of one namespace (shared, or a single user's).
pub struct SubCache {
    user: Option<String>,
    base_name: String,
    refresh_store: String,
    local: LocalStoreStateManager,
    flags: Arc<dyn KeyValueStore>,
    flag_prefix: String,
}

impl SubCache {
    /// Open the shared namespace.
    pub fn open_shared(
        dir: &Path,
        base_name: &str,
        collections: &[CacheCollectionConfig],
        flags: Arc<dyn KeyValueStore>,
        flag_prefix: &str,
    ) -> Result<Self> {
        Self::open(dir, base_name, None, collections, flags, flag_prefix)
    }

    /// Open the namespace of `user_id`.
    pub fn open_for_user(
        dir: &Path,
        base_name: &str,
        user_id: &str,
        collections: &[CacheCollectionConfig],
        flags: Arc<dyn KeyValueStore>,
        flag_prefix: &str,
    ) -> Result<Self> {
        Self::open(dir, base_name, Some(user_id), collections, flags, flag_prefix)
    }

    fn open(
        dir: &Path,
        base_name: &str,
        user: Option<&str>,
        collections: &[CacheCollectionConfig],
        flags: Arc<dyn KeyValueStore>,
        flag_prefix: &str,
    ) -> Result<Self> {
        let db_name = match user {
            Some(user) => user_database_name(base_name, user),
            None => base_name.to_string(),
        };
        let refresh_store = format!("{db_name}-last-refresh");

        let mut schemas: Vec<StoreSchema> = collections
            .iter()
            .map(|c| StoreSchema::new(c.name.clone(), c.key_field.clone()))
            .collect();
        schemas.push(StoreSchema::new(refresh_store.clone(), DEFAULT_KEY_FIELD));

        let db = LocalDatabase::open(dir, &db_name, schemas)?;
        let backend = match user {
            Some(_) => format!("cache:{db_name}"),
            None => "cache".to_string(),
        };
        tracing::debug!(database = %db_name, collections = collections.len(), "opened cache namespace");

        Ok(Self {
            user: user.map(str::to_string),
            base_name: base_name.to_string(),
            refresh_store,
            local: LocalStoreStateManager::new(backend, Arc::new(db)),
            flags,
            flag_prefix: flag_prefix.to_string(),
        })
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn database(&self) -> &Arc<LocalDatabase> {
        self.local.database()
    }

    pub fn local(&self) -> &LocalStoreStateManager {
        &self.local
    }

    pub fn refresh_store(&self) -> &str {
        &self.refresh_store
    }

    pub fn holds(&self, name: &str) -> bool {
        name != self.refresh_store && self.local.database().has_store(name)
    }

    /// `<db>.<prefix><collection>`, prefixed with `<user>.` for a user
    /// namespace.
    pub fn flag_key(&self, name: &str) -> String {
        let key = format!("{}.{}{}", self.base_name, self.flag_prefix, name);
        match &self.user {
            Some(user) => format!("{user}.{key}"),
            None => key,
        }
    }

    pub fn is_loaded(&self, name: &str) -> Result<bool> {
        self.flags.contains(&self.flag_key(name))
    }

    pub fn set_loaded(&self, name: &str) -> Result<()> {
        self.flags.set(&self.flag_key(name), "true")
    }

    pub fn clear_loaded(&self, name: &str) -> Result<()> {
        self.flags.remove(&self.flag_key(name))
    }

    pub fn last_refreshed(&self, name: &str) -> Result<Option<Timestamp>> {
        let record = self.database().get(&self.refresh_store, name)?;
        Ok(record
            .as_ref()
            .and_then(|r| r.get(LAST_REFRESHED_FIELD))
            .and_then(Value::as_i64)
            .map(Timestamp))
    }

    pub fn record_refresh(&self, name: &str, at: Timestamp) -> Result<()> {
        self.database()
            .put(&self.refresh_store, refresh_record(name, at))
            .map(|_| ())
    }

    /// Cached records, read from the local store.
    pub fn read(&self, name: &str) -> Result<Vec<Value>> {
        self.local.get_state_by_name(name)
    }

    /// Replace a collection and record its refresh time in one
    /// transaction, then mark it loaded.
    pub fn write_through(&self, name: &str, values: Vec<Value>, at: Timestamp) -> Result<()> {
        let refresh_store = self.refresh_store.clone();
        let records = values.clone();
        self.database().transaction(
            &[name, refresh_store.as_str()],
            TransactionMode::ReadWrite,
            |tx| {
                tx.clear(name)?;
                for record in records {
                    tx.put(name, record)?;
                }
                tx.put(&refresh_store, refresh_record(name, at))?;
                Ok(())
            },
        )?;
        self.local.core().replace_completed(name, values);
        self.set_loaded(name)?;
        tracing::debug!(state = %name, at = %at, "cache written through");
        Ok(())
    }

    /// Insert or replace one record.
    pub fn upsert(&self, name: &str, item: Value) -> Result<()> {
        self.local.update_item_in_state(name, item, true)
    }

    pub fn remove(&self, name: &str, item: Value) -> Result<bool> {
        self.local.remove_item_from_state(name, item, true)
    }
}

fn refresh_record(name: &str, at: Timestamp) -> Value {
    let mut record = serde_json::Map::new();
    record.insert(DEFAULT_KEY_FIELD.to_string(), Value::String(name.to_string()));
    record.insert(LAST_REFRESHED_FIELD.to_string(), Value::from(at.as_millis()));
    Value::Object(record)
}
