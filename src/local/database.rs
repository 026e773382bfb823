//! File-backed object-store database.
//!
//! One database file holds a versioned set of object stores, each mapping
//! a record key (taken from the store's key path) to a JSON record. Every
//! operation reopens the file under an exclusive lock, runs as one
//! transaction over the stores it names, and rewrites the file atomically
//! if anything changed.

use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{Result, SyncError};
use crate::types::{key_of, DEFAULT_KEY_FIELD};

/// Magic bytes for database files.
const DB_MAGIC: &[u8; 4] = b"OSDB";

/// Current file format version.
const DB_FORMAT_VERSION: u8 = 1;

/// Declared shape of one object store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSchema {
    pub name: String,
    pub key_path: String,
}

impl StoreSchema {
    pub fn new(name: impl Into<String>, key_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key_path: key_path.into(),
        }
    }

    /// A store keyed by `_id`.
    pub fn keyed_by_id(name: impl Into<String>) -> Self {
        Self::new(name, DEFAULT_KEY_FIELD)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct ObjectStore {
    key_path: String,
    records: BTreeMap<String, Value>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct DatabaseImage {
    version: u32,
    stores: BTreeMap<String, ObjectStore>,
}

/// Whether a transaction may write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
}

/// Access to the stores named when the transaction was opened.
pub struct Transaction<'a> {
    image: &'a mut DatabaseImage,
    scope: Vec<String>,
    mode: TransactionMode,
    dirty: bool,
}

impl<'a> Transaction<'a> {
    fn store(&self, name: &str) -> Result<&ObjectStore> {
        if !self.scope.iter().any(|s| s == name) {
            return Err(SyncError::Transaction(format!(
                "store '{}' is outside this transaction",
                name
            )));
        }
        self.image
            .stores
            .get(name)
            .ok_or_else(|| SyncError::ObjectStoreNotFound(name.to_string()))
    }

    fn store_mut(&mut self, name: &str) -> Result<&mut ObjectStore> {
        if self.mode == TransactionMode::ReadOnly {
            return Err(SyncError::Transaction(format!(
                "write to '{}' in a read-only transaction",
                name
            )));
        }
        self.store(name)?;
        self.dirty = true;
        self.image
            .stores
            .get_mut(name)
            .ok_or_else(|| SyncError::ObjectStoreNotFound(name.to_string()))
    }

    pub fn get(&self, store: &str, key: &str) -> Result<Option<Value>> {
        Ok(self.store(store)?.records.get(key).cloned())
    }

    pub fn get_all(&self, store: &str) -> Result<Vec<Value>> {
        Ok(self.store(store)?.records.values().cloned().collect())
    }

    pub fn count(&self, store: &str) -> Result<usize> {
        Ok(self.store(store)?.records.len())
    }

    /// Insert or replace a record, returning its key.
    pub fn put(&mut self, store: &str, record: Value) -> Result<String> {
        let object_store = self.store_mut(store)?;
        let key = key_of(&record, &object_store.key_path).ok_or_else(|| SyncError::MissingKey {
            store: store.to_string(),
            key_field: object_store.key_path.clone(),
        })?;
        object_store.records.insert(key.clone(), record);
        Ok(key)
    }

    pub fn delete(&mut self, store: &str, key: &str) -> Result<Option<Value>> {
        Ok(self.store_mut(store)?.records.remove(key))
    }

    pub fn clear(&mut self, store: &str) -> Result<()> {
        self.store_mut(store)?.records.clear();
        Ok(())
    }
}

/// Releases the file lock when dropped.
struct LockGuard {
    file: File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// A versioned object-store database in one file.
pub struct LocalDatabase {
    name: String,
    path: PathBuf,
    lock_path: PathBuf,
    schemas: Vec<StoreSchema>,
    version: Mutex<u32>,
}

impl LocalDatabase {
    /// Open (or create) `<dir>/<name>.osdb` with the given stores.
    ///
    /// Missing stores are created in an upgrade that bumps the version.
    /// A file that cannot be read structurally, or whose stores disagree
    /// with the declared key paths, is deleted and recreated empty.
    pub fn open(dir: impl AsRef<Path>, name: &str, schemas: Vec<StoreSchema>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        let db = Self {
            name: name.to_string(),
            path: dir.join(format!("{}.osdb", name)),
            lock_path: dir.join(format!("{}.lock", name)),
            schemas,
            version: Mutex::new(0),
        };
        let version = db.open_with_upgrade()?;
        *db.version.lock() = version;
        Ok(db)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Schema version after the last open.
    pub fn version(&self) -> u32 {
        *self.version.lock()
    }

    pub fn schemas(&self) -> &[StoreSchema] {
        &self.schemas
    }

    pub fn has_store(&self, name: &str) -> bool {
        self.schemas.iter().any(|s| s.name == name)
    }

    pub fn key_path(&self, store: &str) -> Option<&str> {
        self.schemas
            .iter()
            .find(|s| s.name == store)
            .map(|s| s.key_path.as_str())
    }

    fn open_with_upgrade(&self) -> Result<u32> {
        let _lock = self.lock()?;

        let existing = self
            .read_image()
            .and_then(|image| match image {
                Some(image) => self.check_key_paths(&image).map(|_| Some(image)),
                None => Ok(None),
            });

        let mut image = match existing {
            Ok(Some(image)) => image,
            Ok(None) => {
                tracing::info!(database = %self.name, "creating database");
                DatabaseImage::default()
            }
            Err(e) if e.is_structural() => {
                tracing::warn!(
                    database = %self.name,
                    error = %e,
                    "database unreadable, deleting and recreating"
                );
                if self.path.exists() {
                    fs::remove_file(&self.path)?;
                }
                DatabaseImage::default()
            }
            Err(e) => return Err(e),
        };

        let missing: Vec<&StoreSchema> = self
            .schemas
            .iter()
            .filter(|s| !image.stores.contains_key(&s.name))
            .collect();

        if !missing.is_empty() || image.version == 0 {
            image.version += 1;
            for schema in missing {
                tracing::info!(
                    database = %self.name,
                    store = %schema.name,
                    version = image.version,
                    "creating object store"
                );
                image.stores.insert(
                    schema.name.clone(),
                    ObjectStore {
                        key_path: schema.key_path.clone(),
                        records: BTreeMap::new(),
                    },
                );
            }
            self.write_image(&image)?;
        }

        Ok(image.version)
    }

    fn check_key_paths(&self, image: &DatabaseImage) -> Result<()> {
        for schema in &self.schemas {
            if let Some(store) = image.stores.get(&schema.name) {
                if store.key_path != schema.key_path {
                    return Err(SyncError::SchemaMismatch {
                        store: schema.name.clone(),
                        expected: schema.key_path.clone(),
                        found: store.key_path.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Run `f` as one transaction over `stores`.
    ///
    /// Nothing is written if `f` fails.
    pub fn transaction<T, F>(&self, stores: &[&str], mode: TransactionMode, f: F) -> Result<T>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T>,
    {
        let _lock = self.lock()?;
        let mut image = self
            .read_image()?
            .ok_or_else(|| SyncError::Transaction(format!("database '{}' is gone", self.name)))?;

        let mut tx = Transaction {
            image: &mut image,
            scope: stores.iter().map(|s| s.to_string()).collect(),
            mode,
            dirty: false,
        };
        let result = f(&mut tx)?;
        let dirty = tx.dirty;

        if dirty {
            self.write_image(&image)?;
        }
        Ok(result)
    }

    pub fn get(&self, store: &str, key: &str) -> Result<Option<Value>> {
        self.transaction(&[store], TransactionMode::ReadOnly, |tx| tx.get(store, key))
    }

    pub fn get_all(&self, store: &str) -> Result<Vec<Value>> {
        self.transaction(&[store], TransactionMode::ReadOnly, |tx| tx.get_all(store))
    }

    pub fn put(&self, store: &str, record: Value) -> Result<String> {
        self.transaction(&[store], TransactionMode::ReadWrite, |tx| tx.put(store, record))
    }

    pub fn delete(&self, store: &str, key: &str) -> Result<Option<Value>> {
        self.transaction(&[store], TransactionMode::ReadWrite, |tx| tx.delete(store, key))
    }

    /// Clear a store and insert `records`, atomically.
    pub fn replace_all(&self, store: &str, records: Vec<Value>) -> Result<()> {
        self.transaction(&[store], TransactionMode::ReadWrite, |tx| {
            tx.clear(store)?;
            for record in records {
                tx.put(store, record)?;
            }
            Ok(())
        })
    }

    /// Remove the database file entirely.
    pub fn delete_database(&self) -> Result<()> {
        let _lock = self.lock()?;
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    fn lock(&self) -> Result<LockGuard> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_path)?;
        file.lock_exclusive().map_err(|_| SyncError::Locked)?;
        Ok(LockGuard { file })
    }

    fn read_image(&self) -> Result<Option<DatabaseImage>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let mut file = File::open(&self.path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)
            .map_err(|_| SyncError::InvalidFormat("truncated database header".into()))?;
        if &magic != DB_MAGIC {
            return Err(SyncError::InvalidFormat("Invalid database magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)
            .map_err(|_| SyncError::InvalidFormat("truncated database header".into()))?;
        if version[0] != DB_FORMAT_VERSION {
            return Err(SyncError::InvalidFormat(format!(
                "Unsupported database format: {}",
                version[0]
            )));
        }

        let mut len_bytes = [0u8; 8];
        file.read_exact(&mut len_bytes)
            .map_err(|_| SyncError::Corruption("truncated database length".into()))?;
        let len = u64::from_le_bytes(len_bytes) as usize;

        let mut encoded = vec![0u8; len];
        file.read_exact(&mut encoded)
            .map_err(|_| SyncError::Corruption("truncated database body".into()))?;

        let mut checksum_bytes = [0u8; 4];
        file.read_exact(&mut checksum_bytes)
            .map_err(|_| SyncError::Corruption("missing database checksum".into()))?;
        let expected = u32::from_le_bytes(checksum_bytes);
        let got = crc32fast::hash(&encoded);
        if expected != got {
            return Err(SyncError::ChecksumMismatch { expected, got });
        }

        Ok(Some(rmp_serde::from_slice(&encoded)?))
    }

    fn write_image(&self, image: &DatabaseImage) -> Result<()> {
        let encoded = rmp_serde::to_vec(image)?;
        let tmp = self.path.with_extension("osdb.tmp");

        let mut file = File::create(&tmp)?;
        file.write_all(DB_MAGIC)?;
        file.write_all(&[DB_FORMAT_VERSION])?;
        file.write_all(&(encoded.len() as u64).to_le_bytes())?;
        file.write_all(&encoded)?;
        file.write_all(&crc32fast::hash(&encoded).to_le_bytes())?;
        file.sync_all()?;

        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn open(dir: &TempDir, stores: &[&str]) -> LocalDatabase {
        LocalDatabase::open(
            dir.path(),
            "app",
            stores.iter().map(|s| StoreSchema::keyed_by_id(*s)).collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_put_get_delete() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir, &["users"]);

        let key = db.put("users", json!({"_id": "u1", "name": "Ada"})).unwrap();
        assert_eq!(key, "u1");
        assert_eq!(db.get("users", "u1").unwrap(), Some(json!({"_id": "u1", "name": "Ada"})));
        assert_eq!(db.get_all("users").unwrap().len(), 1);

        let removed = db.delete("users", "u1").unwrap();
        assert!(removed.is_some());
        assert!(db.get_all("users").unwrap().is_empty());
    }

    #[test]
    fn test_missing_key_rejected() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir, &["users"]);
        let result = db.put("users", json!({"name": "nobody"}));
        assert!(matches!(result, Err(SyncError::MissingKey { .. })));
    }

    #[test]
    fn test_new_store_bumps_version_and_keeps_data() {
        let dir = TempDir::new().unwrap();
        {
            let db = open(&dir, &["users"]);
            assert_eq!(db.version(), 1);
            db.put("users", json!({"_id": 1})).unwrap();
        }

        let db = open(&dir, &["users", "orders"]);
        assert_eq!(db.version(), 2);
        assert_eq!(db.get_all("users").unwrap().len(), 1);
        assert!(db.get_all("orders").unwrap().is_empty());

        // same stores again: no upgrade
        drop(db);
        let db = open(&dir, &["users", "orders"]);
        assert_eq!(db.version(), 2);
    }

    #[test]
    fn test_corrupt_file_is_recreated() {
        let dir = TempDir::new().unwrap();
        {
            let db = open(&dir, &["users"]);
            db.put("users", json!({"_id": 1})).unwrap();
        }
        fs::write(dir.path().join("app.osdb"), b"garbage that is not a database").unwrap();

        let db = open(&dir, &["users"]);
        assert_eq!(db.version(), 1);
        assert!(db.get_all("users").unwrap().is_empty());
    }

    #[test]
    fn test_key_path_change_is_recreated() {
        let dir = TempDir::new().unwrap();
        {
            let db = open(&dir, &["users"]);
            db.put("users", json!({"_id": 1})).unwrap();
        }
        let db = LocalDatabase::open(dir.path(), "app", vec![StoreSchema::new("users", "email")]).unwrap();
        assert!(db.get_all("users").unwrap().is_empty());
        assert_eq!(db.key_path("users"), Some("email"));
    }

    #[test]
    fn test_replace_all_is_atomic() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir, &["users"]);
        db.replace_all("users", vec![json!({"_id": 1}), json!({"_id": 2})]).unwrap();

        // second record has no key: the whole replace must roll back
        let result = db.replace_all("users", vec![json!({"_id": 3}), json!({"nokey": true})]);
        assert!(result.is_err());
        let keys: Vec<_> = db
            .get_all("users")
            .unwrap()
            .iter()
            .map(|v| v["_id"].clone())
            .collect();
        assert_eq!(keys, vec![json!(1), json!(2)]);
    }

    #[test]
    fn test_read_only_transaction_rejects_writes() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir, &["users"]);
        let result = db.transaction(&["users"], TransactionMode::ReadOnly, |tx| {
            tx.put("users", json!({"_id": 1}))
        });
        assert!(matches!(result, Err(SyncError::Transaction(_))));
    }

    #[test]
    fn test_transaction_scope_enforced() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir, &["users", "orders"]);
        let result = db.transaction(&["users"], TransactionMode::ReadOnly, |tx| tx.get_all("orders"));
        assert!(matches!(result, Err(SyncError::Transaction(_))));
    }

    #[test]
    fn test_multi_store_transaction() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir, &["users", "orders"]);
        db.transaction(&["users", "orders"], TransactionMode::ReadWrite, |tx| {
            tx.put("users", json!({"_id": "u"}))?;
            tx.put("orders", json!({"_id": "o", "user": "u"}))?;
            Ok(())
        })
        .unwrap();
        assert_eq!(db.get_all("orders").unwrap().len(), 1);
        assert_eq!(db.get_all("users").unwrap().len(), 1);
    }
}
