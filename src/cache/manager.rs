//! Refresh-interval cache in front of remote backends.

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use super::freshness::CacheCollectionState;
use super::realtime::{RealtimeEvent, RealtimeEventKind, RealtimeListener};
use super::subcache::SubCache;
use crate::config::{CacheCollectionConfig, CacheConfig};
use crate::error::{Result, SyncError};
use crate::filter::{filter_items, FilterSpec};
use crate::kv::KeyValueStore;
use crate::notifications::{
    listener_fn, ChangeDelegate, ChangeEvent, ChangeEventType, ListenerId, StateChangeListener,
};
use crate::queue::{
    ApiRequest, HttpMethod, QueueClass, RequestAssociation, RequestCompletion,
    RequestCompletionHandler, RequestOperation, RequestOutcome, RequestQueue, SecurityContext,
};
use crate::state::StateManager;
use crate::types::{key_of, Clock, RequestId, Timestamp};

/// Backend and completion-handler name of the cache.
pub const CACHE_BACKEND: &str = "cache";

/// Serves cached collections from the local store while they are fresh and
/// forces a refetch from their source backend once they are not.
///
/// Fresh data from a source is written through to the local store in one
/// transaction together with its refresh time. Item events from the source
/// (own writes completing, offline replays) patch the local store. Events
/// from other clients arrive through [`RealtimeListener`].
///
/// Private collections live in a per-user [`SubCache`]; everything else
/// shares one.
pub struct PersistentLocalCache {
    self_ref: Weak<PersistentLocalCache>,
    delegate: ChangeDelegate,
    database_dir: PathBuf,
    database_name: String,
    flag_prefix: String,
    last_modified_url: Option<String>,
    collections: RwLock<HashMap<String, CacheCollectionState>>,
    server_modified: RwLock<HashMap<String, Timestamp>>,
    shared: SubCache,
    private: Mutex<HashMap<String, Arc<SubCache>>>,
    sources: RwLock<HashMap<String, Arc<dyn StateManager>>>,
    echo_guard: Mutex<HashSet<String>>,
    flags: Arc<dyn KeyValueStore>,
    security: Arc<SecurityContext>,
    clock: Arc<dyn Clock>,
}

impl PersistentLocalCache {
    pub fn open(
        config: &CacheConfig,
        flags: Arc<dyn KeyValueStore>,
        security: Arc<SecurityContext>,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>> {
        let shared_collections: Vec<CacheCollectionConfig> = config
            .collections
            .iter()
            .filter(|c| !c.private)
            .cloned()
            .collect();
        let shared = SubCache::open_shared(
            &config.database_dir,
            &config.database_name,
            &shared_collections,
            Arc::clone(&flags),
            &config.loaded_flag_prefix,
        )?;

        let mut collections = HashMap::new();
        for collection in &config.collections {
            let mut state = CacheCollectionState::new(collection.clone());
            if !collection.private {
                state.last_refreshed_at = shared.last_refreshed(&collection.name)?;
            }
            collections.insert(collection.name.clone(), state);
        }

        Ok(Arc::new_cyclic(|weak| Self {
            self_ref: weak.clone(),
            delegate: ChangeDelegate::new(CACHE_BACKEND),
            database_dir: config.database_dir.clone(),
            database_name: config.database_name.clone(),
            flag_prefix: config.loaded_flag_prefix.clone(),
            last_modified_url: config.last_modified_url.clone(),
            collections: RwLock::new(collections),
            server_modified: RwLock::new(HashMap::new()),
            shared,
            private: Mutex::new(HashMap::new()),
            sources: RwLock::new(HashMap::new()),
            echo_guard: Mutex::new(HashSet::new()),
            flags,
            security,
            clock,
        }))
    }

    /// Attach a source backend and start listening to the collections it
    /// feeds.
    pub fn add_source(&self, source: Arc<dyn StateManager>) {
        let backend = source.backend_name().to_string();
        let names: Vec<String> = self
            .collections
            .read()
            .values()
            .filter(|s| s.config.source == backend)
            .map(|s| s.config.name.clone())
            .collect();

        for name in &names {
            let cache = self.self_ref.clone();
            source.delegate().add_listener(
                name,
                listener_fn("persistent-cache", move |event: &ChangeEvent| {
                    if let Some(cache) = cache.upgrade() {
                        cache.source_changed(event);
                    }
                }),
            );
        }
        tracing::debug!(backend = %backend, collections = names.len(), "cache source attached");
        self.sources.write().insert(backend, source);
    }

    pub fn collection_state(&self, name: &str) -> Option<CacheCollectionState> {
        self.collections.read().get(name).cloned()
    }

    pub fn should_refresh(&self, name: &str) -> bool {
        self.collections
            .read()
            .get(name)
            .map(|s| s.should_refresh)
            .unwrap_or(false)
    }

    /// Record server last-modified times and re-evaluate freshness.
    pub fn set_server_last_modified(&self, modified: HashMap<String, Timestamp>) -> Result<()> {
        let names: Vec<String> = modified.keys().cloned().collect();
        self.server_modified.write().extend(modified);
        for name in names {
            if self.collections.read().contains_key(&name) {
                self.evaluate(&name)?;
            }
        }
        Ok(())
    }

    /// Parse a `{collection: millis}` response. Non-numeric values are
    /// skipped.
    pub fn apply_last_modified_response(&self, data: &Value) -> Result<()> {
        let Some(object) = data.as_object() else {
            return Err(SyncError::MalformedPayload(
                "last-modified response is not an object".into(),
            ));
        };
        let mut modified = HashMap::new();
        for (name, value) in object {
            match value.as_i64() {
                Some(millis) => {
                    modified.insert(name.clone(), Timestamp(millis));
                }
                None => tracing::warn!(state = %name, value = %value, "ignoring non-numeric last-modified"),
            }
        }
        self.set_server_last_modified(modified)
    }

    /// Ask the server for its last-modified times through the queue.
    pub fn request_server_last_modified(&self, queue: &RequestQueue) -> Option<RequestId> {
        let Some(url) = &self.last_modified_url else {
            tracing::warn!("no last-modified URL configured");
            return None;
        };
        let handler: Weak<dyn RequestCompletionHandler> = self.self_ref.clone();
        queue.register_handler(CACHE_BACKEND, handler);
        Some(queue.add_request(
            ApiRequest::new(HttpMethod::Get, url.clone()),
            RequestAssociation::new(CACHE_BACKEND, "", RequestOperation::LastModified),
            QueueClass::Priority,
        ))
    }

    fn config(&self, name: &str) -> Option<CacheCollectionConfig> {
        self.collections.read().get(name).map(|s| s.config.clone())
    }

    fn source(&self, config: &CacheCollectionConfig) -> Option<Arc<dyn StateManager>> {
        let source = self.sources.read().get(&config.source).cloned();
        if source.is_none() {
            tracing::warn!(state = %config.name, source = %config.source, "cache source not attached");
        }
        source
    }

    /// The namespace holding `config`, opening the current user's on first
    /// use. `None` for a private collection with nobody logged in.
    fn subcache(&self, config: &CacheCollectionConfig) -> Result<Option<SubCacheRef>> {
        if !config.private {
            return Ok(Some(SubCacheRef::Shared));
        }
        let Some(user) = self.security.current_user() else {
            tracing::warn!(state = %config.name, "private collection without a current user");
            return Ok(None);
        };

        let mut private = self.private.lock();
        if let Some(sub) = private.get(&user) {
            return Ok(Some(SubCacheRef::User(Arc::clone(sub))));
        }
        let collections: Vec<CacheCollectionConfig> = self
            .collections
            .read()
            .values()
            .filter(|s| s.config.private)
            .map(|s| s.config.clone())
            .collect();
        let sub = Arc::new(SubCache::open_for_user(
            &self.database_dir,
            &self.database_name,
            &user,
            &collections,
            Arc::clone(&self.flags),
            &self.flag_prefix,
        )?);
        private.insert(user, Arc::clone(&sub));
        Ok(Some(SubCacheRef::User(sub)))
    }

    fn with_subcache<T>(
        &self,
        config: &CacheCollectionConfig,
        f: impl FnOnce(&SubCache) -> Result<T>,
    ) -> Result<Option<T>> {
        match self.subcache(config)? {
            Some(SubCacheRef::Shared) => f(&self.shared).map(Some),
            Some(SubCacheRef::User(sub)) => f(&sub).map(Some),
            None => Ok(None),
        }
    }

    /// Recompute `should_refresh` for `name`, clearing its loaded flag when
    /// it went stale.
    pub fn evaluate(&self, name: &str) -> Result<bool> {
        let Some(config) = self.config(name) else {
            return Ok(false);
        };
        let last = self
            .with_subcache(&config, |sub| sub.last_refreshed(name))?
            .flatten();
        let server = self.server_modified.read().get(name).copied();
        let now = self.clock.now();

        let should = {
            let mut collections = self.collections.write();
            let Some(state) = collections.get_mut(name) else {
                return Ok(false);
            };
            state.last_refreshed_at = last;
            state.evaluate(server, now)
        };

        tracing::debug!(
            state = %name,
            last_refreshed = ?last,
            server_modified = ?server,
            now = %now,
            should_refresh = should,
            "cache freshness"
        );
        if should {
            self.with_subcache(&config, |sub| sub.clear_loaded(name))?;
        }
        Ok(should)
    }

    fn source_changed(&self, event: &ChangeEvent) {
        let name = event.state_name.as_str();
        let Some(config) = self.config(name) else {
            return;
        };
        if config.source != event.backend_name {
            return;
        }

        let result = match event.event_type {
            ChangeEventType::StateChanged => self.refreshed_from_source(&config, event.values()),
            ChangeEventType::ItemAdded | ChangeEventType::ItemUpdated => {
                if self.echo_guard.lock().contains(name) {
                    return;
                }
                self.with_subcache(&config, |sub| sub.upsert(name, event.value.clone()))
                    .map(|_| self.forward(event))
            }
            ChangeEventType::ItemDeleted => {
                if self.echo_guard.lock().contains(name) {
                    return;
                }
                self.with_subcache(&config, |sub| sub.remove(name, event.value.clone()))
                    .map(|_| self.forward(event))
            }
            ChangeEventType::FilterResults
            | ChangeEventType::FindItem
            | ChangeEventType::ItemNotModified => Ok(()),
        };
        if let Err(e) = result {
            tracing::error!(state = %name, error = %e, "failed to update cache from source");
        }
    }

    fn refreshed_from_source(&self, config: &CacheCollectionConfig, values: Vec<Value>) -> Result<()> {
        let name = config.name.as_str();
        let now = self.clock.now();
        let written = self.with_subcache(config, |sub| sub.write_through(name, values.clone(), now))?;
        if written.is_none() {
            return Ok(());
        }
        if let Some(state) = self.collections.write().get_mut(name) {
            state.mark_refreshed(now);
        }
        tracing::info!(state = %name, count = values.len(), "cache refreshed from source");
        self.delegate
            .notify(name, ChangeEventType::StateChanged, Value::Array(values));
        Ok(())
    }

    fn forward(&self, event: &ChangeEvent) {
        let mut forwarded = ChangeEvent::new(
            CACHE_BACKEND,
            event.state_name.clone(),
            event.event_type,
            event.value.clone(),
        );
        forwarded.previous_value = event.previous_value.clone();
        self.delegate.inform(forwarded);
    }

    fn apply_realtime(&self, event: &RealtimeEvent) -> Result<()> {
        let name = event.state_name.as_str();
        let Some(config) = self.config(name) else {
            tracing::warn!(state = %name, "realtime event for uncached collection");
            return Ok(());
        };
        let now = self.clock.now();

        let patched = self.with_subcache(&config, |sub| {
            sub.record_refresh(name, now)?;
            match event.kind {
                RealtimeEventKind::Create | RealtimeEventKind::Update => {
                    sub.upsert(name, event.data.clone())?
                }
                RealtimeEventKind::Delete => {
                    sub.remove(name, event.data.clone())?;
                }
            }
            Ok(())
        })?;
        if patched.is_none() {
            return Ok(());
        }
        if let Some(state) = self.collections.write().get_mut(name) {
            state.last_refreshed_at = Some(now);
        }

        // keep the source buffer in step without sending anything back
        let source = self.sources.read().get(&config.source).cloned();
        if let Some(source) = source {
            self.echo_guard.lock().insert(name.to_string());
            let applied = match event.kind {
                RealtimeEventKind::Create => source.add_new_item_to_state(name, event.data.clone(), true),
                RealtimeEventKind::Update => source.update_item_in_state(name, event.data.clone(), true),
                RealtimeEventKind::Delete => source
                    .remove_item_from_state(name, event.data.clone(), true)
                    .map(|_| ()),
            };
            self.echo_guard.lock().remove(name);
            applied?;
        }

        let event_type = match event.kind {
            RealtimeEventKind::Create => ChangeEventType::ItemAdded,
            RealtimeEventKind::Update => ChangeEventType::ItemUpdated,
            RealtimeEventKind::Delete => ChangeEventType::ItemDeleted,
        };
        tracing::debug!(
            state = %name,
            key = ?key_of(&event.data, &config.key_field),
            kind = ?event.kind,
            "realtime patch applied"
        );
        self.delegate.notify(name, event_type, event.data.clone());
        Ok(())
    }
}

enum SubCacheRef {
    Shared,
    User(Arc<SubCache>),
}

impl RealtimeListener for PersistentLocalCache {
    fn realtime_event(&self, event: &RealtimeEvent) {
        if let Err(e) = self.apply_realtime(event) {
            tracing::error!(state = %event.state_name, error = %e, "failed to apply realtime event");
        }
    }
}

impl RequestCompletionHandler for PersistentLocalCache {
    fn request_completed(&self, completion: &RequestCompletion) {
        if completion.association.operation != RequestOperation::LastModified {
            return;
        }
        match &completion.outcome {
            RequestOutcome::Success { data, .. } => {
                if let Err(e) = self.apply_last_modified_response(data) {
                    tracing::warn!(error = %e, "could not use last-modified response");
                }
            }
            other => tracing::warn!(outcome = ?other, "last-modified request did not succeed"),
        }
    }
}

impl StateManager for PersistentLocalCache {
    fn delegate(&self) -> &ChangeDelegate {
        &self.delegate
    }

    fn is_state_managed(&self, name: &str) -> bool {
        self.collections.read().contains_key(name)
    }

    /// Fresh and loaded collections come from the local store without
    /// touching the network. Otherwise a refetch is forced at the source
    /// and the current local copy is returned until it arrives.
    fn get_state_by_name(&self, name: &str) -> Result<Vec<Value>> {
        let Some(config) = self.config(name) else {
            tracing::warn!(state = %name, "collection not cached");
            return Ok(Vec::new());
        };
        if config.private && self.security.current_user().is_none() {
            tracing::warn!(state = %name, "private collection without a current user");
            return Ok(Vec::new());
        }

        let should_refresh = self.evaluate(name)?;
        let loaded = self
            .with_subcache(&config, |sub| sub.is_loaded(name))?
            .unwrap_or(false);

        if !should_refresh && loaded {
            tracing::debug!(state = %name, "serving from local cache");
            return Ok(self
                .with_subcache(&config, |sub| sub.read(name))?
                .unwrap_or_default());
        }

        let Some(source) = self.source(&config) else {
            return Ok(self
                .with_subcache(&config, |sub| sub.read(name))?
                .unwrap_or_default());
        };

        // only the first stale read forces a refetch; later ones just ask
        let force = {
            let mut collections = self.collections.write();
            match collections.get_mut(name) {
                Some(state) if !state.refreshing => {
                    state.refreshing = true;
                    true
                }
                _ => false,
            }
        };
        if force {
            tracing::info!(state = %name, source = %config.source, "forcing refetch");
            source.force_reset_for_get(name);
        }

        match source.get_state_by_name(name) {
            // synchronous sources answer immediately, empty or not; pending
            // fetches write through from their StateChanged
            Ok(values) => {
                let loaded = self
                    .with_subcache(&config, |sub| sub.is_loaded(name))?
                    .unwrap_or(false);
                if !loaded && source.is_state_ready(name) {
                    self.refreshed_from_source(&config, values)?;
                }
            }
            Err(e) => {
                if let Some(state) = self.collections.write().get_mut(name) {
                    state.refreshing = false;
                }
                return Err(e);
            }
        }

        Ok(self
            .with_subcache(&config, |sub| sub.read(name))?
            .unwrap_or_default())
    }

    fn set_state_by_name(&self, name: &str, values: Vec<Value>, is_persisted: bool) -> Result<()> {
        let Some(config) = self.config(name) else {
            tracing::warn!(state = %name, "collection not cached");
            return Ok(());
        };
        match self.source(&config) {
            Some(source) => source.set_state_by_name(name, values, is_persisted),
            None => Ok(()),
        }
    }

    fn add_new_item_to_state(&self, name: &str, item: Value, is_persisted: bool) -> Result<()> {
        let Some(config) = self.config(name) else {
            tracing::warn!(state = %name, "collection not cached");
            return Ok(());
        };
        match self.source(&config) {
            Some(source) => source.add_new_item_to_state(name, item, is_persisted),
            None => Ok(()),
        }
    }

    fn update_item_in_state(&self, name: &str, item: Value, is_persisted: bool) -> Result<()> {
        let Some(config) = self.config(name) else {
            tracing::warn!(state = %name, "collection not cached");
            return Ok(());
        };
        match self.source(&config) {
            Some(source) => source.update_item_in_state(name, item, is_persisted),
            None => Ok(()),
        }
    }

    fn remove_item_from_state(&self, name: &str, item: Value, is_persisted: bool) -> Result<bool> {
        let Some(config) = self.config(name) else {
            tracing::warn!(state = %name, "collection not cached");
            return Ok(false);
        };
        let held = self
            .with_subcache(&config, |sub| sub.local().find_item_in_state(name, &item))?
            .flatten()
            .is_some();
        if let Some(source) = self.source(&config) {
            source.remove_item_from_state(name, item, is_persisted)?;
        }
        Ok(held)
    }

    fn find_item_in_state(&self, name: &str, item: &Value) -> Result<Option<Value>> {
        let Some(config) = self.config(name) else {
            return Ok(None);
        };
        Ok(self
            .with_subcache(&config, |sub| sub.local().find_item_in_state(name, item))?
            .flatten())
    }

    fn find_items_in_state(&self, name: &str, filter: &FilterSpec) -> Result<Vec<Value>> {
        let values = self.get_state_by_name(name)?;
        Ok(filter_items(&values, filter))
    }

    fn add_change_listener_for_name(
        &self,
        name: &str,
        listener: Arc<dyn StateChangeListener>,
    ) -> ListenerId {
        self.delegate.add_listener(name, listener)
    }

    fn force_reset_for_get(&self, name: &str) {
        let Some(config) = self.config(name) else {
            return;
        };
        if let Some(state) = self.collections.write().get_mut(name) {
            state.should_refresh = true;
            state.refreshing = false;
        }
        if let Err(e) = self.with_subcache(&config, |sub| sub.clear_loaded(name)) {
            tracing::warn!(state = %name, error = %e, "could not clear loaded flag");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKeyValueStore;
    use crate::state::SyncStateManager;
    use crate::types::ManualClock;
    use serde_json::json;
    use tempfile::TempDir;

    const T: Timestamp = Timestamp(1_700_000_000_000);

    struct Setup {
        _dir: TempDir,
        cache: Arc<PersistentLocalCache>,
        source: Arc<SyncStateManager>,
        clock: Arc<ManualClock>,
        security: Arc<SecurityContext>,
    }

    fn setup() -> Setup {
        let dir = TempDir::new().unwrap();
        let config = CacheConfig {
            database_dir: dir.path().to_path_buf(),
            collections: vec![
                CacheCollectionConfig::new("users", "memory", 60),
                CacheCollectionConfig::new("notes", "memory", 60).private(),
            ],
            ..Default::default()
        };
        let clock = Arc::new(ManualClock::new(T));
        let security = Arc::new(SecurityContext::new(false));
        let cache = PersistentLocalCache::open(
            &config,
            Arc::new(MemoryKeyValueStore::new()),
            Arc::clone(&security),
            clock.clone(),
        )
        .unwrap();
        let source = Arc::new(SyncStateManager::in_memory("memory"));
        cache.add_source(source.clone());
        Setup {
            _dir: dir,
            cache,
            source,
            clock,
            security,
        }
    }

    #[test]
    fn test_first_read_writes_through() {
        let s = setup();
        s.source
            .set_state_by_name("users", vec![json!({"_id": "u1"})], false)
            .unwrap();

        assert_eq!(s.cache.get_state_by_name("users").unwrap(), vec![json!({"_id": "u1"})]);
        let state = s.cache.collection_state("users").unwrap();
        assert_eq!(state.last_refreshed_at, Some(T));
        assert!(!state.should_refresh);
        assert!(s.cache.shared.is_loaded("users").unwrap());
    }

    #[test]
    fn test_empty_source_is_loaded() {
        let s = setup();

        assert!(s.cache.get_state_by_name("users").unwrap().is_empty());
        let state = s.cache.collection_state("users").unwrap();
        assert_eq!(state.last_refreshed_at, Some(T));
        assert!(!state.refreshing);
        assert!(s.cache.shared.is_loaded("users").unwrap());

        s.clock.advance_secs(30);
        assert!(!s.cache.evaluate("users").unwrap());
        assert!(s.cache.get_state_by_name("users").unwrap().is_empty());
        assert_eq!(s.cache.collection_state("users").unwrap().last_refreshed_at, Some(T));
    }

    #[test]
    fn test_fresh_reads_stay_local() {
        let s = setup();
        s.source.set_state_by_name("users", vec![json!({"_id": "u1"})], false).unwrap();
        s.cache.get_state_by_name("users").unwrap();

        // source moves on; the cache does not look while fresh
        s.source.add_new_item_to_state("users", json!({"_id": "u2"}), true).unwrap();
        s.clock.advance_secs(59);
        let local = s.cache.shared.database().get_all("users").unwrap();
        assert_eq!(local.len(), 2, "item events patch the local store");
        assert!(!s.cache.evaluate("users").unwrap());
    }

    #[test]
    fn test_server_newer_forces_refresh() {
        let s = setup();
        s.source.set_state_by_name("users", vec![], false).unwrap();
        s.cache.get_state_by_name("users").unwrap();
        assert!(!s.cache.should_refresh("users"));

        s.cache
            .apply_last_modified_response(&json!({"users": T.as_millis() + 1, "bogus": "x"}))
            .unwrap();
        assert!(s.cache.should_refresh("users"));
        assert!(!s.cache.shared.is_loaded("users").unwrap());
    }

    #[test]
    fn test_realtime_patch() {
        let s = setup();
        s.source.set_state_by_name("users", vec![json!({"_id": "u1", "n": 0})], false).unwrap();
        s.cache.get_state_by_name("users").unwrap();
        s.clock.advance_secs(30);

        let event = RealtimeEvent::parse(r#"{"stateName": "users", "type": "update", "data": {"_id": "u1", "n": 5}}"#)
            .unwrap();
        s.cache.realtime_event(&event);

        assert_eq!(
            s.cache.shared.database().get("users", "u1").unwrap(),
            Some(json!({"_id": "u1", "n": 5}))
        );
        assert_eq!(s.source.get_state_by_name("users").unwrap(), vec![json!({"_id": "u1", "n": 5})]);
        assert_eq!(s.cache.shared.last_refreshed("users").unwrap(), Some(T.plus_secs(30)));
    }

    #[test]
    fn test_private_collection_per_user() {
        let s = setup();
        assert!(s.cache.get_state_by_name("notes").unwrap().is_empty());

        s.security.set_user("alice");
        s.source.set_state_by_name("notes", vec![json!({"_id": "n1"})], false).unwrap();
        assert_eq!(s.cache.get_state_by_name("notes").unwrap().len(), 1);

        let private = s.cache.private.lock();
        let alice = private.get("alice").unwrap();
        assert!(alice.is_loaded("notes").unwrap());
        assert_eq!(alice.flag_key("notes"), "alice.app.loaded.notes");
        assert!(!s.cache.shared.holds("notes"));
    }

    #[test]
    fn test_unknown_collection_is_noop() {
        let s = setup();
        assert!(s.cache.get_state_by_name("ghosts").unwrap().is_empty());
        s.cache.add_new_item_to_state("ghosts", json!({"_id": "g"}), false).unwrap();
        assert!(!s.cache.is_state_managed("ghosts"));
    }
}
