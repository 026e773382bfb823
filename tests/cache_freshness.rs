//! Freshness of the persistent cache against a remote source.

use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use statesync::config::{CacheCollectionConfig, CacheConfig, QueueConfig};
use statesync::remote::ContextRegistry;
use statesync::{
    ApiResponse, ManualClock, MemoryKeyValueStore, MockTransport, PersistentLocalCache,
    RemoteStateManager, RequestQueue, RestCollection, RestShape, SecurityContext, StateManager,
    Timestamp,
};
use tempfile::TempDir;

const T: Timestamp = Timestamp(1_700_000_000_000);

struct Harness {
    _dir: TempDir,
    transport: MockTransport,
    clock: Arc<ManualClock>,
    cache: Arc<PersistentLocalCache>,
    rest: Arc<RemoteStateManager<RestShape>>,
}

fn harness(dir: TempDir, flags: Arc<MemoryKeyValueStore>) -> Harness {
    let transport = MockTransport::new();
    let clock = Arc::new(ManualClock::new(T));
    let security = Arc::new(SecurityContext::new(false));
    let queue = RequestQueue::new(
        QueueConfig::default(),
        Arc::clone(&security),
        Arc::new(transport.clone()),
        None,
    );
    let rest = RemoteStateManager::new(
        "rest",
        RestShape::new(vec![RestCollection::new("users", "https://api.test/users")]),
        queue,
        Arc::new(ContextRegistry::new()),
        clock.clone(),
    );
    let config = CacheConfig {
        database_dir: dir.path().to_path_buf(),
        collections: vec![CacheCollectionConfig::new("users", "rest", 60)],
        ..Default::default()
    };
    let cache = PersistentLocalCache::open(&config, flags, security, clock.clone()).unwrap();
    cache.add_source(rest.clone());
    Harness {
        _dir: dir,
        transport,
        clock,
        cache,
        rest,
    }
}

fn loaded(h: &Harness) {
    assert!(h.cache.get_state_by_name("users").unwrap().is_empty());
    assert_eq!(h.transport.dispatch_count(), 1);
    h.transport
        .respond_next(ApiResponse::json(200, &json!([{"_id": "u1", "name": "Ada"}])));
    assert_eq!(h.cache.collection_state("users").unwrap().last_refreshed_at, Some(T));
}

#[test]
fn test_serves_locally_within_interval() {
    let h = harness(TempDir::new().unwrap(), Arc::new(MemoryKeyValueStore::new()));
    loaded(&h);
    h.cache
        .set_server_last_modified(HashMap::from([("users".to_string(), Timestamp(T.0 - 1_000))]))
        .unwrap();

    h.clock.set(T.plus_secs(59));
    assert_eq!(
        h.cache.get_state_by_name("users").unwrap(),
        vec![json!({"_id": "u1", "name": "Ada"})]
    );
    assert_eq!(h.transport.dispatch_count(), 1);
    assert!(!h.cache.should_refresh("users"));
}

#[test]
fn test_refetches_after_interval() {
    let h = harness(TempDir::new().unwrap(), Arc::new(MemoryKeyValueStore::new()));
    loaded(&h);

    h.clock.set(T.plus_secs(61));
    let served = h.cache.get_state_by_name("users").unwrap();
    assert_eq!(served, vec![json!({"_id": "u1", "name": "Ada"})], "stale copy served meanwhile");
    assert!(h.cache.should_refresh("users"));
    assert_eq!(h.transport.dispatch_count(), 2);

    // a second stale read does not start another fetch
    h.cache.get_state_by_name("users").unwrap();
    assert_eq!(h.transport.dispatch_count(), 2);

    h.transport.respond_next(ApiResponse::json(
        200,
        &json!([{"_id": "u1", "name": "Ada"}, {"_id": "u2", "name": "Grace"}]),
    ));
    let state = h.cache.collection_state("users").unwrap();
    assert_eq!(state.last_refreshed_at, Some(T.plus_secs(61)));
    assert!(!state.should_refresh);
    assert_eq!(h.cache.get_state_by_name("users").unwrap().len(), 2);
    assert_eq!(h.transport.dispatch_count(), 2);
}

#[test]
fn test_server_newer_than_refresh_forces_refetch() {
    let h = harness(TempDir::new().unwrap(), Arc::new(MemoryKeyValueStore::new()));
    loaded(&h);

    h.clock.set(T.plus_secs(10));
    h.cache
        .apply_last_modified_response(&json!({"users": T.plus_secs(5).as_millis()}))
        .unwrap();
    h.cache.get_state_by_name("users").unwrap();
    assert_eq!(h.transport.dispatch_count(), 2);
}

#[test]
fn test_refresh_time_survives_reopen() {
    let flags = Arc::new(MemoryKeyValueStore::new());
    let h = harness(TempDir::new().unwrap(), Arc::clone(&flags));
    loaded(&h);
    let Harness { _dir: dir, cache, rest, .. } = h;
    drop(cache);
    drop(rest);

    let reopened = harness(dir, flags);
    assert_eq!(
        reopened.cache.collection_state("users").unwrap().last_refreshed_at,
        Some(T)
    );
    reopened.clock.set(T.plus_secs(30));
    assert_eq!(reopened.cache.get_state_by_name("users").unwrap().len(), 1);
    assert_eq!(reopened.transport.dispatch_count(), 0);
}

#[test]
fn test_own_write_patches_cache() {
    let h = harness(TempDir::new().unwrap(), Arc::new(MemoryKeyValueStore::new()));
    loaded(&h);

    h.cache
        .add_new_item_to_state("users", json!({"_id": "u2", "name": "Grace"}), false)
        .unwrap();
    assert_eq!(h.cache.get_state_by_name("users").unwrap().len(), 1, "not applied before the server answered");

    let id = h.transport.respond_next(ApiResponse::json(201, &json!({"_id": "u2"})));
    assert!(id.is_some());
    let users = h.cache.get_state_by_name("users").unwrap();
    assert_eq!(users.len(), 2);
    assert_eq!(h.rest.core().buffered("users").unwrap().len(), 2);
}
