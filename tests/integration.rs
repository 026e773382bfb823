//! Integration tests for the sync engine.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use statesync::remote::{GraphQlCollection, GraphQlOperation};
use statesync::{
    listener_fn, ApiResponse, ChangeEvent, ChangeEventType, EngineConfig, FilterSpec, HttpMethod,
    ManualClock, MockTransport, StateManager, SyncEngine, Timestamp, TypedCollection,
};
use tempfile::TempDir;

const T: Timestamp = Timestamp(1_700_000_000_000);

fn engine_from_json(dir: &TempDir, json: &str, transport: &MockTransport) -> SyncEngine {
    let mut config = EngineConfig::from_json_str(json).unwrap();
    config.cache.database_dir = dir.path().join("cache");
    SyncEngine::open_with_clock(config, Arc::new(transport.clone()), Arc::new(ManualClock::new(T)))
        .unwrap()
}

fn collect(engine: &SyncEngine, name: &str) -> Arc<Mutex<Vec<ChangeEvent>>> {
    let seen: Arc<Mutex<Vec<ChangeEvent>>> = Arc::default();
    let sink = Arc::clone(&seen);
    engine
        .state()
        .add_change_listener_for_name(name, listener_fn("test", move |e| sink.lock().push(e.clone())));
    seen
}

// --- Realistic Workflow Tests ---

#[test]
fn test_todo_workflow_over_rest() {
    let dir = TempDir::new().unwrap();
    let transport = MockTransport::new();
    let engine = engine_from_json(
        &dir,
        r#"{"rest": [{"name": "todos", "url": "https://api.test/todos"}]}"#,
        &transport,
    );
    let events = collect(&engine, "todos");

    engine.state().get_state_by_name("todos").unwrap();
    let fetch = transport.last_dispatched().unwrap();
    assert_eq!(fetch.method, HttpMethod::Get);
    assert_eq!(fetch.url, "https://api.test/todos");
    transport.respond_next(ApiResponse::json(
        200,
        &json!([
            {"_id": "t1", "title": "write docs", "status": "open"},
            {"_id": "t2", "title": "ship", "status": "done"}
        ]),
    ));

    engine
        .state()
        .update_item_in_state("todos", json!({"_id": "t1", "title": "write docs", "status": "done"}), false)
        .unwrap();
    let update = transport.last_dispatched().unwrap();
    assert_eq!(update.method, HttpMethod::Put);
    assert_eq!(update.url, "https://api.test/todos/t1");
    let body: serde_json::Value = serde_json::from_str(update.body.as_deref().unwrap()).unwrap();
    assert_eq!(body["modified"], json!(T.as_millis()));
    transport.respond_next(ApiResponse::json(200, &json!({})));

    engine
        .state()
        .remove_item_from_state("todos", json!({"_id": "t2"}), false)
        .unwrap();
    assert_eq!(transport.last_dispatched().unwrap().method, HttpMethod::Delete);
    transport.respond_next(ApiResponse::new(204, ""));

    let kinds: Vec<ChangeEventType> = events.lock().iter().map(|e| e.event_type).collect();
    assert_eq!(
        kinds,
        vec![
            ChangeEventType::StateChanged,
            ChangeEventType::ItemUpdated,
            ChangeEventType::ItemDeleted
        ]
    );

    let done = engine
        .state()
        .find_items_in_state("todos", &FilterSpec::new().exact("status", vec![json!("done")]))
        .unwrap();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0]["_id"], "t1");
}

#[test]
fn test_exact_clause_filter() {
    let dir = TempDir::new().unwrap();
    let engine = engine_from_json(&dir, "{}", &MockTransport::new());
    engine
        .state()
        .set_state_by_name(
            "orders",
            vec![
                json!({"_id": 1, "status": "A"}),
                json!({"_id": 2, "status": "B"}),
                json!({"_id": 3, "status": "C"}),
            ],
            false,
        )
        .unwrap();

    let spec = FilterSpec::new().exact("status", vec![json!("A"), json!("B")]);
    let ids: Vec<i64> = engine
        .state()
        .find_items_in_state("orders", &spec)
        .unwrap()
        .iter()
        .filter_map(|o| o["_id"].as_i64())
        .collect();
    assert_eq!(ids, vec![1, 2]);
}

#[test]
fn test_request_context_header() {
    let dir = TempDir::new().unwrap();
    let transport = MockTransport::new();
    let engine = engine_from_json(
        &dir,
        r#"{"rest": [{"name": "users", "url": "https://api.test/users"}],
            "queue": {"context_header": "x-ctx"}}"#,
        &transport,
    );
    engine.set_context("tenant", json!({"tenantId": "acme"}));
    engine.state().get_state_by_name("users").unwrap();

    let header = transport.last_dispatched().unwrap().header("x-ctx").map(str::to_string);
    let context: serde_json::Value = serde_json::from_str(&header.unwrap()).unwrap();
    assert_eq!(context["tenant"]["tenantId"], "acme");
}

#[test]
fn test_graphql_collection() {
    let dir = TempDir::new().unwrap();
    let transport = MockTransport::new();
    let mut config = EngineConfig::default();
    config.cache.database_dir = dir.path().join("cache");
    let mut books = GraphQlCollection::new("books");
    books.find_all = Some(GraphQlOperation::new("query { books { _id title } }", "books"));
    books.create = Some(GraphQlOperation::new(
        "mutation ($item: BookInput!) { addBook(item: $item) { _id title } }",
        "addBook",
    ));
    config.graphql = Some(statesync::GraphQlConfig {
        endpoint: "https://api.test/graphql".into(),
        collections: vec![books],
    });
    let engine = SyncEngine::open(config, Arc::new(transport.clone())).unwrap();

    engine.state().get_state_by_name("books").unwrap();
    let request = transport.last_dispatched().unwrap();
    assert_eq!(request.method, HttpMethod::Post);
    assert_eq!(request.url, "https://api.test/graphql");
    transport.respond_next(ApiResponse::json(
        200,
        &json!({"data": {"books": [{"_id": "b1", "title": "Dune"}]}}),
    ));
    assert_eq!(engine.state().get_state_by_name("books").unwrap().len(), 1);

    engine
        .state()
        .add_new_item_to_state("books", json!({"_id": "b2", "title": "Emma"}), false)
        .unwrap();
    transport.respond_next(ApiResponse::json(
        200,
        &json!({"data": {"addBook": {"_id": "b2", "title": "Emma"}}}),
    ));
    assert_eq!(engine.state().get_state_by_name("books").unwrap().len(), 2);

    // no update operation configured
    assert!(engine
        .state()
        .update_item_in_state("books", json!({"_id": "b2"}), false)
        .is_err());
}

#[test]
fn test_realtime_message_through_engine() {
    let dir = TempDir::new().unwrap();
    let transport = MockTransport::always(ApiResponse::json(200, &json!([{"_id": "u1", "n": 1}])));
    let engine = engine_from_json(
        &dir,
        r#"{"rest": [{"name": "users", "url": "https://api.test/users"}],
            "cache": {"collections": [{"name": "users", "source": "rest", "refresh_interval_secs": 600}]}}"#,
        &transport,
    );
    engine.state().get_state_by_name("users").unwrap();
    let events = collect(&engine, "users");

    engine
        .handle_realtime_message(r#"{"stateName": "users", "type": "create", "data": {"_id": "u9", "n": 9}}"#)
        .unwrap();

    assert_eq!(engine.state().get_state_by_name("users").unwrap().len(), 2);
    assert_eq!(transport.dispatch_count(), 1, "realtime patches are not sent back");
    let events = events.lock();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, ChangeEventType::ItemAdded);
}

#[test]
fn test_private_collection_follows_login() {
    let dir = TempDir::new().unwrap();
    let transport = MockTransport::new();
    let engine = engine_from_json(
        &dir,
        r#"{"rest": [{"name": "inbox", "url": "https://api.test/inbox"}],
            "cache": {"collections": [{"name": "inbox", "source": "rest", "refresh_interval_secs": 600, "private": true}]}}"#,
        &transport,
    );

    assert!(engine.state().get_state_by_name("inbox").unwrap().is_empty());
    transport.respond_all(|_| ApiResponse::json(200, &json!([])));

    engine.login("alice");
    engine.state().get_state_by_name("inbox").unwrap();
    transport.respond_all(|_| ApiResponse::json(200, &json!([{"_id": "m1"}])));
    assert_eq!(engine.state().get_state_by_name("inbox").unwrap(), vec![json!({"_id": "m1"})]);

    engine.logout();
    engine.login("bob");
    engine.state().get_state_by_name("inbox").unwrap();
    transport.respond_all(|_| ApiResponse::json(200, &json!([])));
    assert!(engine.state().get_state_by_name("inbox").unwrap().is_empty());
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Note {
    #[serde(rename = "_id")]
    id: String,
    text: String,
}

#[test]
fn test_typed_session_collection() {
    let dir = TempDir::new().unwrap();
    let engine = engine_from_json(&dir, "{}", &MockTransport::new());
    let manager: Arc<dyn StateManager> = engine.state().clone();
    let notes: TypedCollection<Note> = TypedCollection::new(manager, "notes");

    notes
        .add(&Note {
            id: "n1".into(),
            text: "hello".into(),
        })
        .unwrap();
    notes
        .update(&Note {
            id: "n1".into(),
            text: "hello again".into(),
        })
        .unwrap();

    let all = notes.all().unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].text, "hello again");
    assert!(engine.memory().has_been_set("notes"));
}
