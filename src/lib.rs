//! # statesync
//!
//! Offline-first synchronization and caching of named record collections.
//!
//! ## Core Concepts
//!
//! - **Named states**: collections of JSON records behind one CRUD contract
//!   ([`StateManager`]), held in memory, in a local object store, or on a
//!   remote REST or GraphQL API
//! - **Change notifications**: every mutation reports exactly what changed
//! - **Request queue**: priority and background lanes, token gating, token
//!   refresh on 403 and offline capture
//! - **Offline log**: requests that could not reach the server are kept on
//!   disk and replayed once connectivity returns
//! - **Persistent cache**: remote collections served locally until their
//!   refresh interval runs out or the server reports newer data
//!
//! ## Example
//!
//! ```ignore
//! use statesync::{EngineConfig, SyncEngine, StateManager};
//!
//! let config = EngineConfig::from_json_file("statesync.json")?;
//! let engine = SyncEngine::open(config, transport)?;
//!
//! engine.state().add_change_listener_for_name("users", listener_fn("ui", |event| {
//!     println!("{:?} {}", event.event_type, event.value);
//! }));
//! engine.state().get_state_by_name("users")?;
//! engine.state().add_new_item_to_state("users", json!({"name": "Ada"}), false)?;
//!
//! // after the device came back online
//! engine.connectivity_restored();
//! ```

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod filter;
pub mod kv;
pub mod local;
pub mod notifications;
pub mod offline;
pub mod queue;
pub mod remote;
pub mod state;
pub mod transport;
pub mod types;

// Re-exports
pub use cache::{PersistentLocalCache, RealtimeEvent, RealtimeEventKind, RealtimeListener};
pub use config::{CacheCollectionConfig, CacheConfig, EngineConfig, OfflineConfig, QueueConfig};
pub use engine::SyncEngine;
pub use error::{Result, SyncError};
pub use filter::{Comparison, FilterSpec, MatchLogic};
pub use kv::{FileKeyValueStore, KeyValueStore, MemoryKeyValueStore};
pub use local::{LocalDatabase, LocalStoreStateManager, StoreSchema, TransactionMode};
pub use notifications::{
    listener_fn, ChangeDelegate, ChangeEvent, ChangeEventType, ListenerId, StateChangeListener,
};
pub use offline::{OfflineManager, PendingRequestLog};
pub use queue::{
    ApiRequest, ApiResponse, HttpMethod, QueueClass, RequestCompletionHandler, RequestOutcome,
    RequestQueue, SecurityContext, TokenProvider,
};
pub use remote::{
    ApiShape, ContextRegistry, GraphQlConfig, GraphQlShape, RemoteStateManager, RestCollection,
    RestShape,
};
pub use state::{AggregateStateManager, StateManager, SyncStateManager, TypedCollection};
pub use transport::{ChannelTransport, DispatchRequest, HttpTransport, MockTransport};
pub use types::{Clock, ManualClock, RequestId, RunState, SystemClock, Timestamp};
