//! The wired-up engine.

use serde_json::Value;
use std::sync::Arc;

use crate::cache::{PersistentLocalCache, RealtimeEvent, RealtimeListener};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::kv::{FileKeyValueStore, KeyValueStore, MemoryKeyValueStore};
use crate::offline::OfflineManager;
use crate::queue::{RequestQueue, SecurityContext, TokenProvider};
use crate::remote::{ContextRegistry, GraphQlShape, RemoteStateManager, RestShape};
use crate::state::{AggregateStateManager, StateManager, SyncStateManager};
use crate::transport::HttpTransport;
use crate::types::{Clock, SystemClock};

/// Backend name of the in-memory session backend.
pub const MEMORY_BACKEND: &str = "memory";
/// Backend name of the REST backend.
pub const REST_BACKEND: &str = "rest";
/// Backend name of the GraphQL backend.
pub const GRAPHQL_BACKEND: &str = "graphql";

/// All components built from one [`EngineConfig`].
///
/// Routing through [`SyncEngine::state`] sends cached collections to the
/// cache, other remote collections to their backend and every remaining
/// name to the in-memory session backend.
pub struct SyncEngine {
    config: EngineConfig,
    security: Arc<SecurityContext>,
    contexts: Arc<ContextRegistry>,
    offline: Arc<OfflineManager>,
    queue: Arc<RequestQueue>,
    memory: Arc<SyncStateManager>,
    rest: Option<Arc<RemoteStateManager<RestShape>>>,
    graphql: Option<Arc<RemoteStateManager<GraphQlShape>>>,
    cache: Arc<PersistentLocalCache>,
    aggregate: Arc<AggregateStateManager>,
    clock: Arc<dyn Clock>,
}

impl SyncEngine {
    /// Build the engine on the system clock.
    pub fn open(config: EngineConfig, transport: Arc<dyn HttpTransport>) -> Result<Self> {
        Self::open_with_clock(config, transport, Arc::new(SystemClock))
    }

    pub fn open_with_clock(
        config: EngineConfig,
        transport: Arc<dyn HttpTransport>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let security = Arc::new(SecurityContext::new(config.queue.requires_token));
        let contexts = Arc::new(ContextRegistry::new());

        let offline = Arc::new(match &config.offline.log_path {
            Some(path) => OfflineManager::open(path, config.offline.max_pending)?,
            None => OfflineManager::in_memory(config.offline.max_pending),
        });

        let queue = RequestQueue::new(
            config.queue.clone(),
            Arc::clone(&security),
            transport,
            Some(Arc::clone(&offline)),
        );

        let memory = Arc::new(SyncStateManager::in_memory(MEMORY_BACKEND));

        let rest = if config.rest.is_empty() {
            None
        } else {
            Some(RemoteStateManager::new(
                REST_BACKEND,
                RestShape::new(config.rest.clone()),
                Arc::clone(&queue),
                Arc::clone(&contexts),
                Arc::clone(&clock),
            ))
        };

        let graphql = config.graphql.clone().map(|graphql| {
            RemoteStateManager::new(
                GRAPHQL_BACKEND,
                GraphQlShape::new(graphql),
                Arc::clone(&queue),
                Arc::clone(&contexts),
                Arc::clone(&clock),
            )
        });

        let flags: Arc<dyn KeyValueStore> = match &config.cache.flags_path {
            Some(path) => Arc::new(FileKeyValueStore::open(path)?),
            None => Arc::new(MemoryKeyValueStore::new()),
        };
        let cache = PersistentLocalCache::open(
            &config.cache,
            flags,
            Arc::clone(&security),
            Arc::clone(&clock),
        )?;

        let cached: Vec<String> = config.cache.collections.iter().map(|c| c.name.clone()).collect();
        let uncached = |names: Vec<String>| -> Vec<String> {
            names.into_iter().filter(|n| !cached.contains(n)).collect()
        };

        let aggregate = Arc::new(AggregateStateManager::new("aggregate"));
        if !cached.is_empty() {
            aggregate.add_backend_for(cache.clone(), cached.clone());
        }
        cache.add_source(memory.clone());
        if let Some(rest) = &rest {
            cache.add_source(rest.clone());
            let names = config.rest.iter().map(|c| c.name.clone()).collect();
            aggregate.add_backend_for(rest.clone(), uncached(names));
        }
        if let (Some(graphql), Some(graphql_config)) = (&graphql, &config.graphql) {
            cache.add_source(graphql.clone());
            let names = graphql_config.collections.iter().map(|c| c.name.clone()).collect();
            aggregate.add_backend_for(graphql.clone(), uncached(names));
        }
        aggregate.set_fallback(memory.clone());

        tracing::info!(
            rest = rest.is_some(),
            graphql = graphql.is_some(),
            cached = config.cache.collections.len(),
            pending_offline = offline.pending_count(),
            "sync engine ready"
        );

        Ok(Self {
            config,
            security,
            contexts,
            offline,
            queue,
            memory,
            rest,
            graphql,
            cache,
            aggregate,
            clock,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Routed access to every collection.
    pub fn state(&self) -> &Arc<AggregateStateManager> {
        &self.aggregate
    }

    pub fn security(&self) -> &Arc<SecurityContext> {
        &self.security
    }

    pub fn contexts(&self) -> &Arc<ContextRegistry> {
        &self.contexts
    }

    pub fn offline(&self) -> &Arc<OfflineManager> {
        &self.offline
    }

    pub fn queue(&self) -> &Arc<RequestQueue> {
        &self.queue
    }

    pub fn memory(&self) -> &Arc<SyncStateManager> {
        &self.memory
    }

    pub fn rest(&self) -> Option<&Arc<RemoteStateManager<RestShape>>> {
        self.rest.as_ref()
    }

    pub fn graphql(&self) -> Option<&Arc<RemoteStateManager<GraphQlShape>>> {
        self.graphql.as_ref()
    }

    pub fn cache(&self) -> &Arc<PersistentLocalCache> {
        &self.cache
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Install a token; held requests start dispatching.
    pub fn set_token(&self, token: impl Into<String>) {
        self.security.set_token(token);
    }

    pub fn set_token_provider(&self, provider: Arc<dyn TokenProvider>) {
        self.security.set_token_provider(provider);
    }

    pub fn login(&self, user_id: impl Into<String>) {
        self.security.set_user(user_id);
    }

    pub fn logout(&self) {
        self.security.clear_user();
        self.security.clear_token();
    }

    /// Set a named request context sent with every later request.
    pub fn set_context(&self, name: &str, value: Value) {
        self.contexts.set(name, value);
    }

    /// Replay requests held while offline. Returns how many were queued.
    pub fn connectivity_restored(&self) -> usize {
        self.queue.connectivity_restored()
    }

    /// Ask the server which cached collections changed.
    pub fn check_server_last_modified(&self) -> bool {
        self.cache.request_server_last_modified(&self.queue).is_some()
    }

    /// Feed one raw real-time channel message to the cache.
    pub fn handle_realtime_message(&self, text: &str) -> Result<()> {
        let event = RealtimeEvent::parse(text)?;
        self.cache.realtime_event(&event);
        Ok(())
    }

    /// Re-announce the current value of each name through its backend.
    pub fn fire_states_changed(&self, names: &[&str]) -> Result<()> {
        self.aggregate.fire_states_changed(names)
    }
}
