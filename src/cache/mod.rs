//! Persistent, refresh-interval cache over remote collections.
//!
//! A cached collection is served from its local object store while it is
//! fresh. It goes stale when it was never refreshed, when its interval ran
//! out, or when the server reports a newer last-modified time; the next read
//! then forces a refetch at the source backend and writes the result through
//! to the local store.
//!
//! Private collections are kept in a separate database per user so that one
//! user's records never land in another's namespace.

mod freshness;
mod manager;
mod realtime;
mod subcache;

pub use freshness::{needs_refresh, CacheCollectionState};
pub use manager::{PersistentLocalCache, CACHE_BACKEND};
pub use realtime::{RealtimeEvent, RealtimeEventKind, RealtimeListener};
pub use subcache::{user_database_name, SubCache};
