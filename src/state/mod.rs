//! Named-state backends behind one CRUD contract.
//!
//! [`StateManager`] is implemented by the synchronous in-memory backend
//! here, the local object-store backend, the remote backends and the
//! persistent cache. Asynchronous backends build on [`AsyncStateCore`].

mod aggregate;
mod async_base;
mod manager;
mod operations;
mod sync;
mod typed;

pub use aggregate::AggregateStateManager;
pub use async_base::{AsyncStateCore, FetchDecision};
pub use manager::StateManager;
pub use operations::{apply_change, find_item, CollectionChange, EqualityFn, ItemMatcher};
pub use sync::SyncStateManager;
pub use typed::TypedCollection;
