//! Local transactional object-store backend.
//!
//! [`LocalDatabase`] is a versioned, schema-on-write database file with one
//! object store per collection. [`LocalStoreStateManager`] exposes it
//! through the [`StateManager`](crate::state::StateManager) contract.

mod database;
mod manager;

pub use database::{LocalDatabase, StoreSchema, Transaction, TransactionMode};
pub use manager::LocalStoreStateManager;
