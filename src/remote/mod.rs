//! Remote backends.
//!
//! [`RemoteStateManager`] turns CRUD calls into queued requests. The
//! [`ApiShape`] it is parameterized with decides the wire format:
//! [`RestShape`] for resource URLs, [`GraphQlShape`] for a single GraphQL
//! endpoint. Every request carries the merged [`ContextRegistry`] values.

mod context;
mod graphql;
mod manager;
mod rest;
mod shape;

pub use context::{ContextListener, ContextRegistry};
pub use graphql::{GraphQlCollection, GraphQlConfig, GraphQlOperation, GraphQlShape};
pub use manager::RemoteStateManager;
pub use rest::{RestCollection, RestShape};
pub use shape::ApiShape;
