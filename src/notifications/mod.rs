//! Change notifications for named states.
//!
//! Every backend owns a [`ChangeDelegate`]. Mutations report the precise
//! kind of change so listeners can patch incrementally:
//! - item added / updated / deleted
//! - whole state replaced
//! - filter and find results from asynchronous backends
//! - "not modified" answers to staleness checks
//!
//! Listeners are delivered to synchronously, in registration order.
//! Consumers on other threads can use a bounded channel instead.
//!
//! # Example
//!
//! ```ignore
//! let delegate = ChangeDelegate::new("memory");
//! delegate.add_listener("users", listener_fn("ui", |event| {
//!     println!("{:?} on {}", event.event_type, event.state_name);
//! }));
//! delegate.notify("users", ChangeEventType::ItemAdded, json!({"_id": "u1"}));
//! ```

mod delegate;
mod types;

pub use delegate::ChangeDelegate;
pub use types::{
    listener_fn, ChangeEvent, ChangeEventType, FnListener, ListenerId, StateChangeListener,
    SubscriptionConfig, SubscriptionHandle, SubscriptionId,
};
