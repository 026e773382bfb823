//! Offline support: connectivity state and the durable pending-request log.
//!
//! When a request fails with an "offline" status the queue hands it to the
//! [`OfflineManager`]. Once connectivity returns the queue replays every
//! pending request exactly once, flagged as `was_offline`.

mod log;
mod manager;

pub use log::{LogEntry, LogEntryStatus, PendingRequestLog};
pub use manager::OfflineManager;
