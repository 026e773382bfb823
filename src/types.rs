//! Core types shared by every backend.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Key field used when a collection does not declare one.
pub const DEFAULT_KEY_FIELD: &str = "_id";

/// Milliseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current wall-clock time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_millis() as i64)
    }

    pub fn from_secs(secs: i64) -> Self {
        Timestamp(secs * 1000)
    }

    pub fn as_millis(self) -> i64 {
        self.0
    }

    /// This timestamp moved forward by a number of seconds.
    pub fn plus_secs(self, secs: u64) -> Self {
        Timestamp(self.0.saturating_add((secs as i64).saturating_mul(1000)))
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Wall clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<Timestamp>,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, now: Timestamp) {
        *self.now.lock() = now;
    }

    pub fn advance_secs(&self, secs: u64) {
        let mut now = self.now.lock();
        *now = now.plus_secs(secs);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        *self.now.lock()
    }
}

/// Unique identifier for a dispatched request.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestId(pub u64);

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestId({})", self.0)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// Fetch lifecycle of one named state inside an asynchronous backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum RunState {
    #[default]
    NotStarted,
    InProgress,
    Completed,
}

/// The current value of one named collection inside one backend.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NamedState {
    pub name: String,
    pub value: Vec<Value>,
    pub has_been_set: bool,
}

impl NamedState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Vec::new(),
            has_been_set: false,
        }
    }
}

/// Look up a field by name, following `a.b.c` paths into nested objects.
pub fn field_value<'a>(item: &'a Value, path: &str) -> Option<&'a Value> {
    if let Some(direct) = item.get(path) {
        return Some(direct);
    }
    let mut current = item;
    for part in path.split('.') {
        current = current.get(part)?;
    }
    Some(current)
}

/// Render a record's key as a string.
///
/// Strings are used as-is and numbers are rendered in decimal; any other
/// shape is not a usable key.
pub fn key_of(item: &Value, key_field: &str) -> Option<String> {
    match field_value(item, key_field)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Whether two records share the same key.
pub fn same_key(a: &Value, b: &Value, key_field: &str) -> bool {
    match (key_of(a, key_field), key_of(b, key_field)) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_timestamp_plus_secs() {
        let t = Timestamp(1_000);
        assert_eq!(t.plus_secs(2), Timestamp(3_000));
        assert!(t.plus_secs(1) > t);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(Timestamp::from_secs(10));
        clock.advance_secs(5);
        assert_eq!(clock.now(), Timestamp::from_secs(15));
        clock.set(Timestamp(0));
        assert_eq!(clock.now(), Timestamp(0));
    }

    #[test]
    fn test_key_of() {
        assert_eq!(key_of(&json!({"_id": "a1"}), "_id"), Some("a1".into()));
        assert_eq!(key_of(&json!({"id": 7}), "id"), Some("7".into()));
        assert_eq!(key_of(&json!({"id": [1]}), "id"), None);
        assert_eq!(key_of(&json!({}), "_id"), None);
    }

    #[test]
    fn test_field_value_dotted() {
        let item = json!({"owner": {"name": "kim"}, "a.b": 1});
        assert_eq!(field_value(&item, "owner.name"), Some(&json!("kim")));
        assert_eq!(field_value(&item, "a.b"), Some(&json!(1)));
        assert_eq!(field_value(&item, "owner.age"), None);
    }

    #[test]
    fn test_same_key() {
        assert!(same_key(&json!({"_id": 1}), &json!({"_id": "1"}), "_id"));
        assert!(!same_key(&json!({"_id": 1}), &json!({}), "_id"));
    }
}
