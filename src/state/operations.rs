//! Collection change application.

use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::error::{Result, SyncError};
use crate::types::{key_of, same_key};

/// Custom record equality for one collection.
pub type EqualityFn = Arc<dyn Fn(&Value, &Value) -> bool + Send + Sync>;

/// Decides whether two records are "the same item".
#[derive(Clone)]
pub enum ItemMatcher {
    KeyField(String),
    Custom(EqualityFn),
}

impl ItemMatcher {
    pub fn key_field(field: impl Into<String>) -> Self {
        ItemMatcher::KeyField(field.into())
    }

    pub fn same_item(&self, a: &Value, b: &Value) -> bool {
        match self {
            ItemMatcher::KeyField(field) => same_key(a, b, field),
            ItemMatcher::Custom(eq) => eq(a, b),
        }
    }

    fn check_identifiable(&self, item: &Value) -> Result<()> {
        if let ItemMatcher::KeyField(field) = self {
            if key_of(item, field).is_none() {
                return Err(SyncError::InvalidOperation(format!(
                    "record has no '{}' to match on",
                    field
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for ItemMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemMatcher::KeyField(field) => write!(f, "KeyField({})", field),
            ItemMatcher::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// A change to one named collection.
#[derive(Clone, Debug, PartialEq)]
pub enum CollectionChange {
    /// Replace the whole collection.
    Replace(Vec<Value>),

    /// Add a record; an existing record with the same identity is replaced.
    Add(Value),

    /// Replace the matching record, or add it if absent.
    Update(Value),

    /// Remove the matching record.
    Remove(Value),
}

/// Apply a change to a collection in place.
///
/// Returns the record that was replaced or removed, if any.
pub fn apply_change(
    state: &mut Vec<Value>,
    change: CollectionChange,
    matcher: &ItemMatcher,
) -> Result<Option<Value>> {
    match change {
        CollectionChange::Replace(values) => {
            *state = values;
            Ok(None)
        }

        CollectionChange::Add(item) => {
            if let Some(index) = find_index(state, &item, matcher) {
                let previous = std::mem::replace(&mut state[index], item);
                return Ok(Some(previous));
            }
            state.push(item);
            Ok(None)
        }

        CollectionChange::Update(item) => {
            matcher.check_identifiable(&item)?;
            match find_index(state, &item, matcher) {
                Some(index) => Ok(Some(std::mem::replace(&mut state[index], item))),
                None => {
                    state.push(item);
                    Ok(None)
                }
            }
        }

        CollectionChange::Remove(item) => {
            matcher.check_identifiable(&item)?;
            Ok(find_index(state, &item, matcher).map(|index| state.remove(index)))
        }
    }
}

/// Find the stored record matching `probe`.
pub fn find_item<'a>(state: &'a [Value], probe: &Value, matcher: &ItemMatcher) -> Option<&'a Value> {
    find_index(state, probe, matcher).map(|index| &state[index])
}

fn find_index(state: &[Value], probe: &Value, matcher: &ItemMatcher) -> Option<usize> {
    state.iter().position(|existing| matcher.same_item(existing, probe))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn by_id() -> ItemMatcher {
        ItemMatcher::key_field("_id")
    }

    #[test]
    fn test_add_and_replace_duplicate() {
        let mut state = vec![];
        assert_eq!(apply_change(&mut state, CollectionChange::Add(json!({"_id": 1, "v": "a"})), &by_id()).unwrap(), None);
        let previous = apply_change(&mut state, CollectionChange::Add(json!({"_id": 1, "v": "b"})), &by_id()).unwrap();
        assert_eq!(previous, Some(json!({"_id": 1, "v": "a"})));
        assert_eq!(state, vec![json!({"_id": 1, "v": "b"})]);
    }

    #[test]
    fn test_update_existing_and_missing() {
        let mut state = vec![json!({"_id": "x", "n": 1})];
        let previous = apply_change(&mut state, CollectionChange::Update(json!({"_id": "x", "n": 2})), &by_id()).unwrap();
        assert_eq!(previous, Some(json!({"_id": "x", "n": 1})));

        apply_change(&mut state, CollectionChange::Update(json!({"_id": "y", "n": 3})), &by_id()).unwrap();
        assert_eq!(state.len(), 2);
    }

    #[test]
    fn test_remove() {
        let mut state = vec![json!({"_id": 1}), json!({"_id": 2})];
        let removed = apply_change(&mut state, CollectionChange::Remove(json!({"_id": 1})), &by_id()).unwrap();
        assert_eq!(removed, Some(json!({"_id": 1})));
        assert_eq!(state, vec![json!({"_id": 2})]);

        let missing = apply_change(&mut state, CollectionChange::Remove(json!({"_id": 9})), &by_id()).unwrap();
        assert_eq!(missing, None);
    }

    #[test]
    fn test_keyless_update_rejected() {
        let mut state = vec![];
        let result = apply_change(&mut state, CollectionChange::Update(json!({"name": "no key"})), &by_id());
        assert!(matches!(result, Err(SyncError::InvalidOperation(_))));
    }

    #[test]
    fn test_custom_matcher() {
        let matcher = ItemMatcher::Custom(Arc::new(|a: &Value, b: &Value| a["email"] == b["email"]));
        let mut state = vec![json!({"email": "a@x", "n": 1})];
        apply_change(&mut state, CollectionChange::Update(json!({"email": "a@x", "n": 2})), &matcher).unwrap();
        assert_eq!(state, vec![json!({"email": "a@x", "n": 2})]);
        assert!(find_item(&state, &json!({"email": "a@x"}), &matcher).is_some());
    }

    proptest! {
        #[test]
        fn prop_keys_stay_unique(ids in proptest::collection::vec(0u8..10, 0..40)) {
            let mut state = vec![];
            for id in &ids {
                apply_change(&mut state, CollectionChange::Add(json!({"_id": id})), &by_id()).unwrap();
            }
            let mut distinct = ids.clone();
            distinct.sort_unstable();
            distinct.dedup();
            prop_assert_eq!(state.len(), distinct.len());
        }
    }
}
