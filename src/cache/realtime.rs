//! Change events pushed by other clients over the real-time channel.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SyncError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RealtimeEventKind {
    Create,
    Update,
    Delete,
}

/// `{stateName, type, data}`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeEvent {
    pub state_name: String,
    #[serde(rename = "type")]
    pub kind: RealtimeEventKind,
    pub data: Value,
}

impl RealtimeEvent {
    pub fn new(state_name: impl Into<String>, kind: RealtimeEventKind, data: Value) -> Self {
        Self {
            state_name: state_name.into(),
            kind,
            data,
        }
    }

    /// Parse a raw channel message.
    pub fn parse(text: &str) -> Result<Self> {
        let event: Self =
            serde_json::from_str(text).map_err(|e| SyncError::MalformedPayload(e.to_string()))?;
        if !event.data.is_object() {
            return Err(SyncError::MalformedPayload(format!(
                "realtime data for {} is not an object",
                event.state_name
            )));
        }
        Ok(event)
    }
}

/// Consumes real-time events.
pub trait RealtimeListener: Send + Sync {
    fn realtime_event(&self, event: &RealtimeEvent);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse() {
        let event =
            RealtimeEvent::parse(r#"{"stateName": "users", "type": "update", "data": {"_id": "u1"}}"#)
                .unwrap();
        assert_eq!(event.state_name, "users");
        assert_eq!(event.kind, RealtimeEventKind::Update);
        assert_eq!(event.data, json!({"_id": "u1"}));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for bad in [
            "",
            "not json",
            r#"{"stateName": "users", "type": "upsert", "data": {}}"#,
            r#"{"stateName": "users", "type": "create"}"#,
            r#"{"stateName": "users", "type": "create", "data": 3}"#,
        ] {
            assert!(
                matches!(RealtimeEvent::parse(bad), Err(SyncError::MalformedPayload(_))),
                "accepted {bad:?}"
            );
        }
    }
}
