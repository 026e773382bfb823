//! Refresh policy for cached collections.

use crate::config::CacheCollectionConfig;
use crate::types::Timestamp;

/// True when the cached copy may be stale: never refreshed, the interval
/// ran out, or the server changed the collection after the last refresh.
pub fn needs_refresh(
    last_refreshed_at: Option<Timestamp>,
    refresh_interval_secs: u64,
    server_modified: Option<Timestamp>,
    now: Timestamp,
) -> bool {
    let Some(last) = last_refreshed_at else {
        return true;
    };
    let expired = last.plus_secs(refresh_interval_secs) < now;
    let server_newer = server_modified.is_some_and(|modified| modified > last);
    expired || server_newer
}

/// Runtime refresh state of one cached collection.
#[derive(Clone, Debug, PartialEq)]
pub struct CacheCollectionState {
    pub config: CacheCollectionConfig,
    pub last_refreshed_at: Option<Timestamp>,
    pub should_refresh: bool,
    /// A refetch was forced and its data has not arrived yet.
    pub refreshing: bool,
}

impl CacheCollectionState {
    pub fn new(config: CacheCollectionConfig) -> Self {
        Self {
            config,
            last_refreshed_at: None,
            should_refresh: true,
            refreshing: false,
        }
    }

    /// Recompute `should_refresh`, returning the new value.
    pub fn evaluate(&mut self, server_modified: Option<Timestamp>, now: Timestamp) -> bool {
        self.should_refresh = needs_refresh(
            self.last_refreshed_at,
            self.config.refresh_interval_secs,
            server_modified,
            now,
        );
        self.should_refresh
    }

    pub fn mark_refreshed(&mut self, at: Timestamp) {
        self.last_refreshed_at = Some(at);
        self.should_refresh = false;
        self.refreshing = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: Timestamp = Timestamp(1_700_000_000_000);

    #[test]
    fn test_interval_boundary() {
        let older = Some(Timestamp(T.0 - 1_000));
        assert!(!needs_refresh(Some(T), 60, older, T.plus_secs(59)));
        assert!(!needs_refresh(Some(T), 60, older, T.plus_secs(60)));
        assert!(needs_refresh(Some(T), 60, older, T.plus_secs(61)));
    }

    #[test]
    fn test_never_refreshed_and_server_newer() {
        assert!(needs_refresh(None, 3600, None, T));
        assert!(needs_refresh(Some(T), 3600, Some(Timestamp(T.0 + 1)), T.plus_secs(1)));
        assert!(!needs_refresh(Some(T), 3600, Some(T), T.plus_secs(1)));
    }

    #[test]
    fn test_state_tracks_refresh() {
        let mut state = CacheCollectionState::new(CacheCollectionConfig::new("users", "rest", 60));
        assert!(state.evaluate(None, T));
        state.refreshing = true;
        state.mark_refreshed(T);
        assert!(!state.refreshing);
        assert!(!state.evaluate(None, T.plus_secs(30)));
        assert!(state.evaluate(None, T.plus_secs(61)));
    }
}
