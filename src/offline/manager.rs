//! Connectivity state plus the set of requests waiting to be replayed.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use super::log::PendingRequestLog;
use crate::error::Result;
use crate::queue::QueuedRequest;

/// Tracks whether the server is reachable and which requests must be
/// replayed once it is.
///
/// With a log attached, pending requests survive a restart. Entries handed
/// out for replay are not handed out again until they are released.
pub struct OfflineManager {
    online: AtomicBool,
    max_pending: usize,
    log: Option<PendingRequestLog>,
    inner: Mutex<OfflineInner>,
}

#[derive(Default)]
struct OfflineInner {
    pending: BTreeMap<u64, QueuedRequest>,
    replaying: HashSet<u64>,
    next_seq: u64,
}

impl OfflineManager {
    /// Pending requests are kept in memory only.
    pub fn in_memory(max_pending: usize) -> Self {
        Self {
            online: AtomicBool::new(true),
            max_pending,
            log: None,
            inner: Mutex::new(OfflineInner {
                next_seq: 1,
                ..Default::default()
            }),
        }
    }

    /// Pending requests are logged durably at `path`.
    ///
    /// A log with unsettled entries starts the manager offline.
    pub fn open(path: impl AsRef<Path>, max_pending: usize) -> Result<Self> {
        let log = PendingRequestLog::open(path)?;
        let pending: BTreeMap<u64, QueuedRequest> = log.pending_entries()?.into_iter().collect();
        let online = pending.is_empty();
        if !online {
            tracing::info!(pending = pending.len(), "recovered offline requests");
        }
        Ok(Self {
            online: AtomicBool::new(online),
            max_pending,
            log: Some(log),
            inner: Mutex::new(OfflineInner {
                pending,
                replaying: HashSet::new(),
                next_seq: 1,
            }),
        })
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Returns true if this was a transition.
    pub fn go_offline(&self) -> bool {
        let changed = self.online.swap(false, Ordering::SeqCst);
        if changed {
            tracing::warn!("server unreachable, switching to offline mode");
        }
        changed
    }

    /// Returns true if this was a transition.
    pub fn go_online(&self) -> bool {
        let changed = !self.online.swap(true, Ordering::SeqCst);
        if changed {
            tracing::info!(pending = self.pending_count(), "connectivity restored");
        }
        changed
    }

    /// Record a request that could not reach the server.
    ///
    /// The oldest entry is dropped when the bound is hit.
    pub fn add_offline_request(&self, request: QueuedRequest) -> Result<u64> {
        self.go_offline();

        let seq = match &self.log {
            Some(log) => log.log(&request)?,
            None => {
                let mut inner = self.inner.lock();
                let seq = inner.next_seq;
                inner.next_seq += 1;
                seq
            }
        };

        let evicted = {
            let mut inner = self.inner.lock();
            inner.pending.insert(seq, request);
            let mut evicted = Vec::new();
            while inner.pending.len() > self.max_pending {
                let Some(&oldest) = inner.pending.keys().next() else {
                    break;
                };
                inner.pending.remove(&oldest);
                inner.replaying.remove(&oldest);
                evicted.push(oldest);
            }
            evicted
        };

        for oldest in evicted {
            tracing::warn!(seq = oldest, max = self.max_pending, "offline queue full, dropping oldest request");
            if let Some(log) = &self.log {
                log.commit(oldest)?;
            }
        }

        tracing::debug!(seq, "request stored for replay");
        Ok(seq)
    }

    /// Entries not already being replayed, oldest first. They are marked
    /// as replaying until settled or released.
    pub fn take_for_replay(&self) -> Vec<(u64, QueuedRequest)> {
        let mut inner = self.inner.lock();
        let batch: Vec<(u64, QueuedRequest)> = inner
            .pending
            .iter()
            .filter(|(seq, _)| !inner.replaying.contains(seq))
            .map(|(seq, request)| (*seq, request.clone()))
            .collect();
        for (seq, _) in &batch {
            inner.replaying.insert(*seq);
        }
        batch
    }

    /// The replayed request reached the server; forget it.
    pub fn settle(&self, seq: u64) -> Result<()> {
        let removed = {
            let mut inner = self.inner.lock();
            inner.replaying.remove(&seq);
            inner.pending.remove(&seq).is_some()
        };
        if removed {
            if let Some(log) = &self.log {
                log.commit(seq)?;
            }
        }
        Ok(())
    }

    /// The replay failed to reach the server; keep it for next time.
    pub fn release(&self, seq: u64) {
        self.inner.lock().replaying.remove(&seq);
        self.go_offline();
    }

    /// The replay was dropped before it was sent or answered; it stays
    /// pending and connectivity is unchanged.
    pub fn cancel_replay(&self, seq: u64) {
        self.inner.lock().replaying.remove(&seq);
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn has_pending(&self) -> bool {
        !self.inner.lock().pending.is_empty()
    }

    pub fn pending_requests(&self) -> Vec<QueuedRequest> {
        self.inner.lock().pending.values().cloned().collect()
    }

    /// Drop every pending request.
    pub fn clear(&self) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            inner.pending.clear();
            inner.replaying.clear();
        }
        if let Some(log) = &self.log {
            log.clear()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{ApiRequest, HttpMethod, QueueClass, RequestAssociation, RequestOperation};
    use crate::types::RequestId;
    use tempfile::TempDir;

    fn queued(id: u64) -> QueuedRequest {
        QueuedRequest {
            request: ApiRequest::new(HttpMethod::Put, format!("/items/{id}")),
            request_id: RequestId(id),
            queue_class: QueueClass::Background,
            association: RequestAssociation::new("rest", "items", RequestOperation::Update),
            was_offline: false,
            offline_seq: None,
            auth_retries: 0,
        }
    }

    #[test]
    fn test_transitions() {
        let offline = OfflineManager::in_memory(10);
        assert!(offline.is_online());
        assert!(offline.go_offline());
        assert!(!offline.go_offline());
        assert!(offline.go_online());
        assert!(!offline.go_online());
    }

    #[test]
    fn test_add_goes_offline_and_bounds() {
        let offline = OfflineManager::in_memory(2);
        for i in 1..=3 {
            offline.add_offline_request(queued(i)).unwrap();
        }
        assert!(!offline.is_online());
        let ids: Vec<_> = offline.pending_requests().iter().map(|q| q.request_id).collect();
        assert_eq!(ids, vec![RequestId(2), RequestId(3)]);
    }

    #[test]
    fn test_replay_hands_out_once() {
        let offline = OfflineManager::in_memory(10);
        offline.add_offline_request(queued(1)).unwrap();
        offline.add_offline_request(queued(2)).unwrap();

        let batch = offline.take_for_replay();
        assert_eq!(batch.len(), 2);
        assert!(offline.take_for_replay().is_empty());

        offline.settle(batch[0].0).unwrap();
        offline.release(batch[1].0);
        assert_eq!(offline.pending_count(), 1);

        let again = offline.take_for_replay();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].1.request_id, RequestId(2));
    }

    #[test]
    fn test_durable_across_restart() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("offline.log");
        {
            let offline = OfflineManager::open(&path, 10).unwrap();
            offline.add_offline_request(queued(1)).unwrap();
            let seq = offline.add_offline_request(queued(2)).unwrap();
            offline.settle(seq).unwrap();
        }

        let offline = OfflineManager::open(&path, 10).unwrap();
        assert!(!offline.is_online());
        let pending = offline.pending_requests();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].request.url, "/items/1");

        offline.clear().unwrap();
        let reopened = OfflineManager::open(&path, 10).unwrap();
        assert!(reopened.is_online());
        assert!(!reopened.has_pending());
    }
}
