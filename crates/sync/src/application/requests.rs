//! Request table
//!
//! Tracks in-flight wire requests and allocates correlation ids. Every id is
//! taken exactly once when its response arrives; whatever is left for a
//! connection is swept when that connection dies.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::domain::events::ConnectionId;
use crate::domain::request::{RequestKind, TrackedRequest};

pub struct RequestTable {
    inner: Mutex<HashMap<u64, TrackedRequest>>,
    next_id: AtomicU64,
}

impl RequestTable {
    pub fn new() -> Self {
        RequestTable {
            inner: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate a fresh correlation id
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Register a request before its payload is dispatched
    pub fn track(&self, id: u64, connection: ConnectionId, kind: RequestKind, payload: String) {
        self.inner
            .lock()
            .insert(id, TrackedRequest::new(id, connection, kind, payload));
    }

    /// Resolve a request: remove and return it. A request is correlated at
    /// most once.
    pub fn take(&self, id: u64) -> Option<TrackedRequest> {
        self.inner.lock().remove(&id)
    }

    /// Drop a request that will never get a response (failed send, rollback)
    pub fn forget(&self, id: u64) {
        self.inner.lock().remove(&id);
    }

    /// Sweep all requests of a dying connection
    pub fn clear_connection(&self, connection: ConnectionId) -> Vec<TrackedRequest> {
        let mut inner = self.inner.lock();
        let ids: Vec<u64> = inner
            .values()
            .filter(|r| r.connection == connection)
            .map(|r| r.id)
            .collect();
        ids.iter().filter_map(|id| inner.remove(id)).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}

impl Default for RequestTable {
    fn default() -> Self {
        RequestTable::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique_and_increasing() {
        let table = RequestTable::new();
        let a = table.next_id();
        let b = table.next_id();
        assert!(b > a);
    }

    #[test]
    fn test_take_resolves_once() {
        let table = RequestTable::new();
        let id = table.next_id();
        table.track(id, ConnectionId(1), RequestKind::Subscribe, "{}".to_string());

        let req = table.take(id).unwrap();
        assert_eq!(req.kind, RequestKind::Subscribe);
        assert!(table.take(id).is_none());
    }

    #[test]
    fn test_clear_connection_sweeps_orphans() {
        let table = RequestTable::new();
        table.track(1, ConnectionId(1), RequestKind::Subscribe, "{}".to_string());
        table.track(2, ConnectionId(1), RequestKind::Ping, "{}".to_string());
        table.track(3, ConnectionId(2), RequestKind::Unsubscribe, "{}".to_string());

        let swept = table.clear_connection(ConnectionId(1));
        assert_eq!(swept.len(), 2);
        assert_eq!(table.len(), 1);
        assert!(table.take(3).is_some());
    }
}
