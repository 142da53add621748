//! Stream table
//!
//! Single source of truth for which stream lives on which connection. All
//! mutation goes through here; connection capacity is derived by counting
//! rather than kept as a second counter that could drift.

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;

use hermes_core::StreamKey;

use crate::domain::events::ConnectionId;
use crate::domain::stream::StreamBinding;

/// Owned table of stream bindings, keyed by stream identity
pub struct StreamTable {
    inner: Mutex<HashMap<StreamKey, StreamBinding>>,
}

impl StreamTable {
    pub fn new() -> Self {
        StreamTable {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Upsert a binding. The stream key guarantees at most one live binding
    /// per logical stream.
    pub fn insert(&self, binding: StreamBinding) {
        self.inner.lock().insert(binding.key(), binding);
    }

    pub fn get(&self, key: &StreamKey) -> Option<StreamBinding> {
        self.inner.lock().get(key).cloned()
    }

    pub fn contains(&self, key: &StreamKey) -> bool {
        self.inner.lock().contains_key(key)
    }

    pub fn remove(&self, key: &StreamKey) -> Option<StreamBinding> {
        self.inner.lock().remove(key)
    }

    /// Confirm every binding pending on this subscribe request. Returns the
    /// confirmed bindings.
    pub fn confirm_for_request(&self, request_id: u64) -> Vec<StreamBinding> {
        let now = Utc::now();
        let mut confirmed = Vec::new();
        let mut inner = self.inner.lock();
        for binding in inner.values_mut() {
            if binding.subscribe_request == Some(request_id) {
                binding.subscribe_request = None;
                binding.subscribed_at = Some(now);
                confirmed.push(binding.clone());
            }
        }
        confirmed
    }

    /// Drop every binding pending on this subscribe request (venue rejected
    /// it, or the send failed). Returns the removed bindings.
    pub fn remove_for_request(&self, request_id: u64) -> Vec<StreamBinding> {
        let mut inner = self.inner.lock();
        let keys: Vec<StreamKey> = inner
            .values()
            .filter(|b| b.subscribe_request == Some(request_id))
            .map(|b| b.key())
            .collect();
        keys.iter().filter_map(|k| inner.remove(k)).collect()
    }

    /// Drop every binding whose unsubscribe completed. Returns the removed
    /// bindings.
    pub fn remove_for_unsubscribe(&self, request_id: u64) -> Vec<StreamBinding> {
        let mut inner = self.inner.lock();
        let keys: Vec<StreamKey> = inner
            .values()
            .filter(|b| b.unsubscribe_request == Some(request_id))
            .map(|b| b.key())
            .collect();
        keys.iter().filter_map(|k| inner.remove(k)).collect()
    }

    /// Undo pending-unsubscribe markers after a failed unsubscribe; the
    /// streams stay live. Returns the affected bindings.
    pub fn clear_unsubscribe_markers(&self, request_id: u64) -> Vec<StreamBinding> {
        let mut cleared = Vec::new();
        let mut inner = self.inner.lock();
        for binding in inner.values_mut() {
            if binding.unsubscribe_request == Some(request_id) {
                binding.unsubscribe_request = None;
                binding.unsubscribe_requested_at = None;
                cleared.push(binding.clone());
            }
        }
        cleared
    }

    /// Mark a binding pending-unsubscribe before the payload goes out
    pub fn mark_unsubscribing(&self, key: &StreamKey, request_id: u64) -> bool {
        let mut inner = self.inner.lock();
        let Some(binding) = inner.get_mut(key) else {
            return false;
        };
        binding.unsubscribe_request = Some(request_id);
        binding.unsubscribe_requested_at = Some(Utc::now());
        true
    }

    /// Drop all bindings of a dying connection. Returns them for cleanup.
    pub fn clear_connection(&self, connection: ConnectionId) -> Vec<StreamBinding> {
        let mut inner = self.inner.lock();
        let keys: Vec<StreamKey> = inner
            .values()
            .filter(|b| b.connection == connection)
            .map(|b| b.key())
            .collect();
        keys.iter().filter_map(|k| inner.remove(k)).collect()
    }

    /// Live streams on a connection (capacity packing input)
    pub fn count_for_connection(&self, connection: ConnectionId) -> usize {
        self.inner
            .lock()
            .values()
            .filter(|b| b.connection == connection)
            .count()
    }

    /// Whether any binding still references this pending subscribe request
    pub fn has_subscribe_request(&self, request_id: u64) -> bool {
        self.inner
            .lock()
            .values()
            .any(|b| b.subscribe_request == Some(request_id))
    }

    /// Snapshot of every binding
    pub fn all(&self) -> Vec<StreamBinding> {
        self.inner.lock().values().cloned().collect()
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

impl Default for StreamTable {
    fn default() -> Self {
        StreamTable::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::stream::Stream;
    use hermes_core::Topic;

    fn depth_stream(subject: &str) -> Stream {
        Stream::new(Topic::Depth, "depthUpdate", Some(subject.to_string()))
    }

    #[test]
    fn test_one_binding_per_stream_key() {
        let table = StreamTable::new();
        table.insert(StreamBinding::pending(
            depth_stream("BTCUSDT"),
            ConnectionId(1),
            10,
        ));
        table.insert(StreamBinding::pending(
            depth_stream("btcusdt"),
            ConnectionId(2),
            11,
        ));

        assert_eq!(table.len(), 1);
        let key = depth_stream("BTCUSDT").key();
        assert_eq!(table.get(&key).unwrap().connection, ConnectionId(2));
    }

    #[test]
    fn test_confirm_for_request() {
        let table = StreamTable::new();
        table.insert(StreamBinding::pending(
            depth_stream("BTCUSDT"),
            ConnectionId(1),
            10,
        ));
        table.insert(StreamBinding::pending(
            depth_stream("ETHUSDT"),
            ConnectionId(1),
            10,
        ));
        table.insert(StreamBinding::pending(
            depth_stream("XRPUSDT"),
            ConnectionId(1),
            11,
        ));

        let confirmed = table.confirm_for_request(10);
        assert_eq!(confirmed.len(), 2);
        assert!(confirmed.iter().all(|b| b.is_confirmed()));
        assert!(!table.has_subscribe_request(10));
        assert!(table.has_subscribe_request(11));
    }

    #[test]
    fn test_remove_for_failed_request() {
        let table = StreamTable::new();
        table.insert(StreamBinding::pending(
            depth_stream("BTCUSDT"),
            ConnectionId(1),
            10,
        ));
        let removed = table.remove_for_request(10);
        assert_eq!(removed.len(), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn test_unsubscribe_marker_roundtrip() {
        let table = StreamTable::new();
        table.insert(StreamBinding::confirmed(
            depth_stream("BTCUSDT"),
            ConnectionId(1),
        ));
        let key = depth_stream("BTCUSDT").key();

        assert!(table.mark_unsubscribing(&key, 20));
        assert!(table.get(&key).unwrap().is_unsubscribing());

        // Venue rejected the unsubscribe: markers cleared, stream stays live
        let cleared = table.clear_unsubscribe_markers(20);
        assert_eq!(cleared.len(), 1);
        assert!(!table.get(&key).unwrap().is_unsubscribing());

        assert!(table.mark_unsubscribing(&key, 21));
        let removed = table.remove_for_unsubscribe(21);
        assert_eq!(removed.len(), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn test_clear_connection() {
        let table = StreamTable::new();
        table.insert(StreamBinding::confirmed(
            depth_stream("BTCUSDT"),
            ConnectionId(1),
        ));
        table.insert(StreamBinding::confirmed(
            depth_stream("ETHUSDT"),
            ConnectionId(2),
        ));

        assert_eq!(table.count_for_connection(ConnectionId(1)), 1);
        let dropped = table.clear_connection(ConnectionId(1));
        assert_eq!(dropped.len(), 1);
        assert_eq!(table.len(), 1);
        assert_eq!(table.count_for_connection(ConnectionId(1)), 0);
    }
}
