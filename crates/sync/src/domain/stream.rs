//! Streams and their connection bindings

use chrono::{DateTime, Utc};
use std::fmt;

use hermes_core::{StreamKey, Topic};

use super::events::ConnectionId;

/// One logical subscription: a topic in its venue wire spelling, plus the
/// optional subject it applies to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stream {
    pub topic: Topic,
    /// Venue wire name for the topic (e.g., "depthUpdate")
    pub wire_topic: String,
    /// Venue-native subject (e.g., the symbol), absent for account-wide topics
    pub subject: Option<String>,
}

impl Stream {
    pub fn new(topic: Topic, wire_topic: impl Into<String>, subject: Option<String>) -> Self {
        Stream {
            topic,
            wire_topic: wire_topic.into(),
            subject,
        }
    }

    /// Deterministic identity; equal streams collide here by construction
    pub fn key(&self) -> StreamKey {
        StreamKey::new(&self.wire_topic, self.subject.as_deref())
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// Binding of one stream to one connection
///
/// At most one live binding exists per stream key. Request ids stay attached
/// while a subscribe or unsubscribe is pending so responses can be traced
/// back to the streams they cover.
#[derive(Debug, Clone)]
pub struct StreamBinding {
    pub stream: Stream,
    pub connection: ConnectionId,
    /// Pending subscribe request; cleared once confirmed
    pub subscribe_request: Option<u64>,
    pub subscribe_requested_at: DateTime<Utc>,
    /// Set when the venue confirmed the subscription
    pub subscribed_at: Option<DateTime<Utc>>,
    /// Pending unsubscribe request
    pub unsubscribe_request: Option<u64>,
    pub unsubscribe_requested_at: Option<DateTime<Utc>>,
}

impl StreamBinding {
    /// Binding tracked optimistically before the subscribe payload goes out
    pub fn pending(stream: Stream, connection: ConnectionId, request_id: u64) -> Self {
        StreamBinding {
            stream,
            connection,
            subscribe_request: Some(request_id),
            subscribe_requested_at: Utc::now(),
            subscribed_at: None,
            unsubscribe_request: None,
            unsubscribe_requested_at: None,
        }
    }

    /// Binding that is live without any wire exchange (presubscribed topics)
    pub fn confirmed(stream: Stream, connection: ConnectionId) -> Self {
        let now = Utc::now();
        StreamBinding {
            stream,
            connection,
            subscribe_request: None,
            subscribe_requested_at: now,
            subscribed_at: Some(now),
            unsubscribe_request: None,
            unsubscribe_requested_at: None,
        }
    }

    pub fn key(&self) -> StreamKey {
        self.stream.key()
    }

    pub fn is_confirmed(&self) -> bool {
        self.subscribed_at.is_some()
    }

    pub fn is_unsubscribing(&self) -> bool {
        self.unsubscribe_request.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_key_derivation() {
        let stream = Stream::new(Topic::Depth, "depthUpdate", Some("BTCUSDT".to_string()));
        assert_eq!(stream.key().as_str(), "depthupdate:btcusdt");
    }

    #[test]
    fn test_pending_binding_state() {
        let stream = Stream::new(Topic::Depth, "depthUpdate", Some("BTCUSDT".to_string()));
        let binding = StreamBinding::pending(stream, ConnectionId(1), 42);
        assert!(!binding.is_confirmed());
        assert!(!binding.is_unsubscribing());
        assert_eq!(binding.subscribe_request, Some(42));
    }

    #[test]
    fn test_confirmed_binding_state() {
        let stream = Stream::new(Topic::Balance, "outboundAccountPosition", None);
        let binding = StreamBinding::confirmed(stream, ConnectionId(2));
        assert!(binding.is_confirmed());
        assert!(binding.subscribe_request.is_none());
    }
}
