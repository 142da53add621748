//! Tracked wire requests

use chrono::{DateTime, Utc};

use super::events::ConnectionId;

/// What a tracked request asked the venue to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Ping,
    Pong,
    Subscribe,
    Unsubscribe,
    Auth,
}

/// One in-flight request awaiting its correlated response
///
/// The response must arrive on `connection`; a response with this id on any
/// other connection is a protocol violation. The wire payload is kept so a
/// rejection can be logged next to what was actually sent.
#[derive(Debug, Clone)]
pub struct TrackedRequest {
    pub id: u64,
    pub connection: ConnectionId,
    pub kind: RequestKind,
    pub payload: String,
    pub sent_at: DateTime<Utc>,
}

impl TrackedRequest {
    pub fn new(id: u64, connection: ConnectionId, kind: RequestKind, payload: String) -> Self {
        TrackedRequest {
            id,
            connection,
            kind,
            payload,
            sent_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracked_request_fields() {
        let req = TrackedRequest::new(
            5,
            ConnectionId(2),
            RequestKind::Subscribe,
            r#"{"method":"SUBSCRIBE"}"#.to_string(),
        );
        assert_eq!(req.id, 5);
        assert_eq!(req.connection, ConnectionId(2));
        assert_eq!(req.kind, RequestKind::Subscribe);
        assert_eq!(req.payload, r#"{"method":"SUBSCRIBE"}"#);
    }
}
