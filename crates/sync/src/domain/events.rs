//! Engine events
//!
//! Two event families cross the engine: [`ConnectionEvent`] flows inward from
//! socket tasks, [`SyncEvent`] flows outward to the consumer. In between, the
//! codec classifies raw frames into a [`Classification`].

use serde::{Deserialize, Serialize};
use std::fmt;

use hermes_core::{BalanceRecord, DepthRecord, Topic};

/// Engine-assigned identity of one live socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Events produced by socket and connection tasks
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Connection is open and authenticated
    Opened { connection: ConnectionId },
    /// One text frame received
    Frame { connection: ConnectionId, text: String },
    /// Frame-level pong arrived
    PongReceived { connection: ConnectionId },
    /// Keep-alive ping went out
    PingSent { connection: ConnectionId },
    /// Keep-alive ping could not be sent
    PingFailed { connection: ConnectionId, error: String },
    /// Socket closed (remote close or read error ended the reader)
    Closed { connection: ConnectionId, reason: String },
    /// Transport error on the socket
    Error { connection: ConnectionId, error: String },
    /// Configured lifetime elapsed; the engine rebuilds the connection
    Expired { connection: ConnectionId },
}

impl ConnectionEvent {
    pub fn connection(&self) -> ConnectionId {
        match self {
            ConnectionEvent::Opened { connection }
            | ConnectionEvent::Frame { connection, .. }
            | ConnectionEvent::PongReceived { connection }
            | ConnectionEvent::PingSent { connection }
            | ConnectionEvent::PingFailed { connection, .. }
            | ConnectionEvent::Closed { connection, .. }
            | ConnectionEvent::Error { connection, .. }
            | ConnectionEvent::Expired { connection } => *connection,
        }
    }
}

/// What one wire frame contains
///
/// A single frame can carry several kinds at once, e.g. a subscribe
/// confirmation that also embeds the first update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Completes a tracked request
    Response,
    /// Carries market data records
    Update,
    /// Venue app-level ping that expects a reply
    Ping,
    /// Venue app-level pong
    Pong,
    /// Completes an authentication handshake
    AuthResult,
}

/// Classifier output for one raw frame
///
/// Built by [`crate::domain::spec::WireCodec::classify`]. An empty `kinds`
/// list means the frame was not recognized and is dropped after a debug log.
#[derive(Debug, Clone)]
pub struct Classification {
    pub kinds: Vec<MessageKind>,
    /// Correlation id echoed by the venue, when present
    pub request_id: Option<u64>,
    /// Unified topic of carried updates
    pub topic: Option<Topic>,
    /// Stream subjects the frame belongs to (venue-native symbols)
    pub subjects: Vec<String>,
    /// False when the frame reports a venue-side failure
    pub success: bool,
    pub error: Option<String>,
    /// Decoded depth records, in wire order
    pub depth: Vec<DepthRecord>,
    /// Decoded balance records, in wire order
    pub balances: Vec<BalanceRecord>,
}

impl Default for Classification {
    fn default() -> Self {
        Classification {
            kinds: Vec::new(),
            request_id: None,
            topic: None,
            subjects: Vec::new(),
            success: true,
            error: None,
            depth: Vec::new(),
            balances: Vec::new(),
        }
    }
}

impl Classification {
    /// Unrecognized frame
    pub fn none() -> Self {
        Classification::default()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    pub fn has(&self, kind: MessageKind) -> bool {
        self.kinds.contains(&kind)
    }

    /// Successful response to a tracked request
    pub fn response(request_id: u64) -> Self {
        Classification {
            kinds: vec![MessageKind::Response],
            request_id: Some(request_id),
            ..Classification::default()
        }
    }

    /// Failed response to a tracked request
    pub fn error_response(request_id: Option<u64>, error: impl Into<String>) -> Self {
        Classification {
            kinds: vec![MessageKind::Response],
            request_id,
            success: false,
            error: Some(error.into()),
            ..Classification::default()
        }
    }
}

/// Unified events emitted to the engine consumer
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// A subscribe request completed (or was synthesized for a presubscribed
    /// topic). `success: false` means the venue rejected it.
    Subscribed {
        topic: Topic,
        subjects: Vec<String>,
        connection: ConnectionId,
        success: bool,
        error: Option<String>,
    },
    /// An unsubscribe request completed
    Unsubscribed {
        topic: Topic,
        subjects: Vec<String>,
        connection: ConnectionId,
        success: bool,
        error: Option<String>,
    },
    /// One decoded order book event
    DepthUpdate { topic: Topic, record: DepthRecord },
    /// One decoded balance event
    BalanceUpdate { record: BalanceRecord },
    ConnectionOpened { connection: ConnectionId },
    ConnectionClosed { connection: ConnectionId, reason: String },
    ConnectionExpired { connection: ConnectionId },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_display() {
        assert_eq!(ConnectionId(7).to_string(), "conn-7");
    }

    #[test]
    fn test_classification_defaults_to_success() {
        let c = Classification::response(3);
        assert!(c.success);
        assert!(c.has(MessageKind::Response));
        assert!(!c.has(MessageKind::Update));
    }

    #[test]
    fn test_empty_classification() {
        assert!(Classification::none().is_empty());
    }

    #[test]
    fn test_error_response() {
        let c = Classification::error_response(Some(9), "bad params");
        assert!(!c.success);
        assert_eq!(c.request_id, Some(9));
        assert_eq!(c.error.as_deref(), Some("bad params"));
    }
}
