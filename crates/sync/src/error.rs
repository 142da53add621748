//! Engine error types

use thiserror::Error;

use crate::domain::events::ConnectionId;
use crate::domain::spec::CodecError;

/// Error type for synchronization engine operations
#[derive(Error, Debug)]
pub enum SyncError {
    /// Transport-level failure on the socket
    #[error("connection error: {0}")]
    Connection(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Internal channel to a worker task is gone
    #[error("channel closed")]
    ChannelClosed,

    #[error("connection {0} not found")]
    ConnectionNotFound(ConnectionId),

    /// Payload dispatch refused because the connection never authenticated
    #[error("connection {0} is not authenticated")]
    NotAuthenticated(ConnectionId),

    #[error("connection limit of {0} reached")]
    ConnectionLimit(usize),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// The venue or our own state contradicts the protocol. Never retried
    /// silently; always surfaced to the caller and the log.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
}
