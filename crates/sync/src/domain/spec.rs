//! Exchange specification
//!
//! Everything venue-specific is captured in one immutable value: how unified
//! topics are spelled on the wire, which connection channel serves them, how
//! channels authenticate, and a codec for encoding and classifying frames.
//! The engine itself contains no per-venue branches; plug one spec in per
//! venue and the same machinery drives Binance, Kraken or a test fixture.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use url::Url;

use hermes_core::{ChannelId, ExchangeId, Topic};

use super::events::Classification;
use super::stream::Stream;
use crate::error::SyncError;

/// Error type for codec operations
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("signing error: {0}")]
    Sign(String),
    #[error("token error: {0}")]
    Token(String),
}

/// How a channel authenticates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    /// Public channel, no authentication
    None,
    /// A short-lived token is substituted into the URL before connecting
    /// (listen-key style); the socket is authenticated once open
    ConnectionString,
    /// An auth payload is sent after opening and the engine waits for the
    /// venue to confirm before using the connection
    OneMessage,
}

/// How a channel keeps its socket alive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingStyle {
    /// WebSocket frame-level ping
    Frame,
    /// Codec-encoded application payload
    Payload,
    /// Venue pings us; we only answer
    Disabled,
}

/// Connection class settings for one channel
#[derive(Debug, Clone)]
pub struct ChannelSpec {
    /// Endpoint URL; may contain a `{token}` placeholder for
    /// [`AuthScheme::ConnectionString`] channels
    pub url: String,
    pub auth: AuthScheme,
    /// Topics the venue streams on this channel without any subscribe payload
    pub presubscribed: Vec<Topic>,
    /// Maximum live streams per connection
    pub streams_limit: usize,
    /// Maximum streams per subscribe/unsubscribe payload
    pub max_streams_per_payload: usize,
    pub ping: PingStyle,
}

impl ChannelSpec {
    /// Public unauthenticated channel with common defaults
    pub fn public(url: impl Into<String>) -> Self {
        ChannelSpec {
            url: url.into(),
            auth: AuthScheme::None,
            presubscribed: Vec::new(),
            streams_limit: 200,
            max_streams_per_payload: 50,
            ping: PingStyle::Frame,
        }
    }
}

/// Venue protocol codec
///
/// Four concerns: classify inbound frames, encode outbound payloads, sign
/// what the venue wants signed, and mint connection tokens. Implementations
/// are pure protocol knowledge; they never touch sockets or engine state.
#[async_trait]
pub trait WireCodec: Send + Sync {
    /// Classify one raw text frame, decoding any carried records
    fn classify(&self, raw: &str) -> Classification;

    fn encode_subscribe(&self, request_id: u64, streams: &[Stream])
    -> Result<String, CodecError>;

    fn encode_unsubscribe(
        &self,
        request_id: u64,
        streams: &[Stream],
    ) -> Result<String, CodecError>;

    /// App-level keep-alive payload for [`PingStyle::Payload`] channels. The
    /// request id is there for venues that echo it; others ignore it.
    fn encode_ping(&self, _request_id: u64) -> Result<String, CodecError> {
        Err(CodecError::Encode(
            "app-level ping not supported by this venue".to_string(),
        ))
    }

    /// Reply to a venue app-level ping; None when no reply is expected
    fn encode_pong(&self, _raw: &str) -> Option<String> {
        None
    }

    /// Auth payload for [`AuthScheme::OneMessage`] channels; None when the
    /// channel needs no message despite the scheme
    fn encode_auth(&self, _request_id: u64) -> Result<Option<String>, CodecError> {
        Ok(None)
    }

    /// Sign a subscription payload for topics that require it
    fn sign(&self, payload: String) -> Result<String, CodecError> {
        Ok(payload)
    }

    /// Short-lived token substituted into connection-string URLs
    async fn connection_token(&self) -> Result<Option<String>, CodecError> {
        Ok(None)
    }
}

/// Immutable description of one venue
///
/// Plug-in boundary of the engine: construct once per venue, share behind an
/// `Arc`. Missing topic or channel mappings surface as protocol violations
/// rather than silent fallbacks.
#[derive(Clone)]
pub struct ExchangeSpec {
    pub exchange: ExchangeId,
    /// Unified topic -> venue wire topic
    pub wire_topics: HashMap<Topic, String>,
    /// Unified topic -> channel that serves it
    pub channels: HashMap<Topic, ChannelId>,
    /// Channel -> connection class settings
    pub channel_specs: HashMap<ChannelId, ChannelSpec>,
    /// Topics whose subscribe payloads must be signed
    pub signed_topics: HashSet<Topic>,
    /// Delta sequences overlap: a delta starting at the current nonce is the
    /// expected continuation (rather than nonce + 1)
    pub intersecting_updates: bool,
    /// Venue only guarantees forward progress, not exact adjacency; any delta
    /// moving the nonce forward is accepted
    pub loose_ordering: bool,
    pub codec: Arc<dyn WireCodec>,
}

impl ExchangeSpec {
    pub fn new(exchange: impl Into<ExchangeId>, codec: Arc<dyn WireCodec>) -> Self {
        ExchangeSpec {
            exchange: exchange.into(),
            wire_topics: HashMap::new(),
            channels: HashMap::new(),
            channel_specs: HashMap::new(),
            signed_topics: HashSet::new(),
            intersecting_updates: false,
            loose_ordering: false,
            codec,
        }
    }

    /// Venue wire spelling of a unified topic
    pub fn wire_topic(&self, topic: Topic) -> Result<&str, SyncError> {
        self.wire_topics
            .get(&topic)
            .map(String::as_str)
            .ok_or_else(|| {
                SyncError::ProtocolViolation(format!(
                    "{} has no wire mapping for topic {}",
                    self.exchange, topic
                ))
            })
    }

    /// Channel that serves a unified topic
    pub fn channel_for(&self, topic: Topic) -> Result<&ChannelId, SyncError> {
        self.channels.get(&topic).ok_or_else(|| {
            SyncError::ProtocolViolation(format!(
                "{} has no channel mapping for topic {}",
                self.exchange, topic
            ))
        })
    }

    pub fn channel_spec(&self, channel: &ChannelId) -> Result<&ChannelSpec, SyncError> {
        self.channel_specs.get(channel).ok_or_else(|| {
            SyncError::ProtocolViolation(format!(
                "{} has no settings for channel {}",
                self.exchange, channel
            ))
        })
    }

    /// Reverse lookup: unified topic for a wire topic (case-insensitive)
    pub fn topic_for_wire(&self, wire_topic: &str) -> Option<Topic> {
        self.wire_topics
            .iter()
            .find(|(_, wire)| wire.eq_ignore_ascii_case(wire_topic))
            .map(|(topic, _)| *topic)
    }

    /// Build a stream for a topic, resolving its wire spelling
    pub fn stream(&self, topic: Topic, subject: Option<String>) -> Result<Stream, SyncError> {
        let wire_topic = self.wire_topic(topic)?.to_string();
        Ok(Stream::new(topic, wire_topic, subject))
    }

    /// Whether a payload covering these streams must be signed
    pub fn requires_signing(&self, streams: &[Stream]) -> bool {
        streams.iter().any(|s| self.signed_topics.contains(&s.topic))
    }

    /// Resolve the connect URL for a channel, substituting the connection
    /// token for [`AuthScheme::ConnectionString`] channels
    pub async fn resolve_url(&self, channel: &ChannelId) -> Result<String, SyncError> {
        let spec = self.channel_spec(channel)?;

        let url = if spec.auth == AuthScheme::ConnectionString {
            let token = self
                .codec
                .connection_token()
                .await?
                .ok_or_else(|| SyncError::AuthFailed("venue returned no connection token".into()))?;
            spec.url.replace("{token}", &token)
        } else {
            spec.url.clone()
        };

        Url::parse(&url).map_err(|e| SyncError::InvalidUrl {
            url: url.clone(),
            reason: e.to_string(),
        })?;

        Ok(url)
    }

    /// Check the spec is internally consistent: every mapped topic has a
    /// channel and every channel has settings
    pub fn validate(&self) -> Result<(), SyncError> {
        for topic in self.wire_topics.keys() {
            let channel = self.channel_for(*topic)?;
            self.channel_spec(channel)?;
        }
        for spec in self.channel_specs.values() {
            if spec.streams_limit == 0 {
                return Err(SyncError::ProtocolViolation(format!(
                    "{} declares a channel with streams_limit 0",
                    self.exchange
                )));
            }
        }
        Ok(())
    }
}
