//! Inbound frame dispatch
//!
//! Every text frame is classified exactly once by the venue codec, then each
//! carried kind is handled: responses resolve tracked requests, auth results
//! complete handshakes, pings get their reply, and updates are verified
//! against the stream table before they reach a consumer. A frame answering
//! a request tracked for a different connection is a protocol violation and
//! fails loudly instead of being patched over.

use std::collections::HashMap;
use std::sync::Arc;

use hermes_core::{StreamKey, Topic};

use crate::application::requests::RequestTable;
use crate::application::streams::StreamTable;
use crate::domain::events::{Classification, ConnectionId, MessageKind, SyncEvent};
use crate::domain::request::{RequestKind, TrackedRequest};
use crate::domain::spec::ExchangeSpec;
use crate::domain::stream::StreamBinding;
use crate::error::SyncError;
use crate::infrastructure::connection::ConnectionManager;

pub struct MessageDispatcher {
    spec: Arc<ExchangeSpec>,
    connections: Arc<ConnectionManager>,
    streams: Arc<StreamTable>,
    requests: Arc<RequestTable>,
}

impl MessageDispatcher {
    pub fn new(
        spec: Arc<ExchangeSpec>,
        connections: Arc<ConnectionManager>,
        streams: Arc<StreamTable>,
        requests: Arc<RequestTable>,
    ) -> Self {
        Self {
            spec,
            connections,
            streams,
            requests,
        }
    }

    /// Process one raw frame from `connection`. Returns the unified events
    /// it produced, in wire order.
    pub async fn dispatch(
        &self,
        connection: ConnectionId,
        raw: &str,
    ) -> Result<Vec<SyncEvent>, SyncError> {
        let classification = self.spec.codec.classify(raw);
        if classification.is_empty() {
            tracing::debug!(
                "{} unrecognized frame on {}: {}",
                self.spec.exchange,
                connection,
                truncate(raw, 256)
            );
            return Ok(Vec::new());
        }

        let mut events = Vec::new();

        if classification.has(MessageKind::Ping) {
            self.answer_ping(connection, raw).await;
        }

        if classification.has(MessageKind::Pong) {
            if let Some(id) = classification.request_id {
                self.requests.take(id);
            }
            tracing::trace!("{} pong from {}", self.spec.exchange, connection);
        }

        if classification.has(MessageKind::AuthResult) {
            self.handle_auth_result(connection, &classification)?;
        }

        if classification.has(MessageKind::Response) {
            events.extend(self.handle_response(connection, &classification)?);
        }

        if classification.has(MessageKind::Update) {
            events.extend(self.handle_updates(connection, classification)?);
        }

        Ok(events)
    }

    /// Venue app-level pings get their reply immediately, bypassing the
    /// subscription machinery. A failed reply is the socket's problem and
    /// will surface through its own lifecycle events.
    async fn answer_ping(&self, connection: ConnectionId, raw: &str) {
        if let Some(pong) = self.spec.codec.encode_pong(raw) {
            if let Err(e) = self.connections.send(connection, pong).await {
                tracing::warn!(
                    "{} could not answer ping on {}: {}",
                    self.spec.exchange,
                    connection,
                    e
                );
            }
        }
    }

    fn handle_auth_result(
        &self,
        connection: ConnectionId,
        classification: &Classification,
    ) -> Result<(), SyncError> {
        if let Some(id) = classification.request_id {
            if let Some(request) = self.requests.take(id) {
                self.check_owner(&request, connection)?;
            }
        }
        self.connections.complete_auth(
            connection,
            classification.success,
            classification.error.clone(),
        );
        Ok(())
    }

    fn handle_response(
        &self,
        connection: ConnectionId,
        classification: &Classification,
    ) -> Result<Vec<SyncEvent>, SyncError> {
        let ids = match classification.request_id {
            Some(id) => vec![id],
            // Some venues confirm without echoing an id; fall back to the
            // stream table.
            None => {
                let ids = self.correlate_by_stream(connection, classification);
                if ids.is_empty() {
                    tracing::warn!(
                        "{} uncorrelatable response on {}",
                        self.spec.exchange,
                        connection
                    );
                }
                ids
            }
        };

        let mut events = Vec::new();
        for id in ids {
            events.extend(self.resolve_request(connection, id, classification)?);
        }
        Ok(events)
    }

    /// Pending request ids of the bindings covering the frame's topic and
    /// subjects on this connection. An unsubscribe in flight wins over the
    /// original subscribe: the id-less reply answers the latest request.
    fn correlate_by_stream(
        &self,
        connection: ConnectionId,
        classification: &Classification,
    ) -> Vec<u64> {
        let Some(topic) = classification.topic else {
            return Vec::new();
        };
        let Ok(wire_topic) = self.spec.wire_topic(topic) else {
            return Vec::new();
        };
        let keys: Vec<StreamKey> = if topic.requires_subject() {
            classification
                .subjects
                .iter()
                .map(|subject| StreamKey::new(wire_topic, Some(subject)))
                .collect()
        } else {
            vec![StreamKey::new(wire_topic, None)]
        };

        let mut ids = Vec::new();
        for key in keys {
            let Some(binding) = self.streams.get(&key) else {
                continue;
            };
            if binding.connection != connection {
                continue;
            }
            if let Some(id) = binding.unsubscribe_request.or(binding.subscribe_request) {
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
        }
        ids
    }

    fn resolve_request(
        &self,
        connection: ConnectionId,
        id: u64,
        classification: &Classification,
    ) -> Result<Vec<SyncEvent>, SyncError> {
        let Some(request) = self.requests.take(id) else {
            // Stale or locally forgotten id; the streams it covered are
            // gone, so there is nothing to reconcile.
            tracing::warn!(
                "{} response for unknown request {} on {}",
                self.spec.exchange,
                id,
                connection
            );
            return Ok(Vec::new());
        };
        self.check_owner(&request, connection)?;

        let events = match request.kind {
            RequestKind::Subscribe => {
                if classification.success {
                    let confirmed = self.streams.confirm_for_request(id);
                    tracing::info!(
                        "{} confirmed {} streams for request {}",
                        self.spec.exchange,
                        confirmed.len(),
                        id
                    );
                    grouped_events(confirmed, true, None, subscribed_event)
                } else {
                    let removed = self.streams.remove_for_request(id);
                    tracing::warn!(
                        "{} venue rejected subscribe {}: {:?} (sent {})",
                        self.spec.exchange,
                        id,
                        classification.error,
                        truncate(&request.payload, 256)
                    );
                    grouped_events(
                        removed,
                        false,
                        classification.error.clone(),
                        subscribed_event,
                    )
                }
            }
            RequestKind::Unsubscribe => {
                if classification.success {
                    let removed = self.streams.remove_for_unsubscribe(id);
                    grouped_events(removed, true, None, unsubscribed_event)
                } else {
                    let kept = self.streams.clear_unsubscribe_markers(id);
                    tracing::warn!(
                        "{} venue rejected unsubscribe {}: {:?}",
                        self.spec.exchange,
                        id,
                        classification.error
                    );
                    grouped_events(
                        kept,
                        false,
                        classification.error.clone(),
                        unsubscribed_event,
                    )
                }
            }
            RequestKind::Auth => {
                self.connections.complete_auth(
                    connection,
                    classification.success,
                    classification.error.clone(),
                );
                Vec::new()
            }
            RequestKind::Ping | RequestKind::Pong => Vec::new(),
        };
        Ok(events)
    }

    /// Updates only count when their stream is actually bound here; anything
    /// else is either a late frame after an unsubscribe (dropped quietly) or
    /// a frame on the wrong socket (protocol violation).
    fn handle_updates(
        &self,
        connection: ConnectionId,
        classification: Classification,
    ) -> Result<Vec<SyncEvent>, SyncError> {
        let Some(topic) = classification.topic else {
            tracing::warn!(
                "{} update frame without topic on {}",
                self.spec.exchange,
                connection
            );
            return Ok(Vec::new());
        };
        let wire_topic = self.spec.wire_topic(topic)?.to_string();

        let mut events = Vec::new();

        for record in classification.depth {
            let key = StreamKey::new(&wire_topic, Some(&record.symbol_inner));
            if !self.verify_binding(connection, &key)? {
                continue;
            }
            events.push(SyncEvent::DepthUpdate { topic, record });
        }

        if !classification.balances.is_empty() {
            let key = StreamKey::new(&wire_topic, None);
            if self.verify_binding(connection, &key)? {
                for record in classification.balances {
                    events.push(SyncEvent::BalanceUpdate { record });
                }
            }
        }

        Ok(events)
    }

    fn verify_binding(&self, connection: ConnectionId, key: &StreamKey) -> Result<bool, SyncError> {
        match self.streams.get(key) {
            Some(binding) if binding.connection == connection => Ok(true),
            Some(binding) => Err(SyncError::ProtocolViolation(format!(
                "update for {} arrived on {} but the stream is bound to {}",
                key, connection, binding.connection
            ))),
            None => {
                tracing::debug!(
                    "{} dropped update for unbound stream {} on {}",
                    self.spec.exchange,
                    key,
                    connection
                );
                Ok(false)
            }
        }
    }

    fn check_owner(
        &self,
        request: &TrackedRequest,
        connection: ConnectionId,
    ) -> Result<(), SyncError> {
        if request.connection != connection {
            return Err(SyncError::ProtocolViolation(format!(
                "request {} was sent on {} but answered on {}",
                request.id, request.connection, connection
            )));
        }
        Ok(())
    }
}

/// Char-safe prefix for logging arbitrary venue payloads.
fn truncate(raw: &str, limit: usize) -> &str {
    match raw.char_indices().nth(limit) {
        Some((idx, _)) => &raw[..idx],
        None => raw,
    }
}

fn subscribed_event(
    topic: Topic,
    subjects: Vec<String>,
    connection: ConnectionId,
    success: bool,
    error: Option<String>,
) -> SyncEvent {
    SyncEvent::Subscribed {
        topic,
        subjects,
        connection,
        success,
        error,
    }
}

fn unsubscribed_event(
    topic: Topic,
    subjects: Vec<String>,
    connection: ConnectionId,
    success: bool,
    error: Option<String>,
) -> SyncEvent {
    SyncEvent::Unsubscribed {
        topic,
        subjects,
        connection,
        success,
        error,
    }
}

/// Collapse per-stream bindings into one event per (topic, connection).
fn grouped_events<F>(
    bindings: Vec<StreamBinding>,
    success: bool,
    error: Option<String>,
    build: F,
) -> Vec<SyncEvent>
where
    F: Fn(Topic, Vec<String>, ConnectionId, bool, Option<String>) -> SyncEvent,
{
    let mut groups: HashMap<(Topic, ConnectionId), Vec<String>> = HashMap::new();
    for binding in bindings {
        groups
            .entry((binding.stream.topic, binding.connection))
            .or_default()
            .extend(binding.stream.subject.clone());
    }
    groups
        .into_iter()
        .map(|((topic, connection), subjects)| {
            build(topic, subjects, connection, success, error.clone())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::domain::events::ConnectionEvent;
    use crate::domain::ports::RateLimiter;
    use crate::domain::spec::{ChannelSpec, CodecError, WireCodec};
    use crate::domain::stream::Stream;
    use crate::infrastructure::socket::{SocketConnector, SocketWriter};
    use async_trait::async_trait;
    use hermes_core::{ChannelId, ExchangeId};
    use tokio::sync::mpsc;

    /// Codec for a venue that acknowledges with an event frame; the id is
    /// only echoed when the frame carries one.
    struct EventCodec;

    #[async_trait]
    impl WireCodec for EventCodec {
        fn classify(&self, raw: &str) -> Classification {
            let Ok(value) = serde_json::from_str::<serde_json::Value>(raw) else {
                return Classification::none();
            };
            if value.get("event").and_then(|e| e.as_str()) != Some("ack") {
                return Classification::none();
            }
            let subjects = value
                .get("symbol")
                .and_then(|s| s.as_str())
                .map(|s| vec![s.to_string()])
                .unwrap_or_default();
            Classification {
                kinds: vec![MessageKind::Response],
                request_id: value.get("id").and_then(|v| v.as_u64()),
                topic: Some(Topic::Depth),
                subjects,
                ..Classification::default()
            }
        }
        fn encode_subscribe(&self, _id: u64, _streams: &[Stream]) -> Result<String, CodecError> {
            Ok("{}".to_string())
        }
        fn encode_unsubscribe(&self, _id: u64, _streams: &[Stream]) -> Result<String, CodecError> {
            Ok("{}".to_string())
        }
    }

    struct NoopLimiter;

    #[async_trait]
    impl RateLimiter for NoopLimiter {
        async fn wait(&self, _exchange: &ExchangeId, _endpoint: &str) {}
        fn add_usage(&self, _exchange: &ExchangeId, _endpoint: &str) {}
    }

    struct UnreachableConnector;

    #[async_trait]
    impl SocketConnector for UnreachableConnector {
        async fn open(
            &self,
            _url: &str,
            _connection: ConnectionId,
            _events: mpsc::Sender<ConnectionEvent>,
        ) -> Result<SocketWriter, SyncError> {
            Err(SyncError::ChannelClosed)
        }
    }

    fn dispatcher() -> (MessageDispatcher, Arc<StreamTable>, Arc<RequestTable>) {
        let channel = ChannelId::new("market");
        let mut spec = ExchangeSpec::new("testex", Arc::new(EventCodec));
        spec.wire_topics.insert(Topic::Depth, "book".to_string());
        spec.channels.insert(Topic::Depth, channel.clone());
        spec.channel_specs
            .insert(channel, ChannelSpec::public("wss://example.test/ws"));
        let spec = Arc::new(spec);

        let (events, _rx) = mpsc::channel(8);
        let streams = Arc::new(StreamTable::new());
        let requests = Arc::new(RequestTable::new());
        let connections = Arc::new(ConnectionManager::new(
            spec.clone(),
            SyncConfig::default(),
            Arc::new(NoopLimiter),
            requests.clone(),
            Arc::new(UnreachableConnector),
            events,
        ));
        (
            MessageDispatcher::new(spec, connections, streams.clone(), requests.clone()),
            streams,
            requests,
        )
    }

    fn pending_depth_binding(
        streams: &StreamTable,
        requests: &RequestTable,
        connection: ConnectionId,
    ) -> u64 {
        let id = requests.next_id();
        requests.track(id, connection, RequestKind::Subscribe, "{}".to_string());
        streams.insert(StreamBinding::pending(
            Stream::new(Topic::Depth, "book", Some("BTCUSDT".to_string())),
            connection,
            id,
        ));
        id
    }

    #[tokio::test]
    async fn test_idless_confirmation_resolves_via_stream_table() {
        let (dispatcher, streams, requests) = dispatcher();
        let connection = ConnectionId(1);
        pending_depth_binding(&streams, &requests, connection);

        let events = dispatcher
            .dispatch(connection, r#"{"event":"ack","symbol":"BTCUSDT"}"#)
            .await
            .expect("dispatch");

        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            SyncEvent::Subscribed { success: true, .. }
        ));
        let key = StreamKey::new("book", Some("BTCUSDT"));
        assert!(streams.get(&key).expect("binding").is_confirmed());
        assert!(requests.is_empty());
    }

    #[tokio::test]
    async fn test_idless_reply_answers_the_unsubscribe_in_flight() {
        let (dispatcher, streams, requests) = dispatcher();
        let connection = ConnectionId(1);
        pending_depth_binding(&streams, &requests, connection);
        let unsub_id = requests.next_id();
        requests.track(unsub_id, connection, RequestKind::Unsubscribe, "{}".to_string());
        let key = StreamKey::new("book", Some("BTCUSDT"));
        streams.mark_unsubscribing(&key, unsub_id);

        let events = dispatcher
            .dispatch(connection, r#"{"event":"ack","symbol":"BTCUSDT"}"#)
            .await
            .expect("dispatch");

        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            SyncEvent::Unsubscribed { success: true, .. }
        ));
        assert!(streams.get(&key).is_none());
        // The superseded subscribe request stays tracked until the venue
        // answers it by id or its connection dies.
        assert_eq!(requests.len(), 1);
    }

    #[tokio::test]
    async fn test_response_on_wrong_connection_is_fatal() {
        let (dispatcher, streams, requests) = dispatcher();
        let id = pending_depth_binding(&streams, &requests, ConnectionId(1));

        let frame = format!(r#"{{"event":"ack","symbol":"BTCUSDT","id":{}}}"#, id);
        let result = dispatcher.dispatch(ConnectionId(2), &frame).await;
        assert!(matches!(result, Err(SyncError::ProtocolViolation(_))));
    }

    #[tokio::test]
    async fn test_uncorrelatable_response_is_dropped() {
        let (dispatcher, streams, requests) = dispatcher();
        // No binding for ETHUSDT exists, with or without an id.
        pending_depth_binding(&streams, &requests, ConnectionId(1));

        let events = dispatcher
            .dispatch(ConnectionId(1), r#"{"event":"ack","symbol":"ETHUSDT"}"#)
            .await
            .expect("dispatch");
        assert!(events.is_empty());
        assert_eq!(requests.len(), 1);
    }
}
