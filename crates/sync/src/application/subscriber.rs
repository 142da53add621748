//! Subscription pipeline
//!
//! Subscribing is a six-stage pass: distribute streams into spare connection
//! capacity, synthesize confirmations for presubscribed topics, build chunked
//! payloads, track the requests optimistically, dispatch under the rate
//! limiter, and reconcile anything the wire refused. Unsubscribing partitions
//! bindings by state first, because a stream that never confirmed has nothing
//! to say to the venue.

use std::collections::HashMap;
use std::sync::Arc;

use hermes_core::{ChannelId, StreamKey, Topic};

use crate::application::requests::RequestTable;
use crate::application::streams::StreamTable;
use crate::domain::events::{ConnectionId, SyncEvent};
use crate::domain::ports::{RateLimiter, send_endpoint};
use crate::domain::request::RequestKind;
use crate::domain::spec::{ChannelSpec, ExchangeSpec};
use crate::domain::stream::{Stream, StreamBinding};
use crate::error::SyncError;
use crate::infrastructure::connection::ConnectionManager;

/// What a subscribe or unsubscribe pass actually achieved.
///
/// `succeeded` holds streams whose payload went out (confirmation still
/// pending) or that completed locally; `failed` holds streams the pass could
/// not place, with the reason. `events` carries synthesized notifications
/// for transitions that never touch the wire.
#[derive(Debug, Default)]
pub struct SubscribeOutcome {
    pub succeeded: Vec<Stream>,
    pub failed: Vec<(Stream, String)>,
    pub events: Vec<SyncEvent>,
}

impl SubscribeOutcome {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct SubscriptionPipeline {
    spec: Arc<ExchangeSpec>,
    connections: Arc<ConnectionManager>,
    streams: Arc<StreamTable>,
    requests: Arc<RequestTable>,
    limiter: Arc<dyn RateLimiter>,
}

impl SubscriptionPipeline {
    pub fn new(
        spec: Arc<ExchangeSpec>,
        connections: Arc<ConnectionManager>,
        streams: Arc<StreamTable>,
        requests: Arc<RequestTable>,
        limiter: Arc<dyn RateLimiter>,
    ) -> Self {
        Self {
            spec,
            connections,
            streams,
            requests,
            limiter,
        }
    }

    /// Subscribe `subjects` to `topic`. Best-effort across connections: a
    /// connection that cannot be opened or written fails only the streams
    /// assigned to it.
    pub async fn subscribe(
        &self,
        topic: Topic,
        subjects: &[String],
    ) -> Result<SubscribeOutcome, SyncError> {
        let mut outcome = SubscribeOutcome::default();

        let wanted = self.collect_new_streams(topic, subjects)?;
        if wanted.is_empty() {
            return Ok(outcome);
        }

        let channel = self.spec.channel_for(topic)?.clone();
        let channel_spec = self.spec.channel_spec(&channel)?.clone();

        if channel_spec.presubscribed.contains(&topic) {
            self.subscribe_presubscribed(topic, wanted, &channel, &channel_spec, &mut outcome)
                .await;
            return Ok(outcome);
        }

        let assignments = self
            .distribute(wanted, &channel, &channel_spec, &mut outcome)
            .await;

        for (connection, group) in assignments {
            for chunk in group.chunks(channel_spec.max_streams_per_payload) {
                self.dispatch_subscribe(connection, chunk, &mut outcome).await;
            }
        }

        Ok(outcome)
    }

    /// Unsubscribe `subjects` from `topic`. Bindings are partitioned by
    /// state: unbound keys are skipped, never-confirmed and presubscribed
    /// bindings are removed locally, confirmed ones get a wire exchange.
    pub async fn unsubscribe(
        &self,
        topic: Topic,
        subjects: &[String],
    ) -> Result<SubscribeOutcome, SyncError> {
        let mut outcome = SubscribeOutcome::default();

        let channel = self.spec.channel_for(topic)?.clone();
        let channel_spec = self.spec.channel_spec(&channel)?.clone();
        let presubscribed = channel_spec.presubscribed.contains(&topic);

        let mut confirmed: HashMap<ConnectionId, Vec<StreamBinding>> = HashMap::new();

        for stream in self.requested_streams(topic, subjects)? {
            let key = stream.key();
            let Some(binding) = self.streams.get(&key) else {
                tracing::debug!("{} unsubscribe skipped, {} not bound", self.spec.exchange, key);
                continue;
            };
            if binding.is_unsubscribing() {
                continue;
            }

            if presubscribed || !binding.is_confirmed() {
                self.remove_locally(&key, binding, &mut outcome);
                continue;
            }

            confirmed.entry(binding.connection).or_default().push(binding);
        }

        for (connection, bindings) in confirmed {
            for chunk in bindings.chunks(channel_spec.max_streams_per_payload) {
                self.dispatch_unsubscribe(connection, chunk, &mut outcome).await;
            }
        }

        Ok(outcome)
    }

    /// Streams requested by the caller, before any table lookups. Topics
    /// without subjects collapse to one stream.
    fn requested_streams(&self, topic: Topic, subjects: &[String]) -> Result<Vec<Stream>, SyncError> {
        if !topic.requires_subject() {
            return Ok(vec![self.spec.stream(topic, None)?]);
        }
        let mut seen = std::collections::HashSet::new();
        let mut streams = Vec::with_capacity(subjects.len());
        for subject in subjects {
            let stream = self.spec.stream(topic, Some(subject.clone()))?;
            if seen.insert(stream.key()) {
                streams.push(stream);
            }
        }
        Ok(streams)
    }

    /// Requested streams that are not yet bound. A binding with a pending
    /// unsubscribe does not count: resubscribing over it is how a resync
    /// cycle rebinds, and the upsert makes the dying binding unreachable for
    /// its own unsubscribe confirmation.
    fn collect_new_streams(&self, topic: Topic, subjects: &[String]) -> Result<Vec<Stream>, SyncError> {
        Ok(self
            .requested_streams(topic, subjects)?
            .into_iter()
            .filter(|s| match self.streams.get(&s.key()) {
                None => true,
                Some(binding) if binding.is_unsubscribing() => true,
                Some(_) => {
                    tracing::debug!("{} already bound, skipping {}", self.spec.exchange, s);
                    false
                }
            })
            .collect())
    }

    /// Presubscribed topics are live the moment a connection on their channel
    /// exists; no payload is exchanged.
    async fn subscribe_presubscribed(
        &self,
        topic: Topic,
        wanted: Vec<Stream>,
        channel: &ChannelId,
        channel_spec: &ChannelSpec,
        outcome: &mut SubscribeOutcome,
    ) {
        let connection = match self.connections.connections_for_channel(channel).first() {
            Some(id) => *id,
            None => match self.connections.create(channel).await {
                Ok(id) => {
                    self.synthesize_presubscribed(id, channel_spec, outcome);
                    // The loop below sees these as bound and skips them.
                    id
                }
                Err(e) => {
                    let reason = e.to_string();
                    for stream in wanted {
                        outcome.failed.push((stream, reason.clone()));
                    }
                    return;
                }
            },
        };

        for stream in wanted {
            if self.streams.contains(&stream.key()) {
                outcome.succeeded.push(stream);
                continue;
            }
            let subjects = stream.subject.clone().into_iter().collect();
            self.streams
                .insert(StreamBinding::confirmed(stream.clone(), connection));
            outcome.events.push(SyncEvent::Subscribed {
                topic,
                subjects,
                connection,
                success: true,
                error: None,
            });
            outcome.succeeded.push(stream);
        }
    }

    /// Stage one: pack streams into spare capacity, oldest connection first,
    /// then open just enough new connections for the leftovers.
    async fn distribute(
        &self,
        wanted: Vec<Stream>,
        channel: &ChannelId,
        channel_spec: &ChannelSpec,
        outcome: &mut SubscribeOutcome,
    ) -> Vec<(ConnectionId, Vec<Stream>)> {
        let mut assignments: Vec<(ConnectionId, Vec<Stream>)> = Vec::new();
        let mut pending = wanted;
        pending.reverse(); // pop() consumes in request order

        for connection in self.connections.connections_for_channel(channel) {
            if pending.is_empty() {
                break;
            }
            let used = self.streams.count_for_connection(connection);
            let spare = channel_spec.streams_limit.saturating_sub(used);
            if spare == 0 {
                continue;
            }
            let mut group = Vec::with_capacity(spare.min(pending.len()));
            for _ in 0..spare {
                match pending.pop() {
                    Some(stream) => group.push(stream),
                    None => break,
                }
            }
            if !group.is_empty() {
                assignments.push((connection, group));
            }
        }

        while !pending.is_empty() {
            match self.connections.create(channel).await {
                Ok(connection) => {
                    self.synthesize_presubscribed(connection, channel_spec, outcome);
                    // Presubscribed bindings occupy slots on the fresh
                    // connection too.
                    let used = self.streams.count_for_connection(connection);
                    let take = channel_spec
                        .streams_limit
                        .saturating_sub(used)
                        .min(pending.len());
                    if take == 0 {
                        let reason = format!(
                            "channel {} has no spare capacity on a fresh connection",
                            channel
                        );
                        for stream in pending.drain(..) {
                            outcome.failed.push((stream, reason.clone()));
                        }
                        break;
                    }
                    let mut group = Vec::with_capacity(take);
                    for _ in 0..take {
                        match pending.pop() {
                            Some(stream) => group.push(stream),
                            None => break,
                        }
                    }
                    assignments.push((connection, group));
                }
                Err(e) => {
                    tracing::error!(
                        "{} could not open connection on {}: {}",
                        self.spec.exchange,
                        channel,
                        e
                    );
                    let reason = e.to_string();
                    for stream in pending.drain(..) {
                        outcome.failed.push((stream, reason.clone()));
                    }
                }
            }
        }

        assignments
    }

    /// A fresh connection on a channel with presubscribed topics starts out
    /// already subscribed to them; record that so capacity and dispatch agree
    /// with the venue.
    fn synthesize_presubscribed(
        &self,
        connection: ConnectionId,
        channel_spec: &ChannelSpec,
        outcome: &mut SubscribeOutcome,
    ) {
        for &topic in &channel_spec.presubscribed {
            if topic.requires_subject() {
                // Subject-scoped presubscriptions cannot be synthesized
                // blind; the subjects arrive with the subscribe call.
                continue;
            }
            let stream = match self.spec.stream(topic, None) {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!("{} presubscribed topic unmapped: {}", self.spec.exchange, e);
                    continue;
                }
            };
            if self.streams.contains(&stream.key()) {
                continue;
            }
            self.streams
                .insert(StreamBinding::confirmed(stream, connection));
            outcome.events.push(SyncEvent::Subscribed {
                topic,
                subjects: Vec::new(),
                connection,
                success: true,
                error: None,
            });
        }
    }

    /// Stages three to six for one subscribe chunk: encode, sign if needed,
    /// track optimistically, dispatch, and roll back on a failed send.
    async fn dispatch_subscribe(
        &self,
        connection: ConnectionId,
        chunk: &[Stream],
        outcome: &mut SubscribeOutcome,
    ) {
        let request_id = self.requests.next_id();
        let payload = match self.encode_subscribe(request_id, chunk) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!("{} subscribe encode failed: {}", self.spec.exchange, e);
                let reason = e.to_string();
                for stream in chunk {
                    outcome.failed.push((stream.clone(), reason.clone()));
                }
                return;
            }
        };

        self.requests
            .track(request_id, connection, RequestKind::Subscribe, payload.clone());
        for stream in chunk {
            self.streams
                .insert(StreamBinding::pending(stream.clone(), connection, request_id));
        }

        match self.dispatch(connection, payload).await {
            Ok(()) => {
                tracing::debug!(
                    "{} subscribe request {} covers {} streams on {}",
                    self.spec.exchange,
                    request_id,
                    chunk.len(),
                    connection
                );
                outcome.succeeded.extend(chunk.iter().cloned());
            }
            Err(e) => {
                self.streams.remove_for_request(request_id);
                self.requests.forget(request_id);
                let reason = e.to_string();
                tracing::warn!(
                    "{} subscribe send failed on {}: {}",
                    self.spec.exchange,
                    connection,
                    reason
                );
                for stream in chunk {
                    outcome.failed.push((stream.clone(), reason.clone()));
                }
            }
        }
    }

    async fn dispatch_unsubscribe(
        &self,
        connection: ConnectionId,
        chunk: &[StreamBinding],
        outcome: &mut SubscribeOutcome,
    ) {
        let streams: Vec<Stream> = chunk.iter().map(|b| b.stream.clone()).collect();
        let request_id = self.requests.next_id();
        let payload = match self.encode_unsubscribe(request_id, &streams) {
            Ok(payload) => payload,
            Err(e) => {
                let reason = e.to_string();
                for stream in streams {
                    outcome.failed.push((stream, reason.clone()));
                }
                return;
            }
        };

        self.requests
            .track(request_id, connection, RequestKind::Unsubscribe, payload.clone());
        for binding in chunk {
            self.streams.mark_unsubscribing(&binding.key(), request_id);
        }

        match self.dispatch(connection, payload).await {
            Ok(()) => outcome.succeeded.extend(streams),
            Err(e) => {
                self.streams.clear_unsubscribe_markers(request_id);
                self.requests.forget(request_id);
                let reason = e.to_string();
                for stream in streams {
                    outcome.failed.push((stream, reason.clone()));
                }
            }
        }
    }

    /// A never-confirmed or presubscribed binding dies without a wire
    /// exchange. If it was the last stream on its pending subscribe request,
    /// the request id is forgotten too, so a late venue reply cannot revive
    /// it; any resubscribe then runs under a fresh id.
    fn remove_locally(
        &self,
        key: &StreamKey,
        binding: StreamBinding,
        outcome: &mut SubscribeOutcome,
    ) {
        self.streams.remove(key);
        if let Some(request_id) = binding.subscribe_request {
            if !self.streams.has_subscribe_request(request_id) {
                self.requests.forget(request_id);
            }
        }
        outcome.events.push(SyncEvent::Unsubscribed {
            topic: binding.stream.topic,
            subjects: binding.stream.subject.clone().into_iter().collect(),
            connection: binding.connection,
            success: true,
            error: None,
        });
        outcome.succeeded.push(binding.stream);
    }

    fn encode_subscribe(&self, request_id: u64, chunk: &[Stream]) -> Result<String, SyncError> {
        let payload = self.spec.codec.encode_subscribe(request_id, chunk)?;
        if self.spec.requires_signing(chunk) {
            return Ok(self.spec.codec.sign(payload)?);
        }
        Ok(payload)
    }

    fn encode_unsubscribe(&self, request_id: u64, chunk: &[Stream]) -> Result<String, SyncError> {
        let payload = self.spec.codec.encode_unsubscribe(request_id, chunk)?;
        if self.spec.requires_signing(chunk) {
            return Ok(self.spec.codec.sign(payload)?);
        }
        Ok(payload)
    }

    /// Rate-limited send with the authentication guard in front.
    async fn dispatch(&self, connection: ConnectionId, payload: String) -> Result<(), SyncError> {
        if !self.connections.is_authenticated(connection) {
            return Err(SyncError::NotAuthenticated(connection));
        }
        let endpoint = send_endpoint(connection);
        self.limiter.wait(&self.spec.exchange, &endpoint).await;
        self.connections.send(connection, payload).await?;
        self.limiter.add_usage(&self.spec.exchange, &endpoint);
        Ok(())
    }
}
