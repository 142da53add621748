//! Connection pool keyed by [`ConnectionId`].
//!
//! The manager owns the socket lifecycle: rate-limited dialing, one-message
//! authentication, keep-alive pings and the proactive lifetime timer. It
//! knows nothing about streams; the subscription pipeline decides which
//! connection carries what.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use hermes_core::ChannelId;

use crate::application::requests::RequestTable;
use crate::config::SyncConfig;
use crate::domain::events::{ConnectionEvent, ConnectionId};
use crate::domain::ports::{CONNECT_ENDPOINT, RateLimiter};
use crate::domain::request::RequestKind;
use crate::domain::spec::{AuthScheme, ExchangeSpec, PingStyle};
use crate::error::SyncError;
use crate::infrastructure::socket::{SocketConnector, SocketWriter};

struct ConnectionEntry {
    channel: ChannelId,
    writer: SocketWriter,
    opened_at: DateTime<Utc>,
    authenticated: bool,
    auth_waiter: Option<oneshot::Sender<(bool, Option<String>)>>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct ConnectionManager {
    spec: Arc<ExchangeSpec>,
    config: SyncConfig,
    limiter: Arc<dyn RateLimiter>,
    requests: Arc<RequestTable>,
    connector: Arc<dyn SocketConnector>,
    events: mpsc::Sender<ConnectionEvent>,
    // BTreeMap so iteration follows creation order; ids are monotonic.
    pool: Mutex<BTreeMap<ConnectionId, ConnectionEntry>>,
    next_id: AtomicU64,
}

impl ConnectionManager {
    pub fn new(
        spec: Arc<ExchangeSpec>,
        config: SyncConfig,
        limiter: Arc<dyn RateLimiter>,
        requests: Arc<RequestTable>,
        connector: Arc<dyn SocketConnector>,
        events: mpsc::Sender<ConnectionEvent>,
    ) -> Self {
        Self {
            spec,
            config,
            limiter,
            requests,
            connector,
            events,
            pool: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Opens a new connection on `channel`: resolves the url, waits for the
    /// rate limiter, dials, then authenticates if the channel wants it.
    /// The `Opened` event fires only once the connection is usable.
    pub async fn create(&self, channel: &ChannelId) -> Result<ConnectionId, SyncError> {
        let channel_spec = self.spec.channel_spec(channel)?.clone();

        {
            let pool = self.pool.lock();
            if pool.len() >= self.config.max_connections {
                return Err(SyncError::ConnectionLimit(self.config.max_connections));
            }
        }

        let url = self.spec.resolve_url(channel).await?;
        self.limiter.wait(&self.spec.exchange, CONNECT_ENDPOINT).await;

        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let writer = tokio::time::timeout(
            self.config.connect_timeout,
            self.connector.open(&url, id, self.events.clone()),
        )
        .await
        .map_err(|_| SyncError::Timeout("connect"))??;
        self.limiter.add_usage(&self.spec.exchange, CONNECT_ENDPOINT);

        let mut tasks = Vec::new();
        if !matches!(channel_spec.ping, PingStyle::Disabled) {
            tasks.push(self.spawn_keep_alive(id, writer.clone(), channel_spec.ping));
        }
        if let Some(lifetime) = self.config.connection_lifetime {
            let events = self.events.clone();
            tasks.push(tokio::spawn(async move {
                tokio::time::sleep(lifetime).await;
                let _ = events.send(ConnectionEvent::Expired { connection: id }).await;
            }));
        }

        let needs_auth = matches!(channel_spec.auth, AuthScheme::OneMessage);
        {
            let mut pool = self.pool.lock();
            pool.insert(
                id,
                ConnectionEntry {
                    channel: channel.clone(),
                    writer: writer.clone(),
                    opened_at: Utc::now(),
                    authenticated: !needs_auth,
                    auth_waiter: None,
                    tasks,
                },
            );
        }

        if needs_auth {
            if let Err(e) = self.authenticate(id, &writer).await {
                tracing::error!("{} {} authentication failed: {}", self.spec.exchange, id, e);
                self.clear(id).await;
                return Err(e);
            }
        }

        tracing::info!(
            "{} opened {} on channel {}",
            self.spec.exchange,
            id,
            channel
        );
        let _ = self
            .events
            .send(ConnectionEvent::Opened { connection: id })
            .await;
        Ok(id)
    }

    async fn authenticate(&self, id: ConnectionId, writer: &SocketWriter) -> Result<(), SyncError> {
        let auth_id = self.requests.next_id();
        let payload = match self.spec.codec.encode_auth(auth_id)? {
            Some(payload) => payload,
            None => {
                if let Some(entry) = self.pool.lock().get_mut(&id) {
                    entry.authenticated = true;
                }
                return Ok(());
            }
        };

        let (tx, rx) = oneshot::channel();
        {
            let mut pool = self.pool.lock();
            let entry = pool
                .get_mut(&id)
                .ok_or(SyncError::ConnectionNotFound(id))?;
            entry.auth_waiter = Some(tx);
        }
        self.requests
            .track(auth_id, id, RequestKind::Auth, payload.clone());
        writer.send_text(payload).await?;

        match tokio::time::timeout(self.config.auth_timeout, rx).await {
            Ok(Ok((true, _))) => Ok(()),
            Ok(Ok((false, error))) => Err(SyncError::AuthFailed(
                error.unwrap_or_else(|| "rejected by venue".to_string()),
            )),
            Ok(Err(_)) => Err(SyncError::AuthFailed(
                "connection lost during authentication".to_string(),
            )),
            Err(_) => {
                self.requests.forget(auth_id);
                if let Some(entry) = self.pool.lock().get_mut(&id) {
                    entry.auth_waiter = None;
                }
                Err(SyncError::Timeout("auth"))
            }
        }
    }

    /// Resolves a pending auth handshake; called by the dispatcher when the
    /// venue answers the login request.
    pub fn complete_auth(&self, id: ConnectionId, success: bool, error: Option<String>) {
        let waiter = {
            let mut pool = self.pool.lock();
            match pool.get_mut(&id) {
                Some(entry) => {
                    entry.authenticated = success;
                    entry.auth_waiter.take()
                }
                None => None,
            }
        };
        match waiter {
            Some(tx) => {
                let _ = tx.send((success, error));
            }
            None => {
                tracing::warn!("{} unsolicited auth result for {}", self.spec.exchange, id)
            }
        }
    }

    pub async fn send(&self, id: ConnectionId, payload: String) -> Result<(), SyncError> {
        let writer = {
            let pool = self.pool.lock();
            pool.get(&id)
                .ok_or(SyncError::ConnectionNotFound(id))?
                .writer
                .clone()
        };
        writer.send_text(payload).await
    }

    pub fn is_authenticated(&self, id: ConnectionId) -> bool {
        self.pool
            .lock()
            .get(&id)
            .map(|e| e.authenticated)
            .unwrap_or(false)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.pool.lock().contains_key(&id)
    }

    pub fn channel_of(&self, id: ConnectionId) -> Option<ChannelId> {
        self.pool.lock().get(&id).map(|e| e.channel.clone())
    }

    pub fn opened_at(&self, id: ConnectionId) -> Option<DateTime<Utc>> {
        self.pool.lock().get(&id).map(|e| e.opened_at)
    }

    /// Connections on `channel`, oldest first.
    pub fn connections_for_channel(&self, channel: &ChannelId) -> Vec<ConnectionId> {
        self.pool
            .lock()
            .iter()
            .filter(|(_, e)| &e.channel == channel)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn count(&self) -> usize {
        self.pool.lock().len()
    }

    /// Drops the connection: stops its background tasks and closes the
    /// socket. Safe to call twice; returns whether anything was removed.
    pub async fn clear(&self, id: ConnectionId) -> bool {
        let entry = self.pool.lock().remove(&id);
        match entry {
            Some(entry) => {
                for task in &entry.tasks {
                    task.abort();
                }
                entry.writer.close().await;
                tracing::info!("{} cleared {}", self.spec.exchange, id);
                true
            }
            None => false,
        }
    }

    pub async fn clear_all(&self) {
        let ids: Vec<ConnectionId> = self.pool.lock().keys().copied().collect();
        for id in ids {
            self.clear(id).await;
        }
    }

    fn spawn_keep_alive(
        &self,
        id: ConnectionId,
        writer: SocketWriter,
        style: PingStyle,
    ) -> JoinHandle<()> {
        let spec = self.spec.clone();
        let requests = self.requests.clone();
        let events = self.events.clone();
        let interval = self.config.ping_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // Payload pings the venue never answers would pile up in the
            // request table, so each tick forgets the previous one.
            let mut last_ping: Option<u64> = None;
            loop {
                ticker.tick().await;
                let result = match style {
                    PingStyle::Frame => writer.send_ping().await,
                    PingStyle::Payload => {
                        let ping_id = requests.next_id();
                        match spec.codec.encode_ping(ping_id) {
                            Ok(payload) => {
                                if let Some(previous) = last_ping.take() {
                                    requests.forget(previous);
                                }
                                requests.track(ping_id, id, RequestKind::Ping, payload.clone());
                                last_ping = Some(ping_id);
                                writer.send_text(payload).await
                            }
                            Err(e) => {
                                let _ = events
                                    .send(ConnectionEvent::PingFailed {
                                        connection: id,
                                        error: e.to_string(),
                                    })
                                    .await;
                                continue;
                            }
                        }
                    }
                    PingStyle::Disabled => return,
                };
                match result {
                    Ok(()) => {
                        let _ = events
                            .send(ConnectionEvent::PingSent { connection: id })
                            .await;
                    }
                    Err(SyncError::ChannelClosed) => return,
                    Err(e) => {
                        let _ = events
                            .send(ConnectionEvent::PingFailed {
                                connection: id,
                                error: e.to_string(),
                            })
                            .await;
                    }
                }
            }
        })
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        let pool = self.pool.lock();
        for entry in pool.values() {
            for task in &entry.tasks {
                task.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::Classification;
    use crate::domain::spec::{ChannelSpec, CodecError, WireCodec};
    use async_trait::async_trait;
    use hermes_core::{ExchangeId, Topic};

    struct NullCodec;

    #[async_trait]
    impl WireCodec for NullCodec {
        fn classify(&self, _raw: &str) -> Classification {
            Classification::none()
        }
        fn encode_subscribe(
            &self,
            _request_id: u64,
            _streams: &[crate::domain::stream::Stream],
        ) -> Result<String, CodecError> {
            Ok("{}".to_string())
        }
        fn encode_unsubscribe(
            &self,
            _request_id: u64,
            _streams: &[crate::domain::stream::Stream],
        ) -> Result<String, CodecError> {
            Ok("{}".to_string())
        }
    }

    struct NoopLimiter;

    #[async_trait]
    impl RateLimiter for NoopLimiter {
        async fn wait(&self, _exchange: &ExchangeId, _endpoint: &str) {}
        fn add_usage(&self, _exchange: &ExchangeId, _endpoint: &str) {}
    }

    struct RefusingConnector;

    #[async_trait]
    impl SocketConnector for RefusingConnector {
        async fn open(
            &self,
            _url: &str,
            _connection: ConnectionId,
            _events: mpsc::Sender<ConnectionEvent>,
        ) -> Result<SocketWriter, SyncError> {
            Err(SyncError::ProtocolViolation("refused".to_string()))
        }
    }

    fn test_spec() -> Arc<ExchangeSpec> {
        let channel = ChannelId::new("spot");
        let mut spec = ExchangeSpec::new("testex", Arc::new(NullCodec));
        spec.wire_topics.insert(Topic::Depth, "depth".to_string());
        spec.channels.insert(Topic::Depth, channel.clone());
        spec.channel_specs
            .insert(channel, ChannelSpec::public("wss://example.test/ws"));
        Arc::new(spec)
    }

    #[tokio::test]
    async fn test_create_propagates_connector_failure() {
        let (tx, _rx) = mpsc::channel(16);
        let manager = ConnectionManager::new(
            test_spec(),
            SyncConfig::default(),
            Arc::new(NoopLimiter),
            Arc::new(RequestTable::default()),
            Arc::new(RefusingConnector),
            tx,
        );
        let result = manager.create(&ChannelId::new("spot")).await;
        assert!(result.is_err());
        assert_eq!(manager.count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_channel_is_rejected() {
        let (tx, _rx) = mpsc::channel(16);
        let manager = ConnectionManager::new(
            test_spec(),
            SyncConfig::default(),
            Arc::new(NoopLimiter),
            Arc::new(RequestTable::default()),
            Arc::new(RefusingConnector),
            tx,
        );
        let result = manager.create(&ChannelId::new("missing")).await;
        assert!(matches!(result, Err(SyncError::ProtocolViolation(_))));
    }
}
