//! Engine facade
//!
//! One `SyncEngine` per venue. It owns every moving part: the connection
//! pool, the subscription pipeline, the dispatcher, the per-subject queues
//! and both reconciliation engines. Three background loops drive it: the
//! connection-event loop (frames in, lifecycle out), the resync loop
//! (snapshot seeding and gap recovery) and the flush timers. Consumers see
//! one ordered stream of [`SyncEvent`]s per engine.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use hermes_core::{BalanceRecord, ChannelId, DepthRecord, ExchangeId, Topic};
use hermes_queue::{SubjectHandler, SubjectQueues, Verdict};

use crate::application::balances::{BalanceEngine, BalanceOutcome};
use crate::application::depth::{DepthEngine, DepthOutcome};
use crate::application::dispatcher::MessageDispatcher;
use crate::application::requests::RequestTable;
use crate::application::streams::StreamTable;
use crate::application::subscriber::{SubscribeOutcome, SubscriptionPipeline};
use crate::config::SyncConfig;
use crate::domain::events::{ConnectionEvent, ConnectionId, SyncEvent};
use crate::domain::ports::{MarketStore, RateLimiter, SnapshotFetcher};
use crate::domain::spec::ExchangeSpec;
use crate::domain::stream::StreamBinding;
use crate::error::SyncError;
use crate::infrastructure::connection::ConnectionManager;
use crate::infrastructure::socket::SocketConnector;
use crate::util::retry::retry;

/// Depth event as queued. The unified topic rides along so a resync command
/// knows which stream to rebuild.
#[derive(Debug, Clone)]
struct QueuedDepth {
    topic: Topic,
    record: DepthRecord,
}

/// Self-heal work sent from queue handlers to the resync loop.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ResyncCommand {
    /// Seed a missing book from the snapshot port.
    SeedDepth { topic: Topic, symbol_inner: String },
    /// Unsubscribe, resubscribe and reseed after a sequence gap.
    CycleDepth { topic: Topic, symbol_inner: String },
    /// Seed every balance account from the snapshot port.
    SeedBalance,
}

impl ResyncCommand {
    fn key(&self) -> String {
        match self {
            ResyncCommand::SeedDepth { symbol_inner, .. } => format!("seed:{}", symbol_inner),
            ResyncCommand::CycleDepth { symbol_inner, .. } => format!("cycle:{}", symbol_inner),
            ResyncCommand::SeedBalance => "balance".to_string(),
        }
    }
}

/// Deduplicating sender for resync commands. A command already queued for
/// the same key is not queued twice, which is what keeps one gap to exactly
/// one recovery cycle.
#[derive(Clone)]
struct ResyncRequester {
    tx: mpsc::Sender<ResyncCommand>,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl ResyncRequester {
    fn new(tx: mpsc::Sender<ResyncCommand>) -> Self {
        Self {
            tx,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    async fn request(&self, command: ResyncCommand) {
        let key = command.key();
        if !self.in_flight.lock().insert(key.clone()) {
            return;
        }
        if self.tx.send(command).await.is_err() {
            self.in_flight.lock().remove(&key);
        }
    }

    /// Mark a command as picked up; the next request for its key is live
    /// again.
    fn started(&self, command: &ResyncCommand) {
        self.in_flight.lock().remove(&command.key());
    }
}

pub struct SyncEngine {
    spec: Arc<ExchangeSpec>,
    config: SyncConfig,
    connections: Arc<ConnectionManager>,
    streams: Arc<StreamTable>,
    requests: Arc<RequestTable>,
    pipeline: SubscriptionPipeline,
    dispatcher: MessageDispatcher,
    depth: Arc<DepthEngine>,
    balances: Arc<BalanceEngine>,
    depth_queues: Arc<SubjectQueues<QueuedDepth>>,
    balance_queues: Arc<SubjectQueues<BalanceRecord>>,
    store: Arc<dyn MarketStore>,
    fetcher: Arc<dyn SnapshotFetcher>,
    consumer: mpsc::Sender<SyncEvent>,
    resync: ResyncRequester,
    /// Venue symbol -> unified symbol, warmed from the store.
    symbol_map: Arc<DashMap<String, String>>,
    event_rx: Mutex<Option<mpsc::Receiver<ConnectionEvent>>>,
    resync_rx: Mutex<Option<mpsc::Receiver<ResyncCommand>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncEngine {
    /// Wire up a full engine for one venue. The returned receiver is the
    /// consumer's view: every unified event this engine produces.
    pub fn new(
        spec: ExchangeSpec,
        config: SyncConfig,
        limiter: Arc<dyn RateLimiter>,
        store: Arc<dyn MarketStore>,
        fetcher: Arc<dyn SnapshotFetcher>,
        connector: Arc<dyn SocketConnector>,
    ) -> (Arc<Self>, mpsc::Receiver<SyncEvent>) {
        let spec = Arc::new(spec);
        let (event_tx, event_rx) = mpsc::channel::<ConnectionEvent>(1024);
        let (resync_tx, resync_rx) = mpsc::channel::<ResyncCommand>(64);
        let (consumer_tx, consumer_rx) = mpsc::channel::<SyncEvent>(1024);

        let streams = Arc::new(StreamTable::new());
        let requests = Arc::new(RequestTable::new());
        let connections = Arc::new(ConnectionManager::new(
            spec.clone(),
            config.clone(),
            limiter.clone(),
            requests.clone(),
            connector,
            event_tx,
        ));
        let pipeline = SubscriptionPipeline::new(
            spec.clone(),
            connections.clone(),
            streams.clone(),
            requests.clone(),
            limiter,
        );
        let dispatcher = MessageDispatcher::new(
            spec.clone(),
            connections.clone(),
            streams.clone(),
            requests.clone(),
        );

        let depth = Arc::new(DepthEngine::new(spec.clone(), config.max_depth_latency));
        let balances = Arc::new(BalanceEngine::new(spec.clone()));
        let resync = ResyncRequester::new(resync_tx);

        let depth_queues = Arc::new(SubjectQueues::new(depth_handler(
            depth.clone(),
            resync.clone(),
            consumer_tx.clone(),
        )));
        let balance_queues = Arc::new(SubjectQueues::new(balance_handler(
            balances.clone(),
            resync.clone(),
            consumer_tx.clone(),
        )));

        let engine = Arc::new(SyncEngine {
            spec,
            config,
            connections,
            streams,
            requests,
            pipeline,
            dispatcher,
            depth,
            balances,
            depth_queues,
            balance_queues,
            store,
            fetcher,
            consumer: consumer_tx,
            resync,
            symbol_map: Arc::new(DashMap::new()),
            event_rx: Mutex::new(Some(event_rx)),
            resync_rx: Mutex::new(Some(resync_rx)),
            tasks: Mutex::new(Vec::new()),
        });
        (engine, consumer_rx)
    }

    pub fn exchange(&self) -> &ExchangeId {
        &self.spec.exchange
    }

    /// Validate the venue spec, warm the symbol cache and spawn the
    /// background loops. Calling it again is a no-op.
    pub async fn initialize(self: &Arc<Self>) -> Result<(), SyncError> {
        self.spec.validate()?;

        match self.store.market_symbols(&self.spec.exchange, &[]).await {
            Ok(symbols) => {
                for symbol in symbols {
                    self.symbol_map.insert(symbol.symbol_inner, symbol.symbol);
                }
            }
            Err(e) => {
                // Symbols resolve lazily at flush time; a cold cache only
                // delays rows, it does not lose them.
                tracing::warn!("{} symbol warmup failed: {}", self.spec.exchange, e);
            }
        }

        let event_rx = match self.event_rx.lock().take() {
            Some(rx) => rx,
            None => return Ok(()),
        };
        let resync_rx = match self.resync_rx.lock().take() {
            Some(rx) => rx,
            None => return Ok(()),
        };

        let mut tasks = self.tasks.lock();
        let engine = self.clone();
        tasks.push(tokio::spawn(
            async move { engine.event_loop(event_rx).await },
        ));
        let engine = self.clone();
        tasks.push(tokio::spawn(async move {
            engine.resync_loop(resync_rx).await
        }));
        let engine = self.clone();
        tasks.push(tokio::spawn(async move { engine.depth_flush_loop().await }));
        let engine = self.clone();
        tasks.push(tokio::spawn(
            async move { engine.balance_flush_loop().await },
        ));

        tracing::info!("{} engine initialized", self.spec.exchange);
        Ok(())
    }

    /// Pre-warm the pool: ensure one connection exists on every declared
    /// channel. Subscribing opens connections on demand anyway; this just
    /// front-loads the handshakes.
    pub async fn open(&self) -> Result<(), SyncError> {
        let mut channels: Vec<ChannelId> = self.spec.channel_specs.keys().cloned().collect();
        channels.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        for channel in channels {
            if self.connections.connections_for_channel(&channel).is_empty() {
                self.connections.create(&channel).await?;
            }
        }
        Ok(())
    }

    /// Tear everything down: sockets, queues, loops. Cached books and
    /// balances are dropped with the engine.
    pub async fn close(&self) {
        self.connections.clear_all().await;
        self.depth_queues.close_all();
        self.balance_queues.close_all();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        tracing::info!("{} engine closed", self.spec.exchange);
    }

    pub async fn subscribe(
        &self,
        topic: Topic,
        subjects: &[String],
    ) -> Result<SubscribeOutcome, SyncError> {
        let outcome = self.pipeline.subscribe(topic, subjects).await?;
        self.route_events(outcome.events.clone()).await;
        Ok(outcome)
    }

    pub async fn unsubscribe(
        &self,
        topic: Topic,
        subjects: &[String],
    ) -> Result<SubscribeOutcome, SyncError> {
        let outcome = self.pipeline.unsubscribe(topic, subjects).await?;
        self.route_events(outcome.events.clone()).await;
        Ok(outcome)
    }

    /// Current bindings for one topic, confirmed or pending.
    pub fn active_streams(&self, topic: Topic) -> Vec<StreamBinding> {
        self.streams
            .all()
            .into_iter()
            .filter(|b| b.stream.topic == topic)
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.count()
    }

    /// Buffered depth events across all subjects.
    pub fn depth_backlog(&self) -> usize {
        self.depth_queues.buffered_count()
    }

    /// Buffered balance events across all accounts.
    pub fn balance_backlog(&self) -> usize {
        self.balance_queues.buffered_count()
    }

    async fn event_loop(self: Arc<Self>, mut rx: mpsc::Receiver<ConnectionEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                ConnectionEvent::Opened { connection } => {
                    self.route_events(vec![SyncEvent::ConnectionOpened { connection }])
                        .await;
                }
                ConnectionEvent::Frame { connection, text } => {
                    match self.dispatcher.dispatch(connection, &text).await {
                        Ok(events) => self.route_events(events).await,
                        Err(e) => {
                            tracing::error!(
                                "{} dispatch failed on {}: {}",
                                self.spec.exchange,
                                connection,
                                e
                            );
                        }
                    }
                }
                ConnectionEvent::PongReceived { connection } => {
                    tracing::trace!("{} pong on {}", self.spec.exchange, connection);
                }
                ConnectionEvent::PingSent { connection } => {
                    tracing::trace!("{} ping on {}", self.spec.exchange, connection);
                }
                ConnectionEvent::PingFailed { connection, error } => {
                    tracing::warn!(
                        "{} keep-alive failed on {}: {}",
                        self.spec.exchange,
                        connection,
                        error
                    );
                }
                ConnectionEvent::Closed { connection, reason } => {
                    self.handle_disconnect(connection, reason, false).await;
                }
                ConnectionEvent::Error { connection, error } => {
                    tracing::warn!(
                        "{} transport error on {}: {}",
                        self.spec.exchange,
                        connection,
                        error
                    );
                    self.handle_disconnect(connection, error, false).await;
                }
                ConnectionEvent::Expired { connection } => {
                    self.route_events(vec![SyncEvent::ConnectionExpired { connection }])
                        .await;
                    self.handle_disconnect(connection, "lifetime elapsed".to_string(), true)
                        .await;
                }
            }
        }
    }

    /// Apply engine-side reactions to a batch of events, then forward them.
    /// Updates detour through the subject queues and reach the consumer only
    /// after the reconciliation engine applied them.
    async fn route_events(&self, events: Vec<SyncEvent>) {
        for event in events {
            match &event {
                SyncEvent::DepthUpdate { topic, record } => {
                    let queued = QueuedDepth {
                        topic: *topic,
                        record: record.clone(),
                    };
                    if let Err(e) = self.depth_queues.enqueue(&record.symbol_inner, queued) {
                        tracing::warn!(
                            "{} depth queue rejected {}: {}",
                            self.spec.exchange,
                            record.symbol_inner,
                            e
                        );
                    }
                    continue;
                }
                SyncEvent::BalanceUpdate { record } => {
                    if let Err(e) = self
                        .balance_queues
                        .enqueue(&record.account_type, record.clone())
                    {
                        tracing::warn!(
                            "{} balance queue rejected {}: {}",
                            self.spec.exchange,
                            record.account_type,
                            e
                        );
                    }
                    continue;
                }
                SyncEvent::Subscribed {
                    topic: Topic::Balance,
                    success: true,
                    ..
                } => {
                    // A live balance stream without a baseline is useless;
                    // seed it now instead of waiting for the first delta to
                    // park.
                    self.resync.request(ResyncCommand::SeedBalance).await;
                }
                SyncEvent::Unsubscribed {
                    topic,
                    subjects,
                    success: true,
                    ..
                } if topic.is_depth() => {
                    self.cleanup_depth_subjects(subjects).await;
                }
                SyncEvent::Unsubscribed {
                    topic: Topic::Balance,
                    success: true,
                    ..
                } => {
                    self.balances.clear();
                    for account in self.balance_queues.subjects() {
                        self.balance_queues.remove(&account);
                    }
                }
                _ => {}
            }
            let _ = self.consumer.send(event).await;
        }
    }

    /// Shared teardown for closes, transport errors and expiry. `rebuild`
    /// re-subscribes the orphaned streams elsewhere (expiry self-heal);
    /// unexpected closes leave that decision to the consumer.
    async fn handle_disconnect(&self, connection: ConnectionId, reason: String, rebuild: bool) {
        let existed = self.connections.clear(connection).await;
        let orphaned = self.streams.clear_connection(connection);
        let swept = self.requests.clear_connection(connection);
        if !existed && orphaned.is_empty() && swept.is_empty() {
            return;
        }

        tracing::info!(
            "{} {} closed ({}): {} streams orphaned, {} requests swept",
            self.spec.exchange,
            connection,
            reason,
            orphaned.len(),
            swept.len()
        );
        self.route_events(vec![SyncEvent::ConnectionClosed { connection, reason }])
            .await;

        if !rebuild {
            return;
        }

        let mut by_topic: HashMap<Topic, Vec<String>> = HashMap::new();
        for binding in orphaned {
            if binding.is_unsubscribing() {
                continue;
            }
            by_topic
                .entry(binding.stream.topic)
                .or_default()
                .extend(binding.stream.subject);
        }
        for (topic, subjects) in by_topic {
            match self.pipeline.subscribe(topic, &subjects).await {
                Ok(outcome) => {
                    if !outcome.failed.is_empty() {
                        tracing::error!(
                            "{} rebuild after {} left {} streams unbound",
                            self.spec.exchange,
                            connection,
                            outcome.failed.len()
                        );
                    }
                    self.route_events(outcome.events).await;
                }
                Err(e) => {
                    tracing::error!(
                        "{} rebuild after {} failed: {}",
                        self.spec.exchange,
                        connection,
                        e
                    );
                }
            }
        }
    }

    /// An unsubscribed depth subject keeps nothing: cached book, queue
    /// worker and persisted row all go.
    async fn cleanup_depth_subjects(&self, subjects: &[String]) {
        let mut symbols = Vec::new();
        for subject in subjects {
            self.depth.remove(subject);
            self.depth_queues.remove(subject);
            if let Some(symbol) = self.symbol_map.get(subject) {
                symbols.push(symbol.value().clone());
            }
        }
        if symbols.is_empty() {
            return;
        }
        if let Err(e) = self.store.delete_order_books(&self.spec.exchange, &symbols).await {
            tracing::warn!(
                "{} could not delete order books: {}",
                self.spec.exchange,
                e
            );
        }
    }

    async fn resync_loop(self: Arc<Self>, mut rx: mpsc::Receiver<ResyncCommand>) {
        while let Some(command) = rx.recv().await {
            self.resync.started(&command);
            match command {
                ResyncCommand::SeedDepth {
                    topic,
                    symbol_inner,
                } => self.seed_depth(topic, &symbol_inner).await,
                ResyncCommand::CycleDepth {
                    topic,
                    symbol_inner,
                } => self.cycle_depth(topic, &symbol_inner).await,
                ResyncCommand::SeedBalance => self.seed_balances().await,
            }
        }
    }

    /// Fetch a fresh snapshot, put it at the head of the subject's queue and
    /// resume it. On exhausted retries the command is re-queued; the subject
    /// stays parked until seeding succeeds.
    async fn seed_depth(&self, topic: Topic, symbol_inner: &str) {
        tracing::info!("{} seeding book {}", self.spec.exchange, symbol_inner);
        let fetcher = self.fetcher.clone();
        let result = retry(&self.config.retry, "order book snapshot", || {
            fetcher.fetch_order_book(symbol_inner)
        })
        .await;

        match result {
            Ok(record) => {
                let queued = QueuedDepth { topic, record };
                if let Err(e) = self.depth_queues.enqueue_next(symbol_inner, queued) {
                    tracing::warn!(
                        "{} could not queue snapshot for {}: {}",
                        self.spec.exchange,
                        symbol_inner,
                        e
                    );
                    return;
                }
                self.depth_queues.start(symbol_inner);
            }
            Err(e) => {
                tracing::error!(
                    "{} snapshot for {} failed: {}",
                    self.spec.exchange,
                    symbol_inner,
                    e
                );
                self.resync
                    .request(ResyncCommand::SeedDepth {
                        topic,
                        symbol_inner: symbol_inner.to_string(),
                    })
                    .await;
            }
        }
    }

    /// Gap recovery: tear the stream down on the wire, rebind it, then
    /// reseed. The subject queue stays paused throughout, so the parked
    /// delta replays against the fresh snapshot.
    async fn cycle_depth(&self, topic: Topic, symbol_inner: &str) {
        tracing::info!("{} resync cycle for {}", self.spec.exchange, symbol_inner);
        self.depth_queues.stop(symbol_inner);
        let subjects = [symbol_inner.to_string()];

        match self.pipeline.unsubscribe(topic, &subjects).await {
            Ok(outcome) => {
                if !outcome.failed.is_empty() {
                    tracing::warn!(
                        "{} cycle unsubscribe incomplete for {}",
                        self.spec.exchange,
                        symbol_inner
                    );
                }
                self.route_events(outcome.events).await;
            }
            Err(e) => {
                tracing::warn!(
                    "{} cycle unsubscribe failed for {}: {}",
                    self.spec.exchange,
                    symbol_inner,
                    e
                );
            }
        }

        match self.pipeline.subscribe(topic, &subjects).await {
            Ok(outcome) => {
                self.route_events(outcome.events).await;
                if !outcome.failed.is_empty() {
                    tracing::error!(
                        "{} cycle resubscribe failed for {}, retrying",
                        self.spec.exchange,
                        symbol_inner
                    );
                    self.resync
                        .request(ResyncCommand::CycleDepth {
                            topic,
                            symbol_inner: symbol_inner.to_string(),
                        })
                        .await;
                    return;
                }
            }
            Err(e) => {
                tracing::error!(
                    "{} cycle resubscribe failed for {}: {}",
                    self.spec.exchange,
                    symbol_inner,
                    e
                );
                self.resync
                    .request(ResyncCommand::CycleDepth {
                        topic,
                        symbol_inner: symbol_inner.to_string(),
                    })
                    .await;
                return;
            }
        }

        self.seed_depth(topic, symbol_inner).await;
    }

    /// Seed every account from one balances fetch. Records go in at the
    /// head, in wire order, ahead of any parked delta.
    async fn seed_balances(&self) {
        tracing::info!("{} seeding balances", self.spec.exchange);
        let fetcher = self.fetcher.clone();
        let result = retry(&self.config.retry, "balance snapshot", || {
            fetcher.fetch_balances()
        })
        .await;

        match result {
            Ok(records) => {
                let mut touched = HashSet::new();
                for record in records.into_iter().rev() {
                    touched.insert(record.account_type.clone());
                    if let Err(e) = self
                        .balance_queues
                        .enqueue_next(&record.account_type.clone(), record)
                    {
                        tracing::warn!("{} balance queue rejected seed: {}", self.spec.exchange, e);
                    }
                }
                for account in &touched {
                    self.balance_queues.start(account);
                }
                for account in self.balance_queues.subjects() {
                    if !touched.contains(&account) && !self.balance_queues.is_running(&account) {
                        tracing::warn!(
                            "{} account {} still parked: snapshot did not cover it",
                            self.spec.exchange,
                            account
                        );
                    }
                }
            }
            Err(e) => {
                tracing::error!("{} balance snapshot failed: {}", self.spec.exchange, e);
                self.resync.request(ResyncCommand::SeedBalance).await;
            }
        }
    }

    async fn depth_flush_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.depth_flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.flush_depth().await;
        }
    }

    async fn balance_flush_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.balance_quiet);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.flush_balances().await;
        }
    }

    /// Persist dirty books whose stream is still live and whose backlog is
    /// inside the latency bound. Lagging or orphaned books stay dirty and
    /// get another chance next tick.
    async fn flush_depth(&self) {
        let dirty = self.depth.dirty_symbols();
        if dirty.is_empty() {
            return;
        }

        let unmapped: Vec<String> = dirty
            .iter()
            .filter(|s| !self.symbol_map.contains_key(*s))
            .cloned()
            .collect();
        if !unmapped.is_empty() {
            match self.store.market_symbols(&self.spec.exchange, &unmapped).await {
                Ok(symbols) => {
                    for symbol in symbols {
                        self.symbol_map.insert(symbol.symbol_inner, symbol.symbol);
                    }
                }
                Err(e) => {
                    tracing::warn!("{} symbol lookup failed: {}", self.spec.exchange, e);
                }
            }
        }

        let map: HashMap<String, String> = self
            .symbol_map
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        let bound: HashSet<String> = self
            .streams
            .all()
            .into_iter()
            .filter(|b| b.stream.topic.is_depth())
            .filter_map(|b| b.stream.subject)
            .collect();

        let mut flushed_symbols = Vec::new();
        let mut rows = Vec::new();
        for (symbol_inner, row) in self.depth.collect_dirty_rows(&map) {
            if row.latency > self.config.max_depth_latency {
                tracing::debug!(
                    "{} withholding lagging book {}",
                    self.spec.exchange,
                    symbol_inner
                );
                continue;
            }
            if !bound.contains(&symbol_inner) {
                continue;
            }
            flushed_symbols.push(symbol_inner);
            rows.push(row);
        }
        if rows.is_empty() {
            return;
        }

        match self.store.save_order_books(&rows).await {
            Ok(()) => {
                self.depth.mark_clean(&flushed_symbols);
                tracing::debug!("{} flushed {} books", self.spec.exchange, rows.len());
            }
            Err(e) => {
                tracing::warn!(
                    "{} book flush failed, rows stay dirty: {}",
                    self.spec.exchange,
                    e
                );
            }
        }
    }

    /// Persist dirty balances once the account has been quiet long enough.
    async fn flush_balances(&self) {
        if !self.balances.has_dirty() || !self.balances.quiet_since(self.config.balance_quiet) {
            return;
        }
        let rows = self.balances.collect_dirty_rows();
        if rows.is_empty() {
            return;
        }
        match self.store.save_balances(&rows).await {
            Ok(()) => {
                let keys: Vec<(String, String)> = rows
                    .iter()
                    .map(|row| (row.account_type.clone(), row.asset.clone()))
                    .collect();
                self.balances.mark_clean(&keys);
                tracing::debug!("{} flushed {} balances", self.spec.exchange, rows.len());
            }
            Err(e) => {
                tracing::warn!(
                    "{} balance flush failed, rows stay dirty: {}",
                    self.spec.exchange,
                    e
                );
            }
        }
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

fn depth_handler(
    depth: Arc<DepthEngine>,
    resync: ResyncRequester,
    consumer: mpsc::Sender<SyncEvent>,
) -> SubjectHandler<QueuedDepth> {
    Arc::new(move |subject, backlog, item: &QueuedDepth| {
        let depth = depth.clone();
        let resync = resync.clone();
        let consumer = consumer.clone();
        let subject = subject.to_string();
        let topic = item.topic;
        let record = item.record.clone();
        async move {
            match depth.apply(&record, backlog) {
                DepthOutcome::Applied => {
                    let _ = consumer.send(SyncEvent::DepthUpdate { topic, record }).await;
                    Verdict::Done
                }
                DepthOutcome::Discarded => Verdict::Done,
                DepthOutcome::MissingBook => {
                    resync
                        .request(ResyncCommand::SeedDepth {
                            topic,
                            symbol_inner: subject,
                        })
                        .await;
                    Verdict::Park
                }
                DepthOutcome::Gap { .. } => {
                    resync
                        .request(ResyncCommand::CycleDepth {
                            topic,
                            symbol_inner: subject,
                        })
                        .await;
                    Verdict::Park
                }
            }
        }
        .boxed()
    })
}

fn balance_handler(
    balances: Arc<BalanceEngine>,
    resync: ResyncRequester,
    consumer: mpsc::Sender<SyncEvent>,
) -> SubjectHandler<BalanceRecord> {
    Arc::new(move |_subject, _backlog, event: &BalanceRecord| {
        let balances = balances.clone();
        let resync = resync.clone();
        let consumer = consumer.clone();
        let record = event.clone();
        async move {
            match balances.apply(&record) {
                BalanceOutcome::Applied => {
                    let _ = consumer.send(SyncEvent::BalanceUpdate { record }).await;
                    Verdict::Done
                }
                BalanceOutcome::Discarded => Verdict::Done,
                BalanceOutcome::MissingSnapshot => {
                    resync.request(ResyncCommand::SeedBalance).await;
                    Verdict::Park
                }
            }
        }
        .boxed()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resync_requests_deduplicate_per_key() {
        let (tx, mut rx) = mpsc::channel(8);
        let requester = ResyncRequester::new(tx);

        let seed = ResyncCommand::SeedDepth {
            topic: Topic::Depth,
            symbol_inner: "BTCUSDT".to_string(),
        };
        requester.request(seed.clone()).await;
        requester.request(seed.clone()).await;
        requester
            .request(ResyncCommand::SeedDepth {
                topic: Topic::Depth,
                symbol_inner: "ETHUSDT".to_string(),
            })
            .await;

        // The duplicate for BTCUSDT collapsed into the first request.
        assert_eq!(rx.recv().await.unwrap().key(), "seed:BTCUSDT");
        assert_eq!(rx.recv().await.unwrap().key(), "seed:ETHUSDT");
        assert!(rx.try_recv().is_err());

        // Once picked up, the key is free again.
        requester.started(&seed);
        requester.request(seed.clone()).await;
        assert_eq!(rx.recv().await.unwrap().key(), "seed:BTCUSDT");
    }

    #[tokio::test]
    async fn test_cycle_and_seed_have_distinct_keys() {
        let (tx, mut rx) = mpsc::channel(8);
        let requester = ResyncRequester::new(tx);

        requester
            .request(ResyncCommand::SeedDepth {
                topic: Topic::Depth,
                symbol_inner: "BTCUSDT".to_string(),
            })
            .await;
        requester
            .request(ResyncCommand::CycleDepth {
                topic: Topic::Depth,
                symbol_inner: "BTCUSDT".to_string(),
            })
            .await;

        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_some());
    }
}
