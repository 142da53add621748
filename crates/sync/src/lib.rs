//! Hermes Sync Crate
//!
//! Real-time market data synchronization engine. Maintains a pool of
//! authenticated, rate-limited WebSocket connections per venue, multiplexes
//! logical streams across them under capacity limits, correlates requests
//! with responses, and rebuilds gap-free order books and balances from
//! snapshot/delta flows.
//!
//! # Architecture
//!
//! ```text
//!        venue sockets                      engine
//! ┌──────────┐ ┌──────────┐
//! │  conn 1  │ │  conn 2  │  ...            (one engine per venue,
//! └────┬─────┘ └────┬─────┘                  driven by an ExchangeSpec)
//!      │ frames     │
//!      ▼            ▼
//! ┌──────────────────────────┐    ┌───────────────────────────────┐
//! │    ConnectionManager     │───►│       MessageDispatcher       │
//! │ (auth, keep-alive, TTL)  │    │ classify → correlate → apply  │
//! └──────────────────────────┘    └──────┬───────────────┬────────┘
//!                                        │ updates       │ events
//!                                        ▼               ▼
//!                        ┌────────────────────────┐   subscribers
//!                        │ per-subject queues     │   (mpsc consumer)
//!                        │  depth    balances     │
//!                        └────┬──────────┬────────┘
//!                             ▼          ▼
//!                  ┌───────────────┐ ┌────────────────┐
//!                  │  DepthEngine  │ │ BalanceEngine  │──► MarketStore
//!                  │ (nonce rules) │ │ (accumulation) │    (port)
//!                  └───────────────┘ └────────────────┘
//! ```
//!
//! Subscribing runs a six-stage pipeline: distribute streams into spare
//! connection capacity, synthesize presubscribed confirmations, build
//! chunked payloads, track requests optimistically, dispatch under the rate
//! limiter, and reconcile failed sends. Desynchronized subjects heal
//! themselves by pausing their queue, reseeding from the snapshot port and
//! replaying buffered deltas in order.

pub mod application;
pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod util;

// Re-export key types
pub use domain::events::{Classification, ConnectionEvent, ConnectionId, MessageKind, SyncEvent};
pub use domain::ports::{FetchError, MarketStore, RateLimiter, SnapshotFetcher, StoreError};
pub use domain::spec::{AuthScheme, ChannelSpec, CodecError, ExchangeSpec, PingStyle, WireCodec};
pub use domain::stream::{Stream, StreamBinding};
pub use domain::request::{RequestKind, TrackedRequest};
pub use error::SyncError;

pub use application::engine::SyncEngine;
pub use application::subscriber::SubscribeOutcome;

pub use config::{SyncConfig, SyncConfigFile, load_config, load_config_from_str, load_default_config};
pub use util::retry::{RetryPolicy, retry};
