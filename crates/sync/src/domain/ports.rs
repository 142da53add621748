//! Ports consumed by the engine
//!
//! The engine talks to the outside world through these traits only: request
//! pacing, persistence and REST snapshot seeding all live behind them.
//! Implementations are injected at construction.

use async_trait::async_trait;
use thiserror::Error;

use hermes_core::{BalanceRecord, BalanceRow, DepthRecord, ExchangeId, MarketSymbol, OrderBookRow};

use super::events::ConnectionId;

/// Synthetic endpoint key for opening a socket
pub const CONNECT_ENDPOINT: &str = "wss://connect";

/// Synthetic endpoint key for sending a payload on one connection
pub fn send_endpoint(connection: ConnectionId) -> String {
    format!("wss://send/{}", connection)
}

/// Domain error for snapshot fetching
///
/// Infrastructure implementations convert their specific errors to this type.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),
    #[error("api error {code}: {message}")]
    Api { code: i32, message: String },
    #[error("parse error: {0}")]
    Parse(String),
}

/// Domain error for persistence
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Request pacing for connects and payload sends
///
/// The engine awaits a permit before acting and records usage after; limiter
/// internals (token buckets, venue weights) live behind the port.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Wait until the endpoint may be used
    async fn wait(&self, exchange: &ExchangeId, endpoint: &str);

    /// Record one use of the endpoint
    fn add_usage(&self, exchange: &ExchangeId, endpoint: &str);
}

/// Persistence for reconstructed market state
#[async_trait]
pub trait MarketStore: Send + Sync {
    async fn save_order_books(&self, rows: &[OrderBookRow]) -> Result<(), StoreError>;

    async fn save_balances(&self, rows: &[BalanceRow]) -> Result<(), StoreError>;

    /// Inner-to-unified symbol mappings. An empty `symbol_inner` filter
    /// returns every known mapping for the exchange.
    async fn market_symbols(
        &self,
        exchange: &ExchangeId,
        symbol_inner: &[String],
    ) -> Result<Vec<MarketSymbol>, StoreError>;

    /// Drop persisted books for symbols that are no longer subscribed
    async fn delete_order_books(
        &self,
        exchange: &ExchangeId,
        symbols: &[String],
    ) -> Result<(), StoreError>;
}

/// REST seeding for books and balances
///
/// Only used when a subject needs a fresh snapshot; streaming never goes
/// through here.
#[async_trait]
pub trait SnapshotFetcher: Send + Sync {
    async fn fetch_order_book(&self, symbol_inner: &str) -> Result<DepthRecord, FetchError>;

    async fn fetch_balances(&self) -> Result<Vec<BalanceRecord>, FetchError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_endpoint_key() {
        assert_eq!(send_endpoint(ConnectionId(3)), "wss://send/conn-3");
    }
}
