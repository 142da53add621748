//! Persisted rows
//!
//! Flat representations handed to the storage port. Row ids are deterministic
//! so repeated flushes overwrite in place.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::identifiers::ExchangeId;
use crate::records::BookLevel;

/// Persisted order book for one unified symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBookRow {
    /// `"{exchange}:{symbol}"`
    pub id: String,
    pub exchange: ExchangeId,
    /// Unified symbol
    pub symbol: String,
    /// Best bid first
    pub bids: Vec<BookLevel>,
    /// Best ask first
    pub asks: Vec<BookLevel>,
    /// Last applied update id
    pub nonce: u64,
    /// Venue time of the last applied event
    pub timestamp: DateTime<Utc>,
    /// Queue backlog at the last applied event (staleness proxy)
    pub latency: u64,
    /// Engine time the row was flushed
    pub synchronized_at: DateTime<Utc>,
}

impl OrderBookRow {
    pub fn row_id(exchange: &ExchangeId, symbol: &str) -> String {
        format!("{}:{}", exchange, symbol)
    }
}

/// Persisted balance for one asset in one account scope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceRow {
    /// `"{exchange}:{asset}:{account_type}"`
    pub id: String,
    pub exchange: ExchangeId,
    pub asset: String,
    pub account_type: String,
    pub free: Decimal,
    pub used: Decimal,
    /// Always `free + used`
    pub total: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl BalanceRow {
    pub fn row_id(exchange: &ExchangeId, asset: &str, account_type: &str) -> String {
        format!("{}:{}:{}", exchange, asset, account_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_book_row_id() {
        let id = OrderBookRow::row_id(&ExchangeId::binance(), "BTC/USDT");
        assert_eq!(id, "binance:BTC/USDT");
    }

    #[test]
    fn test_balance_row_id() {
        let id = BalanceRow::row_id(&ExchangeId::kraken(), "BTC", "spot");
        assert_eq!(id, "kraken:BTC:spot");
    }
}
