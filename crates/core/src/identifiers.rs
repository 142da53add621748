//! Exchange and channel identifiers
//!
//! Types for identifying exchanges, connection channels and symbols across
//! the synchronization engine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for an exchange
///
/// Exchange IDs are normalized to lowercase (e.g., "Binance" becomes "binance").
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExchangeId(String);

impl ExchangeId {
    /// Create a new exchange ID (normalized to lowercase)
    pub fn new(id: impl Into<String>) -> Self {
        ExchangeId(id.into().to_lowercase())
    }

    /// Get the exchange ID as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Binance exchange
    pub fn binance() -> Self {
        ExchangeId::new("binance")
    }

    /// Kraken exchange
    pub fn kraken() -> Self {
        ExchangeId::new("kraken")
    }

    /// OKX exchange
    pub fn okx() -> Self {
        ExchangeId::new("okx")
    }

    /// Bybit exchange
    pub fn bybit() -> Self {
        ExchangeId::new("bybit")
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ExchangeId {
    fn from(s: &str) -> Self {
        ExchangeId::new(s)
    }
}

impl From<String> for ExchangeId {
    fn from(s: String) -> Self {
        ExchangeId::new(s)
    }
}

/// Venue-defined connection class (e.g., "spot-public", "user-data").
///
/// Channels group connections that share a URL, an authentication scheme and
/// capacity limits. The name is kept exactly as the venue plug-in declares it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId(String);

impl ChannelId {
    pub fn new(id: impl Into<String>) -> Self {
        ChannelId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ChannelId {
    fn from(s: &str) -> Self {
        ChannelId::new(s)
    }
}

/// Mapping between a venue-native symbol and its unified form
///
/// Unified symbols are normalized to uppercase; the inner symbol is kept
/// exactly as the venue spells it on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketSymbol {
    /// Exchange this mapping belongs to
    pub exchange: ExchangeId,
    /// Unified symbol, normalized to uppercase
    pub symbol: String,
    /// Venue-native symbol as it appears on the wire
    pub symbol_inner: String,
}

impl MarketSymbol {
    pub fn new(
        exchange: impl Into<ExchangeId>,
        symbol: impl Into<String>,
        symbol_inner: impl Into<String>,
    ) -> Self {
        MarketSymbol {
            exchange: exchange.into(),
            symbol: symbol.into().to_uppercase(),
            symbol_inner: symbol_inner.into(),
        }
    }
}
