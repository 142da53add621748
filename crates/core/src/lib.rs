//! Core domain types shared across the Hermes market data engine.
//!
//! Pure data types only: no async, no I/O, fully unit-testable. Everything
//! here is either an identifier, a unified wire record, or a persisted row.

pub mod identifiers;
pub mod records;
pub mod rows;
pub mod topics;

// Re-export at crate root for convenience
pub use identifiers::{ChannelId, ExchangeId, MarketSymbol};
pub use records::{BalanceRecord, BookLevel, DepthRecord};
pub use rows::{BalanceRow, OrderBookRow};
pub use topics::{StreamKey, Topic};
