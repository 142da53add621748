//! Unified market data records
//!
//! Venue codecs decode wire frames into these records; the reconciliation
//! engines consume them. A record is either a snapshot (full replacement) or
//! a delta, distinguished by the `snapshot` flag.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One price level of an order book side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: Decimal,
    /// Aggregated size at this price. Zero means the level is removed.
    pub size: Decimal,
}

impl BookLevel {
    pub fn new(price: Decimal, size: Decimal) -> Self {
        BookLevel { price, size }
    }
}

/// Unified order book event (snapshot or delta)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthRecord {
    /// Venue-native symbol, as spelled on the wire
    pub symbol_inner: String,
    /// Venue event time
    pub timestamp: DateTime<Utc>,
    /// First update id covered by this event (equals `final_update_id` for snapshots)
    pub start_update_id: u64,
    /// Last update id covered by this event
    pub final_update_id: u64,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
    /// True for full snapshots, false for incremental deltas
    pub snapshot: bool,
}

impl DepthRecord {
    /// Build a full snapshot record
    pub fn snapshot(
        symbol_inner: impl Into<String>,
        final_update_id: u64,
        bids: Vec<BookLevel>,
        asks: Vec<BookLevel>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        DepthRecord {
            symbol_inner: symbol_inner.into(),
            timestamp,
            start_update_id: final_update_id,
            final_update_id,
            bids,
            asks,
            snapshot: true,
        }
    }

    /// Build an incremental delta record
    pub fn delta(
        symbol_inner: impl Into<String>,
        start_update_id: u64,
        final_update_id: u64,
        bids: Vec<BookLevel>,
        asks: Vec<BookLevel>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        DepthRecord {
            symbol_inner: symbol_inner.into(),
            timestamp,
            start_update_id,
            final_update_id,
            bids,
            asks,
            snapshot: false,
        }
    }
}

/// Unified balance event for one asset in one account scope
///
/// For snapshots `free` and `used` are absolute amounts; for deltas they are
/// signed changes to be accumulated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceRecord {
    pub asset: String,
    /// Venue account scope (e.g., "spot", "margin")
    pub account_type: String,
    pub free: Decimal,
    pub used: Decimal,
    /// Venue event time; deltas must advance this monotonically
    pub timestamp: DateTime<Utc>,
    pub snapshot: bool,
}

impl BalanceRecord {
    pub fn snapshot(
        asset: impl Into<String>,
        account_type: impl Into<String>,
        free: Decimal,
        used: Decimal,
        timestamp: DateTime<Utc>,
    ) -> Self {
        BalanceRecord {
            asset: asset.into(),
            account_type: account_type.into(),
            free,
            used,
            timestamp,
            snapshot: true,
        }
    }

    pub fn delta(
        asset: impl Into<String>,
        account_type: impl Into<String>,
        free: Decimal,
        used: Decimal,
        timestamp: DateTime<Utc>,
    ) -> Self {
        BalanceRecord {
            asset: asset.into(),
            account_type: account_type.into(),
            free,
            used,
            timestamp,
            snapshot: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    #[test]
    fn test_snapshot_record_update_ids() {
        let ts = Utc.timestamp_millis_opt(1_000).unwrap();
        let rec = DepthRecord::snapshot("BTCUSDT", 100, vec![], vec![], ts);
        assert!(rec.snapshot);
        assert_eq!(rec.start_update_id, 100);
        assert_eq!(rec.final_update_id, 100);
    }

    #[test]
    fn test_delta_record() {
        let ts = Utc.timestamp_millis_opt(2_000).unwrap();
        let rec = DepthRecord::delta(
            "BTCUSDT",
            101,
            105,
            vec![BookLevel::new(dec!(100.5), dec!(2))],
            vec![],
            ts,
        );
        assert!(!rec.snapshot);
        assert_eq!(rec.bids[0].size, dec!(2));
    }

    #[test]
    fn test_record_serde_roundtrip() {
        let ts = Utc.timestamp_millis_opt(3_000).unwrap();
        let rec = BalanceRecord::delta("BTC", "spot", dec!(1.5), dec!(-0.5), ts);
        let json = serde_json::to_string(&rec).unwrap();
        let back: BalanceRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(rec, back);
    }
}
