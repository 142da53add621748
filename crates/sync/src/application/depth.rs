//! Order book reconciliation
//!
//! One cached book per venue-native symbol, rebuilt from a snapshot and
//! advanced by deltas under the venue's sequencing contract. Anything that
//! breaks the contract drops the book on the spot; the engine then reseeds
//! it from the snapshot port. Flushing is two-phase (collect, then mark
//! clean) so a failed store write keeps the books dirty for the next tick.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;

use hermes_core::{BookLevel, DepthRecord, OrderBookRow};

use crate::domain::spec::ExchangeSpec;

/// What applying one record did to the cached book.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DepthOutcome {
    Applied,
    /// The record is already covered by the book and was dropped.
    Discarded,
    /// No book exists for the subject; a snapshot seed is needed first.
    MissingBook,
    /// Sequence break. The book has been dropped and must be reseeded.
    Gap {
        expected: u64,
        start_update_id: u64,
        final_update_id: u64,
    },
}

struct CachedBook {
    bids: BTreeMap<Decimal, Decimal>,
    asks: BTreeMap<Decimal, Decimal>,
    /// Last applied `final_update_id`.
    nonce: u64,
    timestamp: DateTime<Utc>,
    /// Queue backlog when the last record was applied.
    latency: u64,
    /// When the current snapshot generation was seeded.
    synchronized_at: DateTime<Utc>,
    /// Set between a snapshot and its first delta, where overlap with the
    /// snapshot nonce is legitimate.
    awaiting_first_delta: bool,
    dirty: bool,
}

impl CachedBook {
    fn from_snapshot(record: &DepthRecord, backlog: u64) -> Self {
        let mut book = CachedBook {
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            nonce: record.final_update_id,
            timestamp: record.timestamp,
            latency: backlog,
            synchronized_at: Utc::now(),
            awaiting_first_delta: true,
            dirty: true,
        };
        book.merge(record);
        book
    }

    fn merge(&mut self, record: &DepthRecord) {
        for level in &record.bids {
            if level.size.is_zero() {
                self.bids.remove(&level.price);
            } else {
                self.bids.insert(level.price, level.size);
            }
        }
        for level in &record.asks {
            if level.size.is_zero() {
                self.asks.remove(&level.price);
            } else {
                self.asks.insert(level.price, level.size);
            }
        }
    }
}

pub struct DepthEngine {
    spec: Arc<ExchangeSpec>,
    /// Backlog threshold beyond which applies are logged as lagging.
    max_latency: u64,
    books: Mutex<HashMap<String, CachedBook>>,
}

impl DepthEngine {
    pub fn new(spec: Arc<ExchangeSpec>, max_latency: u64) -> Self {
        Self {
            spec,
            max_latency,
            books: Mutex::new(HashMap::new()),
        }
    }

    /// Apply one record to the book of its subject. `backlog` is the queue
    /// depth behind this record and is persisted as the staleness proxy.
    pub fn apply(&self, record: &DepthRecord, backlog: u64) -> DepthOutcome {
        if backlog > self.max_latency {
            tracing::warn!(
                "{} book {} lagging: {} queued events",
                self.spec.exchange,
                record.symbol_inner,
                backlog
            );
        }

        let mut books = self.books.lock();

        if record.snapshot {
            books.insert(
                record.symbol_inner.clone(),
                CachedBook::from_snapshot(record, backlog),
            );
            tracing::info!(
                "{} seeded book {} at nonce {}",
                self.spec.exchange,
                record.symbol_inner,
                record.final_update_id
            );
            return DepthOutcome::Applied;
        }

        let Some(book) = books.get_mut(&record.symbol_inner) else {
            return DepthOutcome::MissingBook;
        };

        if record.final_update_id <= book.nonce {
            return DepthOutcome::Discarded;
        }

        let expected = book.nonce + 1;
        let accepted = if self.spec.loose_ordering {
            // Forward progress is all this venue guarantees; the final id
            // check above already enforced it.
            true
        } else if book.awaiting_first_delta {
            record.start_update_id <= expected && expected <= record.final_update_id
        } else if self.spec.intersecting_updates {
            record.start_update_id == book.nonce || record.start_update_id == expected
        } else {
            record.start_update_id == expected
        };

        if !accepted {
            books.remove(&record.symbol_inner);
            tracing::warn!(
                "{} gap on {}: expected {}, got [{}, {}]; book dropped",
                self.spec.exchange,
                record.symbol_inner,
                expected,
                record.start_update_id,
                record.final_update_id
            );
            return DepthOutcome::Gap {
                expected,
                start_update_id: record.start_update_id,
                final_update_id: record.final_update_id,
            };
        }

        book.merge(record);
        book.nonce = record.final_update_id;
        book.timestamp = record.timestamp;
        book.latency = backlog;
        book.awaiting_first_delta = false;
        book.dirty = true;
        DepthOutcome::Applied
    }

    pub fn contains(&self, symbol_inner: &str) -> bool {
        self.books.lock().contains_key(symbol_inner)
    }

    /// Drop the cached book (unsubscribe, teardown).
    pub fn remove(&self, symbol_inner: &str) -> bool {
        self.books.lock().remove(symbol_inner).is_some()
    }

    pub fn len(&self) -> usize {
        self.books.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.books.lock().is_empty()
    }

    pub fn best_bid(&self, symbol_inner: &str) -> Option<BookLevel> {
        self.books.lock().get(symbol_inner).and_then(|book| {
            book.bids
                .iter()
                .next_back()
                .map(|(price, size)| BookLevel::new(*price, *size))
        })
    }

    pub fn best_ask(&self, symbol_inner: &str) -> Option<BookLevel> {
        self.books.lock().get(symbol_inner).and_then(|book| {
            book.asks
                .iter()
                .next()
                .map(|(price, size)| BookLevel::new(*price, *size))
        })
    }

    /// Best `n` bid levels, highest price first
    pub fn top_bids(&self, symbol_inner: &str, n: usize) -> Vec<BookLevel> {
        self.books
            .lock()
            .get(symbol_inner)
            .map(|book| {
                book.bids
                    .iter()
                    .rev()
                    .take(n)
                    .map(|(price, size)| BookLevel::new(*price, *size))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Best `n` ask levels, lowest price first
    pub fn top_asks(&self, symbol_inner: &str, n: usize) -> Vec<BookLevel> {
        self.books
            .lock()
            .get(symbol_inner)
            .map(|book| {
                book.asks
                    .iter()
                    .take(n)
                    .map(|(price, size)| BookLevel::new(*price, *size))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Rows for every dirty book, resolving venue symbols to unified ones
    /// through `symbol_map`, paired with the venue symbol so the caller can
    /// filter and mark clean. Books are not marked clean here; call
    /// [`DepthEngine::mark_clean`] once the store accepted the rows.
    pub fn collect_dirty_rows(
        &self,
        symbol_map: &HashMap<String, String>,
    ) -> Vec<(String, OrderBookRow)> {
        let now = Utc::now();
        let books = self.books.lock();
        books
            .iter()
            .filter(|(_, book)| book.dirty)
            .filter_map(|(symbol_inner, book)| {
                let Some(symbol) = symbol_map.get(symbol_inner) else {
                    tracing::warn!(
                        "{} no unified symbol for {}, row skipped",
                        self.spec.exchange,
                        symbol_inner
                    );
                    return None;
                };
                let row = OrderBookRow {
                    id: OrderBookRow::row_id(&self.spec.exchange, symbol),
                    exchange: self.spec.exchange.clone(),
                    symbol: symbol.clone(),
                    bids: book
                        .bids
                        .iter()
                        .rev()
                        .map(|(price, size)| BookLevel::new(*price, *size))
                        .collect(),
                    asks: book
                        .asks
                        .iter()
                        .map(|(price, size)| BookLevel::new(*price, *size))
                        .collect(),
                    nonce: book.nonce,
                    timestamp: book.timestamp,
                    latency: book.latency,
                    synchronized_at: now,
                };
                Some((symbol_inner.clone(), row))
            })
            .collect()
    }

    /// Clear dirty flags after a successful flush.
    pub fn mark_clean(&self, symbols_inner: &[String]) {
        let mut books = self.books.lock();
        for symbol_inner in symbols_inner {
            if let Some(book) = books.get_mut(symbol_inner) {
                book.dirty = false;
            }
        }
    }

    /// Venue symbols with dirty books, matching what `collect_dirty_rows`
    /// would emit.
    pub fn dirty_symbols(&self) -> Vec<String> {
        self.books
            .lock()
            .iter()
            .filter(|(_, book)| book.dirty)
            .map(|(symbol_inner, _)| symbol_inner.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::spec::{CodecError, WireCodec};
    use crate::domain::events::Classification;
    use crate::domain::stream::Stream;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;

    struct NullCodec;

    #[async_trait]
    impl WireCodec for NullCodec {
        fn classify(&self, _raw: &str) -> Classification {
            Classification::none()
        }
        fn encode_subscribe(&self, _id: u64, _streams: &[Stream]) -> Result<String, CodecError> {
            Ok("{}".to_string())
        }
        fn encode_unsubscribe(&self, _id: u64, _streams: &[Stream]) -> Result<String, CodecError> {
            Ok("{}".to_string())
        }
    }

    fn engine() -> DepthEngine {
        let spec = ExchangeSpec::new("testex", Arc::new(NullCodec));
        DepthEngine::new(Arc::new(spec), 100)
    }

    fn engine_with(intersecting: bool, loose: bool) -> DepthEngine {
        let mut spec = ExchangeSpec::new("testex", Arc::new(NullCodec));
        spec.intersecting_updates = intersecting;
        spec.loose_ordering = loose;
        DepthEngine::new(Arc::new(spec), 100)
    }

    fn snapshot(nonce: u64) -> DepthRecord {
        DepthRecord::snapshot(
            "BTCUSDT",
            nonce,
            vec![BookLevel::new(dec!(100), dec!(1))],
            vec![BookLevel::new(dec!(101), dec!(1))],
            Utc::now(),
        )
    }

    fn delta(start: u64, end: u64) -> DepthRecord {
        DepthRecord::delta(
            "BTCUSDT",
            start,
            end,
            vec![BookLevel::new(dec!(100.5), dec!(2))],
            vec![],
            Utc::now(),
        )
    }

    #[test]
    fn test_adjacent_delta_applies() {
        let engine = engine();
        assert_eq!(engine.apply(&snapshot(100), 0), DepthOutcome::Applied);
        assert_eq!(engine.apply(&delta(101, 101), 0), DepthOutcome::Applied);
        assert_eq!(engine.best_bid("BTCUSDT").unwrap().price, dec!(100.5));
    }

    #[test]
    fn test_stale_delta_discarded() {
        let engine = engine();
        engine.apply(&snapshot(100), 0);
        assert_eq!(engine.apply(&delta(99, 99), 0), DepthOutcome::Discarded);
        // The book survives and still accepts the real continuation.
        assert_eq!(engine.apply(&delta(101, 101), 0), DepthOutcome::Applied);
    }

    #[test]
    fn test_gap_drops_book() {
        let engine = engine();
        engine.apply(&snapshot(100), 0);
        engine.apply(&delta(101, 102), 0);
        let outcome = engine.apply(&delta(105, 106), 0);
        assert_eq!(
            outcome,
            DepthOutcome::Gap {
                expected: 103,
                start_update_id: 105,
                final_update_id: 106,
            }
        );
        assert!(!engine.contains("BTCUSDT"));
        // Next delta finds no book: the caller must reseed.
        assert_eq!(engine.apply(&delta(107, 108), 0), DepthOutcome::MissingBook);
    }

    #[test]
    fn test_first_delta_may_overlap_snapshot() {
        let engine = engine();
        engine.apply(&snapshot(100), 0);
        // Covers the snapshot nonce: fine right after seeding.
        assert_eq!(engine.apply(&delta(98, 103), 0), DepthOutcome::Applied);
        // But overlap is only allowed once.
        assert_eq!(
            engine.apply(&delta(103, 106), 0),
            DepthOutcome::Gap {
                expected: 104,
                start_update_id: 103,
                final_update_id: 106,
            }
        );
    }

    #[test]
    fn test_first_delta_beyond_snapshot_is_gap() {
        let engine = engine();
        engine.apply(&snapshot(100), 0);
        assert_eq!(
            engine.apply(&delta(103, 105), 0),
            DepthOutcome::Gap {
                expected: 101,
                start_update_id: 103,
                final_update_id: 105,
            }
        );
    }

    #[test]
    fn test_intersecting_venue_accepts_nonce_start() {
        let engine = engine_with(true, false);
        engine.apply(&snapshot(100), 0);
        engine.apply(&delta(101, 102), 0);
        // Starts exactly at the current nonce: legal on this venue.
        assert_eq!(engine.apply(&delta(102, 104), 0), DepthOutcome::Applied);
        assert_eq!(engine.apply(&delta(106, 107), 0), DepthOutcome::Gap {
            expected: 105,
            start_update_id: 106,
            final_update_id: 107,
        });
    }

    #[test]
    fn test_loose_venue_accepts_any_forward_delta() {
        let engine = engine_with(false, true);
        engine.apply(&snapshot(100), 0);
        assert_eq!(engine.apply(&delta(140, 150), 0), DepthOutcome::Applied);
        assert_eq!(engine.apply(&delta(120, 130), 0), DepthOutcome::Discarded);
    }

    #[test]
    fn test_zero_size_removes_level() {
        let engine = engine();
        engine.apply(&snapshot(100), 0);
        let removal = DepthRecord::delta(
            "BTCUSDT",
            101,
            101,
            vec![BookLevel::new(dec!(100), dec!(0))],
            vec![],
            Utc::now(),
        );
        assert_eq!(engine.apply(&removal, 0), DepthOutcome::Applied);
        assert!(engine.best_bid("BTCUSDT").is_none());
        assert_eq!(engine.best_ask("BTCUSDT").unwrap().price, dec!(101));
    }

    #[test]
    fn test_snapshot_replaces_whole_book() {
        let engine = engine();
        engine.apply(&snapshot(100), 0);
        engine.apply(&delta(101, 101), 0);
        // Reseed at a later nonce: earlier levels must be gone.
        let reseed = DepthRecord::snapshot(
            "BTCUSDT",
            200,
            vec![BookLevel::new(dec!(99), dec!(5))],
            vec![],
            Utc::now(),
        );
        engine.apply(&reseed, 0);
        assert_eq!(engine.best_bid("BTCUSDT").unwrap().price, dec!(99));
        assert_eq!(engine.apply(&delta(201, 201), 0), DepthOutcome::Applied);
    }

    #[test]
    fn test_snapshot_replaces_even_at_an_older_nonce() {
        let engine = engine();
        engine.apply(&snapshot(100), 0);
        engine.apply(&delta(101, 105), 0);
        // A reseed always wins; the nonce follows it, even backwards.
        assert_eq!(engine.apply(&snapshot(100), 0), DepthOutcome::Applied);
        assert_eq!(engine.apply(&delta(101, 106), 0), DepthOutcome::Applied);
    }

    #[test]
    fn test_delta_sequence_matches_cumulative_delta() {
        let ts = Utc::now();
        let seed = DepthRecord::snapshot(
            "BTCUSDT",
            100,
            vec![BookLevel::new(dec!(100), dec!(1))],
            vec![BookLevel::new(dec!(101), dec!(1))],
            ts,
        );
        let bid_changes = vec![
            BookLevel::new(dec!(100), dec!(3)),
            BookLevel::new(dec!(99), dec!(2)),
        ];
        let ask_changes = vec![
            BookLevel::new(dec!(101), dec!(0)),
            BookLevel::new(dec!(102), dec!(5)),
        ];

        let stepwise = engine();
        stepwise.apply(&seed, 0);
        stepwise.apply(
            &DepthRecord::delta("BTCUSDT", 101, 102, bid_changes.clone(), vec![], ts),
            0,
        );
        stepwise.apply(
            &DepthRecord::delta("BTCUSDT", 103, 104, vec![], ask_changes.clone(), ts),
            0,
        );

        let cumulative = engine();
        cumulative.apply(&seed, 0);
        cumulative.apply(
            &DepthRecord::delta("BTCUSDT", 101, 104, bid_changes, ask_changes, ts),
            0,
        );

        let map = HashMap::from([("BTCUSDT".to_string(), "BTC/USDT".to_string())]);
        let (_, step_row) = &stepwise.collect_dirty_rows(&map)[0];
        let (_, cumu_row) = &cumulative.collect_dirty_rows(&map)[0];
        assert_eq!(step_row.bids, cumu_row.bids);
        assert_eq!(step_row.asks, cumu_row.asks);
        assert_eq!(step_row.nonce, cumu_row.nonce);
        assert_eq!(step_row.nonce, 104);

        assert_eq!(
            stepwise.top_bids("BTCUSDT", 2),
            vec![
                BookLevel::new(dec!(100), dec!(3)),
                BookLevel::new(dec!(99), dec!(2)),
            ]
        );
        assert_eq!(
            stepwise.top_asks("BTCUSDT", 5),
            vec![BookLevel::new(dec!(102), dec!(5))]
        );
    }

    #[test]
    fn test_dirty_rows_and_mark_clean() {
        let engine = engine();
        engine.apply(&snapshot(100), 3);

        let mut map = HashMap::new();
        map.insert("BTCUSDT".to_string(), "BTC/USDT".to_string());

        let rows = engine.collect_dirty_rows(&map);
        assert_eq!(rows.len(), 1);
        let (inner, row) = &rows[0];
        assert_eq!(inner, "BTCUSDT");
        assert_eq!(row.id, "testex:BTC/USDT");
        assert_eq!(row.nonce, 100);
        assert_eq!(row.latency, 3);

        engine.mark_clean(&["BTCUSDT".to_string()]);
        assert!(engine.collect_dirty_rows(&map).is_empty());

        // Unmapped symbols stay out of the flush.
        engine.apply(&delta(101, 101), 0);
        assert_eq!(engine.collect_dirty_rows(&HashMap::new()).len(), 0);
    }
}
