//! Balance reconciliation
//!
//! Balances are accumulated per (account scope, asset): a snapshot sets
//! absolute amounts, deltas add signed changes on top. Venue timestamps
//! gate deltas so an out-of-order event can never double-apply. Flushes are
//! debounced: bursts of fills settle before a row is written.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;

use hermes_core::{BalanceRecord, BalanceRow};

use crate::domain::spec::ExchangeSpec;

/// What applying one record did to the cached account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceOutcome {
    Applied,
    /// Stale or duplicate delta; venue time did not advance.
    Discarded,
    /// Delta arrived before the account was seeded with a snapshot.
    MissingSnapshot,
}

struct AssetBalance {
    free: Decimal,
    used: Decimal,
    timestamp: DateTime<Utc>,
    dirty: bool,
}

#[derive(Default)]
struct CachedAccount {
    assets: HashMap<String, AssetBalance>,
    /// Set once a snapshot established the baseline.
    seeded: bool,
}

pub struct BalanceEngine {
    spec: Arc<ExchangeSpec>,
    accounts: Mutex<HashMap<String, CachedAccount>>,
    /// Debounce clock: last time any asset changed.
    last_change: Mutex<Option<Instant>>,
}

impl BalanceEngine {
    pub fn new(spec: Arc<ExchangeSpec>) -> Self {
        Self {
            spec,
            accounts: Mutex::new(HashMap::new()),
            last_change: Mutex::new(None),
        }
    }

    pub fn apply(&self, record: &BalanceRecord) -> BalanceOutcome {
        let mut accounts = self.accounts.lock();

        if record.snapshot {
            let account = accounts.entry(record.account_type.clone()).or_default();
            account.assets.insert(
                record.asset.clone(),
                AssetBalance {
                    free: record.free,
                    used: record.used,
                    timestamp: record.timestamp,
                    dirty: true,
                },
            );
            account.seeded = true;
            *self.last_change.lock() = Some(Instant::now());
            return BalanceOutcome::Applied;
        }

        let Some(account) = accounts.get_mut(&record.account_type) else {
            return BalanceOutcome::MissingSnapshot;
        };
        if !account.seeded {
            return BalanceOutcome::MissingSnapshot;
        }

        match account.assets.get_mut(&record.asset) {
            Some(asset) => {
                if record.timestamp <= asset.timestamp {
                    tracing::debug!(
                        "{} stale balance delta for {}:{} dropped",
                        self.spec.exchange,
                        record.account_type,
                        record.asset
                    );
                    return BalanceOutcome::Discarded;
                }
                asset.free += record.free;
                asset.used += record.used;
                asset.timestamp = record.timestamp;
                asset.dirty = true;
            }
            None => {
                // Snapshots only list funded assets; the first delta for an
                // unlisted one starts from zero.
                account.assets.insert(
                    record.asset.clone(),
                    AssetBalance {
                        free: record.free,
                        used: record.used,
                        timestamp: record.timestamp,
                        dirty: true,
                    },
                );
            }
        }

        *self.last_change.lock() = Some(Instant::now());
        BalanceOutcome::Applied
    }

    pub fn seeded(&self, account_type: &str) -> bool {
        self.accounts
            .lock()
            .get(account_type)
            .map(|a| a.seeded)
            .unwrap_or(false)
    }

    /// Drop one account scope (unsubscribe, teardown).
    pub fn remove_account(&self, account_type: &str) -> bool {
        self.accounts.lock().remove(account_type).is_some()
    }

    pub fn clear(&self) {
        self.accounts.lock().clear();
    }

    pub fn has_dirty(&self) -> bool {
        self.accounts
            .lock()
            .values()
            .any(|account| account.assets.values().any(|asset| asset.dirty))
    }

    /// Whether the debounce window has passed since the last change.
    pub fn quiet_since(&self, quiet: std::time::Duration) -> bool {
        self.last_change
            .lock()
            .map(|at| at.elapsed() >= quiet)
            .unwrap_or(true)
    }

    /// Rows for every dirty asset. Accounts are not marked clean here; call
    /// [`BalanceEngine::mark_clean`] once the store accepted the rows.
    pub fn collect_dirty_rows(&self) -> Vec<BalanceRow> {
        let accounts = self.accounts.lock();
        let mut rows = Vec::new();
        for (account_type, account) in accounts.iter() {
            for (asset, balance) in &account.assets {
                if !balance.dirty {
                    continue;
                }
                rows.push(BalanceRow {
                    id: BalanceRow::row_id(&self.spec.exchange, asset, account_type),
                    exchange: self.spec.exchange.clone(),
                    asset: asset.clone(),
                    account_type: account_type.clone(),
                    free: balance.free,
                    used: balance.used,
                    total: balance.free + balance.used,
                    timestamp: balance.timestamp,
                });
            }
        }
        rows
    }

    /// Clear dirty flags after a successful flush.
    pub fn mark_clean(&self, keys: &[(String, String)]) {
        let mut accounts = self.accounts.lock();
        for (account_type, asset) in keys {
            if let Some(balance) = accounts
                .get_mut(account_type)
                .and_then(|a| a.assets.get_mut(asset))
            {
                balance.dirty = false;
            }
        }
    }

    /// (account scope, asset) pairs with dirty balances, matching what
    /// `collect_dirty_rows` would emit.
    pub fn dirty_keys(&self) -> Vec<(String, String)> {
        let accounts = self.accounts.lock();
        let mut keys = Vec::new();
        for (account_type, account) in accounts.iter() {
            for (asset, balance) in &account.assets {
                if balance.dirty {
                    keys.push((account_type.clone(), asset.clone()));
                }
            }
        }
        keys
    }
}
