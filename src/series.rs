// =============================================================================
// DCA Series Store
// =============================================================================
//
// A typed view over a `Wal` persisting the strategy's currently open
// position: the ordered list of purchases, their capital-weighted average
// entry price, and the set of trade-intent ids already folded in. Every
// mutation writes one full JSON snapshot under a fixed key; replay loads the
// latest snapshot only.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::decimal::Decimal;
use crate::wal::{Wal, WalError};

#[derive(Debug, Error)]
pub enum SeriesError {
    #[error(transparent)]
    Wal(#[from] WalError),
    #[error("decode failure for dca series record: {0}")]
    Decode(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SeriesError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DCAPurchase {
    pub id: String,
    pub price: Decimal,
    pub amount: Decimal,
    pub time: DateTime<Utc>,
    pub trade_part: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DCASeries {
    pub purchases: Vec<DCAPurchase>,
    pub total_amount: Decimal,
    pub avg_entry_price: Decimal,
    pub first_buy_time: Option<DateTime<Utc>>,
    pub last_sell_price: Option<Decimal>,
    pub waiting_for_dip: bool,
    pub processed_trade_ids: HashSet<String>,
}

impl DCASeries {
    pub fn is_empty(&self) -> bool {
        self.purchases.is_empty()
    }

    fn recompute_aggregates(&mut self) {
        let total: Decimal = self.purchases.iter().map(|p| p.amount).sum();
        self.total_amount = total;
        if total.is_zero() {
            self.avg_entry_price = Decimal::ZERO;
        } else {
            let weighted: Decimal = self.purchases.iter().map(|p| p.price * p.amount).sum();
            self.avg_entry_price = weighted / total;
        }
        self.first_buy_time = self.purchases.first().map(|p| p.time);
    }
}

fn key_for(pair: &str) -> String {
    format!("dca_series_{pair}")
}

/// Typed view over a per-pair `Wal` that persists the DCA series.
pub struct DCASeriesStore {
    wal: Arc<Wal>,
    key: String,
    series: Mutex<DCASeries>,
}

impl DCASeriesStore {
    /// Load the latest snapshot under `dca_series_<pair>`, or start empty.
    pub fn open(wal: Arc<Wal>, pair: &str) -> Result<Self> {
        let key = key_for(pair);
        let mut latest: Option<DCASeries> = None;
        for record in wal.iterate()? {
            if record.key == key {
                latest = Some(serde_json::from_slice(&record.value)?);
            }
        }
        Ok(Self {
            wal,
            key,
            series: Mutex::new(latest.unwrap_or_default()),
        })
    }

    pub fn current(&self) -> DCASeries {
        self.series.lock().clone()
    }

    /// Fold an executed buy into the series. A no-op (but still `Ok`) if
    /// `intent_id` has already been processed.
    pub fn add_purchase(
        &self,
        intent_id: &str,
        price: Decimal,
        amount: Decimal,
        time: DateTime<Utc>,
        trade_part: u32,
    ) -> Result<()> {
        let mut series = self.series.lock();
        if series.processed_trade_ids.contains(intent_id) {
            return Ok(());
        }
        series.purchases.push(DCAPurchase {
            id: intent_id.to_string(),
            price,
            amount,
            time,
            trade_part,
        });
        series.processed_trade_ids.insert(intent_id.to_string());
        series.recompute_aggregates();
        self.persist(&series)
    }

    /// Consume `amount` LIFO (newest purchases first), removing whole
    /// purchases and partially reducing the final one. Clears the series if
    /// the total falls to (or below) zero, without touching
    /// `last_sell_price`/`waiting_for_dip` — callers decide whether to
    /// follow up with `reset`.
    pub fn remove_amount(&self, amount: Decimal) -> Result<()> {
        let mut series = self.series.lock();
        let mut remaining = amount;
        while remaining > Decimal::ZERO {
            let Some(last) = series.purchases.last_mut() else {
                break;
            };
            if last.amount <= remaining {
                remaining -= last.amount;
                series.purchases.pop();
            } else {
                last.amount -= remaining;
                remaining = Decimal::ZERO;
            }
        }
        series.recompute_aggregates();
        self.persist(&series)
    }

    /// Empty the series, record the sell price, and arm `waiting_for_dip`.
    /// `processed_trade_ids` is preserved across the reset.
    pub fn reset(&self, new_last_sell_price: Decimal) -> Result<()> {
        let mut series = self.series.lock();
        series.purchases.clear();
        series.total_amount = Decimal::ZERO;
        series.avg_entry_price = Decimal::ZERO;
        series.first_buy_time = None;
        series.last_sell_price = Some(new_last_sell_price);
        series.waiting_for_dip = true;
        self.persist(&series)
    }

    /// Force `waiting_for_dip` to `value` without otherwise touching the
    /// series. Used by the strategy to clear the flag before attempting a
    /// re-entry buy, and to restore it if that buy fails.
    pub fn set_waiting_for_dip(&self, value: bool) -> Result<()> {
        let mut series = self.series.lock();
        series.waiting_for_dip = value;
        self.persist(&series)
    }

    /// Seed `last_sell_price` on first boot when the strategy has never
    /// sold anything. A no-op if a sell price is already recorded.
    pub fn seed_last_sell_price_if_unset(&self, price: Decimal) -> Result<()> {
        let mut series = self.series.lock();
        if series.last_sell_price.is_some() {
            return Ok(());
        }
        series.last_sell_price = Some(price);
        self.persist(&series)
    }

    fn persist(&self, series: &DCASeries) -> Result<()> {
        let bytes = serde_json::to_vec(series)?;
        self.wal.append(&self.key, &bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, DCASeriesStore) {
        let dir = tempdir().unwrap();
        let wal = Arc::new(Wal::open(dir.path(), 1000, 10, true).unwrap());
        let store = DCASeriesStore::open(wal, "BTC_USDT").unwrap();
        (dir, store)
    }

    #[test]
    fn add_purchase_recomputes_weighted_average() {
        let (_dir, store) = store();
        store
            .add_purchase("a", dec!(100), dec!(1), Utc::now(), 1)
            .unwrap();
        store
            .add_purchase("b", dec!(80), dec!(1), Utc::now(), 2)
            .unwrap();
        let series = store.current();
        assert_eq!(series.total_amount, dec!(2));
        assert_eq!(series.avg_entry_price, dec!(90));
    }

    #[test]
    fn add_purchase_with_processed_id_is_idempotent() {
        let (_dir, store) = store();
        store
            .add_purchase("a", dec!(100), dec!(1), Utc::now(), 1)
            .unwrap();
        store
            .add_purchase("a", dec!(999), dec!(999), Utc::now(), 9)
            .unwrap();
        let series = store.current();
        assert_eq!(series.purchases.len(), 1);
        assert_eq!(series.total_amount, dec!(1));
    }

    #[test]
    fn remove_amount_consumes_lifo_preserving_oldest_lot() {
        let (_dir, store) = store();
        store
            .add_purchase("a", dec!(100), dec!(1), Utc::now(), 1)
            .unwrap();
        store
            .add_purchase("b", dec!(80), dec!(2), Utc::now(), 2)
            .unwrap();
        // Remove 2, which should fully consume the newest (b, amount 2).
        store.remove_amount(dec!(2)).unwrap();
        let series = store.current();
        assert_eq!(series.purchases.len(), 1);
        assert_eq!(series.purchases[0].id, "a");
        assert_eq!(series.total_amount, dec!(1));
        assert_eq!(series.avg_entry_price, dec!(100));
    }

    #[test]
    fn remove_amount_partially_reduces_the_final_lot() {
        let (_dir, store) = store();
        store
            .add_purchase("a", dec!(100), dec!(3), Utc::now(), 1)
            .unwrap();
        store.remove_amount(dec!(1)).unwrap();
        let series = store.current();
        assert_eq!(series.purchases.len(), 1);
        assert_eq!(series.purchases[0].amount, dec!(2));
        assert_eq!(series.total_amount, dec!(2));
    }

    #[test]
    fn remove_amount_of_exact_total_empties_series() {
        let (_dir, store) = store();
        store
            .add_purchase("a", dec!(100), dec!(1), Utc::now(), 1)
            .unwrap();
        store.remove_amount(dec!(1)).unwrap();
        let series = store.current();
        assert!(series.is_empty());
        assert_eq!(series.total_amount, dec!(0));
        // remove_amount alone does not arm waiting_for_dip.
        assert!(!series.waiting_for_dip);
    }

    #[test]
    fn reset_preserves_processed_ids_and_arms_waiting_for_dip() {
        let (_dir, store) = store();
        store
            .add_purchase("a", dec!(100), dec!(1), Utc::now(), 1)
            .unwrap();
        store.reset(dec!(120)).unwrap();
        let series = store.current();
        assert!(series.is_empty());
        assert!(series.waiting_for_dip);
        assert_eq!(series.last_sell_price, Some(dec!(120)));
        assert!(series.processed_trade_ids.contains("a"));
    }

    #[test]
    fn reopen_loads_latest_snapshot_only() {
        let dir = tempdir().unwrap();
        {
            let wal = Arc::new(Wal::open(dir.path(), 1000, 10, true).unwrap());
            let store = DCASeriesStore::open(wal, "BTC_USDT").unwrap();
            store
                .add_purchase("a", dec!(100), dec!(1), Utc::now(), 1)
                .unwrap();
            store
                .add_purchase("b", dec!(90), dec!(1), Utc::now(), 2)
                .unwrap();
        }
        let wal = Arc::new(Wal::open(dir.path(), 1000, 10, true).unwrap());
        let store = DCASeriesStore::open(wal, "BTC_USDT").unwrap();
        let series = store.current();
        assert_eq!(series.purchases.len(), 2);
        assert_eq!(series.total_amount, dec!(2));
    }
}
