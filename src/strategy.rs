// =============================================================================
// DCA Strategy State Machine
// =============================================================================
//
// One `DcaStrategy` owns one pair's trade WAL, intent journal, and series
// store. A worker loop calls `trade()` on a fixed interval; no other task
// is permitted to mutate this pair's state, so the strategy itself needs no
// internal locking.
// =============================================================================

use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::decimal::{percent_change, Action, Decimal, Pair};
use crate::journal::{JournalError, TradeIntentJournal};
use crate::reconcile::{ReconcileError, Reconciler};
use crate::series::{DCASeriesStore, SeriesError};
use crate::trader::{Pricer, Trader, TradeEvent, TraderError};
use crate::wal::{Wal, WalError};

#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("invalid strategy configuration: {0}")]
    Config(String),
    #[error("pricing failed: {0}")]
    Pricing(TraderError),
    #[error("trader call failed: {0}")]
    Trader(TraderError),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
    #[error(transparent)]
    Wal(#[from] WalError),
    #[error(transparent)]
    Journal(#[from] JournalError),
    #[error(transparent)]
    Series(#[from] SeriesError),
}

pub type Result<T> = std::result::Result<T, StrategyError>;

/// The result of one strategy tick. A dedicated enum rather than an
/// `Option` plus sentinel error, so callers never string-match "uninitialised"
/// out of a generic failure.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Hold,
    Bought(TradeEvent),
    Sold(TradeEvent),
    /// The series has never been seeded; caller should treat this pair as
    /// not yet initialised.
    NoData,
}

#[derive(Debug, Clone)]
pub struct StrategyConfig {
    pub pair: Pair,
    /// Total quote capital allocated across one full series.
    pub amount: Decimal,
    pub max_dca_trades: u32,
    /// Price-drop percent below `avg_entry_price` that triggers a DCA buy.
    pub dca_percent_threshold_buy: Decimal,
    /// Profit percent above `avg_entry_price` that triggers a partial sell;
    /// double this triggers a full sell.
    pub dca_percent_threshold_sell: Decimal,
}

impl StrategyConfig {
    fn validate(&self) -> Result<()> {
        if self.max_dca_trades < 1 {
            return Err(StrategyError::Config(
                "max_dca_trades must be at least 1".into(),
            ));
        }
        if self.dca_percent_threshold_buy <= Decimal::ZERO {
            return Err(StrategyError::Config(
                "dca_percent_threshold_buy must be positive".into(),
            ));
        }
        if self.dca_percent_threshold_sell <= Decimal::ZERO {
            return Err(StrategyError::Config(
                "dca_percent_threshold_sell must be positive".into(),
            ));
        }
        if self.individual_buy_amount() <= Decimal::ZERO {
            return Err(StrategyError::Config(
                "amount / max_dca_trades must be positive".into(),
            ));
        }
        Ok(())
    }

    fn individual_buy_amount(&self) -> Decimal {
        self.amount / Decimal::from(self.max_dca_trades)
    }
}

pub struct DcaStrategy {
    config: StrategyConfig,
    wal: Arc<Wal>,
    journal: Arc<TradeIntentJournal>,
    series: Arc<DCASeriesStore>,
    reconciler: Reconciler,
    trader: Arc<dyn Trader>,
    pricer: Arc<dyn Pricer>,
    clock: Arc<dyn Clock>,
    trade_part: u32,
    individual_buy_amount: Decimal,
}

impl std::fmt::Debug for DcaStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DcaStrategy")
            .field("config", &self.config)
            .field("trade_part", &self.trade_part)
            .field("individual_buy_amount", &self.individual_buy_amount)
            .finish_non_exhaustive()
    }
}

impl DcaStrategy {
    /// Open (or recover) this pair's WAL directory and rebuild state from it.
    pub fn open(
        config: StrategyConfig,
        wal_dir: impl AsRef<std::path::Path>,
        segment_threshold: usize,
        max_segments: usize,
        trader: Arc<dyn Trader>,
        pricer: Arc<dyn Pricer>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let individual_buy_amount = config.individual_buy_amount();

        let pair_dir = wal_dir.as_ref().join(config.pair.namespace());
        let wal = Arc::new(Wal::open(pair_dir, segment_threshold, max_segments, true)?);
        let journal = Arc::new(TradeIntentJournal::open(wal.clone())?);
        let series = Arc::new(DCASeriesStore::open(wal.clone(), &config.pair.namespace())?);

        let trade_part = series.current().purchases.len() as u32;
        let reconciler = Reconciler::new(
            journal.clone(),
            series.clone(),
            trader.clone(),
            config.pair.clone(),
        );

        Ok(Self {
            config,
            wal,
            journal,
            series,
            reconciler,
            trader,
            pricer,
            clock,
            trade_part,
            individual_buy_amount,
        })
    }

    pub fn pair(&self) -> &Pair {
        &self.config.pair
    }

    pub fn series(&self) -> Arc<DCASeriesStore> {
        self.series.clone()
    }

    pub fn journal(&self) -> Arc<TradeIntentJournal> {
        self.journal.clone()
    }

    /// Seed the strategy on first boot: reconcile, then if no sell price
    /// has ever been recorded, anchor it to the current price; if the
    /// series is empty, perform one seed buy.
    pub async fn initialize(&mut self, ctx: &CancellationToken) -> Result<()> {
        self.reconciler.reconcile_once(ctx).await?;
        self.trade_part = self.series.current().purchases.len() as u32;
        let price = self
            .pricer
            .get_price(ctx, &self.config.pair)
            .await
            .map_err(StrategyError::Pricing)?;

        self.series.seed_last_sell_price_if_unset(price)?;

        if self.series.current().is_empty() {
            self.act_buy(ctx, price).await?;
        }
        Ok(())
    }

    /// Run one tick: reconcile pending intents, fetch price, decide.
    pub async fn trade(&mut self, ctx: &CancellationToken) -> Result<TickOutcome> {
        self.reconciler.reconcile_once(ctx).await?;
        self.trade_part = self.series.current().purchases.len() as u32;

        let price = self
            .pricer
            .get_price(ctx, &self.config.pair)
            .await
            .map_err(StrategyError::Pricing)?;

        let series = self.series.current();

        if series.waiting_for_dip {
            let Some(last_sell_price) = series.last_sell_price else {
                return Ok(TickOutcome::Hold);
            };
            let change = percent_change(price, last_sell_price);
            if change <= -self.config.dca_percent_threshold_buy {
                self.series.set_waiting_for_dip(false)?;
                return match self.act_buy(ctx, price).await {
                    Ok(event) => Ok(TickOutcome::Bought(event)),
                    Err(e) => {
                        // Restore the flag so the next tick re-evaluates the dip.
                        self.series.set_waiting_for_dip(true)?;
                        Err(e)
                    }
                };
            }
            return Ok(TickOutcome::Hold);
        }

        if series.is_empty() {
            return Ok(TickOutcome::NoData);
        }

        let pct = (price - series.avg_entry_price).abs() / series.avg_entry_price
            * Decimal::ONE_HUNDRED;

        if price < series.avg_entry_price && pct >= self.config.dca_percent_threshold_buy {
            if self.trade_part < self.config.max_dca_trades {
                let event = self.act_buy(ctx, price).await?;
                return Ok(TickOutcome::Bought(event));
            }
            return Ok(TickOutcome::Hold);
        }

        if price > series.avg_entry_price && pct >= self.config.dca_percent_threshold_sell {
            return self.act_sell(ctx, price).await;
        }

        Ok(TickOutcome::Hold)
    }

    async fn act_buy(&mut self, ctx: &CancellationToken, price: Decimal) -> Result<TradeEvent> {
        let now = self.clock.now();
        let intent = self.journal.prepare(
            Action::Buy,
            price,
            self.individual_buy_amount,
            now,
            self.trade_part + 1,
            false,
        )?;

        if let Err(e) = self
            .trader
            .buy(ctx, &self.config.pair, self.individual_buy_amount, &intent.id)
            .await
        {
            self.journal.mark_failed(&intent.id, e.to_string())?;
            return Err(StrategyError::Trader(e));
        }

        self.series.add_purchase(
            &intent.id,
            price,
            self.individual_buy_amount,
            now,
            self.trade_part + 1,
        )?;
        self.trade_part = self.series.current().purchases.len() as u32;
        self.journal.mark_done(&intent.id)?;

        info!(pair = %self.config.pair, %price, amount = %self.individual_buy_amount, "dca buy executed");

        Ok(TradeEvent {
            pair: self.config.pair.clone(),
            action: Action::Buy,
            amount: self.individual_buy_amount,
            price,
        })
    }

    async fn act_sell(&mut self, ctx: &CancellationToken, price: Decimal) -> Result<TickOutcome> {
        let series = self.series.current();
        let profit_pct = percent_change(price, series.avg_entry_price);

        let mut amount_to_sell = if profit_pct >= self.config.dca_percent_threshold_sell * Decimal::TWO {
            series.total_amount
        } else if profit_pct >= self.config.dca_percent_threshold_sell {
            self.individual_buy_amount
        } else {
            return Ok(TickOutcome::Hold);
        };

        if amount_to_sell > series.total_amount {
            amount_to_sell = series.total_amount;
        }
        if amount_to_sell <= Decimal::ZERO {
            return Ok(TickOutcome::Hold);
        }

        let is_full_sell = amount_to_sell == series.total_amount;
        let now = self.clock.now();
        let intent = self
            .journal
            .prepare(Action::Sell, price, amount_to_sell, now, 0, is_full_sell)?;

        if let Err(e) = self
            .trader
            .sell(ctx, &self.config.pair, amount_to_sell, &intent.id)
            .await
        {
            self.journal.mark_failed(&intent.id, e.to_string())?;
            return Err(StrategyError::Trader(e));
        }

        if is_full_sell {
            self.series.reset(price)?;
        } else {
            self.series.remove_amount(amount_to_sell)?;
            if self.series.current().is_empty() {
                self.series.reset(price)?;
            }
        }
        self.journal.mark_done(&intent.id)?;

        info!(pair = %self.config.pair, %price, amount = %amount_to_sell, is_full_sell, "dca sell executed");

        Ok(TickOutcome::Sold(TradeEvent {
            pair: self.config.pair.clone(),
            action: Action::Sell,
            amount: amount_to_sell,
            price,
        }))
    }

    pub fn close(&self) -> Result<()> {
        self.wal.close()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::trader::mock::{MockPricer, MockTrader};
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use tempfile::tempdir;

    fn config() -> StrategyConfig {
        StrategyConfig {
            pair: Pair::new("BTC", "USDT"),
            amount: dec!(1000),
            max_dca_trades: 5,
            dca_percent_threshold_buy: dec!(5),
            dca_percent_threshold_sell: dec!(3),
        }
    }

    fn harness(
        prices: impl IntoIterator<Item = Decimal>,
    ) -> (tempfile::TempDir, DcaStrategy, Arc<MockTrader>) {
        let dir = tempdir().unwrap();
        let trader = Arc::new(MockTrader::new());
        let pricer = Arc::new(MockPricer::new(prices));
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let strategy = DcaStrategy::open(
            config(),
            dir.path(),
            1000,
            10,
            trader.clone(),
            pricer,
            clock,
        )
        .unwrap();
        (dir, strategy, trader)
    }

    #[test]
    fn construction_rejects_invalid_thresholds() {
        let dir = tempdir().unwrap();
        let mut bad = config();
        bad.dca_percent_threshold_buy = dec!(0);
        let trader = Arc::new(MockTrader::new());
        let pricer = Arc::new(MockPricer::new([]));
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let err = DcaStrategy::open(bad, dir.path(), 1000, 10, trader, pricer, clock).unwrap_err();
        assert!(matches!(err, StrategyError::Config(_)));
    }

    #[tokio::test]
    async fn initialize_seeds_a_first_buy_when_series_is_empty() {
        let (_dir, mut strategy, _trader) = harness([dec!(50000)]);
        strategy.initialize(&CancellationToken::new()).await.unwrap();
        let series = strategy.series().current();
        assert_eq!(series.purchases.len(), 1);
        assert_eq!(series.avg_entry_price, dec!(50000));
    }

    #[tokio::test]
    async fn tick_holds_with_no_series_and_not_waiting_for_dip() {
        let (_dir, mut strategy, _trader) = harness([dec!(50000)]);
        let outcome = strategy.trade(&CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, TickOutcome::NoData);
    }

    #[tokio::test]
    async fn price_drop_below_threshold_triggers_dca_buy() {
        let (_dir, mut strategy, _trader) = harness([dec!(50000), dec!(47000)]);
        strategy.initialize(&CancellationToken::new()).await.unwrap();
        let outcome = strategy.trade(&CancellationToken::new()).await.unwrap();
        assert!(matches!(outcome, TickOutcome::Bought(_)));
        let series = strategy.series().current();
        assert_eq!(series.purchases.len(), 2);
    }

    #[tokio::test]
    async fn price_rise_above_sell_threshold_triggers_partial_sell() {
        let (_dir, mut strategy, _trader) = harness([dec!(50000), dec!(51600)]);
        strategy.initialize(&CancellationToken::new()).await.unwrap();
        let outcome = strategy.trade(&CancellationToken::new()).await.unwrap();
        assert!(matches!(outcome, TickOutcome::Sold(_)));
        let series = strategy.series().current();
        // Partial sell of one individual_buy_amount out of the single lot.
        assert!(series.total_amount < dec!(1) || series.is_empty());
    }

    #[tokio::test]
    async fn price_rise_above_double_sell_threshold_triggers_full_sell_and_arms_waiting_for_dip() {
        let (_dir, mut strategy, _trader) = harness([dec!(50000), dec!(53100)]);
        strategy.initialize(&CancellationToken::new()).await.unwrap();
        let outcome = strategy.trade(&CancellationToken::new()).await.unwrap();
        assert!(matches!(outcome, TickOutcome::Sold(_)));
        let series = strategy.series().current();
        assert!(series.is_empty());
        assert!(series.waiting_for_dip);
        assert_eq!(series.last_sell_price, Some(dec!(53100)));
    }

    #[tokio::test]
    async fn waiting_for_dip_tick_never_emits_a_sell() {
        let (_dir, mut strategy, _trader) = harness([dec!(50000), dec!(53100), dec!(60000)]);
        strategy.initialize(&CancellationToken::new()).await.unwrap();
        strategy.trade(&CancellationToken::new()).await.unwrap(); // full sell, arms waiting_for_dip
        let outcome = strategy.trade(&CancellationToken::new()).await.unwrap();
        assert!(!matches!(outcome, TickOutcome::Sold(_)));
    }

    #[tokio::test]
    async fn dip_below_last_sell_price_reopens_the_series() {
        let (_dir, mut strategy, _trader) = harness([dec!(50000), dec!(53100), dec!(50400)]);
        strategy.initialize(&CancellationToken::new()).await.unwrap();
        strategy.trade(&CancellationToken::new()).await.unwrap(); // full sell @ 53100, waiting_for_dip
        let outcome = strategy.trade(&CancellationToken::new()).await.unwrap(); // -5.08% dip
        assert!(matches!(outcome, TickOutcome::Bought(_)));
        let series = strategy.series().current();
        assert!(!series.waiting_for_dip);
        assert_eq!(series.purchases.len(), 1);
    }

    #[tokio::test]
    async fn max_dca_trades_caps_further_buys() {
        let mut cfg = config();
        cfg.max_dca_trades = 1;
        let dir = tempdir().unwrap();
        let trader = Arc::new(MockTrader::new());
        let pricer = Arc::new(MockPricer::new([dec!(50000), dec!(47000)]));
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let mut strategy =
            DcaStrategy::open(cfg, dir.path(), 1000, 10, trader, pricer, clock).unwrap();
        strategy.initialize(&CancellationToken::new()).await.unwrap();
        let outcome = strategy.trade(&CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, TickOutcome::Hold);
        assert_eq!(strategy.series().current().purchases.len(), 1);
    }
}
