// =============================================================================
// Reconciler
// =============================================================================
//
// On every tick, verifies every pending trade intent against the trader and
// applies completions to the series exactly once, surviving a crash at any
// point in "exchange confirmed, series not yet updated, intent not yet
// marked done".
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::decimal::{Decimal, Pair};
use crate::journal::{JournalError, TradeIntentJournal};
use crate::series::{DCASeriesStore, SeriesError};
use crate::trader::{Trader, TraderError};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Trader(#[from] TraderError),
    #[error(transparent)]
    Journal(#[from] JournalError),
    #[error(transparent)]
    Series(#[from] SeriesError),
    #[error("reconciliation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, ReconcileError>;

/// Verifies pending intents against a `Trader` and folds completions into
/// the series, idempotently.
pub struct Reconciler {
    journal: Arc<TradeIntentJournal>,
    series: Arc<DCASeriesStore>,
    trader: Arc<dyn Trader>,
    pair: Pair,
    partial_fill_retry_delay: Duration,
}

impl Reconciler {
    pub fn new(
        journal: Arc<TradeIntentJournal>,
        series: Arc<DCASeriesStore>,
        trader: Arc<dyn Trader>,
        pair: Pair,
    ) -> Self {
        Self {
            journal,
            series,
            trader,
            pair,
            partial_fill_retry_delay: Duration::from_secs(30),
        }
    }

    /// Override the pause observed while a partial fill is in progress.
    /// Tests use a near-zero delay.
    pub fn with_partial_fill_retry_delay(mut self, delay: Duration) -> Self {
        self.partial_fill_retry_delay = delay;
        self
    }

    pub async fn reconcile_once(&self, ctx: &CancellationToken) -> Result<()> {
        for intent in self.journal.pending() {
            if ctx.is_cancelled() {
                return Err(ReconcileError::Cancelled);
            }

            let (executed, filled) = self
                .trader
                .order_executed(ctx, &self.pair, &intent.id)
                .await?;

            if !executed && filled.is_zero() {
                self.journal.mark_failed(&intent.id, "order not executed")?;
                continue;
            }

            if !executed && filled > Decimal::ZERO {
                warn!(
                    pair = %self.pair,
                    intent_id = %intent.id,
                    %filled,
                    "partial fill in progress, deferring to next tick"
                );
                tokio::select! {
                    _ = tokio::time::sleep(self.partial_fill_retry_delay) => {}
                    _ = ctx.cancelled() => return Err(ReconcileError::Cancelled),
                }
                continue;
            }

            if executed && filled.is_zero() {
                self.journal
                    .mark_failed(&intent.id, "filled amount reported as zero")?;
                continue;
            }

            // executed && filled > 0
            let already_processed = self
                .series
                .current()
                .processed_trade_ids
                .contains(&intent.id);

            if already_processed {
                self.journal.mark_done(&intent.id)?;
                info!(pair = %self.pair, intent_id = %intent.id, "recovered crash between apply and mark_done");
                continue;
            }

            if filled != intent.amount {
                self.journal.update_amount(&intent.id, filled)?;
            }

            match intent.action {
                crate::decimal::Action::Buy => {
                    self.series.add_purchase(
                        &intent.id,
                        intent.price,
                        filled,
                        intent.time,
                        intent.trade_part,
                    )?;
                }
                crate::decimal::Action::Sell => {
                    let total_before = self.series.current().total_amount;
                    let is_full = intent.is_full_sell || filled == total_before;
                    if is_full {
                        self.series.reset(intent.price)?;
                    } else {
                        self.series.remove_amount(filled)?;
                        if self.series.current().is_empty() {
                            self.series.reset(intent.price)?;
                        }
                    }
                }
                crate::decimal::Action::Null => {}
            }

            self.journal.mark_done(&intent.id)?;
            info!(pair = %self.pair, intent_id = %intent.id, %filled, "reconciled intent");
        }

        Ok(())
    }
}
