// =============================================================================
// Simulate Trader — deterministic in-process broker
// =============================================================================
//
// Implements both `Trader` and `Pricer` against an in-memory wallet and
// position, so a strategy can run against it exactly as it would against a
// real exchange client. State is persisted atomically (tmp + rename, the
// same pattern this codebase uses for its runtime config) so a dry run
// survives a restart.
// =============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::decimal::{Decimal, Pair};
use crate::trader::{Pricer, Trader, TraderError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub entry_price: Decimal,
    pub amount: Decimal,
    pub side: Side,
    pub entry_time: DateTime<Utc>,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SimState {
    pair: Pair,
    wallet: HashMap<String, Decimal>,
    margin_used: Decimal,
    position: Option<Position>,
}

impl SimState {
    fn empty(pair: Pair, wallet: HashMap<String, Decimal>) -> Self {
        Self {
            pair,
            wallet,
            margin_used: Decimal::ZERO,
            position: None,
        }
    }
}

/// What the simulator recorded for an order this process lifetime. Not
/// persisted: a restart forgets in-flight orders by design, so the
/// reconciler discovers their true fate is unknown and marks them failed.
struct OrderRecord {
    amount: Decimal,
    #[allow(dead_code)]
    side: Side,
}

pub struct SimulateTrader {
    pair: Pair,
    state_path: PathBuf,
    state: RwLock<SimState>,
    orders: Mutex<HashMap<String, OrderRecord>>,
    current_price: RwLock<Option<Decimal>>,
    leverage: Decimal,
    clock: Arc<dyn Clock>,
}

impl SimulateTrader {
    /// Open (or initialise) this pair's simulator state under `state_dir`.
    pub fn open(
        pair: Pair,
        state_dir: impl AsRef<Path>,
        starting_wallet: HashMap<String, Decimal>,
        leverage: Decimal,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, TraderError> {
        std::fs::create_dir_all(&state_dir).map_err(|e| TraderError::Io(e.to_string()))?;
        let state_path = state_dir.as_ref().join(format!("{}.json", pair.namespace()));

        let state = if state_path.exists() {
            let content =
                std::fs::read_to_string(&state_path).map_err(|e| TraderError::Io(e.to_string()))?;
            serde_json::from_str(&content).map_err(|e| TraderError::Io(e.to_string()))?
        } else {
            SimState::empty(pair.clone(), starting_wallet)
        };

        Ok(Self {
            pair,
            state_path,
            state: RwLock::new(state),
            orders: Mutex::new(HashMap::new()),
            current_price: RwLock::new(None),
            leverage,
            clock,
        })
    }

    /// Feed the simulator its next reference price. Called by the backtest
    /// or dry-run harness driving it; the DCA core itself only ever reads
    /// price through the `Pricer` trait.
    pub fn set_price(&self, price: Decimal) {
        *self.current_price.write() = Some(price);
    }

    pub fn wallet_balance(&self, currency: &str) -> Decimal {
        self.state
            .read()
            .wallet
            .get(currency)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    pub fn position(&self) -> Option<Position> {
        self.state.read().position.clone()
    }

    /// The last price fed via `set_price`, if any. Used by harnesses that
    /// need to derive the next tick's price from the current one.
    pub fn current_price(&self) -> Option<Decimal> {
        *self.current_price.read()
    }

    fn require_price(&self) -> Result<Decimal, TraderError> {
        self.current_price
            .read()
            .ok_or_else(|| TraderError::Io("simulate trader has no price yet".into()))
    }

    fn cost_of(&self, amount: Decimal, price: Decimal) -> Decimal {
        if self.leverage > Decimal::ONE {
            amount * price / self.leverage
        } else {
            amount * price
        }
    }

    fn persist(&self) -> Result<(), TraderError> {
        let state = self.state.read();
        let content =
            serde_json::to_string_pretty(&*state).map_err(|e| TraderError::Io(e.to_string()))?;
        drop(state);

        let tmp_path = self.state_path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content).map_err(|e| TraderError::Io(e.to_string()))?;
        std::fs::rename(&tmp_path, &self.state_path).map_err(|e| TraderError::Io(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl Pricer for SimulateTrader {
    async fn get_price(
        &self,
        _ctx: &CancellationToken,
        _pair: &Pair,
    ) -> crate::trader::Result<Decimal> {
        self.require_price()
    }
}

#[async_trait]
impl Trader for SimulateTrader {
    async fn buy(
        &self,
        _ctx: &CancellationToken,
        _pair: &Pair,
        amount: Decimal,
        client_order_id: &str,
    ) -> crate::trader::Result<()> {
        let price = self.require_price()?;
        let cost = self.cost_of(amount, price);

        let mut state = self.state.write();
        let have = state.wallet.get(&self.pair.to).copied().unwrap_or(Decimal::ZERO);
        if have < cost {
            return Err(TraderError::InsufficientBalance { need: cost, have });
        }
        *state.wallet.entry(self.pair.to.clone()).or_insert(Decimal::ZERO) -= cost;
        if self.leverage > Decimal::ONE {
            state.margin_used += cost;
        }

        match &mut state.position {
            Some(pos) => {
                let new_amount = pos.amount + amount;
                pos.entry_price = (pos.entry_price * pos.amount + price * amount) / new_amount;
                pos.amount = new_amount;
            }
            None => {
                state.position = Some(Position {
                    entry_price: price,
                    amount,
                    side: Side::Long,
                    entry_time: self.clock.now(),
                    stop_loss: None,
                    take_profit: None,
                });
            }
        }
        drop(state);
        self.persist()?;

        self.orders.lock().insert(
            client_order_id.to_string(),
            OrderRecord {
                amount,
                side: Side::Long,
            },
        );

        info!(pair = %self.pair, %amount, %price, client_order_id, "simulated buy filled");
        Ok(())
    }

    async fn sell(
        &self,
        _ctx: &CancellationToken,
        _pair: &Pair,
        amount: Decimal,
        client_order_id: &str,
    ) -> crate::trader::Result<()> {
        let price = self.require_price()?;

        let mut state = self.state.write();
        let Some(pos) = state.position.clone() else {
            return Err(TraderError::Rejected("no open position to sell".into()));
        };
        if pos.amount < amount {
            return Err(TraderError::Rejected(format!(
                "sell amount {amount} exceeds open position {}",
                pos.amount
            )));
        }

        let realized_pnl = (price - pos.entry_price) * amount;
        let margin_release = if self.leverage > Decimal::ONE {
            self.cost_of(amount, pos.entry_price)
        } else {
            Decimal::ZERO
        };
        let proceeds = if self.leverage > Decimal::ONE {
            margin_release + realized_pnl
        } else {
            amount * price
        };

        *state.wallet.entry(self.pair.to.clone()).or_insert(Decimal::ZERO) += proceeds;
        state.margin_used -= margin_release;

        let remaining = pos.amount - amount;
        if remaining <= Decimal::ZERO {
            state.position = None;
        } else {
            state.position = Some(Position {
                amount: remaining,
                ..pos
            });
        }
        drop(state);
        self.persist()?;

        self.orders.lock().insert(
            client_order_id.to_string(),
            OrderRecord {
                amount,
                side: Side::Short,
            },
        );

        info!(pair = %self.pair, %amount, %price, %realized_pnl, client_order_id, "simulated sell filled");
        Ok(())
    }

    async fn order_executed(
        &self,
        _ctx: &CancellationToken,
        _pair: &Pair,
        client_order_id: &str,
    ) -> crate::trader::Result<(bool, Decimal)> {
        match self.orders.lock().get(client_order_id) {
            Some(record) => Ok((true, record.amount)),
            None => {
                warn!(
                    client_order_id,
                    "order not found in this process lifetime; reporting executed with zero fill"
                );
                Ok((true, Decimal::ZERO))
            }
        }
    }

    async fn get_balance(
        &self,
        _ctx: &CancellationToken,
        currency: &str,
    ) -> crate::trader::Result<Decimal> {
        Ok(self.wallet_balance(currency))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use rust_decimal_macros::dec;
    use tempfile::tempdir;

    fn wallet(quote: Decimal) -> HashMap<String, Decimal> {
        let mut w = HashMap::new();
        w.insert("USDT".to_string(), quote);
        w
    }

    #[tokio::test]
    async fn buy_deducts_quote_and_opens_position() {
        let dir = tempdir().unwrap();
        let trader = SimulateTrader::open(
            Pair::new("BTC", "USDT"),
            dir.path(),
            wallet(dec!(10000)),
            Decimal::ONE,
            Arc::new(SystemClock),
        )
        .unwrap();
        trader.set_price(dec!(100));
        trader
            .buy(&CancellationToken::new(), &Pair::new("BTC", "USDT"), dec!(10), "i1")
            .await
            .unwrap();

        assert_eq!(trader.wallet_balance("USDT"), dec!(9000));
        assert_eq!(trader.position().unwrap().amount, dec!(10));
    }

    #[tokio::test]
    async fn buy_with_insufficient_balance_is_rejected_without_state_change() {
        let dir = tempdir().unwrap();
        let trader = SimulateTrader::open(
            Pair::new("BTC", "USDT"),
            dir.path(),
            wallet(dec!(50)),
            Decimal::ONE,
            Arc::new(SystemClock),
        )
        .unwrap();
        trader.set_price(dec!(100));
        let err = trader
            .buy(&CancellationToken::new(), &Pair::new("BTC", "USDT"), dec!(10), "i1")
            .await
            .unwrap_err();
        assert!(matches!(err, TraderError::InsufficientBalance { .. }));
        assert_eq!(trader.wallet_balance("USDT"), dec!(50));
        assert!(trader.position().is_none());
    }

    #[tokio::test]
    async fn sell_realizes_pnl_and_closes_position() {
        let dir = tempdir().unwrap();
        let trader = SimulateTrader::open(
            Pair::new("BTC", "USDT"),
            dir.path(),
            wallet(dec!(1000)),
            Decimal::ONE,
            Arc::new(SystemClock),
        )
        .unwrap();
        trader.set_price(dec!(100));
        trader
            .buy(&CancellationToken::new(), &Pair::new("BTC", "USDT"), dec!(5), "i1")
            .await
            .unwrap();

        trader.set_price(dec!(120));
        trader
            .sell(&CancellationToken::new(), &Pair::new("BTC", "USDT"), dec!(5), "i2")
            .await
            .unwrap();

        assert!(trader.position().is_none());
        // started with 1000, spent 500 on the buy, received 600 on the sell.
        assert_eq!(trader.wallet_balance("USDT"), dec!(1100));
    }

    #[tokio::test]
    async fn order_executed_reports_zero_fill_for_unknown_id() {
        let dir = tempdir().unwrap();
        let trader = SimulateTrader::open(
            Pair::new("BTC", "USDT"),
            dir.path(),
            wallet(dec!(1000)),
            Decimal::ONE,
            Arc::new(SystemClock),
        )
        .unwrap();
        let (executed, filled) = trader
            .order_executed(&CancellationToken::new(), &Pair::new("BTC", "USDT"), "ghost")
            .await
            .unwrap();
        assert!(executed);
        assert_eq!(filled, Decimal::ZERO);
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = tempdir().unwrap();
        let pair = Pair::new("BTC", "USDT");
        {
            let trader = SimulateTrader::open(
                pair.clone(),
                dir.path(),
                wallet(dec!(1000)),
                Decimal::ONE,
                Arc::new(SystemClock),
            )
            .unwrap();
            trader.set_price(dec!(100));
            trader
                .buy(&CancellationToken::new(), &pair, dec!(2), "i1")
                .await
                .unwrap();
        }
        let trader = SimulateTrader::open(
            pair,
            dir.path(),
            wallet(dec!(999999)),
            Decimal::ONE,
            Arc::new(SystemClock),
        )
        .unwrap();
        // Reloaded balance reflects the persisted state, not the fresh
        // starting wallet supplied on this second open.
        assert_eq!(trader.wallet_balance("USDT"), dec!(800));
        assert_eq!(trader.position().unwrap().amount, dec!(2));
    }
}
