// =============================================================================
// Trader & Pricer — the core's only external-collaborator contracts
// =============================================================================
//
// Everything the strategy needs from an exchange (real or simulated) goes
// through these two traits. No concrete exchange client lives in this core;
// `SimulateTrader` (simulate.rs) is the only implementation shipped here.
// =============================================================================

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::decimal::{Decimal, Pair};

#[derive(Debug, Error)]
pub enum TraderError {
    #[error("trade rejected: {0}")]
    Rejected(String),
    #[error("insufficient balance: need {need}, have {have}")]
    InsufficientBalance { need: Decimal, have: Decimal },
    #[error("unknown currency {0}")]
    UnknownCurrency(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("trader io error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, TraderError>;

/// A collaborator capable of placing and verifying orders. `client_order_id`
/// is always the originating trade-intent id; implementations must treat
/// repeated calls with the same id as idempotent (no duplicate order on the
/// venue).
#[async_trait]
pub trait Trader: Send + Sync {
    async fn buy(
        &self,
        ctx: &CancellationToken,
        pair: &Pair,
        amount: Decimal,
        client_order_id: &str,
    ) -> Result<()>;

    async fn sell(
        &self,
        ctx: &CancellationToken,
        pair: &Pair,
        amount: Decimal,
        client_order_id: &str,
    ) -> Result<()>;

    /// Returns `(executed, filled_amount)` for a previously placed order.
    async fn order_executed(
        &self,
        ctx: &CancellationToken,
        pair: &Pair,
        client_order_id: &str,
    ) -> Result<(bool, Decimal)>;

    async fn get_balance(&self, ctx: &CancellationToken, currency: &str) -> Result<Decimal>;
}

/// A source of the latest reference price for a pair.
#[async_trait]
pub trait Pricer: Send + Sync {
    async fn get_price(&self, ctx: &CancellationToken, pair: &Pair) -> Result<Decimal>;
}

/// Emitted by the strategy whenever a buy or sell is committed.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeEvent {
    pub pair: Pair,
    pub action: crate::decimal::Action,
    pub amount: Decimal,
    pub price: Decimal,
}
