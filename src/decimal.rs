// =============================================================================
// Decimal & Pair Primitives
// =============================================================================
//
// All money, price, and ratio math in the engine goes through `Decimal`
// (rust_decimal, configured to serialize as a string everywhere) so that
// persisted state and threshold comparisons never touch a binary float.
// =============================================================================

use std::fmt;

pub use rust_decimal::Decimal;
use rust_decimal::RoundingStrategy;
use serde::{Deserialize, Serialize};

/// Floor-round `value` to `dp` fractional digits (truncation toward zero for
/// positive values, which is what "floor" means for the non-negative amounts
/// and prices this engine deals in).
pub fn floor_to(value: Decimal, dp: u32) -> Decimal {
    value.round_dp_with_strategy(dp, RoundingStrategy::ToZero)
}

/// Compute `(a - b) / b * 100`, the signed percent change from `b` to `a`.
///
/// Returns `Decimal::ZERO` if `b` is zero (callers only invoke this once a
/// reference price is known to be nonzero, but the fallback keeps this total
/// rather than panicking).
pub fn percent_change(a: Decimal, b: Decimal) -> Decimal {
    if b.is_zero() {
        return Decimal::ZERO;
    }
    (a - b) / b * Decimal::ONE_HUNDRED
}

/// A trading pair identity, e.g. `BTC/USDT`. Immutable after construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pair {
    pub from: String,
    pub to: String,
}

impl Pair {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }

    /// Parse a pair out of its canonical `FROM_TO` form.
    pub fn parse(s: &str) -> Option<Self> {
        let (from, to) = s.split_once('_')?;
        if from.is_empty() || to.is_empty() {
            return None;
        }
        Some(Self::new(from, to))
    }

    /// The WAL/state namespace for this pair: `FROM_TO`.
    pub fn namespace(&self) -> String {
        format!("{}_{}", self.from, self.to)
    }
}

impl fmt::Display for Pair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.from, self.to)
    }
}

/// The closed set of actions the DCA core can take. A separate long/short
/// taxonomy exists only in margin strategy variants and is not part of this
/// core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Null,
    Buy,
    Sell,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn pair_round_trips_through_namespace() {
        let pair = Pair::new("BTC", "USDT");
        assert_eq!(pair.namespace(), "BTC_USDT");
        assert_eq!(pair.to_string(), "BTC_USDT");
        assert_eq!(Pair::parse("BTC_USDT"), Some(pair));
    }

    #[test]
    fn pair_parse_rejects_malformed_input() {
        assert_eq!(Pair::parse("BTCUSDT"), None);
        assert_eq!(Pair::parse("_USDT"), None);
        assert_eq!(Pair::parse("BTC_"), None);
    }

    #[test]
    fn percent_change_matches_scenario_1_first_dca_trigger() {
        // 50000 -> 47000 is a -6% move, which crosses a 5% DCA-buy threshold.
        let change = percent_change(dec!(47000), dec!(50000));
        assert_eq!(change, dec!(-6.00));
        assert!(change <= dec!(-5));
    }

    #[test]
    fn floor_to_truncates_without_rounding_up() {
        assert_eq!(floor_to(dec!(1.23999), 2), dec!(1.23));
        assert_eq!(floor_to(dec!(1.0), 4), dec!(1.0000));
    }
}
