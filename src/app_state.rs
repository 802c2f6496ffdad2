// =============================================================================
// Central Application State — DCA Engine
// =============================================================================
//
// The single source of truth shared across the HTTP surface and every
// per-pair worker task. Subsystems that need interior mutability manage it
// themselves (`DCASeriesStore`, `TradeIntentJournal`, `BalanceLog`,
// `DecisionLog` all carry their own `parking_lot` locking); `AppState` just
// ties the `Arc`s together and exposes a read-only snapshot for the API.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;

use crate::balance_log::BalanceLog;
use crate::decimal::Pair;
use crate::decision_log::DecisionLog;
use crate::journal::TradeIntentJournal;
use crate::series::DCASeriesStore;

/// Per-pair handles the API layer needs to answer `/pairs` without talking
/// to the worker task directly (the worker remains the sole writer).
pub struct PairHandle {
    pub pair: Pair,
    pub series: Arc<DCASeriesStore>,
    pub journal: Arc<TradeIntentJournal>,
    pub last_error: RwLock<Option<String>>,
}

/// Central application state shared across all async tasks via `Arc<AppState>`.
pub struct AppState {
    /// Monotonically increasing version counter, bumped on every meaningful
    /// state mutation. Exposed so dashboard polling can cheaply detect "has
    /// anything changed" without diffing a snapshot.
    pub version: AtomicU64,

    pub pairs: RwLock<HashMap<String, Arc<PairHandle>>>,
    pub balance_log: Arc<BalanceLog>,
    pub decision_log: Arc<DecisionLog>,
    pub sse_poll_interval: Duration,
    pub sse_heartbeat_interval: Duration,
    pub snapshot_thinning_keep_recent: usize,
}

impl AppState {
    pub fn new(balance_log: Arc<BalanceLog>, decision_log: Arc<DecisionLog>) -> Self {
        Self {
            version: AtomicU64::new(0),
            pairs: RwLock::new(HashMap::new()),
            balance_log,
            decision_log,
            sse_poll_interval: Duration::from_secs(3),
            sse_heartbeat_interval: Duration::from_secs(25),
            snapshot_thinning_keep_recent: 100,
        }
    }

    pub fn with_sse_tuning(
        mut self,
        poll_interval: Duration,
        heartbeat_interval: Duration,
        thinning_keep_recent: usize,
    ) -> Self {
        self.sse_poll_interval = poll_interval;
        self.sse_heartbeat_interval = heartbeat_interval;
        self.snapshot_thinning_keep_recent = thinning_keep_recent;
        self
    }

    pub fn register_pair(
        &self,
        pair: Pair,
        series: Arc<DCASeriesStore>,
        journal: Arc<TradeIntentJournal>,
    ) {
        let handle = Arc::new(PairHandle {
            pair: pair.clone(),
            series,
            journal,
            last_error: RwLock::new(None),
        });
        self.pairs.write().insert(pair.namespace(), handle);
        self.bump_version();
    }

    pub fn record_error(&self, pair: &Pair, message: impl Into<String>) {
        if let Some(handle) = self.pairs.read().get(&pair.namespace()) {
            *handle.last_error.write() = Some(message.into());
        }
        self.bump_version();
    }

    pub fn clear_error(&self, pair: &Pair) {
        if let Some(handle) = self.pairs.read().get(&pair.namespace()) {
            *handle.last_error.write() = None;
        }
    }

    pub fn bump_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn build_snapshot(&self) -> StateSnapshot {
        let pairs = self
            .pairs
            .read()
            .values()
            .map(|handle| {
                let series = handle.series.current();
                PairSnapshot {
                    pair: handle.pair.clone(),
                    total_amount: series.total_amount,
                    avg_entry_price: series.avg_entry_price,
                    waiting_for_dip: series.waiting_for_dip,
                    last_sell_price: series.last_sell_price,
                    pending_intents: handle.journal.pending().len(),
                    last_error: handle.last_error.read().clone(),
                }
            })
            .collect();

        StateSnapshot {
            version: self.version.load(Ordering::SeqCst),
            pairs,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PairSnapshot {
    pub pair: Pair,
    pub total_amount: crate::decimal::Decimal,
    pub avg_entry_price: crate::decimal::Decimal,
    pub waiting_for_dip: bool,
    pub last_sell_price: Option<crate::decimal::Decimal>,
    pub pending_intents: usize,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub version: u64,
    pub pairs: Vec<PairSnapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::Wal;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn snapshot_reflects_registered_pairs_and_bumps_version() {
        let dir = tempdir().unwrap();
        let balance_wal = Arc::new(Wal::open(dir.path().join("balance"), 1000, 10, true).unwrap());
        let decision_wal = Arc::new(Wal::open(dir.path().join("decision"), 1000, 10, true).unwrap());
        let state = AppState::new(
            Arc::new(BalanceLog::open(balance_wal)),
            Arc::new(DecisionLog::open(decision_wal)),
        );

        let pair = Pair::new("BTC", "USDT");
        let pair_wal = Arc::new(Wal::open(dir.path().join("btc_usdt"), 1000, 10, true).unwrap());
        let series = Arc::new(DCASeriesStore::open(pair_wal.clone(), &pair.namespace()).unwrap());
        let journal = Arc::new(TradeIntentJournal::open(pair_wal).unwrap());

        let before = state.version.load(Ordering::SeqCst);
        state.register_pair(pair.clone(), series, journal);
        assert!(state.version.load(Ordering::SeqCst) > before);

        let snapshot = state.build_snapshot();
        assert_eq!(snapshot.pairs.len(), 1);
        assert_eq!(snapshot.pairs[0].pair, pair);
    }

    #[test]
    fn record_error_surfaces_on_the_pair_snapshot() {
        let dir = tempdir().unwrap();
        let balance_wal = Arc::new(Wal::open(dir.path().join("balance"), 1000, 10, true).unwrap());
        let decision_wal = Arc::new(Wal::open(dir.path().join("decision"), 1000, 10, true).unwrap());
        let state = AppState::new(
            Arc::new(BalanceLog::open(balance_wal)),
            Arc::new(DecisionLog::open(decision_wal)),
        );
        let pair = Pair::new("BTC", "USDT");
        let pair_wal = Arc::new(Wal::open(dir.path().join("btc_usdt"), 1000, 10, true).unwrap());
        let series = Arc::new(DCASeriesStore::open(pair_wal.clone(), &pair.namespace()).unwrap());
        let journal = Arc::new(TradeIntentJournal::open(pair_wal).unwrap());
        state.register_pair(pair.clone(), series, journal);

        state.record_error(&pair, "pricer unavailable");
        let snapshot = state.build_snapshot();
        assert_eq!(snapshot.pairs[0].last_error.as_deref(), Some("pricer unavailable"));
    }
}
