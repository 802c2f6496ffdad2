// =============================================================================
// Balance Snapshot Log
// =============================================================================
//
// Append-only record of wallet state after every series mutation, read back
// by the SSE fan-out in api/sse.rs.
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::decimal::{Decimal, Pair};
use crate::event_log::{EventLog, Indexed, Result};
use crate::wal::Wal;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub timestamp: DateTime<Utc>,
    pub pair: Pair,
    pub base: Decimal,
    pub quote: Decimal,
    pub total_quote: Decimal,
    pub price: Decimal,
}

pub struct BalanceLog {
    inner: EventLog<BalanceSnapshot>,
}

impl BalanceLog {
    pub fn open(wal: Arc<Wal>) -> Self {
        Self {
            inner: EventLog::open(wal, "balance_snapshot"),
        }
    }

    pub fn append(&self, snapshot: &BalanceSnapshot) -> Result<u64> {
        self.inner.append(&snapshot.pair, snapshot)
    }

    pub fn after(&self, since_index: u64) -> Result<Vec<Indexed<BalanceSnapshot>>> {
        self.inner.after(since_index)
    }

    pub fn load_for_new_client(&self, keep_recent: usize) -> Result<Vec<Indexed<BalanceSnapshot>>> {
        self.inner.load_for_new_client(keep_recent)
    }

    pub fn latest_index(&self) -> u64 {
        self.inner.latest_index()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use tempfile::tempdir;

    #[test]
    fn append_and_read_back_a_snapshot() {
        let dir = tempdir().unwrap();
        let wal = Arc::new(Wal::open(dir.path(), 10_000, 10, true).unwrap());
        let log = BalanceLog::open(wal);
        let pair = Pair::new("BTC", "USDT");
        let snapshot = BalanceSnapshot {
            timestamp: Utc::now(),
            pair: pair.clone(),
            base: dec!(1),
            quote: dec!(100),
            total_quote: dec!(150),
            price: dec!(50),
        };
        let index = log.append(&snapshot).unwrap();
        let events = log.after(0).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].index, index);
        assert_eq!(events[0].value, snapshot);
    }
}
