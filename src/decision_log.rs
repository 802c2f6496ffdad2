// =============================================================================
// Decision Log
// =============================================================================
//
// Sibling of the balance-snapshot log: records what a strategy tick decided
// (hold/buy/sell) and why, independent of whether the decision produced a
// balance-changing fill. Reuses the same `EventLog` machinery.
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::decimal::{Action, Decimal, Pair};
use crate::event_log::{EventLog, Indexed, Result};
use crate::wal::Wal;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub timestamp: DateTime<Utc>,
    pub pair: Pair,
    pub action: Action,
    pub reason: String,
    pub price: Decimal,
}

pub struct DecisionLog {
    inner: EventLog<Decision>,
}

impl DecisionLog {
    pub fn open(wal: Arc<Wal>) -> Self {
        Self {
            inner: EventLog::open(wal, "decision"),
        }
    }

    pub fn append(&self, decision: &Decision) -> Result<u64> {
        self.inner.append(&decision.pair, decision)
    }

    pub fn after(&self, since_index: u64) -> Result<Vec<Indexed<Decision>>> {
        self.inner.after(since_index)
    }

    pub fn load_for_new_client(&self, keep_recent: usize) -> Result<Vec<Indexed<Decision>>> {
        self.inner.load_for_new_client(keep_recent)
    }

    pub fn latest_index(&self) -> u64 {
        self.inner.latest_index()
    }
}
