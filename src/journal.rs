// =============================================================================
// Trade-intent Journal
// =============================================================================
//
// A typed view over a `Wal` recording the `pending -> done|failed` lifecycle
// of every order the strategy intends to place. The journal is the sole
// authority on "did this order reach the exchange" — the strategy never
// infers that from trader state directly.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::decimal::{Action, Decimal};
use crate::wal::{Wal, WalError};

#[derive(Debug, Error)]
pub enum JournalError {
    #[error(transparent)]
    Wal(#[from] WalError),
    #[error("decode failure for trade intent record: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("trade intent {0} not found")]
    NotFound(String),
    #[error("trade intent {id} is already {status} and cannot transition again")]
    AlreadyTerminal { id: String, status: &'static str },
}

pub type Result<T> = std::result::Result<T, JournalError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum IntentStatus {
    Pending,
    Done,
    Failed { cause: String },
}

impl IntentStatus {
    fn label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Done => "done",
            Self::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeIntent {
    pub id: String,
    #[serde(flatten)]
    pub status: IntentStatus,
    pub action: Action,
    pub price: Decimal,
    pub amount: Decimal,
    pub time: DateTime<Utc>,
    pub trade_part: u32,
    pub is_full_sell: bool,
}

fn key_for(id: &str) -> String {
    format!("trade_intent_{id}")
}

/// Typed view over a per-pair `Wal` that records trade intents.
pub struct TradeIntentJournal {
    wal: std::sync::Arc<Wal>,
    intents: Mutex<HashMap<String, TradeIntent>>,
}

impl TradeIntentJournal {
    /// Replay `wal` to rebuild the latest-record-per-id view.
    pub fn open(wal: std::sync::Arc<Wal>) -> Result<Self> {
        let mut intents = HashMap::new();
        for record in wal.iterate()? {
            if !record.key.starts_with("trade_intent_") {
                continue;
            }
            let intent: TradeIntent = serde_json::from_slice(&record.value)?;
            intents.insert(intent.id.clone(), intent);
        }
        Ok(Self {
            wal,
            intents: Mutex::new(intents),
        })
    }

    /// Allocate a fresh id, commit a `pending` record, and return the intent.
    /// No network call is made here.
    pub fn prepare(
        &self,
        action: Action,
        price: Decimal,
        amount: Decimal,
        time: DateTime<Utc>,
        trade_part: u32,
        is_full_sell: bool,
    ) -> Result<TradeIntent> {
        let intent = TradeIntent {
            id: Uuid::new_v4().to_string(),
            status: IntentStatus::Pending,
            action,
            price,
            amount,
            time,
            trade_part,
            is_full_sell,
        };
        self.persist(&intent)?;
        self.intents.lock().insert(intent.id.clone(), intent.clone());
        Ok(intent)
    }

    /// Rewrite the intent's amount (the exchange reported a different filled
    /// quantity than requested). Only legal while the intent is `pending`.
    pub fn update_amount(&self, id: &str, new_amount: Decimal) -> Result<TradeIntent> {
        let current = self.get(id)?;
        self.require_pending(&current)?;
        let updated = TradeIntent {
            amount: new_amount,
            ..current
        };
        self.persist(&updated)?;
        self.intents.lock().insert(updated.id.clone(), updated.clone());
        Ok(updated)
    }

    /// Terminal transition to `done`. Idempotent if already `done`; an error
    /// if the intent already moved to `failed` (status is monotonic).
    pub fn mark_done(&self, id: &str) -> Result<TradeIntent> {
        let current = self.get(id)?;
        match &current.status {
            IntentStatus::Done => Ok(current),
            IntentStatus::Failed { .. } => Err(JournalError::AlreadyTerminal {
                id: id.to_string(),
                status: "failed",
            }),
            IntentStatus::Pending => {
                let updated = TradeIntent {
                    status: IntentStatus::Done,
                    ..current
                };
                self.persist(&updated)?;
                self.intents.lock().insert(updated.id.clone(), updated.clone());
                Ok(updated)
            }
        }
    }

    /// Terminal transition to `failed`. Idempotent if already `failed` (the
    /// cause is not updated); an error if the intent already reached `done`.
    pub fn mark_failed(&self, id: &str, cause: impl Into<String>) -> Result<TradeIntent> {
        let current = self.get(id)?;
        match &current.status {
            IntentStatus::Failed { .. } => Ok(current),
            IntentStatus::Done => Err(JournalError::AlreadyTerminal {
                id: id.to_string(),
                status: "done",
            }),
            IntentStatus::Pending => {
                let updated = TradeIntent {
                    status: IntentStatus::Failed { cause: cause.into() },
                    ..current
                };
                self.persist(&updated)?;
                self.intents.lock().insert(updated.id.clone(), updated.clone());
                Ok(updated)
            }
        }
    }

    /// Current view of one intent by id.
    pub fn get(&self, id: &str) -> Result<TradeIntent> {
        self.intents
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| JournalError::NotFound(id.to_string()))
    }

    /// Snapshot of every intent known after replay, keyed by id.
    pub fn intents(&self) -> HashMap<String, TradeIntent> {
        self.intents.lock().clone()
    }

    /// All intents currently `pending`, oldest first by id insertion is not
    /// guaranteed; callers needing WAL order should sort by `time`.
    pub fn pending(&self) -> Vec<TradeIntent> {
        self.intents
            .lock()
            .values()
            .filter(|i| matches!(i.status, IntentStatus::Pending))
            .cloned()
            .collect()
    }

    fn require_pending(&self, intent: &TradeIntent) -> Result<()> {
        if matches!(intent.status, IntentStatus::Pending) {
            Ok(())
        } else {
            Err(JournalError::AlreadyTerminal {
                id: intent.id.clone(),
                status: intent.status.label(),
            })
        }
    }

    fn persist(&self, intent: &TradeIntent) -> Result<()> {
        let bytes = serde_json::to_vec(intent)?;
        self.wal.append(&key_for(&intent.id), &bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decimal::Action;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn journal() -> (tempfile::TempDir, TradeIntentJournal) {
        let dir = tempdir().unwrap();
        let wal = Arc::new(Wal::open(dir.path(), 1000, 10, true).unwrap());
        let journal = TradeIntentJournal::open(wal).unwrap();
        (dir, journal)
    }

    #[test]
    fn prepare_then_mark_done_transitions_monotonically() {
        let (_dir, journal) = journal();
        let intent = journal
            .prepare(Action::Buy, dec!(100), dec!(1), Utc::now(), 1, false)
            .unwrap();
        assert_eq!(intent.status, IntentStatus::Pending);

        let done = journal.mark_done(&intent.id).unwrap();
        assert_eq!(done.status, IntentStatus::Done);

        // Idempotent re-mark is a no-op, not an error.
        let done_again = journal.mark_done(&intent.id).unwrap();
        assert_eq!(done_again.status, IntentStatus::Done);

        // Can never flip to failed after reaching done.
        assert!(journal.mark_failed(&intent.id, "too late").is_err());
    }

    #[test]
    fn update_amount_rejected_after_terminal_transition() {
        let (_dir, journal) = journal();
        let intent = journal
            .prepare(Action::Buy, dec!(100), dec!(1), Utc::now(), 1, false)
            .unwrap();
        journal.mark_failed(&intent.id, "rejected").unwrap();
        assert!(journal.update_amount(&intent.id, dec!(2)).is_err());
    }

    #[test]
    fn reopen_replays_latest_record_per_id() {
        let dir = tempdir().unwrap();
        let id;
        {
            let wal = Arc::new(Wal::open(dir.path(), 1000, 10, true).unwrap());
            let journal = TradeIntentJournal::open(wal).unwrap();
            let intent = journal
                .prepare(Action::Sell, dec!(50), dec!(3), Utc::now(), 0, true)
                .unwrap();
            journal.update_amount(&intent.id, dec!(2.5)).unwrap();
            journal.mark_done(&intent.id).unwrap();
            id = intent.id;
        }
        let wal = Arc::new(Wal::open(dir.path(), 1000, 10, true).unwrap());
        let journal = TradeIntentJournal::open(wal).unwrap();
        let intent = journal.get(&id).unwrap();
        assert_eq!(intent.status, IntentStatus::Done);
        assert_eq!(intent.amount, dec!(2.5));
    }
}
