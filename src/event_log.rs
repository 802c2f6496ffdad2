// =============================================================================
// Event Log — generic cursor-queryable append-only log
// =============================================================================
//
// Shared machinery behind the balance-snapshot log and the decision log: one
// dedicated `Wal` instance, a typed record appended per event, and cursor
// queries for SSE fan-out (`after(since_index)`) plus first-load thinning
// for long histories.
// =============================================================================

use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::decimal::Pair;
use crate::wal::{Wal, WalError};

#[derive(Debug, Error)]
pub enum EventLogError {
    #[error(transparent)]
    Wal(#[from] WalError),
    #[error("decode failure for event log record: {0}")]
    Decode(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EventLogError>;

/// One event, tagged with the WAL index it was assigned on append.
#[derive(Debug, Clone, PartialEq)]
pub struct Indexed<T> {
    pub index: u64,
    pub value: T,
}

/// A dedicated, process-wide append-only log of one record type. The WAL
/// backing it is not shared with any other concern; every record in it
/// belongs to this log.
pub struct EventLog<T> {
    wal: Arc<Wal>,
    key_prefix: &'static str,
    _marker: PhantomData<T>,
}

impl<T> EventLog<T>
where
    T: Serialize + DeserializeOwned + Clone,
{
    pub fn open(wal: Arc<Wal>, key_prefix: &'static str) -> Self {
        Self {
            wal,
            key_prefix,
            _marker: PhantomData,
        }
    }

    /// Append one event, keyed `<prefix>_<pair>` for legibility. Returns the
    /// assigned index.
    pub fn append(&self, pair: &Pair, value: &T) -> Result<u64> {
        let key = format!("{}_{}", self.key_prefix, pair);
        let bytes = serde_json::to_vec(value)?;
        Ok(self.wal.append(&key, &bytes)?)
    }

    pub fn latest_index(&self) -> u64 {
        self.wal.current_index()
    }

    /// Every event with `index > since_index`, in index order.
    pub fn after(&self, since_index: u64) -> Result<Vec<Indexed<T>>> {
        let mut out = Vec::new();
        for record in self.wal.iterate()? {
            if record.index <= since_index {
                continue;
            }
            let value: T = serde_json::from_slice(&record.value)?;
            out.push(Indexed {
                index: record.index,
                value,
            });
        }
        Ok(out)
    }

    /// For a freshly connecting client with no cursor: return the most
    /// recent `keep_recent` events in full, with older events thinned to
    /// geometrically increasing gaps so a long history is cheap to draw.
    pub fn load_for_new_client(&self, keep_recent: usize) -> Result<Vec<Indexed<T>>> {
        let all = self.after(0)?;
        if all.len() <= keep_recent {
            return Ok(all);
        }
        let split = all.len() - keep_recent;
        let (old, recent) = all.split_at(split);

        let mut thinned = Vec::new();
        let mut i = 0usize;
        let mut gap = 1usize;
        while i < old.len() {
            thinned.push(old[i].clone());
            i += gap;
            gap = (gap * 2).max(1);
        }
        thinned.extend(recent.iter().cloned());
        Ok(thinned)
    }
}
