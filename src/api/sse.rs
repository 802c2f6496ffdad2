// =============================================================================
// Server-Sent Events Fan-out — Balance & Decision Streams
// =============================================================================
//
// One HTTP connection per browser. The server keeps a cursor into the
// relevant `EventLog`, polls it on a fixed interval, and emits one SSE frame
// per new record. A fresh client (`last_event_id` absent or 0) gets the
// thinned history first; reconnecting clients resume exactly where they
// left off via `Last-Event-ID`. A periodic comment keeps intermediaries
// from timing out the connection, the same shape as the teacher engine's
// WebSocket push loop but over SSE.
// =============================================================================

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::Stream;
use serde::Deserialize;
use tracing::debug;

use crate::app_state::AppState;
use crate::balance_log::{BalanceLog, BalanceSnapshot};
use crate::decision_log::{Decision, DecisionLog};
use crate::event_log::Indexed;

#[derive(Debug, Deserialize)]
pub struct SseQuery {
    last_event_id: Option<u64>,
}

fn last_event_id(headers: &HeaderMap, query: &SseQuery) -> u64 {
    headers
        .get("Last-Event-ID")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .or(query.last_event_id)
        .unwrap_or(0)
}

pub async fn balance_stream(
    headers: HeaderMap,
    Query(query): Query<SseQuery>,
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let cursor = last_event_id(&headers, &query);
    let stream = event_stream(
        state.balance_log.clone(),
        cursor,
        state.snapshot_thinning_keep_recent,
        state.sse_poll_interval,
        "balance",
        |snapshot: &BalanceSnapshot| serde_json::to_string(snapshot).unwrap_or_default(),
    );
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(state.sse_heartbeat_interval)
            .text("ping"),
    )
}

pub async fn decision_stream(
    headers: HeaderMap,
    Query(query): Query<SseQuery>,
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let cursor = last_event_id(&headers, &query);
    let stream = event_stream(
        state.decision_log.clone(),
        cursor,
        state.snapshot_thinning_keep_recent,
        state.sse_poll_interval,
        "decision",
        |decision: &Decision| serde_json::to_string(decision).unwrap_or_default(),
    );
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(state.sse_heartbeat_interval)
            .text("ping"),
    )
}

/// Shared polling loop: load the (possibly thinned) backlog once, then poll
/// for new records forever. Generic over the log type via a tiny closure
/// trait bound rather than duplicating the loop for balance vs. decision.
fn event_stream<T, F>(
    log: Arc<T>,
    mut cursor: u64,
    keep_recent: usize,
    poll_interval: std::time::Duration,
    event_name: &'static str,
    encode: F,
) -> impl Stream<Item = Result<Event, Infallible>>
where
    T: LogSource + Send + Sync + 'static,
    T::Item: Send + 'static,
    F: Fn(&T::Item) -> String + Send + 'static,
{
    async_stream::stream! {
        let initial = if cursor == 0 {
            log.load_for_new_client(keep_recent)
        } else {
            log.after(cursor)
        };

        match initial {
            Ok(records) if records.is_empty() && cursor == 0 => {
                yield Ok(Event::default().event("no_data").data("{}"));
            }
            Ok(records) => {
                for record in records {
                    cursor = cursor.max(record.index);
                    yield Ok(Event::default()
                        .id(record.index.to_string())
                        .event(event_name)
                        .data(encode(&record.value)));
                }
            }
            Err(e) => {
                debug!(error = %e, "failed to load initial sse backlog");
            }
        }

        let mut ticker = tokio::time::interval(poll_interval);
        loop {
            ticker.tick().await;
            match log.after(cursor) {
                Ok(records) => {
                    for record in records {
                        cursor = cursor.max(record.index);
                        yield Ok(Event::default()
                            .id(record.index.to_string())
                            .event(event_name)
                            .data(encode(&record.value)));
                    }
                }
                Err(e) => debug!(error = %e, "sse poll failed"),
            }
        }
    }
}

/// Adapter trait so `event_stream` can poll either log type uniformly.
trait LogSource {
    type Item: Clone;
    fn after(&self, since_index: u64) -> crate::event_log::Result<Vec<Indexed<Self::Item>>>;
    fn load_for_new_client(&self, keep_recent: usize) -> crate::event_log::Result<Vec<Indexed<Self::Item>>>;
}

impl LogSource for BalanceLog {
    type Item = BalanceSnapshot;
    fn after(&self, since_index: u64) -> crate::event_log::Result<Vec<Indexed<Self::Item>>> {
        BalanceLog::after(self, since_index)
    }
    fn load_for_new_client(&self, keep_recent: usize) -> crate::event_log::Result<Vec<Indexed<Self::Item>>> {
        BalanceLog::load_for_new_client(self, keep_recent)
    }
}

impl LogSource for DecisionLog {
    type Item = Decision;
    fn after(&self, since_index: u64) -> crate::event_log::Result<Vec<Indexed<Self::Item>>> {
        DecisionLog::after(self, since_index)
    }
    fn load_for_new_client(&self, keep_recent: usize) -> crate::event_log::Result<Vec<Indexed<Self::Item>>> {
        DecisionLog::load_for_new_client(self, keep_recent)
    }
}
