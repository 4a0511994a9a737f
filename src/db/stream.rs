//! Streaming row collection.
//!
//! Drivers yield rows one by one; [`RowCollector`] decides for each row
//! whether to keep it, and signals the row cap exactly once. The collector is
//! consumed by [`RowCollector::finish`], so a stream completes exactly once
//! no matter whether it ended normally, hit the cap, or was cancelled.

use crate::db::dialect::{EventStream, ExecSummary, StreamEvent};
use crate::db::type_parser::TypeParserSnapshot;
use crate::db::types::RawRow;
use crate::models::Row;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    RowLimit,
    Caller,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CollectorState {
    Streaming,
    Cancelled(CancelReason),
}

/// What the driver loop should do after a row was offered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Stop the stream; returned once per collector.
    Cancel,
    /// The stream was already cancelled; the row was dropped.
    Ignored,
}

#[derive(Debug)]
pub struct RowCollector {
    state: CollectorState,
    rows: Vec<Row>,
    max_rows: Option<usize>,
}

/// Final outcome of a collector.
#[derive(Debug, Default, PartialEq)]
pub struct Collected {
    pub rows: Vec<Row>,
    pub truncated: bool,
    pub cancelled_by_caller: bool,
}

impl RowCollector {
    pub fn new(max_rows: Option<usize>) -> Self {
        Self {
            state: CollectorState::Streaming,
            rows: Vec::new(),
            max_rows,
        }
    }

    pub fn push_row(&mut self, row: Row) -> Flow {
        match self.state {
            CollectorState::Cancelled(_) => Flow::Ignored,
            CollectorState::Streaming => match self.max_rows {
                Some(max) if self.rows.len() >= max => {
                    self.state = CollectorState::Cancelled(CancelReason::RowLimit);
                    Flow::Cancel
                }
                _ => {
                    self.rows.push(row);
                    Flow::Continue
                }
            },
        }
    }

    /// Returns false when the stream was already cancelled.
    pub fn cancel(&mut self, reason: CancelReason) -> bool {
        match self.state {
            CollectorState::Streaming => {
                self.state = CollectorState::Cancelled(reason);
                true
            }
            CollectorState::Cancelled(_) => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.state, CollectorState::Cancelled(_))
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn finish(self) -> Collected {
        let reason = match self.state {
            CollectorState::Cancelled(reason) => Some(reason),
            CollectorState::Streaming => None,
        };
        Collected {
            rows: self.rows,
            truncated: reason == Some(CancelReason::RowLimit),
            cancelled_by_caller: reason == Some(CancelReason::Caller),
        }
    }
}

/// Rows and completion data of one drained statement.
#[derive(Debug, Default)]
pub struct Drained {
    pub rows: Vec<Row>,
    pub summary: ExecSummary,
    pub truncated: bool,
    pub cancelled_by_caller: bool,
}

/// Decode a raw row through the registered type parsers.
pub fn decode_row(raw: RawRow, parsers: &TypeParserSnapshot) -> Row {
    let mut row = Row::with_capacity(raw.values.len());
    for (column, value) in raw.columns.iter().zip(raw.values) {
        row.insert(column.name.clone(), parsers.decode(&column.type_id, value));
    }
    row
}

/// Pull a statement stream to completion, the row cap, or cancellation.
///
/// Completion summaries of multi-statement scripts are accumulated.
pub async fn drain_events(
    mut stream: EventStream<'_>,
    parsers: &TypeParserSnapshot,
    max_rows: Option<usize>,
    cancellation: &CancellationToken,
) -> Result<Drained, sqlx::Error> {
    let mut collector = RowCollector::new(max_rows);
    let mut summary = ExecSummary::default();

    loop {
        let event = tokio::select! {
            biased;
            _ = cancellation.cancelled() => {
                if collector.cancel(CancelReason::Caller) {
                    warn!(rows = collector.len(), "Query cancelled by caller");
                }
                break;
            }
            event = stream.next() => event,
        };

        match event {
            None => break,
            Some(Err(e)) => return Err(e),
            Some(Ok(StreamEvent::Done(done))) => {
                summary.rows_affected += done.rows_affected;
                if done.last_insert_id.is_some() {
                    summary.last_insert_id = done.last_insert_id;
                }
            }
            Some(Ok(StreamEvent::Row(raw))) => {
                match collector.push_row(decode_row(raw, parsers)) {
                    Flow::Continue => {}
                    Flow::Cancel => {
                        warn!(max_rows = ?max_rows, "Row limit reached, cancelling stream");
                        break;
                    }
                    Flow::Ignored => {}
                }
            }
        }
    }
    // Dropping the stream cancels whatever the driver still has queued.
    drop(stream);

    let collected = collector.finish();
    debug!(
        rows = collected.rows.len(),
        rows_affected = summary.rows_affected,
        truncated = collected.truncated,
        "Statement drained"
    );
    Ok(Drained {
        rows: collected.rows,
        summary,
        truncated: collected.truncated,
        cancelled_by_caller: collected.cancelled_by_caller,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::types::ColumnInfo;
    use futures_util::stream;
    use serde_json::{Value as JsonValue, json};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn raw(n: i64) -> RawRow {
        RawRow::new(
            vec![ColumnInfo {
                name: "n".to_string(),
                type_id: "INTEGER".to_string(),
            }],
            vec![json!(n)],
        )
    }

    fn events(count: i64) -> Vec<Result<StreamEvent, sqlx::Error>> {
        let mut events: Vec<_> = (0..count).map(|n| Ok(StreamEvent::Row(raw(n)))).collect();
        events.push(Ok(StreamEvent::Done(ExecSummary {
            rows_affected: 0,
            last_insert_id: None,
        })));
        events
    }

    #[test]
    fn test_collector_cancels_exactly_once() {
        let mut collector = RowCollector::new(Some(10));
        let flows: Vec<Flow> = (0..100).map(|_| collector.push_row(Row::new())).collect();

        assert_eq!(flows.iter().filter(|f| **f == Flow::Cancel).count(), 1);
        assert_eq!(flows[10], Flow::Cancel);
        assert!(flows[11..].iter().all(|f| *f == Flow::Ignored));
        assert!(!collector.cancel(CancelReason::Caller));

        let collected = collector.finish();
        assert_eq!(collected.rows.len(), 10);
        assert!(collected.truncated);
        assert!(!collected.cancelled_by_caller);
    }

    #[test]
    fn test_collector_at_cap_is_not_truncated() {
        let mut collector = RowCollector::new(Some(2));
        assert_eq!(collector.push_row(Row::new()), Flow::Continue);
        assert_eq!(collector.push_row(Row::new()), Flow::Continue);
        assert!(!collector.finish().truncated);
    }

    #[tokio::test]
    async fn test_drain_stops_at_row_limit() {
        let polled = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&polled);
        let stream = stream::iter(events(100))
            .inspect(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .boxed();

        let drained = drain_events(
            stream,
            &TypeParserSnapshot::default(),
            Some(10),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(drained.rows.len(), 10);
        assert!(drained.truncated);
        assert_eq!(drained.rows[9]["n"], json!(9));
        // The eleventh row triggered the cancel; nothing after it was pulled.
        assert_eq!(polled.load(Ordering::SeqCst), 11);
    }

    #[tokio::test]
    async fn test_drain_accumulates_summaries() {
        let stream = stream::iter(vec![
            Ok(StreamEvent::Done(ExecSummary {
                rows_affected: 2,
                last_insert_id: Some(5),
            })),
            Ok(StreamEvent::Done(ExecSummary {
                rows_affected: 3,
                last_insert_id: None,
            })),
        ])
        .boxed();
        let drained = drain_events(
            stream,
            &TypeParserSnapshot::default(),
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(drained.summary.rows_affected, 5);
        assert_eq!(drained.summary.last_insert_id, Some(5));
        assert!(drained.rows.is_empty());
    }

    #[tokio::test]
    async fn test_drain_honours_caller_cancellation() {
        let token = CancellationToken::new();
        token.cancel();
        let drained = drain_events(
            stream::iter(events(5)).boxed(),
            &TypeParserSnapshot::default(),
            None,
            &token,
        )
        .await
        .unwrap();
        assert!(drained.cancelled_by_caller);
        assert!(drained.rows.is_empty());
    }

    #[tokio::test]
    async fn test_drain_propagates_driver_error() {
        let stream = stream::iter(vec![
            Ok(StreamEvent::Row(raw(1))),
            Err(sqlx::Error::Protocol("bad frame".to_string())),
        ])
        .boxed();
        let result = drain_events(
            stream,
            &TypeParserSnapshot::default(),
            None,
            &CancellationToken::new(),
        )
        .await;
        assert!(result.is_err());
    }

    #[test]
    fn test_decode_row_passes_raw_values_through() {
        let row = decode_row(raw(7), &TypeParserSnapshot::default());
        assert_eq!(row.get("n"), Some(&JsonValue::from(7)));
    }
}
