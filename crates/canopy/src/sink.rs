//! Destinations for output rows.

use crate::table::OutputRow;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Returned by a sink that will not accept further rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("sink closed")]
pub struct SinkClosed;

/// Accepts rows in emission order.
///
/// Backpressure is the sink's business: `push` may wait. Once it returns
/// [`SinkClosed`] the scheduler stops the run.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn push(&self, row: OutputRow) -> Result<(), SinkClosed>;
}

#[async_trait]
impl Sink for mpsc::Sender<OutputRow> {
    async fn push(&self, row: OutputRow) -> Result<(), SinkClosed> {
        self.send(row).await.map_err(|_| SinkClosed)
    }
}

/// Collects rows in memory, optionally refusing rows past a limit.
#[derive(Debug, Default)]
pub struct MemorySink {
    rows: Mutex<Vec<OutputRow>>,
    limit: Option<usize>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink that closes after accepting `limit` rows.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            rows: Mutex::default(),
            limit: Some(limit),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every row received so far.
    pub fn rows(&self) -> Vec<OutputRow> {
        self.rows.lock().clone()
    }

    /// Rows received for one table, in emission order.
    pub fn rows_for(&self, table: &str) -> Vec<OutputRow> {
        self.rows
            .lock()
            .iter()
            .filter(|row| row.table == table)
            .cloned()
            .collect()
    }

    pub fn into_rows(self) -> Vec<OutputRow> {
        self.rows.into_inner()
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn push(&self, row: OutputRow) -> Result<(), SinkClosed> {
        let mut rows = self.rows.lock();
        if self.limit.is_some_and(|limit| rows.len() >= limit) {
            return Err(SinkClosed);
        }
        rows.push(row);
        Ok(())
    }
}
