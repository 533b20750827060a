//! Record sinks
//!
//! The engine hands every extracted page to a [`RecordSink`] before the
//! page's checkpoint is written. Sinks must therefore tolerate the last page
//! of a crashed run being delivered a second time.

use crate::Record;
use async_trait::async_trait;
use futures_util::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

pub mod csv;

pub use self::csv::CsvRecordSink;

/// Sink errors
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// IO error
    #[error("IO error: {0}")]
    IoError(String),

    /// CSV write error
    #[error("CSV error: {0}")]
    CsvError(String),

    /// Downstream consumer went away
    #[error("sink closed: {0}")]
    Closed(String),
}

/// Result type for sink operations
pub type SinkResult<T> = Result<T, SinkError>;

/// Downstream destination for emitted records
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Persist one page worth of records for `job_id`
    async fn save(&self, job_id: Uuid, records: &[Record]) -> SinkResult<()>;

    /// Flush buffered output
    async fn flush(&self) -> SinkResult<()> {
        Ok(())
    }
}

/// Sink that keeps everything in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<(Uuid, Record)>>,
}

impl MemorySink {
    /// Empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// All records saved so far, in arrival order
    pub async fn records(&self) -> Vec<Record> {
        self.records.lock().await.iter().map(|(_, r)| r.clone()).collect()
    }

    /// Records saved for one job
    pub async fn records_for(&self, job_id: Uuid) -> Vec<Record> {
        self.records
            .lock()
            .await
            .iter()
            .filter(|(id, _)| *id == job_id)
            .map(|(_, r)| r.clone())
            .collect()
    }

    /// Number of records saved
    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    /// Whether nothing was saved
    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    async fn save(&self, job_id: Uuid, records: &[Record]) -> SinkResult<()> {
        self.records
            .lock()
            .await
            .extend(records.iter().cloned().map(|r| (job_id, r)));
        Ok(())
    }
}

/// Sink forwarding records to a [`RecordStream`]
///
/// The channel is bounded, so a slow consumer applies backpressure to the
/// job instead of buffering without limit.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<Record>,
}

impl ChannelSink {
    /// Sink and its consuming stream, buffering at most `capacity` records
    pub fn new(capacity: usize) -> (Self, RecordStream) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, RecordStream { rx })
    }
}

#[async_trait]
impl RecordSink for ChannelSink {
    async fn save(&self, job_id: Uuid, records: &[Record]) -> SinkResult<()> {
        for record in records {
            self.tx
                .send(record.clone())
                .await
                .map_err(|_| SinkError::Closed(format!("record stream for job {job_id} dropped")))?;
        }
        Ok(())
    }
}

/// Records emitted through a [`ChannelSink`]
///
/// Ends once every clone of the sink is dropped.
#[derive(Debug)]
pub struct RecordStream {
    rx: mpsc::Receiver<Record>,
}

impl Stream for RecordStream {
    type Item = Record;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
