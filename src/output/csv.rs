//! CSV record sink

use super::{RecordSink, SinkError, SinkResult};
use crate::Record;
use async_trait::async_trait;
use csv::Writer;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Columns written ahead of the record fields
pub const PROVENANCE_COLUMNS: [&str; 5] = [
    "job_id",
    "platform",
    "target",
    "source_url",
    "collected_at",
];

struct State {
    writer: Writer<BufWriter<File>>,
    records_written: u64,
}

/// Flat CSV file with a fixed column list
///
/// Every row starts with [`PROVENANCE_COLUMNS`] followed by the configured
/// field columns. Missing fields are written empty and list values are
/// joined with `|`. Fields not in the column list are dropped.
pub struct CsvRecordSink {
    state: Mutex<State>,
    fields: Vec<String>,
}

impl std::fmt::Debug for CsvRecordSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CsvRecordSink")
            .field("fields", &self.fields)
            .finish()
    }
}

impl CsvRecordSink {
    /// Create (truncate) `path` and write the header row
    pub fn create<P: AsRef<Path>>(path: P, fields: Vec<String>) -> SinkResult<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), columns = fields.len(), "Creating CSV sink");

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SinkError::IoError(format!("Failed to create directory: {e}")))?;
        }
        let file = File::create(path)
            .map_err(|e| SinkError::IoError(format!("Failed to create file: {e}")))?;
        let mut writer = Writer::from_writer(BufWriter::with_capacity(DEFAULT_BUFFER_SIZE, file));

        let header = PROVENANCE_COLUMNS
            .iter()
            .copied()
            .chain(fields.iter().map(String::as_str));
        writer
            .write_record(header)
            .map_err(|e| SinkError::CsvError(format!("Failed to write header: {e}")))?;

        Ok(Self {
            state: Mutex::new(State {
                writer,
                records_written: 0,
            }),
            fields,
        })
    }

    /// Rows written so far
    pub async fn records_written(&self) -> u64 {
        self.state.lock().await.records_written
    }

    fn row(&self, job_id: Uuid, record: &Record) -> Vec<String> {
        let mut row = Vec::with_capacity(PROVENANCE_COLUMNS.len() + self.fields.len());
        row.push(job_id.to_string());
        row.push(record.source_target().platform.to_string());
        row.push(record.source_target().key());
        row.push(record.source_url().to_string());
        row.push(record.collected_at().to_rfc3339());
        for field in &self.fields {
            row.push(record.get(field).map(|v| v.to_flat_string()).unwrap_or_default());
        }
        row
    }
}

#[async_trait]
impl RecordSink for CsvRecordSink {
    async fn save(&self, job_id: Uuid, records: &[Record]) -> SinkResult<()> {
        let mut state = self.state.lock().await;
        for record in records {
            state
                .writer
                .write_record(self.row(job_id, record))
                .map_err(|e| SinkError::CsvError(format!("Failed to write record: {e}")))?;
            state.records_written += 1;
        }
        // A page is only durable once it leaves the buffer.
        state
            .writer
            .flush()
            .map_err(|e| SinkError::IoError(format!("Failed to flush: {e}")))?;
        debug!(%job_id, rows = records.len(), total = state.records_written, "CSV page written");
        Ok(())
    }

    async fn flush(&self) -> SinkResult<()> {
        self.state
            .lock()
            .await
            .writer
            .flush()
            .map_err(|e| SinkError::IoError(format!("Failed to flush: {e}")))
    }
}
