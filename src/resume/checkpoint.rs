//! Checkpoint: the unit of crash recovery

use crate::engine::JobLimits;
use crate::fetcher::Cursor;
use crate::Target;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Durable snapshot written after every committed page
///
/// Carries everything needed to resume the job in a fresh process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Job this checkpoint belongs to
    pub job_id: Uuid,
    /// Scope of the job
    pub target: Target,
    /// Limits the job was started with
    pub limits: JobLimits,
    /// Cursor of the next page to fetch
    pub cursor: Cursor,
    /// Records emitted up to and including the checkpointed page
    pub records_emitted: u64,
    /// Pages committed
    pub pages_completed: u64,
    /// Write time
    pub written_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Snapshot for `job_id` at `cursor`
    pub fn new(
        job_id: Uuid,
        target: Target,
        limits: JobLimits,
        cursor: Cursor,
        records_emitted: u64,
    ) -> Self {
        Self {
            job_id,
            pages_completed: cursor.pages_consumed,
            target,
            limits,
            cursor,
            records_emitted,
            written_at: Utc::now(),
        }
    }

    /// Whether the checkpointed cursor has no pages left
    pub fn is_final(&self) -> bool {
        self.cursor.is_exhausted()
    }
}
