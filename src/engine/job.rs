//! Scrape job structures and status tracking

use crate::fetcher::Cursor;
use crate::resume::Checkpoint;
use crate::Target;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Limits that end a job early; whichever is hit first wins
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobLimits {
    /// Stop after this many records
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_records: Option<u64>,
    /// Stop after this many pages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pages: Option<u64>,
    /// Stop once the wall clock passes this instant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
}

impl JobLimits {
    /// Limit the number of records
    pub fn max_records(mut self, n: u64) -> Self {
        self.max_records = Some(n);
        self
    }

    /// Limit the number of pages
    pub fn max_pages(mut self, n: u64) -> Self {
        self.max_pages = Some(n);
        self
    }

    /// Stop at an absolute deadline
    pub fn deadline(mut self, at: DateTime<Utc>) -> Self {
        self.deadline = Some(at);
        self
    }

    /// Stop `after` from now
    pub fn time_budget(self, after: Duration) -> Self {
        let at = chrono::Duration::from_std(after)
            .ok()
            .and_then(|budget| Utc::now().checked_add_signed(budget))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.deadline(at)
    }

    /// Validate limit values
    pub fn validate(&self) -> Result<(), String> {
        if self.max_records == Some(0) {
            return Err("max_records must be positive".to_string());
        }
        if self.max_pages == Some(0) {
            return Err("max_pages must be positive".to_string());
        }
        Ok(())
    }
}

/// Job execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Job has not started yet
    #[default]
    Pending,
    /// Job worker is running
    Running,
    /// Cancelled on a page boundary; can be resumed
    Paused,
    /// Finished cleanly
    Completed,
    /// Finished, but pages were skipped or unparseable
    CompletedWithErrors,
    /// Stopped on an error; see [`ScrapeJob::failure`]
    Failed,
}

impl JobStatus {
    /// No further progress without a new `resume`
    pub fn is_resting(&self) -> bool {
        !matches!(self, JobStatus::Pending | JobStatus::Running)
    }

    /// Finished for good (paused jobs are not terminal)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::CompletedWithErrors | JobStatus::Failed
        )
    }
}

/// Why a job stopped without failing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// No more pages
    Exhausted,
    /// `max_records` reached
    MaxRecords,
    /// `max_pages` (or the engine's safety cap) reached
    MaxPages,
    /// Wall-clock deadline passed
    Deadline,
    /// Too many consecutive pages without new records
    Stalled,
    /// A page could not be parsed and no next page could be derived
    Malformed,
    /// Cancelled by the caller
    Cancelled,
}

/// Terminal cause of a failed job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum FailureReason {
    /// Session refresh failed
    #[error("session expired: {0}")]
    AuthExpired(String),
    /// Rate budget refused the request
    #[error("rate budget exceeded: {0}")]
    RateExceeded(String),
    /// Permanent fetch failure (404, ban)
    #[error("permanent fetch failure: {0}")]
    FetchPermanent(String),
    /// Transient failures outlasted the retry budget
    #[error("retries exhausted: {0}")]
    RetriesExhausted(String),
    /// Checkpoint could not be persisted
    #[error("checkpoint write failed: {0}")]
    CheckpointWrite(String),
    /// Record sink rejected a page
    #[error("record sink failed: {0}")]
    SinkWrite(String),
    /// Extractor cannot serve the target
    #[error("invalid target: {0}")]
    InvalidTarget(String),
}

impl FailureReason {
    /// Whether resuming can plausibly succeed without operator action
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            FailureReason::RateExceeded(_)
                | FailureReason::RetriesExhausted(_)
                | FailureReason::CheckpointWrite(_)
                | FailureReason::SinkWrite(_)
        )
    }

    /// Short label for metrics
    pub fn label(&self) -> &'static str {
        match self {
            FailureReason::AuthExpired(_) => "auth_expired",
            FailureReason::RateExceeded(_) => "rate_exceeded",
            FailureReason::FetchPermanent(_) => "fetch_permanent",
            FailureReason::RetriesExhausted(_) => "retries_exhausted",
            FailureReason::CheckpointWrite(_) => "checkpoint_write",
            FailureReason::SinkWrite(_) => "sink_write",
            FailureReason::InvalidTarget(_) => "invalid_target",
        }
    }
}

/// Page that could not be parsed cleanly
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataQualityEvent {
    /// Zero-based page index
    pub page: u64,
    /// What was wrong
    pub message: String,
    /// When it was seen
    pub at: DateTime<Utc>,
}

/// Scrape job and its progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeJob {
    /// Job id
    pub id: Uuid,
    /// What is being scraped
    pub target: Target,
    /// Limits the job runs under
    pub limits: JobLimits,
    /// Committed cursor
    pub cursor: Cursor,
    /// Records handed to the sink
    pub records_emitted: u64,
    /// Pages committed
    pub pages_completed: u64,
    /// Transient retries spent
    pub retries: u64,
    /// Records dropped as repeats
    pub duplicates_skipped: u64,
    /// Current status
    pub status: JobStatus,
    /// Why the job stopped, when it stopped without failing
    pub stop_reason: Option<StopReason>,
    /// Why the job failed
    pub failure: Option<FailureReason>,
    /// Pages with parse problems
    pub data_quality: Vec<DataQualityEvent>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last status change
    pub updated_at: DateTime<Utc>,
}

impl ScrapeJob {
    /// New pending job at the start of `target`
    pub fn new(target: Target, limits: JobLimits) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            target,
            limits,
            cursor: Cursor::start(),
            records_emitted: 0,
            pages_completed: 0,
            retries: 0,
            duplicates_skipped: 0,
            status: JobStatus::Pending,
            stop_reason: None,
            failure: None,
            data_quality: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Pending job rebuilt from its latest checkpoint
    pub fn from_checkpoint(checkpoint: &Checkpoint) -> Self {
        Self {
            id: checkpoint.job_id,
            cursor: checkpoint.cursor.clone(),
            records_emitted: checkpoint.records_emitted,
            pages_completed: checkpoint.pages_completed,
            created_at: checkpoint.written_at,
            ..Self::new(checkpoint.target.clone(), checkpoint.limits.clone())
        }
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Limit that would stop the job before its next page, if any
    pub fn limit_reached(&self, page_cap: u64, now: DateTime<Utc>) -> Option<StopReason> {
        if self.limits.max_records.is_some_and(|max| self.records_emitted >= max) {
            return Some(StopReason::MaxRecords);
        }
        let max_pages = self.limits.max_pages.unwrap_or(page_cap);
        if self.pages_completed >= max_pages {
            return Some(StopReason::MaxPages);
        }
        if self.limits.deadline.is_some_and(|at| now >= at) {
            return Some(StopReason::Deadline);
        }
        None
    }
}
