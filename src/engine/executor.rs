//! Scrape job executor with checkpointing and resume

use super::job::{DataQualityEvent, FailureReason, JobLimits, JobStatus, ScrapeJob, StopReason};
use super::{EngineContext, ScrapeError};
use crate::cancel::CancelSignal;
use crate::extractor::ExtractorAdapter;
use crate::fetcher::{FetchError, PageBatch, PaginateError, Paginator};
use crate::metrics::{self, JobMetrics};
use crate::policy::AntiDetectionPolicy;
use crate::resume::Checkpoint;
use crate::session::SessionError;
use crate::{Record, Target};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

struct JobHandle {
    status: watch::Receiver<ScrapeJob>,
    cancel: CancelSignal,
}

/// How a run loop ended
enum RunEnd {
    Stopped(StopReason),
    Paused,
    Failed(FailureReason),
}

/// Job control surface: start, resume, status, cancel
///
/// Each running job is one tokio task. Jobs on different platforms run fully
/// in parallel; jobs on the same platform share its rate budget and session.
pub struct ScrapeSession {
    context: Arc<EngineContext>,
    jobs: Mutex<HashMap<Uuid, JobHandle>>,
}

impl std::fmt::Debug for ScrapeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScrapeSession")
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

impl ScrapeSession {
    /// Session over a shared engine context
    pub fn new(context: Arc<EngineContext>) -> Self {
        Self {
            context,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Engine context
    pub fn context(&self) -> &Arc<EngineContext> {
        &self.context
    }

    /// Start a new job for `target`
    pub async fn start(&self, target: Target, limits: JobLimits) -> Result<Uuid, ScrapeError> {
        target.validate().map_err(ScrapeError::InvalidTarget)?;
        limits.validate().map_err(ScrapeError::InvalidLimits)?;
        let extractor = self.extractor_for(&target)?;

        let job = ScrapeJob::new(target, limits);
        let job_id = job.id;
        info!(
            job_id = %job_id,
            platform = %job.target.platform,
            target = %job.target.key(),
            "Starting scrape job"
        );

        let mut jobs = self.jobs.lock().await;
        let handle = self.spawn(job, extractor);
        jobs.insert(job_id, handle);
        Ok(job_id)
    }

    /// Continue a paused or resumable failed job from its latest checkpoint
    ///
    /// Works across processes: a job unknown to this session is rebuilt from
    /// the checkpoint store alone.
    pub async fn resume(&self, job_id: Uuid) -> Result<Uuid, ScrapeError> {
        let mut jobs = self.jobs.lock().await;

        let previous = jobs.get(&job_id).map(|h| h.status.borrow().clone());
        if let Some(previous) = &previous {
            match previous.status {
                JobStatus::Pending | JobStatus::Running => {
                    return Err(ScrapeError::AlreadyRunning(job_id));
                }
                JobStatus::Completed | JobStatus::CompletedWithErrors => {
                    return Err(ScrapeError::NotResumable {
                        job_id,
                        status: previous.status,
                    });
                }
                JobStatus::Failed
                    if !previous.failure.as_ref().is_some_and(FailureReason::is_resumable) =>
                {
                    return Err(ScrapeError::NotResumable {
                        job_id,
                        status: previous.status,
                    });
                }
                JobStatus::Paused | JobStatus::Failed => {}
            }
        }

        let checkpoint = self.context.checkpoints().load_checkpoint(job_id).await?;
        let job = match (checkpoint, previous) {
            (Some(checkpoint), previous) => {
                if checkpoint.is_final() {
                    return Err(ScrapeError::NotResumable {
                        job_id,
                        status: JobStatus::Completed,
                    });
                }
                let mut job = ScrapeJob::from_checkpoint(&checkpoint);
                if let Some(previous) = previous {
                    job.retries = previous.retries;
                    job.duplicates_skipped = previous.duplicates_skipped;
                    job.data_quality = previous.data_quality;
                    job.created_at = previous.created_at;
                }
                job
            }
            // Failed before its first checkpoint; start over from the top.
            (None, Some(previous)) => ScrapeJob {
                status: JobStatus::Pending,
                stop_reason: None,
                failure: None,
                ..previous
            },
            (None, None) => return Err(ScrapeError::UnknownJob(job_id)),
        };

        let extractor = self.extractor_for(&job.target)?;
        info!(
            job_id = %job_id,
            platform = %job.target.platform,
            pages_completed = job.pages_completed,
            records_emitted = job.records_emitted,
            "Resuming scrape job"
        );

        let handle = self.spawn(job, extractor);
        jobs.insert(job_id, handle);
        Ok(job_id)
    }

    /// Current snapshot of a job
    ///
    /// Jobs not started by this session are reported from their checkpoint as
    /// `Paused` (or `Completed` when the cursor is exhausted).
    pub async fn status(&self, job_id: Uuid) -> Result<ScrapeJob, ScrapeError> {
        if let Some(handle) = self.jobs.lock().await.get(&job_id) {
            return Ok(handle.status.borrow().clone());
        }

        let checkpoint = self
            .context
            .checkpoints()
            .load_checkpoint(job_id)
            .await?
            .ok_or(ScrapeError::UnknownJob(job_id))?;
        let mut job = ScrapeJob::from_checkpoint(&checkpoint);
        job.updated_at = checkpoint.written_at;
        if checkpoint.is_final() {
            job.status = JobStatus::Completed;
            job.stop_reason = Some(StopReason::Exhausted);
        } else {
            job.status = JobStatus::Paused;
        }
        Ok(job)
    }

    /// Ask a job to stop after its in-flight page
    ///
    /// Idempotent; cancelling a resting job does nothing.
    pub async fn cancel(&self, job_id: Uuid) -> Result<(), ScrapeError> {
        let jobs = self.jobs.lock().await;
        let handle = jobs.get(&job_id).ok_or(ScrapeError::UnknownJob(job_id))?;
        if !handle.status.borrow().status.is_resting() {
            info!(job_id = %job_id, "Cancellation requested");
            handle.cancel.cancel();
        }
        Ok(())
    }

    /// Wait until a job is paused or terminal
    pub async fn wait(&self, job_id: Uuid) -> Result<ScrapeJob, ScrapeError> {
        let mut status = {
            let jobs = self.jobs.lock().await;
            jobs.get(&job_id)
                .ok_or(ScrapeError::UnknownJob(job_id))?
                .status
                .clone()
        };
        let job = status
            .wait_for(|job| job.status.is_resting())
            .await
            .map_err(|_| ScrapeError::JobAborted(job_id))?
            .clone();
        Ok(job)
    }

    /// Status channel for a job started or resumed by this session
    pub async fn subscribe(&self, job_id: Uuid) -> Result<watch::Receiver<ScrapeJob>, ScrapeError> {
        self.jobs
            .lock()
            .await
            .get(&job_id)
            .map(|h| h.status.clone())
            .ok_or(ScrapeError::UnknownJob(job_id))
    }

    fn extractor_for(&self, target: &Target) -> Result<Arc<dyn ExtractorAdapter>, ScrapeError> {
        self.context
            .extractors()
            .get(target.platform)
            .ok_or(ScrapeError::NoExtractor(target.platform))
    }

    fn spawn(&self, job: ScrapeJob, extractor: Arc<dyn ExtractorAdapter>) -> JobHandle {
        let (tx, rx) = watch::channel(job.clone());
        let cancel = CancelSignal::new();
        let span = info_span!("scrape_job", job_id = %job.id, platform = %job.target.platform);
        let worker = JobWorker {
            context: Arc::clone(&self.context),
            extractor,
            cancel: cancel.clone(),
            tx,
        };
        tokio::spawn(worker.run(job).instrument(span));
        JobHandle { status: rx, cancel }
    }
}

struct JobWorker {
    context: Arc<EngineContext>,
    extractor: Arc<dyn ExtractorAdapter>,
    cancel: CancelSignal,
    tx: watch::Sender<ScrapeJob>,
}

impl JobWorker {
    fn publish(&self, job: &mut ScrapeJob) {
        job.touch();
        self.tx.send_replace(job.clone());
    }

    async fn run(self, mut job: ScrapeJob) {
        let platform = job.target.platform;
        let job_metrics = JobMetrics::start(platform, job.id.to_string());

        job.status = JobStatus::Running;
        job.stop_reason = None;
        job.failure = None;
        self.publish(&mut job);

        let end = self.drive(&mut job).await;

        match end {
            RunEnd::Stopped(reason) => {
                job.stop_reason = Some(reason);
                job.status = if job.data_quality.is_empty() && reason != StopReason::Malformed {
                    JobStatus::Completed
                } else {
                    JobStatus::CompletedWithErrors
                };
                job_metrics.record_success(job.records_emitted);
                info!(
                    status = ?job.status,
                    stop_reason = ?reason,
                    records_emitted = job.records_emitted,
                    pages_completed = job.pages_completed,
                    duplicates_skipped = job.duplicates_skipped,
                    "Scrape job finished"
                );
            }
            RunEnd::Paused => {
                job.status = JobStatus::Paused;
                job.stop_reason = Some(StopReason::Cancelled);
                info!(
                    pages_completed = job.pages_completed,
                    records_emitted = job.records_emitted,
                    "Scrape job paused"
                );
            }
            RunEnd::Failed(reason) => {
                job_metrics.record_failure(reason.label());
                error!(
                    error = %reason,
                    resumable = reason.is_resumable(),
                    pages_completed = job.pages_completed,
                    "Scrape job failed"
                );
                job.status = JobStatus::Failed;
                job.failure = Some(reason);
            }
        }
        self.publish(&mut job);
    }

    async fn drive(&self, job: &mut ScrapeJob) -> RunEnd {
        let config = self.context.config();
        let mut paginator = Paginator::new(
            job.target.clone(),
            job.cursor.clone(),
            Arc::clone(&self.extractor),
            self.context.page_fetcher(),
            Arc::clone(self.context.sessions()),
            AntiDetectionPolicy::new(config.anti_detection.clone()),
            config.retry.clone(),
            self.cancel.clone(),
        );

        // Repeats are only tracked within one run; a resumed run may re-emit
        // at most the page that was in flight when the previous run stopped.
        let mut seen: HashSet<String> = HashSet::new();
        let mut empty_streak = 0u32;

        loop {
            if self.cancel.is_cancelled() {
                return RunEnd::Paused;
            }
            if let Some(reason) = job.limit_reached(config.jobs.max_pages, Utc::now()) {
                return RunEnd::Stopped(reason);
            }

            let batch = match paginator.next_page().await {
                Ok(Some(batch)) => batch,
                Ok(None) => return RunEnd::Stopped(StopReason::Exhausted),
                Err(e) => return self.classify(job, e),
            };

            let page = job.pages_completed;
            let PageBatch {
                records,
                next,
                retries,
                data_quality,
            } = batch;
            job.retries += u64::from(retries);
            if let Some(message) = data_quality {
                job.data_quality.push(DataQualityEvent {
                    page,
                    message,
                    at: Utc::now(),
                });
            }

            let records = self.admit(job, &mut seen, records);
            paginator.record_yield(records.len());

            // Records reach the sink before the checkpoint that covers them,
            // and the cursor moves only once the checkpoint is durable.
            if !records.is_empty() {
                if let Err(e) = self.context.sink().save(job.id, &records).await {
                    return RunEnd::Failed(FailureReason::SinkWrite(e.to_string()));
                }
            }
            let emitted = job.records_emitted + records.len() as u64;
            let checkpoint = Checkpoint::new(
                job.id,
                job.target.clone(),
                job.limits.clone(),
                next.clone(),
                emitted,
            );
            if let Err(e) = self.context.checkpoints().save_checkpoint(&checkpoint).await {
                return RunEnd::Failed(FailureReason::CheckpointWrite(e.to_string()));
            }
            paginator.commit(next.clone());

            let window_start = job.cursor.continuation.window_start();
            let entered_window = next.continuation.window_start().is_some()
                && next.continuation.window_start() != window_start;
            job.cursor = next;
            job.records_emitted = emitted;
            job.pages_completed = job.cursor.pages_consumed;
            metrics::record_page(job.target.platform, records.len());
            debug!(
                page,
                records = records.len(),
                records_emitted = job.records_emitted,
                "Page committed"
            );
            self.publish(job);

            // A date window that closed empty is not a stall; the next
            // window starts a fresh streak.
            if records.is_empty() && !entered_window {
                empty_streak += 1;
            } else {
                empty_streak = 0;
            }
            let max_empty = config.jobs.max_empty_pages;
            if max_empty > 0 && empty_streak >= max_empty && !job.cursor.is_exhausted() {
                warn!(empty_pages = empty_streak, "No new records for consecutive pages, stopping");
                return RunEnd::Stopped(StopReason::Stalled);
            }
        }
    }

    /// Drop repeats and trim the page to the remaining record budget
    fn admit(&self, job: &mut ScrapeJob, seen: &mut HashSet<String>, records: Vec<Record>) -> Vec<Record> {
        let mut admitted = Vec::with_capacity(records.len());
        for record in records {
            if self.context.config().jobs.dedupe && !seen.insert(self.extractor.dedup_key(&record)) {
                job.duplicates_skipped += 1;
                continue;
            }
            admitted.push(record);
        }

        if let Some(max) = job.limits.max_records {
            let room = max.saturating_sub(job.records_emitted);
            if admitted.len() as u64 > room {
                debug!(dropped = admitted.len() as u64 - room, "Trimming page to max_records");
                admitted.truncate(room as usize);
            }
        }
        admitted
    }

    fn classify(&self, job: &mut ScrapeJob, err: PaginateError) -> RunEnd {
        match err {
            PaginateError::Cancelled => RunEnd::Paused,
            PaginateError::Malformed(message) => {
                warn!(error = %message, "Unparseable page without a next page");
                job.data_quality.push(DataQualityEvent {
                    page: job.pages_completed,
                    message,
                    at: Utc::now(),
                });
                RunEnd::Stopped(StopReason::Malformed)
            }
            PaginateError::RetriesExhausted { retries, source } => {
                job.retries += u64::from(retries);
                RunEnd::Failed(FailureReason::RetriesExhausted(source.to_string()))
            }
            PaginateError::Fetch(FetchError::RateExceeded(e)) => {
                RunEnd::Failed(FailureReason::RateExceeded(e.to_string()))
            }
            PaginateError::Fetch(FetchError::AuthChallenge { message, .. }) => {
                RunEnd::Failed(FailureReason::AuthExpired(message))
            }
            PaginateError::Fetch(e @ FetchError::Transient { .. }) => {
                RunEnd::Failed(FailureReason::RetriesExhausted(e.to_string()))
            }
            PaginateError::Fetch(e) => RunEnd::Failed(FailureReason::FetchPermanent(e.to_string())),
            PaginateError::Session(e) => {
                let message = match e {
                    SessionError::AuthExpired { message, .. } | SessionError::LoginFailed { message, .. } => {
                        message
                    }
                    SessionError::CredentialError(message) => message,
                };
                RunEnd::Failed(FailureReason::AuthExpired(message))
            }
            PaginateError::Extract(e) => RunEnd::Failed(FailureReason::InvalidTarget(e.to_string())),
        }
    }
}
