//! Cursor-driven pagination
//!
//! The [`Paginator`] owns a job's [`Cursor`] and walks it one page at a time:
//!
//! ```text
//! start -> fetching -> extracting -> continuing -> fetching -> ...
//!                 \            \-> exhausted
//!                  \-> error
//! ```
//!
//! [`Paginator::next_page`] returns the page's records together with the
//! cursor that follows it, but the paginator keeps its own cursor where it was
//! until the caller has made the page durable and calls [`Paginator::commit`].
//! A crash between the two replays the page instead of skipping it.

use super::retry_formatter::{FailureKind, RetryContext};
use super::{FetchError, PageFetcher};
use crate::cancel::CancelSignal;
use crate::engine::config::RetryConfig;
use crate::engine::RateOutcome;
use crate::extractor::{ExtractError, ExtractorAdapter};
use crate::metrics;
use crate::policy::{AntiDetectionPolicy, RequestContext};
use crate::session::{InvalidationReason, SessionError, SessionManager};
use crate::{Record, Target};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Where the next page starts
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Continuation {
    /// Nothing fetched yet
    Start,
    /// Page-numbered listing (1-based)
    Page(u32),
    /// Scroll or item offset
    Offset(u64),
    /// Opaque API cursor
    Token(String),
    /// Date window, with an optional cursor inside the window
    Window {
        /// First day of the window
        start: NaiveDate,
        /// Last day of the window
        end: NaiveDate,
        /// Cursor within the window
        token: Option<String>,
        /// Page number within the window, for page-numbered feeds
        #[serde(default, skip_serializing_if = "Option::is_none")]
        page: Option<u32>,
    },
    /// No more pages
    Exhausted,
}

impl Continuation {
    /// First day of the date window this continuation sits in
    pub fn window_start(&self) -> Option<NaiveDate> {
        match self {
            Continuation::Window { start, .. } => Some(*start),
            _ => None,
        }
    }
}

/// Resumable pagination position
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    /// Pages committed so far; strictly increases on every advance
    pub pages_consumed: u64,
    /// Where the next page starts
    pub continuation: Continuation,
}

impl Default for Cursor {
    fn default() -> Self {
        Self::start()
    }
}

impl Cursor {
    /// Cursor before the first page
    pub fn start() -> Self {
        Self {
            pages_consumed: 0,
            continuation: Continuation::Start,
        }
    }

    /// Cursor after consuming one more page
    pub fn advance(&self, next: Continuation) -> Self {
        Self {
            pages_consumed: self.pages_consumed + 1,
            continuation: next,
        }
    }

    /// Whether no pages remain
    pub fn is_exhausted(&self) -> bool {
        self.continuation == Continuation::Exhausted
    }
}

/// Paginator state machine position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaginatorState {
    /// No page requested yet
    Start,
    /// Fetch in flight (including retries)
    Fetching,
    /// Page fetched, extractor running
    Extracting,
    /// Page handed out; waiting for commit or the next call
    Continuing,
    /// Cursor reached the end
    Exhausted,
    /// Stopped on an error
    Error,
}

/// One extracted page and the cursor that follows it
#[derive(Debug, Clone)]
pub struct PageBatch {
    /// Records extracted from the page
    pub records: Vec<Record>,
    /// Cursor to commit once the records are durable
    pub next: Cursor,
    /// Transient retries spent on this page
    pub retries: u32,
    /// Data-quality problem found on the page, if any
    pub data_quality: Option<String>,
}

/// Pagination errors
#[derive(Debug, thiserror::Error)]
pub enum PaginateError {
    /// Permanent fetch failure or refused rate budget
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Transient failures outlasted the retry budget
    #[error("retries exhausted after {retries} attempts: {source}")]
    RetriesExhausted {
        /// Retries spent
        retries: u32,
        /// Last failure
        source: FetchError,
    },

    /// Session could not be leased or refreshed
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Page could not be parsed and no next cursor could be derived
    #[error("malformed page: {0}")]
    Malformed(String),

    /// Extractor could not build a request for the target
    #[error(transparent)]
    Extract(ExtractError),

    /// Cancelled while backing off
    #[error("cancelled")]
    Cancelled,
}

/// Everything the paginator needs, shared with the rest of the engine
pub struct Paginator {
    target: Target,
    cursor: Cursor,
    state: PaginatorState,
    extractor: Arc<dyn ExtractorAdapter>,
    fetcher: PageFetcher,
    sessions: Arc<SessionManager>,
    policy: AntiDetectionPolicy,
    retry: RetryConfig,
    cancel: CancelSignal,
    last_outcome: Option<RateOutcome>,
    last_yield: Option<usize>,
}

impl std::fmt::Debug for Paginator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Paginator")
            .field("target", &self.target)
            .field("cursor", &self.cursor)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Paginator {
    /// Create a paginator positioned at `cursor`
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        target: Target,
        cursor: Cursor,
        extractor: Arc<dyn ExtractorAdapter>,
        fetcher: PageFetcher,
        sessions: Arc<SessionManager>,
        policy: AntiDetectionPolicy,
        retry: RetryConfig,
        cancel: CancelSignal,
    ) -> Self {
        let state = if cursor.is_exhausted() {
            PaginatorState::Exhausted
        } else {
            PaginatorState::Start
        };
        Self {
            target,
            cursor,
            state,
            extractor,
            fetcher,
            sessions,
            policy,
            retry,
            cancel,
            last_outcome: None,
            last_yield: None,
        }
    }

    /// Committed cursor
    pub fn cursor(&self) -> &Cursor {
        &self.cursor
    }

    /// Current state
    pub fn state(&self) -> PaginatorState {
        self.state
    }

    /// Tell the policy how many new records the last page produced
    pub fn record_yield(&mut self, new_records: usize) {
        self.last_yield = Some(new_records);
    }

    /// Move the cursor after the caller has made `next`'s page durable
    pub fn commit(&mut self, next: Cursor) {
        if next.pages_consumed <= self.cursor.pages_consumed {
            warn!(
                target_key = %self.target.key(),
                committed = self.cursor.pages_consumed,
                offered = next.pages_consumed,
                "Ignoring non-advancing cursor commit"
            );
            return;
        }
        self.state = if next.is_exhausted() {
            PaginatorState::Exhausted
        } else {
            PaginatorState::Continuing
        };
        self.cursor = next;
    }

    /// Fetch and extract the page at the committed cursor
    ///
    /// `Ok(None)` once the cursor is exhausted.
    pub async fn next_page(&mut self) -> Result<Option<PageBatch>, PaginateError> {
        if self.cursor.is_exhausted() {
            self.state = PaginatorState::Exhausted;
            return Ok(None);
        }

        let result = self.fetch_and_extract().await;
        if result.is_err() {
            self.state = PaginatorState::Error;
        }
        result.map(Some)
    }

    async fn fetch_and_extract(&mut self) -> Result<PageBatch, PaginateError> {
        let platform = self.target.platform;
        let page_index = self.cursor.pages_consumed;

        self.state = PaginatorState::Fetching;
        let request = self
            .extractor
            .page_request(&self.target, &self.cursor)
            .map_err(PaginateError::Extract)?;
        let mut session = self.sessions.lease(platform).await?;

        let mut retries = 0u32;
        let mut reauthenticated = false;
        let page = loop {
            let ctx = RequestContext {
                platform,
                page_index,
                last_outcome: self.last_outcome,
                last_page_yield: self.last_yield,
                render_hint: self.extractor.requires_render(),
            };
            let plan = self.policy.plan(&ctx);

            match self.fetcher.fetch(&request, &session, &plan).await {
                Ok(page) => {
                    self.last_outcome = Some(RateOutcome::Success);
                    if retries > 0 {
                        let ctx = RetryContext::new(
                            &self.target,
                            page_index,
                            retries,
                            self.retry.max_retries,
                            FailureKind::NetworkGeneric,
                            std::time::Duration::ZERO,
                            "",
                        );
                        info!("{}", ctx.format_success());
                    }
                    break page;
                }
                Err(FetchError::AuthChallenge { message, .. }) => {
                    self.sessions
                        .invalidate(&session, InvalidationReason::AuthChallenge)
                        .await;
                    if reauthenticated {
                        warn!(platform = %platform, page = page_index, "Auth challenge persisted after refresh");
                        return Err(PaginateError::Session(SessionError::AuthExpired {
                            platform,
                            message,
                        }));
                    }
                    info!(platform = %platform, page = page_index, "Auth challenge, refreshing session");
                    session = self.sessions.lease(platform).await?;
                    reauthenticated = true;
                }
                Err(e) if e.is_transient() => {
                    let kind = e.kind().unwrap_or(FailureKind::NetworkGeneric);
                    self.last_outcome = Some(if kind == FailureKind::RateLimit {
                        RateOutcome::RateLimited
                    } else {
                        RateOutcome::Success
                    });

                    if retries >= self.retry.max_retries {
                        let ctx = RetryContext::new(
                            &self.target,
                            page_index,
                            retries,
                            self.retry.max_retries,
                            kind,
                            std::time::Duration::ZERO,
                            e.to_string(),
                        );
                        error!("{}", ctx.format_failure());
                        return Err(PaginateError::RetriesExhausted { retries, source: e });
                    }

                    retries += 1;
                    let backoff = self.retry.backoff(retries);
                    let ctx = RetryContext::new(
                        &self.target,
                        page_index,
                        retries,
                        self.retry.max_retries,
                        kind,
                        backoff,
                        e.to_string(),
                    );
                    warn!("{}", ctx.format_retry());
                    metrics::record_retry_backoff(platform, backoff, retries);

                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = self.cancel.cancelled() => {
                            info!(platform = %platform, page = page_index, "Cancelled during retry backoff");
                            return Err(PaginateError::Cancelled);
                        }
                    }
                }
                Err(e) => {
                    if e.kind() == Some(FailureKind::Banned) {
                        self.last_outcome = Some(RateOutcome::Blocked);
                    }
                    return Err(PaginateError::Fetch(e));
                }
            }
        };

        self.state = PaginatorState::Extracting;
        match self.extractor.extract(&page, &self.target, &self.cursor) {
            Ok(extraction) => {
                let next = extraction.next.unwrap_or(Continuation::Exhausted);
                if next == self.cursor.continuation {
                    metrics::record_data_quality(platform);
                    return Err(PaginateError::Malformed(format!(
                        "extractor returned the same continuation {next:?} for page {page_index}"
                    )));
                }
                debug!(
                    platform = %platform,
                    page = page_index,
                    records = extraction.records.len(),
                    next = ?next,
                    "Page extracted"
                );
                self.state = PaginatorState::Continuing;
                Ok(PageBatch {
                    records: extraction.records,
                    next: self.cursor.advance(next),
                    retries,
                    data_quality: None,
                })
            }
            Err(ExtractError::MalformedPage { message, next }) => {
                metrics::record_data_quality(platform);
                match next {
                    Some(next) if next != self.cursor.continuation => {
                        warn!(
                            platform = %platform,
                            page = page_index,
                            error = %message,
                            "Malformed page skipped"
                        );
                        self.state = PaginatorState::Continuing;
                        Ok(PageBatch {
                            records: Vec::new(),
                            next: self.cursor.advance(next),
                            retries,
                            data_quality: Some(message),
                        })
                    }
                    _ => Err(PaginateError::Malformed(message)),
                }
            }
            Err(e) => Err(PaginateError::Extract(e)),
        }
    }
}
