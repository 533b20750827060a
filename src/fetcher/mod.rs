//! Page fetching
//!
//! A fetch goes through three layers:
//!
//! - [`Transport`]: moves bytes. [`http::HttpTransport`] for plain HTTP and
//!   [`render::RenderTransport`] for pages that need a browser.
//! - [`page_fetcher::PageFetcher`]: one attempt, gated by the rate controller
//!   and classified into transient, permanent or auth-challenge failures.
//! - [`pagination::Paginator`]: walks a target's cursor, retrying transient
//!   failures with backoff.

#[cfg(feature = "browser")]
pub mod browser;
pub mod http;
pub mod page_fetcher;
pub mod pagination;
pub mod render;
pub mod retry_formatter;

pub use page_fetcher::PageFetcher;
pub use pagination::{Continuation, Cursor, PageBatch, PaginateError, Paginator, PaginatorState};
pub use retry_formatter::FailureKind;

use crate::engine::RateLimitError;
use crate::policy::FetchPlan;
use crate::session::Session;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::time::Duration;

/// Fetch errors
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// Worth retrying: timeouts, 5xx, connection resets, throttling
    #[error("transient fetch failure ({}): {message}", .kind.description())]
    Transient {
        /// Classified cause
        kind: FailureKind,
        /// Detail
        message: String,
    },

    /// Retrying will not help: 404, malformed target, ban signal
    #[error("permanent fetch failure ({}): {message}", .kind.description())]
    Permanent {
        /// Classified cause
        kind: FailureKind,
        /// Detail
        message: String,
    },

    /// Server wants the client to re-authenticate
    #[error("authentication challenge: {message}")]
    AuthChallenge {
        /// HTTP status, when the challenge was a status code
        status: Option<u16>,
        /// Detail
        message: String,
    },

    /// Rate budget refused the request
    #[error(transparent)]
    RateExceeded(#[from] RateLimitError),
}

impl FetchError {
    /// Whether the paginator should retry after backoff
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient { .. })
    }

    /// Classified cause, when there is one
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            FetchError::Transient { kind, .. } | FetchError::Permanent { kind, .. } => Some(*kind),
            FetchError::AuthChallenge { status, .. } => {
                Some(FailureKind::AuthFailed(status.unwrap_or(401)))
            }
            FetchError::RateExceeded(_) => Some(FailureKind::RateLimit),
        }
    }
}

/// Low-level transport failure, before classification
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// Request did not finish within its timeout
    #[error("timed out: {0}")]
    Timeout(String),

    /// Could not connect (DNS, refused, reset)
    #[error("connection failed: {0}")]
    Connect(String),

    /// Request could not be built (unparseable URL, bad header)
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Browser could not be opened or driven
    #[error("render failed: {0}")]
    Render(String),

    /// Anything else
    #[error("{0}")]
    Other(String),
}

/// What to fetch for one page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    /// Absolute URL without query string
    pub url: String,
    /// Query parameters, in order
    pub query: Vec<(String, String)>,
    /// Extra request headers
    pub headers: BTreeMap<String, String>,
    /// CSS selector a rendered page must contain before it is captured
    pub wait_for: Option<String>,
}

impl PageRequest {
    /// GET request for `url`
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            query: Vec::new(),
            headers: BTreeMap::new(),
            wait_for: None,
        }
    }

    /// Append a query parameter
    pub fn param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    /// Add a request header
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Selector to wait for when rendering
    pub fn wait_for(mut self, selector: impl Into<String>) -> Self {
        self.wait_for = Some(selector.into());
        self
    }

    /// URL with the query string applied
    pub fn full_url(&self) -> Result<String, TransportError> {
        reqwest::Url::parse_with_params(&self.url, &self.query)
            .map(String::from)
            .map_err(|e| TransportError::InvalidRequest(format!("invalid url {}: {e}", self.url)))
    }
}

/// One fetch result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPage {
    /// URL that was requested, including the query string
    pub url: String,
    /// URL after redirects
    pub final_url: String,
    /// HTTP status
    pub status: u16,
    /// Response body
    pub body: String,
    /// When the response arrived
    pub fetched_at: DateTime<Utc>,
}

impl RawPage {
    /// Page with status 200 and no redirect
    pub fn ok(url: impl Into<String>, body: impl Into<String>) -> Self {
        Self::with_status(url, 200, body)
    }

    /// Page with an explicit status and no redirect
    pub fn with_status(url: impl Into<String>, status: u16, body: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            final_url: url.clone(),
            url,
            status,
            body: body.into(),
            fetched_at: Utc::now(),
        }
    }
}

/// Moves one request over the wire
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `request` with the session's cookies and the plan's identity
    ///
    /// Any HTTP status counts as success here; classification happens in
    /// [`PageFetcher`], which also abandons the call once `timeout` passes.
    async fn send(
        &self,
        request: &PageRequest,
        session: &Session,
        plan: &FetchPlan,
        timeout: Duration,
    ) -> Result<RawPage, TransportError>;
}
