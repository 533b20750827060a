//! Failure classification and retry message formatting
//!
//! Every fetch failure maps to a [`FailureKind`] that knows whether it is worth
//! retrying and how to describe itself to an operator. [`RetryContext`] turns a
//! failing page into consistent retry and final-failure log lines.

use super::TransportError;
use crate::{Platform, Target};
use std::time::Duration;

/// Classified cause of a failed fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Request timed out
    NetworkTimeout,
    /// Connection refused, reset, DNS failure
    NetworkOffline,
    /// HTTP 429 or equivalent throttling
    RateLimit,
    /// HTTP 5xx
    ServerError(u16),
    /// HTTP 400 or a request that could not be built
    InvalidRequest,
    /// HTTP 401/403 or a login wall
    AuthFailed(u16),
    /// HTTP 404
    NotFound,
    /// HTTP 451 or a captcha / ban page
    Banned,
    /// Other 4xx
    ClientError(u16),
    /// Page needs rendering but no browser is configured
    RenderUnavailable,
    /// Fallback
    NetworkGeneric,
}

impl FailureKind {
    /// Short description used in log lines
    pub fn description(&self) -> &'static str {
        match self {
            Self::NetworkTimeout => "network timeout",
            Self::NetworkOffline => "connection failed",
            Self::RateLimit => "rate limit exceeded",
            Self::ServerError(code) => match code {
                500 => "internal server error",
                502 => "bad gateway",
                503 => "service unavailable",
                504 => "gateway timeout",
                _ => "server error",
            },
            Self::InvalidRequest => "invalid request",
            Self::AuthFailed(code) => match code {
                401 => "authentication required (401)",
                403 => "access forbidden (403)",
                _ => "login wall",
            },
            Self::NotFound => "page not found",
            Self::Banned => "client blocked by site",
            Self::ClientError(_) => "client error",
            Self::RenderUnavailable => "no browser renderer configured",
            Self::NetworkGeneric => "network error",
        }
    }

    /// Remediation hint for final failure summaries
    pub fn suggestion(&self) -> &'static str {
        match self {
            Self::NetworkTimeout => "Check network connectivity or raise fetch.request_timeout_ms",
            Self::NetworkOffline => "Verify internet connectivity and DNS resolution",
            Self::RateLimit => "Lower the platform refill rate or resume the job later",
            Self::ServerError(_) => "The site may be degraded; resume the job later",
            Self::InvalidRequest => "Check the target query and filters",
            Self::AuthFailed(_) => "Re-authenticate the platform credentials and reset the session",
            Self::NotFound => "Check that the channel, category or listing still exists",
            Self::Banned => "Pause scraping this platform and rotate network egress before resuming",
            Self::ClientError(_) => "Review the request the extractor builds for this platform",
            Self::RenderUnavailable => "Build with the `browser` feature and configure a renderer",
            Self::NetworkGeneric => "Check network connectivity and try again",
        }
    }

    /// Whether a retry can plausibly succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NetworkTimeout
                | Self::NetworkOffline
                | Self::RateLimit
                | Self::ServerError(_)
                | Self::NetworkGeneric
        )
    }

    /// Stable label for metrics
    pub fn label(&self) -> &'static str {
        match self {
            Self::NetworkTimeout => "timeout",
            Self::NetworkOffline => "offline",
            Self::RateLimit => "rate_limit",
            Self::ServerError(_) => "server_error",
            Self::InvalidRequest => "invalid_request",
            Self::AuthFailed(_) => "auth",
            Self::NotFound => "not_found",
            Self::Banned => "banned",
            Self::ClientError(_) => "client_error",
            Self::RenderUnavailable => "render_unavailable",
            Self::NetworkGeneric => "network",
        }
    }
}

/// Classify an HTTP status; `None` for 1xx-3xx
pub fn classify_status(status: u16) -> Option<FailureKind> {
    match status {
        400 => Some(FailureKind::InvalidRequest),
        401 | 403 => Some(FailureKind::AuthFailed(status)),
        404 | 410 => Some(FailureKind::NotFound),
        429 => Some(FailureKind::RateLimit),
        451 => Some(FailureKind::Banned),
        500..=599 => Some(FailureKind::ServerError(status)),
        402..=499 => Some(FailureKind::ClientError(status)),
        _ => None,
    }
}

/// Classify a transport failure
pub fn classify_transport(err: &TransportError) -> FailureKind {
    match err {
        TransportError::Timeout(_) => FailureKind::NetworkTimeout,
        TransportError::Connect(_) => FailureKind::NetworkOffline,
        TransportError::InvalidRequest(_) => FailureKind::InvalidRequest,
        TransportError::Render(_) | TransportError::Other(_) => FailureKind::NetworkGeneric,
    }
}

/// Context for formatting retry messages
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// Current retry number (1-based)
    pub attempt: u32,
    /// Configured maximum retries
    pub max_attempts: u32,
    /// Cause of the retry
    pub kind: FailureKind,
    /// Backoff before the next attempt
    pub backoff: Duration,
    /// Platform being scraped
    pub platform: Platform,
    /// Target provenance key
    pub target_key: String,
    /// Page index within the job
    pub page: u64,
    /// Last error message
    pub error_message: String,
}

impl RetryContext {
    /// Context for a failing page of `target`
    pub fn new(
        target: &Target,
        page: u64,
        attempt: u32,
        max_attempts: u32,
        kind: FailureKind,
        backoff: Duration,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            attempt,
            max_attempts,
            kind,
            backoff,
            platform: target.platform,
            target_key: target.key(),
            page,
            error_message: error_message.into(),
        }
    }

    /// Retry log line
    pub fn format_retry(&self) -> String {
        format!(
            "Retrying page {} (attempt {}/{}) after {} - waiting {:.1} seconds... ({})",
            self.page,
            self.attempt,
            self.max_attempts,
            self.kind.description(),
            self.backoff.as_secs_f64(),
            self.target_key
        )
    }

    /// Line logged when a retried page finally succeeds
    pub fn format_success(&self) -> String {
        format!(
            "Page {} succeeded on retry {}/{} - resuming ({})",
            self.page, self.attempt, self.max_attempts, self.target_key
        )
    }

    /// Multi-line summary once retries are exhausted
    pub fn format_failure(&self) -> String {
        let mut lines = vec![
            format!(
                "[FAILED] Page {} failed after {} retries",
                self.page, self.max_attempts
            ),
            format!("  Last error: {}", self.error_message),
            format!("  Platform: {}", self.platform),
            format!("  Target: {}", self.target_key),
            "  Suggestions:".to_string(),
        ];
        for suggestion in self.format_suggestions() {
            lines.push(format!("    - {suggestion}"));
        }
        lines.join("\n")
    }

    /// Suggestions for the failure summary
    pub fn format_suggestions(&self) -> Vec<String> {
        let mut suggestions = vec![self.kind.suggestion().to_string()];
        if self.kind.is_retryable() {
            suggestions.push(format!(
                "Raise retry.max_retries (current: {}) or resume the job",
                self.max_attempts
            ));
        }
        suggestions
    }
}
