//! Single-page fetch through the rate controller
//!
//! [`PageFetcher::fetch`] performs exactly one attempt:
//!
//! 1. Sleep the plan's think time
//! 2. `RateController::acquire` for the platform
//! 3. Send through the HTTP or render transport, per the plan
//! 4. Report the outcome back to the rate controller
//! 5. Classify the response
//!
//! | Response                            | Result              | Reported        |
//! |-------------------------------------|---------------------|-----------------|
//! | 2xx / 3xx                           | `Ok(RawPage)`       | `Success`       |
//! | 401, 403, login-wall redirect       | `AuthChallenge`     | `Success`       |
//! | 429                                 | `Transient`         | `RateLimited`   |
//! | 451, ban marker in body             | `Permanent`         | `Blocked`       |
//! | 5xx                                 | `Transient`         | `Success`       |
//! | other 4xx                           | `Permanent`         | `Success`       |
//! | timeout, connection failure         | `Transient`         | nothing         |
//! | unbuildable request (bad URL)       | `Permanent`         | nothing         |
//!
//! The request timeout is enforced here, whether or not the transport
//! honours the timeout it is handed.

use super::retry_formatter::{classify_status, classify_transport, FailureKind};
use super::{FetchError, PageRequest, RawPage, Transport, TransportError};
use crate::engine::config::FetchConfig;
use crate::engine::{RateController, RateOutcome};
use crate::metrics::FetchMetrics;
use crate::policy::{FetchPlan, RenderMode};
use crate::session::Session;
use crate::Platform;
use std::sync::Arc;
use tracing::{debug, warn};

/// Performs one fetch attempt
#[derive(Clone)]
pub struct PageFetcher {
    http: Arc<dyn Transport>,
    renderer: Option<Arc<dyn Transport>>,
    rate: Arc<RateController>,
    config: FetchConfig,
}

impl std::fmt::Debug for PageFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageFetcher")
            .field("renderer", &self.renderer.is_some())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PageFetcher {
    /// Create a fetcher with an HTTP transport and no renderer
    pub fn new(http: Arc<dyn Transport>, rate: Arc<RateController>, config: FetchConfig) -> Self {
        Self {
            http,
            renderer: None,
            rate,
            config,
        }
    }

    /// Add a rendered-browser transport
    pub fn with_renderer(mut self, renderer: Arc<dyn Transport>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    /// Fetch one page for `session`'s platform
    pub async fn fetch(
        &self,
        request: &PageRequest,
        session: &Session,
        plan: &FetchPlan,
    ) -> Result<RawPage, FetchError> {
        let platform = session.platform();

        let transport = match plan.render {
            RenderMode::Http => &self.http,
            RenderMode::Browser => self.renderer.as_ref().ok_or_else(|| FetchError::Permanent {
                kind: FailureKind::RenderUnavailable,
                message: format!("{platform} needs a rendered page"),
            })?,
        };

        if !plan.think_time.is_zero() {
            tokio::time::sleep(plan.think_time).await;
        }
        self.rate.acquire(platform).await?;

        let metrics = FetchMetrics::start(platform).await;
        let timeout = self.config.request_timeout();
        let send = transport.send(request, session, plan, timeout);
        let sent = match tokio::time::timeout(timeout, send).await {
            Ok(sent) => sent,
            Err(_) => Err(TransportError::Timeout(format!(
                "{} gave no response within {timeout:?}",
                request.url
            ))),
        };
        let page = match sent {
            Ok(page) => page,
            Err(e) => {
                metrics.record_network_error();
                let kind = classify_transport(&e);
                warn!(platform = %platform, url = %request.url, error = %e, "Fetch failed");
                let message = e.to_string();
                return Err(if kind.is_retryable() {
                    FetchError::Transient { kind, message }
                } else {
                    FetchError::Permanent { kind, message }
                });
            }
        };
        metrics.record_complete(page.status);

        let outcome = self.outcome(&page);
        self.rate.report(platform, outcome).await;
        self.classify(platform, page, outcome)
    }

    fn outcome(&self, page: &RawPage) -> RateOutcome {
        if page.status == 429 {
            RateOutcome::RateLimited
        } else if page.status == 451 || self.ban_marker(page).is_some() {
            RateOutcome::Blocked
        } else {
            RateOutcome::Success
        }
    }

    fn ban_marker(&self, page: &RawPage) -> Option<&str> {
        if self.config.ban_markers.is_empty() {
            return None;
        }
        let haystack = format!("{}\n{}", page.final_url, page.body).to_lowercase();
        self.config
            .ban_markers
            .iter()
            .map(String::as_str)
            .find(|marker| haystack.contains(&marker.to_lowercase()))
    }

    fn login_wall(&self, platform: Platform, page: &RawPage) -> bool {
        let final_url = page.final_url.to_lowercase();
        self.config
            .login_wall_markers
            .get(&platform)
            .map(|markers| {
                markers
                    .iter()
                    .any(|marker| final_url.contains(&marker.to_lowercase()))
            })
            .unwrap_or(false)
    }

    fn classify(
        &self,
        platform: Platform,
        page: RawPage,
        outcome: RateOutcome,
    ) -> Result<RawPage, FetchError> {
        if outcome == RateOutcome::Blocked {
            let marker = self.ban_marker(&page).unwrap_or("451");
            warn!(platform = %platform, url = %page.url, marker = %marker, "Ban signal detected");
            return Err(FetchError::Permanent {
                kind: FailureKind::Banned,
                message: format!("ban signal '{marker}' on {}", page.url),
            });
        }

        match classify_status(page.status) {
            Some(FailureKind::AuthFailed(status)) => Err(FetchError::AuthChallenge {
                status: Some(status),
                message: format!("status {status} from {}", page.url),
            }),
            Some(kind) if kind.is_retryable() => Err(FetchError::Transient {
                kind,
                message: format!("status {} from {}", page.status, page.url),
            }),
            Some(kind) => Err(FetchError::Permanent {
                kind,
                message: format!("status {} from {}", page.status, page.url),
            }),
            None if self.login_wall(platform, &page) => Err(FetchError::AuthChallenge {
                status: None,
                message: format!("redirected to login wall {}", page.final_url),
            }),
            None => {
                debug!(platform = %platform, status = page.status, bytes = page.body.len(), "Page fetched");
                Ok(page)
            }
        }
    }
}
