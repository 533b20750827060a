//! Rendered-browser fetch path
//!
//! A [`Renderer`] opens a [`RenderSession`] (one browser tab) per fetch.
//! [`RenderTransport`] closes that tab on every exit path: success, render
//! failure and timeout alike. Opening the tab and rendering share one
//! deadline.

use super::{PageRequest, RawPage, Transport, TransportError};
use crate::policy::{FetchPlan, FingerprintProfile};
use crate::session::Session;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Opens browser tabs
#[async_trait]
pub trait Renderer: Send + Sync {
    /// Open a tab presenting `profile` and carrying the session's cookies
    async fn open(
        &self,
        profile: &FingerprintProfile,
        session: &Session,
    ) -> Result<Box<dyn RenderSession>, TransportError>;
}

/// One open browser tab
#[async_trait]
pub trait RenderSession: Send {
    /// Navigate and capture the rendered document
    async fn render(&mut self, request: &PageRequest) -> Result<RawPage, TransportError>;

    /// Release the tab
    async fn close(self: Box<Self>);
}

/// [`Transport`] adapter over a [`Renderer`]
#[derive(Clone)]
pub struct RenderTransport {
    renderer: Arc<dyn Renderer>,
}

impl RenderTransport {
    /// Wrap a renderer
    pub fn new(renderer: Arc<dyn Renderer>) -> Self {
        Self { renderer }
    }
}

impl std::fmt::Debug for RenderTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderTransport").finish_non_exhaustive()
    }
}

#[async_trait]
impl Transport for RenderTransport {
    async fn send(
        &self,
        request: &PageRequest,
        session: &Session,
        plan: &FetchPlan,
        timeout: Duration,
    ) -> Result<RawPage, TransportError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let open = self.renderer.open(&plan.profile, session);
        let mut tab = match tokio::time::timeout_at(deadline, open).await {
            Ok(opened) => opened?,
            Err(_) => {
                warn!(url = %request.url, timeout_ms = timeout.as_millis(), "Opening a tab timed out");
                return Err(TransportError::Timeout(format!(
                    "opening a tab for {} exceeded {:?}",
                    request.url, timeout
                )));
            }
        };

        let result = match tokio::time::timeout_at(deadline, tab.render(request)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(url = %request.url, timeout_ms = timeout.as_millis(), "Render timed out");
                Err(TransportError::Timeout(format!(
                    "render of {} exceeded {:?}",
                    request.url, timeout
                )))
            }
        };

        tab.close().await;
        debug!(url = %request.url, ok = result.is_ok(), "Render tab closed");
        result
    }
}
