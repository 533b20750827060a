//! Chromium renderer (requires the `browser` feature)

use super::render::{RenderSession, Renderer};
use super::{PageRequest, RawPage, TransportError};
use crate::policy::FingerprintProfile;
use crate::session::Session;
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::CookieParam;
use chromiumoxide::Page;
use chrono::Utc;
use futures_util::stream::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Headless Chromium shared by all render sessions
pub struct ChromiumRenderer {
    browser: Browser,
    handler: JoinHandle<()>,
}

impl ChromiumRenderer {
    /// Launch a local headless Chromium
    pub async fn launch() -> Result<Self, TransportError> {
        let config = BrowserConfig::builder()
            .no_sandbox()
            .build()
            .map_err(TransportError::Render)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| TransportError::Render(e.to_string()))?;

        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        info!("Headless browser launched");
        Ok(Self { browser, handler })
    }

    /// Close the browser process
    pub async fn shutdown(mut self) {
        if let Err(e) = self.browser.close().await {
            warn!(error = %e, "Browser did not close cleanly");
        }
        self.handler.abort();
    }
}

#[async_trait]
impl Renderer for ChromiumRenderer {
    async fn open(
        &self,
        profile: &FingerprintProfile,
        session: &Session,
    ) -> Result<Box<dyn RenderSession>, TransportError> {
        let page = self
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| TransportError::Render(e.to_string()))?;

        page.set_user_agent(profile.user_agent.as_str())
            .await
            .map_err(|e| TransportError::Render(e.to_string()))?;

        Ok(Box::new(ChromiumTab {
            page,
            cookies: session
                .material()
                .cookies
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }))
    }
}

struct ChromiumTab {
    page: Page,
    cookies: Vec<(String, String)>,
}

#[async_trait]
impl RenderSession for ChromiumTab {
    async fn render(&mut self, request: &PageRequest) -> Result<RawPage, TransportError> {
        let url = request.full_url()?;
        let render_err = |e: chromiumoxide::error::CdpError| TransportError::Render(e.to_string());

        if !self.cookies.is_empty() {
            let cookies = self
                .cookies
                .iter()
                .map(|(name, value)| {
                    CookieParam::builder()
                        .name(name.as_str())
                        .value(value.as_str())
                        .url(url.as_str())
                        .build()
                        .map_err(TransportError::Render)
                })
                .collect::<Result<Vec<_>, _>>()?;
            self.page.set_cookies(cookies).await.map_err(render_err)?;
        }

        self.page.goto(url.as_str()).await.map_err(render_err)?;
        if let Some(selector) = &request.wait_for {
            self.page.find_element(selector.as_str()).await.map_err(render_err)?;
        }

        let body = self.page.content().await.map_err(render_err)?;
        let final_url = self
            .page
            .url()
            .await
            .map_err(render_err)?
            .unwrap_or_else(|| url.clone());

        // CDP does not surface the document status here; a rendered page is 200.
        Ok(RawPage {
            url,
            final_url,
            status: 200,
            body,
            fetched_at: Utc::now(),
        })
    }

    async fn close(self: Box<Self>) {
        if let Err(e) = self.page.close().await {
            debug!(error = %e, "Render tab close failed");
        }
    }
}
