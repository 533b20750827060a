//! Plain HTTP transport backed by reqwest

use super::{PageRequest, RawPage, Transport, TransportError};
use crate::engine::config::FetchConfig;
use crate::policy::FetchPlan;
use crate::session::Session;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT_LANGUAGE, COOKIE, USER_AGENT};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// HTTP transport sharing one connection pool across all jobs
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Arc<Client>,
}

impl HttpTransport {
    /// Build a client from fetch settings
    pub fn new(config: &FetchConfig) -> Result<Self, TransportError> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(|e| TransportError::Other(format!("failed to build HTTP client: {e}")))?;
        Ok(Self::with_client(Arc::new(client)))
    }

    /// Reuse an existing client (Arc for cheap cloning)
    pub fn with_client(client: Arc<Client>) -> Self {
        Self { client }
    }

    fn headers(
        request: &PageRequest,
        session: &Session,
        plan: &FetchPlan,
    ) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let mut put = |name: &str, value: &str| match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => warn!(header = %name, "Skipping header with invalid name or value"),
        };

        put(USER_AGENT.as_str(), &plan.profile.user_agent);
        put(ACCEPT_LANGUAGE.as_str(), &plan.profile.accept_language);
        for (name, value) in &session.material().headers {
            put(name, value);
        }
        if let Some(cookies) = session.material().cookie_header() {
            put(COOKIE.as_str(), &cookies);
        }
        // Request headers win over session headers.
        for (name, value) in &request.headers {
            put(name, value);
        }
        headers
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        request: &PageRequest,
        session: &Session,
        plan: &FetchPlan,
        timeout: Duration,
    ) -> Result<RawPage, TransportError> {
        let url = request.full_url()?;
        debug!(url = %url, "Sending HTTP request");

        let response = self
            .client
            .get(&url)
            .headers(Self::headers(request, session, plan))
            .timeout(timeout)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let body = response.text().await.map_err(map_reqwest_error)?;

        Ok(RawPage {
            url,
            final_url,
            status,
            body,
            fetched_at: Utc::now(),
        })
    }
}

fn map_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(err.to_string())
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else if err.is_builder() {
        TransportError::InvalidRequest(err.to_string())
    } else {
        TransportError::Other(err.to_string())
    }
}
