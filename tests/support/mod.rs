//! Shared fixtures: scripted transports, counting authenticators, flaky stores

#![allow(dead_code)]

use async_trait::async_trait;
use multiscrape::engine::{EngineConfig, EngineContext, ScrapeSession};
use multiscrape::extractor::{ExtractorRegistry, JsonFeedExtractor};
use multiscrape::fetcher::{PageRequest, RawPage, Transport, TransportError};
use multiscrape::output::RecordSink;
use multiscrape::policy::{AntiDetectionConfig, FetchPlan};
use multiscrape::resume::{Checkpoint, CheckpointError, CheckpointStore, MemoryCheckpointStore};
use multiscrape::session::{
    Authenticator, CredentialAuthenticator, Credentials, Session, SessionError, SessionMaterial,
};
use multiscrape::Platform;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use uuid::Uuid;

/// Feed base URL registered for `platform`
pub fn feed_url(platform: Platform) -> String {
    format!("https://feed.example/{platform}/search")
}

/// Registry with a JSON feed adapter for every platform
pub fn feed_registry() -> ExtractorRegistry {
    Platform::ALL.into_iter().fold(ExtractorRegistry::new(), |registry, platform| {
        registry.with(platform, Arc::new(JsonFeedExtractor::new(feed_url(platform))))
    })
}

/// Config with pacing off and a generous rate budget
pub fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.anti_detection = AntiDetectionConfig::disabled();
    config.rate.capacity = 1000;
    config.rate.refill_per_sec = 1000.0;
    config
}

/// `{items, next}` body for one page
pub fn feed_body(platform: Platform, page: u32, per_page: u32, last_page: u32) -> String {
    let items: Vec<String> = (0..per_page)
        .map(|i| {
            format!(
                r#"{{"url":"https://{platform}.example/item/{page}-{i}","title":"Item {page}-{i}","rank":{i}}}"#
            )
        })
        .collect();
    let next = if page < last_page {
        (page + 1).to_string()
    } else {
        "null".to_string()
    };
    format!(r#"{{"items":[{}],"next":{next}}}"#, items.join(","))
}

fn page_param(request: &PageRequest) -> u32 {
    request
        .query
        .iter()
        .find(|(key, _)| key == "page")
        .and_then(|(_, value)| value.parse().ok())
        .unwrap_or(1)
}

fn platform_of(request: &PageRequest) -> Platform {
    Platform::ALL
        .into_iter()
        .find(|p| request.url == feed_url(*p))
        .unwrap_or(Platform::News)
}

/// Transport serving numbered feed pages, with scripted failures
pub struct ScriptedFeed {
    pages: u32,
    per_page: u32,
    failures: Mutex<HashMap<u32, VecDeque<u16>>>,
    always: Option<u16>,
    gate: Option<(u32, Arc<Semaphore>)>,
    requests: AtomicU32,
    page_requests: Mutex<HashMap<u32, u32>>,
}

impl ScriptedFeed {
    /// `pages` pages of `per_page` items each
    pub fn new(pages: u32, per_page: u32) -> Self {
        Self {
            pages,
            per_page,
            failures: Mutex::new(HashMap::new()),
            always: None,
            gate: None,
            requests: AtomicU32::new(0),
            page_requests: Mutex::new(HashMap::new()),
        }
    }

    /// Answer `page` with these statuses before serving it normally
    pub fn fail_page(self, page: u32, statuses: &[u16]) -> Self {
        self.failures
            .lock()
            .unwrap()
            .insert(page, statuses.iter().copied().collect());
        self
    }

    /// Answer every request with `status`
    pub fn always(mut self, status: u16) -> Self {
        self.always = Some(status);
        self
    }

    /// Hold `page` until a permit is added to `gate`
    pub fn gate_page(mut self, page: u32, gate: Arc<Semaphore>) -> Self {
        self.gate = Some((page, gate));
        self
    }

    /// Requests served so far
    pub fn requests(&self) -> u32 {
        self.requests.load(Ordering::SeqCst)
    }

    /// Requests served for one page number
    pub fn requests_for(&self, page: u32) -> u32 {
        self.page_requests
            .lock()
            .unwrap()
            .get(&page)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl Transport for ScriptedFeed {
    async fn send(
        &self,
        request: &PageRequest,
        _session: &Session,
        _plan: &FetchPlan,
        _timeout: Duration,
    ) -> Result<RawPage, TransportError> {
        let page = page_param(request);
        let platform = platform_of(request);
        let url = request.full_url()?;
        self.requests.fetch_add(1, Ordering::SeqCst);
        *self.page_requests.lock().unwrap().entry(page).or_insert(0) += 1;

        if let Some((gated, gate)) = &self.gate {
            if *gated == page {
                gate.acquire().await.unwrap().forget();
            }
        }

        if let Some(status) = self.always {
            return Ok(RawPage::with_status(url, status, "denied"));
        }

        let scripted = self
            .failures
            .lock()
            .unwrap()
            .get_mut(&page)
            .and_then(VecDeque::pop_front);
        if let Some(status) = scripted {
            return Ok(RawPage::with_status(url, status, "scripted failure"));
        }

        Ok(RawPage::ok(url, feed_body(platform, page, self.per_page, self.pages)))
    }
}

/// Transport answering with fixed bodies per page number
pub struct BodyFeed {
    bodies: HashMap<u32, String>,
}

impl BodyFeed {
    /// Pages 1..=n with the given bodies
    pub fn new(bodies: Vec<String>) -> Self {
        Self {
            bodies: bodies
                .into_iter()
                .enumerate()
                .map(|(i, body)| (i as u32 + 1, body))
                .collect(),
        }
    }
}

#[async_trait]
impl Transport for BodyFeed {
    async fn send(
        &self,
        request: &PageRequest,
        _session: &Session,
        _plan: &FetchPlan,
        _timeout: Duration,
    ) -> Result<RawPage, TransportError> {
        let page = page_param(request);
        match self.bodies.get(&page) {
            Some(body) => Ok(RawPage::ok(request.full_url()?, body.clone())),
            None => Ok(RawPage::with_status(request.full_url()?, 404, "")),
        }
    }
}

/// [`CredentialAuthenticator`] that counts calls
#[derive(Default)]
pub struct CountingAuthenticator {
    inner: CredentialAuthenticator,
    pub logins: AtomicU32,
    pub refreshes: AtomicU32,
}

impl CountingAuthenticator {
    pub fn logins(&self) -> u32 {
        self.logins.load(Ordering::SeqCst)
    }

    pub fn refreshes(&self) -> u32 {
        self.refreshes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Authenticator for CountingAuthenticator {
    async fn login(
        &self,
        platform: Platform,
        credentials: Option<&Credentials>,
    ) -> Result<SessionMaterial, SessionError> {
        self.logins.fetch_add(1, Ordering::SeqCst);
        self.inner.login(platform, credentials).await
    }

    async fn refresh(
        &self,
        platform: Platform,
        previous: &Session,
        credentials: Option<&Credentials>,
    ) -> Result<SessionMaterial, SessionError> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        // Give a concurrent job the chance to pile up behind this refresh.
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.inner.refresh(platform, previous, credentials).await
    }
}

/// Memory store whose `fail_on`-th write (1-based) fails
pub struct FlakyStore {
    inner: MemoryCheckpointStore,
    fail_on: u32,
    writes: AtomicU32,
}

impl FlakyStore {
    pub fn new(fail_on: u32) -> Self {
        Self {
            inner: MemoryCheckpointStore::new(),
            fail_on,
            writes: AtomicU32::new(0),
        }
    }

    pub async fn history(&self, job_id: Uuid) -> Vec<Checkpoint> {
        self.inner.history(job_id).await
    }
}

#[async_trait]
impl CheckpointStore for FlakyStore {
    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let n = self.writes.fetch_add(1, Ordering::SeqCst) + 1;
        if n == self.fail_on {
            return Err(CheckpointError::IoError("disk full".to_string()));
        }
        self.inner.save_checkpoint(checkpoint).await
    }

    async fn load_checkpoint(&self, job_id: Uuid) -> Result<Option<Checkpoint>, CheckpointError> {
        self.inner.load_checkpoint(job_id).await
    }

    async fn list_jobs(&self) -> Result<Vec<Uuid>, CheckpointError> {
        self.inner.list_jobs().await
    }
}

/// Session wired to the feed registry and the given parts
pub fn session_with(
    config: EngineConfig,
    transport: Arc<dyn Transport>,
    sink: Arc<dyn RecordSink>,
    store: Arc<dyn CheckpointStore>,
) -> ScrapeSession {
    let context = EngineContext::builder(config)
        .extractors(feed_registry())
        .transport(transport)
        .sink(sink)
        .checkpoints(store)
        .build()
        .unwrap();
    ScrapeSession::new(context)
}
