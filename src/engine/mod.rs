//! Scrape orchestration and shared engine components
//!
//! # Overview
//!
//! 1. **Context**: [`EngineContext`] owns the components shared across jobs
//!    (rate controller, session manager, extractor registry, stores)
//! 2. **Jobs**: [`ScrapeSession`] starts, resumes, cancels and reports on
//!    [`ScrapeJob`]s, one tokio task per running job
//! 3. **Rate control**: [`RateController`] keeps a token bucket per platform
//!    with adaptive backoff
//! 4. **Configuration**: [`EngineConfig`] and the constants in [`config`]
//!
//! # Error Handling
//!
//! Control operations return `Result<T, ScrapeError>`. Failures inside a
//! running job never surface here; they end the job with a
//! [`FailureReason`] visible through [`ScrapeSession::status`].

pub mod config;
pub mod executor;
pub mod job;
pub mod rate_limit;

pub use config::{
    ConfigError, EngineConfig, FetchConfig, JobDefaults, RateConfig, RetryConfig, SessionConfig,
};
pub use executor::ScrapeSession;
pub use job::{
    DataQualityEvent, FailureReason, JobLimits, JobStatus, ScrapeJob, StopReason,
};
pub use rate_limit::{RateController, RateLimitError, RateOutcome, RateSnapshot};

use crate::extractor::ExtractorRegistry;
use crate::fetcher::http::HttpTransport;
use crate::fetcher::render::{RenderTransport, Renderer};
use crate::fetcher::{FetchError, PageFetcher, Transport, TransportError};
use crate::output::{RecordSink, SinkError};
use crate::resume::{CheckpointError, CheckpointStore, MemoryCheckpointStore};
use crate::session::{Authenticator, CredentialSource, SessionError, SessionManager, StaticCredentials};
use crate::Platform;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Engine errors
#[derive(Debug, thiserror::Error)]
pub enum ScrapeError {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Target rejected before the job started
    #[error("invalid target: {0}")]
    InvalidTarget(String),

    /// Limits rejected before the job started
    #[error("invalid limits: {0}")]
    InvalidLimits(String),

    /// No adapter registered for the platform
    #[error("no extractor registered for {0}")]
    NoExtractor(Platform),

    /// Job id not known to this session or its checkpoint store
    #[error("unknown job {0}")]
    UnknownJob(Uuid),

    /// Job is already running
    #[error("job {0} is already running")]
    AlreadyRunning(Uuid),

    /// Job finished in a state that cannot be resumed
    #[error("job {job_id} cannot be resumed from status {status:?}")]
    NotResumable {
        /// Job id
        job_id: Uuid,
        /// Status it rests in
        status: JobStatus,
    },

    /// Job worker stopped without reporting a final status
    #[error("job {0} worker aborted")]
    JobAborted(Uuid),

    /// Missing builder component
    #[error("engine setup error: {0}")]
    Setup(String),

    /// Checkpoint store error
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Sink error
    #[error("sink error: {0}")]
    Sink(#[from] SinkError),

    /// Transport construction error
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Fetch error
    #[error("fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// Rate limit error
    #[error("rate limit error: {0}")]
    RateLimit(#[from] RateLimitError),

    /// Session error
    #[error("session error: {0}")]
    Session(#[from] SessionError),
}

/// Components shared by every job of an engine
///
/// Rate controller and session manager are the only cross-job mutable state;
/// both serialize per platform.
pub struct EngineContext {
    config: EngineConfig,
    rate: Arc<RateController>,
    sessions: Arc<SessionManager>,
    extractors: ExtractorRegistry,
    checkpoints: Arc<dyn CheckpointStore>,
    sink: Arc<dyn RecordSink>,
    http: Arc<dyn Transport>,
    renderer: Option<Arc<dyn Transport>>,
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("extractors", &self.extractors)
            .field("renderer", &self.renderer.is_some())
            .finish_non_exhaustive()
    }
}

impl EngineContext {
    /// Start building a context from `config`
    pub fn builder(config: EngineConfig) -> EngineContextBuilder {
        EngineContextBuilder {
            config,
            extractors: ExtractorRegistry::new(),
            checkpoints: None,
            sink: None,
            credentials: None,
            authenticator: None,
            transport: None,
            renderer: None,
        }
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Shared rate controller
    pub fn rate(&self) -> &Arc<RateController> {
        &self.rate
    }

    /// Shared session manager
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Registered extractors
    pub fn extractors(&self) -> &ExtractorRegistry {
        &self.extractors
    }

    /// Checkpoint store
    pub fn checkpoints(&self) -> &Arc<dyn CheckpointStore> {
        &self.checkpoints
    }

    /// Record sink
    pub fn sink(&self) -> &Arc<dyn RecordSink> {
        &self.sink
    }

    pub(crate) fn page_fetcher(&self) -> PageFetcher {
        let fetcher = PageFetcher::new(
            Arc::clone(&self.http),
            Arc::clone(&self.rate),
            self.config.fetch.clone(),
        );
        match &self.renderer {
            Some(renderer) => fetcher.with_renderer(Arc::clone(renderer)),
            None => fetcher,
        }
    }
}

/// Builder for [`EngineContext`]
pub struct EngineContextBuilder {
    config: EngineConfig,
    extractors: ExtractorRegistry,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    sink: Option<Arc<dyn RecordSink>>,
    credentials: Option<Arc<dyn CredentialSource>>,
    authenticator: Option<Arc<dyn Authenticator>>,
    transport: Option<Arc<dyn Transport>>,
    renderer: Option<Arc<dyn Renderer>>,
}

impl EngineContextBuilder {
    /// Extractor registry
    pub fn extractors(mut self, extractors: ExtractorRegistry) -> Self {
        self.extractors = extractors;
        self
    }

    /// Checkpoint store (defaults to in-memory)
    pub fn checkpoints(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    /// Record sink (required)
    pub fn sink(mut self, sink: Arc<dyn RecordSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Credential source (defaults to none, i.e. anonymous sessions)
    pub fn credentials(mut self, credentials: Arc<dyn CredentialSource>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Session authenticator (defaults to [`crate::session::CredentialAuthenticator`])
    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    /// HTTP transport (defaults to [`HttpTransport`])
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Renderer for platforms that need a browser
    pub fn renderer(mut self, renderer: Arc<dyn Renderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    /// Validate the configuration and assemble the context
    pub fn build(self) -> Result<Arc<EngineContext>, ScrapeError> {
        self.config.validate()?;

        let sink = self
            .sink
            .ok_or_else(|| ScrapeError::Setup("a record sink is required".to_string()))?;
        let checkpoints = self.checkpoints.unwrap_or_else(|| {
            debug!("No checkpoint store configured, keeping checkpoints in memory");
            Arc::new(MemoryCheckpointStore::new())
        });
        let credentials = self
            .credentials
            .unwrap_or_else(|| Arc::new(StaticCredentials::new()));
        let sessions = match self.authenticator {
            Some(authenticator) => SessionManager::with_authenticator(credentials, authenticator),
            None => SessionManager::new(credentials),
        }
        .with_ttl(self.config.session.ttl());

        let http: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(&self.config.fetch)?),
        };
        let renderer = self
            .renderer
            .map(|r| Arc::new(RenderTransport::new(r)) as Arc<dyn Transport>);

        Ok(Arc::new(EngineContext {
            rate: Arc::new(RateController::new(&self.config)),
            sessions: Arc::new(sessions),
            extractors: self.extractors,
            checkpoints,
            sink,
            http,
            renderer,
            config: self.config,
        }))
    }
}
