//! Platform session lifecycle
//!
//! A [`SessionManager`] owns at most one session per platform. Sessions are
//! created lazily on the first [`SessionManager::lease`], handed out as
//! immutable [`Arc<Session>`] snapshots and replaced wholesale on refresh.
//!
//! ```text
//! unauthenticated --login--> active --auth challenge / ttl--> expiring
//!                               ^                                 |
//!                               +---------- refresh ok -----------+
//!                                                                 |
//!                               invalid <------ refresh failed ---+
//! ```
//!
//! The per-platform slot lock is held across login and refresh, so concurrent
//! leases on a platform wait for the one refresh in flight and share its result.

mod credentials;

pub use credentials::{CredentialSource, Credentials, EnvCredentials, StaticCredentials, ENV_PREFIX};

use crate::metrics;
use crate::Platform;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Session errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    /// Credential source failed
    #[error("credential error: {0}")]
    CredentialError(String),

    /// Initial login failed
    #[error("login failed for {platform}: {message}")]
    LoginFailed {
        /// Platform
        platform: Platform,
        /// Cause
        message: String,
    },

    /// Session needs re-authentication and refresh failed
    #[error("session expired for {platform}: {message}")]
    AuthExpired {
        /// Platform
        platform: Platform,
        /// Cause
        message: String,
    },
}

/// Lifecycle state of a platform session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session yet
    Unauthenticated,
    /// Usable
    Active,
    /// Needs a refresh before the next lease
    Expiring,
    /// Refresh failed; unusable until [`SessionManager::reset`]
    Invalid,
}

/// Why a session is being invalidated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationReason {
    /// Server demanded re-authentication (401/403, login wall)
    AuthChallenge,
    /// Session outlived its TTL
    Expired,
    /// Session is discarded outright; the next lease logs in again
    Revoked,
}

/// Cookies and headers that make up a platform session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionMaterial {
    /// Cookies sent with every request
    pub cookies: BTreeMap<String, String>,
    /// Extra request headers
    pub headers: BTreeMap<String, String>,
}

impl SessionMaterial {
    /// Render cookies as a `Cookie` header value
    pub fn cookie_header(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        Some(
            self.cookies
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

/// Immutable snapshot of a platform session
#[derive(Debug, Clone)]
pub struct Session {
    platform: Platform,
    generation: u64,
    material: SessionMaterial,
    authenticated: bool,
    created_at: Instant,
}

impl Session {
    /// Platform this session belongs to
    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// Monotonic counter, bumped on every login or refresh
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Cookies and headers
    pub fn material(&self) -> &SessionMaterial {
        &self.material
    }

    /// Whether the session was established with credentials
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Time since login or last refresh
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

/// Turns credentials into session material
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Establish a new session
    async fn login(
        &self,
        platform: Platform,
        credentials: Option<&Credentials>,
    ) -> Result<SessionMaterial, SessionError>;

    /// Re-establish an expiring session. Defaults to a fresh login.
    async fn refresh(
        &self,
        platform: Platform,
        _previous: &Session,
        credentials: Option<&Credentials>,
    ) -> Result<SessionMaterial, SessionError> {
        self.login(platform, credentials).await
    }
}

/// Maps a credential bundle straight onto session material
///
/// `cookie.<name>` keys become cookies, `header.<name>` keys become headers and
/// `token` becomes a bearer `Authorization` header. Without credentials the
/// session is anonymous, and an anonymous session cannot be refreshed.
#[derive(Debug, Clone, Copy, Default)]
pub struct CredentialAuthenticator;

#[async_trait]
impl Authenticator for CredentialAuthenticator {
    async fn login(
        &self,
        _platform: Platform,
        credentials: Option<&Credentials>,
    ) -> Result<SessionMaterial, SessionError> {
        let mut material = SessionMaterial::default();
        let Some(credentials) = credentials else {
            return Ok(material);
        };

        for (key, value) in credentials.iter() {
            if let Some(name) = key.strip_prefix("cookie.") {
                material.cookies.insert(name.to_string(), value.to_string());
            } else if let Some(name) = key.strip_prefix("header.") {
                material.headers.insert(name.to_string(), value.to_string());
            } else if key == "token" {
                material
                    .headers
                    .insert("authorization".to_string(), format!("Bearer {value}"));
            }
        }
        Ok(material)
    }

    async fn refresh(
        &self,
        platform: Platform,
        _previous: &Session,
        credentials: Option<&Credentials>,
    ) -> Result<SessionMaterial, SessionError> {
        match credentials {
            Some(credentials) => self.login(platform, Some(credentials)).await,
            None => Err(SessionError::AuthExpired {
                platform,
                message: "no stored credentials to re-authenticate with".to_string(),
            }),
        }
    }
}

#[derive(Debug)]
struct Slot {
    state: SessionState,
    current: Option<Arc<Session>>,
    generation: u64,
    failure: Option<String>,
}

impl Slot {
    fn empty() -> Self {
        Self {
            state: SessionState::Unauthenticated,
            current: None,
            generation: 0,
            failure: None,
        }
    }
}

/// Owner of all platform sessions
pub struct SessionManager {
    slots: HashMap<Platform, Mutex<Slot>>,
    credentials: Arc<dyn CredentialSource>,
    authenticator: Arc<dyn Authenticator>,
    ttl: Option<Duration>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Create a manager with the default [`CredentialAuthenticator`]
    pub fn new(credentials: Arc<dyn CredentialSource>) -> Self {
        Self::with_authenticator(credentials, Arc::new(CredentialAuthenticator))
    }

    /// Create a manager with a custom authenticator
    pub fn with_authenticator(
        credentials: Arc<dyn CredentialSource>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        let slots = Platform::ALL
            .iter()
            .map(|p| (*p, Mutex::new(Slot::empty())))
            .collect();
        Self {
            slots,
            credentials,
            authenticator,
            ttl: None,
        }
    }

    /// Treat sessions older than `ttl` as expiring
    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    fn slot(&self, platform: Platform) -> &Mutex<Slot> {
        // Every platform gets a slot at construction.
        &self.slots[&platform]
    }

    /// Get a usable session for `platform`, logging in or refreshing as needed
    pub async fn lease(&self, platform: Platform) -> Result<Arc<Session>, SessionError> {
        let mut slot = self.slot(platform).lock().await;

        let aged = match (self.ttl, slot.state, slot.current.as_ref()) {
            (Some(ttl), SessionState::Active, Some(current)) => current.age() >= ttl,
            _ => false,
        };
        if aged {
            debug!(platform = %platform, "Session outlived its TTL");
            slot.state = SessionState::Expiring;
        }

        match slot.state {
            SessionState::Active => match slot.current.clone() {
                Some(session) => Ok(session),
                None => self.login(platform, &mut slot).await,
            },
            SessionState::Unauthenticated => self.login(platform, &mut slot).await,
            SessionState::Expiring => self.refresh(platform, &mut slot).await,
            SessionState::Invalid => Err(SessionError::AuthExpired {
                platform,
                message: slot
                    .failure
                    .clone()
                    .unwrap_or_else(|| "session invalid".to_string()),
            }),
        }
    }

    async fn login(
        &self,
        platform: Platform,
        slot: &mut Slot,
    ) -> Result<Arc<Session>, SessionError> {
        let credentials = self.credentials.get_credentials(platform).await?;
        match self.authenticator.login(platform, credentials.as_ref()).await {
            Ok(material) => {
                let session = Self::install(slot, platform, material, credentials.is_some());
                info!(
                    platform = %platform,
                    generation = session.generation,
                    authenticated = session.authenticated,
                    "Session established"
                );
                Ok(session)
            }
            Err(e) => {
                warn!(platform = %platform, error = %e, "Login failed");
                slot.state = SessionState::Invalid;
                slot.current = None;
                slot.failure = Some(e.to_string());
                Err(SessionError::LoginFailed {
                    platform,
                    message: e.to_string(),
                })
            }
        }
    }

    async fn refresh(
        &self,
        platform: Platform,
        slot: &mut Slot,
    ) -> Result<Arc<Session>, SessionError> {
        let Some(previous) = slot.current.clone() else {
            return self.login(platform, slot).await;
        };

        info!(platform = %platform, generation = previous.generation, "Refreshing session");
        // A credential source that fails here counts as the one refresh attempt.
        let result = match self.credentials.get_credentials(platform).await {
            Ok(credentials) => self
                .authenticator
                .refresh(platform, &previous, credentials.as_ref())
                .await
                .map(|material| (material, credentials.is_some())),
            Err(e) => Err(e),
        };
        metrics::record_session_refresh(platform, result.is_ok());

        match result {
            Ok((material, authenticated)) => {
                let session = Self::install(slot, platform, material, authenticated);
                info!(platform = %platform, generation = session.generation, "Session refreshed");
                Ok(session)
            }
            Err(e) => {
                warn!(platform = %platform, error = %e, "Session refresh failed, marking invalid");
                slot.state = SessionState::Invalid;
                slot.current = None;
                slot.failure = Some(e.to_string());
                Err(SessionError::AuthExpired {
                    platform,
                    message: e.to_string(),
                })
            }
        }
    }

    fn install(
        slot: &mut Slot,
        platform: Platform,
        material: SessionMaterial,
        authenticated: bool,
    ) -> Arc<Session> {
        slot.generation += 1;
        let session = Arc::new(Session {
            platform,
            generation: slot.generation,
            material,
            authenticated,
            created_at: Instant::now(),
        });
        slot.state = SessionState::Active;
        slot.current = Some(Arc::clone(&session));
        slot.failure = None;
        session
    }

    /// Report that `session` is no longer good
    ///
    /// Ignored when a newer session has already replaced it.
    pub async fn invalidate(&self, session: &Session, reason: InvalidationReason) {
        let platform = session.platform();
        let mut slot = self.slot(platform).lock().await;

        if session.generation() != slot.generation {
            debug!(
                platform = %platform,
                stale = session.generation(),
                current = slot.generation,
                "Ignoring invalidation of a replaced session"
            );
            return;
        }

        match (reason, slot.state) {
            (InvalidationReason::Revoked, _) => {
                info!(platform = %platform, "Session revoked");
                slot.state = SessionState::Unauthenticated;
                slot.current = None;
            }
            (_, SessionState::Active) => {
                info!(platform = %platform, reason = ?reason, "Session marked expiring");
                slot.state = SessionState::Expiring;
            }
            _ => {}
        }
    }

    /// Current lifecycle state for `platform`
    pub async fn state(&self, platform: Platform) -> SessionState {
        self.slot(platform).lock().await.state
    }

    /// Clear an invalid session so the next lease logs in again
    pub async fn reset(&self, platform: Platform) {
        let mut slot = self.slot(platform).lock().await;
        if slot.state == SessionState::Invalid {
            info!(platform = %platform, "Invalid session reset");
            slot.state = SessionState::Unauthenticated;
            slot.failure = None;
        }
    }

    /// Destroy every session
    pub async fn teardown(&self) {
        for platform in Platform::ALL {
            let mut slot = self.slot(platform).lock().await;
            slot.state = SessionState::Unauthenticated;
            slot.current = None;
            slot.failure = None;
        }
        debug!("All sessions torn down");
    }
}
