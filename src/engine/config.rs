//! Engine configuration and tuning constants

use crate::policy::AntiDetectionConfig;
use crate::Platform;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Maximum retries for a transient page failure.
/// Three retries ride out a short 5xx burst without hammering a site that is
/// already struggling.
pub const MAX_RETRIES: u32 = 3;

/// Initial retry backoff delay in milliseconds.
pub const INITIAL_BACKOFF_MS: u64 = 1000;

/// Maximum retry backoff delay in milliseconds.
pub const MAX_BACKOFF_MS: u64 = 30_000;

/// Per-request timeout (seconds). Exceeding it is a transient failure.
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

/// TCP connect timeout (seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Upper bound on pages per job, guarding against a cursor that never ends.
pub const MAX_PAGES_PER_JOB: u64 = 10_000;

/// Consecutive pages without a new record before the job is treated as exhausted.
/// Infinite-scroll feeds keep re-serving the same items once they run dry.
pub const MAX_EMPTY_PAGES: u32 = 3;

/// Default token bucket capacity per platform.
pub const DEFAULT_BUCKET_CAPACITY: u32 = 10;

/// Default token refill rate (tokens per second).
pub const DEFAULT_REFILL_PER_SEC: f64 = 0.5;

/// Longest `acquire` may wait before failing with `RateExceeded` (milliseconds).
pub const DEFAULT_MAX_WAIT_MS: u64 = 120_000;

/// Cap on the adaptive inter-request delay (milliseconds).
pub const DEFAULT_MAX_DELAY_MS: u64 = 120_000;

/// Calculate exponential backoff delay: `initial * 2^retry_count`, capped at `max`
pub fn calculate_backoff(retry_count: u32, initial: Duration, max: Duration) -> Duration {
    let factor = 2u32.saturating_pow(retry_count.min(31));
    initial.saturating_mul(factor).min(max)
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("IO error: {0}")]
    IoError(String),

    /// Config file is not valid JSON for [`EngineConfig`]
    #[error("parse error: {0}")]
    ParseError(String),

    /// Config values are inconsistent
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Token bucket and adaptive delay settings for one platform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateConfig {
    /// Burst size
    pub capacity: u32,
    /// Baseline refill rate (tokens per second)
    pub refill_per_sec: f64,
    /// Floor for the refill rate while backing off
    pub min_refill_per_sec: f64,
    /// Baseline minimum gap between two requests (milliseconds)
    pub min_interval_ms: u64,
    /// First backoff step when the current delay is zero (milliseconds)
    pub initial_backoff_ms: u64,
    /// Multiplier applied to the delay on `rate_limited`
    pub backoff_factor: f64,
    /// Cap on the inter-request delay (milliseconds)
    pub max_delay_ms: u64,
    /// Consecutive successes needed before relaxing one step
    pub relax_after: u32,
    /// Longest `acquire` may wait (milliseconds)
    pub max_wait_ms: u64,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_BUCKET_CAPACITY,
            refill_per_sec: DEFAULT_REFILL_PER_SEC,
            min_refill_per_sec: 0.01,
            min_interval_ms: 0,
            initial_backoff_ms: INITIAL_BACKOFF_MS,
            backoff_factor: 2.0,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            relax_after: 5,
            max_wait_ms: DEFAULT_MAX_WAIT_MS,
        }
    }
}

impl RateConfig {
    /// Baseline inter-request delay
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    /// Delay cap
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// First backoff step
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    /// Maximum `acquire` wait
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    /// Validate settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::Invalid("capacity must be positive".to_string()));
        }
        if !(self.refill_per_sec > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "refill_per_sec must be positive, got {}",
                self.refill_per_sec
            )));
        }
        if !(self.min_refill_per_sec > 0.0) || self.min_refill_per_sec > self.refill_per_sec {
            return Err(ConfigError::Invalid(format!(
                "min_refill_per_sec must be in (0, {}], got {}",
                self.refill_per_sec, self.min_refill_per_sec
            )));
        }
        if self.initial_backoff_ms == 0 {
            return Err(ConfigError::Invalid(
                "initial_backoff_ms must be positive".to_string(),
            ));
        }
        if !(self.backoff_factor > 1.0) {
            return Err(ConfigError::Invalid(format!(
                "backoff_factor must be greater than 1, got {}",
                self.backoff_factor
            )));
        }
        if self.max_delay_ms < self.min_interval_ms {
            return Err(ConfigError::Invalid(
                "max_delay_ms must be >= min_interval_ms".to_string(),
            ));
        }
        Ok(())
    }
}

/// Retry policy for transient page failures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// First backoff delay (milliseconds)
    pub initial_backoff_ms: u64,
    /// Backoff cap (milliseconds)
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            initial_backoff_ms: INITIAL_BACKOFF_MS,
            max_backoff_ms: MAX_BACKOFF_MS,
        }
    }
}

impl RetryConfig {
    /// Backoff before retry number `retry` (1-based)
    pub fn backoff(&self, retry: u32) -> Duration {
        calculate_backoff(
            retry.saturating_sub(1),
            Duration::from_millis(self.initial_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
        )
    }
}

/// Session lifetime settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Age after which an active session is proactively refreshed
    pub ttl_secs: Option<u64>,
}

impl SessionConfig {
    /// Session TTL
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_secs.map(Duration::from_secs)
    }
}

/// Fetch transport settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Per-request timeout (milliseconds)
    pub request_timeout_ms: u64,
    /// Connect timeout (milliseconds)
    pub connect_timeout_ms: u64,
    /// Lowercase body fragments that mean the client has been banned
    pub ban_markers: Vec<String>,
    /// URL fragments per platform that mean the request landed on a login wall
    pub login_wall_markers: BTreeMap<Platform, Vec<String>>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        let mut login_wall_markers = BTreeMap::new();
        login_wall_markers.insert(
            Platform::Twitter,
            vec!["/i/flow/login".to_string(), "/login".to_string()],
        );
        login_wall_markers.insert(Platform::Amazon, vec!["/ap/signin".to_string()]);
        login_wall_markers.insert(
            Platform::Youtube,
            vec!["accounts.google.com/servicelogin".to_string()],
        );

        Self {
            request_timeout_ms: REQUEST_TIMEOUT_SECS * 1000,
            connect_timeout_ms: CONNECT_TIMEOUT_SECS * 1000,
            ban_markers: vec![
                "/errors/validatecaptcha".to_string(),
                "our systems have detected unusual traffic".to_string(),
            ],
            login_wall_markers,
        }
    }
}

impl FetchConfig {
    /// Per-request timeout
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Connect timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Defaults applied to every job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobDefaults {
    /// Drop records whose dedup key was already emitted by this run
    pub dedupe: bool,
    /// Consecutive pages without a new record before stopping; 0 disables
    pub max_empty_pages: u32,
    /// Safety cap on pages when the job sets no `max_pages`
    pub max_pages: u64,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            dedupe: true,
            max_empty_pages: MAX_EMPTY_PAGES,
            max_pages: MAX_PAGES_PER_JOB,
        }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Rate settings for platforms without an override
    pub rate: RateConfig,
    /// Per-platform rate overrides
    pub rate_overrides: BTreeMap<Platform, RateConfig>,
    /// Transient retry policy
    pub retry: RetryConfig,
    /// Session lifetime
    pub session: SessionConfig,
    /// Request pacing and identity rotation
    pub anti_detection: AntiDetectionConfig,
    /// Transport settings
    pub fetch: FetchConfig,
    /// Per-job defaults
    pub jobs: JobDefaults,
}

impl EngineConfig {
    /// Load configuration from a JSON file; missing keys take defaults
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(format!("{}: {e}", path.display())))?;
        Self::from_json(&contents)
    }

    /// Parse configuration from a JSON string
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig =
            serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Rate settings for `platform`
    pub fn rate_for(&self, platform: Platform) -> &RateConfig {
        self.rate_overrides.get(&platform).unwrap_or(&self.rate)
    }

    /// Validate all sections
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.rate.validate()?;
        for (platform, rate) in &self.rate_overrides {
            rate.validate()
                .map_err(|e| ConfigError::Invalid(format!("{platform}: {e}")))?;
        }
        self.anti_detection
            .validate()
            .map_err(ConfigError::Invalid)?;
        if self.fetch.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "request_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
