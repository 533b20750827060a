//! Anti-detection request planning
//!
//! [`AntiDetectionPolicy::plan`] decides, before each fetch, how long to pause,
//! whether to switch outbound identity and whether the page must go through a
//! rendered browser. It performs no I/O and, given a seed, always produces the
//! same sequence of plans for the same sequence of contexts.

mod fingerprint;

pub use fingerprint::{default_pool, FingerprintProfile};

use crate::engine::RateOutcome;
use crate::Platform;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Lower bound of the default think time (milliseconds)
pub const DEFAULT_THINK_MIN_MS: u64 = 1_000;

/// Upper bound of the default think time (milliseconds)
pub const DEFAULT_THINK_MAX_MS: u64 = 4_000;

/// Requests served by one identity before rotating
pub const DEFAULT_ROTATE_EVERY: u32 = 25;

/// Records per page at which a page counts as high-yield
pub const DEFAULT_HIGH_YIELD: usize = 10;

/// Pacing and identity configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AntiDetectionConfig {
    /// Master switch; when off, no think time and no rotation
    pub enabled: bool,
    /// RNG seed; `None` seeds from OS entropy
    pub seed: Option<u64>,
    /// Shortest think time (milliseconds)
    pub think_time_min_ms: u64,
    /// Longest think time (milliseconds)
    pub think_time_max_ms: u64,
    /// Rotate identity after this many requests; 0 disables periodic rotation
    pub rotate_every: u32,
    /// Rotate identity after a `rate_limited` or `blocked` outcome
    pub rotate_on_pressure: bool,
    /// Platforms that always need the rendered-browser path
    pub render_platforms: Vec<Platform>,
    /// Records per page at which the next pause shortens
    pub high_yield_threshold: usize,
    /// Identity pool; empty uses [`default_pool`]
    pub profiles: Vec<FingerprintProfile>,
}

impl Default for AntiDetectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            seed: None,
            think_time_min_ms: DEFAULT_THINK_MIN_MS,
            think_time_max_ms: DEFAULT_THINK_MAX_MS,
            rotate_every: DEFAULT_ROTATE_EVERY,
            rotate_on_pressure: true,
            render_platforms: Vec::new(),
            high_yield_threshold: DEFAULT_HIGH_YIELD,
            profiles: Vec::new(),
        }
    }
}

impl AntiDetectionConfig {
    /// Policy that never pauses or rotates
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Validate settings
    pub fn validate(&self) -> Result<(), String> {
        if self.think_time_min_ms > self.think_time_max_ms {
            return Err(format!(
                "think_time_min_ms ({}) exceeds think_time_max_ms ({})",
                self.think_time_min_ms, self.think_time_max_ms
            ));
        }
        Ok(())
    }
}

/// Fetch path for one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMode {
    /// Plain HTTP request
    Http,
    /// Rendered headless browser
    Browser,
}

/// What the policy knows about the request being planned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestContext {
    /// Target platform
    pub platform: Platform,
    /// Zero-based index of the page within the job
    pub page_index: u64,
    /// Outcome of the previous request, if any
    pub last_outcome: Option<RateOutcome>,
    /// New records produced by the previous page
    pub last_page_yield: Option<usize>,
    /// Extractor says this platform needs JavaScript rendering
    pub render_hint: bool,
}

impl RequestContext {
    /// Context for the first page of a job
    pub fn first(platform: Platform) -> Self {
        Self {
            platform,
            page_index: 0,
            last_outcome: None,
            last_page_yield: None,
            render_hint: false,
        }
    }
}

/// Advice for a single fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchPlan {
    /// Pause before sending the request
    pub think_time: Duration,
    /// Identity changed for this request
    pub rotate_identity: bool,
    /// Identity to present
    pub profile: FingerprintProfile,
    /// Transport path
    pub render: RenderMode,
}

/// Stateful, seeded planner owned by one job
#[derive(Debug)]
pub struct AntiDetectionPolicy {
    config: AntiDetectionConfig,
    profiles: Vec<FingerprintProfile>,
    rng: StdRng,
    current: usize,
    served: u32,
}

impl AntiDetectionPolicy {
    /// Create a policy; the seed fixes every random choice it makes
    pub fn new(config: AntiDetectionConfig) -> Self {
        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let profiles = if config.profiles.is_empty() {
            default_pool()
        } else {
            config.profiles.clone()
        };
        let current = rng.gen_range(0..profiles.len());

        Self {
            config,
            profiles,
            rng,
            current,
            served: 0,
        }
    }

    /// Identity currently in use
    pub fn current_profile(&self) -> &FingerprintProfile {
        &self.profiles[self.current]
    }

    /// Plan the next request
    pub fn plan(&mut self, ctx: &RequestContext) -> FetchPlan {
        let render = if ctx.render_hint || self.config.render_platforms.contains(&ctx.platform) {
            RenderMode::Browser
        } else {
            RenderMode::Http
        };

        if !self.config.enabled {
            return FetchPlan {
                think_time: Duration::ZERO,
                rotate_identity: false,
                profile: self.current_profile().clone(),
                render,
            };
        }

        let pressured = matches!(
            ctx.last_outcome,
            Some(RateOutcome::RateLimited) | Some(RateOutcome::Blocked)
        );
        let think_time = self.think_time(ctx, pressured);

        let periodic = self.config.rotate_every > 0 && self.served >= self.config.rotate_every;
        let rotate_identity = periodic || (pressured && self.config.rotate_on_pressure);
        if rotate_identity {
            self.rotate();
        }
        self.served += 1;

        let plan = FetchPlan {
            think_time,
            rotate_identity,
            profile: self.current_profile().clone(),
            render,
        };
        debug!(
            platform = %ctx.platform,
            page = ctx.page_index,
            think_ms = plan.think_time.as_millis(),
            rotate = plan.rotate_identity,
            render = ?plan.render,
            "Fetch planned"
        );
        plan
    }

    fn think_time(&mut self, ctx: &RequestContext, pressured: bool) -> Duration {
        let min = self.config.think_time_min_ms;
        let max = self.config.think_time_max_ms;
        if pressured {
            return Duration::from_millis(max);
        }

        // The first page of a job goes out without a pause.
        if ctx.page_index == 0 && ctx.last_outcome.is_none() {
            return Duration::ZERO;
        }

        let mid = min + (max - min) / 2;
        let (lo, hi) = match ctx.last_page_yield {
            Some(n) if n >= self.config.high_yield_threshold => (min, mid),
            Some(0) => (mid, max),
            _ => (min, max),
        };
        Duration::from_millis(self.rng.gen_range(lo..=hi))
    }

    fn rotate(&mut self) {
        self.served = 0;
        if self.profiles.len() < 2 {
            return;
        }
        // Offset in 1..len guarantees a different profile.
        let offset = self.rng.gen_range(1..self.profiles.len());
        self.current = (self.current + offset) % self.profiles.len();
    }
}
