//! Per-platform request budget with adaptive backoff
//!
//! Each platform owns a token bucket plus an inter-request delay. `rate_limited`
//! feedback widens the delay and slows the refill; success streaks relax both
//! back toward the configured baseline. Waiters reserve their slot under the
//! platform lock and sleep outside it, so reports never queue behind a sleeper.

use super::config::{EngineConfig, RateConfig};
use crate::metrics;
use crate::Platform;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

/// Feedback on a completed request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateOutcome {
    /// Request went through normally
    Success,
    /// Server signalled throttling (HTTP 429 or equivalent)
    RateLimited,
    /// Server signalled a ban or captcha wall
    Blocked,
}

impl RateOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            RateOutcome::Success => "success",
            RateOutcome::RateLimited => "rate_limited",
            RateOutcome::Blocked => "blocked",
        }
    }
}

/// Point-in-time view of one platform's budget
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateSnapshot {
    /// Current minimum gap between requests
    pub delay: Duration,
    /// Current refill rate (tokens per second)
    pub refill_per_sec: f64,
    /// Available tokens; negative while requests are queued
    pub tokens: f64,
    /// Consecutive successes since the last relax step or penalty
    pub success_streak: u32,
}

/// Rate controller errors
#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    /// The wait for a slot would exceed the configured maximum
    #[error("rate budget exceeded for {platform}: wait of {wait:?} exceeds maximum {max_wait:?}")]
    RateExceeded {
        /// Platform whose budget is exhausted
        platform: Platform,
        /// Wait that would have been needed
        wait: Duration,
        /// Configured maximum
        max_wait: Duration,
    },
}

#[derive(Debug)]
struct Bucket {
    config: RateConfig,
    tokens: f64,
    refill_per_sec: f64,
    delay: Duration,
    last_refill: Instant,
    next_slot: Option<Instant>,
    success_streak: u32,
}

impl Bucket {
    fn new(config: RateConfig, now: Instant) -> Self {
        Self {
            tokens: f64::from(config.capacity),
            refill_per_sec: config.refill_per_sec,
            delay: config.min_interval(),
            last_refill: now,
            next_slot: None,
            success_streak: 0,
            config,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec)
            .min(f64::from(self.config.capacity));
        self.last_refill = now;
    }

    /// Wait needed before the next request may be sent
    fn wait_from(&self, now: Instant) -> Duration {
        let token_wait = if self.tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - self.tokens) / self.refill_per_sec)
        };
        let gap_wait = self
            .next_slot
            .map(|slot| (slot + self.delay).saturating_duration_since(now))
            .unwrap_or(Duration::ZERO);
        token_wait.max(gap_wait)
    }

    fn apply(&mut self, outcome: RateOutcome) {
        let factor = self.config.backoff_factor;
        match outcome {
            RateOutcome::Success => {
                self.success_streak += 1;
                if self.success_streak >= self.config.relax_after.max(1) {
                    self.success_streak = 0;
                    let relaxed = self.delay.div_f64(factor);
                    self.delay = if relaxed < self.config.initial_backoff() {
                        self.config.min_interval()
                    } else {
                        relaxed.max(self.config.min_interval())
                    };
                    self.refill_per_sec =
                        (self.refill_per_sec * factor).min(self.config.refill_per_sec);
                }
            }
            RateOutcome::RateLimited => {
                self.success_streak = 0;
                let widened = self
                    .delay
                    .mul_f64(factor)
                    .max(self.config.initial_backoff());
                self.delay = widened.min(self.config.max_delay());
                self.halve_refill();
            }
            RateOutcome::Blocked => {
                self.success_streak = 0;
                self.delay = self.config.max_delay();
                self.tokens = self.tokens.min(0.0);
                self.halve_refill();
            }
        }
    }

    fn halve_refill(&mut self) {
        self.refill_per_sec = (self.refill_per_sec / 2.0).max(self.config.min_refill_per_sec);
    }

    fn snapshot(&self) -> RateSnapshot {
        RateSnapshot {
            delay: self.delay,
            refill_per_sec: self.refill_per_sec,
            tokens: self.tokens,
            success_streak: self.success_streak,
        }
    }
}

/// Shared per-platform request budget
///
/// Owned by the engine context and shared by every job; each platform has its
/// own async mutex so platforms never contend with each other.
#[derive(Debug)]
pub struct RateController {
    buckets: HashMap<Platform, Mutex<Bucket>>,
}

impl RateController {
    /// Create a controller with one bucket per platform
    pub fn new(config: &EngineConfig) -> Self {
        let now = Instant::now();
        let buckets = Platform::ALL
            .iter()
            .map(|p| (*p, Mutex::new(Bucket::new(config.rate_for(*p).clone(), now))))
            .collect();
        Self { buckets }
    }

    fn bucket(&self, platform: Platform) -> &Mutex<Bucket> {
        // Every platform gets a bucket in `new`.
        &self.buckets[&platform]
    }

    /// Wait until a request to `platform` is permitted
    ///
    /// Fails immediately with [`RateLimitError::RateExceeded`] when the needed
    /// wait is longer than the configured maximum; nothing is reserved then.
    pub async fn acquire(&self, platform: Platform) -> Result<Duration, RateLimitError> {
        let slot = {
            let mut bucket = self.bucket(platform).lock().await;
            let now = Instant::now();
            bucket.refill(now);

            let wait = bucket.wait_from(now);
            let max_wait = bucket.config.max_wait();
            if wait > max_wait {
                metrics::record_rate_exceeded(platform);
                warn!(
                    platform = %platform,
                    wait_ms = wait.as_millis(),
                    max_wait_ms = max_wait.as_millis(),
                    "Rate budget exceeded"
                );
                return Err(RateLimitError::RateExceeded {
                    platform,
                    wait,
                    max_wait,
                });
            }

            bucket.tokens -= 1.0;
            let slot = now + wait;
            bucket.next_slot = Some(slot);
            slot
        };

        let waited = slot.saturating_duration_since(Instant::now());
        if !waited.is_zero() {
            debug!(platform = %platform, wait_ms = waited.as_millis(), "Waiting for rate slot");
            sleep_until(slot).await;
        }
        metrics::record_rate_wait(platform, waited);
        Ok(waited)
    }

    /// Feed back the outcome of a request
    pub async fn report(&self, platform: Platform, outcome: RateOutcome) {
        let mut bucket = self.bucket(platform).lock().await;
        let before = bucket.delay;
        bucket.apply(outcome);
        metrics::record_rate_outcome(platform, outcome.as_str());

        if outcome != RateOutcome::Success {
            warn!(
                platform = %platform,
                outcome = outcome.as_str(),
                delay_ms = bucket.delay.as_millis(),
                refill_per_sec = bucket.refill_per_sec,
                "Rate pressure detected, backing off"
            );
        } else if bucket.delay < before {
            debug!(
                platform = %platform,
                delay_ms = bucket.delay.as_millis(),
                "Rate delay relaxed"
            );
        }
    }

    /// Current budget state for `platform`
    pub async fn snapshot(&self, platform: Platform) -> RateSnapshot {
        let mut bucket = self.bucket(platform).lock().await;
        bucket.refill(Instant::now());
        bucket.snapshot()
    }
}
