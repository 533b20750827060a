//! Scrape engine observability metrics
//!
//! Counters and histograms for page fetches, rate-limit pressure, session
//! refreshes and job outcomes, exported through a Prometheus scrape endpoint.
//!
//! ## Architecture
//!
//! - Uses the `metrics` facade; recording is a no-op until an exporter is installed
//! - Prometheus exporter serves `/metrics` on the address given to [`init_metrics`]
//! - Every series is labelled by `platform`

use crate::Platform;
use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use once_cell::sync::Lazy;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Global metrics registry initialization flag
static METRICS_INITIALIZED: Lazy<Arc<RwLock<bool>>> = Lazy::new(|| Arc::new(RwLock::new(false)));

/// Correlation ID generator for fetch tracing
static CORRELATION_COUNTER: Lazy<Arc<RwLock<u64>>> = Lazy::new(|| Arc::new(RwLock::new(0)));

/// Initialize metrics system with Prometheus exporter
///
/// Idempotent: a second call is a no-op.
pub async fn init_metrics(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error>> {
    let mut initialized = METRICS_INITIALIZED.write().await;
    if *initialized {
        debug!("Metrics already initialized, skipping");
        return Ok(());
    }

    info!("Initializing metrics system on {}", addr);

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(
        "scrape_fetches_total",
        Unit::Count,
        "Page fetch attempts by platform and status"
    );
    describe_histogram!(
        "scrape_fetch_duration_seconds",
        Unit::Seconds,
        "Page fetch duration in seconds"
    );
    describe_counter!(
        "scrape_pages_total",
        Unit::Count,
        "Pages extracted and checkpointed"
    );
    describe_counter!(
        "scrape_records_emitted_total",
        Unit::Count,
        "Records delivered to sinks"
    );
    describe_counter!(
        "scrape_retries_total",
        Unit::Count,
        "Transient fetch retries"
    );
    describe_histogram!(
        "scrape_retry_backoff_seconds",
        Unit::Seconds,
        "Retry backoff in seconds"
    );
    describe_histogram!(
        "rate_limit_wait_seconds",
        Unit::Seconds,
        "Time spent waiting in RateController::acquire"
    );
    describe_counter!(
        "rate_limit_outcomes_total",
        Unit::Count,
        "Outcomes reported to the rate controller"
    );
    describe_counter!(
        "rate_limit_exceeded_total",
        Unit::Count,
        "Acquire calls refused because the wait exceeded the maximum"
    );
    describe_counter!(
        "session_refreshes_total",
        Unit::Count,
        "Session refresh attempts by result"
    );
    describe_counter!(
        "data_quality_events_total",
        Unit::Count,
        "Malformed pages and other extraction anomalies"
    );
    describe_counter!(
        "scrape_jobs_completed_total",
        Unit::Count,
        "Jobs that reached a completed state"
    );
    describe_counter!(
        "scrape_jobs_failed_total",
        Unit::Count,
        "Jobs that failed"
    );

    *initialized = true;
    info!("Metrics system initialized successfully on {}", addr);
    Ok(())
}

/// Check if metrics system is initialized
pub async fn is_initialized() -> bool {
    *METRICS_INITIALIZED.read().await
}

/// Generate a new correlation ID for fetch tracing
pub async fn generate_correlation_id() -> String {
    let mut counter = CORRELATION_COUNTER.write().await;
    *counter += 1;
    format!("fetch-{:08x}", *counter)
}

/// Timing and outcome of one page fetch attempt
pub struct FetchMetrics {
    platform: Platform,
    start_time: Instant,
    correlation_id: String,
}

impl FetchMetrics {
    /// Start recording a fetch attempt
    pub async fn start(platform: Platform) -> Self {
        let correlation_id = generate_correlation_id().await;

        debug!(
            correlation_id = %correlation_id,
            platform = %platform,
            "Starting fetch metrics"
        );

        Self {
            platform,
            start_time: Instant::now(),
            correlation_id,
        }
    }

    /// Record a fetch that produced an HTTP status
    pub fn record_complete(&self, status_code: u16) {
        let duration = self.start_time.elapsed();

        counter!(
            "scrape_fetches_total",
            "platform" => self.platform.as_str(),
            "status" => status_code.to_string(),
        )
        .increment(1);

        histogram!(
            "scrape_fetch_duration_seconds",
            "platform" => self.platform.as_str(),
        )
        .record(duration.as_secs_f64());

        debug!(
            correlation_id = %self.correlation_id,
            platform = %self.platform,
            status = status_code,
            duration_ms = duration.as_millis(),
            "Fetch completed"
        );
    }

    /// Record a fetch that failed before producing a status
    pub fn record_network_error(&self) {
        let duration = self.start_time.elapsed();

        counter!(
            "scrape_fetches_total",
            "platform" => self.platform.as_str(),
            "status" => "network_error",
        )
        .increment(1);

        histogram!(
            "scrape_fetch_duration_seconds",
            "platform" => self.platform.as_str(),
        )
        .record(duration.as_secs_f64());

        warn!(
            correlation_id = %self.correlation_id,
            platform = %self.platform,
            duration_ms = duration.as_millis(),
            "Fetch network error recorded"
        );
    }

    /// Correlation ID for this attempt
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }
}

/// Record retry backoff duration
pub fn record_retry_backoff(platform: Platform, duration: Duration, attempt: u32) {
    counter!("scrape_retries_total", "platform" => platform.as_str()).increment(1);

    histogram!(
        "scrape_retry_backoff_seconds",
        "platform" => platform.as_str(),
        "attempt" => attempt.to_string(),
    )
    .record(duration.as_secs_f64());

    debug!(
        platform = %platform,
        attempt = attempt,
        backoff_ms = duration.as_millis(),
        "Retry backoff recorded"
    );
}

/// Record how long `acquire` waited
pub fn record_rate_wait(platform: Platform, wait: Duration) {
    histogram!("rate_limit_wait_seconds", "platform" => platform.as_str())
        .record(wait.as_secs_f64());
}

/// Record an outcome reported to the rate controller
pub fn record_rate_outcome(platform: Platform, outcome: &'static str) {
    counter!(
        "rate_limit_outcomes_total",
        "platform" => platform.as_str(),
        "outcome" => outcome,
    )
    .increment(1);
}

/// Record an `acquire` refused with `RateExceeded`
pub fn record_rate_exceeded(platform: Platform) {
    counter!("rate_limit_exceeded_total", "platform" => platform.as_str()).increment(1);
}

/// Record a session refresh attempt
pub fn record_session_refresh(platform: Platform, success: bool) {
    counter!(
        "session_refreshes_total",
        "platform" => platform.as_str(),
        "result" => if success { "ok" } else { "failed" },
    )
    .increment(1);
}

/// Record a data-quality event
pub fn record_data_quality(platform: Platform) {
    counter!("data_quality_events_total", "platform" => platform.as_str()).increment(1);
}

/// Record one committed page and its emitted records
pub fn record_page(platform: Platform, records: usize) {
    counter!("scrape_pages_total", "platform" => platform.as_str()).increment(1);
    counter!("scrape_records_emitted_total", "platform" => platform.as_str())
        .increment(records as u64);
}

/// Scrape job metrics
pub struct JobMetrics {
    platform: Platform,
    job_id: String,
    start_time: Instant,
}

impl JobMetrics {
    /// Start tracking a job run
    pub fn start(platform: Platform, job_id: impl Into<String>) -> Self {
        let job_id = job_id.into();

        info!(platform = %platform, job_id = %job_id, "Scrape job started");

        Self {
            platform,
            job_id,
            start_time: Instant::now(),
        }
    }

    /// Record a job that completed
    pub fn record_success(&self, records_emitted: u64) {
        let duration = self.start_time.elapsed();

        counter!(
            "scrape_jobs_completed_total",
            "platform" => self.platform.as_str(),
        )
        .increment(1);

        info!(
            platform = %self.platform,
            job_id = %self.job_id,
            records_emitted = records_emitted,
            duration_secs = duration.as_secs(),
            "Scrape job completed"
        );
    }

    /// Record a failed job
    pub fn record_failure(&self, reason: &str) {
        let duration = self.start_time.elapsed();

        counter!(
            "scrape_jobs_failed_total",
            "platform" => self.platform.as_str(),
            "reason" => reason.to_string(),
        )
        .increment(1);

        error!(
            platform = %self.platform,
            job_id = %self.job_id,
            reason = %reason,
            duration_secs = duration.as_secs(),
            "Scrape job failed"
        );
    }
}
