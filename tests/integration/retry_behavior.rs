//! Transient failures, retry budgets and permanent failures at job level

use crate::support::{fast_config, session_with, ScriptedFeed};
use async_trait::async_trait;
use multiscrape::engine::{EngineContext, FailureReason, JobLimits, JobStatus, ScrapeSession};
use multiscrape::extractor::{ExtractorRegistry, JsonFeedExtractor};
use multiscrape::fetcher::{PageRequest, RawPage, Transport, TransportError};
use multiscrape::output::MemorySink;
use multiscrape::policy::FetchPlan;
use multiscrape::resume::MemoryCheckpointStore;
use multiscrape::session::Session;
use multiscrape::{Platform, Target};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn test_page_two_503_twice_then_succeeds() {
    let feed = Arc::new(ScriptedFeed::new(3, 20).fail_page(2, &[503, 503]));
    let sink = Arc::new(MemorySink::new());
    let store = Arc::new(MemoryCheckpointStore::new());
    let mut config = fast_config();
    config.retry.max_retries = 3;
    let session = session_with(config, feed.clone(), sink.clone(), store.clone());

    let started = tokio::time::Instant::now();
    let job_id = session
        .start(Target::keyword(Platform::News, "elections"), JobLimits::default())
        .await
        .unwrap();
    let job = session.wait(job_id).await.unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.retries, 2);
    assert_eq!(job.records_emitted, 60);
    assert_eq!(sink.len().await, 60);
    assert_eq!(store.history(job_id).await.len(), 3);
    assert_eq!(feed.requests_for(2), 3);
    // Backoff of 1s then 2s.
    assert!(started.elapsed() >= Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn test_retries_exhausted_fails_resumably() {
    let feed = Arc::new(ScriptedFeed::new(3, 5).fail_page(2, &[502, 502, 502]));
    let sink = Arc::new(MemorySink::new());
    let mut config = fast_config();
    config.retry.max_retries = 2;
    let session = session_with(
        config,
        feed.clone(),
        sink.clone(),
        Arc::new(MemoryCheckpointStore::new()),
    );

    let job_id = session
        .start(Target::keyword(Platform::News, "elections"), JobLimits::default())
        .await
        .unwrap();
    let job = session.wait(job_id).await.unwrap();

    assert_eq!(job.status, JobStatus::Failed);
    assert!(matches!(job.failure, Some(FailureReason::RetriesExhausted(_))));
    assert!(job.failure.as_ref().unwrap().is_resumable());
    assert_eq!(job.records_emitted, 5);
    assert_eq!(feed.requests_for(2), 3);

    // Third 502 was consumed; the page now succeeds.
    session.resume(job_id).await.unwrap();
    let job = session.wait(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.records_emitted, 15);
    assert_eq!(sink.len().await, 15);
}

#[tokio::test]
async fn test_not_found_is_permanent() {
    let feed = Arc::new(ScriptedFeed::new(3, 5).fail_page(2, &[404]));
    let session = session_with(
        fast_config(),
        feed.clone(),
        Arc::new(MemorySink::new()),
        Arc::new(MemoryCheckpointStore::new()),
    );

    let job_id = session
        .start(Target::keyword(Platform::Youtube, "rust"), JobLimits::default())
        .await
        .unwrap();
    let job = session.wait(job_id).await.unwrap();

    assert_eq!(job.status, JobStatus::Failed);
    assert!(matches!(job.failure, Some(FailureReason::FetchPermanent(_))));
    assert_eq!(job.retries, 0);
    assert_eq!(feed.requests_for(2), 1);
    assert!(session.resume(job_id).await.is_err());
}

#[tokio::test]
async fn test_ban_signal_blocks_the_platform() {
    let feed = Arc::new(ScriptedFeed::new(2, 5).fail_page(2, &[451]));
    let session = session_with(
        fast_config(),
        feed,
        Arc::new(MemorySink::new()),
        Arc::new(MemoryCheckpointStore::new()),
    );

    let job_id = session
        .start(Target::keyword(Platform::Amazon, "headphones"), JobLimits::default())
        .await
        .unwrap();
    let job = session.wait(job_id).await.unwrap();

    assert_eq!(job.status, JobStatus::Failed);
    assert!(matches!(job.failure, Some(FailureReason::FetchPermanent(_))));

    let snapshot = session.context().rate().snapshot(Platform::Amazon).await;
    let config = session.context().config().rate_for(Platform::Amazon);
    assert_eq!(snapshot.delay, config.max_delay());
    assert!(snapshot.refill_per_sec < config.refill_per_sec);
}

#[tokio::test]
async fn test_rate_budget_refusal_fails_job() {
    let mut config = fast_config();
    config.rate.capacity = 1;
    config.rate.refill_per_sec = 0.01;
    config.rate.min_refill_per_sec = 0.01;
    config.rate.max_wait_ms = 50;
    let feed = Arc::new(ScriptedFeed::new(3, 5));
    let session = session_with(
        config,
        feed.clone(),
        Arc::new(MemorySink::new()),
        Arc::new(MemoryCheckpointStore::new()),
    );

    let job_id = session
        .start(Target::keyword(Platform::News, "elections"), JobLimits::default())
        .await
        .unwrap();
    let job = session.wait(job_id).await.unwrap();

    assert_eq!(job.status, JobStatus::Failed);
    assert!(matches!(job.failure, Some(FailureReason::RateExceeded(_))));
    assert!(job.failure.as_ref().unwrap().is_resumable());
    assert_eq!(job.pages_completed, 1);
    assert_eq!(feed.requests(), 1);
}

#[tokio::test]
async fn test_unparseable_feed_url_is_permanent() {
    let context = EngineContext::builder(fast_config())
        .extractors(
            ExtractorRegistry::new().with(Platform::News, Arc::new(JsonFeedExtractor::new("not a url"))),
        )
        .sink(Arc::new(MemorySink::new()))
        .build()
        .unwrap();
    let session = ScrapeSession::new(context);

    let job_id = session
        .start(Target::keyword(Platform::News, "elections"), JobLimits::default())
        .await
        .unwrap();
    let job = session.wait(job_id).await.unwrap();

    assert_eq!(job.status, JobStatus::Failed);
    assert!(
        matches!(job.failure, Some(FailureReason::FetchPermanent(_))),
        "unexpected failure: {:?}",
        job.failure
    );
    assert_eq!(job.retries, 0);
    assert!(session.resume(job_id).await.is_err());
}

/// Transport that never answers
#[derive(Default)]
struct SilentFeed {
    requests: AtomicU32,
}

#[async_trait]
impl Transport for SilentFeed {
    async fn send(
        &self,
        _request: &PageRequest,
        _session: &Session,
        _plan: &FetchPlan,
        _timeout: Duration,
    ) -> Result<RawPage, TransportError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }
}

#[tokio::test(start_paused = true)]
async fn test_unresponsive_transport_times_out_and_exhausts_retries() {
    let feed = Arc::new(SilentFeed::default());
    let mut config = fast_config();
    config.retry.max_retries = 2;
    let timeout = config.fetch.request_timeout();
    let session = session_with(
        config,
        feed.clone(),
        Arc::new(MemorySink::new()),
        Arc::new(MemoryCheckpointStore::new()),
    );

    let job_id = session
        .start(Target::keyword(Platform::News, "elections"), JobLimits::default())
        .await
        .unwrap();
    let job = tokio::time::timeout(timeout * 20, session.wait(job_id))
        .await
        .expect("job must not hang on a silent transport")
        .unwrap();

    assert_eq!(job.status, JobStatus::Failed);
    assert!(matches!(job.failure, Some(FailureReason::RetriesExhausted(_))));
    assert_eq!(feed.requests.load(Ordering::SeqCst), 3);
}
