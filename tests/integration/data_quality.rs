//! Malformed pages, stall detection and duplicate suppression

use crate::support::{fast_config, feed_url, session_with, BodyFeed};
use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use multiscrape::engine::{
    EngineConfig, EngineContext, JobLimits, JobStatus, ScrapeJob, ScrapeSession, StopReason,
};
use multiscrape::extractor::{ExtractorRegistry, JsonFeedExtractor};
use multiscrape::fetcher::{PageRequest, RawPage, Transport, TransportError};
use multiscrape::output::MemorySink;
use multiscrape::policy::FetchPlan;
use multiscrape::resume::MemoryCheckpointStore;
use multiscrape::session::Session;
use multiscrape::{DateRange, Platform, Target};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn items(urls: &[&str], next: &str) -> String {
    let items: Vec<String> = urls
        .iter()
        .map(|u| format!(r#"{{"url":"https://news.example/{u}","title":"{u}"}}"#))
        .collect();
    format!(r#"{{"items":[{}],"next":{next}}}"#, items.join(","))
}

async fn run(config: EngineConfig, bodies: Vec<String>) -> (ScrapeJob, Arc<MemorySink>) {
    let sink = Arc::new(MemorySink::new());
    let session = session_with(
        config,
        Arc::new(BodyFeed::new(bodies)),
        sink.clone(),
        Arc::new(MemoryCheckpointStore::new()),
    );
    let job_id = session
        .start(Target::keyword(Platform::News, "elections"), JobLimits::default())
        .await
        .unwrap();
    (session.wait(job_id).await.unwrap(), sink)
}

#[tokio::test]
async fn test_malformed_page_with_next_is_skipped() {
    let (job, sink) = run(
        fast_config(),
        vec![
            items(&["a", "b"], "2"),
            r#"{"error":"layout changed","next":3}"#.to_string(),
            items(&["c"], "null"),
        ],
    )
    .await;

    assert_eq!(job.status, JobStatus::CompletedWithErrors);
    assert_eq!(job.stop_reason, Some(StopReason::Exhausted));
    assert_eq!(job.pages_completed, 3);
    assert_eq!(job.records_emitted, 3);
    assert_eq!(sink.len().await, 3);
    assert_eq!(job.data_quality.len(), 1);
    assert_eq!(job.data_quality[0].page, 1);
    assert!(job.data_quality[0].message.contains("missing items"));
}

#[tokio::test]
async fn test_malformed_page_without_next_stops_job() {
    let (job, sink) = run(
        fast_config(),
        vec![items(&["a", "b"], "2"), "<html>captcha?</html>".to_string()],
    )
    .await;

    assert_eq!(job.status, JobStatus::CompletedWithErrors);
    assert_eq!(job.stop_reason, Some(StopReason::Malformed));
    assert_eq!(job.pages_completed, 1);
    assert_eq!(sink.len().await, 2);
    assert_eq!(job.data_quality.len(), 1);
    assert!(job.failure.is_none());
}

#[tokio::test]
async fn test_empty_pages_trip_the_stall_guard() {
    let mut config = fast_config();
    config.jobs.max_empty_pages = 3;
    let bodies = (2..=10).map(|next| items(&[], &next.to_string())).collect();

    let (job, sink) = run(config, bodies).await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.stop_reason, Some(StopReason::Stalled));
    assert_eq!(job.pages_completed, 3);
    assert!(sink.is_empty().await);
}

#[tokio::test]
async fn test_repeated_records_are_skipped() {
    let (job, sink) = run(
        fast_config(),
        vec![items(&["a", "b", "c"], "2"), items(&["b", "c", "d"], "null")],
    )
    .await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.records_emitted, 4);
    assert_eq!(job.duplicates_skipped, 2);
    assert_eq!(sink.len().await, 4);
}

#[tokio::test]
async fn test_dedupe_can_be_disabled() {
    let mut config = fast_config();
    config.jobs.dedupe = false;
    let (job, _) = run(
        config,
        vec![items(&["a", "b"], "2"), items(&["a", "b"], "null")],
    )
    .await;

    assert_eq!(job.records_emitted, 4);
    assert_eq!(job.duplicates_skipped, 0);
}

#[tokio::test]
async fn test_pages_of_only_repeats_count_as_empty() {
    let mut config = fast_config();
    config.jobs.max_empty_pages = 2;
    let (job, _) = run(
        config,
        vec![
            items(&["a"], "2"),
            items(&["a"], "3"),
            items(&["a"], "4"),
            items(&["z"], "null"),
        ],
    )
    .await;

    assert_eq!(job.stop_reason, Some(StopReason::Stalled));
    assert_eq!(job.records_emitted, 1);
    assert_eq!(job.pages_completed, 3);
}

/// One page per date window; only windows opening in the given months have items
struct SeasonalFeed {
    months: Vec<u32>,
    requests: AtomicU32,
}

#[async_trait]
impl Transport for SeasonalFeed {
    async fn send(
        &self,
        request: &PageRequest,
        _session: &Session,
        _plan: &FetchPlan,
        _timeout: Duration,
    ) -> Result<RawPage, TransportError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let from = request
            .query
            .iter()
            .find(|(key, _)| key == "from")
            .and_then(|(_, value)| NaiveDate::parse_from_str(value, "%Y-%m-%d").ok())
            .ok_or_else(|| TransportError::Other("missing from".to_string()))?;
        let body = if self.months.contains(&from.month()) {
            items(&[&format!("{from}-a"), &format!("{from}-b")], "null")
        } else {
            items(&[], "null")
        };
        Ok(RawPage::ok(request.full_url()?, body))
    }
}

#[tokio::test]
async fn test_empty_date_windows_do_not_stall() {
    let mut config = fast_config();
    config.jobs.max_empty_pages = 3;
    let feed = Arc::new(SeasonalFeed {
        months: vec![10, 11],
        requests: AtomicU32::new(0),
    });
    let sink = Arc::new(MemorySink::new());
    let extractors = ExtractorRegistry::new().with(
        Platform::News,
        Arc::new(JsonFeedExtractor::new(feed_url(Platform::News)).with_window_days(30)),
    );
    let context = EngineContext::builder(config)
        .extractors(extractors)
        .transport(feed.clone())
        .sink(sink.clone())
        .checkpoints(Arc::new(MemoryCheckpointStore::new()))
        .build()
        .unwrap();
    let session = ScrapeSession::new(context);

    let year = DateRange::new(
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        NaiveDate::from_ymd_opt(2024, 12, 31).unwrap(),
    )
    .unwrap();
    let job_id = session
        .start(
            Target::keyword(Platform::News, "elections").with_date_range(year),
            JobLimits::default(),
        )
        .await
        .unwrap();
    let job = session.wait(job_id).await.unwrap();

    // 30-day windows from Jan 1: windows open on Oct 27 and Nov 26.
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.stop_reason, Some(StopReason::Exhausted));
    assert!(job.cursor.is_exhausted());
    assert_eq!(feed.requests.load(Ordering::SeqCst), 13);
    assert_eq!(job.records_emitted, 4);
    assert_eq!(sink.len().await, 4);
}
