//! Paginator state machine driven directly, without the job executor

use crate::support::{fast_config, feed_url, BodyFeed, ScriptedFeed};
use multiscrape::cancel::CancelSignal;
use multiscrape::engine::{RateController, RetryConfig};
use multiscrape::extractor::JsonFeedExtractor;
use multiscrape::fetcher::{
    Continuation, Cursor, PageFetcher, PaginateError, Paginator, PaginatorState, Transport,
};
use multiscrape::policy::AntiDetectionPolicy;
use multiscrape::session::{SessionError, SessionManager, StaticCredentials};
use multiscrape::{Platform, Target};
use std::sync::Arc;
use std::time::Duration;

fn paginator(transport: Arc<dyn Transport>, retry: RetryConfig, cancel: CancelSignal) -> Paginator {
    let config = fast_config();
    let rate = Arc::new(RateController::new(&config));
    Paginator::new(
        Target::keyword(Platform::News, "elections"),
        Cursor::start(),
        Arc::new(JsonFeedExtractor::new(feed_url(Platform::News))),
        PageFetcher::new(transport, rate, config.fetch.clone()),
        Arc::new(SessionManager::new(Arc::new(StaticCredentials::new()))),
        AntiDetectionPolicy::new(config.anti_detection.clone()),
        retry,
        cancel,
    )
}

fn quick_retry(max_retries: u32) -> RetryConfig {
    RetryConfig {
        max_retries,
        initial_backoff_ms: 10,
        max_backoff_ms: 100,
    }
}

#[tokio::test]
async fn test_uncommitted_page_is_served_again() {
    let feed = Arc::new(ScriptedFeed::new(2, 3));
    let mut paginator = paginator(feed.clone(), quick_retry(0), CancelSignal::new());
    assert_eq!(paginator.state(), PaginatorState::Start);

    let first = paginator.next_page().await.unwrap().unwrap();
    assert_eq!(first.records.len(), 3);
    assert_eq!(first.next.continuation, Continuation::Page(2));
    assert_eq!(paginator.state(), PaginatorState::Continuing);
    assert_eq!(paginator.cursor(), &Cursor::start());

    // No commit: the same page comes back.
    let replay = paginator.next_page().await.unwrap().unwrap();
    assert_eq!(replay.next, first.next);
    assert_eq!(feed.requests_for(1), 2);

    paginator.commit(first.next.clone());
    let second = paginator.next_page().await.unwrap().unwrap();
    assert!(second.next.is_exhausted());
    paginator.commit(second.next);
    assert_eq!(paginator.state(), PaginatorState::Exhausted);

    assert!(paginator.next_page().await.unwrap().is_none());
    assert_eq!(feed.requests(), 3);
}

#[tokio::test]
async fn test_commit_ignores_cursor_that_does_not_advance() {
    let feed = Arc::new(ScriptedFeed::new(3, 1));
    let mut paginator = paginator(feed, quick_retry(0), CancelSignal::new());

    let batch = paginator.next_page().await.unwrap().unwrap();
    paginator.commit(batch.next.clone());
    assert_eq!(paginator.cursor().pages_consumed, 1);

    paginator.commit(Cursor::start());
    paginator.commit(batch.next.clone());
    assert_eq!(paginator.cursor(), &batch.next);
}

#[tokio::test]
async fn test_repeated_continuation_is_malformed() {
    // Page 1 keeps pointing at itself.
    let stuck = r#"{"items":[{"url":"https://news.example/a"}],"next":1}"#.to_string();
    let feed = Arc::new(BodyFeed::new(vec![stuck]));
    let mut paginator = paginator(feed, quick_retry(0), CancelSignal::new());

    let batch = paginator.next_page().await.unwrap().unwrap();
    assert_eq!(batch.next.continuation, Continuation::Page(1));
    paginator.commit(batch.next);

    let err = paginator.next_page().await.unwrap_err();
    assert!(matches!(err, PaginateError::Malformed(_)), "got {err:?}");
    assert_eq!(paginator.state(), PaginatorState::Error);
}

#[tokio::test(start_paused = true)]
async fn test_retries_then_gives_up() {
    let feed = Arc::new(ScriptedFeed::new(1, 1).always(503));
    let mut paginator = paginator(feed.clone(), quick_retry(3), CancelSignal::new());

    match paginator.next_page().await {
        Err(PaginateError::RetriesExhausted { retries, .. }) => assert_eq!(retries, 3),
        other => panic!("expected retries exhausted, got {other:?}"),
    }
    assert_eq!(feed.requests(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_interrupts_backoff() {
    let feed = Arc::new(ScriptedFeed::new(1, 1).always(502));
    let cancel = CancelSignal::new();
    let retry = RetryConfig {
        max_retries: 5,
        initial_backoff_ms: 60_000,
        max_backoff_ms: 60_000,
    };
    let mut paginator = paginator(feed.clone(), retry, cancel.clone());

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
    });

    let started = tokio::time::Instant::now();
    let err = paginator.next_page().await.unwrap_err();
    assert!(matches!(err, PaginateError::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(60));
    assert_eq!(feed.requests(), 1);
    canceller.await.unwrap();
}

#[tokio::test]
async fn test_challenge_without_credentials_is_session_error() {
    let feed = Arc::new(ScriptedFeed::new(1, 1).always(401));
    let mut paginator = paginator(feed.clone(), quick_retry(3), CancelSignal::new());

    let err = paginator.next_page().await.unwrap_err();
    assert!(
        matches!(err, PaginateError::Session(SessionError::AuthExpired { .. })),
        "got {err:?}"
    );
    // Auth challenges never consume the transient retry budget.
    assert_eq!(feed.requests(), 1);
}
