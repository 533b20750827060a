//! Auth challenges, single-flight refresh and fatal refresh failure

use crate::support::{fast_config, feed_registry, CountingAuthenticator, ScriptedFeed};
use multiscrape::engine::{EngineContext, FailureReason, JobLimits, JobStatus, ScrapeSession};
use multiscrape::output::MemorySink;
use multiscrape::resume::MemoryCheckpointStore;
use multiscrape::session::{Credentials, SessionState, StaticCredentials};
use multiscrape::{Platform, Target};
use std::sync::Arc;

fn session(
    feed: Arc<ScriptedFeed>,
    authenticator: Arc<CountingAuthenticator>,
    credentials: StaticCredentials,
) -> ScrapeSession {
    let context = EngineContext::builder(fast_config())
        .extractors(feed_registry())
        .transport(feed)
        .authenticator(authenticator)
        .credentials(Arc::new(credentials))
        .sink(Arc::new(MemorySink::new()))
        .checkpoints(Arc::new(MemoryCheckpointStore::new()))
        .build()
        .unwrap();
    ScrapeSession::new(context)
}

#[tokio::test]
async fn test_amazon_403_refresh_fails_both_jobs() {
    let feed = Arc::new(ScriptedFeed::new(3, 10).always(403));
    let auth = Arc::new(CountingAuthenticator::default());
    // Anonymous sessions cannot be refreshed.
    let session = session(feed, auth.clone(), StaticCredentials::new());

    let first = session
        .start(Target::keyword(Platform::Amazon, "headphones"), JobLimits::default())
        .await
        .unwrap();
    let second = session
        .start(Target::keyword(Platform::Amazon, "earbuds"), JobLimits::default())
        .await
        .unwrap();

    let (a, b) = tokio::join!(session.wait(first), session.wait(second));
    let (a, b) = (a.unwrap(), b.unwrap());

    for job in [&a, &b] {
        assert_eq!(job.status, JobStatus::Failed);
        assert!(
            matches!(job.failure, Some(FailureReason::AuthExpired(_))),
            "unexpected failure {:?}",
            job.failure
        );
        assert!(!job.failure.as_ref().unwrap().is_resumable());
        assert_eq!(job.records_emitted, 0);
    }
    assert_eq!(auth.refreshes(), 1);
    assert_eq!(auth.logins(), 1);
    assert_eq!(
        session.context().sessions().state(Platform::Amazon).await,
        SessionState::Invalid
    );
}

#[tokio::test]
async fn test_challenge_then_refresh_succeeds() {
    let feed = Arc::new(ScriptedFeed::new(2, 5).fail_page(2, &[401]));
    let auth = Arc::new(CountingAuthenticator::default());
    let credentials = StaticCredentials::new().with(
        Platform::Twitter,
        Credentials::new().with("cookie.auth_token", "secret"),
    );
    let session = session(feed.clone(), auth.clone(), credentials);

    let job_id = session
        .start(Target::keyword(Platform::Twitter, "elections"), JobLimits::default())
        .await
        .unwrap();
    let job = session.wait(job_id).await.unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.records_emitted, 10);
    assert_eq!(auth.refreshes(), 1);
    assert_eq!(feed.requests_for(2), 2);
    assert_eq!(
        session.context().sessions().state(Platform::Twitter).await,
        SessionState::Active
    );
}

#[tokio::test]
async fn test_invalid_session_isolated_to_its_platform() {
    let feed = Arc::new(ScriptedFeed::new(1, 3).always(403));
    let auth = Arc::new(CountingAuthenticator::default());
    let session = session(feed, auth, StaticCredentials::new());

    let amazon = session
        .start(Target::keyword(Platform::Amazon, "headphones"), JobLimits::default())
        .await
        .unwrap();
    assert_eq!(session.wait(amazon).await.unwrap().status, JobStatus::Failed);

    let sessions = session.context().sessions();
    assert_eq!(sessions.state(Platform::Amazon).await, SessionState::Invalid);
    assert_eq!(sessions.state(Platform::News).await, SessionState::Unauthenticated);

    // Operator re-authenticates.
    sessions.reset(Platform::Amazon).await;
    assert_eq!(
        sessions.state(Platform::Amazon).await,
        SessionState::Unauthenticated
    );
}
