//! Cancellation, resume and crash recovery

use crate::support::{fast_config, session_with, FlakyStore, ScriptedFeed};
use multiscrape::engine::{FailureReason, JobLimits, JobStatus, ScrapeError, StopReason};
use multiscrape::output::MemorySink;
use multiscrape::resume::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
use multiscrape::{Platform, Target};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Semaphore;

fn distinct_urls(records: &[multiscrape::Record]) -> usize {
    records
        .iter()
        .map(|r| r.source_url().to_string())
        .collect::<HashSet<_>>()
        .len()
}

#[tokio::test]
async fn test_cancel_finishes_in_flight_page_then_resume() {
    let gate = Arc::new(Semaphore::new(0));
    let feed = Arc::new(ScriptedFeed::new(3, 20).gate_page(2, gate.clone()));
    let sink = Arc::new(MemorySink::new());
    let store = Arc::new(MemoryCheckpointStore::new());
    let session = session_with(fast_config(), feed.clone(), sink.clone(), store.clone());

    let job_id = session
        .start(Target::keyword(Platform::News, "elections"), JobLimits::default())
        .await
        .unwrap();

    // Page 1 is committed and page 2 is in flight behind the gate.
    let mut updates = session.subscribe(job_id).await.unwrap();
    updates.wait_for(|job| job.pages_completed == 1).await.unwrap();
    while feed.requests_for(2) == 0 {
        tokio::task::yield_now().await;
    }

    session.cancel(job_id).await.unwrap();
    session.cancel(job_id).await.unwrap();
    gate.add_permits(1);

    let paused = session.wait(job_id).await.unwrap();
    assert_eq!(paused.status, JobStatus::Paused);
    assert_eq!(paused.stop_reason, Some(StopReason::Cancelled));
    assert_eq!(paused.pages_completed, 2);
    assert_eq!(paused.records_emitted, 40);
    assert_eq!(store.history(job_id).await.len(), 2);
    assert_eq!(feed.requests_for(3), 0);

    // Cancelling a resting job is a no-op.
    session.cancel(job_id).await.unwrap();

    assert_eq!(session.resume(job_id).await.unwrap(), job_id);
    let done = session.wait(job_id).await.unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.records_emitted, 60);

    // Nothing counted in a checkpoint was emitted twice.
    let records = sink.records_for(job_id).await;
    assert_eq!(records.len(), 60);
    assert_eq!(distinct_urls(&records), 60);
    assert_eq!(feed.requests_for(1), 1);
    assert_eq!(feed.requests_for(2), 1);

    session.cancel(job_id).await.unwrap();
    assert!(matches!(
        session.resume(job_id).await,
        Err(ScrapeError::NotResumable { .. })
    ));
}

#[tokio::test]
async fn test_resume_while_running_is_rejected() {
    let gate = Arc::new(Semaphore::new(0));
    let feed = Arc::new(ScriptedFeed::new(2, 5).gate_page(1, gate.clone()));
    let session = session_with(
        fast_config(),
        feed,
        Arc::new(MemorySink::new()),
        Arc::new(MemoryCheckpointStore::new()),
    );

    let job_id = session
        .start(Target::keyword(Platform::News, "elections"), JobLimits::default())
        .await
        .unwrap();
    assert!(matches!(
        session.resume(job_id).await,
        Err(ScrapeError::AlreadyRunning(_))
    ));

    gate.add_permits(1);
    assert_eq!(session.wait(job_id).await.unwrap().status, JobStatus::Completed);
}

#[tokio::test]
async fn test_resume_in_fresh_process_from_file_store() {
    let dir = tempfile::TempDir::new().unwrap();

    // First process dies on page 3.
    let first_sink = Arc::new(MemorySink::new());
    let job_id = {
        let feed = Arc::new(ScriptedFeed::new(3, 20).fail_page(3, &[404]));
        let session = session_with(
            fast_config(),
            feed,
            first_sink.clone(),
            Arc::new(FileCheckpointStore::new(dir.path())),
        );
        let job_id = session
            .start(Target::keyword(Platform::News, "elections"), JobLimits::default())
            .await
            .unwrap();
        let job = session.wait(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.records_emitted, 40);
        job_id
    };

    // Second process only has the state directory.
    let store = Arc::new(FileCheckpointStore::new(dir.path()));
    assert_eq!(store.list_jobs().await.unwrap(), vec![job_id]);

    let second_sink = Arc::new(MemorySink::new());
    let feed = Arc::new(ScriptedFeed::new(3, 20));
    let session = session_with(fast_config(), feed.clone(), second_sink.clone(), store);

    let before = session.status(job_id).await.unwrap();
    assert_eq!(before.status, JobStatus::Paused);
    assert_eq!(before.records_emitted, 40);

    session.resume(job_id).await.unwrap();
    let job = session.wait(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.records_emitted, 60);
    assert_eq!(feed.requests(), 1);
    assert_eq!(second_sink.len().await, 20);

    let mut all = first_sink.records().await;
    all.extend(second_sink.records().await);
    assert_eq!(all.len(), 60);
    assert_eq!(distinct_urls(&all), 60);
}

#[tokio::test]
async fn test_failed_checkpoint_replays_at_most_one_page() {
    // Second checkpoint write fails after page 2 reached the sink.
    let store = Arc::new(FlakyStore::new(2));
    let sink = Arc::new(MemorySink::new());
    let feed = Arc::new(ScriptedFeed::new(3, 20));
    let session = session_with(fast_config(), feed, sink.clone(), store.clone());

    let job_id = session
        .start(Target::keyword(Platform::News, "elections"), JobLimits::default())
        .await
        .unwrap();
    let failed = session.wait(job_id).await.unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert!(matches!(failed.failure, Some(FailureReason::CheckpointWrite(_))));
    assert_eq!(failed.records_emitted, 20);
    assert_eq!(failed.pages_completed, 1);

    session.resume(job_id).await.unwrap();
    let done = session.wait(job_id).await.unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.records_emitted, 60);

    let records = sink.records_for(job_id).await;
    assert_eq!(records.len(), 80);
    assert_eq!(distinct_urls(&records), 60);
    assert_eq!(store.history(job_id).await.len(), 3);
}
