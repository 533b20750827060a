use std::time::Duration;

use multiscrape::fetcher::retry_formatter::{
    classify_status, classify_transport, FailureKind, RetryContext,
};
use multiscrape::fetcher::TransportError;
use multiscrape::{Platform, Target};

fn sample_context(kind: FailureKind) -> RetryContext {
    RetryContext::new(
        &Target::keyword(Platform::Youtube, "rust tutorials"),
        4,
        2,
        5,
        kind,
        Duration::from_secs(4),
        "connection reset by peer",
    )
}

#[test]
fn format_retry_captures_attempt_and_wait() {
    let message = sample_context(FailureKind::RateLimit).format_retry();
    assert!(message.contains("page 4"));
    assert!(message.contains("attempt 2/5"));
    assert!(message.contains("rate limit exceeded"));
    assert!(message.contains("4.0 seconds"));
    assert!(message.contains("youtube:keyword:rust tutorials"));
}

#[test]
fn format_success_includes_target_context() {
    let message = sample_context(FailureKind::NetworkTimeout).format_success();
    assert!(message.contains("succeeded on retry 2/5"));
    assert!(message.contains("youtube:keyword:rust tutorials"));
}

#[test]
fn format_failure_lists_suggestions() {
    let output = sample_context(FailureKind::ServerError(502)).format_failure();
    assert!(output.starts_with("[FAILED] Page 4 failed after 5 retries"));
    assert!(output.contains("connection reset by peer"));
    assert!(output.contains("Platform: youtube"));
    assert!(output.contains("resume the job later"));
    assert!(output.contains("retry.max_retries (current: 5)"));
}

#[test]
fn permanent_failures_do_not_suggest_more_retries() {
    let suggestions = sample_context(FailureKind::Banned).format_suggestions();
    assert_eq!(suggestions.len(), 1);
    assert!(suggestions[0].contains("rotate network egress"));

    let suggestions = sample_context(FailureKind::AuthFailed(403)).format_suggestions();
    assert_eq!(suggestions.len(), 1);
}

#[test]
fn classify_status_covers_the_response_table() {
    assert_eq!(classify_status(200), None);
    assert_eq!(classify_status(304), None);
    assert_eq!(classify_status(400), Some(FailureKind::InvalidRequest));
    assert_eq!(classify_status(401), Some(FailureKind::AuthFailed(401)));
    assert_eq!(classify_status(403), Some(FailureKind::AuthFailed(403)));
    assert_eq!(classify_status(404), Some(FailureKind::NotFound));
    assert_eq!(classify_status(410), Some(FailureKind::NotFound));
    assert_eq!(classify_status(418), Some(FailureKind::ClientError(418)));
    assert_eq!(classify_status(429), Some(FailureKind::RateLimit));
    assert_eq!(classify_status(451), Some(FailureKind::Banned));
    assert_eq!(classify_status(503), Some(FailureKind::ServerError(503)));
}

#[test]
fn retryability_matches_failure_class() {
    for kind in [
        FailureKind::NetworkTimeout,
        FailureKind::NetworkOffline,
        FailureKind::RateLimit,
        FailureKind::ServerError(500),
        FailureKind::NetworkGeneric,
    ] {
        assert!(kind.is_retryable(), "{kind:?} should be retryable");
    }
    for kind in [
        FailureKind::InvalidRequest,
        FailureKind::AuthFailed(401),
        FailureKind::NotFound,
        FailureKind::Banned,
        FailureKind::ClientError(409),
        FailureKind::RenderUnavailable,
    ] {
        assert!(!kind.is_retryable(), "{kind:?} should not be retryable");
    }
}

#[test]
fn classify_transport_errors() {
    assert_eq!(
        classify_transport(&TransportError::Timeout("30s".to_string())),
        FailureKind::NetworkTimeout
    );
    assert_eq!(
        classify_transport(&TransportError::Connect("refused".to_string())),
        FailureKind::NetworkOffline
    );
    assert_eq!(
        classify_transport(&TransportError::Render("no chrome".to_string())),
        FailureKind::NetworkGeneric
    );
    let invalid = classify_transport(&TransportError::InvalidRequest("relative URL".to_string()));
    assert_eq!(invalid, FailureKind::InvalidRequest);
    assert!(!invalid.is_retryable());
}
