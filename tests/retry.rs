//! Retry Integration Tests
//!
//! Backoff timing, attempt timeouts and how adapter status codes feed the
//! retry decision.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use karibu::adapters::classify_status;
use karibu::core::{EngineError, ErrorClass, Retry, RetryPolicy, UserAction};
use tokio_test::{assert_err, assert_ok};

fn fast_backoff(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_delay_ms: 20,
        max_delay_ms: 50,
        jitter_ms: 0,
        attempt_timeout_secs: None,
    }
}

#[tokio::test]
async fn test_backoff_waits_between_attempts() {
    let retry = Retry::new(fast_backoff(3));
    let calls = AtomicU32::new(0);
    let started = Instant::now();

    let result: Result<(), _> = retry
        .execute("always unavailable", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(classify_status("storage", 503, "Service Unavailable"))
        })
        .await;

    // 20ms after the first failure, 40ms after the second
    assert!(started.elapsed() >= Duration::from_millis(60));
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let err = result.unwrap_err();
    assert!(matches!(err, EngineError::RetryExhausted { attempts: 3, .. }));
    assert_eq!(err.suggested_action(), UserAction::RetryAutomatically);
    assert!(matches!(err.root(), EngineError::Transient(_)));
}

#[tokio::test]
async fn test_client_errors_fail_fast() {
    let retry = Retry::new(fast_backoff(5));
    let calls = AtomicU32::new(0);

    let result = retry
        .execute("bad request", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(classify_status("openai", 400, "invalid model"))
        })
        .await;
    let err = assert_err!(result);

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(matches!(err, EngineError::Rejected { status: 400, .. }));
    assert_eq!(err.suggested_action(), UserAction::PromptUser);
}

#[tokio::test]
async fn test_rate_limits_and_timeouts_are_retried() {
    for status in [408u16, 429, 500, 502] {
        let retry = Retry::new(RetryPolicy::immediate(2));
        let calls = AtomicU32::new(0);

        let result = retry
            .execute("flaky", || async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(classify_status("whatsapp", status, ""))
                } else {
                    Ok(status)
                }
            })
            .await;
        let value = assert_ok!(result);

        assert_eq!(value, status);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}

#[tokio::test]
async fn test_slow_attempt_is_cut_off_and_retried() {
    let policy = RetryPolicy {
        attempt_timeout_secs: Some(1),
        ..RetryPolicy::immediate(2)
    };
    let retry = Retry::new(policy);
    let calls = AtomicU32::new(0);
    let started = Instant::now();

    let value = retry
        .execute("slow then fast", || async {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            Ok::<_, EngineError>("done")
        })
        .await
        .unwrap();

    assert_eq!(value, "done");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn test_conflicts_are_never_retried() {
    let retry = Retry::new(RetryPolicy::immediate(4));
    let calls = AtomicU32::new(0);

    let err = retry
        .execute("claim", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(EngineError::Conflict {
                entity: "visit",
                id: uuid::Uuid::new_v4(),
                message: "already claimed".to_string(),
            })
        })
        .await
        .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(err.class(), ErrorClass::Conflict);
    assert_eq!(err.user_message(), "Already claimed by someone else");
}
