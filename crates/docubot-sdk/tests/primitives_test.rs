// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the durable step primitives on `WorkflowContext`.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use common::{create_test_persistence, test_context};
use docubot_sdk::{SdkError, StepError};

#[tokio::test]
async fn test_retry_idempotent_retries_then_memoizes() {
    let persistence = create_test_persistence().await;
    let ctx = test_context(persistence.clone(), "i-1");
    let calls = Arc::new(AtomicU32::new(0));

    let c = calls.clone();
    let value: String = ctx
        .retry_idempotent("upload", move || {
            let c = c.clone();
            async move {
                let n = c.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(StepError::retryable(format!("503 on call {}", n)))
                } else {
                    Ok(format!("file-{}", n))
                }
            }
        })
        .await
        .unwrap();

    assert_eq!(value, "file-3");
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let attempts = persistence.list_retry_attempts("i-1").await.unwrap();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0].checkpoint_id, "0/upload");
    assert_eq!(attempts[1].attempt, 2);

    // Replay: recorded result, no call.
    let c = calls.clone();
    let replayed: String = ctx
        .retry_idempotent("upload", move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok("other".to_string())
            }
        })
        .await
        .unwrap();
    assert_eq!(replayed, "file-3");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_retry_idempotent_scoped_by_iteration() {
    let persistence = create_test_persistence().await;
    let first = test_context(persistence.clone(), "loop");
    let second = test_context(persistence.clone(), "loop").with_iteration(1);

    let a: u32 = first
        .retry_idempotent("step", || async { Ok(1) })
        .await
        .unwrap();
    let b: u32 = second
        .retry_idempotent("step", || async { Ok(2) })
        .await
        .unwrap();

    assert_eq!((a, b), (1, 2));
    assert_eq!(second.checkpoint_key("step"), "1/step");
}

#[tokio::test]
async fn test_retry_idempotent_fatal_propagates() {
    let persistence = create_test_persistence().await;
    let ctx = test_context(persistence.clone(), "i-1");
    let calls = AtomicU32::new(0);

    let err = ctx
        .retry_idempotent::<u32, _, _>("provision", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StepError::fatal("model 'gpt-x' not found")) }
        })
        .await
        .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!err.is_retryable());
    assert!(matches!(err, SdkError::Step { ref label, .. } if label == "provision"));
    assert!(ctx.get_checkpoint::<u32>("provision").await.unwrap().is_none());
}

#[tokio::test]
async fn test_retry_idempotent_exhausts_budget() {
    let persistence = create_test_persistence().await;
    let ctx = test_context(persistence.clone(), "i-1");
    let calls = AtomicU32::new(0);

    let err = ctx
        .retry_idempotent::<u32, _, _>("attach", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StepError::retryable("409 conflict")) }
        })
        .await
        .unwrap_err();

    // One initial call plus three retries.
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert!(err.is_retryable());
    assert_eq!(persistence.list_retry_attempts("i-1").await.unwrap().len(), 4);
}

#[tokio::test]
async fn test_at_most_once_success_is_recorded() {
    let persistence = create_test_persistence().await;
    let ctx = test_context(persistence.clone(), "q-1");

    let value: String = ctx
        .retry_at_most_once("run", || async { Ok("sent".to_string()) })
        .await
        .unwrap();
    assert_eq!(value, "sent");

    let ran = AtomicU32::new(0);
    let replayed: String = ctx
        .retry_at_most_once("run", || {
            ran.fetch_add(1, Ordering::SeqCst);
            async { Ok("again".to_string()) }
        })
        .await
        .unwrap();
    assert_eq!(replayed, "sent");
    assert_eq!(ran.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_at_most_once_failure_is_not_retried() {
    let persistence = create_test_persistence().await;
    let ctx = test_context(persistence.clone(), "q-1");

    let err = ctx
        .retry_at_most_once::<(), _, _>("run", || async {
            Err(StepError::retryable("stream dropped"))
        })
        .await
        .unwrap_err();
    match err {
        SdkError::AtMostOnceFailed { label, message } => {
            assert_eq!(label, "run");
            assert_eq!(message, "stream dropped");
        }
        other => panic!("unexpected error: {other}"),
    }

    let ran = AtomicU32::new(0);
    let err = ctx
        .retry_at_most_once::<(), _, _>("run", || {
            ran.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .await
        .unwrap_err();
    assert!(matches!(err, SdkError::AtMostOnceFailed { .. }));
    assert!(!err.is_retryable());
    assert_eq!(ran.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_at_most_once_interrupted_marker() {
    let persistence = create_test_persistence().await;
    let ctx = test_context(persistence.clone(), "q-1");

    // Simulate a crash after the started marker was written.
    persistence
        .upsert_checkpoint("q-1", "0/run", br#"{"status":"started"}"#)
        .await
        .unwrap();

    let ran = AtomicU32::new(0);
    let err = ctx
        .retry_at_most_once::<(), _, _>("run", || {
            ran.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .await
        .unwrap_err();
    assert!(matches!(err, SdkError::AtMostOnceInterrupted { ref label } if label == "run"));
    assert_eq!(ran.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_wait_until_polls_and_memoizes() {
    let persistence = create_test_persistence().await;
    let ctx = test_context(persistence.clone(), "t-1");
    let polls = AtomicU32::new(0);

    let value: String = ctx
        .wait_until("ready", || {
            let n = polls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                match n {
                    1 => Ok(None),
                    2 => Err(StepError::retryable("network blip")),
                    3 => Ok(None),
                    _ => Ok(Some(format!("asst_{}", n))),
                }
            }
        })
        .await
        .unwrap();

    assert_eq!(value, "asst_4");
    assert_eq!(polls.load(Ordering::SeqCst), 4);

    let again: String = ctx
        .wait_until("ready", || async { Ok(Some("different".to_string())) })
        .await
        .unwrap();
    assert_eq!(again, "asst_4");
}

#[tokio::test]
async fn test_wait_until_fatal_propagates() {
    let persistence = create_test_persistence().await;
    let ctx = test_context(persistence.clone(), "t-1");

    let err = ctx
        .wait_until::<u32, _, _>("ready", || async { Err(StepError::fatal("bad record")) })
        .await
        .unwrap_err();
    assert!(matches!(err, SdkError::Step { .. }));
}

#[tokio::test]
async fn test_sleep_is_cancellable() {
    let persistence = create_test_persistence().await;
    let token = tokio_util::sync::CancellationToken::new();
    let ctx = test_context(persistence, "i").with_cancellation(token.clone());

    token.cancel();
    let err = ctx
        .sleep(std::time::Duration::from_secs(3600))
        .await
        .unwrap_err();
    assert!(matches!(err, SdkError::Cancelled));
    assert!(ctx.is_cancelled());
}
