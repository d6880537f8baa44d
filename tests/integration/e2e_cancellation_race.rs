//! End-to-end: caller-side cancellation.
//!
//! The caller cancels long before the callee finishes: the awaiter sees a
//! cancellation, the callee's composite token fires, and no value response
//! is ever produced for the call.

use duplex_rpc::{RequestOptions, RpcError};
use drpc_test_utils::ProcessorPair;
use serde_json::json;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn cancel_before_completion_yields_cancellation_both_sides() {
    let pair = ProcessorPair::with_test_api();

    let token = CancellationToken::new();
    let request_processor = pair.b.clone();
    let request_token = token.clone();
    let request = tokio::spawn(async move {
        request_processor
            .send_request_with(
                None,
                "sleep",
                vec![json!(10_000)],
                RequestOptions {
                    cancel: Some(request_token),
                    ..RequestOptions::default()
                },
            )
            .await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    token.cancel();

    let outcome = request.await.unwrap();
    assert!(
        matches!(outcome, Err(RpcError::Canceled)),
        "caller must observe cancellation, got {outcome:?}"
    );

    // The callee's composite token ends the handler; its registry drains.
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if pair.a.info().active_calls == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("callee must drop the canceled call");

    assert_eq!(pair.b.info().pending_requests, 0, "no pending entry survives");

    pair.shutdown().await;
}

#[tokio::test]
async fn cancellation_after_the_answer_is_a_lost_race_with_a_value() {
    let pair = ProcessorPair::with_test_api();

    let token = CancellationToken::new();
    let result = pair
        .b
        .send_request_with(
            None,
            "echo",
            vec![json!("quick")],
            RequestOptions {
                cancel: Some(token.clone()),
                ..RequestOptions::default()
            },
        )
        .await
        .expect("the answer arrived before any cancellation");
    assert_eq!(result, Some(json!("quick")));

    // Cancelling now is a no-op; no double completion, no error.
    token.cancel();
    assert_eq!(pair.b.info().pending_requests, 0);

    pair.shutdown().await;
}

#[tokio::test]
async fn request_timeout_behaves_like_cancellation_for_the_callee() {
    let pair = ProcessorPair::with_test_api();

    let outcome = pair
        .b
        .send_request_with(
            None,
            "sleep",
            vec![json!(10_000)],
            RequestOptions {
                timeout: Some(Duration::from_millis(80)),
                ..RequestOptions::default()
            },
        )
        .await;
    assert!(
        matches!(outcome, Err(RpcError::Timeout(_))),
        "caller must observe the timeout, got {outcome:?}"
    );

    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if pair.a.info().active_calls == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("callee must drop the timed-out call");

    pair.shutdown().await;
}
