//! End-to-end: event registration, acked and fire-and-forget raises.
//!
//! A waited raise completes iff the peer's handler returned without error;
//! fire-and-forget failures stay on the handling side.

use duplex_rpc::{RpcError, error_codes};
use drpc_test_utils::ProcessorPair;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[tokio::test]
async fn waited_event_acks_after_the_handler_ran() {
    let pair = ProcessorPair::with_test_api();

    let hits = Arc::new(AtomicUsize::new(0));
    let handler_hits = Arc::clone(&hits);
    pair.a
        .events()
        .register("refresh", move |ctx| {
            let handler_hits = Arc::clone(&handler_hits);
            async move {
                assert_eq!(ctx.name(), "refresh");
                handler_hits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .unwrap();

    pair.b
        .raise_event("refresh", Some(json!({ "full": true })), true)
        .await
        .expect("waited raise completes when the handler succeeds");
    assert_eq!(hits.load(Ordering::SeqCst), 1, "handler ran exactly once");

    pair.shutdown().await;
}

#[tokio::test]
async fn waited_event_fails_when_the_handler_fails() {
    let pair = ProcessorPair::with_test_api();

    pair.a
        .events()
        .register("explode", |_ctx| async {
            Err(RpcError::Call {
                code: error_codes::CALL_ERROR,
                message: "handler refused".to_owned(),
            })
        })
        .unwrap();

    let outcome = pair.b.raise_event("explode", None, true).await;
    match outcome {
        Err(RpcError::Remote(info)) => {
            assert_eq!(info.code, error_codes::CALL_ERROR);
            assert!(info.message.contains("handler refused"));
        }
        other => panic!("expected the handler error, got {other:?}"),
    }

    pair.shutdown().await;
}

#[tokio::test]
async fn waited_event_without_a_handler_is_an_error() {
    let pair = ProcessorPair::with_test_api();

    let outcome = pair.b.raise_event("nobody-home", None, true).await;
    match outcome {
        Err(RpcError::Remote(info)) => assert_eq!(info.code, error_codes::UNKNOWN_EVENT),
        other => panic!("expected UNKNOWN_EVENT, got {other:?}"),
    }

    pair.shutdown().await;
}

#[tokio::test]
async fn fire_and_forget_failures_stay_on_the_handling_side() {
    let pair = ProcessorPair::with_test_api();

    let hits = Arc::new(AtomicUsize::new(0));
    let handler_hits = Arc::clone(&hits);
    pair.a
        .events()
        .register("tick", move |_ctx| {
            let handler_hits = Arc::clone(&handler_hits);
            async move {
                handler_hits.fetch_add(1, Ordering::SeqCst);
                Err(RpcError::Call {
                    code: error_codes::CALL_ERROR,
                    message: "isolated".to_owned(),
                })
            }
        })
        .unwrap();

    // The raiser only learns the event was written, and the link survives
    // the handler failure.
    pair.b.raise_event("tick", None, false).await.unwrap();

    tokio::time::timeout(Duration::from_secs(2), async {
        while hits.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("handler must still run");

    let alive = pair.b.send_request(None, "echo", vec![json!("ok")]).await.unwrap();
    assert_eq!(alive, Some(json!("ok")));

    pair.shutdown().await;
}

#[tokio::test]
async fn event_names_can_be_retired_and_reused() {
    let pair = ProcessorPair::with_test_api();

    pair.a.events().register("once", |_ctx| async { Ok(()) }).unwrap();
    assert!(pair.a.events().register("once", |_ctx| async { Ok(()) }).is_err());

    assert!(pair.a.events().unregister("once"));
    pair.a.events().register("once", |_ctx| async { Ok(()) }).unwrap();

    pair.b.raise_event("once", None, true).await.unwrap();

    pair.shutdown().await;
}
