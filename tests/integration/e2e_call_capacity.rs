//! End-to-end: call-queue capacity.
//!
//! With a call queue of one, a second concurrent request is refused with
//! TOO_MANY_RPC_REQUESTS before it is ever enqueued; the running call is
//! unaffected and nothing leaks.

use duplex_rpc::{ProcessorOptions, QueueOptions, RpcError, error_codes};
use drpc_test_utils::{ProcessorPair, test_api};
use serde_json::json;
use std::time::Duration;

fn single_slot_options() -> ProcessorOptions {
    ProcessorOptions {
        apis: test_api(),
        call_queue: QueueOptions::new(1, 2),
        ..ProcessorOptions::default()
    }
}

#[tokio::test]
async fn second_concurrent_call_is_refused_while_the_first_runs() {
    let pair = ProcessorPair::connect(single_slot_options(), ProcessorOptions::default());

    let slow_processor = pair.b.clone();
    let slow = tokio::spawn(async move {
        slow_processor
            .send_request(None, "sleep", vec![json!(300)])
            .await
    });
    // Let `sleep` occupy the only slot.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let fast = pair.b.send_request(None, "echo", vec![json!("fast")]).await;
    match fast {
        Err(RpcError::Remote(info)) => {
            assert_eq!(info.code, error_codes::TOO_MANY_RPC_REQUESTS);
            assert!(info.retryable, "capacity refusals are retryable");
        }
        other => panic!("expected TOO_MANY_RPC_REQUESTS, got {other:?}"),
    }

    // The slow call is unaffected.
    let slow = slow.await.unwrap().expect("slow call should finish");
    assert_eq!(slow, Some(json!(300)));

    // No leaked entries on either side.
    assert_eq!(pair.a.info().active_calls, 0);
    assert_eq!(pair.b.info().pending_requests, 0);

    pair.shutdown().await;
}

#[tokio::test]
async fn capacity_frees_up_after_completion() {
    let pair = ProcessorPair::connect(single_slot_options(), ProcessorOptions::default());

    for round in 0..3 {
        let result = pair
            .b
            .send_request(None, "echo", vec![json!(round)])
            .await
            .expect("sequential calls should all fit");
        assert_eq!(result, Some(json!(round)));
    }

    pair.shutdown().await;
}
