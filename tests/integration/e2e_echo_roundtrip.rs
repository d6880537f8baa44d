//! End-to-end: request/response round-trip over an in-memory link.
//!
//! Two symmetric processors; B invokes methods on A's test API and the
//! answers come back with empty registries afterwards.

use drpc_test_utils::ProcessorPair;
use serde_json::json;

#[tokio::test]
async fn echo_returns_the_argument_and_leaves_no_state() {
    let pair = ProcessorPair::with_test_api();

    let result = pair
        .b
        .send_request(None, "echo", vec![json!("hi")])
        .await
        .expect("echo should succeed");
    assert_eq!(result, Some(json!("hi")));

    // Registries drain once the exchange is over.
    let info_a = pair.a.info();
    let info_b = pair.b.info();
    assert_eq!(info_a.active_calls, 0);
    assert_eq!(info_b.pending_requests, 0);

    pair.shutdown().await;
}

#[tokio::test]
async fn request_response_round_trip_equals_local_invocation() {
    let pair = ProcessorPair::with_test_api();

    for (a, b) in [(1i64, 2i64), (40, 2), (-10, 10)] {
        let result = pair
            .b
            .send_request(None, "sum", vec![json!(a), json!(b)])
            .await
            .expect("sum should succeed");
        assert_eq!(result, Some(json!(a + b)), "sum({a}, {b})");
    }

    pair.shutdown().await;
}

#[tokio::test]
async fn both_directions_work_symmetrically() {
    let pair = ProcessorPair::with_test_api();

    let from_b = pair.b.send_request(None, "echo", vec![json!(1)]).await.unwrap();
    let from_a = pair.a.send_request(None, "echo", vec![json!(2)]).await.unwrap();
    assert_eq!(from_b, Some(json!(1)));
    assert_eq!(from_a, Some(json!(2)));

    pair.shutdown().await;
}

#[tokio::test]
async fn void_request_completes_without_a_value() {
    let pair = ProcessorPair::with_test_api();

    pair.b
        .send_void_request(None, "echo", vec![json!("dropped")])
        .await
        .expect("void request should complete");

    pair.shutdown().await;
}

#[tokio::test]
async fn explicit_api_name_and_unknown_method_behave() {
    let pair = ProcessorPair::with_test_api();

    let named = pair
        .b
        .send_request(Some("test"), "echo", vec![json!("x")])
        .await
        .unwrap();
    assert_eq!(named, Some(json!("x")));

    let missing = pair.b.send_request(None, "nope", vec![]).await;
    match missing {
        Err(duplex_rpc::RpcError::Remote(info)) => {
            assert_eq!(info.code, duplex_rpc::error_codes::METHOD_NOT_FOUND);
        }
        other => panic!("expected METHOD_NOT_FOUND, got {other:?}"),
    }

    pair.shutdown().await;
}

#[tokio::test]
async fn call_errors_surface_as_remote_errors() {
    let pair = ProcessorPair::with_test_api();

    let result = pair
        .b
        .send_request(None, "fail", vec![json!("boom")])
        .await;
    match result {
        Err(duplex_rpc::RpcError::Remote(info)) => {
            assert_eq!(info.code, duplex_rpc::error_codes::CALL_ERROR);
            assert!(info.message.contains("boom"));
        }
        other => panic!("expected remote CALL_ERROR, got {other:?}"),
    }
    // The link survives a call error.
    let alive = pair.b.send_request(None, "echo", vec![json!("ok")]).await.unwrap();
    assert_eq!(alive, Some(json!("ok")));

    pair.shutdown().await;
}
