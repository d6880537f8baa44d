//! End-to-end: heartbeat detects a silent transport.
//!
//! The relay keeps consuming bytes but forwards nothing, so the link looks
//! healthy to the OS while the peer hears only silence.  The keep-alive
//! side must stop exceptionally with a timeout and fail its pending
//! requests.

use duplex_rpc::{
    KeepAliveOptions, ProcessorOptions, ProcessorState, RpcError, RpcProcessor,
};
use drpc_test_utils::{silenceable_link, test_api};
use serde_json::json;
use std::time::Duration;

#[tokio::test]
async fn silence_is_fatal_within_the_heartbeat_budget() {
    let (end_a, end_b, link) = silenceable_link();

    let a = RpcProcessor::start(
        end_a,
        ProcessorOptions {
            apis: test_api(),
            keep_alive: Some(KeepAliveOptions {
                timeout: Duration::from_millis(200),
                peer_timeout: Duration::from_millis(200),
            }),
            ..ProcessorOptions::default()
        },
    );
    let b = RpcProcessor::start(
        end_b,
        ProcessorOptions {
            apis: test_api(),
            ..ProcessorOptions::default()
        },
    );

    // Working link first: traffic flows, heartbeat stays quiet.
    let echo = a.send_request(None, "echo", vec![json!("up")]).await.unwrap();
    assert_eq!(echo, Some(json!("up")));

    // Issue a request that will still be pending when the link goes dark,
    // then silence the transport.
    let pending_processor = a.clone();
    let pending = tokio::spawn(async move {
        pending_processor
            .send_request(None, "sleep", vec![json!(60_000)])
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    link.silence();

    // Self timer fires after 200 ms of outbound silence, the pong window is
    // another 200 ms; well before 2 s the processor must be gone.
    tokio::time::timeout(Duration::from_secs(2), a.closed())
        .await
        .expect("keep-alive side must dispose after silence");

    assert_eq!(a.state(), ProcessorState::Disposed);
    match a.last_error() {
        Some(RpcError::Timeout(message)) => {
            assert!(
                message.contains("heartbeat"),
                "expected a heartbeat timeout, got: {message}"
            );
        }
        other => panic!("expected a heartbeat timeout, got {other:?}"),
    }

    // The pending request observed the terminal error, not a hang.
    let outcome = tokio::time::timeout(Duration::from_secs(1), pending)
        .await
        .expect("pending request must complete")
        .unwrap();
    assert!(outcome.is_err(), "pending request must fail on shutdown");
    assert_eq!(a.info().pending_requests, 0);

    b.close().await;
    b.closed().await;
}

#[tokio::test]
async fn active_traffic_keeps_the_link_alive() {
    let (end_a, end_b) = drpc_test_utils::duplex_link();
    let keep_alive = Some(KeepAliveOptions {
        timeout: Duration::from_millis(150),
        peer_timeout: Duration::from_millis(150),
    });
    let a = RpcProcessor::start(
        end_a,
        ProcessorOptions {
            apis: test_api(),
            keep_alive,
            ..ProcessorOptions::default()
        },
    );
    let b = RpcProcessor::start(
        end_b,
        ProcessorOptions {
            apis: test_api(),
            keep_alive,
            ..ProcessorOptions::default()
        },
    );

    // Outlive several heartbeat periods with both sides quiet: pings and
    // pongs must keep the link up on their own.
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(a.state(), ProcessorState::Running);
    assert_eq!(b.state(), ProcessorState::Running);

    let echo = a.send_request(None, "echo", vec![json!("still up")]).await.unwrap();
    assert_eq!(echo, Some(json!("still up")));

    a.close().await;
    b.close().await;
    a.closed().await;
    b.closed().await;
}

#[tokio::test]
async fn manual_ping_round_trips_without_keep_alive() {
    let (end_a, end_b) = drpc_test_utils::duplex_link();
    let a = RpcProcessor::start(end_a, ProcessorOptions::default());
    let _b = RpcProcessor::start(end_b, ProcessorOptions::default());

    a.ping(Duration::from_secs(1)).await.expect("pong must arrive");

    a.close().await;
    a.closed().await;
}
