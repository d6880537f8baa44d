//! End-to-end: duplicate message ids from a misbehaving peer.
//!
//! The peer is driven at the raw codec level so it can violate the
//! contract on purpose: two requests with the same id, back to back.  The
//! receiver answers the first normally and the second with
//! DOUBLE_MESSAGE_ID, and never enqueues a second call.

use duplex_rpc::{
    MessageReader, MessageWriter, ProcessorOptions, RpcProcessor, WireMessage, error_codes,
};
use drpc_test_utils::{duplex_link, test_api};
use serde_json::json;
use std::time::Duration;

const MAX: usize = 4 * 1024 * 1024;

fn request(id: i64, method: &str, parameters: Vec<serde_json::Value>) -> WireMessage {
    WireMessage::Request(drpc_protocol::Request {
        id,
        api: None,
        method: method.to_owned(),
        parameters,
        wants_return_value: true,
        wants_response: true,
    })
}

#[tokio::test]
async fn double_id_gets_one_answer_and_one_error() {
    let (end_a, end_b) = duplex_link();
    let processor = RpcProcessor::start(
        end_a,
        ProcessorOptions {
            apis: test_api(),
            ..ProcessorOptions::default()
        },
    );

    let (raw_read, raw_write) = tokio::io::split(end_b);
    let mut reader = MessageReader::new(raw_read, MAX);
    let mut writer = MessageWriter::new(raw_write, MAX, true);

    // First request parks in the call registry; the duplicate arrives while
    // it is still there.
    writer
        .write_message(&request(42, "sleep", vec![json!(200)]))
        .await
        .unwrap();
    writer
        .write_message(&request(42, "echo", vec![json!("dup")]))
        .await
        .unwrap();

    let mut normal_answer = None;
    let mut duplicate_error = None;
    for _ in 0..2 {
        let message = tokio::time::timeout(Duration::from_secs(5), reader.read_message())
            .await
            .expect("answer must arrive")
            .expect("read");
        match message {
            WireMessage::Response(r) => {
                assert_eq!(r.id, 42);
                normal_answer = Some(r);
            }
            WireMessage::ErrorResponse(e) => {
                assert_eq!(e.id, 42);
                duplicate_error = Some(e);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    let normal = normal_answer.expect("first request must be answered normally");
    assert_eq!(normal.return_value, Some(json!(200)));

    let error = duplicate_error.expect("duplicate must be refused");
    assert_eq!(error.error.code, error_codes::DOUBLE_MESSAGE_ID);

    // No call leaked for the duplicate.
    assert_eq!(processor.info().active_calls, 0);

    processor.close().await;
    processor.closed().await;
}

#[tokio::test]
async fn the_same_id_is_usable_again_after_completion() {
    let (end_a, end_b) = duplex_link();
    let processor = RpcProcessor::start(
        end_a,
        ProcessorOptions {
            apis: test_api(),
            ..ProcessorOptions::default()
        },
    );

    let (raw_read, raw_write) = tokio::io::split(end_b);
    let mut reader = MessageReader::new(raw_read, MAX);
    let mut writer = MessageWriter::new(raw_write, MAX, true);

    for round in 0..2 {
        writer
            .write_message(&request(7, "echo", vec![json!(round)]))
            .await
            .unwrap();
        match tokio::time::timeout(Duration::from_secs(5), reader.read_message())
            .await
            .expect("answer must arrive")
            .expect("read")
        {
            WireMessage::Response(r) => {
                assert_eq!(r.id, 7);
                assert_eq!(r.return_value, Some(json!(round)));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    processor.close().await;
    processor.closed().await;
}
