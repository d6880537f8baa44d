//! End-to-end: 3 MiB stream round-trip.
//!
//! A method returns a large byte source; the caller pulls it chunk by
//! chunk with one chunk in flight at a time.  The received bytes equal the
//! sent bytes and both stream tables are empty at EOF.  Small payloads
//! travel inline and never touch the tables.

use drpc_test_utils::{ProcessorPair, test_bytes};
use serde_json::json;
use std::time::Duration;

const THREE_MIB: usize = 3 * 1024 * 1024;

async fn wait_for_empty_tables(pair: &ProcessorPair) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let a = pair.a.info();
            let b = pair.b.info();
            if a.outgoing_streams == 0 && b.incoming_streams == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("stream tables must drain at EOF");
}

#[tokio::test]
async fn three_mib_stream_round_trips_byte_exact() {
    let pair = ProcessorPair::with_test_api();

    let value = pair
        .b
        .send_request(None, "blob", vec![json!(THREE_MIB)])
        .await
        .expect("blob call should succeed")
        .expect("blob returns a stream value");

    let mut handle = pair.b.incoming_stream(&value).expect("stream handle");
    assert!(!handle.is_inline(), "3 MiB must not be inlined");
    assert_eq!(handle.length(), Some(THREE_MIB as u64));

    let received = handle.read_to_end().await.expect("full read");
    assert_eq!(received.len(), THREE_MIB);
    assert_eq!(received, test_bytes(THREE_MIB), "bytes must round-trip exactly");

    wait_for_empty_tables(&pair).await;
    pair.shutdown().await;
}

#[tokio::test]
async fn chunked_reads_deliver_in_order() {
    let pair = ProcessorPair::with_test_api();
    let total = 300 * 1024;

    let value = pair
        .b
        .send_request(None, "blob", vec![json!(total)])
        .await
        .unwrap()
        .unwrap();
    let mut handle = pair.b.incoming_stream(&value).unwrap();

    let expected = test_bytes(total);
    let mut offset = 0usize;
    while let Some(chunk) = handle.read_chunk().await.expect("chunk read") {
        assert!(!chunk.is_empty() || offset == total);
        assert_eq!(
            chunk[..],
            expected[offset..offset + chunk.len()],
            "chunk at offset {offset} must match"
        );
        offset += chunk.len();
    }
    assert_eq!(offset, total, "every byte must arrive exactly once");

    wait_for_empty_tables(&pair).await;
    pair.shutdown().await;
}

#[tokio::test]
async fn small_payloads_travel_inline_and_skip_the_tables() {
    let pair = ProcessorPair::with_test_api();

    let value = pair
        .b
        .send_request(None, "blob", vec![json!(512)])
        .await
        .unwrap()
        .unwrap();

    let mut handle = pair.b.incoming_stream(&value).expect("inline handle");
    assert!(handle.is_inline(), "512 bytes fit the inline limit");
    assert_eq!(pair.b.info().incoming_streams, 0, "inline bypasses the table");
    assert_eq!(pair.a.info().outgoing_streams, 0, "inline bypasses the table");

    let received = handle.read_to_end().await.unwrap();
    assert_eq!(received, test_bytes(512));

    pair.shutdown().await;
}

#[tokio::test]
async fn consumer_close_stops_the_producer() {
    let pair = ProcessorPair::with_test_api();

    let value = pair
        .b
        .send_request(None, "blob", vec![json!(THREE_MIB)])
        .await
        .unwrap()
        .unwrap();
    let mut handle = pair.b.incoming_stream(&value).unwrap();

    // Read a little, then walk away.
    let first = handle.read_chunk().await.expect("first chunk");
    assert!(first.is_some());
    handle.close().await;

    wait_for_empty_tables(&pair).await;
    pair.shutdown().await;
}
