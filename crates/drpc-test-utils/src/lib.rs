// drpc-test-utils: Shared test utilities for the RPC suite.
//
// Provides an in-memory duplex link, a face-to-face processor pair, canned
// test APIs, and a silenceable relay for heartbeat-loss scenarios.

use drpc_core::{
    ApiBuilder, ApiRegistry, ByteSource, MethodBuilder, MethodOutcome, ProcessorOptions,
    RpcProcessor,
};
use drpc_core::{Expectation, ParamSpec, RpcError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::watch;

/// Buffer size for in-memory links; big enough that framing never deadlocks
/// on its own buffer during tests.
const LINK_BUFFER: usize = 256 * 1024;

/// A fresh in-memory duplex link.
pub fn duplex_link() -> (DuplexStream, DuplexStream) {
    tokio::io::duplex(LINK_BUFFER)
}

/// Random string key, for keyed scopes in tests.
pub fn unique_key(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4())
}

// ---------------------------------------------------------------------------
// Processor pair
// ---------------------------------------------------------------------------

/// Two processors wired face to face over an in-memory link.
pub struct ProcessorPair {
    pub a: RpcProcessor,
    pub b: RpcProcessor,
}

impl ProcessorPair {
    /// Start both sides with the given options.
    pub fn connect(options_a: ProcessorOptions, options_b: ProcessorOptions) -> ProcessorPair {
        let (end_a, end_b) = duplex_link();
        ProcessorPair {
            a: RpcProcessor::start(end_a, options_a),
            b: RpcProcessor::start(end_b, options_b),
        }
    }

    /// Both sides serving the canned test API with default options.
    pub fn with_test_api() -> ProcessorPair {
        let options = || ProcessorOptions {
            apis: test_api(),
            ..ProcessorOptions::default()
        };
        ProcessorPair::connect(options(), options())
    }

    /// Tear both sides down and wait for the cascades to finish.
    pub async fn shutdown(&self) {
        self.a.close().await;
        self.b.close().await;
        self.a.closed().await;
        self.b.closed().await;
    }
}

// ---------------------------------------------------------------------------
// Canned APIs
// ---------------------------------------------------------------------------

/// The canned test API:
///
/// - `echo(x)` returns `x`
/// - `sum(a, b)` returns `a + b`
/// - `sleep(ms)` waits, then returns `ms` (cancellation-aware)
/// - `fail(message)` always errors
/// - `blob(len)` returns a stream of `len` pseudo-random bytes
pub fn test_api() -> ApiRegistry {
    let echo = MethodBuilder::new("echo")
        .param(ParamSpec::rpc("x", Expectation::Any))
        .handler(|_ctx, mut args| async move {
            let value = args.remove(0).into_value().unwrap_or(serde_json::Value::Null);
            Ok(MethodOutcome::Value(value))
        })
        .finish();

    let sum = MethodBuilder::new("sum")
        .param(ParamSpec::rpc("a", Expectation::Number))
        .param(ParamSpec::rpc("b", Expectation::Number))
        .handler(|_ctx, args| async move {
            let a = args[0].as_value().and_then(serde_json::Value::as_i64).unwrap_or(0);
            let b = args[1].as_value().and_then(serde_json::Value::as_i64).unwrap_or(0);
            Ok(MethodOutcome::Value(serde_json::json!(a + b)))
        })
        .finish();

    let sleep = MethodBuilder::new("sleep")
        .param(ParamSpec::rpc("ms", Expectation::Number))
        .handler(|ctx, args| async move {
            let ms = args[0]
                .as_value()
                .and_then(serde_json::Value::as_u64)
                .unwrap_or(0);
            tokio::select! {
                _ = ctx.cancellation().cancelled() => Err(RpcError::Canceled),
                _ = tokio::time::sleep(Duration::from_millis(ms)) => {
                    Ok(MethodOutcome::Value(serde_json::json!(ms)))
                }
            }
        })
        .finish();

    let fail = MethodBuilder::new("fail")
        .param(ParamSpec::rpc("message", Expectation::String))
        .handler(|_ctx, args| async move {
            let message = args[0].as_str().unwrap_or("failure requested").to_owned();
            Err(RpcError::Call {
                code: drpc_protocol::error_codes::CALL_ERROR,
                message,
            })
        })
        .finish();

    let blob = MethodBuilder::new("blob")
        .param(ParamSpec::rpc("len", Expectation::Number))
        .handler(|_ctx, args| async move {
            let len = args[0]
                .as_value()
                .and_then(serde_json::Value::as_u64)
                .unwrap_or(0) as usize;
            Ok(MethodOutcome::Stream(ByteSource::from_bytes(test_bytes(len))))
        })
        .finish();

    ApiRegistry::builder()
        .api(
            ApiBuilder::new("test")
                .method(echo)
                .method(sum)
                .method(sleep)
                .method(fail)
                .method(blob)
                .finish(),
        )
        .finish()
}

/// Deterministic pseudo-random payload; reproducible for equality checks.
pub fn test_bytes(len: usize) -> Vec<u8> {
    let mut state: u32 = 0x9e37_79b9;
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            (state >> 24) as u8
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Silenceable relay
// ---------------------------------------------------------------------------

/// Controls a relay between two link ends.  Once silenced, bytes keep being
/// consumed but nothing is forwarded: the transport looks alive and says
/// nothing, which is exactly what a heartbeat must catch.
pub struct SilenceableLink {
    silence_tx: watch::Sender<bool>,
}

impl SilenceableLink {
    pub fn silence(&self) {
        let _ = self.silence_tx.send(true);
    }
}

/// A duplex link with a relay in the middle that can be silenced.
pub fn silenceable_link() -> (DuplexStream, DuplexStream, SilenceableLink) {
    let (end_a, relay_a) = tokio::io::duplex(LINK_BUFFER);
    let (end_b, relay_b) = tokio::io::duplex(LINK_BUFFER);
    let (silence_tx, silence_rx) = watch::channel(false);

    let (read_a, write_a) = tokio::io::split(relay_a);
    let (read_b, write_b) = tokio::io::split(relay_b);
    tokio::spawn(relay_bytes(read_a, write_b, silence_rx.clone()));
    tokio::spawn(relay_bytes(read_b, write_a, silence_rx));

    (end_a, end_b, SilenceableLink { silence_tx })
}

async fn relay_bytes<R, W>(mut read: R, mut write: W, silence: watch::Receiver<bool>)
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut buf = [0u8; 8 * 1024];
    loop {
        let n = match read.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        if *silence.borrow() {
            // Blackhole: consume and drop.
            continue;
        }
        if write.write_all(&buf[..n]).await.is_err() {
            return;
        }
    }
}
