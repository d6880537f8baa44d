//! Outgoing streams: the producer side of a chunked transfer.
//!
//! Registration hands back the wire value to embed in a parameter or return
//! value; a spawned task then waits for the consumer's `stream_start` and
//! pushes chunks one at a time, each gated on the previous chunk's ack.

use crate::error::RpcError;
use crate::processor::RpcProcessor;
use crate::streams::ByteSource;
use drpc_protocol::{LocalStreamClose, StreamChunk, StreamStart, StreamValue, WireMessage};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

pub(crate) struct OutgoingStream {
    pub(crate) id: i64,
    start_requested: AtomicBool,
    done: AtomicBool,
    remote_canceled: AtomicBool,
    cancel: CancellationToken,
    start_tx: Mutex<Option<oneshot::Sender<()>>>,
    last_local_error: Mutex<Option<RpcError>>,
}

impl OutgoingStream {
    fn record_error(&self, error: &RpcError) {
        *self
            .last_local_error
            .lock()
            .expect("outgoing stream poisoned") = Some(error.clone());
    }
}

impl std::fmt::Debug for OutgoingStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutgoingStream")
            .field("id", &self.id)
            .field("started", &self.start_requested.load(Ordering::Relaxed))
            .field("done", &self.done.load(Ordering::Relaxed))
            .field("remote_canceled", &self.remote_canceled.load(Ordering::Relaxed))
            .field(
                "last_local_error",
                &self
                    .last_local_error
                    .lock()
                    .expect("outgoing stream poisoned"),
            )
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
pub(crate) struct OutgoingStreams {
    table: Mutex<HashMap<i64, Arc<OutgoingStream>>>,
}

impl OutgoingStreams {
    fn insert(&self, stream: Arc<OutgoingStream>) {
        self.table
            .lock()
            .expect("outgoing streams poisoned")
            .insert(stream.id, stream);
    }

    fn get(&self, id: i64) -> Option<Arc<OutgoingStream>> {
        self.table
            .lock()
            .expect("outgoing streams poisoned")
            .get(&id)
            .cloned()
    }

    fn remove(&self, id: i64) -> Option<Arc<OutgoingStream>> {
        self.table
            .lock()
            .expect("outgoing streams poisoned")
            .remove(&id)
    }

    pub(crate) fn drain(&self) -> Vec<Arc<OutgoingStream>> {
        let mut table = self.table.lock().expect("outgoing streams poisoned");
        table.drain().map(|(_, s)| s).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.table.lock().expect("outgoing streams poisoned").len()
    }
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

/// Turn a byte source into a wire stream value.
///
/// A source with known length at or below the inline limit is copied whole
/// into the value and never registered.  Anything else claims a fresh
/// stream id and spawns the producer task.
pub(crate) async fn create_value(
    processor: &RpcProcessor,
    mut source: ByteSource,
) -> Result<StreamValue, RpcError> {
    let shared = processor.shared();
    let inline_limit = shared.options.inline_content_limit;
    if let Some(length) = source.length() {
        if length <= inline_limit as u64 {
            let content = source
                .read_all(inline_limit)
                .await
                .map_err(|e| RpcError::Io(e.to_string()))?;
            return Ok(StreamValue {
                stream: None,
                content: Some(content),
                length: Some(length),
                compression: None,
            });
        }
    }

    let id = processor.next_stream_id();
    let (start_tx, start_rx) = oneshot::channel();
    let stream = Arc::new(OutgoingStream {
        id,
        start_requested: AtomicBool::new(false),
        done: AtomicBool::new(false),
        remote_canceled: AtomicBool::new(false),
        cancel: processor.child_cancel_token(),
        start_tx: Mutex::new(Some(start_tx)),
        last_local_error: Mutex::new(None),
    });
    shared.outgoing_streams.insert(Arc::clone(&stream));

    let length = source.length();
    let compression = shared.options.default_compression.clone();
    let task_processor = processor.clone();
    tokio::spawn(async move {
        run_producer(task_processor, stream, source, start_rx).await;
    });

    tracing::debug!(stream_id = id, ?length, "outgoing stream registered");
    Ok(StreamValue {
        stream: Some(id),
        content: None,
        length,
        compression,
    })
}

// ---------------------------------------------------------------------------
// Producer task
// ---------------------------------------------------------------------------

async fn run_producer(
    processor: RpcProcessor,
    stream: Arc<OutgoingStream>,
    mut source: ByteSource,
    start_rx: oneshot::Receiver<()>,
) {
    // Nothing moves until the consumer asks for the stream.
    tokio::select! {
        _ = stream.cancel.cancelled() => {
            finish(&processor, &stream);
            return;
        }
        started = start_rx => {
            if started.is_err() {
                finish(&processor, &stream);
                return;
            }
        }
    }

    let chunk_len = processor
        .shared()
        .options
        .stream_chunk_length
        .min(processor.shared().options.max_content_length)
        .max(1);
    let known_length = source.length();
    let ack_timeout = processor.shared().options.default_request_timeout;
    let mut total: u64 = 0;

    loop {
        let data = tokio::select! {
            _ = stream.cancel.cancelled() => break,
            read = source.read_chunk(chunk_len) => match read {
                Ok(data) => data,
                Err(e) => {
                    let error = RpcError::Io(e.to_string());
                    stream.record_error(&error);
                    close_with_error(&processor, &stream, &error).await;
                    break;
                }
            },
        };
        total += data.len() as u64;

        if let Some(known) = known_length {
            if total > known {
                let error = RpcError::call(
                    drpc_protocol::error_codes::INTERNAL_ERROR,
                    format!("source produced {total} bytes, declared {known}"),
                );
                stream.record_error(&error);
                close_with_error(&processor, &stream, &error).await;
                break;
            }
        }

        let is_last = data.len() < chunk_len || known_length == Some(total);
        let message_id = processor.next_message_id();
        let ack = if is_last {
            None
        } else {
            match processor.shared().pending.insert(message_id) {
                Ok(rx) => Some(rx),
                Err(e) => {
                    stream.record_error(&e);
                    close_with_error(&processor, &stream, &e).await;
                    break;
                }
            }
        };

        let chunk = WireMessage::StreamChunk(StreamChunk {
            id: message_id,
            stream: stream.id,
            data: Some(data),
            is_last_chunk: is_last,
        });
        if let Err(e) = processor.enqueue_chunk_priority_wait(chunk).await {
            processor.shared().pending.forget(message_id);
            stream.record_error(&e);
            break;
        }
        if is_last {
            tracing::debug!(stream_id = stream.id, total, "outgoing stream complete");
            break;
        }

        // One chunk in flight: block until the consumer acks this one.
        let Some(ack) = ack else { break };
        let acked = tokio::select! {
            _ = stream.cancel.cancelled() => {
                processor.shared().pending.forget(message_id);
                break;
            }
            result = await_ack(ack, ack_timeout) => result,
        };
        match acked {
            Ok(()) => {}
            Err(e) => {
                processor.shared().pending.forget(message_id);
                stream.record_error(&e);
                if !stream.remote_canceled.load(Ordering::Acquire) {
                    close_with_error(&processor, &stream, &e).await;
                }
                break;
            }
        }
    }

    finish(&processor, &stream);
}

async fn await_ack(
    ack: tokio::sync::oneshot::Receiver<crate::requests::RequestResult>,
    timeout: Option<std::time::Duration>,
) -> Result<(), RpcError> {
    let outcome = match timeout {
        Some(limit) => match tokio::time::timeout(limit, ack).await {
            Ok(outcome) => outcome,
            Err(_) => return Err(RpcError::Timeout("chunk ack timeout".to_owned())),
        },
        None => ack.await,
    };
    match outcome {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(RpcError::Lifecycle("disposed")),
    }
}

async fn close_with_error(processor: &RpcProcessor, stream: &OutgoingStream, error: &RpcError) {
    tracing::warn!(stream_id = stream.id, error = %error, "outgoing stream failed");
    let message = WireMessage::LocalStreamClose(LocalStreamClose {
        id: stream.id,
        error: Some(error.to_error_info()),
    });
    if let Ok(done) = processor.enqueue_rpc_priority(message).await {
        let _ = done.await;
    }
}

/// Every exit path lands here: drop the table entry, mark done.  The source
/// is owned by the producer task and goes down with it.
fn finish(processor: &RpcProcessor, stream: &Arc<OutgoingStream>) {
    stream.done.store(true, Ordering::Release);
    processor.shared().outgoing_streams.remove(stream.id);
}

// ---------------------------------------------------------------------------
// Wire handling
// ---------------------------------------------------------------------------

/// Inbound `stream_start`: release the producer task.  A start for an
/// unknown or already-started stream is out of contract.
pub(crate) fn handle_start(processor: &RpcProcessor, message: StreamStart) -> Result<(), RpcError> {
    let Some(stream) = processor.shared().outgoing_streams.get(message.id) else {
        return Err(RpcError::Protocol(format!(
            "stream start for unknown stream {}",
            message.id
        )));
    };
    if stream.start_requested.swap(true, Ordering::AcqRel) {
        return Err(RpcError::Protocol(format!(
            "duplicate stream start for stream {}",
            message.id
        )));
    }
    if let Some(start_tx) = stream
        .start_tx
        .lock()
        .expect("outgoing stream poisoned")
        .take()
    {
        let _ = start_tx.send(());
    }
    Ok(())
}

/// Inbound `remote_stream_close`: the consumer walked away.  Cancels the
/// producer without a close message back.  Unknown ids are a benign race
/// with our own completion.
pub(crate) fn handle_consumer_close(processor: &RpcProcessor, stream_id: i64) {
    match processor.shared().outgoing_streams.get(stream_id) {
        Some(stream) => {
            tracing::debug!(stream_id, "consumer closed outgoing stream");
            stream.remote_canceled.store(true, Ordering::Release);
            stream.cancel.cancel();
        }
        None => {
            tracing::debug!(stream_id, "consumer close for unknown stream ignored");
        }
    }
}

/// Shutdown: cancel every producer task.
pub(crate) fn dispose_all(processor: &RpcProcessor) {
    for stream in processor.shared().outgoing_streams.drain() {
        stream.cancel.cancel();
    }
}
