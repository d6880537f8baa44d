//! Incoming streams: the consumer side of a chunked transfer.
//!
//! A stream value arriving in a parameter or return value materializes
//! either an in-memory buffer (inline content) or a table entry plus an
//! [`IncomingHandle`] the application reads from.  The first read sends
//! `stream_start`; every delivered chunk is acked so the producer keeps
//! exactly one chunk in flight.

use crate::error::RpcError;
use crate::processor::RpcProcessor;
use drpc_protocol::{
    LocalStreamClose, RemoteStreamClose, StreamChunk, StreamStart, StreamValue, WireMessage,
    error_codes,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;

type ChunkSender = mpsc::Sender<Result<Vec<u8>, RpcError>>;

// ---------------------------------------------------------------------------
// Table
// ---------------------------------------------------------------------------

pub(crate) struct IncomingStream {
    pub(crate) id: i64,
    started: AtomicBool,
    chunk_requested: AtomicBool,
    done: AtomicBool,
    canceled: AtomicBool,
    sink: Mutex<Option<ChunkSender>>,
    started_at: Mutex<Option<Instant>>,
    last_remote_error: Mutex<Option<RpcError>>,
}

impl IncomingStream {
    fn last_remote_error(&self) -> Option<RpcError> {
        self.last_remote_error
            .lock()
            .expect("incoming stream poisoned")
            .clone()
    }

    fn take_sink(&self) -> Option<ChunkSender> {
        self.sink.lock().expect("incoming stream poisoned").take()
    }

    fn sink(&self) -> Option<ChunkSender> {
        self.sink.lock().expect("incoming stream poisoned").clone()
    }
}

impl std::fmt::Debug for IncomingStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingStream")
            .field("id", &self.id)
            .field("started", &self.started.load(Ordering::Relaxed))
            .field("done", &self.done.load(Ordering::Relaxed))
            .field("canceled", &self.canceled.load(Ordering::Relaxed))
            .field(
                "started_at",
                &self.started_at.lock().expect("incoming stream poisoned"),
            )
            .field("last_remote_error", &self.last_remote_error())
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
pub(crate) struct IncomingStreams {
    table: Mutex<HashMap<i64, Arc<IncomingStream>>>,
}

impl IncomingStreams {
    fn insert(&self, stream: Arc<IncomingStream>, max: usize) -> Result<(), RpcError> {
        let mut table = self.table.lock().expect("incoming streams poisoned");
        if table.contains_key(&stream.id) {
            return Err(RpcError::Protocol(format!(
                "incoming stream id {} already registered",
                stream.id
            )));
        }
        if table.len() >= max {
            return Err(RpcError::capacity(
                error_codes::TOO_MANY_STREAMS,
                format!("incoming stream limit of {max} reached"),
            ));
        }
        table.insert(stream.id, stream);
        Ok(())
    }

    fn get(&self, id: i64) -> Option<Arc<IncomingStream>> {
        self.table
            .lock()
            .expect("incoming streams poisoned")
            .get(&id)
            .cloned()
    }

    fn remove(&self, id: i64) -> Option<Arc<IncomingStream>> {
        self.table
            .lock()
            .expect("incoming streams poisoned")
            .remove(&id)
    }

    pub(crate) fn drain(&self) -> Vec<Arc<IncomingStream>> {
        let mut table = self.table.lock().expect("incoming streams poisoned");
        table.drain().map(|(_, s)| s).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.table.lock().expect("incoming streams poisoned").len()
    }
}

// ---------------------------------------------------------------------------
// Consumer handle
// ---------------------------------------------------------------------------

enum Mode {
    /// Inline content; never touched the stream table.
    Inline(Option<Vec<u8>>),
    Streamed {
        processor: RpcProcessor,
        id: i64,
        rx: mpsc::Receiver<Result<Vec<u8>, RpcError>>,
        started: bool,
        finished: bool,
    },
}

/// Read side of a received stream value.
///
/// Dropping an unfinished handle cancels the transfer (the producer gets a
/// `remote_stream_close`); prefer [`IncomingHandle::close`] to do that
/// deliberately.
pub struct IncomingHandle {
    mode: Mode,
    length: Option<u64>,
}

impl IncomingHandle {
    /// Declared total length, when the producer knew it.
    pub fn length(&self) -> Option<u64> {
        self.length
    }

    /// True when the value arrived inline and involves no chunk protocol.
    pub fn is_inline(&self) -> bool {
        matches!(self.mode, Mode::Inline(_))
    }

    /// Next chunk, or `None` at end of stream.  The first call triggers the
    /// `stream_start` handshake.
    pub async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>, RpcError> {
        match &mut self.mode {
            Mode::Inline(content) => Ok(content.take()),
            Mode::Streamed {
                processor,
                id,
                rx,
                started,
                finished,
            } => {
                if *finished {
                    return Ok(None);
                }
                if !*started {
                    begin(processor, *id).await?;
                    *started = true;
                }
                match rx.recv().await {
                    Some(Ok(data)) => Ok(Some(data)),
                    Some(Err(e)) => {
                        *finished = true;
                        Err(e)
                    }
                    None => {
                        *finished = true;
                        Ok(None)
                    }
                }
            }
        }
    }

    /// Read everything to a buffer.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>, RpcError> {
        let mut out = Vec::new();
        while let Some(chunk) = self.read_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    /// Stop consuming: tells the producer to stop and removes the table
    /// entry.  A no-op for finished or inline handles.
    pub async fn close(mut self) {
        if let Mode::Streamed {
            processor,
            id,
            finished,
            ..
        } = &mut self.mode
        {
            if !*finished {
                *finished = true;
                cancel(processor, *id, true).await;
            }
        }
    }
}

impl Drop for IncomingHandle {
    fn drop(&mut self) {
        if let Mode::Streamed {
            processor,
            id,
            finished,
            ..
        } = &mut self.mode
        {
            if !*finished {
                // Best-effort: the async close path is preferred.
                let removed = processor.shared().incoming_streams.remove(*id);
                if let Some(stream) = removed {
                    stream.canceled.store(true, Ordering::Release);
                }
                processor.try_enqueue_rpc_priority(WireMessage::RemoteStreamClose(
                    RemoteStreamClose { id: *id },
                ));
            }
        }
    }
}

impl std::fmt::Debug for IncomingHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingHandle")
            .field("inline", &self.is_inline())
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Materialization and wire handling
// ---------------------------------------------------------------------------

/// Turn a received stream value into a readable handle.
///
/// Inline content bypasses the table entirely; chunked values claim a table
/// slot keyed by the peer-assigned id.
pub(crate) fn materialize(
    processor: &RpcProcessor,
    value: &StreamValue,
) -> Result<IncomingHandle, RpcError> {
    if let Some(tag) = &value.compression {
        // No codecs are shipped; a tagged stream cannot be decoded here.
        return Err(RpcError::call(
            error_codes::ARGUMENT_ERROR,
            format!("unsupported compression: {tag}"),
        ));
    }
    if let Some(content) = &value.content {
        return Ok(IncomingHandle {
            length: value.length.or(Some(content.len() as u64)),
            mode: Mode::Inline(Some(content.clone())),
        });
    }
    let id = value.stream.ok_or_else(|| {
        RpcError::Protocol("stream value carries neither content nor a stream id".to_owned())
    })?;

    let (tx, rx) = mpsc::channel(1);
    let stream = Arc::new(IncomingStream {
        id,
        started: AtomicBool::new(false),
        chunk_requested: AtomicBool::new(false),
        done: AtomicBool::new(false),
        canceled: AtomicBool::new(false),
        sink: Mutex::new(Some(tx)),
        started_at: Mutex::new(None),
        last_remote_error: Mutex::new(None),
    });
    processor
        .shared()
        .incoming_streams
        .insert(stream, processor.shared().options.max_stream_count)?;
    tracing::debug!(stream_id = id, length = value.length, "incoming stream registered");
    Ok(IncomingHandle {
        length: value.length,
        mode: Mode::Streamed {
            processor: processor.clone(),
            id,
            rx,
            started: false,
            finished: false,
        },
    })
}

/// First read on the handle: ask the producer to start sending.
async fn begin(processor: &RpcProcessor, id: i64) -> Result<(), RpcError> {
    let stream = processor
        .shared()
        .incoming_streams
        .get(id)
        .ok_or(RpcError::Lifecycle("disposed"))?;
    if stream.started.swap(true, Ordering::AcqRel) {
        return Ok(());
    }
    *stream.started_at.lock().expect("incoming stream poisoned") = Some(Instant::now());
    stream.chunk_requested.store(true, Ordering::Release);
    processor
        .enqueue_rpc_priority_wait(WireMessage::StreamStart(StreamStart { id }))
        .await
}

/// Consumer-side cancellation.
async fn cancel(processor: &RpcProcessor, id: i64, notify_peer: bool) {
    if let Some(stream) = processor.shared().incoming_streams.remove(id) {
        stream.canceled.store(true, Ordering::Release);
        stream.take_sink();
    }
    if notify_peer {
        let message = WireMessage::RemoteStreamClose(RemoteStreamClose { id });
        if let Ok(done) = processor.enqueue_rpc_priority(message).await {
            let _ = done.await;
        }
    }
}

/// Inbound `stream_chunk`.  Flow violations are protocol-fatal; a consumer
/// that went away mid-transfer just cancels the stream.
pub(crate) async fn handle_chunk(
    processor: &RpcProcessor,
    chunk: StreamChunk,
) -> Result<(), RpcError> {
    let shared = processor.shared();
    let Some(stream) = shared.incoming_streams.get(chunk.stream) else {
        // Our close and the producer's chunk can cross on the wire; a chunk
        // for a stream we no longer track is that race, not an attack.
        tracing::debug!(stream_id = chunk.stream, "chunk for closed stream dropped");
        return Ok(());
    };
    if !stream.started.load(Ordering::Acquire)
        || stream.done.load(Ordering::Acquire)
        || !stream.chunk_requested.swap(false, Ordering::AcqRel)
    {
        return Err(RpcError::Protocol(format!(
            "unexpected chunk for stream {}",
            chunk.stream
        )));
    }
    let data = chunk.data.unwrap_or_default();
    if data.len() > shared.options.max_content_length {
        return Err(RpcError::Protocol(format!(
            "chunk of {} bytes exceeds maximum of {} bytes",
            data.len(),
            shared.options.max_content_length
        )));
    }

    let Some(sink) = stream.sink() else {
        return Ok(());
    };
    if sink.send(Ok(data)).await.is_err() {
        // Consumer dropped the handle; stop the producer.
        tracing::debug!(stream_id = chunk.stream, "consumer gone, canceling stream");
        cancel(processor, chunk.stream, true).await;
        return Ok(());
    }

    if chunk.is_last_chunk {
        stream.done.store(true, Ordering::Release);
        stream.take_sink();
        shared.incoming_streams.remove(chunk.stream);
        tracing::debug!(stream_id = chunk.stream, "incoming stream complete");
    } else {
        // Re-arm before acking so the next chunk finds the flag set.
        stream.chunk_requested.store(true, Ordering::Release);
        processor.send_response(chunk.id, None).await;
    }
    Ok(())
}

/// Inbound `local_stream_close`: the producer failed.  Store the error and
/// signal EOF with it.
pub(crate) async fn handle_producer_close(processor: &RpcProcessor, message: LocalStreamClose) {
    let Some(stream) = processor.shared().incoming_streams.remove(message.id) else {
        tracing::debug!(stream_id = message.id, "producer close for unknown stream ignored");
        return;
    };
    let error = message
        .error
        .map(RpcError::from_error_info)
        .unwrap_or(RpcError::Canceled);
    *stream
        .last_remote_error
        .lock()
        .expect("incoming stream poisoned") = Some(error.clone());
    stream.done.store(true, Ordering::Release);
    if let Some(sink) = stream.take_sink() {
        let _ = sink.send(Err(error)).await;
    }
}

/// Shutdown: fail every open incoming stream locally.
pub(crate) fn dispose_all(processor: &RpcProcessor, error: &RpcError) {
    for stream in processor.shared().incoming_streams.drain() {
        stream.done.store(true, Ordering::Release);
        if let Some(sink) = stream.take_sink() {
            let error = error.clone();
            tokio::spawn(async move {
                let _ = sink.send(Err(error)).await;
            });
        }
    }
}
