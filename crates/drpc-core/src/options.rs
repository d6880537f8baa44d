//! Processor configuration.
//!
//! A plain struct tree with usable defaults; no file loading here, the
//! embedding application decides where the values come from.

use crate::api::ApiRegistry;
use crate::context::ServiceMap;
use crate::scopes::ScopeTypes;
use std::sync::Arc;
use std::time::Duration;

/// Capacity and worker count for one bounded pool.
#[derive(Debug, Clone, Copy)]
pub struct QueueOptions {
    /// Messages/calls admitted at once (queued plus executing).
    pub capacity: usize,
    /// Concurrent worker tasks draining the pool.
    pub workers: usize,
}

impl QueueOptions {
    pub fn new(capacity: usize, workers: usize) -> Self {
        Self { capacity, workers }
    }
}

/// Keep-alive timers.  Absent keep-alive means the link tolerates unbounded
/// silence.
#[derive(Debug, Clone, Copy)]
pub struct KeepAliveOptions {
    /// Outbound silence before a ping is sent; also the inbound-silence
    /// baseline for the peer timer.
    pub timeout: Duration,
    /// How long to wait for the pong; also the peer timer's grace on top of
    /// `timeout`.
    pub peer_timeout: Duration,
}

/// Outgoing wire priorities.  Higher drains first.
#[derive(Debug, Clone, Copy)]
pub struct PriorityOptions {
    pub rpc: u8,
    pub chunk: u8,
    pub event: u8,
}

impl Default for PriorityOptions {
    fn default() -> Self {
        // Chunk data yields to rpc traffic so bulk transfers cannot starve
        // calls; events outrank both so state fan-out stays prompt.
        Self {
            chunk: 1,
            rpc: 2,
            event: 3,
        }
    }
}

/// Everything a processor needs besides the stream itself.
#[derive(Clone)]
pub struct ProcessorOptions {
    /// Maximum framed message length the codec accepts, in bytes.
    pub max_message_length: usize,
    /// Version byte stamped on every outgoing frame.
    pub serializer_version: u8,
    /// Flush the transport after every written message.
    pub flush_stream: bool,
    /// Negotiated peer protocol version, used for method version forwarding.
    pub rpc_version: u32,
    /// Served APIs.
    pub apis: ApiRegistry,
    /// Template services seeded into every call's service map.
    pub default_services: ServiceMap,
    /// Treat any API error as fatal for the link.
    pub disconnect_on_api_error: bool,
    /// Tear the link down when an authorization predicate rejects a call.
    pub disconnect_on_unauthorized: bool,
    /// Invoked when authorization rejects a call, before the error response
    /// goes out.
    pub unauthorized_handler: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    /// Inbound message dispatch pool.
    pub incoming_queue: QueueOptions,
    /// Inbound call execution pool.
    pub call_queue: QueueOptions,
    /// Concurrent outgoing requests admitted before senders wait.
    pub outgoing_request_limit: usize,
    /// Outgoing priority queue capacity.
    pub outgoing_queue_capacity: usize,
    /// Default deadline applied to outgoing requests that do not bring their
    /// own; also inherited by stream chunk acks.  `None` waits indefinitely.
    pub default_request_timeout: Option<Duration>,
    /// Heartbeat configuration; `None` disables keep-alive.
    pub keep_alive: Option<KeepAliveOptions>,
    pub priorities: PriorityOptions,
    /// Whether scope traffic is accepted at all.
    pub use_scopes: bool,
    /// Stored scopes admitted per table.
    pub scope_limit: usize,
    /// Concurrent incoming streams admitted.
    pub max_stream_count: usize,
    /// Hard ceiling on a single chunk's payload, both directions.
    pub max_content_length: usize,
    /// Preferred outgoing chunk size; clamped to `max_content_length`.
    pub stream_chunk_length: usize,
    /// Streams with known length at or below this are sent as inline content
    /// and never enter the stream tables.
    pub inline_content_limit: usize,
    /// Compression tag stamped on outgoing stream values.  `None` is
    /// identity; this runtime ships no codecs, so any other inbound tag is
    /// refused as unsupported-by-configuration.
    pub default_compression: Option<String>,
    /// Whether an inbound `close` is a graceful shutdown (true) or a
    /// protocol violation (false).
    pub handle_close_message: bool,
    /// Registered scope type tags and hooks.
    pub scope_types: ScopeTypes,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            max_message_length: 4 * 1024 * 1024,
            serializer_version: drpc_protocol::SERIALIZER_VERSION,
            flush_stream: true,
            rpc_version: 1,
            apis: ApiRegistry::default(),
            default_services: ServiceMap::default(),
            disconnect_on_api_error: false,
            disconnect_on_unauthorized: false,
            unauthorized_handler: None,
            incoming_queue: QueueOptions::new(32, 4),
            call_queue: QueueOptions::new(16, 4),
            outgoing_request_limit: 64,
            outgoing_queue_capacity: 64,
            default_request_timeout: None,
            keep_alive: None,
            priorities: PriorityOptions::default(),
            use_scopes: true,
            scope_limit: 128,
            max_stream_count: 32,
            max_content_length: 64 * 1024,
            stream_chunk_length: 64 * 1024,
            inline_content_limit: 4 * 1024,
            default_compression: None,
            handle_close_message: true,
            scope_types: ScopeTypes::default(),
        }
    }
}

impl std::fmt::Debug for ProcessorOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorOptions")
            .field("max_message_length", &self.max_message_length)
            .field("rpc_version", &self.rpc_version)
            .field("incoming_queue", &self.incoming_queue)
            .field("call_queue", &self.call_queue)
            .field("outgoing_queue_capacity", &self.outgoing_queue_capacity)
            .field("keep_alive", &self.keep_alive)
            .field("use_scopes", &self.use_scopes)
            .field("scope_limit", &self.scope_limit)
            .field("max_stream_count", &self.max_stream_count)
            .field("max_content_length", &self.max_content_length)
            .field("handle_close_message", &self.handle_close_message)
            .finish_non_exhaustive()
    }
}
