//! The RPC processor: one state machine bound to one duplex stream.
//!
//! A single read loop demultiplexes inbound messages, pre-handling the
//! cheap kinds (ping/pong/close) and fanning the rest into a bounded worker
//! pool.  Outbound traffic funnels through the priority queue whose sole
//! consumer owns the write half.  Registries correlate responses to pending
//! requests, track calls in flight, and hold the scope and stream tables.
//! Shutdown, graceful or exceptional, cascades through all of them in a
//! fixed order.

use crate::calls::{self, CallRegistry, ExecutableCall};
use crate::error::RpcError;
use crate::events::{self, EventRegistry};
use crate::heartbeat;
use crate::options::ProcessorOptions;
use crate::outgoing::{OutgoingQueue, WriteDone};
use crate::requests::PendingRequests;
use crate::scopes::{self, LocalScope, RemoteScope, ScopeBuilder, ScopeTable};
use crate::streams::incoming::{self as incoming_streams, IncomingHandle, IncomingStreams};
use crate::streams::outgoing::{self as outgoing_streams, OutgoingStreams};
use crate::streams::ByteSource;
use drpc_protocol::{
    Cancel, Close, Event, MessageReader, MessageWriter, Pong, Request, ScopeRegistration,
    ScopeValue, StreamValue, WireMessage,
};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{Semaphore, mpsc, watch};
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Lifecycle and info
// ---------------------------------------------------------------------------

/// Where the processor is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    /// Workers running, traffic flowing.
    Running,
    /// Stop initiated (clean or exceptional); teardown in progress.
    Stopped,
    /// Teardown finished; every registry is empty and the stream is closed.
    Disposed,
}

/// Point-in-time snapshot for embedding applications and tests.
#[derive(Debug, Clone)]
pub struct ProcessorInfo {
    pub state: ProcessorState,
    pub pending_requests: usize,
    pub active_calls: usize,
    pub incoming_streams: usize,
    pub outgoing_streams: usize,
    pub local_scopes: usize,
    pub remote_scopes: usize,
    pub registered_events: usize,
    pub last_error: Option<RpcError>,
}

/// Per-request knobs for [`RpcProcessor::send_request_with`].
#[derive(Clone)]
pub struct RequestOptions {
    /// Overrides the processor-wide default request timeout.
    pub timeout: Option<Duration>,
    /// Caller-owned cancellation; aborting sends a best-effort `cancel`.
    pub cancel: Option<CancellationToken>,
    /// Ask the peer to ship the produced value back.
    pub wants_return_value: bool,
    /// Ask the peer to answer at all; `false` makes the call one-way.
    pub wants_response: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            cancel: None,
            wants_return_value: true,
            wants_response: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

pub(crate) struct Shared {
    pub(crate) options: ProcessorOptions,
    /// Processor-wide cancellation; fans out to every worker and child.
    pub(crate) cancel: CancellationToken,
    /// Parent of every per-call token.
    pub(crate) calls_cancel: CancellationToken,
    state: Mutex<ProcessorState>,
    last_error: Mutex<Option<RpcError>>,
    disposing: AtomicBool,
    next_message_id: AtomicI64,
    next_scope_id: AtomicI64,
    next_stream_id: AtomicI64,
    pub(crate) outgoing: OutgoingQueue,
    pub(crate) pending: PendingRequests,
    request_slots: Arc<Semaphore>,
    pub(crate) calls: CallRegistry,
    pub(crate) call_slots: Arc<Semaphore>,
    pub(crate) call_tx: mpsc::UnboundedSender<ExecutableCall>,
    incoming_tx: mpsc::Sender<WireMessage>,
    pub(crate) events: EventRegistry,
    pub(crate) incoming_streams: IncomingStreams,
    pub(crate) outgoing_streams: OutgoingStreams,
    pub(crate) local_scopes: ScopeTable<LocalScope>,
    pub(crate) remote_scopes: ScopeTable<RemoteScope>,
    last_sent: Mutex<Instant>,
    last_received: Mutex<Instant>,
    disposed_tx: watch::Sender<bool>,
}

/// Handle to a running processor.  Cheap to clone; the last clone dropping
/// does not stop the workers; call [`RpcProcessor::close`] for that.
#[derive(Clone)]
pub struct RpcProcessor {
    shared: Arc<Shared>,
}

impl RpcProcessor {
    // -----------------------------------------------------------------------
    // Construction
    // -----------------------------------------------------------------------

    /// Bind a processor to a duplex stream and start its workers.
    pub fn start<S>(stream: S, options: ProcessorOptions) -> RpcProcessor
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let reader = MessageReader::new(read_half, options.max_message_length);
        let writer = MessageWriter::new(
            write_half,
            options.max_message_length,
            options.flush_stream,
        )
        .with_serializer_version(options.serializer_version);

        let (incoming_tx, incoming_rx) = mpsc::channel(options.incoming_queue.capacity.max(1));
        let (call_tx, call_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let calls_cancel = cancel.child_token();
        let now = Instant::now();
        let (disposed_tx, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            request_slots: Arc::new(Semaphore::new(options.outgoing_request_limit.max(1))),
            call_slots: Arc::new(Semaphore::new(options.call_queue.capacity.max(1))),
            outgoing: OutgoingQueue::new(options.outgoing_queue_capacity.max(1)),
            pending: PendingRequests::default(),
            calls: CallRegistry::default(),
            events: EventRegistry::default(),
            incoming_streams: IncomingStreams::default(),
            outgoing_streams: OutgoingStreams::default(),
            local_scopes: ScopeTable::new(options.scope_limit.max(1)),
            remote_scopes: ScopeTable::new(options.scope_limit.max(1)),
            state: Mutex::new(ProcessorState::Running),
            last_error: Mutex::new(None),
            disposing: AtomicBool::new(false),
            next_message_id: AtomicI64::new(1),
            next_scope_id: AtomicI64::new(1),
            next_stream_id: AtomicI64::new(1),
            last_sent: Mutex::new(now),
            last_received: Mutex::new(now),
            cancel,
            calls_cancel,
            call_tx,
            incoming_tx,
            disposed_tx,
            options,
        });
        let processor = RpcProcessor { shared };

        tokio::spawn(write_loop(processor.clone(), writer));
        tokio::spawn(read_loop(processor.clone(), reader));

        let incoming_rx = Arc::new(tokio::sync::Mutex::new(incoming_rx));
        for _ in 0..processor.shared.options.incoming_queue.workers.max(1) {
            tokio::spawn(incoming_worker_loop(
                processor.clone(),
                Arc::clone(&incoming_rx),
            ));
        }

        let call_rx = Arc::new(tokio::sync::Mutex::new(call_rx));
        for _ in 0..processor.shared.options.call_queue.workers.max(1) {
            tokio::spawn(calls::worker_loop(processor.clone(), Arc::clone(&call_rx)));
        }

        if let Some(keep_alive) = processor.shared.options.keep_alive {
            tokio::spawn(heartbeat::run(processor.clone(), keep_alive));
        }

        tracing::info!(options = ?processor.shared.options, "rpc processor started");
        processor
    }

    // -----------------------------------------------------------------------
    // Requests
    // -----------------------------------------------------------------------

    /// Invoke a method at the peer and await its return value.
    pub async fn send_request(
        &self,
        api: Option<&str>,
        method: &str,
        parameters: Vec<serde_json::Value>,
    ) -> Result<Option<serde_json::Value>, RpcError> {
        self.send_request_with(api, method, parameters, RequestOptions::default())
            .await
    }

    /// Invoke a method at the peer, await completion, drop the value.
    pub async fn send_void_request(
        &self,
        api: Option<&str>,
        method: &str,
        parameters: Vec<serde_json::Value>,
    ) -> Result<(), RpcError> {
        self.send_request_with(
            api,
            method,
            parameters,
            RequestOptions {
                wants_return_value: false,
                ..RequestOptions::default()
            },
        )
        .await
        .map(|_| ())
    }

    /// One-way call: no response, no correlation, no completion signal
    /// beyond the message having been written.
    pub async fn notify(
        &self,
        api: Option<&str>,
        method: &str,
        parameters: Vec<serde_json::Value>,
    ) -> Result<(), RpcError> {
        self.send_request_with(
            api,
            method,
            parameters,
            RequestOptions {
                wants_return_value: false,
                wants_response: false,
                ..RequestOptions::default()
            },
        )
        .await
        .map(|_| ())
    }

    pub async fn send_request_with(
        &self,
        api: Option<&str>,
        method: &str,
        parameters: Vec<serde_json::Value>,
        options: RequestOptions,
    ) -> Result<Option<serde_json::Value>, RpcError> {
        self.ensure_running()?;
        let _slot = Arc::clone(&self.shared.request_slots)
            .acquire_owned()
            .await
            .map_err(|_| RpcError::Lifecycle("stopped"))?;

        let id = self.next_message_id();
        let message = WireMessage::Request(Request {
            id,
            api: api.map(ToOwned::to_owned),
            method: method.to_owned(),
            parameters,
            wants_return_value: options.wants_return_value,
            wants_response: options.wants_response,
        });

        if !options.wants_response {
            self.enqueue_rpc_priority_wait(message).await?;
            return Ok(None);
        }

        let ack = self.shared.pending.insert(id)?;
        if let Err(e) = self.enqueue_rpc_priority_wait(message).await {
            self.shared.pending.forget(id);
            return Err(e);
        }
        tracing::debug!(id, method, "request sent");

        let timeout = options
            .timeout
            .or(self.shared.options.default_request_timeout);
        let deadline: std::pin::Pin<Box<dyn Future<Output = ()> + Send>> = match timeout {
            Some(limit) => Box::pin(tokio::time::sleep(limit)),
            None => Box::pin(std::future::pending()),
        };
        let caller_cancel: std::pin::Pin<Box<dyn Future<Output = ()> + Send>> =
            match options.cancel.clone() {
                Some(token) => Box::pin(async move { token.cancelled().await }),
                None => Box::pin(std::future::pending()),
            };

        tokio::select! {
            outcome = ack => match outcome {
                Ok(result) => result,
                Err(_) => Err(self.terminal_error()),
            },
            _ = deadline => {
                self.abandon_request(id).await;
                Err(RpcError::Timeout(format!("request {id} timed out")))
            }
            _ = caller_cancel => {
                self.abandon_request(id).await;
                Err(RpcError::Canceled)
            }
        }
    }

    /// Drop the pending entry and tell the peer to stop, best-effort.  The
    /// peer may have already answered; both outcomes are benign.
    async fn abandon_request(&self, id: i64) {
        self.shared.pending.forget(id);
        let message = WireMessage::Cancel(Cancel { id });
        if let Ok(done) = self.enqueue_rpc_priority(message).await {
            let _ = done.await;
        }
    }

    /// Manual keep-alive probe; works without configured heartbeat.
    pub async fn ping(&self, timeout: Duration) -> Result<(), RpcError> {
        self.ensure_running()?;
        heartbeat::ping(self, timeout).await
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    /// Processor-wide event table.
    pub fn events(&self) -> &EventRegistry {
        &self.shared.events
    }

    /// Raise an event at the peer.  With `wait`, completion mirrors the
    /// peer handler's outcome; without, it means "written to the wire".
    pub async fn raise_event(
        &self,
        name: &str,
        arguments: Option<serde_json::Value>,
        wait: bool,
    ) -> Result<(), RpcError> {
        self.ensure_running()?;
        if !wait {
            let message = WireMessage::Event(Event {
                id: None,
                name: name.to_owned(),
                arguments,
                waiting: false,
            });
            return self.enqueue_event_priority_wait(message).await;
        }

        let id = self.next_message_id();
        let ack = self.shared.pending.insert(id)?;
        let message = WireMessage::Event(Event {
            id: Some(id),
            name: name.to_owned(),
            arguments,
            waiting: true,
        });
        if let Err(e) = self.enqueue_event_priority_wait(message).await {
            self.shared.pending.forget(id);
            return Err(e);
        }
        self.await_ack(id, ack).await
    }

    /// Raise an event addressed to one scope at the peer.
    pub(crate) async fn raise_scope_event(
        &self,
        scope_id: i64,
        name: &str,
        arguments: Option<serde_json::Value>,
        wait: bool,
    ) -> Result<(), RpcError> {
        self.ensure_running()?;
        if !wait {
            let message = WireMessage::ScopeEvent(drpc_protocol::ScopeEvent {
                scope_id,
                id: None,
                name: name.to_owned(),
                arguments,
                waiting: false,
            });
            return self.enqueue_event_priority_wait(message).await;
        }

        let id = self.next_message_id();
        let ack = self.shared.pending.insert(id)?;
        let message = WireMessage::ScopeEvent(drpc_protocol::ScopeEvent {
            scope_id,
            id: Some(id),
            name: name.to_owned(),
            arguments,
            waiting: true,
        });
        if let Err(e) = self.enqueue_event_priority_wait(message).await {
            self.shared.pending.forget(id);
            return Err(e);
        }
        self.await_ack(id, ack).await
    }

    async fn await_ack(
        &self,
        id: i64,
        ack: tokio::sync::oneshot::Receiver<crate::requests::RequestResult>,
    ) -> Result<(), RpcError> {
        let timeout = self.shared.options.default_request_timeout;
        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, ack).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.shared.pending.forget(id);
                    return Err(RpcError::Timeout(format!("ack for {id} timed out")));
                }
            },
            None => ack.await,
        };
        match outcome {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(self.terminal_error()),
        }
    }

    // -----------------------------------------------------------------------
    // Scopes
    // -----------------------------------------------------------------------

    /// Create (and, if flagged, store) a local scope.
    pub fn register_scope(&self, builder: ScopeBuilder) -> Result<Arc<LocalScope>, RpcError> {
        if !self.shared.options.use_scopes {
            return Err(RpcError::Lifecycle("scopes are disabled"));
        }
        let replace = builder.replace_existing;
        let stored = builder.is_stored;
        let id = self.next_scope_id();
        let scope = LocalScope::from_builder(id, builder, self.downgrade());
        if stored {
            let replaced = self.shared.local_scopes.insert(Arc::clone(&scope), replace)?;
            if let Some(replaced) = replaced {
                tokio::spawn(async move { replaced.discard().await });
            }
        }
        tracing::debug!(scope_id = id, scope_type = %scope.scope_type(), stored, "local scope registered");
        Ok(scope)
    }

    /// Announce a stored local scope to the peer and await its ack.
    pub async fn announce_scope(&self, scope: &Arc<LocalScope>) -> Result<(), RpcError> {
        self.ensure_running()?;
        if !scope.is_stored() {
            return Err(RpcError::Protocol(
                "scope registration for a scope that would not be stored".to_owned(),
            ));
        }
        let id = self.next_message_id();
        let ack = self.shared.pending.insert(id)?;
        let message = WireMessage::ScopeRegistration(ScopeRegistration {
            id,
            scope: scope.to_scope_value(),
        });
        if let Err(e) = self.enqueue_rpc_priority_wait(message).await {
            self.shared.pending.forget(id);
            return Err(e);
        }
        self.await_ack(id, ack).await
    }

    pub fn local_scope(&self, id: i64) -> Option<Arc<LocalScope>> {
        self.shared.local_scopes.get(id)
    }

    pub fn local_scope_by_key(&self, key: &str) -> Option<Arc<LocalScope>> {
        self.shared.local_scopes.get_by_key(key)
    }

    pub fn remote_scope(&self, id: i64) -> Option<Arc<RemoteScope>> {
        self.shared.remote_scopes.get(id)
    }

    pub fn remote_scope_by_key(&self, key: &str) -> Option<Arc<RemoteScope>> {
        self.shared.remote_scopes.get_by_key(key)
    }

    /// Materialize a remote scope from a scope value found in a response.
    pub fn remote_scope_from_value(
        &self,
        value: &serde_json::Value,
    ) -> Result<Arc<RemoteScope>, RpcError> {
        let scope_value = ScopeValue::from_value(value).ok_or_else(|| {
            RpcError::Protocol("value does not carry a scope record".to_owned())
        })?;
        scopes::materialize_remote_scope(self, &scope_value)
    }

    // -----------------------------------------------------------------------
    // Streams
    // -----------------------------------------------------------------------

    /// Register an outbound byte source and get the parameter value to send.
    pub async fn stream_value(&self, source: ByteSource) -> Result<serde_json::Value, RpcError> {
        self.ensure_running()?;
        let value = outgoing_streams::create_value(self, source).await?;
        Ok(value.into_value())
    }

    /// Materialize the read side of a stream value found in a response.
    pub fn incoming_stream(&self, value: &serde_json::Value) -> Result<IncomingHandle, RpcError> {
        let stream_value = StreamValue::from_value(value).ok_or_else(|| {
            RpcError::Protocol("value does not carry a stream record".to_owned())
        })?;
        incoming_streams::materialize(self, &stream_value)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    pub fn state(&self) -> ProcessorState {
        *self.shared.state.lock().expect("processor state poisoned")
    }

    pub fn last_error(&self) -> Option<RpcError> {
        self.shared
            .last_error
            .lock()
            .expect("processor error poisoned")
            .clone()
    }

    pub fn info(&self) -> ProcessorInfo {
        ProcessorInfo {
            state: self.state(),
            pending_requests: self.shared.pending.len(),
            active_calls: self.shared.calls.len(),
            incoming_streams: self.shared.incoming_streams.len(),
            outgoing_streams: self.shared.outgoing_streams.len(),
            local_scopes: self.shared.local_scopes.len(),
            remote_scopes: self.shared.remote_scopes.len(),
            registered_events: self.shared.events.len(),
            last_error: self.last_error(),
        }
    }

    /// Graceful shutdown: announce `close` to the peer, then dispose.
    pub async fn close(&self) {
        {
            let mut state = self.shared.state.lock().expect("processor state poisoned");
            if *state != ProcessorState::Running {
                return;
            }
            *state = ProcessorState::Stopped;
        }
        tracing::info!("processor closing");
        if let Ok(done) = self
            .shared
            .outgoing
            .enqueue(self.shared.options.priorities.event, WireMessage::Close(Close {}))
            .await
        {
            let _ = done.await;
        }
        self.dispose().await;
    }

    /// Terminal error path.  Idempotent: the first error wins, teardown
    /// runs once, detached.
    pub(crate) fn stop_exceptional(&self, error: RpcError) {
        {
            let mut state = self.shared.state.lock().expect("processor state poisoned");
            if *state != ProcessorState::Running {
                return;
            }
            *state = ProcessorState::Stopped;
            *self
                .shared
                .last_error
                .lock()
                .expect("processor error poisoned") = Some(error.clone());
        }
        tracing::error!(error = %error, "processor stopped exceptionally");
        let this = self.clone();
        tokio::spawn(async move { this.dispose().await });
    }

    /// The dispose cascade.  Order matters: workers observe cancellation
    /// before the resources they hold are torn down.
    pub async fn dispose(&self) {
        if self.shared.disposing.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let mut state = self.shared.state.lock().expect("processor state poisoned");
            if *state == ProcessorState::Running {
                *state = ProcessorState::Stopped;
            }
        }

        // Read loop, worker pools, heartbeat, producer tasks.
        self.shared.cancel.cancel();
        self.shared.calls.cancel_all();
        self.shared.request_slots.close();

        // Outgoing queue: no new entries, writer drains what is left and
        // then closes the write half.
        self.shared.outgoing.close();

        // Pending requests observe the terminal error.
        let terminal = self.terminal_error();
        self.shared.pending.fail_all(&terminal);

        // Scopes next: discard notifications are best-effort by now.
        for scope in self.shared.local_scopes.drain() {
            scope.dispose_on_shutdown();
        }
        for scope in self.shared.remote_scopes.drain() {
            scope.dispose();
        }

        // Streams last among the registries.
        incoming_streams::dispose_all(self, &terminal);
        outgoing_streams::dispose_all(self);

        {
            let mut state = self.shared.state.lock().expect("processor state poisoned");
            *state = ProcessorState::Disposed;
        }
        let _ = self.shared.disposed_tx.send(true);
        tracing::info!("processor disposed");
    }

    /// Resolves when the dispose cascade has finished.
    pub async fn closed(&self) {
        let mut rx = self.shared.disposed_tx.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Flip Running → Stopped without recording an error.
    pub(crate) fn mark_stopped(&self) {
        let mut state = self.shared.state.lock().expect("processor state poisoned");
        if *state == ProcessorState::Running {
            *state = ProcessorState::Stopped;
        }
    }

    fn ensure_running(&self) -> Result<(), RpcError> {
        match self.state() {
            ProcessorState::Running => Ok(()),
            ProcessorState::Stopped => Err(RpcError::Lifecycle("stopping")),
            ProcessorState::Disposed => Err(RpcError::Lifecycle("disposed")),
        }
    }

    fn terminal_error(&self) -> RpcError {
        self.last_error().unwrap_or(RpcError::Lifecycle("disposed"))
    }

    // -----------------------------------------------------------------------
    // Internals shared with the submodules
    // -----------------------------------------------------------------------

    pub(crate) fn shared(&self) -> &Shared {
        &self.shared
    }

    pub(crate) fn from_shared(shared: Arc<Shared>) -> RpcProcessor {
        RpcProcessor { shared }
    }

    pub(crate) fn downgrade(&self) -> Weak<Shared> {
        Arc::downgrade(&self.shared)
    }

    pub(crate) fn child_cancel_token(&self) -> CancellationToken {
        self.shared.cancel.child_token()
    }

    pub(crate) fn next_message_id(&self) -> i64 {
        self.shared.next_message_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn next_scope_id(&self) -> i64 {
        self.shared.next_scope_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn next_stream_id(&self) -> i64 {
        self.shared.next_stream_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn last_sent(&self) -> Instant {
        *self.shared.last_sent.lock().expect("timestamp poisoned")
    }

    pub(crate) fn last_received(&self) -> Instant {
        *self.shared.last_received.lock().expect("timestamp poisoned")
    }

    fn note_sent(&self) {
        *self.shared.last_sent.lock().expect("timestamp poisoned") = Instant::now();
    }

    fn note_received(&self) {
        *self.shared.last_received.lock().expect("timestamp poisoned") = Instant::now();
    }

    pub(crate) async fn enqueue_rpc_priority(
        &self,
        message: WireMessage,
    ) -> Result<WriteDone, RpcError> {
        self.shared
            .outgoing
            .enqueue(self.shared.options.priorities.rpc, message)
            .await
    }

    pub(crate) async fn enqueue_rpc_priority_wait(
        &self,
        message: WireMessage,
    ) -> Result<(), RpcError> {
        let done = self.enqueue_rpc_priority(message).await?;
        done.await.map_err(|_| RpcError::Lifecycle("stopped"))?
    }

    pub(crate) async fn enqueue_chunk_priority_wait(
        &self,
        message: WireMessage,
    ) -> Result<(), RpcError> {
        let done = self
            .shared
            .outgoing
            .enqueue(self.shared.options.priorities.chunk, message)
            .await?;
        done.await.map_err(|_| RpcError::Lifecycle("stopped"))?
    }

    pub(crate) async fn enqueue_event_priority(
        &self,
        message: WireMessage,
    ) -> Result<WriteDone, RpcError> {
        self.shared
            .outgoing
            .enqueue(self.shared.options.priorities.event, message)
            .await
    }

    pub(crate) async fn enqueue_event_priority_wait(
        &self,
        message: WireMessage,
    ) -> Result<(), RpcError> {
        let done = self.enqueue_event_priority(message).await?;
        done.await.map_err(|_| RpcError::Lifecycle("stopped"))?
    }

    pub(crate) fn try_enqueue_rpc_priority(&self, message: WireMessage) -> bool {
        self.shared
            .outgoing
            .try_enqueue(self.shared.options.priorities.rpc, message)
    }

    pub(crate) fn try_enqueue_event_priority(&self, message: WireMessage) -> bool {
        self.shared
            .outgoing
            .try_enqueue(self.shared.options.priorities.event, message)
    }

    pub(crate) async fn send_response(&self, id: i64, return_value: Option<serde_json::Value>) {
        let message = WireMessage::Response(drpc_protocol::Response { id, return_value });
        if self.enqueue_rpc_priority(message).await.is_err() {
            tracing::debug!(id, "response dropped, processor stopping");
        }
    }

    pub(crate) async fn send_error_response(&self, id: i64, error: &RpcError) {
        let message = WireMessage::ErrorResponse(drpc_protocol::ErrorResponse {
            id,
            error: error.to_error_info(),
        });
        if self.enqueue_rpc_priority(message).await.is_err() {
            tracing::debug!(id, "error response dropped, processor stopping");
        }
    }
}

impl std::fmt::Debug for RpcProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcProcessor")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Writer task
// ---------------------------------------------------------------------------

async fn write_loop<S>(processor: RpcProcessor, mut writer: MessageWriter<WriteHalf<S>>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    while let Some(mut entry) = processor.shared.outgoing.next().await {
        let kind = entry.message.kind_name();
        match writer.write_message(&entry.message).await {
            Ok(()) => {
                processor.note_sent();
                tracing::trace!(kind, "message written");
                entry.complete(Ok(()));
            }
            Err(e) => {
                let error: RpcError = e.into();
                entry.complete(Err(error.clone()));
                processor.shared.outgoing.fail_queued(&error);
                processor.stop_exceptional(error);
                return;
            }
        }
    }
    // Queue closed cleanly: flush and signal EOF to the peer.
    let _ = writer.shutdown().await;
}

// ---------------------------------------------------------------------------
// Read loop
// ---------------------------------------------------------------------------

async fn read_loop<S>(processor: RpcProcessor, mut reader: MessageReader<ReadHalf<S>>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let cancel = processor.shared.cancel.clone();
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => return,
            message = reader.read_message() => message,
        };
        let message = match message {
            Ok(message) => message,
            Err(e) if e.is_clean_eof() => {
                if processor.state() == ProcessorState::Running {
                    processor.stop_exceptional(RpcError::Protocol(
                        "peer closed the stream without a close message".to_owned(),
                    ));
                }
                return;
            }
            Err(e) => {
                processor.stop_exceptional(e.into());
                return;
            }
        };

        processor.note_received();
        tracing::trace!(kind = message.kind_name(), "message received");

        match pre_handle(&processor, message).await {
            Ok(None) => {}
            Ok(Some(message)) => {
                // Backpressure: with keep-alive a stalled queue is fatal,
                // without it the read loop simply waits for room.
                if processor.shared.options.keep_alive.is_some() {
                    if let Err(e) = processor.shared.incoming_tx.try_send(message) {
                        let error = match e {
                            mpsc::error::TrySendError::Full(_) => RpcError::capacity(
                                drpc_protocol::error_codes::TOO_MANY_RPC_REQUESTS,
                                "incoming queue overflow under keep-alive",
                            ),
                            mpsc::error::TrySendError::Closed(_) => {
                                RpcError::Lifecycle("stopped")
                            }
                        };
                        processor.stop_exceptional(error);
                        return;
                    }
                } else {
                    let send = processor.shared.incoming_tx.send(message);
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        sent = send => {
                            if sent.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
            Err(e) => {
                processor.stop_exceptional(e);
                return;
            }
        }
    }
}

/// Handle the cheap kinds synchronously so they never sit behind heavy
/// work.  Returns the message back when it belongs in the queue.
async fn pre_handle(
    processor: &RpcProcessor,
    message: WireMessage,
) -> Result<Option<WireMessage>, RpcError> {
    match message {
        WireMessage::Ping(ping) => {
            tracing::debug!(id = ping.id, "ping received");
            let _ = processor
                .enqueue_event_priority(WireMessage::Pong(Pong { id: ping.id }))
                .await;
            Ok(None)
        }
        WireMessage::Pong(pong) => {
            if !processor.shared.pending.complete(pong.id, Ok(None)) {
                tracing::debug!(id = pong.id, "unsolicited pong discarded");
            }
            Ok(None)
        }
        WireMessage::Close(_) => {
            if !processor.shared.options.handle_close_message {
                return Err(RpcError::Protocol(
                    "close message received but close handling is disabled".to_owned(),
                ));
            }
            tracing::info!("peer announced close");
            // Mark the stop before yielding so the upcoming EOF reads as
            // part of the graceful shutdown, not as a dropped link.
            processor.mark_stopped();
            let this = processor.clone();
            tokio::spawn(async move { this.dispose().await });
            Ok(None)
        }
        other => Ok(Some(other)),
    }
}

// ---------------------------------------------------------------------------
// Incoming worker pool
// ---------------------------------------------------------------------------

async fn incoming_worker_loop(
    processor: RpcProcessor,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<WireMessage>>>,
) {
    loop {
        let message = {
            let mut rx = rx.lock().await;
            tokio::select! {
                _ = processor.shared.cancel.cancelled() => None,
                message = rx.recv() => message,
            }
        };
        let Some(message) = message else { return };
        dispatch(&processor, message).await;
    }
}

async fn dispatch(processor: &RpcProcessor, message: WireMessage) {
    match message {
        WireMessage::Request(request) => calls::handle_request(processor, request).await,
        WireMessage::Response(response) => {
            let result = Ok(response.return_value);
            if !processor.shared.pending.complete(response.id, result) {
                tracing::debug!(id = response.id, "late response discarded");
            }
        }
        WireMessage::ErrorResponse(response) => {
            let result = Err(RpcError::from_error_info(response.error));
            if !processor.shared.pending.complete(response.id, result) {
                tracing::debug!(id = response.id, "late error response discarded");
            }
        }
        WireMessage::Cancel(cancel) => calls::handle_cancel(processor, cancel.id),
        WireMessage::Event(event) => events::handle_event(processor, event).await,
        WireMessage::ScopeRegistration(registration) => {
            if let Err(e) = scopes::handle_scope_registration(processor, registration).await {
                processor.stop_exceptional(e);
            }
        }
        WireMessage::ScopeEvent(event) => scopes::handle_scope_event(processor, event).await,
        WireMessage::ScopeDiscarded(discarded) => {
            scopes::handle_scope_discarded(processor, discarded);
        }
        WireMessage::StreamStart(start) => {
            if let Err(e) = outgoing_streams::handle_start(processor, start) {
                processor.stop_exceptional(e);
            }
        }
        WireMessage::StreamChunk(chunk) => {
            if let Err(e) = incoming_streams::handle_chunk(processor, chunk).await {
                processor.stop_exceptional(e);
            }
        }
        WireMessage::LocalStreamClose(close) => {
            incoming_streams::handle_producer_close(processor, close).await;
        }
        WireMessage::RemoteStreamClose(close) => {
            outgoing_streams::handle_consumer_close(processor, close.id);
        }
        WireMessage::Ping(_) | WireMessage::Pong(_) | WireMessage::Close(_) => {
            // Pre-handled in the read loop; a queued copy is a bug.
            tracing::warn!("keep-alive message reached the worker pool");
        }
    }
}
