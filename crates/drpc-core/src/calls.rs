//! Inbound call pipeline.
//!
//! A received request becomes a call record, is admitted against the call
//! queue's capacity, and runs through a fixed sequence: resolve method,
//! check arity, authorize, build context, resolve parameters, invoke,
//! finalize the return value, answer.  Materialized scopes and streams are
//! disposed per parameter policy on the way out.

use crate::api::{
    ApiDescriptor, Argument, DisposePolicy, MethodDescriptor, MethodOutcome, ParamSource,
};
use crate::context::CallContext;
use crate::error::RpcError;
use crate::processor::RpcProcessor;
use crate::scopes::{self, RemoteScope};
use crate::streams;
use drpc_protocol::{Request, ScopeValue, StreamValue, error_codes};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{OwnedSemaphorePermit, mpsc};
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Call record
// ---------------------------------------------------------------------------

struct ScopeAttachment {
    scope: Arc<RemoteScope>,
    dispose: DisposePolicy,
}

/// One inbound request being served.
pub(crate) struct Call {
    pub(crate) id: i64,
    pub(crate) request: Request,
    /// Composite cancellation: processor ∨ call queue ∨ this call.
    pub(crate) cancel: CancellationToken,
    was_processing: AtomicBool,
    did_return: AtomicBool,
    created: Instant,
    resolved: Mutex<Option<(Arc<ApiDescriptor>, Arc<MethodDescriptor>)>>,
    param_scopes: Mutex<Vec<ScopeAttachment>>,
}

impl Call {
    fn new(request: Request, cancel: CancellationToken) -> Arc<Call> {
        Arc::new(Call {
            id: request.id,
            request,
            cancel,
            was_processing: AtomicBool::new(false),
            did_return: AtomicBool::new(false),
            created: Instant::now(),
            resolved: Mutex::new(None),
            param_scopes: Mutex::new(Vec::new()),
        })
    }

    fn resolved_method(&self) -> Option<(Arc<ApiDescriptor>, Arc<MethodDescriptor>)> {
        self.resolved.lock().expect("call poisoned").clone()
    }

    fn attach_scope(&self, scope: Arc<RemoteScope>, dispose: DisposePolicy) {
        self.param_scopes
            .lock()
            .expect("call poisoned")
            .push(ScopeAttachment { scope, dispose });
    }

    /// Dispose materialized parameter scopes per their policies.
    fn dispose_param_scopes(&self, failed: bool, error: Option<&RpcError>) {
        let attachments: Vec<ScopeAttachment> = {
            let mut scopes = self.param_scopes.lock().expect("call poisoned");
            scopes.drain(..).collect()
        };
        for attachment in attachments {
            if failed {
                if let Some(error) = error {
                    attachment.scope.set_error(error.clone());
                }
            }
            if attachment.dispose.applies(failed) && !attachment.scope.is_stored() {
                attachment.scope.dispose();
            }
        }
    }
}

/// Registry of calls in flight, keyed by the peer's message id.
#[derive(Default)]
pub(crate) struct CallRegistry {
    map: Mutex<HashMap<i64, Arc<Call>>>,
}

impl CallRegistry {
    fn try_insert(&self, call: &Arc<Call>) -> bool {
        let mut map = self.map.lock().expect("call registry poisoned");
        if map.contains_key(&call.id) {
            return false;
        }
        map.insert(call.id, Arc::clone(call));
        true
    }

    pub(crate) fn get(&self, id: i64) -> Option<Arc<Call>> {
        self.map
            .lock()
            .expect("call registry poisoned")
            .get(&id)
            .cloned()
    }

    fn remove(&self, id: i64) -> Option<Arc<Call>> {
        self.map.lock().expect("call registry poisoned").remove(&id)
    }

    pub(crate) fn cancel_all(&self) {
        let calls: Vec<Arc<Call>> = {
            let map = self.map.lock().expect("call registry poisoned");
            map.values().cloned().collect()
        };
        for call in calls {
            call.cancel.cancel();
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.map.lock().expect("call registry poisoned").len()
    }
}

/// A call plus the capacity permit it holds until completion.
pub(crate) struct ExecutableCall {
    call: Arc<Call>,
    _permit: OwnedSemaphorePermit,
}

// ---------------------------------------------------------------------------
// Admission
// ---------------------------------------------------------------------------

/// Inbound `request`: admit into the call queue or answer with the
/// applicable error.  Runs on an incoming-queue worker.
pub(crate) async fn handle_request(processor: &RpcProcessor, request: Request) {
    let shared = processor.shared();
    let id = request.id;
    let wants_response = request.wants_response;

    // Capacity counts queued plus executing: the permit lives as long as
    // the call does.
    let permit = match Arc::clone(&shared.call_slots).try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            tracing::debug!(id, method = %request.method, "call queue full");
            if wants_response {
                processor
                    .send_error_response(
                        id,
                        &RpcError::capacity(
                            error_codes::TOO_MANY_RPC_REQUESTS,
                            "too many RPC requests",
                        ),
                    )
                    .await;
            }
            return;
        }
    };

    let call = Call::new(request, shared.calls_cancel.child_token());
    if !shared.calls.try_insert(&call) {
        tracing::warn!(id, "double message id from peer");
        if wants_response {
            processor
                .send_error_response(
                    id,
                    &RpcError::call(error_codes::DOUBLE_MESSAGE_ID, "double message ID"),
                )
                .await;
        }
        return;
    }

    if shared
        .call_tx
        .send(ExecutableCall {
            call: Arc::clone(&call),
            _permit: permit,
        })
        .is_err()
    {
        // Workers are gone; the processor is shutting down.
        shared.calls.remove(id);
    }
}

/// Inbound `cancel`: fire the referenced call's token.  Unknown ids are a
/// normal race with completion.
pub(crate) fn handle_cancel(processor: &RpcProcessor, id: i64) {
    match processor.shared().calls.get(id) {
        Some(call) => {
            tracing::debug!(id, "peer canceled call");
            call.cancel.cancel();
        }
        None => tracing::debug!(id, "cancel for unknown call ignored"),
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Call-queue worker loop.  Several run concurrently, sharing one receiver.
pub(crate) async fn worker_loop(
    processor: RpcProcessor,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<ExecutableCall>>>,
) {
    loop {
        let executable = {
            let mut rx = rx.lock().await;
            tokio::select! {
                _ = processor.shared().cancel.cancelled() => None,
                received = rx.recv() => received,
            }
        };
        let Some(executable) = executable else { break };
        run_call(&processor, executable).await;
    }
}

async fn run_call(processor: &RpcProcessor, executable: ExecutableCall) {
    let call = executable.call;
    let result = execute(processor, &call).await;
    let elapsed_ms = call.created.elapsed().as_millis() as u64;

    let (disconnect_api, disconnect_method) = call
        .resolved_method()
        .map(|(api, method)| (api.disconnect_on_error, method.disconnect_on_error))
        .unwrap_or((false, false));

    match result {
        Ok(value) => {
            tracing::debug!(id = call.id, method = %call.request.method, elapsed_ms, "call completed");
            call.dispose_param_scopes(false, None);
            if call.request.wants_response {
                let return_value = if call.request.wants_return_value {
                    value
                } else {
                    None
                };
                processor.send_response(call.id, return_value).await;
            }
        }
        Err(error) => {
            tracing::debug!(
                id = call.id,
                method = %call.request.method,
                %error,
                elapsed_ms,
                was_processing = call.was_processing.load(Ordering::Acquire),
                did_return = call.did_return.load(Ordering::Acquire),
                "call failed"
            );
            call.dispose_param_scopes(true, Some(&error));

            let options = &processor.shared().options;
            let fatal = error.is_fatal();
            let unauthorized_teardown = options.disconnect_on_unauthorized
                && matches!(&error, RpcError::Call { code, .. } if *code == error_codes::NOT_AUTHORIZED);
            let disconnect = fatal
                || disconnect_api
                || disconnect_method
                || unauthorized_teardown
                || (options.disconnect_on_api_error
                    && matches!(error, RpcError::Call { .. }));

            if call.request.wants_response {
                processor.send_error_response(call.id, &error).await;
            }
            if disconnect {
                processor.stop_exceptional(error);
            }
        }
    }

    processor.shared().calls.remove(call.id);
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

async fn execute(
    processor: &RpcProcessor,
    call: &Arc<Call>,
) -> Result<Option<serde_json::Value>, RpcError> {
    let shared = processor.shared();
    let request = &call.request;

    // 1. Method resolution, version forwarding included.
    let (api, method) = shared.options.apis.resolve(
        request.api.as_deref(),
        &request.method,
        shared.options.rpc_version,
    )?;
    *call.resolved.lock().expect("call poisoned") = Some((Arc::clone(&api), Arc::clone(&method)));

    // 2. Arity: the peer may not supply more positional parameters than the
    // method serves.
    if request.parameters.len() > method.rpc_arity() {
        return Err(RpcError::call(
            error_codes::ARGUMENT_ERROR,
            format!(
                "{} parameters provided, method {} serves {}",
                request.parameters.len(),
                method.name,
                method.rpc_arity()
            ),
        ));
    }

    // 3/4. Context, then authorization against it.
    let services = shared.options.default_services.fork();
    let ctx = CallContext::new(
        processor.clone(),
        request.clone(),
        Arc::clone(&method),
        services,
        call.cancel.clone(),
    );

    if !(api.skip_authorization || method.skip_authorization) {
        for authorizer in api.authorizers.iter().chain(method.authorizers.iter()) {
            let authorized = tokio::select! {
                _ = call.cancel.cancelled() => return Err(RpcError::Canceled),
                verdict = authorizer(ctx.clone()) => verdict,
            };
            if !authorized {
                if let Some(handler) = &shared.options.unauthorized_handler {
                    handler(&method.name);
                }
                return Err(RpcError::call(error_codes::NOT_AUTHORIZED, "not authorized"));
            }
        }
    }

    // 5. Parameter resolution and finalization.
    let arguments = resolve_arguments(processor, call, &ctx).await?;

    // 6. Invocation under the composite token.
    call.was_processing.store(true, Ordering::Release);
    let handler = Arc::clone(&method.handler);
    let outcome = tokio::select! {
        _ = call.cancel.cancelled() => return Err(RpcError::Canceled),
        outcome = handler(ctx, arguments) => outcome?,
    };
    call.did_return.store(true, Ordering::Release);

    // 7. Return value finalization.  A dropped return value (the caller does
    // not want it) is never materialized into scopes or streams.
    if !request.wants_return_value {
        return Ok(None);
    }
    finalize_return(processor, outcome).await
}

async fn resolve_arguments(
    processor: &RpcProcessor,
    call: &Arc<Call>,
    ctx: &CallContext,
) -> Result<Vec<Argument>, RpcError> {
    let shared = processor.shared();
    let method = ctx.method().clone();
    let request = &call.request;
    let mut arguments = Vec::with_capacity(method.params.len());
    let mut rpc_index = 0usize;

    for spec in &method.params {
        // Pick from the first applicable source.
        let picked = match &spec.source {
            ParamSource::Rpc => {
                let provided = request.parameters.get(rpc_index).cloned();
                rpc_index += 1;
                match provided {
                    Some(value) if value.is_null() && !spec.nullable => {
                        return Err(RpcError::call(
                            error_codes::ARGUMENT_ERROR,
                            format!("null for non-nullable parameter: {}", spec.name),
                        ));
                    }
                    Some(value) => Some(Argument::Value(value)),
                    None => None,
                }
            }
            ParamSource::LocalScopeKey(key) => {
                shared.local_scopes.get_by_key(key).map(Argument::LocalScope)
            }
            ParamSource::RemoteScopeKey(key) => shared
                .remote_scopes
                .get_by_key(key)
                .map(Argument::RemoteScope),
            ParamSource::Service(key) => ctx
                .services()
                .get_by_id(key.type_id())
                .map(Argument::Service),
        };

        let argument = match picked {
            Some(argument) => argument,
            None => {
                if let Some(default) = &spec.default {
                    Argument::Value(default.clone())
                } else if spec.nullable {
                    Argument::Value(serde_json::Value::Null)
                } else {
                    return Err(RpcError::call(
                        error_codes::ARGUMENT_ERROR,
                        format!("required parameter missing: {}", spec.name),
                    ));
                }
            }
        };

        // Finalize: embedded scope/stream records become live handles.
        let argument = finalize_argument(processor, call, spec, argument)?;

        if !spec.expected.check(&argument, spec.nullable) {
            return Err(RpcError::call(
                error_codes::ARGUMENT_ERROR,
                format!("type mismatch for parameter: {}", spec.name),
            ));
        }
        arguments.push(argument);
    }
    Ok(arguments)
}

fn finalize_argument(
    processor: &RpcProcessor,
    call: &Arc<Call>,
    spec: &crate::api::ParamSpec,
    argument: Argument,
) -> Result<Argument, RpcError> {
    let Argument::Value(value) = &argument else {
        return Ok(argument);
    };

    if let Some(scope_value) = ScopeValue::from_value(value) {
        let scope = scopes::materialize_remote_scope(processor, &scope_value)?;
        call.attach_scope(Arc::clone(&scope), spec.dispose);
        // Scope-typed parameters get the handle; anything else gets the
        // scope's carried value.
        if spec.expected == crate::api::Expectation::Scope {
            return Ok(Argument::RemoteScope(scope));
        }
        return Ok(Argument::Value(
            scope.state().unwrap_or(serde_json::Value::Null),
        ));
    }

    if let Some(stream_value) = StreamValue::from_value(value) {
        let handle = streams::incoming::materialize(processor, &stream_value)?;
        return Ok(Argument::Stream(handle));
    }

    Ok(argument)
}

async fn finalize_return(
    processor: &RpcProcessor,
    outcome: MethodOutcome,
) -> Result<Option<serde_json::Value>, RpcError> {
    match outcome {
        MethodOutcome::Unit => Ok(None),
        MethodOutcome::Value(value) => {
            // A registered return-scope factory may claim the value and wrap
            // it in a local scope; the scope's own dispose policy then
            // governs it, regardless of the method-level policy.
            if let Some(builder) = processor
                .shared()
                .options
                .scope_types
                .return_scope_for(&value)
            {
                let scope = processor.register_scope(builder)?;
                return Ok(Some(scope.to_scope_value().into_value()));
            }
            Ok(Some(value))
        }
        MethodOutcome::Stream(source) => {
            let stream_value = streams::outgoing::create_value(processor, source).await?;
            Ok(Some(stream_value.into_value()))
        }
        MethodOutcome::Scope(builder) => {
            let scope = processor.register_scope(builder)?;
            Ok(Some(scope.to_scope_value().into_value()))
        }
    }
}
