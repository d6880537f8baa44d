//! API descriptor tables.
//!
//! Method dispatch is table-driven: an API is a named bag of method
//! descriptors, each carrying its parameter specs, authorization chain,
//! version-forwarding rule, and disposal policies.  No runtime reflection;
//! the embedding application declares everything up front through the
//! builders.

use crate::context::{CallContext, ServiceKey};
use crate::error::RpcError;
use crate::scopes::{LocalScope, RemoteScope, ScopeBuilder};
use crate::streams::{ByteSource, IncomingHandle};
use drpc_protocol::error_codes;
use futures_util::future::BoxFuture;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Arguments and outcomes
// ---------------------------------------------------------------------------

/// One resolved method argument, after parameter resolution and
/// finalization.
pub enum Argument {
    /// Plain JSON value (request-supplied, defaulted, or null).
    Value(serde_json::Value),
    /// A scope hosted by this side, bound via a local scope key.
    LocalScope(Arc<LocalScope>),
    /// A peer-hosted scope handle, bound via key or materialized from a
    /// wire scope value.
    RemoteScope(Arc<RemoteScope>),
    /// An incoming byte stream materialized from a wire stream value.
    Stream(IncomingHandle),
    /// A DI-sourced service instance.
    Service(Arc<dyn Any + Send + Sync>),
}

impl Argument {
    pub fn as_value(&self) -> Option<&serde_json::Value> {
        match self {
            Argument::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_value(self) -> Option<serde_json::Value> {
        match self {
            Argument::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_value().and_then(serde_json::Value::as_str)
    }

    pub fn as_remote_scope(&self) -> Option<&Arc<RemoteScope>> {
        match self {
            Argument::RemoteScope(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_local_scope(&self) -> Option<&Arc<LocalScope>> {
        match self {
            Argument::LocalScope(s) => Some(s),
            _ => None,
        }
    }

    pub fn into_stream(self) -> Option<IncomingHandle> {
        match self {
            Argument::Stream(s) => Some(s),
            _ => None,
        }
    }

    pub fn service<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        match self {
            Argument::Service(s) => Arc::clone(s).downcast::<T>().ok(),
            _ => None,
        }
    }
}

impl std::fmt::Debug for Argument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Argument::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Argument::LocalScope(s) => f.debug_tuple("LocalScope").field(&s.id()).finish(),
            Argument::RemoteScope(s) => f.debug_tuple("RemoteScope").field(&s.id()).finish(),
            Argument::Stream(_) => f.write_str("Stream"),
            Argument::Service(_) => f.write_str("Service"),
        }
    }
}

/// What a method handler produces.
pub enum MethodOutcome {
    /// No return value.
    Unit,
    /// Plain JSON return value.
    Value(serde_json::Value),
    /// A byte stream the peer pulls chunk by chunk (or inline, if small).
    Stream(ByteSource),
    /// A local scope to register and hand to the peer as a scope value.
    Scope(ScopeBuilder),
}

/// Handler callable: the invocation step of the call pipeline.
pub type MethodHandler = Arc<
    dyn Fn(CallContext, Vec<Argument>) -> BoxFuture<'static, Result<MethodOutcome, RpcError>>
        + Send
        + Sync,
>;

/// Authorization predicate.  Runs in declaration order; the first `false`
/// rejects the call.
pub type Authorizer = Arc<dyn Fn(CallContext) -> BoxFuture<'static, bool> + Send + Sync>;

// ---------------------------------------------------------------------------
// Parameter specs
// ---------------------------------------------------------------------------

/// Where a parameter's value comes from.  The resolution order across
/// sources is fixed: request parameter, scope key, service, default, null.
#[derive(Clone, Debug)]
pub enum ParamSource {
    /// Positional request parameter (index-matched among `Rpc` params only).
    Rpc,
    /// A stored local scope addressed by key.
    LocalScopeKey(String),
    /// A stored remote scope addressed by key.
    RemoteScopeKey(String),
    /// Service-map lookup by type.
    Service(ServiceKey),
}

/// JSON-level shape the finalized argument must have.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Expectation {
    Any,
    Bool,
    Number,
    String,
    Array,
    Object,
    /// The argument must be a scope handle (the scope object itself is
    /// passed, not its value).
    Scope,
    /// The argument must be an incoming stream.
    Stream,
}

impl Expectation {
    fn matches_value(self, value: &serde_json::Value) -> bool {
        match self {
            Expectation::Any => true,
            Expectation::Bool => value.is_boolean(),
            Expectation::Number => value.is_number(),
            Expectation::String => value.is_string(),
            Expectation::Array => value.is_array(),
            Expectation::Object => value.is_object(),
            Expectation::Scope | Expectation::Stream => false,
        }
    }

    /// Check a finalized argument against this expectation.
    pub(crate) fn check(self, argument: &Argument, nullable: bool) -> bool {
        match argument {
            Argument::Value(v) => {
                if v.is_null() {
                    nullable
                } else {
                    self.matches_value(v)
                }
            }
            Argument::LocalScope(_) | Argument::RemoteScope(_) => self == Expectation::Scope,
            Argument::Stream(_) => self == Expectation::Stream,
            // Service instances are opaque to JSON-level checks.
            Argument::Service(_) => true,
        }
    }
}

/// When a materialized parameter (scope, stream source) is disposed after
/// the call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum DisposePolicy {
    Never,
    #[default]
    Always,
    OnSuccess,
    OnError,
}

impl DisposePolicy {
    pub(crate) fn applies(self, call_failed: bool) -> bool {
        match self {
            DisposePolicy::Never => false,
            DisposePolicy::Always => true,
            DisposePolicy::OnSuccess => !call_failed,
            DisposePolicy::OnError => call_failed,
        }
    }
}

/// One declared method parameter.
#[derive(Clone, Debug)]
pub struct ParamSpec {
    pub name: String,
    pub source: ParamSource,
    pub expected: Expectation,
    pub nullable: bool,
    pub default: Option<serde_json::Value>,
    pub dispose: DisposePolicy,
}

impl ParamSpec {
    /// Positional RPC parameter with a shape expectation.
    pub fn rpc(name: impl Into<String>, expected: Expectation) -> ParamSpec {
        ParamSpec {
            name: name.into(),
            source: ParamSource::Rpc,
            expected,
            nullable: false,
            default: None,
            dispose: DisposePolicy::default(),
        }
    }

    /// Parameter bound to a stored local scope.
    pub fn local_scope(name: impl Into<String>, key: impl Into<String>) -> ParamSpec {
        ParamSpec {
            name: name.into(),
            source: ParamSource::LocalScopeKey(key.into()),
            expected: Expectation::Scope,
            nullable: false,
            default: None,
            dispose: DisposePolicy::Never,
        }
    }

    /// Parameter bound to a stored remote scope.
    pub fn remote_scope(name: impl Into<String>, key: impl Into<String>) -> ParamSpec {
        ParamSpec {
            name: name.into(),
            source: ParamSource::RemoteScopeKey(key.into()),
            expected: Expectation::Scope,
            nullable: false,
            default: None,
            dispose: DisposePolicy::Never,
        }
    }

    /// Parameter resolved from the service map by type.
    pub fn service<T: Send + Sync + 'static>(name: impl Into<String>) -> ParamSpec {
        ParamSpec {
            name: name.into(),
            source: ParamSource::Service(ServiceKey::of::<T>()),
            expected: Expectation::Any,
            nullable: false,
            default: None,
            dispose: DisposePolicy::Never,
        }
    }

    pub fn nullable(mut self) -> ParamSpec {
        self.nullable = true;
        self
    }

    pub fn default_value(mut self, value: serde_json::Value) -> ParamSpec {
        self.default = Some(value);
        self
    }

    pub fn dispose(mut self, policy: DisposePolicy) -> ParamSpec {
        self.dispose = policy;
        self
    }
}

// ---------------------------------------------------------------------------
// Method and API descriptors
// ---------------------------------------------------------------------------

/// Version-forwarding rule: peers at or above `from_version` are served by
/// `target` instead of this method.
#[derive(Clone, Debug)]
pub struct VersionForward {
    pub from_version: u32,
    pub target: String,
}

pub struct MethodDescriptor {
    pub name: String,
    pub params: Vec<ParamSpec>,
    pub handler: MethodHandler,
    pub authorizers: Vec<Authorizer>,
    pub skip_authorization: bool,
    /// Peers below this version cannot call the method.
    pub min_peer_version: Option<u32>,
    pub forward: Option<VersionForward>,
    pub disconnect_on_error: bool,
    /// Disposal policy for a non-scope return value; a scope return follows
    /// the scope's own policy.
    pub return_dispose: DisposePolicy,
}

impl MethodDescriptor {
    /// Number of positional RPC parameters (the servable arity).
    pub fn rpc_arity(&self) -> usize {
        self.params
            .iter()
            .filter(|p| matches!(p.source, ParamSource::Rpc))
            .count()
    }
}

impl std::fmt::Debug for MethodDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodDescriptor")
            .field("name", &self.name)
            .field("params", &self.params.len())
            .field("min_peer_version", &self.min_peer_version)
            .field("disconnect_on_error", &self.disconnect_on_error)
            .finish_non_exhaustive()
    }
}

pub struct ApiDescriptor {
    pub name: String,
    pub methods: HashMap<String, Arc<MethodDescriptor>>,
    pub authorizers: Vec<Authorizer>,
    pub skip_authorization: bool,
    pub disconnect_on_error: bool,
}

impl std::fmt::Debug for ApiDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiDescriptor")
            .field("name", &self.name)
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

pub struct MethodBuilder {
    descriptor: MethodDescriptor,
}

impl MethodBuilder {
    pub fn new(name: impl Into<String>) -> MethodBuilder {
        MethodBuilder {
            descriptor: MethodDescriptor {
                name: name.into(),
                params: Vec::new(),
                handler: Arc::new(|_, _| {
                    Box::pin(async {
                        Err(RpcError::call(
                            error_codes::INTERNAL_ERROR,
                            "method has no handler",
                        ))
                    })
                }),
                authorizers: Vec::new(),
                skip_authorization: false,
                min_peer_version: None,
                forward: None,
                disconnect_on_error: false,
                return_dispose: DisposePolicy::default(),
            },
        }
    }

    pub fn param(mut self, spec: ParamSpec) -> MethodBuilder {
        self.descriptor.params.push(spec);
        self
    }

    pub fn handler<F, Fut>(mut self, f: F) -> MethodBuilder
    where
        F: Fn(CallContext, Vec<Argument>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<MethodOutcome, RpcError>> + Send + 'static,
    {
        self.descriptor.handler = Arc::new(move |ctx, args| Box::pin(f(ctx, args)));
        self
    }

    pub fn authorize<F, Fut>(mut self, f: F) -> MethodBuilder
    where
        F: Fn(CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.descriptor
            .authorizers
            .push(Arc::new(move |ctx| Box::pin(f(ctx))));
        self
    }

    pub fn skip_authorization(mut self) -> MethodBuilder {
        self.descriptor.skip_authorization = true;
        self
    }

    pub fn min_peer_version(mut self, version: u32) -> MethodBuilder {
        self.descriptor.min_peer_version = Some(version);
        self
    }

    /// Serve peers at or above `from_version` with `target` instead.
    pub fn forward_from_version(
        mut self,
        from_version: u32,
        target: impl Into<String>,
    ) -> MethodBuilder {
        self.descriptor.forward = Some(VersionForward {
            from_version,
            target: target.into(),
        });
        self
    }

    pub fn disconnect_on_error(mut self) -> MethodBuilder {
        self.descriptor.disconnect_on_error = true;
        self
    }

    pub fn return_dispose(mut self, policy: DisposePolicy) -> MethodBuilder {
        self.descriptor.return_dispose = policy;
        self
    }

    pub fn finish(self) -> Arc<MethodDescriptor> {
        Arc::new(self.descriptor)
    }
}

pub struct ApiBuilder {
    descriptor: ApiDescriptor,
}

impl ApiBuilder {
    pub fn new(name: impl Into<String>) -> ApiBuilder {
        ApiBuilder {
            descriptor: ApiDescriptor {
                name: name.into(),
                methods: HashMap::new(),
                authorizers: Vec::new(),
                skip_authorization: false,
                disconnect_on_error: false,
            },
        }
    }

    pub fn method(mut self, method: Arc<MethodDescriptor>) -> ApiBuilder {
        self.descriptor.methods.insert(method.name.clone(), method);
        self
    }

    pub fn authorize<F, Fut>(mut self, f: F) -> ApiBuilder
    where
        F: Fn(CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.descriptor
            .authorizers
            .push(Arc::new(move |ctx| Box::pin(f(ctx))));
        self
    }

    pub fn skip_authorization(mut self) -> ApiBuilder {
        self.descriptor.skip_authorization = true;
        self
    }

    pub fn disconnect_on_error(mut self) -> ApiBuilder {
        self.descriptor.disconnect_on_error = true;
        self
    }

    pub fn finish(self) -> Arc<ApiDescriptor> {
        Arc::new(self.descriptor)
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RegistryInner {
    apis: HashMap<String, Arc<ApiDescriptor>>,
    default_api: Option<String>,
}

/// All APIs served by one processor.  Cheap to clone; immutable once built.
#[derive(Clone, Default)]
pub struct ApiRegistry {
    inner: Arc<RegistryInner>,
}

impl ApiRegistry {
    pub fn builder() -> ApiRegistryBuilder {
        ApiRegistryBuilder {
            inner: RegistryInner::default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.apis.is_empty()
    }

    /// Resolve an inbound (api, method) pair, applying version forwarding.
    ///
    /// Forwarding is followed transitively; a cycle or an unknown forward
    /// target fails the call (never the link).
    pub(crate) fn resolve(
        &self,
        api: Option<&str>,
        method: &str,
        peer_version: u32,
    ) -> Result<(Arc<ApiDescriptor>, Arc<MethodDescriptor>), RpcError> {
        let api_desc = match api {
            Some(name) => self.inner.apis.get(name),
            None => self
                .inner
                .default_api
                .as_deref()
                .and_then(|name| self.inner.apis.get(name)),
        }
        .ok_or_else(|| {
            RpcError::call(
                error_codes::METHOD_NOT_FOUND,
                format!("no such API: {}", api.unwrap_or("<default>")),
            )
        })?;

        let mut current = method.to_owned();
        let mut seen: HashSet<String> = HashSet::new();
        loop {
            let descriptor = api_desc.methods.get(&current).ok_or_else(|| {
                RpcError::call(
                    error_codes::METHOD_NOT_FOUND,
                    format!("no such method: {}.{current}", api_desc.name),
                )
            })?;

            if let Some(forward) = &descriptor.forward {
                if peer_version >= forward.from_version {
                    if !seen.insert(current.clone()) {
                        return Err(RpcError::call(
                            error_codes::CALL_ERROR,
                            format!("version forwarding cycle at {}.{current}", api_desc.name),
                        ));
                    }
                    current = forward.target.clone();
                    continue;
                }
            }

            if let Some(min) = descriptor.min_peer_version {
                if peer_version < min {
                    return Err(RpcError::call(
                        error_codes::INCOMPATIBLE_VERSION,
                        format!(
                            "method {}.{current} requires peer version {min}, peer is {peer_version}",
                            api_desc.name
                        ),
                    ));
                }
            }
            return Ok((Arc::clone(api_desc), Arc::clone(descriptor)));
        }
    }
}

pub struct ApiRegistryBuilder {
    inner: RegistryInner,
}

impl ApiRegistryBuilder {
    /// Register an API.  The first registered API becomes the default
    /// target for requests that carry no API name.
    pub fn api(mut self, api: Arc<ApiDescriptor>) -> ApiRegistryBuilder {
        if self.inner.default_api.is_none() {
            self.inner.default_api = Some(api.name.clone());
        }
        self.inner.apis.insert(api.name.clone(), api);
        self
    }

    /// Register an API and make it the default target.
    pub fn default_api(mut self, api: Arc<ApiDescriptor>) -> ApiRegistryBuilder {
        self.inner.default_api = Some(api.name.clone());
        self.inner.apis.insert(api.name.clone(), api);
        self
    }

    pub fn finish(self) -> ApiRegistry {
        ApiRegistry {
            inner: Arc::new(self.inner),
        }
    }
}
