//! Scope subsystem.
//!
//! A scope is a long-lived, addressable handle shared between the peers.
//! Local scopes are hosted here and exposed to the peer; remote scopes are
//! the local handles to peer-hosted scopes.  Both sides keep one table per
//! direction, indexed by numeric id and (for keyed scopes) by string key;
//! one mutex covers both indices so the two stay consistent.
//!
//! Scope-type tags are resolved against a factory registry; a wire value
//! naming an unregistered tag is a protocol violation, not a call error.

use crate::error::RpcError;
use crate::events::EventRegistry;
use crate::processor::{RpcProcessor, Shared};
use drpc_protocol::{
    ScopeDiscarded, ScopeEvent as ScopeEventMsg, ScopeRegistration, ScopeValue, error_codes,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

// ---------------------------------------------------------------------------
// Scope tables
// ---------------------------------------------------------------------------

pub(crate) trait ScopeEntry {
    fn entry_id(&self) -> i64;
    fn entry_key(&self) -> Option<&str>;
}

struct TableInner<S> {
    by_id: HashMap<i64, Arc<S>>,
    by_key: HashMap<String, Arc<S>>,
}

/// One direction's scope registry.  Insertions check the id, the key, and
/// the capacity limit inside a single critical section.
pub(crate) struct ScopeTable<S> {
    inner: Mutex<TableInner<S>>,
    limit: usize,
}

impl<S: ScopeEntry> ScopeTable<S> {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            inner: Mutex::new(TableInner {
                by_id: HashMap::new(),
                by_key: HashMap::new(),
            }),
            limit,
        }
    }

    /// Insert a stored scope.  With `replace`, an existing scope under the
    /// same key is swapped out atomically and returned for disposal;
    /// without it, a key conflict is an error.
    pub(crate) fn insert(
        &self,
        scope: Arc<S>,
        replace: bool,
    ) -> Result<Option<Arc<S>>, RpcError> {
        let mut inner = self.inner.lock().expect("scope table poisoned");
        if inner.by_id.contains_key(&scope.entry_id()) {
            return Err(RpcError::Protocol(format!(
                "scope id {} already registered",
                scope.entry_id()
            )));
        }

        let mut replaced = None;
        if let Some(key) = scope.entry_key() {
            if let Some(existing) = inner.by_key.get(key) {
                if !replace {
                    return Err(RpcError::call(
                        error_codes::SCOPE_CONFLICT,
                        format!("scope key already in use: {key}"),
                    ));
                }
                let existing = Arc::clone(existing);
                inner.by_id.remove(&existing.entry_id());
                inner.by_key.remove(key);
                replaced = Some(existing);
            }
        }

        if inner.by_id.len() >= self.limit {
            return Err(RpcError::capacity(
                error_codes::TOO_MANY_SCOPES,
                format!("scope limit of {} reached", self.limit),
            ));
        }

        inner.by_id.insert(scope.entry_id(), Arc::clone(&scope));
        if let Some(key) = scope.entry_key() {
            inner.by_key.insert(key.to_owned(), scope);
        }
        Ok(replaced)
    }

    pub(crate) fn get(&self, id: i64) -> Option<Arc<S>> {
        self.inner
            .lock()
            .expect("scope table poisoned")
            .by_id
            .get(&id)
            .cloned()
    }

    pub(crate) fn get_by_key(&self, key: &str) -> Option<Arc<S>> {
        self.inner
            .lock()
            .expect("scope table poisoned")
            .by_key
            .get(key)
            .cloned()
    }

    /// Remove exactly this instance.  A newer scope that reused the key (or
    /// id, after replacement) is left alone.
    pub(crate) fn remove_exact(&self, scope: &Arc<S>) -> bool {
        let mut inner = self.inner.lock().expect("scope table poisoned");
        let id = scope.entry_id();
        let present = inner
            .by_id
            .get(&id)
            .is_some_and(|current| Arc::ptr_eq(current, scope));
        if !present {
            return false;
        }
        inner.by_id.remove(&id);
        if let Some(key) = scope.entry_key() {
            let same = inner
                .by_key
                .get(key)
                .is_some_and(|current| Arc::ptr_eq(current, scope));
            if same {
                inner.by_key.remove(key);
            }
        }
        true
    }

    pub(crate) fn drain(&self) -> Vec<Arc<S>> {
        let mut inner = self.inner.lock().expect("scope table poisoned");
        inner.by_key.clear();
        inner.by_id.drain().map(|(_, scope)| scope).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().expect("scope table poisoned").by_id.len()
    }
}

// ---------------------------------------------------------------------------
// Scope type registry
// ---------------------------------------------------------------------------

/// Hooks attached to a registered scope type tag.
#[derive(Clone, Default)]
pub struct ScopeTypeDef {
    /// Runs after a remote scope of this type is materialized from a wire
    /// value, before the call (or registration ack) proceeds.
    pub on_remote_created: Option<Arc<dyn Fn(&RpcProcessor, &Arc<RemoteScope>) + Send + Sync>>,
}

/// Factory producing a local scope for a matching return value; the first
/// factory that claims the value wins.
pub type ReturnScopeFactory =
    Arc<dyn Fn(&serde_json::Value) -> Option<ScopeBuilder> + Send + Sync>;

#[derive(Default)]
struct ScopeTypesInner {
    types: HashMap<String, ScopeTypeDef>,
    return_factories: Vec<ReturnScopeFactory>,
}

/// Registry of known scope type tags plus return-scope factories.
#[derive(Clone, Default)]
pub struct ScopeTypes {
    inner: Arc<RwLock<ScopeTypesInner>>,
}

impl ScopeTypes {
    /// Register a type tag with hooks.
    pub fn register(&self, tag: impl Into<String>, def: ScopeTypeDef) {
        self.inner
            .write()
            .expect("scope types poisoned")
            .types
            .insert(tag.into(), def);
    }

    /// Register a bare type tag.
    pub fn register_tag(&self, tag: impl Into<String>) {
        self.register(tag, ScopeTypeDef::default());
    }

    pub fn register_return_factory<F>(&self, factory: F)
    where
        F: Fn(&serde_json::Value) -> Option<ScopeBuilder> + Send + Sync + 'static,
    {
        self.inner
            .write()
            .expect("scope types poisoned")
            .return_factories
            .push(Arc::new(factory));
    }

    pub fn is_registered(&self, tag: &str) -> bool {
        self.inner
            .read()
            .expect("scope types poisoned")
            .types
            .contains_key(tag)
    }

    pub(crate) fn get(&self, tag: &str) -> Option<ScopeTypeDef> {
        self.inner
            .read()
            .expect("scope types poisoned")
            .types
            .get(tag)
            .cloned()
    }

    pub(crate) fn return_scope_for(&self, value: &serde_json::Value) -> Option<ScopeBuilder> {
        let inner = self.inner.read().expect("scope types poisoned");
        inner.return_factories.iter().find_map(|f| f(value))
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Declarative description of a local scope to register.
#[derive(Clone, Debug)]
pub struct ScopeBuilder {
    pub scope_type: String,
    pub key: Option<String>,
    pub name: Option<String>,
    pub value: Option<serde_json::Value>,
    pub is_stored: bool,
    pub dispose_value: bool,
    pub dispose_value_on_error: bool,
    pub inform_peer_on_dispose: bool,
    pub replace_existing: bool,
}

impl ScopeBuilder {
    pub fn new(scope_type: impl Into<String>) -> ScopeBuilder {
        ScopeBuilder {
            scope_type: scope_type.into(),
            key: None,
            name: None,
            value: None,
            is_stored: false,
            dispose_value: true,
            dispose_value_on_error: false,
            inform_peer_on_dispose: true,
            replace_existing: false,
        }
    }

    pub fn key(mut self, key: impl Into<String>) -> ScopeBuilder {
        self.key = Some(key.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> ScopeBuilder {
        self.name = Some(name.into());
        self
    }

    pub fn value(mut self, value: serde_json::Value) -> ScopeBuilder {
        self.value = Some(value);
        self
    }

    pub fn stored(mut self) -> ScopeBuilder {
        self.is_stored = true;
        self
    }

    pub fn dispose_value(mut self, dispose: bool) -> ScopeBuilder {
        self.dispose_value = dispose;
        self
    }

    pub fn dispose_value_on_error(mut self, dispose: bool) -> ScopeBuilder {
        self.dispose_value_on_error = dispose;
        self
    }

    pub fn inform_peer_on_dispose(mut self, inform: bool) -> ScopeBuilder {
        self.inform_peer_on_dispose = inform;
        self
    }

    pub fn replace_existing(mut self) -> ScopeBuilder {
        self.replace_existing = true;
        self
    }
}

// ---------------------------------------------------------------------------
// Local scope
// ---------------------------------------------------------------------------

/// A scope hosted by this processor and exposed to the peer.
pub struct LocalScope {
    id: i64,
    key: Option<String>,
    name: Option<String>,
    scope_type: String,
    processor: Weak<Shared>,
    is_stored: bool,
    dispose_value: bool,
    dispose_value_on_error: bool,
    inform_peer_on_dispose: bool,
    replace_existing: bool,
    value: Mutex<Option<serde_json::Value>>,
    is_error: AtomicBool,
    last_error: Mutex<Option<RpcError>>,
    discarded: AtomicBool,
    events: EventRegistry,
}

impl ScopeEntry for LocalScope {
    fn entry_id(&self) -> i64 {
        self.id
    }

    fn entry_key(&self) -> Option<&str> {
        self.key.as_deref()
    }
}

impl LocalScope {
    pub(crate) fn from_builder(
        id: i64,
        builder: ScopeBuilder,
        processor: Weak<Shared>,
    ) -> Arc<LocalScope> {
        Arc::new(LocalScope {
            id,
            key: builder.key,
            name: builder.name,
            scope_type: builder.scope_type,
            processor,
            is_stored: builder.is_stored,
            dispose_value: builder.dispose_value,
            dispose_value_on_error: builder.dispose_value_on_error,
            inform_peer_on_dispose: builder.inform_peer_on_dispose,
            replace_existing: builder.replace_existing,
            value: Mutex::new(builder.value),
            is_error: AtomicBool::new(false),
            last_error: Mutex::new(None),
            discarded: AtomicBool::new(false),
            events: EventRegistry::default(),
        })
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn scope_type(&self) -> &str {
        &self.scope_type
    }

    pub fn is_stored(&self) -> bool {
        self.is_stored
    }

    pub fn is_discarded(&self) -> bool {
        self.discarded.load(Ordering::Acquire)
    }

    pub fn value(&self) -> Option<serde_json::Value> {
        self.value.lock().expect("scope value poisoned").clone()
    }

    pub fn set_value(&self, value: serde_json::Value) {
        *self.value.lock().expect("scope value poisoned") = Some(value);
    }

    /// Flag the scope as failed; influences value disposal.
    pub fn set_error(&self, error: RpcError) {
        self.is_error.store(true, Ordering::Release);
        *self.last_error.lock().expect("scope error poisoned") = Some(error);
    }

    pub fn is_error(&self) -> bool {
        self.is_error.load(Ordering::Acquire)
    }

    pub fn last_error(&self) -> Option<RpcError> {
        self.last_error.lock().expect("scope error poisoned").clone()
    }

    /// Per-scope event table, addressed by `(scope id, event name)` on the
    /// wire.
    pub fn events(&self) -> &EventRegistry {
        &self.events
    }

    pub(crate) fn will_dispose_value(&self) -> bool {
        self.dispose_value || (self.dispose_value_on_error && self.is_error())
    }

    /// Wire form for parameters, return values, and registration.
    pub fn to_scope_value(&self) -> ScopeValue {
        ScopeValue {
            scope_type: self.scope_type.clone(),
            id: self.id,
            key: self.key.clone(),
            is_stored: self.is_stored,
            dispose_value: self.dispose_value,
            dispose_value_on_error: self.dispose_value_on_error,
            inform_when_disposing: self.inform_peer_on_dispose,
            replace_existing: self.replace_existing,
            state: self.value(),
        }
    }

    /// Raise an event addressed to this scope at the peer.
    pub async fn raise_event(
        self: &Arc<Self>,
        name: &str,
        arguments: Option<serde_json::Value>,
        wait: bool,
    ) -> Result<(), RpcError> {
        let processor = self.require_processor()?;
        processor
            .raise_scope_event(self.id, name, arguments, wait)
            .await
    }

    /// Discard: notify the peer, drop out of the registry, dispose the held
    /// value per policy.  Idempotent.
    pub async fn discard(self: &Arc<Self>) {
        if self.discarded.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(processor) = self.processor() {
            if self.inform_peer_on_dispose {
                let message = drpc_protocol::WireMessage::ScopeDiscarded(ScopeDiscarded {
                    scope_id: self.id,
                });
                if let Ok(done) = processor.enqueue_event_priority(message).await {
                    let _ = done.await;
                }
            }
            processor.shared().local_scopes.remove_exact(self);
        }
        self.drop_value();
    }

    /// Teardown path: best-effort discard notification, no awaiting.
    pub(crate) fn dispose_on_shutdown(self: &Arc<Self>) {
        if self.discarded.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(processor) = self.processor() {
            if self.inform_peer_on_dispose {
                processor.try_enqueue_event_priority(drpc_protocol::WireMessage::ScopeDiscarded(
                    ScopeDiscarded { scope_id: self.id },
                ));
            }
        }
        self.drop_value();
    }

    /// The peer told us it no longer references this scope.
    pub(crate) fn dispose_from_peer(self: &Arc<Self>) {
        if self.discarded.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(processor) = self.processor() {
            processor.shared().local_scopes.remove_exact(self);
        }
        self.drop_value();
    }

    fn drop_value(&self) {
        if self.will_dispose_value() {
            let dropped = self.value.lock().expect("scope value poisoned").take();
            if dropped.is_some() {
                tracing::debug!(scope_id = self.id, "disposed local scope value");
            }
        }
    }

    fn processor(&self) -> Option<RpcProcessor> {
        self.processor.upgrade().map(RpcProcessor::from_shared)
    }

    fn require_processor(&self) -> Result<RpcProcessor, RpcError> {
        self.processor().ok_or(RpcError::Lifecycle("disposed"))
    }
}

impl std::fmt::Debug for LocalScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalScope")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("scope_type", &self.scope_type)
            .field("is_stored", &self.is_stored)
            .field("discarded", &self.is_discarded())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Remote scope
// ---------------------------------------------------------------------------

/// The local handle to a peer-hosted scope.  The id is peer-assigned.
pub struct RemoteScope {
    id: i64,
    key: Option<String>,
    scope_type: String,
    processor: Weak<Shared>,
    is_stored: bool,
    dispose_value: bool,
    dispose_value_on_error: bool,
    inform_master_when_disposing: bool,
    state: Mutex<Option<serde_json::Value>>,
    is_error: AtomicBool,
    last_error: Mutex<Option<RpcError>>,
    discarded: AtomicBool,
    events: EventRegistry,
}

impl ScopeEntry for RemoteScope {
    fn entry_id(&self) -> i64 {
        self.id
    }

    fn entry_key(&self) -> Option<&str> {
        self.key.as_deref()
    }
}

impl RemoteScope {
    pub(crate) fn from_value(value: &ScopeValue, processor: Weak<Shared>) -> Arc<RemoteScope> {
        Arc::new(RemoteScope {
            id: value.id,
            key: value.key.clone(),
            scope_type: value.scope_type.clone(),
            processor,
            is_stored: value.is_stored,
            dispose_value: value.dispose_value,
            dispose_value_on_error: value.dispose_value_on_error,
            inform_master_when_disposing: value.inform_when_disposing,
            state: Mutex::new(value.state.clone()),
            is_error: AtomicBool::new(false),
            last_error: Mutex::new(None),
            discarded: AtomicBool::new(false),
            events: EventRegistry::default(),
        })
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn scope_type(&self) -> &str {
        &self.scope_type
    }

    pub fn is_stored(&self) -> bool {
        self.is_stored
    }

    pub fn is_discarded(&self) -> bool {
        self.discarded.load(Ordering::Acquire)
    }

    /// The peer-provided scope state, if any.
    pub fn state(&self) -> Option<serde_json::Value> {
        self.state.lock().expect("scope state poisoned").clone()
    }

    pub fn set_error(&self, error: RpcError) {
        self.is_error.store(true, Ordering::Release);
        *self.last_error.lock().expect("scope error poisoned") = Some(error);
    }

    pub fn is_error(&self) -> bool {
        self.is_error.load(Ordering::Acquire)
    }

    pub fn events(&self) -> &EventRegistry {
        &self.events
    }

    fn will_dispose_value(&self) -> bool {
        self.dispose_value || (self.dispose_value_on_error && self.is_error())
    }

    /// Raise an event addressed to this scope at the hosting peer.
    pub async fn raise_event(
        self: &Arc<Self>,
        name: &str,
        arguments: Option<serde_json::Value>,
        wait: bool,
    ) -> Result<(), RpcError> {
        let processor = self
            .processor()
            .ok_or(RpcError::Lifecycle("disposed"))?;
        processor
            .raise_scope_event(self.id, name, arguments, wait)
            .await
    }

    /// Dispose the handle.  Silent unless `inform_when_disposing` was set on
    /// the wire value.  Idempotent.
    pub fn dispose(self: &Arc<Self>) {
        if self.discarded.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(processor) = self.processor() {
            if self.inform_master_when_disposing {
                processor.try_enqueue_event_priority(drpc_protocol::WireMessage::ScopeDiscarded(
                    ScopeDiscarded { scope_id: self.id },
                ));
            }
            processor.shared().remote_scopes.remove_exact(self);
        }
        self.drop_state();
    }

    /// The hosting peer discarded the scope.
    pub(crate) fn dispose_from_peer(self: &Arc<Self>) {
        if self.discarded.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(processor) = self.processor() {
            processor.shared().remote_scopes.remove_exact(self);
        }
        self.drop_state();
    }

    fn drop_state(&self) {
        if self.will_dispose_value() {
            let dropped = self.state.lock().expect("scope state poisoned").take();
            if dropped.is_some() {
                tracing::debug!(scope_id = self.id, "disposed remote scope state");
            }
        }
    }

    fn processor(&self) -> Option<RpcProcessor> {
        self.processor.upgrade().map(RpcProcessor::from_shared)
    }
}

impl std::fmt::Debug for RemoteScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteScope")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("scope_type", &self.scope_type)
            .field("is_stored", &self.is_stored)
            .field("discarded", &self.is_discarded())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Wire handling
// ---------------------------------------------------------------------------

/// Materialize a remote scope from a wire value, storing it when flagged.
///
/// The replaced instance (under `replace_existing`) is disposed after the
/// swap, as its policies dictate.
pub(crate) fn materialize_remote_scope(
    processor: &RpcProcessor,
    value: &ScopeValue,
) -> Result<Arc<RemoteScope>, RpcError> {
    let shared = processor.shared();
    if !shared.options.use_scopes {
        return Err(RpcError::Protocol(
            "scope value received but scopes are disabled".to_owned(),
        ));
    }
    let def = shared
        .options
        .scope_types
        .get(&value.scope_type)
        .ok_or_else(|| {
            RpcError::Protocol(format!("unknown scope type: {}", value.scope_type))
        })?;

    let scope = RemoteScope::from_value(value, processor.downgrade());
    if value.is_stored {
        let replaced = shared
            .remote_scopes
            .insert(Arc::clone(&scope), value.replace_existing)?;
        if let Some(replaced) = replaced {
            tracing::debug!(
                scope_id = replaced.id(),
                key = replaced.key(),
                "replaced stored remote scope"
            );
            replaced.dispose();
        }
    }
    if let Some(hook) = &def.on_remote_created {
        hook(processor, &scope);
    }
    tracing::debug!(
        scope_id = scope.id(),
        scope_type = %scope.scope_type(),
        stored = scope.is_stored(),
        "remote scope materialized"
    );
    Ok(scope)
}

/// Inbound `scope_registration`: the peer announces a persistent handle.
pub(crate) async fn handle_scope_registration(
    processor: &RpcProcessor,
    message: ScopeRegistration,
) -> Result<(), RpcError> {
    if !message.scope.is_stored {
        return Err(RpcError::Protocol(
            "scope registration for a scope that would not be stored".to_owned(),
        ));
    }
    match materialize_remote_scope(processor, &message.scope) {
        Ok(_scope) => {
            processor.send_response(message.id, None).await;
            Ok(())
        }
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => {
            processor.send_error_response(message.id, &e).await;
            Ok(())
        }
    }
}

/// Inbound `scope_event`: dispatch into the addressed scope's event table.
pub(crate) async fn handle_scope_event(processor: &RpcProcessor, message: ScopeEventMsg) {
    let shared = processor.shared();
    let registry = shared
        .local_scopes
        .get(message.scope_id)
        .map(|scope| scope.events().clone())
        .or_else(|| {
            shared
                .remote_scopes
                .get(message.scope_id)
                .map(|scope| scope.events().clone())
        });

    match registry {
        Some(registry) => {
            crate::events::dispatch_into(
                processor,
                &registry,
                message.name,
                message.arguments,
                message.id,
                message.waiting,
                Some(message.scope_id),
            )
            .await;
        }
        None => {
            tracing::warn!(scope_id = message.scope_id, event = %message.name, "event for unknown scope");
            if message.waiting {
                if let Some(id) = message.id {
                    processor
                        .send_error_response(
                            id,
                            &RpcError::call(
                                error_codes::UNKNOWN_EVENT,
                                format!("no scope with id {}", message.scope_id),
                            ),
                        )
                        .await;
                }
            }
        }
    }
}

/// Inbound `scope_discarded`: the peer says a scope is gone.  Unknown ids
/// are tolerated; our own dispose may have raced theirs.
pub(crate) fn handle_scope_discarded(processor: &RpcProcessor, message: ScopeDiscarded) {
    let shared = processor.shared();
    if let Some(remote) = shared.remote_scopes.get(message.scope_id) {
        tracing::debug!(scope_id = message.scope_id, "peer discarded hosted scope");
        remote.dispose_from_peer();
        return;
    }
    if let Some(local) = shared.local_scopes.get(message.scope_id) {
        tracing::debug!(scope_id = message.scope_id, "peer dropped handle to local scope");
        local.dispose_from_peer();
        return;
    }
    tracing::debug!(scope_id = message.scope_id, "discard for unknown scope ignored");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(id: i64, key: Option<&str>) -> Arc<LocalScope> {
        let mut builder = ScopeBuilder::new("test").stored();
        if let Some(key) = key {
            builder = builder.key(key);
        }
        LocalScope::from_builder(id, builder, Weak::new())
    }

    #[test]
    fn insert_indexes_by_id_and_key() {
        let table: ScopeTable<LocalScope> = ScopeTable::new(8);
        let scope = local(1, Some("alpha"));
        table.insert(Arc::clone(&scope), false).unwrap();

        assert!(Arc::ptr_eq(&table.get(1).unwrap(), &scope));
        assert!(Arc::ptr_eq(&table.get_by_key("alpha").unwrap(), &scope));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn key_conflict_errors_without_replace() {
        let table: ScopeTable<LocalScope> = ScopeTable::new(8);
        table.insert(local(1, Some("k")), false).unwrap();
        let err = table.insert(local(2, Some("k")), false).unwrap_err();
        assert!(matches!(err, RpcError::Call { code, .. } if code == error_codes::SCOPE_CONFLICT));
    }

    #[test]
    fn replace_swaps_and_returns_the_old_instance() {
        let table: ScopeTable<LocalScope> = ScopeTable::new(8);
        let old = local(1, Some("k"));
        table.insert(Arc::clone(&old), false).unwrap();

        let new = local(2, Some("k"));
        let replaced = table.insert(Arc::clone(&new), true).unwrap().unwrap();
        assert!(Arc::ptr_eq(&replaced, &old));
        assert!(table.get(1).is_none(), "old id must be gone");
        assert!(Arc::ptr_eq(&table.get_by_key("k").unwrap(), &new));
    }

    #[test]
    fn duplicate_id_is_a_protocol_error() {
        let table: ScopeTable<LocalScope> = ScopeTable::new(8);
        table.insert(local(1, None), false).unwrap();
        assert!(matches!(
            table.insert(local(1, None), false),
            Err(RpcError::Protocol(_))
        ));
    }

    #[test]
    fn limit_is_enforced() {
        let table: ScopeTable<LocalScope> = ScopeTable::new(1);
        table.insert(local(1, None), false).unwrap();
        assert!(matches!(
            table.insert(local(2, None), false),
            Err(RpcError::Capacity { .. })
        ));
    }

    #[test]
    fn remove_exact_spares_a_newer_instance_under_the_same_key() {
        let table: ScopeTable<LocalScope> = ScopeTable::new(8);
        let old = local(1, Some("k"));
        table.insert(Arc::clone(&old), false).unwrap();
        let new = local(2, Some("k"));
        table.insert(Arc::clone(&new), true).unwrap();

        // Removing the replaced instance must not disturb the new one.
        assert!(!table.remove_exact(&old));
        assert!(Arc::ptr_eq(&table.get_by_key("k").unwrap(), &new));
        assert!(table.remove_exact(&new));
        assert!(table.get_by_key("k").is_none());
    }

    #[test]
    fn will_dispose_value_matrix() {
        let plain = LocalScope::from_builder(
            1,
            ScopeBuilder::new("t").dispose_value(false),
            Weak::new(),
        );
        assert!(!plain.will_dispose_value());

        let on_error = LocalScope::from_builder(
            2,
            ScopeBuilder::new("t")
                .dispose_value(false)
                .dispose_value_on_error(true),
            Weak::new(),
        );
        assert!(!on_error.will_dispose_value());
        on_error.set_error(RpcError::Canceled);
        assert!(on_error.will_dispose_value());

        let always = LocalScope::from_builder(3, ScopeBuilder::new("t"), Weak::new());
        assert!(always.will_dispose_value());
    }

    #[test]
    fn return_factories_claim_values_in_order() {
        let types = ScopeTypes::default();
        types.register_tag("blob");
        types.register_return_factory(|value| {
            value.get("blob").map(|_| ScopeBuilder::new("blob").stored())
        });

        assert!(types
            .return_scope_for(&serde_json::json!({ "blob": [1, 2] }))
            .is_some());
        assert!(types.return_scope_for(&serde_json::json!(42)).is_none());
    }
}
