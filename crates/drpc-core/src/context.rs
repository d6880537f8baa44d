//! Per-call context and the typed service locator.
//!
//! The service map is the small DI surface the call pipeline queries for
//! parameters that are neither RPC-supplied nor scope-bound.  It is not a
//! general-purpose container: type-keyed lookup, nothing else.

use crate::api::MethodDescriptor;
use crate::processor::RpcProcessor;
use drpc_protocol::Request;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// ServiceMap
// ---------------------------------------------------------------------------

/// Type-keyed service locator.
///
/// Cloning shares the underlying map; [`ServiceMap::fork`] copies the
/// entries so per-call registrations do not leak into the template.
#[derive(Clone, Default)]
pub struct ServiceMap {
    entries: Arc<RwLock<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>>,
}

impl ServiceMap {
    pub fn insert<T: Send + Sync + 'static>(&self, service: Arc<T>) {
        self.entries
            .write()
            .expect("service map poisoned")
            .insert(TypeId::of::<T>(), service);
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.get_by_id(TypeId::of::<T>())
            .and_then(|any| any.downcast::<T>().ok())
    }

    pub fn get_by_id(&self, id: TypeId) -> Option<Arc<dyn Any + Send + Sync>> {
        self.entries
            .read()
            .expect("service map poisoned")
            .get(&id)
            .cloned()
    }

    /// Copy the entries into an independent map.
    pub fn fork(&self) -> ServiceMap {
        let entries = self.entries.read().expect("service map poisoned").clone();
        ServiceMap {
            entries: Arc::new(RwLock::new(entries)),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("service map poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Lookup key for service-sourced parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceKey(TypeId);

impl ServiceKey {
    pub fn of<T: Send + Sync + 'static>() -> ServiceKey {
        ServiceKey(TypeId::of::<T>())
    }

    pub(crate) fn type_id(self) -> TypeId {
        self.0
    }
}

// ---------------------------------------------------------------------------
// CallContext
// ---------------------------------------------------------------------------

struct ContextInner {
    processor: RpcProcessor,
    request: Request,
    method: Arc<MethodDescriptor>,
    services: ServiceMap,
    cancel: CancellationToken,
}

/// Everything a method handler (and its authorizers) can reach about the
/// call being served.  Cheap to clone.
#[derive(Clone)]
pub struct CallContext {
    inner: Arc<ContextInner>,
}

impl CallContext {
    pub(crate) fn new(
        processor: RpcProcessor,
        request: Request,
        method: Arc<MethodDescriptor>,
        services: ServiceMap,
        cancel: CancellationToken,
    ) -> CallContext {
        // The call pipeline seeds the map with the processor handle and the
        // composite cancellation so service-sourced parameters can bind them.
        services.insert(Arc::new(processor.clone()));
        services.insert(Arc::new(cancel.clone()));
        CallContext {
            inner: Arc::new(ContextInner {
                processor,
                request,
                method,
                services,
                cancel,
            }),
        }
    }

    pub fn processor(&self) -> &RpcProcessor {
        &self.inner.processor
    }

    pub fn request(&self) -> &Request {
        &self.inner.request
    }

    pub fn method(&self) -> &Arc<MethodDescriptor> {
        &self.inner.method
    }

    pub fn services(&self) -> &ServiceMap {
        &self.inner.services
    }

    /// Composite cancellation: processor ∨ call queue ∨ this call.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.inner.cancel
    }
}
