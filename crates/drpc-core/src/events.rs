//! Event subsystem.
//!
//! Named events with at most one handler per name per side.  An inbound
//! event either fires-and-forgets into its handler or, when the sender set
//! `waiting`, is acknowledged with a response/error response.  The same
//! registry type backs both the processor-wide table and each scope's own
//! event table.

use crate::error::RpcError;
use crate::processor::RpcProcessor;
use drpc_protocol::{Event, error_codes};
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// What an event handler sees.
#[derive(Clone)]
pub struct EventContext {
    processor: RpcProcessor,
    name: String,
    arguments: Option<serde_json::Value>,
    /// Set when the event was addressed to a scope.
    scope_id: Option<i64>,
}

impl EventContext {
    pub(crate) fn new(
        processor: RpcProcessor,
        name: String,
        arguments: Option<serde_json::Value>,
        scope_id: Option<i64>,
    ) -> EventContext {
        EventContext {
            processor,
            name,
            arguments,
            scope_id,
        }
    }

    pub fn processor(&self) -> &RpcProcessor {
        &self.processor
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arguments(&self) -> Option<&serde_json::Value> {
        self.arguments.as_ref()
    }

    pub fn scope_id(&self) -> Option<i64> {
        self.scope_id
    }
}

/// Handler callable for one registered event.
pub type EventHandler =
    Arc<dyn Fn(EventContext) -> BoxFuture<'static, Result<(), RpcError>> + Send + Sync>;

/// Event-name → handler table.  Names are unique; re-registration is an
/// error, not a silent replace.
#[derive(Clone, Default)]
pub struct EventRegistry {
    map: Arc<RwLock<HashMap<String, EventHandler>>>,
}

impl EventRegistry {
    pub fn register<F, Fut>(&self, name: impl Into<String>, handler: F) -> Result<(), RpcError>
    where
        F: Fn(EventContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), RpcError>> + Send + 'static,
    {
        let name = name.into();
        let mut map = self.map.write().expect("event registry poisoned");
        if map.contains_key(&name) {
            return Err(RpcError::call(
                error_codes::INTERNAL_ERROR,
                format!("event already registered: {name}"),
            ));
        }
        map.insert(name, Arc::new(move |ctx| Box::pin(handler(ctx))));
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.map
            .write()
            .expect("event registry poisoned")
            .remove(name)
            .is_some()
    }

    pub(crate) fn get(&self, name: &str) -> Option<EventHandler> {
        self.map
            .read()
            .expect("event registry poisoned")
            .get(name)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.map.read().expect("event registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Inbound dispatch
// ---------------------------------------------------------------------------

/// Handle an inbound processor-wide event.
pub(crate) async fn handle_event(processor: &RpcProcessor, event: Event) {
    dispatch_into(
        processor,
        &processor.events().clone(),
        event.name,
        event.arguments,
        event.id,
        event.waiting,
        None,
    )
    .await;
}

/// Shared dispatch for processor-wide and scope-scoped events.
pub(crate) async fn dispatch_into(
    processor: &RpcProcessor,
    registry: &EventRegistry,
    name: String,
    arguments: Option<serde_json::Value>,
    id: Option<i64>,
    waiting: bool,
    scope_id: Option<i64>,
) {
    let Some(handler) = registry.get(&name) else {
        tracing::warn!(event = %name, ?scope_id, "no handler for inbound event");
        if waiting {
            if let Some(id) = id {
                processor
                    .send_error_response(
                        id,
                        &RpcError::call(
                            error_codes::UNKNOWN_EVENT,
                            format!("no handler for event: {name}"),
                        ),
                    )
                    .await;
            }
        }
        return;
    };

    let ctx = EventContext::new(processor.clone(), name.clone(), arguments, scope_id);
    match handler(ctx).await {
        Ok(()) => {
            tracing::debug!(event = %name, ?scope_id, waiting, "event handled");
            if waiting {
                if let Some(id) = id {
                    processor.send_response(id, None).await;
                }
            }
        }
        Err(e) => {
            if waiting {
                if let Some(id) = id {
                    processor.send_error_response(id, &e).await;
                }
            } else {
                // Fire-and-forget handler failures stay on this side.
                tracing::warn!(event = %name, error = %e, "event handler failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_is_unique_per_name() {
        let registry = EventRegistry::default();
        registry
            .register("refresh", |_ctx| async { Ok(()) })
            .unwrap();
        assert!(registry.register("refresh", |_ctx| async { Ok(()) }).is_err());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn unregister_frees_the_name() {
        let registry = EventRegistry::default();
        registry.register("tick", |_ctx| async { Ok(()) }).unwrap();
        assert!(registry.unregister("tick"));
        assert!(!registry.unregister("tick"));
        registry.register("tick", |_ctx| async { Ok(()) }).unwrap();
        assert_eq!(registry.len(), 1);
    }
}
