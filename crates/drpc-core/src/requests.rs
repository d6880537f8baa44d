//! Pending-request registry.
//!
//! Maps outgoing message ids to the oneshot that completes the caller.
//! Completion is exactly-once: whichever of response, error response,
//! cancellation, timeout, or disposal gets there first wins; the rest see
//! the entry gone and back off.  Late answers from the peer are normal
//! (cancellation races) and are dropped after a debug log by the caller.

use crate::error::RpcError;
use drpc_protocol::MessageId;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;
use tokio::sync::oneshot;

/// What a completed request resolves to: the peer's return value, if any.
pub(crate) type RequestResult = Result<Option<serde_json::Value>, RpcError>;

struct PendingEntry {
    complete: oneshot::Sender<RequestResult>,
    created: Instant,
}

/// Registry of requests awaiting an answer from the peer.
#[derive(Default)]
pub(crate) struct PendingRequests {
    map: Mutex<HashMap<MessageId, PendingEntry>>,
}

impl PendingRequests {
    /// Register a fresh id.  Ids come from a monotonic counter, so a clash
    /// is a local bug, not peer input; it is still reported, never ignored.
    pub(crate) fn insert(&self, id: MessageId) -> Result<oneshot::Receiver<RequestResult>, RpcError> {
        let (tx, rx) = oneshot::channel();
        let mut map = self.map.lock().expect("pending requests poisoned");
        if map.contains_key(&id) {
            return Err(RpcError::Protocol(format!(
                "message id {id} already has a pending request"
            )));
        }
        map.insert(
            id,
            PendingEntry {
                complete: tx,
                created: Instant::now(),
            },
        );
        Ok(rx)
    }

    /// Complete and remove.  Returns false when the id is unknown (late or
    /// unsolicited answer).
    pub(crate) fn complete(&self, id: MessageId, result: RequestResult) -> bool {
        let entry = {
            let mut map = self.map.lock().expect("pending requests poisoned");
            map.remove(&id)
        };
        match entry {
            Some(entry) => {
                tracing::trace!(
                    id,
                    elapsed_ms = entry.created.elapsed().as_millis() as u64,
                    "pending request completed"
                );
                let _ = entry.complete.send(result);
                true
            }
            None => false,
        }
    }

    /// Remove without completing; the caller already observed its own
    /// outcome (timeout, cancellation).
    pub(crate) fn forget(&self, id: MessageId) -> bool {
        self.map
            .lock()
            .expect("pending requests poisoned")
            .remove(&id)
            .is_some()
    }

    /// Fail every outstanding request with the same terminal error.
    pub(crate) fn fail_all(&self, error: &RpcError) {
        let drained: Vec<(MessageId, PendingEntry)> = {
            let mut map = self.map.lock().expect("pending requests poisoned");
            map.drain().collect()
        };
        for (id, entry) in drained {
            tracing::debug!(id, error = %error, "failing pending request on shutdown");
            let _ = entry.complete.send(Err(error.clone()));
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.map.lock().expect("pending requests poisoned").len()
    }
}
