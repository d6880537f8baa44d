//! Outgoing message queue.
//!
//! A bounded, priority-ordered queue with exactly one consumer: the writer
//! task that owns the write half of the link.  Ordering is
//! (priority descending, enqueue order), the only ordering the peer ever
//! observes.  Enqueueing hands back a completion receiver so callers can
//! await the moment their message actually hit the transport.

use crate::error::RpcError;
use drpc_protocol::WireMessage;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, oneshot};

/// Receiver side of a write completion.
pub(crate) type WriteDone = oneshot::Receiver<Result<(), RpcError>>;

/// One queued message, ready for the writer task.
pub(crate) struct QueuedMessage {
    priority: u8,
    seq: u64,
    pub(crate) message: WireMessage,
    done: Option<oneshot::Sender<Result<(), RpcError>>>,
    /// Capacity permit; released when the entry is dropped after writing.
    _permit: Option<OwnedSemaphorePermit>,
}

impl QueuedMessage {
    /// Report the write outcome to whoever is awaiting it.
    pub(crate) fn complete(&mut self, result: Result<(), RpcError>) {
        if let Some(done) = self.done.take() {
            let _ = done.send(result);
        }
    }
}

impl PartialEq for QueuedMessage {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedMessage {}

impl PartialOrd for QueuedMessage {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedMessage {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: higher priority first, then FIFO within a priority.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct QueueInner {
    heap: BinaryHeap<QueuedMessage>,
    next_seq: u64,
    closed: bool,
}

/// The queue itself.  Producers enqueue from any task; exactly one consumer
/// calls [`OutgoingQueue::next`].
pub(crate) struct OutgoingQueue {
    inner: Mutex<QueueInner>,
    slots: Arc<Semaphore>,
    ready: Notify,
}

impl OutgoingQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                heap: BinaryHeap::new(),
                next_seq: 0,
                closed: false,
            }),
            slots: Arc::new(Semaphore::new(capacity)),
            ready: Notify::new(),
        }
    }

    /// Enqueue, waiting for a free slot.  Returns the write-completion
    /// receiver.
    pub(crate) async fn enqueue(
        &self,
        priority: u8,
        message: WireMessage,
    ) -> Result<WriteDone, RpcError> {
        let permit = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| RpcError::Lifecycle("stopped"))?;
        let (done_tx, done_rx) = oneshot::channel();
        self.push(priority, message, Some(done_tx), Some(permit))?;
        Ok(done_rx)
    }

    /// Best-effort enqueue for teardown traffic: never waits, never fails
    /// loudly.  Returns whether the message was accepted.
    pub(crate) fn try_enqueue(&self, priority: u8, message: WireMessage) -> bool {
        let Ok(permit) = Arc::clone(&self.slots).try_acquire_owned() else {
            return false;
        };
        self.push(priority, message, None, Some(permit)).is_ok()
    }

    fn push(
        &self,
        priority: u8,
        message: WireMessage,
        done: Option<oneshot::Sender<Result<(), RpcError>>>,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Result<(), RpcError> {
        let mut inner = self.inner.lock().expect("outgoing queue poisoned");
        if inner.closed {
            return Err(RpcError::Lifecycle("stopped"));
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.heap.push(QueuedMessage {
            priority,
            seq,
            message,
            done,
            _permit: permit,
        });
        drop(inner);
        self.ready.notify_one();
        Ok(())
    }

    /// Next message for the writer task.  After [`OutgoingQueue::close`],
    /// keeps draining what was already queued, then yields `None`.
    pub(crate) async fn next(&self) -> Option<QueuedMessage> {
        loop {
            let notified = self.ready.notified();
            {
                let mut inner = self.inner.lock().expect("outgoing queue poisoned");
                if let Some(entry) = inner.heap.pop() {
                    return Some(entry);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Refuse new entries; the writer drains the rest.  Idempotent.
    pub(crate) fn close(&self) {
        {
            let mut inner = self.inner.lock().expect("outgoing queue poisoned");
            inner.closed = true;
        }
        self.slots.close();
        self.ready.notify_waiters();
        self.ready.notify_one();
    }

    /// Drop everything still queued, failing their completions.  For the
    /// exceptional path where the transport is already gone.
    pub(crate) fn fail_queued(&self, error: &RpcError) {
        self.close();
        let drained: Vec<QueuedMessage> = {
            let mut inner = self.inner.lock().expect("outgoing queue poisoned");
            inner.heap.drain().collect()
        };
        for mut entry in drained {
            entry.complete(Err(error.clone()));
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().expect("outgoing queue poisoned").heap.len()
    }
}
