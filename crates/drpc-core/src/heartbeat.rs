//! Dual heartbeat.
//!
//! Two timers off the processor's last-sent/last-received instants: the
//! self timer pings after `timeout` of outbound silence and expects the
//! pong within `peer_timeout`; the peer timer declares the link dead after
//! `timeout + peer_timeout` of inbound silence.  Every written message
//! resets the first, every received message the second, so an active link
//! never pings at all.

use crate::error::RpcError;
use crate::options::KeepAliveOptions;
use crate::processor::RpcProcessor;
use drpc_protocol::{Ping, WireMessage};
use std::time::{Duration, Instant};

pub(crate) async fn run(processor: RpcProcessor, options: KeepAliveOptions) {
    let cancel = processor.shared().cancel.clone();
    loop {
        let now = Instant::now();
        let self_deadline = processor.last_sent() + options.timeout;
        let peer_deadline = processor.last_received() + options.timeout + options.peer_timeout;

        if now >= peer_deadline {
            tracing::error!(
                silent_ms = now.duration_since(processor.last_received()).as_millis() as u64,
                "peer heartbeat expired"
            );
            processor.stop_exceptional(RpcError::Timeout("peer heartbeat timeout".to_owned()));
            return;
        }

        if now >= self_deadline {
            match ping(&processor, options.peer_timeout).await {
                Ok(()) => continue,
                Err(RpcError::Lifecycle(_)) | Err(RpcError::Canceled) => return,
                Err(e) => {
                    tracing::error!(error = %e, "heartbeat ping failed");
                    processor
                        .stop_exceptional(RpcError::Timeout("heartbeat timeout".to_owned()));
                    return;
                }
            }
        }

        let next = self_deadline.min(peer_deadline);
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep_until(next.into()) => {}
        }
    }
}

/// One ping/pong round-trip, correlated through the pending-request
/// registry like any other request.  Also the manual `ping()` entry point.
pub(crate) async fn ping(processor: &RpcProcessor, timeout: Duration) -> Result<(), RpcError> {
    let id = processor.next_message_id();
    let ack = processor.shared().pending.insert(id)?;
    processor
        .enqueue_event_priority_wait(WireMessage::Ping(Ping { id }))
        .await?;
    tracing::debug!(id, "ping sent");

    match tokio::time::timeout(timeout, ack).await {
        Err(_) => {
            processor.shared().pending.forget(id);
            Err(RpcError::Timeout("pong did not arrive in time".to_owned()))
        }
        Ok(Ok(Ok(_))) => Ok(()),
        Ok(Ok(Err(e))) => Err(e),
        Ok(Err(_)) => Err(RpcError::Lifecycle("disposed")),
    }
}
