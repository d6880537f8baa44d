//! Error model for the RPC processor.
//!
//! One enum covers every failure class the processor distinguishes; the
//! fatal/non-fatal split drives whether an error answers a single request or
//! tears the whole link down.

use drpc_protocol::{ErrorInfo, error_codes};

/// All failures surfaced by the processor.
///
/// Cloneable on purpose: the same terminal error fans out to every pending
/// request when the processor stops.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum RpcError {
    /// Malformed or out-of-contract traffic from the peer.  Always fatal.
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// The peer answered with an error response.
    #[error("peer error [{}]: {}", .0.code, .0.message)]
    Remote(ErrorInfo),
    /// A local call failed (method lookup, authorization, arguments,
    /// invocation).  Answered on the wire, not fatal by itself.
    #[error("call failed [{code}]: {message}")]
    Call {
        code: &'static str,
        message: String,
    },
    /// A bounded resource is exhausted.  Answered on the wire, not fatal.
    #[error("capacity exceeded [{code}]: {message}")]
    Capacity {
        code: &'static str,
        message: String,
    },
    /// Operation attempted against a stopped or disposed processor.
    /// Raised locally, never sent.
    #[error("processor {0}")]
    Lifecycle(&'static str),
    /// A heartbeat or request deadline expired.
    #[error("timeout: {0}")]
    Timeout(String),
    /// Cooperative cancellation; normal termination of an operation.
    #[error("canceled")]
    Canceled,
    /// Transport failure underneath the codec.
    #[error("I/O: {0}")]
    Io(String),
    /// Framing or serialization failure.
    #[error("codec: {0}")]
    Codec(String),
}

impl RpcError {
    /// Whether this error must terminate the processor rather than a single
    /// operation.  Heartbeat timeouts are raised as `Timeout` and routed to
    /// `stop_exceptional` by the heartbeat task itself, so `Timeout` stays
    /// non-fatal here (request timeouts answer one caller).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RpcError::Protocol(_) | RpcError::Io(_) | RpcError::Codec(_)
        )
    }

    /// Map onto the frozen wire envelope.
    pub fn to_error_info(&self) -> ErrorInfo {
        let (code, retryable) = match self {
            RpcError::Protocol(_) => (error_codes::PROTOCOL_ERROR, false),
            RpcError::Remote(info) => return info.clone(),
            RpcError::Call { code, .. } => (*code, false),
            RpcError::Capacity { code, .. } => (*code, true),
            RpcError::Lifecycle(_) => (error_codes::INTERNAL_ERROR, true),
            RpcError::Timeout(_) => (error_codes::TIMEOUT, true),
            RpcError::Canceled => (error_codes::CANCELED, false),
            RpcError::Io(_) | RpcError::Codec(_) => (error_codes::INTERNAL_ERROR, true),
        };
        ErrorInfo {
            code: code.to_owned(),
            message: self.to_string(),
            retryable,
        }
    }

    /// Reconstruct from a peer-reported envelope.
    pub fn from_error_info(info: ErrorInfo) -> RpcError {
        match info.code.as_str() {
            error_codes::CANCELED => RpcError::Canceled,
            error_codes::TIMEOUT => RpcError::Timeout(info.message),
            _ => RpcError::Remote(info),
        }
    }

    pub(crate) fn call(code: &'static str, message: impl Into<String>) -> RpcError {
        RpcError::Call {
            code,
            message: message.into(),
        }
    }

    pub(crate) fn capacity(code: &'static str, message: impl Into<String>) -> RpcError {
        RpcError::Capacity {
            code,
            message: message.into(),
        }
    }
}

impl From<drpc_protocol::CodecError> for RpcError {
    fn from(e: drpc_protocol::CodecError) -> Self {
        match e {
            drpc_protocol::CodecError::FrameTooLarge { length, max } => RpcError::Protocol(
                format!("frame of {length} bytes exceeds maximum of {max} bytes"),
            ),
            drpc_protocol::CodecError::UnsupportedVersion(v) => {
                RpcError::Protocol(format!("unsupported serializer version {v}"))
            }
            drpc_protocol::CodecError::Io(e) => RpcError::Io(e.to_string()),
            drpc_protocol::CodecError::Json(e) => RpcError::Codec(e.to_string()),
            drpc_protocol::CodecError::Closed => RpcError::Io("stream closed".to_owned()),
        }
    }
}
