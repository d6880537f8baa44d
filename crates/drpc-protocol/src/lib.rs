// drpc-protocol: Wire message types and framing for the duplex RPC link.
//
// All messages use a top-level `kind` field for discriminated
// deserialization.  The enum variants map 1:1 to the frozen message kinds
// exchanged by two symmetric peers over one duplex byte stream.

use serde::{Deserialize, Serialize};

pub mod codec;

pub use codec::{CodecError, MessageReader, MessageWriter, SERIALIZER_VERSION};

/// Correlation id carried by request-bearing message kinds.
///
/// Signed 64-bit, allocated monotonically per direction.  An id is never
/// reused while a correlation for it is still pending.
pub type MessageId = i64;

// ---------------------------------------------------------------------------
// Shared sub-types
// ---------------------------------------------------------------------------

/// The frozen error envelope carried by `error_response` and stream close
/// messages.
///
/// `retryable` is advisory: it tells the peer whether re-issuing the same
/// operation can succeed without operator intervention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// One of the frozen codes in [`error_codes`].
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

/// Frozen error codes.
pub mod error_codes {
    pub const PROTOCOL_ERROR: &str = "PROTOCOL_ERROR";
    pub const DOUBLE_MESSAGE_ID: &str = "DOUBLE_MESSAGE_ID";
    pub const TOO_MANY_RPC_REQUESTS: &str = "TOO_MANY_RPC_REQUESTS";
    pub const TOO_MANY_SCOPES: &str = "TOO_MANY_SCOPES";
    pub const TOO_MANY_STREAMS: &str = "TOO_MANY_STREAMS";
    pub const METHOD_NOT_FOUND: &str = "METHOD_NOT_FOUND";
    pub const NOT_AUTHORIZED: &str = "NOT_AUTHORIZED";
    pub const ARGUMENT_ERROR: &str = "ARGUMENT_ERROR";
    pub const INCOMPATIBLE_VERSION: &str = "INCOMPATIBLE_VERSION";
    pub const SCOPE_CONFLICT: &str = "SCOPE_CONFLICT";
    pub const UNKNOWN_EVENT: &str = "UNKNOWN_EVENT";
    pub const CALL_ERROR: &str = "CALL_ERROR";
    pub const CANCELED: &str = "CANCELED";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

/// Wire representation of a scope handle.
///
/// Sent inside parameters, return values, and `scope_registration` messages.
/// The numeric `id` is assigned by the hosting side; `key` is an optional
/// stable string address.  Dispose flags travel with the value so the remote
/// side knows what to do with the held state when the handle goes away.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeValue {
    /// Type tag resolved against the receiver's scope factory registry.
    pub scope_type: String,
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Whether the hosting side keeps the scope addressable after the call
    /// that carried it completes.
    pub is_stored: bool,
    pub dispose_value: bool,
    pub dispose_value_on_error: bool,
    /// Remote handles send `scope_discarded` on dispose when set.
    pub inform_when_disposing: bool,
    /// Replace an existing keyed scope instead of reporting a conflict.
    #[serde(default)]
    pub replace_existing: bool,
    /// Serialized scope state, if the scope carries a value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<serde_json::Value>,
}

/// Wire representation of a byte stream handed across the link.
///
/// Either `content` is present (small payload, inlined, no stream table
/// involvement) or `stream` carries the sender-assigned stream id to be
/// pulled chunk by chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamValue {
    /// Sender-assigned stream id; absent for inline content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<i64>,
    /// Inline payload for streams small enough to skip chunking.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Vec<u8>>,
    /// Total length when known up front.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
    /// Compression codec tag; `None` means identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<String>,
}

// ---------------------------------------------------------------------------
// Value embedding
// ---------------------------------------------------------------------------

const SCOPE_MARKER: &str = "$scope";
const STREAM_MARKER: &str = "$stream";

impl ScopeValue {
    /// Embed this record into a JSON parameter slot.
    pub fn into_value(self) -> serde_json::Value {
        let inner = serde_json::to_value(&self).unwrap_or(serde_json::Value::Null);
        serde_json::json!({ SCOPE_MARKER: inner })
    }

    /// Recognize an embedded scope value.  Returns `None` for plain values.
    pub fn from_value(value: &serde_json::Value) -> Option<ScopeValue> {
        let obj = value.as_object()?;
        if obj.len() != 1 {
            return None;
        }
        serde_json::from_value(obj.get(SCOPE_MARKER)?.clone()).ok()
    }
}

impl StreamValue {
    /// Embed this record into a JSON parameter slot.
    pub fn into_value(self) -> serde_json::Value {
        let inner = serde_json::to_value(&self).unwrap_or(serde_json::Value::Null);
        serde_json::json!({ STREAM_MARKER: inner })
    }

    /// Recognize an embedded stream value.  Returns `None` for plain values.
    pub fn from_value(value: &serde_json::Value) -> Option<StreamValue> {
        let obj = value.as_object()?;
        if obj.len() != 1 {
            return None;
        }
        serde_json::from_value(obj.get(STREAM_MARKER)?.clone()).ok()
    }
}

// ---------------------------------------------------------------------------
// Call messages
// ---------------------------------------------------------------------------

/// An outbound method invocation.
///
/// `wants_response` controls whether the callee answers at all (fire-and-
/// forget calls set it to false); `wants_return_value` controls whether the
/// answer carries the produced value or just completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: MessageId,
    /// Target API name; `None` selects the default API.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api: Option<String>,
    pub method: String,
    #[serde(default)]
    pub parameters: Vec<serde_json::Value>,
    pub wants_return_value: bool,
    pub wants_response: bool,
}

/// Successful answer to a `request`, an acknowledged `event`, a chunk ack,
/// or a `scope_registration` ack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_value: Option<serde_json::Value>,
}

/// Failed answer to any correlation-bearing message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub id: MessageId,
    pub error: ErrorInfo,
}

/// Best-effort caller-side cancellation of a pending request.
///
/// The peer may have already answered; both sides tolerate the race.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cancel {
    pub id: MessageId,
}

// ---------------------------------------------------------------------------
// Event messages
// ---------------------------------------------------------------------------

/// A named event raised at the peer.
///
/// `waiting` requests an acknowledgement: the raiser correlates a
/// `response`/`error_response` via `id`.  Non-waiting events carry no id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<serde_json::Value>,
    pub waiting: bool,
}

// ---------------------------------------------------------------------------
// Keep-alive messages
// ---------------------------------------------------------------------------

/// Heartbeat probe.  The receiver answers with a `pong` carrying the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    pub id: MessageId,
}

/// Heartbeat answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    pub id: MessageId,
}

/// Graceful link shutdown announcement.  Carries no payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Close {}

// ---------------------------------------------------------------------------
// Scope messages
// ---------------------------------------------------------------------------

/// Announces a persistent remote handle to a scope hosted by the sender.
///
/// The receiver materializes and stores a remote scope, then acks with a
/// `response` to `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeRegistration {
    pub id: MessageId,
    pub scope: ScopeValue,
}

/// An event addressed to one scope rather than to the processor-wide event
/// table.  Semantics otherwise match [`Event`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeEvent {
    pub scope_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<serde_json::Value>,
    pub waiting: bool,
}

/// Notifies the peer that a scope is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeDiscarded {
    pub scope_id: i64,
}

// ---------------------------------------------------------------------------
// Stream messages
// ---------------------------------------------------------------------------

/// Consumer-side request to begin chunk delivery for a stream id it received
/// in a `StreamValue`.  Sent exactly once per stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamStart {
    /// The stream id, as assigned by the producing side.
    pub id: i64,
}

/// One chunk of stream data.
///
/// `id` is a fresh message id used for the chunk ack: unless this is the
/// last chunk, the producer waits for a `response` to `id` before reading
/// the next chunk.  Exactly one chunk is in flight per stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub id: MessageId,
    /// Which stream this chunk belongs to.
    pub stream: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<u8>>,
    pub is_last_chunk: bool,
}

/// Producer-side close: the source failed (or finished abnormally).
/// Carries the producer's error so the consumer can surface it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalStreamClose {
    /// The stream id.
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

/// Consumer-side close: stop producing, the consumer no longer reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteStreamClose {
    /// The stream id.
    pub id: i64,
}

// ---------------------------------------------------------------------------
// Top-level discriminated union
// ---------------------------------------------------------------------------

/// All message kinds exchanged over the duplex link.
///
/// Serializes/deserializes using the `kind` field as a tag.
///
/// ```json
/// { "kind": "request", ... }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
#[serde(rename_all = "snake_case")]
pub enum WireMessage {
    Request(Request),
    Response(Response),
    ErrorResponse(ErrorResponse),
    Cancel(Cancel),
    Event(Event),
    Ping(Ping),
    Pong(Pong),
    Close(Close),
    ScopeRegistration(ScopeRegistration),
    ScopeEvent(ScopeEvent),
    ScopeDiscarded(ScopeDiscarded),
    StreamStart(StreamStart),
    StreamChunk(StreamChunk),
    LocalStreamClose(LocalStreamClose),
    RemoteStreamClose(RemoteStreamClose),
}

impl WireMessage {
    /// The correlation id, for kinds that carry one.
    pub fn correlation_id(&self) -> Option<MessageId> {
        match self {
            WireMessage::Request(m) => Some(m.id),
            WireMessage::Response(m) => Some(m.id),
            WireMessage::ErrorResponse(m) => Some(m.id),
            WireMessage::Cancel(m) => Some(m.id),
            WireMessage::Event(m) => m.id,
            WireMessage::Ping(m) => Some(m.id),
            WireMessage::Pong(m) => Some(m.id),
            WireMessage::ScopeRegistration(m) => Some(m.id),
            WireMessage::ScopeEvent(m) => m.id,
            WireMessage::StreamChunk(m) => Some(m.id),
            WireMessage::Close(_)
            | WireMessage::ScopeDiscarded(_)
            | WireMessage::StreamStart(_)
            | WireMessage::LocalStreamClose(_)
            | WireMessage::RemoteStreamClose(_) => None,
        }
    }

    /// Short kind name for log fields.
    pub fn kind_name(&self) -> &'static str {
        match self {
            WireMessage::Request(_) => "request",
            WireMessage::Response(_) => "response",
            WireMessage::ErrorResponse(_) => "error_response",
            WireMessage::Cancel(_) => "cancel",
            WireMessage::Event(_) => "event",
            WireMessage::Ping(_) => "ping",
            WireMessage::Pong(_) => "pong",
            WireMessage::Close(_) => "close",
            WireMessage::ScopeRegistration(_) => "scope_registration",
            WireMessage::ScopeEvent(_) => "scope_event",
            WireMessage::ScopeDiscarded(_) => "scope_discarded",
            WireMessage::StreamStart(_) => "stream_start",
            WireMessage::StreamChunk(_) => "stream_chunk",
            WireMessage::LocalStreamClose(_) => "local_stream_close",
            WireMessage::RemoteStreamClose(_) => "remote_stream_close",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_value_embeds_and_detects() {
        let scope = ScopeValue {
            scope_type: "counter".to_owned(),
            id: 7,
            key: Some("session".to_owned()),
            is_stored: true,
            dispose_value: true,
            dispose_value_on_error: false,
            inform_when_disposing: false,
            replace_existing: false,
            state: Some(serde_json::json!({ "count": 0 })),
        };
        let value = scope.clone().into_value();
        assert_eq!(ScopeValue::from_value(&value), Some(scope));
    }

    #[test]
    fn plain_objects_are_not_mistaken_for_embedded_records() {
        let plain = serde_json::json!({ "x": 1, "y": 2 });
        assert_eq!(ScopeValue::from_value(&plain), None);
        assert_eq!(StreamValue::from_value(&plain), None);

        // Same key count as a marker object, wrong key.
        let single = serde_json::json!({ "payload": [1, 2, 3] });
        assert_eq!(StreamValue::from_value(&single), None);
    }

    #[test]
    fn stream_value_inline_content_roundtrip() {
        let stream = StreamValue {
            stream: None,
            content: Some(b"inline bytes".to_vec()),
            length: Some(12),
            compression: None,
        };
        let value = stream.clone().into_value();
        assert_eq!(StreamValue::from_value(&value), Some(stream));
    }

    #[test]
    fn correlation_id_is_reported_per_kind() {
        assert_eq!(
            WireMessage::Ping(Ping { id: 3 }).correlation_id(),
            Some(3)
        );
        assert_eq!(WireMessage::Close(Close {}).correlation_id(), None);
        assert_eq!(
            WireMessage::Event(Event {
                id: None,
                name: "tick".to_owned(),
                arguments: None,
                waiting: false,
            })
            .correlation_id(),
            None
        );
    }
}
