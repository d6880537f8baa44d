// drpc-core: The RPC processor and its subsystems.
//
// One processor binds one duplex byte stream.  Both peers are symmetric:
// each serves the APIs it registered and invokes the peer's, raises and
// handles events, transfers streams chunk by chunk, and shares long-lived
// scopes.  See the crate modules for the individual subsystems; the
// `processor` module ties them together.

pub mod api;
pub mod context;
pub mod error;
pub mod events;
mod heartbeat;
pub mod options;
pub mod processor;
pub mod scopes;
pub mod streams;

mod calls;
mod outgoing;
mod requests;

pub use api::{
    ApiBuilder, ApiDescriptor, ApiRegistry, Argument, DisposePolicy, Expectation, MethodBuilder,
    MethodDescriptor, MethodOutcome, ParamSource, ParamSpec,
};
pub use context::{CallContext, ServiceKey, ServiceMap};
pub use error::RpcError;
pub use events::{EventContext, EventRegistry};
pub use options::{KeepAliveOptions, PriorityOptions, ProcessorOptions, QueueOptions};
pub use processor::{ProcessorInfo, ProcessorState, RequestOptions, RpcProcessor};
pub use scopes::{LocalScope, RemoteScope, ScopeBuilder, ScopeTypeDef, ScopeTypes};
pub use streams::{ByteSource, IncomingHandle};
