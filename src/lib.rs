// duplex-rpc: Facade over the workspace crates.
//
// Re-exports the wire protocol, the processor, and the configuration
// surface so embedding applications depend on one crate.

pub use drpc_core::{
    ApiBuilder, ApiDescriptor, ApiRegistry, Argument, ByteSource, CallContext, DisposePolicy,
    EventContext, EventRegistry, Expectation, IncomingHandle, KeepAliveOptions, LocalScope,
    MethodBuilder, MethodDescriptor, MethodOutcome, ParamSource, ParamSpec, PriorityOptions,
    ProcessorInfo, ProcessorOptions, ProcessorState, QueueOptions, RemoteScope, RequestOptions,
    RpcError, RpcProcessor, ScopeBuilder, ScopeTypeDef, ScopeTypes, ServiceKey, ServiceMap,
};
pub use drpc_protocol::{
    CodecError, ErrorInfo, MessageId, MessageReader, MessageWriter, ScopeValue, StreamValue,
    WireMessage, error_codes,
};
