#![deny(unsafe_code)]

//! An Avro RPC runtime.
//!
//! parley builds services and clients that exchange strongly-typed messages
//! defined by Avro protocols, over stateful or stateless transports, with a
//! forward/reverse middleware pipeline around every call, a multi-scope
//! HTTP proxy, and distributed call tracing.
//!
//! This crate is the facade: it re-exports the workspace and adds
//! URL-scheme dialing ([`dial`]).
//!
//! ```ignore
//! use parley::{dial, ChannelOptions, ClientOptions, EmitOptions, Service, ServiceExt};
//! use std::sync::Arc;
//!
//! let service = Arc::new(Service::compile(PROTOCOL_JSON)?);
//! let client = service.create_client(ClientOptions::default());
//! dial(&client, "tcp://localhost:24950", ChannelOptions::default()).await?;
//! let response = client.emit_message("neg", request, EmitOptions::default()).await?;
//! ```

mod dial;

pub use dial::{dial, DEFAULT_TCP_PORT};

pub use parley_core::{request_field, transcode, Message, SchemaError, Service};
pub use parley_session::{
    memory_pair, run_pipeline, scope_mux, BoxFuture, CallContext, Channel, ChannelInfo,
    ChannelOptions, ChannelState, Client, ClientOptions, EmitOptions, ErrorKind, Extensions,
    FnMiddleware, FrameTransport, Handler, LengthPrefixed, Locals, MemoryTransport, Metadata,
    Middleware, MuxTransport, RemoteError, Server, ServerOptions, ServiceError, ServiceExt,
    StatelessTransport, Terminal, WrappedRequest, WrappedResponse,
};
pub use parley_tracing::{
    enable_tracing, CallRecord, CallState, Trace, TraceData, TracingOptions, TracingTarget,
};

pub use parley_proxy as proxy;
pub use parley_websocket as websocket;
pub use parley_wire as wire;
