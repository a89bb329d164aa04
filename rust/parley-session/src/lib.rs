#![deny(unsafe_code)]

//! Channels, clients, servers, and the middleware pipeline.
//!
//! This crate is the engine of parley. A [`Client`] or [`Server`] owns a set
//! of [`Channel`]s; each channel is a negotiated session over one transport
//! at one scope. Calls flow through a [`Middleware`] chain (forward phase,
//! terminal, reverse phase) on both sides, seeing the per-call
//! [`WrappedRequest`]/[`WrappedResponse`] envelopes with their binary
//! headers and sharing state through [`CallContext::locals`].
//!
//! Transports come in two shapes: [`FrameTransport`] for stateful duplexes
//! (handshake once, many pipelined calls) and [`StatelessTransport`] for
//! one-sink-per-call transports where the handshake rides every request.

#[macro_use]
mod macros;

mod channel;
mod context;
mod driver;
mod errors;
mod extensions;
mod middleware;
mod mux;
mod transport;

pub mod client;
pub mod server;

pub use channel::{Channel, ChannelInfo, ChannelOptions, ChannelState};
pub use client::{Client, ClientOptions, EmitOptions};
pub use context::{CallContext, Locals, WrappedRequest, WrappedResponse};
pub use errors::{ErrorKind, RemoteError, ServiceError};
pub use extensions::Extensions;
pub use middleware::{run_pipeline, FnMiddleware, Middleware, Terminal};
pub use mux::{scope_mux, MuxTransport};
pub use server::{Handler, Server, ServerOptions};
pub use transport::{
    memory_pair, FrameTransport, LengthPrefixed, MemoryTransport, StatelessTransport,
};

pub use parley_core::{request_field, Message, Service};
pub use parley_wire::Metadata;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Boxed future type used across dyn traits in this crate.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Default bound for internal channels.
pub(crate) const CHANNEL_SIZE: usize = 256;

/// Constructors hanging off a compiled [`Service`].
pub trait ServiceExt {
    /// Create a client for this protocol.
    fn create_client(&self, opts: ClientOptions) -> Client;

    /// Create a server for this protocol.
    fn create_server(&self, opts: ServerOptions) -> Server;
}

impl ServiceExt for Arc<Service> {
    fn create_client(&self, opts: ClientOptions) -> Client {
        Client::new(self.clone(), opts)
    }

    fn create_server(&self, opts: ServerOptions) -> Server {
        Server::new(self.clone(), opts)
    }
}

#[cfg(test)]
mod tests;
