#![deny(unsafe_code)]

//! Distributed call tracing for parley.
//!
//! A [`Trace`] is a tree of [`CallRecord`]s rooted at one caller. Every
//! instrumented client appends a record for each outgoing call and grafts
//! the callee's subtree onto it when the response returns; every
//! instrumented server adopts the incoming trace, lets its handlers extend
//! it through their own outgoing calls, and ships the grown subtree back in
//! the response headers.
//!
//! Wire economy: the request header carries only the trace's uuid (and an
//! empty call list); the response header carries the callee's full subtree.
//!
//! # Usage
//!
//! ```ignore
//! use parley_tracing::{enable_tracing, Trace, TracingOptions, TracingTarget};
//!
//! enable_tracing(TracingTarget::Client(&client), TracingOptions::default());
//! enable_tracing(TracingTarget::Server(&server), TracingOptions::default());
//!
//! let trace = Trace::new();
//! let mut opts = parley_session::EmitOptions::default();
//! opts.locals.insert(trace.clone());
//! client.emit_message("neg", request, opts).await?;
//! assert!(trace.calls().iter().all(|call| call.response_time.is_some()));
//! ```

mod middleware;
mod record;

pub use middleware::{enable_tracing, TracingOptions, TracingTarget};
pub use record::{CallRecord, CallState, Trace, TraceCodecError, TraceData};

#[cfg(test)]
mod tests;
