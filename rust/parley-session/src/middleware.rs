//! The middleware pipeline.
//!
//! A call runs through a chain `M₁ … Mₙ, H`: every middleware's forward
//! phase in order, then the terminal `H` (the wire write on a client, the
//! user handler on a server), then every registered reverse phase in the
//! opposite order.
//!
//! Error tunneling follows two rules:
//!
//! - a forward error at frame *i* stops the forward phase and starts the
//!   reverse phase at frame *i−1*; the failing frame's own reverse is never
//!   run,
//! - a reverse frame receives the error currently in flight and returns the
//!   error to keep propagating. Returning `None` from a frame that received
//!   `Some` is the explicit swallow: the current response becomes the
//!   call's result.
//!
//! The callback and promise styles of middleware both collapse onto
//! futures here: a forward future and an optional reverse future per frame.
//! Per-call state between the two phases travels in
//! [`CallContext::locals`](crate::CallContext::locals).

use std::sync::Arc;

use crate::{BoxFuture, CallContext, ServiceError, WrappedRequest, WrappedResponse};

/// A middleware frame.
///
/// Implementations mutate the request envelope (including headers) in
/// `forward` and the response envelope in `reverse`. The default `reverse`
/// passes the in-flight error through untouched, which is the behavior of a
/// frame that never registered a reverse hook.
pub trait Middleware: Send + Sync {
    /// Forward phase. Returning an error stops the forward phase.
    fn forward<'a>(
        &'a self,
        cx: &'a CallContext,
        wreq: &'a mut WrappedRequest,
    ) -> BoxFuture<'a, Result<(), ServiceError>>;

    /// Reverse phase. Receives the in-flight error and returns the error to
    /// keep propagating (`None` swallows it).
    fn reverse<'a>(
        &'a self,
        cx: &'a CallContext,
        wres: &'a mut WrappedResponse,
        err: Option<ServiceError>,
    ) -> BoxFuture<'a, Option<ServiceError>> {
        let _ = (cx, wres);
        Box::pin(async move { err })
    }
}

/// The terminal frame of a pipeline.
///
/// On the client this writes the request and waits for the response; on the
/// server it runs the user handler. It populates exactly one of
/// `wres.response`/`wres.error` (or neither, for one-way messages) and
/// returns the error to start the reverse phase with, if any.
pub trait Terminal: Send {
    /// Run the terminal work.
    fn run<'a>(
        &'a mut self,
        cx: &'a CallContext,
        wreq: &'a mut WrappedRequest,
        wres: &'a mut WrappedResponse,
    ) -> BoxFuture<'a, Option<ServiceError>>;
}

/// Execute a middleware chain around a terminal.
///
/// Returns the error left in flight after the reverse phase, if any. The
/// number of reverse invocations always equals the number of successful
/// forward entries.
pub async fn run_pipeline(
    chain: &[Arc<dyn Middleware>],
    cx: &CallContext,
    wreq: &mut WrappedRequest,
    wres: &mut WrappedResponse,
    terminal: &mut dyn Terminal,
) -> Option<ServiceError> {
    let mut err = None;
    let mut entered = 0;

    for middleware in chain {
        match middleware.forward(cx, wreq).await {
            Ok(()) => entered += 1,
            Err(e) => {
                err = Some(e);
                break;
            }
        }
    }

    if err.is_none() {
        err = terminal.run(cx, wreq, wres).await;
    }

    for middleware in chain[..entered].iter().rev() {
        err = middleware.reverse(cx, wres, err).await;
    }

    err
}

type ForwardFn =
    dyn Fn(&CallContext, &mut WrappedRequest) -> Result<(), ServiceError> + Send + Sync;
type ReverseFn = dyn Fn(&CallContext, &mut WrappedResponse, Option<ServiceError>) -> Option<ServiceError>
    + Send
    + Sync;

/// Middleware built from plain closures, for the common synchronous cases
/// (header stamping, bookkeeping, error mapping).
pub struct FnMiddleware {
    forward: Box<ForwardFn>,
    reverse: Option<Box<ReverseFn>>,
}

impl FnMiddleware {
    /// Create a middleware from a forward closure.
    pub fn new<F>(forward: F) -> Self
    where
        F: Fn(&CallContext, &mut WrappedRequest) -> Result<(), ServiceError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            forward: Box::new(forward),
            reverse: None,
        }
    }

    /// Register a reverse closure.
    pub fn with_reverse<R>(mut self, reverse: R) -> Self
    where
        R: Fn(&CallContext, &mut WrappedResponse, Option<ServiceError>) -> Option<ServiceError>
            + Send
            + Sync
            + 'static,
    {
        self.reverse = Some(Box::new(reverse));
        self
    }
}

impl Middleware for FnMiddleware {
    fn forward<'a>(
        &'a self,
        cx: &'a CallContext,
        wreq: &'a mut WrappedRequest,
    ) -> BoxFuture<'a, Result<(), ServiceError>> {
        Box::pin(async move { (self.forward)(cx, wreq) })
    }

    fn reverse<'a>(
        &'a self,
        cx: &'a CallContext,
        wres: &'a mut WrappedResponse,
        err: Option<ServiceError>,
    ) -> BoxFuture<'a, Option<ServiceError>> {
        Box::pin(async move {
            match &self.reverse {
                Some(reverse) => (reverse)(cx, wres, err),
                None => err,
            }
        })
    }
}
