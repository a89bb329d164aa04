//! The client- and server-side tracing middleware.

use std::sync::Arc;

use parley_session::{
    BoxFuture, CallContext, Client, Middleware, Server, ServiceError, WrappedRequest,
    WrappedResponse,
};

use crate::record::{now_millis, CallRecord, CallState, Trace};

/// Tracing configuration.
#[derive(Debug, Clone)]
pub struct TracingOptions {
    /// Header key the serialized trace travels under.
    pub trace_key: String,
    /// Mint a fresh trace when an outgoing call has none, instead of
    /// failing with `missing outgoing trace`.
    pub create_missing_outgoing: bool,
    /// Tolerate responses without a trace header (the peer is not
    /// instrumented); downstream calls then stay empty.
    pub ignore_missing_incoming: bool,
}

impl Default for TracingOptions {
    fn default() -> Self {
        Self {
            trace_key: "trace".into(),
            create_missing_outgoing: false,
            ignore_missing_incoming: false,
        }
    }
}

/// What to instrument: the two sides trace differently.
pub enum TracingTarget<'a> {
    /// Instrument a client's outgoing calls.
    Client(&'a Client),
    /// Instrument a server's incoming calls.
    Server(&'a Server),
}

/// Install the tracing middleware on a client or server.
pub fn enable_tracing(target: TracingTarget<'_>, opts: TracingOptions) {
    match target {
        TracingTarget::Client(client) => {
            client.use_middleware(Arc::new(ClientTracing { opts }));
        }
        TracingTarget::Server(server) => {
            server.use_middleware(Arc::new(ServerTracing { opts }));
        }
    }
}

/// Reverse-phase bookmark for one outgoing call.
struct OutgoingMark {
    trace: Trace,
    index: usize,
}

struct ClientTracing {
    opts: TracingOptions,
}

impl Middleware for ClientTracing {
    fn forward<'a>(
        &'a self,
        cx: &'a CallContext,
        wreq: &'a mut WrappedRequest,
    ) -> BoxFuture<'a, Result<(), ServiceError>> {
        Box::pin(async move {
            let trace = match cx.locals().get::<Trace>() {
                Some(trace) => trace,
                None if self.opts.create_missing_outgoing => {
                    let trace = Trace::new();
                    cx.locals().insert(trace.clone());
                    trace
                }
                None => {
                    return Err(ServiceError::Tracing("missing outgoing trace".into()));
                }
            };

            let one_way = cx.message().one_way();
            let index = trace.push_call(CallRecord {
                state: if one_way {
                    CallState::OneWay
                } else {
                    CallState::Pending
                },
                name: cx.message().name().to_owned(),
                request_time: now_millis(),
                response_time: None,
                downstream_calls: Vec::new(),
            });

            // Wire economy: only the uuid travels outbound.
            let header = trace
                .encode_outbound()
                .map_err(|e| ServiceError::Tracing(format!("cannot encode trace: {e}")))?;
            wreq.headers.insert(self.opts.trace_key.clone(), header);

            if !one_way {
                cx.locals().insert(OutgoingMark { trace, index });
            }
            Ok(())
        })
    }

    fn reverse<'a>(
        &'a self,
        cx: &'a CallContext,
        wres: &'a mut WrappedResponse,
        err: Option<ServiceError>,
    ) -> BoxFuture<'a, Option<ServiceError>> {
        Box::pin(async move {
            // One-way calls registered no mark; pass straight through.
            let Some(mark) = cx.locals().remove::<OutgoingMark>() else {
                return err;
            };

            let now = now_millis();
            let failed = err.is_some() || wres.is_error();

            let (downstream, verdict) = match wres.headers.get(&self.opts.trace_key) {
                Some(bytes) => match Trace::decode(bytes) {
                    Ok(incoming) => (Some(incoming.calls), err),
                    Err(e) => (
                        None,
                        Some(err.unwrap_or_else(|| {
                            ServiceError::Tracing(format!("cannot decode incoming trace: {e}"))
                        })),
                    ),
                },
                None if self.opts.ignore_missing_incoming || err.is_some() => (None, err),
                None => (
                    None,
                    Some(ServiceError::Tracing("missing incoming trace".into())),
                ),
            };
            let failed = failed || verdict.is_some();

            mark.trace.update_call(mark.index, |call| {
                call.response_time = Some(now);
                call.state = if failed {
                    CallState::Error
                } else {
                    CallState::Success
                };
                if let Some(calls) = downstream {
                    call.downstream_calls = calls;
                }
            });

            verdict
        })
    }
}

struct ServerTracing {
    opts: TracingOptions,
}

impl Middleware for ServerTracing {
    fn forward<'a>(
        &'a self,
        cx: &'a CallContext,
        wreq: &'a mut WrappedRequest,
    ) -> BoxFuture<'a, Result<(), ServiceError>> {
        Box::pin(async move {
            let header = wreq.headers.get(&self.opts.trace_key);
            let already_seeded = cx.locals().contains::<Trace>();
            match (header, already_seeded) {
                (Some(_), true) => Err(ServiceError::Tracing("duplicate trace".into())),
                (Some(bytes), false) => {
                    let data = Trace::decode(bytes).map_err(|e| {
                        ServiceError::Tracing(format!("cannot decode trace: {e}"))
                    })?;
                    cx.locals().insert(Trace::from_data(data));
                    Ok(())
                }
                (None, true) => Ok(()),
                (None, false) => {
                    cx.locals().insert(Trace::new());
                    Ok(())
                }
            }
        })
    }

    fn reverse<'a>(
        &'a self,
        cx: &'a CallContext,
        wres: &'a mut WrappedResponse,
        err: Option<ServiceError>,
    ) -> BoxFuture<'a, Option<ServiceError>> {
        Box::pin(async move {
            // Ship the full subtree back up.
            if let Some(trace) = cx.locals().get::<Trace>() {
                match trace.encode() {
                    Ok(bytes) => {
                        wres.headers.insert(self.opts.trace_key.clone(), bytes);
                    }
                    Err(e) => {
                        if err.is_none() {
                            return Some(ServiceError::Tracing(format!(
                                "cannot encode trace: {e}"
                            )));
                        }
                    }
                }
            }
            err
        })
    }
}
