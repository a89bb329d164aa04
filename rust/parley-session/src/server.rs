//! The server-side dispatch surface.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::{Arc, Mutex};

use apache_avro::types::Value;
use apache_avro::Schema;
use once_cell::sync::Lazy;
use parley_core::Service;
use parley_wire::{
    HandshakeMatch, HandshakeRequest, HandshakeResponse, Metadata, Packet, ProtocolHash,
    FLAG_HANDSHAKE,
};

use crate::channel::{Channel, ChannelShared};
use crate::driver;
use crate::middleware::{run_pipeline, Middleware, Terminal};
use crate::{
    BoxFuture, CallContext, ChannelInfo, ChannelOptions, FrameTransport, Locals, RemoteError,
    ServiceError, WrappedRequest, WrappedResponse,
};

/// Server construction options.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerOptions {
    /// Normalize undeclared handler errors to system (string) errors.
    pub strict_errors: bool,
    /// Validate handler responses against the schema before encoding.
    pub strict_types: bool,
}

/// A message handler.
///
/// At most one handler per message. The handler owns its future, so the
/// context is passed by value (clones share the call's locals).
pub trait Handler: Send + Sync {
    /// Handle one decoded request.
    fn handle(&self, cx: CallContext, request: Value)
        -> BoxFuture<'static, Result<Value, RemoteError>>;
}

impl<F> Handler for F
where
    F: Fn(CallContext, Value) -> BoxFuture<'static, Result<Value, RemoteError>> + Send + Sync,
{
    fn handle(
        &self,
        cx: CallContext,
        request: Value,
    ) -> BoxFuture<'static, Result<Value, RemoteError>> {
        (self)(cx, request)
    }
}

type ChannelHook = Box<dyn Fn(&Channel) + Send + Sync>;
type CallHook = Box<dyn Fn(&CallContext) + Send + Sync>;

struct ServerShared {
    handlers: Mutex<HashMap<String, Arc<dyn Handler>>>,
    middleware: Mutex<Vec<Arc<dyn Middleware>>>,
    channel_hooks: Mutex<Vec<ChannelHook>>,
    incoming_hooks: Mutex<Vec<CallHook>>,
    channels: Mutex<Vec<Channel>>,
    /// Client protocols seen during handshakes, by hash.
    protocols: Mutex<HashMap<ProtocolHash, Arc<Service>>>,
}

/// Message dispatch surface over a set of incoming channels.
///
/// Clonable; clones share handlers, middleware, hooks, and channels.
#[derive(Clone)]
pub struct Server {
    service: Arc<Service>,
    opts: ServerOptions,
    shared: Arc<ServerShared>,
}

impl Server {
    /// Create a server for a compiled protocol.
    pub fn new(service: Arc<Service>, opts: ServerOptions) -> Self {
        Self {
            service,
            opts,
            shared: Arc::new(ServerShared {
                handlers: Mutex::new(HashMap::new()),
                middleware: Mutex::new(Vec::new()),
                channel_hooks: Mutex::new(Vec::new()),
                incoming_hooks: Mutex::new(Vec::new()),
                channels: Mutex::new(Vec::new()),
                protocols: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The server's protocol.
    pub fn service(&self) -> &Arc<Service> {
        &self.service
    }

    /// Install the handler for a message, replacing any previous one.
    ///
    /// The handler gets the call's context and decoded request record and
    /// resolves to the response value or a [`RemoteError`].
    pub fn on_message<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(CallContext, Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, RemoteError>> + Send + 'static,
    {
        let handler = move |cx: CallContext,
                            request: Value|
              -> BoxFuture<'static, Result<Value, RemoteError>> {
            Box::pin(handler(cx, request))
        };
        self.shared
            .handlers
            .lock()
            .expect("handlers poisoned")
            .insert(name.into(), Arc::new(handler));
    }

    /// Append a middleware to the chain.
    ///
    /// The chain is append-only; do not push while calls are dispatching.
    pub fn use_middleware(&self, middleware: Arc<dyn Middleware>) {
        self.shared
            .middleware
            .lock()
            .expect("middleware poisoned")
            .push(middleware);
    }

    /// Observe every incoming channel.
    pub fn on_channel(&self, hook: impl Fn(&Channel) + Send + Sync + 'static) {
        self.shared
            .channel_hooks
            .lock()
            .expect("hooks poisoned")
            .push(Box::new(hook));
    }

    /// Observe every incoming call at the start of dispatch.
    ///
    /// This runs before the middleware chain; it is the server-side seed
    /// point for tracing.
    pub fn on_incoming_call(&self, hook: impl Fn(&CallContext) + Send + Sync + 'static) {
        self.shared
            .incoming_hooks
            .lock()
            .expect("hooks poisoned")
            .push(Box::new(hook));
    }

    /// Install an incoming stateful channel over `transport`.
    pub fn channel<T: FrameTransport>(&self, transport: T, opts: ChannelOptions) -> Channel {
        let channel = driver::spawn_server(self.clone(), transport, opts);
        for hook in self
            .shared
            .channel_hooks
            .lock()
            .expect("hooks poisoned")
            .iter()
        {
            hook(&channel);
        }
        let mut channels = self.shared.channels.lock().expect("channels poisoned");
        channels.retain(Channel::is_usable);
        channels.push(channel.clone());
        channel
    }

    /// Snapshot of the server's channels.
    pub fn channels(&self) -> Vec<Channel> {
        self.shared
            .channels
            .lock()
            .expect("channels poisoned")
            .clone()
    }

    /// Destroy every owned channel.
    pub async fn destroy_channels(&self) {
        let channels: Vec<Channel> = {
            let mut guard = self.shared.channels.lock().expect("channels poisoned");
            guard.drain(..).collect()
        };
        for channel in channels {
            channel.destroy().await;
        }
    }

    /// Service one stateless request (handshake always present) and return
    /// the full framed response body.
    ///
    /// This is the engine behind HTTP POST `avro/binary`: the body is one
    /// request, the return value is its reply.
    pub async fn handle_stateless(&self, body: &[u8]) -> Vec<u8> {
        let shared = ChannelShared::new(String::new());
        self.dispatch_body(body, true, &shared, true)
            .await
            .unwrap_or_default()
    }

    /// Dispatch one incoming packet; `None` means no response travels
    /// (one-way).
    pub(crate) async fn dispatch_packet(
        &self,
        packet: Packet,
        shared: &Arc<ChannelShared>,
    ) -> Option<Packet> {
        let has_handshake = packet.has_handshake();
        let body = self
            .dispatch_body(&packet.body, has_handshake, shared, false)
            .await?;
        let flags = if has_handshake { FLAG_HANDSHAKE } else { 0 };
        Some(Packet::new(packet.id, packet.scope, flags, body.into()))
    }

    /// The dispatch path shared by stateful channels and the stateless
    /// entry point.
    async fn dispatch_body(
        &self,
        body: &[u8],
        has_handshake: bool,
        shared: &Arc<ChannelShared>,
        force_response: bool,
    ) -> Option<Vec<u8>> {
        let mut cursor = Cursor::new(body);

        let mut handshake_out = None;
        let mut writer = shared.remote();
        if has_handshake {
            let request = match HandshakeRequest::decode(&mut cursor) {
                Ok(request) => request,
                Err(e) => {
                    warn!(error = %e, "discarding request with undecodable handshake");
                    let response = self.refusal_response();
                    let encoded = response.encode().ok()?;
                    return Some(build_body(
                        Some(encoded),
                        &Metadata::new(),
                        true,
                        &raw_string_error("bad handshake"),
                    ));
                }
            };
            let (response, negotiated, proceed) = self.respond_handshake(&request);
            let encoded = response.encode().ok()?;
            if !proceed {
                return Some(build_body(
                    Some(encoded),
                    &Metadata::new(),
                    true,
                    &raw_string_error("unknown protocol"),
                ));
            }
            shared.set_remote(negotiated.clone());
            writer = negotiated;
            handshake_out = Some(encoded);
        }

        let headers = match parley_wire::decode_metadata(&mut cursor) {
            Ok(headers) => headers,
            Err(e) => return Some(error_body(handshake_out, format!("bad metadata: {e}"))),
        };
        let name = match parley_wire::decode_message_name(&mut cursor) {
            Ok(name) => name,
            Err(e) => return Some(error_body(handshake_out, format!("bad message name: {e}"))),
        };

        // An empty name is a ping: handshake only, empty (null) payload.
        if name.is_empty() {
            return Some(build_body(handshake_out, &Metadata::new(), false, &[]));
        }

        let Some(message) = self.service.message(&name).cloned() else {
            return Some(error_body(handshake_out, format!("unknown message: {name}")));
        };

        let writer_schema = match &writer {
            Some(remote) => match remote.message(&name) {
                Some(remote_message) => Some(remote_message.request().clone()),
                None => {
                    return Some(error_body(
                        handshake_out,
                        format!("unknown message: {name}"),
                    ))
                }
            },
            None => None,
        };
        let request = match message.decode_request(&mut cursor, writer_schema.as_ref()) {
            Ok(request) => request,
            Err(e) => {
                return Some(error_body(
                    handshake_out,
                    format!("cannot decode request: {e}"),
                ))
            }
        };

        let ctx = CallContext::new(
            Locals::new(),
            message.clone(),
            ChannelInfo {
                scope: shared.scope.clone(),
                id: shared.id,
            },
        );
        for hook in self
            .shared
            .incoming_hooks
            .lock()
            .expect("hooks poisoned")
            .iter()
        {
            hook(&ctx);
        }

        let mut wreq = WrappedRequest {
            request,
            headers,
        };
        let mut wres = WrappedResponse::new();
        let chain: Vec<Arc<dyn Middleware>> = self
            .shared
            .middleware
            .lock()
            .expect("middleware poisoned")
            .clone();
        let mut terminal = ServerTerminal { server: self };

        let err = run_pipeline(&chain, &ctx, &mut wreq, &mut wres, &mut terminal).await;
        if let Some(err) = err {
            // Pipeline errors ride the error union back to the caller.
            wres.response = None;
            wres.error = Some(match err {
                ServiceError::Application(value) => value,
                other => message.string_error(other.to_string()),
            });
        }

        if message.one_way() && !force_response {
            // One-way calls produce no response, except that an outstanding
            // handshake still needs acknowledging.
            return handshake_out
                .map(|handshake| build_body(Some(handshake), &Metadata::new(), false, &[]));
        }

        let (is_error, datum) = if let Some(error) = &wres.error {
            match message.encode_error(error.clone()) {
                Ok(datum) => (true, datum),
                Err(e) => (true, raw_string_error(&format!("cannot encode error: {e}"))),
            }
        } else if message.one_way() {
            (false, Vec::new())
        } else {
            match &wres.response {
                Some(value) => {
                    if self.opts.strict_types && !value.validate(message.response()) {
                        (
                            true,
                            raw_string_error("response does not match the declared schema"),
                        )
                    } else {
                        match message.encode_response(value.clone()) {
                            Ok(datum) => (false, datum),
                            Err(e) => {
                                (true, raw_string_error(&format!("cannot encode response: {e}")))
                            }
                        }
                    }
                }
                None => (true, raw_string_error("no response produced")),
            }
        };

        Some(build_body(handshake_out, &wres.headers, is_error, &datum))
    }

    /// Reconcile a client handshake against this server's protocol.
    ///
    /// Returns the response, the writer service for request decoding
    /// (`None` when the peer speaks our protocol), and whether dispatch may
    /// proceed.
    fn respond_handshake(
        &self,
        request: &HandshakeRequest,
    ) -> (HandshakeResponse, Option<Arc<Service>>, bool) {
        let own = &self.service;

        let cached = self
            .shared
            .protocols
            .lock()
            .expect("protocols poisoned")
            .get(&request.client_hash)
            .cloned();
        let known: Option<Option<Arc<Service>>> = if request.client_hash == own.hash() {
            Some(None)
        } else if let Some(cached) = cached {
            Some(Some(cached))
        } else if let Some(document) = &request.client_protocol {
            match Service::compile(document) {
                Ok(service) => {
                    let service = Arc::new(service);
                    self.shared
                        .protocols
                        .lock()
                        .expect("protocols poisoned")
                        .insert(request.client_hash, service.clone());
                    Some(Some(service))
                }
                Err(e) => {
                    warn!(error = %e, "rejecting unparseable client protocol");
                    None
                }
            }
        } else {
            None
        };

        match known {
            None => (self.refusal_response(), None, false),
            Some(writer) => {
                let response = if request.server_hash == own.hash() {
                    HandshakeResponse {
                        matching: HandshakeMatch::Both,
                        server_protocol: None,
                        server_hash: None,
                        meta: None,
                    }
                } else {
                    HandshakeResponse {
                        matching: HandshakeMatch::Client,
                        server_protocol: Some(own.document().to_owned()),
                        server_hash: Some(own.hash()),
                        meta: None,
                    }
                };
                (response, writer, true)
            }
        }
    }

    /// The `NONE` response: carries our protocol so the client can retry.
    fn refusal_response(&self) -> HandshakeResponse {
        HandshakeResponse {
            matching: HandshakeMatch::None,
            server_protocol: Some(self.service.document().to_owned()),
            server_hash: Some(self.service.hash()),
            meta: None,
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("service", &self.service.name())
            .finish_non_exhaustive()
    }
}

/// The server pipeline's terminal: the user handler.
struct ServerTerminal<'s> {
    server: &'s Server,
}

impl Terminal for ServerTerminal<'_> {
    fn run<'a>(
        &'a mut self,
        cx: &'a CallContext,
        wreq: &'a mut WrappedRequest,
        wres: &'a mut WrappedResponse,
    ) -> BoxFuture<'a, Option<ServiceError>> {
        Box::pin(async move {
            let message = cx.message().clone();
            let handler = self
                .server
                .shared
                .handlers
                .lock()
                .expect("handlers poisoned")
                .get(message.name())
                .cloned();
            let Some(handler) = handler else {
                wres.error =
                    Some(message.string_error(format!("unimplemented message: {}", message.name())));
                return None;
            };

            match handler.handle(cx.clone(), wreq.request.clone()).await {
                Ok(value) => wres.response = Some(value),
                Err(RemoteError::Message(text)) => {
                    wres.error = Some(message.string_error(text));
                }
                Err(RemoteError::Declared(value)) => {
                    if message.is_declared_error(&value) {
                        wres.error = Some(value);
                    } else if self.server.opts.strict_errors {
                        wres.error = Some(message.string_error(format!(
                            "system error: undeclared error variant for {}",
                            message.name()
                        )));
                    } else {
                        wres.error = Some(value);
                    }
                }
            }
            None
        })
    }
}

static STRING_UNION: Lazy<Schema> =
    Lazy::new(|| Schema::parse_str(r#"["string"]"#).expect("string union schema"));

/// Encode a string error without a message's error union.
///
/// A one-branch `["string"]` union writes the same bytes (branch index 0 +
/// string) that any declared error union writes for its string branch, so
/// peers decode this with whatever union they expect.
fn raw_string_error(text: &str) -> Vec<u8> {
    apache_avro::to_avro_datum(
        &STRING_UNION,
        Value::Union(0, Box::new(Value::String(text.to_owned()))),
    )
    .expect("string union encode")
}

/// Assemble a response body: `[handshake?] metadata error-flag datum`.
fn build_body(
    handshake: Option<Vec<u8>>,
    headers: &Metadata,
    is_error: bool,
    datum: &[u8],
) -> Vec<u8> {
    let mut body = handshake.unwrap_or_default();
    body.extend(parley_wire::encode_metadata(headers).expect("metadata encode"));
    body.extend(parley_wire::encode_error_flag(is_error).expect("flag encode"));
    body.extend_from_slice(datum);
    body
}

fn error_body(handshake: Option<Vec<u8>>, text: String) -> Vec<u8> {
    build_body(handshake, &Metadata::new(), true, &raw_string_error(&text))
}
