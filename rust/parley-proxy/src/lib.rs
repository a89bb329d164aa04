#![deny(unsafe_code)]

//! Multi-scope HTTP proxy for parley services.
//!
//! A [`Proxy`] fronts one or more bound servers (or client providers) over
//! three wire modes on a single listening socket:
//!
//! 1. **HTTP POST** — stateless calls, `avro/binary` (framed request body)
//!    or `avro/json` (`{"message", "headers"?, "request"}`),
//! 2. **HTTP CONNECT** — a long-lived tunnel carrying framed RPC in both
//!    directions,
//! 3. **WebSocket upgrade** — the same, object-mode, one packet per binary
//!    message.
//!
//! Scopes route connections to bindings: tunnel modes read them from the
//! `scopes` header (comma-separated) or the first URL path segment split on
//! `+`; POST reads the trailing path segment. One tunnel socket carrying
//! several scopes is fanned out with
//! [`scope_mux`](parley_session::scope_mux), one channel per scope.
//!
//! Admission is the pluggable [`Receiver`] hook: denial maps to `403`,
//! unknown scopes to `404`, unknown content types to `400`.

mod connect;
mod http;
mod json;

pub use connect::{start_tunnel, HttpTransport, TunnelOptions, TunnelSocket};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ::http::{HeaderMap, StatusCode};
use bytes::BytesMut;
use parley_core::Service;
use parley_session::{
    scope_mux, BoxFuture, Channel, ChannelOptions, Client, ClientOptions, FrameTransport,
    LengthPrefixed, Server,
};
use parley_websocket::WsTransport;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

/// Callback run after an admitted connection is bound, with the channels
/// that were created for it.
pub type AfterBind = Box<dyn FnOnce(&[Channel]) + Send>;

/// The admission hook: inspects the request headers, returns `Err(reason)`
/// to deny (HTTP 403), `Ok(None)` to admit, or `Ok(Some(hook))` to admit
/// and observe the resulting channels.
pub type Receiver =
    Arc<dyn Fn(HeaderMap) -> BoxFuture<'static, Result<Option<AfterBind>, String>> + Send + Sync>;

/// Build a [`Receiver`] from a plain async closure.
pub fn receiver_fn<F, Fut>(f: F) -> Receiver
where
    F: Fn(HeaderMap) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Option<AfterBind>, String>> + Send + 'static,
{
    Arc::new(move |headers| Box::pin(f(headers)))
}

/// Supplies ephemeral clients for reverse-direction bindings.
///
/// A client-provider binding is legal only for the bidirectional wire modes
/// (CONNECT, WebSocket): it needs a live socket to carry a client-side
/// channel. The provider receives a connected [`Client`] per admitted
/// socket.
pub trait ClientProvider: Send + Sync {
    /// The protocol the provided clients speak.
    fn service(&self) -> Arc<Service>;

    /// Take ownership of a client whose channel is bound to a live socket.
    fn provide(&self, client: Client);
}

enum Binding {
    Server(Server),
    Provider(Arc<dyn ClientProvider>),
}

/// Error binding a scope.
#[derive(Debug, PartialEq, Eq)]
pub enum BindError {
    /// The scope already has a binding.
    DuplicateScope(String),
}

impl std::fmt::Display for BindError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BindError::DuplicateScope(scope) => write!(f, "scope {scope:?} is already bound"),
        }
    }
}

impl std::error::Error for BindError {}

/// Proxy configuration.
#[derive(Clone)]
pub struct ProxyOptions {
    /// Path prefix stripped before reading the POST scope segment.
    pub scope_prefix: String,
    /// Scopes that must be bound before [`Proxy::is_ok`] holds.
    pub expected_scopes: Vec<String>,
    /// Upper bound on a JSON-mode call.
    pub emit_timeout: Option<Duration>,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            scope_prefix: "/".into(),
            expected_scopes: Vec::new(),
            emit_timeout: Some(Duration::from_secs(30)),
        }
    }
}

/// The multi-scope HTTP entry point.
pub struct Proxy {
    opts: ProxyOptions,
    receiver: Option<Receiver>,
    bindings: Mutex<HashMap<String, Binding>>,
}

impl Proxy {
    /// Create a proxy with an optional admission hook.
    pub fn new(opts: ProxyOptions, receiver: Option<Receiver>) -> Arc<Self> {
        Arc::new(Self {
            opts,
            receiver,
            bindings: Mutex::new(HashMap::new()),
        })
    }

    /// Bind a server at a scope. Scope identifiers are unique per proxy.
    pub fn bind_server(&self, server: Server, scope: impl Into<String>) -> Result<(), BindError> {
        self.bind(scope.into(), Binding::Server(server))
    }

    /// Bind a client provider at a scope (tunnel and WebSocket modes only).
    pub fn bind_client_provider(
        &self,
        provider: Arc<dyn ClientProvider>,
        scope: impl Into<String>,
    ) -> Result<(), BindError> {
        self.bind(scope.into(), Binding::Provider(provider))
    }

    fn bind(&self, scope: String, binding: Binding) -> Result<(), BindError> {
        let mut bindings = self.bindings.lock().expect("bindings poisoned");
        if bindings.contains_key(&scope) {
            return Err(BindError::DuplicateScope(scope));
        }
        bindings.insert(scope, binding);
        Ok(())
    }

    /// Whether every expected scope has been bound.
    ///
    /// Connections for unbound scopes are refused with `404` either way;
    /// this is the readiness signal for late server mounting.
    pub fn is_ok(&self) -> bool {
        let bindings = self.bindings.lock().expect("bindings poisoned");
        self.opts
            .expected_scopes
            .iter()
            .all(|scope| bindings.contains_key(scope))
    }

    /// Accept connections forever.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            debug!(?peer, "proxy accepted connection");
            let proxy = self.clone();
            tokio::spawn(async move {
                proxy.handle_connection(stream).await;
            });
        }
    }

    /// Serve one accepted socket.
    pub async fn handle_connection(self: Arc<Self>, mut stream: TcpStream) {
        let mut buf = BytesMut::new();
        let head = match http::read_request_head(&mut stream, &mut buf).await {
            Ok(Some(head)) => head,
            Ok(None) => return,
            Err(e) => {
                debug!(error = %e, "discarding unparseable request");
                let _ = http::write_status_line(&mut stream, "HTTP/1.1 400 Bad Request").await;
                return;
            }
        };

        match head.method.as_str() {
            "POST" => self.post_request_handler(stream, buf, head).await,
            "CONNECT" => self.connect_handler(stream, buf, head).await,
            "GET"
                if head
                    .header("upgrade")
                    .is_some_and(|u| u.eq_ignore_ascii_case("websocket")) =>
            {
                self.web_socket_handler(stream, buf, head).await
            }
            _ => {
                let _ = http::write_response(
                    &mut stream,
                    StatusCode::BAD_REQUEST,
                    &[],
                    b"unsupported method\n",
                )
                .await;
            }
        }
    }

    async fn admit(&self, headers: &HeaderMap) -> Result<Option<AfterBind>, String> {
        match &self.receiver {
            None => Ok(None),
            Some(receiver) => receiver(headers.clone()).await,
        }
    }

    fn server_for(&self, scope: &str) -> Option<Server> {
        match self.bindings.lock().expect("bindings poisoned").get(scope) {
            Some(Binding::Server(server)) => Some(server.clone()),
            _ => None,
        }
    }

    /// HTTP POST: one stateless call per request.
    async fn post_request_handler(
        &self,
        mut stream: TcpStream,
        mut buf: BytesMut,
        head: http::RequestHead,
    ) {
        let after = match self.admit(&head.headers).await {
            Ok(after) => after,
            Err(reason) => {
                let _ = http::write_response(
                    &mut stream,
                    StatusCode::FORBIDDEN,
                    &[],
                    reason.as_bytes(),
                )
                .await;
                return;
            }
        };

        let scope = post_scope(&head.target, &self.opts.scope_prefix);
        let Some(server) = self.server_for(&scope) else {
            let _ = http::write_response(
                &mut stream,
                StatusCode::NOT_FOUND,
                &[],
                format!("unknown scope: {scope:?}\n").as_bytes(),
            )
            .await;
            return;
        };

        let content_type = head.header("content-type").unwrap_or("").to_owned();
        if content_type != "avro/binary" && content_type != "avro/json" {
            let _ = http::write_response(
                &mut stream,
                StatusCode::BAD_REQUEST,
                &[],
                format!("unsupported content type: {content_type:?}\n").as_bytes(),
            )
            .await;
            return;
        }

        let Some(length) = head.content_length() else {
            let _ = http::write_response(
                &mut stream,
                StatusCode::BAD_REQUEST,
                &[],
                b"content-length required\n",
            )
            .await;
            return;
        };
        let body = match http::read_body(&mut stream, &mut buf, length).await {
            Ok(body) => body,
            Err(e) => {
                debug!(error = %e, "failed reading POST body");
                return;
            }
        };

        if content_type == "avro/binary" {
            let response = server.handle_stateless(&body).await;
            if let Some(after) = after {
                after(&[]);
            }
            let _ = http::write_response(
                &mut stream,
                StatusCode::OK,
                &[("content-type", "avro/binary")],
                &response,
            )
            .await;
            return;
        }

        match json::handle_json_post(&server, &body, self.opts.emit_timeout).await {
            Ok((response, channels)) => {
                if let Some(after) = after {
                    after(&channels);
                }
                let _ = http::write_response(
                    &mut stream,
                    StatusCode::OK,
                    &[("content-type", "avro/json")],
                    &response,
                )
                .await;
                // The ephemeral pair dies with the response.
                for channel in channels {
                    channel.destroy().await;
                }
            }
            Err((status, reason)) => {
                let _ =
                    http::write_response(&mut stream, status, &[], format!("{reason}\n").as_bytes())
                        .await;
            }
        }
    }

    /// HTTP CONNECT: raw socket becomes a stateful byte-stream transport.
    async fn connect_handler(&self, mut stream: TcpStream, buf: BytesMut, head: http::RequestHead) {
        if !buf.is_empty() {
            let _ = http::write_status_line(&mut stream, "HTTP/1.1 400 Bad Request").await;
            return;
        }

        let after = match self.admit(&head.headers).await {
            Ok(after) => after,
            Err(_) => {
                let _ = http::write_status_line(&mut stream, "HTTP/1.1 403 Forbidden").await;
                return;
            }
        };

        let scopes = tunnel_scopes(&head);
        let Some(bindings) = self.bindings_for(&scopes) else {
            let _ = http::write_status_line(&mut stream, "HTTP/1.1 404 Not Found").await;
            return;
        };

        if http::write_status_line(&mut stream, "HTTP/1.1 200 Connection Established")
            .await
            .is_err()
        {
            return;
        }

        let channels = bind_scopes(LengthPrefixed::new(stream), &scopes, bindings);
        if let Some(after) = after {
            after(&channels);
        }
    }

    /// WebSocket upgrade: object-mode transport over the upgraded socket.
    async fn web_socket_handler(
        &self,
        mut stream: TcpStream,
        buf: BytesMut,
        head: http::RequestHead,
    ) {
        let Some(key) = head.header("sec-websocket-key").map(str::to_owned) else {
            let _ = http::write_status_line(&mut stream, "HTTP/1.1 400 Bad Request").await;
            return;
        };
        if !buf.is_empty() {
            let _ = http::write_status_line(&mut stream, "HTTP/1.1 400 Bad Request").await;
            return;
        }

        let after = match self.admit(&head.headers).await {
            Ok(after) => after,
            Err(_) => {
                let _ = http::write_status_line(&mut stream, "HTTP/1.1 403 Forbidden").await;
                return;
            }
        };

        let scopes = tunnel_scopes(&head);
        let Some(bindings) = self.bindings_for(&scopes) else {
            let _ = http::write_status_line(&mut stream, "HTTP/1.1 404 Not Found").await;
            return;
        };

        let accept = derive_accept_key(key.as_bytes());
        let upgrade = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             upgrade: websocket\r\n\
             connection: Upgrade\r\n\
             sec-websocket-accept: {accept}"
        );
        if http::write_status_line(&mut stream, &upgrade).await.is_err() {
            return;
        }

        let ws = WebSocketStream::from_raw_socket(stream, Role::Server, None).await;
        let channels = bind_scopes(WsTransport::new(ws), &scopes, bindings);
        if let Some(after) = after {
            after(&channels);
        }
    }

    /// Resolve every requested scope, or `None` if any is unbound.
    fn bindings_for(&self, scopes: &[String]) -> Option<Vec<ResolvedBinding>> {
        let bindings = self.bindings.lock().expect("bindings poisoned");
        scopes
            .iter()
            .map(|scope| {
                bindings.get(scope).map(|binding| match binding {
                    Binding::Server(server) => ResolvedBinding::Server(server.clone()),
                    Binding::Provider(provider) => ResolvedBinding::Provider(provider.clone()),
                })
            })
            .collect()
    }
}

enum ResolvedBinding {
    Server(Server),
    Provider(Arc<dyn ClientProvider>),
}

/// Fan a tunnel transport out per scope and bind each endpoint.
fn bind_scopes<T: FrameTransport>(
    transport: T,
    scopes: &[String],
    bindings: Vec<ResolvedBinding>,
) -> Vec<Channel> {
    let endpoints = scope_mux(transport, scopes);
    let mut channels = Vec::with_capacity(bindings.len());
    for (endpoint, binding) in endpoints.into_iter().zip(bindings) {
        let scope = endpoint.scope().to_owned();
        let channel = match binding {
            ResolvedBinding::Server(server) => {
                server.channel(endpoint, ChannelOptions::scoped(scope))
            }
            ResolvedBinding::Provider(provider) => {
                let client = Client::new(provider.service(), ClientOptions::default());
                let channel = client.channel(endpoint, ChannelOptions::scoped(scope));
                provider.provide(client);
                channel
            }
        };
        channels.push(channel);
    }
    channels
}

/// The POST scope: the path segment after the configured prefix.
fn post_scope(target: &str, prefix: &str) -> String {
    let path = target.split('?').next().unwrap_or_default();
    path.strip_prefix(prefix)
        .unwrap_or(path.trim_start_matches('/'))
        .trim_end_matches('/')
        .to_owned()
}

/// Tunnel scopes: the `scopes` header, or the first path segment split on
/// `+`. No scope at all means the default (empty) scope.
fn tunnel_scopes(head: &http::RequestHead) -> Vec<String> {
    if let Some(header) = head.header("scopes") {
        let scopes: Vec<String> = header
            .split(',')
            .map(|scope| scope.trim().to_owned())
            .filter(|scope| !scope.is_empty())
            .collect();
        if !scopes.is_empty() {
            return scopes;
        }
        warn!(header, "ignoring empty scopes header");
    }
    if let Some(path) = head.target.strip_prefix('/') {
        let segment = path.split(['/', '?']).next().unwrap_or_default();
        if !segment.is_empty() {
            return segment.split('+').map(str::to_owned).collect();
        }
    }
    vec![String::new()]
}
