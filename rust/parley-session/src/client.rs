//! The client-side call surface.

use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use apache_avro::types::Value;
use bytes::BytesMut;
use parley_core::Service;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::channel::Channel;
use crate::driver;
use crate::middleware::{run_pipeline, Middleware, Terminal};
use crate::{
    BoxFuture, CallContext, ChannelOptions, Extensions, FrameTransport, Locals, ServiceError,
    StatelessTransport, WrappedRequest, WrappedResponse,
};

/// Client construction options.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientOptions {
    /// Queue emissions issued before any channel exists, flushing them once
    /// one is installed. Without it such emissions fail immediately.
    pub buffering: bool,
    /// Validate outgoing requests against the schema instead of relying on
    /// encoding-time coercion.
    pub strict_types: bool,
}

/// Per-emission options.
#[derive(Default)]
pub struct EmitOptions {
    /// Hard upper bound on the whole call.
    pub timeout: Option<Duration>,
    /// Target scope when channels for several scopes exist. Defaults to the
    /// empty scope.
    pub scope: Option<String>,
    /// Seed for the call's [`CallContext::locals`]; this is where the
    /// tracing middleware finds the emission's trace.
    pub locals: Extensions,
}

impl EmitOptions {
    /// Options with a timeout.
    pub fn timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }
}

type ChannelHook = Box<dyn Fn(&Channel) + Send + Sync>;
type CallHook = Box<dyn Fn(&CallContext) + Send + Sync>;

struct ClientShared {
    channels: Mutex<Vec<Channel>>,
    middleware: Mutex<Vec<Arc<dyn Middleware>>>,
    channel_hooks: Mutex<Vec<ChannelHook>>,
    outgoing_hooks: Mutex<Vec<CallHook>>,
    notify: Notify,
}

/// Message emission surface over a set of channels.
///
/// Clonable; clones share channels, middleware, and hooks.
#[derive(Clone)]
pub struct Client {
    service: Arc<Service>,
    opts: ClientOptions,
    shared: Arc<ClientShared>,
}

impl Client {
    /// Create a client for a compiled protocol.
    pub fn new(service: Arc<Service>, opts: ClientOptions) -> Self {
        Self {
            service,
            opts,
            shared: Arc::new(ClientShared {
                channels: Mutex::new(Vec::new()),
                middleware: Mutex::new(Vec::new()),
                channel_hooks: Mutex::new(Vec::new()),
                outgoing_hooks: Mutex::new(Vec::new()),
                notify: Notify::new(),
            }),
        }
    }

    /// The client's protocol.
    pub fn service(&self) -> &Arc<Service> {
        &self.service
    }

    /// Open a channel over a stateful transport.
    pub fn channel<T: FrameTransport>(&self, transport: T, opts: ChannelOptions) -> Channel {
        let channel = driver::spawn_client(self.service.clone(), transport, opts);
        self.install(channel.clone());
        channel
    }

    /// Open a channel over a stateless transport.
    ///
    /// `no_ping` is implicit: the handshake rides every request.
    pub fn stateless_channel<T: StatelessTransport>(
        &self,
        transport: T,
        opts: ChannelOptions,
    ) -> Channel {
        let channel = driver::spawn_stateless(self.service.clone(), transport, opts);
        self.install(channel.clone());
        channel
    }

    fn install(&self, channel: Channel) {
        for hook in self.shared.channel_hooks.lock().expect("hooks poisoned").iter() {
            hook(&channel);
        }
        self.shared
            .channels
            .lock()
            .expect("channels poisoned")
            .push(channel);
        self.shared.notify.notify_waiters();
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

    /// Observe every channel installed on this client.
    pub fn on_channel(&self, hook: impl Fn(&Channel) + Send + Sync + 'static) {
        self.shared
            .channel_hooks
            .lock()
            .expect("hooks poisoned")
            .push(Box::new(hook));
    }

    /// Observe every outgoing call before its pipeline runs.
    ///
    /// The call's locals are already seeded from the emission options, so
    /// this is where middleware prerequisites (like traces) are visible.
    pub fn on_outgoing_call(&self, hook: impl Fn(&CallContext) + Send + Sync + 'static) {
        self.shared
            .outgoing_hooks
            .lock()
            .expect("hooks poisoned")
            .push(Box::new(hook));
    }

    /// Snapshot of the client's channels.
    pub fn channels(&self) -> Vec<Channel> {
        self.shared
            .channels
            .lock()
            .expect("channels poisoned")
            .clone()
    }

    /// Destroy every owned channel, aborting in-flight calls.
    pub async fn destroy_channels(&self) {
        let channels: Vec<Channel> = {
            let mut guard = self.shared.channels.lock().expect("channels poisoned");
            guard.drain(..).collect()
        };
        for channel in channels {
            channel.destroy().await;
        }
    }

    /// Emit one message and await its outcome.
    ///
    /// Exactly one of response/error is delivered for two-way messages;
    /// one-way messages resolve to [`Value::Null`] once the request is
    /// flushed. Application errors surface as
    /// [`ServiceError::Application`].
    pub async fn emit_message(
        &self,
        name: &str,
        request: Value,
        opts: EmitOptions,
    ) -> Result<Value, ServiceError> {
        let message = self
            .service
            .message(name)
            .cloned()
            .ok_or_else(|| ServiceError::System(format!("unknown message: {name}")))?;
        if self.opts.strict_types && !message.validate_request(&request) {
            return Err(ServiceError::Codec(format!(
                "request does not match the schema of {name}"
            )));
        }

        let deadline = opts.timeout.map(|t| Instant::now() + t);
        let scope = opts.scope.clone().unwrap_or_default();
        let channel = self.wait_for_channel(&scope, deadline).await?;

        let ctx = CallContext::new(
            Locals::from_extensions(opts.locals),
            message.clone(),
            channel.info(),
        );
        for hook in self
            .shared
            .outgoing_hooks
            .lock()
            .expect("hooks poisoned")
            .iter()
        {
            hook(&ctx);
        }

        let mut wreq = WrappedRequest::new(request);
        let mut wres = WrappedResponse::new();
        let chain: Vec<Arc<dyn Middleware>> = self
            .shared
            .middleware
            .lock()
            .expect("middleware poisoned")
            .clone();
        let mut terminal = ClientTerminal {
            channel: &channel,
            deadline,
        };

        let err = run_pipeline(&chain, &ctx, &mut wreq, &mut wres, &mut terminal).await;
        if let Some(err) = err {
            return Err(err);
        }
        if let Some(error) = wres.error {
            return Err(ServiceError::Application(error));
        }
        if message.one_way() {
            return Ok(Value::Null);
        }
        wres.response
            .ok_or_else(|| ServiceError::Codec("response missing from envelope".into()))
    }

    async fn wait_for_channel(
        &self,
        scope: &str,
        deadline: Option<Instant>,
    ) -> Result<Channel, ServiceError> {
        loop {
            let notified = self.shared.notify.notified();
            if let Some(channel) = self.pick_channel(scope) {
                return Ok(channel);
            }
            if !self.opts.buffering {
                return Err(ServiceError::Transport("no available channel".into()));
            }
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(ServiceError::Timeout);
                    }
                }
                None => notified.await,
            }
        }
    }

    fn pick_channel(&self, scope: &str) -> Option<Channel> {
        let mut channels = self.shared.channels.lock().expect("channels poisoned");
        channels.retain(Channel::is_usable);
        channels
            .iter()
            .find(|channel| channel.scope() == scope)
            .cloned()
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("service", &self.service.name())
            .finish_non_exhaustive()
    }
}

/// The client pipeline's terminal: encode, send, await, decode.
struct ClientTerminal<'c> {
    channel: &'c Channel,
    deadline: Option<Instant>,
}

impl Terminal for ClientTerminal<'_> {
    fn run<'a>(
        &'a mut self,
        cx: &'a CallContext,
        wreq: &'a mut WrappedRequest,
        wres: &'a mut WrappedResponse,
    ) -> BoxFuture<'a, Option<ServiceError>> {
        Box::pin(async move { self.exchange(cx, wreq, wres).await.err() })
    }
}

impl ClientTerminal<'_> {
    async fn exchange(
        &self,
        cx: &CallContext,
        wreq: &WrappedRequest,
        wres: &mut WrappedResponse,
    ) -> Result<(), ServiceError> {
        let message = cx.message();

        let mut body = BytesMut::new();
        body.extend_from_slice(&parley_wire::encode_metadata(&wreq.headers)?);
        body.extend_from_slice(&parley_wire::encode_message_name(message.name())?);
        body.extend_from_slice(&message.encode_request(wreq.request.clone())?);

        let call = self.channel.call(body.freeze(), message.one_way());
        let outcome = match self.deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, call).await {
                Ok(outcome) => outcome,
                // The timeout is synthesized here, at the terminal boundary,
                // and unwinds through the reverse phase like any error.
                Err(_) => return Err(ServiceError::Timeout),
            },
            None => call.await,
        }?;

        let Some(response) = outcome else {
            // One-way: flushed, no envelope.
            return Ok(());
        };

        let mut cursor = Cursor::new(response.as_ref());
        wres.headers = parley_wire::decode_metadata(&mut cursor)?;
        let is_error = parley_wire::decode_error_flag(&mut cursor)?;

        // When the handshake learned a differing remote protocol, its
        // schemas are the writer side of Avro resolution.
        let remote = self.channel.remote_protocol();
        let remote_message = match &remote {
            Some(remote) => Some(remote.message(message.name()).ok_or_else(|| {
                ServiceError::Codec(format!(
                    "message {} is not in the remote protocol",
                    message.name()
                ))
            })?),
            None => None,
        };

        if is_error {
            let value =
                message.decode_error(&mut cursor, remote_message.map(|m| m.errors()))?;
            wres.error = Some(value);
        } else {
            let value =
                message.decode_response(&mut cursor, remote_message.map(|m| m.response()))?;
            wres.response = Some(value);
        }
        Ok(())
    }
}
