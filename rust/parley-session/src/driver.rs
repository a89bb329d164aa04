//! Channel drivers.
//!
//! Every channel is backed by one driver task that owns the transport:
//!
//! - [`ClientDriver`] multiplexes outgoing calls over a stateful transport,
//!   correlating responses by packet id and running the handshake (an
//!   opening ping by default, piggybacked on the first call with
//!   `no_ping`).
//! - [`StatelessDriver`] services calls over a one-sink-per-call transport;
//!   the handshake rides every request, hash-only once negotiated.
//! - [`ServerDriver`] reads incoming requests, hands them to the server for
//!   dispatch, and writes responses back in completion order.
//!
//! Transport failures abort every in-flight call with a transport error;
//! handshake rejection (`NONE` after the full protocol was sent) aborts the
//! channel with a handshake error.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use parley_core::Service;
use parley_wire::{
    HandshakeMatch, HandshakeRequest, HandshakeResponse, Packet, ProtocolHash, FLAG_HANDSHAKE,
};
use tokio::sync::mpsc;

use crate::channel::{Channel, ChannelCommand, ChannelShared};
use crate::server::Server;
use crate::{
    ChannelOptions, ChannelState, FrameTransport, ServiceError, StatelessTransport, CHANNEL_SIZE,
};

/// Spawn a client driver over a stateful transport.
pub(crate) fn spawn_client<T: FrameTransport>(
    service: Arc<Service>,
    transport: T,
    opts: ChannelOptions,
) -> Channel {
    let shared = ChannelShared::new(opts.scope.clone());
    let (cmd_tx, cmd_rx) = mpsc::channel(CHANNEL_SIZE);
    let driver = ClientDriver {
        transport,
        service,
        shared: shared.clone(),
        cmd_rx,
        pending: HashMap::new(),
        next_id: 0,
        handshake_done: false,
        sent_full_protocol: false,
        server_hash: None,
        no_ping: opts.no_ping,
    };
    tokio::spawn(driver.run());
    Channel { shared, cmd_tx }
}

/// Spawn a client driver over a stateless transport.
pub(crate) fn spawn_stateless<T: StatelessTransport>(
    service: Arc<Service>,
    transport: T,
    opts: ChannelOptions,
) -> Channel {
    let shared = ChannelShared::new(opts.scope.clone());
    let (cmd_tx, cmd_rx) = mpsc::channel(CHANNEL_SIZE);
    let driver = StatelessDriver {
        transport: Arc::new(transport),
        service,
        shared: shared.clone(),
        cmd_rx,
        negotiation: Arc::new(Mutex::new(Negotiation {
            server_hash: None,
            include_protocol: false,
        })),
    };
    tokio::spawn(driver.run());
    Channel { shared, cmd_tx }
}

/// Spawn a server driver over a stateful transport.
pub(crate) fn spawn_server<T: FrameTransport>(
    server: Server,
    transport: T,
    opts: ChannelOptions,
) -> Channel {
    let shared = ChannelShared::new(opts.scope.clone());
    let (cmd_tx, cmd_rx) = mpsc::channel(CHANNEL_SIZE);
    let (out_tx, out_rx) = mpsc::channel(CHANNEL_SIZE);
    let driver = ServerDriver {
        transport,
        server,
        shared: shared.clone(),
        cmd_rx,
        out_tx,
        out_rx,
    };
    tokio::spawn(driver.run());
    Channel { shared, cmd_tx }
}

fn handshake_request(
    service: &Service,
    server_hash: Option<ProtocolHash>,
    include_protocol: bool,
) -> HandshakeRequest {
    HandshakeRequest {
        client_hash: service.hash(),
        client_protocol: include_protocol.then(|| service.document().to_owned()),
        server_hash: server_hash.unwrap_or_else(|| service.hash()),
        meta: None,
    }
}

/// Split a handshake response off the front of a response body.
fn split_handshake(body: &Bytes) -> Result<(HandshakeResponse, Bytes), ServiceError> {
    let mut cursor = Cursor::new(body.as_ref());
    let response = HandshakeResponse::decode(&mut cursor)
        .map_err(|e| ServiceError::Handshake(e.to_string()))?;
    let rest = body.slice(cursor.position() as usize..);
    Ok((response, rest))
}

/// What a completed handshake taught us about the peer.
struct NegotiatedRemote {
    remote: Option<Arc<Service>>,
    server_hash: Option<ProtocolHash>,
}

/// Digest a handshake response's protocol payload.
///
/// `None` for the remote service means the peer speaks our protocol.
fn digest_handshake(
    own: &Service,
    response: &HandshakeResponse,
) -> Result<NegotiatedRemote, ServiceError> {
    match &response.server_protocol {
        Some(document) => {
            let remote = Service::compile(document)
                .map_err(|e| ServiceError::Handshake(format!("bad server protocol: {e}")))?;
            let differs = remote.hash() != own.hash();
            Ok(NegotiatedRemote {
                remote: differs.then(|| Arc::new(remote)),
                server_hash: response.server_hash,
            })
        }
        None => Ok(NegotiatedRemote {
            remote: None,
            server_hash: response.server_hash,
        }),
    }
}

// ============================================================================
// Client driver (stateful)
// ============================================================================

struct PendingCall {
    /// Reply slot; `None` for one-way calls that resolved at flush.
    reply: Option<tokio::sync::oneshot::Sender<Result<Option<Bytes>, ServiceError>>>,
    /// Envelope without handshake, kept for the `NONE` retry.
    retry_body: Option<Bytes>,
    /// Whether the request carried the full protocol text. A `NONE` for
    /// such a request is final.
    sent_full: bool,
}

struct ClientDriver<T: FrameTransport> {
    transport: T,
    service: Arc<Service>,
    shared: Arc<ChannelShared>,
    cmd_rx: mpsc::Receiver<ChannelCommand>,
    pending: HashMap<u32, PendingCall>,
    next_id: u32,
    handshake_done: bool,
    sent_full_protocol: bool,
    server_hash: Option<ProtocolHash>,
    no_ping: bool,
}

enum Event {
    Command(Option<ChannelCommand>),
    Incoming(std::io::Result<Option<Packet>>),
}

impl<T: FrameTransport> ClientDriver<T> {
    async fn run(mut self) {
        if !self.no_ping {
            if let Err(e) = self.ping().await {
                warn!(channel = self.shared.id, error = %e, "channel handshake failed");
                self.fatal(e).await;
                return;
            }
            self.handshake_done = true;
            self.shared.set_state(ChannelState::Open);
        }

        loop {
            let event = tokio::select! {
                command = self.cmd_rx.recv() => Event::Command(command),
                incoming = self.transport.recv() => Event::Incoming(incoming),
            };
            match event {
                Event::Command(Some(ChannelCommand::Call {
                    body,
                    one_way,
                    reply,
                })) => {
                    if let Err(e) = self.start_call(body, one_way, reply).await {
                        self.fatal(e).await;
                        return;
                    }
                }
                Event::Command(Some(ChannelCommand::Destroy)) | Event::Command(None) => break,
                Event::Incoming(Ok(Some(packet))) => {
                    if let Err(e) = self.handle_response(packet).await {
                        self.fatal(e).await;
                        return;
                    }
                }
                Event::Incoming(Ok(None)) => {
                    self.fail_all(ServiceError::Transport("connection closed".into()));
                    self.shared.set_state(ChannelState::Closed);
                    return;
                }
                Event::Incoming(Err(e)) => {
                    self.fatal(ServiceError::Transport(e.to_string())).await;
                    return;
                }
            }
        }

        // Explicit destroy (or all handles dropped).
        self.fail_all(ServiceError::Transport("channel closed".into()));
        self.shared.set_state(ChannelState::Closed);
    }

    /// Opening ping: an empty-named call carrying only the handshake.
    async fn ping(&mut self) -> Result<(), ServiceError> {
        let mut body = BytesMut::new();
        body.extend_from_slice(&parley_wire::encode_metadata(&Default::default())?);
        body.extend_from_slice(&parley_wire::encode_message_name("")?);
        let envelope = body.freeze();

        loop {
            let id = self.alloc_id();
            let handshake =
                handshake_request(&self.service, self.server_hash, self.sent_full_protocol);
            let mut framed = BytesMut::from(&handshake.encode()?[..]);
            framed.extend_from_slice(&envelope);
            self.transport
                .send(Packet::new(
                    id,
                    self.shared.scope.clone(),
                    FLAG_HANDSHAKE,
                    framed.freeze(),
                ))
                .await
                .map_err(|e| ServiceError::Transport(e.to_string()))?;

            let packet = loop {
                match self
                    .transport
                    .recv()
                    .await
                    .map_err(|e| ServiceError::Transport(e.to_string()))?
                {
                    Some(packet) if packet.id == id => break packet,
                    Some(packet) => {
                        warn!(id = packet.id, "ignoring packet while pinging");
                    }
                    None => {
                        return Err(ServiceError::Transport(
                            "connection closed during handshake".into(),
                        ))
                    }
                }
            };

            let (response, _rest) = split_handshake(&packet.body)?;
            match response.matching {
                HandshakeMatch::None if !self.sent_full_protocol => {
                    self.sent_full_protocol = true;
                    continue;
                }
                HandshakeMatch::None => {
                    return Err(ServiceError::Handshake("unknown protocol".into()));
                }
                _ => {
                    let negotiated = digest_handshake(&self.service, &response)?;
                    self.shared.set_remote(negotiated.remote);
                    if negotiated.server_hash.is_some() {
                        self.server_hash = negotiated.server_hash;
                    }
                    return Ok(());
                }
            }
        }
    }

    async fn start_call(
        &mut self,
        body: Bytes,
        one_way: bool,
        reply: tokio::sync::oneshot::Sender<Result<Option<Bytes>, ServiceError>>,
    ) -> Result<(), ServiceError> {
        let id = self.alloc_id();

        let (flags, framed) = if self.handshake_done {
            (0, body.clone())
        } else {
            let handshake =
                handshake_request(&self.service, self.server_hash, self.sent_full_protocol);
            let mut framed = BytesMut::from(&handshake.encode()?[..]);
            framed.extend_from_slice(&body);
            (FLAG_HANDSHAKE, framed.freeze())
        };

        let sent_full = !self.handshake_done && self.sent_full_protocol;
        let packet = Packet::new(id, self.shared.scope.clone(), flags, framed);
        if let Err(e) = self.transport.send(packet).await {
            // Transport failure is channel-fatal; the caller of start_call
            // fails everything, including this reply.
            self.pending.insert(
                id,
                PendingCall {
                    reply: Some(reply),
                    retry_body: None,
                    sent_full,
                },
            );
            return Err(ServiceError::Transport(e.to_string()));
        }

        if one_way {
            // One-way calls resolve at flush. An entry still tracks the
            // handshake response when one is outstanding.
            let _ = reply.send(Ok(None));
            if !self.handshake_done {
                self.pending.insert(
                    id,
                    PendingCall {
                        reply: None,
                        retry_body: Some(body),
                        sent_full,
                    },
                );
            }
        } else {
            self.pending.insert(
                id,
                PendingCall {
                    reply: Some(reply),
                    retry_body: (!self.handshake_done).then(|| body),
                    sent_full,
                },
            );
        }
        Ok(())
    }

    async fn handle_response(&mut self, packet: Packet) -> Result<(), ServiceError> {
        let Some(entry) = self.pending.remove(&packet.id) else {
            warn!(id = packet.id, "response for unknown call id");
            return Ok(());
        };

        let rest = if packet.has_handshake() {
            let (response, rest) = split_handshake(&packet.body)?;
            match response.matching {
                HandshakeMatch::None if !entry.sent_full => {
                    self.sent_full_protocol = true;
                    if let Some(body) = entry.retry_body {
                        return self.resend(body, entry.reply).await;
                    }
                    return Ok(());
                }
                HandshakeMatch::None => {
                    let err = ServiceError::Handshake("unknown protocol".into());
                    if let Some(reply) = entry.reply {
                        let _ = reply.send(Err(err.clone()));
                    }
                    return Err(err);
                }
                _ => {
                    let negotiated = digest_handshake(&self.service, &response)?;
                    self.shared.set_remote(negotiated.remote);
                    if negotiated.server_hash.is_some() {
                        self.server_hash = negotiated.server_hash;
                    }
                    self.handshake_done = true;
                    self.shared.set_state(ChannelState::Open);
                    rest
                }
            }
        } else {
            packet.body
        };

        if let Some(reply) = entry.reply {
            let _ = reply.send(Ok(Some(rest)));
        }
        Ok(())
    }

    async fn resend(
        &mut self,
        body: Bytes,
        reply: Option<tokio::sync::oneshot::Sender<Result<Option<Bytes>, ServiceError>>>,
    ) -> Result<(), ServiceError> {
        let id = self.alloc_id();
        let handshake = handshake_request(&self.service, self.server_hash, true);
        let mut framed = BytesMut::from(&handshake.encode()?[..]);
        framed.extend_from_slice(&body);
        self.transport
            .send(Packet::new(
                id,
                self.shared.scope.clone(),
                FLAG_HANDSHAKE,
                framed.freeze(),
            ))
            .await
            .map_err(|e| ServiceError::Transport(e.to_string()))?;
        self.pending.insert(
            id,
            PendingCall {
                reply,
                retry_body: None,
                sent_full: true,
            },
        );
        Ok(())
    }

    /// Next call id, skipping ids still in flight. Ids are reused after
    /// their call completes.
    fn alloc_id(&mut self) -> u32 {
        loop {
            self.next_id = self.next_id.wrapping_add(1);
            if !self.pending.contains_key(&self.next_id) {
                return self.next_id;
            }
        }
    }

    fn fail_all(&mut self, err: ServiceError) {
        for (_, entry) in self.pending.drain() {
            if let Some(reply) = entry.reply {
                let _ = reply.send(Err(err.clone()));
            }
        }
    }

    /// Enter the terminal errored state and keep failing queued commands so
    /// callers get prompt errors instead of hangs.
    async fn fatal(mut self, err: ServiceError) {
        self.fail_all(err.clone());
        self.shared.set_state(ChannelState::Errored);
        while let Some(command) = self.cmd_rx.recv().await {
            match command {
                ChannelCommand::Call { reply, .. } => {
                    let _ = reply.send(Err(err.clone()));
                }
                ChannelCommand::Destroy => break,
            }
        }
    }
}

// ============================================================================
// Client driver (stateless)
// ============================================================================

struct Negotiation {
    server_hash: Option<ProtocolHash>,
    include_protocol: bool,
}

struct StatelessDriver<T: StatelessTransport> {
    transport: Arc<T>,
    service: Arc<Service>,
    shared: Arc<ChannelShared>,
    cmd_rx: mpsc::Receiver<ChannelCommand>,
    negotiation: Arc<Mutex<Negotiation>>,
}

impl<T: StatelessTransport> StatelessDriver<T> {
    async fn run(mut self) {
        while let Some(command) = self.cmd_rx.recv().await {
            match command {
                ChannelCommand::Destroy => break,
                ChannelCommand::Call {
                    body,
                    one_way,
                    reply,
                } => {
                    // Each call gets a fresh sink; calls overlap freely
                    // across sinks, never within one.
                    let transport = self.transport.clone();
                    let service = self.service.clone();
                    let shared = self.shared.clone();
                    let negotiation = self.negotiation.clone();
                    tokio::spawn(async move {
                        let result = Self::exchange(
                            transport,
                            service,
                            shared,
                            negotiation,
                            body,
                            one_way,
                        )
                        .await;
                        let _ = reply.send(result);
                    });
                }
            }
        }
        self.shared.set_state(ChannelState::Closed);
    }

    async fn exchange(
        transport: Arc<T>,
        service: Arc<Service>,
        shared: Arc<ChannelShared>,
        negotiation: Arc<Mutex<Negotiation>>,
        body: Bytes,
        one_way: bool,
    ) -> Result<Option<Bytes>, ServiceError> {
        let mut attempted_full = false;
        loop {
            let (server_hash, include_protocol) = {
                let negotiation = negotiation.lock().expect("negotiation poisoned");
                (negotiation.server_hash, negotiation.include_protocol)
            };
            let include_protocol = include_protocol || attempted_full;

            let handshake = handshake_request(&service, server_hash, include_protocol);
            let mut framed = BytesMut::from(&handshake.encode()?[..]);
            framed.extend_from_slice(&body);

            let response = transport
                .exchange(framed.freeze())
                .await
                .map_err(|e| ServiceError::Transport(e.to_string()))?;

            let (handshake, rest) = split_handshake(&response)?;
            match handshake.matching {
                HandshakeMatch::None if !include_protocol => {
                    attempted_full = true;
                    negotiation
                        .lock()
                        .expect("negotiation poisoned")
                        .include_protocol = true;
                    continue;
                }
                HandshakeMatch::None => {
                    shared.set_state(ChannelState::Errored);
                    return Err(ServiceError::Handshake("unknown protocol".into()));
                }
                _ => {
                    let negotiated = digest_handshake(&service, &handshake)?;
                    shared.set_remote(negotiated.remote);
                    {
                        let mut negotiation =
                            negotiation.lock().expect("negotiation poisoned");
                        if negotiated.server_hash.is_some() {
                            negotiation.server_hash = negotiated.server_hash;
                        }
                        // Once reconciled, the hash alone suffices.
                        negotiation.include_protocol = false;
                    }
                    shared.set_state(ChannelState::Open);
                    return Ok(if one_way { None } else { Some(rest) });
                }
            }
        }
    }
}

// ============================================================================
// Server driver
// ============================================================================

struct ServerDriver<T: FrameTransport> {
    transport: T,
    server: Server,
    shared: Arc<ChannelShared>,
    cmd_rx: mpsc::Receiver<ChannelCommand>,
    out_tx: mpsc::Sender<Packet>,
    out_rx: mpsc::Receiver<Packet>,
}

enum ServerEvent {
    Command(Option<ChannelCommand>),
    Incoming(std::io::Result<Option<Packet>>),
    Outgoing(Option<Packet>),
}

impl<T: FrameTransport> ServerDriver<T> {
    async fn run(mut self) {
        loop {
            let event = tokio::select! {
                command = self.cmd_rx.recv() => ServerEvent::Command(command),
                incoming = self.transport.recv() => ServerEvent::Incoming(incoming),
                outgoing = self.out_rx.recv() => ServerEvent::Outgoing(outgoing),
            };
            match event {
                ServerEvent::Command(Some(ChannelCommand::Call { reply, .. })) => {
                    let _ = reply.send(Err(ServiceError::Transport(
                        "cannot emit on a server channel".into(),
                    )));
                }
                ServerEvent::Command(Some(ChannelCommand::Destroy))
                | ServerEvent::Command(None) => break,
                ServerEvent::Incoming(Ok(Some(packet))) => {
                    let server = self.server.clone();
                    let shared = self.shared.clone();
                    let out_tx = self.out_tx.clone();
                    // Dispatch concurrently; responses are written in
                    // completion order, correlated by id.
                    tokio::spawn(async move {
                        if let Some(response) = server.dispatch_packet(packet, &shared).await {
                            let _ = out_tx.send(response).await;
                        }
                    });
                }
                ServerEvent::Incoming(Ok(None)) => {
                    self.shared.set_state(ChannelState::Closed);
                    return;
                }
                ServerEvent::Incoming(Err(e)) => {
                    warn!(channel = self.shared.id, error = %e, "server transport read failed");
                    self.shared.set_state(ChannelState::Errored);
                    return;
                }
                ServerEvent::Outgoing(Some(packet)) => {
                    if let Err(e) = self.transport.send(packet).await {
                        warn!(channel = self.shared.id, error = %e, "server transport write failed");
                        self.shared.set_state(ChannelState::Errored);
                        return;
                    }
                }
                // Unreachable while we hold out_tx.
                ServerEvent::Outgoing(None) => break,
            }
        }
        self.shared.set_state(ChannelState::Closed);
    }
}
