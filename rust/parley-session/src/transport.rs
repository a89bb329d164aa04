//! Transport shapes.
//!
//! [`FrameTransport`] is the stateful shape: a long-lived duplex carrying
//! many pipelined calls, handshaking once. [`StatelessTransport`] is the
//! one-sink-per-call shape where every request carries its own handshake.
//!
//! Byte duplexes (TCP, Unix sockets, `tokio::io::duplex` pairs) become
//! frame transports via [`LengthPrefixed`]; object-mode transports
//! (WebSocket, in-memory channels) implement [`FrameTransport`] directly
//! and carry one packet per message.

use std::future::Future;
use std::io;

use bytes::Bytes;
use parley_wire::Packet;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::BoxFuture;

/// A stateful, packet-oriented transport.
pub trait FrameTransport: Send + 'static {
    /// Send one packet.
    fn send(&mut self, packet: Packet) -> impl Future<Output = io::Result<()>> + Send;

    /// Receive one packet; `Ok(None)` is a clean end-of-stream.
    fn recv(&mut self) -> impl Future<Output = io::Result<Option<Packet>>> + Send;
}

/// A stateless transport: each call gets a fresh sink and a single
/// request/response exchange. The handshake rides inside every request.
pub trait StatelessTransport: Send + Sync + 'static {
    /// Perform one exchange.
    fn exchange(&self, request: Bytes) -> BoxFuture<'static, io::Result<Bytes>>;
}

impl<F> StatelessTransport for F
where
    F: Fn(Bytes) -> BoxFuture<'static, io::Result<Bytes>> + Send + Sync + 'static,
{
    fn exchange(&self, request: Bytes) -> BoxFuture<'static, io::Result<Bytes>> {
        (self)(request)
    }
}

/// Packet framing over any byte duplex.
pub struct LengthPrefixed<S> {
    stream: S,
}

impl<S> LengthPrefixed<S> {
    /// Wrap a byte duplex.
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    /// Consume the wrapper and return the underlying duplex.
    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S> FrameTransport for LengthPrefixed<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&mut self, packet: Packet) -> io::Result<()> {
        packet.write_to(&mut self.stream).await
    }

    async fn recv(&mut self) -> io::Result<Option<Packet>> {
        Packet::read_from(&mut self.stream).await
    }
}

/// An in-memory transport backed by bounded channels.
///
/// Create connected endpoints with [`memory_pair`]. Useful for tests and
/// for the proxy's ephemeral client/server pairs.
pub struct MemoryTransport {
    tx: mpsc::Sender<Packet>,
    rx: mpsc::Receiver<Packet>,
}

/// Create a connected pair of in-memory transports.
pub fn memory_pair(capacity: usize) -> (MemoryTransport, MemoryTransport) {
    let capacity = capacity.max(1);
    let (a_to_b_tx, a_to_b_rx) = mpsc::channel(capacity);
    let (b_to_a_tx, b_to_a_rx) = mpsc::channel(capacity);
    (
        MemoryTransport {
            tx: a_to_b_tx,
            rx: b_to_a_rx,
        },
        MemoryTransport {
            tx: b_to_a_tx,
            rx: a_to_b_rx,
        },
    )
}

impl FrameTransport for MemoryTransport {
    async fn send(&mut self, packet: Packet) -> io::Result<()> {
        self.tx
            .send(packet)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer disconnected"))
    }

    async fn recv(&mut self) -> io::Result<Option<Packet>> {
        Ok(self.rx.recv().await)
    }
}
