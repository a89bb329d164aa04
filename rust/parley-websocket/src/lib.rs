#![deny(unsafe_code)]

//! WebSocket transport for parley packets.
//!
//! Wraps a [`WebSocketStream`] as an object-mode
//! [`FrameTransport`]: one packet per binary WebSocket message, with the
//! WebSocket layer providing the message delimiting that byte streams get
//! from length prefixes.

use std::io;

use futures_util::{SinkExt, StreamExt};
use parley_session::FrameTransport;
use parley_wire::Packet;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// A [`FrameTransport`] over a WebSocket.
///
/// Packets are carried as binary messages; text messages are protocol
/// violations, pings are answered transparently.
pub struct WsTransport<S> {
    stream: WebSocketStream<S>,
}

impl<S> WsTransport<S> {
    /// Wrap an established WebSocket stream.
    pub fn new(stream: WebSocketStream<S>) -> Self {
        Self { stream }
    }

    /// Consume the transport and return the underlying stream.
    pub fn into_inner(self) -> WebSocketStream<S> {
        self.stream
    }
}

impl<S> FrameTransport for WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&mut self, packet: Packet) -> io::Result<()> {
        self.stream
            .send(WsMessage::Binary(packet.to_bytes().to_vec().into()))
            .await
            .map_err(io::Error::other)
    }

    async fn recv(&mut self) -> io::Result<Option<Packet>> {
        loop {
            match self.stream.next().await {
                Some(Ok(WsMessage::Binary(data))) => {
                    let packet = Packet::from_bytes(&data)
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
                    return Ok(Some(packet));
                }
                Some(Ok(WsMessage::Close(_))) => return Ok(None),
                Some(Ok(WsMessage::Ping(data))) => {
                    let _ = self.stream.send(WsMessage::Pong(data)).await;
                }
                Some(Ok(WsMessage::Pong(_))) => {}
                Some(Ok(WsMessage::Text(_))) => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "text frames not allowed",
                    ));
                }
                Some(Ok(WsMessage::Frame(_))) => {}
                Some(Err(e)) => return Err(io::Error::other(e.to_string())),
                None => return Ok(None),
            }
        }
    }
}

/// Connect a WebSocket transport to `url` (`ws://` or, with a TLS feature
/// enabled on `tokio-tungstenite`, `wss://`).
pub async fn connect(url: &str) -> io::Result<WsTransport<MaybeTlsStream<TcpStream>>> {
    let (stream, _response) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| io::Error::other(e.to_string()))?;
    Ok(WsTransport::new(stream))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::net::TcpListener;
    use tokio_tungstenite::{accept_async, connect_async};

    #[tokio::test]
    async fn packets_cross_a_websocket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut transport = WsTransport::new(accept_async(stream).await.unwrap());
            let packet = transport.recv().await.unwrap().unwrap();
            assert_eq!(packet.scope, "math");
            transport
                .send(Packet::new(packet.id, "math", 0, Bytes::from_static(b"pong")))
                .await
                .unwrap();
        });

        let (stream, _) = connect_async(format!("ws://{addr}")).await.unwrap();
        let mut transport = WsTransport::new(stream);
        transport
            .send(Packet::new(5, "math", 0, Bytes::from_static(b"ping")))
            .await
            .unwrap();
        let reply = transport.recv().await.unwrap().unwrap();
        assert_eq!(reply.id, 5);
        assert_eq!(reply.body, &b"pong"[..]);

        server.await.unwrap();
    }
}
