//! Packet framing for byte-stream transports.
//!
//! Each packet is framed as:
//!
//! ```text
//! [id: u32 BE][flags: u8][scope_len: u16 BE][scope bytes][body_len: u32 BE][body bytes]
//! ```
//!
//! The id correlates a response with its request within one channel; the
//! scope routes the packet when several logical channels share one socket.
//! Object-mode transports carry the same layout inside a single message and
//! rely on the transport for delimiting.

use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::WireError;

/// The packet body starts with an Avro handshake record.
pub const FLAG_HANDSHAKE: u8 = 1 << 0;

/// Ceiling on a single packet body. Large enough for any sane call, small
/// enough that a corrupt length prefix cannot take the process down.
pub const MAX_BODY_LEN: usize = 64 * 1024 * 1024;

const MAX_SCOPE_LEN: usize = u16::MAX as usize;

/// One framed unit on a stateful transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Call correlation id, unique among in-flight calls on one channel.
    pub id: u32,
    /// Scope label routing this packet to a logical channel.
    pub scope: String,
    /// Bit flags, see [`FLAG_HANDSHAKE`].
    pub flags: u8,
    /// The Avro-encoded call envelope.
    pub body: Bytes,
}

impl Packet {
    /// Create a packet.
    pub fn new(id: u32, scope: impl Into<String>, flags: u8, body: Bytes) -> Self {
        Self {
            id,
            scope: scope.into(),
            flags,
            body,
        }
    }

    /// Whether the body starts with a handshake record.
    pub fn has_handshake(&self) -> bool {
        self.flags & FLAG_HANDSHAKE != 0
    }

    /// Serialize into a single buffer (object-mode framing).
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + 1 + 2 + self.scope.len() + 4 + self.body.len());
        buf.put_u32(self.id);
        buf.put_u8(self.flags);
        buf.put_u16(self.scope.len() as u16);
        buf.put_slice(self.scope.as_bytes());
        buf.put_u32(self.body.len() as u32);
        buf.put_slice(&self.body);
        buf.freeze()
    }

    /// Parse a packet from a single buffer (object-mode framing).
    ///
    /// The whole buffer must be consumed; trailing bytes are an error.
    pub fn from_bytes(buf: &[u8]) -> Result<Packet, WireError> {
        let mut pos = 0usize;

        let id = u32::from_be_bytes(take(buf, &mut pos, 4)?.try_into().expect("4-byte slice"));
        let flags = take(buf, &mut pos, 1)?[0];
        let scope_len =
            u16::from_be_bytes(take(buf, &mut pos, 2)?.try_into().expect("2-byte slice")) as usize;
        let scope = std::str::from_utf8(take(buf, &mut pos, scope_len)?)
            .map_err(|_| WireError::InvalidRecord("scope"))?
            .to_owned();
        let body_len =
            u32::from_be_bytes(take(buf, &mut pos, 4)?.try_into().expect("4-byte slice")) as usize;
        if body_len > MAX_BODY_LEN {
            return Err(WireError::Oversized {
                len: body_len,
                max: MAX_BODY_LEN,
            });
        }
        let body = Bytes::copy_from_slice(take(buf, &mut pos, body_len)?);
        if pos != buf.len() {
            return Err(WireError::InvalidRecord("packet"));
        }
        Ok(Packet {
            id,
            scope,
            flags,
            body,
        })
    }

    /// Write this packet to a byte stream.
    pub async fn write_to<W>(&self, writer: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        if self.scope.len() > MAX_SCOPE_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "scope too long"));
        }
        writer.write_all(&self.to_bytes()).await?;
        writer.flush().await
    }

    /// Read one packet from a byte stream.
    ///
    /// Returns `Ok(None)` on a clean end-of-stream at a packet boundary; EOF
    /// in the middle of a packet is an error.
    pub async fn read_from<R>(reader: &mut R) -> io::Result<Option<Packet>>
    where
        R: AsyncRead + Unpin,
    {
        let mut head = [0u8; 4];
        let mut filled = 0usize;
        while filled < head.len() {
            let n = reader.read(&mut head[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            filled += n;
        }
        let id = u32::from_be_bytes(head);

        let flags = reader.read_u8().await?;
        let scope_len = reader.read_u16().await? as usize;
        let mut scope = vec![0u8; scope_len];
        reader.read_exact(&mut scope).await?;
        let scope = String::from_utf8(scope)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "scope is not utf-8"))?;

        let body_len = reader.read_u32().await? as usize;
        if body_len > MAX_BODY_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                WireError::Oversized {
                    len: body_len,
                    max: MAX_BODY_LEN,
                }
                .to_string(),
            ));
        }
        let mut body = vec![0u8; body_len];
        reader.read_exact(&mut body).await?;

        Ok(Some(Packet {
            id,
            scope,
            flags,
            body: body.into(),
        }))
    }
}

fn take<'a>(buf: &'a [u8], pos: &mut usize, n: usize) -> Result<&'a [u8], WireError> {
    let end = pos.checked_add(n).ok_or(WireError::Truncated)?;
    if end > buf.len() {
        return Err(WireError::Truncated);
    }
    let out = &buf[*pos..end];
    *pos = end;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_mode_round_trip() {
        let packet = Packet::new(7, "math", FLAG_HANDSHAKE, Bytes::from_static(b"payload"));
        let parsed = Packet::from_bytes(&packet.to_bytes()).unwrap();
        assert_eq!(parsed, packet);
        assert!(parsed.has_handshake());
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let packet = Packet::new(1, "", 0, Bytes::from_static(b"x"));
        let mut buf = packet.to_bytes().to_vec();
        buf.push(0xff);
        assert!(matches!(
            Packet::from_bytes(&buf),
            Err(WireError::InvalidRecord("packet"))
        ));
    }

    #[test]
    fn truncated_buffer_is_rejected() {
        let packet = Packet::new(1, "log", 0, Bytes::from_static(b"abcdef"));
        let buf = packet.to_bytes();
        for cut in 0..buf.len() {
            assert!(Packet::from_bytes(&buf[..cut]).is_err(), "cut at {cut}");
        }
    }

    #[tokio::test]
    async fn stream_round_trip() {
        let a = Packet::new(1, "", 0, Bytes::from_static(b"first"));
        let b = Packet::new(2, "math", FLAG_HANDSHAKE, Bytes::from_static(b"second"));

        let mut wire = Vec::new();
        a.write_to(&mut wire).await.unwrap();
        b.write_to(&mut wire).await.unwrap();

        let mut reader = &wire[..];
        assert_eq!(Packet::read_from(&mut reader).await.unwrap(), Some(a));
        assert_eq!(Packet::read_from(&mut reader).await.unwrap(), Some(b));
        assert_eq!(Packet::read_from(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn eof_mid_packet_is_an_error() {
        let packet = Packet::new(3, "", 0, Bytes::from_static(b"body"));
        let wire = packet.to_bytes();
        let mut reader = &wire[..wire.len() - 1];
        let err = Packet::read_from(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
