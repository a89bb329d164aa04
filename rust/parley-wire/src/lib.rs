#![deny(unsafe_code)]

//! Wire-level types for parley.
//!
//! This crate defines everything that crosses a transport boundary:
//!
//! - [`Packet`], the framed unit carried by stateful transports, with its
//!   byte-stream framing (`frame`),
//! - the Avro handshake records exchanged when a channel negotiates
//!   protocols (`handshake`),
//! - the per-call envelope pieces: metadata maps, message names, and the
//!   response error flag (`envelope`).
//!
//! Everything here is transport-agnostic: byte-stream transports use
//! [`Packet::write_to`]/[`Packet::read_from`], object-mode transports (for
//! example WebSocket binary messages) use [`Packet::to_bytes`]/
//! [`Packet::from_bytes`] and let the transport delimit messages.

mod envelope;
mod frame;
mod handshake;

pub use envelope::{
    decode_error_flag, decode_message_name, decode_metadata, encode_error_flag,
    encode_message_name, encode_metadata, Metadata,
};
pub use frame::{Packet, FLAG_HANDSHAKE, MAX_BODY_LEN};
pub use handshake::{HandshakeMatch, HandshakeRequest, HandshakeResponse, ProtocolHash};

use std::fmt;

/// Error produced while encoding or decoding wire data.
#[derive(Debug)]
pub enum WireError {
    /// Avro-level encode/decode failure.
    Avro(apache_avro::Error),
    /// A record did not have the shape the wire schema promises.
    InvalidRecord(&'static str),
    /// A frame header declared a body larger than [`MAX_BODY_LEN`].
    Oversized {
        /// Declared body length.
        len: usize,
        /// The configured ceiling.
        max: usize,
    },
    /// The buffer ended in the middle of a frame.
    Truncated,
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::Avro(e) => write!(f, "avro: {e}"),
            WireError::InvalidRecord(what) => write!(f, "invalid {what} record"),
            WireError::Oversized { len, max } => {
                write!(f, "frame body of {len} bytes exceeds limit of {max}")
            }
            WireError::Truncated => write!(f, "truncated frame"),
        }
    }
}

impl std::error::Error for WireError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WireError::Avro(e) => Some(e),
            _ => None,
        }
    }
}

impl From<apache_avro::Error> for WireError {
    fn from(e: apache_avro::Error) -> Self {
        WireError::Avro(e)
    }
}
