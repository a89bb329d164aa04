#![deny(unsafe_code)]

//! Protocol compiler for parley.
//!
//! A [`Service`] is the compiled form of an Avro protocol document: its
//! ordered set of [`Message`]s (each with request, response, and error
//! schemas), its named types, and the MD5 fingerprint used during channel
//! handshakes. Services are immutable once compiled and shared as
//! `Arc<Service>`.
//!
//! The actual Avro parsing and datum coding is delegated to `apache-avro`;
//! this crate's job is assembling per-message schemas out of a protocol
//! document (inlining named type references so every component schema is
//! self-contained) and bridging Avro values to and from their JSON encoding
//! for the HTTP surfaces.

mod message;
mod service;
pub mod transcode;

pub use message::{request_field, Message};
pub use service::Service;

use std::fmt;

/// Error compiling a protocol document into a [`Service`].
#[derive(Debug)]
pub enum SchemaError {
    /// The document is not valid JSON.
    Json(serde_json::Error),
    /// A component schema was rejected by the Avro layer.
    Avro(apache_avro::Error),
    /// The document is structurally wrong (missing or mistyped attribute).
    Invalid(String),
    /// A type reference that no declaration satisfies.
    UnknownType(String),
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaError::Json(e) => write!(f, "protocol document is not JSON: {e}"),
            SchemaError::Avro(e) => write!(f, "avro: {e}"),
            SchemaError::Invalid(what) => write!(f, "invalid protocol: {what}"),
            SchemaError::UnknownType(name) => write!(f, "unknown type: {name}"),
        }
    }
}

impl std::error::Error for SchemaError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SchemaError::Json(e) => Some(e),
            SchemaError::Avro(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for SchemaError {
    fn from(e: serde_json::Error) -> Self {
        SchemaError::Json(e)
    }
}

impl From<apache_avro::Error> for SchemaError {
    fn from(e: apache_avro::Error) -> Self {
        SchemaError::Avro(e)
    }
}
