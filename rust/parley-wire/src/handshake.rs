//! The Avro RPC handshake records.
//!
//! A channel opens by exchanging `HandshakeRequest`/`HandshakeResponse`
//! records, reconciling the two protocols by MD5 hash. The hash-only fast
//! path is the common case; the full protocol text travels only when a peer
//! reports it does not know the hash.

use std::collections::HashMap;
use std::io::Read;

use apache_avro::types::Value;
use apache_avro::Schema;
use once_cell::sync::Lazy;

use crate::WireError;

/// MD5 fingerprint of a protocol document.
pub type ProtocolHash = [u8; 16];

static HANDSHAKE_REQUEST_SCHEMA: Lazy<Schema> = Lazy::new(|| {
    Schema::parse_str(
        r#"{
            "type": "record",
            "name": "HandshakeRequest",
            "namespace": "org.apache.avro.ipc",
            "fields": [
                {"name": "clientHash", "type": {"type": "fixed", "name": "MD5", "size": 16}},
                {"name": "clientProtocol", "type": ["null", "string"]},
                {"name": "serverHash", "type": "MD5"},
                {"name": "meta", "type": ["null", {"type": "map", "values": "bytes"}]}
            ]
        }"#,
    )
    .expect("builtin handshake request schema")
});

static HANDSHAKE_RESPONSE_SCHEMA: Lazy<Schema> = Lazy::new(|| {
    Schema::parse_str(
        r#"{
            "type": "record",
            "name": "HandshakeResponse",
            "namespace": "org.apache.avro.ipc",
            "fields": [
                {"name": "match", "type": {"type": "enum", "name": "HandshakeMatch",
                    "symbols": ["BOTH", "CLIENT", "NONE"]}},
                {"name": "serverProtocol", "type": ["null", "string"]},
                {"name": "serverHash",
                    "type": ["null", {"type": "fixed", "name": "MD5", "size": 16}]},
                {"name": "meta", "type": ["null", {"type": "map", "values": "bytes"}]}
            ]
        }"#,
    )
    .expect("builtin handshake response schema")
});

/// Outcome of protocol reconciliation, from the server's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeMatch {
    /// Both hashes were recognized; no protocol text needed.
    Both,
    /// The client's protocol is known but its idea of the server protocol
    /// was stale; the response carries the server protocol.
    Client,
    /// The client hash is unknown; the client must resend with the full
    /// protocol text.
    None,
}

impl HandshakeMatch {
    fn index(self) -> u32 {
        match self {
            HandshakeMatch::Both => 0,
            HandshakeMatch::Client => 1,
            HandshakeMatch::None => 2,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            HandshakeMatch::Both => "BOTH",
            HandshakeMatch::Client => "CLIENT",
            HandshakeMatch::None => "NONE",
        }
    }

    fn from_symbol(symbol: &str) -> Result<Self, WireError> {
        match symbol {
            "BOTH" => Ok(HandshakeMatch::Both),
            "CLIENT" => Ok(HandshakeMatch::Client),
            "NONE" => Ok(HandshakeMatch::None),
            _ => Err(WireError::InvalidRecord("handshake match")),
        }
    }
}

/// The client half of the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    /// Hash of the client protocol.
    pub client_hash: ProtocolHash,
    /// Full client protocol text, sent after a `NONE` response.
    pub client_protocol: Option<String>,
    /// The client's current idea of the server protocol hash.
    pub server_hash: ProtocolHash,
    /// Extension metadata.
    pub meta: Option<HashMap<String, Vec<u8>>>,
}

impl HandshakeRequest {
    /// Encode as a single Avro datum.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let value = Value::Record(vec![
            (
                "clientHash".into(),
                Value::Fixed(16, self.client_hash.to_vec()),
            ),
            (
                "clientProtocol".into(),
                optional_string(self.client_protocol.clone()),
            ),
            (
                "serverHash".into(),
                Value::Fixed(16, self.server_hash.to_vec()),
            ),
            ("meta".into(), optional_meta(self.meta.clone())),
        ]);
        Ok(apache_avro::to_avro_datum(&HANDSHAKE_REQUEST_SCHEMA, value)?)
    }

    /// Decode one datum from `reader`, leaving it positioned after the record.
    pub fn decode<R: Read>(reader: &mut R) -> Result<Self, WireError> {
        let value = apache_avro::from_avro_datum(&HANDSHAKE_REQUEST_SCHEMA, reader, None)?;
        let Value::Record(fields) = value else {
            return Err(WireError::InvalidRecord("handshake request"));
        };
        let mut client_hash = None;
        let mut client_protocol = None;
        let mut server_hash = None;
        let mut meta = None;
        for (name, value) in fields {
            match name.as_str() {
                "clientHash" => client_hash = Some(fixed16(value)?),
                "clientProtocol" => client_protocol = unwrap_optional_string(value)?,
                "serverHash" => server_hash = Some(fixed16(value)?),
                "meta" => meta = unwrap_optional_meta(value)?,
                _ => return Err(WireError::InvalidRecord("handshake request")),
            }
        }
        Ok(HandshakeRequest {
            client_hash: client_hash.ok_or(WireError::InvalidRecord("handshake request"))?,
            client_protocol,
            server_hash: server_hash.ok_or(WireError::InvalidRecord("handshake request"))?,
            meta,
        })
    }
}

/// The server half of the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    /// Reconciliation outcome.
    pub matching: HandshakeMatch,
    /// Full server protocol, sent on `CLIENT` and `NONE`.
    pub server_protocol: Option<String>,
    /// Server protocol hash, sent alongside `server_protocol`.
    pub server_hash: Option<ProtocolHash>,
    /// Extension metadata.
    pub meta: Option<HashMap<String, Vec<u8>>>,
}

impl HandshakeResponse {
    /// Encode as a single Avro datum.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let value = Value::Record(vec![
            (
                "match".into(),
                Value::Enum(self.matching.index(), self.matching.symbol().into()),
            ),
            (
                "serverProtocol".into(),
                optional_string(self.server_protocol.clone()),
            ),
            (
                "serverHash".into(),
                match self.server_hash {
                    None => Value::Union(0, Box::new(Value::Null)),
                    Some(hash) => Value::Union(1, Box::new(Value::Fixed(16, hash.to_vec()))),
                },
            ),
            ("meta".into(), optional_meta(self.meta.clone())),
        ]);
        Ok(apache_avro::to_avro_datum(
            &HANDSHAKE_RESPONSE_SCHEMA,
            value,
        )?)
    }

    /// Decode one datum from `reader`, leaving it positioned after the record.
    pub fn decode<R: Read>(reader: &mut R) -> Result<Self, WireError> {
        let value = apache_avro::from_avro_datum(&HANDSHAKE_RESPONSE_SCHEMA, reader, None)?;
        let Value::Record(fields) = value else {
            return Err(WireError::InvalidRecord("handshake response"));
        };
        let mut matching = None;
        let mut server_protocol = None;
        let mut server_hash = None;
        let mut meta = None;
        for (name, value) in fields {
            match name.as_str() {
                "match" => match value {
                    Value::Enum(_, symbol) => {
                        matching = Some(HandshakeMatch::from_symbol(&symbol)?);
                    }
                    _ => return Err(WireError::InvalidRecord("handshake match")),
                },
                "serverProtocol" => server_protocol = unwrap_optional_string(value)?,
                "serverHash" => {
                    server_hash = match unwrap_union(value)? {
                        Value::Null => None,
                        other => Some(fixed16(other)?),
                    };
                }
                "meta" => meta = unwrap_optional_meta(value)?,
                _ => return Err(WireError::InvalidRecord("handshake response")),
            }
        }
        Ok(HandshakeResponse {
            matching: matching.ok_or(WireError::InvalidRecord("handshake response"))?,
            server_protocol,
            server_hash,
            meta,
        })
    }
}

fn optional_string(value: Option<String>) -> Value {
    match value {
        None => Value::Union(0, Box::new(Value::Null)),
        Some(s) => Value::Union(1, Box::new(Value::String(s))),
    }
}

fn optional_meta(meta: Option<HashMap<String, Vec<u8>>>) -> Value {
    match meta {
        None => Value::Union(0, Box::new(Value::Null)),
        Some(map) => Value::Union(
            1,
            Box::new(Value::Map(
                map.into_iter().map(|(k, v)| (k, Value::Bytes(v))).collect(),
            )),
        ),
    }
}

fn unwrap_union(value: Value) -> Result<Value, WireError> {
    match value {
        Value::Union(_, inner) => Ok(*inner),
        other => Ok(other),
    }
}

fn unwrap_optional_string(value: Value) -> Result<Option<String>, WireError> {
    match unwrap_union(value)? {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s)),
        _ => Err(WireError::InvalidRecord("handshake string")),
    }
}

fn unwrap_optional_meta(value: Value) -> Result<Option<HashMap<String, Vec<u8>>>, WireError> {
    match unwrap_union(value)? {
        Value::Null => Ok(None),
        Value::Map(map) => {
            let mut out = HashMap::with_capacity(map.len());
            for (k, v) in map {
                match v {
                    Value::Bytes(b) => {
                        out.insert(k, b);
                    }
                    _ => return Err(WireError::InvalidRecord("handshake meta")),
                }
            }
            Ok(Some(out))
        }
        _ => Err(WireError::InvalidRecord("handshake meta")),
    }
}

fn fixed16(value: Value) -> Result<ProtocolHash, WireError> {
    match value {
        Value::Fixed(16, bytes) => {
            let mut out = [0u8; 16];
            out.copy_from_slice(&bytes);
            Ok(out)
        }
        _ => Err(WireError::InvalidRecord("md5 fixed")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn request_round_trip() {
        let request = HandshakeRequest {
            client_hash: [1; 16],
            client_protocol: Some("{\"protocol\":\"Math\"}".into()),
            server_hash: [2; 16],
            meta: Some(HashMap::from([("k".to_string(), b"v".to_vec())])),
        };
        let bytes = request.encode().unwrap();
        let decoded = HandshakeRequest::decode(&mut Cursor::new(&bytes)).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn response_round_trip_all_matches() {
        for matching in [
            HandshakeMatch::Both,
            HandshakeMatch::Client,
            HandshakeMatch::None,
        ] {
            let response = HandshakeResponse {
                matching,
                server_protocol: (matching != HandshakeMatch::Both)
                    .then(|| "{\"protocol\":\"Math\"}".to_string()),
                server_hash: (matching != HandshakeMatch::Both).then_some([9; 16]),
                meta: None,
            };
            let bytes = response.encode().unwrap();
            let decoded = HandshakeResponse::decode(&mut Cursor::new(&bytes)).unwrap();
            assert_eq!(decoded, response);
        }
    }

    #[test]
    fn decode_leaves_reader_after_record() {
        let request = HandshakeRequest {
            client_hash: [3; 16],
            client_protocol: None,
            server_hash: [4; 16],
            meta: None,
        };
        let mut bytes = request.encode().unwrap();
        bytes.extend_from_slice(b"tail");
        let mut cursor = Cursor::new(&bytes[..]);
        HandshakeRequest::decode(&mut cursor).unwrap();
        let mut rest = Vec::new();
        cursor.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"tail");
    }
}
