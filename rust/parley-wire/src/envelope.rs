//! Call envelope pieces.
//!
//! A request body is `[handshake?] metadata message-name request-datum`,
//! a response body is `[handshake?] metadata error-flag (response | error)`.
//! The metadata map doubles as the extensible binary header space exposed to
//! middleware; the message payloads themselves are encoded by the service
//! layer, which owns the schemas.

use std::collections::HashMap;
use std::io::Read;

use apache_avro::types::Value;
use apache_avro::Schema;
use once_cell::sync::Lazy;

use crate::WireError;

/// Binary headers carried with every request and response.
pub type Metadata = HashMap<String, Vec<u8>>;

static META_SCHEMA: Lazy<Schema> =
    Lazy::new(|| Schema::parse_str(r#"{"type": "map", "values": "bytes"}"#).expect("map schema"));

static STRING_SCHEMA: Lazy<Schema> =
    Lazy::new(|| Schema::parse_str(r#""string""#).expect("string schema"));

static BOOLEAN_SCHEMA: Lazy<Schema> =
    Lazy::new(|| Schema::parse_str(r#""boolean""#).expect("boolean schema"));

/// Encode a metadata map as one Avro datum.
pub fn encode_metadata(metadata: &Metadata) -> Result<Vec<u8>, WireError> {
    let value = Value::Map(
        metadata
            .iter()
            .map(|(k, v)| (k.clone(), Value::Bytes(v.clone())))
            .collect(),
    );
    Ok(apache_avro::to_avro_datum(&META_SCHEMA, value)?)
}

/// Decode a metadata map, leaving `reader` positioned after the datum.
pub fn decode_metadata<R: Read>(reader: &mut R) -> Result<Metadata, WireError> {
    let value = apache_avro::from_avro_datum(&META_SCHEMA, reader, None)?;
    let Value::Map(map) = value else {
        return Err(WireError::InvalidRecord("metadata"));
    };
    let mut out = HashMap::with_capacity(map.len());
    for (k, v) in map {
        match v {
            Value::Bytes(b) => {
                out.insert(k, b);
            }
            _ => return Err(WireError::InvalidRecord("metadata")),
        }
    }
    Ok(out)
}

/// Encode a message name as one Avro datum.
pub fn encode_message_name(name: &str) -> Result<Vec<u8>, WireError> {
    Ok(apache_avro::to_avro_datum(
        &STRING_SCHEMA,
        Value::String(name.to_owned()),
    )?)
}

/// Decode a message name, leaving `reader` positioned after the datum.
pub fn decode_message_name<R: Read>(reader: &mut R) -> Result<String, WireError> {
    match apache_avro::from_avro_datum(&STRING_SCHEMA, reader, None)? {
        Value::String(s) => Ok(s),
        _ => Err(WireError::InvalidRecord("message name")),
    }
}

/// Encode the response error flag.
pub fn encode_error_flag(is_error: bool) -> Result<Vec<u8>, WireError> {
    Ok(apache_avro::to_avro_datum(
        &BOOLEAN_SCHEMA,
        Value::Boolean(is_error),
    )?)
}

/// Decode the response error flag.
pub fn decode_error_flag<R: Read>(reader: &mut R) -> Result<bool, WireError> {
    match apache_avro::from_avro_datum(&BOOLEAN_SCHEMA, reader, None)? {
        Value::Boolean(b) => Ok(b),
        _ => Err(WireError::InvalidRecord("error flag")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn metadata_round_trip() {
        let mut metadata = Metadata::new();
        metadata.insert("trace".into(), vec![1, 2, 3]);
        metadata.insert("empty".into(), vec![]);
        let bytes = encode_metadata(&metadata).unwrap();
        let decoded = decode_metadata(&mut Cursor::new(&bytes)).unwrap();
        assert_eq!(decoded, metadata);
    }

    #[test]
    fn envelope_pieces_parse_sequentially() {
        let mut body = Vec::new();
        body.extend(encode_metadata(&Metadata::new()).unwrap());
        body.extend(encode_message_name("neg").unwrap());
        body.extend(encode_error_flag(false).unwrap());

        let mut cursor = Cursor::new(&body[..]);
        assert!(decode_metadata(&mut cursor).unwrap().is_empty());
        assert_eq!(decode_message_name(&mut cursor).unwrap(), "neg");
        assert!(!decode_error_flag(&mut cursor).unwrap());
        assert_eq!(cursor.position() as usize, body.len());
    }
}
