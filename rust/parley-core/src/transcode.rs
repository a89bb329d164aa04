//! Avro values ⇄ their JSON encoding.
//!
//! The proxy's `avro/json` mode and the handshake's protocol documents both
//! speak the standard Avro JSON encoding: bytes and fixed as code-point
//! strings, enums as symbols, unions as `null` or a single-key object keyed
//! by the branch name. Transcoding is schema-guided in both directions;
//! `Schema::Ref` nodes (recursive types) resolve through the service's name
//! table.

use std::collections::HashMap;

use apache_avro::schema::Schema;
use apache_avro::types::Value;
use serde_json::{Map as JsonMap, Number, Value as JsonValue};

use crate::service::schema_full_name;

/// Error transcoding between an Avro value and its JSON encoding.
#[derive(Debug)]
pub enum TranscodeError {
    /// JSON value does not fit the schema.
    Mismatch {
        /// What the schema called for.
        expected: &'static str,
        /// What the JSON contained.
        found: String,
    },
    /// Union branch key that names no branch of the schema.
    UnknownBranch(String),
    /// Enum symbol not declared by the schema.
    UnknownSymbol(String),
    /// Record field with no JSON value and no default.
    MissingField(String),
    /// A `Schema::Ref` that the name table cannot resolve.
    UnresolvedRef(String),
    /// A float that JSON cannot represent (NaN or infinity).
    NonFinite,
    /// A code point above U+00FF in a bytes/fixed string.
    ByteRange(char),
    /// Schema feature the transcoder does not handle.
    Unsupported(&'static str),
}

impl std::fmt::Display for TranscodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TranscodeError::Mismatch { expected, found } => {
                write!(f, "expected {expected}, found {found}")
            }
            TranscodeError::UnknownBranch(name) => write!(f, "unknown union branch: {name}"),
            TranscodeError::UnknownSymbol(name) => write!(f, "unknown enum symbol: {name}"),
            TranscodeError::MissingField(name) => write!(f, "missing record field: {name}"),
            TranscodeError::UnresolvedRef(name) => write!(f, "unresolved type reference: {name}"),
            TranscodeError::NonFinite => write!(f, "non-finite float has no JSON encoding"),
            TranscodeError::ByteRange(c) => write!(f, "code point {c:?} out of byte range"),
            TranscodeError::Unsupported(what) => write!(f, "unsupported schema: {what}"),
        }
    }
}

impl std::error::Error for TranscodeError {}

/// Decode a JSON-encoded value into an Avro value, guided by `schema`.
pub fn json_to_avro(
    json: &JsonValue,
    schema: &Schema,
    names: &HashMap<String, Schema>,
) -> Result<Value, TranscodeError> {
    match schema {
        Schema::Null => match json {
            JsonValue::Null => Ok(Value::Null),
            other => Err(mismatch("null", other)),
        },
        Schema::Boolean => match json {
            JsonValue::Bool(b) => Ok(Value::Boolean(*b)),
            other => Err(mismatch("boolean", other)),
        },
        Schema::Int | Schema::Date | Schema::TimeMillis => match json.as_i64() {
            Some(n) if i32::try_from(n).is_ok() => Ok(Value::Int(n as i32)),
            _ => Err(mismatch("int", json)),
        },
        Schema::Long
        | Schema::TimeMicros
        | Schema::TimestampMillis
        | Schema::TimestampMicros
        | Schema::LocalTimestampMillis
        | Schema::LocalTimestampMicros => match json.as_i64() {
            Some(n) => Ok(Value::Long(n)),
            None => Err(mismatch("long", json)),
        },
        Schema::Float => match json.as_f64() {
            Some(n) => Ok(Value::Float(n as f32)),
            None => Err(mismatch("float", json)),
        },
        Schema::Double => match json.as_f64() {
            Some(n) => Ok(Value::Double(n)),
            None => Err(mismatch("double", json)),
        },
        Schema::Bytes => Ok(Value::Bytes(json_bytes(json)?)),
        Schema::Fixed(fixed) => {
            let bytes = json_bytes(json)?;
            if bytes.len() != fixed.size {
                return Err(mismatch("fixed of declared size", json));
            }
            Ok(Value::Fixed(fixed.size, bytes))
        }
        Schema::String | Schema::Uuid => match json {
            JsonValue::String(s) => Ok(Value::String(s.clone())),
            other => Err(mismatch("string", other)),
        },
        Schema::Enum(inner) => match json {
            JsonValue::String(symbol) => {
                let position = inner
                    .symbols
                    .iter()
                    .position(|s| s == symbol)
                    .ok_or_else(|| TranscodeError::UnknownSymbol(symbol.clone()))?;
                Ok(Value::Enum(position as u32, symbol.clone()))
            }
            other => Err(mismatch("enum symbol", other)),
        },
        Schema::Array(inner) => match json {
            JsonValue::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(json_to_avro(item, &inner.items, names)?);
                }
                Ok(Value::Array(out))
            }
            other => Err(mismatch("array", other)),
        },
        Schema::Map(inner) => match json {
            JsonValue::Object(entries) => {
                let mut out = HashMap::with_capacity(entries.len());
                for (key, value) in entries {
                    out.insert(key.clone(), json_to_avro(value, &inner.types, names)?);
                }
                Ok(Value::Map(out))
            }
            other => Err(mismatch("map", other)),
        },
        Schema::Record(record) => match json {
            JsonValue::Object(entries) => {
                let mut out = Vec::with_capacity(record.fields.len());
                for field in &record.fields {
                    let value = match entries.get(&field.name) {
                        Some(value) => json_to_avro(value, &field.schema, names)?,
                        None => match &field.default {
                            Some(default) => default_to_avro(default, &field.schema, names)?,
                            None => return Err(TranscodeError::MissingField(field.name.clone())),
                        },
                    };
                    out.push((field.name.clone(), value));
                }
                Ok(Value::Record(out))
            }
            other => Err(mismatch("record", other)),
        },
        Schema::Union(union) => match json {
            JsonValue::Null => {
                let position = union
                    .variants()
                    .iter()
                    .position(|v| matches!(v, Schema::Null))
                    .ok_or_else(|| TranscodeError::UnknownBranch("null".into()))?;
                Ok(Value::Union(position as u32, Box::new(Value::Null)))
            }
            JsonValue::Object(entries) if entries.len() == 1 => {
                let (key, inner_json) = entries.iter().next().expect("len checked");
                let position = union
                    .variants()
                    .iter()
                    .position(|v| branch_name(v) == *key)
                    .ok_or_else(|| TranscodeError::UnknownBranch(key.clone()))?;
                let inner = json_to_avro(inner_json, &union.variants()[position], names)?;
                Ok(Value::Union(position as u32, Box::new(inner)))
            }
            other => Err(mismatch("union (null or single-key object)", other)),
        },
        Schema::Ref { name } => {
            let full = schema_full_name(name);
            let target = names
                .get(&full)
                .ok_or(TranscodeError::UnresolvedRef(full))?;
            json_to_avro(json, target, names)
        }
        _ => Err(TranscodeError::Unsupported("decimal/duration")),
    }
}

/// Encode an Avro value into its JSON encoding, guided by `schema`.
pub fn avro_to_json(
    value: &Value,
    schema: &Schema,
    names: &HashMap<String, Schema>,
) -> Result<JsonValue, TranscodeError> {
    if let Schema::Ref { name } = schema {
        let full = schema_full_name(name);
        let target = names
            .get(&full)
            .ok_or(TranscodeError::UnresolvedRef(full))?;
        return avro_to_json(value, target, names);
    }
    match value {
        Value::Null => Ok(JsonValue::Null),
        Value::Boolean(b) => Ok(JsonValue::Bool(*b)),
        Value::Int(n) | Value::Date(n) | Value::TimeMillis(n) => Ok(JsonValue::from(*n)),
        Value::Long(n)
        | Value::TimeMicros(n)
        | Value::TimestampMillis(n)
        | Value::TimestampMicros(n)
        | Value::LocalTimestampMillis(n)
        | Value::LocalTimestampMicros(n) => Ok(JsonValue::from(*n)),
        Value::Float(n) => Number::from_f64(f64::from(*n))
            .map(JsonValue::Number)
            .ok_or(TranscodeError::NonFinite),
        Value::Double(n) => Number::from_f64(*n)
            .map(JsonValue::Number)
            .ok_or(TranscodeError::NonFinite),
        Value::Bytes(bytes) | Value::Fixed(_, bytes) => Ok(JsonValue::String(bytes_json(bytes))),
        Value::String(s) => Ok(JsonValue::String(s.clone())),
        Value::Uuid(u) => Ok(JsonValue::String(u.to_string())),
        Value::Enum(_, symbol) => Ok(JsonValue::String(symbol.clone())),
        Value::Array(items) => {
            let item_schema = match schema {
                Schema::Array(inner) => &inner.items,
                _ => return Err(mismatch_value("array schema", schema)),
            };
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(avro_to_json(item, item_schema, names)?);
            }
            Ok(JsonValue::Array(out))
        }
        Value::Map(entries) => {
            let value_schema = match schema {
                Schema::Map(inner) => &inner.types,
                _ => return Err(mismatch_value("map schema", schema)),
            };
            let mut out = JsonMap::with_capacity(entries.len());
            for (key, value) in entries {
                out.insert(key.clone(), avro_to_json(value, value_schema, names)?);
            }
            Ok(JsonValue::Object(out))
        }
        Value::Record(fields) => {
            let record = match schema {
                Schema::Record(record) => record,
                _ => return Err(mismatch_value("record schema", schema)),
            };
            let mut out = JsonMap::with_capacity(fields.len());
            for (name, value) in fields {
                let field = record
                    .fields
                    .iter()
                    .find(|f| f.name == *name)
                    .ok_or_else(|| TranscodeError::MissingField(name.clone()))?;
                out.insert(name.clone(), avro_to_json(value, &field.schema, names)?);
            }
            Ok(JsonValue::Object(out))
        }
        Value::Union(position, inner) => {
            let union = match schema {
                Schema::Union(union) => union,
                _ => return Err(mismatch_value("union schema", schema)),
            };
            let branch = union
                .variants()
                .get(*position as usize)
                .ok_or_else(|| TranscodeError::UnknownBranch(position.to_string()))?;
            if matches!(**inner, Value::Null) {
                return Ok(JsonValue::Null);
            }
            let mut out = JsonMap::with_capacity(1);
            out.insert(branch_name(branch), avro_to_json(inner, branch, names)?);
            Ok(JsonValue::Object(out))
        }
        _ => Err(TranscodeError::Unsupported("decimal/duration")),
    }
}

/// The JSON union-branch key for a schema.
pub fn branch_name(schema: &Schema) -> String {
    match schema {
        Schema::Null => "null".into(),
        Schema::Boolean => "boolean".into(),
        Schema::Int | Schema::Date | Schema::TimeMillis => "int".into(),
        Schema::Long
        | Schema::TimeMicros
        | Schema::TimestampMillis
        | Schema::TimestampMicros
        | Schema::LocalTimestampMillis
        | Schema::LocalTimestampMicros => "long".into(),
        Schema::Float => "float".into(),
        Schema::Double => "double".into(),
        Schema::Bytes => "bytes".into(),
        Schema::String | Schema::Uuid => "string".into(),
        Schema::Array(_) => "array".into(),
        Schema::Map(_) => "map".into(),
        Schema::Record(record) => schema_full_name(&record.name),
        Schema::Enum(inner) => schema_full_name(&inner.name),
        Schema::Fixed(inner) => schema_full_name(&inner.name),
        Schema::Ref { name } => schema_full_name(name),
        _ => "unsupported".into(),
    }
}

/// Avro record-field defaults are written as the JSON of the union's first
/// branch, unwrapped; everything else decodes normally.
fn default_to_avro(
    default: &JsonValue,
    schema: &Schema,
    names: &HashMap<String, Schema>,
) -> Result<Value, TranscodeError> {
    match schema {
        Schema::Union(union) => {
            let first = union
                .variants()
                .first()
                .ok_or(TranscodeError::Unsupported("empty union"))?;
            Ok(Value::Union(0, Box::new(json_to_avro(default, first, names)?)))
        }
        _ => json_to_avro(default, schema, names),
    }
}

/// Decode a JSON-encoded byte string (code points U+0000..=U+00FF).
///
/// This is the JSON form of `bytes` values and of binary header values on
/// the proxy's JSON surface.
pub fn json_to_bytes(json: &JsonValue) -> Result<Vec<u8>, TranscodeError> {
    json_bytes(json)
}

/// Encode raw bytes as their JSON code-point string.
pub fn bytes_to_json(bytes: &[u8]) -> JsonValue {
    JsonValue::String(bytes_json(bytes))
}

fn json_bytes(json: &JsonValue) -> Result<Vec<u8>, TranscodeError> {
    match json {
        JsonValue::String(s) => {
            let mut out = Vec::with_capacity(s.len());
            for c in s.chars() {
                let code = c as u32;
                if code > 0xff {
                    return Err(TranscodeError::ByteRange(c));
                }
                out.push(code as u8);
            }
            Ok(out)
        }
        other => Err(mismatch("bytes string", other)),
    }
}

fn bytes_json(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

fn mismatch(expected: &'static str, found: &JsonValue) -> TranscodeError {
    TranscodeError::Mismatch {
        expected,
        found: found.to_string(),
    }
}

fn mismatch_value(expected: &'static str, schema: &Schema) -> TranscodeError {
    TranscodeError::Mismatch {
        expected,
        found: format!("{schema:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn names() -> HashMap<String, Schema> {
        HashMap::new()
    }

    #[test]
    fn primitives_round_trip() {
        let cases = [
            (r#""int""#, json!(42)),
            (r#""long""#, json!(-7)),
            (r#""string""#, json!("hello")),
            (r#""boolean""#, json!(true)),
            (r#""null""#, JsonValue::Null),
            (r#""double""#, json!(1.5)),
        ];
        for (schema_json, value) in cases {
            let schema = Schema::parse_str(schema_json).unwrap();
            let avro = json_to_avro(&value, &schema, &names()).unwrap();
            assert_eq!(avro_to_json(&avro, &schema, &names()).unwrap(), value);
        }
    }

    #[test]
    fn bytes_encode_as_code_points() {
        let schema = Schema::parse_str(r#""bytes""#).unwrap();
        let avro = json_to_avro(&json!("\u{0}\u{1}\u{ff}"), &schema, &names()).unwrap();
        assert_eq!(avro, Value::Bytes(vec![0, 1, 255]));
        assert_eq!(
            avro_to_json(&avro, &schema, &names()).unwrap(),
            json!("\u{0}\u{1}\u{ff}")
        );
        assert!(matches!(
            json_to_avro(&json!("\u{100}"), &schema, &names()),
            Err(TranscodeError::ByteRange(_))
        ));
    }

    #[test]
    fn unions_are_wrapped_by_branch_name() {
        let schema = Schema::parse_str(r#"["null", "string", "int"]"#).unwrap();

        let null = json_to_avro(&JsonValue::Null, &schema, &names()).unwrap();
        assert_eq!(null, Value::Union(0, Box::new(Value::Null)));
        assert_eq!(avro_to_json(&null, &schema, &names()).unwrap(), JsonValue::Null);

        let string = json_to_avro(&json!({"string": "bar"}), &schema, &names()).unwrap();
        assert_eq!(string, Value::Union(1, Box::new(Value::String("bar".into()))));
        assert_eq!(
            avro_to_json(&string, &schema, &names()).unwrap(),
            json!({"string": "bar"})
        );

        assert!(matches!(
            json_to_avro(&json!({"float": 1.0}), &schema, &names()),
            Err(TranscodeError::UnknownBranch(_))
        ));
    }

    #[test]
    fn records_use_field_defaults() {
        let schema = Schema::parse_str(
            r#"{
                "type": "record",
                "name": "Point",
                "fields": [
                    {"name": "x", "type": "int"},
                    {"name": "y", "type": "int", "default": 0},
                    {"name": "label", "type": ["null", "string"], "default": null}
                ]
            }"#,
        )
        .unwrap();
        let avro = json_to_avro(&json!({"x": 3}), &schema, &names()).unwrap();
        assert_eq!(
            avro,
            Value::Record(vec![
                ("x".into(), Value::Int(3)),
                ("y".into(), Value::Int(0)),
                ("label".into(), Value::Union(0, Box::new(Value::Null))),
            ])
        );
        assert!(matches!(
            json_to_avro(&json!({"y": 1}), &schema, &names()),
            Err(TranscodeError::MissingField(field)) if field == "x"
        ));
    }

    #[test]
    fn enums_round_trip_as_symbols() {
        let schema = Schema::parse_str(
            r#"{"type": "enum", "name": "Kind", "symbols": ["DEBIT", "CREDIT"]}"#,
        )
        .unwrap();
        let avro = json_to_avro(&json!("CREDIT"), &schema, &names()).unwrap();
        assert_eq!(avro, Value::Enum(1, "CREDIT".into()));
        assert_eq!(avro_to_json(&avro, &schema, &names()).unwrap(), json!("CREDIT"));
    }
}
