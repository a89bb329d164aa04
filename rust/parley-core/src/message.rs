//! Messages: the per-call coding surface of a compiled protocol.

use std::io::Read;

use apache_avro::types::Value;
use apache_avro::Schema;

/// One message of a protocol: request, response, and error schemas plus the
/// one-way flag.
///
/// Requests are records synthesized from the message's parameter list.
/// Errors are a union whose first branch is always `"string"`, so every
/// message can carry an undeclared (system) error as plain text.
pub struct Message {
    name: String,
    one_way: bool,
    doc: Option<String>,
    request: Schema,
    response: Schema,
    errors: Schema,
}

impl Message {
    pub(crate) fn new(
        name: &str,
        one_way: bool,
        doc: Option<String>,
        request: Schema,
        response: Schema,
        errors: Schema,
    ) -> Self {
        Self {
            name: name.to_owned(),
            one_way,
            doc,
            request,
            response,
            errors,
        }
    }

    /// Message name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the message expects no response.
    pub fn one_way(&self) -> bool {
        self.one_way
    }

    /// Documentation attached to the declaration, if any.
    pub fn doc(&self) -> Option<&str> {
        self.doc.as_deref()
    }

    /// The synthesized request record schema.
    pub fn request(&self) -> &Schema {
        &self.request
    }

    /// The response schema.
    pub fn response(&self) -> &Schema {
        &self.response
    }

    /// The error union schema (branch 0 is `"string"`).
    pub fn errors(&self) -> &Schema {
        &self.errors
    }

    /// Encode a request value as one Avro datum.
    pub fn encode_request(&self, value: Value) -> Result<Vec<u8>, apache_avro::Error> {
        apache_avro::to_avro_datum(&self.request, value)
    }

    /// Decode a request datum.
    ///
    /// `writer` is the peer's request schema when protocol hashes differ;
    /// the local schema then acts as the reader for Avro resolution.
    pub fn decode_request<R: Read>(
        &self,
        reader: &mut R,
        writer: Option<&Schema>,
    ) -> Result<Value, apache_avro::Error> {
        match writer {
            Some(writer) => apache_avro::from_avro_datum(writer, reader, Some(&self.request)),
            None => apache_avro::from_avro_datum(&self.request, reader, None),
        }
    }

    /// Encode a response value as one Avro datum.
    pub fn encode_response(&self, value: Value) -> Result<Vec<u8>, apache_avro::Error> {
        apache_avro::to_avro_datum(&self.response, value)
    }

    /// Decode a response datum, resolving from `writer` when given.
    pub fn decode_response<R: Read>(
        &self,
        reader: &mut R,
        writer: Option<&Schema>,
    ) -> Result<Value, apache_avro::Error> {
        match writer {
            Some(writer) => apache_avro::from_avro_datum(writer, reader, Some(&self.response)),
            None => apache_avro::from_avro_datum(&self.response, reader, None),
        }
    }

    /// Encode an error union value as one Avro datum.
    pub fn encode_error(&self, value: Value) -> Result<Vec<u8>, apache_avro::Error> {
        apache_avro::to_avro_datum(&self.errors, value)
    }

    /// Decode an error union datum, resolving from `writer` when given.
    pub fn decode_error<R: Read>(
        &self,
        reader: &mut R,
        writer: Option<&Schema>,
    ) -> Result<Value, apache_avro::Error> {
        match writer {
            Some(writer) => apache_avro::from_avro_datum(writer, reader, Some(&self.errors)),
            None => apache_avro::from_avro_datum(&self.errors, reader, None),
        }
    }

    /// Build the string branch of the error union.
    ///
    /// This is how undeclared (system) errors travel: branch 0 of every
    /// error union is `"string"`.
    pub fn string_error(&self, message: impl Into<String>) -> Value {
        Value::Union(0, Box::new(Value::String(message.into())))
    }

    /// Whether an error union value uses a declared (non-string) branch.
    pub fn is_declared_error(&self, value: &Value) -> bool {
        matches!(value, Value::Union(index, _) if *index != 0)
    }

    /// Validate a value against the request schema without coercions.
    pub fn validate_request(&self, value: &Value) -> bool {
        value.validate(&self.request)
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("name", &self.name)
            .field("one_way", &self.one_way)
            .finish()
    }
}

/// Pull one field out of a decoded request record by name.
///
/// Handlers that want the decomposed-argument style read their parameters
/// with this instead of pattern matching the whole record.
pub fn request_field<'a>(request: &'a Value, name: &str) -> Option<&'a Value> {
    match request {
        Value::Record(fields) => fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Service;

    #[test]
    fn string_errors_use_branch_zero() {
        let service = Service::compile(
            r#"{
                "protocol": "Echo",
                "messages": {
                    "echo": {
                        "request": [{"name": "s", "type": "string"}],
                        "response": "string"
                    }
                }
            }"#,
        )
        .unwrap();
        let echo = service.message("echo").unwrap();

        let error = echo.string_error("boom");
        assert!(!echo.is_declared_error(&error));
        let bytes = echo.encode_error(error.clone()).unwrap();
        let decoded = echo
            .decode_error(&mut std::io::Cursor::new(&bytes), None)
            .unwrap();
        assert_eq!(decoded, error);
    }

    #[test]
    fn request_field_reads_parameters() {
        let request = Value::Record(vec![
            ("n".into(), Value::Int(7)),
            ("label".into(), Value::String("x".into())),
        ]);
        assert_eq!(request_field(&request, "n"), Some(&Value::Int(7)));
        assert_eq!(request_field(&request, "missing"), None);
    }
}
