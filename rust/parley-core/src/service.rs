//! Compiling protocol documents.
//!
//! A protocol document is the JSON `.avpr` shape: `protocol`, optional
//! `namespace`, a `types` array of named declarations, and a `messages`
//! map. `apache-avro` parses individual schemas but knows nothing about
//! protocols, so the compiler here flattens each component (request record,
//! response, error union, named type) into a self-contained schema: the
//! first reference to a named type is replaced by its full declaration,
//! later references stay by (full) name and resolve within the component.
//! Recursive types therefore work, and the resulting schemas can be handed
//! straight to the Avro datum coder.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use apache_avro::Schema;
use md5::{Digest, Md5};
use parley_wire::ProtocolHash;
use serde_json::{json, Map as JsonMap, Value as JsonValue};

use crate::{Message, SchemaError};

const PRIMITIVES: &[&str] = &[
    "null", "boolean", "int", "long", "float", "double", "bytes", "string",
];

/// A compiled Avro protocol.
pub struct Service {
    name: String,
    document: Arc<str>,
    hash: ProtocolHash,
    messages: Vec<Arc<Message>>,
    message_index: HashMap<String, usize>,
    types: HashMap<String, Schema>,
    names: HashMap<String, Schema>,
}

impl Service {
    /// Compile a protocol document.
    pub fn compile(document: &str) -> Result<Service, SchemaError> {
        let root: JsonValue = serde_json::from_str(document)?;
        let root = root
            .as_object()
            .ok_or_else(|| SchemaError::Invalid("document is not an object".into()))?;

        let protocol = root
            .get("protocol")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| SchemaError::Invalid("missing \"protocol\" attribute".into()))?;
        let namespace = root.get("namespace").and_then(JsonValue::as_str);
        let name = match namespace {
            Some(ns) if !protocol.contains('.') => format!("{ns}.{protocol}"),
            _ => protocol.to_owned(),
        };

        let mut declarations = Declarations::new(namespace);
        if let Some(types) = root.get("types") {
            let types = types
                .as_array()
                .ok_or_else(|| SchemaError::Invalid("\"types\" is not an array".into()))?;
            for declaration in types {
                declarations.register(declaration)?;
            }
        }

        // Each named type also compiles standalone, for `type_schema` lookups.
        let mut types = HashMap::new();
        let mut names = HashMap::new();
        for full in declarations.order.clone() {
            let mut defined = HashSet::new();
            let inlined = declarations.inline_named(&full, &mut defined)?;
            let schema = parse_fragment(&inlined)?;
            collect_names(&schema, &mut names);
            types.insert(full, schema);
        }

        let mut messages = Vec::new();
        let mut message_index = HashMap::new();
        if let Some(raw_messages) = root.get("messages") {
            let raw_messages = raw_messages
                .as_object()
                .ok_or_else(|| SchemaError::Invalid("\"messages\" is not an object".into()))?;
            for (msg_name, decl) in raw_messages {
                let message = compile_message(msg_name, decl, namespace, &declarations)?;
                collect_names(message.request(), &mut names);
                collect_names(message.response(), &mut names);
                collect_names(message.errors(), &mut names);
                message_index.insert(msg_name.clone(), messages.len());
                messages.push(Arc::new(message));
            }
        }

        let mut hasher = Md5::new();
        hasher.update(document.as_bytes());
        let hash: ProtocolHash = hasher.finalize().into();

        Ok(Service {
            name,
            document: document.into(),
            hash,
            messages,
            message_index,
            types,
            names,
        })
    }

    /// Canonical (namespace-qualified) protocol name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The raw protocol document this service was compiled from.
    pub fn document(&self) -> &str {
        &self.document
    }

    /// MD5 fingerprint of the protocol document.
    pub fn hash(&self) -> ProtocolHash {
        self.hash
    }

    /// Look up a message by name.
    pub fn message(&self, name: &str) -> Option<&Arc<Message>> {
        self.message_index.get(name).map(|&i| &self.messages[i])
    }

    /// All messages, in declaration order.
    pub fn messages(&self) -> &[Arc<Message>] {
        &self.messages
    }

    /// Look up a named type, by full or short name.
    pub fn type_schema(&self, name: &str) -> Option<&Schema> {
        if let Some(schema) = self.types.get(name) {
            return Some(schema);
        }
        self.types
            .iter()
            .find(|(full, _)| full.rsplit('.').next() == Some(name))
            .map(|(_, schema)| schema)
    }

    /// Every named schema reachable from this service, keyed by full name.
    ///
    /// Used by the transcoder to chase `Schema::Ref` nodes in recursive
    /// types.
    pub fn names(&self) -> &HashMap<String, Schema> {
        &self.names
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("messages", &self.messages.len())
            .field("types", &self.types.len())
            .finish()
    }
}

fn compile_message(
    name: &str,
    decl: &JsonValue,
    namespace: Option<&str>,
    declarations: &Declarations<'_>,
) -> Result<Message, SchemaError> {
    let decl = decl
        .as_object()
        .ok_or_else(|| SchemaError::Invalid(format!("message {name} is not an object")))?;

    let one_way = decl.get("one-way").and_then(JsonValue::as_bool).unwrap_or(false);
    let doc = decl
        .get("doc")
        .and_then(JsonValue::as_str)
        .map(str::to_owned);

    // Request: the parameter list becomes a synthesized record.
    let params = decl
        .get("request")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| SchemaError::Invalid(format!("message {name} has no request list")))?;
    let mut defined = HashSet::new();
    let mut fields = Vec::with_capacity(params.len());
    for param in params {
        let param = param
            .as_object()
            .ok_or_else(|| SchemaError::Invalid(format!("message {name}: bad parameter")))?;
        let field_name = param
            .get("name")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| SchemaError::Invalid(format!("message {name}: unnamed parameter")))?;
        let field_type = param
            .get("type")
            .ok_or_else(|| SchemaError::Invalid(format!("message {name}: untyped parameter")))?;
        let mut field = JsonMap::new();
        field.insert("name".into(), json!(field_name));
        field.insert("type".into(), declarations.inline(field_type, &mut defined)?);
        if let Some(default) = param.get("default") {
            field.insert("default".into(), default.clone());
        }
        fields.push(JsonValue::Object(field));
    }
    let request_name = match namespace {
        Some(ns) => format!("{ns}.{name}Request"),
        None => format!("{name}Request"),
    };
    let request = parse_fragment(&json!({
        "type": "record",
        "name": request_name,
        "fields": fields,
    }))?;

    let response_decl = decl.get("response").cloned().unwrap_or(json!("null"));
    if one_way && response_decl != json!("null") {
        return Err(SchemaError::Invalid(format!(
            "one-way message {name} declares a response"
        )));
    }
    let mut defined = HashSet::new();
    let response = parse_fragment(&declarations.inline(&response_decl, &mut defined)?)?;

    // Errors are a union with "string" as the implicit first branch.
    let mut defined = HashSet::new();
    let mut error_branches = vec![json!("string")];
    if let Some(errors) = decl.get("errors") {
        if one_way {
            return Err(SchemaError::Invalid(format!(
                "one-way message {name} declares errors"
            )));
        }
        let errors = errors
            .as_array()
            .ok_or_else(|| SchemaError::Invalid(format!("message {name}: errors not a list")))?;
        for error in errors {
            error_branches.push(declarations.inline(error, &mut defined)?);
        }
    }
    let errors = parse_fragment(&JsonValue::Array(error_branches))?;

    Ok(Message::new(name, one_way, doc, request, response, errors))
}

fn parse_fragment(fragment: &JsonValue) -> Result<Schema, SchemaError> {
    Ok(Schema::parse_str(&serde_json::to_string(fragment)?)?)
}

/// Full (namespace-qualified) name of a parsed schema name.
pub(crate) fn schema_full_name(name: &apache_avro::schema::Name) -> String {
    match &name.namespace {
        Some(namespace) => format!("{namespace}.{}", name.name),
        None => name.name.clone(),
    }
}

/// Record every named schema reachable from `schema` under its full name.
fn collect_names(schema: &Schema, names: &mut HashMap<String, Schema>) {
    match schema {
        Schema::Record(record) => {
            names.insert(schema_full_name(&record.name), schema.clone());
            for field in &record.fields {
                collect_names(&field.schema, names);
            }
        }
        Schema::Enum(inner) => {
            names.insert(schema_full_name(&inner.name), schema.clone());
        }
        Schema::Fixed(inner) => {
            names.insert(schema_full_name(&inner.name), schema.clone());
        }
        Schema::Array(inner) => collect_names(&inner.items, names),
        Schema::Map(inner) => collect_names(&inner.types, names),
        Schema::Union(union) => {
            for variant in union.variants() {
                collect_names(variant, names);
            }
        }
        _ => {}
    }
}

/// The protocol's named type declarations, pre-qualification.
struct Declarations<'a> {
    namespace: Option<&'a str>,
    by_name: HashMap<String, JsonValue>,
    order: Vec<String>,
}

impl<'a> Declarations<'a> {
    fn new(namespace: Option<&'a str>) -> Self {
        Self {
            namespace,
            by_name: HashMap::new(),
            order: Vec::new(),
        }
    }

    fn register(&mut self, declaration: &JsonValue) -> Result<(), SchemaError> {
        let obj = declaration
            .as_object()
            .ok_or_else(|| SchemaError::Invalid("type declaration is not an object".into()))?;
        let name = obj
            .get("name")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| SchemaError::Invalid("unnamed type declaration".into()))?;
        let full = self.qualify(name, obj.get("namespace").and_then(JsonValue::as_str));
        if self.by_name.contains_key(&full) {
            return Err(SchemaError::Invalid(format!("duplicate type: {full}")));
        }
        self.order.push(full.clone());
        self.by_name.insert(full, declaration.clone());
        Ok(())
    }

    fn qualify(&self, name: &str, declared_namespace: Option<&str>) -> String {
        if name.contains('.') {
            return name.to_owned();
        }
        match declared_namespace.or(self.namespace) {
            Some(ns) => format!("{ns}.{name}"),
            None => name.to_owned(),
        }
    }

    fn resolve(&self, reference: &str) -> Option<String> {
        let full = self.qualify(reference, None);
        if self.by_name.contains_key(&full) {
            return Some(full);
        }
        if self.by_name.contains_key(reference) {
            return Some(reference.to_owned());
        }
        None
    }

    fn inline_named(&self, full: &str, defined: &mut HashSet<String>) -> Result<JsonValue, SchemaError> {
        let declaration = self
            .by_name
            .get(full)
            .ok_or_else(|| SchemaError::UnknownType(full.to_owned()))?;
        defined.insert(full.to_owned());
        self.inline_declaration(full, declaration, defined)
    }

    /// Produce a self-contained fragment: named references are replaced by
    /// their declaration on first sight, by full name afterwards.
    fn inline(&self, fragment: &JsonValue, defined: &mut HashSet<String>) -> Result<JsonValue, SchemaError> {
        match fragment {
            JsonValue::String(reference) => {
                if PRIMITIVES.contains(&reference.as_str()) {
                    return Ok(fragment.clone());
                }
                let full = self
                    .resolve(reference)
                    .ok_or_else(|| SchemaError::UnknownType(reference.clone()))?;
                if defined.contains(&full) {
                    return Ok(JsonValue::String(full));
                }
                self.inline_named(&full, defined)
            }
            JsonValue::Array(branches) => {
                let mut out = Vec::with_capacity(branches.len());
                for branch in branches {
                    out.push(self.inline(branch, defined)?);
                }
                Ok(JsonValue::Array(out))
            }
            JsonValue::Object(obj) => {
                let kind = obj
                    .get("type")
                    .and_then(JsonValue::as_str)
                    .ok_or_else(|| SchemaError::Invalid("schema object without type".into()))?;
                match kind {
                    "record" | "error" | "enum" | "fixed" => {
                        let name = obj
                            .get("name")
                            .and_then(JsonValue::as_str)
                            .ok_or_else(|| SchemaError::Invalid("unnamed type".into()))?;
                        let full =
                            self.qualify(name, obj.get("namespace").and_then(JsonValue::as_str));
                        defined.insert(full.clone());
                        self.inline_declaration(&full, fragment, defined)
                    }
                    "array" => {
                        let items = obj
                            .get("items")
                            .ok_or_else(|| SchemaError::Invalid("array without items".into()))?;
                        Ok(json!({"type": "array", "items": self.inline(items, defined)?}))
                    }
                    "map" => {
                        let values = obj
                            .get("values")
                            .ok_or_else(|| SchemaError::Invalid("map without values".into()))?;
                        Ok(json!({"type": "map", "values": self.inline(values, defined)?}))
                    }
                    // Primitive carrying attributes (logical types and such).
                    _ => Ok(fragment.clone()),
                }
            }
            _ => Err(SchemaError::Invalid("unrecognized schema fragment".into())),
        }
    }

    fn inline_declaration(
        &self,
        full: &str,
        declaration: &JsonValue,
        defined: &mut HashSet<String>,
    ) -> Result<JsonValue, SchemaError> {
        let obj = declaration
            .as_object()
            .ok_or_else(|| SchemaError::Invalid("type declaration is not an object".into()))?;
        let kind = obj
            .get("type")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| SchemaError::Invalid("type declaration without type".into()))?;
        let mut out = JsonMap::new();
        // Full name in the "name" attribute, no separate namespace; every
        // reference to this declaration uses the same spelling.
        out.insert("name".into(), json!(full));
        match kind {
            // Protocol error declarations are records on the wire.
            "record" | "error" => {
                out.insert("type".into(), json!("record"));
                let fields = obj
                    .get("fields")
                    .and_then(JsonValue::as_array)
                    .ok_or_else(|| SchemaError::Invalid(format!("record {full} has no fields")))?;
                let mut out_fields = Vec::with_capacity(fields.len());
                for field in fields {
                    let field = field.as_object().ok_or_else(|| {
                        SchemaError::Invalid(format!("record {full}: bad field"))
                    })?;
                    let field_name = field.get("name").and_then(JsonValue::as_str).ok_or_else(
                        || SchemaError::Invalid(format!("record {full}: unnamed field")),
                    )?;
                    let field_type = field.get("type").ok_or_else(|| {
                        SchemaError::Invalid(format!("record {full}: untyped field"))
                    })?;
                    let mut out_field = JsonMap::new();
                    out_field.insert("name".into(), json!(field_name));
                    out_field.insert("type".into(), self.inline(field_type, defined)?);
                    if let Some(default) = field.get("default") {
                        out_field.insert("default".into(), default.clone());
                    }
                    out_fields.push(JsonValue::Object(out_field));
                }
                out.insert("fields".into(), JsonValue::Array(out_fields));
            }
            "enum" => {
                out.insert("type".into(), json!("enum"));
                out.insert(
                    "symbols".into(),
                    obj.get("symbols")
                        .cloned()
                        .ok_or_else(|| SchemaError::Invalid(format!("enum {full} has no symbols")))?,
                );
            }
            "fixed" => {
                out.insert("type".into(), json!("fixed"));
                out.insert(
                    "size".into(),
                    obj.get("size")
                        .cloned()
                        .ok_or_else(|| SchemaError::Invalid(format!("fixed {full} has no size")))?,
                );
            }
            other => {
                return Err(SchemaError::Invalid(format!(
                    "declaration {full} has unexpected type {other}"
                )))
            }
        }
        Ok(JsonValue::Object(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apache_avro::types::Value;

    const MATH: &str = r#"{
        "protocol": "Math",
        "messages": {
            "neg": {
                "request": [{"name": "n", "type": "int"}],
                "response": "int"
            },
            "ping": {
                "request": [],
                "response": "null",
                "one-way": true
            }
        }
    }"#;

    #[test]
    fn compiles_a_plain_protocol() {
        let service = Service::compile(MATH).unwrap();
        assert_eq!(service.name(), "Math");
        assert_eq!(service.messages().len(), 2);

        let neg = service.message("neg").unwrap();
        assert!(!neg.one_way());
        assert!(service.message("ping").unwrap().one_way());
        assert!(service.message("plus").is_none());
    }

    #[test]
    fn request_datum_round_trips() {
        let service = Service::compile(MATH).unwrap();
        let neg = service.message("neg").unwrap();

        let request = Value::Record(vec![("n".into(), Value::Int(10))]);
        let bytes = neg.encode_request(request.clone()).unwrap();
        let decoded = neg
            .decode_request(&mut std::io::Cursor::new(&bytes), None)
            .unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn named_types_inline_across_messages() {
        let doc = r#"{
            "protocol": "Ledger",
            "namespace": "org.example",
            "types": [
                {"type": "enum", "name": "Kind", "symbols": ["DEBIT", "CREDIT"]},
                {"type": "record", "name": "Entry", "fields": [
                    {"name": "kind", "type": "Kind"},
                    {"name": "amount", "type": "long"},
                    {"name": "related", "type": {"type": "array", "items": "Entry"}}
                ]}
            ],
            "messages": {
                "append": {
                    "request": [{"name": "entry", "type": "Entry"}],
                    "response": "Entry",
                    "errors": [{"type": "error", "name": "Rejected", "fields": [
                        {"name": "reason", "type": "string"}
                    ]}]
                }
            }
        }"#;
        let service = Service::compile(doc).unwrap();
        assert!(service.type_schema("org.example.Entry").is_some());
        assert!(service.type_schema("Kind").is_some());

        let append = service.message("append").unwrap();
        let entry = Value::Record(vec![
            ("kind".into(), Value::Enum(1, "CREDIT".into())),
            ("amount".into(), Value::Long(42)),
            ("related".into(), Value::Array(vec![])),
        ]);
        let request = Value::Record(vec![("entry".into(), entry.clone())]);
        let bytes = append.encode_request(request).unwrap();
        let decoded = append
            .decode_request(&mut std::io::Cursor::new(&bytes), None)
            .unwrap();
        let Value::Record(fields) = decoded else {
            panic!("not a record")
        };
        assert_eq!(fields[0].1, entry);
    }

    #[test]
    fn one_way_with_response_is_rejected() {
        let doc = r#"{
            "protocol": "Bad",
            "messages": {
                "fire": {"request": [], "response": "int", "one-way": true}
            }
        }"#;
        assert!(matches!(
            Service::compile(doc),
            Err(SchemaError::Invalid(_))
        ));
    }

    #[test]
    fn unknown_reference_is_rejected() {
        let doc = r#"{
            "protocol": "Bad",
            "messages": {
                "get": {"request": [{"name": "k", "type": "Missing"}], "response": "null"}
            }
        }"#;
        assert!(matches!(
            Service::compile(doc),
            Err(SchemaError::UnknownType(name)) if name == "Missing"
        ));
    }

    #[test]
    fn hashes_differ_between_documents() {
        let a = Service::compile(MATH).unwrap();
        let b = Service::compile(&MATH.replace("neg", "negate")).unwrap();
        assert_ne!(a.hash(), b.hash());
        assert_eq!(a.hash(), Service::compile(MATH).unwrap().hash());
    }
}
