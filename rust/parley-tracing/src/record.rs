//! The trace record and its Avro wire form.

use std::sync::{Arc, Mutex};

use apache_avro::types::Value;
use apache_avro::Schema;
use once_cell::sync::Lazy;
use uuid::Uuid;

static TRACE_SCHEMA: Lazy<Schema> = Lazy::new(|| {
    Schema::parse_str(
        r#"{
            "type": "record",
            "name": "Trace",
            "fields": [
                {"name": "uuid", "type": {"type": "fixed", "name": "TraceUuid", "size": 16}},
                {"name": "calls", "type": {"type": "array", "items": {
                    "type": "record",
                    "name": "Call",
                    "fields": [
                        {"name": "state", "type": {"type": "enum", "name": "CallState",
                            "symbols": ["PENDING", "ERROR", "SUCCESS", "ONE_WAY"]}},
                        {"name": "name", "type": "string"},
                        {"name": "requestTime",
                            "type": {"type": "long", "logicalType": "timestamp-millis"}},
                        {"name": "responseTime",
                            "type": ["null", {"type": "long", "logicalType": "timestamp-millis"}]},
                        {"name": "downstreamCalls", "type": {"type": "array", "items": "Call"}}
                    ]
                }}}
            ]
        }"#,
    )
    .expect("builtin trace schema")
});

/// Error encoding or decoding a trace header.
#[derive(Debug)]
pub enum TraceCodecError {
    /// Avro-level failure.
    Avro(apache_avro::Error),
    /// The decoded value did not have the trace shape.
    Invalid(&'static str),
}

impl std::fmt::Display for TraceCodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TraceCodecError::Avro(e) => write!(f, "avro: {e}"),
            TraceCodecError::Invalid(what) => write!(f, "invalid trace {what}"),
        }
    }
}

impl std::error::Error for TraceCodecError {}

impl From<apache_avro::Error> for TraceCodecError {
    fn from(e: apache_avro::Error) -> Self {
        TraceCodecError::Avro(e)
    }
}

/// Lifecycle state of one traced call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Issued, response not yet seen.
    Pending,
    /// The call (or a descendant) reported an error.
    Error,
    /// Completed cleanly.
    Success,
    /// One-way: no response expected.
    OneWay,
}

impl CallState {
    fn index(self) -> u32 {
        match self {
            CallState::Pending => 0,
            CallState::Error => 1,
            CallState::Success => 2,
            CallState::OneWay => 3,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            CallState::Pending => "PENDING",
            CallState::Error => "ERROR",
            CallState::Success => "SUCCESS",
            CallState::OneWay => "ONE_WAY",
        }
    }

    fn from_symbol(symbol: &str) -> Result<Self, TraceCodecError> {
        match symbol {
            "PENDING" => Ok(CallState::Pending),
            "ERROR" => Ok(CallState::Error),
            "SUCCESS" => Ok(CallState::Success),
            "ONE_WAY" => Ok(CallState::OneWay),
            _ => Err(TraceCodecError::Invalid("state")),
        }
    }
}

/// One call in a trace tree.
///
/// `response_time` is `None` iff the call is still `Pending` (permitted for
/// `OneWay` before dispatch completes).
#[derive(Debug, Clone, PartialEq)]
pub struct CallRecord {
    /// Call outcome so far.
    pub state: CallState,
    /// Message name.
    pub name: String,
    /// Emission time, epoch milliseconds.
    pub request_time: i64,
    /// Completion time, epoch milliseconds.
    pub response_time: Option<i64>,
    /// Calls made downstream while servicing this one.
    pub downstream_calls: Vec<CallRecord>,
}

impl CallRecord {
    fn to_value(&self) -> Value {
        Value::Record(vec![
            (
                "state".into(),
                Value::Enum(self.state.index(), self.state.symbol().into()),
            ),
            ("name".into(), Value::String(self.name.clone())),
            (
                "requestTime".into(),
                Value::TimestampMillis(self.request_time),
            ),
            (
                "responseTime".into(),
                match self.response_time {
                    None => Value::Union(0, Box::new(Value::Null)),
                    Some(t) => Value::Union(1, Box::new(Value::TimestampMillis(t))),
                },
            ),
            (
                "downstreamCalls".into(),
                Value::Array(self.downstream_calls.iter().map(Self::to_value).collect()),
            ),
        ])
    }

    fn from_value(value: Value) -> Result<Self, TraceCodecError> {
        let Value::Record(fields) = value else {
            return Err(TraceCodecError::Invalid("call"));
        };
        let mut state = None;
        let mut name = None;
        let mut request_time = None;
        let mut response_time = None;
        let mut downstream_calls = Vec::new();
        for (field, value) in fields {
            match field.as_str() {
                "state" => match value {
                    Value::Enum(_, symbol) => state = Some(CallState::from_symbol(&symbol)?),
                    _ => return Err(TraceCodecError::Invalid("state")),
                },
                "name" => match value {
                    Value::String(s) => name = Some(s),
                    _ => return Err(TraceCodecError::Invalid("name")),
                },
                "requestTime" => request_time = Some(millis(value)?),
                "responseTime" => {
                    response_time = match value {
                        Value::Union(_, inner) => match *inner {
                            Value::Null => None,
                            other => Some(millis(other)?),
                        },
                        Value::Null => None,
                        other => Some(millis(other)?),
                    };
                }
                "downstreamCalls" => match value {
                    Value::Array(items) => {
                        downstream_calls = items
                            .into_iter()
                            .map(Self::from_value)
                            .collect::<Result<_, _>>()?;
                    }
                    _ => return Err(TraceCodecError::Invalid("downstream calls")),
                },
                _ => return Err(TraceCodecError::Invalid("call field")),
            }
        }
        Ok(CallRecord {
            state: state.ok_or(TraceCodecError::Invalid("call"))?,
            name: name.ok_or(TraceCodecError::Invalid("call"))?,
            request_time: request_time.ok_or(TraceCodecError::Invalid("call"))?,
            response_time,
            downstream_calls,
        })
    }
}

fn millis(value: Value) -> Result<i64, TraceCodecError> {
    match value {
        Value::TimestampMillis(t) | Value::Long(t) => Ok(t),
        _ => Err(TraceCodecError::Invalid("timestamp")),
    }
}

/// A decoded trace: uuid plus call tree.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceData {
    /// Correlates records across processes.
    pub uuid: Uuid,
    /// Top-level calls, in emission order.
    pub calls: Vec<CallRecord>,
}

/// A live trace: a clonable handle over shared [`TraceData`].
///
/// Clones observe the same tree, which is how a handler's downstream calls
/// land in the trace its server adopted from the request.
#[derive(Clone)]
pub struct Trace {
    shared: Arc<Mutex<TraceData>>,
}

impl Trace {
    /// Start a fresh trace with a random uuid.
    pub fn new() -> Self {
        Self::with_uuid(Uuid::new_v4())
    }

    /// Start a trace with a known uuid.
    pub fn with_uuid(uuid: Uuid) -> Self {
        Self {
            shared: Arc::new(Mutex::new(TraceData {
                uuid,
                calls: Vec::new(),
            })),
        }
    }

    /// Adopt decoded trace data.
    pub fn from_data(data: TraceData) -> Self {
        Self {
            shared: Arc::new(Mutex::new(data)),
        }
    }

    /// The trace's uuid.
    pub fn uuid(&self) -> Uuid {
        self.shared.lock().expect("trace poisoned").uuid
    }

    /// Snapshot the current tree.
    pub fn snapshot(&self) -> TraceData {
        self.shared.lock().expect("trace poisoned").clone()
    }

    /// Snapshot the top-level calls.
    pub fn calls(&self) -> Vec<CallRecord> {
        self.shared.lock().expect("trace poisoned").calls.clone()
    }

    /// Append a call, returning its index for later update.
    pub(crate) fn push_call(&self, call: CallRecord) -> usize {
        let mut data = self.shared.lock().expect("trace poisoned");
        data.calls.push(call);
        data.calls.len() - 1
    }

    /// Update the call at `index`.
    pub(crate) fn update_call(&self, index: usize, f: impl FnOnce(&mut CallRecord)) {
        let mut data = self.shared.lock().expect("trace poisoned");
        if let Some(call) = data.calls.get_mut(index) {
            f(call);
        }
    }

    /// Encode the full tree (the response-side wire form).
    pub fn encode(&self) -> Result<Vec<u8>, TraceCodecError> {
        let data = self.snapshot();
        encode_data(&data)
    }

    /// Encode only the uuid with an empty call list (the request-side wire
    /// form).
    pub fn encode_outbound(&self) -> Result<Vec<u8>, TraceCodecError> {
        encode_data(&TraceData {
            uuid: self.uuid(),
            calls: Vec::new(),
        })
    }

    /// Decode a trace header.
    pub fn decode(bytes: &[u8]) -> Result<TraceData, TraceCodecError> {
        let value =
            apache_avro::from_avro_datum(&TRACE_SCHEMA, &mut std::io::Cursor::new(bytes), None)?;
        let Value::Record(fields) = value else {
            return Err(TraceCodecError::Invalid("record"));
        };
        let mut uuid = None;
        let mut calls = Vec::new();
        for (field, value) in fields {
            match field.as_str() {
                "uuid" => match value {
                    Value::Fixed(16, bytes) => {
                        let raw: [u8; 16] = bytes
                            .try_into()
                            .map_err(|_| TraceCodecError::Invalid("uuid"))?;
                        uuid = Some(Uuid::from_bytes(raw));
                    }
                    _ => return Err(TraceCodecError::Invalid("uuid")),
                },
                "calls" => match value {
                    Value::Array(items) => {
                        calls = items
                            .into_iter()
                            .map(CallRecord::from_value)
                            .collect::<Result<_, _>>()?;
                    }
                    _ => return Err(TraceCodecError::Invalid("calls")),
                },
                _ => return Err(TraceCodecError::Invalid("field")),
            }
        }
        Ok(TraceData {
            uuid: uuid.ok_or(TraceCodecError::Invalid("record"))?,
            calls,
        })
    }
}

impl Default for Trace {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Trace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let data = self.shared.lock().expect("trace poisoned");
        f.debug_struct("Trace")
            .field("uuid", &data.uuid)
            .field("calls", &data.calls.len())
            .finish()
    }
}

fn encode_data(data: &TraceData) -> Result<Vec<u8>, TraceCodecError> {
    let value = Value::Record(vec![
        (
            "uuid".into(),
            Value::Fixed(16, data.uuid.as_bytes().to_vec()),
        ),
        (
            "calls".into(),
            Value::Array(data.calls.iter().map(CallRecord::to_value).collect()),
        ),
    ]);
    Ok(apache_avro::to_avro_datum(&TRACE_SCHEMA, value)?)
}

/// Current time in epoch milliseconds.
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
