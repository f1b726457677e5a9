//! Telemetry events
//!
//! An [`Event`] is what a probe produces for every decoded kernel record:
//! one finished span of an instrumented function.

use probe_common::{
    constants::{SPAN_ID_SIZE, TRACE_ID_SIZE},
    RawSpanContext,
};
use serde::{Serialize, Serializer};
use std::fmt;

/// Role of the span in the trace
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SpanKind {
    #[default]
    Internal,
    Server,
    Client,
    Producer,
    Consumer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TraceId([u8; TRACE_ID_SIZE]);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanId([u8; SPAN_ID_SIZE]);

macro_rules! hex_id {
    ($name:ident, $size:expr) => {
        impl $name {
            pub fn from_bytes(bytes: [u8; $size]) -> Self {
                Self(bytes)
            }

            pub fn to_bytes(self) -> [u8; $size] {
                self.0
            }

            pub fn is_valid(&self) -> bool {
                self.0.iter().any(|b| *b != 0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }
    };
}

hex_id!(TraceId, TRACE_ID_SIZE);
hex_id!(SpanId, SPAN_ID_SIZE);

/// Identity of a span
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanContext {
    pub trace_id: TraceId,
    pub span_id: SpanId,
}

impl SpanContext {
    pub fn new(trace_id: TraceId, span_id: SpanId) -> Self {
        Self { trace_id, span_id }
    }

    /// Span context written by a kernel program, `None` if it was never set
    pub fn from_raw(raw: &RawSpanContext) -> Option<Self> {
        if raw.is_empty() {
            return None;
        }
        Some(Self::new(
            TraceId::from_bytes(raw.trace_id),
            SpanId::from_bytes(raw.span_id),
        ))
    }
}

/// Attribute value
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    I64(i64),
    F64(f64),
    String(String),
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::I64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::F64(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

/// One span attribute
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct KeyValue {
    pub key: String,
    pub value: Value,
}

impl KeyValue {
    pub fn new<K: Into<String>, V: Into<Value>>(key: K, value: V) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A telemetry event that happened within an instrumented package
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Event {
    /// Instrumented package
    pub library: String,
    /// Operation name
    pub name: String,
    pub attributes: Vec<KeyValue>,
    pub kind: SpanKind,
    /// Start, in nanoseconds of monotonic time since boot
    pub start_time: i64,
    /// End, in nanoseconds of monotonic time since boot
    pub end_time: i64,
    pub span_context: Option<SpanContext>,
    pub parent_span_context: Option<SpanContext>,
}

impl Event {
    /// Value of attribute `key`, if set
    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes
            .iter()
            .find(|kv| kv.key == key)
            .map(|kv| &kv.value)
    }

    pub fn duration_ns(&self) -> i64 {
        self.end_time.saturating_sub(self.start_time)
    }
}
