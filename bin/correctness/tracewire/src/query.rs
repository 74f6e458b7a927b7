//! Query REST API payloads.
//!
//! The query API wraps every response in the same envelope (`data`, `total`, `limit`, `offset`, `errors`), and uses
//! the `traceID`/`spanID`/`processID` casing for identifiers.

use std::collections::BTreeMap;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use snafu::ResultExt as _;

use crate::{DecodeError, Malformed, Reported, WireFormat};

/// Response envelope shared by all query API endpoints.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct Envelope<T> {
    /// Response payload.
    #[serde(default = "Vec::new", deserialize_with = "null_as_default")]
    pub data: Vec<T>,

    /// Total number of results, when the endpoint reports it.
    #[serde(default)]
    pub total: u64,

    /// Result limit applied by the endpoint.
    #[serde(default)]
    pub limit: u64,

    /// Result offset applied by the endpoint.
    #[serde(default)]
    pub offset: u64,

    /// Errors reported by the endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<StructuredError>>,
}

impl<T> Envelope<T> {
    /// Creates an envelope around the given payload, with no errors.
    pub fn from_data(data: Vec<T>) -> Self {
        let total = data.len() as u64;
        Self {
            data,
            total,
            limit: 0,
            offset: 0,
            errors: None,
        }
    }
}

/// An error reported inside a response envelope.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct StructuredError {
    /// HTTP-like status code.
    #[serde(default)]
    pub code: i32,

    /// Error message.
    #[serde(default)]
    pub msg: String,

    /// Trace the error relates to, if any.
    #[serde(rename = "traceID", default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

/// A trace, as returned by the trace search endpoint.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Trace {
    /// Trace identifier.
    #[serde(rename = "traceID")]
    pub trace_id: String,

    /// Spans belonging to the trace, in the order reported.
    #[serde(default, deserialize_with = "null_as_default")]
    pub spans: Vec<Span>,

    /// Processes referenced by the spans, keyed by process ID.
    #[serde(default, deserialize_with = "null_as_default")]
    pub processes: BTreeMap<String, Process>,

    /// Warnings attached to the trace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warnings: Option<Vec<String>>,
}

impl Trace {
    /// Returns `true` if any span in the trace carries a tag with the given key and string value.
    pub fn has_tag(&self, key: &str, value: &str) -> bool {
        self.spans.iter().any(|span| span.tag_value(key) == Some(value))
    }

    /// Returns the distinct service names referenced by the trace's processes.
    pub fn service_names(&self) -> Vec<&str> {
        let mut names = self
            .processes
            .values()
            .map(|p| p.service_name.as_str())
            .collect::<Vec<_>>();
        names.sort_unstable();
        names.dedup();
        names
    }
}

/// A single span.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Span {
    /// Trace identifier.
    #[serde(rename = "traceID")]
    pub trace_id: String,

    /// Span identifier.
    #[serde(rename = "spanID")]
    pub span_id: String,

    /// Operation name.
    #[serde(rename = "operationName", default)]
    pub operation_name: String,

    /// References to other spans.
    #[serde(default, deserialize_with = "null_as_default")]
    pub references: Vec<Reference>,

    /// Start time, in microseconds since the Unix epoch.
    #[serde(rename = "startTime", default)]
    pub start_time: u64,

    /// Duration, in microseconds.
    #[serde(default)]
    pub duration: u64,

    /// Span tags.
    #[serde(default, deserialize_with = "null_as_default")]
    pub tags: Vec<KeyValue>,

    /// Span logs.
    #[serde(default, deserialize_with = "null_as_default")]
    pub logs: Vec<Log>,

    /// Identifier of the process that emitted the span.
    #[serde(rename = "processID", default, skip_serializing_if = "String::is_empty")]
    pub process_id: String,

    /// Warnings attached to the span.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warnings: Option<Vec<String>>,
}

impl Span {
    /// Returns the string value of the tag with the given key, if present and string-typed.
    pub fn tag_value(&self, key: &str) -> Option<&str> {
        self.tags.iter().find(|kv| kv.key == key).and_then(|kv| kv.value.as_str())
    }
}

/// A reference from one span to another.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Reference {
    /// Reference type (`CHILD_OF` or `FOLLOWS_FROM`).
    #[serde(rename = "refType")]
    pub ref_type: String,

    /// Referenced trace.
    #[serde(rename = "traceID")]
    pub trace_id: String,

    /// Referenced span.
    #[serde(rename = "spanID")]
    pub span_id: String,
}

/// A typed key/value pair.
///
/// The JSON type of `value` depends on `type` (`string`, `bool`, `int64`, `float64`, `binary`), so it is kept untyped.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct KeyValue {
    /// Key.
    pub key: String,

    /// Declared value type.
    #[serde(rename = "type", default)]
    pub value_type: String,

    /// Value.
    #[serde(default)]
    pub value: Value,
}

impl KeyValue {
    /// Creates a string-typed key/value pair.
    pub fn string<K: Into<String>, V: Into<String>>(key: K, value: V) -> Self {
        Self {
            key: key.into(),
            value_type: "string".to_string(),
            value: Value::String(value.into()),
        }
    }
}

/// A timestamped span log.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Log {
    /// Timestamp, in microseconds since the Unix epoch.
    #[serde(default)]
    pub timestamp: u64,

    /// Log fields.
    #[serde(default, deserialize_with = "null_as_default")]
    pub fields: Vec<KeyValue>,
}

/// A process that emitted spans.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Process {
    /// Service name.
    #[serde(rename = "serviceName")]
    pub service_name: String,

    /// Process tags.
    #[serde(default, deserialize_with = "null_as_default")]
    pub tags: Vec<KeyValue>,
}

/// Decodes the response body of the trace search endpoint.
///
/// # Errors
///
/// If the body is not a valid envelope of traces, or the envelope carries errors, an error is returned.
pub fn decode_traces(body: &[u8]) -> Result<Vec<Trace>, DecodeError> {
    decode_envelope(body)
}

/// Decodes the response body of the trace search endpoint, keeping any errors carried alongside the traces.
///
/// The search endpoint reports per-trace failures in `errors` while still returning the traces it did find, so
/// callers that judge on `data` should use this rather than [`decode_traces`].
///
/// # Errors
///
/// If the body is not a valid envelope of traces, an error is returned.
pub fn decode_trace_envelope(body: &[u8]) -> Result<Envelope<Trace>, DecodeError> {
    serde_json::from_slice(body).context(Malformed {
        format: WireFormat::QueryJson,
    })
}

/// Decodes the response body of the services endpoint.
///
/// # Errors
///
/// If the body is not a valid envelope of service names, or the envelope carries errors, an error is returned.
pub fn decode_services(body: &[u8]) -> Result<Vec<String>, DecodeError> {
    decode_envelope(body)
}

fn decode_envelope<T: DeserializeOwned>(body: &[u8]) -> Result<Vec<T>, DecodeError> {
    let envelope: Envelope<T> = serde_json::from_slice(body).context(Malformed {
        format: WireFormat::QueryJson,
    })?;

    match envelope.errors {
        Some(errors) if !errors.is_empty() => Reported {
            format: WireFormat::QueryJson,
            messages: errors.into_iter().map(|e| format!("{} ({})", e.msg, e.code)).collect::<Vec<_>>(),
        }
        .fail(),
        _ => Ok(envelope.data),
    }
}

/// Treats an explicit `null` the same as an absent field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
