//! Format-aware models for the wire surfaces exposed by a tracing backend's query and sampling endpoints.
//!
//! Each surface layers its own naming and typing conventions on top of JSON, so each gets its own decoder rather than
//! sharing one generic JSON path.

#![deny(warnings)]
#![deny(missing_docs)]

use snafu::Snafu;

pub mod api_v3;
pub mod query;
pub mod sampling;

/// Wire format of a decoded payload.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WireFormat {
    /// Plain REST/JSON query API.
    QueryJson,

    /// Thrift-compatible JSON encoding.
    ThriftJson,

    /// Protobuf-to-JSON gateway mapping.
    ProtobufJson,
}

impl std::fmt::Display for WireFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::QueryJson => write!(f, "query JSON"),
            Self::ThriftJson => write!(f, "Thrift JSON"),
            Self::ProtobufJson => write!(f, "protobuf JSON"),
        }
    }
}

/// A decode error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum DecodeError {
    /// The payload was not valid for the given wire format.
    #[snafu(display("invalid {} payload: {}", format, source))]
    Malformed {
        /// Wire format being decoded.
        format: WireFormat,

        /// Source of the error.
        source: serde_json::Error,
    },

    /// The payload decoded, but the envelope reported errors from the backend.
    #[snafu(display("{} envelope reported {} error(s): {}", format, messages.len(), messages.join("; ")))]
    Reported {
        /// Wire format being decoded.
        format: WireFormat,

        /// Error messages carried in the envelope.
        messages: Vec<String>,
    },
}

impl DecodeError {
    /// Returns the wire format that failed to decode.
    pub fn format(&self) -> WireFormat {
        match self {
            Self::Malformed { format, .. } | Self::Reported { format, .. } => *format,
        }
    }
}
