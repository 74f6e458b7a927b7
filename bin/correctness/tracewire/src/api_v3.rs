//! API v3 payloads, in the protobuf JSON mapping used by the HTTP gateway.
//!
//! The mapping follows proto3 semantics: fields are accepted under their lowerCamelCase JSON name or their original
//! proto name, absent or `null` fields take their default value, and unknown fields are rejected.

use serde::{Deserialize, Deserializer, Serialize};
use snafu::ResultExt as _;

use crate::{DecodeError, Malformed, WireFormat};

/// Response of the `GetServices` call.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct GetServicesResponse {
    /// Service names.
    #[serde(default, deserialize_with = "proto_repeated")]
    pub services: Vec<String>,
}

/// Decodes the response body of the services endpoint.
///
/// # Errors
///
/// If the body is not a valid `GetServicesResponse`, an error is returned.
pub fn decode_services(body: &[u8]) -> Result<GetServicesResponse, DecodeError> {
    serde_json::from_slice(body).context(Malformed {
        format: WireFormat::ProtobufJson,
    })
}

fn proto_repeated<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_service_list() {
        let response = decode_services(br#"{"services": ["jaeger-query"]}"#).unwrap();
        assert_eq!(response.services, vec!["jaeger-query"]);
    }

    #[test]
    fn absent_or_null_repeated_field_is_empty() {
        assert!(decode_services(b"{}").unwrap().services.is_empty());
        assert!(decode_services(br#"{"services": null}"#).unwrap().services.is_empty());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = decode_services(br#"{"services": [], "data": ["jaeger-query"]}"#).unwrap_err();
        assert_eq!(err.format(), WireFormat::ProtobufJson);
    }

    #[test]
    fn query_envelope_is_not_a_services_response() {
        // The REST envelope uses `data`, which the protobuf mapping does not know about.
        assert!(decode_services(br#"{"data": ["jaeger-query"], "total": 1}"#).is_err());
    }
}
