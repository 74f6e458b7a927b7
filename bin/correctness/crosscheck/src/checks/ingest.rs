use std::fmt;

use http::{header::InvalidHeaderValue, HeaderName, HeaderValue};
use rand::distr::{Alphanumeric, SampleString as _};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use super::{CheckError, ProbeOutcome};
use crate::transport::{ProbeRequest, Transport};

/// An opaque identifier linking an ingestion request to the trace it produces.
///
/// The tag is sent as a request header and is expected to come back as a span tag on the resulting trace.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CorrelationTag {
    value: String,
    header_value: HeaderValue,
}

impl CorrelationTag {
    /// Creates a `CorrelationTag` from a fixed value.
    ///
    /// # Errors
    ///
    /// If the value cannot be sent as an HTTP header value, an error is returned.
    pub fn new(value: impl Into<String>) -> Result<Self, InvalidHeaderValue> {
        let value = value.into();
        let header_value = HeaderValue::from_str(&value)?;
        Ok(Self { value, header_value })
    }

    /// Creates a random, 8-character alphanumeric `CorrelationTag`.
    ///
    /// # Errors
    ///
    /// If the value cannot be sent as an HTTP header value, an error is returned.
    pub fn random() -> Result<Self, InvalidHeaderValue> {
        Self::new(Alphanumeric.sample_string(&mut rand::rng(), 8))
    }

    /// Returns the tag value.
    pub fn as_str(&self) -> &str {
        &self.value
    }
}

impl fmt::Display for CorrelationTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sends a single request carrying the correlation tag, causing the backend to record a trace for it.
///
/// The response body is not inspected: the request only has to complete. The resulting trace is indexed
/// asynchronously, so it is not expected to be queryable when this returns.
///
/// # Errors
///
/// If the request fails to complete, an error is returned.
pub async fn trigger_trace(
    transport: &dyn Transport, url: &Url, header: &HeaderName, tag: &CorrelationTag,
) -> Result<ProbeOutcome, CheckError> {
    let started = Instant::now();

    debug!(%url, %header, %tag, "Triggering trace...");
    let request = ProbeRequest::get(url.clone()).with_header(header.clone(), tag.header_value.clone());
    let response = transport.send(request).await?;

    if response.status.is_success() {
        info!(%url, %tag, "Trace triggered.");
    } else {
        warn!(%url, %tag, status = %response.status, "Trace trigger request completed with a non-success status.");
    }

    Ok(ProbeOutcome {
        attempts: 1,
        elapsed: started.elapsed(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::{refuse, respond, ScriptedTransport};

    #[test]
    fn random_tags_are_alphanumeric() {
        let a = CorrelationTag::random().unwrap();
        let b = CorrelationTag::random().unwrap();

        assert_eq!(a.as_str().len(), 8);
        assert!(a.as_str().chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }

    #[test]
    fn fixed_tag_must_be_a_valid_header_value() {
        assert_eq!(CorrelationTag::new("debug").unwrap().to_string(), "debug");
        assert!(CorrelationTag::new("line\nbreak").is_err());
    }

    #[tokio::test]
    async fn sends_tag_header_once() {
        let transport = ScriptedTransport::new(|_, _| respond(200, r#"{"data": ["jaeger-query"]}"#));
        let url = Url::parse("http://127.0.0.1:16686/api/services").unwrap();
        let header = HeaderName::from_static("jaeger-debug-id");
        let tag = CorrelationTag::new("debug").unwrap();

        let outcome = trigger_trace(&transport, &url, &header, &tag).await.unwrap();
        assert_eq!(outcome.attempts, 1);

        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].headers.get("jaeger-debug-id").unwrap(), "debug");
    }

    #[tokio::test]
    async fn body_and_status_are_not_inspected() {
        let transport = ScriptedTransport::new(|_, _| respond(500, "not json at all"));
        let url = Url::parse("http://127.0.0.1:16686/api/services").unwrap();
        let header = HeaderName::from_static("jaeger-debug-id");
        let tag = CorrelationTag::new("debug").unwrap();

        assert!(trigger_trace(&transport, &url, &header, &tag).await.is_ok());
    }

    #[tokio::test]
    async fn transport_failure_is_reported() {
        let transport = ScriptedTransport::new(|request, _| refuse(request));
        let url = Url::parse("http://127.0.0.1:16686/api/services").unwrap();
        let header = HeaderName::from_static("jaeger-debug-id");
        let tag = CorrelationTag::new("debug").unwrap();

        let err = trigger_trace(&transport, &url, &header, &tag).await.unwrap_err();
        assert!(matches!(err, CheckError::Transport { .. }));
        assert_eq!(transport.calls_to("/api/services"), 1);
    }
}
