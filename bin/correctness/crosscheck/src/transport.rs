//! HTTP transport shared by every check.
//!
//! The transport makes exactly one round trip per call and never retries on its own. Retry policy belongs to the
//! caller.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use snafu::{ResultExt as _, Snafu};
use url::Url;

/// A transport error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum TransportError {
    /// The request did not complete within the configured timeout.
    #[snafu(display("request to {} timed out after {:?}", url, timeout))]
    Timeout {
        /// Request URL.
        url: Url,

        /// Configured timeout.
        timeout: Duration,
    },

    /// The connection could not be established, or broke before the response was read.
    #[snafu(display("request to {} failed: {}", url, reason))]
    Connection {
        /// Request URL.
        url: Url,

        /// Description of the failure, including its cause chain.
        reason: String,
    },

    /// The underlying HTTP client could not be built.
    #[snafu(display("failed to build HTTP client: {}", source))]
    Build {
        /// Source of the error.
        source: reqwest::Error,
    },
}

/// An outbound request.
#[derive(Clone, Debug)]
pub struct ProbeRequest {
    /// Request method.
    pub method: Method,

    /// Request URL.
    pub url: Url,

    /// Request headers.
    pub headers: HeaderMap,
}

impl ProbeRequest {
    /// Creates a `GET` request for the given URL.
    pub fn get(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
            headers: HeaderMap::new(),
        }
    }

    /// Adds a header to the request.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }
}

/// A fully-read response.
#[derive(Clone, Debug)]
pub struct ProbeResponse {
    /// Response status.
    pub status: StatusCode,

    /// Response body.
    pub body: Bytes,
}

/// Sends requests on behalf of checks.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends the request and reads the full response body.
    ///
    /// # Errors
    ///
    /// If the request times out, or the connection fails at any point before the body is read, an error is returned.
    async fn send(&self, request: ProbeRequest) -> Result<ProbeResponse, TransportError>;
}

/// HTTP transport backed by `reqwest`, with a fixed per-request timeout.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpTransport {
    /// Creates a new `HttpTransport` that bounds every request by `timeout`.
    ///
    /// # Errors
    ///
    /// If the HTTP client cannot be built, an error is returned.
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder().timeout(timeout).build().context(Build)?;

        Ok(Self { client, timeout })
    }

    fn classify(&self, url: &Url, error: reqwest::Error) -> TransportError {
        if error.is_timeout() {
            Timeout {
                url: url.clone(),
                timeout: self.timeout,
            }
            .build()
        } else {
            Connection {
                url: url.clone(),
                reason: describe_error_chain(&error),
            }
            .build()
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: ProbeRequest) -> Result<ProbeResponse, TransportError> {
        let ProbeRequest { method, url, headers } = request;

        let response = self
            .client
            .request(method, url.clone())
            .headers(headers)
            .send()
            .await
            .map_err(|e| self.classify(&url, e))?;

        let status = response.status();
        let body = response.bytes().await.map_err(|e| self.classify(&url, e))?;

        Ok(ProbeResponse { status, body })
    }
}

fn describe_error_chain(error: &(dyn std::error::Error + 'static)) -> String {
    let mut description = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        description.push_str(": ");
        description.push_str(&cause.to_string());
        source = cause.source();
    }
    description
}
