use std::sync::atomic::{AtomicUsize, Ordering::Relaxed};

use backon::Retryable as _;
use snafu::{ResultExt as _, Snafu};
use tokio::time::Instant;
use tracewire::{
    query::{decode_trace_envelope, Trace},
    DecodeError,
};
use tracing::{debug, info, trace, warn};
use url::Url;

use super::{Assertion, CheckError, NotFound, Observed, ProbeOutcome, RetryPolicy};
use crate::transport::{ProbeRequest, Transport, TransportError};

/// Expected shape of the traces returned by a tag-scoped query.
#[derive(Clone, Copy, Debug)]
pub struct PollExpectation {
    /// Number of traces the query must return.
    pub traces: usize,

    /// Number of spans each returned trace must contain.
    pub spans_per_trace: usize,
}

/// Why a single polling attempt did not succeed.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
enum AttemptError {
    #[snafu(display("{}", source))]
    Unreachable { source: TransportError },

    #[snafu(display("query returned status {}", status))]
    Unavailable { status: http::StatusCode },

    #[snafu(display("query returned {} trace(s), waiting for {}", found, expected))]
    Pending { found: usize, expected: usize },

    #[snafu(display("{}", source))]
    Undecodable { source: DecodeError },
}

impl AttemptError {
    fn is_retryable(&self) -> bool {
        !matches!(self, Self::Undecodable { .. })
    }
}

/// Polls a tag-scoped trace query until it returns exactly the expected number of traces.
///
/// Indexing is asynchronous, so an empty or partial result is expected at first and simply polled again, as are
/// failed requests and non-success responses. Errors reported inside the response envelope are logged but do not fail
/// the attempt, since only the returned traces are judged. Only the number of traces is checked here: see
/// [`check_span_counts`] for the shape of each trace.
///
/// # Errors
///
/// If the expected number of traces is not returned within the attempt budget, an error is returned describing what
/// the final attempt observed. If a response cannot be decoded, polling stops immediately and a decode error is
/// returned, as repeating the query cannot fix a malformed payload.
pub async fn poll_for_traces(
    transport: &dyn Transport, url: &Url, policy: RetryPolicy, expectation: PollExpectation,
) -> Result<(Vec<Trace>, ProbeOutcome), CheckError> {
    let started = Instant::now();
    let attempts = AtomicUsize::new(0);

    let result = {
        let attempts = &attempts;
        (move || {
            let request = ProbeRequest::get(url.clone());
            async move {
                let attempt = attempts.fetch_add(1, Relaxed) + 1;
                debug!(%url, attempt, max_attempts = policy.max_attempts(), "Querying for traces...");

                let response = transport.send(request).await.context(Unreachable)?;
                if !response.status.is_success() {
                    return Unavailable {
                        status: response.status,
                    }
                    .fail();
                }

                trace!(%url, body = %String::from_utf8_lossy(&response.body), "Received trace query response.");
                let envelope = decode_trace_envelope(&response.body).context(Undecodable)?;
                for error in envelope.errors.iter().flatten() {
                    warn!(
                        %url,
                        code = error.code,
                        trace_id = ?error.trace_id,
                        msg = %error.msg,
                        "Trace query reported an error."
                    );
                }

                let traces = envelope.data;
                if traces.len() != expectation.traces {
                    return Pending {
                        found: traces.len(),
                        expected: expectation.traces,
                    }
                    .fail();
                }

                Ok::<_, AttemptError>(traces)
            }
        })
        .retry(policy)
        .sleep(tokio::time::sleep)
        .when(AttemptError::is_retryable)
        .notify(|e, delay| debug!(reason = %e, "Traces not yet visible, retrying in {:?}...", delay))
        .await
    };

    let attempts = attempts.into_inner();
    match result {
        Ok(traces) => {
            info!(%url, attempts, traces = traces.len(), "Traces are visible.");
            Ok((
                traces,
                ProbeOutcome {
                    attempts,
                    elapsed: started.elapsed(),
                },
            ))
        }
        Err(e) => {
            let last_observed = match e {
                AttemptError::Unreachable { source } => Observed::Unreachable(source.to_string()),
                AttemptError::Unavailable { status } => Observed::Status(status.as_u16()),
                AttemptError::Pending { found, .. } => Observed::Count(found),
                AttemptError::Undecodable { source } => {
                    warn!(%url, attempts, error = %source, "Trace query returned an undecodable response.");
                    return Err(CheckError::Decode {
                        url: url.clone(),
                        source,
                    });
                }
            };

            warn!(%url, attempts, "Traces did not become visible.");
            NotFound {
                url: url.clone(),
                attempts,
                expected: expectation.traces,
                last_observed,
            }
            .fail()
        }
    }
}

/// Checks that every trace contains exactly the expected number of spans.
///
/// A mismatch here means the data has the wrong shape, not that indexing is slow, so it is never retried.
///
/// # Errors
///
/// If any trace has a different number of spans, an error is returned naming the first such trace.
pub fn check_span_counts(url: &Url, traces: &[Trace], expectation: PollExpectation) -> Result<(), CheckError> {
    match traces.iter().find(|t| t.spans.len() != expectation.spans_per_trace) {
        None => Ok(()),
        Some(mismatched) => Assertion {
            url: url.clone(),
            check: "span count",
            expected: format!("{} span(s)", expectation.spans_per_trace),
            actual: format!("{} span(s) in trace {}", mismatched.spans.len(), mismatched.trace_id),
        }
        .fail(),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::transport::testing::{refuse, respond, ScriptedTransport};

    const EXPECT_ONE: PollExpectation = PollExpectation {
        traces: 1,
        spans_per_trace: 1,
    };

    fn query_url() -> Url {
        Url::parse("http://127.0.0.1:16686/api/traces?service=jaeger-query&tag=jaeger-debug-id:debug").unwrap()
    }

    fn traces_body(span_counts: &[usize]) -> String {
        let traces = span_counts
            .iter()
            .enumerate()
            .map(|(i, spans)| {
                let tags = r#"[{"key": "jaeger-debug-id", "type": "string", "value": "debug"}]"#;
                let spans = (0..*spans)
                    .map(|j| format!(r#"{{"traceID": "t{i}", "spanID": "s{j}", "tags": {tags}}}"#))
                    .collect::<Vec<_>>()
                    .join(",");
                format!(r#"{{"traceID": "t{i}", "spans": [{spans}], "processes": {{}}}}"#)
            })
            .collect::<Vec<_>>()
            .join(",");
        format!(r#"{{"data": [{traces}], "total": 0, "limit": 0, "offset": 0, "errors": null}}"#)
    }

    #[tokio::test(start_paused = true)]
    async fn visible_on_third_attempt() {
        let transport = ScriptedTransport::new(|_, call| {
            if call < 2 {
                respond(200, &traces_body(&[]))
            } else {
                respond(200, &traces_body(&[1]))
            }
        });

        let (traces, outcome) = poll_for_traces(
            &transport,
            &query_url(),
            RetryPolicy::new(20, Duration::from_secs(1)),
            EXPECT_ONE,
        )
        .await
        .unwrap();

        assert_eq!(outcome.attempts, 3);
        assert_eq!(transport.calls_to("/api/traces"), 3);
        assert_eq!(traces.len(), 1);
        assert!(check_span_counts(&query_url(), &traces, EXPECT_ONE).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn wrong_counts_never_succeed() {
        for count in [0, 2, 3] {
            let transport = ScriptedTransport::new(move |_, _| respond(200, &traces_body(&vec![1; count])));

            let err = poll_for_traces(
                &transport,
                &query_url(),
                RetryPolicy::new(20, Duration::from_secs(1)),
                EXPECT_ONE,
            )
            .await
            .unwrap_err();

            match err {
                CheckError::NotFound {
                    attempts,
                    expected,
                    last_observed,
                    ..
                } => {
                    assert_eq!(attempts, 20);
                    assert_eq!(expected, 1);
                    assert_eq!(last_observed, Observed::Count(count));
                }
                other => panic!("unexpected error: {}", other),
            }
            assert_eq!(transport.calls_to("/api/traces"), 20);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failures_and_bad_statuses_are_retried() {
        let transport = ScriptedTransport::new(|request, call| match call {
            0 => refuse(request),
            1 => respond(503, "unavailable"),
            _ => respond(200, &traces_body(&[1])),
        });

        let (_, outcome) = poll_for_traces(
            &transport,
            &query_url(),
            RetryPolicy::new(5, Duration::from_secs(1)),
            EXPECT_ONE,
        )
        .await
        .unwrap();
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn last_observation_is_reported() {
        let transport = ScriptedTransport::new(|request, call| {
            if call == 0 {
                respond(200, &traces_body(&[]))
            } else {
                refuse(request)
            }
        });

        let err = poll_for_traces(
            &transport,
            &query_url(),
            RetryPolicy::new(3, Duration::from_secs(1)),
            EXPECT_ONE,
        )
        .await
        .unwrap_err();

        match err {
            CheckError::NotFound { last_observed, .. } => {
                assert!(matches!(last_observed, Observed::Unreachable(_)));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn undecodable_response_stops_polling() {
        let transport = ScriptedTransport::new(|_, _| respond(200, "<html>query UI</html>"));

        let err = poll_for_traces(
            &transport,
            &query_url(),
            RetryPolicy::new(20, Duration::from_secs(1)),
            EXPECT_ONE,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, CheckError::Decode { .. }), "unexpected error: {}", err);
        assert_eq!(transport.calls_to("/api/traces"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn envelope_errors_do_not_hide_returned_traces() {
        let body = r#"{
            "data": [{"traceID": "t0", "spans": [{"traceID": "t0", "spanID": "s0"}], "processes": {}}],
            "errors": [{"code": 404, "msg": "trace not found"}]
        }"#;
        let transport = ScriptedTransport::new(move |_, _| respond(200, body));

        let (traces, outcome) = poll_for_traces(
            &transport,
            &query_url(),
            RetryPolicy::new(20, Duration::from_secs(1)),
            EXPECT_ONE,
        )
        .await
        .unwrap();

        assert_eq!(outcome.attempts, 1);
        assert_eq!(transport.calls_to("/api/traces"), 1);
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].trace_id, "t0");
    }

    #[test]
    fn span_count_mismatch_is_an_assertion() {
        let traces = tracewire::query::decode_traces(traces_body(&[2]).as_bytes()).unwrap();

        let err = check_span_counts(&query_url(), &traces, EXPECT_ONE).unwrap_err();
        match err {
            CheckError::Assertion { expected, actual, .. } => {
                assert_eq!(expected, "1 span(s)");
                assert_eq!(actual, "2 span(s) in trace t0");
            }
            other => panic!("unexpected error: {}", other),
        }
    }
}
