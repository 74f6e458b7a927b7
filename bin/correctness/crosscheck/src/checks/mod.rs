use std::time::Duration;

use backon::{BackoffBuilder, ConstantBuilder};
use snafu::Snafu;
use tracewire::DecodeError;
use url::Url;

use crate::transport::TransportError;

mod ingest;
mod poller;
mod protocols;
mod readiness;

pub use self::ingest::{trigger_trace, CorrelationTag};
pub use self::poller::{check_span_counts, poll_for_traces, PollExpectation};
pub use self::protocols::{verify_sampling_strategy, verify_services_rest, verify_services_v3};
pub use self::readiness::{check_static_asset, wait_until_ready};

/// A check error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum CheckError {
    /// A single request failed to complete.
    #[snafu(context(false), display("{}", source))]
    Transport {
        /// Source of the error.
        source: TransportError,
    },

    /// The service never accepted a connection within the attempt budget.
    #[snafu(display("service at {} was not ready after {} attempt(s)", url, attempts))]
    NotReady {
        /// Probed URL.
        url: Url,

        /// Number of attempts made.
        attempts: usize,
    },

    /// A static asset could not be fetched on the first attempt.
    #[snafu(display("static asset at {} is unavailable: {}", url, reason))]
    AssetMissing {
        /// Asset URL.
        url: Url,

        /// Why the asset was considered missing.
        reason: String,
    },

    /// The expected number of traces never became visible within the attempt budget.
    #[snafu(display(
        "expected {} trace(s) at {} but last observed {} after {} attempt(s)",
        expected,
        url,
        describe_observed(last_observed),
        attempts
    ))]
    NotFound {
        /// Query URL.
        url: Url,

        /// Number of attempts made.
        attempts: usize,

        /// Expected number of traces.
        expected: usize,

        /// Outcome of the final attempt.
        last_observed: Observed,
    },

    /// A response body could not be decoded.
    #[snafu(display("failed to decode response from {}: {}", url, source))]
    Decode {
        /// Response URL.
        url: Url,

        /// Source of the error.
        source: DecodeError,
    },

    /// A decoded response violated an expectation.
    #[snafu(display("{} mismatch at {}: expected {}, actual {}", check, url, expected, actual))]
    Assertion {
        /// Response URL.
        url: Url,

        /// What was being compared.
        check: &'static str,

        /// Expected value.
        expected: String,

        /// Actual value.
        actual: String,
    },

    /// The scenario deadline expired while a phase was still running.
    #[snafu(visibility(pub(crate)), display("scenario deadline of {:?} expired during {}", timeout, phase))]
    Deadline {
        /// Phase that was running.
        phase: &'static str,

        /// Configured scenario timeout.
        timeout: Duration,
    },
}

impl CheckError {
    /// Returns the number of attempts made, for errors that come from a retry budget.
    pub fn attempts(&self) -> Option<usize> {
        match self {
            Self::NotReady { attempts, .. } | Self::NotFound { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }
}

/// What the final polling attempt saw.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Observed {
    /// A decoded collection of the given length.
    Count(usize),

    /// A response with a non-success status.
    Status(u16),

    /// No response at all.
    Unreachable(String),
}

fn describe_observed(observed: &Observed) -> String {
    match observed {
        Observed::Count(count) => format!("{} trace(s)", count),
        Observed::Status(status) => format!("HTTP status {}", status),
        Observed::Unreachable(reason) => format!("no response ({})", reason),
    }
}

/// Outcome of a successful check.
#[derive(Clone, Copy, Debug)]
pub struct ProbeOutcome {
    /// Number of attempts made, including the successful one.
    pub attempts: usize,

    /// Time spent across all attempts.
    pub elapsed: Duration,
}

/// A fixed-interval retry budget.
///
/// A policy of `max_attempts = N` makes at most N attempts, sleeping `interval` between consecutive attempts.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    max_attempts: usize,
    interval: Duration,
}

impl RetryPolicy {
    /// Creates a new `RetryPolicy`.
    ///
    /// A `max_attempts` of zero is treated as one.
    pub fn new(max_attempts: usize, interval: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            interval,
        }
    }

    /// Returns the maximum number of attempts.
    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Returns the interval between attempts.
    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl BackoffBuilder for RetryPolicy {
    type Backoff = <ConstantBuilder as BackoffBuilder>::Backoff;

    fn build(self) -> Self::Backoff {
        // The backoff counts retries, not attempts.
        ConstantBuilder::default()
            .with_delay(self.interval)
            .with_max_times(self.max_attempts - 1)
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_counts_attempts() {
        let policy = RetryPolicy::new(3, Duration::from_secs(1));
        let delays = policy.build().collect::<Vec<_>>();
        assert_eq!(delays, vec![Duration::from_secs(1), Duration::from_secs(1)]);

        let policy = RetryPolicy::new(1, Duration::from_secs(1));
        assert_eq!(policy.build().count(), 0);
    }

    #[test]
    fn zero_attempts_means_one() {
        let policy = RetryPolicy::new(0, Duration::from_millis(10));
        assert_eq!(policy.max_attempts(), 1);
        assert_eq!(policy.build().count(), 0);
    }

    #[test]
    fn attempts_only_for_budgeted_errors() {
        let url = Url::parse("http://127.0.0.1:16686/").unwrap();

        let not_ready = CheckError::NotReady {
            url: url.clone(),
            attempts: 10,
        };
        assert_eq!(not_ready.attempts(), Some(10));

        let timeout = CheckError::from(TransportError::Timeout {
            url: url.clone(),
            timeout: Duration::from_secs(1),
        });
        assert_eq!(timeout.attempts(), None);

        let assertion = CheckError::Assertion {
            url,
            check: "sampling rate",
            expected: "1".to_string(),
            actual: "0.5".to_string(),
        };
        assert_eq!(assertion.attempts(), None);
    }

    #[test]
    fn not_found_names_last_observation() {
        let err = CheckError::NotFound {
            url: Url::parse("http://127.0.0.1:16686/api/traces").unwrap(),
            attempts: 20,
            expected: 1,
            last_observed: Observed::Count(0),
        };
        assert_eq!(
            err.to_string(),
            "expected 1 trace(s) at http://127.0.0.1:16686/api/traces but last observed 0 trace(s) after 20 attempt(s)"
        );
    }
}
