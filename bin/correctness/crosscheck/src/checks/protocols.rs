//! Protocol verifiers.
//!
//! Each verifier makes a single request against one wire surface, decodes it with the decoder for that surface, and
//! compares the decoded facts against what the scenario expects. These read service-level and configuration-level
//! state, which is already consistent once a trace has been confirmed, so nothing here is retried.

use std::collections::BTreeSet;

use bytes::Bytes;
use snafu::ResultExt as _;
use tracewire::{api_v3, query, sampling};
use tracing::{debug, info};
use url::Url;

use super::{Assertion, CheckError, Decode};
use crate::transport::{ProbeRequest, Transport};

async fn fetch(transport: &dyn Transport, url: &Url) -> Result<Bytes, CheckError> {
    debug!(%url, "Fetching...");
    let response = transport.send(ProbeRequest::get(url.clone())).await?;

    if !response.status.is_success() {
        return Assertion {
            url: url.clone(),
            check: "HTTP status",
            expected: "2xx".to_string(),
            actual: response.status.to_string(),
        }
        .fail();
    }

    Ok(response.body)
}

/// Compares a reported service list against the expected set. Each expected service must appear exactly once.
fn compare_service_lists(url: &Url, expected: &BTreeSet<String>, mut actual: Vec<String>) -> Result<(), CheckError> {
    actual.sort_unstable();
    if !actual.iter().eq(expected.iter()) {
        return Assertion {
            url: url.clone(),
            check: "service set",
            expected: format!("{:?}", expected.iter().collect::<Vec<_>>()),
            actual: format!("{:?}", actual),
        }
        .fail();
    }

    Ok(())
}

/// Verifies the sampling strategy served in the Thrift JSON encoding.
///
/// The strategy must be probabilistic, carry probabilistic sampling parameters, and sample at exactly
/// `expected_rate`.
///
/// # Errors
///
/// If the request fails, the body cannot be decoded, or the strategy differs from the expectation, an error is
/// returned.
pub async fn verify_sampling_strategy(
    transport: &dyn Transport, url: &Url, expected_rate: f64,
) -> Result<(), CheckError> {
    let body = fetch(transport, url).await?;
    let strategy = sampling::decode_strategy(&body).context(Decode { url: url.clone() })?;

    if strategy.strategy_type != sampling::StrategyType::Probabilistic {
        return Assertion {
            url: url.clone(),
            check: "strategy type",
            expected: sampling::StrategyType::Probabilistic.to_string(),
            actual: strategy.strategy_type.to_string(),
        }
        .fail();
    }

    let actual_rate = strategy.sampling_rate().ok_or_else(|| {
        Assertion {
            url: url.clone(),
            check: "probabilistic sampling",
            expected: "present".to_string(),
            actual: "absent".to_string(),
        }
        .build()
    })?;

    if actual_rate != expected_rate {
        return Assertion {
            url: url.clone(),
            check: "sampling rate",
            expected: expected_rate.to_string(),
            actual: actual_rate.to_string(),
        }
        .fail();
    }

    info!(%url, sampling_rate = actual_rate, "Sampling strategy verified.");
    Ok(())
}

/// Verifies the service list served in the protobuf JSON mapping.
///
/// # Errors
///
/// If the request fails, the body cannot be decoded, or the services listed differ from `expected`, an error is
/// returned. A service listed more than once counts as a difference.
pub async fn verify_services_v3(
    transport: &dyn Transport, url: &Url, expected: &BTreeSet<String>,
) -> Result<(), CheckError> {
    let body = fetch(transport, url).await?;
    let response = api_v3::decode_services(&body).context(Decode { url: url.clone() })?;

    compare_service_lists(url, expected, response.services)?;

    info!(%url, "Service list (protobuf JSON) verified.");
    Ok(())
}

/// Verifies the service list served by the REST query API.
///
/// # Errors
///
/// If the request fails, the body cannot be decoded, or the services listed differ from `expected`, an error is
/// returned. A service listed more than once counts as a difference.
pub async fn verify_services_rest(
    transport: &dyn Transport, url: &Url, expected: &BTreeSet<String>,
) -> Result<(), CheckError> {
    let body = fetch(transport, url).await?;
    let services = query::decode_services(&body).context(Decode { url: url.clone() })?;

    compare_service_lists(url, expected, services)?;

    info!(%url, "Service list (query JSON) verified.");
    Ok(())
}
