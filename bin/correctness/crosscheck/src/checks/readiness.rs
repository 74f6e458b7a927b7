use std::sync::atomic::{AtomicUsize, Ordering::Relaxed};

use backon::Retryable as _;
use http::StatusCode;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use super::{AssetMissing, CheckError, NotReady, ProbeOutcome, RetryPolicy};
use crate::transport::{ProbeRequest, Transport};

/// Waits for the service at `url` to accept connections.
///
/// Any completed response counts as ready, whatever its status. Failed connections are retried according to `policy`.
///
/// # Errors
///
/// If every attempt in the budget fails to get a response, an error is returned carrying the number of attempts made.
pub async fn wait_until_ready(
    transport: &dyn Transport, url: &Url, policy: RetryPolicy,
) -> Result<ProbeOutcome, CheckError> {
    let started = Instant::now();
    let attempts = AtomicUsize::new(0);

    let result = {
        let attempts = &attempts;
        (move || {
            let request = ProbeRequest::get(url.clone());
            async move {
                let attempt = attempts.fetch_add(1, Relaxed) + 1;
                debug!(%url, attempt, max_attempts = policy.max_attempts(), "Checking readiness...");
                transport.send(request).await
            }
        })
        .retry(policy)
        .sleep(tokio::time::sleep)
        .notify(|e, delay| debug!(error = %e, "Readiness check unsuccessful, retrying in {:?}...", delay))
        .await
    };

    let attempts = attempts.into_inner();
    match result {
        Ok(response) => {
            info!(%url, attempts, status = %response.status, "Service is ready.");
            Ok(ProbeOutcome {
                attempts,
                elapsed: started.elapsed(),
            })
        }
        Err(e) => {
            warn!(%url, attempts, error = %e, "Service did not become ready.");
            NotReady {
                url: url.clone(),
                attempts,
            }
            .fail()
        }
    }
}

/// Fetches a static asset exactly once, requiring a `200 OK` response.
///
/// # Errors
///
/// If the request fails, or completes with any status other than `200 OK`, an error is returned.
pub async fn check_static_asset(transport: &dyn Transport, url: &Url) -> Result<ProbeOutcome, CheckError> {
    let started = Instant::now();

    debug!(%url, "Checking static asset...");
    let reason = match transport.send(ProbeRequest::get(url.clone())).await {
        Ok(response) if response.status == StatusCode::OK => {
            info!(%url, bytes = response.body.len(), "Static asset is available.");
            return Ok(ProbeOutcome {
                attempts: 1,
                elapsed: started.elapsed(),
            });
        }
        Ok(response) => format!("expected status {}, got {}", StatusCode::OK, response.status),
        Err(e) => e.to_string(),
    };

    warn!(%url, %reason, "Static asset check failed.");
    AssetMissing {
        url: url.clone(),
        reason,
    }
    .fail()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::transport::testing::{refuse, respond, ScriptedTransport};

    fn base_url() -> Url {
        Url::parse("http://127.0.0.1:16686/").unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn ready_after_k_attempts_makes_no_further_calls() {
        for ready_on in 1..=5 {
            let transport = ScriptedTransport::new(move |request, call| {
                if call + 1 >= ready_on {
                    respond(200, "<html></html>")
                } else {
                    refuse(request)
                }
            });

            let outcome = wait_until_ready(&transport, &base_url(), RetryPolicy::new(5, Duration::from_secs(1)))
                .await
                .unwrap();

            assert_eq!(outcome.attempts, ready_on);
            assert_eq!(transport.calls_to("/"), ready_on);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn any_status_counts_as_ready() {
        let transport = ScriptedTransport::new(|_, _| respond(503, "starting"));

        let outcome = wait_until_ready(&transport, &base_url(), RetryPolicy::new(10, Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn never_ready_exhausts_exact_budget() {
        let transport = ScriptedTransport::new(|request, _| refuse(request));
        let started = Instant::now();

        let err = wait_until_ready(&transport, &base_url(), RetryPolicy::new(10, Duration::from_secs(1)))
            .await
            .unwrap_err();

        assert!(matches!(err, CheckError::NotReady { attempts: 10, .. }), "unexpected error: {}", err);
        assert_eq!(transport.calls_to("/"), 10);

        // Nine sleeps between ten attempts.
        assert_eq!(started.elapsed(), Duration::from_secs(9));
    }

    #[tokio::test]
    async fn asset_requires_ok() {
        let url = base_url().join("/favicon.ico").unwrap();

        let transport = ScriptedTransport::new(|_, _| respond(200, "icon"));
        let outcome = check_static_asset(&transport, &url).await.unwrap();
        assert_eq!(outcome.attempts, 1);

        let transport = ScriptedTransport::new(|_, _| respond(404, "not found"));
        let err = check_static_asset(&transport, &url).await.unwrap_err();
        match err {
            CheckError::AssetMissing { reason, .. } => assert_eq!(reason, "expected status 200 OK, got 404 Not Found"),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn asset_is_not_retried() {
        let url = base_url().join("/favicon.ico").unwrap();
        let transport = ScriptedTransport::new(|request, call| {
            if call == 0 {
                refuse(request)
            } else {
                respond(200, "icon")
            }
        });

        let err = check_static_asset(&transport, &url).await.unwrap_err();
        assert!(matches!(err, CheckError::AssetMissing { .. }));
        assert_eq!(transport.calls_to("/favicon.ico"), 1);
    }
}
