//! Scenario orchestration.
//!
//! A scenario drives the backend through a fixed sequence of phases. Every phase up to trace confirmation depends on
//! the previous one, so the first failure stops the run. The protocol verifiers after that are independent of each
//! other: they all run, and every one of their results is reported.

use std::{fmt, future::Future, sync::Arc, time::Duration};

use serde::Serialize;
use tokio::time::Instant;
use tracing::{error, info};

use crate::{
    checks::{
        check_span_counts, check_static_asset, poll_for_traces, trigger_trace, verify_sampling_strategy,
        verify_services_rest, verify_services_v3, wait_until_ready, CheckError, Deadline, ProbeOutcome,
    },
    config::ScenarioSettings,
    reporter::{CheckRecord, ScenarioReport},
    transport::Transport,
};

/// Scenario state.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioState {
    /// Nothing has run yet.
    Init,

    /// The query service accepts connections.
    ReadinessChecked,

    /// The static asset is served.
    AssetChecked,

    /// The correlated request was sent.
    TraceTriggered,

    /// The correlated trace is visible with the expected shape.
    TraceConfirmed,

    /// Every protocol verifier passed.
    ProtocolsVerified,

    /// The scenario passed.
    Done,

    /// A check failed.
    Failed,
}

impl fmt::Display for ScenarioState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::ReadinessChecked => "readiness_checked",
            Self::AssetChecked => "asset_checked",
            Self::TraceTriggered => "trace_triggered",
            Self::TraceConfirmed => "trace_confirmed",
            Self::ProtocolsVerified => "protocols_verified",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Marks a run that stopped at a failed check. The failure itself is already recorded.
#[derive(Debug)]
struct Halted;

/// Optional deadline shared by every phase of a run.
#[derive(Clone, Copy)]
struct Budget {
    deadline: Option<(Instant, Duration)>,
}

impl Budget {
    fn starting_at(started: Instant, timeout: Option<Duration>) -> Self {
        Self {
            deadline: timeout.map(|timeout| (started + timeout, timeout)),
        }
    }

    async fn within<T, F>(self, phase: &'static str, fut: F) -> Result<T, CheckError>
    where
        F: Future<Output = Result<T, CheckError>>,
    {
        match self.deadline {
            None => fut.await,
            Some((deadline, timeout)) => match tokio::time::timeout_at(deadline, fut).await {
                Ok(result) => result,
                Err(_) => Deadline { phase, timeout }.fail(),
            },
        }
    }
}

async fn timed<T, F>(fut: F) -> (T, Duration)
where
    F: Future<Output = T>,
{
    let started = Instant::now();
    let output = fut.await;
    (output, started.elapsed())
}

struct Progress {
    state: ScenarioState,
    transitions: Vec<ScenarioState>,
    checks: Vec<CheckRecord>,
}

impl Progress {
    fn new() -> Self {
        Self {
            state: ScenarioState::Init,
            transitions: vec![ScenarioState::Init],
            checks: Vec::new(),
        }
    }

    fn advance(&mut self, next: ScenarioState) {
        info!(from = %self.state, to = %next, "Scenario state changed.");
        self.state = next;
        self.transitions.push(next);
    }

    fn pass(&mut self, name: &'static str, message: String, attempts: Option<usize>, duration: Duration) {
        info!(check = name, %message, "Check passed.");
        self.checks.push(CheckRecord {
            name,
            passed: true,
            message,
            attempts,
            duration,
        });
    }

    fn fail(&mut self, name: &'static str, error: &CheckError, duration: Duration) {
        error!(check = name, %error, "Check failed.");
        self.checks.push(CheckRecord {
            name,
            passed: false,
            message: error.to_string(),
            attempts: error.attempts(),
            duration,
        });
    }

    /// Records the outcome of a check that the rest of the run depends on.
    fn gate<T>(&mut self, name: &'static str, result: Result<T, CheckError>, duration: Duration) -> Result<T, Halted> {
        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                self.fail(name, &e, duration);
                self.advance(ScenarioState::Failed);
                Err(Halted)
            }
        }
    }

    fn pass_probe(&mut self, name: &'static str, message: String, outcome: ProbeOutcome) {
        self.pass(name, message, Some(outcome.attempts), outcome.elapsed);
    }
}

/// A single end-to-end verification run against a backend.
pub struct Scenario {
    transport: Arc<dyn Transport>,
    settings: ScenarioSettings,
}

impl Scenario {
    /// Creates a new `Scenario` that sends every request through `transport`.
    pub fn new(transport: Arc<dyn Transport>, settings: ScenarioSettings) -> Self {
        Self { transport, settings }
    }

    /// Runs the scenario to completion and reports every check that ran.
    ///
    /// A failed check is reported, not returned: the run itself never errors.
    pub async fn run(&self) -> ScenarioReport {
        let started = Instant::now();
        let budget = Budget::starting_at(started, self.settings.scenario_timeout);
        let mut progress = Progress::new();

        info!(tag = %self.settings.correlation_tag, "Starting scenario...");

        if self.run_phases(budget, &mut progress).await.is_ok() {
            progress.advance(ScenarioState::Done);
        }

        ScenarioReport {
            state: progress.state,
            correlation_tag: self.settings.correlation_tag.to_string(),
            transitions: progress.transitions,
            duration: started.elapsed(),
            checks: progress.checks,
        }
    }

    async fn run_phases(&self, budget: Budget, progress: &mut Progress) -> Result<(), Halted> {
        let transport = self.transport.as_ref();
        let settings = &self.settings;
        let endpoints = &settings.endpoints;

        info!(
            url = %endpoints.readiness,
            max_attempts = settings.readiness.max_attempts(),
            interval = ?settings.readiness.interval(),
            "Waiting for query service to become ready..."
        );
        let (result, elapsed) = timed(budget.within(
            "readiness",
            wait_until_ready(transport, &endpoints.readiness, settings.readiness),
        ))
        .await;
        let outcome = progress.gate("readiness", result, elapsed)?;
        progress.pass_probe(
            "readiness",
            format!("{} ready after {} attempt(s)", endpoints.readiness, outcome.attempts),
            outcome,
        );
        progress.advance(ScenarioState::ReadinessChecked);

        let (result, elapsed) =
            timed(budget.within("static asset", check_static_asset(transport, &endpoints.favicon))).await;
        let outcome = progress.gate("static_asset", result, elapsed)?;
        progress.pass_probe("static_asset", format!("{} served 200 OK", endpoints.favicon), outcome);
        progress.advance(ScenarioState::AssetChecked);

        let (result, elapsed) = timed(budget.within(
            "trace trigger",
            trigger_trace(
                transport,
                &endpoints.trigger,
                &settings.correlation_header,
                &settings.correlation_tag,
            ),
        ))
        .await;
        let outcome = progress.gate("trace_trigger", result, elapsed)?;
        progress.pass_probe(
            "trace_trigger",
            format!(
                "{} requested with {}: {}",
                endpoints.trigger, settings.correlation_header, settings.correlation_tag
            ),
            outcome,
        );
        progress.advance(ScenarioState::TraceTriggered);

        info!(
            url = %endpoints.trace_search,
            max_attempts = settings.poll.max_attempts(),
            interval = ?settings.poll.interval(),
            "Waiting for trace to become visible..."
        );
        let (result, elapsed) = timed(budget.within(
            "trace polling",
            poll_for_traces(transport, &endpoints.trace_search, settings.poll, settings.expectation),
        ))
        .await;
        let (traces, outcome) = progress.gate("trace_visible", result, elapsed)?;
        progress.pass_probe(
            "trace_visible",
            format!(
                "{} returned {} trace(s) after {} attempt(s)",
                endpoints.trace_search,
                traces.len(),
                outcome.attempts
            ),
            outcome,
        );

        let (result, elapsed) =
            timed(async { check_span_counts(&endpoints.trace_search, &traces, settings.expectation) }).await;
        progress.gate("trace_span_count", result, elapsed)?;
        progress.pass(
            "trace_span_count",
            format!("every trace has {} span(s)", settings.expectation.spans_per_trace),
            None,
            elapsed,
        );
        progress.advance(ScenarioState::TraceConfirmed);

        self.run_verifiers(budget, progress).await
    }

    async fn run_verifiers(&self, budget: Budget, progress: &mut Progress) -> Result<(), Halted> {
        let transport = self.transport.as_ref();
        let settings = &self.settings;
        let endpoints = &settings.endpoints;

        info!("Verifying protocol surfaces...");
        let (sampling, services_v3, services_rest) = tokio::join!(
            timed(budget.within(
                "protocol verification",
                verify_sampling_strategy(
                    transport,
                    &endpoints.sampling_strategy,
                    settings.expected_sampling_rate
                ),
            )),
            timed(budget.within(
                "protocol verification",
                verify_services_v3(transport, &endpoints.services_v3, &settings.expected_services),
            )),
            timed(budget.within(
                "protocol verification",
                verify_services_rest(transport, &endpoints.services, &settings.expected_services),
            )),
        );

        let results = [
            (
                "sampling_strategy",
                sampling,
                format!(
                    "{} reports sampling rate {}",
                    endpoints.sampling_strategy, settings.expected_sampling_rate
                ),
            ),
            (
                "services_v3",
                services_v3,
                format!("{} reports {:?}", endpoints.services_v3, settings.expected_services),
            ),
            (
                "services_rest",
                services_rest,
                format!("{} reports {:?}", endpoints.services, settings.expected_services),
            ),
        ];

        let mut all_passed = true;
        for (name, (result, elapsed), message) in results {
            match result {
                Ok(()) => progress.pass(name, message, Some(1), elapsed),
                Err(e) => {
                    progress.fail(name, &e, elapsed);
                    all_passed = false;
                }
            }
        }

        if all_passed {
            progress.advance(ScenarioState::ProtocolsVerified);
            Ok(())
        } else {
            progress.advance(ScenarioState::Failed);
            Err(Halted)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::ScenarioConfig,
        transport::{
            testing::{refuse, respond, ScriptedTransport},
            ProbeRequest, ProbeResponse, TransportError,
        },
    };

    const SERVICES_REST: &str = r#"{"data": ["jaeger-query"], "total": 1, "limit": 0, "offset": 0, "errors": null}"#;
    const SERVICES_V3: &str = r#"{"services": ["jaeger-query"]}"#;
    const SAMPLING: &str = r#"{"strategyType": "PROBABILISTIC", "probabilisticSampling": {"samplingRate": 1}}"#;

    fn settings(timeout: Option<&str>) -> ScenarioSettings {
        let mut config = ScenarioConfig::default();
        config.correlation_tag = Some("debug".to_string());
        config.scenario_timeout = timeout.map(|t| serde_yaml::from_str(t).unwrap());
        config.resolve().unwrap()
    }

    fn traces_body(span_counts: &[usize]) -> String {
        let traces = span_counts
            .iter()
            .enumerate()
            .map(|(i, spans)| {
                let spans = (0..*spans)
                    .map(|j| format!(r#"{{"traceID": "t{i}", "spanID": "s{j}", "tags": []}}"#))
                    .collect::<Vec<_>>()
                    .join(",");
                format!(r#"{{"traceID": "t{i}", "spans": [{spans}], "processes": {{}}}}"#)
            })
            .collect::<Vec<_>>()
            .join(",");
        format!(r#"{{"data": [{traces}], "total": 0, "limit": 0, "offset": 0, "errors": null}}"#)
    }

    /// A healthy backend whose trace becomes visible on the third query.
    fn healthy(request: &ProbeRequest, call: usize) -> Result<ProbeResponse, TransportError> {
        match request.url.path() {
            "/" => respond(200, "<html></html>"),
            "/favicon.ico" => respond(200, "icon"),
            "/api/services" => respond(200, SERVICES_REST),
            "/api/traces" if call < 2 => respond(200, &traces_body(&[])),
            "/api/traces" => respond(200, &traces_body(&[1])),
            "/api/v3/services" => respond(200, SERVICES_V3),
            "/sampling" => respond(200, SAMPLING),
            _ => respond(404, "404 page not found"),
        }
    }

    fn scenario<F>(responder: F, settings: ScenarioSettings) -> (Scenario, Arc<ScriptedTransport>)
    where
        F: Fn(&ProbeRequest, usize) -> Result<ProbeResponse, TransportError> + Send + Sync + 'static,
    {
        let transport = Arc::new(ScriptedTransport::new(responder));
        (Scenario::new(transport.clone(), settings), transport)
    }

    fn check<'a>(report: &'a ScenarioReport, name: &str) -> &'a CheckRecord {
        report.checks.iter().find(|c| c.name == name).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_backend_passes() {
        let (scenario, transport) = scenario(healthy, settings(None));
        let report = scenario.run().await;

        assert!(report.passed(), "failed checks: {:?}", report.failed_checks().collect::<Vec<_>>());
        assert_eq!(
            report.transitions,
            vec![
                ScenarioState::Init,
                ScenarioState::ReadinessChecked,
                ScenarioState::AssetChecked,
                ScenarioState::TraceTriggered,
                ScenarioState::TraceConfirmed,
                ScenarioState::ProtocolsVerified,
                ScenarioState::Done,
            ]
        );
        assert_eq!(check(&report, "trace_visible").attempts, Some(3));
        assert_eq!(transport.calls_to("/api/traces"), 3);

        let trigger = transport
            .requests()
            .into_iter()
            .find(|r| r.url.path() == "/api/services")
            .unwrap();
        assert_eq!(trigger.headers.get("jaeger-debug-id").unwrap(), "debug");

        let names = report.checks.iter().map(|c| c.name).collect::<Vec<_>>();
        assert_eq!(
            names,
            vec![
                "readiness",
                "static_asset",
                "trace_trigger",
                "trace_visible",
                "trace_span_count",
                "sampling_strategy",
                "services_v3",
                "services_rest",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unready_backend_stops_after_readiness() {
        let (scenario, transport) = scenario(|request, _| refuse(request), settings(None));
        let report = scenario.run().await;

        assert_eq!(report.state, ScenarioState::Failed);
        assert_eq!(report.transitions, vec![ScenarioState::Init, ScenarioState::Failed]);
        assert_eq!(report.checks.len(), 1);
        assert_eq!(report.checks[0].name, "readiness");
        assert_eq!(report.checks[0].attempts, Some(10));
        assert!(transport.requests().iter().all(|r| r.url.path() == "/"));
        assert_eq!(transport.calls_to("/"), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_asset_stops_before_trigger() {
        let (scenario, transport) = scenario(
            |request, call| match request.url.path() {
                "/favicon.ico" => respond(404, "404 page not found"),
                _ => healthy(request, call),
            },
            settings(None),
        );
        let report = scenario.run().await;

        assert_eq!(report.state, ScenarioState::Failed);
        assert!(!check(&report, "static_asset").passed);
        assert_eq!(transport.calls_to("/api/services"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn wrong_span_count_stops_before_verifiers() {
        let (scenario, transport) = scenario(
            |request, call| match request.url.path() {
                "/api/traces" => respond(200, &traces_body(&[2])),
                _ => healthy(request, call),
            },
            settings(None),
        );
        let report = scenario.run().await;

        assert_eq!(report.state, ScenarioState::Failed);
        let span_check = check(&report, "trace_span_count");
        assert!(!span_check.passed);
        assert!(span_check.message.contains("2 span(s) in trace t0"), "{}", span_check.message);
        assert_eq!(transport.calls_to("/sampling"), 0);
        assert_eq!(transport.calls_to("/api/v3/services"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sampling_mismatch_still_runs_every_verifier() {
        let (scenario, transport) = scenario(
            |request, call| match request.url.path() {
                "/sampling" => respond(
                    200,
                    r#"{"strategyType": "PROBABILISTIC", "probabilisticSampling": {"samplingRate": 0.5}}"#,
                ),
                _ => healthy(request, call),
            },
            settings(None),
        );
        let report = scenario.run().await;

        assert_eq!(report.state, ScenarioState::Failed);
        assert_eq!(report.transitions.last(), Some(&ScenarioState::Failed));
        assert!(report.transitions.contains(&ScenarioState::TraceConfirmed));
        assert!(!report.transitions.contains(&ScenarioState::ProtocolsVerified));

        let failed = report.failed_checks().map(|c| c.name).collect::<Vec<_>>();
        assert_eq!(failed, vec!["sampling_strategy"]);
        assert!(check(&report, "services_v3").passed);
        assert!(check(&report, "services_rest").passed);
        assert_eq!(transport.calls_to("/api/v3/services"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn services_v3_mismatch_fails() {
        let (scenario, _) = scenario(
            |request, call| match request.url.path() {
                "/api/v3/services" => respond(200, r#"{"services": ["other-service"]}"#),
                _ => healthy(request, call),
            },
            settings(None),
        );
        let report = scenario.run().await;

        assert_eq!(report.state, ScenarioState::Failed);
        let v3 = check(&report, "services_v3");
        assert!(!v3.passed);
        assert!(v3.message.contains(r#"expected ["jaeger-query"], actual ["other-service"]"#), "{}", v3.message);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_names_the_running_phase() {
        let (scenario, _) = scenario(|request, _| refuse(request), settings(Some("3s")));
        let report = scenario.run().await;

        assert_eq!(report.state, ScenarioState::Failed);
        assert_eq!(report.checks.len(), 1);
        assert_eq!(report.checks[0].message, "scenario deadline of 3s expired during readiness");
        assert_eq!(report.duration, Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn reruns_are_independent() {
        let (scenario, _) = scenario(
            |request, _| match request.url.path() {
                "/api/traces" => respond(200, &traces_body(&[1])),
                _ => healthy(request, 0),
            },
            settings(None),
        );

        for _ in 0..2 {
            let report = scenario.run().await;
            assert!(report.passed());
            assert_eq!(check(&report, "trace_visible").attempts, Some(1));
        }
    }
}
