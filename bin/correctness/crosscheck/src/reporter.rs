use std::time::Duration;

use colored::Colorize as _;
use serde::Serialize;
use tracing::error;

use crate::{config::OutputFormat, scenario::ScenarioState};

/// Result of a single check.
#[derive(Clone, Debug, Serialize)]
pub struct CheckRecord {
    /// Name of the check.
    pub name: &'static str,
    /// Whether the check passed.
    pub passed: bool,
    /// What was observed: the URL involved, and either the outcome or the expected and actual values.
    pub message: String,
    /// Number of attempts made, for checks that retry.
    pub attempts: Option<usize>,
    /// Time spent on the check.
    #[serde(rename = "duration_ms", with = "duration_millis")]
    pub duration: Duration,
}

/// Result of a full scenario run.
#[derive(Clone, Debug, Serialize)]
pub struct ScenarioReport {
    /// Final state of the scenario.
    pub state: ScenarioState,
    /// Correlation tag used for the run.
    pub correlation_tag: String,
    /// Every state the scenario passed through, in order.
    pub transitions: Vec<ScenarioState>,
    /// Total duration of the run.
    #[serde(rename = "duration_ms", with = "duration_millis")]
    pub duration: Duration,
    /// Individual check results, in the order they completed.
    pub checks: Vec<CheckRecord>,
}

impl ScenarioReport {
    /// Returns true if the scenario reached its final state.
    pub fn passed(&self) -> bool {
        self.state == ScenarioState::Done
    }

    /// Returns the checks that failed.
    pub fn failed_checks(&self) -> impl Iterator<Item = &CheckRecord> {
        self.checks.iter().filter(|c| !c.passed)
    }
}

/// Reporter for scenario results.
pub struct Reporter {
    format: OutputFormat,
    details: bool,
}

impl Reporter {
    /// Create a new reporter with the given output format.
    pub fn new(format: OutputFormat, details: bool) -> Self {
        Self { format, details }
    }

    /// Report the result of a scenario run.
    pub fn report(&self, report: &ScenarioReport) {
        match self.format {
            OutputFormat::Text => self.report_text(report),
            OutputFormat::Json => match serde_json::to_string_pretty(report) {
                Ok(json) => println!("{}", json),
                Err(e) => error!(error = %e, "Failed to serialize scenario report."),
            },
        }
    }

    fn report_text(&self, report: &ScenarioReport) {
        for check in &report.checks {
            let status = if check.passed {
                "PASS".green().bold()
            } else {
                "FAIL".red().bold()
            };

            println!("{} {} ({:.2?})", status, check.name, check.duration);
            if !check.passed || self.details {
                println!("    {}", check.message);
            }
        }

        println!();
        println!("{}", "=".repeat(60));

        let status = if report.passed() {
            "PASSED".green().bold()
        } else {
            "FAILED".red().bold()
        };

        let failed = report.failed_checks().count();
        println!(
            "{}: {} passed, {} failed, final state {} (tag {}, {:.2?})",
            status,
            report.checks.len() - failed,
            failed,
            report.state,
            report.correlation_tag,
            report.duration
        );

        if failed > 0 {
            println!();
            println!("{}", "Failed checks:".red().bold());
            for check in report.failed_checks() {
                println!("  - {}: {}", check.name, check.message);
            }
        }
    }
}

/// Serde helper for serializing Duration as milliseconds.
mod duration_millis {
    use std::time::Duration;

    use serde::{Serialize, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }
}
