//! End-to-end verification harness for a running distributed tracing backend.
//!
//! Drives the backend through readiness, trace ingestion and trace visibility, and then checks that every protocol
//! surface agrees on what the backend knows.

use std::{process::ExitCode, sync::Arc};

use anyhow::Context as _;
use clap::Parser as _;
use serde::Serialize;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod checks;

mod config;
use self::config::{Action, Cli, ConfigArgs, Endpoints, RunCommand, ScenarioConfig};

mod reporter;
use self::reporter::Reporter;

mod scenario;
use self::scenario::Scenario;

mod transport;
use self::transport::HttpTransport;

const EXIT_MISCONFIGURED: u8 = 2;

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .compact()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(cli.log_level().into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    match cli.action {
        Action::Run(cmd) => run(cmd),
        Action::ShowConfig(args) => match show_config(&args) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("{:?}", e);
                ExitCode::from(EXIT_MISCONFIGURED)
            }
        },
    }
}

fn run(cmd: RunCommand) -> ExitCode {
    let (scenario, reporter) = match build_scenario(&cmd) {
        Ok(built) => built,
        Err(e) => {
            error!("{:?}", e);
            return ExitCode::from(EXIT_MISCONFIGURED);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to create Tokio runtime.");
            return ExitCode::from(EXIT_MISCONFIGURED);
        }
    };

    info!("crosscheck starting...");
    let report = runtime.block_on(scenario.run());
    reporter.report(&report);

    if report.passed() {
        info!("crosscheck stopped: all checks passed.");
        ExitCode::SUCCESS
    } else {
        error!(state = %report.state, "crosscheck stopped with failed checks.");
        ExitCode::FAILURE
    }
}

fn build_scenario(cmd: &RunCommand) -> Result<(Scenario, Reporter), anyhow::Error> {
    let settings = cmd
        .config
        .load()?
        .resolve()
        .context("Failed to resolve scenario configuration.")?;

    let transport =
        HttpTransport::new(settings.request_timeout).context("Failed to create HTTP transport.")?;
    let reporter = Reporter::new(cmd.output, cmd.details);

    Ok((Scenario::new(Arc::new(transport), settings), reporter))
}

#[derive(Serialize)]
struct EffectiveConfig<'a> {
    #[serde(flatten)]
    config: &'a ScenarioConfig,
    endpoints: &'a Endpoints,
}

fn show_config(args: &ConfigArgs) -> Result<(), anyhow::Error> {
    let config = args.load()?;
    let settings = config
        .resolve()
        .context("Failed to resolve scenario configuration.")?;

    let effective = EffectiveConfig {
        config: &config,
        endpoints: &settings.endpoints,
    };
    let rendered = serde_yaml::to_string(&effective).context("Failed to render configuration.")?;
    print!("{}", rendered);

    Ok(())
}
