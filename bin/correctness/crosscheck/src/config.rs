use std::{
    collections::BTreeSet,
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{anyhow, Context as _};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use http::HeaderName;
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::checks::{CorrelationTag, PollExpectation, RetryPolicy};

/// Cross-protocol verification harness for a running tracing backend.
#[derive(Parser)]
#[command(about)]
pub struct Cli {
    /// Enable verbose output. (Specify twice for more verbosity.)
    #[arg(global = true, short = 'v', long, action = ArgAction::Count, default_value_t = 0)]
    verbose: u8,

    /// Subcommand to run.
    #[command(subcommand)]
    pub action: Action,
}

impl Cli {
    /// Gets the configured log level based on the user-supplied verbosity level.
    pub fn log_level(&self) -> LevelFilter {
        match self.verbose {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        }
    }
}

#[derive(Subcommand)]
pub enum Action {
    /// Run the verification scenario against the backend.
    #[command(name = "run")]
    Run(RunCommand),

    /// Print the effective configuration and the endpoints it resolves to.
    #[command(name = "show-config")]
    ShowConfig(ConfigArgs),
}

/// Output format for the final report.
#[derive(Clone, Copy, Debug, Default, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable, colored text.
    #[default]
    Text,

    /// Pretty-printed JSON.
    Json,
}

#[derive(Args, Clone)]
pub struct RunCommand {
    #[command(flatten)]
    pub config: ConfigArgs,

    /// Output format for the final report.
    #[arg(short = 'o', long, value_enum, default_value_t = OutputFormat::Text)]
    pub output: OutputFormat,

    /// Show details for passing checks, not just failing ones.
    #[arg(long)]
    pub details: bool,
}

#[derive(Args, Clone)]
pub struct ConfigArgs {
    /// Path to a YAML scenario file.
    ///
    /// Any setting not present in the file takes its default value. Flags given on the command line take precedence
    /// over the file.
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Base URL of the query service.
    #[arg(long)]
    pub query_url: Option<Url>,

    /// Base URL of the sampling strategy service.
    #[arg(long)]
    pub sampling_url: Option<Url>,

    /// Fixed correlation tag to use instead of a random one.
    #[arg(long)]
    pub correlation_tag: Option<String>,

    /// Overall deadline for the whole scenario (e.g. `90s`, `2m`).
    #[arg(long, value_parser = parse_duration)]
    pub scenario_timeout: Option<Duration>,
}

impl ConfigArgs {
    /// Loads the scenario file, if any, and applies command-line overrides on top of it.
    ///
    /// # Errors
    ///
    /// If the scenario file cannot be read or parsed, an error is returned.
    pub fn load(&self) -> Result<ScenarioConfig, anyhow::Error> {
        let mut config = match &self.config {
            Some(path) => ScenarioConfig::from_yaml(path)?,
            None => ScenarioConfig::default(),
        };

        if let Some(url) = &self.query_url {
            config.query_url = url.to_string();
        }
        if let Some(url) = &self.sampling_url {
            config.sampling_url = url.to_string();
        }
        if let Some(tag) = &self.correlation_tag {
            config.correlation_tag = Some(tag.clone());
        }
        if let Some(timeout) = self.scenario_timeout {
            config.scenario_timeout = Some(HumanDuration(timeout));
        }

        Ok(config)
    }
}

/// A duration that can be parsed from human-readable strings like "10s", "1m", "500ms".
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HumanDuration(pub Duration);

impl<'de> Deserialize<'de> for HumanDuration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map(HumanDuration).map_err(serde::de::Error::custom)
    }
}

impl Serialize for HumanDuration {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl fmt::Display for HumanDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let millis = self.0.as_millis();
        if millis % 1000 == 0 {
            write!(f, "{}s", millis / 1000)
        } else {
            write!(f, "{}ms", millis)
        }
    }
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }

    let mut total = Duration::ZERO;
    let mut current_num = String::new();
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            current_num.push(c);
        } else if c.is_alphabetic() {
            if current_num.is_empty() {
                return Err(format!("unexpected unit '{}' without a number", c));
            }

            let num: u64 = current_num
                .parse()
                .map_err(|_| format!("invalid number: {}", current_num))?;
            current_num.clear();

            let mut unit = String::from(c);
            while let Some(next) = chars.next_if(|c| c.is_alphabetic()) {
                unit.push(next);
            }

            let part = match unit.as_str() {
                "ms" => Some(Duration::from_millis(num)),
                "s" => Some(Duration::from_secs(num)),
                "m" => num.checked_mul(60).map(Duration::from_secs),
                "h" => num.checked_mul(3600).map(Duration::from_secs),
                _ => return Err(format!("unknown duration unit: {}", unit)),
            };
            let part = part.ok_or_else(|| format!("duration too large: {}{}", num, unit))?;
            total = add_duration(total, part)?;
        } else if !c.is_whitespace() {
            return Err(format!("unexpected character: {}", c));
        }
    }

    // A trailing number without a unit is taken as seconds.
    if !current_num.is_empty() {
        let num: u64 = current_num
            .parse()
            .map_err(|_| format!("invalid number: {}", current_num))?;
        total = add_duration(total, Duration::from_secs(num))?;
    }

    if total.is_zero() {
        return Err("duration must be greater than zero".to_string());
    }

    Ok(total)
}

fn add_duration(total: Duration, part: Duration) -> Result<Duration, String> {
    total
        .checked_add(part)
        .ok_or_else(|| "duration too large".to_string())
}

/// Retry budget settings.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySettings {
    /// Maximum number of attempts.
    pub max_attempts: usize,

    /// Interval between attempts.
    pub interval: HumanDuration,
}

impl RetrySettings {
    fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, self.interval.0)
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            interval: HumanDuration(Duration::from_secs(1)),
        }
    }
}

/// Trace polling settings.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PollSettings {
    /// Maximum number of query attempts.
    pub max_attempts: usize,

    /// Interval between query attempts.
    pub interval: HumanDuration,

    /// Number of traces the query must return.
    pub expected_traces: usize,

    /// Number of spans each trace must contain.
    pub expected_spans: usize,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            interval: HumanDuration(Duration::from_secs(1)),
            expected_traces: 1,
            expected_spans: 1,
        }
    }
}

/// Scenario configuration, as loaded from a YAML file.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScenarioConfig {
    /// Base URL of the query service.
    pub query_url: String,

    /// Base URL of the sampling strategy service.
    pub sampling_url: String,

    /// Service whose traces are queried.
    pub service: String,

    /// Service whose sampling strategy is requested.
    pub sampling_service: String,

    /// Name of the header carrying the correlation tag.
    pub correlation_header: String,

    /// Fixed correlation tag. A random tag is generated per run when unset.
    pub correlation_tag: Option<String>,

    /// Timeout applied to every individual request.
    pub request_timeout: HumanDuration,

    /// Readiness probe retry budget.
    pub readiness: RetrySettings,

    /// Trace polling settings.
    pub poll: PollSettings,

    /// Services every service listing must report, exactly.
    pub expected_services: Vec<String>,

    /// Sampling rate the sampling strategy must report, exactly.
    pub expected_sampling_rate: f64,

    /// Overall deadline for the whole scenario.
    pub scenario_timeout: Option<HumanDuration>,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            query_url: "http://127.0.0.1:16686".to_string(),
            sampling_url: "http://127.0.0.1:5778".to_string(),
            service: "jaeger-query".to_string(),
            sampling_service: "whatever".to_string(),
            correlation_header: "jaeger-debug-id".to_string(),
            correlation_tag: None,
            request_timeout: HumanDuration(Duration::from_secs(1)),
            readiness: RetrySettings::default(),
            poll: PollSettings::default(),
            expected_services: vec!["jaeger-query".to_string()],
            expected_sampling_rate: 1.0,
            scenario_timeout: None,
        }
    }
}

impl ScenarioConfig {
    /// Loads a scenario configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// If the file cannot be read or parsed, an error is returned.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file: {}", path.display()))?;

        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse configuration file: {}", path.display()))
    }

    /// Resolves the configuration into the concrete endpoints and settings used by a scenario run.
    ///
    /// # Errors
    ///
    /// If any endpoint URL cannot be built, or the correlation header or tag are not valid HTTP header components, an
    /// error is returned.
    pub fn resolve(&self) -> Result<ScenarioSettings, anyhow::Error> {
        let correlation_header = HeaderName::from_bytes(self.correlation_header.as_bytes())
            .with_context(|| format!("Invalid correlation header name '{}'.", self.correlation_header))?;

        let correlation_tag = match &self.correlation_tag {
            Some(tag) => CorrelationTag::new(tag.as_str())
                .with_context(|| format!("Invalid correlation tag '{}'.", tag))?,
            None => CorrelationTag::random().context("Failed to generate correlation tag.")?,
        };

        if self.expected_services.is_empty() {
            return Err(anyhow!("At least one expected service must be configured."));
        }

        let endpoints = Endpoints::new(self, &correlation_header, &correlation_tag)?;

        Ok(ScenarioSettings {
            endpoints,
            correlation_header,
            correlation_tag,
            request_timeout: self.request_timeout.0,
            readiness: self.readiness.policy(),
            poll: self.poll.policy(),
            expectation: PollExpectation {
                traces: self.poll.expected_traces,
                spans_per_trace: self.poll.expected_spans,
            },
            expected_services: self.expected_services.iter().cloned().collect(),
            expected_sampling_rate: self.expected_sampling_rate,
            scenario_timeout: self.scenario_timeout.map(|d| d.0),
        })
    }
}

impl PollSettings {
    fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, self.interval.0)
    }
}

/// Parses a base URL, ending its path with a slash so that endpoints resolve beneath any path prefix.
fn parse_base_url(name: &str, url: &str) -> Result<Url, anyhow::Error> {
    let mut parsed = Url::parse(url).with_context(|| format!("Invalid {} URL '{}'.", name, url))?;
    if parsed.cannot_be_a_base() {
        return Err(anyhow!("Invalid {} URL '{}': not a base URL.", name, url));
    }
    if !parsed.path().ends_with('/') {
        let path = format!("{}/", parsed.path());
        parsed.set_path(&path);
    }
    Ok(parsed)
}

/// Every URL the scenario touches.
#[derive(Clone, Debug, Serialize)]
pub struct Endpoints {
    /// Probed for liveness.
    pub readiness: Url,

    /// Static asset that must be served immediately.
    pub favicon: Url,

    /// Requested with the correlation header to produce a trace.
    pub trigger: Url,

    /// Tag-scoped trace search.
    pub trace_search: Url,

    /// Service list over the REST query API.
    pub services: Url,

    /// Service list over the protobuf JSON gateway.
    pub services_v3: Url,

    /// Sampling strategy for the configured sampling service.
    pub sampling_strategy: Url,
}

impl Endpoints {
    fn new(
        config: &ScenarioConfig, correlation_header: &HeaderName, correlation_tag: &CorrelationTag,
    ) -> Result<Self, anyhow::Error> {
        let query = parse_base_url("query", &config.query_url)?;
        let sampling = parse_base_url("sampling", &config.sampling_url)?;
        let join = |base: &Url, path: &str| {
            base.join(path)
                .with_context(|| format!("Failed to build endpoint '{}' from base URL '{}'.", path, base))
        };

        let mut trace_search = join(&query, "api/traces")?;
        trace_search
            .query_pairs_mut()
            .append_pair("service", &config.service)
            .append_pair("tag", &format!("{}:{}", correlation_header, correlation_tag));

        let mut sampling_strategy = join(&sampling, "sampling")?;
        sampling_strategy
            .query_pairs_mut()
            .append_pair("service", &config.sampling_service);

        Ok(Self {
            favicon: join(&query, "favicon.ico")?,
            trigger: join(&query, "api/services")?,
            trace_search,
            services: join(&query, "api/services")?,
            services_v3: join(&query, "api/v3/services")?,
            readiness: query,
            sampling_strategy,
        })
    }
}

/// Fully-resolved settings for a scenario run.
#[derive(Clone, Debug)]
pub struct ScenarioSettings {
    pub endpoints: Endpoints,
    pub correlation_header: HeaderName,
    pub correlation_tag: CorrelationTag,
    pub request_timeout: Duration,
    pub readiness: RetryPolicy,
    pub poll: RetryPolicy,
    pub expectation: PollExpectation,
    pub expected_services: BTreeSet<String>,
    pub expected_sampling_rate: f64,
    pub scenario_timeout: Option<Duration>,
}
