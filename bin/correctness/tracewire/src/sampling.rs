//! Sampling strategy payloads, in the Thrift-compatible JSON encoding.
//!
//! Thrift enums may appear either by name (`"PROBABILISTIC"`) or by numeric value (`0`), and an absent enum field
//! takes the zero value.

use std::fmt;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use snafu::ResultExt as _;

use crate::{DecodeError, Malformed, WireFormat};

/// Sampling strategy type.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum StrategyType {
    /// Sample a fixed fraction of traces.
    #[default]
    Probabilistic,

    /// Sample up to a fixed number of traces per second.
    RateLimiting,
}

impl StrategyType {
    fn from_value(value: i64) -> Option<Self> {
        match value {
            0 => Some(Self::Probabilistic),
            1 => Some(Self::RateLimiting),
            _ => None,
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "PROBABILISTIC" => Some(Self::Probabilistic),
            "RATE_LIMITING" => Some(Self::RateLimiting),
            _ => None,
        }
    }

    /// Returns the Thrift enum name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Probabilistic => "PROBABILISTIC",
            Self::RateLimiting => "RATE_LIMITING",
        }
    }
}

impl fmt::Display for StrategyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for StrategyType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for StrategyType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct StrategyTypeVisitor;

        impl de::Visitor<'_> for StrategyTypeVisitor {
            type Value = StrategyType;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a sampling strategy type name or numeric value")
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                StrategyType::from_value(v)
                    .ok_or_else(|| E::invalid_value(de::Unexpected::Signed(v), &self))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                i64::try_from(v)
                    .ok()
                    .and_then(StrategyType::from_value)
                    .ok_or_else(|| E::invalid_value(de::Unexpected::Unsigned(v), &self))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                StrategyType::from_name(v).ok_or_else(|| E::unknown_variant(v, &["PROBABILISTIC", "RATE_LIMITING"]))
            }
        }

        deserializer.deserialize_any(StrategyTypeVisitor)
    }
}

/// Probabilistic sampling parameters.
///
/// Zero-valued scalars may be omitted entirely, as the protobuf JSON mapping does.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ProbabilisticSampling {
    /// Fraction of traces to sample, in `[0.0, 1.0]`.
    #[serde(rename = "samplingRate", default)]
    pub sampling_rate: f64,
}

/// Rate-limiting sampling parameters.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct RateLimitingSampling {
    /// Maximum number of traces sampled per second.
    #[serde(rename = "maxTracesPerSecond", default)]
    pub max_traces_per_second: i64,
}

/// Sampling parameters for a single operation.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct OperationSamplingStrategy {
    /// Operation name.
    pub operation: String,

    /// Probabilistic sampling parameters for the operation.
    #[serde(rename = "probabilisticSampling", default)]
    pub probabilistic_sampling: ProbabilisticSampling,
}

/// Per-operation sampling parameters, with defaults for unlisted operations.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct PerOperationSampling {
    /// Default sampling probability for operations without a dedicated strategy.
    #[serde(rename = "defaultSamplingProbability", default)]
    pub default_sampling_probability: f64,

    /// Lower bound on traces per second for each operation.
    #[serde(rename = "defaultLowerBoundTracesPerSecond", default)]
    pub default_lower_bound_traces_per_second: f64,

    /// Dedicated per-operation strategies.
    #[serde(rename = "perOperationStrategies", default)]
    pub per_operation_strategies: Vec<OperationSamplingStrategy>,

    /// Upper bound on traces per second for each operation.
    #[serde(
        rename = "defaultUpperBoundTracesPerSecond",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub default_upper_bound_traces_per_second: Option<f64>,
}

/// A sampling strategy response.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct SamplingStrategyResponse {
    /// Strategy type.
    #[serde(rename = "strategyType", default)]
    pub strategy_type: StrategyType,

    /// Probabilistic sampling parameters, if any.
    #[serde(rename = "probabilisticSampling", default, skip_serializing_if = "Option::is_none")]
    pub probabilistic_sampling: Option<ProbabilisticSampling>,

    /// Rate-limiting sampling parameters, if any.
    #[serde(rename = "rateLimitingSampling", default, skip_serializing_if = "Option::is_none")]
    pub rate_limiting_sampling: Option<RateLimitingSampling>,

    /// Per-operation sampling parameters, if any.
    #[serde(rename = "operationSampling", default, skip_serializing_if = "Option::is_none")]
    pub operation_sampling: Option<PerOperationSampling>,
}

impl SamplingStrategyResponse {
    /// Creates a probabilistic strategy with the given sampling rate.
    pub fn probabilistic(sampling_rate: f64) -> Self {
        Self {
            strategy_type: StrategyType::Probabilistic,
            probabilistic_sampling: Some(ProbabilisticSampling { sampling_rate }),
            ..Default::default()
        }
    }

    /// Returns the probabilistic sampling rate, if the strategy carries one.
    pub fn sampling_rate(&self) -> Option<f64> {
        self.probabilistic_sampling.as_ref().map(|p| p.sampling_rate)
    }
}

/// Decodes the response body of the sampling strategy endpoint.
///
/// # Errors
///
/// If the body is not a valid sampling strategy response, an error is returned.
pub fn decode_strategy(body: &[u8]) -> Result<SamplingStrategyResponse, DecodeError> {
    serde_json::from_slice(body).context(Malformed {
        format: WireFormat::ThriftJson,
    })
}
