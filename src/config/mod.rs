use std::collections::HashMap;
use std::sync::OnceLock;

use garde::Validate;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::signals::{SignalStrength, SignalType};

/// Load `.env` once per process. Safe to call repeatedly.
pub fn load_env() {
    static LOADED: OnceLock<()> = OnceLock::new();
    LOADED.get_or_init(|| {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!(path = %path.display(), "loaded environment file");
        }
    });
}

/// Validate a garde record, mapping the report into `Error::BadConfig`.
pub fn validated<T: Validate<Context = ()>>(record: T) -> Result<T> {
    record
        .validate()
        .map_err(|report| Error::bad_config(report.to_string()))?;
    Ok(record)
}

/// Parse a TOML configuration record, resolve `${VAR}` placeholders and
/// validate it.
pub fn from_toml_str<T>(raw: &str) -> Result<T>
where
    T: DeserializeOwned + Validate<Context = ()>,
{
    let value: toml::Value =
        toml::from_str(raw).map_err(|e| Error::bad_config(format!("invalid TOML: {e}")))?;
    let mut json = serde_json::to_value(value)
        .map_err(|e| Error::bad_config(format!("invalid configuration value: {e}")))?;
    resolve_placeholders(&mut json);
    let record: T = serde_json::from_value(json)
        .map_err(|e| Error::bad_config(format!("invalid configuration record: {e}")))?;
    validated(record)
}

/// Recursively substitute `${VAR}` placeholders from the process environment.
/// Unknown variables are left verbatim.
pub fn resolve_placeholders(value: &mut serde_json::Value) {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    let re = PLACEHOLDER.get_or_init(|| Regex::new(r"\$\{([^}]+)\}").expect("valid pattern"));

    match value {
        serde_json::Value::String(s) => {
            if s.contains("${") {
                let resolved = re.replace_all(s, |caps: &regex::Captures<'_>| {
                    std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
                });
                *s = resolved.into_owned();
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                resolve_placeholders(item);
            }
        }
        serde_json::Value::Object(map) => {
            for item in map.values_mut() {
                resolve_placeholders(item);
            }
        }
        _ => {}
    }
}

fn in_unit_open_closed(value: &f64, _ctx: &()) -> garde::Result {
    if *value > 0.0 && *value <= 1.0 {
        Ok(())
    } else {
        Err(garde::Error::new(format!(
            "must be in (0.0, 1.0], got {value}"
        )))
    }
}

fn strictly_negative(value: &f64, _ctx: &()) -> garde::Result {
    if *value < 0.0 {
        Ok(())
    } else {
        Err(garde::Error::new(format!("must be < 0, got {value}")))
    }
}

fn strictly_positive(value: &f64, _ctx: &()) -> garde::Result {
    if *value > 0.0 {
        Ok(())
    } else {
        Err(garde::Error::new(format!("must be > 0, got {value}")))
    }
}

fn validate_min_le_max(min: &f64) -> impl FnOnce(&f64, &()) -> garde::Result + '_ {
    move |max: &f64, (): &()| {
        if min > max {
            return Err(garde::Error::new(format!(
                "min position size ({min}) must be <= max position size ({max})"
            )));
        }
        Ok(())
    }
}

fn weights_sum_positive(weights: &HashMap<String, f64>, _ctx: &()) -> garde::Result {
    if weights.values().any(|w| *w < 0.0 || !w.is_finite()) {
        return Err(garde::Error::new("strategy weights must be finite and >= 0"));
    }
    if weights.values().sum::<f64>() <= 0.0 {
        return Err(garde::Error::new(
            "strategy weights must sum to a positive value",
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Validate)]
pub struct CorrelationThresholds {
    #[garde(custom(strictly_negative))]
    pub strong_negative: f64,
    #[garde(custom(strictly_positive))]
    pub strong_positive: f64,
}

impl Default for CorrelationThresholds {
    fn default() -> Self {
        CorrelationThresholds {
            strong_negative: -0.6,
            strong_positive: 0.6,
        }
    }
}

fn default_lookback_days() -> u32 {
    30
}

fn default_position_size() -> f64 {
    0.02
}

/// Common strategy configuration record. Strategy-specific knobs live under
/// `params` and are bound by each strategy's own validated parameter struct.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct StrategyConfig {
    #[garde(length(min = 1))]
    pub name: String,
    #[garde(length(min = 1), inner(length(min = 1)))]
    pub assets: Vec<String>,
    #[serde(default = "default_lookback_days")]
    #[garde(range(min = 1))]
    pub lookback_days: u32,
    #[serde(default)]
    #[garde(dive)]
    pub correlation_thresholds: CorrelationThresholds,
    #[serde(default = "default_position_size")]
    #[garde(custom(in_unit_open_closed))]
    pub position_size: f64,
    #[serde(default)]
    #[garde(skip)]
    pub params: serde_json::Value,
}

impl StrategyConfig {
    pub fn new(name: impl Into<String>, assets: Vec<String>) -> Self {
        StrategyConfig {
            name: name.into(),
            assets,
            lookback_days: default_lookback_days(),
            correlation_thresholds: CorrelationThresholds::default(),
            position_size: default_position_size(),
            params: serde_json::Value::Null,
        }
    }

    /// Bind the strategy-specific `params` block into a validated record.
    pub fn bind_params<T>(&self) -> Result<T>
    where
        T: DeserializeOwned + Validate<Context = ()> + Default,
    {
        let record: T = match &self.params {
            serde_json::Value::Null => T::default(),
            value => serde_json::from_value(value.clone()).map_err(|e| {
                Error::bad_config(format!("invalid parameters for '{}': {e}", self.name))
            })?,
        };
        validated(record)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    #[default]
    WeightedAverage,
    StrongestWins,
    Conservative,
    ConsensusThreshold,
    RiskWeighted,
}

fn default_min_confidence_threshold() -> f64 {
    0.1
}

fn default_max_position_size() -> f64 {
    0.10
}

fn default_min_position_size() -> f64 {
    0.005
}

fn default_consensus_threshold() -> f64 {
    0.7
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AggregatorConfig {
    #[garde(custom(weights_sum_positive))]
    pub strategy_weights: HashMap<String, f64>,
    #[serde(default = "default_min_confidence_threshold")]
    #[garde(range(min = 0.0, max = 1.0))]
    pub min_confidence_threshold: f64,
    #[serde(default)]
    #[garde(skip)]
    pub conflict_resolution: ConflictResolution,
    #[serde(default = "default_max_position_size")]
    #[garde(custom(in_unit_open_closed), custom(validate_min_le_max(&self.min_position_size)))]
    pub max_position_size: f64,
    #[serde(default = "default_min_position_size")]
    #[garde(custom(in_unit_open_closed))]
    pub min_position_size: f64,
    #[serde(default)]
    #[garde(skip)]
    pub require_majority_agreement: bool,
    #[serde(default = "default_consensus_threshold")]
    #[garde(custom(in_unit_open_closed))]
    pub consensus_threshold: f64,
}

impl AggregatorConfig {
    pub fn new(strategy_weights: HashMap<String, f64>) -> Self {
        AggregatorConfig {
            strategy_weights,
            min_confidence_threshold: default_min_confidence_threshold(),
            conflict_resolution: ConflictResolution::default(),
            max_position_size: default_max_position_size(),
            min_position_size: default_min_position_size(),
            require_majority_agreement: false,
            consensus_threshold: default_consensus_threshold(),
        }
    }
}

fn default_channel_min_confidence() -> f64 {
    0.6
}

fn default_enabled_assets() -> Vec<String> {
    vec!["bitcoin".into(), "ethereum".into()]
}

fn default_enabled_signal_types() -> Vec<SignalType> {
    vec![SignalType::Long, SignalType::Short]
}

fn default_rate_limit_seconds() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

/// Per-channel alert routing configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ChannelConfig {
    /// Opaque transport id (for webhooks, the webhook URL).
    #[garde(length(min = 1))]
    pub target: String,
    #[serde(default = "default_channel_min_confidence")]
    #[garde(range(min = 0.0, max = 1.0))]
    pub min_confidence: f64,
    #[serde(default)]
    #[garde(skip)]
    pub min_strength: SignalStrength,
    #[serde(default = "default_enabled_assets")]
    #[garde(skip)]
    pub enabled_assets: Vec<String>,
    #[serde(default = "default_enabled_signal_types")]
    #[garde(skip)]
    pub enabled_signal_types: Vec<SignalType>,
    #[serde(default = "default_rate_limit_seconds")]
    #[garde(range(min = 1))]
    pub rate_limit_seconds: u64,
    #[serde(default = "default_max_retries")]
    #[garde(skip)]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    #[garde(skip)]
    pub retry_delay_ms: u64,
}

impl ChannelConfig {
    pub fn new(target: impl Into<String>) -> Self {
        ChannelConfig {
            target: target.into(),
            min_confidence: default_channel_min_confidence(),
            min_strength: SignalStrength::default(),
            enabled_assets: default_enabled_assets(),
            enabled_signal_types: default_enabled_signal_types(),
            rate_limit_seconds: default_rate_limit_seconds(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }

    /// Bind a channel from `<CHANNEL>_*` environment variables. Returns
    /// `None` when the channel is absent or not enabled.
    pub fn from_env(channel: &str) -> Result<Option<Self>> {
        load_env();
        let prefix = channel.to_uppercase();
        let var = |suffix: &str| std::env::var(format!("{prefix}_{suffix}")).ok();

        let enabled = var("ENABLED")
            .map(|v| matches!(v.trim().to_lowercase().as_str(), "true" | "1" | "yes"))
            .unwrap_or(false);
        if !enabled {
            return Ok(None);
        }

        let target = var("TARGET").ok_or_else(|| {
            Error::bad_config(format!("{prefix}_ENABLED is set but {prefix}_TARGET is missing"))
        })?;

        let mut config = ChannelConfig::new(target);
        if let Some(raw) = var("MIN_CONFIDENCE") {
            config.min_confidence = raw.trim().parse().map_err(|_| {
                Error::bad_config(format!("{prefix}_MIN_CONFIDENCE is not a number: '{raw}'"))
            })?;
        }
        if let Some(raw) = var("MIN_STRENGTH") {
            config.min_strength = raw.parse()?;
        }
        if let Some(raw) = var("RATE_LIMIT_SECONDS") {
            config.rate_limit_seconds = raw.trim().parse().map_err(|_| {
                Error::bad_config(format!(
                    "{prefix}_RATE_LIMIT_SECONDS is not an integer: '{raw}'"
                ))
            })?;
        }

        validated(config).map(Some)
    }
}
