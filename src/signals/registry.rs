use rustc_hash::FxHashMap;

use super::{Evidence, SignalStrength, SignalType, TradingSignal};
use crate::config::StrategyConfig;
use crate::data::MarketSnapshot;
use crate::error::{Error, Result};

/// One candidate trade surfaced by `Strategy::analyze`. Position sizing and
/// risk levels are filled either here (strategies that size during analysis)
/// or later in `generate_signals`.
#[derive(Debug, Clone)]
pub struct Opportunity {
    pub asset: String,
    pub signal_type: SignalType,
    pub signal_strength: SignalStrength,
    pub confidence: f64,
    pub price: f64,
    pub position_size: Option<f64>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub correlation_value: Option<f64>,
    pub evidence: Evidence,
}

/// Structured output of one `analyze` pass.
#[derive(Debug, Clone)]
pub struct AnalysisReport {
    /// Millisecond timestamp the analysis represents; stamped onto signals.
    pub timestamp: i64,
    pub strategy_name: String,
    pub opportunities: Vec<Opportunity>,
    /// Per-strategy summary (per-asset analysis, regime state, risk summary).
    pub metadata: serde_json::Value,
}

impl AnalysisReport {
    pub fn new(timestamp: i64, strategy_name: impl Into<String>) -> Self {
        AnalysisReport {
            timestamp,
            strategy_name: strategy_name.into(),
            opportunities: Vec::new(),
            metadata: serde_json::Value::Null,
        }
    }
}

/// Uniform strategy contract. `analyze` is a pure function of the snapshot;
/// per-asset failures are logged and skipped, never raised. `generate_signals`
/// turns the report's opportunities into validated signals.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;

    fn assets(&self) -> &[String];

    fn analyze(&self, snapshot: &MarketSnapshot) -> Result<AnalysisReport>;

    fn generate_signals(&self, report: &AnalysisReport) -> Result<Vec<TradingSignal>>;

    /// Parameter reflection for logging.
    fn parameters(&self) -> serde_json::Value;
}

pub type StrategyConstructor = fn(&StrategyConfig) -> Result<Box<dyn Strategy>>;

/// Registry mapping normalized strategy names to constructors. Discovery is
/// explicit registration at startup; names are normalized by lowercasing and
/// stripping `_`/`-` separators so `VIX_Correlation`, `vix-correlation` and
/// `vixcorrelation` all resolve to the same entry.
#[derive(Default)]
pub struct StrategyRegistry {
    strategies: FxHashMap<String, StrategyConstructor>,
}

fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| *c != '_' && *c != '-')
        .collect::<String>()
        .to_lowercase()
}

impl StrategyRegistry {
    pub fn new() -> Self {
        StrategyRegistry::default()
    }

    /// Registry pre-loaded with the five built-in strategies.
    pub fn with_builtins() -> Self {
        let mut registry = StrategyRegistry::new();
        registry.register("vix_correlation", crate::strategies::vix_correlation::construct);
        registry.register("mean_reversion", crate::strategies::mean_reversion::construct);
        registry.register("volatility", crate::strategies::volatility::construct);
        registry.register("momentum", crate::strategies::momentum::construct);
        registry.register("multi_bucket", crate::strategies::multi_bucket::construct);
        registry
    }

    pub fn register(&mut self, name: &str, constructor: StrategyConstructor) {
        self.strategies.insert(normalize(name), constructor);
    }

    /// Instantiate a ready-to-use strategy from its configuration record.
    pub fn build(&self, name: &str, config: &StrategyConfig) -> Result<Box<dyn Strategy>> {
        let key = normalize(name);
        let constructor = self.strategies.get(&key).ok_or_else(|| {
            Error::bad_config(format!(
                "strategy '{name}' not found in registry; available: {:?}",
                self.names()
            ))
        })?;
        constructor(config)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.strategies.contains_key(&normalize(name))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.strategies.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_separators() {
        assert_eq!(normalize("VIX_Correlation"), "vixcorrelation");
        assert_eq!(normalize("mean-reversion"), "meanreversion");
        assert_eq!(normalize("Momentum"), "momentum");
    }

    #[test]
    fn builtins_are_registered() {
        let registry = StrategyRegistry::with_builtins();
        assert_eq!(registry.names().len(), 5);
        assert!(registry.contains("vix_correlation"));
        assert!(registry.contains("VIX-Correlation"));
        assert!(registry.contains("multibucket"));
    }

    #[test]
    fn unknown_strategy_is_bad_config() {
        let registry = StrategyRegistry::with_builtins();
        let config = StrategyConfig::new("nope", vec!["bitcoin".into()]);
        let Err(err) = registry.build("does_not_exist", &config) else {
            panic!("expected build to fail for unknown strategy");
        };
        assert!(matches!(err, Error::BadConfig(_)));
        assert!(err.to_string().contains("does_not_exist"));
    }

    #[test]
    fn build_returns_configured_strategy() {
        let registry = StrategyRegistry::with_builtins();
        let config = StrategyConfig::new("vix_correlation", vec!["bitcoin".into()]);
        let strategy = registry.build("VIX_Correlation", &config).unwrap();
        assert_eq!(strategy.name(), "vix_correlation");
        assert_eq!(strategy.assets(), ["bitcoin".to_string()]);
    }
}
