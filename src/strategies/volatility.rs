use garde::Validate;
use serde::{Deserialize, Serialize};

use super::helpers::{closes, log_returns};
use crate::analytics::{mean, percentile, sample_std};
use crate::config::StrategyConfig;
use crate::data::MarketSnapshot;
use crate::error::Result;
use crate::signals::registry::{AnalysisReport, Opportunity, Strategy};
use crate::signals::{Evidence, SignalDraft, SignalStrength, SignalType, TradingSignal};

const ANNUALIZATION: f64 = 252.0;
const MIN_VOL_SAMPLES: usize = 5;
const MAX_RISK: f64 = 0.02;

fn percentile_range(value: &f64, _ctx: &()) -> garde::Result {
    if *value > 0.0 && *value < 100.0 {
        Ok(())
    } else {
        Err(garde::Error::new(format!(
            "percentile must be in (0, 100), got {value}"
        )))
    }
}

fn unit_open_closed(value: &f64, _ctx: &()) -> garde::Result {
    if *value > 0.0 && *value <= 1.0 {
        Ok(())
    } else {
        Err(garde::Error::new(format!(
            "must be in (0.0, 1.0], got {value}"
        )))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct VolatilityParams {
    /// Sampling window in minutes; metadata only for daily fixtures.
    #[garde(range(min = 1))]
    pub volatility_window: u32,
    #[garde(range(min = 1))]
    pub historical_hours: u32,
    #[garde(custom(percentile_range))]
    pub volatility_threshold_percentile: f64,
    #[garde(custom(percentile_range))]
    pub extreme_volatility_percentile: f64,
    #[garde(custom(unit_open_closed))]
    pub base_position_size: f64,
    #[garde(custom(unit_open_closed))]
    pub max_position_size: f64,
    #[garde(range(min = 0.0, max = 1.0))]
    pub min_confidence: f64,
}

impl Default for VolatilityParams {
    fn default() -> Self {
        VolatilityParams {
            volatility_window: 15,
            historical_hours: 24,
            volatility_threshold_percentile: 90.0,
            extreme_volatility_percentile: 95.0,
            base_position_size: 0.02,
            max_position_size: 0.05,
            min_confidence: 0.6,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
struct VolatilityMetrics {
    current_volatility: f64,
    historical_threshold: f64,
    extreme_threshold: f64,
    volatility_ratio: f64,
    historical_mean: f64,
    historical_std: f64,
}

/// Volatility breakout: LONG between the 90th and 95th percentile of the
/// asset's own annualized volatility history, SHORT above the 95th
/// (stretched moves tend to snap back).
pub struct VolatilityStrategy {
    name: String,
    assets: Vec<String>,
    params: VolatilityParams,
}

pub fn construct(config: &StrategyConfig) -> Result<Box<dyn Strategy>> {
    Ok(Box::new(VolatilityStrategy::from_config(config)?))
}

impl VolatilityStrategy {
    pub fn from_config(config: &StrategyConfig) -> Result<Self> {
        let config = crate::config::validated(config.clone())?;
        let params: VolatilityParams = config.bind_params()?;
        if params.extreme_volatility_percentile <= params.volatility_threshold_percentile {
            return Err(crate::error::Error::bad_config(format!(
                "extreme percentile ({}) must exceed threshold percentile ({})",
                params.extreme_volatility_percentile, params.volatility_threshold_percentile
            )));
        }
        Ok(VolatilityStrategy {
            name: config.name,
            assets: config.assets,
            params,
        })
    }

    fn volatility_metrics(&self, prices: &[f64]) -> Option<VolatilityMetrics> {
        let returns = log_returns(prices);
        if returns.is_empty() {
            return None;
        }

        let window = (prices.len() / 20).max(MIN_VOL_SAMPLES);
        if returns.len() < window {
            return None;
        }

        let history: Vec<f64> = returns
            .windows(window)
            .map(|w| sample_std(w) * ANNUALIZATION.sqrt())
            .filter(|v| v.is_finite())
            .collect();
        if history.len() < MIN_VOL_SAMPLES {
            return None;
        }

        let current = *history.last()?;
        let historical_threshold = percentile(&history, self.params.volatility_threshold_percentile)?;
        let extreme_threshold = percentile(&history, self.params.extreme_volatility_percentile)?;
        let historical_mean = mean(&history);
        if current == 0.0 || historical_threshold == 0.0 || historical_mean == 0.0 {
            return None;
        }

        Some(VolatilityMetrics {
            current_volatility: current,
            historical_threshold,
            extreme_threshold,
            volatility_ratio: current / historical_mean,
            historical_mean,
            historical_std: sample_std(&history),
        })
    }

    fn identify_opportunity(
        &self,
        asset: &str,
        price: f64,
        metrics: VolatilityMetrics,
    ) -> Option<Opportunity> {
        let vol = metrics.current_volatility;
        let ratio = metrics.volatility_ratio;

        // Breakout band is (p90, p95]; beyond p95 the move is treated as a
        // reversal candidate.
        let (signal_type, strength, confidence, threshold, reason) =
            if vol > metrics.historical_threshold && vol <= metrics.extreme_threshold {
                let strength = (ratio / 2.0).min(1.0);
                let confidence = (0.6 + strength * 0.3).min(0.9);
                (
                    SignalType::Long,
                    strength,
                    confidence,
                    metrics.historical_threshold,
                    format!(
                        "Volatility breakout: {:.2}% > {:.2}% threshold",
                        vol * 100.0,
                        metrics.historical_threshold * 100.0
                    ),
                )
            } else if vol > metrics.extreme_threshold {
                let strength = (ratio / 3.0).min(1.0);
                let confidence = (0.5 + strength * 0.3).min(0.8);
                (
                    SignalType::Short,
                    strength,
                    confidence,
                    metrics.extreme_threshold,
                    format!(
                        "Extreme volatility: {:.2}% > {:.2}% extreme threshold",
                        vol * 100.0,
                        metrics.extreme_threshold * 100.0
                    ),
                )
            } else {
                return None;
            };

        let strength_enum = if strength >= 0.8 {
            SignalStrength::Strong
        } else if strength >= 0.6 {
            SignalStrength::Moderate
        } else {
            SignalStrength::Weak
        };

        Some(Opportunity {
            asset: asset.to_string(),
            signal_type,
            signal_strength: strength_enum,
            confidence,
            price,
            position_size: Some(
                (self.params.base_position_size * strength * confidence)
                    .min(self.params.max_position_size),
            ),
            stop_loss: None,
            take_profit: None,
            correlation_value: None,
            evidence: Evidence::Volatility {
                volatility: vol,
                volatility_threshold: threshold,
                volatility_ratio: ratio,
                volatility_window_minutes: self.params.volatility_window,
                reason,
            },
        })
    }

    fn risk_levels(price: f64, signal_type: SignalType, volatility: f64) -> (f64, f64) {
        // Wider stops in more volatile regimes.
        let multiplier = (volatility * 100.0).clamp(1.0, 3.0);
        match signal_type {
            SignalType::Short => (
                price * (1.0 + 0.02 * multiplier),
                price * (1.0 - 0.04 * multiplier),
            ),
            _ => (
                price * (1.0 - 0.02 * multiplier),
                price * (1.0 + 0.04 * multiplier),
            ),
        }
    }
}

impl Strategy for VolatilityStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn assets(&self) -> &[String] {
        &self.assets
    }

    fn analyze(&self, snapshot: &MarketSnapshot) -> Result<AnalysisReport> {
        let mut report = AnalysisReport::new(snapshot.as_of, self.name.clone());
        let mut conditions = serde_json::Map::new();

        for asset in &self.assets {
            let Some(bars) = snapshot.asset(asset) else {
                tracing::warn!(asset = %asset, "no market data available");
                continue;
            };
            if bars.is_empty() {
                tracing::warn!(asset = %asset, "empty series");
                continue;
            }

            let prices = closes(bars);
            let price = *prices.last().expect("non-empty");
            let Some(metrics) = self.volatility_metrics(&prices) else {
                tracing::warn!(asset = %asset, "insufficient data for volatility calculation");
                continue;
            };

            if let Some(opportunity) = self.identify_opportunity(asset, price, metrics) {
                report.opportunities.push(opportunity);
            }
            if let Ok(value) = serde_json::to_value(metrics) {
                conditions.insert(asset.clone(), value);
            }
        }

        tracing::info!(
            strategy = %self.name,
            opportunities = report.opportunities.len(),
            "volatility analysis complete"
        );
        report.metadata = serde_json::json!({ "market_conditions": conditions });
        Ok(report)
    }

    fn generate_signals(&self, report: &AnalysisReport) -> Result<Vec<TradingSignal>> {
        let mut signals = Vec::new();
        for opportunity in &report.opportunities {
            if opportunity.confidence < self.params.min_confidence {
                continue;
            }
            let Evidence::Volatility { volatility, .. } = &opportunity.evidence else {
                continue;
            };

            let price = opportunity.price;
            let (stop_loss, take_profit) =
                Self::risk_levels(price, opportunity.signal_type, *volatility);

            let mut draft = SignalDraft::new(
                opportunity.asset.clone(),
                opportunity.signal_type,
                report.timestamp,
                price,
                report.strategy_name.clone(),
                opportunity.signal_strength,
                opportunity.confidence,
                opportunity.position_size.unwrap_or(self.params.base_position_size),
            );
            draft.stop_loss = Some(stop_loss);
            draft.take_profit = Some(take_profit);
            draft.max_risk = Some(MAX_RISK);
            draft.analysis_data = Some(opportunity.evidence.clone());

            match draft.build() {
                Ok(signal) => signals.push(signal),
                Err(e) => {
                    tracing::error!(asset = %opportunity.asset, error = %e, "failed to build signal");
                }
            }
        }
        Ok(signals)
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::to_value(&self.params).unwrap_or(serde_json::Value::Null)
    }
}
