use garde::Validate;
use serde::{Deserialize, Serialize};

use super::helpers::{closes, latest_rsi, latest_sma};
use crate::config::StrategyConfig;
use crate::data::MarketSnapshot;
use crate::error::Result;
use crate::signals::registry::{AnalysisReport, Opportunity, Strategy};
use crate::signals::{Evidence, SignalDraft, SignalStrength, SignalType, TradingSignal};

/// Momentum strength below which neither direction is actionable.
const MOMENTUM_THRESHOLD: f64 = 0.01;
const MAX_RISK: f64 = 0.02;

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
pub struct MomentumParams {
    #[garde(range(min = 2))]
    pub short_window: usize,
    #[garde(range(min = 3))]
    pub long_window: usize,
    #[garde(range(min = 2))]
    pub rsi_window: usize,
    #[garde(range(min = 50.0, max = 100.0))]
    pub rsi_overbought: f64,
    #[garde(range(min = 0.0, max = 50.0))]
    pub rsi_oversold: f64,
    #[garde(custom(unit_open_closed))]
    pub base_position_size: f64,
    #[garde(custom(unit_open_closed))]
    pub max_position_size: f64,
    #[garde(range(min = 0.0, max = 1.0))]
    pub min_confidence: f64,
}

impl Default for MomentumParams {
    fn default() -> Self {
        MomentumParams {
            short_window: 10,
            long_window: 30,
            rsi_window: 14,
            rsi_overbought: 70.0,
            rsi_oversold: 30.0,
            base_position_size: 0.02,
            max_position_size: 0.05,
            min_confidence: 0.6,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
struct MomentumMetrics {
    short_ma: f64,
    long_ma: f64,
    rsi: f64,
    momentum_strength: f64,
    price_momentum: f64,
    ma_cross: bool,
    rsi_overbought: bool,
    rsi_oversold: bool,
}

/// Moving-average trend following with an RSI filter: LONG on an uptrend
/// that is not overbought, SHORT on a downtrend that is not oversold.
pub struct MomentumStrategy {
    name: String,
    assets: Vec<String>,
    params: MomentumParams,
}

pub fn construct(config: &StrategyConfig) -> Result<Box<dyn Strategy>> {
    Ok(Box::new(MomentumStrategy::from_config(config)?))
}

impl MomentumStrategy {
    pub fn from_config(config: &StrategyConfig) -> Result<Self> {
        let config = crate::config::validated(config.clone())?;
        let params: MomentumParams = config.bind_params()?;
        if params.long_window <= params.short_window {
            return Err(crate::error::Error::bad_config(format!(
                "long window ({}) must exceed short window ({})",
                params.long_window, params.short_window
            )));
        }
        Ok(MomentumStrategy {
            name: config.name,
            assets: config.assets,
            params,
        })
    }

    fn momentum_metrics(&self, prices: &[f64]) -> Option<MomentumMetrics> {
        if prices.len() < self.params.long_window {
            return None;
        }
        let short_ma = latest_sma(prices, self.params.short_window)?;
        let long_ma = latest_sma(prices, self.params.long_window)?;
        if long_ma == 0.0 {
            return None;
        }

        let rsi = latest_rsi(prices);
        let momentum_strength = (short_ma - long_ma) / long_ma;
        let base = prices[prices.len() - self.params.short_window];
        let price_momentum = if base > 0.0 {
            (prices[prices.len() - 1] - base) / base
        } else {
            0.0
        };

        Some(MomentumMetrics {
            short_ma,
            long_ma,
            rsi,
            momentum_strength,
            price_momentum,
            ma_cross: short_ma > long_ma,
            rsi_overbought: rsi > self.params.rsi_overbought,
            rsi_oversold: rsi < self.params.rsi_oversold,
        })
    }

    fn identify_opportunity(
        &self,
        asset: &str,
        price: f64,
        metrics: MomentumMetrics,
    ) -> Option<Opportunity> {
        let ms = metrics.momentum_strength;

        let (signal_type, stop_loss, take_profit, reason) =
            if metrics.ma_cross && !metrics.rsi_overbought && ms > MOMENTUM_THRESHOLD {
                (
                    SignalType::Long,
                    price * 0.95,
                    price * 1.15,
                    format!("Momentum uptrend: MA cross + {:.2}% strength", ms * 100.0),
                )
            } else if !metrics.ma_cross && !metrics.rsi_oversold && ms < -MOMENTUM_THRESHOLD {
                (
                    SignalType::Short,
                    price * 1.05,
                    price * 0.85,
                    format!("Momentum downtrend: MA cross + {:.2}% strength", ms * 100.0),
                )
            } else {
                return None;
            };

        let confidence = (0.6 + ms.abs() * 10.0).min(0.9);
        let position_size = (self.params.base_position_size * (1.0 + ms.abs() * 5.0))
            .min(self.params.max_position_size);
        let strength = if confidence >= 0.8 {
            SignalStrength::Strong
        } else if confidence >= 0.6 {
            SignalStrength::Moderate
        } else {
            SignalStrength::Weak
        };

        Some(Opportunity {
            asset: asset.to_string(),
            signal_type,
            signal_strength: strength,
            confidence,
            price,
            position_size: Some(position_size),
            stop_loss: Some(stop_loss),
            take_profit: Some(take_profit),
            correlation_value: None,
            evidence: Evidence::Momentum {
                momentum_strength: ms,
                rsi: metrics.rsi,
                short_ma: metrics.short_ma,
                long_ma: metrics.long_ma,
                reason,
            },
        })
    }
}

impl Strategy for MomentumStrategy {
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
                continue;
            }

            let prices = closes(bars);
            let price = *prices.last().expect("non-empty");
            let Some(metrics) = self.momentum_metrics(&prices) else {
                tracing::warn!(asset = %asset, points = prices.len(), "not enough history for momentum");
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
            "momentum analysis complete"
        );
        report.metadata = serde_json::json!({ "momentum_metrics": conditions });
        Ok(report)
    }

    fn generate_signals(&self, report: &AnalysisReport) -> Result<Vec<TradingSignal>> {
        let mut signals = Vec::new();
        for opportunity in &report.opportunities {
            if opportunity.confidence < self.params.min_confidence {
                continue;
            }

            let mut draft = SignalDraft::new(
                opportunity.asset.clone(),
                opportunity.signal_type,
                report.timestamp,
                opportunity.price,
                report.strategy_name.clone(),
                opportunity.signal_strength,
                opportunity.confidence,
                opportunity.position_size.unwrap_or(self.params.base_position_size),
            );
            draft.stop_loss = opportunity.stop_loss;
            draft.take_profit = opportunity.take_profit;
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
