use garde::Validate;
use serde::{Deserialize, Serialize};

use super::helpers::{
    clean_close_vix, drawdown_from_rolling_high, latest_rsi, percentile_rank_below,
    vix_position_adjustment,
};
use crate::config::StrategyConfig;
use crate::data::MarketSnapshot;
use crate::error::Result;
use crate::signals::registry::{AnalysisReport, Opportunity, Strategy};
use crate::signals::{Evidence, SignalDraft, SignalStrength, SignalType, TradingSignal};

const MIN_CLEAN_POINTS: usize = 5;
const ROLLING_HIGH_WINDOW: usize = 14;
const POSITION_CAP: f64 = 0.05;
const MAX_RISK: f64 = 0.03;

fn default_vix_spike_threshold() -> f64 {
    25.0
}

fn default_drawdown_threshold() -> f64 {
    0.10
}

fn positive(value: &f64, _ctx: &()) -> garde::Result {
    if *value > 0.0 {
        Ok(())
    } else {
        Err(garde::Error::new(format!("must be > 0, got {value}")))
    }
}

fn unit_fraction(value: &f64, _ctx: &()) -> garde::Result {
    if *value > 0.0 && *value < 1.0 {
        Ok(())
    } else {
        Err(garde::Error::new(format!(
            "must be in (0.0, 1.0), got {value}"
        )))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct MeanReversionParams {
    #[garde(custom(positive))]
    pub vix_spike_threshold: f64,
    #[garde(custom(unit_fraction))]
    pub drawdown_threshold: f64,
}

impl Default for MeanReversionParams {
    fn default() -> Self {
        MeanReversionParams {
            vix_spike_threshold: default_vix_spike_threshold(),
            drawdown_threshold: default_drawdown_threshold(),
        }
    }
}

/// LONG when a VIX spike coincides with a deep drawdown from the rolling
/// high. High fear plus oversold price is the mean-reversion setup.
pub struct MeanReversionStrategy {
    name: String,
    assets: Vec<String>,
    params: MeanReversionParams,
    lookback_days: u32,
    position_size: f64,
}

pub fn construct(config: &StrategyConfig) -> Result<Box<dyn Strategy>> {
    Ok(Box::new(MeanReversionStrategy::from_config(config)?))
}

#[derive(Debug, Clone, Serialize)]
struct ConditionAnalysis {
    meets_criteria: bool,
    reason: Option<&'static str>,
    current_vix: Option<f64>,
    vix_spike_detected: bool,
    current_price: Option<f64>,
    recent_high: Option<f64>,
    drawdown_from_high: Option<f64>,
    drawdown_condition_met: bool,
    vix_percentile: f64,
    price_rsi: f64,
    data_points: usize,
}

impl MeanReversionStrategy {
    pub fn from_config(config: &StrategyConfig) -> Result<Self> {
        let config = crate::config::validated(config.clone())?;
        let params: MeanReversionParams = config.bind_params()?;
        Ok(MeanReversionStrategy {
            name: config.name,
            assets: config.assets,
            params,
            lookback_days: config.lookback_days,
            position_size: config.position_size,
        })
    }

    fn analyze_conditions(&self, clean: &[(f64, f64)]) -> ConditionAnalysis {
        let empty = ConditionAnalysis {
            meets_criteria: false,
            reason: None,
            current_vix: None,
            vix_spike_detected: false,
            current_price: None,
            recent_high: None,
            drawdown_from_high: None,
            drawdown_condition_met: false,
            vix_percentile: 50.0,
            price_rsi: 50.0,
            data_points: clean.len(),
        };

        if clean.is_empty() {
            return ConditionAnalysis {
                reason: Some("NO_VIX_DATA"),
                ..empty
            };
        }
        if clean.len() < MIN_CLEAN_POINTS {
            return ConditionAnalysis {
                reason: Some("INSUFFICIENT_DATA"),
                ..empty
            };
        }

        let closes: Vec<f64> = clean.iter().map(|(c, _)| *c).collect();
        let vix: Vec<f64> = clean.iter().map(|(_, v)| *v).collect();
        let current_vix = *vix.last().expect("non-empty");
        let current_price = *closes.last().expect("non-empty");

        // Strict comparators: exactly at threshold does not trigger.
        let vix_spike_detected = current_vix > self.params.vix_spike_threshold;

        let window = clean.len().min(ROLLING_HIGH_WINDOW);
        let (recent_high, drawdown) =
            drawdown_from_rolling_high(&closes, window).unwrap_or((current_price, 0.0));
        let drawdown_condition_met = drawdown > self.params.drawdown_threshold;

        ConditionAnalysis {
            meets_criteria: vix_spike_detected && drawdown_condition_met,
            reason: None,
            current_vix: Some(current_vix),
            vix_spike_detected,
            current_price: Some(current_price),
            recent_high: Some(recent_high),
            drawdown_from_high: Some(drawdown),
            drawdown_condition_met,
            vix_percentile: percentile_rank_below(&vix, current_vix),
            price_rsi: latest_rsi(&closes),
            data_points: clean.len(),
        }
    }

    fn evaluate_opportunity(&self, asset: &str, analysis: &ConditionAnalysis) -> Option<Opportunity> {
        let vix = analysis.current_vix?;
        let price = analysis.current_price?;
        let drawdown = analysis.drawdown_from_high?;

        // Confidence is the mean of four bounded factors.
        let vix_factor = ((vix - self.params.vix_spike_threshold) / 10.0).clamp(0.0, 1.0);
        let drawdown_factor =
            ((drawdown - self.params.drawdown_threshold) / 0.10).clamp(0.0, 1.0);
        let percentile_factor = analysis.vix_percentile / 100.0;
        let rsi_factor = ((30.0 - analysis.price_rsi) / 30.0).max(0.0).max(0.1);

        let confidence = (vix_factor + drawdown_factor + percentile_factor + rsi_factor) / 4.0;

        let signal_strength = if confidence > 0.7 {
            SignalStrength::Strong
        } else if confidence > 0.5 {
            SignalStrength::Moderate
        } else {
            SignalStrength::Weak
        };

        let vix_adjustment = vix_position_adjustment(vix, 15.0);
        let confidence_adjustment = 0.5 + confidence * 0.5;
        let stop_loss_pct = 0.03 + drawdown * 0.5;
        let take_profit_pct = drawdown * 0.6;

        Some(Opportunity {
            asset: asset.to_string(),
            signal_type: SignalType::Long,
            signal_strength,
            confidence,
            price,
            position_size: None,
            stop_loss: None,
            take_profit: None,
            correlation_value: None,
            evidence: Evidence::MeanReversion {
                vix_level: vix,
                drawdown_from_high: drawdown,
                vix_percentile: analysis.vix_percentile,
                price_rsi: analysis.price_rsi,
                vix_adjustment_factor: vix_adjustment,
                confidence_adjustment_factor: confidence_adjustment,
                stop_loss_pct,
                take_profit_pct,
            },
        })
    }
}

impl Strategy for MeanReversionStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn assets(&self) -> &[String] {
        &self.assets
    }

    fn analyze(&self, snapshot: &MarketSnapshot) -> Result<AnalysisReport> {
        let mut report = AnalysisReport::new(snapshot.as_of, self.name.clone());
        let mut per_asset = serde_json::Map::new();

        for asset in &self.assets {
            let Some(bars) = snapshot.asset(asset) else {
                tracing::warn!(asset = %asset, "no data available");
                continue;
            };
            if bars.is_empty() {
                tracing::warn!(asset = %asset, "no data available");
                continue;
            }

            let clean = clean_close_vix(bars);
            let analysis = self.analyze_conditions(&clean);
            if analysis.meets_criteria {
                if let Some(opportunity) = self.evaluate_opportunity(asset, &analysis) {
                    report.opportunities.push(opportunity);
                }
            }
            if let Ok(value) = serde_json::to_value(&analysis) {
                per_asset.insert(asset.clone(), value);
            }
        }

        tracing::info!(
            strategy = %self.name,
            analyzed = per_asset.len(),
            opportunities = report.opportunities.len(),
            "mean reversion analysis complete"
        );
        report.metadata = serde_json::json!({ "market_analysis": per_asset });
        Ok(report)
    }

    fn generate_signals(&self, report: &AnalysisReport) -> Result<Vec<TradingSignal>> {
        let mut signals = Vec::new();
        for opportunity in &report.opportunities {
            let Evidence::MeanReversion {
                vix_level,
                drawdown_from_high,
                vix_adjustment_factor,
                confidence_adjustment_factor,
                stop_loss_pct,
                take_profit_pct,
                ..
            } = &opportunity.evidence
            else {
                continue;
            };

            let price = opportunity.price;
            let position_size = (self.position_size
                * vix_adjustment_factor
                * confidence_adjustment_factor)
                .min(POSITION_CAP);

            let mut draft = SignalDraft::new(
                opportunity.asset.clone(),
                SignalType::Long,
                report.timestamp,
                price,
                report.strategy_name.clone(),
                opportunity.signal_strength,
                opportunity.confidence,
                position_size,
            );
            draft.stop_loss = Some(price * (1.0 - stop_loss_pct));
            draft.take_profit = Some(price * (1.0 + take_profit_pct));
            draft.max_risk = Some(MAX_RISK);
            draft.analysis_data = Some(opportunity.evidence.clone());

            match draft.build() {
                Ok(signal) => {
                    tracing::info!(
                        asset = %signal.asset,
                        vix = *vix_level,
                        drawdown = *drawdown_from_high,
                        confidence = signal.confidence,
                        "generated mean reversion signal"
                    );
                    signals.push(signal);
                }
                Err(e) => {
                    tracing::error!(asset = %opportunity.asset, error = %e, "failed to build signal");
                }
            }
        }
        Ok(signals)
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "strategy_name": self.name,
            "assets": self.assets,
            "vix_spike_threshold": self.params.vix_spike_threshold,
            "drawdown_threshold": self.params.drawdown_threshold,
            "lookback_days": self.lookback_days,
            "position_size": self.position_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{day_start_ms, CombinedBar};
    use chrono::NaiveDate;

    fn strategy() -> MeanReversionStrategy {
        let mut config = StrategyConfig::new("mean_reversion", vec!["bitcoin".into()]);
        config.lookback_days = 14;
        config.position_size = 0.025;
        MeanReversionStrategy::from_config(&config).unwrap()
    }

    fn snapshot_with(closes: &[f64], vix: f64) -> MarketSnapshot {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let mut snapshot = MarketSnapshot::new(day_start_ms(start));
        let bars: Vec<CombinedBar> = closes
            .iter()
            .enumerate()
            .map(|(i, close)| {
                let date = start + chrono::Duration::days(i as i64);
                CombinedBar {
                    date,
                    timestamp: day_start_ms(date),
                    open: *close,
                    high: close * 1.005,
                    low: close * 0.995,
                    close: *close,
                    volume: 1_000.0,
                    vix_value: Some(vix),
                    fed_funds_rate: None,
                    treasury_10y_rate: None,
                    dollar_index: None,
                }
            })
            .collect();
        snapshot.series.insert("bitcoin".into(), bars);
        snapshot
    }

    fn declining_closes() -> Vec<f64> {
        // Linear decline 50000 -> 42500: 15% drawdown from the rolling high.
        (0..14)
            .map(|i| 50_000.0 - f64::from(i) * (7_500.0 / 13.0))
            .collect()
    }

    #[test]
    fn spike_plus_drawdown_goes_long() {
        let strategy = strategy();
        let report = strategy.analyze(&snapshot_with(&declining_closes(), 30.0)).unwrap();
        assert_eq!(report.opportunities.len(), 1);
        let opp = &report.opportunities[0];
        assert_eq!(opp.signal_type, SignalType::Long);

        match &opp.evidence {
            Evidence::MeanReversion {
                vix_level,
                drawdown_from_high,
                ..
            } => {
                assert!(*vix_level >= 25.0);
                assert!(*drawdown_from_high >= 0.10);
            }
            other => panic!("unexpected evidence: {other:?}"),
        }

        let signals = strategy.generate_signals(&report).unwrap();
        assert_eq!(signals.len(), 1);
        let signal = &signals[0];
        assert!(signal.take_profit.unwrap() > signal.price);
        assert!(signal.stop_loss.unwrap() < signal.price);
        assert!(signal.position_size <= 0.05);
    }

    #[test]
    fn vix_exactly_at_threshold_does_not_trigger() {
        let strategy = strategy();
        let report = strategy.analyze(&snapshot_with(&declining_closes(), 25.0)).unwrap();
        assert!(report.opportunities.is_empty());
    }

    #[test]
    fn drawdown_exactly_at_threshold_does_not_trigger() {
        let strategy = strategy();
        // Exactly 10% below the high.
        let mut closes = vec![50_000.0; 13];
        closes.push(45_000.0);
        let report = strategy.analyze(&snapshot_with(&closes, 30.0)).unwrap();
        assert!(report.opportunities.is_empty());
    }

    #[test]
    fn calm_vix_emits_nothing() {
        let strategy = strategy();
        let report = strategy.analyze(&snapshot_with(&declining_closes(), 15.0)).unwrap();
        assert!(report.opportunities.is_empty());
    }

    #[test]
    fn too_few_clean_rows_reports_insufficient_data() {
        let strategy = strategy();
        let report = strategy
            .analyze(&snapshot_with(&[50_000.0, 48_000.0, 44_000.0], 30.0))
            .unwrap();
        assert!(report.opportunities.is_empty());
        assert_eq!(
            report.metadata["market_analysis"]["bitcoin"]["reason"],
            "INSUFFICIENT_DATA"
        );
    }

    #[test]
    fn confidence_stays_in_unit_interval() {
        let strategy = strategy();
        let report = strategy.analyze(&snapshot_with(&declining_closes(), 60.0)).unwrap();
        let opp = &report.opportunities[0];
        assert!(opp.confidence > 0.0 && opp.confidence <= 1.0);
    }

    #[test]
    fn params_reject_bad_thresholds() {
        let mut config = StrategyConfig::new("mean_reversion", vec!["bitcoin".into()]);
        config.params = serde_json::json!({ "drawdown_threshold": 1.5 });
        assert!(MeanReversionStrategy::from_config(&config).is_err());
    }
}
