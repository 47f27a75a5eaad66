use std::collections::BTreeMap;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::helpers::{clean_close_vix, vix_position_adjustment};
use crate::analytics::pearson;
use crate::config::{CorrelationThresholds, StrategyConfig};
use crate::data::MarketSnapshot;
use crate::error::Result;
use crate::signals::registry::{AnalysisReport, Opportunity, Strategy};
use crate::signals::{
    CorrelationStrength, Evidence, SignalDraft, SignalStrength, SignalType, TradingSignal,
};

const CORRELATION_WINDOWS: [usize; 4] = [7, 14, 21, 30];
const MIN_CLEAN_POINTS: usize = 10;
const MAX_RISK: f64 = 0.02;

/// LONG when the VIX-crypto correlation is strongly negative, SHORT when it
/// is strongly positive; rolling windows capture changing dynamics.
pub struct VixCorrelationStrategy {
    name: String,
    assets: Vec<String>,
    thresholds: CorrelationThresholds,
    lookback_days: u32,
    position_size: f64,
}

pub fn construct(config: &StrategyConfig) -> Result<Box<dyn Strategy>> {
    Ok(Box::new(VixCorrelationStrategy::from_config(config)?))
}

/// Per-asset correlation analysis attached to the report metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationAnalysis {
    pub current_correlation: Option<f64>,
    pub correlation_strength: CorrelationStrength,
    pub correlations_by_window: BTreeMap<String, f64>,
    pub data_points: usize,
    pub vix_availability: f64,
    pub latest_vix: Option<f64>,
    pub latest_price: Option<f64>,
}

impl VixCorrelationStrategy {
    pub fn from_config(config: &StrategyConfig) -> Result<Self> {
        let config = crate::config::validated(config.clone())?;
        Ok(VixCorrelationStrategy {
            name: config.name,
            assets: config.assets,
            thresholds: config.correlation_thresholds,
            lookback_days: config.lookback_days,
            position_size: config.position_size,
        })
    }

    pub fn lookback_days(&self) -> u32 {
        self.lookback_days
    }

    fn analyze_asset(&self, bars: &[(f64, f64)], total_rows: usize) -> CorrelationAnalysis {
        if bars.len() < MIN_CLEAN_POINTS {
            return CorrelationAnalysis {
                current_correlation: None,
                correlation_strength: CorrelationStrength::InsufficientData,
                correlations_by_window: BTreeMap::new(),
                data_points: bars.len(),
                vix_availability: if total_rows == 0 {
                    0.0
                } else {
                    bars.len() as f64 / total_rows as f64
                },
                latest_vix: bars.last().map(|(_, v)| *v),
                latest_price: bars.last().map(|(c, _)| *c),
            };
        }

        let closes: Vec<f64> = bars.iter().map(|(c, _)| *c).collect();
        let vix: Vec<f64> = bars.iter().map(|(_, v)| *v).collect();

        let mut by_window = BTreeMap::new();
        for window in CORRELATION_WINDOWS {
            if bars.len() >= window {
                let start = bars.len() - window;
                if let Some(r) = pearson(&closes[start..], &vix[start..]) {
                    by_window.insert(format!("{window}d_correlation"), r);
                }
            }
        }

        // Longest fitting window wins as the current value.
        let current = CORRELATION_WINDOWS
            .iter()
            .rev()
            .find_map(|w| by_window.get(&format!("{w}d_correlation")).copied());

        CorrelationAnalysis {
            current_correlation: current,
            correlation_strength: CorrelationStrength::classify(current),
            correlations_by_window: by_window,
            data_points: bars.len(),
            vix_availability: bars.len() as f64 / total_rows as f64,
            latest_vix: vix.last().copied(),
            latest_price: closes.last().copied(),
        }
    }

    fn evaluate_opportunity(
        &self,
        asset: &str,
        analysis: &CorrelationAnalysis,
    ) -> Option<Opportunity> {
        let correlation = analysis.current_correlation?;
        let price = analysis.latest_price?;
        let vix = analysis.latest_vix?;

        let (signal_type, confidence) = if correlation <= self.thresholds.strong_negative {
            // Crypto moving opposite the fear gauge: long the dip.
            let confidence = (correlation.abs() / self.thresholds.strong_negative.abs()).min(1.0);
            (SignalType::Long, confidence)
        } else if correlation >= self.thresholds.strong_positive {
            let confidence = (correlation / self.thresholds.strong_positive).min(1.0);
            (SignalType::Short, confidence)
        } else {
            return None;
        };

        let signal_strength = if confidence > 0.8 {
            SignalStrength::Strong
        } else {
            SignalStrength::Moderate
        };

        Some(Opportunity {
            asset: asset.to_string(),
            signal_type,
            signal_strength,
            confidence,
            price,
            position_size: None,
            stop_loss: None,
            take_profit: None,
            correlation_value: Some(correlation),
            evidence: Evidence::VixCorrelation {
                vix_level: vix,
                correlation_strength: analysis.correlation_strength,
                vix_adjustment_factor: vix_position_adjustment(vix, 10.0),
            },
        })
    }
}

impl Strategy for VixCorrelationStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn assets(&self) -> &[String] {
        &self.assets
    }

    fn analyze(&self, snapshot: &MarketSnapshot) -> Result<AnalysisReport> {
        let mut report = AnalysisReport::new(snapshot.as_of, self.name.clone());

        let analyses: Vec<(String, usize, CorrelationAnalysis)> = self
            .assets
            .par_iter()
            .filter_map(|asset| {
                let bars = snapshot.asset(asset)?;
                if bars.is_empty() {
                    tracing::warn!(asset = %asset, "no data available");
                    return None;
                }
                let clean = clean_close_vix(bars);
                Some((asset.clone(), bars.len(), self.analyze_asset(&clean, bars.len())))
            })
            .collect();

        let mut per_asset = serde_json::Map::new();
        for (asset, _, analysis) in &analyses {
            if let Some(opportunity) = self.evaluate_opportunity(asset, analysis) {
                report.opportunities.push(opportunity);
            }
            if let Ok(value) = serde_json::to_value(analysis) {
                per_asset.insert(asset.clone(), value);
            }
        }

        tracing::info!(
            strategy = %self.name,
            analyzed = per_asset.len(),
            opportunities = report.opportunities.len(),
            "correlation analysis complete"
        );
        report.metadata = serde_json::json!({ "correlation_analysis": per_asset });
        Ok(report)
    }

    fn generate_signals(&self, report: &AnalysisReport) -> Result<Vec<TradingSignal>> {
        let mut signals = Vec::new();
        for opportunity in &report.opportunities {
            let Evidence::VixCorrelation {
                vix_adjustment_factor,
                ..
            } = &opportunity.evidence
            else {
                continue;
            };

            let price = opportunity.price;
            let (stop_loss, take_profit) = match opportunity.signal_type {
                SignalType::Long => (price * 0.95, price * 1.10),
                SignalType::Short => (price * 1.05, price * 0.90),
                _ => continue,
            };

            let mut draft = SignalDraft::new(
                opportunity.asset.clone(),
                opportunity.signal_type,
                report.timestamp,
                price,
                report.strategy_name.clone(),
                opportunity.signal_strength,
                opportunity.confidence,
                self.position_size * vix_adjustment_factor,
            );
            draft.stop_loss = Some(stop_loss);
            draft.take_profit = Some(take_profit);
            draft.max_risk = Some(MAX_RISK);
            draft.correlation_value = opportunity.correlation_value;
            draft.analysis_data = Some(opportunity.evidence.clone());

            match draft.build() {
                Ok(signal) => {
                    tracing::info!(
                        asset = %signal.asset,
                        signal_type = %signal.signal_type,
                        correlation = ?signal.correlation_value,
                        confidence = signal.confidence,
                        "generated signal"
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
            "correlation_thresholds": {
                "strong_negative": self.thresholds.strong_negative,
                "strong_positive": self.thresholds.strong_positive,
            },
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

    fn strategy() -> VixCorrelationStrategy {
        let config = StrategyConfig::new("vix_correlation", vec!["bitcoin".into()]);
        VixCorrelationStrategy::from_config(&config).unwrap()
    }

    fn snapshot_with(closes_vix: &[(f64, f64)]) -> MarketSnapshot {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let mut snapshot = MarketSnapshot::new(day_start_ms(start));
        let bars: Vec<CombinedBar> = closes_vix
            .iter()
            .enumerate()
            .map(|(i, (close, vix))| {
                let date = start + chrono::Duration::days(i as i64);
                CombinedBar {
                    date,
                    timestamp: day_start_ms(date),
                    open: *close,
                    high: close * 1.01,
                    low: close * 0.99,
                    close: *close,
                    volume: 1_000.0,
                    vix_value: Some(*vix),
                    fed_funds_rate: None,
                    treasury_10y_rate: None,
                    dollar_index: None,
                }
            })
            .collect();
        snapshot.series.insert("bitcoin".into(), bars);
        snapshot
    }

    /// Synthetic anti-correlated series: close falls exactly as VIX rises.
    fn negative_corr_snapshot() -> MarketSnapshot {
        let rows: Vec<(f64, f64)> = (0..30)
            .map(|i| {
                let vix = 20.0 + (i as f64 % 10.0);
                let close = 50_000.0 - 1_000.0 * (vix - 20.0) + (i as f64) * 0.5;
                (close, vix)
            })
            .collect();
        snapshot_with(&rows)
    }

    #[test]
    fn strong_negative_correlation_goes_long() {
        let strategy = strategy();
        let report = strategy.analyze(&negative_corr_snapshot()).unwrap();
        assert_eq!(report.opportunities.len(), 1);
        let opp = &report.opportunities[0];
        assert_eq!(opp.signal_type, SignalType::Long);
        assert!(opp.correlation_value.unwrap() < -0.6);
        assert!(opp.confidence > 0.0 && opp.confidence <= 1.0);

        let signals = strategy.generate_signals(&report).unwrap();
        assert_eq!(signals.len(), 1);
        let signal = &signals[0];
        assert_eq!(signal.stop_loss, Some(signal.price * 0.95));
        assert_eq!(signal.take_profit, Some(signal.price * 1.10));
        assert_eq!(signal.max_risk, Some(0.02));
    }

    #[test]
    fn positive_correlation_goes_short() {
        let strategy = strategy();
        let rows: Vec<(f64, f64)> = (0..30)
            .map(|i| {
                let vix = 20.0 + (i as f64 % 10.0);
                (40_000.0 + 1_000.0 * vix, vix)
            })
            .collect();
        let report = strategy.analyze(&snapshot_with(&rows)).unwrap();
        assert_eq!(report.opportunities.len(), 1);
        assert_eq!(report.opportunities[0].signal_type, SignalType::Short);

        let signals = strategy.generate_signals(&report).unwrap();
        let signal = &signals[0];
        assert_eq!(signal.stop_loss, Some(signal.price * 1.05));
        assert_eq!(signal.take_profit, Some(signal.price * 0.90));
    }

    #[test]
    fn below_ten_clean_rows_is_insufficient() {
        let strategy = strategy();
        let rows: Vec<(f64, f64)> = (0..6).map(|i| (50_000.0 + i as f64, 20.0)).collect();
        let report = strategy.analyze(&snapshot_with(&rows)).unwrap();
        assert!(report.opportunities.is_empty());
        let strength = &report.metadata["correlation_analysis"]["bitcoin"]["correlation_strength"];
        assert_eq!(strength, "INSUFFICIENT_DATA");
    }

    #[test]
    fn weak_correlation_emits_nothing() {
        let strategy = strategy();
        // Alternating pattern with essentially no linear relationship.
        let rows: Vec<(f64, f64)> = (0..30)
            .map(|i| {
                let close = 50_000.0 + if i % 2 == 0 { 250.0 } else { -250.0 };
                let vix = 20.0 + if i % 3 == 0 { 1.5 } else { -1.5 };
                (close, vix)
            })
            .collect();
        let report = strategy.analyze(&snapshot_with(&rows)).unwrap();
        assert!(report.opportunities.is_empty());
    }

    #[test]
    fn position_size_scales_with_vix() {
        let strategy = strategy();
        let report = strategy.analyze(&negative_corr_snapshot()).unwrap();
        let signals = strategy.generate_signals(&report).unwrap();
        let signal = &signals[0];
        // Base 2% scaled by the VIX adjustment, which stays within [0.5, 1.0].
        assert!(signal.position_size <= 0.02 + 1e-12);
        assert!(signal.position_size >= 0.01 - 1e-12);
    }

    #[test]
    fn parameters_reflect_config() {
        let params = strategy().parameters();
        assert_eq!(params["lookback_days"], 30);
        assert_eq!(params["correlation_thresholds"]["strong_negative"], -0.6);
    }
}
