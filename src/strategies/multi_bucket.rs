use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::NaiveDate;
use garde::Validate;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::analytics::{mean, pearson, population_std};
use crate::config::StrategyConfig;
use crate::data::{CombinedBar, MarketSnapshot};
use crate::error::Result;
use crate::signals::registry::{AnalysisReport, Opportunity, Strategy};
use crate::signals::{Bucket, Evidence, SignalDraft, SignalStrength, SignalType, TradingSignal};

fn unit_open_closed(value: &f64, _ctx: &()) -> garde::Result {
    if *value > 0.0 && *value <= 1.0 {
        Ok(())
    } else {
        Err(garde::Error::new(format!(
            "must be in (0.0, 1.0], got {value}"
        )))
    }
}

fn strictly_positive(value: &f64, _ctx: &()) -> garde::Result {
    if *value > 0.0 {
        Ok(())
    } else {
        Err(garde::Error::new(format!("must be > 0, got {value}")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct MomentumBucketParams {
    #[garde(length(min = 1))]
    pub horizons: Vec<usize>,
    #[garde(length(min = 1))]
    pub weights: Vec<f64>,
    #[garde(range(min = 10))]
    pub zscore_window: usize,
    #[garde(custom(strictly_positive))]
    pub composite_threshold: f64,
    #[garde(custom(strictly_positive))]
    pub base_momentum_threshold: f64,
    #[garde(custom(strictly_positive))]
    pub acceleration_threshold: f64,
    #[garde(custom(strictly_positive))]
    pub established_trend_threshold: f64,
}

impl Default for MomentumBucketParams {
    fn default() -> Self {
        MomentumBucketParams {
            horizons: vec![7, 14, 30],
            weights: vec![0.5, 0.3, 0.2],
            zscore_window: 30,
            composite_threshold: 0.5,
            base_momentum_threshold: 0.02,
            acceleration_threshold: 0.01,
            established_trend_threshold: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ResidualParams {
    #[garde(range(min = 20))]
    pub regression_window: usize,
    #[garde(range(min = 5))]
    pub residual_window: usize,
    #[garde(custom(strictly_positive))]
    pub residual_threshold: f64,
    #[garde(custom(strictly_positive))]
    pub boost_zscore: f64,
}

impl Default for ResidualParams {
    fn default() -> Self {
        ResidualParams {
            regression_window: 30,
            residual_window: 20,
            residual_threshold: 1.0,
            boost_zscore: 1.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct MeanReversionBucketParams {
    #[garde(custom(strictly_positive))]
    pub overextension_threshold: f64,
    #[garde(skip)]
    pub oversold_threshold: f64,
    #[garde(skip)]
    pub momentum_strength_threshold: f64,
    #[garde(custom(unit_open_closed))]
    pub reversion_target: f64,
}

impl Default for MeanReversionBucketParams {
    fn default() -> Self {
        MeanReversionBucketParams {
            overextension_threshold: 2.0,
            oversold_threshold: -2.0,
            momentum_strength_threshold: 0.0,
            reversion_target: 0.05,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PairSpec {
    #[garde(length(min = 1))]
    pub name: String,
    #[garde(length(min = 1))]
    pub long: String,
    #[garde(length(min = 1))]
    pub short: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct PairParams {
    #[garde(dive)]
    pub pairs: Vec<PairSpec>,
    #[garde(range(min = 5))]
    pub spread_window: usize,
    #[garde(range(min = 5))]
    pub zscore_window: usize,
    #[garde(custom(strictly_positive))]
    pub entry_threshold: f64,
    #[garde(range(min = 0.0, max = 1.0))]
    pub correlation_threshold: f64,
    #[garde(custom(strictly_positive))]
    pub correlation_decline_threshold: f64,
    #[garde(custom(unit_open_closed))]
    pub hard_stop_threshold: f64,
}

impl Default for PairParams {
    fn default() -> Self {
        PairParams {
            pairs: Vec::new(),
            spread_window: 20,
            zscore_window: 20,
            entry_threshold: 2.0,
            correlation_threshold: 0.7,
            correlation_decline_threshold: 0.1,
            hard_stop_threshold: 0.1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct CorrelationRegimeParams {
    #[garde(length(min = 1))]
    pub correlation_windows: Vec<usize>,
    #[garde(range(min = 0.0, max = 1.0))]
    pub low_correlation_threshold: f64,
    #[garde(range(min = 0.0, max = 1.0))]
    pub high_correlation_threshold: f64,
    #[garde(custom(unit_open_closed))]
    pub leverage_reduction_factor: f64,
    #[garde(custom(strictly_positive))]
    pub regime_shift_threshold: f64,
}

impl Default for CorrelationRegimeParams {
    fn default() -> Self {
        CorrelationRegimeParams {
            correlation_windows: vec![7, 30, 90],
            low_correlation_threshold: 0.3,
            high_correlation_threshold: 0.7,
            leverage_reduction_factor: 0.4,
            regime_shift_threshold: 0.3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct PositionSizingParams {
    #[garde(custom(unit_open_closed))]
    pub max_single_asset_exposure: f64,
    #[garde(custom(strictly_positive))]
    pub confidence_multiplier_high: f64,
    #[garde(custom(strictly_positive))]
    pub confidence_multiplier_medium: f64,
    #[garde(custom(strictly_positive))]
    pub confidence_multiplier_low: f64,
    #[garde(custom(strictly_positive))]
    pub residual_boost_multiplier: f64,
    #[garde(custom(strictly_positive))]
    pub mean_reversion_size_multiplier: f64,
}

impl Default for PositionSizingParams {
    fn default() -> Self {
        PositionSizingParams {
            max_single_asset_exposure: 0.2,
            confidence_multiplier_high: 1.5,
            confidence_multiplier_medium: 1.0,
            confidence_multiplier_low: 0.5,
            residual_boost_multiplier: 1.25,
            mean_reversion_size_multiplier: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct MultiBucketParams {
    #[garde(dive)]
    pub momentum: MomentumBucketParams,
    #[garde(dive)]
    pub residual: ResidualParams,
    #[garde(dive)]
    pub mean_reversion: MeanReversionBucketParams,
    #[garde(dive)]
    pub pair: PairParams,
    #[garde(dive)]
    pub correlation: CorrelationRegimeParams,
    #[garde(dive)]
    pub position: PositionSizingParams,
    #[garde(custom(unit_open_closed))]
    pub max_risk_per_trade: f64,
    #[garde(length(min = 1))]
    pub factor_assets: Vec<String>,
}

impl Default for MultiBucketParams {
    fn default() -> Self {
        MultiBucketParams {
            momentum: MomentumBucketParams::default(),
            residual: ResidualParams::default(),
            mean_reversion: MeanReversionBucketParams::default(),
            pair: PairParams::default(),
            correlation: CorrelationRegimeParams::default(),
            position: PositionSizingParams::default(),
            max_risk_per_trade: 0.02,
            factor_assets: vec!["bitcoin".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct MomentumAnalysis {
    momentum_returns: BTreeMap<usize, f64>,
    z_scores: BTreeMap<usize, f64>,
    composite_momentum: f64,
    acceleration: f64,
    momentum_strength: f64,
    trend_alignment: bool,
    current_price: f64,
}

#[derive(Debug, Clone, Serialize)]
struct ResidualAnalysis {
    beta: f64,
    residual_zscore: f64,
    residual_mean: f64,
    residual_std: f64,
}

#[derive(Debug, Clone, Serialize)]
struct PairAnalysis {
    spread: f64,
    spread_zscore: f64,
    corr_30d: f64,
    corr_7d: f64,
    corr_7d_prev: f64,
}

#[derive(Debug, Clone, Copy, Serialize)]
struct RegimeAnalysis {
    average_correlation: f64,
    leverage_factor: f64,
    regime_shift: bool,
    risk_off: bool,
}

#[derive(Debug, Default)]
struct RegimeState {
    last_correlation: Option<f64>,
    risk_off: bool,
}

/// Systematic multi-bucket portfolio: cross-sectional momentum, residual
/// momentum net of BTC beta, short-horizon mean reversion, pair-spread
/// convergence, all risk-modulated by the cross-asset correlation regime.
pub struct MultiBucketStrategy {
    name: String,
    assets: Vec<String>,
    params: MultiBucketParams,
    state: Mutex<RegimeState>,
}

pub fn construct(config: &StrategyConfig) -> Result<Box<dyn Strategy>> {
    Ok(Box::new(MultiBucketStrategy::from_config(config)?))
}

fn dated_returns(bars: &[CombinedBar]) -> Vec<(NaiveDate, f64)> {
    bars.windows(2)
        .filter(|w| w[0].close > 0.0)
        .map(|w| (w[1].date, w[1].close / w[0].close - 1.0))
        .collect()
}

/// Inner join of two dated series on the date key. Both inputs are sorted.
fn align_two(a: &[(NaiveDate, f64)], b: &[(NaiveDate, f64)]) -> Vec<(f64, f64)> {
    let mut out = Vec::new();
    let mut i = 0;
    let mut j = 0;
    while i < a.len() && j < b.len() {
        match a[i].0.cmp(&b[j].0) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                out.push((a[i].1, b[j].1));
                i += 1;
                j += 1;
            }
        }
    }
    out
}

/// Single-factor OLS with intercept: returns (beta, residuals).
fn beta_residuals(asset: &[f64], factor: &[f64]) -> Option<(f64, Vec<f64>)> {
    if asset.len() != factor.len() || asset.len() < 10 {
        return None;
    }
    let mx = mean(factor);
    let my = mean(asset);
    let mut cov = 0.0;
    let mut var_x = 0.0;
    for (x, y) in factor.iter().zip(asset) {
        cov += (x - mx) * (y - my);
        var_x += (x - mx).powi(2);
    }
    if var_x == 0.0 {
        return None;
    }
    let beta = cov / var_x;
    let alpha = my - beta * mx;
    let residuals = asset
        .iter()
        .zip(factor)
        .map(|(y, x)| y - (alpha + beta * x))
        .collect();
    Some((beta, residuals))
}

impl MultiBucketStrategy {
    pub fn from_config(config: &StrategyConfig) -> Result<Self> {
        let config = crate::config::validated(config.clone())?;
        let params: MultiBucketParams = config.bind_params()?;
        Ok(MultiBucketStrategy {
            name: config.name,
            assets: config.assets,
            params,
            state: Mutex::new(RegimeState::default()),
        })
    }

    fn momentum_zscore(&self, closes: &[f64], horizon: usize) -> f64 {
        let window = self.params.momentum.zscore_window;
        if closes.len() < window || closes.len() <= horizon {
            return 0.0;
        }
        // Historical momentum distribution excludes the most recent window.
        let mut series = Vec::new();
        for i in horizon..closes.len().saturating_sub(window) {
            if closes[i - horizon] > 0.0 {
                series.push(closes[i] / closes[i - horizon] - 1.0);
            }
        }
        if series.len() < 10 {
            return 0.0;
        }
        let m = mean(&series);
        let s = population_std(&series);
        if s == 0.0 {
            return 0.0;
        }
        let current = closes[closes.len() - 1] / closes[closes.len() - 1 - horizon] - 1.0;
        (current - m) / s
    }

    fn momentum_analysis(&self, bars: &[CombinedBar]) -> Option<MomentumAnalysis> {
        let max_horizon = self.params.momentum.horizons.iter().copied().max()?;
        if bars.len() <= max_horizon {
            return None;
        }
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();

        let mut momentum_returns = BTreeMap::new();
        let mut z_scores = BTreeMap::new();
        for &horizon in &self.params.momentum.horizons {
            if closes.len() > horizon && closes[closes.len() - 1 - horizon] > 0.0 {
                let m = closes[closes.len() - 1] / closes[closes.len() - 1 - horizon] - 1.0;
                momentum_returns.insert(horizon, m);
                z_scores.insert(horizon, self.momentum_zscore(&closes, horizon));
            }
        }
        if z_scores.is_empty() {
            return None;
        }

        let composite: f64 = self
            .params
            .momentum
            .horizons
            .iter()
            .zip(&self.params.momentum.weights)
            .filter_map(|(h, w)| z_scores.get(h).map(|z| w * z))
            .sum();

        let h0 = self.params.momentum.horizons.first().copied().unwrap_or(7);
        let h1 = self.params.momentum.horizons.get(1).copied().unwrap_or(14);
        let acceleration = momentum_returns.get(&h0).copied().unwrap_or(0.0)
            - momentum_returns.get(&h1).copied().unwrap_or(0.0);

        // Positive-day fraction over the trailing two weeks, centered on 0.
        let momentum_strength = if closes.len() > 14 {
            let tail = &closes[closes.len() - 15..];
            let positive = tail.windows(2).filter(|w| w[1] > w[0]).count();
            positive as f64 / 14.0 - 0.5
        } else {
            0.0
        };

        let trend_alignment = momentum_returns.values().all(|m| *m > 0.0);

        Some(MomentumAnalysis {
            momentum_returns,
            z_scores,
            composite_momentum: composite,
            acceleration,
            momentum_strength,
            trend_alignment,
            current_price: *closes.last()?,
        })
    }

    fn residual_analysis(
        &self,
        returns: &BTreeMap<String, Vec<(NaiveDate, f64)>>,
    ) -> BTreeMap<String, ResidualAnalysis> {
        let mut out = BTreeMap::new();
        let Some(factor) = self
            .params
            .factor_assets
            .first()
            .and_then(|f| returns.get(f))
        else {
            return out;
        };

        for (asset, series) in returns {
            if self.params.factor_assets.contains(asset) {
                continue;
            }
            let aligned = align_two(series, factor);
            if aligned.len() < self.params.residual.regression_window {
                continue;
            }
            let start = aligned.len() - self.params.residual.regression_window;
            let asset_returns: Vec<f64> = aligned[start..].iter().map(|(a, _)| *a).collect();
            let factor_returns: Vec<f64> = aligned[start..].iter().map(|(_, f)| *f).collect();

            let Some((beta, residuals)) = beta_residuals(&asset_returns, &factor_returns) else {
                continue;
            };
            if residuals.len() < self.params.residual.residual_window {
                continue;
            }
            let tail = &residuals[residuals.len() - self.params.residual.residual_window..];
            let m = mean(tail);
            let s = population_std(tail);
            if s == 0.0 {
                continue;
            }
            out.insert(
                asset.clone(),
                ResidualAnalysis {
                    beta,
                    residual_zscore: (tail[tail.len() - 1] - m) / s,
                    residual_mean: m,
                    residual_std: s,
                },
            );
        }
        out
    }

    fn average_correlation(&self, returns: &BTreeMap<String, Vec<(NaiveDate, f64)>>) -> f64 {
        let assets: Vec<&String> = returns.keys().collect();
        if assets.len() < 2 {
            return 0.5;
        }

        let mut samples = Vec::new();
        for &window in &self.params.correlation.correlation_windows {
            for i in 0..assets.len() {
                for j in (i + 1)..assets.len() {
                    let aligned = align_two(&returns[assets[i]], &returns[assets[j]]);
                    if aligned.len() < window {
                        continue;
                    }
                    let start = aligned.len() - window;
                    let xs: Vec<f64> = aligned[start..].iter().map(|(a, _)| *a).collect();
                    let ys: Vec<f64> = aligned[start..].iter().map(|(_, b)| *b).collect();
                    if let Some(r) = pearson(&xs, &ys) {
                        samples.push(r);
                    }
                }
            }
        }

        if samples.is_empty() {
            0.5
        } else {
            mean(&samples)
        }
    }

    fn pair_analysis(&self, snapshot: &MarketSnapshot) -> BTreeMap<String, PairAnalysis> {
        let mut out = BTreeMap::new();
        for pair in &self.params.pair.pairs {
            let (Some(long_bars), Some(short_bars)) =
                (snapshot.asset(&pair.long), snapshot.asset(&pair.short))
            else {
                continue;
            };
            if long_bars.is_empty() || short_bars.is_empty() {
                continue;
            }

            let n = long_bars.len().min(short_bars.len());
            if n < self.params.pair.spread_window {
                continue;
            }
            let longs: Vec<f64> = long_bars[long_bars.len() - n..].iter().map(|b| b.close).collect();
            let shorts: Vec<f64> =
                short_bars[short_bars.len() - n..].iter().map(|b| b.close).collect();
            let spreads: Vec<f64> = longs.iter().zip(&shorts).map(|(l, s)| l - s).collect();
            let spread = *spreads.last().expect("non-empty");

            let z_window = self.params.pair.zscore_window;
            let spread_zscore = if spreads.len() >= z_window {
                let tail = &spreads[spreads.len() - z_window..];
                let s = population_std(tail);
                if s > 0.0 {
                    (spread - mean(tail)) / s
                } else {
                    0.0
                }
            } else {
                0.0
            };

            let corr_over = |w: usize| -> f64 {
                if n < w {
                    return 0.0;
                }
                pearson(&longs[n - w..], &shorts[n - w..]).unwrap_or(0.0)
            };
            let corr_30d = corr_over(30);
            let corr_7d = corr_over(7);
            let corr_7d_prev = if n >= 14 {
                pearson(&longs[n - 14..n - 7], &shorts[n - 14..n - 7]).unwrap_or(0.0)
            } else {
                0.0
            };

            out.insert(
                pair.name.clone(),
                PairAnalysis {
                    spread,
                    spread_zscore,
                    corr_30d,
                    corr_7d,
                    corr_7d_prev,
                },
            );
        }
        out
    }

    fn leverage_factor(&self, avg_correlation: f64) -> f64 {
        let low = self.params.correlation.low_correlation_threshold;
        let high = self.params.correlation.high_correlation_threshold;
        let reduction = self.params.correlation.leverage_reduction_factor;
        if avg_correlation <= low {
            1.0
        } else if avg_correlation >= high {
            reduction
        } else {
            1.0 - (avg_correlation - low) / (high - low) * (1.0 - reduction)
        }
    }

    fn detect_regime_shift(&self, current: f64) -> bool {
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let shift = match state.last_correlation {
            None => false,
            Some(last) => {
                (current - last).abs() > self.params.correlation.regime_shift_threshold
                    && current > 0.25
            }
        };
        state.last_correlation = Some(current);
        if shift {
            state.risk_off = true;
        }
        shift
    }

    fn risk_off(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .risk_off
    }

    fn bucket_base_size(&self, bucket: Bucket) -> f64 {
        let base = self.params.position.max_single_asset_exposure * 0.05;
        match bucket {
            Bucket::ResidualLong => base * 0.8,
            Bucket::ResidualShort => base * 0.6,
            Bucket::MeanReversionLong => {
                base * 0.4 * self.params.position.mean_reversion_size_multiplier
            }
            Bucket::MeanReversionShort => {
                base * 0.3 * self.params.position.mean_reversion_size_multiplier
            }
            Bucket::PairLongSpread | Bucket::PairShortSpread => base * 0.7,
            Bucket::MomentumLong => base,
        }
    }

    fn momentum_position_size(&self, analysis: &MomentumAnalysis, regime: RegimeAnalysis) -> f64 {
        let base = self.params.position.max_single_asset_exposure * 0.1;
        let confidence = analysis.composite_momentum / 2.0;
        let multiplier = if confidence > 0.8 {
            self.params.position.confidence_multiplier_high
        } else if confidence > 0.6 {
            self.params.position.confidence_multiplier_medium
        } else {
            self.params.position.confidence_multiplier_low
        };
        (base * multiplier * regime.leverage_factor)
            .min(self.params.position.max_single_asset_exposure)
    }

    fn build_opportunity(
        &self,
        asset: &str,
        bucket: Bucket,
        signal_type: SignalType,
        confidence: f64,
        price: f64,
        position_size: f64,
        take_profit: Option<f64>,
        evidence: Evidence,
    ) -> Opportunity {
        let stop_loss = match signal_type {
            SignalType::Short => price * 1.05,
            _ => price * 0.95,
        };
        let strength = if confidence > 0.8 {
            SignalStrength::Strong
        } else if confidence > 0.6 {
            SignalStrength::Moderate
        } else {
            SignalStrength::Weak
        };
        Opportunity {
            asset: asset.to_string(),
            signal_type,
            signal_strength: strength,
            confidence,
            price,
            position_size: Some(position_size),
            stop_loss: Some(stop_loss),
            take_profit,
            correlation_value: None,
            evidence,
        }
    }
}

impl Strategy for MultiBucketStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn assets(&self) -> &[String] {
        &self.assets
    }

    #[allow(clippy::too_many_lines)]
    fn analyze(&self, snapshot: &MarketSnapshot) -> Result<AnalysisReport> {
        let mut report = AnalysisReport::new(snapshot.as_of, self.name.clone());

        // Per-asset momentum analysis, fanned out across the universe.
        let momentum: BTreeMap<String, MomentumAnalysis> = self
            .assets
            .par_iter()
            .filter_map(|asset| {
                let bars = snapshot.asset(asset)?;
                self.momentum_analysis(bars).map(|a| (asset.clone(), a))
            })
            .collect::<Vec<_>>()
            .into_iter()
            .collect();

        let returns: BTreeMap<String, Vec<(NaiveDate, f64)>> = self
            .assets
            .iter()
            .filter_map(|asset| {
                let bars = snapshot.asset(asset)?;
                let series = dated_returns(bars);
                (!series.is_empty()).then(|| (asset.clone(), series))
            })
            .collect();

        let residual = self.residual_analysis(&returns);
        let average_correlation = self.average_correlation(&returns);
        let pairs = self.pair_analysis(snapshot);

        let regime_shift = self.detect_regime_shift(average_correlation);
        let regime = RegimeAnalysis {
            average_correlation,
            leverage_factor: self.leverage_factor(average_correlation),
            regime_shift,
            risk_off: self.risk_off(),
        };
        if regime.risk_off {
            tracing::warn!(
                strategy = %self.name,
                average_correlation,
                "risk-off mode active, position sizes reduced"
            );
        }

        // Bucket 1: momentum longs.
        for (asset, analysis) in &momentum {
            let p = &self.params.momentum;
            let h0 = p.horizons.first().copied().unwrap_or(7);
            let last_horizon = p.horizons.last().copied().unwrap_or(30);
            let m0 = analysis.momentum_returns.get(&h0).copied().unwrap_or(0.0);
            let z_last = analysis.z_scores.get(&last_horizon).copied().unwrap_or(0.0);

            if analysis.composite_momentum > p.composite_threshold
                && m0 > p.base_momentum_threshold
                && analysis.trend_alignment
                && (analysis.acceleration > p.acceleration_threshold
                    || z_last > p.established_trend_threshold)
                && analysis.momentum_strength > 0.0
            {
                let size = self.momentum_position_size(analysis, regime);
                report.opportunities.push(self.build_opportunity(
                    asset,
                    Bucket::MomentumLong,
                    SignalType::Long,
                    (analysis.composite_momentum / 2.0).min(1.0),
                    analysis.current_price,
                    size,
                    None,
                    Evidence::MultiBucket {
                        bucket: Bucket::MomentumLong,
                        composite_momentum: Some(analysis.composite_momentum),
                        residual_zscore: None,
                        beta: None,
                        z7: analysis.z_scores.get(&h0).copied(),
                        spread_zscore: None,
                        leverage_factor: regime.leverage_factor,
                        risk_off: regime.risk_off,
                    },
                ));
            }
        }

        // Bucket 2: residual momentum, both directions.
        for (asset, analysis) in &residual {
            let z = analysis.residual_zscore;
            let threshold = self.params.residual.residual_threshold;
            let Some(price) = momentum.get(asset).map(|m| m.current_price) else {
                continue;
            };

            if z > threshold {
                let mut size = self.bucket_base_size(Bucket::ResidualLong);
                if z > self.params.residual.boost_zscore {
                    size *= self.params.position.residual_boost_multiplier;
                }
                report.opportunities.push(self.build_opportunity(
                    asset,
                    Bucket::ResidualLong,
                    SignalType::Long,
                    (z / 3.0).min(1.0),
                    price,
                    size,
                    None,
                    Evidence::MultiBucket {
                        bucket: Bucket::ResidualLong,
                        composite_momentum: None,
                        residual_zscore: Some(z),
                        beta: Some(analysis.beta),
                        z7: None,
                        spread_zscore: None,
                        leverage_factor: regime.leverage_factor,
                        risk_off: regime.risk_off,
                    },
                ));
            } else if z < -threshold {
                report.opportunities.push(self.build_opportunity(
                    asset,
                    Bucket::ResidualShort,
                    SignalType::Short,
                    (z.abs() / 3.0).min(1.0),
                    price,
                    self.bucket_base_size(Bucket::ResidualShort),
                    None,
                    Evidence::MultiBucket {
                        bucket: Bucket::ResidualShort,
                        composite_momentum: None,
                        residual_zscore: Some(z),
                        beta: Some(analysis.beta),
                        z7: None,
                        spread_zscore: None,
                        leverage_factor: regime.leverage_factor,
                        risk_off: regime.risk_off,
                    },
                ));
            }
        }

        // Bucket 3: short-horizon mean reversion, only in a dispersed
        // (low-correlation) regime.
        if average_correlation < self.params.correlation.low_correlation_threshold {
            let h0 = self.params.momentum.horizons.first().copied().unwrap_or(7);
            for (asset, analysis) in &momentum {
                let z7 = analysis.z_scores.get(&h0).copied().unwrap_or(0.0);
                let ms = analysis.momentum_strength;
                let mr = &self.params.mean_reversion;

                if z7 > mr.overextension_threshold && ms < 0.0 {
                    report.opportunities.push(self.build_opportunity(
                        asset,
                        Bucket::MeanReversionShort,
                        SignalType::Short,
                        (z7 / 4.0).min(1.0),
                        analysis.current_price,
                        self.bucket_base_size(Bucket::MeanReversionShort),
                        Some(analysis.current_price * (1.0 - mr.reversion_target)),
                        Evidence::MultiBucket {
                            bucket: Bucket::MeanReversionShort,
                            composite_momentum: Some(analysis.composite_momentum),
                            residual_zscore: None,
                            beta: None,
                            z7: Some(z7),
                            spread_zscore: None,
                            leverage_factor: regime.leverage_factor,
                            risk_off: regime.risk_off,
                        },
                    ));
                } else if z7 < mr.oversold_threshold && ms > mr.momentum_strength_threshold {
                    report.opportunities.push(self.build_opportunity(
                        asset,
                        Bucket::MeanReversionLong,
                        SignalType::Long,
                        (z7.abs() / 4.0).min(1.0),
                        analysis.current_price,
                        self.bucket_base_size(Bucket::MeanReversionLong),
                        Some(analysis.current_price * (1.0 + mr.reversion_target)),
                        Evidence::MultiBucket {
                            bucket: Bucket::MeanReversionLong,
                            composite_momentum: Some(analysis.composite_momentum),
                            residual_zscore: None,
                            beta: None,
                            z7: Some(z7),
                            spread_zscore: None,
                            leverage_factor: regime.leverage_factor,
                            risk_off: regime.risk_off,
                        },
                    ));
                }
            }
        }

        // Bucket 4: pair-spread convergence. Entry needs a stretched spread,
        // a still-coupled 30-day correlation and a recent 7-day decoupling.
        for (name, analysis) in &pairs {
            let p = &self.params.pair;
            let stretched_low = analysis.spread_zscore < -p.entry_threshold;
            let stretched_high = analysis.spread_zscore > p.entry_threshold;
            let coupled = analysis.corr_30d > p.correlation_threshold;
            let decoupling =
                (analysis.corr_7d_prev - analysis.corr_7d) >= p.correlation_decline_threshold;

            if coupled && decoupling && (stretched_low || stretched_high) {
                let (bucket, signal_type) = if stretched_low {
                    (Bucket::PairLongSpread, SignalType::Long)
                } else {
                    (Bucket::PairShortSpread, SignalType::Short)
                };
                if analysis.spread <= 0.0 {
                    tracing::warn!(pair = %name, spread = analysis.spread, "non-positive spread, skipping");
                    continue;
                }
                report.opportunities.push(self.build_opportunity(
                    name,
                    bucket,
                    signal_type,
                    (analysis.spread_zscore.abs() / 4.0).min(1.0),
                    analysis.spread,
                    self.bucket_base_size(bucket),
                    None,
                    Evidence::MultiBucket {
                        bucket,
                        composite_momentum: None,
                        residual_zscore: None,
                        beta: None,
                        z7: None,
                        spread_zscore: Some(analysis.spread_zscore),
                        leverage_factor: regime.leverage_factor,
                        risk_off: regime.risk_off,
                    },
                ));
            }
        }

        // Risk summary for downstream consumers.
        let total_exposure: f64 = report
            .opportunities
            .iter()
            .filter_map(|o| o.position_size)
            .sum();
        let portfolio_beta: f64 = report
            .opportunities
            .iter()
            .filter_map(|o| match &o.evidence {
                Evidence::MultiBucket { beta: Some(beta), .. } => {
                    o.position_size.map(|size| size * beta)
                }
                _ => None,
            })
            .sum();
        let mut bucket_exposure: BTreeMap<&'static str, f64> = BTreeMap::new();
        for opportunity in &report.opportunities {
            if let Evidence::MultiBucket { bucket, .. } = &opportunity.evidence {
                *bucket_exposure.entry(bucket.as_str()).or_default() +=
                    opportunity.position_size.unwrap_or(0.0);
            }
        }
        let bucket_distribution: BTreeMap<&'static str, f64> = bucket_exposure
            .into_iter()
            .map(|(bucket, exposure)| {
                let share = if total_exposure > 0.0 {
                    exposure / total_exposure
                } else {
                    0.0
                };
                (bucket, share)
            })
            .collect();

        report.metadata = serde_json::json!({
            "momentum_analysis": momentum,
            "residual_analysis": residual,
            "pair_analysis": pairs,
            "regime_analysis": regime,
            "risk_summary": {
                "total_exposure": total_exposure,
                "portfolio_beta": portfolio_beta,
                "leverage_factor": regime.leverage_factor,
                "risk_off_mode": regime.risk_off,
                "average_correlation": regime.average_correlation,
                "opportunity_count": report.opportunities.len(),
                "bucket_distribution": bucket_distribution,
            },
        });

        tracing::info!(
            strategy = %self.name,
            opportunities = report.opportunities.len(),
            average_correlation,
            leverage = regime.leverage_factor,
            "multi-bucket analysis complete"
        );
        Ok(report)
    }

    fn generate_signals(&self, report: &AnalysisReport) -> Result<Vec<TradingSignal>> {
        let mut signals = Vec::new();
        for opportunity in &report.opportunities {
            let Evidence::MultiBucket {
                leverage_factor,
                risk_off,
                ..
            } = &opportunity.evidence
            else {
                continue;
            };

            let mut position_size = opportunity.position_size.unwrap_or(0.0);
            if *risk_off {
                position_size *= leverage_factor;
            }

            let mut draft = SignalDraft::new(
                opportunity.asset.clone(),
                opportunity.signal_type,
                report.timestamp,
                opportunity.price,
                report.strategy_name.clone(),
                opportunity.signal_strength,
                opportunity.confidence,
                position_size,
            );
            draft.stop_loss = opportunity.stop_loss;
            draft.take_profit = opportunity.take_profit;
            draft.max_risk = Some(self.params.max_risk_per_trade);
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
        serde_json::json!({
            "strategy_name": self.name,
            "universe": self.assets,
            "parameters": serde_json::to_value(&self.params).unwrap_or(serde_json::Value::Null),
            "risk_off_mode": self.risk_off(),
        })
    }
}
