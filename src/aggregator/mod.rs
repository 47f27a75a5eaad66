pub mod conflict;

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};

use ordered_float::OrderedFloat;
use rustc_hash::FxHashMap;

use crate::config::{AggregatorConfig, ConflictResolution};
use crate::error::Result;
use crate::signals::{
    AggregationEvidence, Evidence, SignalDraft, SignalStrength, SignalType, TradingSignal,
};
pub use conflict::{
    analyze_conflicts, recommend_resolution, AssetConflict, ConflictAnalysis, ConflictReport,
    ConflictSignalInfo, ConflictSummary, Recommendation, RecommendationKind, RecommendedAction,
    ResolutionRecommendation,
};

/// Strategy name stamped on combined output signals.
const AGGREGATED_STRATEGY: &str = "aggregated";

/// Risk/reward ratios are capped here when scoring risk-weighted candidates.
const MAX_RISK_REWARD: f64 = 3.0;

#[derive(Debug, Clone, serde::Serialize)]
pub struct AggregationStats {
    pub strategy_count: usize,
    pub total_signals: usize,
    pub signals_per_strategy: BTreeMap<String, usize>,
    pub strategy_weights: BTreeMap<String, f64>,
    pub conflict_analysis: BTreeMap<String, ConflictAnalysis>,
    pub assets_with_conflicts: usize,
    pub total_unique_assets: usize,
}

/// Combines per-strategy signal lists into one deduplicated, conflict-free
/// stream. Weights are normalized to sum to 1 at construction; the instance
/// is immutable afterwards and safe to share across producers.
pub struct SignalAggregator {
    strategy_weights: HashMap<String, f64>,
    config: AggregatorConfig,
}

impl SignalAggregator {
    pub fn new(config: AggregatorConfig) -> Result<Self> {
        let config = crate::config::validated(config)?;
        let total: f64 = config.strategy_weights.values().sum();
        let strategy_weights = config
            .strategy_weights
            .iter()
            .map(|(name, weight)| (name.clone(), weight / total))
            .collect();
        Ok(SignalAggregator {
            strategy_weights,
            config,
        })
    }

    pub fn strategy_weights(&self) -> &HashMap<String, f64> {
        &self.strategy_weights
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    /// Aggregate signals from multiple strategies. Unknown strategies are
    /// ignored, sub-threshold confidence is dropped, output is sorted by
    /// (-confidence, -timestamp).
    pub fn aggregate_signals(
        &self,
        strategy_signals: &FxHashMap<String, Vec<TradingSignal>>,
    ) -> Vec<TradingSignal> {
        if strategy_signals.is_empty() {
            tracing::warn!("no strategy signals provided for aggregation");
            return Vec::new();
        }

        let unknown: Vec<&String> = strategy_signals
            .keys()
            .filter(|name| !self.strategy_weights.contains_key(*name))
            .collect();
        if !unknown.is_empty() {
            tracing::warn!(?unknown, "ignoring signals from unknown strategies");
        }

        let by_asset = self.group_by_asset(strategy_signals);
        let mut aggregated: Vec<TradingSignal> = by_asset
            .iter()
            .filter_map(|(asset, signals)| self.resolve_asset(asset, signals))
            .collect();

        sort_signals(&mut aggregated);
        tracing::info!(
            output = aggregated.len(),
            strategies = strategy_signals.len(),
            "aggregation complete"
        );
        aggregated
    }

    /// Standalone conflict resolution over an already-mixed signal list.
    /// Single-signal assets pass through unchanged.
    pub fn resolve_signal_conflicts(&self, signals: &[TradingSignal]) -> Vec<TradingSignal> {
        if signals.is_empty() {
            return Vec::new();
        }

        let mut by_asset: FxHashMap<&str, Vec<&TradingSignal>> = FxHashMap::default();
        for signal in signals {
            by_asset.entry(&signal.asset).or_default().push(signal);
        }

        let mut resolved = Vec::new();
        for (asset, asset_signals) in &by_asset {
            if asset_signals.len() == 1 {
                resolved.push(asset_signals[0].clone());
                continue;
            }
            let qualified: Vec<&TradingSignal> = asset_signals
                .iter()
                .copied()
                .filter(|s| s.confidence >= self.config.min_confidence_threshold)
                .collect();
            if qualified.is_empty() {
                tracing::debug!(asset = %asset, "no qualified signals after confidence filtering");
                continue;
            }
            if let Some(signal) = self.resolve_asset(asset, &qualified) {
                resolved.push(signal);
            }
        }

        sort_signals(&mut resolved);
        tracing::info!(
            input = signals.len(),
            output = resolved.len(),
            "conflict resolution complete"
        );
        resolved
    }

    /// Aggregation statistics without actually aggregating.
    pub fn get_aggregation_stats(
        &self,
        strategy_signals: &FxHashMap<String, Vec<TradingSignal>>,
    ) -> AggregationStats {
        let by_asset = self.group_by_asset(strategy_signals);
        let conflict_analysis: BTreeMap<String, ConflictAnalysis> = by_asset
            .iter()
            .filter(|(_, signals)| signals.len() > 1)
            .map(|(asset, signals)| {
                (asset.clone(), analyze_conflicts(signals, &self.strategy_weights))
            })
            .collect();

        AggregationStats {
            strategy_count: strategy_signals.len(),
            total_signals: strategy_signals.values().map(Vec::len).sum(),
            signals_per_strategy: strategy_signals
                .iter()
                .map(|(name, signals)| (name.clone(), signals.len()))
                .collect(),
            strategy_weights: self
                .strategy_weights
                .iter()
                .map(|(name, weight)| (name.clone(), *weight))
                .collect(),
            assets_with_conflicts: conflict_analysis.len(),
            total_unique_assets: by_asset.len(),
            conflict_analysis,
        }
    }

    /// Detailed conflict report with per-asset breakdowns and operator
    /// recommendations.
    pub fn get_conflict_report(&self, signals: &[TradingSignal]) -> ConflictReport {
        let mut by_asset: BTreeMap<&str, Vec<&TradingSignal>> = BTreeMap::new();
        for signal in signals {
            by_asset.entry(&signal.asset).or_default().push(signal);
        }

        let mut report = ConflictReport {
            total_signals: signals.len(),
            unique_assets: by_asset.len(),
            conflict_summary: ConflictSummary::default(),
            conflicts: BTreeMap::new(),
            resolution_recommendations: Vec::new(),
        };

        for (asset, asset_signals) in &by_asset {
            if asset_signals.len() <= 1 {
                continue;
            }
            let analysis = analyze_conflicts(asset_signals, &self.strategy_weights);
            if !analysis.has_conflict {
                continue;
            }

            report.conflict_summary.assets_with_conflicts += 1;
            report.conflict_summary.total_conflicts += 1;
            if analysis.has_opposing {
                report.conflict_summary.assets_with_opposing_signals += 1;
            }

            let recommendation =
                recommend_resolution(asset, &analysis, self.config.conflict_resolution);
            if recommendation.action != RecommendedAction::NoAction {
                report.conflict_summary.resolution_required += 1;
            }

            let signal_infos = asset_signals
                .iter()
                .map(|s| {
                    let weight = self
                        .strategy_weights
                        .get(&s.strategy_name)
                        .copied()
                        .unwrap_or(0.0);
                    ConflictSignalInfo {
                        strategy: s.strategy_name.clone(),
                        signal_type: s.signal_type,
                        confidence: s.confidence,
                        strategy_weight: weight,
                        effective_weight: s.confidence * weight,
                        position_size: s.position_size,
                    }
                })
                .collect();

            report.conflicts.insert(
                (*asset).to_string(),
                AssetConflict {
                    signal_count: analysis.signal_count,
                    signal_types: analysis.unique_types.clone(),
                    has_opposing: analysis.has_opposing,
                    dominant_type: analysis.dominant_type,
                    dominant_weight: analysis.dominant_weight,
                    strategy_weights_sum: analysis.strategy_weights_sum,
                    signals: signal_infos,
                    resolution_recommendation: recommendation,
                },
            );
        }

        report.resolution_recommendations = self.overall_recommendations(&report);
        report
    }

    fn overall_recommendations(&self, report: &ConflictReport) -> Vec<Recommendation> {
        let mut recommendations = Vec::new();

        if report.unique_assets > 0 {
            let conflict_rate = report.conflict_summary.assets_with_conflicts as f64
                / report.unique_assets as f64;
            if conflict_rate > 0.5 {
                recommendations.push(Recommendation {
                    kind: RecommendationKind::Warning,
                    message: format!(
                        "High conflict rate ({:.1}%) - consider reviewing strategy weights",
                        conflict_rate * 100.0
                    ),
                    suggested_action: "Review strategy weights and conflict resolution method"
                        .to_string(),
                });
            }
        }

        if report.conflict_summary.assets_with_opposing_signals > 0 {
            recommendations.push(Recommendation {
                kind: RecommendationKind::Info,
                message: format!(
                    "{} assets have opposing signals",
                    report.conflict_summary.assets_with_opposing_signals
                ),
                suggested_action: "Consider using conservative conflict resolution".to_string(),
            });
        }

        if report.conflict_summary.resolution_required > 0 {
            recommendations.push(Recommendation {
                kind: RecommendationKind::Action,
                message: format!(
                    "{} conflicts require resolution",
                    report.conflict_summary.resolution_required
                ),
                suggested_action: "Run resolve_signal_conflicts() for conflict-free signals"
                    .to_string(),
            });
        }

        recommendations
    }

    fn group_by_asset<'a>(
        &self,
        strategy_signals: &'a FxHashMap<String, Vec<TradingSignal>>,
    ) -> BTreeMap<String, Vec<&'a TradingSignal>> {
        let mut by_asset: BTreeMap<String, Vec<&TradingSignal>> = BTreeMap::new();
        for (strategy, signals) in strategy_signals {
            if !self.strategy_weights.contains_key(strategy) {
                continue;
            }
            for signal in signals {
                if signal.confidence >= self.config.min_confidence_threshold {
                    by_asset.entry(signal.asset.clone()).or_default().push(signal);
                }
            }
        }
        by_asset
    }

    fn resolve_asset(&self, asset: &str, signals: &[&TradingSignal]) -> Option<TradingSignal> {
        if signals.is_empty() {
            return None;
        }
        let analysis = analyze_conflicts(signals, &self.strategy_weights);

        match self.config.conflict_resolution {
            ConflictResolution::WeightedAverage => {
                self.weighted_average(asset, signals, &analysis)
            }
            ConflictResolution::StrongestWins => self.strongest_wins(signals),
            ConflictResolution::Conservative => {
                if analysis.has_opposing {
                    tracing::debug!(asset, "conservative mode: opposing signals, no action");
                    return None;
                }
                if analysis.dominant_weight < 0.6 {
                    tracing::debug!(
                        asset,
                        dominant_weight = analysis.dominant_weight,
                        "conservative mode: insufficient agreement"
                    );
                    return None;
                }
                self.weighted_average(asset, signals, &analysis)
            }
            ConflictResolution::ConsensusThreshold => {
                if analysis.dominant_weight < self.config.consensus_threshold {
                    tracing::debug!(
                        asset,
                        dominant_weight = analysis.dominant_weight,
                        threshold = self.config.consensus_threshold,
                        "consensus threshold not met"
                    );
                    return None;
                }
                self.weighted_average(asset, signals, &analysis)
            }
            ConflictResolution::RiskWeighted => self.risk_weighted(signals, &analysis),
        }
    }

    fn weighted_average(
        &self,
        asset: &str,
        signals: &[&TradingSignal],
        analysis: &ConflictAnalysis,
    ) -> Option<TradingSignal> {
        if analysis.has_opposing
            && self.config.require_majority_agreement
            && analysis.dominant_weight <= 0.5
        {
            tracing::debug!(asset, "no majority agreement, skipping signal");
            return None;
        }

        let final_type = analysis.dominant_type;
        if final_type == SignalType::Hold {
            return None;
        }

        // HOLD signals participate in the averages without changing the
        // aggregated direction.
        let relevant: Vec<&TradingSignal> = signals
            .iter()
            .copied()
            .filter(|s| s.signal_type == final_type || s.signal_type == SignalType::Hold)
            .collect();

        let mut total_weight = 0.0;
        let mut confidence_sum = 0.0;
        let mut position_sum = 0.0;
        let mut price_sum = 0.0;
        // Risk levels only average over the signals that supplied them.
        let mut stop_sum = 0.0;
        let mut stop_weight = 0.0;
        let mut take_sum = 0.0;
        let mut take_weight = 0.0;
        let mut risk_sum = 0.0;
        let mut risk_weight = 0.0;
        let mut latest_timestamp = 0i64;

        for signal in &relevant {
            let strategy_weight = self
                .strategy_weights
                .get(&signal.strategy_name)
                .copied()
                .unwrap_or(0.0);
            let effective = strategy_weight * signal.confidence;

            total_weight += effective;
            confidence_sum += signal.confidence * effective;
            position_sum += signal.position_size * effective;
            price_sum += signal.price * effective;

            if let Some(stop) = signal.stop_loss {
                stop_sum += stop * effective;
                stop_weight += effective;
            }
            if let Some(take) = signal.take_profit {
                take_sum += take * effective;
                take_weight += effective;
            }
            if let Some(risk) = signal.max_risk {
                risk_sum += risk * effective;
                risk_weight += effective;
            }
            latest_timestamp = latest_timestamp.max(signal.timestamp);
        }

        if total_weight == 0.0 {
            return None;
        }

        let confidence = confidence_sum / total_weight;
        let position_size = (position_sum / total_weight)
            .clamp(self.config.min_position_size, self.config.max_position_size);
        let price = price_sum / total_weight;

        let strength = if confidence > 0.7 && analysis.dominant_weight > 0.7 {
            SignalStrength::Strong
        } else if confidence > 0.5 && analysis.dominant_weight > 0.5 {
            SignalStrength::Moderate
        } else {
            SignalStrength::Weak
        };

        let mut draft = SignalDraft::new(
            asset,
            final_type,
            latest_timestamp,
            price,
            AGGREGATED_STRATEGY,
            strength,
            confidence,
            position_size,
        );
        draft.stop_loss = (stop_weight > 0.0).then(|| stop_sum / stop_weight);
        draft.take_profit = (take_weight > 0.0).then(|| take_sum / take_weight);
        draft.max_risk = (risk_weight > 0.0).then(|| risk_sum / risk_weight);
        draft.analysis_data = Some(Evidence::Aggregated(AggregationEvidence {
            method: "weighted_average".to_string(),
            strategies_combined: relevant.iter().map(|s| s.strategy_name.clone()).collect(),
            original_signals_count: signals.len(),
            relevant_signals_count: relevant.len(),
            dominant_weight: analysis.dominant_weight,
            total_effective_weight: Some(total_weight),
            selected_strategy: None,
            selection_score: None,
            alternatives_count: None,
        }));

        match draft.build() {
            Ok(signal) => Some(signal),
            Err(e) => {
                tracing::error!(asset, error = %e, "failed to build aggregated signal");
                None
            }
        }
    }

    fn strongest_wins(&self, signals: &[&TradingSignal]) -> Option<TradingSignal> {
        let (best, score) = signals
            .iter()
            .map(|s| {
                let weight = self
                    .strategy_weights
                    .get(&s.strategy_name)
                    .copied()
                    .unwrap_or(0.0);
                (*s, s.confidence * weight)
            })
            .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))?;
        if score <= 0.0 {
            return None;
        }

        let mut winner = best.clone();
        winner.strategy_name = AGGREGATED_STRATEGY.to_string();
        winner.signal_id = format!("{AGGREGATED_STRATEGY}_{}_{}", winner.asset, winner.timestamp);
        winner.position_size = winner.position_size.min(self.config.max_position_size);
        winner.analysis_data = Some(Evidence::Aggregated(AggregationEvidence {
            method: "strongest_wins".to_string(),
            strategies_combined: vec![best.strategy_name.clone()],
            original_signals_count: signals.len(),
            relevant_signals_count: 1,
            dominant_weight: score,
            total_effective_weight: None,
            selected_strategy: Some(best.strategy_name.clone()),
            selection_score: Some(score),
            alternatives_count: Some(signals.len() - 1),
        }));
        Some(winner)
    }

    fn risk_weighted(
        &self,
        signals: &[&TradingSignal],
        analysis: &ConflictAnalysis,
    ) -> Option<TradingSignal> {
        let (best, score) = signals
            .iter()
            .map(|s| {
                let weight = self
                    .strategy_weights
                    .get(&s.strategy_name)
                    .copied()
                    .unwrap_or(0.0);
                let ratio = s.risk_reward_ratio().unwrap_or(1.0).min(MAX_RISK_REWARD);
                (*s, s.confidence * weight * ratio)
            })
            .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))?;

        let mut winner = best.clone();
        winner.strategy_name = AGGREGATED_STRATEGY.to_string();
        winner.signal_id = format!("{AGGREGATED_STRATEGY}_{}_{}", winner.asset, winner.timestamp);
        winner.position_size = winner.position_size.min(self.config.max_position_size);
        winner.analysis_data = Some(Evidence::Aggregated(AggregationEvidence {
            method: "risk_weighted".to_string(),
            strategies_combined: vec![best.strategy_name.clone()],
            original_signals_count: signals.len(),
            relevant_signals_count: 1,
            dominant_weight: analysis.dominant_weight,
            total_effective_weight: None,
            selected_strategy: Some(best.strategy_name.clone()),
            selection_score: Some(score),
            alternatives_count: Some(signals.len() - 1),
        }));
        Some(winner)
    }
}

/// Output ordering: highest confidence first, then most recent.
fn sort_signals(signals: &mut [TradingSignal]) {
    signals.sort_by_key(|s| (Reverse(OrderedFloat(s.confidence)), Reverse(s.timestamp)));
}
