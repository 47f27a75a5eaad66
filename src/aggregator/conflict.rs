use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::config::ConflictResolution;
use crate::signals::{SignalType, TradingSignal};

/// Per-asset conflict analysis over the signals competing for that asset.
#[derive(Debug, Clone, Serialize)]
pub struct ConflictAnalysis {
    pub signal_count: usize,
    pub unique_types: Vec<SignalType>,
    pub has_conflict: bool,
    pub has_opposing: bool,
    pub dominant_type: SignalType,
    pub dominant_weight: f64,
    pub type_weights: Vec<(SignalType, f64)>,
    pub strategy_weights_sum: f64,
}

/// Weighted vote per signal type; the dominant type carries the largest
/// summed strategy weight.
pub fn analyze_conflicts(
    signals: &[&TradingSignal],
    strategy_weights: &HashMap<String, f64>,
) -> ConflictAnalysis {
    let mut type_weights: Vec<(SignalType, f64)> = Vec::new();
    let mut unique_types: Vec<SignalType> = Vec::new();
    let mut weights_sum = 0.0;

    for signal in signals {
        let weight = strategy_weights
            .get(&signal.strategy_name)
            .copied()
            .unwrap_or(0.0);
        weights_sum += weight;

        match type_weights.iter_mut().find(|(t, _)| *t == signal.signal_type) {
            Some((_, w)) => *w += weight,
            None => type_weights.push((signal.signal_type, weight)),
        }
        if !unique_types.contains(&signal.signal_type) {
            unique_types.push(signal.signal_type);
        }
    }

    let (dominant_type, dominant_weight) = type_weights
        .iter()
        .fold((SignalType::Hold, 0.0), |best, (t, w)| {
            if *w > best.1 {
                (*t, *w)
            } else {
                best
            }
        });

    let has_conflict = unique_types.len() > 1 && !unique_types.contains(&SignalType::Hold);
    let has_opposing =
        unique_types.contains(&SignalType::Long) && unique_types.contains(&SignalType::Short);

    ConflictAnalysis {
        signal_count: signals.len(),
        unique_types,
        has_conflict,
        has_opposing,
        dominant_type,
        dominant_weight,
        type_weights,
        strategy_weights_sum: weights_sum,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    NoAction,
    ResolveWithDominant,
    ResolveWithCaution,
    AvoidTrade,
    Aggregate,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolutionRecommendation {
    pub asset: String,
    pub action: RecommendedAction,
    pub reason: String,
    pub suggested_method: ConflictResolution,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConflictSignalInfo {
    pub strategy: String,
    pub signal_type: SignalType,
    pub confidence: f64,
    pub strategy_weight: f64,
    pub effective_weight: f64,
    pub position_size: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AssetConflict {
    pub signal_count: usize,
    pub signal_types: Vec<SignalType>,
    pub has_opposing: bool,
    pub dominant_type: SignalType,
    pub dominant_weight: f64,
    pub strategy_weights_sum: f64,
    pub signals: Vec<ConflictSignalInfo>,
    pub resolution_recommendation: ResolutionRecommendation,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConflictSummary {
    pub assets_with_conflicts: usize,
    pub assets_with_opposing_signals: usize,
    pub total_conflicts: usize,
    pub resolution_required: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationKind {
    Info,
    Warning,
    Action,
}

#[derive(Debug, Clone, Serialize)]
pub struct Recommendation {
    pub kind: RecommendationKind,
    pub message: String,
    pub suggested_action: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConflictReport {
    pub total_signals: usize,
    pub unique_assets: usize,
    pub conflict_summary: ConflictSummary,
    pub conflicts: BTreeMap<String, AssetConflict>,
    pub resolution_recommendations: Vec<Recommendation>,
}

/// Recommendation for one conflicted asset, graded by how decisive the
/// dominant side is.
pub fn recommend_resolution(
    asset: &str,
    analysis: &ConflictAnalysis,
    configured_method: ConflictResolution,
) -> ResolutionRecommendation {
    if !analysis.has_conflict {
        return ResolutionRecommendation {
            asset: asset.to_string(),
            action: RecommendedAction::NoAction,
            reason: "No conflict detected".to_string(),
            suggested_method: configured_method,
            confidence: 0.0,
        };
    }

    if analysis.has_opposing {
        if analysis.dominant_weight > 0.7 {
            ResolutionRecommendation {
                asset: asset.to_string(),
                action: RecommendedAction::ResolveWithDominant,
                reason: format!(
                    "Strong dominant signal ({:.1}%)",
                    analysis.dominant_weight * 100.0
                ),
                suggested_method: configured_method,
                confidence: analysis.dominant_weight,
            }
        } else if analysis.dominant_weight > 0.5 {
            ResolutionRecommendation {
                asset: asset.to_string(),
                action: RecommendedAction::ResolveWithCaution,
                reason: format!(
                    "Moderate dominant signal ({:.1}%)",
                    analysis.dominant_weight * 100.0
                ),
                suggested_method: ConflictResolution::Conservative,
                confidence: analysis.dominant_weight,
            }
        } else {
            ResolutionRecommendation {
                asset: asset.to_string(),
                action: RecommendedAction::AvoidTrade,
                reason: format!(
                    "Weak dominant signal ({:.1}%)",
                    analysis.dominant_weight * 100.0
                ),
                suggested_method: configured_method,
                confidence: 0.0,
            }
        }
    } else {
        ResolutionRecommendation {
            asset: asset.to_string(),
            action: RecommendedAction::Aggregate,
            reason: "Same direction signals - safe to aggregate".to_string(),
            suggested_method: configured_method,
            confidence: analysis.dominant_weight,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::{SignalDraft, SignalStrength};

    fn signal(strategy: &str, signal_type: SignalType, confidence: f64) -> TradingSignal {
        SignalDraft::new(
            "bitcoin",
            signal_type,
            1_700_000_000_000,
            50_000.0,
            strategy,
            SignalStrength::Moderate,
            confidence,
            0.02,
        )
        .build()
        .unwrap()
    }

    fn weights() -> HashMap<String, f64> {
        HashMap::from([("a".to_string(), 0.6), ("b".to_string(), 0.4)])
    }

    #[test]
    fn opposing_signals_are_flagged() {
        let long = signal("a", SignalType::Long, 0.8);
        let short = signal("b", SignalType::Short, 0.7);
        let analysis = analyze_conflicts(&[&long, &short], &weights());
        assert!(analysis.has_conflict);
        assert!(analysis.has_opposing);
        assert_eq!(analysis.dominant_type, SignalType::Long);
        assert!((analysis.dominant_weight - 0.6).abs() < 1e-12);
        assert!((analysis.strategy_weights_sum - 1.0).abs() < 1e-12);
    }

    #[test]
    fn hold_suppresses_conflict_flag() {
        let long = signal("a", SignalType::Long, 0.8);
        let hold = signal("b", SignalType::Hold, 0.5);
        let analysis = analyze_conflicts(&[&long, &hold], &weights());
        assert!(!analysis.has_conflict);
        assert!(!analysis.has_opposing);
    }

    #[test]
    fn agreement_accumulates_weight() {
        let one = signal("a", SignalType::Long, 0.8);
        let two = signal("b", SignalType::Long, 0.6);
        let analysis = analyze_conflicts(&[&one, &two], &weights());
        assert!(!analysis.has_conflict);
        assert_eq!(analysis.dominant_type, SignalType::Long);
        assert!((analysis.dominant_weight - 1.0).abs() < 1e-12);
    }

    #[test]
    fn unknown_strategy_contributes_zero_weight() {
        let unknown = signal("mystery", SignalType::Short, 0.9);
        let analysis = analyze_conflicts(&[&unknown], &weights());
        assert_eq!(analysis.dominant_weight, 0.0);
    }

    #[test]
    fn empty_input_defaults_to_hold() {
        let analysis = analyze_conflicts(&[], &weights());
        assert_eq!(analysis.dominant_type, SignalType::Hold);
        assert_eq!(analysis.signal_count, 0);
    }

    #[test]
    fn recommendation_grades_by_dominance() {
        let strong_long = signal("a", SignalType::Long, 0.9);
        let weak_short = signal("b", SignalType::Short, 0.4);
        let analysis = analyze_conflicts(&[&strong_long, &weak_short], &weights());
        let rec = recommend_resolution("bitcoin", &analysis, ConflictResolution::WeightedAverage);
        assert_eq!(rec.action, RecommendedAction::ResolveWithCaution);
        assert_eq!(rec.suggested_method, ConflictResolution::Conservative);

        // 50/50 split: avoid.
        let even = HashMap::from([("a".to_string(), 0.5), ("b".to_string(), 0.5)]);
        let analysis = analyze_conflicts(&[&strong_long, &weak_short], &even);
        let rec = recommend_resolution("bitcoin", &analysis, ConflictResolution::WeightedAverage);
        assert_eq!(rec.action, RecommendedAction::AvoidTrade);
    }
}
