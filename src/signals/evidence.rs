use serde::{Deserialize, Serialize};

/// Strength class for a Pearson correlation, by absolute value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CorrelationStrength {
    VeryStrong,
    Strong,
    Moderate,
    Weak,
    Negligible,
    InsufficientData,
}

impl CorrelationStrength {
    pub fn classify(correlation: Option<f64>) -> Self {
        let Some(r) = correlation else {
            return CorrelationStrength::InsufficientData;
        };
        if !r.is_finite() {
            return CorrelationStrength::InsufficientData;
        }
        let abs = r.abs();
        if abs >= 0.7 {
            CorrelationStrength::VeryStrong
        } else if abs >= 0.5 {
            CorrelationStrength::Strong
        } else if abs >= 0.3 {
            CorrelationStrength::Moderate
        } else if abs >= 0.1 {
            CorrelationStrength::Weak
        } else {
            CorrelationStrength::Negligible
        }
    }

    /// Rank for monotonicity checks: higher |r| never maps to a lower class.
    pub fn rank(self) -> u8 {
        match self {
            CorrelationStrength::InsufficientData => 0,
            CorrelationStrength::Negligible => 1,
            CorrelationStrength::Weak => 2,
            CorrelationStrength::Moderate => 3,
            CorrelationStrength::Strong => 4,
            CorrelationStrength::VeryStrong => 5,
        }
    }
}

/// Multi-bucket portfolio bucket an opportunity belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bucket {
    MomentumLong,
    ResidualLong,
    ResidualShort,
    MeanReversionLong,
    MeanReversionShort,
    PairLongSpread,
    PairShortSpread,
}

impl Bucket {
    pub fn as_str(self) -> &'static str {
        match self {
            Bucket::MomentumLong => "momentum_long",
            Bucket::ResidualLong => "residual_long",
            Bucket::ResidualShort => "residual_short",
            Bucket::MeanReversionLong => "mean_reversion_long",
            Bucket::MeanReversionShort => "mean_reversion_short",
            Bucket::PairLongSpread => "pair_long_spread",
            Bucket::PairShortSpread => "pair_short_spread",
        }
    }
}

/// Aggregation metadata attached to combined signals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationEvidence {
    pub method: String,
    pub strategies_combined: Vec<String>,
    pub original_signals_count: usize,
    pub relevant_signals_count: usize,
    pub dominant_weight: f64,
    #[serde(default)]
    pub total_effective_weight: Option<f64>,
    #[serde(default)]
    pub selected_strategy: Option<String>,
    #[serde(default)]
    pub selection_score: Option<f64>,
    #[serde(default)]
    pub alternatives_count: Option<usize>,
}

/// Strategy-specific supporting evidence carried on each signal. A tagged
/// union instead of a free-form map so downstream consumers keep the fields
/// that drive decisions (VIX level, drawdown depth, spread z-score) with
/// their semantics intact; serializes to the flat JSON object used on the
/// wire and in the alert log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Evidence {
    VixCorrelation {
        vix_level: f64,
        correlation_strength: CorrelationStrength,
        vix_adjustment_factor: f64,
    },
    MeanReversion {
        vix_level: f64,
        drawdown_from_high: f64,
        vix_percentile: f64,
        price_rsi: f64,
        vix_adjustment_factor: f64,
        confidence_adjustment_factor: f64,
        stop_loss_pct: f64,
        take_profit_pct: f64,
    },
    Volatility {
        volatility: f64,
        volatility_threshold: f64,
        volatility_ratio: f64,
        volatility_window_minutes: u32,
        reason: String,
    },
    Momentum {
        momentum_strength: f64,
        rsi: f64,
        short_ma: f64,
        long_ma: f64,
        reason: String,
    },
    MultiBucket {
        bucket: Bucket,
        #[serde(default)]
        composite_momentum: Option<f64>,
        #[serde(default)]
        residual_zscore: Option<f64>,
        #[serde(default)]
        beta: Option<f64>,
        #[serde(default)]
        z7: Option<f64>,
        #[serde(default)]
        spread_zscore: Option<f64>,
        leverage_factor: f64,
        risk_off: bool,
    },
    Aggregated(AggregationEvidence),
}
