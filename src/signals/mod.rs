pub mod evidence;
pub mod registry;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Error, Result};
pub use evidence::{AggregationEvidence, Bucket, CorrelationStrength, Evidence};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalType {
    Long,
    Short,
    Hold,
    Close,
}

impl SignalType {
    /// Trade direction implied by the signal type. HOLD has no real
    /// direction; it maps to BUY so the field is always populated.
    pub fn direction(self) -> Direction {
        match self {
            SignalType::Long | SignalType::Hold => Direction::Buy,
            SignalType::Short | SignalType::Close => Direction::Sell,
        }
    }
}

impl std::fmt::Display for SignalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SignalType::Long => "LONG",
            SignalType::Short => "SHORT",
            SignalType::Hold => "HOLD",
            SignalType::Close => "CLOSE",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalStrength {
    #[default]
    Weak,
    Moderate,
    Strong,
}

impl std::str::FromStr for SignalStrength {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "WEAK" => Ok(SignalStrength::Weak),
            "MODERATE" => Ok(SignalStrength::Moderate),
            "STRONG" => Ok(SignalStrength::Strong),
            other => Err(Error::bad_config(format!(
                "unknown signal strength '{other}', expected WEAK|MODERATE|STRONG"
            ))),
        }
    }
}

impl SignalStrength {
    /// Ordering rank: WEAK < MODERATE < STRONG.
    pub fn rank(self) -> u8 {
        match self {
            SignalStrength::Weak => 0,
            SignalStrength::Moderate => 1,
            SignalStrength::Strong => 2,
        }
    }
}

impl std::fmt::Display for SignalStrength {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SignalStrength::Weak => "WEAK",
            SignalStrength::Moderate => "MODERATE",
            SignalStrength::Strong => "STRONG",
        };
        f.write_str(s)
    }
}

/// One actionable trading signal. Construction goes through [`SignalDraft`]
/// so the invariants (confidence and position size in [0, 1], positive price,
/// max risk in (0, 1]) hold for every instance in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingSignal {
    pub signal_id: String,
    pub asset: String,
    pub signal_type: SignalType,
    pub direction: Direction,
    #[serde(deserialize_with = "coerce_timestamp")]
    pub timestamp: i64,
    pub price: f64,
    pub strategy_name: String,
    pub signal_strength: SignalStrength,
    pub confidence: f64,
    pub position_size: f64,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
    #[serde(default)]
    pub max_risk: Option<f64>,
    #[serde(default)]
    pub analysis_data: Option<Evidence>,
    #[serde(default)]
    pub correlation_value: Option<f64>,
    pub created_at: DateTime<Utc>,
}

/// Mixed upstream representations send timestamps as integers or numeric
/// strings; coerce to integer milliseconds at ingress, 0 on failure.
fn coerce_timestamp<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(i64),
        Float(f64),
        Text(String),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Int(v) => v,
        Raw::Float(v) => v as i64,
        Raw::Text(s) => s.trim().parse::<i64>().unwrap_or(0),
    })
}

impl TradingSignal {
    /// Reward-to-risk ratio when both stop loss and take profit are set.
    pub fn risk_reward_ratio(&self) -> Option<f64> {
        let stop = self.stop_loss?;
        let take = self.take_profit?;

        let (risk, reward) = match self.signal_type {
            SignalType::Long => ((self.price - stop).abs(), (take - self.price).abs()),
            SignalType::Short => ((stop - self.price).abs(), (self.price - take).abs()),
            SignalType::Hold | SignalType::Close => return None,
        };

        (risk > 0.0).then(|| reward / risk)
    }

    /// Parse a signal from its wire form and re-check construction invariants.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let signal: TradingSignal = serde_json::from_value(value)
            .map_err(|e| Error::bad_config(format!("malformed signal: {e}")))?;
        validate_invariants(
            signal.confidence,
            signal.position_size,
            signal.price,
            signal.max_risk,
        )?;
        Ok(signal)
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

fn validate_invariants(
    confidence: f64,
    position_size: f64,
    price: f64,
    max_risk: Option<f64>,
) -> Result<()> {
    if !(0.0..=1.0).contains(&confidence) {
        return Err(Error::bad_config(format!(
            "confidence must be between 0.0 and 1.0, got {confidence}"
        )));
    }
    if !(0.0..=1.0).contains(&position_size) {
        return Err(Error::bad_config(format!(
            "position size must be between 0.0 and 1.0, got {position_size}"
        )));
    }
    if price <= 0.0 {
        return Err(Error::bad_config(format!(
            "price must be positive, got {price}"
        )));
    }
    if let Some(risk) = max_risk {
        if risk <= 0.0 || risk > 1.0 {
            return Err(Error::bad_config(format!(
                "max risk must be in (0.0, 1.0], got {risk}"
            )));
        }
    }
    Ok(())
}

/// Unvalidated signal parameters. `build` enforces the invariants, derives
/// the direction, stamps `created_at` and derives the signal id
/// (`{strategy}_{asset}_{timestamp}`) when none is supplied.
#[derive(Debug, Clone)]
pub struct SignalDraft {
    pub asset: String,
    pub signal_type: SignalType,
    pub timestamp: i64,
    pub price: f64,
    pub strategy_name: String,
    pub signal_strength: SignalStrength,
    pub confidence: f64,
    pub position_size: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub max_risk: Option<f64>,
    pub analysis_data: Option<Evidence>,
    pub correlation_value: Option<f64>,
    pub signal_id: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

impl SignalDraft {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        asset: impl Into<String>,
        signal_type: SignalType,
        timestamp: i64,
        price: f64,
        strategy_name: impl Into<String>,
        signal_strength: SignalStrength,
        confidence: f64,
        position_size: f64,
    ) -> Self {
        SignalDraft {
            asset: asset.into(),
            signal_type,
            timestamp,
            price,
            strategy_name: strategy_name.into(),
            signal_strength,
            confidence,
            position_size,
            stop_loss: None,
            take_profit: None,
            max_risk: None,
            analysis_data: None,
            correlation_value: None,
            signal_id: None,
            created_at: None,
        }
    }

    pub fn build(self) -> Result<TradingSignal> {
        validate_invariants(self.confidence, self.position_size, self.price, self.max_risk)?;

        let signal_id = self.signal_id.unwrap_or_else(|| {
            format!("{}_{}_{}", self.strategy_name, self.asset, self.timestamp)
        });

        Ok(TradingSignal {
            signal_id,
            asset: self.asset,
            signal_type: self.signal_type,
            direction: self.signal_type.direction(),
            timestamp: self.timestamp,
            price: self.price,
            strategy_name: self.strategy_name,
            signal_strength: self.signal_strength,
            confidence: self.confidence,
            position_size: self.position_size,
            stop_loss: self.stop_loss,
            take_profit: self.take_profit,
            max_risk: self.max_risk,
            analysis_data: self.analysis_data,
            correlation_value: self.correlation_value,
            created_at: self.created_at.unwrap_or_else(Utc::now),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft() -> SignalDraft {
        SignalDraft::new(
            "bitcoin",
            SignalType::Long,
            1_700_000_000_000,
            50_000.0,
            "vix_correlation",
            SignalStrength::Strong,
            0.85,
            0.02,
        )
    }

    #[test]
    fn build_derives_id_and_direction() {
        let signal = draft().build().unwrap();
        assert_eq!(signal.signal_id, "vix_correlation_bitcoin_1700000000000");
        assert_eq!(signal.direction, Direction::Buy);
    }

    #[test]
    fn build_keeps_explicit_id() {
        let mut d = draft();
        d.signal_id = Some("custom-id".into());
        assert_eq!(d.build().unwrap().signal_id, "custom-id");
    }

    #[test]
    fn rejects_out_of_range_confidence() {
        let mut d = draft();
        d.confidence = 1.5;
        assert!(matches!(d.build(), Err(Error::BadConfig(_))));
    }

    #[test]
    fn rejects_out_of_range_position_size() {
        let mut d = draft();
        d.position_size = -0.1;
        assert!(d.build().is_err());
    }

    #[test]
    fn rejects_non_positive_price() {
        let mut d = draft();
        d.price = 0.0;
        assert!(d.build().is_err());
    }

    #[test]
    fn rejects_invalid_max_risk() {
        let mut d = draft();
        d.max_risk = Some(0.0);
        assert!(d.build().is_err());
        let mut d = draft();
        d.max_risk = Some(1.5);
        assert!(d.build().is_err());
    }

    #[test]
    fn short_signal_direction_is_sell() {
        let mut d = draft();
        d.signal_type = SignalType::Short;
        assert_eq!(d.build().unwrap().direction, Direction::Sell);
    }

    #[test]
    fn serde_round_trip_preserves_fields() {
        let mut d = draft();
        d.stop_loss = Some(47_500.0);
        d.take_profit = Some(55_000.0);
        d.max_risk = Some(0.02);
        d.correlation_value = Some(-0.72);
        let signal = d.build().unwrap();

        let json = serde_json::to_value(&signal).unwrap();
        assert_eq!(json["signal_type"], "LONG");
        assert_eq!(json["signal_strength"], "STRONG");
        assert_eq!(json["direction"], "BUY");

        let parsed = TradingSignal::from_value(json).unwrap();
        assert_eq!(parsed.signal_id, signal.signal_id);
        assert_eq!(parsed.timestamp, signal.timestamp);
        assert_eq!(parsed.price, signal.price);
        assert_eq!(parsed.stop_loss, signal.stop_loss);
        assert_eq!(parsed.take_profit, signal.take_profit);
        assert_eq!(parsed.confidence, signal.confidence);
        assert_eq!(parsed.created_at, signal.created_at);
    }

    #[test]
    fn string_timestamp_coerces_to_int() {
        let mut json = draft().build().unwrap().to_value();
        json["timestamp"] = serde_json::Value::String("1700000000000".into());
        let parsed = TradingSignal::from_value(json).unwrap();
        assert_eq!(parsed.timestamp, 1_700_000_000_000);
    }

    #[test]
    fn garbage_timestamp_coerces_to_zero() {
        let mut json = draft().build().unwrap().to_value();
        json["timestamp"] = serde_json::Value::String("not-a-number".into());
        let parsed = TradingSignal::from_value(json).unwrap();
        assert_eq!(parsed.timestamp, 0);
    }

    #[test]
    fn risk_reward_ratio_long() {
        let mut d = draft();
        d.price = 100.0;
        d.stop_loss = Some(95.0);
        d.take_profit = Some(110.0);
        let signal = d.build().unwrap();
        assert!((signal.risk_reward_ratio().unwrap() - 2.0).abs() < 1e-10);
    }

    #[test]
    fn risk_reward_ratio_missing_levels() {
        assert!(draft().build().unwrap().risk_reward_ratio().is_none());
    }

    #[test]
    fn strength_ordering() {
        assert!(SignalStrength::Weak.rank() < SignalStrength::Moderate.rank());
        assert!(SignalStrength::Moderate.rank() < SignalStrength::Strong.rank());
    }
}
