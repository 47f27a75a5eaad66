use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// How to handle a zero previous value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZeroHandling {
    RaiseError,
    #[default]
    ReturnNone,
    /// Signed infinity following the sign of the current value.
    ReturnInf,
    /// Fall back to the absolute change (the current value).
    UseAbsolute,
}

fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

fn check_finite(value: f64, label: &str) -> Result<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(Error::BadNumber(format!("{label} is not finite: {value}")))
    }
}

/// Percentage rate of change: `(current - previous) / previous * 100`,
/// rounded to two decimals.
#[derive(Debug, Clone, Copy, Default)]
pub struct RocCalculator {
    pub zero_handling: ZeroHandling,
}

impl RocCalculator {
    pub fn new(zero_handling: ZeroHandling) -> Self {
        RocCalculator { zero_handling }
    }

    pub fn roc(&self, current: f64, previous: f64) -> Result<Option<f64>> {
        check_finite(current, "current value")?;
        check_finite(previous, "previous value")?;

        if previous == 0.0 {
            return match self.zero_handling {
                ZeroHandling::RaiseError => Err(Error::BadNumber(
                    "cannot calculate ROC: previous value is zero".into(),
                )),
                ZeroHandling::ReturnNone => Ok(None),
                ZeroHandling::ReturnInf => Ok(Some(if current > 0.0 {
                    f64::INFINITY
                } else if current < 0.0 {
                    f64::NEG_INFINITY
                } else {
                    0.0
                })),
                ZeroHandling::UseAbsolute => Ok(Some(current)),
            };
        }

        let roc = (current - previous) / previous * 100.0;
        if !roc.is_finite() {
            return Ok(None);
        }
        Ok(Some(round_to(roc, 2)))
    }

    /// Period-over-period ROC for a series; index 0 is always `None`,
    /// invalid steps become `None`.
    pub fn roc_series(&self, values: &[f64]) -> Vec<Option<f64>> {
        if values.len() < 2 {
            return vec![None; values.len()];
        }
        let mut out = vec![None];
        for window in values.windows(2) {
            out.push(self.roc(window[1], window[0]).unwrap_or(None));
        }
        out
    }

    /// ROC against the value `period` entries back. Empty for series shorter
    /// than `period`; otherwise the first `period` entries are `None`.
    pub fn rolling_roc(&self, values: &[f64], period: usize) -> Vec<Option<f64>> {
        if period == 0 || values.len() < period {
            return Vec::new();
        }
        let mut out = vec![None; values.len()];
        for i in period..values.len() {
            out[i] = self.roc(values[i], values[i - period]).unwrap_or(None);
        }
        out
    }

    /// ROC between the last value and the value `period` entries before it,
    /// `None` when the series is too short.
    pub fn period_roc(&self, values: &[f64], period: usize) -> Result<Option<f64>> {
        if period == 0 {
            return Err(Error::BadNumber("period must be positive".into()));
        }
        if values.len() < period + 1 {
            return Ok(None);
        }
        let current = values[values.len() - 1];
        let previous = values[values.len() - 1 - period];
        if !current.is_finite() || !previous.is_finite() {
            return Ok(None);
        }
        self.roc(current, previous)
    }

    /// Annualized percentage return:
    /// `((current / previous)^(periods_per_year / periods) - 1) * 100`.
    /// `None` for non-positive previous values. Macro analytics annualize
    /// with 252 periods per year.
    pub fn annualized_roc(
        &self,
        current: f64,
        previous: f64,
        periods: u32,
        periods_per_year: u32,
    ) -> Result<Option<f64>> {
        if periods == 0 {
            return Err(Error::BadNumber("periods must be positive".into()));
        }
        if !current.is_finite() || !previous.is_finite() {
            return Ok(None);
        }
        if previous <= 0.0 {
            return Ok(None);
        }
        let annualized =
            (current / previous).powf(f64::from(periods_per_year) / f64::from(periods)) - 1.0;
        if !annualized.is_finite() {
            return Ok(None);
        }
        Ok(Some(round_to(annualized * 100.0, 2)))
    }
}

pub const MACRO_PERIODS_PER_YEAR: u32 = 252;

/// Magnitude category label for a ROC value.
pub fn roc_category(roc: Option<f64>) -> String {
    let Some(value) = roc else {
        return "Invalid".into();
    };
    if !value.is_finite() {
        return "Invalid".into();
    }
    let abs = value.abs();
    if abs == 0.0 {
        return "No Change".into();
    }
    let magnitude = if abs < 1.0 {
        "Minimal"
    } else if abs < 5.0 {
        "Small"
    } else if abs < 15.0 {
        "Moderate"
    } else if abs < 30.0 {
        "Large"
    } else {
        "Extreme"
    };
    let direction = if value > 0.0 { "Increase" } else { "Decrease" };
    format!("{magnitude} {direction}")
}
