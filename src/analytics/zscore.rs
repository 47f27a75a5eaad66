use statrs::distribution::{ContinuousCDF, Normal};

use crate::error::{Error, Result};

const DEFAULT_MIN_STD_DEV: f64 = 1e-10;

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

/// Standard-score calculator: `z = (x - mean) / std`, rounded to four
/// decimals, with a minimum-sigma guard against zero-variance inputs.
#[derive(Debug, Clone, Copy)]
pub struct ZScoreEngine {
    pub min_std_dev: f64,
}

impl Default for ZScoreEngine {
    fn default() -> Self {
        ZScoreEngine {
            min_std_dev: DEFAULT_MIN_STD_DEV,
        }
    }
}

impl ZScoreEngine {
    pub fn z_score(&self, value: f64, mean: f64, std_dev: f64) -> Result<Option<f64>> {
        check_finite(value, "value")?;
        check_finite(mean, "mean")?;
        check_finite(std_dev, "std_dev")?;

        if std_dev.abs() < self.min_std_dev {
            return Ok(None);
        }
        let z = (value - mean) / std_dev;
        if !z.is_finite() {
            return Ok(None);
        }
        Ok(Some(round_to(z, 4)))
    }

    /// Z-score of `value` against the sample statistics (ddof = 1) of
    /// `data`; needs at least two finite points.
    pub fn z_from_data(&self, value: f64, data: &[f64]) -> Result<Option<f64>> {
        check_finite(value, "value")?;

        let finite: Vec<f64> = data.iter().copied().filter(|v| v.is_finite()).collect();
        if finite.len() < 2 {
            return Ok(None);
        }
        let mean = super::mean(&finite);
        let std_dev = super::sample_std(&finite);
        self.z_score(value, mean, std_dev)
    }

    /// Rolling z-scores over a trailing window that includes the current
    /// point. `window` must be > 1, `min_periods` >= 2. Infinite results
    /// become `None`.
    pub fn rolling_z_scores(
        &self,
        values: &[f64],
        window: usize,
        min_periods: usize,
    ) -> Result<Vec<Option<f64>>> {
        if window <= 1 {
            return Err(Error::bad_config(format!("window must be > 1, got {window}")));
        }
        if min_periods < 2 {
            return Err(Error::bad_config(format!(
                "min_periods must be >= 2, got {min_periods}"
            )));
        }

        let mut out = vec![None; values.len()];
        for i in 0..values.len() {
            let start = (i + 1).saturating_sub(window);
            let slice: Vec<f64> = values[start..=i]
                .iter()
                .copied()
                .filter(|v| v.is_finite())
                .collect();
            if slice.len() < min_periods {
                continue;
            }
            let mean = super::mean(&slice);
            let std = super::sample_std(&slice);
            if std < self.min_std_dev {
                continue;
            }
            let z = (values[i] - mean) / std;
            if z.is_finite() {
                out[i] = Some(round_to(z, 4));
            }
        }
        Ok(out)
    }

    /// Z-scores where each point is scored against the `lookback` points
    /// strictly before it (the current point is excluded from the stats).
    pub fn rolling_z_with_lookback(&self, values: &[f64], lookback: usize) -> Vec<Option<f64>> {
        let mut out = vec![None; values.len()];
        if lookback <= 1 || values.len() < lookback + 1 {
            return out;
        }
        for i in lookback..values.len() {
            let slice: Vec<f64> = values[i - lookback..i]
                .iter()
                .copied()
                .filter(|v| v.is_finite())
                .collect();
            if slice.len() < 2 {
                continue;
            }
            let mean = super::mean(&slice);
            let std = super::sample_std(&slice);
            if std < self.min_std_dev {
                continue;
            }
            let z = (values[i] - mean) / std;
            if z.is_finite() {
                out[i] = Some(round_to(z, 4));
            }
        }
        out
    }

    /// Percentile rank (0-100) implied by a z-score under the normal CDF.
    pub fn percentile_from_z(&self, z: f64) -> Option<f64> {
        if !z.is_finite() {
            return None;
        }
        let normal = Normal::new(0.0, 1.0).ok()?;
        Some(round_to(normal.cdf(z) * 100.0, 2))
    }

    pub fn is_outlier(&self, z: Option<f64>, threshold: f64) -> bool {
        z.is_some_and(|v| v.abs() > threshold)
    }
}

/// Magnitude category label for a z-score.
pub fn z_category(z: Option<f64>) -> &'static str {
    let Some(value) = z else { return "Invalid" };
    if !value.is_finite() {
        return "Invalid";
    }
    let abs = value.abs();
    if abs < 0.5 {
        "Near Mean"
    } else if abs < 1.0 {
        "Within 1 Sigma"
    } else if abs < 1.5 {
        "Moderate Deviation"
    } else if abs < 2.0 {
        "Significant Deviation"
    } else if abs < 3.0 {
        "Large Deviation"
    } else {
        "Extreme Deviation"
    }
}
