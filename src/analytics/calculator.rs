use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use super::resample::{resample, Timeframe};
use super::roc::{RocCalculator, MACRO_PERIODS_PER_YEAR};
use super::zscore::ZScoreEngine;
use crate::error::{Error, Result};

/// Statistical snapshot of one macro indicator on one timeframe. Identity is
/// `(indicator, timeframe, timestamp)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MacroIndicatorMetrics {
    pub indicator: String,
    pub timeframe: String,
    /// Millisecond timestamp of the latest resampled period.
    pub timestamp: i64,
    pub current_value: f64,
    pub rate_of_change: f64,
    pub z_score: f64,
    pub percentile_rank: f64,
    pub mean: f64,
    pub std_dev: f64,
    pub lookback_period: usize,
}

impl MacroIndicatorMetrics {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        indicator: impl Into<String>,
        timeframe: impl Into<String>,
        timestamp: i64,
        current_value: f64,
        rate_of_change: f64,
        z_score: f64,
        percentile_rank: f64,
        mean: f64,
        std_dev: f64,
        lookback_period: usize,
    ) -> Result<Self> {
        let indicator = indicator.into();
        let timeframe = timeframe.into();
        if indicator.trim().is_empty() {
            return Err(Error::bad_config("indicator cannot be empty"));
        }
        if timeframe.trim().is_empty() {
            return Err(Error::bad_config("timeframe cannot be empty"));
        }
        if !(0.0..=100.0).contains(&percentile_rank) {
            return Err(Error::bad_config(format!(
                "percentile_rank must be in [0, 100], got {percentile_rank}"
            )));
        }
        if std_dev < 0.0 {
            return Err(Error::bad_config(format!(
                "std_dev must be >= 0, got {std_dev}"
            )));
        }
        if lookback_period < 1 {
            return Err(Error::bad_config("lookback_period must be >= 1"));
        }
        Ok(MacroIndicatorMetrics {
            indicator,
            timeframe,
            timestamp,
            current_value,
            rate_of_change,
            z_score,
            percentile_rank,
            mean,
            std_dev,
            lookback_period,
        })
    }

    pub fn is_outlier(&self, threshold: f64) -> bool {
        self.z_score.abs() > threshold
    }
}

/// Computes per-timeframe metrics for macro indicator series.
#[derive(Debug, Default)]
pub struct MacroCalculator {
    roc: RocCalculator,
    zscore: ZScoreEngine,
}

impl MacroCalculator {
    pub fn new() -> Self {
        MacroCalculator::default()
    }

    /// Resample the raw observations into `timeframe` and compute metrics
    /// over the timeframe's analysis window. Returns `Ok(None)` when there
    /// is not enough data; that is a value, not an error.
    pub fn compute(
        &self,
        indicator: &str,
        timeframe: Timeframe,
        observations: &[(NaiveDateTime, f64)],
    ) -> Result<Option<MacroIndicatorMetrics>> {
        let config = timeframe.config();
        let resampled = resample(observations, timeframe);
        if resampled.len() < config.min_data_points {
            tracing::debug!(
                indicator,
                timeframe = config.key,
                points = resampled.len(),
                needed = config.min_data_points,
                "insufficient data for metrics"
            );
            return Ok(None);
        }

        let window_start = resampled.len().saturating_sub(config.analysis_periods);
        let window: Vec<f64> = resampled[window_start..].iter().map(|p| p.value).collect();

        let last = resampled.last().expect("non-empty after length check");
        let current = last.value;
        let previous = resampled[resampled.len() - 2].value;

        let rate_of_change = self.roc.roc(current, previous)?.unwrap_or(0.0);
        let mean = super::mean(&window);
        let std_dev = super::sample_std(&window);
        let z_score = self.zscore.z_score(current, mean, std_dev)?.unwrap_or(0.0);
        let percentile_rank = self.zscore.percentile_from_z(z_score).unwrap_or(50.0);

        let metrics = MacroIndicatorMetrics::new(
            indicator,
            config.key,
            last.period_start.and_utc().timestamp_millis(),
            current,
            rate_of_change,
            z_score,
            percentile_rank,
            mean,
            std_dev,
            window.len(),
        )?;
        Ok(Some(metrics))
    }

    /// Annualized rate of change between the first and last resampled values,
    /// using the macro convention of 252 periods per year.
    pub fn annualized_change(
        &self,
        timeframe: Timeframe,
        observations: &[(NaiveDateTime, f64)],
    ) -> Result<Option<f64>> {
        let resampled = resample(observations, timeframe);
        if resampled.len() < 2 {
            return Ok(None);
        }
        let first = resampled[0].value;
        let last = resampled[resampled.len() - 1].value;
        self.roc.annualized_roc(
            last,
            first,
            (resampled.len() - 1) as u32,
            MACRO_PERIODS_PER_YEAR,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn day(i: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, i)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    #[test]
    fn metrics_validation() {
        assert!(MacroIndicatorMetrics::new("VIX", "1d", 0, 20.0, 1.0, 0.5, 120.0, 19.0, 2.0, 30)
            .is_err());
        assert!(MacroIndicatorMetrics::new("VIX", "1d", 0, 20.0, 1.0, 0.5, 50.0, 19.0, -1.0, 30)
            .is_err());
        assert!(MacroIndicatorMetrics::new("", "1d", 0, 20.0, 1.0, 0.5, 50.0, 19.0, 2.0, 30)
            .is_err());
        assert!(MacroIndicatorMetrics::new("VIX", " ", 0, 20.0, 1.0, 0.5, 50.0, 19.0, 2.0, 30)
            .is_err());
        assert!(MacroIndicatorMetrics::new("VIX", "1d", 0, 20.0, 1.0, 0.5, 50.0, 19.0, 2.0, 0)
            .is_err());
    }

    #[test]
    fn outlier_check() {
        let m = MacroIndicatorMetrics::new("VIX", "1d", 0, 35.0, 5.0, 2.4, 99.0, 20.0, 6.0, 30)
            .unwrap();
        assert!(m.is_outlier(2.0));
        assert!(!m.is_outlier(3.0));
    }

    #[test]
    fn compute_requires_min_points() {
        let calc = MacroCalculator::new();
        let observations: Vec<(NaiveDateTime, f64)> =
            (1..=3).map(|i| (day(i), 20.0 + f64::from(i))).collect();
        // 1d needs 5 points.
        assert!(calc
            .compute("VIX", Timeframe::D1, &observations)
            .unwrap()
            .is_none());
    }

    #[test]
    fn compute_daily_metrics() {
        let calc = MacroCalculator::new();
        let observations: Vec<(NaiveDateTime, f64)> = (1..=20)
            .map(|i| (day(i), 20.0 + f64::from(i) * 0.5))
            .collect();
        let metrics = calc
            .compute("VIX", Timeframe::D1, &observations)
            .unwrap()
            .unwrap();
        assert_eq!(metrics.indicator, "VIX");
        assert_eq!(metrics.timeframe, "1d");
        assert_eq!(metrics.current_value, 30.0);
        // 29.5 -> 30.0 is ~1.69%.
        assert!((metrics.rate_of_change - 1.69).abs() < 0.01);
        assert_eq!(metrics.lookback_period, 20);
        assert!(metrics.z_score > 0.0);
        assert!(metrics.percentile_rank > 50.0);
    }

    #[test]
    fn compute_flat_series_has_zero_z() {
        let calc = MacroCalculator::new();
        let observations: Vec<(NaiveDateTime, f64)> = (1..=10).map(|i| (day(i), 20.0)).collect();
        let metrics = calc
            .compute("DFF", Timeframe::D1, &observations)
            .unwrap()
            .unwrap();
        assert_eq!(metrics.z_score, 0.0);
        assert_eq!(metrics.percentile_rank, 50.0);
        assert_eq!(metrics.rate_of_change, 0.0);
    }

    #[test]
    fn annualized_change_uses_252() {
        let calc = MacroCalculator::new();
        let observations: Vec<(NaiveDateTime, f64)> = vec![(day(1), 100.0), (day(2), 101.0)];
        let annualized = calc
            .annualized_change(Timeframe::D1, &observations)
            .unwrap()
            .unwrap();
        // (1.01)^252 - 1 as percent.
        let expected = (1.01f64.powi(252) - 1.0) * 100.0;
        assert!((annualized - (expected * 100.0).round() / 100.0).abs() < 0.01);
    }
}
