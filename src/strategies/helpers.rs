use rust_ti::standard_indicators::bulk as sti;

use crate::data::CombinedBar;

/// Close series of a combined window.
pub fn closes(bars: &[CombinedBar]) -> Vec<f64> {
    bars.iter().map(|b| b.close).collect()
}

/// Rows where both the close and the VIX observation are present,
/// as (close, vix) pairs.
pub fn clean_close_vix(bars: &[CombinedBar]) -> Vec<(f64, f64)> {
    bars.iter()
        .filter_map(|b| b.vix_value.map(|vix| (b.close, vix)))
        .collect()
}

/// Latest 14-period RSI; neutral 50 when the series is too short.
pub fn latest_rsi(prices: &[f64]) -> f64 {
    if prices.len() < 14 {
        return 50.0;
    }
    let rsi = sti::rsi(prices);
    rsi.last().copied().filter(|v| v.is_finite()).unwrap_or(50.0)
}

/// Latest simple moving average over `period`, `None` when too short.
pub fn latest_sma(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period {
        return None;
    }
    sti::simple_moving_average(prices, period)
        .last()
        .copied()
        .filter(|v| v.is_finite())
}

/// Natural-log returns; non-positive prices are skipped.
pub fn log_returns(prices: &[f64]) -> Vec<f64> {
    prices
        .windows(2)
        .filter(|w| w[0] > 0.0 && w[1] > 0.0)
        .map(|w| (w[1] / w[0]).ln())
        .collect()
}

/// VIX-based position scaling: `clamp(25 / max(vix, floor), 0.5, 1.0)`.
/// Higher VIX means more volatility and a smaller position.
pub fn vix_position_adjustment(vix: f64, floor: f64) -> f64 {
    (25.0 / vix.max(floor)).clamp(0.5, 1.0)
}

/// Drawdown of the last close from the rolling high of the trailing
/// `window` closes: `(high, (high - current) / high)`.
pub fn drawdown_from_rolling_high(prices: &[f64], window: usize) -> Option<(f64, f64)> {
    let current = *prices.last()?;
    let start = prices.len().saturating_sub(window.max(1));
    let high = prices[start..]
        .iter()
        .copied()
        .fold(f64::NEG_INFINITY, f64::max);
    (high > 0.0).then(|| (high, (high - current) / high))
}

/// Percent of values strictly below `current` (0-100).
pub fn percentile_rank_below(values: &[f64], current: f64) -> f64 {
    if values.len() < 2 {
        return 50.0;
    }
    let below = values.iter().filter(|v| **v < current).count();
    below as f64 / values.len() as f64 * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rsi_neutral_for_short_series() {
        assert_eq!(latest_rsi(&[100.0, 101.0]), 50.0);
    }

    #[test]
    fn rsi_high_for_monotone_rise() {
        let prices: Vec<f64> = (0..30).map(|i| 100.0 + f64::from(i)).collect();
        assert!(latest_rsi(&prices) > 70.0);
    }

    #[test]
    fn sma_last_value() {
        let prices = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(latest_sma(&prices, 3), Some(4.0));
        assert_eq!(latest_sma(&prices, 6), None);
        assert_eq!(latest_sma(&prices, 0), None);
    }

    #[test]
    fn vix_adjustment_bounds() {
        assert_eq!(vix_position_adjustment(10.0, 10.0), 1.0);
        assert_eq!(vix_position_adjustment(25.0, 10.0), 1.0);
        assert!((vix_position_adjustment(35.0, 10.0) - 25.0 / 35.0).abs() < 1e-12);
        assert_eq!(vix_position_adjustment(80.0, 10.0), 0.5);
    }

    #[test]
    fn drawdown_from_high() {
        let prices = [100.0, 120.0, 110.0, 90.0];
        let (high, dd) = drawdown_from_rolling_high(&prices, 14).unwrap();
        assert_eq!(high, 120.0);
        assert!((dd - 0.25).abs() < 1e-12);
    }

    #[test]
    fn drawdown_window_restricts_high() {
        let prices = [200.0, 100.0, 105.0, 110.0];
        let (high, _) = drawdown_from_rolling_high(&prices, 3).unwrap();
        assert_eq!(high, 110.0);
    }

    #[test]
    fn percentile_rank() {
        let values = [10.0, 20.0, 30.0, 40.0];
        assert_eq!(percentile_rank_below(&values, 35.0), 75.0);
        assert_eq!(percentile_rank_below(&values, 5.0), 0.0);
        assert_eq!(percentile_rank_below(&[1.0], 5.0), 50.0);
    }

    #[test]
    fn log_returns_skip_non_positive() {
        let returns = log_returns(&[100.0, 110.0, 0.0, 90.0]);
        assert_eq!(returns.len(), 1);
        assert!((returns[0] - (1.1f64).ln()).abs() < 1e-12);
    }
}
