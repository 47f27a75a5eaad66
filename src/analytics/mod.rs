pub mod calculator;
pub mod repository;
pub mod resample;
pub mod roc;
pub mod zscore;

/// Shared scalar statistics used across strategies, the aggregator and the
/// backtest metrics.

pub fn mean(data: &[f64]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    data.iter().sum::<f64>() / data.len() as f64
}

/// Sample standard deviation (ddof = 1). Zero for fewer than two points.
pub fn sample_std(data: &[f64]) -> f64 {
    if data.len() < 2 {
        return 0.0;
    }
    let m = mean(data);
    let variance = data.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (data.len() - 1) as f64;
    variance.sqrt()
}

/// Population standard deviation (ddof = 0).
pub fn population_std(data: &[f64]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    let m = mean(data);
    let variance = data.iter().map(|x| (x - m).powi(2)).sum::<f64>() / data.len() as f64;
    variance.sqrt()
}

/// Linear-interpolated percentile (numpy convention). `p` in [0, 100].
pub fn percentile(data: &[f64], p: f64) -> Option<f64> {
    if data.is_empty() || !(0.0..=100.0).contains(&p) {
        return None;
    }
    let mut sorted: Vec<f64> = data.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let rank = p / 100.0 * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        return Some(sorted[lo]);
    }
    let weight = rank - lo as f64;
    Some(sorted[lo] * (1.0 - weight) + sorted[hi] * weight)
}

/// Pearson correlation of two equal-length series. `None` when either side
/// has zero variance or fewer than two points.
pub fn pearson(xs: &[f64], ys: &[f64]) -> Option<f64> {
    if xs.len() != ys.len() || xs.len() < 2 {
        return None;
    }
    let mx = mean(xs);
    let my = mean(ys);
    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for (x, y) in xs.iter().zip(ys) {
        let dx = x - mx;
        let dy = y - my;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }
    if var_x <= 0.0 || var_y <= 0.0 {
        return None;
    }
    let r = cov / (var_x.sqrt() * var_y.sqrt());
    r.is_finite().then_some(r)
}

/// Trailing-window Pearson correlation; entries before the first full window
/// are `None`.
pub fn rolling_pearson(xs: &[f64], ys: &[f64], window: usize) -> Vec<Option<f64>> {
    let n = xs.len().min(ys.len());
    let mut out = vec![None; n];
    if window < 2 || n < window {
        return out;
    }
    for i in (window - 1)..n {
        let start = i + 1 - window;
        out[i] = pearson(&xs[start..=i], &ys[start..=i]);
    }
    out
}

/// Simple percentage returns (`p_t / p_{t-1} - 1`); skips non-positive
/// previous prices.
pub fn pct_returns(prices: &[f64]) -> Vec<f64> {
    prices
        .windows(2)
        .filter(|w| w[0] > 0.0)
        .map(|w| w[1] / w[0] - 1.0)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_and_std() {
        let data = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert!((mean(&data) - 5.0).abs() < 1e-10);
        // Sample std of this classic set is ~2.138, population std is 2.0.
        assert!((population_std(&data) - 2.0).abs() < 1e-10);
        assert!((sample_std(&data) - 2.138_089_935).abs() < 1e-6);
    }

    #[test]
    fn std_of_short_series_is_zero() {
        assert_eq!(sample_std(&[1.0]), 0.0);
        assert_eq!(sample_std(&[]), 0.0);
    }

    #[test]
    fn percentile_matches_linear_interpolation() {
        let data = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(percentile(&data, 0.0), Some(1.0));
        assert_eq!(percentile(&data, 100.0), Some(4.0));
        assert_eq!(percentile(&data, 50.0), Some(2.5));
        assert_eq!(percentile(&data, 25.0), Some(1.75));
    }

    #[test]
    fn percentile_empty_or_out_of_range() {
        assert_eq!(percentile(&[], 50.0), None);
        assert_eq!(percentile(&[1.0], 101.0), None);
    }

    #[test]
    fn pearson_perfect_correlation() {
        let xs = [1.0, 2.0, 3.0, 4.0];
        let ys = [2.0, 4.0, 6.0, 8.0];
        assert!((pearson(&xs, &ys).unwrap() - 1.0).abs() < 1e-12);
        let neg: Vec<f64> = ys.iter().map(|y| -y).collect();
        assert!((pearson(&xs, &neg).unwrap() + 1.0).abs() < 1e-12);
    }

    #[test]
    fn pearson_zero_variance_is_none() {
        assert_eq!(pearson(&[1.0, 1.0, 1.0], &[1.0, 2.0, 3.0]), None);
    }

    #[test]
    fn rolling_pearson_pads_leading_window() {
        let xs = [1.0, 2.0, 3.0, 4.0, 5.0];
        let ys = [1.0, 2.0, 3.0, 4.0, 5.0];
        let rolled = rolling_pearson(&xs, &ys, 3);
        assert_eq!(rolled[0], None);
        assert_eq!(rolled[1], None);
        assert!((rolled[2].unwrap() - 1.0).abs() < 1e-12);
        assert!((rolled[4].unwrap() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn pct_returns_skips_zero_prices() {
        let returns = pct_returns(&[100.0, 110.0, 0.0, 50.0]);
        assert_eq!(returns.len(), 2);
        assert!((returns[0] - 0.1).abs() < 1e-12);
    }
}
