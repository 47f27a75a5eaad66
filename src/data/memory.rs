use chrono::NaiveDate;
use rustc_hash::FxHashMap;

use super::{
    day_start_ms, fill_daily_gaps, parse_date, CombinedBar, IndicatorPoint, MarketBar,
    MarketStore, DOLLAR_INDEX, FED_FUNDS, TREASURY_10Y, VIX,
};
use crate::error::Result;

/// In-memory market-data store. Used by tests and backtest fixtures; the
/// read side is the same `MarketStore` contract the sqlite store implements.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    ohlcv: FxHashMap<String, Vec<MarketBar>>,
    indicators: FxHashMap<String, Vec<(NaiveDate, f64)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    pub fn add_bars(&mut self, asset: &str, bars: Vec<MarketBar>) {
        let series = self.ohlcv.entry(asset.to_string()).or_default();
        series.extend(bars);
        series.sort_by_key(|b| b.timestamp);
        series.dedup_by_key(|b| b.timestamp);
    }

    /// Convenience fixture builder: one daily bar per close starting at
    /// `start`, with a small synthetic intraday range.
    pub fn add_daily_closes(&mut self, asset: &str, start: NaiveDate, closes: &[f64]) {
        let bars = closes
            .iter()
            .enumerate()
            .map(|(i, &close)| MarketBar {
                timestamp: day_start_ms(start + chrono::Duration::days(i as i64)),
                open: close * 0.995,
                high: close * 1.01,
                low: close * 0.99,
                close,
                volume: 1_000.0,
            })
            .collect();
        self.add_bars(asset, bars);
    }

    pub fn add_indicator_values(&mut self, indicator: &str, start: NaiveDate, values: &[f64]) {
        let series = self.indicators.entry(indicator.to_string()).or_default();
        for (i, &value) in values.iter().enumerate() {
            series.push((start + chrono::Duration::days(i as i64), value));
        }
        series.sort_by_key(|(date, _)| *date);
        series.dedup_by_key(|(date, _)| *date);
    }

    pub fn add_indicator_point(&mut self, indicator: &str, date: NaiveDate, value: f64) {
        self.add_indicator_values(indicator, date, &[value]);
    }

    fn indicator_on(&self, indicator: &str, date: NaiveDate) -> Option<f64> {
        self.indicators
            .get(indicator)?
            .iter()
            .find(|(d, _)| *d == date)
            .map(|(_, v)| *v)
    }
}

impl MarketStore for MemoryStore {
    fn get_ohlcv(&self, asset: &str, days: u32) -> Result<Vec<MarketBar>> {
        let Some(series) = self.ohlcv.get(asset) else {
            return Ok(Vec::new());
        };
        let skip = series.len().saturating_sub(days as usize);
        Ok(series[skip..].to_vec())
    }

    fn get_combined(&self, asset: &str, days: u32) -> Result<Vec<CombinedBar>> {
        let bars = self.get_ohlcv(asset, days)?;
        Ok(bars
            .into_iter()
            .filter_map(|bar| {
                let date = chrono::DateTime::from_timestamp_millis(bar.timestamp)?.date_naive();
                Some(CombinedBar {
                    date,
                    timestamp: bar.timestamp,
                    open: bar.open,
                    high: bar.high,
                    low: bar.low,
                    close: bar.close,
                    volume: bar.volume,
                    vix_value: self.indicator_on(VIX, date),
                    fed_funds_rate: self.indicator_on(FED_FUNDS, date),
                    treasury_10y_rate: self.indicator_on(TREASURY_10Y, date),
                    dollar_index: self.indicator_on(DOLLAR_INDEX, date),
                })
            })
            .collect())
    }

    fn get_indicator(
        &self,
        indicator: &str,
        start_date: &str,
        end_date: &str,
        interpolate: bool,
    ) -> Result<Vec<IndicatorPoint>> {
        let start = parse_date(start_date)?;
        let end = parse_date(end_date)?;
        if end < start {
            return Ok(Vec::new());
        }

        let observations: Vec<(NaiveDate, f64)> = self
            .indicators
            .get(indicator)
            .map(|series| {
                series
                    .iter()
                    .filter(|(date, _)| *date >= start && *date <= end)
                    .copied()
                    .collect()
            })
            .unwrap_or_default();

        if interpolate {
            Ok(fill_daily_gaps(&observations, start, end))
        } else {
            Ok(observations
                .into_iter()
                .map(|(date, value)| IndicatorPoint::observed(date, value))
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        parse_date(s).unwrap()
    }

    #[test]
    fn daily_closes_are_windowed() {
        let mut store = MemoryStore::new();
        store.add_daily_closes("bitcoin", d("2024-01-01"), &[1.0, 2.0, 3.0, 4.0, 5.0]);
        let bars = store.get_ohlcv("bitcoin", 3).unwrap();
        assert_eq!(bars.len(), 3);
        assert_eq!(bars[0].close, 3.0);
        assert_eq!(bars[2].close, 5.0);
    }

    #[test]
    fn combined_joins_vix() {
        let mut store = MemoryStore::new();
        store.add_daily_closes("bitcoin", d("2024-01-01"), &[1.0, 2.0]);
        store.add_indicator_point(VIX, d("2024-01-02"), 25.0);
        let rows = store.get_combined("bitcoin", 30).unwrap();
        assert_eq!(rows[0].vix_value, None);
        assert_eq!(rows[1].vix_value, Some(25.0));
    }

    #[test]
    fn unknown_asset_is_empty() {
        let store = MemoryStore::new();
        assert!(store.get_combined("nothing", 10).unwrap().is_empty());
    }

    #[test]
    fn indicator_range_filter() {
        let mut store = MemoryStore::new();
        store.add_indicator_values(VIX, d("2024-01-01"), &[10.0, 11.0, 12.0, 13.0]);
        let points = store
            .get_indicator(VIX, "2024-01-02", "2024-01-03", false)
            .unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].value, 11.0);
    }
}
