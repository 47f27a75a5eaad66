pub mod memory;
pub mod sqlite;

use std::collections::BTreeMap;

use chrono::{NaiveDate, TimeZone, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Macro indicator codes joined onto crypto rows by `get_combined`.
pub const VIX: &str = "VIX";
pub const FED_FUNDS: &str = "DFF";
pub const TREASURY_10Y: &str = "DGS10";
pub const DOLLAR_INDEX: &str = "DTWEXBGS";

pub fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, DATE_FORMAT)
        .map_err(|_| Error::BadDate(format!("expected YYYY-MM-DD, got '{s}'")))
}

/// Millisecond timestamp for midnight UTC of a calendar day.
pub fn day_start_ms(date: NaiveDate) -> i64 {
    Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).expect("midnight is valid"))
        .timestamp_millis()
}

/// One OHLCV sample. `timestamp` is integer milliseconds since epoch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarketBar {
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// A crypto day left-joined with that day's macro indicators. Missing macro
/// observations surface as `None`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CombinedBar {
    pub date: NaiveDate,
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub vix_value: Option<f64>,
    pub fed_funds_rate: Option<f64>,
    pub treasury_10y_rate: Option<f64>,
    pub dollar_index: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IndicatorPoint {
    pub date: NaiveDate,
    pub value: f64,
    pub is_interpolated: bool,
    pub is_forward_filled: bool,
}

impl IndicatorPoint {
    pub fn observed(date: NaiveDate, value: f64) -> Self {
        IndicatorPoint {
            date,
            value,
            is_interpolated: false,
            is_forward_filled: false,
        }
    }
}

/// Date-indexed table with one column per indicator.
#[derive(Debug, Clone, Default)]
pub struct IndicatorTable {
    pub dates: Vec<NaiveDate>,
    pub columns: BTreeMap<String, Vec<Option<f64>>>,
}

impl IndicatorTable {
    pub fn value(&self, indicator: &str, date: NaiveDate) -> Option<f64> {
        let idx = self.dates.iter().position(|d| *d == date)?;
        self.columns.get(indicator)?.get(idx).copied().flatten()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }
}

/// Read-only time-series access for crypto OHLCV and macro indicators.
/// Implementations are safe for concurrent readers; all outputs are sorted
/// ascending by time, and missing data yields empty sequences, not errors.
pub trait MarketStore: Send + Sync {
    fn get_ohlcv(&self, asset: &str, days: u32) -> Result<Vec<MarketBar>>;

    fn get_combined(&self, asset: &str, days: u32) -> Result<Vec<CombinedBar>>;

    fn get_indicator(
        &self,
        indicator: &str,
        start_date: &str,
        end_date: &str,
        interpolate: bool,
    ) -> Result<Vec<IndicatorPoint>>;

    fn get_multi_indicator(
        &self,
        indicators: &[&str],
        start_date: &str,
        end_date: &str,
        interpolate: bool,
    ) -> Result<IndicatorTable> {
        let mut table = IndicatorTable::default();
        let start = parse_date(start_date)?;
        let end = parse_date(end_date)?;
        if end < start {
            return Ok(table);
        }

        let mut dates = Vec::new();
        let mut day = start;
        while day <= end {
            dates.push(day);
            day = day.succ_opt().expect("date overflow");
        }

        for indicator in indicators {
            let points = self.get_indicator(indicator, start_date, end_date, interpolate)?;
            let by_date: BTreeMap<NaiveDate, f64> =
                points.iter().map(|p| (p.date, p.value)).collect();
            let column = dates.iter().map(|d| by_date.get(d).copied()).collect();
            table.columns.insert((*indicator).to_string(), column);
        }

        table.dates = dates;
        Ok(table)
    }
}

/// Fill a daily observation series over `[start, end]`: linear interpolation
/// across internal gaps, forward fill after the last observation, back fill
/// before the first.
pub(crate) fn fill_daily_gaps(
    observations: &[(NaiveDate, f64)],
    start: NaiveDate,
    end: NaiveDate,
) -> Vec<IndicatorPoint> {
    if observations.is_empty() || end < start {
        return Vec::new();
    }

    let by_date: BTreeMap<NaiveDate, f64> = observations.iter().copied().collect();
    let mut out = Vec::new();
    let mut day = start;
    while day <= end {
        if let Some(&value) = by_date.get(&day) {
            out.push(IndicatorPoint::observed(day, value));
        } else {
            let prev = by_date.range(..day).next_back().map(|(d, v)| (*d, *v));
            let next = by_date.range(day..).next().map(|(d, v)| (*d, *v));
            match (prev, next) {
                (Some((d0, v0)), Some((d1, v1))) => {
                    let span = (d1 - d0).num_days() as f64;
                    let offset = (day - d0).num_days() as f64;
                    out.push(IndicatorPoint {
                        date: day,
                        value: v0 + (v1 - v0) * offset / span,
                        is_interpolated: true,
                        is_forward_filled: false,
                    });
                }
                // Trailing gap: carry the last observation forward.
                (Some((_, v0)), None) => out.push(IndicatorPoint {
                    date: day,
                    value: v0,
                    is_interpolated: false,
                    is_forward_filled: true,
                }),
                // Leading gap: backfill from the first observation.
                (None, Some((_, v1))) => out.push(IndicatorPoint {
                    date: day,
                    value: v1,
                    is_interpolated: false,
                    is_forward_filled: true,
                }),
                (None, None) => unreachable!("observations is non-empty"),
            }
        }
        day = day.succ_opt().expect("date overflow");
    }
    out
}

/// Per-asset market view handed to strategies: combined crypto + macro rows
/// as of a single point in time.
#[derive(Debug, Clone, Default)]
pub struct MarketSnapshot {
    /// Millisecond timestamp the snapshot represents; signals generated from
    /// it are stamped with this value.
    pub as_of: i64,
    pub series: FxHashMap<String, Vec<CombinedBar>>,
}

impl MarketSnapshot {
    pub fn new(as_of: i64) -> Self {
        MarketSnapshot {
            as_of,
            series: FxHashMap::default(),
        }
    }

    pub fn from_store(
        store: &dyn MarketStore,
        assets: &[String],
        days: u32,
        as_of: i64,
    ) -> Result<Self> {
        let mut snapshot = MarketSnapshot::new(as_of);
        for asset in assets {
            let bars = store.get_combined(asset, days)?;
            if bars.is_empty() {
                tracing::warn!(asset = %asset, "no market data available");
            }
            snapshot.series.insert(asset.clone(), bars);
        }
        Ok(snapshot)
    }

    pub fn asset(&self, name: &str) -> Option<&[CombinedBar]> {
        self.series.get(name).map(Vec::as_slice)
    }

    /// Point-in-time restriction: rows dated on or before `date`, with
    /// `as_of` moved to that day. Used by the backtest driver.
    pub fn up_to(&self, date: NaiveDate) -> MarketSnapshot {
        let mut filtered = MarketSnapshot::new(day_start_ms(date));
        for (asset, bars) in &self.series {
            filtered.series.insert(
                asset.clone(),
                bars.iter().filter(|b| b.date <= date).copied().collect(),
            );
        }
        filtered
    }

    pub fn is_empty(&self) -> bool {
        self.series.values().all(Vec::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        parse_date(s).unwrap()
    }

    #[test]
    fn parse_date_rejects_bad_format() {
        assert!(matches!(parse_date("2024/01/01"), Err(Error::BadDate(_))));
        assert!(matches!(parse_date("yesterday"), Err(Error::BadDate(_))));
    }

    #[test]
    fn fill_daily_gaps_interpolates_internal_gap() {
        let obs = vec![(d("2024-01-01"), 10.0), (d("2024-01-04"), 16.0)];
        let filled = fill_daily_gaps(&obs, d("2024-01-01"), d("2024-01-04"));
        assert_eq!(filled.len(), 4);
        assert_eq!(filled[1].value, 12.0);
        assert_eq!(filled[2].value, 14.0);
        assert!(filled[1].is_interpolated);
        assert!(!filled[0].is_interpolated);
    }

    #[test]
    fn fill_daily_gaps_fills_edges() {
        let obs = vec![(d("2024-01-03"), 20.0)];
        let filled = fill_daily_gaps(&obs, d("2024-01-01"), d("2024-01-05"));
        assert_eq!(filled.len(), 5);
        // Leading backfill and trailing forward fill both carry 20.0.
        assert_eq!(filled[0].value, 20.0);
        assert!(filled[0].is_forward_filled);
        assert_eq!(filled[4].value, 20.0);
        assert!(filled[4].is_forward_filled);
        assert!(!filled[2].is_forward_filled);
    }

    #[test]
    fn fill_daily_gaps_empty_observations() {
        assert!(fill_daily_gaps(&[], d("2024-01-01"), d("2024-01-05")).is_empty());
    }

    #[test]
    fn snapshot_up_to_filters_by_date() {
        let mut snapshot = MarketSnapshot::new(0);
        let bars: Vec<CombinedBar> = (1..=5)
            .map(|i| CombinedBar {
                date: d(&format!("2024-01-0{i}")),
                timestamp: day_start_ms(d(&format!("2024-01-0{i}"))),
                open: 100.0,
                high: 101.0,
                low: 99.0,
                close: 100.0,
                volume: 1000.0,
                vix_value: Some(20.0),
                fed_funds_rate: None,
                treasury_10y_rate: None,
                dollar_index: None,
            })
            .collect();
        snapshot.series.insert("bitcoin".into(), bars);

        let pit = snapshot.up_to(d("2024-01-03"));
        assert_eq!(pit.asset("bitcoin").unwrap().len(), 3);
        assert_eq!(pit.as_of, day_start_ms(d("2024-01-03")));
    }

    #[test]
    fn indicator_table_lookup() {
        let mut table = IndicatorTable {
            dates: vec![d("2024-01-01"), d("2024-01-02")],
            columns: BTreeMap::new(),
        };
        table
            .columns
            .insert("VIX".into(), vec![Some(18.0), None]);
        assert_eq!(table.value("VIX", d("2024-01-01")), Some(18.0));
        assert_eq!(table.value("VIX", d("2024-01-02")), None);
        assert_eq!(table.value("DFF", d("2024-01-01")), None);
    }
}
