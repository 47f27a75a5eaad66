use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Longest run of consecutive missing buckets that linear interpolation will
/// bridge; longer gaps fall through to forward/back fill.
pub const MAX_INTERPOLATION_GAP: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Timeframe {
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
    #[serde(rename = "1w")]
    W1,
    #[serde(rename = "1m")]
    M1,
}

#[derive(Debug, Clone, Copy)]
pub struct TimeframeConfig {
    pub key: &'static str,
    pub description: &'static str,
    pub lookback_periods: usize,
    pub analysis_periods: usize,
    pub min_data_points: usize,
}

impl Timeframe {
    pub const ALL: [Timeframe; 5] = [
        Timeframe::H1,
        Timeframe::H4,
        Timeframe::D1,
        Timeframe::W1,
        Timeframe::M1,
    ];

    pub fn from_key(key: &str) -> Result<Self> {
        match key {
            "1h" => Ok(Timeframe::H1),
            "4h" => Ok(Timeframe::H4),
            "1d" => Ok(Timeframe::D1),
            "1w" => Ok(Timeframe::W1),
            "1m" => Ok(Timeframe::M1),
            other => Err(Error::bad_config(format!(
                "unsupported timeframe '{other}', expected one of 1h|4h|1d|1w|1m"
            ))),
        }
    }

    pub fn key(self) -> &'static str {
        self.config().key
    }

    pub fn config(self) -> TimeframeConfig {
        match self {
            Timeframe::H1 => TimeframeConfig {
                key: "1h",
                description: "1 Hour",
                lookback_periods: 168,
                analysis_periods: 24,
                min_data_points: 10,
            },
            Timeframe::H4 => TimeframeConfig {
                key: "4h",
                description: "4 Hours",
                lookback_periods: 168,
                analysis_periods: 42,
                min_data_points: 10,
            },
            Timeframe::D1 => TimeframeConfig {
                key: "1d",
                description: "1 Day",
                lookback_periods: 90,
                analysis_periods: 30,
                min_data_points: 5,
            },
            Timeframe::W1 => TimeframeConfig {
                key: "1w",
                description: "1 Week",
                lookback_periods: 52,
                analysis_periods: 12,
                min_data_points: 4,
            },
            Timeframe::M1 => TimeframeConfig {
                key: "1m",
                description: "1 Month",
                lookback_periods: 24,
                analysis_periods: 6,
                min_data_points: 3,
            },
        }
    }

    /// Start of the bucket containing `ts`. Weeks start on Monday, months on
    /// the first.
    pub fn bucket_start(self, ts: NaiveDateTime) -> NaiveDateTime {
        let midnight = ts.date().and_hms_opt(0, 0, 0).expect("midnight is valid");
        match self {
            Timeframe::H1 => midnight + Duration::hours(i64::from(ts.hour())),
            Timeframe::H4 => midnight + Duration::hours(i64::from(ts.hour() - ts.hour() % 4)),
            Timeframe::D1 => midnight,
            Timeframe::W1 => {
                midnight - Duration::days(i64::from(ts.date().weekday().num_days_from_monday()))
            }
            Timeframe::M1 => NaiveDate::from_ymd_opt(ts.year(), ts.month(), 1)
                .expect("first of month is valid")
                .and_hms_opt(0, 0, 0)
                .expect("midnight is valid"),
        }
    }

    fn next_bucket(self, start: NaiveDateTime) -> NaiveDateTime {
        match self {
            Timeframe::H1 => start + Duration::hours(1),
            Timeframe::H4 => start + Duration::hours(4),
            Timeframe::D1 => start + Duration::days(1),
            Timeframe::W1 => start + Duration::days(7),
            Timeframe::M1 => {
                let (year, month) = if start.month() == 12 {
                    (start.year() + 1, 1)
                } else {
                    (start.year(), start.month() + 1)
                };
                NaiveDate::from_ymd_opt(year, month, 1)
                    .expect("first of month is valid")
                    .and_hms_opt(0, 0, 0)
                    .expect("midnight is valid")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ohlc {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResampledPoint {
    pub period_start: NaiveDateTime,
    /// Primary value for the bucket (the close when OHLC is present).
    pub value: f64,
    /// Populated for hourly/4-hour frames when buckets carry multiple
    /// observations.
    pub ohlc: Option<Ohlc>,
    pub is_interpolated: bool,
    pub is_forward_filled: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Fill {
    Observed,
    Interpolated,
    Filled,
}

/// Resample an observation series into `timeframe` buckets and fill gaps:
/// linear interpolation across internal gaps up to [`MAX_INTERPOLATION_GAP`],
/// then forward fill, then back fill. Duplicate timestamps keep the latest
/// observation.
pub fn resample(observations: &[(NaiveDateTime, f64)], timeframe: Timeframe) -> Vec<ResampledPoint> {
    if observations.is_empty() {
        return Vec::new();
    }

    let mut sorted: Vec<(NaiveDateTime, f64)> = observations.to_vec();
    sorted.sort_by_key(|(ts, _)| *ts);
    // Stable sort keeps input order within equal timestamps; the later
    // observation wins.
    sorted.dedup_by(|later, earlier| {
        if later.0 == earlier.0 {
            earlier.1 = later.1;
            true
        } else {
            false
        }
    });

    let mut buckets: std::collections::BTreeMap<NaiveDateTime, Vec<f64>> =
        std::collections::BTreeMap::new();
    for (ts, value) in &sorted {
        buckets
            .entry(timeframe.bucket_start(*ts))
            .or_default()
            .push(*value);
    }

    let use_ohlc = matches!(timeframe, Timeframe::H1 | Timeframe::H4)
        && buckets.values().any(|v| v.len() > 1);

    // Contiguous bucket grid between the first and last observed bucket.
    let first = *buckets.keys().next().expect("non-empty");
    let last = *buckets.keys().next_back().expect("non-empty");
    let mut grid = Vec::new();
    let mut cursor = first;
    loop {
        grid.push(cursor);
        if cursor >= last {
            break;
        }
        cursor = timeframe.next_bucket(cursor);
    }

    let raw: Vec<Option<(f64, Option<Ohlc>)>> = grid
        .iter()
        .map(|start| {
            buckets.get(start).map(|values| {
                let close = *values.last().expect("bucket is non-empty");
                let ohlc = use_ohlc.then(|| Ohlc {
                    open: values[0],
                    high: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                    low: values.iter().copied().fold(f64::INFINITY, f64::min),
                    close,
                });
                (close, ohlc)
            })
        })
        .collect();

    let values: Vec<Option<f64>> = raw.iter().map(|v| v.map(|(c, _)| c)).collect();
    let filled = fill_gaps(&values, MAX_INTERPOLATION_GAP);

    grid.iter()
        .zip(raw)
        .zip(filled)
        .filter_map(|((start, observed), filled)| {
            let (value, fill) = filled?;
            Some(ResampledPoint {
                period_start: *start,
                value,
                ohlc: observed.and_then(|(_, ohlc)| ohlc),
                is_interpolated: fill == Fill::Interpolated,
                is_forward_filled: fill == Fill::Filled,
            })
        })
        .collect()
}

/// Gap-filling over a gridded series: linear for bounded gaps up to
/// `max_gap`, then forward fill, then back fill.
fn fill_gaps(values: &[Option<f64>], max_gap: usize) -> Vec<Option<(f64, Fill)>> {
    let mut out: Vec<Option<(f64, Fill)>> = values
        .iter()
        .map(|v| v.map(|value| (value, Fill::Observed)))
        .collect();

    // Linear interpolation across internal gaps.
    let mut i = 0;
    while i < out.len() {
        if out[i].is_some() {
            i += 1;
            continue;
        }
        let gap_start = i;
        let mut gap_end = i;
        while gap_end < out.len() && out[gap_end].is_none() {
            gap_end += 1;
        }
        let gap_len = gap_end - gap_start;
        if gap_start > 0 && gap_end < out.len() && gap_len <= max_gap {
            let left = out[gap_start - 1].expect("bounded gap").0;
            let right = out[gap_end].expect("bounded gap").0;
            let span = (gap_len + 1) as f64;
            for (k, slot) in out[gap_start..gap_end].iter_mut().enumerate() {
                let weight = (k + 1) as f64 / span;
                *slot = Some((left + (right - left) * weight, Fill::Interpolated));
            }
        }
        i = gap_end;
    }

    // Forward fill, then back fill.
    let mut carry = None;
    for slot in &mut out {
        match slot {
            Some((value, _)) => carry = Some(*value),
            None => {
                if let Some(value) = carry {
                    *slot = Some((value, Fill::Filled));
                }
            }
        }
    }
    let mut carry = None;
    for slot in out.iter_mut().rev() {
        match slot {
            Some((value, _)) => carry = Some(*value),
            None => {
                if let Some(value) = carry {
                    *slot = Some((value, Fill::Filled));
                }
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(day: u32, hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, day)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    #[test]
    fn from_key_round_trip() {
        for key in ["1h", "4h", "1d", "1w", "1m"] {
            assert_eq!(Timeframe::from_key(key).unwrap().key(), key);
        }
        assert!(matches!(
            Timeframe::from_key("15m"),
            Err(Error::BadConfig(_))
        ));
    }

    #[test]
    fn bucket_starts() {
        let t = ts(6, 14, 37); // Wednesday 2024-03-06 14:37
        assert_eq!(Timeframe::H1.bucket_start(t), ts(6, 14, 0));
        assert_eq!(Timeframe::H4.bucket_start(t), ts(6, 12, 0));
        assert_eq!(Timeframe::D1.bucket_start(t), ts(6, 0, 0));
        assert_eq!(Timeframe::W1.bucket_start(t), ts(4, 0, 0)); // Monday
        assert_eq!(
            Timeframe::M1.bucket_start(t),
            NaiveDate::from_ymd_opt(2024, 3, 1)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap()
        );
    }

    #[test]
    fn month_rollover() {
        let dec = NaiveDate::from_ymd_opt(2023, 12, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let jan = Timeframe::M1.next_bucket(dec);
        assert_eq!(jan.date(), NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
    }

    #[test]
    fn hourly_multi_observation_buckets_emit_ohlc() {
        let observations = vec![
            (ts(6, 14, 0), 10.0),
            (ts(6, 14, 20), 14.0),
            (ts(6, 14, 40), 12.0),
            (ts(6, 15, 10), 13.0),
        ];
        let resampled = resample(&observations, Timeframe::H1);
        assert_eq!(resampled.len(), 2);

        let first = &resampled[0];
        let ohlc = first.ohlc.unwrap();
        assert_eq!(ohlc.open, 10.0);
        assert_eq!(ohlc.high, 14.0);
        assert_eq!(ohlc.low, 10.0);
        assert_eq!(ohlc.close, 12.0);
        // Close is the primary value.
        assert_eq!(first.value, 12.0);
    }

    #[test]
    fn daily_aggregation_uses_last_value() {
        let observations = vec![
            (ts(6, 9, 0), 10.0),
            (ts(6, 16, 0), 11.5),
            (ts(7, 9, 0), 12.0),
        ];
        let resampled = resample(&observations, Timeframe::D1);
        assert_eq!(resampled.len(), 2);
        assert_eq!(resampled[0].value, 11.5);
        assert!(resampled[0].ohlc.is_none());
    }

    #[test]
    fn duplicate_timestamps_keep_latest() {
        let observations = vec![(ts(6, 9, 0), 10.0), (ts(6, 9, 0), 99.0)];
        let resampled = resample(&observations, Timeframe::D1);
        assert_eq!(resampled.len(), 1);
        assert_eq!(resampled[0].value, 99.0);
    }

    #[test]
    fn internal_gap_is_interpolated() {
        let observations = vec![(ts(1, 0, 0), 10.0), (ts(4, 0, 0), 16.0)];
        let resampled = resample(&observations, Timeframe::D1);
        assert_eq!(resampled.len(), 4);
        assert_eq!(resampled[1].value, 12.0);
        assert_eq!(resampled[2].value, 14.0);
        assert!(resampled[1].is_interpolated);
        assert!(!resampled[0].is_interpolated);
    }

    #[test]
    fn long_gap_falls_back_to_forward_fill() {
        let observations = vec![(ts(1, 0, 0), 10.0), (ts(14, 0, 0), 20.0)];
        let resampled = resample(&observations, Timeframe::D1);
        // 12 missing days exceeds the interpolation cap; middle points are
        // forward filled with the left value.
        assert_eq!(resampled.len(), 14);
        assert_eq!(resampled[5].value, 10.0);
        assert!(resampled[5].is_forward_filled);
        assert!(!resampled[5].is_interpolated);
    }

    #[test]
    fn empty_input_is_empty_output() {
        assert!(resample(&[], Timeframe::D1).is_empty());
    }
}
