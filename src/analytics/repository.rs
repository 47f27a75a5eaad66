use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use super::calculator::MacroIndicatorMetrics;
use crate::data::sqlite::open_database;
use crate::data::{parse_date, IndicatorPoint, DATE_FORMAT};
use crate::error::{Error, Result};

/// Persistence for macro indicator observations and computed analytics.
/// Writers upsert on the natural keys (`indicator, date` and
/// `indicator, timeframe, timestamp`).
pub struct AnalyticsRepository {
    conn: Mutex<Connection>,
}

impl AnalyticsRepository {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(AnalyticsRepository {
            conn: Mutex::new(open_database(path)?),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()
            .map_err(|e| Error::store("opening in-memory database", e))?;
        crate::data::sqlite::run_migrations(&mut conn)?;
        Ok(AnalyticsRepository {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn upsert_indicator(&self, indicator: &str, points: &[IndicatorPoint]) -> Result<usize> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare_cached(
                "INSERT INTO macro_indicators (indicator, date, value, is_interpolated, is_forward_filled)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (indicator, date) DO UPDATE SET
                     value = excluded.value,
                     is_interpolated = excluded.is_interpolated,
                     is_forward_filled = excluded.is_forward_filled",
            )
            .map_err(|e| Error::store("preparing indicator upsert", e))?;
        let mut written = 0;
        for point in points {
            written += stmt
                .execute(params![
                    indicator,
                    point.date.format(DATE_FORMAT).to_string(),
                    point.value,
                    point.is_interpolated,
                    point.is_forward_filled
                ])
                .map_err(|e| Error::store(format!("upserting {indicator}"), e))?;
        }
        Ok(written)
    }

    pub fn get_indicator_data(
        &self,
        indicator: &str,
        start_date: &str,
        end_date: &str,
    ) -> Result<Vec<IndicatorPoint>> {
        parse_date(start_date)?;
        parse_date(end_date)?;

        let conn = self.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT date, value, is_interpolated, is_forward_filled FROM macro_indicators
                 WHERE indicator = ?1 AND date >= ?2 AND date <= ?3
                 ORDER BY date ASC",
            )
            .map_err(|e| Error::store("preparing indicator query", e))?;
        let rows = stmt
            .query_map(params![indicator, start_date, end_date], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, f64>(1)?,
                    row.get::<_, bool>(2)?,
                    row.get::<_, bool>(3)?,
                ))
            })
            .map_err(|e| Error::store(format!("querying {indicator}"), e))?;

        let mut out = Vec::new();
        for row in rows {
            let (date, value, interpolated, filled) =
                row.map_err(|e| Error::store(format!("reading {indicator}"), e))?;
            out.push(IndicatorPoint {
                date: parse_date(&date)?,
                value,
                is_interpolated: interpolated,
                is_forward_filled: filled,
            });
        }
        Ok(out)
    }

    pub fn save_metrics(&self, metrics: &MacroIndicatorMetrics) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO macro_analytics_results
                 (indicator, timeframe, timestamp, current_value, rate_of_change, z_score,
                  percentile_rank, mean, std_dev, lookback_period)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT (indicator, timeframe, timestamp) DO UPDATE SET
                 current_value = excluded.current_value,
                 rate_of_change = excluded.rate_of_change,
                 z_score = excluded.z_score,
                 percentile_rank = excluded.percentile_rank,
                 mean = excluded.mean,
                 std_dev = excluded.std_dev,
                 lookback_period = excluded.lookback_period",
            params![
                metrics.indicator,
                metrics.timeframe,
                metrics.timestamp,
                metrics.current_value,
                metrics.rate_of_change,
                metrics.z_score,
                metrics.percentile_rank,
                metrics.mean,
                metrics.std_dev,
                metrics.lookback_period as i64,
            ],
        )
        .map_err(|e| {
            Error::store(
                format!("saving metrics for {} {}", metrics.indicator, metrics.timeframe),
                e,
            )
        })?;
        Ok(())
    }

    pub fn latest_metrics(
        &self,
        indicator: &str,
        timeframe: &str,
    ) -> Result<Option<MacroIndicatorMetrics>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT indicator, timeframe, timestamp, current_value, rate_of_change, z_score,
                    percentile_rank, mean, std_dev, lookback_period
             FROM macro_analytics_results
             WHERE indicator = ?1 AND timeframe = ?2
             ORDER BY timestamp DESC LIMIT 1",
            params![indicator, timeframe],
            row_to_metrics,
        )
        .optional()
        .map_err(|e| Error::store(format!("loading metrics for {indicator} {timeframe}"), e))
    }

    pub fn metrics_history(
        &self,
        indicator: &str,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<MacroIndicatorMetrics>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT indicator, timeframe, timestamp, current_value, rate_of_change, z_score,
                        percentile_rank, mean, std_dev, lookback_period
                 FROM macro_analytics_results
                 WHERE indicator = ?1 AND timeframe = ?2
                 ORDER BY timestamp DESC LIMIT ?3",
            )
            .map_err(|e| Error::store("preparing metrics query", e))?;
        let rows = stmt
            .query_map(params![indicator, timeframe, limit as i64], row_to_metrics)
            .map_err(|e| Error::store(format!("querying metrics for {indicator}"), e))?;
        rows.collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::store(format!("reading metrics for {indicator}"), e))
    }
}

fn row_to_metrics(row: &rusqlite::Row<'_>) -> rusqlite::Result<MacroIndicatorMetrics> {
    Ok(MacroIndicatorMetrics {
        indicator: row.get(0)?,
        timeframe: row.get(1)?,
        timestamp: row.get(2)?,
        current_value: row.get(3)?,
        rate_of_change: row.get(4)?,
        z_score: row.get(5)?,
        percentile_rank: row.get(6)?,
        mean: row.get(7)?,
        std_dev: row.get(8)?,
        lookback_period: row.get::<_, i64>(9)? as usize,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn d(s: &str) -> NaiveDate {
        parse_date(s).unwrap()
    }

    fn metrics(ts: i64, value: f64) -> MacroIndicatorMetrics {
        MacroIndicatorMetrics::new("VIX", "1d", ts, value, 1.2, 0.8, 78.81, 19.0, 2.5, 30)
            .unwrap()
    }

    #[test]
    fn indicator_upsert_is_idempotent() {
        let repo = AnalyticsRepository::in_memory().unwrap();
        let point = IndicatorPoint::observed(d("2024-01-01"), 18.0);
        repo.upsert_indicator("VIX", &[point]).unwrap();
        let updated = IndicatorPoint::observed(d("2024-01-01"), 19.5);
        repo.upsert_indicator("VIX", &[updated]).unwrap();

        let points = repo
            .get_indicator_data("VIX", "2024-01-01", "2024-01-31")
            .unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].value, 19.5);
    }

    #[test]
    fn metrics_round_trip() {
        let repo = AnalyticsRepository::in_memory().unwrap();
        repo.save_metrics(&metrics(1_000, 20.0)).unwrap();
        repo.save_metrics(&metrics(2_000, 21.0)).unwrap();

        let latest = repo.latest_metrics("VIX", "1d").unwrap().unwrap();
        assert_eq!(latest.timestamp, 2_000);
        assert_eq!(latest.current_value, 21.0);
        assert_eq!(latest.lookback_period, 30);

        let history = repo.metrics_history("VIX", "1d", 10).unwrap();
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn metrics_upsert_on_natural_key() {
        let repo = AnalyticsRepository::in_memory().unwrap();
        repo.save_metrics(&metrics(1_000, 20.0)).unwrap();
        repo.save_metrics(&metrics(1_000, 25.0)).unwrap();
        let history = repo.metrics_history("VIX", "1d", 10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].current_value, 25.0);
    }

    #[test]
    fn missing_metrics_is_none() {
        let repo = AnalyticsRepository::in_memory().unwrap();
        assert!(repo.latest_metrics("VIX", "1w").unwrap().is_none());
    }
}
