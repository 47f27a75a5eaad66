use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::NaiveDate;
use rusqlite::{params, Connection};

use super::{
    fill_daily_gaps, parse_date, CombinedBar, IndicatorPoint, MarketBar, MarketStore, DATE_FORMAT,
    DOLLAR_INDEX, FED_FUNDS, TREASURY_10Y, VIX,
};
use crate::error::{Error, Result};

mod embedded {
    refinery::embed_migrations!("migrations");
}

/// Open (or create) the pipeline database and bring the schema up to date.
pub fn open_database(path: &Path) -> Result<Connection> {
    let mut conn = Connection::open(path)
        .map_err(|e| Error::store(format!("opening database at {}", path.display()), e))?;
    conn.busy_timeout(Duration::from_secs(30))
        .map_err(|e| Error::store("setting busy timeout", e))?;
    run_migrations(&mut conn)?;
    Ok(conn)
}

pub(crate) fn run_migrations(conn: &mut Connection) -> Result<()> {
    embedded::migrations::runner()
        .run(conn)
        .map_err(|e| Error::store("running schema migrations", e))?;
    Ok(())
}

fn open_in_memory() -> Result<Connection> {
    let mut conn = Connection::open_in_memory()
        .map_err(|e| Error::store("opening in-memory database", e))?;
    run_migrations(&mut conn)?;
    Ok(conn)
}

/// SQLite-backed market-data store. The read side is the `MarketStore`
/// contract; the insert helpers exist for ingestion jobs and test fixtures.
pub struct SqliteMarketStore {
    conn: Mutex<Connection>,
}

impl SqliteMarketStore {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(SqliteMarketStore {
            conn: Mutex::new(open_database(path)?),
        })
    }

    pub fn in_memory() -> Result<Self> {
        Ok(SqliteMarketStore {
            conn: Mutex::new(open_in_memory()?),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn insert_ohlcv(&self, asset: &str, bars: &[MarketBar]) -> Result<usize> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare_cached(
                "INSERT INTO crypto_ohlcv (asset, timestamp, date, open, high, low, close, volume)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT (asset, timestamp) DO UPDATE SET
                     open = excluded.open, high = excluded.high, low = excluded.low,
                     close = excluded.close, volume = excluded.volume",
            )
            .map_err(|e| Error::store("preparing ohlcv insert", e))?;
        let mut written = 0;
        for bar in bars {
            let date = chrono::DateTime::from_timestamp_millis(bar.timestamp)
                .map(|dt| dt.date_naive().format(DATE_FORMAT).to_string())
                .ok_or_else(|| Error::BadDate(format!("bad timestamp {}", bar.timestamp)))?;
            written += stmt
                .execute(params![
                    asset,
                    bar.timestamp,
                    date,
                    bar.open,
                    bar.high,
                    bar.low,
                    bar.close,
                    bar.volume
                ])
                .map_err(|e| Error::store(format!("inserting ohlcv for {asset}"), e))?;
        }
        Ok(written)
    }

    pub fn insert_indicator(&self, indicator: &str, points: &[IndicatorPoint]) -> Result<usize> {
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
            .map_err(|e| Error::store("preparing indicator insert", e))?;
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
                .map_err(|e| Error::store(format!("inserting {indicator} point"), e))?;
        }
        Ok(written)
    }

    fn macro_values_between(
        &self,
        conn: &Connection,
        indicator: &str,
        first: &str,
        last: &str,
    ) -> Result<BTreeMap<NaiveDate, f64>> {
        let mut stmt = conn
            .prepare_cached(
                "SELECT date, value FROM macro_indicators
                 WHERE indicator = ?1 AND date >= ?2 AND date <= ?3
                 ORDER BY date ASC",
            )
            .map_err(|e| Error::store("preparing macro query", e))?;
        let rows = stmt
            .query_map(params![indicator, first, last], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
            })
            .map_err(|e| Error::store(format!("querying {indicator}"), e))?;

        let mut out = BTreeMap::new();
        for row in rows {
            let (date, value) = row.map_err(|e| Error::store(format!("reading {indicator}"), e))?;
            out.insert(parse_date(&date)?, value);
        }
        Ok(out)
    }
}

impl MarketStore for SqliteMarketStore {
    fn get_ohlcv(&self, asset: &str, days: u32) -> Result<Vec<MarketBar>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT timestamp, open, high, low, close, volume FROM crypto_ohlcv
                 WHERE asset = ?1 ORDER BY timestamp DESC LIMIT ?2",
            )
            .map_err(|e| Error::store("preparing ohlcv query", e))?;
        let rows = stmt
            .query_map(params![asset, days], |row| {
                Ok(MarketBar {
                    timestamp: row.get(0)?,
                    open: row.get(1)?,
                    high: row.get(2)?,
                    low: row.get(3)?,
                    close: row.get(4)?,
                    volume: row.get(5)?,
                })
            })
            .map_err(|e| Error::store(format!("querying ohlcv for {asset}"), e))?;

        let mut bars: Vec<MarketBar> = rows
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::store(format!("reading ohlcv for {asset}"), e))?;
        bars.reverse();
        Ok(bars)
    }

    fn get_combined(&self, asset: &str, days: u32) -> Result<Vec<CombinedBar>> {
        let bars = self.get_ohlcv(asset, days)?;
        if bars.is_empty() {
            return Ok(Vec::new());
        }

        let dates: Vec<NaiveDate> = bars
            .iter()
            .map(|b| {
                chrono::DateTime::from_timestamp_millis(b.timestamp)
                    .map(|dt| dt.date_naive())
                    .ok_or_else(|| Error::BadDate(format!("bad timestamp {}", b.timestamp)))
            })
            .collect::<Result<_>>()?;
        let first = dates.first().expect("non-empty").format(DATE_FORMAT).to_string();
        let last = dates.last().expect("non-empty").format(DATE_FORMAT).to_string();

        let conn = self.lock();
        let vix = self.macro_values_between(&conn, VIX, &first, &last)?;
        let dff = self.macro_values_between(&conn, FED_FUNDS, &first, &last)?;
        let dgs10 = self.macro_values_between(&conn, TREASURY_10Y, &first, &last)?;
        let dxy = self.macro_values_between(&conn, DOLLAR_INDEX, &first, &last)?;
        drop(conn);

        Ok(bars
            .into_iter()
            .zip(dates)
            .map(|(bar, date)| CombinedBar {
                date,
                timestamp: bar.timestamp,
                open: bar.open,
                high: bar.high,
                low: bar.low,
                close: bar.close,
                volume: bar.volume,
                vix_value: vix.get(&date).copied(),
                fed_funds_rate: dff.get(&date).copied(),
                treasury_10y_rate: dgs10.get(&date).copied(),
                dollar_index: dxy.get(&date).copied(),
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

        let conn = self.lock();
        let observed = self.macro_values_between(&conn, indicator, start_date, end_date)?;
        drop(conn);

        if interpolate {
            let observations: Vec<(NaiveDate, f64)> = observed.into_iter().collect();
            Ok(fill_daily_gaps(&observations, start, end))
        } else {
            Ok(observed
                .into_iter()
                .map(|(date, value)| IndicatorPoint::observed(date, value))
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::day_start_ms;

    fn d(s: &str) -> NaiveDate {
        parse_date(s).unwrap()
    }

    fn bar_on(date: &str, close: f64) -> MarketBar {
        MarketBar {
            timestamp: day_start_ms(d(date)),
            open: close * 0.99,
            high: close * 1.02,
            low: close * 0.98,
            close,
            volume: 1_000.0,
        }
    }

    fn seeded_store() -> SqliteMarketStore {
        let store = SqliteMarketStore::in_memory().unwrap();
        store
            .insert_ohlcv(
                "bitcoin",
                &[
                    bar_on("2024-01-01", 50_000.0),
                    bar_on("2024-01-02", 50_500.0),
                    bar_on("2024-01-03", 49_800.0),
                ],
            )
            .unwrap();
        store
            .insert_indicator(
                VIX,
                &[
                    IndicatorPoint::observed(d("2024-01-01"), 18.0),
                    IndicatorPoint::observed(d("2024-01-03"), 22.0),
                ],
            )
            .unwrap();
        store
    }

    #[test]
    fn ohlcv_is_ascending_and_windowed() {
        let store = seeded_store();
        let bars = store.get_ohlcv("bitcoin", 2).unwrap();
        assert_eq!(bars.len(), 2);
        assert!(bars[0].timestamp < bars[1].timestamp);
        assert_eq!(bars[1].close, 49_800.0);
    }

    #[test]
    fn missing_asset_is_empty_not_error() {
        let store = seeded_store();
        assert!(store.get_ohlcv("dogecoin", 30).unwrap().is_empty());
        assert!(store.get_combined("dogecoin", 30).unwrap().is_empty());
    }

    #[test]
    fn combined_left_joins_macro_by_day() {
        let store = seeded_store();
        let rows = store.get_combined("bitcoin", 30).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].vix_value, Some(18.0));
        // Jan 2 has no VIX observation; missing macro surfaces as None.
        assert_eq!(rows[1].vix_value, None);
        assert_eq!(rows[2].vix_value, Some(22.0));
        assert_eq!(rows[0].fed_funds_rate, None);
    }

    #[test]
    fn get_indicator_interpolates_gaps() {
        let store = seeded_store();
        let points = store
            .get_indicator(VIX, "2024-01-01", "2024-01-03", true)
            .unwrap();
        assert_eq!(points.len(), 3);
        assert_eq!(points[1].value, 20.0);
        assert!(points[1].is_interpolated);
    }

    #[test]
    fn get_indicator_raw_returns_observations_only() {
        let store = seeded_store();
        let points = store
            .get_indicator(VIX, "2024-01-01", "2024-01-03", false)
            .unwrap();
        assert_eq!(points.len(), 2);
        assert!(points.iter().all(|p| !p.is_interpolated));
    }

    #[test]
    fn bad_date_surfaces_as_bad_date() {
        let store = seeded_store();
        assert!(matches!(
            store.get_indicator(VIX, "01/01/2024", "2024-01-03", true),
            Err(Error::BadDate(_))
        ));
    }

    #[test]
    fn multi_indicator_table_has_one_column_per_indicator() {
        let store = seeded_store();
        store
            .insert_indicator(FED_FUNDS, &[IndicatorPoint::observed(d("2024-01-02"), 5.33)])
            .unwrap();
        let table = store
            .get_multi_indicator(&[VIX, FED_FUNDS], "2024-01-01", "2024-01-03", false)
            .unwrap();
        assert_eq!(table.dates.len(), 3);
        assert_eq!(table.value(VIX, d("2024-01-01")), Some(18.0));
        assert_eq!(table.value(FED_FUNDS, d("2024-01-02")), Some(5.33));
        assert_eq!(table.value(FED_FUNDS, d("2024-01-01")), None);
    }

    #[test]
    fn on_disk_database_reopens_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.db");
        let store = SqliteMarketStore::open(&path).unwrap();
        store
            .insert_ohlcv("bitcoin", &[bar_on("2024-01-01", 50_000.0)])
            .unwrap();
        drop(store);

        // Reopening runs the migrations idempotently and sees the data.
        let store = SqliteMarketStore::open(&path).unwrap();
        assert_eq!(store.get_ohlcv("bitcoin", 10).unwrap().len(), 1);
    }

    #[test]
    fn upsert_replaces_existing_rows() {
        let store = seeded_store();
        store
            .insert_ohlcv("bitcoin", &[bar_on("2024-01-03", 51_000.0)])
            .unwrap();
        let bars = store.get_ohlcv("bitcoin", 30).unwrap();
        assert_eq!(bars.len(), 3);
        assert_eq!(bars[2].close, 51_000.0);
    }
}
