use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, Connection};
use serde::Serialize;

use crate::data::sqlite::open_database;
use crate::error::{Error, Result};
use crate::signals::TradingSignal;

/// Durable trace of one outbound alert attempt. Rows are inserted with
/// `success = false` before the transport is invoked and updated exactly
/// once with the final outcome.
#[derive(Debug, Clone, Serialize)]
pub struct AlertRecord {
    pub id: i64,
    pub alert_type: String,
    pub symbol: String,
    pub signal_type: String,
    pub price: f64,
    pub confidence: f64,
    pub strength: Option<String>,
    pub position_size: Option<f64>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub strategy_name: Option<String>,
    pub webhook_target: Option<String>,
    pub external_message_id: Option<String>,
    pub sent_at: Option<String>,
    pub success: bool,
    pub error_message: Option<String>,
    pub alert_data: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AlertStatistics {
    pub total_alerts: usize,
    pub successful_alerts: usize,
    pub failed_alerts: usize,
    pub success_rate: f64,
    pub alerts_by_symbol: BTreeMap<String, usize>,
    pub alerts_by_signal_type: BTreeMap<String, usize>,
    pub recent_alerts_24h: usize,
}

/// SQLite-backed alert log. Append-mostly: one insert per attempt, one
/// update per final outcome, keyed by the rowid returned at insert.
pub struct AlertLog {
    conn: Mutex<Connection>,
}

impl AlertLog {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(AlertLog {
            conn: Mutex::new(open_database(path)?),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()
            .map_err(|e| Error::store("opening in-memory database", e))?;
        crate::data::sqlite::run_migrations(&mut conn)?;
        Ok(AlertLog {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Insert the attempt row (failed-first) and return its id for the
    /// outcome update.
    pub fn log_attempt(
        &self,
        signal: &TradingSignal,
        webhook_target: &str,
        alert_type: &str,
    ) -> Result<i64> {
        if signal.asset.is_empty() {
            return Err(Error::bad_config("signal must have a valid symbol"));
        }
        if webhook_target.is_empty() {
            return Err(Error::bad_config("webhook target cannot be empty"));
        }

        let alert_data = serde_json::json!({
            "signal_id": signal.signal_id,
            "timestamp": signal.timestamp,
            "analysis_data": signal.analysis_data,
        })
        .to_string();

        let conn = self.lock();
        conn.execute(
            "INSERT INTO discord_alerts (
                 alert_type, symbol, signal_type, price, confidence, strength,
                 position_size, stop_loss, take_profit, strategy_name, webhook_url,
                 sent_at, success, alert_data
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 0, ?13)",
            params![
                alert_type,
                signal.asset,
                signal.signal_type.to_string(),
                signal.price,
                signal.confidence,
                signal.signal_strength.to_string(),
                signal.position_size,
                signal.stop_loss,
                signal.take_profit,
                signal.strategy_name,
                webhook_target,
                Utc::now().to_rfc3339(),
                alert_data,
            ],
        )
        .map_err(|e| Error::store(format!("logging alert attempt for {}", signal.asset), e))?;

        Ok(conn.last_insert_rowid())
    }

    /// Record the final outcome of an attempt. The row id must come from
    /// `log_attempt`.
    pub fn update_result(
        &self,
        alert_id: i64,
        success: bool,
        error_message: Option<&str>,
        external_message_id: Option<&str>,
    ) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE discord_alerts
             SET success = ?1, error_message = ?2, discord_message_id = ?3
             WHERE id = ?4",
            params![success, error_message, external_message_id, alert_id],
        )
        .map_err(|e| Error::store(format!("updating alert {alert_id}"), e))?;
        Ok(())
    }

    /// Apply a batch of `{id: success}` outcomes in one transaction.
    pub fn bulk_update(&self, outcomes: &HashMap<i64, bool>) -> Result<()> {
        if outcomes.is_empty() {
            return Ok(());
        }
        let mut guard = self.lock();
        let tx = guard
            .transaction()
            .map_err(|e| Error::store("starting bulk alert update", e))?;
        {
            let mut stmt = tx
                .prepare("UPDATE discord_alerts SET success = ?1 WHERE id = ?2")
                .map_err(|e| Error::store("preparing bulk alert update", e))?;
            for (id, success) in outcomes {
                stmt.execute(params![success, id])
                    .map_err(|e| Error::store(format!("bulk updating alert {id}"), e))?;
            }
        }
        tx.commit()
            .map_err(|e| Error::store("committing bulk alert update", e))?;
        Ok(())
    }

    pub fn recent_alerts(&self, limit: usize) -> Result<Vec<AlertRecord>> {
        let limit = limit.clamp(1, 1000);
        let conn = self.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT id, alert_type, symbol, signal_type, price, confidence, strength,
                        position_size, stop_loss, take_profit, strategy_name, webhook_url,
                        discord_message_id, sent_at, success, error_message, alert_data
                 FROM discord_alerts ORDER BY id DESC LIMIT ?1",
            )
            .map_err(|e| Error::store("preparing recent alerts query", e))?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok(AlertRecord {
                    id: row.get(0)?,
                    alert_type: row.get(1)?,
                    symbol: row.get(2)?,
                    signal_type: row.get(3)?,
                    price: row.get(4)?,
                    confidence: row.get(5)?,
                    strength: row.get(6)?,
                    position_size: row.get(7)?,
                    stop_loss: row.get(8)?,
                    take_profit: row.get(9)?,
                    strategy_name: row.get(10)?,
                    webhook_target: row.get(11)?,
                    external_message_id: row.get(12)?,
                    sent_at: row.get(13)?,
                    success: row.get(14)?,
                    error_message: row.get(15)?,
                    alert_data: row.get(16)?,
                })
            })
            .map_err(|e| Error::store("querying recent alerts", e))?;
        rows.collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::store("reading recent alerts", e))
    }

    pub fn statistics(&self) -> Result<AlertStatistics> {
        let conn = self.lock();
        let count = |sql: &str| -> Result<usize> {
            conn.query_row(sql, [], |row| row.get::<_, i64>(0))
                .map(|n| n as usize)
                .map_err(|e| Error::store("querying alert statistics", e))
        };

        let total_alerts = count("SELECT COUNT(*) FROM discord_alerts")?;
        let successful_alerts = count("SELECT COUNT(*) FROM discord_alerts WHERE success = 1")?;
        let failed_alerts = count("SELECT COUNT(*) FROM discord_alerts WHERE success = 0")?;
        let recent_alerts_24h = count(
            "SELECT COUNT(*) FROM discord_alerts WHERE sent_at >= datetime('now', '-1 day')",
        )?;

        let mut by_symbol = BTreeMap::new();
        let mut stmt = conn
            .prepare("SELECT symbol, COUNT(*) FROM discord_alerts GROUP BY symbol")
            .map_err(|e| Error::store("preparing symbol stats", e))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .map_err(|e| Error::store("querying symbol stats", e))?;
        for row in rows {
            let (symbol, n) = row.map_err(|e| Error::store("reading symbol stats", e))?;
            by_symbol.insert(symbol, n as usize);
        }

        let mut by_type = BTreeMap::new();
        let mut stmt = conn
            .prepare("SELECT signal_type, COUNT(*) FROM discord_alerts GROUP BY signal_type")
            .map_err(|e| Error::store("preparing type stats", e))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .map_err(|e| Error::store("querying type stats", e))?;
        for row in rows {
            let (signal_type, n) = row.map_err(|e| Error::store("reading type stats", e))?;
            by_type.insert(signal_type, n as usize);
        }

        Ok(AlertStatistics {
            total_alerts,
            successful_alerts,
            failed_alerts,
            success_rate: if total_alerts > 0 {
                successful_alerts as f64 / total_alerts as f64 * 100.0
            } else {
                0.0
            },
            alerts_by_symbol: by_symbol,
            alerts_by_signal_type: by_type,
            recent_alerts_24h,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::{SignalDraft, SignalStrength, SignalType};

    fn signal() -> TradingSignal {
        SignalDraft::new(
            "bitcoin",
            SignalType::Long,
            1_700_000_000_000,
            50_000.0,
            "vix_correlation",
            SignalStrength::Strong,
            0.85,
            0.02,
        )
        .build()
        .unwrap()
    }

    #[test]
    fn attempt_starts_failed_then_updates_once() {
        let log = AlertLog::in_memory().unwrap();
        let id = log.log_attempt(&signal(), "hook-1", "signal_alert").unwrap();

        let rows = log.recent_alerts(10).unwrap();
        assert_eq!(rows.len(), 1);
        assert!(!rows[0].success);
        assert_eq!(rows[0].symbol, "bitcoin");
        assert_eq!(rows[0].signal_type, "LONG");

        log.update_result(id, true, None, Some("msg-42")).unwrap();
        let rows = log.recent_alerts(10).unwrap();
        assert!(rows[0].success);
        assert_eq!(rows[0].external_message_id.as_deref(), Some("msg-42"));
        assert!(rows[0].error_message.is_none());
    }

    #[test]
    fn failure_outcome_records_error() {
        let log = AlertLog::in_memory().unwrap();
        let id = log.log_attempt(&signal(), "hook-1", "signal_alert").unwrap();
        log.update_result(id, false, Some("connection refused"), None)
            .unwrap();
        let rows = log.recent_alerts(10).unwrap();
        assert!(!rows[0].success);
        assert_eq!(rows[0].error_message.as_deref(), Some("connection refused"));
    }

    #[test]
    fn ids_are_totally_ordered() {
        let log = AlertLog::in_memory().unwrap();
        let a = log.log_attempt(&signal(), "hook-1", "signal_alert").unwrap();
        let b = log.log_attempt(&signal(), "hook-1", "signal_alert").unwrap();
        let c = log.log_attempt(&signal(), "hook-1", "signal_alert").unwrap();
        assert!(a < b && b < c);
    }

    #[test]
    fn bulk_update_applies_batch() {
        let log = AlertLog::in_memory().unwrap();
        let a = log.log_attempt(&signal(), "hook-1", "signal_alert").unwrap();
        let b = log.log_attempt(&signal(), "hook-1", "signal_alert").unwrap();
        log.bulk_update(&HashMap::from([(a, true), (b, false)])).unwrap();

        let rows = log.recent_alerts(10).unwrap();
        let by_id: HashMap<i64, bool> = rows.iter().map(|r| (r.id, r.success)).collect();
        assert!(by_id[&a]);
        assert!(!by_id[&b]);
    }

    #[test]
    fn statistics_aggregate_outcomes() {
        let log = AlertLog::in_memory().unwrap();
        let a = log.log_attempt(&signal(), "hook-1", "signal_alert").unwrap();
        log.log_attempt(&signal(), "hook-1", "signal_alert").unwrap();
        log.update_result(a, true, None, None).unwrap();

        let stats = log.statistics().unwrap();
        assert_eq!(stats.total_alerts, 2);
        assert_eq!(stats.successful_alerts, 1);
        assert_eq!(stats.failed_alerts, 1);
        assert!((stats.success_rate - 50.0).abs() < 1e-12);
        assert_eq!(stats.alerts_by_symbol["bitcoin"], 2);
        assert_eq!(stats.alerts_by_signal_type["LONG"], 2);
    }

    #[test]
    fn empty_symbol_is_rejected() {
        let log = AlertLog::in_memory().unwrap();
        let mut bad = signal();
        bad.asset = String::new();
        assert!(log.log_attempt(&bad, "hook-1", "signal_alert").is_err());
        assert!(log.log_attempt(&signal(), "", "signal_alert").is_err());
    }
}
