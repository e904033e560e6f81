//! SQLite database access.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, info};

use super::{RowKey, StorageError, SyncKind, UnsyncedRow};
use crate::types::{PumpStatus, Reading, RelayAction, RelayActionKind, Summary, SummaryPeriod};

/// Idempotent schema, applied on every open.
const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS readings (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp_utc TEXT NOT NULL,
        current_amps REAL,
        status TEXT NOT NULL,
        raw_text TEXT NOT NULL DEFAULT '',
        confidence REAL NOT NULL DEFAULT 0,
        image_ref TEXT,
        processing_ms INTEGER NOT NULL DEFAULT 0,
        synced INTEGER NOT NULL DEFAULT 0,
        error TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_readings_timestamp ON readings (timestamp_utc)",
    "CREATE INDEX IF NOT EXISTS idx_readings_synced ON readings (synced)",
    "CREATE TABLE IF NOT EXISTS relay_actions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp_utc TEXT NOT NULL,
        action TEXT NOT NULL,
        reason TEXT NOT NULL DEFAULT '',
        duration_ms INTEGER NOT NULL DEFAULT 0,
        success INTEGER NOT NULL DEFAULT 0,
        error TEXT,
        synced INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE INDEX IF NOT EXISTS idx_relay_actions_timestamp ON relay_actions (timestamp_utc)",
    "CREATE TABLE IF NOT EXISTS hourly_summaries (
        period_key TEXT PRIMARY KEY,
        total_kwh REAL NOT NULL DEFAULT 0,
        pump_cycles INTEGER NOT NULL DEFAULT 0,
        runtime_minutes REAL NOT NULL DEFAULT 0,
        avg_current REAL NOT NULL DEFAULT 0,
        peak_current REAL NOT NULL DEFAULT 0,
        alert_count INTEGER NOT NULL DEFAULT 0,
        uptime_pct REAL NOT NULL DEFAULT 0,
        synced INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS daily_summaries (
        period_key TEXT PRIMARY KEY,
        total_kwh REAL NOT NULL DEFAULT 0,
        pump_cycles INTEGER NOT NULL DEFAULT 0,
        runtime_minutes REAL NOT NULL DEFAULT 0,
        avg_current REAL NOT NULL DEFAULT 0,
        peak_current REAL NOT NULL DEFAULT 0,
        alert_count INTEGER NOT NULL DEFAULT 0,
        uptime_pct REAL NOT NULL DEFAULT 0,
        synced INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS monthly_summaries (
        period_key TEXT PRIMARY KEY,
        total_kwh REAL NOT NULL DEFAULT 0,
        pump_cycles INTEGER NOT NULL DEFAULT 0,
        runtime_minutes REAL NOT NULL DEFAULT 0,
        avg_current REAL NOT NULL DEFAULT 0,
        peak_current REAL NOT NULL DEFAULT 0,
        alert_count INTEGER NOT NULL DEFAULT 0,
        uptime_pct REAL NOT NULL DEFAULT 0,
        synced INTEGER NOT NULL DEFAULT 0
    )",
];

/// Handle to the wellmonitor database.
///
/// Cloning is cheap; all clones share the same pools.
#[derive(Clone)]
pub struct Db {
    writer: Pool<Sqlite>,
    reader: Pool<Sqlite>,
}

impl Db {
    /// Open (creating if missing) and migrate the database at `path`.
    pub async fn open(path: &Path, deadline: Duration) -> Result<Self, StorageError> {
        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let db = with_deadline(deadline, async {
            let writer = SqlitePoolOptions::new()
                .max_connections(1)
                .connect_with(opts.clone())
                .await?;
            let reader = SqlitePoolOptions::new()
                .max_connections(4)
                .connect_with(opts)
                .await?;

            for stmt in SCHEMA {
                sqlx::query(stmt).execute(&writer).await?;
            }

            Ok::<_, StorageError>(Self { writer, reader })
        })
        .await??;

        info!(component = "storage", path = %path.display(), "database open");
        Ok(db)
    }

    /// In-memory database for tests.
    pub async fn open_in_memory() -> Result<Self, StorageError> {
        let opts = SqliteConnectOptions::new()
            .filename(":memory:")
            .shared_cache(true);

        // A single shared connection so the in-memory database is visible to
        // both "pools".
        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&writer).await?;
        }
        let reader = writer.clone();
        Ok(Self { writer, reader })
    }

    // === Readings ===

    /// Insert a reading and return its row id.
    ///
    /// Enforces the invariant that a reading carries either a confidence in
    /// [0, 1] or a non-null error.
    pub async fn insert_reading(
        &self,
        reading: &Reading,
        deadline: Duration,
    ) -> Result<i64, StorageError> {
        if (reading.confidence < 0.0 || reading.confidence > 1.0) && reading.error.is_none() {
            return Err(StorageError::Invariant(format!(
                "reading confidence {} outside [0,1] with no error",
                reading.confidence
            )));
        }

        let result = with_deadline(deadline, async {
            sqlx::query(
                "INSERT INTO readings
                 (timestamp_utc, current_amps, status, raw_text, confidence, image_ref,
                  processing_ms, synced, error)
                 VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?)",
            )
            .bind(reading.timestamp_utc)
            .bind(reading.current_amps)
            .bind(reading.status.as_str())
            .bind(&reading.raw_text)
            .bind(reading.confidence)
            .bind(&reading.image_ref)
            .bind(reading.processing_ms)
            .bind(&reading.error)
            .execute(&self.writer)
            .await
        })
        .await??;

        Ok(result.last_insert_rowid())
    }

    /// The most recent reading, if any.
    pub async fn latest_reading(&self, deadline: Duration) -> Result<Option<Reading>, StorageError> {
        let row = with_deadline(deadline, async {
            sqlx::query("SELECT * FROM readings ORDER BY id DESC LIMIT 1")
                .fetch_optional(&self.reader)
                .await
        })
        .await??;
        row.map(|r| reading_from_row(&r)).transpose().map_err(Into::into)
    }

    /// Readings in the closed interval `[start, end]`, oldest first.
    pub async fn readings_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        deadline: Duration,
    ) -> Result<Vec<Reading>, StorageError> {
        let rows = with_deadline(deadline, async {
            sqlx::query(
                "SELECT * FROM readings WHERE timestamp_utc >= ? AND timestamp_utc <= ?
                 ORDER BY timestamp_utc ASC, id ASC",
            )
            .bind(start)
            .bind(end)
            .fetch_all(&self.reader)
            .await
        })
        .await??;
        rows.iter().map(reading_from_row).collect::<Result<_, _>>().map_err(Into::into)
    }

    // === Relay actions ===

    pub async fn insert_relay_action(
        &self,
        action: &RelayAction,
        deadline: Duration,
    ) -> Result<i64, StorageError> {
        let result = with_deadline(deadline, async {
            sqlx::query(
                "INSERT INTO relay_actions
                 (timestamp_utc, action, reason, duration_ms, success, error, synced)
                 VALUES (?, ?, ?, ?, ?, ?, 0)",
            )
            .bind(action.timestamp_utc)
            .bind(action.action.as_str())
            .bind(&action.reason)
            .bind(action.duration_ms)
            .bind(action.success)
            .bind(&action.error)
            .execute(&self.writer)
            .await
        })
        .await??;
        Ok(result.last_insert_rowid())
    }

    /// Relay actions in the closed interval `[start, end]`, oldest first.
    pub async fn relay_actions_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        deadline: Duration,
    ) -> Result<Vec<RelayAction>, StorageError> {
        let rows = with_deadline(deadline, async {
            sqlx::query(
                "SELECT * FROM relay_actions WHERE timestamp_utc >= ? AND timestamp_utc <= ?
                 ORDER BY timestamp_utc ASC, id ASC",
            )
            .bind(start)
            .bind(end)
            .fetch_all(&self.reader)
            .await
        })
        .await??;
        rows.iter().map(relay_action_from_row).collect::<Result<_, _>>().map_err(Into::into)
    }

    // === Summaries ===

    /// Insert or replace a summary row. Re-running the aggregator over the
    /// same readings writes the identical row, so upsert keeps this
    /// idempotent.
    pub async fn upsert_summary(
        &self,
        period: SummaryPeriod,
        summary: &Summary,
        deadline: Duration,
    ) -> Result<(), StorageError> {
        let sql = format!(
            "INSERT INTO {} (period_key, total_kwh, pump_cycles, runtime_minutes, avg_current,
                             peak_current, alert_count, uptime_pct, synced)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0)
             ON CONFLICT(period_key) DO UPDATE SET
                total_kwh = excluded.total_kwh,
                pump_cycles = excluded.pump_cycles,
                runtime_minutes = excluded.runtime_minutes,
                avg_current = excluded.avg_current,
                peak_current = excluded.peak_current,
                alert_count = excluded.alert_count,
                uptime_pct = excluded.uptime_pct,
                synced = 0",
            period.table()
        );
        with_deadline(deadline, async {
            sqlx::query(&sql)
                .bind(&summary.period_key)
                .bind(summary.total_kwh)
                .bind(summary.pump_cycles)
                .bind(summary.runtime_minutes)
                .bind(summary.avg_current)
                .bind(summary.peak_current)
                .bind(summary.alert_count)
                .bind(summary.uptime_pct)
                .execute(&self.writer)
                .await
        })
        .await??;
        Ok(())
    }

    pub async fn get_summary(
        &self,
        period: SummaryPeriod,
        key: &str,
        deadline: Duration,
    ) -> Result<Option<Summary>, StorageError> {
        let sql = format!("SELECT * FROM {} WHERE period_key = ?", period.table());
        let row = with_deadline(deadline, async {
            sqlx::query(&sql).bind(key).fetch_optional(&self.reader).await
        })
        .await??;
        row.map(|r| summary_from_row(&r)).transpose().map_err(Into::into)
    }

    // === Generic sync surface ===

    /// Unsynced rows of one family, oldest first, as upload-ready JSON.
    pub async fn list_unsynced(
        &self,
        kind: SyncKind,
        limit: u32,
        deadline: Duration,
    ) -> Result<Vec<UnsyncedRow>, StorageError> {
        match kind {
            SyncKind::Readings => {
                let rows = with_deadline(deadline, async {
                    sqlx::query("SELECT * FROM readings WHERE synced = 0 ORDER BY id ASC LIMIT ?")
                        .bind(i64::from(limit))
                        .fetch_all(&self.reader)
                        .await
                })
                .await??;
                rows.iter()
                    .map(|r| {
                        let reading = reading_from_row(r)?;
                        Ok(UnsyncedRow {
                            key: RowKey::Id(reading.id),
                            payload: serde_json::to_value(&reading)
                                .unwrap_or(serde_json::Value::Null),
                        })
                    })
                    .collect::<Result<_, sqlx::Error>>()
                    .map_err(Into::into)
            }
            SyncKind::RelayActions => {
                let rows = with_deadline(deadline, async {
                    sqlx::query(
                        "SELECT * FROM relay_actions WHERE synced = 0 ORDER BY id ASC LIMIT ?",
                    )
                    .bind(i64::from(limit))
                    .fetch_all(&self.reader)
                    .await
                })
                .await??;
                rows.iter()
                    .map(|r| {
                        let action = relay_action_from_row(r)?;
                        Ok(UnsyncedRow {
                            key: RowKey::Id(action.id),
                            payload: serde_json::to_value(&action)
                                .unwrap_or(serde_json::Value::Null),
                        })
                    })
                    .collect::<Result<_, sqlx::Error>>()
                    .map_err(Into::into)
            }
            SyncKind::Summaries(period) => {
                let sql = format!(
                    "SELECT * FROM {} WHERE synced = 0 ORDER BY period_key ASC LIMIT ?",
                    period.table()
                );
                let rows = with_deadline(deadline, async {
                    sqlx::query(&sql)
                        .bind(i64::from(limit))
                        .fetch_all(&self.reader)
                        .await
                })
                .await??;
                rows.iter()
                    .map(|r| {
                        let summary = summary_from_row(r)?;
                        Ok(UnsyncedRow {
                            key: RowKey::Period(summary.period_key.clone()),
                            payload: serde_json::to_value(&summary)
                                .unwrap_or(serde_json::Value::Null),
                        })
                    })
                    .collect::<Result<_, sqlx::Error>>()
                    .map_err(Into::into)
            }
        }
    }

    /// Flip `synced` to true for the given keys. Returns the number of rows
    /// updated. This is the only mutation allowed on persisted rows.
    pub async fn mark_synced(
        &self,
        kind: SyncKind,
        keys: &[RowKey],
        deadline: Duration,
    ) -> Result<u64, StorageError> {
        if keys.is_empty() {
            return Ok(0);
        }

        let (table, key_col) = match kind {
            SyncKind::Readings => ("readings", "id"),
            SyncKind::RelayActions => ("relay_actions", "id"),
            SyncKind::Summaries(period) => (period.table(), "period_key"),
        };
        let placeholders = vec!["?"; keys.len()].join(", ");
        let sql =
            format!("UPDATE {table} SET synced = 1 WHERE {key_col} IN ({placeholders})");

        let result = with_deadline(deadline, async {
            let mut query = sqlx::query(&sql);
            for key in keys {
                query = match key {
                    RowKey::Id(id) => query.bind(*id),
                    RowKey::Period(k) => query.bind(k.clone()),
                };
            }
            query.execute(&self.writer).await
        })
        .await??;

        debug!(
            component = "storage",
            kind = kind.as_str(),
            rows = result.rows_affected(),
            "marked synced"
        );
        Ok(result.rows_affected())
    }

    /// Quarantine a row the hub permanently rejects: record the reason and
    /// set `synced` so the row stops blocking the batch.
    pub async fn quarantine(
        &self,
        kind: SyncKind,
        key: &RowKey,
        reason: &str,
        deadline: Duration,
    ) -> Result<(), StorageError> {
        with_deadline(deadline, async {
            match (kind, key) {
                (SyncKind::Readings, RowKey::Id(id)) => {
                    sqlx::query("UPDATE readings SET error = ?, synced = 1 WHERE id = ?")
                        .bind(reason)
                        .bind(*id)
                        .execute(&self.writer)
                        .await
                        .map_err(StorageError::from)
                }
                (SyncKind::RelayActions, RowKey::Id(id)) => {
                    sqlx::query("UPDATE relay_actions SET error = ?, synced = 1 WHERE id = ?")
                        .bind(reason)
                        .bind(*id)
                        .execute(&self.writer)
                        .await
                        .map_err(StorageError::from)
                }
                // Summary tables carry no error column; re-aggregation
                // rewrites the row, so only the synced flag moves.
                (SyncKind::Summaries(period), RowKey::Period(k)) => {
                    let sql =
                        format!("UPDATE {} SET synced = 1 WHERE period_key = ?", period.table());
                    sqlx::query(&sql)
                        .bind(k.clone())
                        .execute(&self.writer)
                        .await
                        .map_err(StorageError::from)
                }
                _ => Err(StorageError::Invariant(format!(
                    "mismatched key {key} for kind {}",
                    kind.as_str()
                ))),
            }
        })
        .await??;
        Ok(())
    }

    // === Retention ===

    /// Delete synced readings and relay actions older than `before`.
    /// Returns the number of rows removed.
    pub async fn prune(
        &self,
        before: DateTime<Utc>,
        deadline: Duration,
    ) -> Result<u64, StorageError> {
        let removed = with_deadline(deadline, async {
            let a = sqlx::query("DELETE FROM readings WHERE synced = 1 AND timestamp_utc < ?")
                .bind(before)
                .execute(&self.writer)
                .await?;
            let b =
                sqlx::query("DELETE FROM relay_actions WHERE synced = 1 AND timestamp_utc < ?")
                    .bind(before)
                    .execute(&self.writer)
                    .await?;
            Ok::<_, sqlx::Error>(a.rows_affected() + b.rows_affected())
        })
        .await??;

        if removed > 0 {
            info!(component = "storage", rows = removed, "pruned expired rows");
        }
        Ok(removed)
    }

    pub async fn vacuum(&self, deadline: Duration) -> Result<(), StorageError> {
        with_deadline(deadline, async {
            sqlx::query("VACUUM").execute(&self.writer).await
        })
        .await??;
        Ok(())
    }
}

/// Run `fut` under the operation deadline.
async fn with_deadline<T>(
    deadline: Duration,
    fut: impl std::future::Future<Output = T>,
) -> Result<T, StorageError> {
    tokio::time::timeout(deadline, fut)
        .await
        .map_err(|_| StorageError::Timeout(deadline))
}

// === Row mapping ===

fn reading_from_row(row: &SqliteRow) -> Result<Reading, sqlx::Error> {
    Ok(Reading {
        id: row.try_get("id")?,
        timestamp_utc: row.try_get("timestamp_utc")?,
        current_amps: row.try_get("current_amps")?,
        status: PumpStatus::from_str_lossy(row.try_get::<String, _>("status")?.as_str()),
        raw_text: row.try_get("raw_text")?,
        confidence: row.try_get("confidence")?,
        image_ref: row.try_get("image_ref")?,
        processing_ms: row.try_get("processing_ms")?,
        synced: row.try_get("synced")?,
        error: row.try_get("error")?,
    })
}

fn relay_action_from_row(row: &SqliteRow) -> Result<RelayAction, sqlx::Error> {
    Ok(RelayAction {
        id: row.try_get("id")?,
        timestamp_utc: row.try_get("timestamp_utc")?,
        action: RelayActionKind::from_str_lossy(row.try_get::<String, _>("action")?.as_str()),
        reason: row.try_get("reason")?,
        duration_ms: row.try_get("duration_ms")?,
        success: row.try_get("success")?,
        error: row.try_get("error")?,
        synced: row.try_get("synced")?,
    })
}

fn summary_from_row(row: &SqliteRow) -> Result<Summary, sqlx::Error> {
    Ok(Summary {
        period_key: row.try_get("period_key")?,
        total_kwh: row.try_get("total_kwh")?,
        pump_cycles: row.try_get("pump_cycles")?,
        runtime_minutes: row.try_get("runtime_minutes")?,
        avg_current: row.try_get("avg_current")?,
        peak_current: row.try_get("peak_current")?,
        alert_count: row.try_get("alert_count")?,
        uptime_pct: row.try_get("uptime_pct")?,
        synced: row.try_get("synced")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PumpStatus;

    const DL: Duration = Duration::from_secs(5);

    fn reading(ts: DateTime<Utc>, amps: f64) -> Reading {
        Reading {
            id: 0,
            timestamp_utc: ts,
            current_amps: Some(amps),
            status: PumpStatus::Normal,
            raw_text: format!("{amps:.2}"),
            confidence: 0.9,
            image_ref: None,
            processing_ms: 100,
            synced: false,
            error: None,
        }
    }

    #[tokio::test]
    async fn test_insert_and_fetch_reading() {
        let db = Db::open_in_memory().await.unwrap();
        let ts = Utc::now();
        let id = db.insert_reading(&reading(ts, 4.25), DL).await.unwrap();
        assert!(id > 0);

        let latest = db.latest_reading(DL).await.unwrap().unwrap();
        assert_eq!(latest.id, id);
        assert_eq!(latest.current_amps, Some(4.25));
        assert_eq!(latest.status, PumpStatus::Normal);
        assert!(!latest.synced);
    }

    #[tokio::test]
    async fn test_invariant_bad_confidence_without_error() {
        let db = Db::open_in_memory().await.unwrap();
        let mut r = reading(Utc::now(), 1.0);
        r.confidence = 2.0;
        let err = db.insert_reading(&r, DL).await.unwrap_err();
        assert!(matches!(err, StorageError::Invariant(_)));

        // With an error set, out-of-range confidence is clamped upstream;
        // the row is acceptable.
        r.error = Some("ocr failed".to_string());
        assert!(db.insert_reading(&r, DL).await.is_ok());
    }

    #[tokio::test]
    async fn test_unsynced_lifecycle() {
        let db = Db::open_in_memory().await.unwrap();
        for i in 0..3 {
            db.insert_reading(&reading(Utc::now(), f64::from(i)), DL)
                .await
                .unwrap();
        }

        let unsynced = db.list_unsynced(SyncKind::Readings, 100, DL).await.unwrap();
        assert_eq!(unsynced.len(), 3);

        let keys: Vec<RowKey> = unsynced.iter().map(|r| r.key.clone()).collect();
        let updated = db.mark_synced(SyncKind::Readings, &keys, DL).await.unwrap();
        assert_eq!(updated, 3);

        let remaining = db.list_unsynced(SyncKind::Readings, 100, DL).await.unwrap();
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn test_summary_upsert_idempotent() {
        let db = Db::open_in_memory().await.unwrap();
        let summary = Summary {
            period_key: "2026-08-01 10".to_string(),
            total_kwh: 1.5,
            pump_cycles: 4,
            runtime_minutes: 42.0,
            avg_current: 4.1,
            peak_current: 5.2,
            alert_count: 0,
            uptime_pct: 100.0,
            synced: false,
        };
        db.upsert_summary(SummaryPeriod::Hourly, &summary, DL).await.unwrap();
        db.upsert_summary(SummaryPeriod::Hourly, &summary, DL).await.unwrap();

        let fetched = db
            .get_summary(SummaryPeriod::Hourly, "2026-08-01 10", DL)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.total_kwh, 1.5);
        assert_eq!(fetched.pump_cycles, 4);
    }

    #[tokio::test]
    async fn test_prune_only_removes_synced() {
        let db = Db::open_in_memory().await.unwrap();
        let old = Utc::now() - chrono::Duration::days(60);
        let id_old = db.insert_reading(&reading(old, 1.0), DL).await.unwrap();
        let _id_new = db.insert_reading(&reading(Utc::now(), 2.0), DL).await.unwrap();

        // Not yet synced: nothing pruned.
        let removed = db
            .prune(Utc::now() - chrono::Duration::days(30), DL)
            .await
            .unwrap();
        assert_eq!(removed, 0);

        db.mark_synced(SyncKind::Readings, &[RowKey::Id(id_old)], DL)
            .await
            .unwrap();
        let removed = db
            .prune(Utc::now() - chrono::Duration::days(30), DL)
            .await
            .unwrap();
        assert_eq!(removed, 1);
    }

    #[tokio::test]
    async fn test_quarantine_unblocks_row() {
        let db = Db::open_in_memory().await.unwrap();
        let id = db.insert_reading(&reading(Utc::now(), 3.0), DL).await.unwrap();
        db.quarantine(SyncKind::Readings, &RowKey::Id(id), "schema mismatch", DL)
            .await
            .unwrap();
        let unsynced = db.list_unsynced(SyncKind::Readings, 100, DL).await.unwrap();
        assert!(unsynced.is_empty());
    }

    #[tokio::test]
    async fn test_readings_between_is_ordered() {
        let db = Db::open_in_memory().await.unwrap();
        let base = Utc::now();
        for i in [2i64, 0, 1] {
            let mut r = reading(base + chrono::Duration::seconds(i * 30), 1.0);
            r.raw_text = i.to_string();
            db.insert_reading(&r, DL).await.unwrap();
        }
        let rows = db
            .readings_between(base, base + chrono::Duration::seconds(120), DL)
            .await
            .unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.windows(2).all(|w| w[0].timestamp_utc <= w[1].timestamp_utc));
    }
}
