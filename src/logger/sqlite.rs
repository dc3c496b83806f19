//! SQLite activity log: WAL-mode database for structured event storage and querying.
//!
//! Lives in its own file, separate from the counter store, so a slow or full
//! log database never contends with counter commits.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use rusqlite::{Connection, OpenFlags, params};
use serde::Serialize;

use crate::core::errors::{BeaconError, Result};

/// SQLite activity logger with WAL mode and prepared-statement patterns.
pub struct SqliteLogger {
    conn: Connection,
    path: PathBuf,
}

impl SqliteLogger {
    /// Open (or create) the database at `path`, applying schema and PRAGMAs.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| BeaconError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        apply_pragmas(&conn)?;
        apply_schema(&conn)?;

        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Insert a row into `activity_log`.
    pub fn log_activity(&self, row: &ActivityRow) -> Result<()> {
        self.conn
            .prepare_cached(
                "INSERT INTO activity_log (
                timestamp, event_type, severity, batch_id, cells, attempts,
                http_status, store_key, duration_ms, success, error_code,
                error_message, details
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)",
            )?
            .execute(params![
                row.timestamp,
                row.event_type,
                row.severity,
                row.batch_id,
                row.cells,
                row.attempts,
                row.http_status,
                row.store_key,
                row.duration_ms,
                row.success,
                row.error_code,
                row.error_message,
                row.details,
            ])?;
        Ok(())
    }

    /// Query recent activity entries, newest first.
    pub fn recent_activity(&self, limit: u32) -> Result<Vec<ActivityRow>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT timestamp, event_type, severity, batch_id, cells, attempts,
                    http_status, store_key, duration_ms, success, error_code,
                    error_message, details
             FROM activity_log ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], |row| {
                Ok(ActivityRow {
                    timestamp: row.get(0)?,
                    event_type: row.get(1)?,
                    severity: row.get(2)?,
                    batch_id: row.get(3)?,
                    cells: row.get(4)?,
                    attempts: row.get(5)?,
                    http_status: row.get(6)?,
                    store_key: row.get(7)?,
                    duration_ms: row.get(8)?,
                    success: row.get(9)?,
                    error_code: row.get(10)?,
                    error_message: row.get(11)?,
                    details: row.get(12)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Count activity entries of a given event_type since a timestamp.
    pub fn count_events_since(&self, event_type: &str, since: &str) -> Result<i64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM activity_log WHERE event_type = ?1 AND timestamp >= ?2",
            params![event_type, since],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Delete activity_log rows older than `retention_days`.
    pub fn prune_activity_log(&self, retention_days: u32) -> Result<usize> {
        let cutoff = chrono::Utc::now() - chrono::Duration::days(i64::from(retention_days));
        let cutoff_str = cutoff.to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let deleted = self.conn.execute(
            "DELETE FROM activity_log WHERE timestamp < ?1",
            params![cutoff_str],
        )?;
        Ok(deleted)
    }

    pub fn is_wal_mode(&self) -> bool {
        self.conn
            .query_row("PRAGMA journal_mode", [], |row| row.get::<_, String>(0))
            .map(|mode| mode.eq_ignore_ascii_case("wal"))
            .unwrap_or(false)
    }
}

/// Row for the `activity_log` table.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ActivityRow {
    pub timestamp: String,
    pub event_type: String,
    pub severity: String,
    pub batch_id: Option<String>,
    pub cells: Option<i64>,
    pub attempts: Option<i64>,
    pub http_status: Option<i64>,
    pub store_key: Option<String>,
    pub duration_ms: Option<i64>,
    pub success: i32,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub details: Option<String>,
}

// ──────────────────── schema & pragmas ────────────────────

fn apply_pragmas(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA temp_store = MEMORY;
         PRAGMA busy_timeout = 5000;",
    )?;
    let mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
    if !mode.eq_ignore_ascii_case("wal") {
        eprintln!("[UMB-SQLITE] WARNING: requested WAL mode but got '{mode}'");
    }
    Ok(())
}

fn apply_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS activity_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            severity TEXT NOT NULL,
            batch_id TEXT,
            cells INTEGER,
            attempts INTEGER,
            http_status INTEGER,
            store_key TEXT,
            duration_ms INTEGER,
            success INTEGER NOT NULL DEFAULT 1,
            error_code TEXT,
            error_message TEXT,
            details TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_activity_timestamp ON activity_log(timestamp);
        CREATE INDEX IF NOT EXISTS idx_activity_type_time ON activity_log(event_type, timestamp);
        CREATE INDEX IF NOT EXISTS idx_activity_batch ON activity_log(batch_id);",
    )?;
    Ok(())
}

// ──────────────────── tests ────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_db() -> (tempfile::TempDir, SqliteLogger) {
        let dir = tempfile::tempdir().unwrap();
        let logger = SqliteLogger::open(&dir.path().join("activity.sqlite3")).unwrap();
        (dir, logger)
    }

    fn row(ts: &str, event_type: &str) -> ActivityRow {
        ActivityRow {
            timestamp: ts.to_string(),
            event_type: event_type.to_string(),
            severity: "info".to_string(),
            success: 1,
            ..ActivityRow::default()
        }
    }

    #[test]
    fn schema_created_and_wal_active() {
        let (_dir, logger) = temp_db();
        assert!(logger.is_wal_mode());
        assert!(logger.recent_activity(10).unwrap().is_empty());
    }

    #[test]
    fn insert_and_query_newest_first() {
        let (_dir, logger) = temp_db();
        logger
            .log_activity(&row("2026-03-01T10:00:00Z", "batch_cut"))
            .unwrap();
        logger
            .log_activity(&ActivityRow {
                batch_id: Some("20260301T100000Z-0a1b2c3d".to_string()),
                http_status: Some(200),
                attempts: Some(1),
                ..row("2026-03-01T10:00:01Z", "upload_delivered")
            })
            .unwrap();

        let results = logger.recent_activity(10).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].event_type, "upload_delivered");
        assert_eq!(results[0].http_status, Some(200));
        assert_eq!(results[1].event_type, "batch_cut");
    }

    #[test]
    fn counts_filter_by_type_and_time() {
        let (_dir, logger) = temp_db();
        for i in 0..5 {
            logger
                .log_activity(&row(&format!("2026-03-01T10:0{i}:00Z"), "upload_deferred"))
                .unwrap();
        }
        logger
            .log_activity(&row("2026-03-01T11:00:00Z", "upload_delivered"))
            .unwrap();
        assert_eq!(
            logger
                .count_events_since("upload_deferred", "2026-03-01T10:02:00Z")
                .unwrap(),
            3
        );
    }

    #[test]
    fn prune_removes_old_rows() {
        let (_dir, logger) = temp_db();
        logger
            .log_activity(&row("2000-01-01T00:00:00Z", "batch_cut"))
            .unwrap();
        let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        logger.log_activity(&row(&now, "batch_cut")).unwrap();
        assert_eq!(logger.prune_activity_log(30).unwrap(), 1);
        assert_eq!(logger.recent_activity(10).unwrap().len(), 1);
    }

    #[test]
    fn idempotent_schema_creation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idempotent.sqlite3");
        let _ = SqliteLogger::open(&path).unwrap();
        let logger = SqliteLogger::open(&path).unwrap();
        assert!(logger.is_wal_mode());
    }
}
