//! Read-only queries against the worker's status database.
//!
//! The supervisor never writes this database. It asks two kinds of
//! question: whether the series has reached the expected status (once per
//! poll), and, when that never happens, what the table looks like, so the
//! failure can say which of "nothing registered at all", "other series but
//! not this one", and "this series stuck in another status" occurred.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use rusqlite::{Connection, OpenFlags, params};

use crate::config::DatabaseConfig;

/// How long one read waits on a writer's lock. The wait loop runs on the
/// job's async thread, so a locked database reads as one failed attempt.
const LOCK_WAIT: Duration = Duration::from_millis(250);

/// How to find one series' status record.
#[derive(Debug, Clone)]
pub struct StatusQuery {
    /// Database file.
    pub db_path: PathBuf,
    /// Table name (validated identifier).
    pub table: String,
    /// Series identifier column (validated identifier).
    pub series_column: String,
    /// Status column (validated identifier).
    pub status_column: String,
    /// Series to look for.
    pub series_id: String,
    /// Status that satisfies the wait.
    pub expected_status: String,
}

/// Result of one status read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusObservation {
    /// The series row carries the expected status.
    Reached,
    /// The series row exists with a different status.
    OtherStatus(String),
    /// No row for the series.
    NotRegistered,
}

/// Database state captured when the status wait gives up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusDiagnosis {
    /// The database could not be opened.
    Unavailable {
        /// Open error.
        reason: String,
    },
    /// The status table does not exist.
    TableMissing {
        /// Table name.
        table: String,
    },
    /// The table exists but holds no rows at all.
    EmptyDatabase,
    /// Rows exist, none for the series.
    SeriesUnregistered {
        /// Total rows.
        total_rows: i64,
        /// Row counts per status.
        by_status: Vec<(String, i64)>,
    },
    /// A row for the series exists with an unexpected status.
    SeriesStuck {
        /// Status actually recorded.
        status: String,
        /// Total rows.
        total_rows: i64,
        /// Row counts per status.
        by_status: Vec<(String, i64)>,
    },
    /// The series reached the expected status after all.
    SeriesReached,
}

impl StatusQuery {
    /// Build a query from configuration.
    #[must_use]
    pub fn new(db_path: PathBuf, config: &DatabaseConfig, series_id: &str) -> Self {
        Self {
            db_path,
            table: config.table.clone(),
            series_column: config.series_column.clone(),
            status_column: config.status_column.clone(),
            series_id: series_id.to_string(),
            expected_status: config.expected_status.clone(),
        }
    }

    fn open(&self) -> rusqlite::Result<Connection> {
        let conn = Connection::open_with_flags(
            &self.db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(LOCK_WAIT)?;
        Ok(conn)
    }

    /// Read the series status once.
    ///
    /// # Errors
    ///
    /// Returns the SQLite error (missing file, missing table, busy); callers
    /// treat it as "not yet".
    pub fn observe(&self) -> rusqlite::Result<StatusObservation> {
        let conn = self.open()?;
        self.observe_with(
            &conn,
            &quote(&self.table),
            &quote(&self.series_column),
            &quote(&self.status_column),
        )
    }

    /// Capture the table state for a timeout report. Never fails; errors
    /// become part of the diagnosis.
    #[must_use]
    pub fn diagnose(&self) -> StatusDiagnosis {
        let conn = match self.open() {
            Ok(conn) => conn,
            Err(err) => {
                return StatusDiagnosis::Unavailable {
                    reason: err.to_string(),
                };
            },
        };
        match self.diagnose_with(&conn) {
            Ok(diagnosis) => diagnosis,
            Err(err) => StatusDiagnosis::Unavailable {
                reason: err.to_string(),
            },
        }
    }

    fn diagnose_with(&self, conn: &Connection) -> rusqlite::Result<StatusDiagnosis> {
        let table_exists: i64 = conn.query_row(
            "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![self.table],
            |row| row.get(0),
        )?;
        if table_exists == 0 {
            return Ok(StatusDiagnosis::TableMissing {
                table: self.table.clone(),
            });
        }

        let (table, series, status) = (
            quote(&self.table),
            quote(&self.series_column),
            quote(&self.status_column),
        );
        let total_rows: i64 =
            conn.query_row(&format!("SELECT count(*) FROM {table}"), [], |row| row.get(0))?;
        if total_rows == 0 {
            return Ok(StatusDiagnosis::EmptyDatabase);
        }

        let mut stmt = conn.prepare(&format!(
            "SELECT coalesce({status}, 'NULL'), count(*) FROM {table} GROUP BY 1 ORDER BY 1"
        ))?;
        let by_status = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(match self.observe_with(conn, &table, &series, &status)? {
            StatusObservation::Reached => StatusDiagnosis::SeriesReached,
            StatusObservation::OtherStatus(status) => StatusDiagnosis::SeriesStuck {
                status,
                total_rows,
                by_status,
            },
            StatusObservation::NotRegistered => StatusDiagnosis::SeriesUnregistered {
                total_rows,
                by_status,
            },
        })
    }

    fn observe_with(
        &self,
        conn: &Connection,
        table: &str,
        series: &str,
        status: &str,
    ) -> rusqlite::Result<StatusObservation> {
        let statuses: Vec<Option<String>> = conn
            .prepare(&format!("SELECT {status} FROM {table} WHERE {series} = ?1"))?
            .query_map(params![self.series_id], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;

        if statuses
            .iter()
            .any(|s| s.as_deref() == Some(self.expected_status.as_str()))
        {
            Ok(StatusObservation::Reached)
        } else if let Some(first) = statuses.into_iter().next() {
            Ok(StatusObservation::OtherStatus(
                first.unwrap_or_else(|| "NULL".to_string()),
            ))
        } else {
            Ok(StatusObservation::NotRegistered)
        }
    }
}

/// Quote a (pre-validated) identifier for interpolation.
fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

fn render_counts(by_status: &[(String, i64)]) -> String {
    by_status
        .iter()
        .map(|(status, count)| format!("  {status}: {count}"))
        .collect::<Vec<_>>()
        .join("\n")
}

impl fmt::Display for StatusDiagnosis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable { reason } => write!(f, "database unavailable: {reason}"),
            Self::TableMissing { table } => write!(f, "table {table} does not exist"),
            Self::EmptyDatabase => write!(f, "database is empty: no series registered at all"),
            Self::SeriesUnregistered {
                total_rows,
                by_status,
            } => write!(
                f,
                "series never registered ({total_rows} other row(s))\nrows by status:\n{}",
                render_counts(by_status)
            ),
            Self::SeriesStuck {
                status,
                total_rows,
                by_status,
            } => write!(
                f,
                "series stuck in status {status:?} ({total_rows} row(s) total)\nrows by status:\n{}",
                render_counts(by_status)
            ),
            Self::SeriesReached => write!(f, "series reached the expected status"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(rows: &[(&str, &str)]) -> (tempfile::TempDir, StatusQuery) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("jobs.db");
        let conn = Connection::open(&db_path).unwrap();
        conn.execute_batch("CREATE TABLE series (series_name TEXT PRIMARY KEY, status TEXT);")
            .unwrap();
        for (series, status) in rows {
            conn.execute(
                "INSERT INTO series (series_name, status) VALUES (?1, ?2)",
                params![series, status],
            )
            .unwrap();
        }
        let query = StatusQuery::new(db_path, &DatabaseConfig::default(), "S");
        (dir, query)
    }

    #[test]
    fn test_observe() {
        let (_dir, query) = seeded(&[("S", "initialized")]);
        assert_eq!(query.observe().unwrap(), StatusObservation::Reached);

        let (_dir, query) = seeded(&[("S", "queued")]);
        assert_eq!(
            query.observe().unwrap(),
            StatusObservation::OtherStatus("queued".to_string())
        );

        let (_dir, query) = seeded(&[("T", "initialized")]);
        assert_eq!(query.observe().unwrap(), StatusObservation::NotRegistered);
    }

    #[test]
    fn test_observe_missing_database_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let query = StatusQuery::new(dir.path().join("none.db"), &DatabaseConfig::default(), "S");
        assert!(query.observe().is_err());
        assert!(matches!(
            query.diagnose(),
            StatusDiagnosis::Unavailable { .. }
        ));
    }

    #[test]
    fn test_locked_database_fails_fast() {
        let (dir, query) = seeded(&[("S", "initialized")]);
        let writer = Connection::open(dir.path().join("jobs.db")).unwrap();
        writer.execute_batch("BEGIN EXCLUSIVE;").unwrap();

        let started = std::time::Instant::now();
        assert!(query.observe().is_err());
        assert!(started.elapsed() < Duration::from_secs(2));

        writer.execute_batch("COMMIT;").unwrap();
        assert_eq!(query.observe().unwrap(), StatusObservation::Reached);
    }

    #[test]
    fn test_diagnose_empty_database() {
        let (_dir, query) = seeded(&[]);
        let diagnosis = query.diagnose();
        assert_eq!(diagnosis, StatusDiagnosis::EmptyDatabase);
        assert!(diagnosis.to_string().contains("empty"));
    }

    #[test]
    fn test_diagnose_unregistered_series() {
        let (_dir, query) = seeded(&[("A", "initialized"), ("B", "done"), ("C", "done")]);
        let diagnosis = query.diagnose();
        assert_eq!(
            diagnosis,
            StatusDiagnosis::SeriesUnregistered {
                total_rows: 3,
                by_status: vec![("done".to_string(), 2), ("initialized".to_string(), 1)],
            }
        );
        let text = diagnosis.to_string();
        assert!(text.contains("never registered"));
        assert!(text.contains("done: 2"));
    }

    #[test]
    fn test_diagnose_stuck_series() {
        let (_dir, query) = seeded(&[("S", "queued"), ("B", "done")]);
        let diagnosis = query.diagnose();
        assert_eq!(
            diagnosis,
            StatusDiagnosis::SeriesStuck {
                status: "queued".to_string(),
                total_rows: 2,
                by_status: vec![("done".to_string(), 1), ("queued".to_string(), 1)],
            }
        );
        assert!(diagnosis.to_string().contains("stuck in status \"queued\""));
    }

    #[test]
    fn test_diagnose_missing_table() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("jobs.db");
        Connection::open(&db_path)
            .unwrap()
            .execute_batch("CREATE TABLE alembic_version (version_num TEXT);")
            .unwrap();
        let query = StatusQuery::new(db_path, &DatabaseConfig::default(), "S");
        assert_eq!(
            query.diagnose(),
            StatusDiagnosis::TableMissing {
                table: "series".to_string()
            }
        );
    }
}
