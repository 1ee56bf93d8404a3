use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{types::Type, Connection, Row};

use crate::error::{Result, SchedulerError};

/// One SQLite connection shared by the methods of a single component.
///
/// Each component (store, queue, coordinator) gets its own connection;
/// processes on the same host share the database file.
pub type SharedConnection = Arc<Mutex<Connection>>;

/// Open `path` with the pragmas every tickwork process relies on.
pub fn open(path: &str, busy_timeout_ms: u64) -> Result<Connection> {
    let conn = Connection::open(path)?;
    configure(&conn, busy_timeout_ms)?;
    Ok(conn)
}

/// Apply WAL mode, foreign keys and the busy timeout to `conn`.
pub fn configure(conn: &Connection, busy_timeout_ms: u64) -> Result<()> {
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    conn.busy_timeout(Duration::from_millis(busy_timeout_ms))?;
    Ok(())
}

pub fn shared(conn: Connection) -> SharedConnection {
    Arc::new(Mutex::new(conn))
}

pub(crate) fn lock(conn: &SharedConnection) -> Result<MutexGuard<'_, Connection>> {
    conn.lock().map_err(|_| SchedulerError::LockPoisoned)
}

/// Initialise the scheduler schema in `conn`. Safe to call on every startup.
pub fn init_db(conn: &Connection) -> Result<()> {
    create_jobs_table(conn)?;
    create_executions_table(conn)?;
    create_leases_table(conn)?;
    create_queue_table(conn)?;
    Ok(())
}

fn create_jobs_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
            id                  TEXT    NOT NULL PRIMARY KEY,
            name                TEXT    NOT NULL,
            description         TEXT    NOT NULL DEFAULT '',
            schedule            TEXT    NOT NULL,   -- JSON-encoded Schedule enum
            job_type            TEXT    NOT NULL,
            job_data            TEXT    NOT NULL DEFAULT 'null',
            state               TEXT    NOT NULL DEFAULT 'active',
            next_fire_time      TEXT,               -- NULL when paused/deleted/exhausted
            version             INTEGER NOT NULL DEFAULT 1,
            max_retries         INTEGER NOT NULL,
            retry_backoff_base  INTEGER NOT NULL,   -- seconds
            timeout_secs        INTEGER NOT NULL,
            priority            INTEGER NOT NULL DEFAULT 5,
            retry_attempt       INTEGER,            -- pending retry, if any
            retry_at            TEXT,
            last_fired_at       TEXT,
            created_by          TEXT    NOT NULL DEFAULT 'system',
            total_runs          INTEGER NOT NULL DEFAULT 0,
            successful_runs     INTEGER NOT NULL DEFAULT 0,
            failed_runs         INTEGER NOT NULL DEFAULT 0,
            average_runtime_ms  INTEGER NOT NULL DEFAULT 0,
            created_at          TEXT    NOT NULL,
            updated_at          TEXT    NOT NULL
        ) STRICT;

        -- Due-job scans: WHERE state = 'active' AND next_fire_time <= ?
        CREATE INDEX IF NOT EXISTS idx_jobs_state_next_fire ON jobs (state, next_fire_time);
        CREATE INDEX IF NOT EXISTS idx_jobs_state_retry_at ON jobs (state, retry_at);
        CREATE INDEX IF NOT EXISTS idx_jobs_created_by_state ON jobs (created_by, state);
        ",
    )?;
    Ok(())
}

/// Executions are append-mostly and never deleted.
///
/// The partial unique index is the single-flight guarantee: a second
/// `queued`/`running` row for the same job fails the insert.
fn create_executions_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS executions (
            id           TEXT    NOT NULL PRIMARY KEY,
            job_id       TEXT    NOT NULL REFERENCES jobs(id),
            attempt      INTEGER NOT NULL,
            status       TEXT    NOT NULL,
            created_at   TEXT    NOT NULL,
            started_at   TEXT,
            finished_at  TEXT,
            duration_ms  INTEGER,
            worker_id    TEXT,
            output       TEXT,
            error        TEXT
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_executions_job_attempt ON executions (job_id, attempt);
        CREATE INDEX IF NOT EXISTS idx_executions_status ON executions (status, created_at);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_executions_single_flight
            ON executions (job_id) WHERE status IN ('queued', 'running');
        ",
    )?;
    Ok(())
}

/// Singleton lease records keyed by coordinator name.
fn create_leases_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS leases (
            name           TEXT    NOT NULL PRIMARY KEY,
            holder         TEXT    NOT NULL,
            expires_at     TEXT    NOT NULL,
            fencing_token  INTEGER NOT NULL
        ) STRICT;
        ",
    )?;
    Ok(())
}

fn create_queue_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS queue_messages (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            execution_id     TEXT    NOT NULL,
            payload          TEXT    NOT NULL,   -- JSON DispatchMessage
            enqueued_at      TEXT    NOT NULL,
            available_at     TEXT    NOT NULL,
            invisible_until  TEXT,               -- set while a worker holds it
            delivery_count   INTEGER NOT NULL DEFAULT 0
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_queue_available ON queue_messages (available_at, id);
        ",
    )?;
    Ok(())
}

/// Fixed-width UTC timestamp: lexical order equals chronological order,
/// which the `<=` comparisons in the due-job queries depend on.
pub(crate) fn fmt_ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn fmt_opt_ts(t: Option<DateTime<Utc>>) -> Option<String> {
    t.map(fmt_ts)
}

fn conversion_error(idx: usize, e: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into())
}

pub(crate) fn ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

pub(crate) fn opt_ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        None => Ok(None),
        Some(raw) => DateTime::parse_from_rfc3339(&raw)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| conversion_error(idx, e)),
    }
}

pub(crate) fn json_col<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

/// Parse a column through the type's `FromStr` (status/state enums).
pub(crate) fn parsed_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = String>,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>().map_err(|e| conversion_error(idx, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_db_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        init_db(&conn).unwrap();
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'
                 AND name IN ('jobs', 'executions', 'leases', 'queue_messages')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 4);
    }

    #[test]
    fn timestamps_sort_lexically() {
        let a = DateTime::parse_from_rfc3339("2024-01-01T00:00:05Z")
            .unwrap()
            .with_timezone(&Utc);
        let b = a + chrono::Duration::milliseconds(500);
        let c = a + chrono::Duration::seconds(10);
        assert!(fmt_ts(a) < fmt_ts(b));
        assert!(fmt_ts(b) < fmt_ts(c));
        assert_eq!(fmt_ts(a), "2024-01-01T00:00:05.000Z");
    }
}
