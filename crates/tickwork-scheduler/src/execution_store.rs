use chrono::{DateTime, Duration, Utc};
use rusqlite::{OptionalExtension, Row, Transaction, TransactionBehavior};
use serde::Serialize;
use tickwork_core::{config::DEFAULT_LEASE_NAME, ExecutionId, JobId};
use tracing::{debug, instrument, warn};

use crate::{
    db::{self, fmt_ts, SharedConnection},
    error::{Result, SchedulerError},
    job_store,
    lease::check_fence,
    retry::RetryPolicy,
    types::{Completion, Execution, ExecutionStatus, Page},
};

const EXECUTION_COLUMNS: &str = "id, job_id, attempt, status, created_at, started_at,
    finished_at, duration_ms, worker_id, output, error";

/// Error text recorded when the work queue refused a dispatch message.
pub const ENQUEUE_FAILURE: &str = "EnqueueFailure";

/// Execution history. Rows are created by [`crate::job_store::JobStore::claim_due`]
/// and only ever move forward through `queued → running → terminal` via
/// compare-and-set updates.
#[derive(Clone)]
pub struct ExecutionStore {
    conn: SharedConnection,
    lease_name: String,
}

/// Per-status execution totals for monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionCounts {
    pub queued: u64,
    pub running: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
}

/// What closing a `running` execution did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishOutcome {
    /// The terminal status was written. `retry_at` is set when the next
    /// attempt was scheduled in the same transaction.
    Closed { retry_at: Option<DateTime<Utc>> },
    /// The execution was no longer running; nothing changed.
    NotRunning,
}

impl FinishOutcome {
    pub fn is_closed(&self) -> bool {
        matches!(self, FinishOutcome::Closed { .. })
    }

    pub fn retry_at(&self) -> Option<DateTime<Utc>> {
        match self {
            FinishOutcome::Closed { retry_at } => *retry_at,
            FinishOutcome::NotRunning => None,
        }
    }
}

/// A `running` execution whose worker has not reported back in time.
#[derive(Debug, Clone)]
pub struct StalledExecution {
    pub execution: Execution,
    pub timeout_secs: u64,
}

impl ExecutionStore {
    pub fn new(conn: SharedConnection) -> Self {
        Self {
            conn,
            lease_name: DEFAULT_LEASE_NAME.to_string(),
        }
    }

    pub fn with_lease_name(mut self, name: impl Into<String>) -> Self {
        self.lease_name = name.into();
        self
    }

    pub fn get(&self, id: &ExecutionId) -> Result<Execution> {
        let conn = db::lock(&self.conn)?;
        load(&conn, id)?.ok_or_else(|| SchedulerError::ExecutionNotFound {
            id: id.to_string(),
        })
    }

    /// Executions of one job, newest first.
    pub fn list_for_job(&self, job_id: &JobId, page: Page) -> Result<Vec<Execution>> {
        let conn = db::lock(&self.conn)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions WHERE job_id = ?1
             ORDER BY created_at DESC, attempt DESC LIMIT ?2 OFFSET ?3"
        ))?;
        let rows = stmt
            .query_map(
                rusqlite::params![job_id.as_str(), page.limit(), page.offset()],
                row_to_execution,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Compare-and-set `queued → running`.
    ///
    /// Returns `false` when the execution is past `queued`, which means the
    /// message is a duplicate delivery and must not run the handler again.
    #[instrument(skip(self, now), fields(id = %id))]
    pub fn mark_running(&self, id: &ExecutionId, worker_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let conn = db::lock(&self.conn)?;
        let n = conn.execute(
            "UPDATE executions SET status = 'running', started_at = ?1, worker_id = ?2
             WHERE id = ?3 AND status = 'queued'",
            rusqlite::params![fmt_ts(now), worker_id, id.as_str()],
        )?;
        if n == 0 {
            ensure_exists(&conn, id)?;
            debug!("execution already past queued");
            return Ok(false);
        }
        Ok(true)
    }

    /// Compare-and-set `running → terminal`.
    ///
    /// The job's run counters and, for a failed or timed-out attempt, the
    /// retry chosen by `retry` are written in the same transaction, so a
    /// crash can never leave a closed attempt without its retry. Returns
    /// [`FinishOutcome::NotRunning`] if the stall reaper got there first.
    #[instrument(skip(self, completion, retry, now), fields(id = %id, status = %completion.status))]
    pub fn finish(
        &self,
        id: &ExecutionId,
        completion: &Completion,
        retry: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<FinishOutcome> {
        if !completion.status.is_terminal() {
            return Err(SchedulerError::InvalidTransition {
                id: id.to_string(),
                from: ExecutionStatus::Running.to_string(),
                action: "finish",
            });
        }

        let mut conn = db::lock(&self.conn)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let Some(closed) = close_running(
            &tx,
            id,
            completion.status,
            completion.output.as_deref(),
            completion.error.as_deref(),
            now,
        )?
        else {
            ensure_exists(&tx, id)?;
            return Ok(FinishOutcome::NotRunning);
        };
        let retry_at = settle(&tx, &closed, completion.status, retry, now)?;
        tx.commit()?;
        Ok(FinishOutcome::Closed { retry_at })
    }

    /// Fenced `queued → failed` with error `EnqueueFailure`, used when the
    /// queue refused the dispatch message.
    pub fn mark_enqueue_failed(&self, id: &ExecutionId, fencing_token: i64, now: DateTime<Utc>) -> Result<bool> {
        let mut conn = db::lock(&self.conn)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        check_fence(&tx, &self.lease_name, fencing_token)?;

        let n = tx.execute(
            "UPDATE executions SET status = 'failed', finished_at = ?1, error = ?2
             WHERE id = ?3 AND status = 'queued'",
            rusqlite::params![fmt_ts(now), ENQUEUE_FAILURE, id.as_str()],
        )?;
        tx.commit()?;

        if n > 0 {
            warn!(execution_id = %id, "execution failed: work queue rejected message");
        }
        Ok(n > 0)
    }

    /// Running executions whose start + job timeout + `grace` lies before `now`.
    ///
    /// A worker enforces the timeout itself, so a row in this state means the
    /// worker died mid-execution.
    pub fn stalled_running(&self, now: DateTime<Utc>, grace: Duration) -> Result<Vec<StalledExecution>> {
        let conn = db::lock(&self.conn)?;
        let mut stmt = conn.prepare(
            "SELECT e.id, e.job_id, e.attempt, e.status, e.created_at, e.started_at,
                    e.finished_at, e.duration_ms, e.worker_id, e.output, e.error, j.timeout_secs
             FROM executions e JOIN jobs j ON j.id = e.job_id
             WHERE e.status = 'running'",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(StalledExecution {
                    execution: row_to_execution(row)?,
                    timeout_secs: row.get(11)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(rows
            .into_iter()
            .filter(|s| {
                let started = s.execution.started_at.unwrap_or(s.execution.created_at);
                i64::try_from(s.timeout_secs)
                    .ok()
                    .and_then(Duration::try_seconds)
                    .and_then(|timeout| started.checked_add_signed(timeout))
                    .and_then(|t| t.checked_add_signed(grace))
                    .is_some_and(|deadline| deadline <= now)
            })
            .collect())
    }

    /// Fenced `running → timed_out` for an execution whose worker vanished,
    /// with counters and retry written as in [`ExecutionStore::finish`].
    pub fn expire_stalled(
        &self,
        id: &ExecutionId,
        fencing_token: i64,
        retry: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<FinishOutcome> {
        let mut conn = db::lock(&self.conn)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        check_fence(&tx, &self.lease_name, fencing_token)?;

        let Some(closed) = close_running(
            &tx,
            id,
            ExecutionStatus::TimedOut,
            None,
            Some("worker lost before reporting a result"),
            now,
        )?
        else {
            return Ok(FinishOutcome::NotRunning);
        };
        let retry_at = settle(&tx, &closed, ExecutionStatus::TimedOut, retry, now)?;
        tx.commit()?;

        warn!(execution_id = %id, "stalled execution expired");
        Ok(FinishOutcome::Closed { retry_at })
    }

    /// Fenced check that an orphan is still `queued` before it is
    /// re-enqueued. A deposed leader gets `StaleLeader`.
    pub fn confirm_orphan(&self, id: &ExecutionId, fencing_token: i64) -> Result<bool> {
        let mut conn = db::lock(&self.conn)?;
        let tx = conn.transaction()?;
        check_fence(&tx, &self.lease_name, fencing_token)?;
        let queued = tx
            .query_row(
                "SELECT 1 FROM executions WHERE id = ?1 AND status = 'queued'",
                [id.as_str()],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
            .is_some();
        tx.commit()?;
        Ok(queued)
    }

    /// Queued executions created at or before `older_than`.
    pub fn orphaned_queued(&self, older_than: DateTime<Utc>, limit: u32) -> Result<Vec<Execution>> {
        let conn = db::lock(&self.conn)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions
             WHERE status = 'queued' AND created_at <= ?1
             ORDER BY created_at ASC LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(rusqlite::params![fmt_ts(older_than), limit], row_to_execution)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn status_counts(&self) -> Result<ExecutionCounts> {
        let conn = db::lock(&self.conn)?;
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM executions GROUP BY status")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((db::parsed_col::<ExecutionStatus>(row, 0)?, row.get::<_, u64>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut counts = ExecutionCounts::default();
        for (status, n) in rows {
            match status {
                ExecutionStatus::Queued => counts.queued = n,
                ExecutionStatus::Running => counts.running = n,
                ExecutionStatus::Succeeded => counts.succeeded = n,
                ExecutionStatus::Failed => counts.failed = n,
                ExecutionStatus::TimedOut => counts.timed_out = n,
            }
        }
        Ok(counts)
    }
}

/// The row a successful `close_running` touched.
struct ClosedRun {
    job_id: JobId,
    attempt: u32,
    duration_ms: i64,
}

fn close_running(
    tx: &Transaction<'_>,
    id: &ExecutionId,
    status: ExecutionStatus,
    output: Option<&str>,
    error: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Option<ClosedRun>> {
    let running = tx
        .query_row(
            "SELECT job_id, attempt, started_at FROM executions WHERE id = ?1 AND status = 'running'",
            [id.as_str()],
            |row| {
                Ok((
                    JobId(row.get(0)?),
                    row.get::<_, u32>(1)?,
                    db::opt_ts_col(row, 2)?,
                ))
            },
        )
        .optional()?;
    let Some((job_id, attempt, started)) = running else {
        return Ok(None);
    };
    let duration_ms = started.map_or(0, |s| (now - s).num_milliseconds().max(0));

    tx.execute(
        "UPDATE executions SET status = ?1, finished_at = ?2, duration_ms = ?3,
                output = ?4, error = ?5
         WHERE id = ?6 AND status = 'running'",
        rusqlite::params![status.to_string(), fmt_ts(now), duration_ms, output, error, id.as_str()],
    )?;
    Ok(Some(ClosedRun {
        job_id,
        attempt,
        duration_ms,
    }))
}

/// Counters and retry for a run closed in `tx`.
fn settle(
    tx: &Transaction<'_>,
    closed: &ClosedRun,
    status: ExecutionStatus,
    retry: &RetryPolicy,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    job_store::record_run(tx, &closed.job_id, status == ExecutionStatus::Succeeded, closed.duration_ms)?;
    if !status.is_retryable() {
        return Ok(None);
    }
    retry.schedule_after_failure(tx, &closed.job_id, closed.attempt, now)
}

fn ensure_exists(conn: &rusqlite::Connection, id: &ExecutionId) -> Result<()> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM executions WHERE id = ?1", [id.as_str()], |row| row.get(0))
        .optional()?;
    match found {
        Some(_) => Ok(()),
        None => Err(SchedulerError::ExecutionNotFound { id: id.to_string() }),
    }
}

fn load(conn: &rusqlite::Connection, id: &ExecutionId) -> Result<Option<Execution>> {
    let execution = conn
        .query_row(
            &format!("SELECT {EXECUTION_COLUMNS} FROM executions WHERE id = ?1"),
            [id.as_str()],
            row_to_execution,
        )
        .optional()?;
    Ok(execution)
}

fn row_to_execution(row: &Row<'_>) -> rusqlite::Result<Execution> {
    Ok(Execution {
        id: ExecutionId(row.get(0)?),
        job_id: JobId(row.get(1)?),
        attempt: row.get(2)?,
        status: db::parsed_col(row, 3)?,
        created_at: db::ts_col(row, 4)?,
        started_at: db::opt_ts_col(row, 5)?,
        finished_at: db::opt_ts_col(row, 6)?,
        duration_ms: row.get(7)?,
        worker_id: row.get(8)?,
        output: row.get(9)?,
        error: row.get(10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_store::JobStore;
    use crate::lease::LeaseStore;
    use crate::types::{NewJob, Schedule};
    use rusqlite::Connection;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3_600)
    }

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    /// One job claimed at t0+60 with a 30s timeout; returns its execution id.
    fn setup() -> (ExecutionStore, SharedConnection, ExecutionId) {
        let conn = Connection::open_in_memory().unwrap();
        db::init_db(&conn).unwrap();
        let conn = db::shared(conn);
        let jobs = JobStore::new(conn.clone());
        jobs.create(
            NewJob::new("tick", Schedule::Interval { every_secs: 60 })
                .with_timeout(30)
                .with_retries(3, 5),
            t0(),
        )
        .unwrap();
        let claimed = jobs.claim_due(t0() + Duration::seconds(60), 10, 0).unwrap();
        let id = claimed[0].execution_id.clone();
        (ExecutionStore::new(conn.clone()), conn, id)
    }

    #[test]
    fn running_then_finished() {
        let (executions, _, id) = setup();
        let start = t0() + Duration::seconds(61);
        assert!(executions.mark_running(&id, "node-a", start).unwrap());

        let done = start + Duration::milliseconds(1_500);
        let outcome = executions.finish(&id, &Completion::succeeded("ok"), &policy(), done).unwrap();
        assert_eq!(outcome, FinishOutcome::Closed { retry_at: None });

        let e = executions.get(&id).unwrap();
        assert_eq!(e.status, ExecutionStatus::Succeeded);
        assert_eq!(e.worker_id.as_deref(), Some("node-a"));
        assert_eq!(e.duration_ms, Some(1_500));
        assert_eq!(e.output.as_deref(), Some("ok"));
        assert_eq!(e.finished_at, Some(done));

        let job = JobStore::new(executions.conn.clone()).get(&e.job_id).unwrap();
        assert_eq!(job.stats.total_runs, 1);
        assert_eq!(job.stats.successful_runs, 1);
        assert_eq!(job.stats.average_runtime_ms, 1_500);
    }

    #[test]
    fn failure_and_retry_commit_together() {
        let (executions, conn, id) = setup();
        let start = t0() + Duration::seconds(61);
        executions.mark_running(&id, "node-a", start).unwrap();

        let done = start + Duration::seconds(2);
        let outcome = executions.finish(&id, &Completion::failed("boom"), &policy(), done).unwrap();
        assert_eq!(outcome.retry_at(), Some(done + Duration::seconds(5)));

        let job_id = executions.get(&id).unwrap().job_id;
        let job = JobStore::new(conn).get(&job_id).unwrap();
        assert_eq!(job.retry_attempt, Some(2));
        assert_eq!(job.retry_at, Some(done + Duration::seconds(5)));
        assert_eq!(job.stats.failed_runs, 1);
    }

    #[test]
    fn failed_retry_write_rolls_back_the_terminal_status() {
        let (executions, conn, id) = setup();
        let start = t0() + Duration::seconds(61);
        executions.mark_running(&id, "node-a", start).unwrap();
        db::lock(&conn)
            .unwrap()
            .execute_batch(
                "CREATE TEMP TRIGGER reject_retry BEFORE UPDATE OF retry_attempt ON jobs
                 WHEN NEW.retry_attempt IS NOT NULL
                 BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END;",
            )
            .unwrap();

        assert!(executions
            .finish(&id, &Completion::failed("boom"), &policy(), start + Duration::seconds(1))
            .is_err());
        let e = executions.get(&id).unwrap();
        assert_eq!(e.status, ExecutionStatus::Running);
        let job = JobStore::new(conn).get(&e.job_id).unwrap();
        assert_eq!(job.stats.total_runs, 0);
        assert_eq!(job.retry_attempt, None);
    }

    #[test]
    fn second_mark_running_is_a_duplicate() {
        let (executions, _, id) = setup();
        let now = t0() + Duration::seconds(61);
        assert!(executions.mark_running(&id, "node-a", now).unwrap());
        assert!(!executions.mark_running(&id, "node-b", now).unwrap());

        executions.finish(&id, &Completion::failed("boom"), &policy(), now).unwrap();
        assert!(!executions.mark_running(&id, "node-b", now).unwrap());
        let late = executions
            .finish(&id, &Completion::succeeded("late"), &policy(), now)
            .unwrap();
        assert_eq!(late, FinishOutcome::NotRunning);
        assert_eq!(executions.get(&id).unwrap().status, ExecutionStatus::Failed);
    }

    #[test]
    fn unknown_execution_is_not_found() {
        let (executions, _, _) = setup();
        let err = executions
            .mark_running(&ExecutionId::from("missing"), "node-a", t0())
            .unwrap_err();
        assert_eq!(err.code(), "EXECUTION_NOT_FOUND");
    }

    #[test]
    fn finish_requires_terminal_status() {
        let (executions, _, id) = setup();
        let running = Completion {
            status: ExecutionStatus::Running,
            output: None,
            error: None,
        };
        assert!(executions.finish(&id, &running, &policy(), t0()).is_err());
    }

    #[test]
    fn enqueue_failure_is_fenced() {
        let (executions, conn, id) = setup();
        let leases = LeaseStore::new(conn, "dispatch");
        leases.try_acquire("a", t0(), Duration::seconds(15)).unwrap();
        leases
            .try_acquire("b", t0() + Duration::seconds(20), Duration::seconds(15))
            .unwrap();

        let err = executions.mark_enqueue_failed(&id, 1, t0()).unwrap_err();
        assert!(matches!(err, SchedulerError::StaleLeader { .. }));

        assert!(executions.mark_enqueue_failed(&id, 2, t0()).unwrap());
        let e = executions.get(&id).unwrap();
        assert_eq!(e.status, ExecutionStatus::Failed);
        assert_eq!(e.error.as_deref(), Some(ENQUEUE_FAILURE));
    }

    #[test]
    fn stalled_running_respects_timeout_and_grace() {
        let (executions, _, id) = setup();
        let start = t0() + Duration::seconds(61);
        executions.mark_running(&id, "node-a", start).unwrap();
        let grace = Duration::seconds(10);

        // timeout 30 + grace 10
        assert!(executions.stalled_running(start + Duration::seconds(39), grace).unwrap().is_empty());
        let stalled = executions.stalled_running(start + Duration::seconds(40), grace).unwrap();
        assert_eq!(stalled.len(), 1);
        assert_eq!(stalled[0].timeout_secs, 30);

        let outcome = executions
            .expire_stalled(&id, 0, &policy(), start + Duration::seconds(40))
            .unwrap();
        assert_eq!(outcome.retry_at(), Some(start + Duration::seconds(45)));
        let e = executions.get(&id).unwrap();
        assert_eq!(e.status, ExecutionStatus::TimedOut);
        assert_eq!(e.duration_ms, Some(40_000));
    }

    #[test]
    fn stale_leader_cannot_expire_or_requeue() {
        let (executions, conn, id) = setup();
        let start = t0() + Duration::seconds(61);
        let leases = LeaseStore::new(conn, "dispatch");
        leases.try_acquire("a", t0(), Duration::seconds(15)).unwrap();
        leases
            .try_acquire("b", t0() + Duration::seconds(20), Duration::seconds(15))
            .unwrap();

        assert!(matches!(
            executions.confirm_orphan(&id, 1).unwrap_err(),
            SchedulerError::StaleLeader { .. }
        ));
        assert!(executions.confirm_orphan(&id, 2).unwrap());

        executions.mark_running(&id, "node-a", start).unwrap();
        assert!(!executions.confirm_orphan(&id, 2).unwrap());
        let late = start + Duration::hours(1);
        assert!(matches!(
            executions.expire_stalled(&id, 1, &policy(), late).unwrap_err(),
            SchedulerError::StaleLeader { .. }
        ));
        assert_eq!(executions.get(&id).unwrap().status, ExecutionStatus::Running);
    }

    #[test]
    fn orphans_and_counts() {
        let (executions, _, id) = setup();
        let claimed_at = t0() + Duration::seconds(60);
        assert!(executions.orphaned_queued(claimed_at - Duration::seconds(1), 10).unwrap().is_empty());
        let orphans = executions.orphaned_queued(claimed_at, 10).unwrap();
        assert_eq!(orphans[0].id, id);

        let counts = executions.status_counts().unwrap();
        assert_eq!(counts.queued, 1);
        assert_eq!(counts.succeeded, 0);
    }

    #[test]
    fn list_for_job_newest_first() {
        let (executions, conn, id) = setup();
        let jobs = JobStore::new(conn);
        let job_id = executions.get(&id).unwrap().job_id;
        let now = t0() + Duration::seconds(61);
        executions.mark_running(&id, "node-a", now).unwrap();
        let outcome = executions.finish(&id, &Completion::failed("boom"), &policy(), now).unwrap();
        let retry = jobs.claim_due(outcome.retry_at().unwrap(), 10, 0).unwrap();

        let history = executions.list_for_job(&job_id, Page::default()).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, retry[0].execution_id);
        assert_eq!(history[0].attempt, 2);
        assert_eq!(history[1].attempt, 1);
    }
}
