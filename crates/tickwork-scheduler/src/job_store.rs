use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, Transaction, TransactionBehavior};
use tickwork_core::{config::DEFAULT_LEASE_NAME, ExecutionId, JobId};
use tracing::{debug, info, instrument};

use crate::{
    db::{self, fmt_opt_ts, fmt_ts, SharedConnection},
    error::{Result, SchedulerError},
    lease::check_fence,
    metrics::SchedulerMetrics,
    schedule,
    types::{ClaimedJob, Job, JobFilter, JobPatch, JobState, JobStats, NewJob, Page},
};

const JOB_COLUMNS: &str = "id, name, description, schedule, job_type, job_data, state,
    next_fire_time, version, max_retries, retry_backoff_base, timeout_secs, priority,
    retry_attempt, retry_at, last_fired_at, created_by, total_runs, successful_runs,
    failed_runs, average_runtime_ms, created_at, updated_at";

/// Longest allowed hard timeout for a single attempt (24 hours).
pub const MAX_TIMEOUT_SECS: u64 = 86_400;
pub const MAX_RETRIES_LIMIT: u32 = 10;

/// Persistent job definitions and their scheduling state.
///
/// Every mutation of the definition or its schedule bumps `version`; run
/// counters do not. Writes that decide what gets dispatched (`claim_due`)
/// carry the leader's fencing token and are rejected once a newer term
/// exists.
#[derive(Clone)]
pub struct JobStore {
    conn: SharedConnection,
    lease_name: String,
    metrics: Arc<SchedulerMetrics>,
}

impl JobStore {
    pub fn new(conn: SharedConnection) -> Self {
        Self {
            conn,
            lease_name: DEFAULT_LEASE_NAME.to_string(),
            metrics: Arc::new(SchedulerMetrics::default()),
        }
    }

    /// Fence claims against a lease other than the default `dispatch` one.
    pub fn with_lease_name(mut self, name: impl Into<String>) -> Self {
        self.lease_name = name.into();
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<SchedulerMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Validate and persist a new job with version 1.
    #[instrument(skip(self, new, now), fields(name = %new.name))]
    pub fn create(&self, new: NewJob, now: DateTime<Utc>) -> Result<Job> {
        schedule::validate(&new.schedule, now)?;
        validate_fields(&new.name, new.timeout_secs, new.max_retries, new.priority)?;

        let job = Job {
            id: JobId::new(),
            name: new.name.trim().to_string(),
            description: new.description,
            next_fire_time: schedule::next_fire(&new.schedule, now),
            schedule: new.schedule,
            job_type: new.job_type,
            job_data: new.job_data,
            state: JobState::Active,
            version: 1,
            max_retries: new.max_retries,
            retry_backoff_base_secs: new.retry_backoff_base_secs,
            timeout_secs: new.timeout_secs,
            priority: new.priority,
            retry_attempt: None,
            retry_at: None,
            last_fired_at: None,
            created_by: new.created_by.trim().to_string(),
            stats: JobStats::default(),
            created_at: now,
            updated_at: now,
        };

        let conn = db::lock(&self.conn)?;
        conn.execute(
            "INSERT INTO jobs
             (id, name, description, schedule, job_type, job_data, state, next_fire_time,
              version, max_retries, retry_backoff_base, timeout_secs, priority,
              created_by, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?15)",
            rusqlite::params![
                job.id.as_str(),
                job.name,
                job.description,
                serde_json::to_string(&job.schedule)?,
                job.job_type.to_string(),
                serde_json::to_string(&job.job_data)?,
                job.state.to_string(),
                fmt_opt_ts(job.next_fire_time),
                job.version,
                job.max_retries,
                job.retry_backoff_base_secs,
                job.timeout_secs,
                job.priority,
                job.created_by,
                fmt_ts(now),
            ],
        )?;

        info!(id = %job.id, next_fire_time = ?job.next_fire_time, "job created");
        Ok(job)
    }

    pub fn get(&self, id: &JobId) -> Result<Job> {
        let conn = db::lock(&self.conn)?;
        load(&conn, id)?.ok_or_else(|| SchedulerError::JobNotFound {
            id: id.to_string(),
        })
    }

    /// List jobs, highest priority first, then newest first.
    pub fn list(&self, filter: &JobFilter, page: Page) -> Result<Vec<Job>> {
        let mut sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE 1 = 1");
        let mut params: Vec<String> = Vec::new();

        match filter.state {
            Some(state) => {
                params.push(state.to_string());
                sql.push_str(&format!(" AND state = ?{}", params.len()));
            }
            None => sql.push_str(" AND state != 'deleted'"),
        }
        if let Some(job_type) = filter.job_type {
            params.push(job_type.to_string());
            sql.push_str(&format!(" AND job_type = ?{}", params.len()));
        }
        if let Some(created_by) = &filter.created_by {
            params.push(created_by.clone());
            sql.push_str(&format!(" AND created_by = ?{}", params.len()));
        }
        sql.push_str(&format!(
            " ORDER BY priority DESC, created_at DESC, id DESC LIMIT {} OFFSET {}",
            page.limit(),
            page.offset()
        ));

        let conn = db::lock(&self.conn)?;
        let mut stmt = conn.prepare(&sql)?;
        let jobs = stmt
            .query_map(rusqlite::params_from_iter(params.iter()), row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    /// Apply `patch` if the job is still at `expected_version`.
    ///
    /// A schedule change on an active job recomputes `next_fire_time` from
    /// `now`. Returns the new version.
    #[instrument(skip(self, patch, now), fields(id = %id))]
    pub fn update(&self, id: &JobId, patch: JobPatch, expected_version: i64, now: DateTime<Utc>) -> Result<i64> {
        let mut conn = db::lock(&self.conn)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut job = load_versioned(&tx, id, expected_version)?;
        if job.state == JobState::Deleted {
            return Err(invalid_transition(&job, "update"));
        }

        if let Some(schedule) = patch.schedule {
            schedule::validate(&schedule, now)?;
            if job.state == JobState::Active {
                job.next_fire_time = schedule::next_fire(&schedule, now);
            }
            job.schedule = schedule;
        }
        if let Some(name) = patch.name {
            job.name = name.trim().to_string();
        }
        if let Some(description) = patch.description {
            job.description = description;
        }
        if let Some(job_type) = patch.job_type {
            job.job_type = job_type;
        }
        if let Some(job_data) = patch.job_data {
            job.job_data = job_data;
        }
        if let Some(max_retries) = patch.max_retries {
            job.max_retries = max_retries;
        }
        if let Some(base) = patch.retry_backoff_base_secs {
            job.retry_backoff_base_secs = base;
        }
        if let Some(timeout) = patch.timeout_secs {
            job.timeout_secs = timeout;
        }
        if let Some(priority) = patch.priority {
            job.priority = priority;
        }
        validate_fields(&job.name, job.timeout_secs, job.max_retries, job.priority)?;

        let n = tx.execute(
            "UPDATE jobs SET name = ?1, description = ?2, schedule = ?3, job_type = ?4,
                    job_data = ?5, next_fire_time = ?6, max_retries = ?7,
                    retry_backoff_base = ?8, timeout_secs = ?9, priority = ?10,
                    version = version + 1, updated_at = ?11
             WHERE id = ?12 AND version = ?13",
            rusqlite::params![
                job.name,
                job.description,
                serde_json::to_string(&job.schedule)?,
                job.job_type.to_string(),
                serde_json::to_string(&job.job_data)?,
                fmt_opt_ts(job.next_fire_time),
                job.max_retries,
                job.retry_backoff_base_secs,
                job.timeout_secs,
                job.priority,
                fmt_ts(now),
                id.as_str(),
                expected_version,
            ],
        )?;
        if n == 0 {
            return Err(conflict_or_missing(&tx, id, expected_version));
        }
        tx.commit()?;

        debug!(version = expected_version + 1, "job updated");
        Ok(expected_version + 1)
    }

    /// Atomically select due jobs, advance their schedule and create a
    /// `queued` execution for each.
    ///
    /// The whole batch is one `BEGIN IMMEDIATE` transaction, so two leaders
    /// (or a leader and a stale one) can never claim the same firing, and a
    /// crash can never leave a job advanced without its execution row.
    /// A natural firing is skipped (its schedule advances, nothing is queued)
    /// while the job still has an in-flight execution or a pending retry
    /// that is not yet due. The retry keeps its attempt number and runs at
    /// `retry_at`.
    #[instrument(skip(self, now))]
    pub fn claim_due(&self, now: DateTime<Utc>, limit: u32, fencing_token: i64) -> Result<Vec<ClaimedJob>> {
        let mut conn = db::lock(&self.conn)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if let Err(e) = check_fence(&tx, &self.lease_name, fencing_token) {
            self.metrics.record_stale_leader();
            return Err(e);
        }

        let now_str = fmt_ts(now);
        let due: Vec<Job> = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {JOB_COLUMNS},
                        CASE WHEN retry_at IS NOT NULL
                                  AND (next_fire_time IS NULL OR retry_at < next_fire_time)
                             THEN retry_at ELSE next_fire_time END AS due_at
                 FROM jobs
                 WHERE state = 'active' AND (next_fire_time <= ?1 OR retry_at <= ?1)
                 ORDER BY due_at ASC, priority DESC, id ASC
                 LIMIT ?2"
            ))?;
            let rows = stmt.query_map(rusqlite::params![now_str, limit], row_to_job)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        let mut claimed = Vec::with_capacity(due.len());
        for mut job in due {
            let natural_due = job.next_fire_time.is_some_and(|t| t <= now);
            let pending_retry = job.retry_attempt.filter(|_| job.retry_at.is_some());
            let retry_due = pending_retry.is_some() && job.retry_at.is_some_and(|t| t <= now);
            if natural_due {
                job.next_fire_time = schedule::next_fire(&job.schedule, now);
            }

            let in_flight = has_in_flight(&tx, &job.id)?;
            if in_flight || (pending_retry.is_some() && !retry_due) {
                // Retry fields are left alone: they run after the in-flight attempt.
                tx.execute(
                    "UPDATE jobs SET next_fire_time = ?1, version = version + 1, updated_at = ?2
                     WHERE id = ?3",
                    rusqlite::params![fmt_opt_ts(job.next_fire_time), now_str, job.id.as_str()],
                )?;
                if in_flight {
                    self.metrics.record_overlap_skipped();
                    debug!(job_id = %job.id, "firing skipped: previous execution still in flight");
                } else {
                    debug!(job_id = %job.id, retry_at = ?job.retry_at, "firing folded into pending retry");
                }
                continue;
            }

            // A due retry absorbs a coincident natural firing.
            let (attempt, is_retry) = match pending_retry {
                Some(a) => (a, true),
                None => (1, false),
            };
            job.retry_attempt = None;
            job.retry_at = None;
            job.last_fired_at = Some(now);
            job.version += 1;
            job.updated_at = now;

            tx.execute(
                "UPDATE jobs SET next_fire_time = ?1, retry_attempt = NULL, retry_at = NULL,
                        last_fired_at = ?2, version = version + 1, updated_at = ?2
                 WHERE id = ?3",
                rusqlite::params![fmt_opt_ts(job.next_fire_time), now_str, job.id.as_str()],
            )?;

            let execution_id = ExecutionId::new();
            tx.execute(
                "INSERT INTO executions (id, job_id, attempt, status, created_at)
                 VALUES (?1, ?2, ?3, 'queued', ?4)",
                rusqlite::params![execution_id.as_str(), job.id.as_str(), attempt, now_str],
            )?;

            claimed.push(ClaimedJob {
                job,
                execution_id,
                attempt,
                is_retry,
            });
        }
        tx.commit()?;

        if !claimed.is_empty() {
            debug!(count = claimed.len(), "claimed due jobs");
        }
        Ok(claimed)
    }

    /// `active → paused`. Clears the next firing and any pending retry.
    pub fn pause(&self, id: &JobId, expected_version: i64, now: DateTime<Utc>) -> Result<i64> {
        self.transition(id, expected_version, now, "pause", |job, _| match job.state {
            JobState::Active => Some((JobState::Paused, None)),
            _ => None,
        })
    }

    /// `paused → active`. The next firing is computed from `now`, so missed
    /// firings while paused are not replayed.
    pub fn resume(&self, id: &JobId, expected_version: i64, now: DateTime<Utc>) -> Result<i64> {
        self.transition(id, expected_version, now, "resume", |job, now| match job.state {
            JobState::Paused => Some((JobState::Active, schedule::next_fire(&job.schedule, now))),
            _ => None,
        })
    }

    /// Soft delete. Executions are kept for history.
    pub fn delete(&self, id: &JobId, expected_version: i64, now: DateTime<Utc>) -> Result<i64> {
        self.transition(id, expected_version, now, "delete", |job, _| match job.state {
            JobState::Active | JobState::Paused => Some((JobState::Deleted, None)),
            JobState::Deleted => None,
        })
    }

    fn transition<F>(
        &self,
        id: &JobId,
        expected_version: i64,
        now: DateTime<Utc>,
        action: &'static str,
        next: F,
    ) -> Result<i64>
    where
        F: FnOnce(&Job, DateTime<Utc>) -> Option<(JobState, Option<DateTime<Utc>>)>,
    {
        let mut conn = db::lock(&self.conn)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let job = load_versioned(&tx, id, expected_version)?;
        let (state, next_fire_time) = next(&job, now).ok_or_else(|| invalid_transition(&job, action))?;

        let n = tx.execute(
            "UPDATE jobs SET state = ?1, next_fire_time = ?2, retry_attempt = NULL, retry_at = NULL,
                    version = version + 1, updated_at = ?3
             WHERE id = ?4 AND version = ?5",
            rusqlite::params![
                state.to_string(),
                fmt_opt_ts(next_fire_time),
                fmt_ts(now),
                id.as_str(),
                expected_version,
            ],
        )?;
        if n == 0 {
            return Err(conflict_or_missing(&tx, id, expected_version));
        }
        tx.commit()?;

        info!(%id, from = %job.state, to = %state, "job {action}d");
        Ok(expected_version + 1)
    }

}

/// Record a pending retry inside the caller's transaction. Only active jobs
/// accept one; returns false if the job was paused or deleted.
pub(crate) fn set_retry(
    conn: &rusqlite::Connection,
    id: &JobId,
    attempt: u32,
    at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<bool> {
    let n = conn.execute(
        "UPDATE jobs SET retry_attempt = ?1, retry_at = ?2, version = version + 1, updated_at = ?3
         WHERE id = ?4 AND state = 'active'",
        rusqlite::params![attempt, fmt_ts(at), fmt_ts(now), id.as_str()],
    )?;
    Ok(n > 0)
}

/// Fold one closed run into the job's counters.
pub(crate) fn record_run(conn: &rusqlite::Connection, id: &JobId, succeeded: bool, duration_ms: i64) -> Result<()> {
    conn.execute(
        "UPDATE jobs SET total_runs = total_runs + 1,
                successful_runs = successful_runs + ?1,
                failed_runs = failed_runs + ?2,
                average_runtime_ms = (average_runtime_ms * total_runs + ?3) / (total_runs + 1)
         WHERE id = ?4",
        rusqlite::params![i64::from(succeeded), i64::from(!succeeded), duration_ms, id.as_str()],
    )?;
    Ok(())
}

fn validate_fields(name: &str, timeout_secs: u64, max_retries: u32, priority: i32) -> Result<()> {
    if name.trim().is_empty() {
        return Err(SchedulerError::InvalidJob("name cannot be empty".into()));
    }
    if name.len() > 255 {
        return Err(SchedulerError::InvalidJob("name is longer than 255 bytes".into()));
    }
    if timeout_secs == 0 || timeout_secs > MAX_TIMEOUT_SECS {
        return Err(SchedulerError::InvalidJob(format!(
            "timeout must be between 1 and {MAX_TIMEOUT_SECS} seconds"
        )));
    }
    if max_retries > MAX_RETRIES_LIMIT {
        return Err(SchedulerError::InvalidJob(format!(
            "max_retries cannot exceed {MAX_RETRIES_LIMIT}"
        )));
    }
    if !(1..=10).contains(&priority) {
        return Err(SchedulerError::InvalidJob("priority must be between 1 and 10".into()));
    }
    Ok(())
}

pub(crate) fn load(conn: &rusqlite::Connection, id: &JobId) -> Result<Option<Job>> {
    let job = conn
        .query_row(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
            [id.as_str()],
            row_to_job,
        )
        .optional()?;
    Ok(job)
}

fn load_versioned(tx: &Transaction<'_>, id: &JobId, expected_version: i64) -> Result<Job> {
    let job = load(tx, id)?.ok_or_else(|| SchedulerError::JobNotFound {
        id: id.to_string(),
    })?;
    if job.version != expected_version {
        return Err(SchedulerError::VersionConflict {
            id: id.to_string(),
            expected: expected_version,
            actual: job.version,
        });
    }
    Ok(job)
}

fn conflict_or_missing(tx: &Transaction<'_>, id: &JobId, expected: i64) -> SchedulerError {
    match tx.query_row("SELECT version FROM jobs WHERE id = ?1", [id.as_str()], |row| {
        row.get::<_, i64>(0)
    }) {
        Ok(actual) => SchedulerError::VersionConflict {
            id: id.to_string(),
            expected,
            actual,
        },
        Err(rusqlite::Error::QueryReturnedNoRows) => SchedulerError::JobNotFound { id: id.to_string() },
        Err(e) => SchedulerError::Database(e),
    }
}

fn invalid_transition(job: &Job, action: &'static str) -> SchedulerError {
    SchedulerError::InvalidTransition {
        id: job.id.to_string(),
        from: job.state.to_string(),
        action,
    }
}

fn has_in_flight(tx: &Transaction<'_>, id: &JobId) -> Result<bool> {
    let exists = tx.query_row(
        "SELECT EXISTS (SELECT 1 FROM executions
                        WHERE job_id = ?1 AND status IN ('queued', 'running'))",
        [id.as_str()],
        |row| row.get::<_, bool>(0),
    )?;
    Ok(exists)
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<Job> {
    Ok(Job {
        id: JobId(row.get(0)?),
        name: row.get(1)?,
        description: row.get(2)?,
        schedule: db::json_col(row, 3)?,
        job_type: db::parsed_col(row, 4)?,
        job_data: db::json_col(row, 5)?,
        state: db::parsed_col(row, 6)?,
        next_fire_time: db::opt_ts_col(row, 7)?,
        version: row.get(8)?,
        max_retries: row.get(9)?,
        retry_backoff_base_secs: row.get(10)?,
        timeout_secs: row.get(11)?,
        priority: row.get(12)?,
        retry_attempt: row.get(13)?,
        retry_at: db::opt_ts_col(row, 14)?,
        last_fired_at: db::opt_ts_col(row, 15)?,
        created_by: row.get(16)?,
        stats: JobStats {
            total_runs: row.get(17)?,
            successful_runs: row.get(18)?,
            failed_runs: row.get(19)?,
            average_runtime_ms: row.get(20)?,
        },
        created_at: db::ts_col(row, 21)?,
        updated_at: db::ts_col(row, 22)?,
    })
}
