use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use tickwork_core::JobId;
use tracing::info;

use crate::{
    error::Result,
    job_store,
    types::{Job, JobState},
};

/// Exponential backoff between attempts of one firing.
///
/// The delay before attempt `n + 1` is `base * 2^(n - 1)` seconds, capped at
/// `max_backoff`. A job with `max_retries = 3` runs at most attempts 1, 2
/// and 3.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_backoff: Duration,
}

/// Outcome of consulting the policy after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { attempt: u32, at: DateTime<Utc> },
    Exhausted,
}

impl RetryPolicy {
    pub fn new(max_backoff_secs: u64) -> Self {
        let secs = i64::try_from(max_backoff_secs).unwrap_or(i64::MAX);
        Self {
            max_backoff: Duration::try_seconds(secs).unwrap_or_else(|| Duration::days(365)),
        }
    }

    pub fn backoff(&self, base_secs: u64, failed_attempt: u32) -> Duration {
        let exp = failed_attempt.saturating_sub(1).min(62);
        let secs = base_secs.saturating_mul(1u64 << exp);
        i64::try_from(secs)
            .ok()
            .and_then(Duration::try_seconds)
            .map_or(self.max_backoff, |d| d.min(self.max_backoff))
    }

    /// Decide what follows a failed or timed-out `failed_attempt` that
    /// finished at `finished_at`.
    pub fn decide(&self, job: &Job, failed_attempt: u32, finished_at: DateTime<Utc>) -> RetryDecision {
        if failed_attempt >= job.max_retries {
            return RetryDecision::Exhausted;
        }
        RetryDecision::Retry {
            attempt: failed_attempt + 1,
            at: finished_at + self.backoff(job.retry_backoff_base_secs, failed_attempt),
        }
    }

    /// Apply the policy to a failed attempt of `job_id` on `conn`, which must
    /// be the transaction that wrote the terminal status. The job is read
    /// there, so a pause or delete since dispatch cancels the retry.
    ///
    /// Returns when the retry will run, or `None` if none was scheduled.
    pub(crate) fn schedule_after_failure(
        &self,
        conn: &Connection,
        job_id: &JobId,
        failed_attempt: u32,
        finished_at: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        let Some(job) = job_store::load(conn, job_id)? else {
            return Ok(None);
        };
        if job.state != JobState::Active {
            return Ok(None);
        }

        match self.decide(&job, failed_attempt, finished_at) {
            RetryDecision::Retry { attempt, at } => {
                let scheduled = job_store::set_retry(conn, job_id, attempt, at, finished_at)?;
                if scheduled {
                    info!(%job_id, attempt, retry_at = %at, "retry scheduled");
                }
                Ok(scheduled.then_some(at))
            }
            RetryDecision::Exhausted => {
                info!(%job_id, attempts = failed_attempt, "retries exhausted");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::job_store::JobStore;
    use crate::types::{JobStats, JobType, NewJob, Schedule};

    fn job(max_retries: u32, base: u64) -> Job {
        let now = Utc::now();
        Job {
            id: JobId::new(),
            name: "flaky".into(),
            description: String::new(),
            schedule: Schedule::Interval { every_secs: 60 },
            job_type: JobType::Custom,
            job_data: serde_json::Value::Null,
            state: JobState::Active,
            next_fire_time: None,
            version: 1,
            max_retries,
            retry_backoff_base_secs: base,
            timeout_secs: 60,
            priority: 5,
            retry_attempt: None,
            retry_at: None,
            last_fired_at: None,
            created_by: "system".into(),
            stats: JobStats::default(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(3_600);
        assert_eq!(policy.backoff(60, 1), Duration::seconds(60));
        assert_eq!(policy.backoff(60, 2), Duration::seconds(120));
        assert_eq!(policy.backoff(60, 3), Duration::seconds(240));
        assert_eq!(policy.backoff(60, 10), Duration::seconds(3_600));
        assert_eq!(policy.backoff(u64::MAX, 40), Duration::seconds(3_600));
    }

    #[test]
    fn retries_stop_at_max() {
        let policy = RetryPolicy::new(3_600);
        let j = job(3, 5);
        let t = Utc::now();
        assert_eq!(
            policy.decide(&j, 1, t),
            RetryDecision::Retry {
                attempt: 2,
                at: t + Duration::seconds(5)
            }
        );
        assert_eq!(
            policy.decide(&j, 2, t),
            RetryDecision::Retry {
                attempt: 3,
                at: t + Duration::seconds(10)
            }
        );
        assert_eq!(policy.decide(&j, 3, t), RetryDecision::Exhausted);
    }

    #[test]
    fn zero_retries_never_retries() {
        let policy = RetryPolicy::new(3_600);
        assert_eq!(policy.decide(&job(0, 5), 1, Utc::now()), RetryDecision::Exhausted);
    }

    #[test]
    fn paused_job_gets_no_retry() {
        let conn = db::shared(rusqlite::Connection::open_in_memory().unwrap());
        db::init_db(&db::lock(&conn).unwrap()).unwrap();
        let jobs = JobStore::new(conn.clone());
        let now = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let j = jobs
            .create(NewJob::new("flaky", Schedule::Interval { every_secs: 60 }).with_retries(3, 5), now)
            .unwrap();
        let policy = RetryPolicy::new(3_600);

        let at = policy
            .schedule_after_failure(&db::lock(&conn).unwrap(), &j.id, 1, now)
            .unwrap();
        assert_eq!(at, Some(now + Duration::seconds(5)));
        let stored = jobs.get(&j.id).unwrap();
        assert_eq!(stored.retry_attempt, Some(2));

        jobs.pause(&j.id, stored.version, now).unwrap();
        let at = policy
            .schedule_after_failure(&db::lock(&conn).unwrap(), &j.id, 2, now)
            .unwrap();
        assert_eq!(at, None);
    }
}
