use chrono::{DateTime, Duration, Utc};

use crate::{
    cron::CronExpr,
    error::{Result, SchedulerError},
    types::Schedule,
};

/// Compute the next UTC fire time for `schedule` strictly *after* `after`.
///
/// Pure and deterministic: no clock reads, no I/O. Returns `None` when the
/// schedule has no future time (a `Once` whose instant has passed, or a
/// cron expression that can never match). Unparsable cron expressions also
/// yield `None`; [`validate`] is what rejects them at creation time.
pub fn next_fire(schedule: &Schedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match schedule {
        Schedule::Cron { expression } => CronExpr::parse(expression).ok()?.next_after(after),

        Schedule::Interval { every_secs } => {
            let secs = i64::try_from(*every_secs).ok()?;
            after.checked_add_signed(Duration::try_seconds(secs)?)
        }

        Schedule::Once { at } => (*at > after).then_some(*at),
    }
}

/// Reject schedules that are unparsable or can never fire, as of `now`.
///
/// Called before a job is persisted so the store never holds a schedule the
/// trigger calculator cannot evaluate.
pub fn validate(schedule: &Schedule, now: DateTime<Utc>) -> Result<()> {
    match schedule {
        Schedule::Cron { expression } => {
            if expression.trim().is_empty() {
                return Err(SchedulerError::InvalidSchedule(
                    "cron expression cannot be empty".into(),
                ));
            }
            let expr = CronExpr::parse(expression)
                .map_err(|e| SchedulerError::InvalidSchedule(e.to_string()))?;
            if expr.next_after(now).is_none() {
                return Err(SchedulerError::InvalidSchedule(format!(
                    "cron expression '{expression}' never fires"
                )));
            }
        }
        Schedule::Interval { every_secs } => {
            if *every_secs == 0 {
                return Err(SchedulerError::InvalidSchedule(
                    "interval must be a positive number of seconds".into(),
                ));
            }
            if next_fire(schedule, now).is_none() {
                return Err(SchedulerError::InvalidSchedule(format!(
                    "interval of {every_secs}s is out of range"
                )));
            }
        }
        Schedule::Once { at } => {
            if *at <= now {
                return Err(SchedulerError::InvalidSchedule(format!(
                    "one-off time {at} is not in the future"
                )));
            }
        }
    }
    Ok(())
}
