use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, info, instrument};

use crate::{
    db::{self, fmt_ts, SharedConnection},
    error::{Result, SchedulerError},
    types::Lease,
};

/// Durable leadership lease with fencing tokens.
///
/// The lease row lives in the same database as the job and execution
/// tables, so the stores can compare a writer's token with the current
/// term inside the writer's own transaction.
#[derive(Clone)]
pub struct LeaseStore {
    conn: SharedConnection,
    name: String,
}

impl LeaseStore {
    pub fn new(conn: SharedConnection, name: impl Into<String>) -> Self {
        Self {
            conn,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lease record, live or expired. `None` before the first election.
    pub fn current(&self) -> Result<Option<Lease>> {
        let conn = db::lock(&self.conn)?;
        let lease = conn
            .query_row(
                "SELECT name, holder, expires_at, fencing_token FROM leases WHERE name = ?1",
                [&self.name],
                |row| {
                    Ok(Lease {
                        name: row.get(0)?,
                        holder: row.get(1)?,
                        expires_at: db::ts_col(row, 2)?,
                        fencing_token: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(lease)
    }

    /// Try to become leader. Succeeds only if the lease is absent or expired
    /// (or already ours); returns the new fencing token, one greater than the
    /// previous term's.
    #[instrument(skip(self, now, ttl), fields(lease = %self.name))]
    pub fn try_acquire(&self, holder: &str, now: DateTime<Utc>, ttl: Duration) -> Result<Option<i64>> {
        let mut conn = db::lock(&self.conn)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: Option<(String, String, i64)> = tx
            .query_row(
                "SELECT holder, expires_at, fencing_token FROM leases WHERE name = ?1",
                [&self.name],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let now_str = fmt_ts(now);
        let expires = fmt_ts(now + ttl);
        let token = match existing {
            Some((current_holder, expires_at, _)) if expires_at > now_str && current_holder != holder => {
                debug!(%current_holder, "lease held by another node");
                return Ok(None);
            }
            Some((_, _, token)) => {
                tx.execute(
                    "UPDATE leases SET holder = ?1, expires_at = ?2, fencing_token = ?3
                     WHERE name = ?4",
                    rusqlite::params![holder, expires, token + 1, self.name],
                )?;
                token + 1
            }
            None => {
                tx.execute(
                    "INSERT INTO leases (name, holder, expires_at, fencing_token)
                     VALUES (?1, ?2, ?3, 1)",
                    rusqlite::params![self.name, holder, expires],
                )?;
                1
            }
        };
        tx.commit()?;

        info!(holder, fencing_token = token, "lease acquired");
        Ok(Some(token))
    }

    /// Extend our lease. Fails with `LeaseLost` if the lease expired or
    /// another term has started since `fencing_token` was issued.
    pub fn renew(&self, holder: &str, fencing_token: i64, now: DateTime<Utc>, ttl: Duration) -> Result<()> {
        let conn = db::lock(&self.conn)?;
        let n = conn.execute(
            "UPDATE leases SET expires_at = ?1
             WHERE name = ?2 AND holder = ?3 AND fencing_token = ?4 AND expires_at > ?5",
            rusqlite::params![fmt_ts(now + ttl), self.name, holder, fencing_token, fmt_ts(now)],
        )?;
        if n == 0 {
            return Err(SchedulerError::LeaseLost {
                name: self.name.clone(),
            });
        }
        debug!(holder, fencing_token, "lease renewed");
        Ok(())
    }

    /// Give the lease up early so another node can take over without waiting
    /// for expiry. Returns false if we no longer held it.
    pub fn release(&self, holder: &str, fencing_token: i64, now: DateTime<Utc>) -> Result<bool> {
        let conn = db::lock(&self.conn)?;
        let n = conn.execute(
            "UPDATE leases SET expires_at = ?1
             WHERE name = ?2 AND holder = ?3 AND fencing_token = ?4",
            rusqlite::params![fmt_ts(now), self.name, holder, fencing_token],
        )?;
        if n > 0 {
            info!(holder, fencing_token, "lease released");
        }
        Ok(n > 0)
    }
}

/// Reject a dispatch-affecting write whose token is behind the current term.
///
/// Must run on the same connection (and inside the same transaction) as the
/// write it guards.
pub(crate) fn check_fence(conn: &Connection, lease_name: &str, presented: i64) -> Result<()> {
    let current: i64 = conn
        .query_row(
            "SELECT fencing_token FROM leases WHERE name = ?1",
            [lease_name],
            |row| row.get(0),
        )
        .optional()?
        .unwrap_or(0);
    if presented < current {
        return Err(SchedulerError::StaleLeader { presented, current });
    }
    Ok(())
}
