use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tickwork_core::{ExecutionId, JobId};
use tracing::{debug, warn};

use crate::{
    db::{self, fmt_ts, SharedConnection},
    error::{Result, SchedulerError},
    types::{ClaimedJob, JobType},
};

/// What the leader hands to workers for one claimed execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchMessage {
    pub execution_id: ExecutionId,
    pub job_id: JobId,
    pub job_type: JobType,
    pub job_data: serde_json::Value,
    pub timeout_secs: u64,
    pub attempt: u32,
}

impl DispatchMessage {
    pub fn from_claim(claim: &ClaimedJob) -> Self {
        Self {
            execution_id: claim.execution_id.clone(),
            job_id: claim.job.id.clone(),
            job_type: claim.job.job_type,
            job_data: claim.job.job_data.clone(),
            timeout_secs: claim.job.timeout_secs,
            attempt: claim.attempt,
        }
    }
}

/// A message handed to one consumer. Must be acked, or it becomes visible
/// again once its visibility timeout passes.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub receipt: i64,
    pub message: DispatchMessage,
    /// 1 on first delivery.
    pub delivery_count: u32,
}

/// At-least-once queue between the dispatch loop and the worker pool.
///
/// Consumers must tolerate duplicates; the execution store's
/// `queued → running` compare-and-set is what makes a repeat harmless.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn enqueue(&self, message: &DispatchMessage, now: DateTime<Utc>) -> Result<()>;

    async fn dequeue(&self, now: DateTime<Utc>) -> Result<Option<Delivery>>;

    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Whether a message for `execution_id` is still pending or in flight.
    async fn contains(&self, execution_id: &ExecutionId) -> Result<bool>;

    async fn depth(&self) -> Result<u64>;
}

/// Durable queue in the shared SQLite file.
pub struct SqliteWorkQueue {
    conn: SharedConnection,
    visibility_timeout: Duration,
}

impl SqliteWorkQueue {
    pub fn new(conn: SharedConnection, visibility_timeout: Duration) -> Self {
        Self {
            conn,
            visibility_timeout,
        }
    }
}

#[async_trait]
impl WorkQueue for SqliteWorkQueue {
    async fn enqueue(&self, message: &DispatchMessage, now: DateTime<Utc>) -> Result<()> {
        let payload = serde_json::to_string(message)?;
        let conn = db::lock(&self.conn)?;
        conn.execute(
            "INSERT INTO queue_messages (execution_id, payload, enqueued_at, available_at)
             VALUES (?1, ?2, ?3, ?3)",
            rusqlite::params![message.execution_id.as_str(), payload, fmt_ts(now)],
        )
        .map_err(|e| SchedulerError::EnqueueFailure(e.to_string()))?;
        debug!(execution_id = %message.execution_id, "message enqueued");
        Ok(())
    }

    async fn dequeue(&self, now: DateTime<Utc>) -> Result<Option<Delivery>> {
        let mut conn = db::lock(&self.conn)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now_str = fmt_ts(now);

        loop {
            let next: Option<(i64, String, u32)> = tx
                .query_row(
                    "SELECT id, payload, delivery_count FROM queue_messages
                     WHERE available_at <= ?1
                       AND (invisible_until IS NULL OR invisible_until <= ?1)
                     ORDER BY id ASC LIMIT 1",
                    [&now_str],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;

            let Some((id, payload, count)) = next else {
                tx.commit()?;
                return Ok(None);
            };

            let message: DispatchMessage = match serde_json::from_str(&payload) {
                Ok(m) => m,
                Err(e) => {
                    warn!(receipt = id, error = %e, "dropping undecodable queue message");
                    tx.execute("DELETE FROM queue_messages WHERE id = ?1", [id])?;
                    continue;
                }
            };

            tx.execute(
                "UPDATE queue_messages SET invisible_until = ?1, delivery_count = delivery_count + 1
                 WHERE id = ?2",
                rusqlite::params![fmt_ts(now + self.visibility_timeout), id],
            )?;
            tx.commit()?;

            if count > 0 {
                debug!(receipt = id, execution_id = %message.execution_id, "message redelivered");
            }
            return Ok(Some(Delivery {
                receipt: id,
                message,
                delivery_count: count + 1,
            }));
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let conn = db::lock(&self.conn)?;
        conn.execute("DELETE FROM queue_messages WHERE id = ?1", [delivery.receipt])?;
        Ok(())
    }

    async fn contains(&self, execution_id: &ExecutionId) -> Result<bool> {
        let conn = db::lock(&self.conn)?;
        let found = conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM queue_messages WHERE execution_id = ?1)",
            [execution_id.as_str()],
            |row| row.get::<_, bool>(0),
        )?;
        Ok(found)
    }

    async fn depth(&self) -> Result<u64> {
        let conn = db::lock(&self.conn)?;
        let n = conn.query_row("SELECT COUNT(*) FROM queue_messages", [], |row| row.get::<_, u64>(0))?;
        Ok(n)
    }
}
