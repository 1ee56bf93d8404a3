use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tickwork_core::config::DispatchConfig;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    error::{Result, SchedulerError},
    execution_store::ExecutionStore,
    job_store::JobStore,
    leader::LeaderState,
    metrics::SchedulerMetrics,
    queue::{DispatchMessage, WorkQueue},
    retry::RetryPolicy,
};

/// What one dispatch pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub claimed: usize,
    pub enqueued: usize,
    pub enqueue_failures: usize,
    /// Claims whose failure could not be recorded; the orphan sweep picks
    /// them up later.
    pub unrecorded_failures: usize,
    pub stalled_expired: usize,
    pub orphans_requeued: usize,
}

/// Leader-only loop that turns due jobs into queued work.
///
/// Runs while the coordinator reports `Leader`; every store write carries
/// that term's fencing token. A `StaleLeader` rejection means another node
/// has taken over: dispatch stops and the coordinator is told to step down.
pub struct DispatchLoop {
    jobs: JobStore,
    executions: ExecutionStore,
    queue: Arc<dyn WorkQueue>,
    retry: RetryPolicy,
    metrics: Arc<SchedulerMetrics>,
    poll_interval: Duration,
    batch_limit: u32,
    stall_grace: chrono::Duration,
    orphan_after: chrono::Duration,
    leader: watch::Receiver<LeaderState>,
    step_down: mpsc::Sender<i64>,
}

impl DispatchLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &DispatchConfig,
        jobs: JobStore,
        executions: ExecutionStore,
        queue: Arc<dyn WorkQueue>,
        retry: RetryPolicy,
        leader: watch::Receiver<LeaderState>,
        step_down: mpsc::Sender<i64>,
    ) -> Self {
        Self {
            jobs,
            executions,
            queue,
            retry,
            metrics: Arc::new(SchedulerMetrics::default()),
            poll_interval: Duration::from_secs(config.poll_interval_secs.max(1)),
            batch_limit: config.batch_limit.max(1),
            stall_grace: chrono::Duration::seconds(config.stall_grace_secs.min(86_400) as i64),
            orphan_after: chrono::Duration::seconds(config.orphan_after_secs.min(86_400) as i64),
            leader,
            step_down,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<SchedulerMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Poll until `shutdown` flips to `true`. Idle while not leader.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(poll_secs = self.poll_interval.as_secs(), "dispatch loop started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            let token = self.leader.borrow().fencing_token();
            let Some(token) = token else {
                tokio::select! {
                    res = self.leader.changed() => if res.is_err() { break; },
                    res = shutdown.changed() => if res.is_err() { break; },
                }
                continue;
            };

            match self.tick(Utc::now(), token).await {
                Ok(report) if report != TickReport::default() => debug!(?report, "dispatch pass"),
                Ok(_) => {}
                Err(SchedulerError::StaleLeader { presented, current }) => {
                    warn!(presented, current, "dispatch rejected as stale, stopping");
                    if self.step_down.send(token).await.is_err() {
                        break;
                    }
                }
                Err(e) => error!(error = %e, "dispatch pass failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                res = self.leader.changed() => if res.is_err() { break; },
                res = shutdown.changed() => if res.is_err() { break; },
            }
        }
        info!("dispatch loop stopped");
    }

    /// One dispatch pass at `now` under `fencing_token`.
    ///
    /// Claims due jobs, enqueues a message per claim, then runs the recovery
    /// sweep. A message the queue refuses fails its execution with
    /// `EnqueueFailure`; the next natural firing is not affected. Only a
    /// fencing rejection stops the pass early.
    #[instrument(skip(self, now))]
    pub async fn tick(&self, now: DateTime<Utc>, fencing_token: i64) -> Result<TickReport> {
        let mut report = TickReport::default();

        let claimed = self.jobs.claim_due(now, self.batch_limit, fencing_token)?;
        report.claimed = claimed.len();

        for claim in &claimed {
            let msg = DispatchMessage::from_claim(claim);
            match self.queue.enqueue(&msg, now).await {
                Ok(()) => {
                    self.metrics.record_dispatched();
                    report.enqueued += 1;
                    debug!(job_id = %msg.job_id, execution_id = %msg.execution_id, attempt = msg.attempt, "dispatched");
                }
                Err(e) => {
                    warn!(job_id = %msg.job_id, error = %e, "enqueue failed");
                    self.metrics.record_enqueue_failure();
                    report.enqueue_failures += 1;
                    match self.executions.mark_enqueue_failed(&claim.execution_id, fencing_token, now) {
                        Ok(_) => {}
                        Err(e @ SchedulerError::StaleLeader { .. }) => return Err(e),
                        Err(e) => {
                            error!(execution_id = %claim.execution_id, error = %e, "could not record enqueue failure");
                            report.unrecorded_failures += 1;
                        }
                    }
                }
            }
        }

        self.recover(now, fencing_token, &mut report).await?;
        Ok(report)
    }

    /// Expire executions whose worker vanished and re-enqueue executions
    /// whose message never reached the queue.
    async fn recover(&self, now: DateTime<Utc>, fencing_token: i64, report: &mut TickReport) -> Result<()> {
        for stalled in self.executions.stalled_running(now, self.stall_grace)? {
            let e = &stalled.execution;
            let outcome = self.executions.expire_stalled(&e.id, fencing_token, &self.retry, now)?;
            if !outcome.is_closed() {
                continue;
            }
            self.metrics.record_stalled_recovered();
            self.metrics.record_timed_out();
            if outcome.retry_at().is_some() {
                self.metrics.record_retry_scheduled();
            }
            report.stalled_expired += 1;
        }

        for orphan in self.executions.orphaned_queued(now - self.orphan_after, self.batch_limit)? {
            if self.queue.contains(&orphan.id).await? {
                continue;
            }
            if !self.executions.confirm_orphan(&orphan.id, fencing_token)? {
                continue;
            }
            let job = match self.jobs.get(&orphan.job_id) {
                Ok(job) => job,
                Err(SchedulerError::JobNotFound { .. }) => continue,
                Err(e) => return Err(e),
            };
            let msg = DispatchMessage {
                execution_id: orphan.id.clone(),
                job_id: job.id,
                job_type: job.job_type,
                job_data: job.job_data,
                timeout_secs: job.timeout_secs,
                attempt: orphan.attempt,
            };
            match self.queue.enqueue(&msg, now).await {
                Ok(()) => {
                    info!(execution_id = %orphan.id, "re-enqueued orphaned execution");
                    report.orphans_requeued += 1;
                }
                Err(e) => warn!(execution_id = %orphan.id, error = %e, "orphan re-enqueue failed"),
            }
        }
        Ok(())
    }
}
