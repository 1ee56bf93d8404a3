use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tickwork_core::config::WorkerConfig;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    error::{Result, SchedulerError},
    execution_store::{ExecutionStore, FinishOutcome},
    handlers::{HandlerContext, HandlerSet},
    metrics::SchedulerMetrics,
    queue::{Delivery, DispatchMessage, WorkQueue},
    retry::RetryPolicy,
    types::{Completion, ExecutionStatus},
};

/// Pulls dispatch messages and runs them through the registered handlers.
///
/// Delivery is at-least-once, so every message first goes through the
/// execution store's `queued → running` compare-and-set: a message whose
/// execution is already past `queued` is acknowledged without running
/// anything.
pub struct WorkerPool {
    worker_id: String,
    concurrency: usize,
    poll_interval: Duration,
    queue: Arc<dyn WorkQueue>,
    executions: ExecutionStore,
    handlers: HandlerSet,
    retry: RetryPolicy,
    metrics: Arc<SchedulerMetrics>,
}

impl WorkerPool {
    pub fn new(
        worker_id: impl Into<String>,
        config: &WorkerConfig,
        queue: Arc<dyn WorkQueue>,
        executions: ExecutionStore,
        handlers: HandlerSet,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            concurrency: config.concurrency.max(1),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            queue,
            executions,
            handlers,
            retry,
            metrics: Arc::new(SchedulerMetrics::default()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<SchedulerMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Run `concurrency` slots until `shutdown` flips to `true`.
    ///
    /// Slots stop taking new messages on shutdown but finish the attempt
    /// they are running.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        info!(worker_id = %self.worker_id, concurrency = self.concurrency, "worker pool started");
        let pool = Arc::new(self);
        let mut slots = JoinSet::new();
        for slot in 0..pool.concurrency {
            let pool = pool.clone();
            let shutdown = shutdown.clone();
            slots.spawn(async move { pool.slot_loop(slot, shutdown).await });
        }
        while let Some(res) = slots.join_next().await {
            if let Err(e) = res {
                error!(error = %e, "worker slot ended abnormally");
            }
        }
        info!(worker_id = %pool.worker_id, "worker pool stopped");
    }

    async fn slot_loop(&self, slot: usize, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            let idle = match self.process_next().await {
                Ok(processed) => !processed,
                Err(e) => {
                    error!(slot, error = %e, "worker slot error");
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    res = shutdown.changed() => if res.is_err() { break; },
                }
            }
        }
        debug!(slot, "worker slot stopped");
    }

    /// Take one message off the queue and handle it. Returns `false` when
    /// the queue was empty.
    pub async fn process_next(&self) -> Result<bool> {
        match self.queue.dequeue(Utc::now()).await? {
            Some(delivery) => {
                self.process(delivery).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Handle one delivery end to end: claim, run, record, ack.
    ///
    /// The terminal status and any retry commit together. If that write
    /// fails the message stays unacked and the execution stays `running`
    /// until the dispatch loop's stall sweep expires it and schedules the
    /// retry.
    #[instrument(skip(self, delivery), fields(
        execution_id = %delivery.message.execution_id,
        attempt = delivery.message.attempt,
    ))]
    pub async fn process(&self, delivery: Delivery) -> Result<()> {
        let msg = &delivery.message;

        match self.executions.mark_running(&msg.execution_id, &self.worker_id, Utc::now()) {
            Ok(true) => {}
            Ok(false) | Err(SchedulerError::ExecutionNotFound { .. }) => {
                self.metrics.record_duplicate();
                info!(deliveries = delivery.delivery_count, "duplicate delivery acknowledged");
                return self.queue.ack(&delivery).await;
            }
            Err(e) => return Err(e),
        }

        let completion = self.execute(msg).await;
        let finished_at = Utc::now();

        match self
            .executions
            .finish(&msg.execution_id, &completion, &self.retry, finished_at)?
        {
            FinishOutcome::Closed { retry_at } => {
                match completion.status {
                    ExecutionStatus::Succeeded => self.metrics.record_succeeded(),
                    ExecutionStatus::TimedOut => self.metrics.record_timed_out(),
                    _ => self.metrics.record_failed(),
                }
                if retry_at.is_some() {
                    self.metrics.record_retry_scheduled();
                }
                info!(status = %completion.status, ?retry_at, "execution finished");
            }
            FinishOutcome::NotRunning => warn!("execution was closed elsewhere before the worker reported"),
        }

        self.queue.ack(&delivery).await
    }

    /// Run the handler in its own task under the job's hard timeout.
    ///
    /// On timeout the attempt's token is cancelled and the task is left to
    /// wind down on its own; its result is ignored.
    async fn execute(&self, msg: &DispatchMessage) -> Completion {
        let handler = self.handlers.get(msg.job_type);
        let cancel = CancellationToken::new();
        let ctx = HandlerContext {
            execution_id: msg.execution_id.clone(),
            job_id: msg.job_id.clone(),
            attempt: msg.attempt,
            data: msg.job_data.clone(),
            cancel: cancel.clone(),
        };
        let limit = Duration::from_secs(msg.timeout_secs);
        let task = tokio::spawn(async move { handler.run(ctx).await });

        match tokio::time::timeout(limit, task).await {
            Ok(Ok(Ok(output))) => Completion::succeeded(output),
            Ok(Ok(Err(e))) => Completion::failed(e.to_string()),
            Ok(Err(join_err)) => Completion::failed(panic_message(join_err)),
            Err(_) => {
                cancel.cancel();
                warn!(timeout_secs = msg.timeout_secs, "handler timed out");
                Completion::timed_out(format!("timed out after {}s", msg.timeout_secs))
            }
        }
    }
}

fn panic_message(err: tokio::task::JoinError) -> String {
    if !err.is_panic() {
        return format!("handler task aborted: {err}");
    }
    let payload = err.into_panic();
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("handler panicked: {detail}")
}
