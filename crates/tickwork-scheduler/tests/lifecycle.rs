//! Firing, retry and failure paths driven tick by tick.
//!
//! Dispatch passes take an explicit `now`; workers are fed deliveries
//! dequeued at that same instant so retries scheduled in the future can be
//! run without sleeping.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, SubsecRound, Utc};
use rusqlite::Connection;
use tickwork_core::config::{DispatchConfig, WorkerConfig};
use tickwork_core::{ExecutionId, JobId};
use tickwork_scheduler::{
    db, execution_store::ENQUEUE_FAILURE, types::Page, DispatchLoop, DispatchMessage, Execution, ExecutionStatus,
    ExecutionStore, HandlerContext, HandlerError, HandlerSet, JobHandler, JobStore, LeaderState, LeaseStore,
    NewJob, RetryPolicy, Schedule, SchedulerError, SchedulerMetrics, SqliteWorkQueue, WorkQueue, WorkerPool,
};
use tickwork_scheduler::queue::Delivery;
use tokio::sync::{mpsc, watch};

/// Fails until `succeed_on` is reached, then succeeds.
struct Flaky {
    calls: AtomicU32,
    succeed_on: u32,
}

impl Flaky {
    fn new(succeed_on: u32) -> Self {
        Self {
            calls: AtomicU32::new(0),
            succeed_on,
        }
    }
}

#[async_trait]
impl JobHandler for Flaky {
    async fn run(&self, ctx: HandlerContext) -> Result<String, HandlerError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n >= self.succeed_on {
            Ok(format!("ok on attempt {}", ctx.attempt))
        } else {
            Err(HandlerError::failed(format!("transient failure #{n}")))
        }
    }
}

/// A queue whose broker is permanently unreachable.
struct DownQueue;

#[async_trait]
impl WorkQueue for DownQueue {
    async fn enqueue(&self, _message: &DispatchMessage, _now: DateTime<Utc>) -> tickwork_scheduler::Result<()> {
        Err(SchedulerError::EnqueueFailure("broker unreachable".into()))
    }

    async fn dequeue(&self, _now: DateTime<Utc>) -> tickwork_scheduler::Result<Option<Delivery>> {
        Ok(None)
    }

    async fn ack(&self, _delivery: &Delivery) -> tickwork_scheduler::Result<()> {
        Ok(())
    }

    async fn contains(&self, _execution_id: &ExecutionId) -> tickwork_scheduler::Result<bool> {
        Ok(false)
    }

    async fn depth(&self) -> tickwork_scheduler::Result<u64> {
        Ok(0)
    }
}

struct Node {
    conn: db::SharedConnection,
    jobs: JobStore,
    executions: ExecutionStore,
    queue: Arc<SqliteWorkQueue>,
    dispatch: DispatchLoop,
    worker: WorkerPool,
    metrics: Arc<SchedulerMetrics>,
    // keeps the dispatch loop's channels open
    _leader: watch::Sender<LeaderState>,
    _step_down: mpsc::Receiver<i64>,
}

fn node(handler: Arc<dyn JobHandler>) -> Node {
    let conn = Connection::open_in_memory().unwrap();
    db::init_db(&conn).unwrap();
    let conn = db::shared(conn);
    let metrics = Arc::new(SchedulerMetrics::default());
    let jobs = JobStore::new(conn.clone()).with_metrics(metrics.clone());
    let executions = ExecutionStore::new(conn.clone());
    let queue = Arc::new(SqliteWorkQueue::new(conn.clone(), Duration::seconds(300)));
    let (leader_tx, leader_rx) = watch::channel(LeaderState::Leader { fencing_token: 0 });
    let (step_tx, step_rx) = mpsc::channel(1);

    let dispatch = DispatchLoop::new(
        &DispatchConfig::default(),
        jobs.clone(),
        executions.clone(),
        queue.clone(),
        RetryPolicy::new(3_600),
        leader_rx,
        step_tx,
    )
    .with_metrics(metrics.clone());
    let worker = WorkerPool::new(
        "worker-1",
        &WorkerConfig::default(),
        queue.clone(),
        executions.clone(),
        HandlerSet::uniform(handler),
        RetryPolicy::new(3_600),
    )
    .with_metrics(metrics.clone());

    Node {
        conn,
        jobs,
        executions,
        queue,
        dispatch,
        worker,
        metrics,
        _leader: leader_tx,
        _step_down: step_rx,
    }
}

impl Node {
    /// Dispatch at `now` and run whatever became visible at that instant.
    async fn tick_and_work(&self, now: DateTime<Utc>) -> usize {
        self.dispatch.tick(now, 0).await.unwrap();
        let mut ran = 0;
        while let Some(delivery) = self.queue.dequeue(now).await.unwrap() {
            self.worker.process(delivery).await.unwrap();
            ran += 1;
        }
        ran
    }

    fn history(&self, id: &JobId) -> Vec<Execution> {
        let mut all = self.executions.list_for_job(id, Page::new(1, 100)).unwrap();
        all.sort_by_key(|e| e.attempt);
        all
    }
}

/// A minute ago, at the millisecond precision timestamps are stored with.
fn start() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3) - Duration::seconds(60)
}

#[tokio::test]
async fn failed_attempt_is_retried_after_backoff() {
    let n = node(Arc::new(Flaky::new(2)));
    let t0 = start();
    let job = n
        .jobs
        .create(
            NewJob::new("sync", Schedule::Interval { every_secs: 60 }).with_retries(3, 5),
            t0,
        )
        .unwrap();

    assert_eq!(n.tick_and_work(t0 + Duration::seconds(60)).await, 1);
    let after_first = n.jobs.get(&job.id).unwrap();
    assert_eq!(after_first.retry_attempt, Some(2));
    let retry_at = after_first.retry_at.unwrap();
    let first = &n.history(&job.id)[0];
    assert_eq!(first.status, ExecutionStatus::Failed);
    assert_eq!(retry_at - first.finished_at.unwrap(), Duration::seconds(5));

    // nothing is due between the failure and the retry
    assert_eq!(n.tick_and_work(retry_at - Duration::milliseconds(1)).await, 0);
    assert_eq!(n.tick_and_work(retry_at).await, 1);

    let history = n.history(&job.id);
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].attempt, 2);
    assert_eq!(history[1].status, ExecutionStatus::Succeeded);
    assert_eq!(history[1].output.as_deref(), Some("ok on attempt 2"));

    let done = n.jobs.get(&job.id).unwrap();
    assert_eq!(done.retry_at, None);
    assert_eq!(done.next_fire_time, Some(t0 + Duration::seconds(120)));
    assert_eq!(n.metrics.snapshot().retries_scheduled, 1);
}

#[tokio::test]
async fn retry_outlives_a_shorter_interval() {
    let n = node(Arc::new(Flaky::new(2)));
    let t0 = start();
    let job = n
        .jobs
        .create(
            NewJob::new("every-minute", Schedule::Interval { every_secs: 60 }).with_retries(3, 90),
            t0,
        )
        .unwrap();

    assert_eq!(n.tick_and_work(t0 + Duration::seconds(60)).await, 1);
    let retry_at = n.jobs.get(&job.id).unwrap().retry_at.unwrap();
    assert!(retry_at > t0 + Duration::seconds(120));

    // the next firing comes due first and is folded into the retry
    assert_eq!(n.tick_and_work(t0 + Duration::seconds(120)).await, 0);
    let waiting = n.jobs.get(&job.id).unwrap();
    assert_eq!(waiting.retry_attempt, Some(2));
    assert_eq!(waiting.retry_at, Some(retry_at));
    assert_eq!(waiting.next_fire_time, Some(t0 + Duration::seconds(180)));

    assert_eq!(n.tick_and_work(retry_at).await, 1);
    let history = n.history(&job.id);
    assert_eq!(history.iter().map(|e| e.attempt).collect::<Vec<_>>(), vec![1, 2]);
    assert_eq!(history[1].status, ExecutionStatus::Succeeded);

    let stats = n.jobs.get(&job.id).unwrap().stats;
    assert_eq!((stats.total_runs, stats.successful_runs, stats.failed_runs), (2, 1, 1));
}

#[tokio::test]
async fn retry_survives_a_failed_terminal_write() {
    let n = node(Arc::new(Flaky::new(2)));
    let t0 = start();
    let job = n
        .jobs
        .create(
            NewJob::new("hourly", Schedule::Interval { every_secs: 3_600 })
                .with_retries(3, 5)
                .with_timeout(5),
            t0,
        )
        .unwrap();

    let fired = t0 + Duration::seconds(3_600);
    n.dispatch.tick(fired, 0).await.unwrap();
    let delivery = n.queue.dequeue(fired).await.unwrap().unwrap();

    n.conn
        .lock()
        .unwrap()
        .execute_batch(
            "CREATE TEMP TRIGGER reject_retry BEFORE UPDATE OF retry_attempt ON jobs
             WHEN NEW.retry_attempt IS NOT NULL
             BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END;",
        )
        .unwrap();
    assert!(n.worker.process(delivery).await.is_err());
    // nothing half-written: the attempt is still running and unacked
    assert_eq!(n.history(&job.id)[0].status, ExecutionStatus::Running);
    assert_eq!(n.jobs.get(&job.id).unwrap().retry_attempt, None);
    n.conn.lock().unwrap().execute_batch("DROP TRIGGER reject_retry;").unwrap();

    // the stall sweep closes the attempt and schedules the retry
    let sweep = fired + Duration::seconds(60);
    assert_eq!(n.tick_and_work(sweep).await, 0);
    let stored = n.jobs.get(&job.id).unwrap();
    assert_eq!(stored.retry_attempt, Some(2));
    assert_eq!(stored.retry_at, Some(sweep + Duration::seconds(5)));

    assert_eq!(n.tick_and_work(sweep + Duration::seconds(5)).await, 1);
    let history = n.history(&job.id);
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].status, ExecutionStatus::TimedOut);
    assert_eq!(history[1].status, ExecutionStatus::Succeeded);
}

#[tokio::test]
async fn retries_stop_after_max_attempts() {
    let n = node(Arc::new(Flaky::new(u32::MAX)));
    let t0 = start();
    let job = n
        .jobs
        .create(
            NewJob::new("always-fails", Schedule::Interval { every_secs: 3_600 }).with_retries(3, 1),
            t0,
        )
        .unwrap();

    let mut at = t0 + Duration::seconds(3_600);
    loop {
        n.tick_and_work(at).await;
        match n.jobs.get(&job.id).unwrap().retry_at {
            Some(next) => at = next,
            None => break,
        }
    }

    let history = n.history(&job.id);
    assert_eq!(history.len(), 3);
    assert_eq!(history.iter().map(|e| e.attempt).collect::<Vec<_>>(), vec![1, 2, 3]);
    assert!(history.iter().all(|e| e.status == ExecutionStatus::Failed));
    assert_eq!(n.metrics.snapshot().executions_failed, 3);
}

#[tokio::test]
async fn duplicate_delivery_runs_the_handler_once() {
    let handler = Arc::new(Flaky::new(1));
    let n = node(handler.clone());
    let t0 = start();
    let job = n
        .jobs
        .create(NewJob::new("once-only", Schedule::Interval { every_secs: 60 }), t0)
        .unwrap();

    let now = t0 + Duration::seconds(60);
    n.dispatch.tick(now, 0).await.unwrap();
    let first = n.queue.dequeue(now).await.unwrap().unwrap();
    // same message handed out again after the visibility timeout
    let second = n.queue.dequeue(now + Duration::seconds(301)).await.unwrap().unwrap();
    assert_eq!(first.message.execution_id, second.message.execution_id);
    assert_eq!(second.delivery_count, 2);

    n.worker.process(first).await.unwrap();
    n.worker.process(second).await.unwrap();

    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    assert_eq!(n.history(&job.id).len(), 1);
    assert_eq!(n.metrics.snapshot().duplicate_deliveries, 1);
    assert_eq!(n.queue.depth().await.unwrap(), 0);
}

#[tokio::test]
async fn rejected_message_fails_the_execution_without_retry() {
    let conn = Connection::open_in_memory().unwrap();
    db::init_db(&conn).unwrap();
    let conn = db::shared(conn);
    let metrics = Arc::new(SchedulerMetrics::default());
    let jobs = JobStore::new(conn.clone());
    let executions = ExecutionStore::new(conn);
    let (_leader_tx, leader_rx) = watch::channel(LeaderState::Leader { fencing_token: 0 });
    let (step_tx, _step_rx) = mpsc::channel(1);
    let dispatch = DispatchLoop::new(
        &DispatchConfig::default(),
        jobs.clone(),
        executions.clone(),
        Arc::new(DownQueue),
        RetryPolicy::new(3_600),
        leader_rx,
        step_tx,
    )
    .with_metrics(metrics.clone());

    let t0 = start();
    let job = jobs
        .create(
            NewJob::new("nightly", Schedule::Interval { every_secs: 60 }).with_retries(3, 5),
            t0,
        )
        .unwrap();

    let report = dispatch.tick(t0 + Duration::seconds(60), 0).await.unwrap();
    assert_eq!(report.claimed, 1);
    assert_eq!(report.enqueue_failures, 1);

    let history = executions.list_for_job(&job.id, Page::default()).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, ExecutionStatus::Failed);
    assert_eq!(history[0].error.as_deref(), Some(ENQUEUE_FAILURE));

    let stored = jobs.get(&job.id).unwrap();
    assert_eq!(stored.retry_at, None);
    assert_eq!(stored.next_fire_time, Some(t0 + Duration::seconds(120)));
    assert_eq!(metrics.snapshot().enqueue_failures, 1);

    // the next natural firing is attempted as usual
    let report = dispatch.tick(t0 + Duration::seconds(120), 0).await.unwrap();
    assert_eq!(report.claimed, 1);
}

#[tokio::test]
async fn deposed_leader_is_fenced_and_steps_down() {
    let conn = Connection::open_in_memory().unwrap();
    db::init_db(&conn).unwrap();
    let conn = db::shared(conn);
    let leases = LeaseStore::new(conn.clone(), "dispatch");
    let jobs = JobStore::new(conn.clone());
    let executions = ExecutionStore::new(conn.clone());
    let queue = Arc::new(SqliteWorkQueue::new(conn, Duration::seconds(30)));

    let now = Utc::now();
    let ttl = Duration::seconds(15);
    // node-a's term lapsed while it was paused; node-b took over
    let old = leases.try_acquire("node-a", now - Duration::seconds(60), ttl).unwrap();
    assert_eq!(old, Some(1));
    let new = leases.try_acquire("node-b", now, ttl).unwrap();
    assert_eq!(new, Some(2));

    let job = jobs
        .create(
            NewJob::new("report", Schedule::Interval { every_secs: 60 }),
            now - Duration::seconds(120),
        )
        .unwrap();

    let (leader_tx, leader_rx) = watch::channel(LeaderState::Leader { fencing_token: 1 });
    let (step_tx, mut step_rx) = mpsc::channel(1);
    let stale = DispatchLoop::new(
        &DispatchConfig::default(),
        jobs.clone(),
        executions.clone(),
        queue.clone(),
        RetryPolicy::new(3_600),
        leader_rx,
        step_tx,
    );

    let err = stale.tick(now, 1).await.unwrap_err();
    assert!(matches!(err, SchedulerError::StaleLeader { presented: 1, current: 2 }));
    assert!(executions.list_for_job(&job.id, Page::default()).unwrap().is_empty());
    assert_eq!(queue.depth().await.unwrap(), 0);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(stale.run(shutdown_rx));
    let stepped = tokio::time::timeout(std::time::Duration::from_secs(5), step_rx.recv())
        .await
        .unwrap();
    assert_eq!(stepped, Some(1));
    leader_tx.send(LeaderState::Follower).unwrap();
    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(std::time::Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();

    // the current leader's token is accepted
    let current = DispatchLoop::new(
        &DispatchConfig::default(),
        jobs.clone(),
        executions.clone(),
        queue.clone(),
        RetryPolicy::new(3_600),
        watch::channel(LeaderState::Leader { fencing_token: 2 }).1,
        mpsc::channel(1).0,
    );
    assert_eq!(current.tick(now, 2).await.unwrap().enqueued, 1);
}
