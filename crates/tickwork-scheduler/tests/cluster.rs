//! Several nodes sharing one database file.

use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tempfile::TempDir;
use tickwork_core::config::{DispatchConfig, LeaseConfig, WorkerConfig};
use tickwork_core::TickworkConfig;
use tickwork_scheduler::{
    db, types::Page, DispatchLoop, ExecutionStatus, ExecutionStore, HandlerContext, HandlerError, HandlerSet,
    JobHandler, JobStore, LeaderCoordinator, LeaderState, LeaderTimings, LeaseStore, NewJob, RetryPolicy,
    Schedule, SchedulerHandle, SchedulerMetrics, SqliteWorkQueue, WorkerPool,
};
use tokio::sync::watch;

const BUSY_MS: u64 = 5_000;

fn database() -> (TempDir, String) {
    let dir = tempfile::Builder::new().prefix("tickwork-").tempdir().unwrap();
    let path = dir.path().join("tickwork.db").to_string_lossy().into_owned();
    let conn = db::open(&path, BUSY_MS).unwrap();
    db::init_db(&conn).unwrap();
    (dir, path)
}

#[test]
fn concurrent_claims_never_double_dispatch() {
    let (_dir, path) = database();
    let t0 = Utc::now() - Duration::seconds(120);
    let seed = JobStore::new(db::shared(db::open(&path, BUSY_MS).unwrap()));
    for i in 0..20 {
        seed.create(NewJob::new(format!("job-{i}"), Schedule::Interval { every_secs: 60 }), t0)
            .unwrap();
    }

    let nodes = 4;
    let barrier = Arc::new(Barrier::new(nodes));
    let claimed: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..nodes)
            .map(|_| {
                let barrier = barrier.clone();
                let path = path.clone();
                s.spawn(move || {
                    let jobs = JobStore::new(db::shared(db::open(&path, BUSY_MS).unwrap()));
                    barrier.wait();
                    let now = t0 + Duration::seconds(61);
                    let mut mine = Vec::new();
                    loop {
                        let batch = jobs.claim_due(now, 3, 0).unwrap();
                        if batch.is_empty() {
                            break;
                        }
                        mine.extend(batch.into_iter().map(|c| c.job.id));
                    }
                    mine
                })
            })
            .collect();
        handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(claimed.len(), 20);
    let unique: HashSet<_> = claimed.iter().collect();
    assert_eq!(unique.len(), 20);

    let executions = ExecutionStore::new(db::shared(db::open(&path, BUSY_MS).unwrap()));
    for id in unique {
        assert_eq!(executions.list_for_job(id, Page::default()).unwrap().len(), 1);
    }
}

struct Echo;

#[async_trait]
impl JobHandler for Echo {
    async fn run(&self, ctx: HandlerContext) -> Result<String, HandlerError> {
        Ok(format!("ran {}", ctx.job_id))
    }
}

/// Wire a full node (coordinator, dispatch loop, worker pool) against `path`,
/// one connection per component.
fn spawn_node(
    path: &str,
    holder: &str,
    config: &TickworkConfig,
    shutdown: watch::Receiver<bool>,
) -> (watch::Receiver<LeaderState>, Vec<tokio::task::JoinHandle<()>>) {
    let conn = || db::shared(db::open(path, BUSY_MS).unwrap());
    let metrics = Arc::new(SchedulerMetrics::default());
    let retry = RetryPolicy::new(config.retry.max_backoff_secs);

    let coordinator = LeaderCoordinator::new(
        LeaseStore::new(conn(), &config.lease.name),
        holder,
        LeaderTimings::from(&config.lease),
    );
    let leader = coordinator.subscribe();

    let dispatch_conn = conn();
    let dispatch = DispatchLoop::new(
        &config.dispatch,
        JobStore::new(dispatch_conn.clone()).with_metrics(metrics.clone()),
        ExecutionStore::new(dispatch_conn.clone()),
        Arc::new(SqliteWorkQueue::new(dispatch_conn, Duration::seconds(30))),
        retry,
        coordinator.subscribe(),
        coordinator.step_down_sender(),
    )
    .with_metrics(metrics.clone());

    let worker_conn = conn();
    let worker = WorkerPool::new(
        holder,
        &config.worker,
        Arc::new(SqliteWorkQueue::new(worker_conn.clone(), Duration::seconds(30))),
        ExecutionStore::new(worker_conn),
        HandlerSet::uniform(Arc::new(Echo)),
        retry,
    )
    .with_metrics(metrics);

    let tasks = vec![
        tokio::spawn(coordinator.run(shutdown.clone())),
        tokio::spawn(dispatch.run(shutdown.clone())),
        tokio::spawn(worker.run(shutdown)),
    ];
    (leader, tasks)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_nodes_run_each_firing_once() {
    let (_dir, path) = database();
    let config = TickworkConfig {
        lease: LeaseConfig {
            ttl_secs: 3,
            renew_interval_secs: 1,
            retry_interval_secs: 1,
            ..Default::default()
        },
        dispatch: DispatchConfig {
            poll_interval_secs: 1,
            ..Default::default()
        },
        worker: WorkerConfig {
            concurrency: 2,
            poll_interval_ms: 50,
            ..Default::default()
        },
        ..Default::default()
    };

    let admin = SchedulerHandle::new(db::open(&path, BUSY_MS).unwrap(), &config).unwrap();
    let job = admin
        .create_job(NewJob::new(
            "one-off",
            Schedule::Once {
                at: Utc::now() + Duration::seconds(1),
            },
        ))
        .unwrap();

    let (stop_tx, stop_rx) = watch::channel(false);
    let (mut leader_a, mut tasks) = spawn_node(&path, "node-a", &config, stop_rx.clone());
    let (mut leader_b, more) = spawn_node(&path, "node-b", &config, stop_rx);
    tasks.extend(more);

    let mut finished = None;
    for _ in 0..200 {
        let history = admin.list_executions(&job.id, Page::default()).unwrap();
        if history.iter().any(|e| e.status.is_terminal()) {
            finished = Some(history);
            break;
        }
        tokio::time::sleep(StdDuration::from_millis(50)).await;
    }
    let history = finished.expect("execution did not finish in time");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, ExecutionStatus::Succeeded);
    assert_eq!(history[0].output.as_deref(), Some(format!("ran {}", job.id).as_str()));

    let leaders = [*leader_a.borrow_and_update(), *leader_b.borrow_and_update()]
        .iter()
        .filter(|s| s.fencing_token().is_some())
        .count();
    assert!(leaders <= 1);

    let snapshot = admin.monitoring_snapshot().await.unwrap();
    assert_eq!(snapshot.executions.succeeded, 1);

    stop_tx.send(true).unwrap();
    for task in tasks {
        tokio::time::timeout(StdDuration::from_secs(10), task)
            .await
            .unwrap()
            .unwrap();
    }
    assert_eq!(*leader_a.borrow(), LeaderState::Stopped);
    assert_eq!(*leader_b.borrow(), LeaderState::Stopped);
}
