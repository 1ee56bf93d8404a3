use std::sync::Arc;

use tickwork_core::TickworkConfig;
use tickwork_scheduler::{
    db, DispatchLoop, ExecutionStore, HandlerSet, JobStore, LeaderCoordinator, LeaderTimings, LeaseStore,
    RetryPolicy, SchedulerMetrics, SqliteWorkQueue, WorkQueue, WorkerPool,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::cli::Role;

/// Background tasks of one running node.
pub struct Node {
    tasks: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl Node {
    /// Open per-component connections and spawn the loops for `role`.
    pub fn start(config: &TickworkConfig, role: Role, metrics: Arc<SchedulerMetrics>) -> anyhow::Result<Self> {
        let node_id = config.node.node_id();
        let db_path = &config.database.path;
        let busy = config.database.busy_timeout_ms;
        let lease_name = &config.lease.name;
        let visibility = chrono::Duration::seconds(config.worker.visibility_timeout_secs.min(86_400) as i64);
        let retry = RetryPolicy::new(config.retry.max_backoff_secs);

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        if role.schedules() {
            let coordinator = LeaderCoordinator::new(
                LeaseStore::new(db::shared(db::open(db_path, busy)?), lease_name),
                node_id.as_str(),
                LeaderTimings::from(&config.lease),
            );

            let conn = db::shared(db::open(db_path, busy)?);
            let queue: Arc<dyn WorkQueue> = Arc::new(SqliteWorkQueue::new(conn.clone(), visibility));
            let dispatch = DispatchLoop::new(
                &config.dispatch,
                JobStore::new(conn.clone())
                    .with_lease_name(lease_name)
                    .with_metrics(metrics.clone()),
                ExecutionStore::new(conn).with_lease_name(lease_name),
                queue,
                retry,
                coordinator.subscribe(),
                coordinator.step_down_sender(),
            )
            .with_metrics(metrics.clone());

            let rx = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move { coordinator.run(rx).await }));
            let rx = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move { dispatch.run(rx).await }));
        }

        if role.works() {
            let conn = db::shared(db::open(db_path, busy)?);
            let pool = WorkerPool::new(
                node_id.as_str(),
                &config.worker,
                Arc::new(SqliteWorkQueue::new(conn.clone(), visibility)),
                ExecutionStore::new(conn).with_lease_name(lease_name),
                HandlerSet::default(),
                retry,
            )
            .with_metrics(metrics);

            let rx = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move { pool.run(rx).await }));
        }

        info!(node_id = %node_id, ?role, tasks = tasks.len(), "node started");
        Ok(Self { tasks, shutdown })
    }

    /// Signal every loop to stop and wait for them. The coordinator releases
    /// the lease on its way out; workers finish their current attempts.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "node task ended abnormally");
            }
        }
        info!("node stopped");
    }
}
