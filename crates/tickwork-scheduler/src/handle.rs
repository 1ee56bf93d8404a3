use std::sync::Arc;

use chrono::Utc;
use rusqlite::Connection;
use tickwork_core::{ExecutionId, JobId, TickworkConfig};
use tracing::info;

use crate::{
    db::{self, init_db},
    error::Result,
    execution_store::ExecutionStore,
    job_store::JobStore,
    lease::LeaseStore,
    metrics::{MonitoringSnapshot, SchedulerMetrics},
    queue::{SqliteWorkQueue, WorkQueue},
    types::{Execution, Job, JobFilter, JobPatch, NewJob, Page},
};

/// Management surface for jobs and executions.
///
/// Uses its own `Connection` so admin calls never contend with the dispatch
/// loop's or the workers' connections for the same mutex. Mutations that
/// change a job's definition take the version the caller last read.
#[derive(Clone)]
pub struct SchedulerHandle {
    jobs: JobStore,
    executions: ExecutionStore,
    leases: LeaseStore,
    queue: Arc<dyn WorkQueue>,
    metrics: Arc<SchedulerMetrics>,
}

impl SchedulerHandle {
    pub fn new(conn: Connection, config: &TickworkConfig) -> Result<Self> {
        init_db(&conn)?;
        let conn = db::shared(conn);
        let metrics = Arc::new(SchedulerMetrics::default());
        let visibility = chrono::Duration::seconds(config.worker.visibility_timeout_secs.min(86_400) as i64);
        Ok(Self {
            jobs: JobStore::new(conn.clone())
                .with_lease_name(&config.lease.name)
                .with_metrics(metrics.clone()),
            executions: ExecutionStore::new(conn.clone()).with_lease_name(&config.lease.name),
            leases: LeaseStore::new(conn.clone(), &config.lease.name),
            queue: Arc::new(SqliteWorkQueue::new(conn, visibility)),
            metrics,
        })
    }

    /// Report counters from `metrics` (shared with this process's loops)
    /// in [`Self::monitoring_snapshot`].
    pub fn with_metrics(mut self, metrics: Arc<SchedulerMetrics>) -> Self {
        self.jobs = self.jobs.with_metrics(metrics.clone());
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> Arc<SchedulerMetrics> {
        self.metrics.clone()
    }

    pub fn create_job(&self, new: NewJob) -> Result<Job> {
        let job = self.jobs.create(new, Utc::now())?;
        info!(job_id = %job.id, name = %job.name, "job added via handle");
        Ok(job)
    }

    pub fn get_job(&self, id: &JobId) -> Result<Job> {
        self.jobs.get(id)
    }

    pub fn list_jobs(&self, filter: &JobFilter, page: Page) -> Result<Vec<Job>> {
        self.jobs.list(filter, page)
    }

    pub fn update_job(&self, id: &JobId, patch: JobPatch, expected_version: i64) -> Result<i64> {
        self.jobs.update(id, patch, expected_version, Utc::now())
    }

    pub fn delete_job(&self, id: &JobId, expected_version: i64) -> Result<i64> {
        self.jobs.delete(id, expected_version, Utc::now())
    }

    pub fn pause_job(&self, id: &JobId, expected_version: i64) -> Result<i64> {
        self.jobs.pause(id, expected_version, Utc::now())
    }

    pub fn resume_job(&self, id: &JobId, expected_version: i64) -> Result<i64> {
        self.jobs.resume(id, expected_version, Utc::now())
    }

    pub fn list_executions(&self, job_id: &JobId, page: Page) -> Result<Vec<Execution>> {
        self.executions.list_for_job(job_id, page)
    }

    pub fn get_execution(&self, id: &ExecutionId) -> Result<Execution> {
        self.executions.get(id)
    }

    pub async fn monitoring_snapshot(&self) -> Result<MonitoringSnapshot> {
        let lease = self.leases.current()?;
        let executions = self.executions.status_counts()?;
        let depth = self.queue.depth().await?;
        Ok(MonitoringSnapshot::new(
            Utc::now(),
            lease,
            depth,
            executions,
            self.metrics.snapshot(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SchedulerError;
    use crate::types::{JobState, Schedule};

    fn handle() -> SchedulerHandle {
        let conn = Connection::open_in_memory().unwrap();
        SchedulerHandle::new(conn, &TickworkConfig::default()).unwrap()
    }

    #[test]
    fn job_lifecycle_through_handle() {
        let h = handle();
        let job = h
            .create_job(NewJob::new("report", Schedule::Interval { every_secs: 3_600 }))
            .unwrap();

        let v = h.pause_job(&job.id, job.version).unwrap();
        assert_eq!(h.get_job(&job.id).unwrap().state, JobState::Paused);
        let v = h.resume_job(&job.id, v).unwrap();
        let v = h
            .update_job(
                &job.id,
                JobPatch {
                    name: Some("hourly report".into()),
                    ..Default::default()
                },
                v,
            )
            .unwrap();
        assert_eq!(h.get_job(&job.id).unwrap().name, "hourly report");

        // stale version from the original read
        let err = h.delete_job(&job.id, job.version).unwrap_err();
        assert!(matches!(err, SchedulerError::VersionConflict { .. }));
        h.delete_job(&job.id, v).unwrap();
        assert!(h.list_jobs(&JobFilter::default(), Page::default()).unwrap().is_empty());
        assert!(h.list_executions(&job.id, Page::default()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn snapshot_reports_counts() {
        let h = handle();
        let snap = h.monitoring_snapshot().await.unwrap();
        assert_eq!(snap.leader, None);
        assert_eq!(snap.queue_depth, 0);
        assert_eq!(snap.executions.queued, 0);
    }
}
