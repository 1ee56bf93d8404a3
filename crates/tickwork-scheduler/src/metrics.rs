//! In-process counters and the monitoring snapshot.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{execution_store::ExecutionCounts, types::Lease};

/// Monotonic counters shared by the stores, the dispatch loop and the
/// worker pool of one process.
#[derive(Debug, Default)]
pub struct SchedulerMetrics {
    jobs_dispatched: AtomicU64,
    executions_succeeded: AtomicU64,
    executions_failed: AtomicU64,
    executions_timed_out: AtomicU64,
    enqueue_failures: AtomicU64,
    duplicate_deliveries: AtomicU64,
    retries_scheduled: AtomicU64,
    overlaps_skipped: AtomicU64,
    stale_leader_rejections: AtomicU64,
    stalled_recovered: AtomicU64,
}

/// Point-in-time copy of [`SchedulerMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub jobs_dispatched: u64,
    pub executions_succeeded: u64,
    pub executions_failed: u64,
    pub executions_timed_out: u64,
    pub enqueue_failures: u64,
    pub duplicate_deliveries: u64,
    pub retries_scheduled: u64,
    pub overlaps_skipped: u64,
    pub stale_leader_rejections: u64,
    pub stalled_recovered: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl SchedulerMetrics {
    pub fn record_dispatched(&self) {
        bump(&self.jobs_dispatched);
    }

    pub fn record_succeeded(&self) {
        bump(&self.executions_succeeded);
    }

    pub fn record_failed(&self) {
        bump(&self.executions_failed);
    }

    pub fn record_timed_out(&self) {
        bump(&self.executions_timed_out);
    }

    pub fn record_enqueue_failure(&self) {
        bump(&self.enqueue_failures);
    }

    pub fn record_duplicate(&self) {
        bump(&self.duplicate_deliveries);
    }

    pub fn record_retry_scheduled(&self) {
        bump(&self.retries_scheduled);
    }

    pub fn record_overlap_skipped(&self) {
        bump(&self.overlaps_skipped);
    }

    pub fn record_stale_leader(&self) {
        bump(&self.stale_leader_rejections);
    }

    pub fn record_stalled_recovered(&self) {
        bump(&self.stalled_recovered);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            jobs_dispatched: load(&self.jobs_dispatched),
            executions_succeeded: load(&self.executions_succeeded),
            executions_failed: load(&self.executions_failed),
            executions_timed_out: load(&self.executions_timed_out),
            enqueue_failures: load(&self.enqueue_failures),
            duplicate_deliveries: load(&self.duplicate_deliveries),
            retries_scheduled: load(&self.retries_scheduled),
            overlaps_skipped: load(&self.overlaps_skipped),
            stale_leader_rejections: load(&self.stale_leader_rejections),
            stalled_recovered: load(&self.stalled_recovered),
        }
    }
}

/// Everything an operator dashboard needs in one serialisable value.
///
/// Counters are per process; execution totals, the lease and the queue
/// depth come from the shared database.
#[derive(Debug, Clone, Serialize)]
pub struct MonitoringSnapshot {
    pub generated_at: DateTime<Utc>,
    pub leader: Option<String>,
    pub fencing_token: Option<i64>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub queue_depth: u64,
    pub executions: ExecutionCounts,
    pub counters: MetricsSnapshot,
}

impl MonitoringSnapshot {
    pub fn new(
        generated_at: DateTime<Utc>,
        lease: Option<Lease>,
        queue_depth: u64,
        executions: ExecutionCounts,
        counters: MetricsSnapshot,
    ) -> Self {
        // An expired lease means nobody is leading right now.
        let live = lease.filter(|l| l.is_live(generated_at));
        Self {
            generated_at,
            leader: live.as_ref().map(|l| l.holder.clone()),
            fencing_token: live.as_ref().map(|l| l.fencing_token),
            lease_expires_at: live.as_ref().map(|l| l.expires_at),
            queue_depth,
            executions,
            counters,
        }
    }
}
