//! `tickwork-scheduler`: distributed job scheduling on a shared SQLite store.
//!
//! # Overview
//!
//! Job definitions, execution history, the leadership lease and the work
//! queue all live in one SQLite database. Any number of node processes can
//! open it; the [`leader::LeaderCoordinator`] makes sure at most one of them
//! runs the [`dispatch::DispatchLoop`] at a time, and every dispatch write
//! carries the leader's fencing token so a deposed leader cannot double-fire
//! a job. Workers in any process pull messages from the queue and run them
//! through a [`handlers::HandlerSet`].
//!
//! # Modules
//!
//! | Module             | Responsibility                                         |
//! |--------------------|--------------------------------------------------------|
//! | `cron`, `schedule` | Pure next-fire-time calculation and validation         |
//! | `job_store`        | Job CRUD, versioning and the atomic `claim_due`        |
//! | `execution_store`  | Execution lifecycle via compare-and-set                |
//! | `lease`, `leader`  | Durable lease with fencing tokens, leader state machine |
//! | `queue`            | At-least-once work queue                               |
//! | `dispatch`         | Leader-only claim/enqueue loop and recovery sweep      |
//! | `worker`, `retry`  | Handler execution, timeouts and retry backoff          |
//! | `metrics`          | Counters and the monitoring snapshot                   |
//! | `handle`           | Management API over the stores                         |

pub mod cron;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod execution_store;
pub mod handle;
pub mod handlers;
pub mod job_store;
pub mod leader;
pub mod lease;
pub mod metrics;
pub mod queue;
pub mod retry;
pub mod schedule;
pub mod types;
pub mod worker;

pub use dispatch::DispatchLoop;
pub use error::{HandlerError, Result, SchedulerError};
pub use execution_store::ExecutionStore;
pub use handle::SchedulerHandle;
pub use handlers::{HandlerContext, HandlerSet, JobHandler};
pub use job_store::JobStore;
pub use leader::{LeaderCoordinator, LeaderState, LeaderTimings};
pub use lease::LeaseStore;
pub use metrics::{MonitoringSnapshot, SchedulerMetrics};
pub use queue::{DispatchMessage, SqliteWorkQueue, WorkQueue};
pub use retry::RetryPolicy;
pub use types::{Execution, ExecutionStatus, Job, JobState, JobStats, JobType, NewJob, Schedule};
pub use worker::WorkerPool;
