use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tickwork_core::{ExecutionId, JobId};

/// Defines when and how often a job should run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    /// Run according to a five- or six-field cron expression (UTC).
    Cron { expression: String },

    /// Run repeatedly with a fixed interval in seconds.
    Interval { every_secs: u64 },

    /// Run exactly once at the given UTC instant.
    Once { at: DateTime<Utc> },
}

/// Administrative state of a job definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Eligible for dispatch whenever `next_fire_time` (or a retry) is due.
    Active,
    /// Kept but never dispatched; `next_fire_time` is null.
    Paused,
    /// Soft-deleted. Executions are retained for history.
    Deleted,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Active => "active",
            JobState::Paused => "paused",
            JobState::Deleted => "deleted",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(JobState::Active),
            "paused" => Ok(JobState::Paused),
            "deleted" => Ok(JobState::Deleted),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}

/// The closed set of job kinds a worker knows how to run.
///
/// Adding a kind means adding a variant here and a field to
/// [`crate::handlers::HandlerSet`]; the compiler points at every match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    EmailNotification,
    DataProcessing,
    ReportGeneration,
    CleanupTask,
    BackupTask,
    Custom,
}

impl JobType {
    pub const ALL: [JobType; 6] = [
        JobType::EmailNotification,
        JobType::DataProcessing,
        JobType::ReportGeneration,
        JobType::CleanupTask,
        JobType::BackupTask,
        JobType::Custom,
    ];
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobType::EmailNotification => "email_notification",
            JobType::DataProcessing => "data_processing",
            JobType::ReportGeneration => "report_generation",
            JobType::CleanupTask => "cleanup_task",
            JobType::BackupTask => "backup_task",
            JobType::Custom => "custom",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        JobType::ALL
            .into_iter()
            .find(|t| t.to_string() == s)
            .ok_or_else(|| format!("unknown job type: {s}"))
    }
}

/// A persisted job definition and its current scheduling state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Human-readable label.
    pub name: String,
    pub description: String,
    pub schedule: Schedule,
    pub job_type: JobType,
    /// Arbitrary JSON payload forwarded to the job handler.
    pub job_data: serde_json::Value,
    pub state: JobState,
    /// Next natural firing; null when paused, deleted or exhausted.
    pub next_fire_time: Option<DateTime<Utc>>,
    /// Bumped on every mutation, including claims.
    pub version: i64,
    /// Upper bound on attempts per firing (attempt numbers run 1..=max_retries).
    pub max_retries: u32,
    pub retry_backoff_base_secs: u64,
    pub timeout_secs: u64,
    /// Dispatch tie-break only: higher first among equally due jobs.
    pub priority: i32,
    /// Attempt number of a pending retry, if one is scheduled.
    pub retry_attempt: Option<u32>,
    pub retry_at: Option<DateTime<Utc>>,
    pub last_fired_at: Option<DateTime<Utc>>,
    /// User or service that registered the job.
    pub created_by: String,
    #[serde(flatten)]
    pub stats: JobStats,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Run counters kept on the job row, updated in the same transaction that
/// closes each execution. Only attempts that reached a worker count as runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    pub total_runs: u64,
    pub successful_runs: u64,
    /// Failed and timed-out runs.
    pub failed_runs: u64,
    /// Mean wall-clock time of all runs.
    pub average_runtime_ms: i64,
}

impl Job {
    /// The earlier of the natural firing and a pending retry.
    pub fn due_at(&self) -> Option<DateTime<Utc>> {
        match (self.next_fire_time, self.retry_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

/// Input for [`crate::job_store::JobStore::create`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub schedule: Schedule,
    #[serde(default = "default_job_type")]
    pub job_type: JobType,
    #[serde(default)]
    pub job_data: serde_json::Value,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base")]
    pub retry_backoff_base_secs: u64,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default = "default_created_by")]
    pub created_by: String,
}

fn default_job_type() -> JobType {
    JobType::Custom
}
fn default_max_retries() -> u32 {
    3
}
fn default_backoff_base() -> u64 {
    60
}
fn default_timeout() -> u64 {
    3_600
}
fn default_priority() -> i32 {
    5
}
fn default_created_by() -> String {
    "system".to_string()
}

impl NewJob {
    pub fn new(name: impl Into<String>, schedule: Schedule) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            schedule,
            job_type: default_job_type(),
            job_data: serde_json::Value::Null,
            max_retries: default_max_retries(),
            retry_backoff_base_secs: default_backoff_base(),
            timeout_secs: default_timeout(),
            priority: default_priority(),
            created_by: default_created_by(),
        }
    }

    pub fn with_type(mut self, job_type: JobType) -> Self {
        self.job_type = job_type;
        self
    }

    pub fn with_data(mut self, job_data: serde_json::Value) -> Self {
        self.job_data = job_data;
        self
    }

    pub fn with_retries(mut self, max_retries: u32, backoff_base_secs: u64) -> Self {
        self.max_retries = max_retries;
        self.retry_backoff_base_secs = backoff_base_secs;
        self
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_created_by(mut self, created_by: impl Into<String>) -> Self {
        self.created_by = created_by.into();
        self
    }
}

/// Partial update for [`crate::job_store::JobStore::update`]. `None` leaves
/// the field unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub schedule: Option<Schedule>,
    pub job_type: Option<JobType>,
    pub job_data: Option<serde_json::Value>,
    pub max_retries: Option<u32>,
    pub retry_backoff_base_secs: Option<u64>,
    pub timeout_secs: Option<u64>,
    pub priority: Option<i32>,
}

/// Listing filter. Deleted jobs are hidden unless asked for explicitly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobFilter {
    pub state: Option<JobState>,
    pub job_type: Option<JobType>,
    pub created_by: Option<String>,
}

pub const MAX_PER_PAGE: u32 = 100;

/// 1-based pagination; `per_page` is clamped to 1..=100.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub page: u32,
    pub per_page: u32,
}

impl Page {
    pub fn new(page: u32, per_page: u32) -> Self {
        Self {
            page: page.max(1),
            per_page: per_page.clamp(1, MAX_PER_PAGE),
        }
    }

    pub fn limit(&self) -> i64 {
        i64::from(self.per_page.clamp(1, MAX_PER_PAGE))
    }

    pub fn offset(&self) -> i64 {
        i64::from(self.page.max(1) - 1) * self.limit()
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(1, 20)
    }
}

/// Lifecycle state of one execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Succeeded | ExecutionStatus::Failed | ExecutionStatus::TimedOut
        )
    }

    /// Failed or timed out: the statuses the retry policy reacts to.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExecutionStatus::Failed | ExecutionStatus::TimedOut)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionStatus::Queued => "queued",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Succeeded => "succeeded",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::TimedOut => "timed_out",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "queued" => Ok(ExecutionStatus::Queued),
            "running" => Ok(ExecutionStatus::Running),
            "succeeded" => Ok(ExecutionStatus::Succeeded),
            "failed" => Ok(ExecutionStatus::Failed),
            "timed_out" => Ok(ExecutionStatus::TimedOut),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// A persisted execution attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub job_id: JobId,
    /// 1-based attempt number within one firing.
    pub attempt: u32,
    pub status: ExecutionStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    /// Node that ran (or is running) the attempt.
    pub worker_id: Option<String>,
    pub output: Option<String>,
    /// Failure reason, e.g. a handler message or `EnqueueFailure`.
    pub error: Option<String>,
}

/// Terminal result written by a worker (or the stall reaper).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub status: ExecutionStatus,
    pub output: Option<String>,
    pub error: Option<String>,
}

impl Completion {
    pub fn succeeded(output: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Succeeded,
            output: Some(output.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            output: None,
            error: Some(error.into()),
        }
    }

    pub fn timed_out(error: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::TimedOut,
            output: None,
            error: Some(error.into()),
        }
    }
}

/// A job selected by `claim_due` together with the `queued` execution that
/// was created for it in the same transaction.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job: Job,
    pub execution_id: ExecutionId,
    pub attempt: u32,
    /// True when this claim consumed a pending retry rather than a natural firing.
    pub is_retry: bool,
}

/// Snapshot of the leadership lease record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub name: String,
    pub holder: String,
    pub expires_at: DateTime<Utc>,
    pub fencing_token: i64,
}

impl Lease {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}
