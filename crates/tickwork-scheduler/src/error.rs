use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The provided schedule definition is unparsable or can never fire.
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// A job field other than the schedule failed validation.
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    /// No job with the given ID exists in the store.
    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    /// No execution with the given ID exists in the store.
    #[error("Execution not found: {id}")]
    ExecutionNotFound { id: String },

    /// Optimistic concurrency check failed; the caller must re-read and retry.
    #[error("Version conflict on job {id}: expected {expected}, found {actual}")]
    VersionConflict { id: String, expected: i64, actual: i64 },

    /// The requested state change is not allowed from the job's current state.
    #[error("Cannot {action} job {id} in state {from}")]
    InvalidTransition {
        id: String,
        from: String,
        action: &'static str,
    },

    /// A dispatch-affecting write carried a fencing token older than the
    /// current lease term. Fatal to the writer's leadership.
    #[error("Stale leader: fencing token {presented} is behind {current}")]
    StaleLeader { presented: i64, current: i64 },

    /// The lease is held by someone else (or expired) at renewal time.
    #[error("Lease lost: {name}")]
    LeaseLost { name: String },

    /// The work queue could not accept a dispatch message.
    #[error("Enqueue failure: {0}")]
    EnqueueFailure(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A connection mutex was poisoned by a panicking thread.
    #[error("Store lock poisoned")]
    LockPoisoned,
}

impl SchedulerError {
    /// Short error code string for the API layer.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::Database(_) => "DATABASE_ERROR",
            SchedulerError::InvalidSchedule(_) => "INVALID_SCHEDULE",
            SchedulerError::InvalidJob(_) => "INVALID_JOB",
            SchedulerError::JobNotFound { .. } => "JOB_NOT_FOUND",
            SchedulerError::ExecutionNotFound { .. } => "EXECUTION_NOT_FOUND",
            SchedulerError::VersionConflict { .. } => "VERSION_CONFLICT",
            SchedulerError::InvalidTransition { .. } => "INVALID_TRANSITION",
            SchedulerError::StaleLeader { .. } => "STALE_LEADER",
            SchedulerError::LeaseLost { .. } => "LEASE_LOST",
            SchedulerError::EnqueueFailure(_) => "ENQUEUE_FAILURE",
            SchedulerError::Serialization(_) => "SERIALIZATION_ERROR",
            SchedulerError::LockPoisoned => "LOCK_POISONED",
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

/// How a job handler reports an unsuccessful run.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The handler ran and reported a failure.
    #[error("{0}")]
    Failed(String),

    /// The handler stopped because its cancellation token fired.
    #[error("cancelled")]
    Cancelled,
}

impl HandlerError {
    pub fn failed(msg: impl Into<String>) -> Self {
        HandlerError::Failed(msg.into())
    }
}
