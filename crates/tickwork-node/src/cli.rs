use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use tickwork_core::config::JobDefaults;
use tickwork_scheduler::types::{JobFilter, Page};
use tickwork_scheduler::{JobState, JobType, NewJob, Schedule};

#[derive(Parser, Debug)]
#[command(name = "tickwork-node")]
#[command(version)]
#[command(about = "Distributed job scheduler node")]
#[command(propagate_version = true)]
pub struct Args {
    /// Config file (defaults to $TICKWORK_CONFIG, then ~/.tickwork/tickwork.toml)
    #[arg(long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a node until Ctrl-C
    Run {
        #[arg(long, value_enum, default_value = "all")]
        role: Role,
    },

    /// Create a job
    Add(AddArgs),

    /// List jobs, highest priority first
    List {
        /// Only jobs in this state (active, paused, deleted)
        #[arg(long)]
        state: Option<JobState>,

        /// Only jobs of this type
        #[arg(long = "type")]
        job_type: Option<JobType>,

        /// Only jobs registered by this user or service
        #[arg(long)]
        created_by: Option<String>,

        #[command(flatten)]
        page: PageArgs,
    },

    /// Execution history of one job, newest first
    Executions {
        job_id: String,

        #[command(flatten)]
        page: PageArgs,
    },

    /// Pause an active job
    Pause { job_id: String },

    /// Resume a paused job
    Resume { job_id: String },

    /// Soft-delete a job; its executions are kept
    Delete { job_id: String },

    /// Leader, queue depth and execution counters as JSON
    Status,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Role {
    /// Coordinator, dispatch loop and worker pool
    All,
    /// Coordinator and dispatch loop only
    Scheduler,
    /// Worker pool only
    Worker,
}

impl Role {
    pub fn schedules(self) -> bool {
        matches!(self, Role::All | Role::Scheduler)
    }

    pub fn works(self) -> bool {
        matches!(self, Role::All | Role::Worker)
    }
}

#[derive(clap::Args, Debug)]
pub struct PageArgs {
    #[arg(long, default_value_t = 1)]
    pub page: u32,

    #[arg(long, default_value_t = 20)]
    pub per_page: u32,
}

impl From<&PageArgs> for Page {
    fn from(args: &PageArgs) -> Self {
        Page::new(args.page, args.per_page)
    }
}

#[derive(clap::Args, Debug)]
pub struct AddArgs {
    #[arg(long)]
    pub name: String,

    #[arg(long, default_value = "")]
    pub description: String,

    /// Cron expression, five or six fields, UTC
    #[arg(long, group = "when")]
    pub cron: Option<String>,

    /// Fixed interval in seconds
    #[arg(long, group = "when")]
    pub every: Option<u64>,

    /// One-off RFC 3339 instant
    #[arg(long, group = "when")]
    pub at: Option<DateTime<Utc>>,

    #[arg(long = "type", default_value = "custom")]
    pub job_type: JobType,

    /// JSON payload handed to the handler
    #[arg(long)]
    pub data: Option<String>,

    #[arg(long)]
    pub max_retries: Option<u32>,

    #[arg(long)]
    pub backoff: Option<u64>,

    #[arg(long)]
    pub timeout: Option<u64>,

    #[arg(long)]
    pub priority: Option<i32>,

    /// User or service registering the job
    #[arg(long)]
    pub created_by: Option<String>,
}

impl AddArgs {
    pub fn schedule(&self) -> anyhow::Result<Schedule> {
        match (&self.cron, self.every, self.at) {
            (Some(expression), None, None) => Ok(Schedule::Cron {
                expression: expression.clone(),
            }),
            (None, Some(every_secs), None) => Ok(Schedule::Interval { every_secs }),
            (None, None, Some(at)) => Ok(Schedule::Once { at }),
            _ => anyhow::bail!("exactly one of --cron, --every or --at is required"),
        }
    }

    /// Build the job, filling unset policy fields from `defaults`.
    pub fn to_new_job(&self, defaults: &JobDefaults) -> anyhow::Result<NewJob> {
        let data = match self.data.as_deref() {
            Some(raw) => serde_json::from_str(raw)?,
            None => serde_json::Value::Null,
        };
        let mut job = NewJob::new(self.name.clone(), self.schedule()?)
            .with_type(self.job_type)
            .with_data(data)
            .with_retries(
                self.max_retries.unwrap_or(defaults.max_retries),
                self.backoff.unwrap_or(defaults.retry_backoff_base_secs),
            )
            .with_timeout(self.timeout.unwrap_or(defaults.timeout_secs))
            .with_priority(self.priority.unwrap_or(defaults.priority));
        job.description = self.description.clone();
        if let Some(created_by) = &self.created_by {
            job = job.with_created_by(created_by.clone());
        }
        Ok(job)
    }
}

pub fn job_filter(state: Option<JobState>, job_type: Option<JobType>, created_by: Option<String>) -> JobFilter {
    JobFilter {
        state,
        job_type,
        created_by,
    }
}
