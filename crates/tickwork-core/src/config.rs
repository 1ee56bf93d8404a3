use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::types::NodeId;

pub const DEFAULT_LEASE_NAME: &str = "dispatch";
pub const DEFAULT_LEASE_TTL_SECS: u64 = 15;
pub const DEFAULT_RENEW_INTERVAL_SECS: u64 = 5; // must stay well below the TTL
pub const DEFAULT_MAX_RENEW_FAILURES: u32 = 3;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 2;
pub const DEFAULT_BATCH_LIMIT: u32 = 100;

/// Top-level config (tickwork.toml + TICKWORK_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TickworkConfig {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub lease: LeaseConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub defaults: JobDefaults,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Stable process identity. A random one is generated when unset, which
    /// is fine for workers but makes lease ownership harder to read in logs.
    pub id: Option<String>,
}

impl NodeConfig {
    pub fn node_id(&self) -> NodeId {
        match self.id.as_deref() {
            Some(id) if !id.trim().is_empty() => NodeId::from(id.trim()),
            _ => NodeId::generate(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    /// SQLite busy timeout; several processes share one database file.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

/// Leadership lease settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseConfig {
    /// Fixed coordinator name: the key of the singleton lease record.
    #[serde(default = "default_lease_name")]
    pub name: String,
    #[serde(default = "default_lease_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_renew_interval_secs")]
    pub renew_interval_secs: u64,
    /// How often a follower retries acquisition.
    #[serde(default = "default_renew_interval_secs")]
    pub retry_interval_secs: u64,
    /// Consecutive renewal failures before the leader steps down.
    #[serde(default = "default_max_renew_failures")]
    pub max_renew_failures: u32,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            name: default_lease_name(),
            ttl_secs: DEFAULT_LEASE_TTL_SECS,
            renew_interval_secs: DEFAULT_RENEW_INTERVAL_SECS,
            retry_interval_secs: DEFAULT_RENEW_INTERVAL_SECS,
            max_renew_failures: DEFAULT_MAX_RENEW_FAILURES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Maximum jobs claimed per poll.
    #[serde(default = "default_batch_limit")]
    pub batch_limit: u32,
    /// Slack added to a job's timeout before a `running` execution whose
    /// worker went silent is expired to `timed_out`.
    #[serde(default = "default_stall_grace_secs")]
    pub stall_grace_secs: u64,
    /// Age after which a still-`queued` execution is re-enqueued.
    #[serde(default = "default_orphan_after_secs")]
    pub orphan_after_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            batch_limit: DEFAULT_BATCH_LIMIT,
            stall_grace_secs: default_stall_grace_secs(),
            orphan_after_secs: default_orphan_after_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Concurrent handler slots in this process.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Sleep between queue polls when the queue is empty.
    #[serde(default = "default_worker_poll_ms")]
    pub poll_interval_ms: u64,
    /// A dequeued message that is not acked within this window is redelivered.
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            poll_interval_ms: default_worker_poll_ms(),
            visibility_timeout_secs: default_visibility_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Ceiling for the exponential retry backoff.
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_backoff_secs: default_max_backoff_secs(),
        }
    }
}

/// Execution-policy values applied when a job is created without them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefaults {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_secs")]
    pub retry_backoff_base_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_priority")]
    pub priority: i32,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_backoff_base_secs: default_backoff_base_secs(),
            timeout_secs: default_timeout_secs(),
            priority: default_priority(),
        }
    }
}

fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.tickwork/tickwork.db", home)
}
fn default_busy_timeout_ms() -> u64 {
    5_000
}
fn default_lease_name() -> String {
    DEFAULT_LEASE_NAME.to_string()
}
fn default_lease_ttl_secs() -> u64 {
    DEFAULT_LEASE_TTL_SECS
}
fn default_renew_interval_secs() -> u64 {
    DEFAULT_RENEW_INTERVAL_SECS
}
fn default_max_renew_failures() -> u32 {
    DEFAULT_MAX_RENEW_FAILURES
}
fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}
fn default_batch_limit() -> u32 {
    DEFAULT_BATCH_LIMIT
}
fn default_stall_grace_secs() -> u64 {
    30
}
fn default_orphan_after_secs() -> u64 {
    120
}
fn default_concurrency() -> usize {
    4
}
fn default_worker_poll_ms() -> u64 {
    500
}
fn default_visibility_timeout_secs() -> u64 {
    300
}
fn default_max_backoff_secs() -> u64 {
    3_600
}
fn default_max_retries() -> u32 {
    3
}
fn default_backoff_base_secs() -> u64 {
    60
}
fn default_timeout_secs() -> u64 {
    3_600
}
fn default_priority() -> i32 {
    5
}

impl TickworkConfig {
    /// Load config from a TOML file with TICKWORK_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.tickwork/tickwork.toml
    ///
    /// A missing file is not an error: every section has defaults.
    /// Nested keys are separated by a double underscore in env vars,
    /// e.g. `TICKWORK_DISPATCH__BATCH_LIMIT=50`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: TickworkConfig = Figment::from(Serialized::defaults(TickworkConfig::default()))
            .merge(Toml::file(&path))
            .merge(Env::prefixed("TICKWORK_").split("__"))
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would break the leadership protocol.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.lease.renew_interval_secs == 0 || self.lease.ttl_secs == 0 {
            return Err(crate::error::CoreError::Config(
                "lease.ttl_secs and lease.renew_interval_secs must be positive".into(),
            ));
        }
        if self.lease.renew_interval_secs >= self.lease.ttl_secs {
            return Err(crate::error::CoreError::Config(format!(
                "lease.renew_interval_secs ({}) must be shorter than lease.ttl_secs ({})",
                self.lease.renew_interval_secs, self.lease.ttl_secs
            )));
        }
        if self.worker.concurrency == 0 {
            return Err(crate::error::CoreError::Config(
                "worker.concurrency must be at least 1".into(),
            ));
        }
        if self.dispatch.batch_limit == 0 {
            return Err(crate::error::CoreError::Config(
                "dispatch.batch_limit must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.tickwork/tickwork.toml", home)
}
