use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tickwork_core::{ExecutionId, JobId};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{error::HandlerError, types::JobType};

/// Everything a handler gets for one attempt.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub execution_id: ExecutionId,
    pub job_id: JobId,
    pub attempt: u32,
    /// The job's `job_data` payload.
    pub data: Value,
    /// Fires when the attempt hits its timeout. Handlers should stop
    /// promptly once it does; their result is ignored after that.
    pub cancel: CancellationToken,
}

/// Code that performs one kind of job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run one attempt. `Ok` carries the output recorded on the execution.
    async fn run(&self, ctx: HandlerContext) -> Result<String, HandlerError>;
}

/// One handler per [`JobType`], resolved by an exhaustive match.
#[derive(Clone)]
pub struct HandlerSet {
    email_notification: Arc<dyn JobHandler>,
    data_processing: Arc<dyn JobHandler>,
    report_generation: Arc<dyn JobHandler>,
    cleanup_task: Arc<dyn JobHandler>,
    backup_task: Arc<dyn JobHandler>,
    custom: Arc<dyn JobHandler>,
}

impl HandlerSet {
    /// Use `handler` for every job type.
    pub fn uniform(handler: Arc<dyn JobHandler>) -> Self {
        Self {
            email_notification: handler.clone(),
            data_processing: handler.clone(),
            report_generation: handler.clone(),
            cleanup_task: handler.clone(),
            backup_task: handler.clone(),
            custom: handler,
        }
    }

    /// Replace the handler for one job type.
    pub fn with_handler(mut self, job_type: JobType, handler: Arc<dyn JobHandler>) -> Self {
        *self.slot_mut(job_type) = handler;
        self
    }

    pub fn get(&self, job_type: JobType) -> Arc<dyn JobHandler> {
        match job_type {
            JobType::EmailNotification => self.email_notification.clone(),
            JobType::DataProcessing => self.data_processing.clone(),
            JobType::ReportGeneration => self.report_generation.clone(),
            JobType::CleanupTask => self.cleanup_task.clone(),
            JobType::BackupTask => self.backup_task.clone(),
            JobType::Custom => self.custom.clone(),
        }
    }

    fn slot_mut(&mut self, job_type: JobType) -> &mut Arc<dyn JobHandler> {
        match job_type {
            JobType::EmailNotification => &mut self.email_notification,
            JobType::DataProcessing => &mut self.data_processing,
            JobType::ReportGeneration => &mut self.report_generation,
            JobType::CleanupTask => &mut self.cleanup_task,
            JobType::BackupTask => &mut self.backup_task,
            JobType::Custom => &mut self.custom,
        }
    }
}

impl Default for HandlerSet {
    /// The built-in handlers, which simulate their work.
    fn default() -> Self {
        Self {
            email_notification: Arc::new(EmailNotification),
            data_processing: Arc::new(DataProcessing),
            report_generation: Arc::new(ReportGeneration),
            cleanup_task: Arc::new(CleanupTask),
            backup_task: Arc::new(BackupTask),
            custom: Arc::new(CustomJob),
        }
    }
}

fn str_field<'a>(data: &'a Value, key: &str, default: &'a str) -> &'a str {
    data.get(key).and_then(Value::as_str).unwrap_or(default)
}

fn u64_field(data: &Value, key: &str, default: u64) -> u64 {
    data.get(key).and_then(Value::as_u64).unwrap_or(default)
}

/// Sleep for `work`, giving up early if the attempt is cancelled.
async fn simulate(cancel: &CancellationToken, work: Duration) -> Result<(), HandlerError> {
    tokio::select! {
        _ = tokio::time::sleep(work) => Ok(()),
        _ = cancel.cancelled() => Err(HandlerError::Cancelled),
    }
}

pub struct EmailNotification;

#[async_trait]
impl JobHandler for EmailNotification {
    async fn run(&self, ctx: HandlerContext) -> Result<String, HandlerError> {
        let recipient = str_field(&ctx.data, "recipient", "user@example.com");
        let subject = str_field(&ctx.data, "subject", "Notification");
        info!(job_id = %ctx.job_id, recipient, subject, "sending email");
        simulate(&ctx.cancel, Duration::from_secs(1)).await?;
        Ok(format!("Email sent to {recipient}"))
    }
}

pub struct DataProcessing;

#[async_trait]
impl JobHandler for DataProcessing {
    async fn run(&self, ctx: HandlerContext) -> Result<String, HandlerError> {
        let dataset = str_field(&ctx.data, "dataset", "default_dataset");
        let operation = str_field(&ctx.data, "operation", "analyze");
        let records = ctx
            .data
            .get("parameters")
            .map_or(1_000, |p| u64_field(p, "record_count", 1_000));
        info!(job_id = %ctx.job_id, dataset, operation, records, "processing dataset");
        // one second per thousand records, at most ten
        simulate(&ctx.cancel, Duration::from_millis(records.min(10_000))).await?;
        Ok(format!("Processed {records} records from {dataset}"))
    }
}

pub struct ReportGeneration;

#[async_trait]
impl JobHandler for ReportGeneration {
    async fn run(&self, ctx: HandlerContext) -> Result<String, HandlerError> {
        let report_type = str_field(&ctx.data, "report_type", "summary");
        let date_range = str_field(&ctx.data, "date_range", "last_week");
        let format = str_field(&ctx.data, "format", "pdf");
        info!(job_id = %ctx.job_id, report_type, date_range, format, "generating report");
        simulate(&ctx.cancel, Duration::from_secs(2)).await?;
        Ok(format!("Report generated: /reports/{report_type}_{date_range}.{format}"))
    }
}

pub struct CleanupTask;

#[async_trait]
impl JobHandler for CleanupTask {
    async fn run(&self, ctx: HandlerContext) -> Result<String, HandlerError> {
        let cleanup_type = str_field(&ctx.data, "cleanup_type", "temp_files");
        let retention_days = u64_field(&ctx.data, "retention_days", 7);
        info!(job_id = %ctx.job_id, cleanup_type, retention_days, "running cleanup");
        simulate(&ctx.cancel, Duration::from_secs(1)).await?;
        let files = u64_field(&ctx.data, "estimated_files", 100);
        let freed_mb = u64_field(&ctx.data, "estimated_space_mb", 500);
        Ok(format!("Cleanup completed: {files} files removed, {freed_mb}MB freed"))
    }
}

pub struct BackupTask;

#[async_trait]
impl JobHandler for BackupTask {
    async fn run(&self, ctx: HandlerContext) -> Result<String, HandlerError> {
        let backup_type = str_field(&ctx.data, "backup_type", "database");
        let destination = str_field(&ctx.data, "destination", "s3://backups/");
        info!(job_id = %ctx.job_id, backup_type, destination, "running backup");
        simulate(&ctx.cancel, Duration::from_secs(3)).await?;
        Ok(format!(
            "Backup completed: {backup_type}_backup_{} stored at {destination}",
            ctx.execution_id
        ))
    }
}

pub struct CustomJob;

#[async_trait]
impl JobHandler for CustomJob {
    async fn run(&self, ctx: HandlerContext) -> Result<String, HandlerError> {
        let operation = str_field(&ctx.data, "operation", "default");
        let secs = ctx
            .data
            .get("parameters")
            .map_or(1, |p| u64_field(p, "duration", 1))
            .min(30);
        info!(job_id = %ctx.job_id, operation, "running custom job");
        simulate(&ctx.cancel, Duration::from_secs(secs)).await?;
        Ok(format!("Custom job completed: {operation}"))
    }
}
