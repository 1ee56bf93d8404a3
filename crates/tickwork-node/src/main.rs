use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tickwork_core::JobId;
use tickwork_scheduler::{db, SchedulerHandle};
use tracing::info;

mod cli;
mod node;

use cli::{Args, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tickwork_node=info,tickwork_scheduler=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    // load config: --config > TICKWORK_CONFIG env > ~/.tickwork/tickwork.toml
    let config_path = args.config.clone().or_else(|| std::env::var("TICKWORK_CONFIG").ok());
    let config = tickwork_core::TickworkConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        tickwork_core::TickworkConfig::default()
    });

    let db_path = &config.database.path;
    ensure_parent_dir(db_path)?;
    info!(path = %db_path, "opening SQLite database");

    // the handle runs the idempotent schema setup before anything else opens the file
    let handle = SchedulerHandle::new(db::open(db_path, config.database.busy_timeout_ms)?, &config)?;

    match args.command {
        Command::Run { role } => {
            let node = node::Node::start(&config, role, handle.metrics())?;
            tokio::signal::ctrl_c().await?;
            info!("shutdown requested");
            node.stop().await;
        }
        Command::Add(add) => {
            let job = handle.create_job(add.to_new_job(&config.defaults)?)?;
            print_json(&job)?;
        }
        Command::List {
            state,
            job_type,
            created_by,
            page,
        } => {
            let jobs = handle.list_jobs(&cli::job_filter(state, job_type, created_by), (&page).into())?;
            print_json(&jobs)?;
        }
        Command::Executions { job_id, page } => {
            let executions = handle.list_executions(&JobId::from(job_id), (&page).into())?;
            print_json(&executions)?;
        }
        Command::Pause { job_id } => {
            let id = JobId::from(job_id);
            let job = handle.get_job(&id)?;
            handle.pause_job(&id, job.version)?;
            print_json(&handle.get_job(&id)?)?;
        }
        Command::Resume { job_id } => {
            let id = JobId::from(job_id);
            let job = handle.get_job(&id)?;
            handle.resume_job(&id, job.version)?;
            print_json(&handle.get_job(&id)?)?;
        }
        Command::Delete { job_id } => {
            let id = JobId::from(job_id);
            let job = handle.get_job(&id)?;
            handle.delete_job(&id, job.version)?;
            print_json(&handle.get_job(&id)?)?;
        }
        Command::Status => {
            print_json(&handle.monitoring_snapshot().await?)?;
        }
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn ensure_parent_dir(path: &str) -> anyhow::Result<()> {
    match std::path::Path::new(path).parent() {
        Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent)
            .with_context(|| format!("cannot create database directory {}", parent.display())),
        _ => Ok(()),
    }
}
