//! `transferd` command-line entry point.
//!
//! Every invocation loads configuration and applies migrations. Commands that
//! change jobs also run startup recovery first; `list` and `show` only read,
//! so a job another invocation is running is reported untouched. Job records
//! are printed to stdout as JSON; logs go to stderr.

use std::future::Future;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use transferd::{
    config::ConfigLoader,
    coordinator::{JobManager, JobRequest},
    db,
    error::EngineError,
    models::{JobStatus, job::Model as JobModel},
    remote::RcloneCli,
    telemetry,
};

/// Supervised, resumable file transfer jobs.
#[derive(Parser, Debug)]
#[command(name = "transferd", version, about = "Supervised file transfer jobs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start a job and follow it to completion (Ctrl-C stops it).
    Run {
        /// copy, move, sync, check or zip.
        operation: String,
        source: String,
        destination: String,
        /// Follow symlinks instead of copying them as links.
        #[arg(long)]
        follow_symlinks: bool,
    },

    /// List jobs, newest first.
    List {
        #[arg(long)]
        status: Option<JobStatus>,
        #[arg(long)]
        limit: Option<u64>,
        #[arg(long)]
        offset: Option<u64>,
    },

    /// Show one job.
    Show { job_id: i64 },

    /// Relaunch an interrupted or failed job as a new copy job and follow it.
    Resume { job_id: i64 },

    /// Delete a job.
    Delete { job_id: i64 },

    /// Delete every job that is not running.
    Clear,

    /// Only run startup recovery and report what was repaired.
    Recover,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let config = ConfigLoader::new()
        .load()
        .context("loading configuration")?;
    telemetry::init_tracing(&config)?;
    tracing::debug!(config = %config.redacted_json().unwrap_or_default(), "Configuration loaded");

    let db = db::connect(&config).await?;
    db::health_check(&db).await?;
    let remote = Arc::new(RcloneCli::from_config(&config.engine));
    let manager = match cli.command {
        Commands::List { .. } | Commands::Show { .. } => {
            JobManager::attach(db, remote, config.engine.clone()).await?
        }
        _ => JobManager::open(db, remote, config.engine.clone()).await?,
    };
    let manager = Arc::new(manager);

    match cli.command {
        Commands::Run {
            operation,
            source,
            destination,
            follow_symlinks,
        } => {
            let request = JobRequest {
                operation,
                source,
                destination,
                follow_symlinks,
            };
            with_reconciler(&manager, follow(&manager, manager.start_job(request))).await
        }
        Commands::Resume { job_id } => {
            with_reconciler(&manager, follow(&manager, manager.resume_job(job_id))).await
        }
        Commands::List {
            status,
            limit,
            offset,
        } => {
            let jobs = manager.list_jobs(status, limit, offset).await?;
            println!("{}", serde_json::to_string_pretty(&jobs)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Show { job_id } => {
            let job = manager.job_status(job_id).await?;
            println!("{}", serde_json::to_string_pretty(&job)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Delete { job_id } => {
            manager.delete_job(job_id).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Clear => {
            let removed = manager.clear_stopped_jobs().await?;
            println!("{}", serde_json::to_string(&removed)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Recover => {
            println!(
                "{}",
                serde_json::to_string_pretty(manager.startup_report())?
            );
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Run `work` with the background reconciler alive.
async fn with_reconciler<F>(manager: &Arc<JobManager>, work: F) -> Result<ExitCode>
where
    F: Future<Output = Result<ExitCode>>,
{
    let shutdown = CancellationToken::new();
    let reconciler = {
        let manager = Arc::clone(manager);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { manager.run(shutdown).await })
    };

    let outcome = work.await;

    shutdown.cancel();
    if let Err(err) = reconciler.await {
        tracing::warn!(error = %err, "Reconciler task ended abnormally");
    }
    outcome
}

/// Wait for `start` to yield a job id, then poll the job until it is
/// terminal. Ctrl-C stops the job, including while `start` is still waiting
/// on a directory rename.
async fn follow<S>(manager: &JobManager, start: S) -> Result<ExitCode>
where
    S: Future<Output = Result<i64, EngineError>>,
{
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    tokio::pin!(start);
    let mut stopping = false;
    let mut last_progress = -1;

    let job_id = loop {
        tokio::select! {
            started = &mut start => break started?,
            _ = &mut ctrl_c, if !stopping => {
                eprintln!("stopping");
                stopping = true;
                manager.stop_all();
            }
        }
    };

    // Interrupted before the process existed.
    if stopping {
        manager.stop_job(job_id).await?;
    }

    let job: JobModel = loop {
        let job = manager.job_status(job_id).await?;
        if job.job_status().is_some_and(|s| s.is_terminal()) {
            break job;
        }

        if job.progress != last_progress {
            eprintln!("job {job_id}: {}%", job.progress);
            last_progress = job.progress;
        }

        tokio::select! {
            _ = &mut ctrl_c, if !stopping => {
                eprintln!("job {job_id}: stopping");
                stopping = true;
                manager.stop_job(job_id).await?;
            }
            _ = tokio::time::sleep(std::time::Duration::from_millis(500)) => {}
        }
    };

    println!("{}", serde_json::to_string_pretty(&job)?);

    Ok(match job.job_status() {
        Some(JobStatus::Completed) => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    })
}
