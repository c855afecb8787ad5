//! # Job Lifecycle Coordinator
//!
//! [`JobManager`] glues the plan resolver, the process supervisor and the job
//! store together. It allocates job identifiers, mirrors live supervisor state
//! into persisted rows, finalizes each job exactly once (whether the caller or
//! the background reconciler observes the exit first) and repairs rows left
//! behind by a previous run.

use std::path::Path;
use std::sync::Arc;

use metrics::{counter, gauge};
use sea_orm::DatabaseConnection;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, truncate_tail};
use crate::models::job::Model as JobModel;
use crate::models::{JobStatus, Operation};
use crate::plan::{
    DestinationState, PlanAction, PlanRequest, ProbeResult, TransferPlan, probe, resolve,
};
use crate::progress::{ParsedLine, ProgressState, parse_line};
use crate::remote::RemoteFs;
use crate::repositories::{JobRepository, LiveFields, TerminalFields};
use crate::supervisor::{JobSnapshot, Supervisor, SupervisorSettings};

const MAX_ALLOCATION_ATTEMPTS: usize = 3;

/// A caller's request for a new job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    pub operation: String,
    pub source: String,
    pub destination: String,
    pub follow_symlinks: bool,
}

impl JobRequest {
    pub fn new(
        operation: impl Into<String>,
        source: impl Into<String>,
        destination: impl Into<String>,
    ) -> Self {
        Self {
            operation: operation.into(),
            source: source.into(),
            destination: destination.into(),
            follow_symlinks: false,
        }
    }
}

/// Rows repaired when the manager was opened.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Jobs that were `running` when the previous process went away.
    pub interrupted: Vec<i64>,
    /// Jobs that were created but never launched.
    pub abandoned: Vec<i64>,
}

/// Whether a manager may repair rows it does not supervise itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Runs startup recovery and interrupts running rows with no process.
    Owner,
    /// Reports stored rows as they are; another process may own them.
    Observer,
}

/// Owns the supervisor and the id counter; the only entry point for callers.
pub struct JobManager {
    mode: OpenMode,
    repo: JobRepository,
    supervisor: Arc<Supervisor>,
    remote: Arc<dyn RemoteFs>,
    engine: EngineConfig,
    next_job_id: Mutex<i64>,
    startup: RecoveryReport,
}

impl JobManager {
    /// Open the manager over an already-migrated database. Jobs left
    /// `running` or `pending` by a previous process are marked interrupted
    /// and the id counter starts after the highest stored id.
    pub async fn open(
        db: DatabaseConnection,
        remote: Arc<dyn RemoteFs>,
        engine: EngineConfig,
    ) -> Result<Self, EngineError> {
        Self::open_with(OpenMode::Owner, db, remote, engine).await
    }

    /// Open without recovery, for callers that only read. Jobs another
    /// process is running are reported from the store and never repaired.
    pub async fn attach(
        db: DatabaseConnection,
        remote: Arc<dyn RemoteFs>,
        engine: EngineConfig,
    ) -> Result<Self, EngineError> {
        Self::open_with(OpenMode::Observer, db, remote, engine).await
    }

    async fn open_with(
        mode: OpenMode,
        db: DatabaseConnection,
        remote: Arc<dyn RemoteFs>,
        engine: EngineConfig,
    ) -> Result<Self, EngineError> {
        let supervisor = Arc::new(Supervisor::new(SupervisorSettings::from_config(&engine)));
        let mut manager = Self {
            mode,
            repo: JobRepository::new(db),
            supervisor,
            remote,
            engine,
            next_job_id: Mutex::new(1),
            startup: RecoveryReport::default(),
        };

        if mode == OpenMode::Owner {
            manager.startup = manager.recover().await?;
        }
        let first = manager.first_free_id().await?;
        *manager.next_job_id.lock().await = first;

        info!(
            mode = ?mode,
            next_job_id = first,
            interrupted = manager.startup.interrupted.len(),
            abandoned = manager.startup.abandoned.len(),
            "Job manager ready"
        );

        Ok(manager)
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn startup_report(&self) -> &RecoveryReport {
        &self.startup
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn repository(&self) -> &JobRepository {
        &self.repo
    }

    async fn recover(&self) -> Result<RecoveryReport, EngineError> {
        let mut report = RecoveryReport::default();

        for job_id in self.repo.ids_with_status(JobStatus::Running).await? {
            if self.repo.interrupt(job_id, JobStatus::Running).await? {
                info!(job_id, "Job left running by a previous process marked interrupted");
                report.interrupted.push(job_id);
            }
        }

        for job_id in self.repo.ids_with_status(JobStatus::Pending).await? {
            let conflict = EngineError::RecoveryConflict {
                job_id,
                details: "job was created but its process was never launched".to_string(),
            };
            warn!(job_id, error = %conflict, "Pending job found at startup");
            if self.repo.interrupt(job_id, JobStatus::Pending).await? {
                report.abandoned.push(job_id);
            }
        }

        Ok(report)
    }

    async fn first_free_id(&self) -> Result<i64, EngineError> {
        let stored = self.repo.max_job_id().await?.unwrap_or(0);
        let tracked = self.supervisor.tracked_ids().last().copied().unwrap_or(0);
        Ok(stored.max(tracked) + 1)
    }

    /// Probe the endpoints when the operation needs it and resolve the plan.
    pub async fn plan(
        &self,
        operation: Operation,
        source: &str,
        destination: &str,
        follow_symlinks: bool,
    ) -> Result<TransferPlan, EngineError> {
        let probed = match operation {
            Operation::Copy | Operation::Move => {
                probe(self.remote.as_ref(), source, destination).await?
            }
            Operation::Sync | Operation::Check | Operation::Zip => ProbeResult {
                source_is_dir: false,
                destination_state: DestinationState::Unknown,
            },
        };

        Ok(resolve(&PlanRequest {
            operation,
            source: source.to_string(),
            destination: destination.to_string(),
            source_is_dir: probed.source_is_dir,
            follow_symlinks,
            destination_state: probed.destination_state,
        }))
    }

    /// Start a job and return its identifier once the process is launched.
    ///
    /// Directory renames wait here for the transfer to end so the emptied
    /// source can be removed after a verified exit 0.
    #[instrument(skip(self, request), fields(operation = %request.operation))]
    pub async fn start_job(&self, request: JobRequest) -> Result<i64, EngineError> {
        let started = self.try_start(request).await;
        if let Err(err) = &started {
            if err.is_rejection() {
                info!(code = err.code(), error = %err, "Job request rejected");
            } else {
                warn!(code = err.code(), error = %err, "Job could not be started");
            }
        }
        started
    }

    async fn try_start(&self, request: JobRequest) -> Result<i64, EngineError> {
        let operation: Operation = request.operation.parse()?;
        let plan = self
            .plan(
                operation,
                &request.source,
                &request.destination,
                request.follow_symlinks,
            )
            .await?;

        let job_id = self
            .create_record(operation, &request.source, &request.destination)
            .await?;
        self.launch(job_id, &plan).await?;

        if !plan.post_actions.is_empty() {
            self.wait_and_clean_up(job_id, &plan.post_actions).await;
            self.job_status(job_id).await?;
        }

        Ok(job_id)
    }

    async fn create_record(
        &self,
        operation: Operation,
        source: &str,
        destination: &str,
    ) -> Result<i64, EngineError> {
        let mut next = self.next_job_id.lock().await;

        for attempt in 1..=MAX_ALLOCATION_ATTEMPTS {
            let job_id = *next;
            *next += 1;

            match self.repo.create(job_id, operation, source, destination).await {
                Ok(_) => return Ok(job_id),
                Err(EngineError::DuplicateJob(taken)) if attempt < MAX_ALLOCATION_ATTEMPTS => {
                    warn!(job_id = taken, "Identifier already stored; resynchronising counter");
                    *next = self.first_free_id().await?;
                }
                Err(err) => return Err(err),
            }
        }

        Err(EngineError::DuplicateJob(*next - 1))
    }

    async fn launch(&self, job_id: i64, plan: &TransferPlan) -> Result<(), EngineError> {
        for action in &plan.pre_actions {
            let PlanAction::CreateDir(path) = action else {
                continue;
            };
            if let Err(err) = self.remote.mkdir(path).await {
                warn!(job_id, path = %path, error = %err, "Could not pre-create destination; continuing");
            }
        }

        let command = plan.command_line(&self.engine, job_id);
        if let Err(err) = self
            .supervisor
            .start(&command, &self.engine.tool_env(), job_id)
        {
            let terminal = TerminalFields {
                status: JobStatus::Failed,
                progress: 0,
                status_text: String::new(),
                error_text: err.to_string(),
                exit_status: -1,
                log_text: None,
            };
            self.repo
                .finalize(job_id, JobStatus::Pending, &terminal)
                .await?;
            return Err(err);
        }

        self.repo.mark_running(job_id).await?;
        counter!("transfer_jobs_started_total").increment(1);
        self.update_running_gauge();

        info!(
            job_id,
            subcommand = %plan.invocation.subcommand,
            args = ?plan.invocation.args,
            "Job started"
        );
        Ok(())
    }

    async fn wait_and_clean_up(&self, job_id: i64, actions: &[PlanAction]) {
        let snapshot = loop {
            match self.supervisor.snapshot(job_id) {
                Some(snapshot) if snapshot.finished => break Some(snapshot),
                Some(_) => tokio::time::sleep(self.engine.poll_interval()).await,
                None => break None,
            }
        };

        let Some(snapshot) = snapshot else {
            warn!(job_id, "Job deleted before source cleanup could run");
            return;
        };

        if snapshot.stopped || snapshot.exit_status != 0 {
            info!(
                job_id,
                exit_status = snapshot.exit_status,
                stopped = snapshot.stopped,
                "Transfer did not succeed; source left in place"
            );
            return;
        }

        for action in actions {
            if let PlanAction::RemoveEmptyDir(path) = action {
                match self.remote.rmdir(path).await {
                    Ok(()) => info!(job_id, path = %path, "Removed emptied source directory"),
                    Err(err) => {
                        warn!(job_id, path = %path, error = %err, "Could not remove source directory")
                    }
                }
            }
        }
    }

    /// Read-only projection of a job, with live supervisor fields merged in
    /// while it runs.
    #[instrument(skip(self))]
    pub async fn job_status(&self, job_id: i64) -> Result<JobModel, EngineError> {
        let job = self.repo.require(job_id).await?;
        if job.job_status() == Some(JobStatus::Running) {
            return self.reconcile(job).await;
        }
        Ok(job)
    }

    async fn reconcile(&self, mut job: JobModel) -> Result<JobModel, EngineError> {
        let job_id = job.job_id;

        match self.supervisor.snapshot(job_id) {
            None if self.mode == OpenMode::Observer => {
                debug!(job_id, "Running job is not supervised here; reporting stored state");
                Ok(job)
            }
            None => {
                let conflict = EngineError::RecoveryConflict {
                    job_id,
                    details: "stored as running but no process is supervised".to_string(),
                };
                warn!(job_id, error = %conflict, "Marking unsupervised job interrupted");
                self.repo.interrupt(job_id, JobStatus::Running).await?;
                self.repo.require(job_id).await
            }
            Some(snapshot) if !snapshot.finished => {
                let live = LiveFields {
                    progress: snapshot.percent,
                    status_text: snapshot.text,
                    error_text: snapshot.error_text,
                };
                self.repo.update_live(job_id, &live).await?;

                job.progress = job.progress.max(live.progress);
                job.status_text = live.status_text;
                job.error_text = live.error_text;
                Ok(job)
            }
            Some(snapshot) => {
                self.finalize(job_id, &snapshot).await?;
                self.repo.require(job_id).await
            }
        }
    }

    /// Persist the terminal state of a finished process. Shared by caller
    /// polls and the background reconciler; only the first caller wins.
    async fn finalize(&self, job_id: i64, snapshot: &JobSnapshot) -> Result<bool, EngineError> {
        let status = if snapshot.stopped {
            JobStatus::Cancelled
        } else if snapshot.exit_status == 0 {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        };

        let sidecar = self.engine.log_sidecar(job_id);
        let log_text = match &sidecar {
            Some(path) => read_sidecar(job_id, path).await,
            None => None,
        };

        // With a log file the tool writes its errors there instead of stderr.
        let error_text = match &log_text {
            Some(log) if snapshot.error_text.is_empty() && status == JobStatus::Failed => {
                error_lines(log, self.engine.error_text_cap)
            }
            _ => snapshot.error_text.clone(),
        };

        if status == JobStatus::Failed {
            let err = EngineError::ExternalToolError {
                exit_status: snapshot.exit_status,
                message: truncate_tail(error_text.trim_end(), 500).to_string(),
            };
            warn!(job_id, error = %err, "Transfer failed");
        }

        let terminal = TerminalFields {
            status,
            progress: 100,
            status_text: snapshot.text.clone(),
            error_text,
            exit_status: snapshot.exit_status,
            log_text,
        };

        let won = self
            .repo
            .finalize(job_id, JobStatus::Running, &terminal)
            .await?;

        if won {
            counter!("transfer_jobs_finished_total", "status" => status.as_str()).increment(1);
            self.update_running_gauge();
            info!(job_id, status = %status, exit_status = snapshot.exit_status, "Job finished");

            if let Some(path) = &sidecar {
                remove_sidecar(job_id, path).await;
            }
        } else {
            debug!(job_id, "Job already finalized elsewhere");
        }

        Ok(won)
    }

    /// Mirror or finalize every running job this manager supervises. Rows
    /// owned by other processes are left alone.
    pub async fn reconcile_running(&self) -> Result<(), EngineError> {
        for job_id in self.repo.ids_with_status(JobStatus::Running).await? {
            if !self.supervisor.is_tracked(job_id) {
                continue;
            }
            let Some(job) = self.repo.get(job_id).await? else {
                continue;
            };
            if job.job_status() != Some(JobStatus::Running) {
                continue;
            }
            match self.reconcile(job).await {
                Ok(_) | Err(EngineError::JobNotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// List jobs newest first after bringing running rows up to date.
    pub async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: Option<u64>,
        offset: Option<u64>,
    ) -> Result<Vec<JobModel>, EngineError> {
        self.reconcile_running().await?;
        self.repo.list(status, limit, offset).await
    }

    /// Request cooperative cancellation. Idempotent; returns immediately.
    #[instrument(skip(self))]
    pub async fn stop_job(&self, job_id: i64) -> Result<(), EngineError> {
        let job = self.repo.require(job_id).await?;
        if !self.supervisor.stop(job_id) {
            debug!(job_id, status = %job.status, "No supervised process to stop");
        }
        Ok(())
    }

    /// Stop every process this manager still supervises, returning their ids.
    pub fn stop_all(&self) -> Vec<i64> {
        let running = self.supervisor.get_running_jobs();
        for job_id in &running {
            self.supervisor.stop(*job_id);
        }
        if !running.is_empty() {
            info!(jobs = ?running, "Stop requested for all supervised jobs");
        }
        running
    }

    /// Relaunch an interrupted or failed job as a new copy job.
    #[instrument(skip(self))]
    pub async fn resume_job(&self, job_id: i64) -> Result<i64, EngineError> {
        let job = self.repo.require(job_id).await?;
        let resumable = job.job_status().is_some_and(|s| s.is_resumable())
            && job.resumed_by_job_id.is_none();
        if !resumable {
            return Err(EngineError::NotResumable {
                job_id,
                status: job.status,
            });
        }

        let new_job_id = self
            .start_job(JobRequest::new(
                Operation::Copy.as_str(),
                job.source,
                job.destination,
            ))
            .await?;

        if self.repo.link_resume(job_id, new_job_id).await? {
            info!(job_id, new_job_id, "Job resumed");
        } else {
            warn!(
                job_id,
                new_job_id, "Job was resumed concurrently; new job left unlinked"
            );
        }

        Ok(new_job_id)
    }

    /// Remove a job from the supervisor and the store, stopping it first.
    #[instrument(skip(self))]
    pub async fn delete_job(&self, job_id: i64) -> Result<(), EngineError> {
        let tracked = self.supervisor.stop(job_id);
        self.supervisor.delete(job_id);
        let stored = self.repo.delete(job_id).await?;

        if !tracked && !stored {
            return Err(EngineError::JobNotFound(job_id));
        }

        if let Some(path) = self.engine.log_sidecar(job_id) {
            remove_sidecar(job_id, &path).await;
        }
        self.update_running_gauge();
        info!(job_id, "Job deleted");
        Ok(())
    }

    /// Delete every job that is not running and restart the id counter
    /// after the highest identifier still in use.
    #[instrument(skip(self))]
    pub async fn clear_stopped_jobs(&self) -> Result<Vec<i64>, EngineError> {
        let mut next = self.next_job_id.lock().await;

        let removed = self.repo.delete_stopped().await?;
        for job_id in &removed {
            self.supervisor.delete(*job_id);
        }

        *next = self.first_free_id().await?;
        info!(removed = removed.len(), next_job_id = *next, "Cleared stopped jobs");
        Ok(removed)
    }

    /// Poll until the job reaches a terminal status.
    pub async fn wait_for_terminal(&self, job_id: i64) -> Result<JobModel, EngineError> {
        loop {
            let job = self.job_status(job_id).await?;
            if job.job_status().is_some_and(|s| s.is_terminal()) {
                return Ok(job);
            }
            tokio::time::sleep(self.engine.poll_interval()).await;
        }
    }

    /// Background reconciler: finalizes finished jobs without caller polls.
    #[instrument(skip_all)]
    pub async fn run(&self, shutdown: CancellationToken) {
        info!("Starting job reconciler");
        let mut ticker = tokio::time::interval(self.engine.reconcile_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Job reconciler shutdown requested");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.reconcile_running().await {
                        error!(error = ?err, "Reconcile tick failed");
                    }
                }
            }
        }
    }

    fn update_running_gauge(&self) {
        gauge!("transfer_jobs_running").set(self.supervisor.get_running_jobs().len() as f64);
    }
}

async fn read_sidecar(job_id: i64, path: &Path) -> Option<String> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
        Err(err) => {
            warn!(job_id, path = %path.display(), error = %err, "Could not read log sidecar");
            None
        }
    }
}

async fn remove_sidecar(job_id: i64, path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(job_id, path = %path.display(), "Log sidecar removed"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(job_id, path = %path.display(), error = %err, "Could not remove log sidecar"),
    }
}

/// Error lines of a captured transcript, trailing `cap` characters.
fn error_lines(log: &str, cap: usize) -> String {
    let mut state = ProgressState::new(cap);
    for line in log.lines() {
        if let Some(ParsedLine::ErrorFragment(fragment)) = parse_line(line) {
            state.push_error(&fragment);
        }
    }
    state.error_text().to_string()
}
