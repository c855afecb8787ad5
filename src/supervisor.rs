//! # Process Supervisor
//!
//! Owns one external process per job. Each started job gets two reader tasks
//! (stdout and stderr) feeding a [`ProgressState`], plus a liveness poll task
//! that owns the child, reacts to stop requests and records the exit status.
//! Callers only ever see snapshots; nothing here blocks on the process.

use std::{
    collections::{BTreeMap, HashMap},
    process::Stdio,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use metrics::counter;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::progress::ProgressState;

/// Point-in-time view of one supervised job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSnapshot {
    pub percent: i32,
    pub text: String,
    pub error_text: String,
    pub exit_status: i32,
    pub finished: bool,
    pub stopped: bool,
}

#[derive(Debug)]
struct LiveState {
    progress: ProgressState,
    exit_status: i32,
    finished: bool,
    stopped: bool,
}

#[derive(Debug)]
struct TrackedJob {
    state: Mutex<LiveState>,
    stop: CancellationToken,
}

impl TrackedJob {
    fn new(error_cap: usize) -> Self {
        Self {
            state: Mutex::new(LiveState {
                progress: ProgressState::new(error_cap),
                exit_status: -1,
                finished: false,
                stopped: false,
            }),
            stop: CancellationToken::new(),
        }
    }

    fn snapshot(&self) -> JobSnapshot {
        let state = lock_unpoisoned(&self.state);
        JobSnapshot {
            percent: state.progress.percent(),
            text: state.progress.render(),
            error_text: state.progress.error_text().to_string(),
            exit_status: state.exit_status,
            finished: state.finished,
            stopped: state.stopped,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

/// Supervisor timing and sizing knobs.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub poll_interval: Duration,
    pub drain_timeout: Duration,
    /// Time between the termination signal and a forced kill.
    pub stop_grace: Duration,
    pub error_cap: usize,
}

impl SupervisorSettings {
    pub fn from_config(engine: &EngineConfig) -> Self {
        Self {
            poll_interval: engine.poll_interval(),
            drain_timeout: engine.reader_drain_timeout(),
            stop_grace: engine.stop_grace(),
            error_cap: engine.error_text_cap,
        }
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

/// Mutex-guarded table of supervised jobs.
#[derive(Debug)]
pub struct Supervisor {
    jobs: Mutex<HashMap<i64, Arc<TrackedJob>>>,
    settings: SupervisorSettings,
}

impl Supervisor {
    pub fn new(settings: SupervisorSettings) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            settings,
        }
    }

    /// Launch `command` for `job_id` and return immediately.
    ///
    /// A process that cannot be spawned is not an error here: the job is
    /// recorded as finished with exit status -1 and the launch message as its
    /// error text.
    pub fn start(
        &self,
        command: &[String],
        env: &BTreeMap<String, String>,
        job_id: i64,
    ) -> Result<(), EngineError> {
        let tracked = {
            let mut jobs = lock_unpoisoned(&self.jobs);
            if jobs.contains_key(&job_id) {
                return Err(EngineError::DuplicateJob(job_id));
            }
            let tracked = Arc::new(TrackedJob::new(self.settings.error_cap));
            jobs.insert(job_id, Arc::clone(&tracked));
            tracked
        };

        let child = match spawn(command, env) {
            Ok(child) => child,
            Err(message) => {
                let err = EngineError::LaunchFailure { job_id, message };
                warn!(job_id, error = %err, "Failed to launch transfer process");
                counter!("transfer_job_launch_failures_total").increment(1);

                let mut state = lock_unpoisoned(&tracked.state);
                state.progress.push_error(&err.to_string());
                state.exit_status = -1;
                state.finished = true;
                return Ok(());
            }
        };

        info!(job_id, program = %command[0], "Transfer process started");
        self.supervise(job_id, child, tracked);
        Ok(())
    }

    fn supervise(&self, job_id: i64, mut child: Child, tracked: Arc<TrackedJob>) {
        let mut readers: Vec<JoinHandle<()>> = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(read_lines(
                job_id,
                stdout,
                Stream::Stdout,
                Arc::clone(&tracked),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(read_lines(
                job_id,
                stderr,
                Stream::Stderr,
                Arc::clone(&tracked),
            )));
        }

        let poll_interval = self.settings.poll_interval;
        let drain_timeout = self.settings.drain_timeout;
        let stop_grace = self.settings.stop_grace;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            let mut kill_at: Option<Instant> = None;
            let mut killed = false;

            let code = loop {
                tokio::select! {
                    _ = tracked.stop.cancelled(), if kill_at.is_none() => {
                        kill_at = Some(Instant::now() + stop_grace);
                        if let Err(err) = terminate(&child) {
                            warn!(job_id, error = %err, "Failed to signal transfer process");
                        }
                    }
                    _ = ticker.tick() => {
                        match child.try_wait() {
                            Ok(Some(status)) => break status.code(),
                            Ok(None) => {}
                            Err(err) => {
                                warn!(job_id, error = %err, "Failed to poll transfer process");
                                break None;
                            }
                        }

                        if !killed && kill_at.is_some_and(|deadline| Instant::now() >= deadline) {
                            killed = true;
                            warn!(job_id, grace_ms = stop_grace.as_millis() as u64, "Transfer process ignored termination; killing");
                            if let Err(err) = child.start_kill() {
                                warn!(job_id, error = %err, "Failed to kill transfer process");
                            }
                        }
                    }
                }
            };

            let aborts: Vec<_> = readers.iter().map(|h| h.abort_handle()).collect();
            let drain = async {
                for reader in readers {
                    let _ = reader.await;
                }
            };
            if tokio::time::timeout(drain_timeout, drain).await.is_err() {
                warn!(job_id, "Output readers did not drain after exit");
                for abort in aborts {
                    abort.abort();
                }
            }

            let mut state = lock_unpoisoned(&tracked.state);
            state.exit_status = code.unwrap_or(-1);
            state.progress.finish();
            state.finished = true;
            info!(
                job_id,
                exit_status = state.exit_status,
                stopped = state.stopped,
                "Transfer process exited"
            );
        });
    }

    fn tracked(&self, job_id: i64) -> Option<Arc<TrackedJob>> {
        lock_unpoisoned(&self.jobs).get(&job_id).cloned()
    }

    /// Consistent view of every live field, `None` when untracked.
    pub fn snapshot(&self, job_id: i64) -> Option<JobSnapshot> {
        self.tracked(job_id).map(|job| job.snapshot())
    }

    pub fn get_percent(&self, job_id: i64) -> i32 {
        self.snapshot(job_id).map(|s| s.percent).unwrap_or(0)
    }

    pub fn get_text(&self, job_id: i64) -> String {
        self.snapshot(job_id).map(|s| s.text).unwrap_or_default()
    }

    pub fn get_error_text(&self, job_id: i64) -> String {
        self.snapshot(job_id)
            .map(|s| s.error_text)
            .unwrap_or_default()
    }

    pub fn get_exit_status(&self, job_id: i64) -> i32 {
        self.snapshot(job_id).map(|s| s.exit_status).unwrap_or(-1)
    }

    pub fn is_finished(&self, job_id: i64) -> bool {
        self.snapshot(job_id).map(|s| s.finished).unwrap_or(false)
    }

    pub fn is_stopped(&self, job_id: i64) -> bool {
        self.snapshot(job_id).map(|s| s.stopped).unwrap_or(false)
    }

    pub fn is_tracked(&self, job_id: i64) -> bool {
        lock_unpoisoned(&self.jobs).contains_key(&job_id)
    }

    /// Request cooperative termination. Idempotent and non-blocking; a job
    /// that already exited keeps its own outcome.
    pub fn stop(&self, job_id: i64) -> bool {
        let Some(job) = self.tracked(job_id) else {
            return false;
        };

        {
            let mut state = lock_unpoisoned(&job.state);
            if state.finished || state.stopped {
                return true;
            }
            state.stopped = true;
        }

        debug!(job_id, "Stop requested");
        job.stop.cancel();
        true
    }

    /// Forget a job. A process still running is signalled first.
    pub fn delete(&self, job_id: i64) {
        let removed = lock_unpoisoned(&self.jobs).remove(&job_id);
        if let Some(job) = removed {
            if !lock_unpoisoned(&job.state).finished {
                job.stop.cancel();
            }
            debug!(job_id, "Supervisor entry removed");
        }
    }

    /// Jobs whose process has not been observed to exit, ascending.
    pub fn get_running_jobs(&self) -> Vec<i64> {
        let jobs = lock_unpoisoned(&self.jobs);
        let mut running: Vec<i64> = jobs
            .iter()
            .filter(|(_, job)| !lock_unpoisoned(&job.state).finished)
            .map(|(id, _)| *id)
            .collect();
        running.sort_unstable();
        running
    }

    /// Every tracked identifier, finished or not.
    pub fn tracked_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = lock_unpoisoned(&self.jobs).keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

fn spawn(command: &[String], env: &BTreeMap<String, String>) -> Result<Child, String> {
    let Some((program, args)) = command.split_first() else {
        return Err("empty command line".to_string());
    };

    Command::new(program)
        .args(args)
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| format!("{program}: {err}"))
}

/// Ask the child to exit so the tool can clean up partial transfers.
#[cfg(unix)]
fn terminate(child: &Child) -> std::io::Result<()> {
    // Already reaped.
    let Some(pid) = child.id() else {
        return Ok(());
    };
    let pid = libc::pid_t::try_from(pid).map_err(std::io::Error::other)?;

    // SAFETY: `pid` is our own child and has not been reaped yet, so it
    // cannot have been recycled for another process.
    if unsafe { libc::kill(pid, libc::SIGTERM) } == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn terminate(child: &Child) -> std::io::Result<()> {
    // No graceful signal here; the grace period ends in `start_kill`.
    let _ = child;
    Ok(())
}

async fn read_lines<R>(job_id: i64, stream: R, kind: Stream, job: Arc<TrackedJob>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::with_capacity(256);

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let applied = lock_unpoisoned(&job.state).progress.ingest(&line);
                if !applied && matches!(kind, Stream::Stderr) {
                    debug!(job_id, line = %line.trim_end(), "Unclassified stderr line");
                }
            }
            Err(err) => {
                warn!(job_id, stream = ?kind, error = %err, "Output reader failed");
                break;
            }
        }
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
