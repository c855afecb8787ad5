//! # Transfer Plan Resolver
//!
//! Maps a requested operation onto a concrete tool invocation using
//! rsync-style trailing-slash conventions:
//!
//! - `copy /src/dir /dst` with `/dst` an existing directory copies the
//!   directory itself, landing at `/dst/dir`.
//! - `copy /src/dir/ /dst` copies the contents of `/src/dir` into `/dst`.
//! - a missing destination without a trailing slash is a rename target.
//!
//! [`resolve`] is a pure function of its [`PlanRequest`]. The filesystem facts
//! it needs (is the source a directory, what is at the destination) are
//! gathered beforehand by [`probe`], one parent listing per path.

use std::fmt;
use std::path::PathBuf;

use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::models::Operation;
use crate::remote::RemoteFs;

/// What was found at the destination path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationState {
    Missing,
    File,
    Directory,
    /// Not probed, or the probe could not tell.
    Unknown,
}

/// Inputs to [`resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanRequest {
    pub operation: Operation,
    pub source: String,
    pub destination: String,
    pub source_is_dir: bool,
    pub follow_symlinks: bool,
    pub destination_state: DestinationState,
}

/// Sub-commands a plan can invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subcommand {
    Copy,
    CopyTo,
    Move,
    MoveTo,
    Sync,
    Check,
    /// Runs the archiver rather than the transfer tool.
    Zip,
}

impl Subcommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Subcommand::Copy => "copy",
            Subcommand::CopyTo => "copyto",
            Subcommand::Move => "move",
            Subcommand::MoveTo => "moveto",
            Subcommand::Sync => "sync",
            Subcommand::Check => "check",
            Subcommand::Zip => "zip",
        }
    }
}

impl fmt::Display for Subcommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub subcommand: Subcommand,
    pub args: Vec<String>,
}

/// Side effect run around the invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanAction {
    /// Best-effort `mkdir` before the transfer starts.
    CreateDir(String),
    /// `rmdir` after a verified exit 0; never recursive.
    RemoveEmptyDir(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferPlan {
    pub invocation: Invocation,
    pub pre_actions: Vec<PlanAction>,
    pub post_actions: Vec<PlanAction>,
}

impl TransferPlan {
    fn simple(subcommand: Subcommand, args: Vec<String>) -> Self {
        Self {
            invocation: Invocation { subcommand, args },
            pre_actions: Vec::new(),
            post_actions: Vec::new(),
        }
    }

    /// Full argv for the supervisor, including progress and sidecar flags.
    pub fn command_line(&self, engine: &EngineConfig, job_id: i64) -> Vec<String> {
        if self.invocation.subcommand == Subcommand::Zip {
            let mut argv = vec![engine.archiver_path.clone()];
            argv.extend(self.invocation.args.iter().cloned());
            return argv;
        }

        let mut argv = vec![
            engine.tool_path.clone(),
            self.invocation.subcommand.as_str().to_string(),
        ];
        argv.extend(self.invocation.args.iter().cloned());
        argv.extend([
            "--progress".to_string(),
            "--stats".to_string(),
            engine.stats_interval.clone(),
        ]);

        if let Some(sidecar) = engine.log_sidecar(job_id) {
            argv.extend([
                "--log-file".to_string(),
                path_arg(sidecar),
                "--log-level".to_string(),
                "INFO".to_string(),
            ]);
        }

        argv
    }
}

fn path_arg(path: PathBuf) -> String {
    path.to_string_lossy().into_owned()
}

/// Decide the invocation for `request`. Identical requests always produce
/// identical plans.
pub fn resolve(request: &PlanRequest) -> TransferPlan {
    let source = request.source.as_str();
    let destination = request.destination.as_str();

    let mut plan = match request.operation {
        Operation::Sync => TransferPlan::simple(Subcommand::Sync, verbatim(source, destination)),
        Operation::Check => TransferPlan::simple(Subcommand::Check, verbatim(source, destination)),
        Operation::Zip => {
            return TransferPlan::simple(
                Subcommand::Zip,
                vec![
                    "-r".to_string(),
                    "-q".to_string(),
                    destination.to_string(),
                    source.to_string(),
                ],
            );
        }
        Operation::Copy => resolve_transfer(request, Subcommand::Copy, Subcommand::CopyTo),
        Operation::Move => resolve_transfer(request, Subcommand::Move, Subcommand::MoveTo),
    };

    if request.follow_symlinks {
        plan.invocation.args.push("--copy-links".to_string());
    }

    plan
}

fn resolve_transfer(
    request: &PlanRequest,
    recursive: Subcommand,
    single: Subcommand,
) -> TransferPlan {
    let source = request.source.as_str();
    let destination = request.destination.as_str();
    let source_slash = has_trailing_slash(source);
    let destination_slash = has_trailing_slash(destination);
    let name = basename(source);
    let directory_itself = request.source_is_dir && !source_slash && !name.is_empty();

    if !destination_slash {
        match request.destination_state {
            DestinationState::File => {
                return TransferPlan::simple(single, verbatim(source, destination));
            }
            DestinationState::Directory if directory_itself => {
                return into_named_directory(recursive, source, destination, name);
            }
            DestinationState::Missing if !request.source_is_dir => {
                return TransferPlan::simple(single, verbatim(source, destination));
            }
            DestinationState::Missing if directory_itself => {
                let mut plan = TransferPlan::simple(
                    recursive,
                    vec![with_trailing_slash(source), with_trailing_slash(destination)],
                );
                plan.pre_actions
                    .push(PlanAction::CreateDir(destination.to_string()));
                if recursive == Subcommand::Move {
                    plan.post_actions
                        .push(PlanAction::RemoveEmptyDir(source.to_string()));
                }
                return plan;
            }
            _ => {}
        }
    }

    if directory_itself && destination_slash {
        return into_named_directory(recursive, source, destination, name);
    }

    TransferPlan::simple(recursive, verbatim(source, destination))
}

fn into_named_directory(
    recursive: Subcommand,
    source: &str,
    destination: &str,
    name: &str,
) -> TransferPlan {
    let target = join(destination, name);
    let mut plan = TransferPlan::simple(
        recursive,
        vec![with_trailing_slash(source), with_trailing_slash(&target)],
    );
    plan.pre_actions.push(PlanAction::CreateDir(target));
    plan
}

fn verbatim(source: &str, destination: &str) -> Vec<String> {
    vec![source.to_string(), destination.to_string()]
}

/// Trailing slashes are significant and read before any normalization.
pub fn has_trailing_slash(path: &str) -> bool {
    path.ends_with('/')
}

pub fn with_trailing_slash(path: &str) -> String {
    if has_trailing_slash(path) {
        path.to_string()
    } else {
        format!("{path}/")
    }
}

/// Final path component. For `remote:name` the part after the colon; empty
/// for a bare remote root such as `remote:`.
pub fn basename(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(idx) => &trimmed[idx + 1..],
        None => match trimmed.find(':') {
            Some(idx) => &trimmed[idx + 1..],
            None => trimmed,
        },
    }
}

/// Directory containing `path`, in a form the tool can list.
pub fn parent(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => "/".to_string(),
        Some(idx) => {
            let head = &trimmed[..idx];
            if head.ends_with(':') {
                format!("{head}/")
            } else {
                head.to_string()
            }
        }
        None => match trimmed.find(':') {
            Some(idx) => trimmed[..=idx].to_string(),
            None => ".".to_string(),
        },
    }
}

pub fn join(base: &str, name: &str) -> String {
    if base.ends_with('/') || base.ends_with(':') {
        format!("{base}{name}")
    } else {
        format!("{base}/{name}")
    }
}

/// Filesystem facts needed by [`resolve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeResult {
    pub source_is_dir: bool,
    pub destination_state: DestinationState,
}

/// Look up the source and, when it has no trailing slash, the destination
/// with one parent listing each.
///
/// Listing failures other than a timeout degrade to "not found": a missing
/// parent means a missing path, and a broken tool will surface again when
/// the transfer itself is launched.
pub async fn probe(
    fs: &dyn RemoteFs,
    source: &str,
    destination: &str,
) -> Result<ProbeResult, EngineError> {
    let source_is_dir = if has_trailing_slash(source) || basename(source).is_empty() {
        true
    } else {
        match lookup(fs, source).await? {
            Some(entry_is_dir) => entry_is_dir,
            None => false,
        }
    };

    let destination_state = if has_trailing_slash(destination) || basename(destination).is_empty()
    {
        DestinationState::Unknown
    } else {
        match lookup(fs, destination).await? {
            Some(true) => DestinationState::Directory,
            Some(false) => DestinationState::File,
            None => DestinationState::Missing,
        }
    };

    debug!(
        source,
        destination,
        source_is_dir,
        destination_state = ?destination_state,
        "Probed transfer endpoints"
    );

    Ok(ProbeResult {
        source_is_dir,
        destination_state,
    })
}

/// `Some(is_dir)` when `path` exists in its parent's listing.
async fn lookup(fs: &dyn RemoteFs, path: &str) -> Result<Option<bool>, EngineError> {
    let name = basename(path);
    let dir = parent(path);

    match fs.list(&dir).await {
        Ok(entries) => Ok(entries
            .into_iter()
            .find(|entry| entry.name == name)
            .map(|entry| entry.is_dir)),
        Err(err @ EngineError::Timeout { .. }) => Err(err),
        Err(err) => {
            warn!(path, parent = %dir, error = %err, "Listing failed; treating path as missing");
            Ok(None)
        }
    }
}
