//! # Error Handling
//!
//! Unified error taxonomy for the job orchestration engine. Every variant maps
//! to a stable SCREAMING_SNAKE_CASE code so callers can branch on the kind
//! without matching on message text.

use thiserror::Error;

/// Errors surfaced by the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The external process could not be started.
    #[error("failed to launch process for job {job_id}: {message}")]
    LaunchFailure { job_id: i64, message: String },

    /// Unsupported operation value; a contract error, never defaulted.
    #[error("invalid operation '{0}'")]
    InvalidOperation(String),

    /// The job identifier is already tracked by the supervisor.
    #[error("job {0} is already tracked")]
    DuplicateJob(i64),

    /// The external tool exited non-zero.
    #[error("external tool exited with status {exit_status}: {message}")]
    ExternalToolError { exit_status: i32, message: String },

    /// A bounded metadata query exceeded its deadline.
    #[error("{what} timed out after {timeout_ms}ms")]
    Timeout { what: String, timeout_ms: u64 },

    /// Unexpected state found while reconciling persisted jobs.
    #[error("recovery conflict for job {job_id}: {details}")]
    RecoveryConflict { job_id: i64, details: String },

    #[error("job {0} not found")]
    JobNotFound(i64),

    /// Only interrupted or failed jobs without an existing resume link can be resumed.
    #[error("job {job_id} cannot be resumed from status '{status}'")]
    NotResumable { job_id: i64, status: String },

    #[error("database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Get the error code string for this error kind.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::LaunchFailure { .. } => "LAUNCH_FAILURE",
            EngineError::InvalidOperation(_) => "INVALID_OPERATION",
            EngineError::DuplicateJob(_) => "DUPLICATE_JOB",
            EngineError::ExternalToolError { .. } => "EXTERNAL_TOOL_ERROR",
            EngineError::Timeout { .. } => "TIMEOUT",
            EngineError::RecoveryConflict { .. } => "RECOVERY_CONFLICT",
            EngineError::JobNotFound(_) => "NOT_FOUND",
            EngineError::NotResumable { .. } => "NOT_RESUMABLE",
            EngineError::Database(_) => "DATABASE_ERROR",
            EngineError::Io(_) => "IO_ERROR",
        }
    }

    /// Whether the error was raised before any process was started.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            EngineError::InvalidOperation(_)
                | EngineError::DuplicateJob(_)
                | EngineError::NotResumable { .. }
                | EngineError::JobNotFound(_)
        )
    }
}

/// Map a database error with context, logging the underlying cause.
pub fn map_db_err(context: &'static str, err: sea_orm::DbErr) -> EngineError {
    tracing::error!(error = ?err, context, "Database operation failed");
    EngineError::Database(err)
}

/// Detect primary-key collisions across the supported SQL backends.
pub fn is_unique_violation(error: &sea_orm::DbErr) -> bool {
    use sea_orm::RuntimeErr;

    const PG_UNIQUE: &str = "23505";
    const SQLITE_DUPLICATE_CODES: &[&str] = &["1555", "2067"];

    let runtime_err = match error {
        sea_orm::DbErr::Query(RuntimeErr::SqlxError(sqlx_err))
        | sea_orm::DbErr::Exec(RuntimeErr::SqlxError(sqlx_err)) => sqlx_err,
        _ => return false,
    };

    let Some(db_error) = runtime_err.as_database_error() else {
        return false;
    };

    if db_error.is_unique_violation() {
        return true;
    }

    db_error
        .code()
        .map(|code| code.as_ref() == PG_UNIQUE || SQLITE_DUPLICATE_CODES.contains(&code.as_ref()))
        .unwrap_or(false)
}

/// Keep at most the trailing `max_chars` characters of `text`, cutting on a
/// character boundary.
pub fn truncate_tail(text: &str, max_chars: usize) -> &str {
    let total = text.chars().count();
    if total <= max_chars {
        return text;
    }
    let skip = total - max_chars;
    match text.char_indices().nth(skip) {
        Some((idx, _)) => &text[idx..],
        None => "",
    }
}
