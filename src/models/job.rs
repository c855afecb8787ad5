//! Job entity model
//!
//! This module contains the SeaORM entity model for the jobs table, plus the
//! typed status and operation values stored in its text columns.

use std::{fmt, str::FromStr};

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Job entity representing one requested file operation
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize)]
#[sea_orm(table_name = "jobs")]
pub struct Model {
    /// Engine-allocated identifier (primary key, never reused while rows exist)
    #[sea_orm(primary_key, auto_increment = false)]
    pub job_id: i64,

    /// Requested operation (copy|move|sync|check|zip)
    pub operation: String,

    /// Source path, possibly `remote:sub/path`
    pub source: String,

    /// Destination path, possibly `remote:sub/path`
    pub destination: String,

    /// Lifecycle status, see [`JobStatus`]
    pub status: String,

    /// Percent complete, 0-100
    pub progress: i32,

    /// Last rendered progress block
    #[sea_orm(column_type = "Text")]
    pub status_text: String,

    /// Trailing window of accumulated error fragments
    #[sea_orm(column_type = "Text")]
    pub error_text: String,

    /// Captured transcript merged from the job's log sidecar
    #[sea_orm(column_type = "Text", nullable)]
    pub log_text: Option<String>,

    /// Process exit code, -1 while unknown
    pub exit_status: i32,

    /// Job that relaunched this one
    pub resumed_by_job_id: Option<i64>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,

    /// Set exactly once, on entering a terminal status
    pub finished_at: Option<DateTimeWithTimeZone>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Parsed status; unknown values read back as `None`.
    pub fn job_status(&self) -> Option<JobStatus> {
        self.status.parse().ok()
    }
}

/// Lifecycle of a job.
///
/// `Pending -> Running -> {Completed, Failed, Cancelled, Interrupted}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Interrupted,
    Resumed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Interrupted => "interrupted",
            JobStatus::Resumed => "resumed",
        }
    }

    /// Terminal statuses carry a `finished_at` timestamp.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Pending | JobStatus::Running)
    }

    /// Statuses from which a job may be relaunched as a new copy job.
    pub fn is_resumable(&self) -> bool {
        matches!(self, JobStatus::Interrupted | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            "interrupted" => Ok(JobStatus::Interrupted),
            "resumed" => Ok(JobStatus::Resumed),
            other => Err(format!("unknown job status '{other}'")),
        }
    }
}

/// File operation requested for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Copy,
    Move,
    Sync,
    Check,
    Zip,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Copy => "copy",
            Operation::Move => "move",
            Operation::Sync => "sync",
            Operation::Check => "check",
            Operation::Zip => "zip",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = EngineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "copy" => Ok(Operation::Copy),
            "move" => Ok(Operation::Move),
            "sync" => Ok(Operation::Sync),
            "check" => Ok(Operation::Check),
            "zip" => Ok(Operation::Zip),
            other => Err(EngineError::InvalidOperation(other.to_string())),
        }
    }
}
