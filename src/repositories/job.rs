//! # Job Repository
//!
//! Repository operations for the jobs table. Status transitions that must
//! happen exactly once are written as conditional `UPDATE ... WHERE status = ?`
//! statements, and the affected row count tells the caller whether it won.

use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set,
};

use crate::error::{EngineError, is_unique_violation, map_db_err};
use crate::models::job::{ActiveModel, Column, Entity, Model};
use crate::models::{JobStatus, Operation};

/// Fields mirrored from the supervisor while a job runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveFields {
    pub progress: i32,
    pub status_text: String,
    pub error_text: String,
}

/// Fields written once when a job enters a terminal status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalFields {
    pub status: JobStatus,
    pub progress: i32,
    pub status_text: String,
    pub error_text: String,
    pub exit_status: i32,
    pub log_text: Option<String>,
}

/// Repository for job database operations
#[derive(Clone)]
pub struct JobRepository {
    db: DatabaseConnection,
}

impl JobRepository {
    /// Create a new JobRepository with the given database connection
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Insert a new pending job under an engine-allocated identifier.
    pub async fn create(
        &self,
        job_id: i64,
        operation: Operation,
        source: &str,
        destination: &str,
    ) -> Result<Model, EngineError> {
        let now = Utc::now().fixed_offset();

        let job = ActiveModel {
            job_id: Set(job_id),
            operation: Set(operation.as_str().to_string()),
            source: Set(source.to_string()),
            destination: Set(destination.to_string()),
            status: Set(JobStatus::Pending.as_str().to_string()),
            progress: Set(0),
            status_text: Set(String::new()),
            error_text: Set(String::new()),
            log_text: Set(None),
            exit_status: Set(-1),
            resumed_by_job_id: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
            finished_at: Set(None),
        };

        let result = job.insert(&self.db).await.map_err(|e| {
            if is_unique_violation(&e) {
                EngineError::DuplicateJob(job_id)
            } else {
                map_db_err("failed to create job", e)
            }
        })?;

        tracing::debug!(job_id, operation = %operation, "Job record created");

        Ok(result)
    }

    /// Find a job by identifier.
    pub async fn get(&self, job_id: i64) -> Result<Option<Model>, EngineError> {
        Entity::find_by_id(job_id)
            .one(&self.db)
            .await
            .map_err(|e| map_db_err("failed to find job", e))
    }

    /// Find a job by identifier, failing with `JobNotFound` when absent.
    pub async fn require(&self, job_id: i64) -> Result<Model, EngineError> {
        self.get(job_id)
            .await?
            .ok_or(EngineError::JobNotFound(job_id))
    }

    /// List jobs, newest first, with optional status filter and paging.
    pub async fn list(
        &self,
        status: Option<JobStatus>,
        limit: Option<u64>,
        offset: Option<u64>,
    ) -> Result<Vec<Model>, EngineError> {
        let mut query = Entity::find().order_by_desc(Column::JobId);

        if let Some(status_filter) = status {
            query = query.filter(Column::Status.eq(status_filter.as_str()));
        }

        let results = if let Some(limit_value) = limit {
            query
                .offset(offset.unwrap_or(0))
                .limit(limit_value)
                .all(&self.db)
                .await
        } else {
            query.offset(offset).all(&self.db).await
        };

        results.map_err(|e| map_db_err("failed to list jobs", e))
    }

    /// Identifiers of every job currently persisted with `status`.
    pub async fn ids_with_status(&self, status: JobStatus) -> Result<Vec<i64>, EngineError> {
        Entity::find()
            .select_only()
            .column(Column::JobId)
            .filter(Column::Status.eq(status.as_str()))
            .order_by_asc(Column::JobId)
            .into_tuple::<i64>()
            .all(&self.db)
            .await
            .map_err(|e| map_db_err("failed to list job ids by status", e))
    }

    /// Highest persisted identifier, `None` for an empty store.
    pub async fn max_job_id(&self) -> Result<Option<i64>, EngineError> {
        let max = Entity::find()
            .select_only()
            .column_as(Column::JobId.max(), "max_job_id")
            .into_tuple::<Option<i64>>()
            .one(&self.db)
            .await
            .map_err(|e| map_db_err("failed to read max job id", e))?;

        Ok(max.flatten())
    }

    /// `pending -> running`. Returns false when the job was not pending.
    pub async fn mark_running(&self, job_id: i64) -> Result<bool, EngineError> {
        let result = Entity::update_many()
            .col_expr(Column::Status, Expr::value(JobStatus::Running.as_str()))
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now().fixed_offset()))
            .filter(Column::JobId.eq(job_id))
            .filter(Column::Status.eq(JobStatus::Pending.as_str()))
            .exec(&self.db)
            .await
            .map_err(|e| map_db_err("failed to mark job running", e))?;

        Ok(result.rows_affected == 1)
    }

    /// Mirror live supervisor fields into a running job. Progress is only
    /// ever raised, never lowered.
    pub async fn update_live(&self, job_id: i64, live: &LiveFields) -> Result<(), EngineError> {
        let now = Utc::now().fixed_offset();

        Entity::update_many()
            .col_expr(Column::StatusText, Expr::value(live.status_text.clone()))
            .col_expr(Column::ErrorText, Expr::value(live.error_text.clone()))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::JobId.eq(job_id))
            .filter(Column::Status.eq(JobStatus::Running.as_str()))
            .exec(&self.db)
            .await
            .map_err(|e| map_db_err("failed to mirror live job fields", e))?;

        Entity::update_many()
            .col_expr(Column::Progress, Expr::value(live.progress))
            .filter(Column::JobId.eq(job_id))
            .filter(Column::Status.eq(JobStatus::Running.as_str()))
            .filter(Column::Progress.lt(live.progress))
            .exec(&self.db)
            .await
            .map_err(|e| map_db_err("failed to raise job progress", e))?;

        Ok(())
    }

    /// Move a job from `from` into a terminal status, setting `finished_at`.
    /// Returns true only for the single call that performed the transition.
    pub async fn finalize(
        &self,
        job_id: i64,
        from: JobStatus,
        terminal: &TerminalFields,
    ) -> Result<bool, EngineError> {
        debug_assert!(terminal.status.is_terminal());
        let now = Utc::now().fixed_offset();

        let mut update = Entity::update_many()
            .col_expr(Column::Status, Expr::value(terminal.status.as_str()))
            .col_expr(Column::Progress, Expr::value(terminal.progress))
            .col_expr(Column::StatusText, Expr::value(terminal.status_text.clone()))
            .col_expr(Column::ErrorText, Expr::value(terminal.error_text.clone()))
            .col_expr(Column::ExitStatus, Expr::value(terminal.exit_status))
            .col_expr(Column::FinishedAt, Expr::value(now))
            .col_expr(Column::UpdatedAt, Expr::value(now));

        if let Some(log_text) = &terminal.log_text {
            update = update.col_expr(Column::LogText, Expr::value(log_text.clone()));
        }

        let result = update
            .filter(Column::JobId.eq(job_id))
            .filter(Column::Status.eq(from.as_str()))
            .exec(&self.db)
            .await
            .map_err(|e| map_db_err("failed to finalize job", e))?;

        Ok(result.rows_affected == 1)
    }

    /// Mark a job left in `from` by a previous run as interrupted.
    pub async fn interrupt(&self, job_id: i64, from: JobStatus) -> Result<bool, EngineError> {
        let now = Utc::now().fixed_offset();

        let result = Entity::update_many()
            .col_expr(Column::Status, Expr::value(JobStatus::Interrupted.as_str()))
            .col_expr(Column::FinishedAt, Expr::value(now))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::JobId.eq(job_id))
            .filter(Column::Status.eq(from.as_str()))
            .exec(&self.db)
            .await
            .map_err(|e| map_db_err("failed to mark job interrupted", e))?;

        Ok(result.rows_affected == 1)
    }

    /// Record that `original` was relaunched as `resumed_by`. Only applies to
    /// interrupted or failed jobs that have not been linked before.
    pub async fn link_resume(&self, original: i64, resumed_by: i64) -> Result<bool, EngineError> {
        let result = Entity::update_many()
            .col_expr(Column::ResumedByJobId, Expr::value(resumed_by))
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now().fixed_offset()))
            .filter(Column::JobId.eq(original))
            .filter(Column::ResumedByJobId.is_null())
            .filter(Column::Status.is_in([
                JobStatus::Interrupted.as_str(),
                JobStatus::Failed.as_str(),
            ]))
            .exec(&self.db)
            .await
            .map_err(|e| map_db_err("failed to link resumed job", e))?;

        Ok(result.rows_affected == 1)
    }

    /// Delete one job. Returns false when it did not exist.
    pub async fn delete(&self, job_id: i64) -> Result<bool, EngineError> {
        let result = Entity::delete_by_id(job_id)
            .exec(&self.db)
            .await
            .map_err(|e| map_db_err("failed to delete job", e))?;

        Ok(result.rows_affected == 1)
    }

    /// Delete every job that is neither running nor about to run, returning
    /// the removed identifiers.
    pub async fn delete_stopped(&self) -> Result<Vec<i64>, EngineError> {
        let active = [JobStatus::Pending.as_str(), JobStatus::Running.as_str()];

        let ids = Entity::find()
            .select_only()
            .column(Column::JobId)
            .filter(Column::Status.is_not_in(active))
            .into_tuple::<i64>()
            .all(&self.db)
            .await
            .map_err(|e| map_db_err("failed to list stopped jobs", e))?;

        if ids.is_empty() {
            return Ok(ids);
        }

        Entity::delete_many()
            .filter(Column::JobId.is_in(ids.clone()))
            .exec(&self.db)
            .await
            .map_err(|e| map_db_err("failed to delete stopped jobs", e))?;

        Ok(ids)
    }
}
