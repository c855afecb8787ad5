//! Migration to create the jobs table.
//!
//! One row per requested transfer operation. Identifiers are allocated by the
//! engine rather than the database, so the primary key is not auto-incremented.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Jobs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Jobs::JobId)
                            .big_integer()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Jobs::Operation).text().not_null())
                    .col(ColumnDef::new(Jobs::Source).text().not_null())
                    .col(ColumnDef::new(Jobs::Destination).text().not_null())
                    .col(
                        ColumnDef::new(Jobs::Status)
                            .text()
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(Jobs::Progress)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Jobs::StatusText)
                            .text()
                            .not_null()
                            .default(""),
                    )
                    .col(
                        ColumnDef::new(Jobs::ErrorText)
                            .text()
                            .not_null()
                            .default(""),
                    )
                    .col(ColumnDef::new(Jobs::LogText).text().null())
                    .col(
                        ColumnDef::new(Jobs::ExitStatus)
                            .integer()
                            .not_null()
                            .default(-1),
                    )
                    .col(ColumnDef::new(Jobs::ResumedByJobId).big_integer().null())
                    .col(
                        ColumnDef::new(Jobs::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Jobs::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Jobs::FinishedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_jobs_status")
                    .table(Jobs::Table)
                    .col(Jobs::Status)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_jobs_status").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(Jobs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Jobs {
    Table,
    JobId,
    Operation,
    Source,
    Destination,
    Status,
    Progress,
    StatusText,
    ErrorText,
    LogText,
    ExitStatus,
    ResumedByJobId,
    CreatedAt,
    UpdatedAt,
    FinishedAt,
}
