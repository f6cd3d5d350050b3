//! Migration to create the sync_logs table.
//!
//! Sync logs are append-only; health windows are computed from their
//! `finished_at` timestamps.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SyncLogs::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(SyncLogs::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(SyncLogs::IntegrationId).uuid().not_null())
                    .col(ColumnDef::new(SyncLogs::OrgId).uuid().not_null())
                    .col(ColumnDef::new(SyncLogs::SyncType).text().not_null())
                    .col(ColumnDef::new(SyncLogs::Status).text().not_null())
                    .col(
                        ColumnDef::new(SyncLogs::StartedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SyncLogs::FinishedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SyncLogs::DurationMs)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(SyncLogs::RecordsProcessed)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(SyncLogs::Attempts)
                            .integer()
                            .not_null()
                            .default(1),
                    )
                    .col(ColumnDef::new(SyncLogs::ErrorKind).text().null())
                    .col(ColumnDef::new(SyncLogs::ErrorDetail).json_binary().null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_sync_logs_integration_finished")
                    .table(SyncLogs::Table)
                    .col(SyncLogs::IntegrationId)
                    .col(SyncLogs::FinishedAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_sync_logs_org_status")
                    .table(SyncLogs::Table)
                    .col(SyncLogs::OrgId)
                    .col(SyncLogs::Status)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(SyncLogs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum SyncLogs {
    Table,
    Id,
    IntegrationId,
    OrgId,
    SyncType,
    Status,
    StartedAt,
    FinishedAt,
    DurationMs,
    RecordsProcessed,
    Attempts,
    ErrorKind,
    ErrorDetail,
}
