//! Migration to create the integrations table.
//!
//! Integrations are organization-scoped connections to external providers.
//! Credentials live only in the sealed `config_ciphertext` column.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Integrations::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Integrations::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Integrations::OrgId).uuid().not_null())
                    .col(ColumnDef::new(Integrations::ProviderType).text().not_null())
                    .col(ColumnDef::new(Integrations::Name).text().not_null())
                    .col(
                        ColumnDef::new(Integrations::ConfigCiphertext)
                            .binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Integrations::Status)
                            .text()
                            .not_null()
                            .default("active"),
                    )
                    .col(
                        ColumnDef::new(Integrations::SyncIntervalSeconds)
                            .big_integer()
                            .null(),
                    )
                    .col(ColumnDef::new(Integrations::RetryPolicy).json_binary().null())
                    .col(
                        ColumnDef::new(Integrations::TokenExpiresAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Integrations::LockExpiresAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Integrations::LastSyncAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(Integrations::LastError).text().null())
                    .col(
                        ColumnDef::new(Integrations::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Integrations::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_integrations_org_id")
                    .table(Integrations::Table)
                    .col(Integrations::OrgId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_integrations_status")
                    .table(Integrations::Table)
                    .col(Integrations::Status)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Integrations::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Integrations {
    Table,
    Id,
    OrgId,
    ProviderType,
    Name,
    ConfigCiphertext,
    Status,
    SyncIntervalSeconds,
    RetryPolicy,
    TokenExpiresAt,
    LockExpiresAt,
    LastSyncAt,
    LastError,
    CreatedAt,
    UpdatedAt,
}
