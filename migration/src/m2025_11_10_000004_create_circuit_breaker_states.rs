use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(CircuitBreakerStates::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(CircuitBreakerStates::IntegrationId)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(CircuitBreakerStates::OrgId).uuid().not_null())
                    .col(
                        ColumnDef::new(CircuitBreakerStates::State)
                            .text()
                            .not_null()
                            .default("closed"),
                    )
                    .col(
                        ColumnDef::new(CircuitBreakerStates::ConsecutiveFailures)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(CircuitBreakerStates::OpenedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(CircuitBreakerStates::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(CircuitBreakerStates::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum CircuitBreakerStates {
    Table,
    IntegrationId,
    OrgId,
    State,
    ConsecutiveFailures,
    OpenedAt,
    UpdatedAt,
}
