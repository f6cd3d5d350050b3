use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(HealthRecords::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(HealthRecords::IntegrationId)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(HealthRecords::OrgId).uuid().not_null())
                    .col(
                        ColumnDef::new(HealthRecords::Status)
                            .text()
                            .not_null()
                            .default("unknown"),
                    )
                    .col(
                        ColumnDef::new(HealthRecords::Trend)
                            .text()
                            .not_null()
                            .default("stable"),
                    )
                    .col(
                        ColumnDef::new(HealthRecords::LastSuccessAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(HealthRecords::ConsecutiveFailures)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(HealthRecords::SuccessCount24h)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(HealthRecords::FailureCount24h)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(HealthRecords::SuccessCount7d)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(HealthRecords::FailureCount7d)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(HealthRecords::AvgDurationMs).big_integer().null())
                    .col(ColumnDef::new(HealthRecords::LastError).text().null())
                    .col(
                        ColumnDef::new(HealthRecords::LastErrorAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(HealthRecords::ComputedAt)
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
                    .name("idx_health_records_org_id")
                    .table(HealthRecords::Table)
                    .col(HealthRecords::OrgId)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(HealthRecords::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum HealthRecords {
    Table,
    IntegrationId,
    OrgId,
    Status,
    Trend,
    LastSuccessAt,
    ConsecutiveFailures,
    #[sea_orm(iden = "success_count_24h")]
    SuccessCount24h,
    #[sea_orm(iden = "failure_count_24h")]
    FailureCount24h,
    #[sea_orm(iden = "success_count_7d")]
    SuccessCount7d,
    #[sea_orm(iden = "failure_count_7d")]
    FailureCount7d,
    AvgDurationMs,
    LastError,
    LastErrorAt,
    ComputedAt,
}
