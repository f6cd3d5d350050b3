use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(OAuthSession::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(OAuthSession::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(OAuthSession::OrgId).uuid().not_null())
                    .col(ColumnDef::new(OAuthSession::ProviderType).text().not_null())
                    .col(
                        ColumnDef::new(OAuthSession::State)
                            .string()
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(OAuthSession::Scopes).json_binary().not_null())
                    .col(ColumnDef::new(OAuthSession::CodeVerifier).string().null())
                    .col(
                        ColumnDef::new(OAuthSession::IntegrationName)
                            .text()
                            .not_null(),
                    )
                    .col(ColumnDef::new(OAuthSession::IntegrationId).uuid().null())
                    .col(
                        ColumnDef::new(OAuthSession::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(OAuthSession::ExpiresAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        // Create index on expires_at for cleanup
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_oauth_sessions_expires_at")
                    .table(OAuthSession::Table)
                    .col(OAuthSession::ExpiresAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(OAuthSession::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum OAuthSession {
    #[sea_orm(iden = "oauth_sessions")]
    Table,
    Id,
    OrgId,
    ProviderType,
    State,
    Scopes,
    CodeVerifier,
    IntegrationName,
    IntegrationId,
    CreatedAt,
    ExpiresAt,
}
