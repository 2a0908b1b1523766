use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Enable foreign keys for SQLite
        if manager.get_database_backend() == sea_orm::DatabaseBackend::Sqlite {
            manager
                .get_connection()
                .execute_unprepared("PRAGMA foreign_keys = ON")
                .await?;
        }

        // Create users table
        manager
            .create_table(
                Table::create()
                    .table(Users::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Users::Subject)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Users::Email).string().not_null().unique_key())
                    .col(string(Users::PasswordHash))
                    .col(big_integer(Users::CreatedAt))
                    .col(
                        ColumnDef::new(Users::Enabled)
                            .big_integer()
                            .not_null()
                            .default(1),
                    )
                    .to_owned(),
            )
            .await?;

        // Create sessions table
        manager
            .create_table(
                Table::create()
                    .table(Sessions::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Sessions::SessionId)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(string(Sessions::Subject))
                    .col(big_integer(Sessions::CreatedAt))
                    .col(big_integer(Sessions::ExpiresAt))
                    .col(string_null(Sessions::UserAgent))
                    .col(string_null(Sessions::IpAddress))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_sessions_expires_at")
                    .table(Sessions::Table)
                    .col(Sessions::ExpiresAt)
                    .to_owned(),
            )
            .await?;

        // Create provider_tokens table (linked Git provider access tokens)
        manager
            .create_table(
                Table::create()
                    .table(ProviderTokens::Table)
                    .if_not_exists()
                    .col(string(ProviderTokens::UserId))
                    .col(string(ProviderTokens::Provider))
                    .col(string(ProviderTokens::AccessToken))
                    .col(big_integer(ProviderTokens::UpdatedAt))
                    .primary_key(
                        Index::create()
                            .col(ProviderTokens::UserId)
                            .col(ProviderTokens::Provider),
                    )
                    .to_owned(),
            )
            .await?;

        // Create device_logins table (CLI device-code login requests)
        manager
            .create_table(
                Table::create()
                    .table(DeviceLogins::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(DeviceLogins::DeviceCode)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(string_null(DeviceLogins::ProfileId))
                    .col(string_null(DeviceLogins::VerificationCode))
                    .col(big_integer(DeviceLogins::CreatedAt))
                    .col(big_integer(DeviceLogins::ExpiresAt))
                    .to_owned(),
            )
            .await?;

        // Index on expires_at for the cleanup job
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_device_logins_expires_at")
                    .table(DeviceLogins::Table)
                    .col(DeviceLogins::ExpiresAt)
                    .to_owned(),
            )
            .await?;

        // Create clusters table
        manager
            .create_table(
                Table::create()
                    .table(Clusters::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Clusters::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(string(Clusters::UserId))
                    .col(string(Clusters::Name))
                    .col(
                        ColumnDef::new(Clusters::Status)
                            .string()
                            .not_null()
                            .default("PENDING"),
                    )
                    .col(string(Clusters::AgentTokenHash))
                    .col(string_null(Clusters::Metadata))
                    .col(big_integer_null(Clusters::LastHeartbeat))
                    .col(big_integer(Clusters::CreatedAt))
                    .to_owned(),
            )
            .await?;

        // Index on user_id for owner-scoped listing
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_clusters_user_id")
                    .table(Clusters::Table)
                    .col(Clusters::UserId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Clusters::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(DeviceLogins::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(ProviderTokens::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Sessions::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Users::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Users {
    Table,
    Subject,
    Email,
    PasswordHash,
    CreatedAt,
    Enabled,
}

#[derive(DeriveIden)]
enum Sessions {
    Table,
    SessionId,
    Subject,
    CreatedAt,
    ExpiresAt,
    UserAgent,
    IpAddress,
}

#[derive(DeriveIden)]
enum ProviderTokens {
    Table,
    UserId,
    Provider,
    AccessToken,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum DeviceLogins {
    Table,
    DeviceCode,
    ProfileId,
    VerificationCode,
    CreatedAt,
    ExpiresAt,
}

#[derive(DeriveIden)]
enum Clusters {
    Table,
    Id,
    UserId,
    Name,
    Status,
    AgentTokenHash,
    Metadata,
    LastHeartbeat,
    CreatedAt,
}
