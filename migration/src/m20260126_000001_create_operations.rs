//! Migration to create the operations table backing the asynchronous operation engine

use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Operations::Table)
                    .if_not_exists()
                    .col(string(Operations::Id).primary_key())
                    .col(string(Operations::ResourceId).not_null())
                    .col(string(Operations::ResourceType).not_null())
                    .col(string(Operations::OperationType).not_null())
                    .col(string(Operations::State).not_null())
                    .col(string_null(Operations::CascadeRootId))
                    .col(string_null(Operations::ParentId))
                    .col(boolean(Operations::Reschedulable).default(false))
                    .col(timestamp_with_time_zone_null(Operations::DeletionScheduled))
                    .col(boolean(Operations::Ready).default(false))
                    .col(text_null(Operations::Description))
                    .col(string_null(Operations::CorrelationId))
                    .col(string_null(Operations::ExternalId))
                    .col(integer(Operations::RetryCount).default(0))
                    .col(timestamp_with_time_zone_null(Operations::NextAttemptAt))
                    .col(text_null(Operations::LastError))
                    .col(timestamp_with_time_zone(Operations::CreatedAt).default(Expr::current_timestamp()))
                    .col(timestamp_with_time_zone(Operations::UpdatedAt).default(Expr::current_timestamp()))
                    .to_owned(),
            )
            .await?;

        // Index for walking a cascade tree
        manager
            .create_index(
                Index::create()
                    .name("idx_operations_cascade_root_id")
                    .table(Operations::Table)
                    .col(Operations::CascadeRootId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_operations_parent_id")
                    .table(Operations::Table)
                    .col(Operations::ParentId)
                    .to_owned(),
            )
            .await?;

        // Index for querying by state (pending / in-progress sweeps)
        manager
            .create_index(
                Index::create()
                    .name("idx_operations_state")
                    .table(Operations::Table)
                    .col(Operations::State)
                    .to_owned(),
            )
            .await?;

        // At most one non-terminal operation per resource. Partial indexes are not
        // expressible through the index builder, both Postgres and SQLite accept this.
        manager
            .get_connection()
            .execute_unprepared(
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_operations_active_resource \
                 ON operations (resource_id) \
                 WHERE state IN ('PENDING', 'IN_PROGRESS')",
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Operations::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Operations {
    Table,
    Id,
    ResourceId,
    ResourceType,
    OperationType,
    State,
    CascadeRootId,
    ParentId,
    Reschedulable,
    DeletionScheduled,
    Ready,
    Description,
    CorrelationId,
    ExternalId,
    RetryCount,
    NextAttemptAt,
    LastError,
    CreatedAt,
    UpdatedAt,
}
