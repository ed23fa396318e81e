//! Migration to create the resources table (tenants, platforms, brokers, instances, bindings)

use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Resources::Table)
                    .if_not_exists()
                    .col(string(Resources::Id).primary_key())
                    .col(string(Resources::ResourceType).not_null())
                    .col(string_null(Resources::OwnerId))
                    .col(string(Resources::Name).not_null())
                    .col(string_null(Resources::BrokerId))
                    .col(string_null(Resources::BrokerUrl))
                    .col(timestamp_with_time_zone_null(Resources::DeletedAt))
                    .col(timestamp_with_time_zone(Resources::CreatedAt).default(Expr::current_timestamp()))
                    .col(timestamp_with_time_zone(Resources::UpdatedAt).default(Expr::current_timestamp()))
                    .to_owned(),
            )
            .await?;

        // Dependency expansion looks resources up by owner
        manager
            .create_index(
                Index::create()
                    .name("idx_resources_owner_id")
                    .table(Resources::Table)
                    .col(Resources::OwnerId)
                    .col(Resources::ResourceType)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Resources::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Resources {
    Table,
    Id,
    ResourceType,
    OwnerId,
    Name,
    BrokerId,
    BrokerUrl,
    DeletedAt,
    CreatedAt,
    UpdatedAt,
}
