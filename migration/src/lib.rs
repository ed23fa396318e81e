pub use sea_orm_migration::prelude::*;

mod m20260126_000001_create_operations;
mod m20260126_000002_create_resources;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20260126_000001_create_operations::Migration),
            Box::new(m20260126_000002_create_resources::Migration),
        ]
    }
}
