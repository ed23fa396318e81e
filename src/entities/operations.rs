//! SeaORM Entity for operations table
//!
//! One row per unit of asynchronous work against one resource.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "operations")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub resource_id: String,
    pub resource_type: String,
    pub operation_type: String,
    pub state: String,
    pub cascade_root_id: Option<String>,
    pub parent_id: Option<String>,
    pub reschedulable: bool,
    pub deletion_scheduled: Option<DateTimeUtc>,
    pub ready: bool,
    #[sea_orm(column_type = "Text", nullable)]
    pub description: Option<String>,
    pub correlation_id: Option<String>,
    pub external_id: Option<String>,
    pub retry_count: i32,
    pub next_attempt_at: Option<DateTimeUtc>,
    #[sea_orm(column_type = "Text", nullable)]
    pub last_error: Option<String>,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
