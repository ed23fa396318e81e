//! Managed-resource inventory queried by cascade expansion and actions

use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, Set};

use crate::entities::{prelude::Resources, resources};
use crate::error::OperationError;
use crate::models::resource::Resource;

pub async fn create_resource<C: ConnectionTrait>(conn: &C, resource: &Resource) -> Result<(), OperationError> {
    let model = resources::ActiveModel {
        id: Set(resource.id.clone()),
        resource_type: Set(resource.resource_type.as_str().to_string()),
        owner_id: Set(resource.owner_id.clone()),
        name: Set(resource.name.clone()),
        broker_id: Set(resource.broker_id.clone()),
        broker_url: Set(resource.broker_url.clone()),
        deleted_at: Set(resource.deleted_at),
        created_at: Set(resource.created_at),
        updated_at: Set(resource.updated_at),
    };
    Resources::insert(model).exec_without_returning(conn).await?;
    Ok(())
}

/// Look a resource up by id, including soft-deleted rows
pub async fn get_resource<C: ConnectionTrait>(conn: &C, id: &str) -> Result<Option<Resource>, OperationError> {
    Resources::find_by_id(id.to_string())
        .one(conn)
        .await?
        .map(Resource::try_from)
        .transpose()
}

/// Live resources owned by `parent` whose type depends on the parent's type
///
/// Ordered by the registry's dependent order, then creation time and id, so
/// repeated expansions of the same inventory produce the same tree.
pub async fn dependents_of<C: ConnectionTrait>(
    conn: &C,
    parent: &Resource,
) -> Result<Vec<Resource>, OperationError> {
    let dependent_types = parent.resource_type.dependents();
    if dependent_types.is_empty() {
        return Ok(Vec::new());
    }

    let mut children = Resources::find()
        .filter(resources::Column::OwnerId.eq(parent.id.as_str()))
        .filter(resources::Column::ResourceType.is_in(dependent_types.iter().map(|rt| rt.as_str())))
        .filter(resources::Column::DeletedAt.is_null())
        .all(conn)
        .await?
        .into_iter()
        .map(Resource::try_from)
        .collect::<Result<Vec<_>, _>>()?;

    let rank = |r: &Resource| {
        dependent_types
            .iter()
            .position(|rt| *rt == r.resource_type)
            .unwrap_or(usize::MAX)
    };
    children.sort_by(|a, b| {
        rank(a)
            .cmp(&rank(b))
            .then_with(|| a.created_at.cmp(&b.created_at))
            .then_with(|| a.id.cmp(&b.id))
    });
    Ok(children)
}

/// Mark a resource deleted. Returns false when it was missing or already deleted.
pub async fn soft_delete<C: ConnectionTrait>(
    conn: &C,
    id: &str,
    now: DateTime<Utc>,
) -> Result<bool, OperationError> {
    let result = Resources::update_many()
        .col_expr(resources::Column::DeletedAt, Expr::value(Some(now)))
        .col_expr(resources::Column::UpdatedAt, Expr::value(now))
        .filter(resources::Column::Id.eq(id))
        .filter(resources::Column::DeletedAt.is_null())
        .exec(conn)
        .await?;
    Ok(result.rows_affected == 1)
}
