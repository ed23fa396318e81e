//! Persistence for operation records
//!
//! Every function is generic over [`ConnectionTrait`] so it runs unchanged on
//! the pooled connection or inside a transaction obtained with `begin()`.
//! Dropping a transaction without committing rolls it back.

use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ColumnTrait, ConnectionTrait, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder,
};

use crate::entities::{operations, prelude::Operations};
use crate::error::OperationError;
use crate::models::operation::Operation;
use crate::query::{self, Criterion, OperationField};

/// Insert a new operation
///
/// A non-terminal operation is rejected with [`OperationError::Conflict`] when
/// the resource already has one. The pre-check covers callers inside the same
/// transaction; the partial unique index covers concurrent writers.
pub async fn create<C: ConnectionTrait>(conn: &C, op: &Operation) -> Result<(), OperationError> {
    op.validate()?;

    if !op.is_terminal() {
        let active = count(conn, &[query::for_resource(&op.resource_id), query::non_terminal()]).await?;
        if active > 0 {
            return Err(OperationError::Conflict {
                resource_id: op.resource_id.clone(),
            });
        }
    }

    Operations::insert(op.to_active_model())
        .exec_without_returning(conn)
        .await
        .map_err(|e| OperationError::from_write(e, &op.resource_id))?;

    tracing::debug!(
        operation_id = %op.id,
        resource_id = %op.resource_id,
        "Created {} operation for {}",
        op.operation_type,
        op.resource_type
    );
    Ok(())
}

/// Fetch an operation, failing with `NotFound` when it does not exist
pub async fn get<C: ConnectionTrait>(conn: &C, id: &str) -> Result<Operation, OperationError> {
    find(conn, id)
        .await?
        .ok_or_else(|| OperationError::NotFound(format!("operation {}", id)))
}

pub async fn find<C: ConnectionTrait>(conn: &C, id: &str) -> Result<Option<Operation>, OperationError> {
    Operations::find_by_id(id.to_string())
        .one(conn)
        .await?
        .map(Operation::try_from)
        .transpose()
}

/// All operations matching every criterion, oldest first
pub async fn list<C: ConnectionTrait>(
    conn: &C,
    criteria: &[Criterion],
) -> Result<Vec<Operation>, OperationError> {
    Operations::find()
        .filter(query::to_condition(criteria))
        .order_by_asc(operations::Column::CreatedAt)
        .order_by_asc(operations::Column::Id)
        .all(conn)
        .await?
        .into_iter()
        .map(Operation::try_from)
        .collect()
}

pub async fn count<C: ConnectionTrait>(conn: &C, criteria: &[Criterion]) -> Result<u64, OperationError> {
    Ok(Operations::find()
        .filter(query::to_condition(criteria))
        .count(conn)
        .await?)
}

/// Overwrite every column of an existing operation
pub async fn update<C: ConnectionTrait>(conn: &C, op: &Operation) -> Result<(), OperationError> {
    if !transition(conn, op, &[]).await? {
        return Err(OperationError::NotFound(format!("operation {}", op.id)));
    }
    Ok(())
}

/// Compare-and-set write
///
/// Persists `op` only if the stored row still matches `guard`. Returns false
/// when the row is gone or another writer changed it first.
pub async fn transition<C: ConnectionTrait>(
    conn: &C,
    op: &Operation,
    guard: &[Criterion],
) -> Result<bool, OperationError> {
    op.validate()?;

    let result = Operations::update_many()
        .set(op.to_update_model())
        .filter(operations::Column::Id.eq(op.id.as_str()))
        .filter(query::to_condition(guard))
        .exec(conn)
        .await
        .map_err(|e| OperationError::from_write(e, &op.resource_id))?;

    Ok(result.rows_affected == 1)
}

/// Delete every operation matching the criteria, returning the number removed
pub async fn delete<C: ConnectionTrait>(conn: &C, criteria: &[Criterion]) -> Result<u64, OperationError> {
    if criteria.is_empty() {
        return Err(OperationError::Validation(
            "refusing to delete operations without criteria".to_string(),
        ));
    }

    let result = Operations::delete_many()
        .filter(query::to_condition(criteria))
        .exec(conn)
        .await?;
    Ok(result.rows_affected)
}

/// Flip every not-ready member of a cascade tree to ready in one statement
pub async fn mark_tree_ready<C: ConnectionTrait>(
    conn: &C,
    root_id: &str,
    now: DateTime<Utc>,
) -> Result<u64, OperationError> {
    let criteria = [
        query::same_tree(root_id),
        query::by_field(OperationField::Ready, false),
    ];
    let result = Operations::update_many()
        .col_expr(operations::Column::Ready, Expr::value(true))
        .col_expr(operations::Column::UpdatedAt, Expr::value(now))
        .filter(query::to_condition(&criteria))
        .exec(conn)
        .await?;
    Ok(result.rows_affected)
}
