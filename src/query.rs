//! Composable query criteria for selecting operations
//!
//! A criteria list is conjunctive: every criterion must hold. Criteria compile
//! to a sea-orm [`Condition`] so the same list can be used for `find`, `count`
//! and `delete_many`.

use sea_orm::sea_query::{Expr, SimpleExpr};
use sea_orm::{ColumnTrait, Condition, Value};

use crate::entities::operations::Column;
use crate::models::operation::OperationState;

/// Operation columns that can be used in criteria
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationField {
    Id,
    ResourceId,
    ResourceType,
    Type,
    State,
    CascadeRootId,
    ParentId,
    Ready,
    DeletionScheduled,
    ExternalId,
    NextAttemptAt,
}

impl OperationField {
    fn column(self) -> Column {
        match self {
            OperationField::Id => Column::Id,
            OperationField::ResourceId => Column::ResourceId,
            OperationField::ResourceType => Column::ResourceType,
            OperationField::Type => Column::OperationType,
            OperationField::State => Column::State,
            OperationField::CascadeRootId => Column::CascadeRootId,
            OperationField::ParentId => Column::ParentId,
            OperationField::Ready => Column::Ready,
            OperationField::DeletionScheduled => Column::DeletionScheduled,
            OperationField::ExternalId => Column::ExternalId,
            OperationField::NextAttemptAt => Column::NextAttemptAt,
        }
    }

    /// Field name as used in query strings
    pub fn name(self) -> &'static str {
        match self {
            OperationField::Id => "id",
            OperationField::ResourceId => "resource_id",
            OperationField::ResourceType => "resource_type",
            OperationField::Type => "type",
            OperationField::State => "state",
            OperationField::CascadeRootId => "cascade_root_id",
            OperationField::ParentId => "parent_id",
            OperationField::Ready => "ready",
            OperationField::DeletionScheduled => "deletion_scheduled",
            OperationField::ExternalId => "external_id",
            OperationField::NextAttemptAt => "next_attempt_at",
        }
    }

    /// Parse a query-string field name. Only the filterable subset is accepted.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "id" => Some(OperationField::Id),
            "resource_id" => Some(OperationField::ResourceId),
            "resource_type" => Some(OperationField::ResourceType),
            "type" => Some(OperationField::Type),
            "state" => Some(OperationField::State),
            "cascade_root_id" => Some(OperationField::CascadeRootId),
            "parent_id" => Some(OperationField::ParentId),
            _ => None,
        }
    }
}

/// A single predicate over an operation field
#[derive(Debug, Clone, PartialEq)]
pub enum Criterion {
    Equals(OperationField, Value),
    NotEquals(OperationField, Value),
    /// Matches nothing when the value list is empty
    In(OperationField, Vec<Value>),
    NotIn(OperationField, Vec<Value>),
    /// `field = value OR field IS NULL`
    EqualsOrNil(OperationField, Value),
    IsNil(OperationField),
    NotNil(OperationField),
}

impl Criterion {
    fn to_condition(&self) -> Condition {
        match self {
            Criterion::Equals(field, value) => Condition::all().add(field.column().eq(value.clone())),
            Criterion::NotEquals(field, value) => {
                Condition::all().add(field.column().ne(value.clone()))
            }
            Criterion::In(_, values) if values.is_empty() => Condition::all().add(never()),
            Criterion::In(field, values) => {
                Condition::all().add(field.column().is_in(values.iter().cloned()))
            }
            Criterion::NotIn(_, values) if values.is_empty() => Condition::all(),
            Criterion::NotIn(field, values) => {
                Condition::all().add(field.column().is_not_in(values.iter().cloned()))
            }
            Criterion::EqualsOrNil(field, value) => Condition::any()
                .add(field.column().eq(value.clone()))
                .add(field.column().is_null()),
            Criterion::IsNil(field) => Condition::all().add(field.column().is_null()),
            Criterion::NotNil(field) => Condition::all().add(field.column().is_not_null()),
        }
    }
}

fn never() -> SimpleExpr {
    Expr::cust("1 = 2")
}

/// Compile a conjunctive criteria list into a sea-orm condition
pub fn to_condition(criteria: &[Criterion]) -> Condition {
    criteria
        .iter()
        .fold(Condition::all(), |cond, criterion| cond.add(criterion.to_condition()))
}

pub fn by_field(field: OperationField, value: impl Into<Value>) -> Criterion {
    Criterion::Equals(field, value.into())
}

pub fn in_values<V: Into<Value>>(field: OperationField, values: impl IntoIterator<Item = V>) -> Criterion {
    Criterion::In(field, values.into_iter().map(Into::into).collect())
}

/// All operations belonging to the cascade tree rooted at `root_id`
pub fn same_tree(root_id: &str) -> Criterion {
    by_field(OperationField::CascadeRootId, root_id)
}

/// Operations in `PENDING` or `IN_PROGRESS`
pub fn non_terminal() -> Criterion {
    in_values(
        OperationField::State,
        [
            OperationState::Pending.as_str(),
            OperationState::InProgress.as_str(),
        ],
    )
}

pub fn in_state(state: OperationState) -> Criterion {
    by_field(OperationField::State, state.as_str())
}

pub fn for_resource(resource_id: &str) -> Criterion {
    by_field(OperationField::ResourceId, resource_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::operations::Entity;
    use sea_orm::{DbBackend, EntityTrait, QueryFilter, QueryTrait};

    fn sql(criteria: &[Criterion]) -> String {
        Entity::find()
            .filter(to_condition(criteria))
            .build(DbBackend::Sqlite)
            .to_string()
    }

    #[test]
    fn test_equals_or_nil_renders_disjunction() {
        let rendered = sql(&[Criterion::EqualsOrNil(OperationField::ParentId, "".into())]);
        assert!(rendered.contains("\"parent_id\" = ''"));
        assert!(rendered.contains("\"parent_id\" IS NULL"));
        assert!(rendered.contains(" OR "));
    }

    #[test]
    fn test_criteria_are_conjunctive() {
        let rendered = sql(&[same_tree("root-1"), non_terminal()]);
        assert!(rendered.contains("\"cascade_root_id\" = 'root-1'"));
        assert!(rendered.contains("IN ('PENDING', 'IN_PROGRESS')"));
        assert!(rendered.contains(" AND "));
    }

    #[test]
    fn test_empty_in_matches_nothing() {
        let empty: Vec<String> = vec![];
        let rendered = sql(&[in_values(OperationField::CascadeRootId, empty)]);
        assert!(rendered.contains("1 = 2"));
    }

    #[test]
    fn test_field_names_round_trip_for_filterable_fields() {
        for field in [
            OperationField::Id,
            OperationField::ResourceId,
            OperationField::State,
            OperationField::CascadeRootId,
            OperationField::ParentId,
        ] {
            assert_eq!(OperationField::from_name(field.name()), Some(field));
        }
        assert_eq!(OperationField::from_name("ready"), None);
    }
}
