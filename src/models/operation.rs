//! Operation types, states and the operation record
//!
//! State machine:
//!   PENDING → IN_PROGRESS → SUCCEEDED
//!                         ↘ FAILED
//! IN_PROGRESS may fall back to PENDING on crash recovery when the operation
//! is reschedulable.

use chrono::{DateTime, Utc};
use sea_orm::ActiveValue::{NotSet, Set};
use serde::{Deserialize, Serialize};

use crate::entities::operations;
use crate::error::OperationError;
use crate::models::resource_type::ResourceType;

/// Kind of work an operation performs against its resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationType {
    #[serde(alias = "create")]
    Create,
    #[serde(alias = "update")]
    Update,
    #[serde(alias = "delete")]
    Delete,
}

impl OperationType {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationType::Create => "CREATE",
            OperationType::Update => "UPDATE",
            OperationType::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for OperationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "CREATE" => Ok(OperationType::Create),
            "UPDATE" => Ok(OperationType::Update),
            "DELETE" => Ok(OperationType::Delete),
            _ => Err(format!("Unknown operation type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationState {
    /// Accepted, waiting to be started
    Pending,
    /// Action issued; waiting for completion or a poll
    InProgress,
    Succeeded,
    Failed,
}

impl OperationState {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationState::Pending => "PENDING",
            OperationState::InProgress => "IN_PROGRESS",
            OperationState::Succeeded => "SUCCEEDED",
            OperationState::Failed => "FAILED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, OperationState::Succeeded | OperationState::Failed)
    }

    /// Allowed state moves. Terminal states are final; `IN_PROGRESS` may fall
    /// back to `PENDING` only through stale recovery.
    pub fn can_transition_to(self, next: OperationState) -> bool {
        use OperationState::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (Pending, Failed)
                | (InProgress, Pending)
                | (InProgress, Succeeded)
                | (InProgress, Failed)
        )
    }
}

impl std::fmt::Display for OperationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for OperationState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "PENDING" => Ok(OperationState::Pending),
            "IN_PROGRESS" => Ok(OperationState::InProgress),
            "SUCCEEDED" => Ok(OperationState::Succeeded),
            "FAILED" => Ok(OperationState::Failed),
            _ => Err(format!("Unknown operation state: {}", s)),
        }
    }
}

/// Durable record of one unit of asynchronous work against one resource
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub id: String,
    pub resource_id: String,
    pub resource_type: ResourceType,
    pub operation_type: OperationType,
    pub state: OperationState,
    /// Root of the cascade tree this operation belongs to; `None` when standalone
    pub cascade_root_id: Option<String>,
    /// Must reach SUCCEEDED before this operation may start
    pub parent_id: Option<String>,
    pub reschedulable: bool,
    /// Set when the containing tree is pruned once finished
    pub deletion_scheduled: Option<DateTime<Utc>>,
    /// Fully constructed and eligible to run
    pub ready: bool,
    pub description: Option<String>,
    pub correlation_id: Option<String>,
    /// Poll handle of an asynchronous action; set once the action was issued
    pub external_id: Option<String>,
    pub retry_count: i32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Doubles as the heartbeat of in-progress operations
    pub updated_at: DateTime<Utc>,
}

impl Operation {
    /// New standalone PENDING operation with a fresh id
    pub fn new(
        resource_type: ResourceType,
        resource_id: &str,
        operation_type: OperationType,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            resource_id: resource_id.to_string(),
            resource_type,
            operation_type,
            state: OperationState::Pending,
            cascade_root_id: None,
            parent_id: None,
            reschedulable: resource_type.info().reschedulable,
            deletion_scheduled: None,
            ready: true,
            description: None,
            correlation_id: None,
            external_id: None,
            retry_count: 0,
            next_attempt_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Root of a new cascade delete tree. Not ready until the tree is expanded.
    pub fn cascade_root(resource_type: ResourceType, resource_id: &str, now: DateTime<Utc>) -> Self {
        let mut op = Self::new(resource_type, resource_id, OperationType::Delete, now);
        op.cascade_root_id = Some(op.id.clone());
        op.ready = false;
        op.description = Some(format!("cascade delete of {} {}", resource_type, resource_id));
        op
    }

    /// Child of `parent` in the same cascade tree
    pub fn cascade_child(
        parent: &Operation,
        resource_type: ResourceType,
        resource_id: &str,
        now: DateTime<Utc>,
    ) -> Self {
        let mut op = Self::new(resource_type, resource_id, OperationType::Delete, now);
        op.cascade_root_id = parent.cascade_root_id.clone();
        op.parent_id = Some(parent.id.clone());
        op.deletion_scheduled = parent.deletion_scheduled;
        op.correlation_id = parent.correlation_id.clone();
        op.ready = false;
        op.description = Some(format!("cascade delete of {} {}", resource_type, resource_id));
        op
    }

    pub fn is_cascade_root(&self) -> bool {
        self.cascade_root_id.as_deref() == Some(self.id.as_str())
    }

    /// Move to `next`, rejecting moves the state machine does not allow
    pub fn advance(&mut self, next: OperationState) -> Result<(), OperationError> {
        if !self.state.can_transition_to(next) {
            return Err(OperationError::Validation(format!(
                "operation {} cannot move from {} to {}",
                self.id, self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Reject malformed records before any state write
    pub fn validate(&self) -> Result<(), OperationError> {
        if self.id.trim().is_empty() {
            return Err(OperationError::Validation("operation id must not be empty".to_string()));
        }
        if self.resource_id.trim().is_empty() {
            return Err(OperationError::Validation(
                "resource id must not be empty".to_string(),
            ));
        }
        if matches!(self.cascade_root_id.as_deref(), Some("")) {
            return Err(OperationError::Validation(
                "cascade root id must be omitted rather than empty".to_string(),
            ));
        }
        if let Some(parent_id) = self.parent_id.as_deref() {
            if parent_id.is_empty() {
                return Err(OperationError::Validation(
                    "parent id must be omitted rather than empty".to_string(),
                ));
            }
            if parent_id == self.id {
                return Err(OperationError::Validation(
                    "operation cannot be its own parent".to_string(),
                ));
            }
            if self.cascade_root_id.is_none() {
                return Err(OperationError::Validation(
                    "operation with a parent must belong to a cascade tree".to_string(),
                ));
            }
        }
        if self.is_cascade_root() && self.parent_id.is_some() {
            return Err(OperationError::Validation(
                "cascade root cannot have a parent".to_string(),
            ));
        }
        if self.retry_count < 0 {
            return Err(OperationError::Validation(
                "retry count must not be negative".to_string(),
            ));
        }
        Ok(())
    }

    /// Active model carrying every column except the primary key, for updates
    pub(crate) fn to_update_model(&self) -> operations::ActiveModel {
        let mut active = self.to_active_model();
        active.id = NotSet;
        active
    }

    pub(crate) fn to_active_model(&self) -> operations::ActiveModel {
        operations::ActiveModel {
            id: Set(self.id.clone()),
            resource_id: Set(self.resource_id.clone()),
            resource_type: Set(self.resource_type.as_str().to_string()),
            operation_type: Set(self.operation_type.as_str().to_string()),
            state: Set(self.state.as_str().to_string()),
            cascade_root_id: Set(self.cascade_root_id.clone()),
            parent_id: Set(self.parent_id.clone()),
            reschedulable: Set(self.reschedulable),
            deletion_scheduled: Set(self.deletion_scheduled),
            ready: Set(self.ready),
            description: Set(self.description.clone()),
            correlation_id: Set(self.correlation_id.clone()),
            external_id: Set(self.external_id.clone()),
            retry_count: Set(self.retry_count),
            next_attempt_at: Set(self.next_attempt_at),
            last_error: Set(self.last_error.clone()),
            created_at: Set(self.created_at),
            updated_at: Set(self.updated_at),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

impl TryFrom<operations::Model> for Operation {
    type Error = OperationError;

    fn try_from(model: operations::Model) -> Result<Self, Self::Error> {
        let corrupt = |msg: String| OperationError::Validation(format!("operation {}: {}", model.id, msg));
        let resource_type = model.resource_type.parse::<ResourceType>().map_err(corrupt)?;
        let operation_type = model.operation_type.parse::<OperationType>().map_err(corrupt)?;
        let state = model.state.parse::<OperationState>().map_err(corrupt)?;

        Ok(Self {
            id: model.id,
            resource_id: model.resource_id,
            resource_type,
            operation_type,
            state,
            cascade_root_id: non_empty(model.cascade_root_id),
            parent_id: non_empty(model.parent_id),
            reschedulable: model.reschedulable,
            deletion_scheduled: model.deletion_scheduled,
            ready: model.ready,
            description: model.description,
            correlation_id: model.correlation_id,
            external_id: model.external_id,
            retry_count: model.retry_count,
            next_attempt_at: model.next_attempt_at,
            last_error: model.last_error,
            created_at: model.created_at,
            updated_at: model.updated_at,
        })
    }
}

/// Response for operation queries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationResponse {
    pub id: String,
    pub resource_id: String,
    pub resource_type: ResourceType,
    #[serde(rename = "type")]
    pub operation_type: OperationType,
    pub state: OperationState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cascade_root_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub reschedulable: bool,
    pub deletion_scheduled: Option<String>,
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub retry_count: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<Operation> for OperationResponse {
    fn from(op: Operation) -> Self {
        Self {
            id: op.id,
            resource_id: op.resource_id,
            resource_type: op.resource_type,
            operation_type: op.operation_type,
            state: op.state,
            cascade_root_id: op.cascade_root_id,
            parent_id: op.parent_id,
            reschedulable: op.reschedulable,
            deletion_scheduled: op.deletion_scheduled.map(|t| t.to_rfc3339()),
            ready: op.ready,
            description: op.description,
            correlation_id: op.correlation_id,
            retry_count: op.retry_count,
            last_error: op.last_error,
            created_at: op.created_at.to_rfc3339(),
            updated_at: op.updated_at.to_rfc3339(),
        }
    }
}

/// Request body for submitting a standalone operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitOperationRequest {
    #[serde(rename = "type")]
    pub operation_type: OperationType,
}

/// Returned when an operation has been accepted for asynchronous execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationAccepted {
    pub operation_id: String,
}

/// Error body for operation endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}
