use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Deserialize;

use crate::error::OperationError;
use crate::models::operation::{
    OperationAccepted, OperationErrorResponse, OperationResponse, OperationState,
    SubmitOperationRequest,
};
use crate::models::request_scope::{AccessLevel, AuthenticationType, RequestScope, UserContext};
use crate::models::resource_type::ResourceType;
use crate::query::{self, Criterion, OperationField};
use crate::services::maintainer::CleanupReport;
use crate::AppState;

pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";
pub const USER_NAME_HEADER: &str = "x-user-name";
pub const ACCESS_LEVEL_HEADER: &str = "x-access-level";

type ApiError = (StatusCode, Json<OperationErrorResponse>);

fn api_error(err: OperationError) -> ApiError {
    let status = match &err {
        OperationError::Validation(_) => StatusCode::BAD_REQUEST,
        OperationError::NotFound(_) => StatusCode::NOT_FOUND,
        OperationError::Conflict { .. } => StatusCode::CONFLICT,
        OperationError::TransientAction(_) | OperationError::PermanentAction(_) => StatusCode::BAD_GATEWAY,
        OperationError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::error!("Request failed: {}", err);
    }

    (
        status,
        Json(OperationErrorResponse {
            error: err.to_string(),
            code: Some(err.code().to_string()),
        }),
    )
}

/// Build the request scope from headers. Authentication itself happens in
/// front of this service; only the resulting identity is read here.
fn request_scope(headers: &HeaderMap) -> RequestScope {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    let scope = match header(CORRELATION_ID_HEADER) {
        Some(id) => RequestScope::with_correlation_id(id),
        None => RequestScope::new(),
    };

    let authentication_type = header(axum::http::header::AUTHORIZATION.as_str())
        .and_then(AuthenticationType::from_header);
    match authentication_type {
        Some(authentication_type) => scope.with_user(UserContext {
            name: header(USER_NAME_HEADER).unwrap_or("unknown").to_string(),
            authentication_type,
            access_level: header(ACCESS_LEVEL_HEADER)
                .and_then(|v| v.parse::<AccessLevel>().ok())
                .unwrap_or_default(),
        }),
        None => scope,
    }
}

fn resource_type(collection: &str) -> Result<ResourceType, ApiError> {
    ResourceType::from_collection(collection)
        .ok_or_else(|| api_error(OperationError::NotFound(format!("collection {}", collection))))
}

pub async fn trigger_cascade_delete(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<OperationAccepted>), ApiError> {
    let resource_type = resource_type(&collection)?;
    let scope = request_scope(&headers);

    let operation_id = state
        .engine
        .trigger_cascade(&scope, resource_type, &id)
        .await
        .map_err(api_error)?;

    Ok((StatusCode::ACCEPTED, Json(OperationAccepted { operation_id })))
}

pub async fn submit_operation(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(payload): Json<SubmitOperationRequest>,
) -> Result<(StatusCode, Json<OperationAccepted>), ApiError> {
    let resource_type = resource_type(&collection)?;
    let scope = request_scope(&headers);

    let operation_id = state
        .engine
        .submit(&scope, resource_type, &id, payload.operation_type)
        .await
        .map_err(api_error)?;

    Ok((StatusCode::ACCEPTED, Json(OperationAccepted { operation_id })))
}

pub async fn get_operation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<OperationResponse>, ApiError> {
    let operation = state.engine.get_operation(&id).await.map_err(api_error)?;
    Ok(Json(operation.into()))
}

#[derive(Debug, Default, Deserialize)]
pub struct OperationsQuery {
    pub cascade_root_id: Option<String>,
    /// An empty value selects tree roots and standalone operations
    pub parent_id: Option<String>,
    pub resource_id: Option<String>,
    pub state: Option<String>,
}

impl OperationsQuery {
    fn criteria(&self) -> Result<Vec<Criterion>, OperationError> {
        let mut criteria = Vec::new();
        if let Some(root_id) = &self.cascade_root_id {
            criteria.push(query::same_tree(root_id));
        }
        match self.parent_id.as_deref() {
            Some("") => criteria.push(Criterion::EqualsOrNil(OperationField::ParentId, "".into())),
            Some(parent_id) => criteria.push(query::by_field(OperationField::ParentId, parent_id)),
            None => {}
        }
        if let Some(resource_id) = &self.resource_id {
            criteria.push(query::for_resource(resource_id));
        }
        if let Some(state) = &self.state {
            let state = state.parse::<OperationState>().map_err(OperationError::Validation)?;
            criteria.push(query::in_state(state));
        }
        Ok(criteria)
    }
}

pub async fn list_operations(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<OperationsQuery>,
) -> Result<Json<Vec<OperationResponse>>, ApiError> {
    let criteria = params.criteria().map_err(api_error)?;
    let scope = request_scope(&headers);

    let operations = state.engine.list(&scope, &criteria).await.map_err(api_error)?;
    Ok(Json(operations.into_iter().map(OperationResponse::from).collect()))
}

pub async fn run_cleanup(State(state): State<AppState>) -> Result<Json<CleanupReport>, ApiError> {
    let report = state
        .maintainer
        .cleanup_finished_cascade_operations()
        .await
        .map_err(api_error)?;
    Ok(Json(report))
}
