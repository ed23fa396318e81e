//! Target-resource actions executed by the scheduler
//!
//! [`ResourceAction`] is the seam between the engine and whatever owns a
//! resource. [`ResourceActionRouter`] is the production implementation: local
//! resources are handled against the inventory table, broker-backed ones are
//! forwarded to their service broker.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache;
use sea_orm::DatabaseConnection;

use crate::error::{ActionError, OperationError};
use crate::models::operation::{Operation, OperationType};
use crate::models::resource::Resource;
use crate::models::resource_type::ResourceType;
use crate::services::broker_client::{BrokerClient, BrokerTarget};
use crate::services::clock::Clock;
use crate::services::resource_store;

/// What an action is asked to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionRequest {
    pub operation_id: String,
    pub resource_type: ResourceType,
    pub resource_id: String,
    pub operation_type: OperationType,
    pub correlation_id: Option<String>,
}

impl From<&Operation> for ActionRequest {
    fn from(op: &Operation) -> Self {
        Self {
            operation_id: op.id.clone(),
            resource_type: op.resource_type,
            resource_id: op.resource_id.clone(),
            operation_type: op.operation_type,
            correlation_id: op.correlation_id.clone(),
        }
    }
}

/// Completed result or a handle to poll later
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    Succeeded,
    Failed { reason: String },
    StillRunning { handle: String },
}

#[async_trait]
pub trait ResourceAction: Send + Sync {
    /// Issue the side-effecting call
    async fn invoke(&self, request: &ActionRequest) -> Result<ActionOutcome, ActionError>;

    /// Check an asynchronous action started by [`ResourceAction::invoke`]
    async fn poll(&self, request: &ActionRequest, handle: &str) -> Result<ActionOutcome, ActionError>;
}

pub struct ResourceActionRouter {
    db: DatabaseConnection,
    broker: BrokerClient,
    /// broker id → base URL
    broker_urls: Arc<Cache<String, String>>,
    clock: Arc<dyn Clock>,
}

impl ResourceActionRouter {
    pub fn new(db: DatabaseConnection, broker: BrokerClient, clock: Arc<dyn Clock>) -> Self {
        let broker_urls = Cache::builder()
            .max_capacity(1000)
            .time_to_live(Duration::from_secs(300))
            .build();

        Self {
            db,
            broker,
            broker_urls: Arc::new(broker_urls),
            clock,
        }
    }

    async fn invoke_local(&self, request: &ActionRequest) -> Result<ActionOutcome, ActionError> {
        match request.operation_type {
            OperationType::Create | OperationType::Update => {
                let live = resource_store::get_resource(&self.db, &request.resource_id)
                    .await
                    .map_err(storage_error)?
                    .is_some_and(|r| !r.is_deleted());
                if live {
                    Ok(ActionOutcome::Succeeded)
                } else {
                    Ok(ActionOutcome::Failed {
                        reason: format!("{} {} does not exist", request.resource_type, request.resource_id),
                    })
                }
            }
            OperationType::Delete => {
                let deleted = resource_store::soft_delete(&self.db, &request.resource_id, self.clock.now())
                    .await
                    .map_err(storage_error)?;
                if !deleted {
                    tracing::debug!(
                        operation_id = %request.operation_id,
                        "{} {} already deleted",
                        request.resource_type,
                        request.resource_id
                    );
                }
                Ok(ActionOutcome::Succeeded)
            }
        }
    }

    async fn invoke_broker(&self, request: &ActionRequest) -> Result<ActionOutcome, ActionError> {
        let resource = resource_store::get_resource(&self.db, &request.resource_id)
            .await
            .map_err(storage_error)?;

        let resource = match resource {
            Some(r) if r.is_deleted() && request.operation_type == OperationType::Delete => {
                return Ok(ActionOutcome::Succeeded);
            }
            None if request.operation_type == OperationType::Delete => {
                return Ok(ActionOutcome::Succeeded);
            }
            Some(r) if !r.is_deleted() => r,
            _ => {
                return Err(ActionError::Permanent(format!(
                    "{} {} does not exist",
                    request.resource_type, request.resource_id
                )));
            }
        };

        let target = self.broker_target(&resource).await?;
        let outcome = match request.operation_type {
            OperationType::Create => self.broker.provision(&target).await?,
            OperationType::Update => self.broker.update(&target).await?,
            OperationType::Delete => self.broker.deprovision(&target).await?,
        };
        self.settle(request, &outcome).await?;
        Ok(outcome)
    }

    /// Reflect a finished broker delete in the local inventory
    async fn settle(&self, request: &ActionRequest, outcome: &ActionOutcome) -> Result<(), ActionError> {
        if request.operation_type == OperationType::Delete && *outcome == ActionOutcome::Succeeded {
            resource_store::soft_delete(&self.db, &request.resource_id, self.clock.now())
                .await
                .map_err(storage_error)?;
        }
        Ok(())
    }

    async fn broker_target(&self, resource: &Resource) -> Result<BrokerTarget, ActionError> {
        match resource.resource_type {
            ResourceType::ServiceInstance => {
                let base_url = self.broker_url_for(resource).await?;
                Ok(BrokerTarget::instance(&base_url, &resource.id))
            }
            ResourceType::ServiceBinding => {
                let instance_id = resource.owner_id.as_deref().ok_or_else(|| {
                    ActionError::Permanent(format!("binding {} has no service instance", resource.id))
                })?;
                let base_url = self.broker_url_for(resource).await?;
                Ok(BrokerTarget::binding(&base_url, instance_id, &resource.id))
            }
            other => Err(ActionError::Permanent(format!("{} is not broker-backed", other))),
        }
    }

    /// Base URL of the broker serving `resource`. Bindings without their own
    /// broker reference fall back to their instance's broker.
    async fn broker_url_for(&self, resource: &Resource) -> Result<String, ActionError> {
        let broker_id = match &resource.broker_id {
            Some(id) => id.clone(),
            None => {
                let owner = match resource.owner_id.as_deref() {
                    Some(owner_id) => resource_store::get_resource(&self.db, owner_id)
                        .await
                        .map_err(storage_error)?,
                    None => None,
                };
                owner.and_then(|o| o.broker_id).ok_or_else(|| {
                    ActionError::Permanent(format!("{} {} has no broker", resource.resource_type, resource.id))
                })?
            }
        };

        if let Some(url) = self.broker_urls.get(&broker_id).await {
            return Ok(url);
        }

        // Soft-deleted brokers still resolve: a cascade removes the broker
        // before the instances it serves.
        let url = resource_store::get_resource(&self.db, &broker_id)
            .await
            .map_err(storage_error)?
            .and_then(|b| b.broker_url)
            .ok_or_else(|| ActionError::Permanent(format!("broker {} has no URL", broker_id)))?;

        self.broker_urls.insert(broker_id, url.clone()).await;
        Ok(url)
    }
}

#[async_trait]
impl ResourceAction for ResourceActionRouter {
    async fn invoke(&self, request: &ActionRequest) -> Result<ActionOutcome, ActionError> {
        if request.resource_type.info().broker_backed {
            self.invoke_broker(request).await
        } else {
            self.invoke_local(request).await
        }
    }

    async fn poll(&self, request: &ActionRequest, handle: &str) -> Result<ActionOutcome, ActionError> {
        if !request.resource_type.info().broker_backed {
            return Err(ActionError::Permanent(format!(
                "{} actions complete synchronously",
                request.resource_type
            )));
        }

        let resource = resource_store::get_resource(&self.db, &request.resource_id)
            .await
            .map_err(storage_error)?
            .ok_or_else(|| {
                ActionError::Permanent(format!(
                    "{} {} does not exist",
                    request.resource_type, request.resource_id
                ))
            })?;
        let target = self.broker_target(&resource).await?;
        let outcome = self
            .broker
            .last_operation(&target, handle, request.operation_type == OperationType::Delete)
            .await?;
        self.settle(request, &outcome).await?;
        Ok(outcome)
    }
}

fn storage_error(err: OperationError) -> ActionError {
    ActionError::Transient(format!("inventory lookup failed: {}", err))
}
